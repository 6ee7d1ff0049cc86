// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A thin model of UEFI Variable Services, with just enough of the Variable
//! Policy protocol to protect the MFCI variables.
//!
//! Non-volatile variables are passed through to the backing
//! [`NvramStorage`], while volatile variables are kept in memory and are lost
//! on [`VariableServices::reset`]. Registered policies are also dropped on
//! reset, and must be registered again on every boot.

use mfci_nvram_storage::in_memory::InMemoryNvram;
use mfci_nvram_storage::NvramStorage;
use mfci_nvram_storage::NvramStorageError;
use mfci_specs::uefi::EfiStatus;
use mfci_specs::uefi::EfiVariableAttributes;
use mfci_specs::Guid;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VariableError {
    #[error("variable not found")]
    NotFound,
    #[error("variable is {required} bytes, larger than the provided buffer")]
    BufferTooSmall {
        attr: EfiVariableAttributes,
        required: usize,
    },
    #[error("variable is write protected")]
    WriteProtected,
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
    #[error("attributes {requested:?} differ from existing variable's {existing:?}")]
    AttributeMismatch {
        existing: EfiVariableAttributes,
        requested: EfiVariableAttributes,
    },
    #[error("storage backend error")]
    Storage(#[source] NvramStorageError),
}

impl VariableError {
    pub fn status(&self) -> EfiStatus {
        match self {
            VariableError::NotFound => EfiStatus::NOT_FOUND,
            VariableError::BufferTooSmall { .. } => EfiStatus::BUFFER_TOO_SMALL,
            VariableError::WriteProtected => EfiStatus::WRITE_PROTECTED,
            VariableError::InvalidParameter(_) | VariableError::AttributeMismatch { .. } => {
                EfiStatus::INVALID_PARAMETER
            }
            VariableError::Storage(NvramStorageError::OutOfSpace) => EfiStatus::OUT_OF_RESOURCES,
            VariableError::Storage(
                NvramStorageError::VariableNameTooLong | NvramStorageError::VariableDataTooLong,
            ) => EfiStatus::INVALID_PARAMETER,
            VariableError::Storage(_) => EfiStatus::DEVICE_ERROR,
        }
    }
}

/// When a variable covered by a [`VariablePolicy`] becomes read-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockPolicy {
    NoLock,
    /// Locked while the variable `name` + `vendor` holds exactly the single
    /// byte `value`.
    OnVarState {
        vendor: Guid,
        name: String,
        value: u8,
    },
}

/// Constraints applied to writes of a single variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariablePolicy {
    pub vendor: Guid,
    pub name: String,
    pub min_size: usize,
    pub max_size: usize,
    pub attributes_must_have: EfiVariableAttributes,
    pub attributes_cant_have: EfiVariableAttributes,
    pub lock: LockPolicy,
}

impl VariablePolicy {
    /// A policy that places no constraints on `name` + `vendor`.
    pub fn new(vendor: Guid, name: &str) -> Self {
        Self {
            vendor,
            name: name.into(),
            min_size: 0,
            max_size: usize::MAX,
            attributes_must_have: EfiVariableAttributes::new(),
            attributes_cant_have: EfiVariableAttributes::new(),
            lock: LockPolicy::NoLock,
        }
    }

    pub fn size(mut self, min_size: usize, max_size: usize) -> Self {
        self.min_size = min_size;
        self.max_size = max_size;
        self
    }

    pub fn attributes(
        mut self,
        must_have: EfiVariableAttributes,
        cant_have: EfiVariableAttributes,
    ) -> Self {
        self.attributes_must_have = must_have;
        self.attributes_cant_have = cant_have;
        self
    }

    pub fn lock_on_var_state(mut self, vendor: Guid, name: &str, value: u8) -> Self {
        self.lock = LockPolicy::OnVarState {
            vendor,
            name: name.into(),
            value,
        };
        self
    }

    fn matches(&self, vendor: Guid, name: &str) -> bool {
        self.vendor == vendor && self.name == name
    }

    fn check_write(&self, attr: EfiVariableAttributes, len: usize) -> Result<(), VariableError> {
        let attr = u32::from(attr);
        let must_have = u32::from(self.attributes_must_have);
        if attr & must_have != must_have {
            return Err(VariableError::InvalidParameter("missing required attributes"));
        }
        if attr & u32::from(self.attributes_cant_have) != 0 {
            return Err(VariableError::InvalidParameter("forbidden attributes"));
        }
        if len < self.min_size || len > self.max_size {
            return Err(VariableError::InvalidParameter("size out of range"));
        }
        Ok(())
    }
}

/// Variable services layered over a [`NvramStorage`] backend.
#[derive(Debug)]
pub struct VariableServices<S: NvramStorage> {
    storage: S,
    volatile: InMemoryNvram,
    policies: Vec<VariablePolicy>,
}

impl<S: NvramStorage> VariableServices<S> {
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            volatile: InMemoryNvram::new(),
            policies: Vec::new(),
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    pub fn into_storage(self) -> S {
        self.storage
    }

    /// Simulate a platform reset: volatile variables and registered policies
    /// are discarded.
    pub fn reset(&mut self) {
        tracing::trace!("variable services reset");
        self.volatile.clear();
        self.policies.clear();
    }

    /// Register `policy`. Each variable may only have a single policy.
    pub fn register_policy(&mut self, policy: VariablePolicy) -> Result<(), VariableError> {
        if self
            .policies
            .iter()
            .any(|p| p.matches(policy.vendor, &policy.name))
        {
            return Err(VariableError::InvalidParameter(
                "variable already has a policy",
            ));
        }
        tracing::trace!(name = %policy.name, lock = ?policy.lock, "registered variable policy");
        self.policies.push(policy);
        Ok(())
    }

    fn lookup(
        &mut self,
        vendor: Guid,
        name: &str,
    ) -> Result<Option<(EfiVariableAttributes, Vec<u8>)>, VariableError> {
        let var = match self
            .volatile
            .get_variable(name, vendor)
            .map_err(VariableError::Storage)?
        {
            Some(var) => Some(var),
            None => self
                .storage
                .get_variable(name, vendor)
                .map_err(VariableError::Storage)?,
        };
        Ok(var.map(|(attr, data)| (attr.into(), data)))
    }

    /// Read `name` + `vendor` into a buffer of `max_size` bytes.
    ///
    /// As with `GetVariable`, a variable larger than the buffer is reported
    /// with [`VariableError::BufferTooSmall`], carrying its attributes and
    /// size. Probing with a `max_size` of zero tests for existence.
    pub fn get_variable(
        &mut self,
        vendor: Guid,
        name: &str,
        max_size: usize,
    ) -> Result<(EfiVariableAttributes, Vec<u8>), VariableError> {
        let (attr, data) = self.lookup(vendor, name)?.ok_or(VariableError::NotFound)?;
        if data.len() > max_size {
            return Err(VariableError::BufferTooSmall {
                attr,
                required: data.len(),
            });
        }
        Ok((attr, data))
    }

    /// Read `name` + `vendor`, whatever its size.
    pub fn read_variable(
        &mut self,
        vendor: Guid,
        name: &str,
    ) -> Result<(EfiVariableAttributes, Vec<u8>), VariableError> {
        self.get_variable(vendor, name, usize::MAX)
    }

    fn is_locked(&mut self, policy: &LockPolicy) -> Result<bool, VariableError> {
        Ok(match policy {
            LockPolicy::NoLock => false,
            LockPolicy::OnVarState {
                vendor,
                name,
                value,
            } => matches!(self.lookup(*vendor, name)?, Some((_, data)) if data == [*value]),
        })
    }

    fn policy_for(&self, vendor: Guid, name: &str) -> Option<VariablePolicy> {
        self.policies
            .iter()
            .find(|p| p.matches(vendor, name))
            .cloned()
    }

    /// Write `data` to `name` + `vendor`. Empty `data` deletes the variable.
    pub fn set_variable(
        &mut self,
        vendor: Guid,
        name: &str,
        attr: EfiVariableAttributes,
        data: Vec<u8>,
    ) -> Result<(), VariableError> {
        if name.is_empty() {
            return Err(VariableError::InvalidParameter("empty variable name"));
        }
        if data.is_empty() {
            return self.delete_variable(vendor, name);
        }

        if let Some(policy) = self.policy_for(vendor, name) {
            if self.is_locked(&policy.lock)? {
                tracing::debug!(name, "write to locked variable");
                return Err(VariableError::WriteProtected);
            }
            policy.check_write(attr, data.len())?;
        }

        if let Some((existing, _)) = self.lookup(vendor, name)? {
            if existing != attr {
                return Err(VariableError::AttributeMismatch {
                    existing,
                    requested: attr,
                });
            }
        }

        let store: &mut dyn NvramStorage = if attr.non_volatile() {
            &mut self.storage
        } else {
            &mut self.volatile
        };
        store
            .set_variable(name, vendor, attr.into(), data)
            .map_err(VariableError::Storage)
    }

    /// Delete `name` + `vendor`.
    pub fn delete_variable(&mut self, vendor: Guid, name: &str) -> Result<(), VariableError> {
        if let Some(policy) = self.policy_for(vendor, name) {
            if self.is_locked(&policy.lock)? {
                tracing::debug!(name, "delete of locked variable");
                return Err(VariableError::WriteProtected);
            }
        }

        let removed = self
            .volatile
            .remove_variable(name, vendor)
            .map_err(VariableError::Storage)?
            || self
                .storage
                .remove_variable(name, vendor)
                .map_err(VariableError::Storage)?;
        if removed {
            Ok(())
        } else {
            Err(VariableError::NotFound)
        }
    }
}
