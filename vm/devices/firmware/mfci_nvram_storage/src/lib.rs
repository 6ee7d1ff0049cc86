// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Pluggable storage backends for the variables MFCI keeps its policy state
//! in (e.g: in memory, JSON file backed).

#![forbid(unsafe_code)]

pub mod in_memory;
pub mod json_file;

use mfci_specs::Guid;
use std::fmt::Debug;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NvramStorageError {
    #[error("error deserializing nvram storage")]
    Deserialize(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("error loading data from nvram storage")]
    Load(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("error committing data to nvram storage")]
    Commit(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("nvram is out of space")]
    OutOfSpace,
    #[error("variable name too long")]
    VariableNameTooLong,
    #[error("variable data too long")]
    VariableDataTooLong,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum NextVariable {
    InvalidKey,
    EndOfList,
    Exists {
        name: String,
        vendor: Guid,
        attr: u32,
    },
}

/// Abstraction over persistent variable storage.
///
/// Implementors are **not required** to perform attribute validation or
/// enforce locking, and should simply store/retrieve data.
pub trait NvramStorage {
    /// Return the `attr` + `data` of the variable identified by `name` +
    /// `vendor`.
    fn get_variable(
        &mut self,
        name: &str,
        vendor: Guid,
    ) -> Result<Option<(u32, Vec<u8>)>, NvramStorageError>;

    /// Set the value of variable identified by `name` + `vendor` to the
    /// provided `attr` + `data`.
    ///
    /// This method will persist any modifications to a backing data store.
    fn set_variable(
        &mut self,
        name: &str,
        vendor: Guid,
        attr: u32,
        data: Vec<u8>,
    ) -> Result<(), NvramStorageError>;

    /// Remove a variable identified by `name` + `vendor`.
    ///
    /// Returns `true` if the variable was removed, or `false` if it could not
    /// be found.
    fn remove_variable(&mut self, name: &str, vendor: Guid) -> Result<bool, NvramStorageError>;

    /// Return the variable key immediately after the variable identified by
    /// `name` + `vendor`. If `name_vendor` is `None`, return the first
    /// variable.
    fn next_variable(
        &mut self,
        name_vendor: Option<(&str, Guid)>,
    ) -> Result<NextVariable, NvramStorageError>;

    /// Return `true` if the underlying store doesn't contain any vars
    fn is_empty(&mut self) -> Result<bool, NvramStorageError> {
        Ok(matches!(self.next_variable(None)?, NextVariable::EndOfList))
    }
}

impl NvramStorage for Box<dyn NvramStorage> {
    fn get_variable(
        &mut self,
        name: &str,
        vendor: Guid,
    ) -> Result<Option<(u32, Vec<u8>)>, NvramStorageError> {
        (**self).get_variable(name, vendor)
    }

    fn set_variable(
        &mut self,
        name: &str,
        vendor: Guid,
        attr: u32,
        data: Vec<u8>,
    ) -> Result<(), NvramStorageError> {
        (**self).set_variable(name, vendor, attr, data)
    }

    fn remove_variable(&mut self, name: &str, vendor: Guid) -> Result<bool, NvramStorageError> {
        (**self).remove_variable(name, vendor)
    }

    fn next_variable(
        &mut self,
        name_vendor: Option<(&str, Guid)>,
    ) -> Result<NextVariable, NvramStorageError> {
        (**self).next_variable(name_vendor)
    }
}

impl<T: NvramStorage + ?Sized> NvramStorage for &mut T {
    fn get_variable(
        &mut self,
        name: &str,
        vendor: Guid,
    ) -> Result<Option<(u32, Vec<u8>)>, NvramStorageError> {
        (**self).get_variable(name, vendor)
    }

    fn set_variable(
        &mut self,
        name: &str,
        vendor: Guid,
        attr: u32,
        data: Vec<u8>,
    ) -> Result<(), NvramStorageError> {
        (**self).set_variable(name, vendor, attr, data)
    }

    fn remove_variable(&mut self, name: &str, vendor: Guid) -> Result<bool, NvramStorageError> {
        (**self).remove_variable(name, vendor)
    }

    fn next_variable(
        &mut self,
        name_vendor: Option<(&str, Guid)>,
    ) -> Result<NextVariable, NvramStorageError> {
        (**self).next_variable(name_vendor)
    }
}
