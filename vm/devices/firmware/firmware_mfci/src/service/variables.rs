// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Lifecycle of the MFCI variables: policy registration, locking, and the
//! cleanup paths the engine falls back to.

use crate::platform::rng::RandomSource;
use crate::platform::rng::RngError;
use crate::service::nvram::VariableError;
use crate::service::nvram::VariablePolicy;
use crate::service::nvram::VariableServices;
use crate::MfciError;
use mfci_nvram_storage::NvramStorage;
use mfci_specs::mfci::*;
use mfci_specs::uefi::EfiVariableAttributes;

const U64_VARIABLE_NAMES: &[&str] = &[
    CURRENT_MFCI_POLICY_VARIABLE_NAME,
    CURRENT_MFCI_NONCE_VARIABLE_NAME,
    NEXT_MFCI_NONCE_VARIABLE_NAME,
];

// a zero draw would collide with the invalid nonce
const NONCE_ATTEMPTS: usize = 4;

fn variable_error(name: &'static str) -> impl FnOnce(VariableError) -> MfciError {
    move |source| MfciError::Variable { name, source }
}

/// Register the variable policies protecting the MFCI variables.
///
/// Every policy is attempted, and the first failure is returned.
pub fn register_variable_policies<S: NvramStorage>(
    vars: &mut VariableServices<S>,
) -> Result<(), VariableError> {
    let mut policies = Vec::new();

    policies.push(
        VariablePolicy::new(MFCI_VAR_VENDOR_GUID, MFCI_LOCK_VARIABLE_NAME)
            .size(1, 1)
            .attributes(
                MFCI_LOCK_VARIABLE_ATTR,
                EfiVariableAttributes::new().with_non_volatile(true),
            )
            .lock_on_var_state(
                MFCI_VAR_VENDOR_GUID,
                MFCI_LOCK_VARIABLE_NAME,
                MFCI_LOCK_VARIABLE_VALUE,
            ),
    );

    for &name in MFCI_LOCKED_VARIABLE_NAMES {
        let mut policy = VariablePolicy::new(MFCI_VAR_VENDOR_GUID, name)
            .attributes(MFCI_POLICY_VARIABLE_ATTR, EfiVariableAttributes::new())
            .lock_on_var_state(
                MFCI_VAR_VENDOR_GUID,
                MFCI_LOCK_VARIABLE_NAME,
                MFCI_LOCK_VARIABLE_VALUE,
            );
        if U64_VARIABLE_NAMES.contains(&name) {
            policy = policy.size(size_of::<u64>(), size_of::<u64>());
        }
        policies.push(policy);
    }

    // the blobs are delivered by the OS, so they are never locked
    for name in [
        CURRENT_MFCI_POLICY_BLOB_VARIABLE_NAME,
        NEXT_MFCI_POLICY_BLOB_VARIABLE_NAME,
    ] {
        policies.push(
            VariablePolicy::new(MFCI_VAR_VENDOR_GUID, name)
                .attributes(MFCI_POLICY_VARIABLE_ATTR, EfiVariableAttributes::new()),
        );
    }

    let mut result = Ok(());
    for policy in policies {
        let name = policy.name.clone();
        if let Err(e) = vars.register_policy(policy) {
            tracing::error!(
                name = %name,
                error = &e as &dyn std::error::Error,
                "failed to register variable policy"
            );
            result = result.and(Err(e));
        }
    }
    result
}

/// Set the lock variable, write-protecting the MFCI variables until the next
/// reset.
pub fn lock_policy_variables<S: NvramStorage>(
    vars: &mut VariableServices<S>,
    policies_registered: bool,
) -> Result<(), MfciError> {
    if !policies_registered {
        tracing::error!("variable policies were not registered, locking anyway");
    }

    vars.set_variable(
        MFCI_VAR_VENDOR_GUID,
        MFCI_LOCK_VARIABLE_NAME,
        MFCI_LOCK_VARIABLE_ATTR,
        vec![MFCI_LOCK_VARIABLE_VALUE],
    )
    .map_err(MfciError::LockFailed)?;

    tracing::debug!("locked MFCI policy variables");
    Ok(())
}

/// Read an MFCI u64 variable, which must be exactly 8 bytes with the
/// standard MFCI attributes.
pub fn read_u64_variable<S: NvramStorage>(
    vars: &mut VariableServices<S>,
    name: &'static str,
) -> Result<u64, MfciError> {
    let (attr, data) = match vars.get_variable(MFCI_VAR_VENDOR_GUID, name, size_of::<u64>()) {
        Ok(var) => var,
        Err(VariableError::BufferTooSmall { .. }) => {
            return Err(MfciError::MalformedVariable { name });
        }
        Err(e) => return Err(variable_error(name)(e)),
    };

    if attr != MFCI_POLICY_VARIABLE_ATTR {
        return Err(MfciError::MalformedVariable { name });
    }
    let data: [u8; 8] = data
        .try_into()
        .map_err(|_| MfciError::MalformedVariable { name })?;
    Ok(u64::from_le_bytes(data))
}

/// Write an MFCI variable with the standard attributes.
///
/// A variable stored with any other attributes cannot be overwritten in
/// place, so it is deleted first.
pub fn write_policy_variable<S: NvramStorage>(
    vars: &mut VariableServices<S>,
    name: &'static str,
    data: Vec<u8>,
) -> Result<(), MfciError> {
    if let Err(VariableError::BufferTooSmall { attr, .. }) =
        vars.get_variable(MFCI_VAR_VENDOR_GUID, name, 0)
    {
        if attr != MFCI_POLICY_VARIABLE_ATTR {
            tracing::warn!(name, ?attr, "replacing variable with unexpected attributes");
            vars.delete_variable(MFCI_VAR_VENDOR_GUID, name)
                .map_err(variable_error(name))?;
        }
    }

    vars.set_variable(MFCI_VAR_VENDOR_GUID, name, MFCI_POLICY_VARIABLE_ATTR, data)
        .map_err(variable_error(name))
}

pub fn write_u64_variable<S: NvramStorage>(
    vars: &mut VariableServices<S>,
    name: &'static str,
    value: u64,
) -> Result<(), MfciError> {
    write_policy_variable(vars, name, value.to_le_bytes().to_vec())
}

/// Read a signed policy blob variable.
pub fn read_blob_variable<S: NvramStorage>(
    vars: &mut VariableServices<S>,
    name: &'static str,
) -> Result<Vec<u8>, MfciError> {
    let (attr, data) = vars
        .read_variable(MFCI_VAR_VENDOR_GUID, name)
        .map_err(variable_error(name))?;
    if attr != MFCI_POLICY_VARIABLE_ATTR {
        return Err(MfciError::MalformedVariable { name });
    }
    Ok(data)
}

pub fn write_blob_variable<S: NvramStorage>(
    vars: &mut VariableServices<S>,
    name: &'static str,
    blob: Vec<u8>,
) -> Result<(), MfciError> {
    write_policy_variable(vars, name, blob)
}

fn delete_if_present<S: NvramStorage>(
    vars: &mut VariableServices<S>,
    name: &'static str,
) -> Result<(), MfciError> {
    match vars.delete_variable(MFCI_VAR_VENDOR_GUID, name) {
        Ok(()) | Err(VariableError::NotFound) => Ok(()),
        Err(e) => Err(variable_error(name)(e)),
    }
}

/// Read the installed policy without authenticating it.
///
/// Used to seed the cached policy early in boot, before the engine has
/// re-validated the current blob.
pub fn retrieve_current_policy<S: NvramStorage>(
    vars: &mut VariableServices<S>,
) -> Result<MfciPolicy, MfciError> {
    read_u64_variable(vars, CURRENT_MFCI_POLICY_VARIABLE_NAME).map(MfciPolicy)
}

/// Draw a nonce which is not [`MFCI_POLICY_INVALID_NONCE`].
pub fn generate_nonce(rng: &mut dyn RandomSource) -> Result<u64, RngError> {
    for _ in 0..NONCE_ATTEMPTS {
        let nonce = rng.next_u64()?;
        if nonce != MFCI_POLICY_INVALID_NONCE {
            return Ok(nonce);
        }
    }
    Err(RngError("generated only invalid nonces".into()))
}

fn first_error(results: impl IntoIterator<Item = Result<(), MfciError>>) -> Result<(), MfciError> {
    let mut first = Ok(());
    for result in results {
        if let Err(e) = result {
            tracing::warn!(
                error = &e as &dyn std::error::Error,
                "MFCI variable cleanup step failed"
            );
            first = first.and(Err(e));
        }
    }
    first
}

/// Reset the installed policy to the customer state: invalidate the current
/// nonce, delete the current blob and zero the current policy.
///
/// Every step is attempted; the first failure is returned.
pub fn clean_current_variables<S: NvramStorage>(
    vars: &mut VariableServices<S>,
) -> Result<(), MfciError> {
    tracing::debug!("cleaning current MFCI policy variables");
    let results = [
        write_u64_variable(
            vars,
            CURRENT_MFCI_NONCE_VARIABLE_NAME,
            MFCI_POLICY_INVALID_NONCE,
        ),
        delete_if_present(vars, CURRENT_MFCI_POLICY_BLOB_VARIABLE_NAME),
        write_u64_variable(
            vars,
            CURRENT_MFCI_POLICY_VARIABLE_NAME,
            MfciPolicy::CUSTOMER_STATE.0,
        ),
    ];
    first_error(results)
}

/// Discard any pending policy: roll the target nonce and delete the target
/// blob.
///
/// If no nonce can be generated the invalid nonce is stored instead, and
/// the RNG failure is reported. Every step is attempted; the first failure
/// is returned.
pub fn clean_target_variables<S: NvramStorage>(
    vars: &mut VariableServices<S>,
    rng: &mut dyn RandomSource,
) -> Result<(), MfciError> {
    tracing::debug!("cleaning target MFCI policy variables");
    let nonce = match generate_nonce(rng) {
        Ok(nonce) => write_u64_variable(vars, NEXT_MFCI_NONCE_VARIABLE_NAME, nonce),
        Err(e) => {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                "failed to generate target nonce"
            );
            if let Err(e) = write_u64_variable(
                vars,
                NEXT_MFCI_NONCE_VARIABLE_NAME,
                MFCI_POLICY_INVALID_NONCE,
            ) {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    "failed to invalidate target nonce"
                );
            }
            Err(MfciError::Rng(e))
        }
    };
    let blob = delete_if_present(vars, NEXT_MFCI_POLICY_BLOB_VARIABLE_NAME);
    first_error([nonce, blob])
}
