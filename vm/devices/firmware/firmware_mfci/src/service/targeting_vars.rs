// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! One-time provisioning of the targeting variables from the platform's
//! device identity.

use crate::platform::device_id::DeviceIdProvider;
use crate::service::nvram::VariableError;
use crate::service::nvram::VariableServices;
use crate::service::variables::write_policy_variable;
use crate::MfciError;
use mfci_nvram_storage::NvramStorage;
use mfci_specs::mfci::TargetingField;
use mfci_specs::mfci::MFCI_VAR_VENDOR_GUID;

/// Whether every targeting variable exists.
///
/// Each is probed with a zero-sized buffer, so only a "buffer too small"
/// reply counts as present.
pub fn targeting_vars_present<S: NvramStorage>(vars: &mut VariableServices<S>) -> bool {
    TargetingField::ALL.into_iter().all(|field| {
        match vars.get_variable(MFCI_VAR_VENDOR_GUID, field.variable_name(), 0) {
            Err(VariableError::BufferTooSmall { .. }) => true,
            _ => {
                tracing::debug!(%field, "targeting variable missing");
                false
            }
        }
    })
}

/// Write each targeting variable from `provider`, as a NUL terminated
/// UTF-16LE string. Stops at the first failure.
pub fn populate_targeting_vars<S: NvramStorage>(
    vars: &mut VariableServices<S>,
    provider: &dyn DeviceIdProvider,
) -> Result<(), MfciError> {
    for field in TargetingField::ALL {
        let value = provider.device_id(field)?;
        let data: Vec<u8> = value
            .encode_utf16()
            .chain([0])
            .flat_map(u16::to_le_bytes)
            .collect();

        write_policy_variable(vars, field.variable_name(), data)?;
        tracing::trace!(%field, value = %value, "populated targeting variable");
    }
    Ok(())
}
