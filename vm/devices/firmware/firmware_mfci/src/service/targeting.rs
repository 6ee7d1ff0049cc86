// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Binding of a verified policy payload to this device and nonce.

use crate::service::nvram::VariableServices;
use crate::MfciError;
use mfci_nvram_storage::NvramStorage;
use mfci_policy_blob::policy::PolicyPayload;
use mfci_specs::mfci::MfciPolicy;
use mfci_specs::mfci::TargetingField;
use mfci_specs::mfci::MFCI_POLICY_INVALID_NONCE;
use mfci_specs::mfci::MFCI_VAR_VENDOR_GUID;
use mfci_specs::mfci::POLICY_KEY_TARGET;
use mfci_specs::mfci::POLICY_KEY_UEFI;
use mfci_specs::mfci::POLICY_VALUE_NAME_NONCE;
use mfci_specs::mfci::POLICY_VALUE_NAME_POLICY;

/// Decode a persisted targeting value: UTF-16LE, NUL terminated, with no
/// embedded NUL. Returns the code units without the terminator.
fn stored_units(data: &[u8]) -> Option<Vec<u16>> {
    if data.len() % 2 != 0 {
        return None;
    }
    let units: Vec<u16> = data
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    let (&last, value) = units.split_last()?;
    if last != 0 || value.contains(&0) {
        return None;
    }
    Some(value.to_vec())
}

/// Check that the signature-verified `payload` targets this device and
/// carries `expected_nonce`, returning its (unmasked) policy.
///
/// Fields are checked in [`TargetingField::ALL`] order and the first
/// mismatch is reported. The comparison is not constant time.
pub fn verify_targeting<S: NvramStorage>(
    vars: &mut VariableServices<S>,
    payload: &[u8],
    expected_nonce: u64,
) -> Result<MfciPolicy, MfciError> {
    let payload = PolicyPayload::parse(payload)?;

    for field in TargetingField::ALL {
        let expected = payload.get_string(POLICY_KEY_TARGET, field.value_name())?;

        let (_, data) = vars
            .read_variable(MFCI_VAR_VENDOR_GUID, field.variable_name())
            .map_err(|source| MfciError::Variable {
                name: field.variable_name(),
                source,
            })?;
        let device = stored_units(&data).ok_or(MfciError::CompromisedTargeting(field))?;

        if !expected.units().eq(device.iter().copied()) {
            tracing::debug!(
                %field,
                policy = %expected.to_string_lossy(),
                device = %String::from_utf16_lossy(&device),
                "policy targets a different device"
            );
            return Err(MfciError::TargetingMismatch(field));
        }
    }

    let nonce = payload.get_u64(POLICY_KEY_TARGET, POLICY_VALUE_NAME_NONCE)?;
    if expected_nonce == MFCI_POLICY_INVALID_NONCE || nonce != expected_nonce {
        tracing::debug!(nonce, expected_nonce, "policy nonce mismatch");
        return Err(MfciError::NonceMismatch);
    }

    Ok(MfciPolicy(
        payload.get_u64(POLICY_KEY_UEFI, POLICY_VALUE_NAME_POLICY)?,
    ))
}
