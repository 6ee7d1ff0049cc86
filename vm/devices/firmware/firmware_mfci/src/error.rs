// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::platform::device_id::DeviceIdError;
use crate::platform::rng::RngError;
use crate::service::nvram::VariableError;
use mfci_policy_blob::policy::PayloadError;
use mfci_policy_blob::ValidationError;
use mfci_specs::mfci::TargetingField;
use mfci_specs::uefi::EfiStatus;
use thiserror::Error;

/// Errors reported by the MFCI policy engine.
#[derive(Debug, Error)]
pub enum MfciError {
    #[error("failed to access variable {name}")]
    Variable {
        name: &'static str,
        #[source]
        source: VariableError,
    },
    #[error("variable {name} has unexpected size or attributes")]
    MalformedVariable { name: &'static str },
    #[error("targeting variable {0} is corrupt")]
    CompromisedTargeting(TargetingField),
    #[error("malformed policy payload")]
    InvalidPayload(#[from] PayloadError),
    #[error("policy does not target this device: {0} differs")]
    TargetingMismatch(TargetingField),
    #[error("policy nonce does not match")]
    NonceMismatch,
    #[error("policy signature validation failed")]
    Signature(#[from] ValidationError),
    #[error("failed to lock policy variables")]
    LockFailed(#[source] VariableError),
    #[error("failed to generate a nonce")]
    Rng(#[from] RngError),
    #[error("device identity unavailable")]
    DeviceId(#[from] DeviceIdError),
    #[error("platform reset returned")]
    ResetReturned,
}

impl MfciError {
    pub fn status(&self) -> EfiStatus {
        match self {
            MfciError::Variable { source, .. } => source.status(),
            MfciError::MalformedVariable { .. } => EfiStatus::DEVICE_ERROR,
            MfciError::CompromisedTargeting(_) => EfiStatus::COMPROMISED_DATA,
            MfciError::InvalidPayload(_) => EfiStatus::INVALID_PARAMETER,
            MfciError::TargetingMismatch(_)
            | MfciError::NonceMismatch
            | MfciError::LockFailed(_) => EfiStatus::SECURITY_VIOLATION,
            MfciError::Signature(e) => e.status(),
            MfciError::Rng(_) | MfciError::ResetReturned => EfiStatus::DEVICE_ERROR,
            MfciError::DeviceId(e) => e.status(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            MfciError::Variable {
                source: VariableError::NotFound,
                ..
            }
        )
    }
}
