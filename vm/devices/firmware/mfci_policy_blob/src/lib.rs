// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Signed MFCI policy blobs: the XDR trust anchor container, PKCS#7
//! verification, and the policy payload format.
//!
//! [`validate_blob_with_certificates`] is the entrypoint for authenticating a
//! blob against a set of provisioned trust anchors.

#![forbid(unsafe_code)]

pub mod pkcs7;
pub mod policy;
pub mod xdr;

use mfci_specs::uefi::EfiStatus;
use pkcs7::Pkcs7Verifier;
use pkcs7::SignatureError;
use thiserror::Error;
use xdr::ParseXdr;
use xdr::XdrError;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("signed policy is empty")]
    EmptyPolicy,
    #[error("malformed trust anchor container")]
    MalformedContainer(#[source] XdrError),
    #[error("no trust anchors are provisioned")]
    NoTrustAnchors,
    #[error("policy signature is not trusted")]
    Signature(#[source] SignatureError),
}

impl ValidationError {
    pub fn status(&self) -> EfiStatus {
        match self {
            ValidationError::EmptyPolicy
            | ValidationError::MalformedContainer(_)
            | ValidationError::NoTrustAnchors => EfiStatus::ABORTED,
            ValidationError::Signature(_) => EfiStatus::SECURITY_VIOLATION,
        }
    }
}

/// Authenticate `signed` against each DER certificate in the XDR container
/// `trust_anchors`, in order, returning the payload verified by the first
/// certificate that accepts it.
///
/// If no certificate accepts the blob, the last certificate's failure is
/// returned unchanged.
pub fn validate_blob_with_certificates(
    verifier: &dyn Pkcs7Verifier,
    signed: &[u8],
    trust_anchors: &[u8],
    required_ekus: &[&str],
) -> Result<Vec<u8>, ValidationError> {
    if signed.is_empty() {
        return Err(ValidationError::EmptyPolicy);
    }

    let mut last_err = None;
    for (index, cert) in ParseXdr::new(trust_anchors).enumerate() {
        let cert = cert.map_err(ValidationError::MalformedContainer)?;
        match verifier.verify(signed, cert, required_ekus) {
            Ok(payload) => {
                tracing::debug!(index, "policy signature verified");
                return Ok(payload);
            }
            Err(e) => {
                tracing::debug!(
                    index,
                    error = &e as &dyn std::error::Error,
                    "trust anchor rejected policy"
                );
                last_err = Some(e);
            }
        }
    }

    Err(last_err.map_or(ValidationError::NoTrustAnchors, ValidationError::Signature))
}
