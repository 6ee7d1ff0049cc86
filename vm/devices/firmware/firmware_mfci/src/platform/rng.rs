// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Interfaces required to generate policy nonces.

use thiserror::Error;

#[derive(Debug, Error)]
#[error("random number generator failed")]
pub struct RngError(#[source] pub Box<dyn std::error::Error + Send + Sync>);

/// Source of 64-bit random values.
pub trait RandomSource {
    fn next_u64(&mut self) -> Result<u64, RngError>;
}

/// [`RandomSource`] backed by the operating system.
#[derive(Debug, Default, Copy, Clone)]
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn next_u64(&mut self) -> Result<u64, RngError> {
        let mut buf = [0; 8];
        getrandom::fill(&mut buf).map_err(|e| RngError(e.into()))?;
        Ok(u64::from_le_bytes(buf))
    }
}
