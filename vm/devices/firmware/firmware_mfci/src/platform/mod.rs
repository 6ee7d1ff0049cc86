// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Interfaces that must be implemented by the platform hosting the MFCI
//! policy engine.

pub mod device_id;
pub mod reset;
pub mod rng;

pub use mfci_nvram_storage::NvramStorage;
pub use mfci_nvram_storage::NvramStorageError;
pub use mfci_policy_blob::pkcs7::Pkcs7Verifier;
