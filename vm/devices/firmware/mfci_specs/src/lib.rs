// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Types and constants shared by the MFCI (Manufacturer Firmware
//! Configuration Interface) crates.
//!
//! This crate is divided into 3 submodules:
//!
//! - `guid`: the firmware GUID type
//! - `uefi`: the subset of UEFI spec types MFCI depends on
//! - `mfci`: policy bits, variable names, and payload field names

#![no_std]
#![forbid(unsafe_code)]

pub mod guid;
pub mod mfci;
pub mod uefi;

pub use guid::Guid;
