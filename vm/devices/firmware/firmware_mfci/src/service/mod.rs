// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The MFCI policy engine and the services it is built from.

pub mod notify;
pub mod nvram;
pub mod policy_check;
pub mod targeting;
pub mod targeting_vars;
pub mod variables;
