// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Interfaces required to reboot the platform after a policy change.

use mfci_specs::uefi::EfiResetType;
use mfci_specs::Guid;

/// Platform reset primitive.
pub trait PlatformReset {
    /// Reset the platform, reporting `subtype` as the reason.
    ///
    /// Implementations are not expected to return. A return means the reset
    /// did not happen.
    fn reset_system(&mut self, reset_type: EfiResetType, subtype: Guid);
}
