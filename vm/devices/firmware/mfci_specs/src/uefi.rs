// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! UEFI spec types used by MFCI.

use bitfield_struct::bitfield;
use core::fmt;

/// UEFI spec Appendix D - Status Codes
///
/// Only the codes MFCI reports are named. Stored as 64 bits with the error bit
/// in the high bit, matching a 64-bit `EFI_STATUS`.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
#[must_use]
pub struct EfiStatus(pub u64);

impl EfiStatus {
    pub const ERROR_BIT: u64 = 1 << 63;

    pub const SUCCESS: Self = Self(0);
    pub const INVALID_PARAMETER: Self = Self(2 | Self::ERROR_BIT);
    pub const UNSUPPORTED: Self = Self(3 | Self::ERROR_BIT);
    pub const BUFFER_TOO_SMALL: Self = Self(5 | Self::ERROR_BIT);
    pub const DEVICE_ERROR: Self = Self(7 | Self::ERROR_BIT);
    pub const WRITE_PROTECTED: Self = Self(8 | Self::ERROR_BIT);
    pub const OUT_OF_RESOURCES: Self = Self(9 | Self::ERROR_BIT);
    pub const NOT_FOUND: Self = Self(14 | Self::ERROR_BIT);
    pub const ACCESS_DENIED: Self = Self(15 | Self::ERROR_BIT);
    pub const ABORTED: Self = Self(21 | Self::ERROR_BIT);
    pub const SECURITY_VIOLATION: Self = Self(26 | Self::ERROR_BIT);
    pub const COMPROMISED_DATA: Self = Self(33 | Self::ERROR_BIT);

    pub fn is_error(self) -> bool {
        self.0 & Self::ERROR_BIT != 0
    }

    fn name(self) -> Option<&'static str> {
        Some(match self {
            Self::SUCCESS => "SUCCESS",
            Self::INVALID_PARAMETER => "INVALID_PARAMETER",
            Self::UNSUPPORTED => "UNSUPPORTED",
            Self::BUFFER_TOO_SMALL => "BUFFER_TOO_SMALL",
            Self::DEVICE_ERROR => "DEVICE_ERROR",
            Self::WRITE_PROTECTED => "WRITE_PROTECTED",
            Self::OUT_OF_RESOURCES => "OUT_OF_RESOURCES",
            Self::NOT_FOUND => "NOT_FOUND",
            Self::ACCESS_DENIED => "ACCESS_DENIED",
            Self::ABORTED => "ABORTED",
            Self::SECURITY_VIOLATION => "SECURITY_VIOLATION",
            Self::COMPROMISED_DATA => "COMPROMISED_DATA",
            _ => return None,
        })
    }
}

impl fmt::Debug for EfiStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "EfiStatus({:#x})", self.0),
        }
    }
}

impl fmt::Display for EfiStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// UEFI spec 8.2 - Variable Services
#[bitfield(u32)]
#[derive(Eq, PartialEq)]
pub struct EfiVariableAttributes {
    pub non_volatile: bool,
    pub bootservice_access: bool,
    pub runtime_access: bool,
    pub hardware_error_record: bool,
    pub authenticated_write_access: bool,
    pub time_based_authenticated_write_access: bool,
    pub append_write: bool,
    pub enhanced_authenticated_access: bool,

    #[bits(24)]
    _reserved: u32,
}

impl EfiVariableAttributes {
    /// `NV + BS + RT`
    pub const DEFAULT_ATTRIBUTES: EfiVariableAttributes = EfiVariableAttributes::new()
        .with_non_volatile(true)
        .with_bootservice_access(true)
        .with_runtime_access(true);
    /// `BS + RT`
    pub const DEFAULT_ATTRIBUTES_VOLATILE: EfiVariableAttributes = EfiVariableAttributes::new()
        .with_bootservice_access(true)
        .with_runtime_access(true);
}

/// UEFI spec 8.5.1 - `EFI_RESET_TYPE`
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EfiResetType {
    Cold,
    Warm,
    Shutdown,
    PlatformSpecific,
}
