// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! MFCI policy values, variables, and signed-policy field names.

use crate::guid::Guid;
use crate::uefi::EfiVariableAttributes;
use core::fmt;

/// A 64-bit MFCI policy.
///
/// The low 32 bits describe a *state* the device may persist across boots.
/// The high 32 bits request one-shot *actions* that only mean something at
/// the moment of transition, and are never persisted.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct MfciPolicy(pub u64);

impl MfciPolicy {
    pub const STATE_MASK: u64 = 0x0000_0000_FFFF_FFFF;
    pub const ACTION_MASK: u64 = 0xFFFF_FFFF_0000_0000;

    /// Bits 0..=15 are Microsoft-defined states, bits 16..=31 OEM-defined.
    pub const OEM_STATE_MASK: u64 = 0x0000_0000_FFFF_0000;
    /// Bits 48..=63 are OEM-defined actions.
    pub const OEM_ACTION_MASK: u64 = 0xFFFF_0000_0000_0000;

    /// The default state of a device in the hands of its owner.
    pub const CUSTOMER_STATE: Self = Self(0);

    /// Clear the Secure Boot key database on the transition boot.
    pub const STD_ACTION_SECURE_BOOT_CLEAR: u64 = 1 << 32;
    /// Clear the TPM on the transition boot.
    pub const STD_ACTION_TPM_CLEAR: u64 = 1 << 33;

    pub const fn state(self) -> u64 {
        self.0 & Self::STATE_MASK
    }

    pub const fn actions(self) -> u64 {
        self.0 & Self::ACTION_MASK
    }

    /// The value that may be persisted as the current policy.
    pub const fn without_actions(self) -> Self {
        Self(self.0 & Self::STATE_MASK)
    }

    pub const fn is_customer_state(self) -> bool {
        self.0 == Self::CUSTOMER_STATE.0
    }

    pub fn to_le_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }
}

impl fmt::Debug for MfciPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MfciPolicy({:#018x})", self.0)
    }
}

impl fmt::Display for MfciPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

impl From<u64> for MfciPolicy {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// A nonce of this value has not been issued and never matches a policy.
pub const MFCI_POLICY_INVALID_NONCE: u64 = 0;

/// Vendor GUID shared by every MFCI variable.
pub const MFCI_VAR_VENDOR_GUID: Guid = Guid::from_static_str("EBA1A9D2-BF4D-4736-B680-B36AFB4DD65B");

/// Reset subtype reported when a reboot was caused by a policy change.
pub const MFCI_POLICY_CHANGE_RESET_GUID: Guid =
    Guid::from_static_str("29A5B0D9-4CC3-4D4D-9C3B-67F2C2B1D9E4");

/// Publisher GUID carried in the header of every MFCI policy payload.
pub const MFCI_POLICY_PUBLISHER_GUID: Guid =
    Guid::from_static_str("5AE6F808-8384-4EB9-A23A-0CCC1093E3DD");

pub const CURRENT_MFCI_POLICY_VARIABLE_NAME: &str = "CurrentMfciPolicy";
pub const CURRENT_MFCI_NONCE_VARIABLE_NAME: &str = "CurrentMfciPolicyNonce";
pub const CURRENT_MFCI_POLICY_BLOB_VARIABLE_NAME: &str = "CurrentMfciPolicyBlob";
pub const NEXT_MFCI_NONCE_VARIABLE_NAME: &str = "NextMfciPolicyNonce";
pub const NEXT_MFCI_POLICY_BLOB_VARIABLE_NAME: &str = "NextMfciPolicyBlob";
pub const MFCI_LOCK_VARIABLE_NAME: &str = "MfciPolicyLockVar";

/// Data written to the lock variable.
pub const MFCI_LOCK_VARIABLE_VALUE: u8 = 0x01;

/// Attributes of every persistent MFCI variable.
pub const MFCI_POLICY_VARIABLE_ATTR: EfiVariableAttributes =
    EfiVariableAttributes::DEFAULT_ATTRIBUTES;
/// Attributes of the lock variable. It is volatile, so every boot starts
/// unlocked.
pub const MFCI_LOCK_VARIABLE_ATTR: EfiVariableAttributes =
    EfiVariableAttributes::DEFAULT_ATTRIBUTES_VOLATILE;

/// Variables write-protected once the lock variable exists.
pub const MFCI_LOCKED_VARIABLE_NAMES: &[&str] = &[
    CURRENT_MFCI_POLICY_VARIABLE_NAME,
    CURRENT_MFCI_NONCE_VARIABLE_NAME,
    NEXT_MFCI_NONCE_VARIABLE_NAME,
    TargetingField::Manufacturer.variable_name(),
    TargetingField::Product.variable_name(),
    TargetingField::SerialNumber.variable_name(),
    TargetingField::Oem1.variable_name(),
    TargetingField::Oem2.variable_name(),
];

/// Key of the targeting and nonce entries in a policy payload.
pub const POLICY_KEY_TARGET: &str = "Target";
/// Key of the policy entry in a policy payload.
pub const POLICY_KEY_UEFI: &str = "UEFI";
pub const POLICY_VALUE_NAME_NONCE: &str = "Nonce";
pub const POLICY_VALUE_NAME_POLICY: &str = "Policy";

/// Required leaf EKU of MFCI policy signers.
pub const MFCI_DEFAULT_REQUIRED_EKU: &str = "1.3.6.1.4.1.311.45.255.255";

/// The device identity strings a policy is bound to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TargetingField {
    Manufacturer,
    Product,
    SerialNumber,
    Oem1,
    Oem2,
}

impl TargetingField {
    /// Fixed evaluation and population order.
    pub const ALL: [Self; 5] = [
        Self::Manufacturer,
        Self::Product,
        Self::SerialNumber,
        Self::Oem1,
        Self::Oem2,
    ];

    /// Name of the value under [`POLICY_KEY_TARGET`] in a policy payload.
    pub const fn value_name(self) -> &'static str {
        match self {
            Self::Manufacturer => "Manufacturer",
            Self::Product => "Product",
            Self::SerialNumber => "SerialNumber",
            Self::Oem1 => "OEM_01",
            Self::Oem2 => "OEM_02",
        }
    }

    /// Name of the variable holding this device's value.
    pub const fn variable_name(self) -> &'static str {
        match self {
            Self::Manufacturer => "Target\\Manufacturer",
            Self::Product => "Target\\Product",
            Self::SerialNumber => "Target\\SerialNumber",
            Self::Oem1 => "Target\\OEM_01",
            Self::Oem2 => "Target\\OEM_02",
        }
    }
}

impl fmt::Display for TargetingField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.variable_name())
    }
}
