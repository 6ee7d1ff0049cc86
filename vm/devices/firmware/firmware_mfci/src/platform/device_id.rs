// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Interfaces required to bind MFCI policies to a single device.

use mfci_specs::mfci::TargetingField;
use mfci_specs::uefi::EfiStatus;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::KnownLayout;

#[derive(Debug, Error)]
pub enum DeviceIdError {
    #[error("{0} is not available on this platform")]
    Unsupported(TargetingField),
    #[error("malformed SMBIOS record")]
    Smbios(#[from] SmbiosError),
}

impl DeviceIdError {
    pub fn status(&self) -> EfiStatus {
        match self {
            DeviceIdError::Unsupported(_) => EfiStatus::UNSUPPORTED,
            DeviceIdError::Smbios(_) => EfiStatus::DEVICE_ERROR,
        }
    }
}

/// Source of the identity strings a policy must target.
pub trait DeviceIdProvider {
    /// Return this device's value for `field`.
    fn device_id(&self, field: TargetingField) -> Result<String, DeviceIdError>;
}

/// A fixed device identity, typically loaded from configuration.
///
/// Fields left as `None` are reported as unsupported.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticDeviceId {
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub oem1: Option<String>,
    pub oem2: Option<String>,
}

impl StaticDeviceId {
    /// An identity with every field set.
    pub fn new(
        manufacturer: &str,
        product: &str,
        serial_number: &str,
        oem1: &str,
        oem2: &str,
    ) -> Self {
        Self {
            manufacturer: Some(manufacturer.into()),
            product: Some(product.into()),
            serial_number: Some(serial_number.into()),
            oem1: Some(oem1.into()),
            oem2: Some(oem2.into()),
        }
    }

    fn field(&self, field: TargetingField) -> &Option<String> {
        match field {
            TargetingField::Manufacturer => &self.manufacturer,
            TargetingField::Product => &self.product,
            TargetingField::SerialNumber => &self.serial_number,
            TargetingField::Oem1 => &self.oem1,
            TargetingField::Oem2 => &self.oem2,
        }
    }
}

impl DeviceIdProvider for StaticDeviceId {
    fn device_id(&self, field: TargetingField) -> Result<String, DeviceIdError> {
        self.field(field)
            .clone()
            .ok_or(DeviceIdError::Unsupported(field))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SmbiosError {
    #[error("record is shorter than the type 1 formatted area")]
    Truncated,
    #[error("expected a type 1 record, found type {0}")]
    WrongType(u8),
    #[error("string set is not double-NUL terminated")]
    UnterminatedStrings,
    #[error("string index {0} is out of range")]
    StringIndex(u8),
}

const SMBIOS_SYSTEM_INFORMATION_TYPE: u8 = 1;

// DSP0134 7.2 System Information (Type 1), up to the serial number string.
#[repr(C, packed)]
#[allow(dead_code)] // fields read only for layout
#[derive(Debug, FromBytes, Immutable, KnownLayout, Clone, Copy)]
struct SmbiosType1Prefix {
    structure_type: u8,
    length: u8,
    handle: u16,
    manufacturer: u8,
    product_name: u8,
    version: u8,
    serial_number: u8,
}

/// Device identity read from an SMBIOS System Information (Type 1) record.
///
/// SMBIOS has no equivalent of the OEM targeting fields, so they are always
/// empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmbiosDeviceId {
    manufacturer: String,
    product: String,
    serial_number: String,
}

impl SmbiosDeviceId {
    /// Parse a complete type 1 record: the formatted area followed by its
    /// string set.
    pub fn from_type1(record: &[u8]) -> Result<Self, SmbiosError> {
        let (prefix, _) =
            SmbiosType1Prefix::read_from_prefix(record).map_err(|_| SmbiosError::Truncated)?;
        if prefix.structure_type != SMBIOS_SYSTEM_INFORMATION_TYPE {
            return Err(SmbiosError::WrongType(prefix.structure_type));
        }

        let strings = record
            .get(prefix.length as usize..)
            .ok_or(SmbiosError::Truncated)?;
        let end = strings
            .windows(2)
            .position(|w| w == [0, 0])
            .ok_or(SmbiosError::UnterminatedStrings)?;
        let strings: Vec<&[u8]> = strings[..end].split(|&b| b == 0).collect();

        let lookup = |index: u8| -> Result<String, SmbiosError> {
            // index 0 means the string is not provided
            if index == 0 {
                return Ok(String::new());
            }
            let s = strings
                .get(index as usize - 1)
                .ok_or(SmbiosError::StringIndex(index))?;
            Ok(String::from_utf8_lossy(s).into_owned())
        };

        Ok(Self {
            manufacturer: lookup(prefix.manufacturer)?,
            product: lookup(prefix.product_name)?,
            serial_number: lookup(prefix.serial_number)?,
        })
    }
}

impl DeviceIdProvider for SmbiosDeviceId {
    fn device_id(&self, field: TargetingField) -> Result<String, DeviceIdError> {
        Ok(match field {
            TargetingField::Manufacturer => self.manufacturer.clone(),
            TargetingField::Product => self.product.clone(),
            TargetingField::SerialNumber => self.serial_number.clone(),
            TargetingField::Oem1 | TargetingField::Oem2 => String::new(),
        })
    }
}
