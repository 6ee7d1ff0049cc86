// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Parsing and construction of the firmware policy payload carried inside a
//! signed MFCI policy.
//!
//! ```text
//! u16  FormatVersion
//! u32  PolicyVersion
//! GUID PolicyPublisher
//! u16  Reserved1Count      (must be 0)
//! u32  OptionFlags
//! u16  Reserved2Count      (must be 0)
//! u16  RulesCount
//! PolicyRule[RulesCount]
//! u8   ValueTable[]        (rule offsets are relative to its start)
//! ```
//!
//! All integers are little-endian and nothing is aligned.

use mfci_specs::mfci::MfciPolicy;
use mfci_specs::mfci::TargetingField;
use mfci_specs::mfci::MFCI_POLICY_PUBLISHER_GUID;
use mfci_specs::mfci::POLICY_KEY_TARGET;
use mfci_specs::mfci::POLICY_KEY_UEFI;
use mfci_specs::mfci::POLICY_VALUE_NAME_NONCE;
use mfci_specs::mfci::POLICY_VALUE_NAME_POLICY;
use mfci_specs::Guid;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::LittleEndian;
use zerocopy::Unaligned;
use zerocopy::U16;
use zerocopy::U32;
use zerocopy::U64;

pub const POLICY_FORMAT_VERSION: u16 = 2;
pub const POLICY_VERSION: u32 = 1;
pub const POLICY_ROOT_KEY: u32 = 0xEF10_0000;

/// Type tags of entries in the value table.
pub mod value_type {
    pub const STRING: u16 = 1;
    pub const DWORD: u16 = 4;
    pub const QWORD: u16 = 11;
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct PolicyHeader {
    format_version: U16<LittleEndian>,
    policy_version: U32<LittleEndian>,
    publisher: [u8; 16],
    reserved1_count: U16<LittleEndian>,
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct PolicyHeader2 {
    option_flags: U32<LittleEndian>,
    reserved2_count: U16<LittleEndian>,
    rules_count: U16<LittleEndian>,
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct PolicyRule {
    root_key: U32<LittleEndian>,
    sub_key_name_offset: U32<LittleEndian>,
    value_name_offset: U32<LittleEndian>,
    value_offset: U32<LittleEndian>,
}

/// Errors which may occur when reading a policy payload.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("payload header is truncated")]
    TruncatedHeader,
    #[error("unsupported payload format version {0}")]
    FormatVersion(u16),
    #[error("unsupported policy version {0}")]
    PolicyVersion(u32),
    #[error("unexpected policy publisher {0}")]
    Publisher(Guid),
    #[error("reserved entries are not supported")]
    Reserved,
    #[error("rule table is truncated")]
    TruncatedRules,
    #[error("rule {0} has unexpected root key {1:#x}")]
    RootKey(usize, u32),
    #[error("value table offset {0} is out of bounds")]
    Offset(usize),
    #[error("string at offset {0} is not valid UTF-16LE")]
    BadString(usize),
    #[error("value {key}\\{name} not found")]
    NotFound { key: String, name: String },
    #[error("value {key}\\{name} has type {found}, expected {expected}")]
    WrongType {
        key: String,
        name: String,
        found: u16,
        expected: u16,
    },
    #[error("unknown value type {0}")]
    UnknownType(u16),
}

/// A length-prefixed UTF-16LE string in the value table, without a NUL.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PolicyString<'a>(&'a [u8]);

impl<'a> PolicyString<'a> {
    /// The raw UTF-16LE bytes.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.0
    }

    pub fn units(&self) -> impl Iterator<Item = u16> + 'a {
        self.0
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
    }

    pub fn eq_str(&self, s: &str) -> bool {
        self.units().eq(s.encode_utf16())
    }

    pub fn to_string_lossy(&self) -> String {
        char::decode_utf16(self.units())
            .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PolicyValue<'a> {
    String(PolicyString<'a>),
    Dword(u32),
    Qword(u64),
}

impl PolicyValue<'_> {
    pub fn value_type(&self) -> u16 {
        match self {
            PolicyValue::String(_) => value_type::STRING,
            PolicyValue::Dword(_) => value_type::DWORD,
            PolicyValue::Qword(_) => value_type::QWORD,
        }
    }
}

/// One decoded rule.
#[derive(Debug, Copy, Clone)]
pub struct PolicyEntry<'a> {
    pub key: PolicyString<'a>,
    pub name: PolicyString<'a>,
    pub value: PolicyValue<'a>,
}

/// A zero-copy view of a policy payload.
#[derive(Debug)]
pub struct PolicyPayload<'a> {
    option_flags: u32,
    rules: &'a [PolicyRule],
    values: &'a [u8],
}

impl<'a> PolicyPayload<'a> {
    /// Validate the payload headers and rule table.
    ///
    /// Individual strings and values are only decoded on lookup.
    pub fn parse(buf: &'a [u8]) -> Result<Self, PayloadError> {
        let (header, buf) =
            PolicyHeader::ref_from_prefix(buf).map_err(|_| PayloadError::TruncatedHeader)?;

        if header.format_version.get() != POLICY_FORMAT_VERSION {
            return Err(PayloadError::FormatVersion(header.format_version.get()));
        }
        if header.policy_version.get() != POLICY_VERSION {
            return Err(PayloadError::PolicyVersion(header.policy_version.get()));
        }
        let publisher: Guid = zerocopy::transmute!(header.publisher);
        if publisher != MFCI_POLICY_PUBLISHER_GUID {
            return Err(PayloadError::Publisher(publisher));
        }
        if header.reserved1_count.get() != 0 {
            return Err(PayloadError::Reserved);
        }

        let (header2, buf) =
            PolicyHeader2::ref_from_prefix(buf).map_err(|_| PayloadError::TruncatedHeader)?;
        if header2.reserved2_count.get() != 0 {
            return Err(PayloadError::Reserved);
        }

        let (rules, values) =
            <[PolicyRule]>::ref_from_prefix_with_elems(buf, header2.rules_count.get().into())
                .map_err(|_| PayloadError::TruncatedRules)?;

        for (i, rule) in rules.iter().enumerate() {
            if rule.root_key.get() != POLICY_ROOT_KEY {
                return Err(PayloadError::RootKey(i, rule.root_key.get()));
            }
        }

        Ok(Self {
            option_flags: header2.option_flags.get(),
            rules,
            values,
        })
    }

    pub fn option_flags(&self) -> u32 {
        self.option_flags
    }

    fn table_at(&self, offset: u32) -> Result<&'a [u8], PayloadError> {
        let offset = offset as usize;
        self.values.get(offset..).ok_or(PayloadError::Offset(offset))
    }

    fn string_at(&self, offset: u32) -> Result<PolicyString<'a>, PayloadError> {
        let (len, rest) = U16::<LittleEndian>::read_from_prefix(self.table_at(offset)?)
            .map_err(|_| PayloadError::Offset(offset as usize))?;
        let len = len.get() as usize;
        if len % 2 != 0 {
            return Err(PayloadError::BadString(offset as usize));
        }
        rest.get(..len)
            .map(PolicyString)
            .ok_or(PayloadError::Offset(offset as usize))
    }

    fn value_at(&self, offset: u32) -> Result<PolicyValue<'a>, PayloadError> {
        let truncated = || PayloadError::Offset(offset as usize);
        let (ty, rest) = U16::<LittleEndian>::read_from_prefix(self.table_at(offset)?)
            .map_err(|_| truncated())?;
        Ok(match ty.get() {
            value_type::STRING => {
                // the string follows the type tag
                PolicyValue::String(self.string_at(offset + 2)?)
            }
            value_type::DWORD => PolicyValue::Dword(
                U32::<LittleEndian>::read_from_prefix(rest)
                    .map_err(|_| truncated())?
                    .0
                    .get(),
            ),
            value_type::QWORD => PolicyValue::Qword(
                U64::<LittleEndian>::read_from_prefix(rest)
                    .map_err(|_| truncated())?
                    .0
                    .get(),
            ),
            ty => return Err(PayloadError::UnknownType(ty)),
        })
    }

    fn entry(&self, rule: &PolicyRule) -> Result<PolicyEntry<'a>, PayloadError> {
        Ok(PolicyEntry {
            key: self.string_at(rule.sub_key_name_offset.get())?,
            name: self.string_at(rule.value_name_offset.get())?,
            value: self.value_at(rule.value_offset.get())?,
        })
    }

    /// Iterate over every rule in table order.
    pub fn entries(&self) -> impl Iterator<Item = Result<PolicyEntry<'a>, PayloadError>> + '_ {
        self.rules.iter().map(|rule| self.entry(rule))
    }

    /// Return the value of the first rule named `key\name`.
    pub fn get(&self, key: &str, name: &str) -> Result<PolicyValue<'a>, PayloadError> {
        for rule in self.rules {
            let rule_key = self.string_at(rule.sub_key_name_offset.get())?;
            let rule_name = self.string_at(rule.value_name_offset.get())?;
            if rule_key.eq_str(key) && rule_name.eq_str(name) {
                return self.value_at(rule.value_offset.get());
            }
        }

        Err(PayloadError::NotFound {
            key: key.into(),
            name: name.into(),
        })
    }

    pub fn get_string(&self, key: &str, name: &str) -> Result<PolicyString<'a>, PayloadError> {
        match self.get(key, name)? {
            PolicyValue::String(s) => Ok(s),
            other => Err(wrong_type(key, name, &other, value_type::STRING)),
        }
    }

    pub fn get_u64(&self, key: &str, name: &str) -> Result<u64, PayloadError> {
        match self.get(key, name)? {
            PolicyValue::Qword(v) => Ok(v),
            other => Err(wrong_type(key, name, &other, value_type::QWORD)),
        }
    }
}

fn wrong_type(key: &str, name: &str, found: &PolicyValue<'_>, expected: u16) -> PayloadError {
    PayloadError::WrongType {
        key: key.into(),
        name: name.into(),
        found: found.value_type(),
        expected,
    }
}

enum OwnedValue {
    String(String),
    Dword(u32),
    Qword(u64),
}

/// Builds a policy payload.
#[derive(Default)]
pub struct PolicyBuilder {
    option_flags: u32,
    rules: Vec<(String, String, OwnedValue)>,
}

fn push_string(table: &mut Vec<u8>, s: &str) {
    let units = s.encode_utf16().collect::<Vec<_>>();
    table.extend_from_slice(&((units.len() * 2) as u16).to_le_bytes());
    table.extend_from_slice(units.as_bytes());
}

impl PolicyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn option_flags(mut self, flags: u32) -> Self {
        self.option_flags = flags;
        self
    }

    pub fn string(mut self, key: &str, name: &str, value: &str) -> Self {
        self.rules
            .push((key.into(), name.into(), OwnedValue::String(value.into())));
        self
    }

    pub fn dword(mut self, key: &str, name: &str, value: u32) -> Self {
        self.rules
            .push((key.into(), name.into(), OwnedValue::Dword(value)));
        self
    }

    pub fn qword(mut self, key: &str, name: &str, value: u64) -> Self {
        self.rules
            .push((key.into(), name.into(), OwnedValue::Qword(value)));
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(
            PolicyHeader {
                format_version: POLICY_FORMAT_VERSION.into(),
                policy_version: POLICY_VERSION.into(),
                publisher: zerocopy::transmute!(MFCI_POLICY_PUBLISHER_GUID),
                reserved1_count: 0.into(),
            }
            .as_bytes(),
        );
        out.extend_from_slice(
            PolicyHeader2 {
                option_flags: self.option_flags.into(),
                reserved2_count: 0.into(),
                rules_count: (self.rules.len() as u16).into(),
            }
            .as_bytes(),
        );

        let mut table = Vec::new();
        for (key, name, value) in &self.rules {
            let sub_key_name_offset = table.len() as u32;
            push_string(&mut table, key);
            let value_name_offset = table.len() as u32;
            push_string(&mut table, name);
            let value_offset = table.len() as u32;
            match value {
                OwnedValue::String(s) => {
                    table.extend_from_slice(&value_type::STRING.to_le_bytes());
                    push_string(&mut table, s);
                }
                OwnedValue::Dword(v) => {
                    table.extend_from_slice(&value_type::DWORD.to_le_bytes());
                    table.extend_from_slice(&v.to_le_bytes());
                }
                OwnedValue::Qword(v) => {
                    table.extend_from_slice(&value_type::QWORD.to_le_bytes());
                    table.extend_from_slice(&v.to_le_bytes());
                }
            }

            out.extend_from_slice(
                PolicyRule {
                    root_key: POLICY_ROOT_KEY.into(),
                    sub_key_name_offset: sub_key_name_offset.into(),
                    value_name_offset: value_name_offset.into(),
                    value_offset: value_offset.into(),
                }
                .as_bytes(),
            );
        }

        out.extend_from_slice(&table);
        out
    }
}

/// The fields of an MFCI policy payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MfciPolicyFields {
    pub manufacturer: String,
    pub product: String,
    pub serial_number: String,
    pub oem1: String,
    pub oem2: String,
    pub nonce: u64,
    pub policy: MfciPolicy,
}

impl MfciPolicyFields {
    pub fn targeting(&self, field: TargetingField) -> &str {
        match field {
            TargetingField::Manufacturer => &self.manufacturer,
            TargetingField::Product => &self.product,
            TargetingField::SerialNumber => &self.serial_number,
            TargetingField::Oem1 => &self.oem1,
            TargetingField::Oem2 => &self.oem2,
        }
    }

    pub fn targeting_mut(&mut self, field: TargetingField) -> &mut String {
        match field {
            TargetingField::Manufacturer => &mut self.manufacturer,
            TargetingField::Product => &mut self.product,
            TargetingField::SerialNumber => &mut self.serial_number,
            TargetingField::Oem1 => &mut self.oem1,
            TargetingField::Oem2 => &mut self.oem2,
        }
    }

    pub fn to_payload(&self) -> Vec<u8> {
        let mut builder = PolicyBuilder::new();
        for field in TargetingField::ALL {
            builder = builder.string(POLICY_KEY_TARGET, field.value_name(), self.targeting(field));
        }
        builder
            .qword(POLICY_KEY_TARGET, POLICY_VALUE_NAME_NONCE, self.nonce)
            .qword(POLICY_KEY_UEFI, POLICY_VALUE_NAME_POLICY, self.policy.0)
            .build()
    }

    pub fn from_payload(payload: &PolicyPayload<'_>) -> Result<Self, PayloadError> {
        let mut fields = Self::default();
        for field in TargetingField::ALL {
            *fields.targeting_mut(field) = payload
                .get_string(POLICY_KEY_TARGET, field.value_name())?
                .to_string_lossy();
        }
        fields.nonce = payload.get_u64(POLICY_KEY_TARGET, POLICY_VALUE_NAME_NONCE)?;
        fields.policy = MfciPolicy(payload.get_u64(POLICY_KEY_UEFI, POLICY_VALUE_NAME_POLICY)?);
        Ok(fields)
    }
}
