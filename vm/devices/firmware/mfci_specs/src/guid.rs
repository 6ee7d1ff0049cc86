// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A GUID with the in-memory layout firmware uses (`EFI_GUID`).

use core::fmt;
use core::str::FromStr;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// `EFI_GUID`, little-endian mixed encoding.
#[repr(C)]
#[derive(
    Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, IntoBytes, FromBytes, Immutable, KnownLayout,
)]
pub struct Guid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

static_assertions::const_assert_eq!(size_of::<Guid>(), 16);

impl Default for Guid {
    fn default() -> Self {
        Self::new_zeroed()
    }
}

/// Error returned when a string is not a GUID in registry form.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid GUID length")]
    Length,
    #[error("invalid GUID format")]
    Format,
    #[error("invalid GUID digit")]
    Digit,
}

const fn hex_field(s: &[u8], start: usize, digits: usize) -> Result<u64, ParseError> {
    let mut value = 0u64;
    let mut i = 0;
    while i < digits {
        let c = s[start + i];
        let d = match c {
            b'0'..=b'9' => c - b'0',
            b'a'..=b'f' => c - b'a' + 10,
            b'A'..=b'F' => c - b'A' + 10,
            _ => return Err(ParseError::Digit),
        };
        value = (value << 4) | d as u64;
        i += 1;
    }
    Ok(value)
}

// `?` is not available in const fn.
macro_rules! try_const {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => return Err(e),
        }
    };
}

impl Guid {
    pub const ZERO: Self = Self {
        data1: 0,
        data2: 0,
        data3: 0,
        data4: [0; 8],
    };

    /// Builds a GUID from its registry form, `XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXX`,
    /// optionally wrapped in braces.
    ///
    /// Intended for constants. Panics if the string is malformed; use
    /// [`FromStr`] for untrusted input.
    pub const fn from_static_str(value: &'static str) -> Self {
        match Self::parse(value.as_bytes()) {
            Ok(guid) => guid,
            Err(ParseError::Length) => panic!("invalid GUID length"),
            Err(ParseError::Format) => panic!("invalid GUID format"),
            Err(ParseError::Digit) => panic!("invalid GUID digit"),
        }
    }

    const fn parse(s: &[u8]) -> Result<Self, ParseError> {
        let o = match s.len() {
            36 => 0,
            38 if s[0] == b'{' && s[37] == b'}' => 1,
            38 => return Err(ParseError::Format),
            _ => return Err(ParseError::Length),
        };

        if s[o + 8] != b'-' || s[o + 13] != b'-' || s[o + 18] != b'-' || s[o + 23] != b'-' {
            return Err(ParseError::Format);
        }

        let mut data4 = [0u8; 8];
        data4[0] = try_const!(hex_field(s, o + 19, 2)) as u8;
        data4[1] = try_const!(hex_field(s, o + 21, 2)) as u8;
        let mut i = 0;
        while i < 6 {
            data4[2 + i] = try_const!(hex_field(s, o + 24 + i * 2, 2)) as u8;
            i += 1;
        }

        Ok(Self {
            data1: try_const!(hex_field(s, o, 8)) as u32,
            data2: try_const!(hex_field(s, o + 9, 4)) as u16,
            data3: try_const!(hex_field(s, o + 14, 4)) as u16,
            data4,
        })
    }
}

impl FromStr for Guid {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s.as_bytes())
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-",
            self.data1, self.data2, self.data3, self.data4[0], self.data4[1]
        )?;
        for b in &self.data4[2..] {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
