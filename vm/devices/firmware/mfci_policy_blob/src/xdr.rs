// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! XDR framed certificate containers.
//!
//! Each entry is a 4-byte big-endian length followed by that many bytes of
//! content, padded with zeros to a 4-byte boundary.

use thiserror::Error;
use zerocopy::BigEndian;
use zerocopy::FromBytes;
use zerocopy::U32;

const XDR_ALIGN: usize = 4;

/// Errors which may occur while walking an XDR container.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum XdrError {
    #[error("truncated length prefix, {remaining} bytes remaining")]
    TruncatedLength { remaining: usize },
    #[error("entry of {declared} bytes exceeds the {remaining} bytes remaining")]
    TruncatedEntry { declared: usize, remaining: usize },
}

/// Iterator over the entries of an XDR container.
///
/// Yields `Err` at most once; iteration ends after the first error.
pub struct ParseXdr<'a> {
    buf: &'a [u8],
}

impl<'a> ParseXdr<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn next_inner(&mut self) -> Result<Option<&'a [u8]>, XdrError> {
        if self.buf.is_empty() {
            return Ok(None);
        }

        let (len, rest) = U32::<BigEndian>::read_from_prefix(self.buf).map_err(|_| {
            XdrError::TruncatedLength {
                remaining: self.buf.len(),
            }
        })?;

        let declared = len.get() as usize;
        let padded = declared
            .checked_next_multiple_of(XDR_ALIGN)
            .filter(|&padded| padded <= rest.len())
            .ok_or(XdrError::TruncatedEntry {
                declared,
                remaining: rest.len(),
            })?;

        let (entry, rest) = rest.split_at(padded);
        self.buf = rest;
        Ok(Some(&entry[..declared]))
    }
}

impl<'a> Iterator for ParseXdr<'a> {
    type Item = Result<&'a [u8], XdrError>;

    fn next(&mut self) -> Option<Self::Item> {
        let res = self.next_inner().transpose();
        if matches!(res, Some(Err(_))) {
            self.buf = &[];
        }
        res
    }
}

/// Encode `entries` as an XDR container.
pub fn encode_xdr<'a>(entries: impl IntoIterator<Item = &'a [u8]>) -> Vec<u8> {
    let mut out = Vec::new();
    for entry in entries {
        out.extend_from_slice(&(entry.len() as u32).to_be_bytes());
        out.extend_from_slice(entry);
        out.resize(out.len().next_multiple_of(XDR_ALIGN), 0);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(buf: &[u8]) -> Vec<Result<&[u8], XdrError>> {
        ParseXdr::new(buf).collect()
    }

    #[test]
    fn walk_padded_entries() {
        let buf = encode_xdr([&b"abcde"[..], &b""[..], &b"wxyz"[..]]);
        assert_eq!(
            buf,
            [
                0, 0, 0, 5, b'a', b'b', b'c', b'd', b'e', 0, 0, 0, //
                0, 0, 0, 0, //
                0, 0, 0, 4, b'w', b'x', b'y', b'z',
            ]
        );
        assert_eq!(collect(&buf), [Ok(&b"abcde"[..]), Ok(&b""[..]), Ok(&b"wxyz"[..])]);
    }

    #[test]
    fn empty_container() {
        assert!(collect(&[]).is_empty());
    }

    #[test]
    fn truncated_length_prefix() {
        let mut buf = encode_xdr([&b"cert"[..]]);
        buf.extend_from_slice(&[0, 0]);
        assert_eq!(
            collect(&buf),
            [Ok(&b"cert"[..]), Err(XdrError::TruncatedLength { remaining: 2 })]
        );
    }

    #[test]
    fn truncated_content() {
        let buf = [0, 0, 0, 8, 1, 2, 3, 4];
        assert_eq!(
            collect(&buf),
            [Err(XdrError::TruncatedEntry {
                declared: 8,
                remaining: 4
            })]
        );
    }

    #[test]
    fn missing_padding_is_truncation() {
        // 5 bytes of content must be followed by 3 bytes of padding
        let buf = [0, 0, 0, 5, 1, 2, 3, 4, 5];
        assert_eq!(
            collect(&buf),
            [Err(XdrError::TruncatedEntry {
                declared: 5,
                remaining: 5
            })]
        );
    }

    #[test]
    fn huge_length_does_not_overflow() {
        let buf = [0xff, 0xff, 0xff, 0xff, 0, 0, 0, 0];
        assert!(matches!(
            collect(&buf)[..],
            [Err(XdrError::TruncatedEntry { .. })]
        ));
    }
}
