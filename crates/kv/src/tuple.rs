//! Order-preserving tuple encoding
//!
//! Keys are built from typed tuples whose packed form compares
//! byte-lexicographically in the same order as the logical values. The
//! layout follows the classic directory-store convention: tagged byte
//! strings and strings with NUL escaping, and variable-length integers
//! whose tag encodes sign and magnitude width.

use crate::error::{Error, Result};

const BYTES_CODE: u8 = 0x01;
const STRING_CODE: u8 = 0x02;
const INT_ZERO_CODE: u8 = 0x14;

/// One element of a packed tuple.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Element {
    Bytes(Vec<u8>),
    Str(String),
    Int(i64),
}

impl Element {
    pub fn as_int(&self) -> Result<i64> {
        match self {
            Element::Int(v) => Ok(*v),
            other => Err(Error::Tuple(format!("expected integer, found {:?}", other))),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            Element::Str(s) => Ok(s),
            other => Err(Error::Tuple(format!("expected string, found {:?}", other))),
        }
    }
}

impl From<i64> for Element {
    fn from(v: i64) -> Self {
        Element::Int(v)
    }
}

impl From<&str> for Element {
    fn from(v: &str) -> Self {
        Element::Str(v.to_string())
    }
}

impl From<String> for Element {
    fn from(v: String) -> Self {
        Element::Str(v)
    }
}

impl From<Vec<u8>> for Element {
    fn from(v: Vec<u8>) -> Self {
        Element::Bytes(v)
    }
}

/// Pack a tuple into its canonical byte form.
pub fn pack(elements: &[Element]) -> Vec<u8> {
    let mut out = Vec::new();
    for element in elements {
        pack_into(element, &mut out);
    }
    out
}

/// Pack a single element, convenience for one-part keys.
pub fn pack_one(element: impl Into<Element>) -> Vec<u8> {
    pack(&[element.into()])
}

fn pack_into(element: &Element, out: &mut Vec<u8>) {
    match element {
        Element::Bytes(b) => {
            out.push(BYTES_CODE);
            escape_nul(b, out);
        }
        Element::Str(s) => {
            out.push(STRING_CODE);
            escape_nul(s.as_bytes(), out);
        }
        Element::Int(v) => pack_int(*v, out),
    }
}

fn escape_nul(bytes: &[u8], out: &mut Vec<u8>) {
    for &b in bytes {
        out.push(b);
        if b == 0x00 {
            out.push(0xFF);
        }
    }
    out.push(0x00);
}

fn pack_int(v: i64, out: &mut Vec<u8>) {
    if v == 0 {
        out.push(INT_ZERO_CODE);
    } else if v > 0 {
        let be = v.to_be_bytes();
        let skip = be.iter().take_while(|&&b| b == 0).count();
        let len = 8 - skip;
        out.push(INT_ZERO_CODE + len as u8);
        out.extend_from_slice(&be[skip..]);
    } else {
        // Negative: offset-complement so that packed bytes sort ascending.
        let magnitude = (v as i128).unsigned_abs();
        let len = ((128 - magnitude.leading_zeros() as usize) + 7) / 8;
        let adjusted = (v as i128) + ((1i128 << (8 * len)) - 1);
        let be = adjusted.to_be_bytes();
        out.push(INT_ZERO_CODE - len as u8);
        out.extend_from_slice(&be[16 - len..]);
    }
}

/// Unpack a canonical byte form back into its tuple. Rejects truncated
/// input and trailing garbage.
pub fn unpack(bytes: &[u8]) -> Result<Vec<Element>> {
    let mut elements = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        let (element, next) = unpack_at(bytes, pos)?;
        elements.push(element);
        pos = next;
    }
    Ok(elements)
}

fn unpack_at(bytes: &[u8], pos: usize) -> Result<(Element, usize)> {
    let code = bytes[pos];
    match code {
        BYTES_CODE => {
            let (raw, next) = unescape_nul(bytes, pos + 1)?;
            Ok((Element::Bytes(raw), next))
        }
        STRING_CODE => {
            let (raw, next) = unescape_nul(bytes, pos + 1)?;
            let s = String::from_utf8(raw)
                .map_err(|e| Error::Tuple(format!("invalid UTF-8 in packed string: {}", e)))?;
            Ok((Element::Str(s), next))
        }
        code if (0x0C..=0x1C).contains(&code) => {
            let len = (code as i32 - INT_ZERO_CODE as i32).unsigned_abs() as usize;
            let end = pos + 1 + len;
            if end > bytes.len() {
                return Err(Error::Tuple("truncated integer".to_string()));
            }
            let mut magnitude: i128 = 0;
            for &b in &bytes[pos + 1..end] {
                magnitude = (magnitude << 8) | b as i128;
            }
            let value = if code >= INT_ZERO_CODE {
                magnitude
            } else {
                magnitude - ((1i128 << (8 * len)) - 1)
            };
            Ok((Element::Int(value as i64), end))
        }
        other => Err(Error::Tuple(format!("unknown type code {:#04x}", other))),
    }
}

fn unescape_nul(bytes: &[u8], mut pos: usize) -> Result<(Vec<u8>, usize)> {
    let mut raw = Vec::new();
    loop {
        if pos >= bytes.len() {
            return Err(Error::Tuple("unterminated byte string".to_string()));
        }
        let b = bytes[pos];
        if b == 0x00 {
            if bytes.get(pos + 1) == Some(&0xFF) {
                raw.push(0x00);
                pos += 2;
            } else {
                return Ok((raw, pos + 1));
            }
        } else {
            raw.push(b);
            pos += 1;
        }
    }
}

/// The first key strictly greater than every key prefixed by `key`.
/// Fails only for keys consisting entirely of `0xFF` bytes.
pub fn strinc(key: &[u8]) -> Result<Vec<u8>> {
    let trimmed = key
        .iter()
        .rposition(|&b| b != 0xFF)
        .ok_or(Error::KeyUnbounded)?;
    let mut out = key[..=trimmed].to_vec();
    out[trimmed] += 1;
    Ok(out)
}

/// The `(start, end)` range covering every key prefixed by `prefix`.
pub fn prefix_range(prefix: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    Ok((prefix.to_vec(), strinc(prefix)?))
}
