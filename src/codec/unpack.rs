//! The struct-unpacking mini-language.
//!
//! A format is a sequence of `<count?><code>` tokens, read one after the
//! other from the start of the reader:
//!
//! | code | reads                  | yields                              |
//! |------|------------------------|-------------------------------------|
//! | `b`  | 1 byte each            | `Bool` (byte equals 1)              |
//! | `c`  | 1 byte each            | `Char`                              |
//! | `h`  | 2 bytes each           | `Int` (unsigned short)              |
//! | `i`  | 1 byte each            | `Int` (unsigned byte)               |
//! | `l`  | 4 bytes each           | `Int` (unsigned long)               |
//! | `s`  | `count` bytes          | one `Str`                           |
//! | `S`  | `count` bytes          | one `Str`, NULs and edges stripped  |
//! | `t`  | 1 byte each            | `Bits`, padded to 2 bits            |
//! | `T`  | `count` bytes          | one `BitRows`                       |
//! | `x`  | `count` bytes          | nothing                             |
//!
//! Whitespace between tokens is ignored.

use super::reader::BinaryReader;
use crate::utils::strip;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("Unknown unpack code `{0}`")]
    UnknownCode(char),
    #[error("Repeat count `{0}` is not followed by a code")]
    DanglingCount(String),
    #[error("Repeat count `{0}` is too large")]
    BadCount(String),
    #[error("Malformed escape at position {0}")]
    BadEscape(usize),
}

/// One decoded field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Unpacked {
    Bool(bool),
    Char(char),
    Int(u32),
    Str(String),
    Bits(Vec<u8>),
    BitRows(Vec<Vec<u8>>),
}

impl Unpacked {
    pub fn as_int(&self) -> Option<u32> {
        match self {
            Unpacked::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Unpacked::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Unpacked::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

fn tokens(format: &str) -> Result<Vec<(usize, char)>, FormatError> {
    let mut out = Vec::new();
    let mut count = String::new();
    for c in format.chars().filter(|c| !c.is_whitespace()) {
        if c.is_ascii_digit() {
            count.push(c);
            continue;
        }
        let repeat = if count.is_empty() {
            1
        } else {
            count
                .parse::<usize>()
                .map_err(|_| FormatError::BadCount(count.clone()))?
                .max(1)
        };
        out.push((repeat, c));
        count.clear();
    }
    if !count.is_empty() {
        return Err(FormatError::DanglingCount(count));
    }
    Ok(out)
}

impl BinaryReader {
    /// Decode `format` from the start of the reader.
    ///
    /// The whole format is validated before anything is read, so an unknown
    /// code fails the call without partial output.
    pub fn unpack(&self, format: &str) -> Result<Vec<Unpacked>, FormatError> {
        let tokens = tokens(format)?;
        if let Some(&(_, code)) = tokens.iter().find(|(_, c)| !"bchilsStTx".contains(*c)) {
            return Err(FormatError::UnknownCode(code));
        }

        let mut result = Vec::new();
        let mut offset: usize = 0;
        for (repeat, code) in tokens {
            let width = match code {
                'h' => 2,
                'l' => 4,
                _ => 1,
            };
            // Every token's span must fit before the cursor moves over it.
            repeat
                .checked_mul(width)
                .and_then(|span| offset.checked_add(span))
                .ok_or_else(|| FormatError::BadCount(repeat.to_string()))?;
            match code {
                'b' => {
                    for _ in 0..repeat {
                        result.push(Unpacked::Bool(self.byte_at(offset) == 1));
                        offset += 1;
                    }
                }
                'c' => {
                    for _ in 0..repeat {
                        result.push(Unpacked::Char(self.char_at(offset)));
                        offset += 1;
                    }
                }
                'h' => {
                    for _ in 0..repeat {
                        result.push(Unpacked::Int(self.short_at(offset).into()));
                        offset += 2;
                    }
                }
                'i' => {
                    for _ in 0..repeat {
                        result.push(Unpacked::Int(self.byte_at(offset).into()));
                        offset += 1;
                    }
                }
                'l' => {
                    for _ in 0..repeat {
                        result.push(Unpacked::Int(self.long_at(offset)));
                        offset += 4;
                    }
                }
                's' => {
                    result.push(Unpacked::Str(self.string_at(offset, repeat)));
                    offset += repeat;
                }
                'S' => {
                    result.push(Unpacked::Str(strip(&self.string_at(offset, repeat))));
                    offset += repeat;
                }
                't' => {
                    for _ in 0..repeat {
                        result.push(Unpacked::Bits(self.bits_at(offset, 2)));
                        offset += 1;
                    }
                }
                'T' => {
                    result.push(Unpacked::BitRows(self.bits_from_string_at(offset, repeat)));
                    offset += repeat;
                }
                'x' => offset += repeat,
                other => return Err(FormatError::UnknownCode(other)),
            }
        }

        Ok(result)
    }
}
