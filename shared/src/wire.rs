//! Little-endian byte primitives shared by the query codecs and the RCON client
//!
//! Game servers speak a handful of ad-hoc binary formats that all reduce to the
//! same building blocks: fixed-width integers, IEEE floats, NUL-terminated
//! strings and length-prefixed strings. Writers append to a `Vec<u8>`, readers
//! walk a borrowed slice through [`ByteReader`] and fail with [`WireError`]
//! instead of panicking on short input.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("buffer truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("string is missing its NUL terminator")]
    MissingTerminator,
}

pub fn put_i16_le(buf: &mut Vec<u8>, value: i16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub fn put_i32_le(buf: &mut Vec<u8>, value: i32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub fn put_f32_le(buf: &mut Vec<u8>, value: f32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// Appends the raw bytes followed by a single NUL.
pub fn put_cstring(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(bytes);
    buf.push(0);
}

/// Appends `[i32 LE length][bytes][NUL]` where the length counts the NUL.
pub fn put_prefixed_string(buf: &mut Vec<u8>, bytes: &[u8]) {
    put_i32_le(buf, bytes.len() as i32 + 1);
    put_cstring(buf, bytes);
}

/// Maps each char to one byte; code points above U+00FF become `?`.
pub fn latin1_encode(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| if (c as u32) <= 0xFF { c as u8 } else { b'?' })
        .collect()
}

pub fn latin1_decode(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Cursor over a received datagram or stream frame
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Returns the next `n` bytes and advances past them.
    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::Truncated {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn skip(&mut self, n: usize) -> Result<(), WireError> {
        self.read_bytes(n).map(|_| ())
    }

    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_i16_le(&mut self) -> Result<i16, WireError> {
        let b = self.read_bytes(2)?;
        Ok(i16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_i16_be(&mut self) -> Result<i16, WireError> {
        let b = self.read_bytes(2)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_i32_le(&mut self) -> Result<i32, WireError> {
        let b = self.read_bytes(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_f32_le(&mut self) -> Result<f32, WireError> {
        let b = self.read_bytes(4)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads up to the next NUL, consuming the terminator.
    ///
    /// The search never runs past the end of the buffer; an unterminated
    /// string leaves the cursor untouched.
    pub fn read_cstring_bytes(&mut self) -> Result<&'a [u8], WireError> {
        let rest = &self.buf[self.pos..];
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(WireError::MissingTerminator)?;
        self.pos += end + 1;
        Ok(&rest[..end])
    }

    /// NUL-terminated string decoded as UTF-8, replacing invalid sequences.
    pub fn read_cstring(&mut self) -> Result<String, WireError> {
        let bytes = self.read_cstring_bytes()?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}
