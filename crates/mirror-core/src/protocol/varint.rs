//! Base-128 varint primitives used by the control-message codec.
//!
//! # What is a base-128 varint? (for beginners)
//!
//! Most integers that travel over the control channel are small: key codes,
//! pointer counts, coordinates on a phone screen.  Spending four fixed bytes
//! on each of them wastes bandwidth, so integers are written 7 bits at a time,
//! least-significant group first.  The high bit of each byte says whether
//! another byte follows:
//!
//! ```text
//! 300 = 0b1_0010_1100  ->  [0xAC, 0x02]
//!        ^^^^^^^ low 7 bits (0x2C) with continuation bit set -> 0xAC
//!                  remaining bits (0x02), no continuation    -> 0x02
//! ```
//!
//! Signed values are reinterpreted as unsigned before encoding, so `-1`
//! occupies the full five bytes.  Byte strings are a varint length followed
//! by the raw bytes; text is UTF-8.  Floats are four raw little-endian bytes.

use crate::protocol::codec::ProtocolError;

/// Maximum encoded length of a 32-bit varint.
pub const MAX_VARINT32_LEN: usize = 5;

/// Largest byte string or collection the decoder accepts.
///
/// Checked before allocating so a corrupt length prefix cannot trigger a
/// multi-gigabyte allocation.
pub const MAX_COLLECTION_LEN: usize = 1 << 20;

// ── Writing ───────────────────────────────────────────────────────────────────

/// Appends `value` to `buf` as an unsigned base-128 varint.
///
/// # Examples
///
/// ```rust
/// use mirror_core::protocol::varint::write_u32;
///
/// let mut buf = Vec::new();
/// write_u32(&mut buf, 300);
/// assert_eq!(buf, [0xAC, 0x02]);
/// ```
pub fn write_u32(buf: &mut Vec<u8>, mut value: u32) {
    while value & !0x7F != 0 {
        buf.push((value & 0x7F) as u8 | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// Appends a signed integer using its two's-complement bit pattern.
pub fn write_i32(buf: &mut Vec<u8>, value: i32) {
    write_u32(buf, value as u32);
}

/// Appends a varint length prefix followed by `bytes`.
///
/// # Errors
///
/// Returns [`ProtocolError::PayloadTooLarge`] if `bytes` is longer than
/// [`MAX_COLLECTION_LEN`]; nothing is written in that case.
pub fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) -> Result<(), ProtocolError> {
    if bytes.len() > MAX_COLLECTION_LEN {
        return Err(ProtocolError::PayloadTooLarge {
            declared: bytes.len(),
            max: MAX_COLLECTION_LEN,
        });
    }
    write_u32(buf, bytes.len() as u32);
    buf.extend_from_slice(bytes);
    Ok(())
}

/// Appends `text` as length-prefixed UTF-8.
///
/// # Errors
///
/// Same as [`write_bytes`].
pub fn write_str(buf: &mut Vec<u8>, text: &str) -> Result<(), ProtocolError> {
    write_bytes(buf, text.as_bytes())
}

/// Appends a single-byte boolean.
pub fn write_bool(buf: &mut Vec<u8>, value: bool) {
    buf.push(u8::from(value));
}

/// Appends the IEEE-754 bits of `value`, little-endian.
pub fn write_f32(buf: &mut Vec<u8>, value: f32) {
    buf.extend_from_slice(&value.to_bits().to_le_bytes());
}

// ── Reading ───────────────────────────────────────────────────────────────────

/// Cursor over a byte slice that decodes the primitives written above.
///
/// Every read either advances the cursor or returns an error; a
/// [`ProtocolError::InsufficientData`] means the slice ended mid-value and the
/// caller may retry once more bytes have arrived.
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    /// Creates a reader positioned at the start of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Number of bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Number of bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Reads an unsigned base-128 varint.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::InsufficientData`] if the input ends mid-varint.
    /// - [`ProtocolError::VarintOverflow`] if the varint does not fit in 32 bits.
    pub fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        let mut result: u32 = 0;
        for i in 0..MAX_VARINT32_LEN {
            let byte = self.read_byte()?;
            let bits = u32::from(byte & 0x7F);
            if i == MAX_VARINT32_LEN - 1 && bits > 0x0F {
                return Err(ProtocolError::VarintOverflow);
            }
            result |= bits << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
        Err(ProtocolError::VarintOverflow)
    }

    /// Reads a signed integer written by [`write_i32`].
    ///
    /// # Errors
    ///
    /// Same as [`WireReader::read_u32`].
    pub fn read_i32(&mut self) -> Result<i32, ProtocolError> {
        self.read_u32().map(|v| v as i32)
    }

    /// Reads a length prefix and validates it against [`MAX_COLLECTION_LEN`].
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MalformedPayload`] for oversized lengths.
    pub fn read_len(&mut self) -> Result<usize, ProtocolError> {
        let len = self.read_u32()? as usize;
        if len > MAX_COLLECTION_LEN {
            return Err(ProtocolError::MalformedPayload(format!(
                "length {len} exceeds limit {MAX_COLLECTION_LEN}"
            )));
        }
        Ok(len)
    }

    /// Reads a length-prefixed byte string.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InsufficientData`] if the bytes have not all
    /// arrived yet, or [`ProtocolError::MalformedPayload`] for an oversized
    /// length.
    pub fn read_bytes(&mut self) -> Result<&'a [u8], ProtocolError> {
        let len = self.read_len()?;
        self.take(len)
    }

    /// Reads a length-prefixed UTF-8 string.
    ///
    /// # Errors
    ///
    /// Same as [`WireReader::read_bytes`], plus
    /// [`ProtocolError::MalformedPayload`] on invalid UTF-8.
    pub fn read_string(&mut self) -> Result<String, ProtocolError> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| ProtocolError::MalformedPayload(format!("invalid UTF-8: {e}")))
    }

    /// Reads a single-byte boolean; any non-zero value is `true`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InsufficientData`] at end of input.
    pub fn read_bool(&mut self) -> Result<bool, ProtocolError> {
        Ok(self.read_byte()? != 0)
    }

    /// Reads four little-endian bytes as an `f32`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InsufficientData`] if fewer than four bytes remain.
    pub fn read_f32(&mut self) -> Result<f32, ProtocolError> {
        let bytes = self.take(4)?;
        Ok(f32::from_bits(u32::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3],
        ])))
    }

    fn read_byte(&mut self) -> Result<u8, ProtocolError> {
        let byte = *self.buf.get(self.pos).ok_or(ProtocolError::InsufficientData {
            needed: self.pos + 1,
            available: self.buf.len(),
        })?;
        self.pos += 1;
        Ok(byte)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < len {
            return Err(ProtocolError::InsufficientData {
                needed: self.pos + len,
                available: self.buf.len(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
