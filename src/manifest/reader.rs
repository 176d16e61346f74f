use std::io::Read;

use flate2::read::ZlibDecoder;
use sha1::{Digest, Sha1};

use crate::errors::{EngineError, Result};

/// Cursor over a borrowed byte slice with the little-endian reads the
/// manifest wire format is built from.
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn seek(&mut self, pos: usize) {
        self.pos = pos.min(self.data.len());
    }

    /// Reject a declared element count that cannot fit in the remaining
    /// input. Runs before any allocation is sized from the count, so a
    /// malformed block fails with a format error instead of an OOM.
    pub fn check_count(&self, count: usize, min_element_size: usize) -> Result<()> {
        match count.checked_mul(min_element_size) {
            Some(needed) if needed <= self.remaining() => Ok(()),
            _ => Err(EngineError::Format(format!(
                "declared count {} needs at least {} bytes each, have {}",
                count,
                min_element_size,
                self.remaining()
            ))),
        }
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(count)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                EngineError::Format(format!(
                    "unexpected end of buffer: need {} bytes at offset {}, have {}",
                    count,
                    self.pos,
                    self.remaining()
                ))
            })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let bytes = self.read_bytes(8)?;
        let mut raw = [0_u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(raw))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(self.read_u64()? as i64)
    }

    pub fn read_guid(&mut self) -> Result<[u32; 4]> {
        Ok([
            self.read_u32()?,
            self.read_u32()?,
            self.read_u32()?,
            self.read_u32()?,
        ])
    }

    pub fn read_sha1(&mut self) -> Result<[u8; 20]> {
        let bytes = self.read_bytes(20)?;
        let mut hash = [0_u8; 20];
        hash.copy_from_slice(bytes);
        Ok(hash)
    }

    /// Length-prefixed string. A positive prefix is `len - 1` single-byte
    /// characters plus a NUL; a negative prefix is UTF-16LE, `(-len) * 2`
    /// bytes including the two-byte terminator; zero is the empty string.
    pub fn read_fstring(&mut self) -> Result<String> {
        let length = self.read_i32()?;
        if length == 0 {
            return Ok(String::new());
        }

        if length > 0 {
            let raw = self.read_bytes(length as usize).map_err(|_| {
                EngineError::Format(format!("malformed string: declared length {length}"))
            })?;
            let text = &raw[..raw.len() - 1];
            return Ok(String::from_utf8_lossy(text).into_owned());
        }

        let byte_count = (-(length as i64) as usize)
            .checked_mul(2)
            .ok_or_else(|| EngineError::Format(format!("malformed string: length {length}")))?;
        let raw = self.read_bytes(byte_count).map_err(|_| {
            EngineError::Format(format!("malformed string: declared length {length}"))
        })?;
        let code_units: Vec<u16> = raw[..byte_count - 2]
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Ok(String::from_utf16_lossy(&code_units))
    }
}

pub fn inflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|err| EngineError::Decompression(err.to_string()))?;
    Ok(out)
}

pub fn sha1_digest(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

pub fn sha1_hex(data: &[u8]) -> String {
    hex::encode(sha1_digest(data))
}

pub fn guid_hex(guid: &[u32; 4]) -> String {
    format!(
        "{:08X}{:08X}{:08X}{:08X}",
        guid[0], guid[1], guid[2], guid[3]
    )
}

/// Writer counterpart used by the encode paths and by tests. Mirrors the
/// reader's field layouts; always little-endian.
#[derive(Default)]
pub struct ByteWriter {
    data: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.data.push(value);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i32(&mut self, value: i32) {
        self.write_u32(value as u32);
    }

    pub fn write_u64(&mut self, value: u64) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.write_u64(value as u64);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn write_guid(&mut self, guid: &[u32; 4]) {
        for word in guid {
            self.write_u32(*word);
        }
    }

    pub fn write_fstring(&mut self, value: &str) {
        if value.is_empty() {
            self.write_i32(0);
            return;
        }
        if value.is_ascii() {
            self.write_i32(value.len() as i32 + 1);
            self.write_bytes(value.as_bytes());
            self.write_u8(0);
        } else {
            let units: Vec<u16> = value.encode_utf16().collect();
            self.write_i32(-(units.len() as i32 + 1));
            for unit in units {
                self.data.extend_from_slice(&unit.to_le_bytes());
            }
            self.write_bytes(&[0, 0]);
        }
    }

    /// Patch a previously written little-endian u32 in place.
    pub fn patch_u32(&mut self, offset: usize, value: u32) {
        self.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }
}
