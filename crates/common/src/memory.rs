use std::ops::Range;

use byteorder::{ByteOrder, LittleEndian};

/// Flat byte-addressed memory.
///
/// Accesses are not bounds checked against a stack region. Bytes that fall
/// outside the buffer are dropped on write and read back as zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Memory {
    bytes: Vec<u8>,
}

impl Memory {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: vec![0; size],
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Bytes in `range`, clamped to the buffer.
    pub fn window(&self, range: Range<usize>) -> &[u8] {
        let end = range.end.min(self.bytes.len());
        let start = range.start.min(end);
        &self.bytes[start..end]
    }

    pub fn read_byte(&self, address: u32) -> u8 {
        self.bytes.get(address as usize).copied().unwrap_or(0)
    }

    pub fn write_byte(&mut self, address: u32, value: u8) {
        if let Some(byte) = self.bytes.get_mut(address as usize) {
            *byte = value;
        }
    }

    /// Loads a little-endian word.
    pub fn read_u32(&self, address: u32) -> u32 {
        let start = address as usize;
        match self.bytes.get(start..start.saturating_add(4)) {
            Some(word) => LittleEndian::read_u32(word),
            None => {
                let mut word = [0; 4];
                for (offset, byte) in word.iter_mut().enumerate() {
                    *byte = self.read_byte(address.wrapping_add(offset as u32));
                }
                LittleEndian::read_u32(&word)
            }
        }
    }

    /// Stores a little-endian word.
    pub fn write_u32(&mut self, address: u32, value: u32) {
        let start = address as usize;
        match self.bytes.get_mut(start..start.saturating_add(4)) {
            Some(word) => LittleEndian::write_u32(word, value),
            None => {
                let mut word = [0; 4];
                LittleEndian::write_u32(&mut word, value);
                for (offset, byte) in word.into_iter().enumerate() {
                    self.write_byte(address.wrapping_add(offset as u32), byte);
                }
            }
        }
    }
}
