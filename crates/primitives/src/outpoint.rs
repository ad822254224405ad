//! Transaction outpoint, doubling as the wallet's UTXO reference.

use spvd_consensus::Hash256;

use crate::wire::{DecodeError, WireReader, WireWriter};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct OutPoint {
    pub hash: Hash256,
    pub index: u32,
}

impl OutPoint {
    pub fn new(hash: Hash256, index: u32) -> Self {
        Self { hash, index }
    }

    pub fn encode(&self, writer: &mut WireWriter) {
        writer.write_hash(&self.hash);
        writer.write_u32_le(self.index);
    }

    pub fn decode(reader: &mut WireReader) -> Result<Self, DecodeError> {
        let hash = reader.read_hash()?;
        let index = reader.read_u32_le()?;
        Ok(Self { hash, index })
    }

    /// The 36-byte hash-then-index form inserted into bloom filters.
    pub fn to_bytes(self) -> [u8; 36] {
        let mut out = [0u8; 36];
        out[..32].copy_from_slice(&self.hash);
        out[32..].copy_from_slice(&self.index.to_le_bytes());
        out
    }
}
