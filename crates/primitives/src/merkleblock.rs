//! Block header plus partial merkle tree, as relayed to filtered clients.

use spvd_consensus::constants::{BLOCK_MAX_TIME_DRIFT, BLOCK_UNKNOWN_HEIGHT};
use spvd_consensus::difficulty::hash_meets_target;
use spvd_consensus::Hash256;

use crate::hash::sha256d;
use crate::wire::{DecodeError, WireReader, WireWriter};

const MAX_TX_PER_BLOCK: u32 = (0x0200_0000 / 60) as u32;

#[derive(Clone, Debug)]
pub struct MerkleBlock {
    pub block_hash: Hash256,
    pub version: u32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub timestamp: u32,
    pub target: u32,
    pub nonce: u32,
    pub total_tx: u32,
    pub hashes: Vec<Hash256>,
    pub flags: Vec<u8>,
    pub height: u32,
}

impl PartialEq for MerkleBlock {
    fn eq(&self, other: &Self) -> bool {
        self.block_hash == other.block_hash
    }
}

impl Eq for MerkleBlock {}

impl Default for MerkleBlock {
    fn default() -> Self {
        Self {
            block_hash: [0u8; 32],
            version: 0,
            prev_block: [0u8; 32],
            merkle_root: [0u8; 32],
            timestamp: 0,
            target: 0,
            nonce: 0,
            total_tx: 0,
            hashes: Vec::new(),
            flags: Vec::new(),
            height: BLOCK_UNKNOWN_HEIGHT,
        }
    }
}

impl MerkleBlock {
    /// Decodes a merkle block, or a bare 80-byte header (total_tx stays 0).
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = WireReader::new(buf);
        let block_hash = sha256d(reader.peek(80)?);

        let mut block = MerkleBlock {
            block_hash,
            version: reader.read_u32_le()?,
            prev_block: reader.read_hash()?,
            merkle_root: reader.read_hash()?,
            timestamp: reader.read_u32_le()?,
            target: reader.read_u32_le()?,
            nonce: reader.read_u32_le()?,
            ..MerkleBlock::default()
        };

        if !reader.is_empty() {
            block.total_tx = reader.read_u32_le()?;
            if block.total_tx > MAX_TX_PER_BLOCK {
                return Err(DecodeError::Malformed("too many transactions in block"));
            }
            let hash_count = reader.read_varint()? as usize;
            if hash_count > block.total_tx as usize {
                return Err(DecodeError::Malformed("too many hashes in merkle tree"));
            }
            block.hashes.reserve(hash_count);
            for _ in 0..hash_count {
                block.hashes.push(reader.read_hash()?);
            }
            block.flags = reader.read_var_bytes()?;
        }

        Ok(block)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut writer = WireWriter::with_capacity(84 + self.hashes.len() * 32 + self.flags.len());
        writer.write_u32_le(self.version);
        writer.write_hash(&self.prev_block);
        writer.write_hash(&self.merkle_root);
        writer.write_u32_le(self.timestamp);
        writer.write_u32_le(self.target);
        writer.write_u32_le(self.nonce);
        if self.total_tx > 0 {
            writer.write_u32_le(self.total_tx);
            writer.write_varint(self.hashes.len() as u64);
            for hash in &self.hashes {
                writer.write_hash(hash);
            }
            writer.write_var_bytes(&self.flags);
        }
        writer.into_bytes()
    }

    /// The tx hashes the partial merkle tree marks as filter matches.
    /// Malformed trees yield an empty list.
    pub fn matched_tx_hashes(&self) -> Vec<Hash256> {
        let mut matches = Vec::new();
        self.extract_root(&mut matches);
        matches
    }

    pub fn contains_tx_hash(&self, hash: &Hash256) -> bool {
        self.hashes.contains(hash)
    }

    /// Validates the partial merkle tree against the header root, the
    /// proof-of-work target, and the permitted timestamp drift. Transaction
    /// validity is not (and cannot be) checked here.
    pub fn is_valid(&self, current_time: u32) -> bool {
        if self.total_tx > 0 {
            let mut matches = Vec::new();
            match self.extract_root(&mut matches) {
                Some(root) if root == self.merkle_root => {}
                _ => return false,
            }
        }
        if self.timestamp > current_time.saturating_add(BLOCK_MAX_TIME_DRIFT) {
            return false;
        }
        hash_meets_target(&self.block_hash, self.target)
    }

    fn flag_bit(&self, index: usize) -> Option<bool> {
        let byte = self.flags.get(index / 8)?;
        Some(byte & (1 << (index % 8)) != 0)
    }

    fn tree_width(&self, height: u32) -> u32 {
        let shift = 1u64.checked_shl(height).unwrap_or(0);
        if shift == 0 {
            return 0;
        }
        let width = (self.total_tx as u64 + shift - 1) >> height;
        u32::try_from(width).unwrap_or(u32::MAX)
    }

    fn tree_height(&self) -> u32 {
        let mut height = 0u32;
        while self.tree_width(height) > 1 {
            height += 1;
        }
        height
    }

    /// Walks the flag bits and hashes, collecting matched leaves, and returns
    /// the reconstructed root. None when the tree is malformed or not fully
    /// consumed.
    fn extract_root(&self, matches: &mut Vec<Hash256>) -> Option<Hash256> {
        matches.clear();
        if self.total_tx == 0 || self.hashes.len() > self.total_tx as usize {
            return None;
        }

        let mut bits_used = 0usize;
        let mut hashes_used = 0usize;
        let root = self.walk(
            self.tree_height(),
            0,
            &mut bits_used,
            &mut hashes_used,
            matches,
        )?;

        // every flag byte and every hash must be consumed
        if (bits_used + 7) / 8 != self.flags.len() || hashes_used != self.hashes.len() {
            return None;
        }
        Some(root)
    }

    fn walk(
        &self,
        height: u32,
        pos: u32,
        bits_used: &mut usize,
        hashes_used: &mut usize,
        matches: &mut Vec<Hash256>,
    ) -> Option<Hash256> {
        let parent_of_match = self.flag_bit(*bits_used)?;
        *bits_used += 1;

        if height == 0 || !parent_of_match {
            let hash = *self.hashes.get(*hashes_used)?;
            *hashes_used += 1;
            if height == 0 && parent_of_match {
                matches.push(hash);
            }
            return Some(hash);
        }

        let left = self.walk(height - 1, pos * 2, bits_used, hashes_used, matches)?;
        let right = if pos * 2 + 1 < self.tree_width(height - 1) {
            let right = self.walk(height - 1, pos * 2 + 1, bits_used, hashes_used, matches)?;
            // identical subtrees would allow hash duplication attacks
            if right == left {
                return None;
            }
            right
        } else {
            left
        };

        let mut buf = [0u8; 64];
        buf[..32].copy_from_slice(&left);
        buf[32..].copy_from_slice(&right);
        Some(sha256d(&buf))
    }
}

/// Builds the partial merkle tree for a list of txids and match flags.
/// The inverse of [`MerkleBlock::matched_tx_hashes`]; used by tests to
/// fabricate relayed blocks.
pub fn build_partial_tree(txids: &[Hash256], matched: &[bool]) -> (Vec<Hash256>, Vec<u8>) {
    assert_eq!(txids.len(), matched.len());
    let total = txids.len() as u32;
    let mut height = 0u32;
    while width(total, height) > 1 {
        height += 1;
    }

    let mut bits = Vec::new();
    let mut hashes = Vec::new();
    build_walk(txids, matched, total, height, 0, &mut bits, &mut hashes);

    let mut flags = vec![0u8; (bits.len() + 7) / 8];
    for (i, bit) in bits.iter().enumerate() {
        if *bit {
            flags[i / 8] |= 1 << (i % 8);
        }
    }
    (hashes, flags)
}

fn width(total: u32, height: u32) -> u32 {
    (total + (1 << height) - 1) >> height
}

fn subtree_hash(txids: &[Hash256], total: u32, height: u32, pos: u32) -> Hash256 {
    if height == 0 {
        return txids[pos as usize];
    }
    let left = subtree_hash(txids, total, height - 1, pos * 2);
    let right = if pos * 2 + 1 < width(total, height - 1) {
        subtree_hash(txids, total, height - 1, pos * 2 + 1)
    } else {
        left
    };
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(&left);
    buf[32..].copy_from_slice(&right);
    sha256d(&buf)
}

fn build_walk(
    txids: &[Hash256],
    matched: &[bool],
    total: u32,
    height: u32,
    pos: u32,
    bits: &mut Vec<bool>,
    hashes: &mut Vec<Hash256>,
) {
    let start = (pos as u64) << height;
    let end = ((pos as u64 + 1) << height).min(total as u64);
    let parent_of_match = (start..end).any(|i| matched[i as usize]);
    bits.push(parent_of_match);

    if height == 0 || !parent_of_match {
        hashes.push(subtree_hash(txids, total, height, pos));
        return;
    }

    build_walk(txids, matched, total, height - 1, pos * 2, bits, hashes);
    if pos * 2 + 1 < width(total, height - 1) {
        build_walk(txids, matched, total, height - 1, pos * 2 + 1, bits, hashes);
    }
}
