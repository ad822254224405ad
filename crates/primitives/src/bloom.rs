//! BIP37 bloom filter, sized from a target false-positive rate.

use spvd_consensus::constants::{BLOOM_MAX_FILTER_LENGTH, BLOOM_MAX_HASH_FUNCS};

use crate::hash::murmur3_32;
use crate::wire::WireWriter;

const BLOOM_SEED_STEP: u32 = 0xfba4_c795;

#[derive(Clone, Debug)]
pub struct BloomFilter {
    filter: Vec<u8>,
    hash_funcs: u32,
    tweak: u32,
    flags: u8,
}

impl BloomFilter {
    /// `fp_rate` is the acceptable false-positive rate, `element_count` the
    /// expected number of inserted elements, `tweak` a per-peer nonce.
    pub fn new(fp_rate: f64, element_count: usize, tweak: u32, flags: u8) -> Self {
        let ln2 = std::f64::consts::LN_2;
        let length = if fp_rate < f64::EPSILON {
            BLOOM_MAX_FILTER_LENGTH as f64
        } else {
            (-1.0 / (ln2 * ln2)) * element_count.max(1) as f64 * fp_rate.ln() / 8.0
        };
        let length = (length as usize).clamp(1, BLOOM_MAX_FILTER_LENGTH);

        let hash_funcs = ((length as f64 * 8.0) / element_count.max(1) as f64 * ln2) as u32;
        let hash_funcs = hash_funcs.clamp(1, BLOOM_MAX_HASH_FUNCS);

        Self {
            filter: vec![0u8; length],
            hash_funcs,
            tweak,
            flags,
        }
    }

    fn bit_index(&self, data: &[u8], hash_num: u32) -> usize {
        let seed = hash_num.wrapping_mul(BLOOM_SEED_STEP).wrapping_add(self.tweak);
        murmur3_32(data, seed) as usize % (self.filter.len() * 8)
    }

    pub fn insert_data(&mut self, data: &[u8]) {
        for hash_num in 0..self.hash_funcs {
            let index = self.bit_index(data, hash_num);
            self.filter[index / 8] |= 1 << (index % 8);
        }
    }

    pub fn contains_data(&self, data: &[u8]) -> bool {
        (0..self.hash_funcs).all(|hash_num| {
            let index = self.bit_index(data, hash_num);
            self.filter[index / 8] & (1 << (index % 8)) != 0
        })
    }

    /// The filterload message payload.
    pub fn serialize(&self) -> Vec<u8> {
        let mut writer = WireWriter::with_capacity(self.filter.len() + 10);
        writer.write_var_bytes(&self.filter);
        writer.write_u32_le(self.hash_funcs);
        writer.write_u32_le(self.tweak);
        writer.write_u8(self.flags);
        writer.into_bytes()
    }

    pub fn len(&self) -> usize {
        self.filter.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filter.iter().all(|byte| *byte == 0)
    }
}
