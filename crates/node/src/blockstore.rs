//! Block sets: the main chain by hash, orphans by previous hash, and
//! checkpoints by height.

use std::collections::HashMap;

use spvd_consensus::constants::{BLOCK_DIFFICULTY_INTERVAL, BLOCK_UNKNOWN_HEIGHT};
use spvd_consensus::difficulty::HeaderInfo;
use spvd_consensus::{ChainParams, Hash256};
use spvd_log::{log_warn, ShortHash};
use spvd_primitives::MerkleBlock;

/// Bound on the orphan set; the oldest orphan is evicted beyond this.
const MAX_ORPHANS: usize = 100;

pub struct BlockStore {
    blocks: HashMap<Hash256, MerkleBlock>,
    /// Orphans keyed by their previous-block hash.
    orphans: HashMap<Hash256, MerkleBlock>,
    checkpoints: HashMap<u32, MerkleBlock>,
    last_block: Hash256,
    last_orphan: Option<Hash256>,
    genesis: Hash256,
}

fn checkpoint_block(
    height: u32,
    hash: Hash256,
    timestamp: u32,
    target: u32,
) -> MerkleBlock {
    MerkleBlock {
        block_hash: hash,
        timestamp,
        target,
        height,
        ..MerkleBlock::default()
    }
}

impl BlockStore {
    /// Seeds the checkpoint blocks, picks the initial tip (the most recent
    /// checkpoint at least a week older than `earliest_key_time`), and
    /// threads previously saved blocks back onto the chain.
    pub fn new(params: &ChainParams, earliest_key_time: u32, saved: Vec<MerkleBlock>) -> Self {
        let genesis = params.genesis_hash();
        let mut store = Self {
            blocks: HashMap::new(),
            orphans: HashMap::new(),
            checkpoints: HashMap::new(),
            last_block: genesis,
            last_orphan: None,
            genesis,
        };

        for (i, checkpoint) in params.checkpoints.iter().enumerate() {
            let block = checkpoint_block(
                checkpoint.height,
                checkpoint.hash,
                checkpoint.timestamp,
                checkpoint.target,
            );
            store.checkpoints.insert(checkpoint.height, block.clone());
            if i == 0 || checkpoint.timestamp + 7 * 24 * 60 * 60 < earliest_key_time {
                store.last_block = block.block_hash;
            }
            store.blocks.insert(block.block_hash, block);
        }

        // saved blocks are keyed as orphans by prev, then the chain after
        // the last difficulty transition is threaded back on
        let mut transition: Option<MerkleBlock> = None;
        for block in saved {
            if block.height == BLOCK_UNKNOWN_HEIGHT {
                log_warn!("discarding saved block with unknown height");
                continue;
            }
            if block.height % BLOCK_DIFFICULTY_INTERVAL == 0
                && transition
                    .as_ref()
                    .map_or(true, |best| block.height > best.height)
            {
                transition = Some(block.clone());
            }
            store.orphans.insert(block.prev_block, block);
        }

        let mut block = transition;
        while let Some(current) = block {
            store.orphans.remove(&current.prev_block);
            store.last_block = current.block_hash;
            let next = store.orphans.remove(&current.block_hash);
            store.blocks.insert(current.block_hash, current);
            block = next;
        }

        store
    }

    pub fn genesis_hash(&self) -> Hash256 {
        self.genesis
    }

    pub fn block(&self, hash: &Hash256) -> Option<&MerkleBlock> {
        self.blocks.get(hash)
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.blocks.contains_key(hash)
    }

    /// Inserts into the main set, returning a replaced instance (same hash).
    pub fn insert(&mut self, block: MerkleBlock) -> Option<MerkleBlock> {
        let old = self.blocks.insert(block.block_hash, block);
        if let Some(old) = &old {
            // the replaced instance may also sit in the orphan index
            let orphan_match = self
                .orphans
                .get(&old.prev_block)
                .is_some_and(|orphan| orphan.block_hash == old.block_hash);
            if orphan_match {
                self.orphans.remove(&old.prev_block);
            }
            if self.last_orphan == Some(old.block_hash) {
                self.last_orphan = None;
            }
        }
        old
    }

    pub fn tip(&self) -> &MerkleBlock {
        self.blocks
            .get(&self.last_block)
            .expect("tip block is always present")
    }

    pub fn tip_hash(&self) -> Hash256 {
        self.last_block
    }

    pub fn set_tip(&mut self, hash: Hash256) {
        debug_assert!(self.blocks.contains_key(&hash));
        self.last_block = hash;
    }

    pub fn checkpoint_at(&self, height: u32) -> Option<&MerkleBlock> {
        self.checkpoints.get(&height)
    }

    pub fn insert_orphan(&mut self, block: MerkleBlock) {
        if self.orphans.len() >= MAX_ORPHANS {
            // evict the oldest to bound memory
            if let Some(prev) = self
                .orphans
                .values()
                .min_by_key(|orphan| orphan.timestamp)
                .map(|orphan| orphan.prev_block)
            {
                let evicted = self.orphans.remove(&prev);
                if let Some(evicted) = evicted {
                    if self.last_orphan == Some(evicted.block_hash) {
                        self.last_orphan = None;
                    }
                }
            }
        }
        self.last_orphan = Some(block.block_hash);
        self.orphans.insert(block.prev_block, block);
    }

    /// Removes and returns the orphan whose parent is `prev`.
    pub fn take_orphan_with_prev(&mut self, prev: &Hash256) -> Option<MerkleBlock> {
        let orphan = self.orphans.remove(prev);
        if let Some(orphan) = &orphan {
            if self.last_orphan == Some(orphan.block_hash) {
                self.last_orphan = None;
            }
        }
        orphan
    }

    pub fn last_orphan_hash(&self) -> Option<Hash256> {
        self.last_orphan
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    pub fn clear_orphans(&mut self) {
        self.orphans.clear();
        self.last_orphan = None;
    }

    /// Block locator for getblocks/getheaders: the 10 most recent hashes,
    /// then doubling the step back, finishing with genesis.
    pub fn locators(&self) -> Vec<Hash256> {
        let mut locators = Vec::new();
        let mut block = Some(self.tip());
        let mut step = 1usize;

        while let Some(current) = block {
            if current.height == 0 {
                break;
            }
            locators.push(current.block_hash);
            if locators.len() >= 10 {
                step *= 2;
            }
            let mut walk = Some(current);
            for _ in 0..step {
                walk = walk.and_then(|b| self.blocks.get(&b.prev_block));
                if walk.is_none() {
                    break;
                }
            }
            block = walk;
        }

        locators.push(self.genesis);
        locators
    }

    /// Checks the parent link, the difficulty transition (evicting
    /// non-boundary blocks below the transition once found), and the
    /// checkpoint table.
    pub fn verify_block(
        &mut self,
        block: &MerkleBlock,
        prev: &MerkleBlock,
        params: &ChainParams,
    ) -> bool {
        if block.prev_block != prev.block_hash || block.height != prev.height + 1 {
            return false;
        }

        let mut transition = None;
        if block.height % BLOCK_DIFFICULTY_INTERVAL == 0 {
            // find the block that opened this difficulty window
            let mut b = Some(block);
            for _ in 0..BLOCK_DIFFICULTY_INTERVAL {
                b = b.and_then(|current| self.blocks.get(&current.prev_block));
            }
            let Some(found) = b else {
                log_warn!(
                    "missing previous difficulty transition, can't verify block {} at height {}",
                    ShortHash(&block.block_hash),
                    block.height
                );
                return false;
            };
            transition = Some(HeaderInfo {
                height: found.height,
                time: found.timestamp,
                bits: found.target,
            });

            // free up memory below the transition
            let mut prev_hash = found.prev_block;
            loop {
                let Some(current) = self.blocks.get(&prev_hash) else {
                    break;
                };
                let current_hash = current.block_hash;
                let current_height = current.height;
                let next_prev = current.prev_block;
                if current_height % BLOCK_DIFFICULTY_INTERVAL != 0 {
                    self.blocks.remove(&current_hash);
                }
                prev_hash = next_prev;
            }
        }

        let block_info = HeaderInfo {
            height: block.height,
            time: block.timestamp,
            bits: block.target,
        };
        let prev_info = HeaderInfo {
            height: prev.height,
            time: prev.timestamp,
            bits: prev.target,
        };
        if !(params.verify_difficulty)(&block_info, &prev_info, transition.as_ref()) {
            log_warn!(
                "block {} has invalid difficulty target {:#x} at height {}",
                ShortHash(&block.block_hash),
                block.target,
                block.height
            );
            return false;
        }

        if let Some(checkpoint) = self.checkpoints.get(&block.height) {
            if checkpoint.block_hash != block.block_hash {
                log_warn!(
                    "block {} at height {} differs from checkpoint {}",
                    ShortHash(&block.block_hash),
                    block.height,
                    ShortHash(&checkpoint.block_hash)
                );
                return false;
            }
        }

        true
    }

    /// Walks from `from` back through the chain, collecting up to `count`
    /// blocks, then truncates so the batch starts at a difficulty-interval
    /// boundary.
    pub fn save_batch(&self, from: &Hash256, count: usize) -> Vec<MerkleBlock> {
        let mut batch = Vec::new();
        let mut block = self.blocks.get(from);
        while let Some(current) = block {
            if batch.len() >= count {
                break;
            }
            batch.push(current.clone());
            block = self.blocks.get(&current.prev_block);
        }

        if let Some(oldest) = batch.last() {
            let offset = (oldest.height % BLOCK_DIFFICULTY_INTERVAL) as usize;
            if offset > 0 {
                let len = batch.len();
                let keep = len.saturating_sub((BLOCK_DIFFICULTY_INTERVAL as usize - offset).min(len));
                batch.truncate(keep);
            }
        }
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spvd_consensus::{chain_params, Network};

    fn hash(tag: u8) -> Hash256 {
        let mut out = [0u8; 32];
        out[0] = tag;
        out[31] = 0xee;
        out
    }

    fn block_at(height: u32, hash_tag: u8, prev: Hash256) -> MerkleBlock {
        MerkleBlock {
            block_hash: hash(hash_tag),
            prev_block: prev,
            timestamp: 1_300_000_000 + height * 600,
            target: 0x1d00ffff,
            height,
            ..MerkleBlock::default()
        }
    }

    #[test]
    fn seeds_checkpoints_and_picks_tip() {
        let params = chain_params(Network::Mainnet);
        // a key created long ago starts from an early checkpoint
        let store = BlockStore::new(&params, 1_232_000_000, Vec::new());
        assert_eq!(store.tip().height, 0);

        // a recent key starts from the newest checkpoint
        let store = BlockStore::new(&params, 2_000_000_000, Vec::new());
        assert_eq!(
            store.tip().height,
            params.last_checkpoint().height
        );
    }

    #[test]
    fn locator_steps_double_after_ten() {
        let params = chain_params(Network::Mainnet);
        let mut store = BlockStore::new(&params, 1_232_000_000, Vec::new());

        let mut prev = store.tip_hash();
        for i in 1..=40u8 {
            let block = block_at(i as u32, i, prev);
            prev = block.block_hash;
            store.insert(block);
        }
        store.set_tip(prev);

        let locators = store.locators();
        // 10 recent + doubling steps + genesis terminator
        assert_eq!(locators[0], store.tip_hash());
        assert_eq!(*locators.last().unwrap(), params.genesis_hash());
        assert!(locators.len() < 40);
        // heights of the first 10 locators descend by one
        for (offset, locator) in locators.iter().take(10).enumerate() {
            assert_eq!(store.block(locator).unwrap().height, 40 - offset as u32);
        }
    }

    #[test]
    fn orphan_cap_evicts_oldest() {
        let params = chain_params(Network::Mainnet);
        let mut store = BlockStore::new(&params, 1_232_000_000, Vec::new());

        for i in 0..110u32 {
            let mut orphan = block_at(1000 + i, 0, hash((i % 250) as u8));
            orphan.block_hash = spvd_primitives::sha256d(&i.to_le_bytes());
            orphan.prev_block = spvd_primitives::sha256d(&(i + 1000).to_le_bytes());
            orphan.timestamp = 1_300_000_000 + i;
            store.insert_orphan(orphan);
        }
        assert!(store.orphan_count() <= MAX_ORPHANS);
    }

    #[test]
    fn verify_block_rejects_broken_link() {
        let params = chain_params(Network::Mainnet);
        let mut store = BlockStore::new(&params, 1_232_000_000, Vec::new());
        let genesis = store.tip().clone();

        let good = block_at(1, 1, genesis.block_hash);
        assert!(store.verify_block(&good, &genesis, &params));

        let mut bad_height = good.clone();
        bad_height.height = 5;
        assert!(!store.verify_block(&bad_height, &genesis, &params));

        let mut bad_prev = good;
        bad_prev.prev_block = hash(0x99);
        assert!(!store.verify_block(&bad_prev, &genesis, &params));
    }

    #[test]
    fn verify_block_rejects_checkpoint_mismatch() {
        use spvd_consensus::params::Checkpoint;

        // custom params with a checkpoint at a non-retarget height
        let mut params = chain_params(Network::Mainnet);
        params.checkpoints.truncate(1);
        params.checkpoints.push(Checkpoint {
            height: 5,
            hash: hash(0x55),
            timestamp: 1_300_003_000,
            target: 0x1d00ffff,
        });
        params.verify_difficulty = |_, _, _| true;

        let mut store = BlockStore::new(&params, 1_232_000_000, Vec::new());
        let parent = block_at(4, 2, hash(1));
        store.insert(parent.clone());

        let impostor = block_at(5, 3, parent.block_hash);
        assert!(!store.verify_block(&impostor, &parent, &params));

        // the true checkpoint block passes
        let mut genuine = block_at(5, 0x55, parent.block_hash);
        genuine.block_hash = hash(0x55);
        assert!(store.verify_block(&genuine, &parent, &params));
    }

    #[test]
    fn save_batch_starts_at_interval_boundary() {
        let params = chain_params(Network::Mainnet);
        let mut store = BlockStore::new(&params, 2_000_000_000, Vec::new());
        let start = store.tip().height; // a checkpoint, multiple of 20160

        let mut prev = store.tip_hash();
        for i in 1..=10u8 {
            let block = block_at(start + i as u32, i, prev);
            prev = block.block_hash;
            store.insert(block);
        }
        store.set_tip(prev);

        // a batch reaching back to the boundary checkpoint stays intact
        let batch = store.save_batch(&prev, 11);
        assert_eq!(batch.len(), 11);
        assert_eq!(batch[0].height, start + 10);
        assert_eq!(batch.last().unwrap().height % BLOCK_DIFFICULTY_INTERVAL, 0);

        // a batch that cannot be aligned to a boundary is dropped entirely
        let batch = store.save_batch(&prev, 5);
        assert!(batch.is_empty());
    }
}
