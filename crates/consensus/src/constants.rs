//! Normative protocol and policy constants.

pub const TX_VERSION: u32 = 1;
pub const TX_LOCKTIME: u32 = 0;

// sighash flags
pub const SIGHASH_ALL: u32 = 0x01;
pub const SIGHASH_NONE: u32 = 0x02;
pub const SIGHASH_SINGLE: u32 = 0x03;
pub const SIGHASH_FORKID: u32 = 0x40;
pub const SIGHASH_ANYONECANPAY: u32 = 0x80;

/// Standard tx fee per kb of tx size, rounded up to the nearest kb.
pub const TX_FEE_PER_KB: u64 = 1000;
/// Estimated size for a typical transaction output.
pub const TX_OUTPUT_SIZE: usize = 34;
/// Estimated size for a typical compact-pubkey transaction input.
pub const TX_INPUT_SIZE: usize = 148;
/// No tx output can be below this amount.
pub const TX_MIN_OUTPUT_AMOUNT: u64 =
    TX_FEE_PER_KB * 3 * (TX_OUTPUT_SIZE as u64 + TX_INPUT_SIZE as u64) / 1000;
/// No tx can be larger than this size in bytes.
pub const TX_MAX_SIZE: usize = 100_000;
/// A tx must not be larger than this without a fee.
pub const TX_FREE_MAX_SIZE: usize = 1000;
/// A tx must not have a priority below this without a fee.
pub const TX_FREE_MIN_PRIORITY: u64 = 57_600_000;
/// Block height indicating an unconfirmed transaction.
pub const TX_UNCONFIRMED: u32 = i32::MAX as u32;
/// A lockTime below this value is a block height, otherwise a timestamp.
pub const TX_MAX_LOCK_HEIGHT: u32 = 500_000_000;

/// Sequence number for a finalized tx input.
pub const TXIN_SEQUENCE: u32 = u32::MAX;

pub const SATOSHIS: u64 = 100_000_000;
pub const MAX_MONEY: u64 = 84_000_000 * SATOSHIS;

pub const DEFAULT_FEE_PER_KB: u64 = TX_FEE_PER_KB;
pub const MIN_FEE_PER_KB: u64 = TX_FEE_PER_KB;
/// Slightly higher than a satoshi-per-byte rate.
pub const MAX_FEE_PER_KB: u64 = 46_000;

pub const PEER_MAX_CONNECTIONS: usize = 3;
pub const MAX_CONNECT_FAILURES: u32 = 20;
/// Seconds to wait before a peer protocol request is considered timed out.
pub const PROTOCOL_TIMEOUT: f64 = 20.0;

pub const SERVICES_NODE_NETWORK: u64 = 0x01;
pub const SERVICES_NODE_BLOOM: u64 = 0x04;

pub const SEQUENCE_EXTERNAL_CHAIN: u32 = 0;
pub const SEQUENCE_INTERNAL_CHAIN: u32 = 1;
pub const SEQUENCE_GAP_LIMIT_EXTERNAL: u32 = 10;
pub const SEQUENCE_GAP_LIMIT_INTERNAL: u32 = 5;

pub const BLOCK_DIFFICULTY_INTERVAL: u32 = 2016;
/// Height of a block restored without height information.
pub const BLOCK_UNKNOWN_HEIGHT: u32 = u32::MAX;
pub const BLOCK_MAX_TIME_DRIFT: u32 = 2 * 60 * 60;

pub const TARGET_TIMESPAN: u32 = 14 * 24 * 60 * 60;
/// Highest legal proof-of-work target, in compact form.
pub const MAX_PROOF_OF_WORK: u32 = 0x1d00ffff;

pub const BLOOM_DEFAULT_FALSEPOSITIVE_RATE: f64 = 0.0005;
pub const BLOOM_REDUCED_FALSEPOSITIVE_RATE: f64 = 0.00005;
pub const BLOOM_UPDATE_NONE: u8 = 0;
pub const BLOOM_UPDATE_ALL: u8 = 1;
pub const BLOOM_UPDATE_P2PUBKEY_ONLY: u8 = 2;
pub const BLOOM_MAX_FILTER_LENGTH: usize = 36_000;
pub const BLOOM_MAX_HASH_FUNCS: u32 = 50;

/// reject message code for a double-spent input.
pub const REJECT_SPENT: u8 = 0x12;
