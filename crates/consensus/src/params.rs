//! Per-network chain parameter tables.

use crate::constants::SERVICES_NODE_NETWORK;
use crate::difficulty::{verify_retarget, HeaderInfo};
use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Checkpoint {
    pub height: u32,
    /// Block hash in internal little-endian order.
    pub hash: Hash256,
    pub timestamp: u32,
    pub target: u32,
}

pub type DifficultyVerifier = fn(&HeaderInfo, &HeaderInfo, Option<&HeaderInfo>) -> bool;

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub magic: u32,
    pub standard_port: u16,
    /// Service bits a peer must advertise beyond NODE_NETWORK/NODE_BLOOM.
    pub services: u64,
    pub dns_seeds: Vec<&'static str>,
    pub checkpoints: Vec<Checkpoint>,
    pub verify_difficulty: DifficultyVerifier,
}

impl ChainParams {
    pub fn genesis_hash(&self) -> Hash256 {
        self.checkpoints[0].hash
    }

    pub fn last_checkpoint(&self) -> &Checkpoint {
        self.checkpoints
            .last()
            .expect("chain params carry at least the genesis checkpoint")
    }
}

#[derive(Debug)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

/// Parses display-order (big-endian) hex into an internal little-endian hash.
pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let hex = input.trim();
    if hex.len() != 64 {
        return Err(HexError::InvalidLength);
    }

    let mut bytes = [0u8; 32];
    for (i, byte_out) in bytes.iter_mut().enumerate() {
        let start = i * 2;
        *byte_out =
            u8::from_str_radix(&hex[start..start + 2], 16).map_err(|_| HexError::InvalidHex)?;
    }
    bytes.reverse();
    Ok(bytes)
}

fn checkpoint(height: u32, hash: &str, timestamp: u32, target: u32) -> Checkpoint {
    Checkpoint {
        height,
        hash: hash256_from_hex(hash).expect("static checkpoint hash"),
        timestamp,
        target,
    }
}

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Mainnet => mainnet_params(),
        Network::Testnet => testnet_params(),
    }
}

fn mainnet_params() -> ChainParams {
    ChainParams {
        network: Network::Mainnet,
        magic: 0xd9b4_bef9,
        standard_port: 8333,
        services: SERVICES_NODE_NETWORK,
        dns_seeds: vec![
            "seed.bitcoin.sipa.be",
            "dnsseed.bluematt.me",
            "dnsseed.bitcoin.dashjr.org",
            "seed.bitcoinstats.com",
            "bitseed.xf2.org",
            "seed.bitcoin.jonasschnelli.ch",
        ],
        checkpoints: vec![
            checkpoint(
                0,
                "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f",
                1231006505,
                0x1d00ffff,
            ),
            checkpoint(
                20160,
                "000000000f1aef56190aee63d33a373e6487132d522ff4cd98ccfc96566d461e",
                1248481816,
                0x1d00ffff,
            ),
            checkpoint(
                40320,
                "0000000045861e169b5a961b7034f8de9e98022e7a39100dde3ae3ea240d7245",
                1266191579,
                0x1c654657,
            ),
            checkpoint(
                60480,
                "000000000632e22ce73ed38f46d5b408ff1cff2cc9e10daaf437dfd655153837",
                1276298786,
                0x1c0eba64,
            ),
            checkpoint(
                80640,
                "0000000000307c80b87edf9f6a0697e2f01db67e518c8a4d6065d1d859a3a659",
                1284861847,
                0x1b4766ed,
            ),
            checkpoint(
                100800,
                "000000000000e383d43cc471c64a9a4a46794026989ef4ff9611d5acb704e47a",
                1294031411,
                0x1b0404cb,
            ),
        ],
        verify_difficulty: mainnet_verify_difficulty,
    }
}

fn testnet_params() -> ChainParams {
    ChainParams {
        network: Network::Testnet,
        magic: 0x0709_110b,
        standard_port: 18333,
        services: SERVICES_NODE_NETWORK,
        dns_seeds: vec![
            "testnet-seed.bitcoin.jonasschnelli.ch",
            "seed.tbtc.petertodd.org",
            "testnet-seed.bluematt.me",
        ],
        checkpoints: vec![checkpoint(
            0,
            "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943",
            1296688602,
            0x1d00ffff,
        )],
        verify_difficulty: testnet_verify_difficulty,
    }
}

fn mainnet_verify_difficulty(
    block: &HeaderInfo,
    prev: &HeaderInfo,
    transition: Option<&HeaderInfo>,
) -> bool {
    verify_retarget(block, prev, transition)
}

// testnet allows minimum-difficulty blocks after a 20 minute gap, so target
// transitions can't be validated from header context alone
fn testnet_verify_difficulty(
    _block: &HeaderInfo,
    _prev: &HeaderInfo,
    _transition: Option<&HeaderInfo>,
) -> bool {
    true
}
