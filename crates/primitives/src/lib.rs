//! Transaction, address, and merkle-proof primitives with consensus
//! serialization.

pub mod address;
pub mod bloom;
pub mod hash;
pub mod keys;
pub mod merkleblock;
pub mod outpoint;
pub mod script;
pub mod transaction;
pub mod wire;

pub use address::{
    address_from_script_pubkey, address_from_script_sig, address_hash160, address_is_valid,
    script_pubkey_for_address, AddressError,
};
pub use bloom::BloomFilter;
pub use hash::{hash160, sha256, sha256d};
pub use keys::{Key, KeyError, MasterPubKey};
pub use merkleblock::MerkleBlock;
pub use outpoint::OutPoint;
pub use transaction::{spv_rand, Transaction, TxInput, TxOutput};
