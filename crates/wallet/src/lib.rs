//! Deterministic wallet: address chains, ordered transaction log, UTXO
//! tracking, coin selection, and signing.

mod wallet;

pub use wallet::{Wallet, WalletError, WalletEvents};
