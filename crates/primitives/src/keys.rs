//! secp256k1 key handling and BIP32 chain derivation.
//!
//! The wallet keeps only the public branch (chain code + pubkey of m/0');
//! private keys are rederived from the seed at signing time and dropped.

use std::sync::OnceLock;

use hmac::{Hmac, Mac};
use secp256k1::{All, Message, PublicKey, Scalar, Secp256k1, SecretKey};
use sha2::Sha512;
use spvd_consensus::{Hash256, Network};

use crate::address::pubkey_address;
use crate::hash::hash160;

static SECP256K1: OnceLock<Secp256k1<All>> = OnceLock::new();

pub(crate) fn secp() -> &'static Secp256k1<All> {
    SECP256K1.get_or_init(Secp256k1::new)
}

const BIP32_SEED_KEY: &[u8] = b"Bitcoin seed";
const BIP32_HARD: u32 = 0x8000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyError {
    InvalidSecretKey,
    InvalidPublicKey,
    InvalidSeed,
}

impl std::fmt::Display for KeyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyError::InvalidSecretKey => write!(f, "invalid secret key"),
            KeyError::InvalidPublicKey => write!(f, "invalid public key"),
            KeyError::InvalidSeed => write!(f, "seed produced an unusable key"),
        }
    }
}

impl std::error::Error for KeyError {}

/// A single signing key. Public serialization is always compressed.
#[derive(Clone)]
pub struct Key {
    secret: SecretKey,
}

impl Key {
    pub fn from_secret(bytes: &[u8; 32]) -> Result<Self, KeyError> {
        let secret = SecretKey::from_slice(bytes).map_err(|_| KeyError::InvalidSecretKey)?;
        Ok(Self { secret })
    }

    pub fn pub_key(&self) -> [u8; 33] {
        PublicKey::from_secret_key(secp(), &self.secret).serialize()
    }

    pub fn key_hash(&self) -> [u8; 20] {
        hash160(&self.pub_key())
    }

    pub fn address(&self, network: Network) -> String {
        pubkey_address(&self.key_hash(), network)
    }

    /// DER-encoded ECDSA signature over a 32-byte digest (low-S form).
    pub fn sign(&self, digest: &Hash256) -> Vec<u8> {
        let msg = Message::from_digest(*digest);
        secp()
            .sign_ecdsa(&msg, &self.secret)
            .serialize_der()
            .to_vec()
    }
}

fn hmac_sha512(key: &[u8], data: &[u8]) -> [u8; 64] {
    let mut mac = Hmac::<Sha512>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    let mut out = [0u8; 64];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

fn split_i(i: &[u8; 64]) -> ([u8; 32], [u8; 32]) {
    let mut il = [0u8; 32];
    let mut ir = [0u8; 32];
    il.copy_from_slice(&i[..32]);
    ir.copy_from_slice(&i[32..]);
    (il, ir)
}

fn ckd_priv(
    secret: SecretKey,
    chain_code: [u8; 32],
    index: u32,
) -> Result<(SecretKey, [u8; 32]), KeyError> {
    let mut data = Vec::with_capacity(37);
    if index >= BIP32_HARD {
        data.push(0);
        data.extend_from_slice(&secret.secret_bytes());
    } else {
        data.extend_from_slice(&PublicKey::from_secret_key(secp(), &secret).serialize());
    }
    data.extend_from_slice(&index.to_be_bytes());

    let (il, ir) = split_i(&hmac_sha512(&chain_code, &data));
    let tweak = Scalar::from_be_bytes(il).map_err(|_| KeyError::InvalidSeed)?;
    let child = secret.add_tweak(&tweak).map_err(|_| KeyError::InvalidSeed)?;
    Ok((child, ir))
}

fn ckd_pub(
    pub_key: PublicKey,
    chain_code: [u8; 32],
    index: u32,
) -> Result<(PublicKey, [u8; 32]), KeyError> {
    debug_assert!(index < BIP32_HARD, "public derivation cannot be hardened");
    let mut data = Vec::with_capacity(37);
    data.extend_from_slice(&pub_key.serialize());
    data.extend_from_slice(&index.to_be_bytes());

    let (il, ir) = split_i(&hmac_sha512(&chain_code, &data));
    let tweak = Scalar::from_be_bytes(il).map_err(|_| KeyError::InvalidSeed)?;
    let child = pub_key
        .add_exp_tweak(secp(), &tweak)
        .map_err(|_| KeyError::InvalidSeed)?;
    Ok((child, ir))
}

/// The public half of m/0', from which external (0/i) and internal (1/i)
/// address chains derive without the seed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MasterPubKey {
    pub chain_code: [u8; 32],
    pub pub_key: [u8; 33],
}

impl MasterPubKey {
    pub fn from_seed(seed: &[u8]) -> Result<Self, KeyError> {
        let (il, ir) = split_i(&hmac_sha512(BIP32_SEED_KEY, seed));
        let master = SecretKey::from_slice(&il).map_err(|_| KeyError::InvalidSeed)?;
        let (account, chain_code) = ckd_priv(master, ir, BIP32_HARD)?;
        Ok(Self {
            chain_code,
            pub_key: PublicKey::from_secret_key(secp(), &account).serialize(),
        })
    }

    pub fn derive_pub_key(&self, chain: u32, index: u32) -> Result<[u8; 33], KeyError> {
        let account =
            PublicKey::from_slice(&self.pub_key).map_err(|_| KeyError::InvalidPublicKey)?;
        let (chain_key, chain_code) = ckd_pub(account, self.chain_code, chain)?;
        let (child, _) = ckd_pub(chain_key, chain_code, index)?;
        Ok(child.serialize())
    }

    pub fn derive_address(
        &self,
        chain: u32,
        index: u32,
        network: Network,
    ) -> Result<String, KeyError> {
        let pub_key = self.derive_pub_key(chain, index)?;
        Ok(pubkey_address(&hash160(&pub_key), network))
    }
}

/// Derives the private keys at m/0'/chain/i for each requested index.
pub fn priv_key_list(seed: &[u8], chain: u32, indices: &[u32]) -> Result<Vec<Key>, KeyError> {
    let (il, ir) = split_i(&hmac_sha512(BIP32_SEED_KEY, seed));
    let master = SecretKey::from_slice(&il).map_err(|_| KeyError::InvalidSeed)?;
    let (account, account_code) = ckd_priv(master, ir, BIP32_HARD)?;
    let (chain_key, chain_code) = ckd_priv(account, account_code, chain)?;

    let mut keys = Vec::with_capacity(indices.len());
    for index in indices {
        let (child, _) = ckd_priv(chain_key, chain_code, *index)?;
        keys.push(Key { secret: child });
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::sha256d;

    #[test]
    fn public_and_private_derivation_agree() {
        let seed = [0x5au8; 32];
        let mpk = MasterPubKey::from_seed(&seed).expect("mpk");

        for chain in [0u32, 1] {
            for index in [0u32, 1, 7] {
                let pub_key = mpk.derive_pub_key(chain, index).expect("pub derive");
                let keys = priv_key_list(&seed, chain, &[index]).expect("priv derive");
                assert_eq!(keys[0].pub_key(), pub_key, "chain {chain} index {index}");
            }
        }
    }

    #[test]
    fn derived_addresses_are_distinct() {
        let mpk = MasterPubKey::from_seed(b"derivation determinism seed").expect("mpk");
        let a = mpk.derive_address(0, 0, Network::Mainnet).expect("addr");
        let b = mpk.derive_address(0, 1, Network::Mainnet).expect("addr");
        let c = mpk.derive_address(1, 0, Network::Mainnet).expect("addr");
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
        // and deterministic
        assert_eq!(a, mpk.derive_address(0, 0, Network::Mainnet).expect("addr"));
    }

    #[test]
    fn signature_verifies() {
        let key = Key::from_secret(&[0x11; 32]).expect("key");
        let digest = sha256d(b"sign me");
        let der = key.sign(&digest);

        let sig = secp256k1::ecdsa::Signature::from_der(&der).expect("der");
        let msg = Message::from_digest(digest);
        let pubkey = PublicKey::from_slice(&key.pub_key()).expect("pubkey");
        assert!(secp().verify_ecdsa(&msg, &sig, &pubkey).is_ok());
    }
}
