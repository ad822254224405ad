//! Base58Check address codec and script template mapping.

use spvd_consensus::Network;

use crate::hash::{hash160, sha256d};
use crate::script::{self, Element, OP_CHECKSIG, OP_DUP, OP_EQUAL, OP_EQUALVERIFY, OP_HASH160};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressError {
    InvalidLength,
    InvalidCharacter,
    InvalidChecksum,
    UnknownPrefix,
}

impl std::fmt::Display for AddressError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressError::InvalidLength => write!(f, "invalid address length"),
            AddressError::InvalidCharacter => write!(f, "invalid base58 character"),
            AddressError::InvalidChecksum => write!(f, "address checksum mismatch"),
            AddressError::UnknownPrefix => write!(f, "unknown address prefix"),
        }
    }
}

impl std::error::Error for AddressError {}

fn network_prefixes(network: Network) -> (u8, u8) {
    match network {
        Network::Mainnet => (48, 50),
        Network::Testnet => (111, 58),
    }
}

/// Builds the scriptPubKey an address pays to.
pub fn script_pubkey_for_address(address: &str, network: Network) -> Result<Vec<u8>, AddressError> {
    let payload = base58check_decode(address)?;
    if payload.len() != 21 {
        return Err(AddressError::InvalidLength);
    }
    let (pubkey_prefix, script_prefix) = network_prefixes(network);
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&payload[1..]);

    if payload[0] == pubkey_prefix {
        Ok(script::p2pkh_script(&hash))
    } else if payload[0] == script_prefix {
        Ok(script::p2sh_script(&hash))
    } else {
        Err(AddressError::UnknownPrefix)
    }
}

/// Derives the address a scriptPubKey pays to. Recognizes the P2PKH, P2SH,
/// and P2PK templates; anything else yields None.
pub fn address_from_script_pubkey(script: &[u8], network: Network) -> Option<String> {
    let (pubkey_prefix, script_prefix) = network_prefixes(network);
    let elems = script::elements(script);

    match elems.as_slice() {
        // OP_DUP OP_HASH160 <20> OP_EQUALVERIFY OP_CHECKSIG
        [Element::Opcode(OP_DUP), Element::Opcode(OP_HASH160), Element::Push(hash), Element::Opcode(OP_EQUALVERIFY), Element::Opcode(OP_CHECKSIG)]
            if hash.len() == 20 =>
        {
            Some(encode_with_prefix(pubkey_prefix, hash))
        }
        // OP_HASH160 <20> OP_EQUAL
        [Element::Opcode(OP_HASH160), Element::Push(hash), Element::Opcode(OP_EQUAL)]
            if hash.len() == 20 =>
        {
            Some(encode_with_prefix(script_prefix, hash))
        }
        // <pubkey> OP_CHECKSIG
        [Element::Push(pubkey), Element::Opcode(OP_CHECKSIG)]
            if pubkey.len() == 33 || pubkey.len() == 65 =>
        {
            Some(encode_with_prefix(pubkey_prefix, &hash160(pubkey)))
        }
        _ => None,
    }
}

/// Derives the spender's address from a pay-to-pubkey-hash scriptSig
/// (`<sig> <pubkey>`). Other scriptSig shapes yield None.
pub fn address_from_script_sig(script: &[u8], network: Network) -> Option<String> {
    let (pubkey_prefix, _) = network_prefixes(network);
    let elems = script::elements(script);
    if elems.len() < 2 {
        return None;
    }

    let sig = elems[elems.len() - 2].data()?;
    let pubkey = elems[elems.len() - 1].data()?;
    if sig.is_empty() || (pubkey.len() != 33 && pubkey.len() != 65) {
        return None;
    }

    Some(encode_with_prefix(pubkey_prefix, &hash160(pubkey)))
}

/// The 20-byte hash an address commits to, regardless of prefix.
pub fn address_hash160(address: &str) -> Option<[u8; 20]> {
    let payload = base58check_decode(address).ok()?;
    if payload.len() != 21 {
        return None;
    }
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&payload[1..]);
    Some(hash)
}

pub fn address_is_valid(address: &str, network: Network) -> bool {
    let Ok(payload) = base58check_decode(address) else {
        return false;
    };
    if payload.len() != 21 {
        return false;
    }
    let (pubkey_prefix, script_prefix) = network_prefixes(network);
    payload[0] == pubkey_prefix || payload[0] == script_prefix
}

pub fn pubkey_address(hash: &[u8; 20], network: Network) -> String {
    encode_with_prefix(network_prefixes(network).0, hash)
}

fn encode_with_prefix(prefix: u8, hash: &[u8]) -> String {
    let mut payload = Vec::with_capacity(1 + hash.len());
    payload.push(prefix);
    payload.extend_from_slice(hash);
    base58check_encode(&payload)
}

fn base58check_decode(input: &str) -> Result<Vec<u8>, AddressError> {
    let bytes = base58_decode(input)?;
    if bytes.len() < 4 {
        return Err(AddressError::InvalidLength);
    }
    let (payload, checksum) = bytes.split_at(bytes.len() - 4);
    let digest = sha256d(payload);
    if checksum != &digest[..4] {
        return Err(AddressError::InvalidChecksum);
    }
    Ok(payload.to_vec())
}

fn base58check_encode(payload: &[u8]) -> String {
    let mut data = Vec::with_capacity(payload.len() + 4);
    data.extend_from_slice(payload);
    let checksum = sha256d(payload);
    data.extend_from_slice(&checksum[..4]);
    base58_encode(&data)
}

const ALPHABET: &[u8; 58] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

fn base58_decode(input: &str) -> Result<Vec<u8>, AddressError> {
    if input.is_empty() {
        return Err(AddressError::InvalidLength);
    }
    let mut bytes: Vec<u8> = Vec::new();
    for ch in input.bytes() {
        let value = base58_value(ch).ok_or(AddressError::InvalidCharacter)? as u32;
        let mut carry = value;
        for byte in bytes.iter_mut().rev() {
            let val = (*byte as u32) * 58 + carry;
            *byte = (val & 0xff) as u8;
            carry = val >> 8;
        }
        while carry > 0 {
            bytes.insert(0, (carry & 0xff) as u8);
            carry >>= 8;
        }
    }

    let leading_zeros = input.bytes().take_while(|b| *b == b'1').count();
    let mut out = vec![0u8; leading_zeros];
    out.extend_from_slice(&bytes);
    Ok(out)
}

fn base58_encode(data: &[u8]) -> String {
    if data.is_empty() {
        return String::new();
    }
    let mut digits = vec![0u8];
    for byte in data {
        let mut carry = *byte as u32;
        for digit in digits.iter_mut().rev() {
            let value = (*digit as u32) * 256 + carry;
            *digit = (value % 58) as u8;
            carry = value / 58;
        }
        while carry > 0 {
            digits.insert(0, (carry % 58) as u8);
            carry /= 58;
        }
    }
    let leading_zeros = data.iter().take_while(|b| **b == 0u8).count();
    let mut out = String::with_capacity(leading_zeros + digits.len());
    for _ in 0..leading_zeros {
        out.push('1');
    }
    for digit in digits {
        out.push(ALPHABET[digit as usize] as char);
    }
    out
}

fn base58_value(byte: u8) -> Option<u8> {
    ALPHABET
        .iter()
        .position(|value| *value == byte)
        .map(|pos| pos as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn p2pkh_roundtrip() {
        let hash = [0x42u8; 20];
        let script = script::p2pkh_script(&hash);
        let address =
            address_from_script_pubkey(&script, Network::Mainnet).expect("p2pkh address");
        assert!(address_is_valid(&address, Network::Mainnet));
        assert!(!address_is_valid(&address, Network::Testnet));
        assert_eq!(address_hash160(&address), Some(hash));
        assert_eq!(
            script_pubkey_for_address(&address, Network::Mainnet).expect("script"),
            script
        );
    }

    #[test]
    fn p2sh_roundtrip() {
        let hash = [0x17u8; 20];
        let script = script::p2sh_script(&hash);
        let address = address_from_script_pubkey(&script, Network::Mainnet).expect("p2sh address");
        assert_eq!(
            script_pubkey_for_address(&address, Network::Mainnet).expect("script"),
            script
        );
    }

    #[test]
    fn p2pk_derives_pubkey_address() {
        let pubkey = [0x02u8; 33];
        let mut script = Vec::new();
        script::push_data(&mut script, &pubkey);
        script.push(OP_CHECKSIG);

        let address = address_from_script_pubkey(&script, Network::Mainnet).expect("p2pk address");
        assert_eq!(address_hash160(&address), Some(hash160(&pubkey)));
    }

    #[test]
    fn script_sig_recovers_spender() {
        let pubkey = [0x03u8; 33];
        let mut script_sig = Vec::new();
        script::push_data(&mut script_sig, &[0x30; 71]);
        script::push_data(&mut script_sig, &pubkey);

        let address = address_from_script_sig(&script_sig, Network::Mainnet).expect("address");
        assert_eq!(address_hash160(&address), Some(hash160(&pubkey)));
    }

    #[test]
    fn rejects_mangled_checksum() {
        let address = pubkey_address(&[0x42u8; 20], Network::Mainnet);
        let mut mangled = address.into_bytes();
        let last = mangled.last_mut().unwrap();
        *last = if *last == b'1' { b'2' } else { b'1' };
        let mangled = String::from_utf8(mangled).unwrap();
        assert!(!address_is_valid(&mangled, Network::Mainnet));
    }

    #[test]
    fn unknown_script_yields_no_address() {
        assert_eq!(address_from_script_pubkey(&[0x6a], Network::Mainnet), None);
        assert_eq!(address_from_script_pubkey(&[], Network::Mainnet), None);
    }
}
