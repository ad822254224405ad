//! Transaction model, serialization in both digest forms, and signing.

use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use spvd_consensus::constants::{
    SIGHASH_ALL, SIGHASH_ANYONECANPAY, SIGHASH_FORKID, SIGHASH_NONE, SIGHASH_SINGLE,
    TX_INPUT_SIZE, TX_LOCKTIME, TX_UNCONFIRMED, TX_VERSION,
};
use spvd_consensus::{Hash256, Network};

use crate::address::{address_from_script_pubkey, address_from_script_sig};
use crate::hash::sha256d;
use crate::keys::Key;
use crate::script::{self, OP_EQUALVERIFY};
use crate::wire::{varint_size, DecodeError, WireReader, WireWriter};

/// Returns a random number below `upper_bound`. Seeded from time and pid via
/// FNV mixing; for output shuffling and peer selection only, never keys.
pub fn spv_rand(upper_bound: u32) -> u32 {
    const RAND_MAX: u32 = 0x7fff_ffff;

    static STATE: OnceLock<Mutex<u64>> = OnceLock::new();
    let state = STATE.get_or_init(|| {
        let time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as u32;
        // seed = (((FNV_OFFSET xor time)*FNV_PRIME) xor pid)*FNV_PRIME
        let seed = ((0x811c_9dc5u32 ^ time).wrapping_mul(0x0100_0193) ^ std::process::id())
            .wrapping_mul(0x0100_0193);
        Mutex::new(if seed == 0 { 0x811c_9dc5 } else { seed as u64 })
    });

    let upper_bound = if upper_bound == 0 || upper_bound > RAND_MAX {
        RAND_MAX
    } else {
        upper_bound
    };

    let mut state = state.lock().expect("rng lock");
    loop {
        // xorshift64
        *state ^= *state << 13;
        *state ^= *state >> 7;
        *state ^= *state << 17;
        let r = (*state >> 33) as u32 & RAND_MAX;

        // reject values in the biased low range
        if (r as u64) >= (1u64 << 32) % (upper_bound as u64) {
            return r % upper_bound;
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct TxInput {
    pub tx_hash: Hash256,
    pub index: u32,
    pub address: String,
    pub amount: u64,
    /// scriptPubKey of the prevout, when known.
    pub script: Vec<u8>,
    /// scriptSig; empty while unsigned.
    pub signature: Vec<u8>,
    pub sequence: u32,
}

impl TxInput {
    pub fn set_script(&mut self, script: Vec<u8>, network: Network) {
        self.address = address_from_script_pubkey(&script, network).unwrap_or_default();
        self.script = script;
    }

    pub fn set_signature(&mut self, signature: Vec<u8>, network: Network) {
        if self.address.is_empty() {
            self.address = address_from_script_sig(&signature, network).unwrap_or_default();
        }
        self.signature = signature;
    }
}

#[derive(Clone, Debug, Default)]
pub struct TxOutput {
    pub address: String,
    pub amount: u64,
    pub script: Vec<u8>,
}

impl TxOutput {
    pub fn new(amount: u64, script: Vec<u8>, network: Network) -> Self {
        Self {
            address: address_from_script_pubkey(&script, network).unwrap_or_default(),
            amount,
            script,
        }
    }

    pub fn set_script(&mut self, script: Vec<u8>, network: Network) {
        self.address = address_from_script_pubkey(&script, network).unwrap_or_default();
        self.script = script;
    }
}

#[derive(Clone, Debug)]
pub struct Transaction {
    pub tx_hash: Hash256,
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u32,
    /// TX_UNCONFIRMED until seen in a main-chain block. Not serialized.
    pub block_height: u32,
    /// Not serialized.
    pub timestamp: u32,
    pub network: Network,
}

/// Identity is the tx hash.
impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.tx_hash == other.tx_hash
    }
}

impl Eq for Transaction {}

impl Transaction {
    pub fn new(network: Network) -> Self {
        Self {
            tx_hash: [0u8; 32],
            version: TX_VERSION,
            inputs: Vec::new(),
            outputs: Vec::new(),
            lock_time: TX_LOCKTIME,
            block_height: TX_UNCONFIRMED,
            timestamp: 0,
            network,
        }
    }

    pub fn add_input(
        &mut self,
        tx_hash: Hash256,
        index: u32,
        amount: u64,
        script: Vec<u8>,
        signature: Vec<u8>,
        sequence: u32,
    ) {
        let mut input = TxInput {
            tx_hash,
            index,
            amount,
            sequence,
            ..TxInput::default()
        };
        if !script.is_empty() {
            input.set_script(script, self.network);
        }
        if !signature.is_empty() {
            input.set_signature(signature, self.network);
        }
        self.inputs.push(input);
    }

    pub fn add_output(&mut self, amount: u64, script: Vec<u8>) {
        let network = self.network;
        self.outputs.push(TxOutput::new(amount, script, network));
    }

    /// Fisher–Yates over the outputs with the non-cryptographic PRNG.
    pub fn shuffle_outputs(&mut self) {
        for i in 0..self.outputs.len().saturating_sub(1) {
            let j = i + spv_rand((self.outputs.len() - i) as u32) as usize;
            self.outputs.swap(i, j);
        }
    }

    /// Size in bytes if signed, or estimated size assuming compact pubkey
    /// signatures.
    pub fn size(&self) -> usize {
        let mut size = 8
            + varint_size(self.inputs.len() as u64)
            + varint_size(self.outputs.len() as u64);

        for input in &self.inputs {
            if !input.signature.is_empty() {
                size += 32 + 4 + varint_size(input.signature.len() as u64)
                    + input.signature.len()
                    + 4;
            } else {
                size += TX_INPUT_SIZE;
            }
        }

        for output in &self.outputs {
            size += 8 + varint_size(output.script.len() as u64) + output.script.len();
        }

        size
    }

    /// Minimum fee needed for this tx to relay.
    pub fn standard_fee(&self) -> u64 {
        use spvd_consensus::constants::TX_FEE_PER_KB;
        ((self.size() as u64 + 999) / 1000) * TX_FEE_PER_KB
    }

    /// True when every input carries a signature. Does not verify them.
    pub fn is_signed(&self) -> bool {
        !self.inputs.is_empty() && self.inputs.iter().all(|input| !input.signature.is_empty())
    }

    /// Meets the network IsStandard() rules.
    pub fn is_standard(&self) -> bool {
        // TODO: implement the standardness checks
        true
    }

    /// The wire serialization. For unsigned inputs this substitutes the
    /// prevout script and appends the 8-byte amount, an in-memory hand-off
    /// form that is not valid on the wire.
    pub fn serialize(&self) -> Vec<u8> {
        self.tx_data(None, SIGHASH_ALL)
    }

    pub fn parse(buf: &[u8], network: Network) -> Result<Self, DecodeError> {
        let mut reader = WireReader::new(buf);
        let mut tx = Transaction::new(network);
        let mut is_signed = true;

        tx.version = reader.read_u32_le()?;
        let in_count = reader.read_varint()? as usize;
        for _ in 0..in_count {
            let mut input = TxInput {
                tx_hash: reader.read_hash()?,
                index: reader.read_u32_le()?,
                ..TxInput::default()
            };
            let script = reader.read_var_bytes()?;

            if address_from_script_pubkey(&script, network).is_some() {
                // an unsigned input carrying the prevout script and amount
                input.set_script(script, network);
                input.amount = reader.read_u64_le()?;
                is_signed = false;
            } else {
                input.set_signature(script, network);
            }

            input.sequence = reader.read_u32_le()?;
            tx.inputs.push(input);
        }

        let out_count = reader.read_varint()? as usize;
        for _ in 0..out_count {
            let amount = reader.read_u64_le()?;
            let script = reader.read_var_bytes()?;
            tx.outputs.push(TxOutput::new(amount, script, network));
        }

        tx.lock_time = reader.read_u32_le()?;

        if tx.inputs.is_empty() {
            return Err(DecodeError::Malformed("transaction has no inputs"));
        }
        if is_signed {
            tx.tx_hash = sha256d(&buf[..reader.consumed()]);
        }
        Ok(tx)
    }

    /// Adds signatures to any unsigned inputs that the given keys can sign.
    /// `fork_id` is 0 for the legacy digest, 0x40 selects the witness digest.
    /// Returns true when the tx ends up fully signed.
    pub fn sign(&mut self, fork_id: u32, keys: &[Key]) -> bool {
        let addresses: Vec<String> = keys.iter().map(|key| key.address(self.network)).collect();
        let hash_type = fork_id | SIGHASH_ALL;

        for i in 0..self.inputs.len() {
            let Some(address) =
                address_from_script_pubkey(&self.inputs[i].script, self.network)
            else {
                continue;
            };
            let Some(key_index) = addresses.iter().position(|a| *a == address) else {
                continue;
            };

            let digest = sha256d(&self.tx_data(Some(i), hash_type));
            let mut sig = keys[key_index].sign(&digest);
            sig.push(hash_type as u8);

            let elems = script::elements(&self.inputs[i].script);
            let mut script_sig = Vec::with_capacity(sig.len() + 35);
            script::push_data(&mut script_sig, &sig);
            if elems.len() >= 2 && elems[elems.len() - 2].opcode() == OP_EQUALVERIFY {
                // pay-to-pubkey-hash also needs the pubkey
                script::push_data(&mut script_sig, &keys[key_index].pub_key());
            }

            let network = self.network;
            self.inputs[i].set_signature(script_sig, network);
        }

        if self.is_signed() {
            self.tx_hash = sha256d(&self.serialize());
            true
        } else {
            false
        }
    }

    /// The bytes hashed and signed for the input at `index`, or the full
    /// serialized transaction when `index` is None.
    fn tx_data(&self, index: Option<usize>, hash_type: u32) -> Vec<u8> {
        if hash_type & SIGHASH_FORKID != 0 {
            return self.witness_data(index, hash_type);
        }

        let anyone_can_pay = hash_type & SIGHASH_ANYONECANPAY != 0;
        let sig_hash = hash_type & 0x1f;
        if anyone_can_pay && index.map_or(true, |i| i >= self.inputs.len()) {
            return Vec::new();
        }

        let mut writer = WireWriter::with_capacity(self.size() + 4);
        writer.write_u32_le(self.version);

        if !anyone_can_pay {
            writer.write_varint(self.inputs.len() as u64);
            for (i, input) in self.inputs.iter().enumerate() {
                match index {
                    Some(idx) if idx == i => {
                        // the prevout script stands in as the script code
                        // TODO: handle OP_CODESEPARATOR when extracting it
                        write_input(&mut writer, input, &input.script, 0, input.sequence);
                    }
                    Some(_) => {
                        let sequence = if sig_hash == SIGHASH_NONE || sig_hash == SIGHASH_SINGLE {
                            0
                        } else {
                            input.sequence
                        };
                        write_input(&mut writer, input, &[], 0, sequence);
                    }
                    None if input.signature.is_empty() => {
                        // unsigned hand-off form: prevout script plus amount
                        write_input(
                            &mut writer,
                            input,
                            &input.script,
                            input.amount,
                            input.sequence,
                        );
                    }
                    None => {
                        write_input(&mut writer, input, &input.signature, 0, input.sequence);
                    }
                }
            }
        } else {
            let input = &self.inputs[index.expect("checked by anyone_can_pay guard")];
            writer.write_varint(1);
            write_input(&mut writer, input, &input.script, 0, input.sequence);
        }

        if sig_hash != SIGHASH_SINGLE && sig_hash != SIGHASH_NONE {
            writer.write_varint(self.outputs.len() as u64);
            for output in &self.outputs {
                write_output(&mut writer, output);
            }
        } else if sig_hash == SIGHASH_SINGLE && index.is_some_and(|i| i < self.outputs.len()) {
            let idx = index.expect("checked above");
            writer.write_varint(idx as u64 + 1);
            for _ in 0..idx {
                writer.write_u64_le(u64::MAX); // amount of -1
                writer.write_varint(0);
            }
            write_output(&mut writer, &self.outputs[idx]);
        } else {
            writer.write_varint(0);
        }

        writer.write_u32_le(self.lock_time);
        if index.is_some() {
            writer.write_u32_le(hash_type);
        }
        writer.into_bytes()
    }

    /// BIP143-style digest pre-image, double-SHA256 variant.
    fn witness_data(&self, index: Option<usize>, hash_type: u32) -> Vec<u8> {
        let Some(idx) = index.filter(|i| *i < self.inputs.len()) else {
            return Vec::new();
        };
        let anyone_can_pay = hash_type & SIGHASH_ANYONECANPAY != 0;
        let sig_hash = hash_type & 0x1f;

        let mut writer = WireWriter::with_capacity(156 + self.inputs[idx].script.len());
        writer.write_u32_le(self.version);

        if !anyone_can_pay {
            let mut prevouts = WireWriter::with_capacity(36 * self.inputs.len());
            for input in &self.inputs {
                prevouts.write_hash(&input.tx_hash);
                prevouts.write_u32_le(input.index);
            }
            writer.write_hash(&sha256d(&prevouts.into_bytes()));
        } else {
            writer.write_hash(&[0u8; 32]);
        }

        if !anyone_can_pay && sig_hash != SIGHASH_SINGLE && sig_hash != SIGHASH_NONE {
            let mut sequences = WireWriter::with_capacity(4 * self.inputs.len());
            for input in &self.inputs {
                sequences.write_u32_le(input.sequence);
            }
            writer.write_hash(&sha256d(&sequences.into_bytes()));
        } else {
            writer.write_hash(&[0u8; 32]);
        }

        // outpoint, script code, amount, sequence of the signed input
        // TODO: handle OP_CODESEPARATOR when extracting the script code
        let input = &self.inputs[idx];
        write_input(&mut writer, input, &input.script, input.amount, input.sequence);

        if sig_hash != SIGHASH_SINGLE && sig_hash != SIGHASH_NONE {
            let mut outputs = WireWriter::new();
            for output in &self.outputs {
                write_output(&mut outputs, output);
            }
            writer.write_hash(&sha256d(&outputs.into_bytes()));
        } else if sig_hash == SIGHASH_SINGLE && idx < self.outputs.len() {
            let mut single = WireWriter::new();
            write_output(&mut single, &self.outputs[idx]);
            writer.write_hash(&sha256d(&single.into_bytes()));
        } else {
            writer.write_hash(&[0u8; 32]);
        }

        writer.write_u32_le(self.lock_time);
        writer.write_u32_le(hash_type);
        writer.into_bytes()
    }
}

fn write_input(writer: &mut WireWriter, input: &TxInput, sig: &[u8], amount: u64, sequence: u32) {
    writer.write_hash(&input.tx_hash);
    writer.write_u32_le(input.index);
    writer.write_var_bytes(sig);
    writer.write_optional_amount(amount);
    writer.write_u32_le(sequence);
}

fn write_output(writer: &mut WireWriter, output: &TxOutput) {
    writer.write_u64_le(output.amount);
    writer.write_var_bytes(&output.script);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::p2pkh_script;
    use spvd_consensus::constants::TXIN_SEQUENCE;

    fn dummy_prev_hash(tag: u8) -> Hash256 {
        let mut hash = [0u8; 32];
        hash[0] = tag;
        hash
    }

    fn unsigned_tx() -> Transaction {
        let mut tx = Transaction::new(Network::Mainnet);
        tx.add_input(
            dummy_prev_hash(1),
            0,
            200_000,
            p2pkh_script(&[0x11; 20]),
            Vec::new(),
            TXIN_SEQUENCE,
        );
        tx.add_output(100_000, p2pkh_script(&[0x22; 20]));
        tx
    }

    #[test]
    fn unsigned_handoff_roundtrip() {
        let tx = unsigned_tx();
        assert!(!tx.is_signed());

        let bytes = tx.serialize();
        let parsed = Transaction::parse(&bytes, Network::Mainnet).expect("parse");
        assert!(!parsed.is_signed());
        assert_eq!(parsed.inputs.len(), 1);
        assert_eq!(parsed.inputs[0].amount, 200_000);
        assert_eq!(parsed.inputs[0].script, tx.inputs[0].script);
        assert_eq!(parsed.inputs[0].address, tx.inputs[0].address);
        assert_eq!(parsed.outputs[0].amount, 100_000);
        assert_eq!(parsed.serialize(), bytes);
    }

    #[test]
    fn size_estimate_covers_unsigned_inputs() {
        let tx = unsigned_tx();
        // 8 overhead + 2 varints + input estimate + output
        assert_eq!(tx.size(), 8 + 1 + 1 + TX_INPUT_SIZE + 8 + 1 + 25);
        assert_eq!(tx.standard_fee(), 1000);
    }

    #[test]
    fn sighash_single_pads_earlier_outputs() {
        let mut tx = Transaction::new(Network::Mainnet);
        tx.add_input(
            dummy_prev_hash(2),
            0,
            50_000,
            p2pkh_script(&[0x31; 20]),
            Vec::new(),
            TXIN_SEQUENCE,
        );
        tx.add_input(
            dummy_prev_hash(3),
            1,
            50_000,
            p2pkh_script(&[0x32; 20]),
            Vec::new(),
            TXIN_SEQUENCE,
        );
        tx.add_output(10_000, p2pkh_script(&[0x41; 20]));
        tx.add_output(20_000, p2pkh_script(&[0x42; 20]));

        let single = tx.tx_data(Some(1), SIGHASH_SINGLE);
        let all = tx.tx_data(Some(1), SIGHASH_ALL);
        assert_ne!(single, all);
        // output 0 is emitted as amount -1 with an empty script
        let marker = u64::MAX.to_le_bytes();
        assert!(single
            .windows(marker.len())
            .any(|window| window == marker));
    }

    #[test]
    fn witness_digest_differs_from_legacy() {
        let tx = unsigned_tx();
        let legacy = tx.tx_data(Some(0), SIGHASH_ALL);
        let witness = tx.tx_data(Some(0), SIGHASH_FORKID | SIGHASH_ALL);
        assert_ne!(legacy, witness);
        // version, hashPrevouts, hashSequence, outpoint...
        assert!(witness.len() > 4 + 32 + 32 + 36);
    }

    #[test]
    fn anyone_can_pay_serializes_single_input() {
        let mut tx = unsigned_tx();
        tx.add_input(
            dummy_prev_hash(9),
            3,
            70_000,
            p2pkh_script(&[0x19; 20]),
            Vec::new(),
            TXIN_SEQUENCE,
        );
        let data = tx.tx_data(Some(1), SIGHASH_ALL | SIGHASH_ANYONECANPAY);
        let mut reader = WireReader::new(&data);
        reader.read_u32_le().expect("version");
        assert_eq!(reader.read_varint(), Ok(1));
    }

    #[test]
    fn shuffle_preserves_outputs() {
        let mut tx = Transaction::new(Network::Mainnet);
        for i in 0..8u8 {
            tx.add_output(1000 + i as u64, p2pkh_script(&[i; 20]));
        }
        let mut before: Vec<u64> = tx.outputs.iter().map(|o| o.amount).collect();
        tx.shuffle_outputs();
        let mut after: Vec<u64> = tx.outputs.iter().map(|o| o.amount).collect();
        before.sort_unstable();
        after.sort_unstable();
        assert_eq!(before, after);
    }

    #[test]
    fn rand_respects_upper_bound() {
        for _ in 0..1000 {
            assert!(spv_rand(7) < 7);
        }
        assert_eq!(spv_rand(1), 0);
    }
}
