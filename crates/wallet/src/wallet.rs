use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use spvd_consensus::constants::{
    DEFAULT_FEE_PER_KB, MIN_FEE_PER_KB, SEQUENCE_EXTERNAL_CHAIN, SEQUENCE_GAP_LIMIT_EXTERNAL,
    SEQUENCE_GAP_LIMIT_INTERNAL, SEQUENCE_INTERNAL_CHAIN, TXIN_SEQUENCE, TX_FEE_PER_KB,
    TX_INPUT_SIZE, TX_MAX_LOCK_HEIGHT, TX_MAX_SIZE, TX_MIN_OUTPUT_AMOUNT, TX_OUTPUT_SIZE,
    TX_UNCONFIRMED,
};
use spvd_consensus::{Hash256, Network};
use spvd_log::log_info;
use spvd_primitives::wire::varint_size;
use spvd_primitives::keys::{priv_key_list, MasterPubKey};
use spvd_primitives::script::{OP_CHECKSIG, OP_DUP, OP_EQUALVERIFY, OP_HASH160};
use spvd_primitives::{address_is_valid, script_pubkey_for_address, OutPoint, Transaction, TxOutput};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletError {
    /// The initial transaction set does not belong to the master public key.
    ForeignTransactions,
    /// A transaction was requested with no outputs.
    NoOutputs,
    InsufficientFunds,
    InvalidAddress,
    KeyDerivation,
}

impl std::fmt::Display for WalletError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WalletError::ForeignTransactions => {
                write!(f, "transactions do not match the master public key")
            }
            WalletError::NoOutputs => write!(f, "transaction has no outputs"),
            WalletError::InsufficientFunds => write!(f, "insufficient funds"),
            WalletError::InvalidAddress => write!(f, "invalid address"),
            WalletError::KeyDerivation => write!(f, "key derivation failed"),
        }
    }
}

impl std::error::Error for WalletError {}

type BalanceChanged = Box<dyn Fn(u64) + Send + Sync>;
type TxAdded = Box<dyn Fn(&Transaction) + Send + Sync>;
type TxUpdated = Box<dyn Fn(&[Hash256], u32, u32) + Send + Sync>;
type TxDeleted = Box<dyn Fn(Hash256, bool, bool) + Send + Sync>;

/// Host notifications. Every callback fires after the wallet lock has been
/// released.
#[derive(Default)]
pub struct WalletEvents {
    pub balance_changed: Option<BalanceChanged>,
    pub tx_added: Option<TxAdded>,
    /// (hashes, block_height, timestamp)
    pub tx_updated: Option<TxUpdated>,
    /// (hash, notify_user, recommend_rescan)
    pub tx_deleted: Option<TxDeleted>,
}

struct WalletInner {
    all_tx: HashMap<Hash256, Transaction>,
    /// Wallet transactions in ascending chain order.
    tx_order: Vec<Hash256>,
    invalid_tx: HashSet<Hash256>,
    pending_tx: HashSet<Hash256>,
    spent_outputs: HashSet<OutPoint>,
    utxos: Vec<OutPoint>,
    balance_hist: Vec<u64>,
    internal_chain: Vec<String>,
    external_chain: Vec<String>,
    all_addrs: HashSet<String>,
    used_addrs: HashSet<String>,
    balance: u64,
    total_sent: u64,
    total_received: u64,
    fee_per_kb: u64,
    block_height: u32,
}

pub struct Wallet {
    network: Network,
    master_pub_key: MasterPubKey,
    inner: Mutex<WalletInner>,
    events: WalletEvents,
}

fn tx_fee(fee_per_kb: u64, size: usize) -> u64 {
    let standard_fee = ((size as u64 + 999) / 1000) * TX_FEE_PER_KB;
    // feePerKb-based fee, rounded up to the nearest 100 satoshi
    let fee = ((size as u64 * fee_per_kb / 1000 + 99) / 100) * 100;
    fee.max(standard_fee)
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Chain position of the first tx output address that appears in the chain,
/// scanning the chain from its newest entry.
fn tx_chain_index(tx: &Transaction, chain: &[String]) -> Option<usize> {
    for i in (0..chain.len()).rev() {
        if tx.outputs.iter().any(|output| output.address == chain[i]) {
            return Some(i);
        }
    }
    None
}

impl WalletInner {
    /// True if tx1 comes after tx2 in dependency or confirmation order.
    fn tx_is_ascending(&self, tx1: &Transaction, tx2: &Transaction) -> bool {
        if tx1.block_height > tx2.block_height {
            return true;
        }
        if tx1.block_height < tx2.block_height {
            return false;
        }

        if tx1.inputs.iter().any(|input| input.tx_hash == tx2.tx_hash) {
            return true;
        }
        if tx2.inputs.iter().any(|input| input.tx_hash == tx1.tx_hash) {
            return false;
        }

        tx1.inputs.iter().any(|input| {
            self.all_tx
                .get(&input.tx_hash)
                .is_some_and(|parent| self.tx_is_ascending(parent, tx2))
        })
    }

    fn tx_compare(&self, tx1: &Transaction, tx2: &Transaction) -> std::cmp::Ordering {
        use std::cmp::Ordering;

        if self.tx_is_ascending(tx1, tx2) {
            return Ordering::Greater;
        }
        if self.tx_is_ascending(tx2, tx1) {
            return Ordering::Less;
        }

        // topologically incomparable: order by address chain position
        let mut i = tx_chain_index(tx1, &self.internal_chain);
        let j = if i.is_none() {
            tx_chain_index(tx2, &self.external_chain)
        } else {
            tx_chain_index(tx2, &self.internal_chain)
        };
        if i.is_none() && j.is_some() {
            i = tx_chain_index(tx1, &self.external_chain);
        }
        match (i, j) {
            (Some(i), Some(j)) if i != j => i.cmp(&j),
            _ => Ordering::Equal,
        }
    }

    /// Insertion sort keeping the log ascending, oldest first.
    fn insert_tx(&mut self, tx_hash: Hash256) {
        let tx = self.all_tx.get(&tx_hash).expect("inserted tx is registered");
        let mut i = self.tx_order.len();
        while i > 0 {
            let prev = self
                .all_tx
                .get(&self.tx_order[i - 1])
                .expect("ordered log references registered tx");
            if self.tx_compare(prev, tx) != std::cmp::Ordering::Greater {
                break;
            }
            i -= 1;
        }
        self.tx_order.insert(i, tx_hash);
    }

    /// A tx belongs to the wallet when an output pays one of its addresses,
    /// or an input spends a known prevout paying one of its addresses.
    /// scriptSigs are deliberately never inspected.
    fn contains_tx(&self, tx: &Transaction) -> bool {
        if tx
            .outputs
            .iter()
            .any(|output| self.all_addrs.contains(&output.address))
        {
            return true;
        }

        tx.inputs.iter().any(|input| {
            self.all_tx.get(&input.tx_hash).is_some_and(|prev| {
                prev.outputs
                    .get(input.index as usize)
                    .is_some_and(|output| self.all_addrs.contains(&output.address))
            })
        })
    }

    fn update_balance(&mut self) {
        let now = now_secs();
        let mut balance = 0u64;
        let mut prev_balance = 0u64;

        self.utxos.clear();
        self.balance_hist.clear();
        self.spent_outputs.clear();
        self.invalid_tx.clear();
        self.pending_tx.clear();
        self.used_addrs.clear();
        self.total_sent = 0;
        self.total_received = 0;

        for order_index in 0..self.tx_order.len() {
            let tx_hash = self.tx_order[order_index];
            let tx = self.all_tx.get(&tx_hash).expect("ordered tx registered");

            // check if any inputs are invalid or already spent
            if tx.block_height == TX_UNCONFIRMED {
                let is_invalid = tx.inputs.iter().any(|input| {
                    self.spent_outputs
                        .contains(&OutPoint::new(input.tx_hash, input.index))
                        || self.invalid_tx.contains(&input.tx_hash)
                });
                if is_invalid {
                    self.invalid_tx.insert(tx_hash);
                    self.balance_hist.push(balance);
                    continue;
                }
            }

            for input in &tx.inputs {
                self.spent_outputs
                    .insert(OutPoint::new(input.tx_hash, input.index));
            }

            if tx.block_height == TX_UNCONFIRMED {
                let mut is_pending = tx.size() > TX_MAX_SIZE;
                for output in &tx.outputs {
                    // no dust outputs
                    if output.amount < TX_MIN_OUTPUT_AMOUNT {
                        is_pending = true;
                    }
                }
                for input in &tx.inputs {
                    if input.sequence < TXIN_SEQUENCE - 1 {
                        is_pending = true; // replace-by-fee
                    }
                    if input.sequence < TXIN_SEQUENCE
                        && tx.lock_time < TX_MAX_LOCK_HEIGHT
                        && tx.lock_time > self.block_height + 1
                    {
                        is_pending = true; // future lock height
                    }
                    if input.sequence < TXIN_SEQUENCE && tx.lock_time as u64 > now {
                        is_pending = true; // future lock time
                    }
                    if self.pending_tx.contains(&input.tx_hash) {
                        is_pending = true;
                    }
                }
                if is_pending {
                    self.pending_tx.insert(tx_hash);
                    self.balance_hist.push(balance);
                    continue;
                }
            }

            // add outputs to the UTXO set
            for (n, output) in tx.outputs.iter().enumerate() {
                if output.address.is_empty() {
                    continue;
                }
                self.used_addrs.insert(output.address.clone());
                if self.all_addrs.contains(&output.address) {
                    self.utxos.push(OutPoint::new(tx_hash, n as u32));
                    balance += output.amount;
                }
            }

            // transaction ordering is not guaranteed, so check the entire
            // UTXO set against the spent output set
            let mut n = self.utxos.len();
            while n > 0 {
                n -= 1;
                let utxo = self.utxos[n];
                if !self.spent_outputs.contains(&utxo) {
                    continue;
                }
                let amount = self
                    .all_tx
                    .get(&utxo.hash)
                    .and_then(|t| t.outputs.get(utxo.index as usize))
                    .map(|output| output.amount)
                    .unwrap_or(0);
                balance -= amount;
                self.utxos.remove(n);
            }

            if prev_balance < balance {
                self.total_received += balance - prev_balance;
            }
            if balance < prev_balance {
                self.total_sent += prev_balance - balance;
            }
            self.balance_hist.push(balance);
            prev_balance = balance;
        }

        debug_assert_eq!(self.balance_hist.len(), self.tx_order.len());
        self.balance = balance;
    }

    fn min_output_amount(&self) -> u64 {
        let amount =
            (TX_MIN_OUTPUT_AMOUNT * self.fee_per_kb + MIN_FEE_PER_KB - 1) / MIN_FEE_PER_KB;
        amount.max(TX_MIN_OUTPUT_AMOUNT)
    }

    fn tx_is_valid(&self, tx: &Transaction) -> bool {
        // only unconfirmed transactions can be invalid
        if tx.block_height != TX_UNCONFIRMED {
            return true;
        }

        if !self.all_tx.contains_key(&tx.tx_hash) {
            for input in &tx.inputs {
                if self
                    .spent_outputs
                    .contains(&OutPoint::new(input.tx_hash, input.index))
                {
                    return false;
                }
            }
        } else if self.invalid_tx.contains(&tx.tx_hash) {
            return false;
        }

        tx.inputs.iter().all(|input| {
            self.all_tx
                .get(&input.tx_hash)
                .map_or(true, |parent| self.tx_is_valid(parent))
        })
    }

    fn tx_is_pending(&self, tx: &Transaction) -> bool {
        // only unconfirmed transactions can be postdated
        if tx.block_height != TX_UNCONFIRMED {
            return false;
        }
        let now = now_secs();

        if tx.size() > TX_MAX_SIZE {
            return true;
        }
        for input in &tx.inputs {
            if input.sequence < TXIN_SEQUENCE - 1 {
                return true;
            }
            if input.sequence < TXIN_SEQUENCE
                && tx.lock_time < TX_MAX_LOCK_HEIGHT
                && tx.lock_time > self.block_height + 1
            {
                return true;
            }
            if input.sequence < TXIN_SEQUENCE && tx.lock_time as u64 > now {
                return true;
            }
        }
        for output in &tx.outputs {
            if output.amount < TX_MIN_OUTPUT_AMOUNT {
                return true;
            }
        }
        tx.inputs.iter().any(|input| {
            self.all_tx
                .get(&input.tx_hash)
                .is_some_and(|parent| self.tx_is_pending(parent))
        })
    }

    fn tx_is_verified(&self, tx: &Transaction) -> bool {
        if tx.block_height != TX_UNCONFIRMED {
            return true;
        }
        if tx.timestamp == 0 || !self.tx_is_valid(tx) || self.tx_is_pending(tx) {
            return false;
        }
        tx.inputs.iter().all(|input| {
            self.all_tx
                .get(&input.tx_hash)
                .map_or(true, |parent| self.tx_is_verified(parent))
        })
    }

    fn amount_sent_by_tx(&self, tx: &Transaction) -> u64 {
        tx.inputs
            .iter()
            .filter_map(|input| {
                self.all_tx
                    .get(&input.tx_hash)
                    .and_then(|prev| prev.outputs.get(input.index as usize))
                    .filter(|output| self.all_addrs.contains(&output.address))
                    .map(|output| output.amount)
            })
            .sum()
    }
}

impl Wallet {
    /// Builds a wallet from previously saved transactions. Fails when the
    /// transactions do not match the master public key.
    pub fn new(
        transactions: Vec<Transaction>,
        master_pub_key: MasterPubKey,
        network: Network,
    ) -> Result<Self, WalletError> {
        let first_hash = transactions.first().map(|tx| tx.tx_hash);
        let mut inner = WalletInner {
            all_tx: HashMap::new(),
            tx_order: Vec::new(),
            invalid_tx: HashSet::new(),
            pending_tx: HashSet::new(),
            spent_outputs: HashSet::new(),
            utxos: Vec::new(),
            balance_hist: Vec::new(),
            internal_chain: Vec::new(),
            external_chain: Vec::new(),
            all_addrs: HashSet::new(),
            used_addrs: HashSet::new(),
            balance: 0,
            total_sent: 0,
            total_received: 0,
            fee_per_kb: DEFAULT_FEE_PER_KB,
            block_height: 0,
        };

        for tx in transactions {
            if !tx.is_signed() || inner.all_tx.contains_key(&tx.tx_hash) {
                continue;
            }
            let tx_hash = tx.tx_hash;
            for output in &tx.outputs {
                if !output.address.is_empty() {
                    inner.used_addrs.insert(output.address.clone());
                }
            }
            inner.all_tx.insert(tx_hash, tx);
            inner.insert_tx(tx_hash);
        }

        let wallet = Self {
            network,
            master_pub_key,
            inner: Mutex::new(inner),
            events: WalletEvents::default(),
        };

        wallet.unused_addrs(SEQUENCE_GAP_LIMIT_EXTERNAL, false);
        wallet.unused_addrs(SEQUENCE_GAP_LIMIT_INTERNAL, true);
        {
            let mut inner = wallet.lock();
            inner.update_balance();

            // verify the restored transactions belong to this master key
            if let Some(first) = first_hash {
                let tx = inner.all_tx.get(&first).cloned();
                if !tx.is_some_and(|tx| inner.contains_tx(&tx)) {
                    return Err(WalletError::ForeignTransactions);
                }
            }
        }

        Ok(wallet)
    }

    /// Not thread-safe; set once before the wallet is shared.
    pub fn set_events(&mut self, events: WalletEvents) {
        self.events = events;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WalletInner> {
        self.inner.lock().expect("wallet lock")
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// The next `gap_limit` addresses following the last used address in the
    /// chain, extending the chain as needed. The internal chain serves
    /// change, the external chain receives.
    pub fn unused_addrs(&self, gap_limit: u32, internal: bool) -> Vec<String> {
        let chain_number = if internal {
            SEQUENCE_INTERNAL_CHAIN
        } else {
            SEQUENCE_EXTERNAL_CHAIN
        };
        let mut guard = self.lock();
        let WalletInner {
            internal_chain,
            external_chain,
            all_addrs,
            used_addrs,
            ..
        } = &mut *guard;
        let chain = if internal {
            internal_chain
        } else {
            external_chain
        };

        // keep only the trailing contiguous block of unused addresses
        let mut i = chain.len();
        while i > 0 && !used_addrs.contains(&chain[i - 1]) {
            i -= 1;
        }

        while i + gap_limit as usize > chain.len() {
            let index = chain.len() as u32;
            let Ok(address) = self
                .master_pub_key
                .derive_address(chain_number, index, self.network)
            else {
                break;
            };
            all_addrs.insert(address.clone());
            chain.push(address.clone());
            if used_addrs.contains(&address) {
                i = chain.len();
            }
        }

        if i + gap_limit as usize <= chain.len() {
            chain[i..i + gap_limit as usize].to_vec()
        } else {
            Vec::new()
        }
    }

    /// The first unused external address.
    pub fn receive_address(&self) -> Option<String> {
        self.unused_addrs(1, false).into_iter().next()
    }

    /// The first unused internal (change) address.
    pub fn change_address(&self) -> Option<String> {
        self.unused_addrs(1, true).into_iter().next()
    }

    /// Every address generated so far, internal chain first.
    pub fn all_addrs(&self) -> Vec<String> {
        let inner = self.lock();
        let mut addrs =
            Vec::with_capacity(inner.internal_chain.len() + inner.external_chain.len());
        addrs.extend(inner.internal_chain.iter().cloned());
        addrs.extend(inner.external_chain.iter().cloned());
        addrs
    }

    /// True if the address was generated by this wallet, used or not.
    pub fn contains_address(&self, address: &str) -> bool {
        self.lock().all_addrs.contains(address)
    }

    /// True if the address appears as an output in any wallet transaction.
    pub fn address_is_used(&self, address: &str) -> bool {
        self.lock().used_addrs.contains(address)
    }

    /// Current balance, excluding invalid transactions.
    pub fn balance(&self) -> u64 {
        self.lock().balance
    }

    pub fn total_sent(&self) -> u64 {
        self.lock().total_sent
    }

    pub fn total_received(&self) -> u64 {
        self.lock().total_received
    }

    pub fn block_height(&self) -> u32 {
        self.lock().block_height
    }

    pub fn utxos(&self) -> Vec<OutPoint> {
        self.lock().utxos.clone()
    }

    pub fn fee_per_kb(&self) -> u64 {
        self.lock().fee_per_kb
    }

    pub fn set_fee_per_kb(&self, fee_per_kb: u64) {
        self.lock().fee_per_kb = fee_per_kb;
    }

    /// Registered wallet transactions, ascending by chain order.
    pub fn transactions(&self) -> Vec<Transaction> {
        let inner = self.lock();
        inner
            .tx_order
            .iter()
            .map(|hash| inner.all_tx[hash].clone())
            .collect()
    }

    /// Wallet transactions that were unconfirmed before `block_height`.
    pub fn tx_unconfirmed_before(&self, block_height: u32) -> Vec<Transaction> {
        let inner = self.lock();
        let mut n = 0;
        while n < inner.tx_order.len() {
            let hash = inner.tx_order[inner.tx_order.len() - n - 1];
            if inner.all_tx[&hash].block_height < block_height {
                break;
            }
            n += 1;
        }
        inner.tx_order[inner.tx_order.len() - n..]
            .iter()
            .map(|hash| inner.all_tx[hash].clone())
            .collect()
    }

    pub fn transaction_for_hash(&self, tx_hash: &Hash256) -> Option<Transaction> {
        self.lock().all_tx.get(tx_hash).cloned()
    }

    /// True if the transaction pays to or spends from wallet addresses, even
    /// if it has not been registered.
    pub fn contains_transaction(&self, tx: &Transaction) -> bool {
        self.lock().contains_tx(tx)
    }

    /// Adds a signed transaction to the wallet. Returns false when the tx is
    /// unsigned or does not belong to the wallet (unconfirmed foreign txs
    /// are still retained for conflict detection).
    pub fn register_transaction(&self, tx: Transaction) -> bool {
        if !tx.is_signed() {
            return false;
        }

        let mut was_added = false;
        let mut result = true;
        let tx_hash = tx.tx_hash;
        let balance;
        {
            let mut inner = self.lock();
            if !inner.all_tx.contains_key(&tx_hash) {
                if inner.contains_tx(&tx) {
                    inner.all_tx.insert(tx_hash, tx);
                    inner.insert_tx(tx_hash);
                    inner.update_balance();
                    was_added = true;
                } else {
                    // track unconfirmed non-wallet tx for invalid tx checks
                    if tx.block_height == TX_UNCONFIRMED {
                        inner.all_tx.insert(tx_hash, tx);
                    }
                    result = false;
                }
            }
            balance = inner.balance;
        }

        if was_added {
            // when a wallet address is used, generate replacements
            self.unused_addrs(SEQUENCE_GAP_LIMIT_EXTERNAL, false);
            self.unused_addrs(SEQUENCE_GAP_LIMIT_INTERNAL, true);
            if let Some(callback) = &self.events.balance_changed {
                callback(balance);
            }
            if let Some(callback) = &self.events.tx_added {
                let tx = self.transaction_for_hash(&tx_hash);
                if let Some(tx) = tx {
                    callback(&tx);
                }
            }
        }

        result
    }

    /// Removes a transaction along with any transaction that depends on its
    /// outputs.
    pub fn remove_transaction(&self, tx_hash: Hash256) {
        let mut dependents = Vec::new();
        let removed;
        {
            let mut inner = self.lock();
            let Some(tx) = inner.all_tx.get(&tx_hash).cloned() else {
                return;
            };

            for i in (0..inner.tx_order.len()).rev() {
                let other = &inner.all_tx[&inner.tx_order[i]];
                if other.block_height < tx.block_height {
                    break;
                }
                if other.tx_hash == tx_hash {
                    continue;
                }
                if other.inputs.iter().any(|input| input.tx_hash == tx_hash) {
                    dependents.push(other.tx_hash);
                }
            }

            if dependents.is_empty() {
                inner.all_tx.remove(&tx_hash);
                inner.tx_order.retain(|hash| *hash != tx_hash);
                inner.update_balance();
            }
            removed = tx;
        }

        if !dependents.is_empty() {
            for hash in dependents {
                self.remove_transaction(hash);
            }
            self.remove_transaction(tx_hash);
            return;
        }

        // if this was a send and wasn't known to be invalid, notify the user
        let mut notify_user = false;
        let mut recommend_rescan = false;
        let balance;
        {
            let inner = self.lock();
            balance = inner.balance;
            if inner.amount_sent_by_tx(&removed) > 0 && inner.tx_is_valid(&removed) {
                notify_user = true;
                recommend_rescan = true;
                // only recommend a rescan when every input is confirmed
                for input in &removed.inputs {
                    if inner
                        .all_tx
                        .get(&input.tx_hash)
                        .is_some_and(|t| t.block_height == TX_UNCONFIRMED)
                    {
                        recommend_rescan = false;
                        break;
                    }
                }
            }
        }

        if let Some(callback) = &self.events.balance_changed {
            callback(balance);
        }
        if let Some(callback) = &self.events.tx_deleted {
            callback(tx_hash, notify_user, recommend_rescan);
        }
    }

    /// True when no registered transaction spends any of the given
    /// transaction's inputs and no input is invalid.
    pub fn transaction_is_valid(&self, tx: &Transaction) -> bool {
        self.lock().tx_is_valid(tx)
    }

    /// True if the tx cannot be immediately spent, e.g. replace-by-fee or a
    /// future lock time.
    pub fn transaction_is_pending(&self, tx: &Transaction) -> bool {
        self.lock().tx_is_pending(tx)
    }

    /// True if the tx is considered 0-conf safe.
    pub fn transaction_is_verified(&self, tx: &Transaction) -> bool {
        self.lock().tx_is_verified(tx)
    }

    /// Sets block heights and timestamps for the given transactions. Height
    /// TX_UNCONFIRMED with timestamp 0 marks a tx unverified again.
    pub fn update_transactions(&self, tx_hashes: &[Hash256], block_height: u32, timestamp: u32) {
        let mut updated = Vec::new();
        let mut needs_update = false;
        let balance;
        {
            let mut inner = self.lock();
            if block_height != TX_UNCONFIRMED && block_height > inner.block_height {
                inner.block_height = block_height;
            }

            for tx_hash in tx_hashes {
                let Some(tx) = inner.all_tx.get_mut(tx_hash) else {
                    continue;
                };
                if tx.block_height == block_height && tx.timestamp == timestamp {
                    continue;
                }
                tx.block_height = block_height;
                tx.timestamp = timestamp;
                let tx = tx.clone();

                if inner.contains_tx(&tx) {
                    // remove and re-insert to keep the log sorted
                    if let Some(pos) = inner.tx_order.iter().position(|hash| hash == tx_hash) {
                        inner.tx_order.remove(pos);
                        inner.insert_tx(*tx_hash);
                    }
                    updated.push(*tx_hash);
                    if inner.pending_tx.contains(tx_hash) || inner.invalid_tx.contains(tx_hash) {
                        needs_update = true;
                    }
                } else if block_height != TX_UNCONFIRMED {
                    // confirmed non-wallet tx is no longer needed
                    inner.all_tx.remove(tx_hash);
                }
            }

            if needs_update {
                inner.update_balance();
            }
            balance = inner.balance;
        }

        if needs_update {
            if let Some(callback) = &self.events.balance_changed {
                callback(balance);
            }
        }
        if !updated.is_empty() {
            if let Some(callback) = &self.events.tx_updated {
                callback(&updated, block_height, timestamp);
            }
        }
    }

    /// Marks all transactions confirmed above `block_height` as unconfirmed
    /// (for chain reorgs).
    pub fn set_tx_unconfirmed_after(&self, block_height: u32) {
        let mut hashes = Vec::new();
        let balance;
        {
            let mut inner = self.lock();
            inner.block_height = block_height;

            let mut i = inner.tx_order.len();
            while i > 0 && inner.all_tx[&inner.tx_order[i - 1]].block_height > block_height {
                i -= 1;
            }
            hashes.extend_from_slice(&inner.tx_order[i..]);
            for hash in &hashes {
                let tx = inner.all_tx.get_mut(hash).expect("ordered tx registered");
                tx.block_height = TX_UNCONFIRMED;
            }

            if !hashes.is_empty() {
                inner.update_balance();
            }
            balance = inner.balance;
        }

        if !hashes.is_empty() {
            if let Some(callback) = &self.events.balance_changed {
                callback(balance);
            }
            if let Some(callback) = &self.events.tx_updated {
                callback(&hashes, TX_UNCONFIRMED, 0);
            }
        }
    }

    /// Total outputs paying to wallet addresses.
    pub fn amount_received_from_tx(&self, tx: &Transaction) -> u64 {
        let inner = self.lock();
        tx.outputs
            .iter()
            .filter(|output| inner.all_addrs.contains(&output.address))
            .map(|output| output.amount)
            .sum()
    }

    /// Total wallet outputs consumed by the tx, change and fee included.
    pub fn amount_sent_by_tx(&self, tx: &Transaction) -> u64 {
        self.lock().amount_sent_by_tx(tx)
    }

    /// The tx fee, or u64::MAX when an input's prevout is unknown.
    pub fn fee_for_tx(&self, tx: &Transaction) -> u64 {
        let inner = self.lock();
        let mut amount = 0u64;
        for input in &tx.inputs {
            let Some(output) = inner
                .all_tx
                .get(&input.tx_hash)
                .and_then(|prev| prev.outputs.get(input.index as usize))
            else {
                return u64::MAX;
            };
            amount += output.amount;
        }
        for output in &tx.outputs {
            amount = amount.saturating_sub(output.amount);
        }
        amount
    }

    /// Historical balance after the given transaction, or the current
    /// balance when the tx is not registered.
    pub fn balance_after_tx(&self, tx: &Transaction) -> u64 {
        let inner = self.lock();
        for i in (0..inner.tx_order.len()).rev() {
            if inner.tx_order[i] == tx.tx_hash {
                return inner.balance_hist[i];
            }
        }
        inner.balance
    }

    pub fn fee_for_tx_size(&self, size: usize) -> u64 {
        tx_fee(self.lock().fee_per_kb, size)
    }

    /// Fee for sending the given amount, probed with a throwaway tx against
    /// an unspendable dummy script.
    pub fn fee_for_tx_amount(&self, amount: u64) -> u64 {
        let mut dummy_script = vec![OP_DUP, OP_HASH160, 20];
        dummy_script.extend_from_slice(&[0u8; 20]);
        dummy_script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);

        let max_amount = self.max_output_amount();
        let output = TxOutput::new(amount.min(max_amount), dummy_script, self.network);
        match self.create_tx_for_outputs(&[output]) {
            Ok(tx) => self.fee_for_tx(&tx),
            Err(_) => 0,
        }
    }

    /// Outputs below this amount are uneconomical to spend.
    pub fn min_output_amount(&self) -> u64 {
        self.lock().min_output_amount()
    }

    /// Maximum amount that can be sent to a single address after fees.
    pub fn max_output_amount(&self) -> u64 {
        let inner = self.lock();
        let mut amount = 0u64;
        let mut in_count = 0usize;
        for utxo in &inner.utxos {
            let Some(output) = inner
                .all_tx
                .get(&utxo.hash)
                .and_then(|tx| tx.outputs.get(utxo.index as usize))
            else {
                continue;
            };
            in_count += 1;
            amount += output.amount;
        }

        let tx_size = 8
            + varint_size(in_count as u64)
            + TX_INPUT_SIZE * in_count
            + varint_size(2)
            + TX_OUTPUT_SIZE * 2;
        let fee = tx_fee(inner.fee_per_kb, tx_size);
        amount.saturating_sub(fee)
    }

    /// An unsigned transaction sending `amount` to `address`.
    pub fn create_transaction(
        &self,
        amount: u64,
        address: &str,
    ) -> Result<Transaction, WalletError> {
        if !address_is_valid(address, self.network) {
            return Err(WalletError::InvalidAddress);
        }
        let script =
            script_pubkey_for_address(address, self.network).map_err(|_| WalletError::InvalidAddress)?;
        self.create_tx_for_outputs(&[TxOutput::new(amount, script, self.network)])
    }

    /// An unsigned transaction satisfying the given outputs, funded from the
    /// wallet's UTXOs with a change output when worthwhile.
    pub fn create_tx_for_outputs(&self, outputs: &[TxOutput]) -> Result<Transaction, WalletError> {
        if outputs.is_empty() {
            return Err(WalletError::NoOutputs);
        }

        let mut transaction = Transaction::new(self.network);
        let mut amount = 0u64;
        for output in outputs {
            if output.script.is_empty() {
                return Err(WalletError::InvalidAddress);
            }
            transaction.add_output(output.amount, output.script.clone());
            amount += output.amount;
        }

        let min_amount = self.min_output_amount();
        let cpfp_size = 0usize; // child-pays-for-parent sizing stays disabled
        let mut balance = 0u64;
        let mut fee_amount;

        {
            let inner = self.lock();
            fee_amount = tx_fee(inner.fee_per_kb, transaction.size() + TX_OUTPUT_SIZE);

            let utxos = inner.utxos.clone();
            for utxo in &utxos {
                let Some(prev) = inner.all_tx.get(&utxo.hash) else {
                    continue;
                };
                let Some(output) = prev.outputs.get(utxo.index as usize) else {
                    continue;
                };
                transaction.add_input(
                    utxo.hash,
                    utxo.index,
                    output.amount,
                    output.script.clone(),
                    Vec::new(),
                    TXIN_SEQUENCE,
                );

                if transaction.size() + TX_OUTPUT_SIZE > TX_MAX_SIZE {
                    // check for sufficient funds before building a smaller tx
                    let needed = amount
                        + tx_fee(
                            inner.fee_per_kb,
                            10 + utxos.len() * TX_INPUT_SIZE
                                + (outputs.len() + 1) * TX_OUTPUT_SIZE
                                + cpfp_size,
                        );
                    if inner.balance < needed {
                        return Err(WalletError::InsufficientFunds);
                    }
                    drop(inner);

                    let last = outputs.len() - 1;
                    if outputs[last].amount > amount + fee_amount + min_amount - balance {
                        // reduce the last output amount
                        let mut reduced = outputs.to_vec();
                        reduced[last].amount -= amount + fee_amount - balance;
                        return self.create_tx_for_outputs(&reduced);
                    }
                    if last == 0 {
                        return Err(WalletError::InsufficientFunds);
                    }
                    return self.create_tx_for_outputs(&outputs[..last]);
                }

                balance += output.amount;

                // fee amount after adding a change output
                fee_amount =
                    tx_fee(inner.fee_per_kb, transaction.size() + TX_OUTPUT_SIZE + cpfp_size);

                // increase fee to round off the remaining wallet balance to
                // the nearest 100 satoshi
                if inner.balance > amount + fee_amount {
                    fee_amount += (inner.balance - (amount + fee_amount)) % 100;
                }

                if balance == amount + fee_amount || balance >= amount + fee_amount + min_amount {
                    break;
                }
            }
        }

        if balance < amount + fee_amount {
            return Err(WalletError::InsufficientFunds);
        }

        if balance - (amount + fee_amount) > min_amount {
            let change = balance - (amount + fee_amount);
            let address = self.change_address().ok_or(WalletError::KeyDerivation)?;
            let script = script_pubkey_for_address(&address, self.network)
                .map_err(|_| WalletError::InvalidAddress)?;
            transaction.add_output(change, script);
            transaction.shuffle_outputs();
        }

        Ok(transaction)
    }

    /// Signs any inputs the wallet's keys can sign, deriving the keys from
    /// the given seed. Returns true when every input ended up signed.
    pub fn sign_transaction(
        &self,
        tx: &mut Transaction,
        fork_id: u32,
        seed: &[u8],
    ) -> Result<bool, WalletError> {
        let mut internal_indices = Vec::new();
        let mut external_indices = Vec::new();
        {
            let inner = self.lock();
            for input in &tx.inputs {
                for (index, address) in inner.internal_chain.iter().enumerate().rev() {
                    if *address == input.address {
                        internal_indices.push(index as u32);
                    }
                }
                for (index, address) in inner.external_chain.iter().enumerate().rev() {
                    if *address == input.address {
                        external_indices.push(index as u32);
                    }
                }
            }
        }

        let mut keys = priv_key_list(seed, SEQUENCE_INTERNAL_CHAIN, &internal_indices)
            .map_err(|_| WalletError::KeyDerivation)?;
        keys.extend(
            priv_key_list(seed, SEQUENCE_EXTERNAL_CHAIN, &external_indices)
                .map_err(|_| WalletError::KeyDerivation)?,
        );

        let signed = tx.sign(fork_id, &keys);
        if signed {
            log_info!(
                "signed transaction with {} key(s), {} input(s)",
                keys.len(),
                tx.inputs.len()
            );
        }
        Ok(signed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spvd_primitives::hash::sha256d;
    use spvd_primitives::script::p2pkh_script;
    use spvd_primitives::address_hash160;

    fn test_wallet() -> Wallet {
        let mpk = MasterPubKey::from_seed(b"wallet unit test seed").expect("mpk");
        Wallet::new(Vec::new(), mpk, Network::Mainnet).expect("wallet")
    }

    /// A fake coinbase-ish funding tx paying `amount` to `address`.
    fn funding_tx(tag: u8, amount: u64, address: &str) -> Transaction {
        let mut tx = Transaction::new(Network::Mainnet);
        let mut prev = [0u8; 32];
        prev[0] = tag;
        tx.add_input(prev, 0, 0, Vec::new(), vec![0x00, tag], TXIN_SEQUENCE);
        let hash = address_hash160(address).expect("hash160");
        tx.add_output(amount, p2pkh_script(&hash));
        tx.tx_hash = sha256d(&tx.serialize());
        tx
    }

    #[test]
    fn gap_limit_keeps_trailing_unused_addresses() {
        let wallet = test_wallet();
        let addrs = wallet.unused_addrs(SEQUENCE_GAP_LIMIT_EXTERNAL, false);
        assert_eq!(addrs.len(), SEQUENCE_GAP_LIMIT_EXTERNAL as usize);

        // receiving on the first address shifts the window by one
        let funding = funding_tx(1, 100_000, &addrs[0]);
        assert!(wallet.register_transaction(funding));
        let next = wallet.unused_addrs(SEQUENCE_GAP_LIMIT_EXTERNAL, false);
        assert_eq!(next[0], addrs[1]);
        assert!(wallet.address_is_used(&addrs[0]));
    }

    #[test]
    fn register_updates_balance_and_utxos() {
        let wallet = test_wallet();
        let address = wallet.receive_address().expect("receive address");
        let funding = funding_tx(1, 250_000, &address);
        let funding_hash = funding.tx_hash;

        assert!(wallet.register_transaction(funding));
        assert_eq!(wallet.balance(), 250_000);
        assert_eq!(wallet.total_received(), 250_000);
        assert_eq!(wallet.utxos(), vec![OutPoint::new(funding_hash, 0)]);
    }

    #[test]
    fn foreign_tx_is_rejected_but_retained() {
        let wallet = test_wallet();
        let foreign = funding_tx(7, 50_000, "1111111111111111111114oLvT2");
        let hash = foreign.tx_hash;
        assert!(!wallet.register_transaction(foreign));
        assert_eq!(wallet.balance(), 0);
        // still tracked for conflict detection
        assert!(wallet.transaction_for_hash(&hash).is_some());
    }

    #[test]
    fn double_spend_is_invalid_and_balance_unchanged() {
        let wallet = test_wallet();
        let address = wallet.receive_address().expect("address");
        let funding = funding_tx(1, 200_000, &address);
        let funding_hash = funding.tx_hash;
        assert!(wallet.register_transaction(funding));

        let spend_to = wallet.unused_addrs(2, false)[1].clone();
        let hash = address_hash160(&spend_to).expect("hash160");

        let mut spend1 = Transaction::new(Network::Mainnet);
        spend1.add_input(funding_hash, 0, 0, Vec::new(), vec![0x01], TXIN_SEQUENCE);
        spend1.add_output(150_000, p2pkh_script(&hash));
        spend1.tx_hash = sha256d(&spend1.serialize());

        let mut spend2 = Transaction::new(Network::Mainnet);
        spend2.add_input(funding_hash, 0, 0, Vec::new(), vec![0x02], TXIN_SEQUENCE);
        spend2.add_output(140_000, p2pkh_script(&hash));
        spend2.tx_hash = sha256d(&spend2.serialize());

        assert!(wallet.register_transaction(spend1.clone()));
        let balance = wallet.balance();
        assert!(wallet.register_transaction(spend2.clone()));
        assert_eq!(wallet.balance(), balance);
        assert!(!wallet.transaction_is_valid(&spend2));
        assert!(wallet.transaction_is_valid(&spend1));
    }

    #[test]
    fn balance_recompute_is_idempotent() {
        let wallet = test_wallet();
        let address = wallet.receive_address().expect("address");
        for tag in 1..=3u8 {
            assert!(wallet.register_transaction(funding_tx(tag, 100_000, &address)));
        }
        let balance = wallet.balance();
        let received = wallet.total_received();

        {
            let mut inner = wallet.lock();
            inner.update_balance();
        }
        assert_eq!(wallet.balance(), balance);
        assert_eq!(wallet.total_received(), received);
        assert_eq!(
            wallet.balance(),
            wallet
                .utxos()
                .iter()
                .map(|utxo| wallet.transaction_for_hash(&utxo.hash).unwrap().outputs
                    [utxo.index as usize]
                    .amount)
                .sum::<u64>()
        );
    }

    #[test]
    fn remove_transaction_cascades_to_dependents() {
        let wallet = test_wallet();
        let address = wallet.receive_address().expect("address");
        let funding = funding_tx(1, 300_000, &address);
        let funding_hash = funding.tx_hash;
        assert!(wallet.register_transaction(funding));

        let change = wallet.change_address().expect("change address");
        let change_hash = address_hash160(&change).expect("hash160");
        let mut spend = Transaction::new(Network::Mainnet);
        spend.add_input(funding_hash, 0, 0, Vec::new(), vec![0x05], TXIN_SEQUENCE);
        spend.add_output(290_000, p2pkh_script(&change_hash));
        spend.tx_hash = sha256d(&spend.serialize());
        assert!(wallet.register_transaction(spend.clone()));

        wallet.remove_transaction(funding_hash);
        assert!(wallet.transaction_for_hash(&funding_hash).is_none());
        assert!(wallet.transaction_for_hash(&spend.tx_hash).is_none());
        assert_eq!(wallet.balance(), 0);
    }

    #[test]
    fn update_transactions_confirms_and_reorders() {
        let wallet = test_wallet();
        let address = wallet.receive_address().expect("address");
        let funding = funding_tx(1, 100_000, &address);
        let hash = funding.tx_hash;
        assert!(wallet.register_transaction(funding));

        wallet.update_transactions(&[hash], 1000, 1_650_000_000);
        let tx = wallet.transaction_for_hash(&hash).expect("tx");
        assert_eq!(tx.block_height, 1000);
        assert_eq!(tx.timestamp, 1_650_000_000);
        assert_eq!(wallet.block_height(), 1000);
    }

    #[test]
    fn reorg_unconfirms_transactions() {
        let wallet = test_wallet();
        let address = wallet.receive_address().expect("address");
        let funding = funding_tx(1, 100_000, &address);
        let hash = funding.tx_hash;
        assert!(wallet.register_transaction(funding));
        wallet.update_transactions(&[hash], 1000, 1_650_000_000);

        wallet.set_tx_unconfirmed_after(900);
        let tx = wallet.transaction_for_hash(&hash).expect("tx");
        assert_eq!(tx.block_height, TX_UNCONFIRMED);
    }

    #[test]
    fn coin_selection_selects_utxos_and_returns_change() {
        let wallet = test_wallet();
        let address = wallet.receive_address().expect("address");
        // three UTXOs: 50k, 30k, 20k
        assert!(wallet.register_transaction(funding_tx(1, 50_000, &address)));
        assert!(wallet.register_transaction(funding_tx(2, 30_000, &address)));
        assert!(wallet.register_transaction(funding_tx(3, 20_000, &address)));
        assert_eq!(wallet.balance(), 100_000);

        let dest = wallet.unused_addrs(3, false)[2].clone();
        let tx = wallet.create_transaction(60_000, &dest).expect("create tx");

        let total_in: u64 = tx.inputs.iter().map(|input| input.amount).sum();
        let total_out: u64 = tx.outputs.iter().map(|output| output.amount).sum();
        assert_eq!(tx.inputs.len(), 2, "expected the 50k and 30k inputs");
        assert_eq!(total_in, 80_000);
        let fee = total_in - total_out;
        assert!(fee >= ((tx.size() as u64) + 999) / 1000 * TX_FEE_PER_KB);

        // one change output to a fresh internal address
        assert_eq!(tx.outputs.len(), 2);
        let change = tx
            .outputs
            .iter()
            .find(|output| output.amount != 60_000)
            .expect("change output");
        assert!(wallet.contains_address(&change.address));
        assert!(!wallet.address_is_used(&change.address));
        // remaining balance rounds to a multiple of 100
        assert_eq!((wallet.balance() - total_in + change.amount) % 100, 0);
    }

    #[test]
    fn coin_selection_insufficient_funds() {
        let wallet = test_wallet();
        let address = wallet.receive_address().expect("address");
        assert!(wallet.register_transaction(funding_tx(1, 10_000, &address)));

        let dest = wallet.unused_addrs(2, false)[1].clone();
        assert_eq!(
            wallet.create_transaction(50_000, &dest),
            Err(WalletError::InsufficientFunds)
        );
        assert!(matches!(
            wallet.create_tx_for_outputs(&[]),
            Err(WalletError::NoOutputs)
        ));
    }

    #[test]
    fn sign_and_spend_roundtrip() {
        let seed = b"sign and spend seed";
        let mpk = MasterPubKey::from_seed(seed).expect("mpk");
        let wallet = Wallet::new(Vec::new(), mpk, Network::Mainnet).expect("wallet");

        let address = wallet.receive_address().expect("address");
        assert!(wallet.register_transaction(funding_tx(1, 100_000, &address)));

        let dest = wallet.unused_addrs(2, false)[1].clone();
        let mut tx = wallet.create_transaction(40_000, &dest).expect("create");
        assert!(!tx.is_signed());

        let signed = wallet.sign_transaction(&mut tx, 0, seed).expect("sign");
        assert!(signed);
        assert!(tx.is_signed());
        assert_eq!(tx.tx_hash, sha256d(&tx.serialize()));

        // the signed tx parses back identically
        let bytes = tx.serialize();
        let parsed = Transaction::parse(&bytes, Network::Mainnet).expect("parse");
        assert_eq!(parsed.tx_hash, tx.tx_hash);
        assert_eq!(parsed.serialize(), bytes);
    }

    #[test]
    fn pending_classification_rbf_and_locktime() {
        let wallet = test_wallet();
        let address = wallet.receive_address().expect("address");
        let funding = funding_tx(1, 100_000, &address);
        let funding_hash = funding.tx_hash;
        assert!(wallet.register_transaction(funding));

        let hash = address_hash160(&address).expect("hash160");
        let mut rbf = Transaction::new(Network::Mainnet);
        rbf.add_input(funding_hash, 0, 0, Vec::new(), vec![0x01], 0); // sequence 0: RBF
        rbf.add_output(90_000, p2pkh_script(&hash));
        rbf.tx_hash = sha256d(&rbf.serialize());
        assert!(wallet.transaction_is_pending(&rbf));

        let mut dust = Transaction::new(Network::Mainnet);
        dust.add_input(funding_hash, 0, 0, Vec::new(), vec![0x02], TXIN_SEQUENCE);
        dust.add_output(100, p2pkh_script(&hash)); // below min output
        dust.tx_hash = sha256d(&dust.serialize());
        assert!(wallet.transaction_is_pending(&dust));
    }

    #[test]
    fn max_output_amount_accounts_for_fees() {
        let wallet = test_wallet();
        assert_eq!(wallet.max_output_amount(), 0);

        let address = wallet.receive_address().expect("address");
        assert!(wallet.register_transaction(funding_tx(1, 1_000_000, &address)));
        let max = wallet.max_output_amount();
        assert!(max > 0 && max < 1_000_000);
    }
}
