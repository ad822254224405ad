use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use spvd_consensus::constants::{
    BLOOM_DEFAULT_FALSEPOSITIVE_RATE, PROTOCOL_TIMEOUT, SERVICES_NODE_BLOOM,
    SERVICES_NODE_NETWORK, TXIN_SEQUENCE, TX_UNCONFIRMED,
};
use spvd_consensus::{ChainParams, Checkpoint, Hash256, Network};
use spvd_node::{
    Error, NodeEvents, Peer, PeerConnector, PeerInfo, PeerManager, PeerStatus, PingCallback,
};
use spvd_primitives::hash::sha256d;
use spvd_primitives::keys::MasterPubKey;
use spvd_primitives::script::p2pkh_script;
use spvd_primitives::{address_hash160, MerkleBlock, Transaction};
use spvd_wallet::Wallet;

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Default)]
struct SentLog {
    filterload: usize,
    getblocks: usize,
    getheaders: usize,
    getdata_tx: Vec<Hash256>,
    mempool: usize,
    inv: Vec<Hash256>,
    getaddr: usize,
}

struct MockPeer {
    address: SocketAddr,
    services: AtomicU64,
    version: AtomicU32,
    last_block: AtomicU32,
    status: Mutex<PeerStatus>,
    timestamp: AtomicU64,
    flags: AtomicU8,
    fee_per_kb: AtomicU64,
    sent: Mutex<SentLog>,
    pings: Mutex<Vec<PingCallback>>,
    mempool_done: Mutex<Vec<PingCallback>>,
    scheduled_disconnect: Mutex<Option<f64>>,
    disconnected: AtomicBool,
}

impl MockPeer {
    fn new(address: SocketAddr) -> Self {
        Self {
            address,
            services: AtomicU64::new(SERVICES_NODE_NETWORK | SERVICES_NODE_BLOOM),
            version: AtomicU32::new(70013),
            last_block: AtomicU32::new(0),
            status: Mutex::new(PeerStatus::Disconnected),
            timestamp: AtomicU64::new(now()),
            flags: AtomicU8::new(0),
            fee_per_kb: AtomicU64::new(0),
            sent: Mutex::new(SentLog::default()),
            pings: Mutex::new(Vec::new()),
            mempool_done: Mutex::new(Vec::new()),
            scheduled_disconnect: Mutex::new(None),
            disconnected: AtomicBool::new(false),
        }
    }

    fn set_status(&self, status: PeerStatus) {
        *self.status.lock().unwrap() = status;
    }

    fn set_last_block(&self, height: u32) {
        self.last_block.store(height, Ordering::Relaxed);
    }

    /// Drains queued pong callbacks, simulating the session's pump thread.
    fn run_pings(&self, success: bool) {
        let pings: Vec<PingCallback> = self.pings.lock().unwrap().drain(..).collect();
        for ping in pings {
            ping(success);
        }
    }

    fn run_mempool_done(&self, success: bool) {
        let dones: Vec<PingCallback> = self.mempool_done.lock().unwrap().drain(..).collect();
        for done in dones {
            done(success);
        }
    }

    fn was_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Relaxed)
    }

    fn scheduled_timeout(&self) -> Option<f64> {
        *self.scheduled_disconnect.lock().unwrap()
    }

    fn sent(&self) -> std::sync::MutexGuard<'_, SentLog> {
        self.sent.lock().unwrap()
    }
}

impl Peer for MockPeer {
    fn connect(&self) {
        let mut status = self.status.lock().unwrap();
        if *status == PeerStatus::Disconnected {
            *status = PeerStatus::Connecting;
        }
    }

    fn disconnect(&self) {
        self.disconnected.store(true, Ordering::Relaxed);
        *self.status.lock().unwrap() = PeerStatus::Disconnected;
    }

    fn schedule_disconnect(&self, seconds: Option<f64>) {
        *self.scheduled_disconnect.lock().unwrap() = seconds;
    }

    fn connect_status(&self) -> PeerStatus {
        *self.status.lock().unwrap()
    }

    fn address(&self) -> SocketAddr {
        self.address
    }

    fn services(&self) -> u64 {
        self.services.load(Ordering::Relaxed)
    }

    fn version(&self) -> u32 {
        self.version.load(Ordering::Relaxed)
    }

    fn last_block(&self) -> u32 {
        self.last_block.load(Ordering::Relaxed)
    }

    fn ping_time(&self) -> f64 {
        0.5
    }

    fn fee_per_kb(&self) -> u64 {
        self.fee_per_kb.load(Ordering::Relaxed)
    }

    fn timestamp(&self) -> u64 {
        self.timestamp.load(Ordering::Relaxed)
    }

    fn set_timestamp(&self, timestamp: u64) {
        self.timestamp.store(timestamp, Ordering::Relaxed);
    }

    fn flags(&self) -> u8 {
        self.flags.load(Ordering::Relaxed)
    }

    fn set_flags(&self, flags: u8) {
        self.flags.store(flags, Ordering::Relaxed);
    }

    fn send_filterload(&self, _filter: &[u8]) {
        self.sent().filterload += 1;
    }

    fn send_getblocks(&self, _locators: &[Hash256]) {
        self.sent().getblocks += 1;
    }

    fn send_getheaders(&self, _locators: &[Hash256]) {
        self.sent().getheaders += 1;
    }

    fn send_getdata(&self, tx_hashes: &[Hash256], _block_hashes: &[Hash256]) {
        self.sent().getdata_tx.extend_from_slice(tx_hashes);
    }

    fn send_mempool(&self, _known_tx_hashes: &[Hash256], done: Option<PingCallback>) {
        self.sent().mempool += 1;
        if let Some(done) = done {
            self.mempool_done.lock().unwrap().push(done);
        }
    }

    fn send_inv(&self, tx_hashes: &[Hash256]) {
        self.sent().inv.extend_from_slice(tx_hashes);
    }

    fn send_ping(&self, done: PingCallback) {
        self.pings.lock().unwrap().push(done);
    }

    fn send_getaddr(&self) {
        self.sent().getaddr += 1;
    }

    fn rerequest_blocks(&self, _from_block: &Hash256) {}

    fn set_current_block_height(&self, _height: u32) {}

    fn set_needs_filter_update(&self, _needs_update: bool) {}

    fn set_earliest_key_time(&self, _time: u32) {}
}

/// Hands out mock sessions and keeps handles to them for the tests.
struct MockConnector {
    made: Arc<Mutex<Vec<Arc<MockPeer>>>>,
}

impl PeerConnector for MockConnector {
    fn make_peer(&self, info: &PeerInfo, _manager: &Arc<PeerManager>) -> Arc<dyn Peer> {
        let peer = Arc::new(MockPeer::new(info.address));
        self.made.lock().unwrap().push(Arc::clone(&peer));
        peer
    }
}

fn genesis_block(timestamp: u32) -> MerkleBlock {
    MerkleBlock {
        block_hash: sha256d(b"test genesis"),
        timestamp,
        target: 0x1d00ffff,
        height: 0,
        ..MerkleBlock::default()
    }
}

fn test_params(genesis: &MerkleBlock) -> ChainParams {
    ChainParams {
        network: Network::Mainnet,
        magic: 0xd9b4_bef9,
        standard_port: 8333,
        services: 0,
        dns_seeds: Vec::new(),
        checkpoints: vec![Checkpoint {
            height: 0,
            hash: genesis.block_hash,
            timestamp: genesis.timestamp,
            target: genesis.target,
        }],
        verify_difficulty: |_, _, _| true,
    }
}

/// A merkle block with a single transaction; `matched` marks it as a filter
/// hit.
fn make_block(
    height: u32,
    tag: u8,
    prev_block: Hash256,
    timestamp: u32,
    txid: Hash256,
    matched: bool,
) -> MerkleBlock {
    let mut block_hash = sha256d(&[tag, height as u8, (height >> 8) as u8]);
    block_hash[31] = tag;
    MerkleBlock {
        block_hash,
        prev_block,
        merkle_root: txid,
        timestamp,
        target: 0x1d00ffff,
        total_tx: 1,
        hashes: vec![txid],
        flags: vec![if matched { 0x01 } else { 0x00 }],
        ..MerkleBlock::default()
    }
}

/// A signed-looking funding tx paying `amount` to `address`.
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

fn peer_addr(tag: u8) -> SocketAddr {
    format!("10.0.0.{tag}:8333").parse().expect("socket addr")
}

struct Harness {
    manager: Arc<PeerManager>,
    wallet: Arc<Wallet>,
    peer: Arc<MockPeer>,
    peer_dyn: Arc<dyn Peer>,
    genesis: MerkleBlock,
    block_time: u32,
    sync_stopped: Arc<Mutex<Vec<Option<Error>>>>,
    saved_blocks: Arc<Mutex<Vec<(bool, usize)>>>,
}

impl Harness {
    /// Completes the initial mempool round so the manager leaves the
    /// syncing state.
    fn settle(&self) {
        self.peer.run_pings(true);
        self.peer.run_mempool_done(true);
    }

    fn relay_block(&self, block: MerkleBlock) {
        self.manager.peer_relayed_block(&self.peer_dyn, block);
    }
}

/// Spins up a manager connected to one mock peer advertising
/// `peer_last_block`, elected as the download peer.
fn harness(peer_last_block: u32) -> Harness {
    let genesis_time = (now() - 100 * 24 * 3600) as u32;
    let genesis = genesis_block(genesis_time);
    let params = test_params(&genesis);
    let mpk = MasterPubKey::from_seed(b"node harness wallet seed").expect("mpk");
    let wallet = Arc::new(Wallet::new(Vec::new(), mpk, Network::Mainnet).expect("wallet"));

    let sync_stopped = Arc::new(Mutex::new(Vec::new()));
    let saved_blocks = Arc::new(Mutex::new(Vec::new()));
    let made = Arc::new(Mutex::new(Vec::new()));

    let mut manager = PeerManager::new(
        params,
        Arc::clone(&wallet),
        genesis_time,
        Vec::new(),
        Vec::new(),
        BLOOM_DEFAULT_FALSEPOSITIVE_RATE,
        Box::new(MockConnector {
            made: Arc::clone(&made),
        }),
    );
    let stopped = Arc::clone(&sync_stopped);
    let saved = Arc::clone(&saved_blocks);
    manager.set_events(NodeEvents {
        sync_stopped: Some(Box::new(move |error| {
            stopped.lock().unwrap().push(error);
        })),
        save_blocks: Some(Box::new(move |replace, blocks| {
            saved.lock().unwrap().push((replace, blocks.len()));
        })),
        ..NodeEvents::default()
    });
    let manager = Arc::new(manager);

    manager.set_fixed_peer(Some(PeerInfo {
        address: peer_addr(1),
        services: SERVICES_NODE_NETWORK | SERVICES_NODE_BLOOM,
        timestamp: now(),
    }));
    manager.connect();

    let peer = made.lock().unwrap().pop().expect("session created");
    assert_eq!(peer.connect_status(), PeerStatus::Connecting);
    peer.set_status(PeerStatus::Connected);
    peer.set_last_block(peer_last_block);
    let peer_dyn: Arc<dyn Peer> = peer.clone();
    manager.peer_connected(&peer_dyn);

    Harness {
        manager,
        wallet,
        peer,
        peer_dyn,
        genesis,
        block_time: (now() - 3600) as u32,
        sync_stopped,
        saved_blocks,
    }
}

#[test]
fn download_peer_election_loads_filter_and_starts_sync() {
    let h = harness(5);
    assert_eq!(h.manager.download_peer_name(), peer_addr(1).to_string());
    assert_eq!(h.manager.connect_status(), PeerStatus::Connected);
    assert_eq!(h.manager.estimated_block_height(), 5);

    {
        let sent = h.peer.sent();
        assert_eq!(sent.filterload, 1);
        // the tip is within a week of the key time, so blocks are requested
        assert_eq!(sent.getblocks, 1);
        assert_eq!(sent.getheaders, 0);
    }
    assert_eq!(h.peer.scheduled_timeout(), Some(PROTOCOL_TIMEOUT));
    assert!(h.manager.sync_progress(0) < 1.0);
}

#[test]
fn chain_extension_confirms_wallet_transactions() {
    let h = harness(3);
    let address = h.wallet.receive_address().expect("address");
    let funding = funding_tx(9, 150_000, &address);
    let funding_hash = funding.tx_hash;
    assert!(h.wallet.register_transaction(funding));

    let time = h.block_time;
    let b1 = make_block(1, 0xa1, h.genesis.block_hash, time, [0x11; 32], false);
    let b2 = make_block(2, 0xa2, b1.block_hash, time + 600, funding_hash, true);
    let b3 = make_block(3, 0xa3, b2.block_hash, time + 1200, [0x13; 32], false);

    h.relay_block(b1);
    h.relay_block(b2);
    assert_eq!(h.manager.last_block_height(), 2);

    let confirmed = h.wallet.transaction_for_hash(&funding_hash).expect("tx");
    assert_eq!(confirmed.block_height, 2);
    assert!(confirmed.timestamp > 0);

    h.relay_block(b3);
    assert_eq!(h.manager.last_block_height(), 3);
}

#[test]
fn reorg_unconfirms_and_replays_the_new_chain() {
    let h = harness(6);
    let address = h.wallet.receive_address().expect("address");
    let funding = funding_tx(9, 150_000, &address);
    let funding_hash = funding.tx_hash;
    assert!(h.wallet.register_transaction(funding));

    let time = h.block_time;
    // main chain: A..E on genesis, the wallet tx confirms in D (height 4)
    let a = make_block(1, 0xa1, h.genesis.block_hash, time, [0x11; 32], false);
    let b = make_block(2, 0xa2, a.block_hash, time + 600, [0x12; 32], false);
    let c = make_block(3, 0xa3, b.block_hash, time + 1200, [0x13; 32], false);
    let d = make_block(4, 0xa4, c.block_hash, time + 1800, funding_hash, true);
    let e = make_block(5, 0xa5, d.block_hash, time + 2400, [0x15; 32], false);
    for block in [&a, &b, &c, &d, &e] {
        h.relay_block(block.clone());
    }
    assert_eq!(h.manager.last_block_height(), 5);
    assert_eq!(
        h.wallet
            .transaction_for_hash(&funding_hash)
            .expect("tx")
            .block_height,
        4
    );

    // fork from B: C' D' E' F' overtakes the main chain
    let c2 = make_block(3, 0xb3, b.block_hash, time + 1300, [0x23; 32], false);
    let d2 = make_block(4, 0xb4, c2.block_hash, time + 1900, [0x24; 32], false);
    let e2 = make_block(5, 0xb5, d2.block_hash, time + 2500, [0x25; 32], false);
    let f2 = make_block(6, 0xb6, e2.block_hash, time + 3100, [0x26; 32], false);
    for block in [&c2, &d2, &e2] {
        h.relay_block(block.clone());
    }
    // the fork is not longer yet, so the tip is unchanged
    assert_eq!(h.manager.last_block_height(), 5);

    h.relay_block(f2);
    assert_eq!(h.manager.last_block_height(), 6);

    // the wallet tx confirmed on the abandoned branch is unconfirmed again
    assert_eq!(
        h.wallet
            .transaction_for_hash(&funding_hash)
            .expect("tx")
            .block_height,
        TX_UNCONFIRMED
    );

    // completing the sync on the new chain saved it with replace semantics
    let saved = h.saved_blocks.lock().unwrap();
    assert!(saved.iter().any(|(replace, count)| *replace && *count > 1));
}

#[test]
fn orphan_is_adopted_once_its_parent_arrives() {
    let h = harness(3);
    let time = h.block_time;
    let a = make_block(1, 0xa1, h.genesis.block_hash, time, [0x11; 32], false);
    let b = make_block(2, 0xa2, a.block_hash, time + 600, [0x12; 32], false);

    // the child arrives before its parent
    h.relay_block(b);
    assert_eq!(h.manager.last_block_height(), 0);

    h.relay_block(a);
    assert_eq!(h.manager.last_block_height(), 2);
}

#[test]
fn bloom_false_positive_flood_disconnects_download_peer() {
    let h = harness(800);
    let time = h.block_time;

    let mut prev = h.genesis.block_hash;
    for height in 1..=700u32 {
        // every matched tx is unknown to the wallet: a false positive
        let mut txid = sha256d(&height.to_le_bytes());
        txid[0] = 0x7f;
        let block = make_block(
            height,
            0xc0 ^ (height as u8),
            prev,
            time + height,
            txid,
            true,
        );
        prev = block.block_hash;
        h.relay_block(block);
        if h.peer.was_disconnected() {
            break;
        }
    }

    assert!(
        h.peer.was_disconnected(),
        "sustained false positives must disconnect the download peer"
    );
}

#[test]
fn publish_times_out_after_protocol_timeout() {
    let h = harness(0);
    h.settle();
    assert_eq!(h.sync_stopped.lock().unwrap().as_slice(), &[None]);

    // a foreign but signed tx is enough for the publish pipeline
    let tx = funding_tx(0x44, 80_000, "1111111111111111111114oLvT2");
    let tx_hash = tx.tx_hash;

    let result = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&result);
    h.manager.publish_tx(
        tx,
        Some(Box::new(move |error| {
            sink.lock().unwrap().push(error);
        })),
    );

    // the tx was announced and the publish watchdog armed
    assert!(h.peer.sent().inv.contains(&tx_hash));
    assert_eq!(h.peer.scheduled_timeout(), Some(PROTOCOL_TIMEOUT));
    assert!(result.lock().unwrap().is_empty());

    // no peer answered before the watchdog fired
    h.manager
        .peer_disconnected(&h.peer_dyn, Some(Error::Timeout));
    assert_eq!(result.lock().unwrap().as_slice(), &[Some(Error::Timeout)]);
    assert_eq!(h.manager.relay_count(&tx_hash), 0);
}

#[test]
fn publish_succeeds_when_a_peer_relays_the_tx_back() {
    let h = harness(0);
    h.settle();

    let tx = funding_tx(0x45, 90_000, "1111111111111111111114oLvT2");
    let tx_hash = tx.tx_hash;

    let result = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&result);
    h.manager.publish_tx(
        tx.clone(),
        Some(Box::new(move |error| {
            sink.lock().unwrap().push(error);
        })),
    );
    assert_eq!(h.peer.scheduled_timeout(), Some(PROTOCOL_TIMEOUT));

    h.manager.peer_relayed_tx(&h.peer_dyn, tx);
    assert_eq!(result.lock().unwrap().as_slice(), &[None]);
    assert_eq!(h.manager.relay_count(&tx_hash), 1);
    // the publish timeout was cancelled
    assert_eq!(h.peer.scheduled_timeout(), None);
}

#[test]
fn unsigned_publish_fails_immediately() {
    let h = harness(0);
    let mut tx = Transaction::new(Network::Mainnet);
    tx.add_input(
        [0x31; 32],
        0,
        1000,
        p2pkh_script(&[0x32; 20]),
        Vec::new(),
        TXIN_SEQUENCE,
    );
    tx.add_output(900, p2pkh_script(&[0x33; 20]));

    let result = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&result);
    h.manager.publish_tx(
        tx,
        Some(Box::new(move |error| {
            sink.lock().unwrap().push(error);
        })),
    );
    assert_eq!(
        result.lock().unwrap().as_slice(),
        &[Some(Error::InvalidInput)]
    );
}

#[test]
fn sync_completes_through_mempool_reconciliation() {
    let h = harness(3);
    let time = h.block_time;

    let mut prev = h.genesis.block_hash;
    for height in 1..=3u32 {
        let block = make_block(
            height,
            0xd0 + height as u8,
            prev,
            time + height * 600,
            sha256d(&[height as u8]),
            false,
        );
        prev = block.block_hash;
        h.relay_block(block);
    }
    assert_eq!(h.manager.last_block_height(), 3);
    assert!(h.sync_stopped.lock().unwrap().is_empty());

    // reaching the estimated height kicks off the mempool round:
    // filterload, then a ping barrier, then mempool, then done
    h.settle();

    assert_eq!(h.sync_stopped.lock().unwrap().as_slice(), &[None]);
    assert!(h.peer.sent().getaddr > 0);
    assert_eq!(h.manager.sync_progress(0), 1.0);
}

#[test]
fn rejected_send_resets_verification() {
    let h = harness(0);
    h.settle();

    let address = h.wallet.receive_address().expect("address");
    let funding = funding_tx(0x50, 120_000, &address);
    let funding_hash = funding.tx_hash;
    assert!(h.wallet.register_transaction(funding.clone()));

    // a peer announces it, counting toward verification
    h.manager.peer_has_tx(&h.peer_dyn, funding_hash);
    assert_eq!(h.manager.relay_count(&funding_hash), 1);

    // then rejects it: the relay is withdrawn and the tx unverified
    h.manager.peer_rejected_tx(&h.peer_dyn, funding_hash, 0x42);
    assert_eq!(h.manager.relay_count(&funding_hash), 0);
    let tx = h.wallet.transaction_for_hash(&funding_hash).expect("tx");
    assert_eq!(tx.timestamp, 0);
    assert_eq!(tx.block_height, TX_UNCONFIRMED);
}
