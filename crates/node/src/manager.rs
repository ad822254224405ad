use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use spvd_consensus::constants::{
    BLOCK_DIFFICULTY_INTERVAL, BLOCK_UNKNOWN_HEIGHT, BLOOM_DEFAULT_FALSEPOSITIVE_RATE,
    BLOOM_REDUCED_FALSEPOSITIVE_RATE, BLOOM_UPDATE_ALL, DEFAULT_FEE_PER_KB, MAX_CONNECT_FAILURES,
    MAX_FEE_PER_KB, PEER_MAX_CONNECTIONS, PROTOCOL_TIMEOUT, REJECT_SPENT, SEQUENCE_GAP_LIMIT_EXTERNAL,
    SEQUENCE_GAP_LIMIT_INTERNAL, SERVICES_NODE_BLOOM, SERVICES_NODE_NETWORK, TX_UNCONFIRMED,
};
use spvd_consensus::{ChainParams, Hash256};
use spvd_log::{log_debug, log_info, log_warn, ShortHash};
use spvd_primitives::{address_hash160, BloomFilter, MerkleBlock, OutPoint, Transaction};
use spvd_wallet::Wallet;

use crate::blockstore::BlockStore;
use crate::peer::{
    same_peer, Peer, PeerConnector, PeerInfo, PeerStatus, PEER_FLAG_NEEDS_FILTER_UPDATE,
    PEER_FLAG_SYNCED,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// No network, or no peer could be reached.
    Unreachable,
    NotConnected,
    Timeout,
    /// The peer violated protocol policy.
    ProtocolViolation,
    /// Unsigned tx published, or no signable inputs.
    InvalidInput,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Unreachable => write!(f, "network unreachable"),
            Error::NotConnected => write!(f, "not connected to the network"),
            Error::Timeout => write!(f, "peer protocol timeout"),
            Error::ProtocolViolation => write!(f, "peer protocol violation"),
            Error::InvalidInput => write!(f, "invalid transaction"),
        }
    }
}

impl std::error::Error for Error {}

pub type PublishCallback = Box<dyn FnOnce(Option<Error>) + Send>;

type SyncStopped = Box<dyn Fn(Option<Error>) + Send + Sync>;
type SaveBlocks = Box<dyn Fn(bool, &[MerkleBlock]) + Send + Sync>;
type SavePeers = Box<dyn Fn(bool, &[PeerInfo]) + Send + Sync>;

/// Host notifications; every callback fires with the manager lock released.
#[derive(Default)]
pub struct NodeEvents {
    pub sync_started: Option<Box<dyn Fn() + Send + Sync>>,
    pub sync_stopped: Option<SyncStopped>,
    pub tx_status_update: Option<Box<dyn Fn() + Send + Sync>>,
    /// (replace, blocks): persist blocks, clearing old ones when replace.
    pub save_blocks: Option<SaveBlocks>,
    /// (replace, peers)
    pub save_peers: Option<SavePeers>,
    pub network_is_reachable: Option<Box<dyn Fn() -> bool + Send + Sync>>,
    /// Fires from a worker thread right before it terminates.
    pub thread_cleanup: Option<Box<dyn Fn() + Send + Sync>>,
}

struct PublishedTx {
    tx: Transaction,
    callback: Option<PublishCallback>,
}

/// Per-tx lists of peers, for relay and request bookkeeping.
#[derive(Default)]
struct TxPeerList {
    entries: Vec<(Hash256, Vec<SocketAddr>)>,
}

impl TxPeerList {
    fn has_peer(&self, tx_hash: &Hash256, addr: SocketAddr) -> bool {
        self.entries
            .iter()
            .find(|(hash, _)| hash == tx_hash)
            .is_some_and(|(_, peers)| peers.contains(&addr))
    }

    fn count(&self, tx_hash: &Hash256) -> usize {
        self.entries
            .iter()
            .find(|(hash, _)| hash == tx_hash)
            .map_or(0, |(_, peers)| peers.len())
    }

    /// Adds the peer and returns the new count for the tx.
    fn add_peer(&mut self, tx_hash: Hash256, addr: SocketAddr) -> usize {
        if let Some((_, peers)) = self.entries.iter_mut().find(|(hash, _)| *hash == tx_hash) {
            if !peers.contains(&addr) {
                peers.push(addr);
            }
            return peers.len();
        }
        self.entries.push((tx_hash, vec![addr]));
        1
    }

    fn remove_peer(&mut self, tx_hash: &Hash256, addr: SocketAddr) -> bool {
        if let Some((_, peers)) = self.entries.iter_mut().find(|(hash, _)| hash == tx_hash) {
            if let Some(pos) = peers.iter().position(|peer| *peer == addr) {
                peers.remove(pos);
                return true;
            }
        }
        false
    }

    fn remove_tx(&mut self, tx_hash: &Hash256) {
        self.entries.retain(|(hash, _)| hash != tx_hash);
    }

    fn remove_peer_everywhere(&mut self, addr: SocketAddr) {
        for (_, peers) in &mut self.entries {
            peers.retain(|peer| *peer != addr);
        }
    }
}

struct ManagerInner {
    is_connected: bool,
    connect_failure_count: u32,
    misbehavin_count: u32,
    dns_thread_count: u32,
    max_connect_count: usize,
    peers: Vec<PeerInfo>,
    connected_peers: Vec<Arc<dyn Peer>>,
    download_peer: Option<Arc<dyn Peer>>,
    fixed_peer: Option<PeerInfo>,
    sync_start_height: u32,
    filter_update_height: u32,
    estimated_height: u32,
    bloom_filter: Option<BloomFilter>,
    fp_rate: f64,
    average_tx_per_block: f64,
    store: BlockStore,
    tx_relays: TxPeerList,
    tx_requests: TxPeerList,
    published_tx: Vec<PublishedTx>,
    published_tx_hashes: Vec<Hash256>,
}

pub struct PeerManager {
    params: ChainParams,
    wallet: Arc<Wallet>,
    earliest_key_time: u32,
    connector: Box<dyn PeerConnector>,
    events: NodeEvents,
    inner: Mutex<ManagerInner>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn peer_nonce(peer: &dyn Peer) -> u32 {
    let mut hasher = DefaultHasher::new();
    peer.address().hash(&mut hasher);
    hasher.finish() as u32
}

fn lookup_host(host: &str, port: u16) -> Vec<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .map(|addrs| addrs.collect())
        .unwrap_or_default()
}

/// Ends the sync phase; the sync timeout survives while a publish callback
/// is still pending.
fn sync_stopped_internal(inner: &mut ManagerInner) {
    inner.sync_start_height = 0;

    if let Some(download_peer) = &inner.download_peer {
        if inner
            .published_tx
            .iter()
            .any(|published| published.callback.is_some())
        {
            return;
        }
        download_peer.schedule_disconnect(None);
    }
}

fn remove_published(inner: &mut ManagerInner, tx_hash: &Hash256) {
    let mut i = inner.published_tx_hashes.len();
    while i > 0 {
        i -= 1;
        if inner.published_tx_hashes[i] == *tx_hash {
            inner.published_tx_hashes.remove(i);
            inner.published_tx.remove(i);
        }
    }
}

impl PeerManager {
    /// `saved_blocks` and `saved_peers` restore previous session state;
    /// `fp_rate` is the starting bloom false-positive rate. Set events
    /// before wrapping in an `Arc` and calling `connect`.
    pub fn new(
        params: ChainParams,
        wallet: Arc<Wallet>,
        earliest_key_time: u32,
        saved_blocks: Vec<MerkleBlock>,
        saved_peers: Vec<PeerInfo>,
        fp_rate: f64,
        connector: Box<dyn PeerConnector>,
    ) -> Self {
        let store = BlockStore::new(&params, earliest_key_time, saved_blocks);
        let mut peers = saved_peers;
        peers.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        Self {
            params,
            wallet,
            earliest_key_time,
            connector,
            events: NodeEvents::default(),
            inner: Mutex::new(ManagerInner {
                is_connected: false,
                connect_failure_count: 0,
                misbehavin_count: 0,
                dns_thread_count: 0,
                max_connect_count: PEER_MAX_CONNECTIONS,
                peers,
                connected_peers: Vec::new(),
                download_peer: None,
                fixed_peer: None,
                sync_start_height: 0,
                filter_update_height: 0,
                estimated_height: 0,
                bloom_filter: None,
                fp_rate,
                average_tx_per_block: 1400.0,
                store,
                tx_relays: TxPeerList::default(),
                tx_requests: TxPeerList::default(),
                published_tx: Vec::new(),
                published_tx_hashes: Vec::new(),
            }),
        }
    }

    /// Not thread-safe; set once before the manager is shared.
    pub fn set_events(&mut self, events: NodeEvents) {
        self.events = events;
    }

    pub fn wallet(&self) -> &Arc<Wallet> {
        &self.wallet
    }

    pub fn standard_port(&self) -> u16 {
        self.params.standard_port
    }

    fn lock(&self) -> MutexGuard<'_, ManagerInner> {
        self.inner.lock().expect("peer manager lock")
    }

    // ---- public control surface ----

    /// Connects to the peer-to-peer network; call again whenever
    /// reachability changes.
    pub fn connect(self: &Arc<Self>) {
        let mut unreachable = false;
        {
            let mut inner = self.lock();
            if inner.connect_failure_count >= MAX_CONNECT_FAILURES {
                inner.connect_failure_count = 0; // manual retry
            }

            if (inner.download_peer.is_none()
                || inner.store.tip().height < inner.estimated_height)
                && inner.sync_start_height == 0
            {
                inner.sync_start_height = inner.store.tip().height + 1;
                drop(inner);
                if let Some(callback) = &self.events.sync_started {
                    callback();
                }
                inner = self.lock();
            }

            for peer in inner.connected_peers.clone() {
                if peer.connect_status() == PeerStatus::Connecting {
                    peer.connect();
                }
            }

            if inner.connected_peers.len() < inner.max_connect_count {
                let now = now_secs();
                let stale = inner.peers.len() < inner.max_connect_count
                    || inner
                        .peers
                        .get(inner.max_connect_count - 1)
                        .is_some_and(|peer| peer.timestamp + 3 * 24 * 3600 < now);
                if stale {
                    inner = self.find_peers(inner);
                }

                let mut candidates: Vec<PeerInfo> =
                    inner.peers.iter().take(100).copied().collect();
                while !candidates.is_empty()
                    && inner.connected_peers.len() < inner.max_connect_count
                {
                    // random pick with a quadratic bias toward recent peers
                    let mut i = spvd_primitives::spv_rand(candidates.len() as u32) as usize;
                    i = i * i / candidates.len();
                    let candidate = candidates.remove(i);

                    if inner
                        .connected_peers
                        .iter()
                        .any(|peer| peer.address() == candidate.address)
                    {
                        continue;
                    }

                    let peer = self.connector.make_peer(&candidate, self);
                    peer.set_earliest_key_time(self.earliest_key_time);
                    inner.connected_peers.push(Arc::clone(&peer));
                    peer.connect();
                }
            }

            if inner.connected_peers.is_empty() {
                log_warn!("sync failed, no connectable peers");
                sync_stopped_internal(&mut inner);
                unreachable = true;
            }
        }

        if unreachable {
            if let Some(callback) = &self.events.sync_stopped {
                callback(Some(Error::Unreachable));
            }
        }
    }

    /// Disconnects every peer and waits for sessions and DNS lookups to
    /// wind down.
    pub fn disconnect(&self) {
        let (mut peer_count, mut dns_count);
        {
            let mut inner = self.lock();
            peer_count = inner.connected_peers.len();
            dns_count = inner.dns_thread_count;
            inner.connect_failure_count = MAX_CONNECT_FAILURES; // no auto-reconnect
            for peer in &inner.connected_peers {
                peer.disconnect();
            }
        }

        while peer_count > 0 || dns_count > 0 {
            std::thread::sleep(Duration::from_nanos(1));
            let inner = self.lock();
            peer_count = inner.connected_peers.len();
            dns_count = inner.dns_thread_count;
        }
    }

    /// Restarts the chain download from the last checkpoint before the
    /// wallet's creation time. A new random download peer is selected, since
    /// a malicious node might have omitted matching transactions.
    pub fn rescan(self: &Arc<Self>) {
        let connected;
        {
            let mut inner = self.lock();
            connected = inner.is_connected;
            if connected {
                for i in (0..self.params.checkpoints.len()).rev() {
                    let checkpoint = &self.params.checkpoints[i];
                    if i == 0
                        || checkpoint.timestamp + 7 * 24 * 60 * 60 < self.earliest_key_time
                    {
                        inner.store.set_tip(checkpoint.hash);
                        break;
                    }
                }

                if let Some(download_peer) = inner.download_peer.clone() {
                    let addr = download_peer.address();
                    inner.peers.retain(|peer| peer.address != addr);
                    download_peer.disconnect();
                }
                inner.sync_start_height = 0;
            }
        }
        if connected {
            self.connect();
        }
    }

    /// Publishes a signed transaction; the callback fires once a peer
    /// relays it back, or with an error.
    pub fn publish_tx(self: &Arc<Self>, mut tx: Transaction, callback: Option<PublishCallback>) {
        if !tx.is_signed() {
            if let Some(callback) = callback {
                callback(Some(Error::InvalidInput));
            }
            return;
        }

        let mut inner = self.lock();
        if !inner.is_connected {
            let failures = inner.connect_failure_count;
            drop(inner);
            if failures >= MAX_CONNECT_FAILURES || !self.network_is_reachable() {
                if let Some(callback) = callback {
                    callback(Some(Error::NotConnected));
                }
                return;
            }
            inner = self.lock();
        }

        tx.timestamp = now_secs() as u32; // set timestamp to publish time
        self.add_tx_to_publish_list(&mut inner, tx, callback);

        let connected: Vec<Arc<dyn Peer>> = inner
            .connected_peers
            .iter()
            .filter(|peer| peer.connect_status() == PeerStatus::Connected)
            .cloned()
            .collect();

        for peer in &connected {
            // leave out the download peer so the tx is verified by relay,
            // unless it's the only one
            let is_download = inner
                .download_peer
                .as_ref()
                .is_some_and(|download| same_peer(download.as_ref(), peer.as_ref()));
            if is_download && connected.len() > 1 {
                continue;
            }

            publish_pending_tx(&inner, peer.as_ref());
            let manager = Arc::clone(self);
            let ping_peer = Arc::clone(peer);
            peer.send_ping(Box::new(move |_success| {
                manager.publish_tx_inv_done(&ping_peer);
            }));
        }
    }

    /// Number of connected peers that have relayed the transaction.
    pub fn relay_count(&self, tx_hash: &Hash256) -> usize {
        self.lock().tx_relays.count(tx_hash)
    }

    /// Restricts connections to a single peer; None reverts to discovery.
    pub fn set_fixed_peer(&self, peer: Option<PeerInfo>) {
        self.disconnect();
        let mut inner = self.lock();
        inner.max_connect_count = if peer.is_some() {
            1
        } else {
            PEER_MAX_CONNECTIONS
        };
        inner.fixed_peer = peer;
        inner.peers.clear();
    }

    pub fn connect_status(&self) -> PeerStatus {
        let inner = self.lock();
        if inner.is_connected {
            return PeerStatus::Connected;
        }
        for peer in &inner.connected_peers {
            if peer.connect_status() != PeerStatus::Disconnected {
                return PeerStatus::Connecting;
            }
        }
        PeerStatus::Disconnected
    }

    /// The (unverified) best height reported by connected peers.
    pub fn estimated_block_height(&self) -> u32 {
        let inner = self.lock();
        inner.estimated_height.max(inner.store.tip().height)
    }

    /// Current proof-of-work verified best height.
    pub fn last_block_height(&self) -> u32 {
        self.lock().store.tip().height
    }

    pub fn last_block_timestamp(&self) -> u32 {
        self.lock().store.tip().timestamp
    }

    /// Sync progress in [0, 1]. `start_height` is the height the most
    /// recent completed sync began from (0 uses the current sync).
    pub fn sync_progress(&self, start_height: u32) -> f64 {
        let inner = self.lock();
        let start = if start_height == 0 {
            inner.sync_start_height
        } else {
            start_height
        };
        let tip = inner.store.tip().height;

        if inner.download_peer.is_none() && inner.sync_start_height == 0 {
            0.0
        } else if inner.download_peer.is_none() || tip < inner.estimated_height {
            if tip > start && inner.estimated_height > start {
                0.1 + 0.9 * (tip - start) as f64 / (inner.estimated_height - start) as f64
            } else {
                0.05
            }
        } else {
            1.0
        }
    }

    pub fn peer_count(&self) -> usize {
        self.lock()
            .connected_peers
            .iter()
            .filter(|peer| peer.connect_status() != PeerStatus::Disconnected)
            .count()
    }

    pub fn download_peer_name(&self) -> String {
        self.lock()
            .download_peer
            .as_ref()
            .map(|peer| peer.address().to_string())
            .unwrap_or_default()
    }

    pub fn network_is_reachable(&self) -> bool {
        self.events
            .network_is_reachable
            .as_ref()
            .map_or(true, |callback| callback())
    }

    /// For worker and session threads to call right before they exit.
    pub fn thread_cleanup(&self) {
        if let Some(callback) = &self.events.thread_cleanup {
            callback();
        }
    }

    // ---- peer session handlers ----

    pub fn peer_connected(self: &Arc<Self>, peer: &Arc<dyn Peer>) {
        let mut inner = self.lock();
        let now = now_secs();

        // sanity check the advertised timestamp
        if peer.timestamp() > now + 2 * 3600 || peer.timestamp() + 2 * 3600 < now {
            peer.set_timestamp(now);
        }

        if (peer.services() & self.params.services) != self.params.services {
            log_info!("{}: unsupported node type", peer.address());
            peer.disconnect();
        } else if (peer.services() & SERVICES_NODE_NETWORK) != SERVICES_NODE_NETWORK {
            log_info!("{}: node doesn't carry full blocks", peer.address());
            peer.disconnect();
        } else if peer.last_block() + 10 < inner.store.tip().height {
            log_info!("{}: node isn't synced", peer.address());
            peer.disconnect();
        } else if peer.version() >= 70011
            && (peer.services() & SERVICES_NODE_BLOOM) != SERVICES_NODE_BLOOM
        {
            log_info!("{}: node doesn't support SPV mode", peer.address());
            peer.disconnect();
        } else if inner.download_peer.as_ref().is_some_and(|download| {
            download.last_block() >= peer.last_block()
                || inner.store.tip().height >= peer.last_block()
        }) {
            // keep the existing download peer; set this one up for relay
            // once we're caught up
            if inner.store.tip().height >= peer.last_block() {
                inner.connect_failure_count = 0;
                self.load_bloom_filter(&mut inner, peer.as_ref());
                publish_pending_tx(&inner, peer.as_ref());
                let manager = Arc::clone(self);
                let ping_peer = Arc::clone(peer);
                peer.send_ping(Box::new(move |success| {
                    manager.load_bloom_filter_done(&ping_peer, success);
                }));
            }
        } else {
            // elect the download peer: lowest ping among peers reporting the
            // highest block
            let mut best = Arc::clone(peer);
            for candidate in &inner.connected_peers {
                if candidate.connect_status() != PeerStatus::Connected {
                    continue;
                }
                if (candidate.ping_time() < best.ping_time()
                    && candidate.last_block() >= best.last_block())
                    || candidate.last_block() > best.last_block()
                {
                    best = Arc::clone(candidate);
                }
            }

            if let Some(old) = inner.download_peer.take() {
                log_info!("selecting new download peer with higher reported lastblock");
                old.disconnect();
            }
            inner.download_peer = Some(Arc::clone(&best));
            inner.is_connected = true;
            inner.estimated_height = best.last_block();
            self.load_bloom_filter(&mut inner, best.as_ref());
            best.set_current_block_height(inner.store.tip().height);
            publish_pending_tx(&inner, best.as_ref());

            if inner.store.tip().height < best.last_block() {
                // start the chain sync
                best.schedule_disconnect(Some(PROTOCOL_TIMEOUT));

                // request blocks if the tip is within a week of the wallet
                // creation time, headers before that
                let locators = inner.store.locators();
                if inner.store.tip().timestamp as u64 + 7 * 24 * 3600
                    >= self.earliest_key_time as u64
                {
                    best.send_getblocks(&locators);
                } else {
                    best.send_getheaders(&locators);
                }
            } else {
                inner.connect_failure_count = 0;
                self.load_mempools(&mut inner);
            }
        }
    }

    pub fn peer_disconnected(self: &Arc<Self>, peer: &Arc<dyn Peer>, error: Option<Error>) {
        let mut callbacks: Vec<(PublishCallback, Option<Error>)> = Vec::new();
        let mut will_save = false;
        let mut will_reconnect = false;
        {
            let mut inner = self.lock();
            let addr = peer.address();
            let mut tx_error = None;

            match error {
                Some(Error::ProtocolViolation) => {
                    peer_misbehavin(&mut inner, peer.as_ref());
                }
                Some(err) => {
                    inner.peers.retain(|info| info.address != addr);
                    inner.connect_failure_count += 1;

                    // a timeout with a pending publish is a publish timeout,
                    // except on the download peer mid-sync
                    let is_download = inner
                        .download_peer
                        .as_ref()
                        .is_some_and(|download| same_peer(download.as_ref(), peer.as_ref()));
                    if err == Error::Timeout
                        && (!is_download
                            || inner.sync_start_height == 0
                            || inner.connected_peers.len() == 1)
                    {
                        tx_error = Some(Error::Timeout);
                    }
                }
                None => {}
            }

            inner.tx_relays.remove_peer_everywhere(addr);

            let was_download = inner
                .download_peer
                .as_ref()
                .is_some_and(|download| same_peer(download.as_ref(), peer.as_ref()));
            if was_download {
                inner.is_connected = false;
                inner.download_peer = None;
                if inner.connect_failure_count > MAX_CONNECT_FAILURES {
                    inner.connect_failure_count = MAX_CONNECT_FAILURES;
                }
            }

            if !inner.is_connected && inner.connect_failure_count == MAX_CONNECT_FAILURES {
                sync_stopped_internal(&mut inner);
                // clear the pool so the next attempt does a fresh discovery
                inner.peers.clear();
                tx_error = Some(Error::NotConnected);
                will_save = true;
                log_warn!("{addr}: sync failed");
            } else if inner.connect_failure_count < MAX_CONNECT_FAILURES {
                will_reconnect = true;
            }

            if let Some(tx_error) = tx_error {
                let mut i = inner.published_tx.len();
                while i > 0 {
                    i -= 1;
                    if inner.published_tx[i].callback.is_none() {
                        continue;
                    }
                    log_warn!("transaction canceled: {tx_error}");
                    let published = inner.published_tx.remove(i);
                    inner.published_tx_hashes.remove(i);
                    if let Some(callback) = published.callback {
                        callbacks.push((callback, Some(tx_error)));
                    }
                }
            }

            inner
                .connected_peers
                .retain(|connected| !same_peer(connected.as_ref(), peer.as_ref()));
        }

        for (callback, err) in callbacks {
            callback(err);
        }
        if will_save {
            if let Some(callback) = &self.events.save_peers {
                callback(true, &[]);
            }
            if let Some(callback) = &self.events.sync_stopped {
                callback(error);
            }
        }
        if will_reconnect {
            self.connect();
        }
        if let Some(callback) = &self.events.tx_status_update {
            callback();
        }
    }

    pub fn peer_relayed_peers(&self, peer: &Arc<dyn Peer>, relayed: &[PeerInfo]) {
        let now = now_secs();
        let save;
        {
            let mut inner = self.lock();
            log_debug!("{}: relayed {} peer(s)", peer.address(), relayed.len());

            inner.peers.extend_from_slice(relayed);
            inner.peers.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
            inner.peers.truncate(2500);

            // remove peers more than 3 hours old, down to 1000
            while inner.peers.len() > 1000 {
                let Some(last) = inner.peers.last() else {
                    break;
                };
                if last.timestamp + 3 * 3600 >= now {
                    break;
                }
                inner.peers.pop();
            }

            save = inner.peers.clone();
        }

        // relaying is complete when fewer than 1000 arrive
        if save.len() > 1 && save.len() < 1000 {
            if let Some(callback) = &self.events.save_peers {
                callback(true, &save);
            }
        }
    }

    pub fn peer_relayed_tx(self: &Arc<Self>, peer: &Arc<dyn Peer>, tx: Transaction) {
        let mut publish_callback: Option<PublishCallback> = None;
        {
            let mut inner = self.lock();
            let addr = peer.address();
            let tx_hash = tx.tx_hash;
            log_debug!("{addr}: relayed tx {}", ShortHash(&tx_hash));

            let mut in_publish_list = false;
            let mut has_pending = false;
            let mut relay_count = 0usize;
            for published in &mut inner.published_tx {
                if published.tx.tx_hash == tx_hash {
                    in_publish_list = true;
                    if let Some(callback) = published.callback.take() {
                        publish_callback = Some(callback);
                    }
                } else if published.callback.is_some() {
                    has_pending = true;
                }
            }
            if in_publish_list {
                relay_count = inner.tx_relays.add_peer(tx_hash, addr);
            }

            let is_download = inner
                .download_peer
                .as_ref()
                .is_some_and(|download| same_peer(download.as_ref(), peer.as_ref()));
            // cancel the publish timeout when nothing else is pending
            if !has_pending && (inner.sync_start_height == 0 || !is_download) {
                peer.schedule_disconnect(None);
            }

            let mut current = Some(tx.clone());
            let mut is_wallet_tx = false;
            if inner.sync_start_height == 0 || self.wallet.contains_transaction(&tx) {
                is_wallet_tx = self.wallet.register_transaction(tx);
                if is_wallet_tx {
                    current = self.wallet.transaction_for_hash(&tx_hash);
                }
            } else {
                current = None;
            }

            if is_wallet_tx {
                if let Some(tx) = &current {
                    if inner.sync_start_height > 0 && is_download {
                        peer.schedule_disconnect(Some(PROTOCOL_TIMEOUT)); // reschedule sync timeout
                    }

                    if self.wallet.amount_sent_by_tx(tx) > 0
                        && self.wallet.transaction_is_valid(tx)
                    {
                        // a valid send should be re-broadcast with ours
                        self.add_tx_to_publish_list(&mut inner, tx.clone(), None);
                    }

                    // relay counts only matter once syncing is complete
                    if inner.sync_start_height == 0 {
                        relay_count = inner.tx_relays.add_peer(tx_hash, addr);
                    }
                    inner.tx_requests.remove_peer(&tx_hash, addr);

                    self.check_filter_coverage(&mut inner);
                }
            }

            // mark as verified once every connected peer has it
            if let Some(tx) = &current {
                if relay_count >= inner.max_connect_count
                    && tx.block_height == TX_UNCONFIRMED
                    && tx.timestamp == 0
                {
                    self.update_tx(&mut inner, &[tx_hash], TX_UNCONFIRMED, now_secs() as u32);
                }
            }
        }

        if let Some(callback) = publish_callback {
            callback(None);
        }
    }

    pub fn peer_has_tx(self: &Arc<Self>, peer: &Arc<dyn Peer>, tx_hash: Hash256) {
        let mut publish_callback: Option<PublishCallback> = None;
        {
            let mut inner = self.lock();
            let addr = peer.address();
            log_debug!("{addr}: has tx {}", ShortHash(&tx_hash));

            let mut tx = self.wallet.transaction_for_hash(&tx_hash);
            let mut in_publish_list = false;
            let mut has_pending = false;
            let mut relay_count = 0usize;
            for published in &mut inner.published_tx {
                if published.tx.tx_hash == tx_hash {
                    in_publish_list = true;
                    if tx.is_none() {
                        tx = Some(published.tx.clone());
                    }
                    if let Some(callback) = published.callback.take() {
                        publish_callback = Some(callback);
                    }
                } else if published.callback.is_some() {
                    has_pending = true;
                }
            }
            if in_publish_list {
                relay_count = inner.tx_relays.add_peer(tx_hash, addr);
            }

            let is_download = inner
                .download_peer
                .as_ref()
                .is_some_and(|download| same_peer(download.as_ref(), peer.as_ref()));
            if !has_pending && (inner.sync_start_height == 0 || !is_download) {
                peer.schedule_disconnect(None); // cancel publish timeout
            }

            if let Some(tx) = tx {
                let is_wallet_tx = self.wallet.register_transaction(tx.clone());
                if is_wallet_tx && inner.sync_start_height > 0 && is_download {
                    peer.schedule_disconnect(Some(PROTOCOL_TIMEOUT));
                }

                if inner.sync_start_height == 0 {
                    relay_count = inner.tx_relays.add_peer(tx_hash, addr);
                }

                let current = self.wallet.transaction_for_hash(&tx_hash).unwrap_or(tx);
                if relay_count >= inner.max_connect_count
                    && current.block_height == TX_UNCONFIRMED
                    && current.timestamp == 0
                {
                    self.update_tx(&mut inner, &[tx_hash], TX_UNCONFIRMED, now_secs() as u32);
                }

                inner.tx_requests.remove_peer(&tx_hash, addr);
            }
        }

        if let Some(callback) = publish_callback {
            callback(None);
        }
    }

    pub fn peer_rejected_tx(&self, peer: &Arc<dyn Peer>, tx_hash: Hash256, code: u8) {
        {
            let mut inner = self.lock();
            let addr = peer.address();
            log_debug!("{addr}: rejected tx {} (code {code:#x})", ShortHash(&tx_hash));
            inner.tx_requests.remove_peer(&tx_hash, addr);

            if let Some(tx) = self.wallet.transaction_for_hash(&tx_hash) {
                if inner.tx_relays.remove_peer(&tx_hash, addr)
                    && tx.block_height == TX_UNCONFIRMED
                {
                    // mark as unverified again
                    self.update_tx(&mut inner, &[tx_hash], TX_UNCONFIRMED, 0);
                }

                // a rejection other than double-spend of our own send means
                // the peer is likely misconfigured
                if code != REJECT_SPENT && self.wallet.amount_sent_by_tx(&tx) > 0 {
                    let mut all_confirmed = true;
                    for input in &tx.inputs {
                        let parent = self.wallet.transaction_for_hash(&input.tx_hash);
                        if parent.is_some_and(|parent| parent.block_height != TX_UNCONFIRMED) {
                            continue;
                        }
                        all_confirmed = false;
                        break;
                    }
                    if all_confirmed {
                        peer_misbehavin(&mut inner, peer.as_ref());
                    }
                }
            }
        }

        if let Some(callback) = &self.events.tx_status_update {
            callback();
        }
    }

    pub fn peer_relayed_block(self: &Arc<Self>, peer: &Arc<dyn Peer>, block: MerkleBlock) {
        let mut next = Some(block);
        while let Some(block) = next.take() {
            next = self.relay_block_round(peer, block);
        }
    }

    pub fn peer_data_notfound(
        &self,
        peer: &Arc<dyn Peer>,
        tx_hashes: &[Hash256],
        _block_hashes: &[Hash256],
    ) {
        let mut inner = self.lock();
        let addr = peer.address();
        for tx_hash in tx_hashes {
            inner.tx_relays.remove_peer(tx_hash, addr);
            inner.tx_requests.remove_peer(tx_hash, addr);
        }
    }

    pub fn peer_set_fee_per_kb(&self, peer: &Arc<dyn Peer>, _fee_per_kb: u64) {
        let inner = self.lock();
        let mut max_fee = 0u64;
        let mut second_fee = 0u64;

        for connected in &inner.connected_peers {
            if connected.connect_status() != PeerStatus::Connected {
                continue;
            }
            if connected.fee_per_kb() > max_fee {
                second_fee = max_fee;
                max_fee = connected.fee_per_kb();
            }
        }

        let raised = second_fee * 3 / 2;
        if raised > DEFAULT_FEE_PER_KB
            && raised <= MAX_FEE_PER_KB
            && raised > self.wallet.fee_per_kb()
        {
            log_info!(
                "{}: increasing feePerKb to {raised} based on feefilter messages",
                peer.address()
            );
            self.wallet.set_fee_per_kb(raised);
        }
    }

    /// Serves a getdata for one of our published transactions.
    pub fn peer_requested_tx(
        self: &Arc<Self>,
        peer: &Arc<dyn Peer>,
        tx_hash: Hash256,
    ) -> Option<Transaction> {
        let mut publish_callback: Option<PublishCallback> = None;
        let mut error = None;
        let tx;
        {
            let mut inner = self.lock();
            let addr = peer.address();
            let mut found: Option<Transaction> = None;
            let mut has_pending = false;

            let mut i = inner.published_tx.len();
            while i > 0 {
                i -= 1;
                if inner.published_tx[i].tx.tx_hash == tx_hash {
                    found = Some(inner.published_tx[i].tx.clone());
                    if let Some(callback) = inner.published_tx[i].callback.take() {
                        publish_callback = Some(callback);
                    }

                    if found
                        .as_ref()
                        .is_some_and(|tx| !self.wallet.transaction_is_valid(tx))
                    {
                        error = Some(Error::InvalidInput);
                        inner.published_tx.remove(i);
                        inner.published_tx_hashes.remove(i);
                        if self.wallet.transaction_for_hash(&tx_hash).is_none() {
                            found = None;
                        }
                    }
                } else if inner.published_tx[i].callback.is_some() {
                    has_pending = true;
                }
            }

            let is_download = inner
                .download_peer
                .as_ref()
                .is_some_and(|download| same_peer(download.as_ref(), peer.as_ref()));
            if !has_pending && (inner.sync_start_height == 0 || !is_download) {
                peer.schedule_disconnect(None); // cancel publish timeout
            }

            if let Some(found) = &found {
                if error.is_none() {
                    inner.tx_relays.add_peer(tx_hash, addr);
                    self.wallet.register_transaction(found.clone());
                }
            }
            tx = found;
        }

        if let Some(callback) = publish_callback {
            callback(error);
        }
        tx
    }

    // ---- internals ----

    fn find_peers<'a>(
        self: &'a Arc<Self>,
        mut inner: MutexGuard<'a, ManagerInner>,
    ) -> MutexGuard<'a, ManagerInner> {
        let services = SERVICES_NODE_NETWORK | SERVICES_NODE_BLOOM | self.params.services;
        let now = now_secs();

        if let Some(fixed) = inner.fixed_peer {
            inner.peers.clear();
            inner.peers.push(PeerInfo {
                address: fixed.address,
                services,
                timestamp: now,
            });
            return inner;
        }

        let port = self.params.standard_port;
        for seed in self.params.dns_seeds.iter().skip(1) {
            let seed = *seed;
            let manager = Arc::clone(self);
            inner.dns_thread_count += 1;
            std::thread::spawn(move || {
                let addrs = lookup_host(seed, port);
                {
                    let mut inner = manager.lock();
                    for address in addrs {
                        // stamp seed-discovered peers one to three days old
                        // so saved peers win the recency bias
                        let age = 24 * 3600 + spvd_primitives::spv_rand(2 * 24 * 3600) as u64;
                        inner.peers.push(PeerInfo {
                            address,
                            services,
                            timestamp: now_secs().saturating_sub(age),
                        });
                    }
                    inner.dns_thread_count -= 1;
                }
                manager.thread_cleanup();
            });
        }

        if let Some(seed) = self.params.dns_seeds.first() {
            for address in lookup_host(seed, port) {
                inner.peers.push(PeerInfo {
                    address,
                    services,
                    timestamp: now,
                });
            }
        }

        while inner.dns_thread_count > 0 && inner.peers.len() < PEER_MAX_CONNECTIONS {
            drop(inner);
            std::thread::sleep(Duration::from_nanos(1));
            inner = self.lock();
        }

        inner.peers.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        inner
    }

    /// Rebuilds the bloom filter from wallet addresses, UTXOs, and outpoints
    /// spent by recently unconfirmed transactions, then loads it on `peer`.
    fn load_bloom_filter(&self, inner: &mut ManagerInner, peer: &dyn Peer) {
        // every time a wallet address is used the filter has to be rebuilt,
        // so generate spare addresses up front to cut down on reloads during
        // the chain sync
        self.wallet
            .unused_addrs(SEQUENCE_GAP_LIMIT_EXTERNAL + 100, false);
        self.wallet
            .unused_addrs(SEQUENCE_GAP_LIMIT_INTERNAL + 100, true);

        // orphans received against an old filter may be incomplete
        inner.store.clear_orphans();
        inner.filter_update_height = inner.store.tip().height;

        let addrs = self.wallet.all_addrs();
        let utxos = self.wallet.utxos();
        let cutoff = inner.store.tip().height.saturating_sub(100);
        let recent_txs = self.wallet.tx_unconfirmed_before(cutoff);

        let mut filter = BloomFilter::new(
            inner.fp_rate,
            addrs.len() + utxos.len() + recent_txs.len() + 100,
            peer_nonce(peer),
            BLOOM_UPDATE_ALL,
        );

        for addr in &addrs {
            // watch for tx receiving money to the wallet
            if let Some(hash) = address_hash160(addr) {
                if !filter.contains_data(&hash) {
                    filter.insert_data(&hash);
                }
            }
        }

        for utxo in &utxos {
            // watch for tx sending money from the wallet
            let bytes = utxo.to_bytes();
            if !filter.contains_data(&bytes) {
                filter.insert_data(&bytes);
            }
        }

        for tx in &recent_txs {
            // also watch outpoints spent within the last 100 blocks
            for input in &tx.inputs {
                let parent = self.wallet.transaction_for_hash(&input.tx_hash);
                let watched = parent
                    .as_ref()
                    .and_then(|parent| parent.outputs.get(input.index as usize))
                    .is_some_and(|output| self.wallet.contains_address(&output.address));
                if watched {
                    let bytes = OutPoint::new(input.tx_hash, input.index).to_bytes();
                    if !filter.contains_data(&bytes) {
                        filter.insert_data(&bytes);
                    }
                }
            }
        }

        let payload = filter.serialize();
        inner.bloom_filter = Some(filter);
        peer.send_filterload(&payload);
    }

    /// After a relayed wallet tx, verify the next gap-limit addresses are
    /// still covered by the filter; otherwise begin a filter update.
    fn check_filter_coverage(self: &Arc<Self>, inner: &mut ManagerInner) {
        if inner.bloom_filter.is_none() {
            return;
        }
        let mut addrs = self.wallet.unused_addrs(SEQUENCE_GAP_LIMIT_EXTERNAL, false);
        addrs.extend(self.wallet.unused_addrs(SEQUENCE_GAP_LIMIT_INTERNAL, true));

        for addr in addrs {
            let Some(hash) = address_hash160(&addr) else {
                continue;
            };
            let covered = inner
                .bloom_filter
                .as_ref()
                .is_some_and(|filter| filter.contains_data(&hash));
            if !covered {
                inner.bloom_filter = None; // rebuilt with the new addresses
                self.update_filter(inner);
                break;
            }
        }
    }

    /// Starts a filter reload sequenced behind a ping, so any tx already
    /// sent against the old filter is processed first.
    fn update_filter(self: &Arc<Self>, inner: &mut ManagerInner) {
        let Some(download_peer) = inner.download_peer.clone() else {
            return;
        };
        if download_peer.flags() & PEER_FLAG_NEEDS_FILTER_UPDATE != 0 {
            return;
        }
        download_peer.set_needs_filter_update(true);
        download_peer.set_flags(download_peer.flags() | PEER_FLAG_NEEDS_FILTER_UPDATE);
        log_debug!("filter update needed, waiting for pong");

        let manager = Arc::clone(self);
        let ping_peer = Arc::clone(&download_peer);
        download_peer.send_ping(Box::new(move |success| {
            manager.update_filter_ping_done(&ping_peer, success);
        }));
    }

    fn update_filter_ping_done(self: &Arc<Self>, peer: &Arc<dyn Peer>, success: bool) {
        if !success {
            return;
        }
        let mut inner = self.lock();
        log_debug!("updating filter with newly created wallet addresses");
        inner.bloom_filter = None;

        if inner.store.tip().height < inner.estimated_height {
            // only the download peer matters mid-sync
            let Some(download_peer) = inner.download_peer.clone() else {
                return;
            };
            self.load_bloom_filter(&mut inner, download_peer.as_ref());
            let manager = Arc::clone(self);
            let orig_peer = Arc::clone(peer);
            download_peer.send_ping(Box::new(move |success| {
                manager.update_filter_load_done(&orig_peer, success);
            }));
        } else {
            for connected in inner.connected_peers.clone() {
                if connected.connect_status() != PeerStatus::Connected {
                    continue;
                }
                self.load_bloom_filter(&mut inner, connected.as_ref());
                let manager = Arc::clone(self);
                let ping_peer = Arc::clone(&connected);
                connected.send_ping(Box::new(move |success| {
                    manager.update_filter_load_done(&ping_peer, success);
                }));
            }
        }
    }

    fn update_filter_load_done(self: &Arc<Self>, peer: &Arc<dyn Peer>, success: bool) {
        if !success {
            return;
        }
        let mut inner = self.lock();
        peer.set_needs_filter_update(false);
        peer.set_flags(peer.flags() & !PEER_FLAG_NEEDS_FILTER_UPDATE);

        if inner.store.tip().height < inner.estimated_height {
            // mid-sync, rerequest the blocks delivered against the old filter
            let Some(download_peer) = inner.download_peer.clone() else {
                return;
            };
            download_peer.rerequest_blocks(&inner.store.tip_hash());
            let manager = Arc::clone(self);
            let orig_peer = Arc::clone(peer);
            download_peer.send_ping(Box::new(move |success| {
                manager.update_filter_rerequest_done(&orig_peer, success);
            }));
        } else {
            peer.send_mempool(&inner.published_tx_hashes, None);
        }
    }

    fn update_filter_rerequest_done(self: &Arc<Self>, peer: &Arc<dyn Peer>, success: bool) {
        if !success {
            return;
        }
        let inner = self.lock();
        if peer.flags() & PEER_FLAG_NEEDS_FILTER_UPDATE == 0 {
            peer.send_getblocks(&inner.store.locators());
        }
    }

    /// Updates tx heights and drops confirmed txs from the publish and relay
    /// bookkeeping.
    fn update_tx(
        &self,
        inner: &mut ManagerInner,
        tx_hashes: &[Hash256],
        block_height: u32,
        timestamp: u32,
    ) {
        if block_height != TX_UNCONFIRMED {
            for tx_hash in tx_hashes {
                remove_published(inner, tx_hash);
                inner.tx_relays.remove_tx(tx_hash);
            }
        }
        self.wallet
            .update_transactions(tx_hashes, block_height, timestamp);
    }

    /// Queues tx (with its unconfirmed wallet ancestors) for publishing.
    fn add_tx_to_publish_list(
        &self,
        inner: &mut ManagerInner,
        tx: Transaction,
        callback: Option<PublishCallback>,
    ) {
        if tx.block_height != TX_UNCONFIRMED {
            return;
        }
        if inner
            .published_tx
            .iter()
            .any(|published| published.tx.tx_hash == tx.tx_hash)
        {
            return;
        }

        let inputs: Vec<Hash256> = tx.inputs.iter().map(|input| input.tx_hash).collect();
        inner.published_tx_hashes.push(tx.tx_hash);
        inner.published_tx.push(PublishedTx { tx, callback });

        for input_hash in inputs {
            if let Some(parent) = self.wallet.transaction_for_hash(&input_hash) {
                self.add_tx_to_publish_list(inner, parent, None);
            }
        }
    }

    fn publish_tx_inv_done(self: &Arc<Self>, peer: &Arc<dyn Peer>) {
        let mut inner = self.lock();
        self.request_unrelayed_tx(&mut inner, peer);
    }

    /// Asks the peer for any unconfirmed wallet tx it has not announced, to
    /// learn whether the network still knows them.
    fn request_unrelayed_tx(self: &Arc<Self>, inner: &mut ManagerInner, peer: &Arc<dyn Peer>) {
        let addr = peer.address();
        let mut tx_hashes = Vec::new();
        for tx in self.wallet.tx_unconfirmed_before(TX_UNCONFIRMED) {
            if !inner.tx_relays.has_peer(&tx.tx_hash, addr)
                && !inner.tx_requests.has_peer(&tx.tx_hash, addr)
            {
                inner.tx_requests.add_peer(tx.tx_hash, addr);
                tx_hashes.push(tx.tx_hash);
            }
        }

        if !tx_hashes.is_empty() {
            peer.send_getdata(&tx_hashes, &[]);

            if peer.flags() & PEER_FLAG_SYNCED == 0 {
                let manager = Arc::clone(self);
                let ping_peer = Arc::clone(peer);
                peer.send_ping(Box::new(move |success| {
                    manager.request_unrelayed_done(&ping_peer, success);
                }));
            }
        } else {
            peer.set_flags(peer.flags() | PEER_FLAG_SYNCED);
        }
    }

    /// Once every connected peer has finished its mempool relay, unconfirmed
    /// wallet txs nobody knows have likely dropped off the network.
    fn request_unrelayed_done(self: &Arc<Self>, peer: &Arc<dyn Peer>, success: bool) {
        let mut inner = self.lock();
        if success {
            peer.set_flags(peer.flags() | PEER_FLAG_SYNCED);
        }

        let mut count = 0usize;
        for connected in &inner.connected_peers {
            if connected.connect_status() == PeerStatus::Connected {
                count += 1;
            }
            if connected.flags() & PEER_FLAG_SYNCED != 0 {
                continue;
            }
            count = 0;
            break;
        }

        // wait until all of maxConnectCount peers have relayed their
        // mempools before giving up on a tx
        if count < inner.max_connect_count {
            return;
        }

        let unconfirmed = self.wallet.tx_unconfirmed_before(TX_UNCONFIRMED);
        for tx in unconfirmed.iter().rev() {
            let tx_hash = tx.tx_hash;
            let is_publishing = inner.published_tx.iter().any(|published| {
                published.tx.tx_hash == tx_hash && published.callback.is_some()
            });

            if !is_publishing
                && inner.tx_relays.count(&tx_hash) == 0
                && inner.tx_requests.count(&tx_hash) == 0
            {
                log_info!(
                    "removing tx {} unconfirmed at {}",
                    ShortHash(&tx_hash),
                    inner.store.tip().height
                );
                debug_assert_eq!(tx.block_height, TX_UNCONFIRMED);
                self.wallet.remove_transaction(tx_hash);
            } else if !is_publishing && inner.tx_relays.count(&tx_hash) < inner.max_connect_count
            {
                // set timestamp 0 to mark as unverified
                self.update_tx(&mut inner, &[tx_hash], TX_UNCONFIRMED, 0);
            }
        }
    }

    fn mempool_done(self: &Arc<Self>, peer: &Arc<dyn Peer>, success: bool) {
        let mut sync_finished = false;
        if success {
            log_debug!("{}: mempool request finished", peer.address());
            {
                let mut inner = self.lock();
                if inner.sync_start_height > 0 {
                    log_info!("{}: sync succeeded", peer.address());
                    sync_finished = true;
                    sync_stopped_internal(&mut inner);
                }
                self.request_unrelayed_tx(&mut inner, peer);
                peer.send_getaddr(); // request a list of other peers
            }

            if let Some(callback) = &self.events.tx_status_update {
                callback();
            }
            if sync_finished {
                if let Some(callback) = &self.events.sync_stopped {
                    callback(None);
                }
            }
        } else {
            log_debug!("{}: mempool request failed", peer.address());
        }
    }

    fn load_bloom_filter_done(self: &Arc<Self>, peer: &Arc<dyn Peer>, success: bool) {
        let mut sync_finished = false;
        {
            let mut inner = self.lock();
            if success {
                let manager = Arc::clone(self);
                let ping_peer = Arc::clone(peer);
                peer.send_mempool(
                    &inner.published_tx_hashes,
                    Some(Box::new(move |success| {
                        manager.mempool_done(&ping_peer, success);
                    })),
                );
            } else {
                let is_download = inner
                    .download_peer
                    .as_ref()
                    .is_some_and(|download| same_peer(download.as_ref(), peer.as_ref()));
                if is_download {
                    log_info!("{}: sync succeeded", peer.address());
                    sync_stopped_internal(&mut inner);
                    sync_finished = true;
                }
            }
        }
        if sync_finished {
            if let Some(callback) = &self.events.sync_stopped {
                callback(None);
            }
        }
    }

    /// After syncing, load filters and request mempools from every peer.
    fn load_mempools(self: &Arc<Self>, inner: &mut ManagerInner) {
        for peer in inner.connected_peers.clone() {
            if peer.connect_status() != PeerStatus::Connected {
                continue;
            }
            let is_download = inner
                .download_peer
                .as_ref()
                .is_some_and(|download| same_peer(download.as_ref(), peer.as_ref()));

            if !is_download || inner.fp_rate > BLOOM_REDUCED_FALSEPOSITIVE_RATE * 5.0 {
                self.load_bloom_filter(inner, peer.as_ref());
                publish_pending_tx(inner, peer.as_ref());
                let manager = Arc::clone(self);
                let ping_peer = Arc::clone(&peer);
                peer.send_ping(Box::new(move |success| {
                    manager.load_bloom_filter_done(&ping_peer, success);
                }));
            } else {
                let manager = Arc::clone(self);
                let ping_peer = Arc::clone(&peer);
                peer.send_mempool(
                    &inner.published_tx_hashes,
                    Some(Box::new(move |success| {
                        manager.mempool_done(&ping_peer, success);
                    })),
                );
            }
        }
    }

    /// One round of block acceptance; returns the orphan that this block
    /// adopted, if any, to be processed next.
    fn relay_block_round(
        self: &Arc<Self>,
        peer: &Arc<dyn Peer>,
        mut block: MerkleBlock,
    ) -> Option<MerkleBlock> {
        let tx_hashes = block.matched_tx_hashes();
        let mut next = None;
        let mut saved: Vec<MerkleBlock> = Vec::new();
        let mut status_update = false;
        {
            let mut inner = self.lock();
            let prev = inner.store.block(&block.prev_block).cloned();
            let mut tx_time = 0u32;
            if let Some(prev) = &prev {
                tx_time = block.timestamp / 2 + prev.timestamp / 2;
                block.height = prev.height + 1;
            }

            let is_download = inner
                .download_peer
                .as_ref()
                .is_some_and(|download| same_peer(download.as_ref(), peer.as_ref()));

            // track the observed false-positive rate with a low pass filter
            if is_download && block.total_tx > 0 {
                let fp_count = tx_hashes
                    .iter()
                    .filter(|hash| self.wallet.transaction_for_hash(hash).is_none())
                    .count();

                inner.average_tx_per_block =
                    inner.average_tx_per_block * 0.999 + block.total_tx as f64 * 0.001;
                inner.fp_rate = inner.fp_rate
                    * (1.0 - 0.01 * block.total_tx as f64 / inner.average_tx_per_block)
                    + 0.01 * fp_count as f64 / inner.average_tx_per_block;

                if peer.connect_status() == PeerStatus::Connected
                    && inner.fp_rate > BLOOM_DEFAULT_FALSEPOSITIVE_RATE * 10.0
                {
                    log_warn!(
                        "{}: bloom filter false positive rate {:.6} too high after {} block(s), disconnecting",
                        peer.address(),
                        inner.fp_rate,
                        (inner.store.tip().height + 1).saturating_sub(inner.filter_update_height)
                    );
                    inner.fp_rate = BLOOM_REDUCED_FALSEPOSITIVE_RATE;
                    peer.disconnect();
                } else if inner.store.tip().height + 500 < peer.last_block()
                    && inner.fp_rate > BLOOM_REDUCED_FALSEPOSITIVE_RATE * 10.0
                {
                    // rebuild the filter before it degrades further
                    self.update_filter(&mut inner);
                }
            }

            let mut save_count = 0usize;
            let mut current: Option<MerkleBlock> = None;

            if block.total_tx == 0
                && block.timestamp as u64 + 7 * 24 * 3600
                    > self.earliest_key_time as u64 + 2 * 3600
            {
                // header-only block too close to the wallet creation time
            } else if inner.bloom_filter.is_none() {
                // potentially incomplete blocks during a filter update
                if is_download && inner.store.tip().height < inner.estimated_height {
                    peer.schedule_disconnect(Some(PROTOCOL_TIMEOUT));
                    inner.connect_failure_count = 0;
                }
            } else if prev.is_none() {
                // orphan
                log_debug!(
                    "{}: relayed orphan block {}, previous {}, last block is {} at height {}",
                    peer.address(),
                    ShortHash(&block.block_hash),
                    ShortHash(&block.prev_block),
                    ShortHash(&inner.store.tip_hash()),
                    inner.store.tip().height
                );
                if (block.timestamp as u64) + 7 * 24 * 3600 < now_secs() {
                    // too old, discard
                } else {
                    // request the missing ancestry, unless the previous
                    // block was also this orphan's parent, or we're syncing
                    if inner.store.tip().height >= peer.last_block()
                        && inner.store.last_orphan_hash() != Some(block.prev_block)
                    {
                        log_debug!("{}: calling getblocks", peer.address());
                        peer.send_getblocks(&inner.store.locators());
                    }
                    inner.store.insert_orphan(block.clone());
                    current = Some(block);
                }
            } else if !inner.store.verify_block(
                &block,
                prev.as_ref().expect("prev checked above"),
                &self.params,
            ) {
                log_warn!("{}: relayed invalid block", peer.address());
                peer_misbehavin(&mut inner, peer.as_ref());
            } else if block.prev_block == inner.store.tip_hash() {
                // new block extends the main chain
                if block.height % 500 == 0
                    || !tx_hashes.is_empty()
                    || block.height >= peer.last_block()
                {
                    log_debug!(
                        "adding block #{}, false positive rate {:.6}",
                        block.height,
                        inner.fp_rate
                    );
                }
                inner.store.insert(block.clone());
                inner.store.set_tip(block.block_hash);
                if !tx_hashes.is_empty() {
                    self.update_tx(&mut inner, &tx_hashes, block.height, tx_time);
                }
                if let Some(download_peer) = &inner.download_peer {
                    download_peer.set_current_block_height(block.height);
                }

                if block.height < inner.estimated_height && is_download {
                    peer.schedule_disconnect(Some(PROTOCOL_TIMEOUT)); // reschedule sync timeout
                    inner.connect_failure_count = 0;
                }

                if block.height % BLOCK_DIFFICULTY_INTERVAL == 0 {
                    save_count = 1; // save transition blocks immediately
                }
                if block.height == inner.estimated_height {
                    // chain download is complete
                    save_count = (block.height % BLOCK_DIFFICULTY_INTERVAL) as usize
                        + BLOCK_DIFFICULTY_INTERVAL as usize
                        + 1;
                    self.load_mempools(&mut inner);
                }
                current = Some(block);
            } else if inner.store.contains(&block.block_hash) {
                // we already have the block (or at least the header)
                let mut on_main_chain = false;
                let mut walk = Some(inner.store.tip().clone());
                while let Some(b) = &walk {
                    if b.height <= block.height {
                        on_main_chain = b.block_hash == block.block_hash;
                        break;
                    }
                    let prev_hash = b.prev_block;
                    walk = inner.store.block(&prev_hash).cloned();
                }

                if on_main_chain {
                    if !tx_hashes.is_empty() {
                        self.update_tx(&mut inner, &tx_hashes, block.height, tx_time);
                    }
                    if block.height == inner.store.tip().height {
                        inner.store.set_tip(block.block_hash);
                    }
                }
                inner.store.insert(block.clone());
                current = Some(block);
            } else if inner.store.tip().height < peer.last_block()
                && block.height > inner.store.tip().height + 1
            {
                // new block mined during a rescan; orphan it until caught up
                log_debug!(
                    "{}: marking new block #{} as orphan until rescan completes",
                    peer.address(),
                    block.height
                );
                inner.store.insert_orphan(block.clone());
                current = Some(block);
            } else if block.height <= self.params.last_checkpoint().height {
                // fork below the last checkpoint
                log_warn!(
                    "{}: ignoring block on fork older than most recent checkpoint, height #{}",
                    peer.address(),
                    block.height
                );
            } else {
                // new block is on a fork
                log_info!("chain fork reached height #{}", block.height);
                inner.store.insert(block.clone());

                if block.height > inner.store.tip().height {
                    // the fork is now longer than the main chain
                    let mut b = Some(block.clone());
                    let mut b2 = Some(inner.store.tip().clone());
                    loop {
                        let (Some(x), Some(y)) = (&b, &b2) else { break };
                        if x.block_hash == y.block_hash {
                            break;
                        }
                        let x_prev = x.prev_block;
                        let y_height = y.height;
                        let y_prev = y.prev_block;
                        b = inner.store.block(&x_prev).cloned();
                        if b.as_ref().is_some_and(|nb| nb.height < y_height) {
                            b2 = inner.store.block(&y_prev).cloned();
                        }
                    }

                    if let Some(ancestor) = &b {
                        log_info!(
                            "reorganizing chain from height {}, new height is {}",
                            ancestor.height,
                            block.height
                        );
                        // mark tx after the fork point as unconfirmed, then
                        // replay the new chain's heights forward
                        self.wallet.set_tx_unconfirmed_after(ancestor.height);

                        let ancestor_height = ancestor.height;
                        let mut walk = Some(block.clone());
                        while let Some(x) = walk {
                            if x.height <= ancestor_height {
                                break;
                            }
                            let hashes = x.matched_tx_hashes();
                            let height = x.height;
                            let mut timestamp = x.timestamp;
                            let parent = inner.store.block(&x.prev_block).cloned();
                            if let Some(parent) = &parent {
                                timestamp = timestamp / 2 + parent.timestamp / 2;
                            }
                            if !hashes.is_empty() {
                                self.wallet.update_transactions(&hashes, height, timestamp);
                            }
                            walk = parent;
                        }

                        inner.store.set_tip(block.block_hash);
                        if block.height == inner.estimated_height {
                            save_count = (block.height % BLOCK_DIFFICULTY_INTERVAL) as usize
                                + BLOCK_DIFFICULTY_INTERVAL as usize
                                + 1;
                            self.load_mempools(&mut inner);
                        }
                    }
                }
                current = Some(block);
            }

            if let Some(current) = &current {
                if current.height != BLOCK_UNKNOWN_HEIGHT {
                    if current.height > inner.estimated_height {
                        inner.estimated_height = current.height;
                    }
                    // the next block may have arrived out of order
                    next = inner.store.take_orphan_with_prev(&current.block_hash);

                    if save_count > 0 {
                        saved = inner.store.save_batch(&current.block_hash, save_count);
                    }
                    if current.height >= peer.last_block() {
                        status_update = true;
                    }
                }
            }
        }

        if !saved.is_empty() {
            if let Some(callback) = &self.events.save_blocks {
                callback(saved.len() > 1, &saved);
            }
        }
        if status_update {
            // transaction confirmations may have changed
            if let Some(callback) = &self.events.tx_status_update {
                callback();
            }
        }
        next
    }
}

/// Announces the publish list; arms the publish timeout while a user
/// callback is outstanding.
fn publish_pending_tx(inner: &ManagerInner, peer: &dyn Peer) {
    if inner
        .published_tx
        .iter()
        .any(|published| published.callback.is_some())
    {
        peer.schedule_disconnect(Some(PROTOCOL_TIMEOUT));
    }
    peer.send_inv(&inner.published_tx_hashes);
}

/// Drops a misbehaving peer; ten in a row clear the pool for a fresh DNS
/// discovery.
fn peer_misbehavin(inner: &mut ManagerInner, peer: &dyn Peer) {
    let addr = peer.address();
    inner.peers.retain(|info| info.address != addr);

    inner.misbehavin_count += 1;
    if inner.misbehavin_count >= 10 {
        inner.misbehavin_count = 0;
        inner.peers.clear();
    }

    peer.disconnect();
}
