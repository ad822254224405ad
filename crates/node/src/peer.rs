//! The peer session capability. The wire protocol lives behind this trait;
//! implementations pump messages on their own thread and call back into the
//! manager's `peer_*` handlers.

use std::net::SocketAddr;
use std::sync::Arc;

use spvd_consensus::Hash256;

use crate::manager::PeerManager;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// The peer has finished relaying its mempool.
pub const PEER_FLAG_SYNCED: u8 = 0x01;
/// A bloom filter rebuild is pending for this peer.
pub const PEER_FLAG_NEEDS_FILTER_UPDATE: u8 = 0x02;

/// A known peer, as stored in the pool and handed to `save_peers`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerInfo {
    pub address: SocketAddr,
    pub services: u64,
    /// Seconds since the unix epoch when the peer was last seen.
    pub timestamp: u64,
}

pub type PingCallback = Box<dyn FnOnce(bool) + Send>;

/// An open (or opening) peer session.
///
/// `send_ping(done)` is the ordering barrier: the session must process every
/// inbound message already enqueued before invoking `done`, and must never
/// invoke `done` synchronously from inside `send_ping` (the manager holds
/// its lock across the call).
pub trait Peer: Send + Sync {
    fn connect(&self);
    fn disconnect(&self);
    /// Arms the protocol watchdog; `None` cancels a pending timeout.
    fn schedule_disconnect(&self, seconds: Option<f64>);
    fn connect_status(&self) -> PeerStatus;
    fn address(&self) -> SocketAddr;
    fn services(&self) -> u64;
    fn version(&self) -> u32;
    /// Best block height the peer advertised at handshake.
    fn last_block(&self) -> u32;
    fn ping_time(&self) -> f64;
    fn fee_per_kb(&self) -> u64;
    fn timestamp(&self) -> u64;
    fn set_timestamp(&self, timestamp: u64);
    fn flags(&self) -> u8;
    fn set_flags(&self, flags: u8);
    fn send_filterload(&self, filter: &[u8]);
    fn send_getblocks(&self, locators: &[Hash256]);
    fn send_getheaders(&self, locators: &[Hash256]);
    fn send_getdata(&self, tx_hashes: &[Hash256], block_hashes: &[Hash256]);
    /// `known_tx_hashes` are excluded from the resulting inv processing;
    /// `done` fires once the mempool response has been drained.
    fn send_mempool(&self, known_tx_hashes: &[Hash256], done: Option<PingCallback>);
    fn send_inv(&self, tx_hashes: &[Hash256]);
    fn send_ping(&self, done: PingCallback);
    fn send_getaddr(&self);
    /// Re-requests merkle blocks after `from_block` (used after a filter
    /// reload mid-sync).
    fn rerequest_blocks(&self, from_block: &Hash256);
    fn set_current_block_height(&self, height: u32);
    fn set_needs_filter_update(&self, needs_update: bool);
    fn set_earliest_key_time(&self, time: u32);
}

/// Creates peer sessions. The returned session must deliver its events to
/// the given manager from its own pump thread.
pub trait PeerConnector: Send + Sync {
    fn make_peer(&self, info: &PeerInfo, manager: &Arc<PeerManager>) -> Arc<dyn Peer>;
}

pub(crate) fn same_peer(a: &dyn Peer, b: &dyn Peer) -> bool {
    a.address() == b.address()
}
