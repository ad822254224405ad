//! Peer manager: peer pool, chain sync, block store, bloom filter
//! lifecycle, and transaction publishing.

mod blockstore;
mod manager;
mod peer;

pub use blockstore::BlockStore;
pub use manager::{Error, NodeEvents, PeerManager, PublishCallback};
pub use peer::{
    Peer, PeerConnector, PeerInfo, PeerStatus, PingCallback, PEER_FLAG_NEEDS_FILTER_UPDATE,
    PEER_FLAG_SYNCED,
};
