//! # hearth Sync
//!
//! The peer-pool sync engine of the hearth execution client.
//!
//! ## Overview
//!
//! Maintains many concurrent peer connections, locates each peer's
//! canonical chain head and downloads block headers and bodies from them,
//! merging the results into the local chain database. The engine is built
//! from:
//!
//! - a per-peer head tracker that converges on and polls each peer's
//!   canonical head ([`head_tracker`]),
//! - a pivot negotiator that requires a peer quorum before mass download
//!   ([`pivot`]),
//! - a work-queue downloader filling forward from the accepted top
//!   ([`block_queue`]),
//! - a backwards-extending header skeleton driven by consensus head
//!   announcements ([`skeleton`]),
//! - a capacity-bounded, LRU-evicting peer-pool scheduler running the
//!   per-peer worker loops ([`scheduler`], [`peer_table`]),
//! - typed wire adapters with a communication-error classifier ([`wire`]).
//!
//! ## Usage
//!
//! ```ignore
//! use hearth_sync::{SyncConfig, SyncManager};
//!
//! let sync = SyncManager::new(store, SyncConfig::default());
//! sync.start().await;
//! // wire the networking layer's observers:
//! //   on connect    -> sync.on_peer_connected(id, wire)
//! //   on disconnect -> sync.on_peer_disconnected(id)
//! // and the consensus head source -> sync.announce_head(block, force)
//! ```

pub mod block_queue;
pub mod config;
pub mod head_tracker;
pub mod peer_table;
pub mod pivot;
pub mod ranges;
pub mod scheduler;
pub mod skeleton;
pub mod test_utils;
pub mod wire;
pub mod worker;

use std::sync::Arc;

use hearth_common::types::Block;
use hearth_storage::Store;
use tokio::sync::mpsc;
use tracing::warn;

pub use config::{ConfigError, SyncConfig};
pub use peer_table::PeerId;
pub use scheduler::{PeerPool, PoolCtx};
pub use wire::PeerWire;
pub use worker::SyncApp;

/// The sync orchestrator: owns the scheduler, the shared engine state and
/// the head-announcement channel.
pub struct SyncManager {
    pool: PeerPool<SyncApp>,
    announce_tx: mpsc::UnboundedSender<(Block, bool)>,
}

impl SyncManager {
    pub fn new(store: Store, config: SyncConfig) -> Self {
        let (announce_tx, announce_rx) = mpsc::unbounded_channel();
        let app = Arc::new(SyncApp::new(store, config.clone(), announce_rx));
        let pool = PeerPool::new(app, config.max_peers);
        Self { pool, announce_tx }
    }

    /// Starts the engine. Returns false when the configuration is invalid
    /// or a resume-only bootstrap finds no persisted state.
    pub async fn start(&self) -> bool {
        self.pool.start().await
    }

    /// Stops every worker, cancelling in-flight peer requests.
    pub async fn stop(&self) {
        self.pool.stop().await;
    }

    /// Networking-layer observer: a peer connection came up.
    pub async fn on_peer_connected(&self, peer: PeerId, wire: Arc<dyn PeerWire>) {
        self.pool.on_peer_connected(peer, wire).await;
    }

    /// Networking-layer observer: a peer connection went away.
    pub async fn on_peer_disconnected(&self, peer: PeerId) {
        self.pool.on_peer_disconnected(peer).await;
    }

    /// Consensus-side head announcement. With `force` the skeleton tears
    /// down and restarts on a reorg instead of refusing it.
    pub fn announce_head(&self, block: Block, force: bool) {
        if self.announce_tx.send((block, force)).is_err() {
            warn!("Head announcement dropped, sync engine is gone");
        }
    }

    /// Scheduler context, exposed for observers and tests.
    pub fn ctx(&self) -> Arc<PoolCtx> {
        self.pool.ctx()
    }
}
