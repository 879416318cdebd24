//! The sync application driven by the peer-pool scheduler.
//!
//! One [`SyncApp`] instance implements every scheduler callback: peer
//! admission with the status handshake, the per-peer worker body (head
//! tracking, pivot negotiation, block fetching), the pool-mode sweep and
//! the background daemon that applies head announcements and fills the
//! canonical chain from the skeleton.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hearth_common::types::Block;
use hearth_storage::{Store, error::StoreError};
use rustc_hash::FxHashMap;
use tokio::sync::{Mutex, mpsc};
use tokio::time::{Instant, sleep};
use tracing::{debug, info, trace, warn};

use crate::block_queue::{
    BlockQueue, BlockQueueError, HeadersOutcome, WorkItem, fetch_bodies, fetch_headers,
};
use crate::config::{CtrlTarget, SyncConfig};
use crate::head_tracker::HeadTracker;
use crate::peer_table::PeerId;
use crate::pivot::{NegotiateOutcome, PivotNegotiator};
use crate::scheduler::{PoolApp, PoolCtx};
use crate::skeleton::{Skeleton, SkeletonError};
use crate::wire::{ComCounters, ComError, ComOutcome, DisconnectReason, validate_status};

/// How often the accepted-height summary is logged, in worker laps.
const PROGRESS_LOG_LAPS: u64 = 200;

/// Mid-reply linkage breaks tolerated before a peer is written off as
/// serving garbage.
const LINK_BREAK_MAX: u32 = 2;

struct PeerState {
    tracker: HeadTracker,
    counters: ComCounters,
    last_poll: Option<Instant>,
    link_breaks: u32,
}

/// State shared by every worker of one sync session. Guarded by a single
/// async lock so all bookkeeping happens as if on one event loop.
struct SharedSync {
    queue: BlockQueue,
    skeleton: Option<Skeleton>,
    pivot: PivotNegotiator,
    peers: FxHashMap<PeerId, PeerState>,
    announcements: mpsc::UnboundedReceiver<(Block, bool)>,
    laps: u64,
}

pub struct SyncApp {
    store: Store,
    config: SyncConfig,
    shared: Mutex<SharedSync>,
}

impl SyncApp {
    pub fn new(
        store: Store,
        config: SyncConfig,
        announcements: mpsc::UnboundedReceiver<(Block, bool)>,
    ) -> Self {
        Self {
            store,
            config: config.clone(),
            shared: Mutex::new(SharedSync {
                queue: BlockQueue::new(0),
                skeleton: None,
                pivot: PivotNegotiator::new(config.relaxed_mode),
                peers: FxHashMap::default(),
                announcements,
                laps: 0,
            }),
        }
    }

    /// Applies one classified communication failure; returns false when
    /// the peer is beyond saving.
    async fn handle_com_error(
        &self,
        ctx: &PoolCtx,
        peer: PeerId,
        error: &ComError,
    ) -> bool {
        let outcome = {
            let mut shared = self.shared.lock().await;
            match shared.peers.get_mut(&peer) {
                Some(state) => state.counters.classify(error),
                None => return false,
            }
        };
        match outcome {
            ComOutcome::Backoff(backoff) => {
                trace!("Peer {peer:#x} failed ({error}), backing off");
                sleep(backoff).await;
                true
            }
            ComOutcome::Zombie => {
                warn!("Peer {peer:#x} failed fatally: {error}");
                if let Some(wire) = ctx.peer_wire(&peer) {
                    wire.disconnect(DisconnectReason::BreachOfProtocol).await;
                }
                ctx.zombify(&peer);
                false
            }
            ComOutcome::Ignore => true,
        }
    }

    /// One head-tracking poll, if the cadence allows.
    async fn track_head(&self, ctx: &PoolCtx, peer: PeerId) -> bool {
        let Some(wire) = ctx.peer_wire(&peer) else {
            return false;
        };
        let request = {
            let mut shared = self.shared.lock().await;
            let Some(state) = shared.peers.get_mut(&peer) else {
                return false;
            };
            let interval = Duration::from_millis(state.tracker.poll_interval_ms());
            if state.last_poll.is_some_and(|at| at.elapsed() < interval) {
                return true;
            }
            match state.tracker.next_request() {
                Some(request) => {
                    state.last_poll = Some(Instant::now());
                    request
                }
                None => return true,
            }
        };

        let result = wire.get_block_headers(request).await;
        let violation = {
            let mut shared = self.shared.lock().await;
            let Some(state) = shared.peers.get_mut(&peer) else {
                return false;
            };
            match result {
                Ok(headers) => {
                    state.counters.reset();
                    let violation = state.tracker.apply_response(&headers).err();
                    ctx.set_peer_best(&peer, state.tracker.best_number_hint());
                    violation
                }
                Err(error) => {
                    state
                        .tracker
                        .apply_failure(matches!(error, ComError::ResponseTimeout));
                    drop(shared);
                    return self.handle_com_error(ctx, peer, &error).await;
                }
            }
        };
        if let Some(violation) = violation {
            warn!("Peer {peer:#x} violated the header protocol: {violation}");
            wire.disconnect(DisconnectReason::BreachOfProtocol).await;
            ctx.zombify(&peer);
            return false;
        }
        true
    }

    /// Backward skeleton extension from this peer, when the skeleton is
    /// active and not yet linked.
    async fn skeleton_lap(&self, ctx: &PoolCtx, peer: PeerId) -> bool {
        let next_hash = {
            let shared = self.shared.lock().await;
            match &shared.skeleton {
                Some(skeleton) if skeleton.has_progress() => {
                    let active = skeleton.subchains()[0];
                    // Nothing to pull once the walk reached genesis or
                    // linked into the canonical chain.
                    if active.tail == 0 || skeleton.is_linked().await.unwrap_or(false) {
                        None
                    } else {
                        Some(active.next)
                    }
                }
                _ => None,
            }
        };
        let Some(next_hash) = next_hash else {
            return true;
        };
        let Some(wire) = ctx.peer_wire(&peer) else {
            return false;
        };

        let mut item = WorkItem::for_backtrack(next_hash);
        if let Err(err) = fetch_headers(wire.as_ref(), &mut item).await {
            return self.handle_fetch_error(ctx, peer, err).await;
        }
        if let Err(err) = fetch_bodies(wire.as_ref(), &mut item, self.config.chunk_size).await {
            return self.handle_fetch_error(ctx, peer, err).await;
        }

        // put_blocks wants newest first.
        let headers: Vec<_> = item.headers.iter().rev().cloned().collect();
        let bodies: Vec<_> = item.bodies.iter().rev().cloned().collect();
        let mut shared = self.shared.lock().await;
        let Some(skeleton) = shared.skeleton.as_mut() else {
            return true;
        };
        match skeleton.put_blocks(&headers, &bodies).await {
            Ok(status) => {
                if status.merged {
                    debug!("Skeleton subchains merged, backward fetch restarts");
                }
                true
            }
            // Another worker advanced the tail while we fetched; the batch
            // is stale, not hostile.
            Err(SkeletonError::LinkMismatch) => {
                trace!("Dropping stale skeleton batch from peer {peer:#x}");
                true
            }
            Err(err) => {
                warn!("Skeleton refused batch: {err}");
                true
            }
        }
    }

    async fn handle_fetch_error(
        &self,
        ctx: &PoolCtx,
        peer: PeerId,
        error: BlockQueueError,
    ) -> bool {
        if error.is_peer_fault() {
            warn!("Peer {peer:#x} served a bad block range: {error}");
            if let Some(wire) = ctx.peer_wire(&peer) {
                wire.disconnect(DisconnectReason::BreachOfProtocol).await;
            }
            ctx.zombify(&peer);
            return false;
        }
        if let BlockQueueError::Com(com) = &error {
            return self.handle_com_error(ctx, peer, com).await;
        }
        trace!("Fetch for peer {peer:#x} yielded nothing: {error}");
        true
    }

    /// Block-queue producer lap: reserve, fetch, stage. Runs the
    /// backtrack reverse fetch under the shared lock so it is effectively
    /// single mode.
    async fn queue_lap(&self, ctx: &PoolCtx, peer: PeerId) -> bool {
        let Some(wire) = ctx.peer_wire(&peer) else {
            return false;
        };

        // Backtrack has priority and excludes parallel producers; holding
        // the shared lock across the fetch makes this lap effectively
        // single mode.
        {
            let mut shared = self.shared.lock().await;
            if let Some(top_hash) = shared.queue.backtrack() {
                ctx.set_multi_ok(&peer, false);
                let mut item = WorkItem::for_backtrack(top_hash);
                let fetched = match fetch_headers(wire.as_ref(), &mut item).await {
                    Ok(_) => fetch_bodies(wire.as_ref(), &mut item, self.config.chunk_size).await,
                    Err(err) => Err(err),
                };
                match fetched {
                    Ok(()) => {
                        if shared.queue.stage_backtrack(item) {
                            ctx.set_pool_mode(true);
                        }
                    }
                    // An empty or foreign reply does not condemn the peer:
                    // the hash itself may be bogus. Give up on it after a
                    // few peers failed the same way.
                    Err(
                        BlockQueueError::EmptyHeadersReply
                        | BlockQueueError::WrongHeadersReply
                        | BlockQueueError::UnmatchedBodies,
                    ) => {
                        shared.queue.backtrack_failed();
                    }
                    Err(err) => {
                        drop(shared);
                        return self.handle_fetch_error(ctx, peer, err).await;
                    }
                }
                return true;
            }
        }

        let mut item = {
            let mut shared = self.shared.lock().await;
            let best = ctx.peer_best(&peer).unwrap_or(0);
            match shared.queue.new_work_item(best) {
                Ok(item) => item,
                Err(BlockQueueError::NoMoreUnprocessed)
                | Err(BlockQueueError::NoMorePeerBlocks) => return true,
                Err(err) => {
                    trace!("No work item for peer {peer:#x}: {err}");
                    return true;
                }
            }
        };
        let blocks = item.blocks;

        let mut condemned = false;
        match fetch_headers(wire.as_ref(), &mut item).await {
            Ok(HeadersOutcome::Complete) => {
                let mut shared = self.shared.lock().await;
                if let Some(state) = shared.peers.get_mut(&peer) {
                    state.link_breaks = 0;
                }
            }
            Ok(HeadersOutcome::Truncated {
                recycle,
                linkage_break,
            }) => {
                let mut shared = self.shared.lock().await;
                shared.queue.recycle(recycle);
                if linkage_break
                    && let Some(state) = shared.peers.get_mut(&peer)
                {
                    state.link_breaks += 1;
                    condemned = state.link_breaks >= LINK_BREAK_MAX;
                }
            }
            Err(err) => {
                self.shared.lock().await.queue.recycle(blocks);
                return self.handle_fetch_error(ctx, peer, err).await;
            }
        }
        if let Err(err) = fetch_bodies(wire.as_ref(), &mut item, self.config.chunk_size).await {
            self.shared.lock().await.queue.recycle(item.blocks);
            return self.handle_fetch_error(ctx, peer, err).await;
        }

        let mut shared = self.shared.lock().await;
        if shared.queue.stage(item) {
            debug!("Staged queue past trigger, requesting pool sweep");
            ctx.set_pool_mode(true);
        }
        drop(shared);
        if condemned {
            // The good prefix is staged; the peer itself has broken
            // linkage once too often.
            warn!("Peer {peer:#x} keeps serving broken header chains");
            wire.disconnect(DisconnectReason::BreachOfProtocol).await;
            ctx.zombify(&peer);
            return false;
        }
        true
    }

    /// Consumer: drain staged items in order into the chain importer.
    async fn consume_staged(&self, ctx: &PoolCtx) {
        loop {
            let mut shared = self.shared.lock().await;
            let item = match shared.queue.fetch_staged() {
                Ok(item) => item,
                Err(_) => return,
            };
            let blocks: Vec<Block> = item
                .headers
                .iter()
                .cloned()
                .zip(item.bodies.iter().cloned())
                .map(|(header, body)| Block::new(header, body))
                .collect();
            match self.store.persist_blocks(blocks).await {
                Ok(()) => {
                    shared.queue.accept(&item);
                }
                Err(err) => {
                    warn!("Importer refused staged range {}: {err}", item.blocks);
                    // A parent-hash mismatch at the boundary means the
                    // accepted chain forked under us; walk back to the
                    // common ancestor in single mode.
                    if matches!(err, StoreError::ParentHashMismatch(_))
                        && shared.queue.backtrack_from(&item).is_ok()
                    {
                        for id in ctx.peers_mru() {
                            ctx.set_multi_ok(&id, false);
                        }
                    }
                    shared.queue.recycle(item.blocks);
                    return;
                }
            }
        }
    }

    async fn log_progress(&self) {
        let mut shared = self.shared.lock().await;
        shared.laps += 1;
        if shared.laps % PROGRESS_LOG_LAPS != 0 {
            return;
        }
        let staged = shared.queue.staged_len();
        let top = shared.queue.top_accepted();
        let spans = shared.queue.unprocessed().chunks();
        info!(
            "[SYNCING] accepted up to block {top}, {staged} staged item(s), {spans} open span(s)"
        );
    }
}

#[async_trait]
impl PoolApp for SyncApp {
    async fn run_setup(&self, ctx: Arc<PoolCtx>) -> bool {
        if let Err(err) = self.config.validate() {
            warn!("Sync configuration rejected: {err}");
            return false;
        }
        let skeleton = match Skeleton::load(self.store.clone()).await {
            Ok(skeleton) => skeleton,
            Err(err) => {
                warn!("Cannot load skeleton state: {err}");
                return false;
            }
        };
        if self.config.bootstrap_resume_only && !skeleton.has_progress() {
            warn!("No persisted sync state and bootstrap-resume-only is set");
            return false;
        }
        let top_accepted = match self.store.canonical_head().await {
            Ok((number, _)) => number,
            Err(err) => {
                warn!("Store has no canonical head: {err}");
                return false;
            }
        };

        let mut shared = self.shared.lock().await;
        shared.queue = BlockQueue::new(top_accepted);
        match self.config.ctrl_target() {
            Some(CtrlTarget::Number(target)) => {
                info!("Sync target overridden to block {target}");
                shared.queue.limit_target(target);
            }
            Some(CtrlTarget::Hash(hash)) => match self.store.get_block_number(hash).await {
                Ok(Some(target)) => {
                    info!("Sync target overridden to block {target} ({hash:#x})");
                    shared.queue.limit_target(target);
                }
                _ => warn!("Sync target hash {hash:#x} is unknown, ignoring"),
            },
            None => {}
        }
        shared.skeleton = Some(skeleton);
        drop(shared);

        // The daemon applies head announcements and fills the canonical
        // chain whenever the skeleton links up.
        ctx.set_daemon(true);
        true
    }

    async fn run_release(&self, _ctx: Arc<PoolCtx>) {
        let shared = self.shared.lock().await;
        let pulled = shared.skeleton.as_ref().map(Skeleton::pulled).unwrap_or(0);
        let filled = shared.skeleton.as_ref().map(Skeleton::filled).unwrap_or(0);
        info!(
            "Sync released: accepted up to {}, skeleton pulled {pulled}, filled {filled}",
            shared.queue.top_accepted()
        );
    }

    async fn run_start(&self, ctx: Arc<PoolCtx>, peer: PeerId) -> bool {
        let Some(wire) = ctx.peer_wire(&peer) else {
            return false;
        };
        let status = match wire.status().await {
            Ok(status) => status,
            Err(err) => {
                debug!("Peer {peer:#x} failed the status handshake: {err}");
                return false;
            }
        };
        let (genesis_hash, network_id, fork_id) = match (
            self.store.genesis_hash().await,
            self.store.network_id().await,
            self.store.fork_id(0, 0).await,
        ) {
            (Ok(genesis_hash), Ok(network_id), Ok(fork_id)) => {
                (genesis_hash, network_id, fork_id)
            }
            _ => return false,
        };
        if let Err(err) = validate_status(&status, genesis_hash, network_id, fork_id) {
            info!("Peer {peer:#x} is useless for sync: {err}");
            wire.disconnect(DisconnectReason::UselessPeer).await;
            return false;
        }

        let mut shared = self.shared.lock().await;
        shared.peers.insert(
            peer,
            PeerState {
                tracker: HeadTracker::with_best_hash(genesis_hash, status.best_hash),
                counters: ComCounters::default(),
                last_poll: None,
                link_breaks: 0,
            },
        );
        shared.pivot.register(
            peer,
            wire.clone(),
            status.best_hash,
            status.total_difficulty,
        );
        debug!("Peer {peer:#x} admitted at difficulty {}", status.total_difficulty);
        true
    }

    async fn run_stop(&self, _ctx: Arc<PoolCtx>, peer: PeerId) {
        let mut shared = self.shared.lock().await;
        shared.peers.remove(&peer);
        shared.pivot.unregister(&peer);
        debug!("Peer {peer:#x} released");
    }

    async fn run_peer(&self, ctx: Arc<PoolCtx>, peer: PeerId) {
        self.log_progress().await;
        if !self.track_head(&ctx, peer).await {
            return;
        }

        let skeleton_active = {
            let shared = self.shared.lock().await;
            shared
                .skeleton
                .as_ref()
                .map(Skeleton::has_progress)
                .unwrap_or(false)
        };
        if skeleton_active {
            ctx.set_multi_ok(&peer, true);
            self.skeleton_lap(&ctx, peer).await;
            return;
        }

        // Legacy path: pivot quorum gates the mass download.
        let outcome = {
            let mut shared = self.shared.lock().await;
            shared.pivot.negotiate(peer).await
        };
        match outcome {
            NegotiateOutcome::Zombie => {
                if let Some(wire) = ctx.peer_wire(&peer) {
                    wire.disconnect(DisconnectReason::UselessPeer).await;
                }
                ctx.zombify(&peer);
                return;
            }
            NegotiateOutcome::Rejected | NegotiateOutcome::Retry => return,
            NegotiateOutcome::Accepted => {}
        }
        let pivot_ready = {
            let shared = self.shared.lock().await;
            shared.pivot.pivot_header(&peer).is_some()
        };
        if !pivot_ready {
            return;
        }

        let backtracking = {
            let shared = self.shared.lock().await;
            shared.queue.backtrack().is_some()
        };
        ctx.set_multi_ok(&peer, !backtracking);

        if !self.queue_lap(&ctx, peer).await {
            return;
        }
        self.consume_staged(&ctx).await;
    }

    async fn run_pool(&self, ctx: Arc<PoolCtx>, _peer: PeerId, _last: bool) -> bool {
        // First sweep invocation owns clearing the mode flag.
        ctx.set_pool_mode(false);
        let mut shared = self.shared.lock().await;
        if let Some(gap) = shared.queue.grout() {
            info!("Pool sweep grouted gap {gap}");
        }
        // One sweep step does the whole job.
        true
    }

    async fn run_daemon(&self, _ctx: Arc<PoolCtx>) -> bool {
        let mut shared = self.shared.lock().await;

        // Apply queued head announcements.
        loop {
            let (block, force) = match shared.announcements.try_recv() {
                Ok(announcement) => announcement,
                Err(_) => break,
            };
            let number = block.header.number;
            let Some(skeleton) = shared.skeleton.as_mut() else {
                break;
            };
            if !skeleton.has_progress() {
                if let Err(err) = skeleton.init_sync(&block).await {
                    warn!("Skeleton init at {number} failed: {err}");
                }
                continue;
            }
            match skeleton.set_head(&block, force).await {
                Ok(()) => {}
                Err(SkeletonError::SyncReorged) => {
                    info!("Skeleton reorged at {number}, restarting from announced head");
                    if let Err(err) = self.store.clear_skeleton().await {
                        warn!("Cannot clear skeleton state: {err}");
                        continue;
                    }
                    *skeleton = match Skeleton::load(self.store.clone()).await {
                        Ok(fresh) => fresh,
                        Err(err) => {
                            warn!("Cannot reload skeleton: {err}");
                            continue;
                        }
                    };
                    if let Err(err) = skeleton.init_sync(&block).await {
                        warn!("Skeleton re-init at {number} failed: {err}");
                    }
                }
                Err(SkeletonError::ReorgDenied) => {
                    debug!("Dropping non-forced reorg announcement at {number}");
                }
                Err(err) => warn!("Head announcement at {number} failed: {err}"),
            }
        }

        // Fill whenever the backward walk has linked up.
        if let Some(skeleton) = shared.skeleton.as_mut() {
            match skeleton.fill_canonical_chain().await {
                Ok(0) => {}
                Ok(imported) => {
                    // Keep the queue's notion of progress aligned with the
                    // canonical head.
                    if let Ok((head, _)) = self.store.canonical_head().await {
                        shared.queue = BlockQueue::new(head);
                        debug!("Skeleton filled {imported} block(s), queue rebased to {head}");
                    }
                }
                Err(SkeletonError::Exhausted) => {
                    warn!("Skeleton exhausted, waiting for a new head announcement");
                }
                Err(err) => warn!("Canonical fill failed: {err}"),
            }
        }
        true
    }
}
