//! Peer-pool scheduler.
//!
//! Runs one cooperative worker loop per admitted peer. A worker lap runs
//! in one of three modes: *single* (default, exclusive), *multi* (opted-in
//! workers run concurrently) or *pool* (one worker sweeps every slot with
//! all other activity excluded). A single-instance background daemon can
//! run alongside. Admission and eviction go through the LRU peer table;
//! shutdown cancels in-flight wire calls instead of waiting them out.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use crate::peer_table::{PeerId, PeerSlot, PeerTable};
use crate::wire::PeerWire;

/// Minimum wall-clock length of one worker lap.
pub const MIN_LAP: Duration = Duration::from_millis(50);
/// Poll pacing while waiting for coordination flags to clear.
const FLAG_POLL: Duration = Duration::from_millis(1);

/// Application callbacks driven by the scheduler. One implementor wires
/// the whole sync engine together.
#[async_trait]
pub trait PoolApp: Send + Sync + 'static {
    /// Runs once before any worker starts. Returning false aborts
    /// startup entirely.
    async fn run_setup(&self, ctx: Arc<PoolCtx>) -> bool;

    /// Runs once after every worker has stopped.
    async fn run_release(&self, ctx: Arc<PoolCtx>);

    /// Admission check for a connecting peer. Returning false refuses the
    /// peer and parks its slot as a zombie.
    async fn run_start(&self, ctx: Arc<PoolCtx>, peer: PeerId) -> bool;

    /// Runs when a live peer leaves the table.
    async fn run_stop(&self, ctx: Arc<PoolCtx>, peer: PeerId);

    /// One worker lap for a peer, in single or multi mode.
    async fn run_peer(&self, ctx: Arc<PoolCtx>, peer: PeerId);

    /// One step of a pool-mode sweep. Returning true ends the sweep.
    async fn run_pool(&self, ctx: Arc<PoolCtx>, peer: PeerId, last: bool) -> bool;

    /// One daemon tick. Returning false stops the daemon until the flag
    /// is raised again.
    async fn run_daemon(&self, ctx: Arc<PoolCtx>) -> bool;
}

#[derive(Default)]
struct Flags {
    pool_mode: bool,
    daemon: bool,
    daemon_running: bool,
    single_run: bool,
    monitor: bool,
    active_multi: usize,
}

struct CtxInner {
    table: PeerTable,
    flags: Flags,
}

/// Shared scheduler context handed to every callback.
pub struct PoolCtx {
    inner: Mutex<CtxInner>,
    shutdown: CancellationToken,
    buddies_max: usize,
}

impl PoolCtx {
    fn new(max_peers: usize) -> Self {
        Self {
            inner: Mutex::new(CtxInner {
                table: PeerTable::new(max_peers),
                flags: Flags::default(),
            }),
            shutdown: CancellationToken::new(),
            buddies_max: max_peers,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CtxInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn buddies_max(&self) -> usize {
        self.buddies_max
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Token cancelled on scheduler shutdown; long wire calls should
    /// select against it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Raises or clears pool mode. The application owns clearing it,
    /// typically on the first sweep invocation.
    pub fn set_pool_mode(&self, on: bool) {
        self.lock().flags.pool_mode = on;
    }

    pub fn pool_mode(&self) -> bool {
        self.lock().flags.pool_mode
    }

    pub fn set_daemon(&self, on: bool) {
        self.lock().flags.daemon = on;
    }

    pub fn daemon(&self) -> bool {
        self.lock().flags.daemon
    }

    /// Lets a worker opt into running concurrently with other multi-mode
    /// workers.
    pub fn set_multi_ok(&self, peer: &PeerId, multi_ok: bool) {
        if let Some(slot) = self.lock().table.peek_mut(peer) {
            slot.control.multi_ok = multi_ok;
        }
    }

    /// Parks a peer as a zombie: its worker exits on the next lap and the
    /// slot blocks reconnection until evicted.
    pub fn zombify(&self, peer: &PeerId) {
        warn!("Peer {peer:#x} zombified");
        self.lock().table.zombify(peer);
    }

    pub fn is_zombie(&self, peer: &PeerId) -> bool {
        self.lock().table.is_zombie(peer)
    }

    pub fn peer_wire(&self, peer: &PeerId) -> Option<Arc<dyn PeerWire>> {
        self.lock().table.peek(peer).map(|slot| slot.wire.clone())
    }

    /// Publishes the head-tracker's best-number hint for the block queue.
    pub fn set_peer_best(&self, peer: &PeerId, best: u64) {
        if let Some(slot) = self.lock().table.peek_mut(peer) {
            slot.best_number = best;
        }
    }

    pub fn peer_best(&self, peer: &PeerId) -> Option<u64> {
        self.lock().table.peek(peer).map(|slot| slot.best_number)
    }

    pub fn peer_count(&self) -> usize {
        self.lock().table.len()
    }

    pub fn peers_mru(&self) -> Vec<PeerId> {
        self.lock().table.ids_mru()
    }

    fn worker_should_exit(&self, peer: &PeerId) -> bool {
        if self.shutdown.is_cancelled() {
            return true;
        }
        let inner = self.lock();
        match inner.table.peek(peer) {
            Some(slot) => slot.control.is_stopped(),
            None => true,
        }
    }
}

/// What a worker decided to do for this lap.
enum Lap {
    Yield,
    Pool,
    Multi,
    Single,
}

/// The peer-pool scheduler. Owns the worker tasks and the daemon.
pub struct PeerPool<A: PoolApp> {
    app: Arc<A>,
    ctx: Arc<PoolCtx>,
    tracker: TaskTracker,
    started: Mutex<bool>,
}

impl<A: PoolApp> PeerPool<A> {
    pub fn new(app: Arc<A>, max_peers: usize) -> Self {
        Self {
            app,
            ctx: Arc::new(PoolCtx::new(max_peers)),
            tracker: TaskTracker::new(),
            started: Mutex::new(false),
        }
    }

    pub fn ctx(&self) -> Arc<PoolCtx> {
        self.ctx.clone()
    }

    /// Runs the application setup. No worker is admitted before this
    /// succeeds.
    pub async fn start(&self) -> bool {
        if !self.app.run_setup(self.ctx.clone()).await {
            warn!("Peer pool setup refused, not starting");
            return false;
        }
        *self.started.lock().unwrap_or_else(|p| p.into_inner()) = true;
        // The daemon does not depend on peer activity; bring it up right
        // away if setup asked for it.
        maybe_spawn_daemon(&self.app, &self.ctx, &self.tracker);
        info!("Peer pool started, capacity {}", self.ctx.buddies_max);
        true
    }

    /// Cancels every worker (including in-flight wire calls), waits for
    /// them, then runs the application release hook.
    pub async fn stop(&self) {
        self.ctx.shutdown.cancel();
        self.ctx.set_daemon(false);
        self.tracker.close();
        self.tracker.wait().await;
        self.app.run_release(self.ctx.clone()).await;
        info!("Peer pool stopped");
    }

    /// Admits a connecting peer: allocates its slot, runs the start hook
    /// and spawns its worker loop. Reconnects of known (zombie) peers are
    /// ignored.
    pub async fn on_peer_connected(&self, peer: PeerId, wire: Arc<dyn PeerWire>) {
        if !*self.started.lock().unwrap_or_else(|p| p.into_inner())
            || self.ctx.shutdown.is_cancelled()
        {
            return;
        }
        let evicted = {
            let mut inner = self.ctx.lock();
            if inner.table.contains(&peer) {
                trace!("Ignoring reconnect of known peer {peer:#x}");
                return;
            }
            inner.table.insert(PeerSlot::new(peer, wire))
        };
        if let Some(evicted) = evicted {
            // A live worker lost its slot to the newcomer.
            self.app.run_stop(self.ctx.clone(), evicted.id).await;
        }

        if !self.app.run_start(self.ctx.clone(), peer).await {
            debug!("Peer {peer:#x} refused at admission");
            self.ctx.zombify(&peer);
            return;
        }

        let app = self.app.clone();
        let ctx = self.ctx.clone();
        let tracker = self.tracker.clone();
        self.tracker.spawn(async move {
            worker_loop(app, ctx, tracker, peer).await;
        });
    }

    /// Handles a disconnect notification from the networking layer.
    /// Zombie slots are retained so the remote cannot reconnect at once.
    pub async fn on_peer_disconnected(&self, peer: PeerId) {
        let removed = {
            let mut inner = self.ctx.lock();
            if inner.table.is_zombie(&peer) {
                if let Some(slot) = inner.table.peek_mut(&peer) {
                    slot.control.stop();
                }
                None
            } else {
                inner.table.remove(&peer)
            }
        };
        if removed.is_some() {
            self.app.run_stop(self.ctx.clone(), peer).await;
        }
    }
}

async fn worker_loop<A: PoolApp>(
    app: Arc<A>,
    ctx: Arc<PoolCtx>,
    tracker: TaskTracker,
    peer: PeerId,
) {
    debug!("Worker for peer {peer:#x} starting");
    loop {
        if ctx.worker_should_exit(&peer) {
            break;
        }
        let lap_start = Instant::now();

        let lap = {
            let mut inner = ctx.lock();
            if inner.flags.monitor {
                // Someone else is sweeping.
                Lap::Yield
            } else if inner.flags.pool_mode {
                inner.flags.monitor = true;
                Lap::Pool
            } else {
                inner.table.touch(&peer);
                let multi_ok = inner
                    .table
                    .peek(&peer)
                    .map(|slot| slot.control.multi_ok)
                    .unwrap_or(false);
                if multi_ok && !inner.flags.single_run {
                    inner.flags.active_multi += 1;
                    Lap::Multi
                } else if inner.flags.single_run {
                    Lap::Yield
                } else {
                    inner.flags.single_run = true;
                    Lap::Single
                }
            }
        };

        match lap {
            Lap::Yield => {}
            Lap::Multi => {
                run_peer_cancellable(&app, &ctx, peer).await;
                ctx.lock().flags.active_multi -= 1;
            }
            Lap::Single => {
                run_peer_cancellable(&app, &ctx, peer).await;
                ctx.lock().flags.single_run = false;
            }
            Lap::Pool => {
                pool_sweep(&app, &ctx).await;
                ctx.lock().flags.monitor = false;
            }
        }

        maybe_spawn_daemon(&app, &ctx, &tracker);

        let elapsed = lap_start.elapsed();
        if elapsed < MIN_LAP {
            sleep(MIN_LAP - elapsed).await;
        } else {
            tokio::task::yield_now().await;
        }
    }
    debug!("Worker for peer {peer:#x} exiting");
}

async fn run_peer_cancellable<A: PoolApp>(app: &Arc<A>, ctx: &Arc<PoolCtx>, peer: PeerId) {
    tokio::select! {
        _ = ctx.shutdown.cancelled() => {}
        _ = app.run_peer(ctx.clone(), peer) => {}
    }
}

/// Exclusive sweep over every slot in most-recently-used order. Waits for
/// multi and single activity to drain first; the monitor flag set by the
/// caller keeps new activity out meanwhile.
async fn pool_sweep<A: PoolApp>(app: &Arc<A>, ctx: &Arc<PoolCtx>) {
    loop {
        if ctx.shutdown.is_cancelled() {
            return;
        }
        let quiet = {
            let inner = ctx.lock();
            inner.flags.active_multi == 0 && !inner.flags.single_run
        };
        if quiet {
            break;
        }
        sleep(FLAG_POLL).await;
    }
    let ids = ctx.peers_mru();
    let total = ids.len();
    for (i, id) in ids.into_iter().enumerate() {
        let last = i + 1 == total;
        let done = tokio::select! {
            _ = ctx.shutdown.cancelled() => true,
            done = app.run_pool(ctx.clone(), id, last) => done,
        };
        if done {
            break;
        }
    }
}

fn maybe_spawn_daemon<A: PoolApp>(app: &Arc<A>, ctx: &Arc<PoolCtx>, tracker: &TaskTracker) {
    let should_spawn = {
        let mut inner = ctx.lock();
        if inner.flags.daemon && !inner.flags.daemon_running {
            inner.flags.daemon_running = true;
            true
        } else {
            false
        }
    };
    if !should_spawn {
        return;
    }
    let app = app.clone();
    let ctx = ctx.clone();
    tracker.spawn(async move {
        daemon_loop(app, ctx).await;
    });
}

async fn daemon_loop<A: PoolApp>(app: Arc<A>, ctx: Arc<PoolCtx>) {
    debug!("Daemon starting");
    loop {
        if ctx.shutdown.is_cancelled() || !ctx.daemon() {
            break;
        }
        let lap_start = Instant::now();
        let keep_going = tokio::select! {
            _ = ctx.shutdown.cancelled() => false,
            going = app.run_daemon(ctx.clone()) => going,
        };
        if !keep_going {
            ctx.set_daemon(false);
            break;
        }
        let elapsed = lap_start.elapsed();
        if elapsed < MIN_LAP {
            sleep(MIN_LAP - elapsed).await;
        } else {
            tokio::task::yield_now().await;
        }
    }
    ctx.lock().flags.daemon_running = false;
    debug!("Daemon exiting");
}
