//! Per-peer canonical-head tracking.
//!
//! For every connected peer the tracker converges on the peer's canonical
//! head in O(log N) round trips, then polls it for small updates and
//! reorgs. Two regimes: *hunting* (binary-search style probing with
//! geometrically growing strides) and *locked* (overlap polling around a
//! known head). The tracker never issues two overlapping header queries to
//! the same peer; responses are matched against the request that produced
//! them.

use hearth_common::{BlockHash, BlockNumber, constants::MAX_HEADERS_FETCH, types::{HashOrNumber, Header}};
use tracing::{debug, trace};

use crate::wire::HeadersRequest;

/// Reply length below which a non-truncated ascending reply is taken as
/// proof that its last header is the peer's head.
pub const LOCKED_MIN_REPLY: u64 = 8;
/// How far below the locked head the poll request starts.
pub const LOCKED_OVERLAP: u64 = 4;
/// Poll request size while locked.
pub const LOCKED_QUERY: u64 = 192;
/// Sample count per hunt probe.
pub const HUNT_QUERY: u64 = 16;
/// Stride growth per forward probe (multiply by 16).
pub const HUNT_FWD_SHIFT: u32 = 4;
/// Stride growth per backward probe (multiply by 2).
pub const HUNT_BWD_SHIFT: u32 = 1;

const _: () = assert!(LOCKED_MIN_REPLY >= LOCKED_OVERLAP + 2);
const _: () = assert!(LOCKED_QUERY <= MAX_HEADERS_FETCH);

/// Poll pacing while locked.
pub const LOCKED_POLL_MS: u64 = 1000;
/// Poll pacing while hunting.
pub const HUNT_POLL_MS: u64 = 50;

/// Uncertainty window of a hunt. `low` is the highest block number known
/// present on the peer, `high` the lowest known absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hunt {
    pub low: BlockNumber,
    pub high: BlockNumber,
    pub step: u64,
}

impl Hunt {
    fn full() -> Self {
        Hunt {
            low: 0,
            high: u64::MAX,
            step: 0,
        }
    }

    /// Count of numbers strictly between the known-present and
    /// known-absent bounds.
    fn uncertain(&self) -> u64 {
        (self.high - self.low).saturating_sub(1)
    }
}

/// Tracker regime. Hunt parameters only exist in the hunting variants, so
/// a locked tracker cannot carry stale hunt fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Head known; polling with overlap.
    Locked,
    /// Only the announced best hash is known.
    OnlyHash(BlockHash),
    /// Expanding upwards from a known-present number.
    HuntForward(Hunt),
    /// Expanding downwards from a known-absent number.
    HuntBackward(Hunt),
    /// Bounded window, bisecting with strided samples.
    HuntRange(Hunt),
    /// Window narrower than one probe; one dense query locks.
    HuntRangeFinal { low: BlockNumber, high: BlockNumber },
}

/// Event counters, exposed for observability and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeadStats {
    pub reorg_detected: u64,
    pub network_errors: u64,
    pub excess_block_headers: u64,
    pub timeout_block_headers: u64,
    pub wrong_block_header: u64,
    pub unexpected_block_hash: u64,
    pub get_block_headers: u64,
}

/// Protocol violations detected while interpreting a reply. Any of these
/// warrants disconnecting the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HeadTrackerError {
    #[error("reply contained more headers than requested")]
    ExcessBlockHeaders,
    #[error("reply headers do not match the requested numbering")]
    WrongBlockHeader,
    #[error("reply does not start at the requested hash")]
    UnexpectedBlockHash,
}

#[derive(Debug)]
pub struct HeadTracker {
    genesis_hash: BlockHash,
    mode: SyncMode,
    /// Highest block number seen on this peer. Authoritative while locked,
    /// a hint otherwise.
    best_number: BlockNumber,
    /// Hash of the best block. Only trustworthy while locked.
    best_hash: Option<BlockHash>,
    stats: HeadStats,
    /// Overlap guard: true while a header query is in flight.
    pending: bool,
    last_request: Option<HeadersRequest>,
}

impl HeadTracker {
    /// Tracker for a peer that announced nothing useful; hunts upward from
    /// genesis.
    pub fn new(genesis_hash: BlockHash) -> Self {
        Self {
            genesis_hash,
            mode: SyncMode::HuntForward(Hunt::full()),
            best_number: 0,
            best_hash: None,
            stats: HeadStats::default(),
            pending: false,
            last_request: None,
        }
    }

    /// Tracker seeded with the best hash from the status handshake.
    pub fn with_best_hash(genesis_hash: BlockHash, best_hash: BlockHash) -> Self {
        let mut tracker = Self::new(genesis_hash);
        tracker.mode = SyncMode::OnlyHash(best_hash);
        tracker
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    pub fn stats(&self) -> HeadStats {
        self.stats
    }

    pub fn is_locked(&self) -> bool {
        matches!(self.mode, SyncMode::Locked)
    }

    /// `(number, hash)` of the peer's head, only while locked.
    pub fn locked_head(&self) -> Option<(BlockNumber, BlockHash)> {
        match (self.mode, self.best_hash) {
            (SyncMode::Locked, Some(hash)) => Some((self.best_number, hash)),
            _ => None,
        }
    }

    /// Best-number hint for the downloader, valid in any state.
    pub fn best_number_hint(&self) -> BlockNumber {
        self.best_number
    }

    /// Milliseconds to sleep between polls in the current regime.
    pub fn poll_interval_ms(&self) -> u64 {
        if self.is_locked() {
            LOCKED_POLL_MS
        } else {
            HUNT_POLL_MS
        }
    }

    /// True while a header query is outstanding.
    pub fn request_pending(&self) -> bool {
        self.pending
    }

    /// Produces the next header query, or `None` when one is already in
    /// flight. Advances hunt strides and the expanding-to-converging
    /// transition as a side effect.
    pub fn next_request(&mut self) -> Option<HeadersRequest> {
        if self.pending {
            return None;
        }
        let request = match self.mode {
            SyncMode::Locked => {
                let start = self.best_number.saturating_sub(LOCKED_OVERLAP).max(1);
                let count = LOCKED_QUERY.min(u64::MAX - start + 1);
                HeadersRequest::ascending(start, count)
            }
            SyncMode::OnlyHash(hash) => HeadersRequest::ascending(hash, LOCKED_QUERY),
            SyncMode::HuntForward(hunt) => self.forward_request(hunt),
            SyncMode::HuntBackward(hunt) => self.backward_request(hunt),
            SyncMode::HuntRange(hunt) => self.range_request(hunt),
            SyncMode::HuntRangeFinal { low, high } => self.final_request(low, high),
        };
        self.pending = true;
        self.last_request = Some(request);
        self.stats.get_block_headers += 1;
        trace!(
            "Head query start={:?} count={} skip={}",
            request.start, request.max_results, request.skip
        );
        Some(request)
    }

    fn forward_request(&mut self, mut hunt: Hunt) -> HeadersRequest {
        if hunt.uncertain() < HUNT_QUERY {
            return self.narrow_to_final(hunt);
        }
        hunt.step = hunt.step.max(1).saturating_mul(1 << HUNT_FWD_SHIFT);
        let max_step = hunt.uncertain() / HUNT_QUERY;
        if hunt.step >= max_step >> HUNT_FWD_SHIFT && hunt.high != u64::MAX {
            // The stride covers the whole window; bisect instead.
            self.mode = SyncMode::HuntRange(hunt);
            return self.range_request(hunt);
        }
        self.mode = SyncMode::HuntForward(hunt);
        HeadersRequest {
            start: HashOrNumber::Number(hunt.low.saturating_add(hunt.step)),
            max_results: HUNT_QUERY,
            skip: hunt.step - 1,
            reverse: false,
        }
    }

    fn backward_request(&mut self, mut hunt: Hunt) -> HeadersRequest {
        if hunt.uncertain() < HUNT_QUERY {
            return self.narrow_to_final(hunt);
        }
        hunt.step = hunt.step.max(1).saturating_mul(1 << HUNT_BWD_SHIFT);
        let max_step = hunt.uncertain() / HUNT_QUERY;
        if hunt.step >= max_step >> HUNT_BWD_SHIFT {
            self.mode = SyncMode::HuntRange(hunt);
            return self.range_request(hunt);
        }
        self.mode = SyncMode::HuntBackward(hunt);
        let start = hunt
            .high
            .saturating_sub(hunt.step.saturating_mul(HUNT_QUERY))
            .max(hunt.low.saturating_add(1))
            .max(1);
        HeadersRequest {
            start: HashOrNumber::Number(start),
            max_results: HUNT_QUERY,
            skip: hunt.step - 1,
            reverse: false,
        }
    }

    fn range_request(&mut self, hunt: Hunt) -> HeadersRequest {
        if hunt.uncertain() < HUNT_QUERY {
            return self.narrow_to_final(hunt);
        }
        let max_step = hunt.uncertain() / HUNT_QUERY;
        // Center the strided probe in the window. The rounding bias keeps
        // the offset at least one above the known-present bound.
        let span = max_step.saturating_mul(HUNT_QUERY - 1);
        let offset = (hunt.uncertain() - span) / 2 + 1;
        debug_assert!(offset >= 1);
        self.mode = SyncMode::HuntRange(Hunt {
            step: max_step,
            ..hunt
        });
        HeadersRequest {
            start: HashOrNumber::Number(hunt.low.saturating_add(offset)),
            max_results: HUNT_QUERY,
            skip: max_step - 1,
            reverse: false,
        }
    }

    fn narrow_to_final(&mut self, hunt: Hunt) -> HeadersRequest {
        self.mode = SyncMode::HuntRangeFinal {
            low: hunt.low,
            high: hunt.high,
        };
        self.final_request(hunt.low, hunt.high)
    }

    fn final_request(&mut self, low: BlockNumber, _high: BlockNumber) -> HeadersRequest {
        // One dense query just below the highest number known present; the
        // short reply that comes back carries the head as its last entry.
        let start = low.saturating_sub(LOCKED_OVERLAP.min(low.saturating_sub(1))).max(1);
        HeadersRequest::ascending(start, HUNT_QUERY.max(2))
    }

    /// Feeds a reply to the outstanding query. Clears the overlap guard.
    pub fn apply_response(&mut self, headers: &[Header]) -> Result<(), HeadTrackerError> {
        let Some(request) = self.last_request.take() else {
            // A reply with no outstanding request; nothing to interpret.
            self.pending = false;
            return Ok(());
        };
        self.pending = false;

        if headers.len() as u64 > request.max_results {
            self.stats.excess_block_headers += 1;
            return Err(HeadTrackerError::ExcessBlockHeaders);
        }
        if headers.is_empty() {
            self.apply_empty(&request);
            return Ok(());
        }
        self.check_reply_shape(&request, headers)?;

        let last = &headers[headers.len() - 1];
        let short = (headers.len() as u64) < LOCKED_MIN_REPLY
            && (headers.len() as u64) < request.max_results
            && request.skip == 0
            && !request.reverse;
        if short {
            self.lock(last.number, last.hash());
            return Ok(());
        }

        // Long reply: the peer goes at least as high as the last sample.
        let highest = last.number;
        if highest > self.best_number {
            self.best_number = highest;
            self.best_hash = Some(last.hash());
        }
        match self.mode {
            SyncMode::Locked | SyncMode::OnlyHash(_) => {
                // More chain above what we believed; hunt for the new top.
                self.mode = SyncMode::HuntForward(Hunt {
                    low: highest,
                    high: u64::MAX,
                    step: 0,
                });
            }
            _ => self.update_hunt_present(highest),
        }
        Ok(())
    }

    /// Records a timeout or transport failure of the outstanding query.
    pub fn apply_failure(&mut self, timed_out: bool) {
        if timed_out {
            self.stats.timeout_block_headers += 1;
        } else {
            self.stats.network_errors += 1;
        }
        self.pending = false;
        self.last_request = None;
    }

    fn apply_empty(&mut self, request: &HeadersRequest) {
        match request.start {
            HashOrNumber::Number(1) if request.skip == 0 && !request.reverse => {
                // Peers may omit the genesis; an empty reply to a query
                // from number one means the chain ends at genesis.
                self.lock(0, self.genesis_hash);
            }
            HashOrNumber::Number(start) => match self.mode {
                SyncMode::Locked => {
                    self.stats.reorg_detected += 1;
                    debug!(
                        "Reorg: block {start} vanished below locked head {}",
                        self.best_number
                    );
                    let old_best = self.best_number;
                    self.best_number = old_best.saturating_sub(1);
                    self.best_hash = None;
                    self.mode = SyncMode::HuntBackward(Hunt {
                        low: 0,
                        high: old_best.max(1),
                        step: 0,
                    });
                }
                _ => self.update_hunt_absent(start),
            },
            HashOrNumber::Hash(_) => {
                // The announced hash is not on the peer's chain any more.
                self.stats.reorg_detected += 1;
                self.best_hash = None;
                self.mode = SyncMode::HuntForward(Hunt::full());
            }
        }
    }

    fn check_reply_shape(
        &mut self,
        request: &HeadersRequest,
        headers: &[Header],
    ) -> Result<(), HeadTrackerError> {
        match request.start {
            HashOrNumber::Number(start) => {
                let stride = request.skip + 1;
                for (i, header) in headers.iter().enumerate() {
                    let expected = start.saturating_add((i as u64).saturating_mul(stride));
                    if header.number != expected {
                        self.stats.wrong_block_header += 1;
                        return Err(HeadTrackerError::WrongBlockHeader);
                    }
                }
            }
            HashOrNumber::Hash(hash) => {
                if headers[0].hash() != hash {
                    self.stats.unexpected_block_hash += 1;
                    return Err(HeadTrackerError::UnexpectedBlockHash);
                }
            }
        }
        Ok(())
    }

    fn lock(&mut self, number: BlockNumber, hash: BlockHash) {
        if !self.is_locked() {
            debug!("Head locked at {number}");
        }
        self.best_number = number;
        self.best_hash = Some(hash);
        self.mode = SyncMode::Locked;
    }

    /// The peer has block `highest`; raise the known-present bound.
    fn update_hunt_present(&mut self, highest: BlockNumber) {
        let window = self.hunt_window();
        let Some((_, high)) = window else { return };
        if highest.saturating_add(1) >= high {
            // Known-absent bound contradicted; the peer moved ahead.
            self.mode = SyncMode::HuntForward(Hunt {
                low: highest,
                high: u64::MAX,
                step: 0,
            });
            return;
        }
        match self.mode {
            SyncMode::HuntForward(hunt) => {
                self.mode = SyncMode::HuntForward(Hunt {
                    low: highest.max(hunt.low),
                    ..hunt
                });
            }
            SyncMode::HuntBackward(hunt) | SyncMode::HuntRange(hunt) => {
                // A presence inside the window bounds it; converge.
                self.mode = SyncMode::HuntRange(Hunt {
                    low: highest.max(hunt.low),
                    ..hunt
                });
            }
            SyncMode::HuntRangeFinal { low, high } => {
                self.mode = SyncMode::HuntRangeFinal {
                    low: highest.max(low),
                    high,
                };
            }
            SyncMode::Locked | SyncMode::OnlyHash(_) => {}
        }
    }

    /// Block `lowest_absent` is missing on the peer; drop the known-absent
    /// bound.
    fn update_hunt_absent(&mut self, lowest_absent: BlockNumber) {
        let Some((low, _)) = self.hunt_window() else {
            return;
        };
        if lowest_absent <= low {
            // Our known-present bound was stale; the peer reorged below it.
            self.stats.reorg_detected += 1;
            self.mode = SyncMode::HuntBackward(Hunt {
                low: 0,
                high: lowest_absent.max(1),
                step: 0,
            });
            return;
        }
        match self.mode {
            SyncMode::HuntForward(hunt) => {
                // Upper bound found; converge.
                self.mode = SyncMode::HuntRange(Hunt {
                    high: lowest_absent.min(hunt.high),
                    ..hunt
                });
            }
            SyncMode::HuntBackward(hunt) | SyncMode::HuntRange(hunt) => {
                let mode = if matches!(self.mode, SyncMode::HuntBackward(_)) {
                    SyncMode::HuntBackward
                } else {
                    SyncMode::HuntRange
                };
                self.mode = mode(Hunt {
                    high: lowest_absent.min(hunt.high),
                    ..hunt
                });
            }
            SyncMode::HuntRangeFinal { low, high } => {
                self.mode = SyncMode::HuntRangeFinal {
                    low,
                    high: lowest_absent.min(high),
                };
            }
            SyncMode::Locked | SyncMode::OnlyHash(_) => {}
        }
    }

    fn hunt_window(&self) -> Option<(BlockNumber, BlockNumber)> {
        match self.mode {
            SyncMode::HuntForward(hunt)
            | SyncMode::HuntBackward(hunt)
            | SyncMode::HuntRange(hunt) => Some((hunt.low, hunt.high)),
            SyncMode::HuntRangeFinal { low, high } => Some((low, high)),
            SyncMode::Locked | SyncMode::OnlyHash(_) => None,
        }
    }
}
