//! Work-queue block downloader.
//!
//! Shared across all peer workers: an interval set of block numbers still
//! to fetch, a staging area of downloaded-but-not-imported work items, and
//! a backtrack hash for reverse fetches after the consumer refuses a
//! staged item. Producers reserve a range, fetch headers then bodies, and
//! stage the result; the consumer drains staged items strictly in
//! ascending order and imports them.

use std::collections::BTreeMap;

use hearth_common::{
    BlockHash, BlockNumber,
    constants::{MAX_BODIES_FETCH, MAX_HEADERS_FETCH},
    types::{Body, Header},
};
use tracing::{debug, trace, warn};

use crate::ranges::{BlockRange, BlockRangeSet};
use crate::wire::{ComError, HeadersRequest, PeerWire, clamp_bodies_request};

/// Staged-item count above which the scheduler is asked to enter pool
/// mode and compact the queue.
pub const STAGED_TRIGGER: usize = 50;
/// Hard cap on staged items; the topmost item is dropped beyond this.
pub const STAGED_MAX: usize = 70;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlockQueueError {
    #[error("no unprocessed block ranges left")]
    NoMoreUnprocessed,
    #[error("peer has no blocks for the least unprocessed range")]
    NoMorePeerBlocks,
    #[error("nothing staged")]
    NothingStaged,
    #[error("least staged item does not close the gap above the accepted top")]
    BlockNumberGap,
    #[error("peer returned an empty headers reply for a mandatory range")]
    EmptyHeadersReply,
    #[error("peer reply does not match the requested range")]
    WrongHeadersReply,
    #[error("peer returned more data than requested")]
    ExcessReply,
    #[error("bodies reply left headers unmatched")]
    UnmatchedBodies,
    #[error("backtrack requires a fetched item with headers")]
    EmptyBacktrackItem,
    #[error(transparent)]
    Com(#[from] ComError),
}

impl BlockQueueError {
    /// True when the error proves peer misbehavior rather than a local or
    /// transient condition; such peers get disconnected and zombified.
    pub fn is_peer_fault(&self) -> bool {
        matches!(
            self,
            BlockQueueError::EmptyHeadersReply
                | BlockQueueError::WrongHeadersReply
                | BlockQueueError::ExcessReply
                | BlockQueueError::UnmatchedBodies
        )
    }
}

/// A self-contained description of a block-number interval and the data
/// downloaded for it.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub blocks: BlockRange,
    /// When set, this item is filled by a reverse fetch from this hash and
    /// `blocks` is measured from the reply.
    pub top_hash: Option<BlockHash>,
    pub headers: Vec<Header>,
    pub hashes: Vec<BlockHash>,
    pub bodies: Vec<Body>,
}

impl WorkItem {
    fn for_range(blocks: BlockRange) -> Self {
        Self {
            blocks,
            top_hash: None,
            headers: Vec::new(),
            hashes: Vec::new(),
            bodies: Vec::new(),
        }
    }

    /// Dummy item driving a reverse fetch from `top_hash`.
    pub fn for_backtrack(top_hash: BlockHash) -> Self {
        Self {
            blocks: BlockRange::new(0, 0),
            top_hash: Some(top_hash),
            headers: Vec::new(),
            hashes: Vec::new(),
            bodies: Vec::new(),
        }
    }

    /// Headers fetched and consistent with `blocks`.
    pub fn is_fetched(&self) -> bool {
        !self.headers.is_empty() && self.headers.len() as u64 == self.blocks.len()
    }
}

/// Consecutive failed reverse fetches tolerated before a backtrack hash
/// is written off as bogus.
pub const BACKTRACK_RETRY_MAX: u32 = 2;

/// How an ascending headers fetch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadersOutcome {
    /// The whole requested range arrived linked.
    Complete,
    /// The item shrank; `recycle` must go back to the unprocessed set.
    /// `linkage_break` distinguishes a mid-reply parent-hash break from a
    /// benignly short reply.
    Truncated {
        recycle: BlockRange,
        linkage_break: bool,
    },
}

/// Queue state shared by every peer worker of a sync session.
#[derive(Debug)]
pub struct BlockQueue {
    unprocessed: BlockRangeSet,
    staged: BTreeMap<BlockNumber, WorkItem>,
    top_accepted: BlockNumber,
    backtrack: Option<BlockHash>,
    backtrack_failures: u32,
}

impl BlockQueue {
    pub fn new(top_accepted: BlockNumber) -> Self {
        let mut unprocessed = BlockRangeSet::new();
        if top_accepted < u64::MAX {
            unprocessed.merge(top_accepted + 1, u64::MAX);
        }
        Self {
            unprocessed,
            staged: BTreeMap::new(),
            top_accepted,
            backtrack: None,
            backtrack_failures: 0,
        }
    }

    pub fn top_accepted(&self) -> BlockNumber {
        self.top_accepted
    }

    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    pub fn unprocessed(&self) -> &BlockRangeSet {
        &self.unprocessed
    }

    pub fn backtrack(&self) -> Option<BlockHash> {
        self.backtrack
    }

    /// Reserves the least unprocessed range for a peer, clipped to the
    /// fetch limit and to what the peer is believed to have.
    pub fn new_work_item(
        &mut self,
        peer_best: BlockNumber,
    ) -> Result<WorkItem, BlockQueueError> {
        let range = self
            .unprocessed
            .least()
            .ok_or(BlockQueueError::NoMoreUnprocessed)?;
        if range.low > peer_best {
            return Err(BlockQueueError::NoMorePeerBlocks);
        }
        let high = range
            .high
            .min(range.low.saturating_add(MAX_HEADERS_FETCH - 1))
            .min(peer_best);
        let blocks = BlockRange::new(range.low, high);
        self.unprocessed.reduce_range(blocks);
        trace!("Reserved work item {blocks}");
        Ok(WorkItem::for_range(blocks))
    }

    /// Caps the queue at an override target; everything above it is
    /// dropped from the unprocessed set.
    pub fn limit_target(&mut self, target: BlockNumber) {
        if target < u64::MAX {
            self.unprocessed.reduce(target + 1, u64::MAX);
        }
    }

    /// Returns a reserved or measured range to the unprocessed set.
    pub fn recycle(&mut self, blocks: BlockRange) {
        trace!("Recycling {blocks}");
        self.unprocessed.merge_range(blocks);
    }

    /// Stages a fetched item. Returns true when the caller should ask the
    /// scheduler for a pool-mode sweep.
    pub fn stage(&mut self, item: WorkItem) -> bool {
        debug_assert!(item.is_fetched());
        let key = item.blocks.low;
        if let Some(existing) = self.staged.insert(key, item) {
            // Same starting number staged twice: the newer item wins, and
            // whatever of the older range it does not cover goes back to
            // the unprocessed set.
            let kept_high = self
                .staged
                .get(&key)
                .map(|kept| kept.blocks.high)
                .unwrap_or(existing.blocks.high);
            if existing.blocks.high > kept_high {
                warn!(
                    "Duplicate staging at {key}, recycling [{}..{}]",
                    kept_high + 1,
                    existing.blocks.high
                );
                self.unprocessed.merge(kept_high + 1, existing.blocks.high);
            }
        }
        if self.staged.len() > STAGED_MAX
            && let Some((top_key, top_item)) = self.staged.pop_last()
        {
            warn!("Staged queue overflow, dropping item at {top_key}");
            self.unprocessed.merge_range(top_item.blocks);
        }
        self.staged.len() > STAGED_TRIGGER
    }

    /// Pops the least staged item iff it directly extends the accepted
    /// top.
    pub fn fetch_staged(&mut self) -> Result<WorkItem, BlockQueueError> {
        let (&key, _) = self
            .staged
            .first_key_value()
            .ok_or(BlockQueueError::NothingStaged)?;
        if key != self.top_accepted + 1 {
            return Err(BlockQueueError::BlockNumberGap);
        }
        self.staged
            .pop_first()
            .map(|(_, item)| item)
            .ok_or(BlockQueueError::NothingStaged)
    }

    /// Marks a consumed item as imported.
    pub fn accept(&mut self, item: &WorkItem) {
        self.top_accepted = item.blocks.high;
    }

    /// Pool-mode sweep: parallel fetching can leave a hole between the
    /// accepted top and everything still tracked; merge that hole back so
    /// the consumer is never starved forever.
    pub fn grout(&mut self) -> Option<BlockRange> {
        let gap_start = self.top_accepted.checked_add(1)?;
        let staged_bound = self.staged.first_key_value().map(|(key, _)| *key);
        let unprocessed_bound = self.unprocessed.least().map(|range| range.low);
        let bound = match (staged_bound, unprocessed_bound) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => return None,
        };
        if bound <= gap_start {
            return None;
        }
        let gap = BlockRange::new(gap_start, bound - 1);
        debug!("Grouting gap {gap}");
        self.unprocessed.merge_range(gap);
        Some(gap)
    }

    /// Remembers where to restart after the consumer refused `item` for a
    /// hash mismatch. The next producer lap must run in single mode.
    pub fn backtrack_from(&mut self, item: &WorkItem) -> Result<(), BlockQueueError> {
        let first = item
            .headers
            .first()
            .ok_or(BlockQueueError::EmptyBacktrackItem)?;
        debug!(
            "Backtracking from block {} (parent {:#x})",
            first.number, first.parent_hash
        );
        self.backtrack = Some(first.parent_hash);
        self.backtrack_failures = 0;
        Ok(())
    }

    /// Records a failed reverse fetch. After enough consecutive failures
    /// the hash is written off as bogus (nobody on the network knows it)
    /// and normal forward fetching resumes. Returns true when given up.
    pub fn backtrack_failed(&mut self) -> bool {
        self.backtrack_failures += 1;
        if self.backtrack_failures > BACKTRACK_RETRY_MAX {
            warn!("Giving up on backtrack hash {:?}", self.backtrack);
            self.backtrack = None;
            self.backtrack_failures = 0;
            return true;
        }
        false
    }

    /// Stages the result of a backtrack fetch: reserves its measured
    /// range, rolls the accepted top back under it, and clears the
    /// backtrack hash.
    pub fn stage_backtrack(&mut self, item: WorkItem) -> bool {
        self.unprocessed.reduce_range(item.blocks);
        self.backtrack_failures = 0;
        if item.blocks.low <= self.top_accepted {
            debug!(
                "Rolling accepted top back from {} to {}",
                self.top_accepted,
                item.blocks.low.saturating_sub(1)
            );
            self.top_accepted = item.blocks.low.saturating_sub(1);
        }
        self.backtrack = None;
        self.stage(item)
    }
}

/// Fills `item.headers`/`item.hashes` from the peer. On benign truncation
/// or a mid-reply linkage break the item shrinks and the uncovered upper
/// part is reported for recycling. Protocol violations surface as errors.
pub async fn fetch_headers(
    wire: &dyn PeerWire,
    item: &mut WorkItem,
) -> Result<HeadersOutcome, BlockQueueError> {
    match item.top_hash {
        Some(top_hash) => fetch_headers_reverse(wire, item, top_hash)
            .await
            .map(|_| HeadersOutcome::Complete),
        None => fetch_headers_ascending(wire, item).await,
    }
}

async fn fetch_headers_ascending(
    wire: &dyn PeerWire,
    item: &mut WorkItem,
) -> Result<HeadersOutcome, BlockQueueError> {
    let request = HeadersRequest::ascending(item.blocks.low, item.blocks.len());
    request.validate()?;
    let mut headers = wire.get_block_headers(request).await?;
    if headers.len() as u64 > request.max_results {
        return Err(BlockQueueError::ExcessReply);
    }
    let Some(first) = headers.first() else {
        return Err(BlockQueueError::EmptyHeadersReply);
    };
    if first.number != item.blocks.low {
        return Err(BlockQueueError::WrongHeadersReply);
    }

    // Keep the longest strictly-linked prefix. A break in the middle of a
    // reply happens when the peer reorgs while answering, or when the peer
    // lies.
    let mut hashes = vec![headers[0].hash()];
    let mut keep = 1usize;
    while keep < headers.len() {
        let header = &headers[keep];
        if header.number != item.blocks.low + keep as u64
            || header.parent_hash != hashes[keep - 1]
        {
            break;
        }
        hashes.push(header.hash());
        keep += 1;
    }
    let linkage_break = keep < headers.len();
    headers.truncate(keep);

    let kept_high = item.blocks.low + keep as u64 - 1;
    let outcome = if kept_high < item.blocks.high {
        let excess = BlockRange::new(kept_high + 1, item.blocks.high);
        trace!(
            "Headers reply for {} truncated, returning {excess}",
            item.blocks
        );
        item.blocks = BlockRange::new(item.blocks.low, kept_high);
        HeadersOutcome::Truncated {
            recycle: excess,
            linkage_break,
        }
    } else {
        HeadersOutcome::Complete
    };
    item.headers = headers;
    item.hashes = hashes;
    Ok(outcome)
}

async fn fetch_headers_reverse(
    wire: &dyn PeerWire,
    item: &mut WorkItem,
    top_hash: BlockHash,
) -> Result<(), BlockQueueError> {
    let request = HeadersRequest::descending(top_hash, MAX_HEADERS_FETCH);
    request.validate()?;
    let mut headers = wire.get_block_headers(request).await?;
    if headers.len() as u64 > request.max_results {
        return Err(BlockQueueError::ExcessReply);
    }
    let Some(first) = headers.first() else {
        return Err(BlockQueueError::EmptyHeadersReply);
    };
    if first.hash() != top_hash {
        return Err(BlockQueueError::WrongHeadersReply);
    }

    // Newest first: each header must be the parent of the one before it.
    let top_number = first.number;
    let mut keep = 1usize;
    while keep < headers.len() {
        let header = &headers[keep];
        let Some(expected) = top_number.checked_sub(keep as u64) else {
            break;
        };
        if header.number != expected || headers[keep - 1].parent_hash != header.hash() {
            break;
        }
        keep += 1;
    }
    headers.truncate(keep);
    headers.reverse();

    item.blocks = BlockRange::new(headers[0].number, top_number);
    item.hashes = headers.iter().map(Header::hash).collect();
    item.headers = headers;
    debug!("Measured backtrack range {}", item.blocks);
    Ok(())
}

/// Fills `item.bodies`, aligned with `item.headers`. Empty bodies are
/// synthesised locally and never requested; non-empty replies are matched
/// to headers by their commitment roots since peers may reorder them.
/// `chunk_size` caps the per-request batch, zero for the protocol limit.
pub async fn fetch_bodies(
    wire: &dyn PeerWire,
    item: &mut WorkItem,
    chunk_size: usize,
) -> Result<(), BlockQueueError> {
    let batch_limit = if chunk_size == 0 {
        MAX_BODIES_FETCH
    } else {
        chunk_size.min(MAX_BODIES_FETCH)
    };
    let mut slots: Vec<Option<Body>> = item
        .headers
        .iter()
        .map(|header| header.has_empty_body().then(Body::default))
        .collect();
    let wanted: Vec<usize> = (0..slots.len()).filter(|i| slots[*i].is_none()).collect();

    for batch in wanted.chunks(batch_limit) {
        let hashes: Vec<BlockHash> = batch.iter().map(|i| item.hashes[*i]).collect();
        clamp_bodies_request(&hashes)?;
        let bodies = wire.get_block_bodies(hashes).await?;
        if bodies.len() > batch.len() {
            return Err(BlockQueueError::ExcessReply);
        }
        for body in bodies {
            let tx_root = body.tx_root();
            let uncles_hash = body.uncles_hash();
            let slot = batch.iter().copied().find(|&i| {
                slots[i].is_none()
                    && item.headers[i].tx_root == tx_root
                    && item.headers[i].uncles_hash == uncles_hash
            });
            match slot {
                Some(i) => slots[i] = Some(body),
                None => return Err(BlockQueueError::UnmatchedBodies),
            }
        }
    }

    let mut bodies = Vec::with_capacity(slots.len());
    for slot in slots {
        match slot {
            Some(body) => bodies.push(body),
            None => return Err(BlockQueueError::UnmatchedBodies),
        }
    }
    item.bodies = bodies;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockPeer, TestChain};
    use std::sync::Arc;

    fn chain() -> Arc<TestChain> {
        Arc::new(TestChain::generate(600))
    }

    /// Coverage invariant: unprocessed, staged ranges and the accepted
    /// prefix partition `[0..target]`.
    fn assert_coverage(queue: &BlockQueue, target: u64) {
        let mut seen = crate::ranges::BlockRangeSet::new();
        if queue.top_accepted() > 0 || target == 0 {
            assert_eq!(seen.merge(0, queue.top_accepted()), queue.top_accepted() + 1);
        } else {
            seen.merge(0, 0);
        }
        for range in queue.unprocessed().iter() {
            let clipped_high = range.high.min(target);
            if range.low > target {
                continue;
            }
            let added = seen.merge(range.low, clipped_high);
            assert_eq!(added, clipped_high - range.low + 1, "unprocessed overlaps");
        }
        for item in queue.staged.values() {
            let added = seen.merge_range(item.blocks);
            assert_eq!(added, item.blocks.len(), "staged overlaps");
        }
        assert!(seen.contains(target), "coverage hole below {target}");
        assert_eq!(seen.chunks(), 1, "coverage is not contiguous");
    }

    #[tokio::test]
    async fn work_item_reservation_clips_to_peer_and_limit() {
        let mut queue = BlockQueue::new(0);
        let item = queue.new_work_item(1000).expect("item");
        assert_eq!(item.blocks, BlockRange::new(1, MAX_HEADERS_FETCH));
        // The reserved range left the unprocessed set.
        assert_eq!(
            queue.unprocessed().least().expect("range").low,
            MAX_HEADERS_FETCH + 1
        );

        // A peer that only has five blocks limits the clip.
        let mut queue = BlockQueue::new(0);
        let item = queue.new_work_item(5).expect("item");
        assert_eq!(item.blocks, BlockRange::new(1, 5));

        // A peer below the least range has nothing for us.
        let mut queue = BlockQueue::new(100);
        assert_eq!(
            queue.new_work_item(50).expect_err("below range"),
            BlockQueueError::NoMorePeerBlocks
        );
    }

    #[tokio::test]
    async fn fetch_headers_fills_and_links() {
        let chain = chain();
        let peer = MockPeer::new(chain.clone());
        let mut queue = BlockQueue::new(0);
        let mut item = queue.new_work_item(600).expect("item");
        let outcome = fetch_headers(peer.as_ref(), &mut item).await.expect("fetch");
        assert_eq!(outcome, HeadersOutcome::Complete);
        assert!(item.is_fetched());
        assert_eq!(item.headers[0].number, 1);
        assert_eq!(item.hashes[10], chain.hash_of(11));
    }

    #[tokio::test]
    async fn fetch_headers_truncates_on_linkage_break_and_recycles() {
        // S3: peer B returns headers whose parent hash breaks at index 50.
        let chain = chain();
        let peer = MockPeer::new(chain);
        peer.corrupt_parent_from(51);
        let mut queue = BlockQueue::new(0);
        let mut item = queue.new_work_item(600).expect("item");
        let outcome = fetch_headers(peer.as_ref(), &mut item).await.expect("fetch");
        let HeadersOutcome::Truncated {
            recycle,
            linkage_break,
        } = outcome
        else {
            panic!("expected truncation, got {outcome:?}");
        };
        assert!(linkage_break);
        assert_eq!(item.blocks, BlockRange::new(1, 50));
        assert_eq!(item.headers.len(), 50);
        assert_eq!(recycle, BlockRange::new(51, MAX_HEADERS_FETCH));
        queue.recycle(recycle);
        assert_eq!(queue.unprocessed().least().expect("range").low, 51);
        assert_coverage(&queue, 600);
    }

    #[tokio::test]
    async fn fetch_headers_short_reply_shrinks_item() {
        let chain = chain();
        let peer = MockPeer::new(chain);
        peer.set_head_limit(100);
        let mut queue = BlockQueue::new(0);
        let mut item = queue.new_work_item(600).expect("item");
        let outcome = fetch_headers(peer.as_ref(), &mut item).await.expect("fetch");
        assert_eq!(
            outcome,
            HeadersOutcome::Truncated {
                recycle: BlockRange::new(101, MAX_HEADERS_FETCH),
                linkage_break: false,
            }
        );
        assert_eq!(item.blocks, BlockRange::new(1, 100));
    }

    #[tokio::test]
    async fn fetch_headers_empty_reply_is_peer_fault() {
        let chain = chain();
        let peer = MockPeer::new(chain);
        peer.set_head_limit(0);
        let mut queue = BlockQueue::new(0);
        let mut item = queue.new_work_item(600).expect("item");
        let err = fetch_headers(peer.as_ref(), &mut item)
            .await
            .expect_err("empty");
        assert_eq!(err, BlockQueueError::EmptyHeadersReply);
        assert!(err.is_peer_fault());
    }

    #[tokio::test]
    async fn fetch_bodies_realigns_and_synthesises_empty() {
        let chain = chain();
        let peer = MockPeer::new(chain.clone());
        let mut queue = BlockQueue::new(0);
        let mut item = queue.new_work_item(600).expect("item");
        fetch_headers(peer.as_ref(), &mut item).await.expect("headers");
        fetch_bodies(peer.as_ref(), &mut item, 0).await.expect("bodies");
        assert_eq!(item.bodies.len(), item.headers.len());
        for (header, body) in item.headers.iter().zip(&item.bodies) {
            assert_eq!(body.tx_root(), header.tx_root);
            assert_eq!(body.uncles_hash(), header.uncles_hash);
        }
        // Block 3 is empty by construction and was synthesised locally.
        assert!(item.bodies[2].is_empty());
    }

    #[tokio::test]
    async fn fetch_bodies_aborts_on_missing_body() {
        let chain = chain();
        let peer = MockPeer::new(chain);
        peer.limit_bodies_per_request(3);
        let mut queue = BlockQueue::new(0);
        let mut item = queue.new_work_item(600).expect("item");
        fetch_headers(peer.as_ref(), &mut item).await.expect("headers");
        assert_eq!(
            fetch_bodies(peer.as_ref(), &mut item, 0).await.expect_err("truncated"),
            BlockQueueError::UnmatchedBodies
        );
    }

    #[tokio::test]
    async fn staged_consumption_in_order_with_gap_refusal() {
        let chain = chain();
        let peer = MockPeer::new(chain);
        let mut queue = BlockQueue::new(0);

        let mut first = queue.new_work_item(600).expect("item");
        fetch_headers(peer.as_ref(), &mut first).await.expect("headers");
        fetch_bodies(peer.as_ref(), &mut first, 0).await.expect("bodies");
        let mut second = queue.new_work_item(600).expect("item");
        fetch_headers(peer.as_ref(), &mut second).await.expect("headers");
        fetch_bodies(peer.as_ref(), &mut second, 0).await.expect("bodies");

        // Stage out of order: the consumer refuses the gap.
        assert!(!queue.stage(second));
        assert_eq!(
            queue.fetch_staged().expect_err("gap"),
            BlockQueueError::BlockNumberGap
        );
        assert!(!queue.stage(first));
        let item = queue.fetch_staged().expect("in order");
        assert_eq!(item.blocks.low, 1);
        queue.accept(&item);
        assert_eq!(queue.top_accepted(), MAX_HEADERS_FETCH);
        let item = queue.fetch_staged().expect("next");
        queue.accept(&item);
        assert_eq!(queue.top_accepted(), 2 * MAX_HEADERS_FETCH);
        assert_coverage(&queue, 600);
    }

    #[tokio::test]
    async fn grout_fills_singleton_gap() {
        // S5 core: a one-block hole between the accepted top and the least
        // staged item is merged back for refetching.
        let chain = chain();
        let peer = MockPeer::new(chain);
        let mut queue = BlockQueue::new(0);
        // Reserve [1..192] and throw the reservation away, simulating a
        // producer that died mid-fetch.
        let lost = queue.new_work_item(600).expect("item");
        let lost_range = lost.blocks;
        drop(lost);
        let mut item = queue.new_work_item(600).expect("item");
        fetch_headers(peer.as_ref(), &mut item).await.expect("headers");
        fetch_bodies(peer.as_ref(), &mut item, 0).await.expect("bodies");
        queue.stage(item);

        assert_eq!(
            queue.fetch_staged().expect_err("gap"),
            BlockQueueError::BlockNumberGap
        );
        let gap = queue.grout().expect("gap found");
        assert_eq!(gap, lost_range);
        // The hole is fetchable again and coverage is whole.
        assert_coverage(&queue, 600);
        let refetch = queue.new_work_item(600).expect("item");
        assert_eq!(refetch.blocks, lost_range);
    }

    #[tokio::test]
    async fn staged_overflow_drops_topmost() {
        let mut queue = BlockQueue::new(0);
        let mut trigger_seen = false;
        for i in 0..(STAGED_MAX as u64 + 1) {
            let low = 1 + i * 10;
            let blocks = BlockRange::new(low, low + 9);
            queue.unprocessed.reduce_range(blocks);
            let mut item = WorkItem::for_range(blocks);
            // Hand-build a fetched-looking item; linkage is not checked at
            // staging time.
            let chain = TestChain::generate(0);
            item.headers = (0..10).map(|_| chain.genesis().clone()).collect();
            item.hashes = item.headers.iter().map(Header::hash).collect();
            item.bodies = (0..10).map(|_| Default::default()).collect();
            trigger_seen |= queue.stage(item);
        }
        assert!(trigger_seen, "pool mode was never requested");
        assert_eq!(queue.staged_len(), STAGED_MAX);
        // The topmost range went back to unprocessed.
        let top_low = 1 + (STAGED_MAX as u64) * 10;
        assert!(queue.unprocessed().contains(top_low));
    }

    #[tokio::test]
    async fn bogus_backtrack_hash_is_given_up_on() {
        let mut queue = BlockQueue::new(10);
        let orphan = TestChain::generate(1);
        let mut item = WorkItem::for_range(BlockRange::new(11, 11));
        item.headers = vec![orphan.header(1).clone()];
        queue.backtrack_from(&item).expect("backtrack");
        assert!(queue.backtrack().is_some());

        for _ in 0..BACKTRACK_RETRY_MAX {
            assert!(!queue.backtrack_failed());
            assert!(queue.backtrack().is_some());
        }
        assert!(queue.backtrack_failed());
        assert!(queue.backtrack().is_none());
    }

    #[tokio::test]
    async fn backtrack_measures_and_rolls_back() {
        let chain = chain();
        let peer = MockPeer::new(chain.clone());
        let mut queue = BlockQueue::new(0);

        // Accept the first item normally.
        let mut first = queue.new_work_item(600).expect("item");
        fetch_headers(peer.as_ref(), &mut first).await.expect("headers");
        fetch_bodies(peer.as_ref(), &mut first, 0).await.expect("bodies");
        queue.stage(first);
        let item = queue.fetch_staged().expect("first");
        queue.accept(&item);
        let accepted = queue.top_accepted();

        // Consumer refuses the next item: backtrack from its first header.
        let mut second = queue.new_work_item(600).expect("item");
        fetch_headers(peer.as_ref(), &mut second).await.expect("headers");
        queue.backtrack_from(&second).expect("backtrack");
        queue.recycle(second.blocks);
        let top_hash = queue.backtrack().expect("hash");
        assert_eq!(top_hash, chain.hash_of(accepted));

        // Single-mode lap: reverse fetch, stage, clear.
        let mut reverse = WorkItem::for_backtrack(top_hash);
        fetch_headers(peer.as_ref(), &mut reverse).await.expect("reverse");
        fetch_bodies(peer.as_ref(), &mut reverse, 0).await.expect("bodies");
        assert_eq!(reverse.blocks.high, accepted);
        queue.stage_backtrack(reverse);
        assert!(queue.backtrack().is_none());
        // The accepted top rolled back under the measured range, making
        // the staged item consumable.
        let item = queue.fetch_staged().expect("consumable");
        assert_eq!(item.blocks.high, accepted);
    }
}
