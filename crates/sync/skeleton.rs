//! Backward-extending header skeleton.
//!
//! The consensus side announces new heads asynchronously; the skeleton
//! lays headers down backwards from the announced head until the chain
//! links up with the local canonical chain, surviving partial progress
//! across restarts through the store's skeleton keyspaces. Disjoint
//! segments (subchains) arise when announcements jump; they merge once the
//! backward walk reaches a stored segment below.

use hearth_common::{
    BlockNumber,
    types::{Block, Body, Header, Subchain},
};
use hearth_storage::{Store, error::StoreError};
use tracing::{debug, info, warn};

/// Minimum gain (blocks) for a subchain merge to be worth signalling a
/// fetcher restart; smaller trailing segments are simply dropped.
pub const SUBCHAIN_MERGE_MIN: u64 = 1000;
/// How many headers the tail rewinds when canonical fill hits a block the
/// importer refuses.
pub const FILL_BACK_STEP: u64 = 100;

#[derive(Debug, thiserror::Error)]
pub enum SkeletonError {
    #[error("head announcement reorgs the skeleton")]
    SyncReorged,
    #[error("head announcement reorgs the skeleton and force is off")]
    ReorgDenied,
    #[error("header does not link to the subchain tail")]
    LinkMismatch,
    #[error("skeleton has no subchains")]
    NoSubchains,
    #[error("no stored header to back-step to; a new head signal is needed")]
    Exhausted,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of feeding a batch of backward headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutStatus {
    /// Headers consumed from the batch.
    pub consumed: usize,
    /// Two subchains merged; the backward fetcher must restart from the
    /// merged segment's tail.
    pub merged: bool,
}

pub struct Skeleton {
    store: Store,
    /// Most recent subchain first.
    subchains: Vec<Subchain>,
    /// Threshold for signalling merges; constant in production, lowered in
    /// tests.
    merge_min: u64,
    /// Headers pulled backwards over the lifetime of this instance.
    pulled: u64,
    /// Headers imported into the canonical chain.
    filled: u64,
}

impl Skeleton {
    /// Fresh skeleton; any persisted progress is resumed.
    pub async fn load(store: Store) -> Result<Self, SkeletonError> {
        let subchains = store.get_skeleton_progress().await?.unwrap_or_default();
        if !subchains.is_empty() {
            info!(
                "Resuming skeleton sync with {} subchain(s), most recent {}..{}",
                subchains.len(),
                subchains[0].tail,
                subchains[0].head
            );
        }
        Ok(Self {
            store,
            subchains,
            merge_min: SUBCHAIN_MERGE_MIN,
            pulled: 0,
            filled: 0,
        })
    }

    #[cfg(test)]
    pub fn with_merge_min(mut self, merge_min: u64) -> Self {
        self.merge_min = merge_min;
        self
    }

    pub fn subchains(&self) -> &[Subchain] {
        &self.subchains
    }

    pub fn pulled(&self) -> u64 {
        self.pulled
    }

    pub fn filled(&self) -> u64 {
        self.filled
    }

    /// True when any progress is persisted.
    pub fn has_progress(&self) -> bool {
        !self.subchains.is_empty()
    }

    fn last(&self) -> Result<Subchain, SkeletonError> {
        self.subchains
            .first()
            .copied()
            .ok_or(SkeletonError::NoSubchains)
    }

    async fn persist_progress(&self) -> Result<(), StoreError> {
        self.store.put_skeleton_progress(&self.subchains).await
    }

    async fn store_announced(&self, block: &Block) -> Result<(), StoreError> {
        self.store.put_skeleton_header(&block.header).await?;
        if !block.header.has_empty_body() {
            self.store
                .put_skeleton_body(block.header.number, &block.body)
                .await?;
        }
        Ok(())
    }

    /// Starts (or restarts) the skeleton from a freshly announced head
    /// block.
    pub async fn init_sync(&mut self, block: &Block) -> Result<(), SkeletonError> {
        let number = block.header.number;
        self.store_announced(block).await?;

        if self.subchains.is_empty() {
            self.subchains
                .push(Subchain::new(number, number, block.header.parent_hash));
            info!("Skeleton started at head {number}");
            self.persist_progress().await?;
            return Ok(());
        }

        // Older segments must not overlap the new head.
        while let Some(&last) = self.subchains.first() {
            if last.head < number {
                break;
            }
            if last.tail >= number {
                debug!(
                    "Dropping subchain {}..{} covered by new head",
                    last.tail, last.head
                );
                self.subchains.remove(0);
            } else {
                if let Some(first) = self.subchains.first_mut() {
                    first.head = number - 1;
                }
                break;
            }
        }

        let links = match self.subchains.first().copied() {
            Some(last) if last.head + 1 == number => {
                match self.store.get_skeleton_header(last.head).await? {
                    Some(stored) => stored.hash() == block.header.parent_hash,
                    None => false,
                }
            }
            _ => false,
        };
        if links {
            if let Some(last) = self.subchains.first_mut() {
                last.head = number;
            }
            debug!("Skeleton head extended to {number}");
        } else {
            self.subchains
                .insert(0, Subchain::new(number, number, block.header.parent_hash));
            info!("Skeleton forked, new subchain at head {number}");
        }
        self.persist_progress().await?;
        Ok(())
    }

    /// Incremental head announcement. A no-op when the head is already
    /// known; extends the most recent subchain when it links; otherwise a
    /// reorg, denied unless `force` is set (the caller then tears down and
    /// calls [`Skeleton::init_sync`]).
    pub async fn set_head(&mut self, block: &Block, force: bool) -> Result<(), SkeletonError> {
        let last = self.last()?;
        let head = &block.header;
        let number = head.number;

        if number <= last.head {
            if number >= last.tail {
                match self.store.get_skeleton_header(number).await? {
                    Some(stored) if stored.hash() == head.hash() => return Ok(()),
                    _ => {}
                }
            }
            return self.reorg(number, force);
        }
        if number > last.head + 1 {
            return self.reorg(number, force);
        }
        match self.store.get_skeleton_header(last.head).await? {
            Some(stored) if stored.hash() == head.parent_hash => {}
            _ => return self.reorg(number, force),
        }

        self.store_announced(block).await?;
        if let Some(last) = self.subchains.first_mut() {
            last.head = number;
        }
        self.persist_progress().await?;
        debug!("Skeleton head advanced to {number}");
        Ok(())
    }

    fn reorg(&self, number: BlockNumber, force: bool) -> Result<(), SkeletonError> {
        if force {
            warn!("Head announcement at {number} reorgs the skeleton");
            Err(SkeletonError::SyncReorged)
        } else {
            Err(SkeletonError::ReorgDenied)
        }
    }

    /// Feeds backward-fetched headers, newest first. Every header must
    /// hash to the active subchain's `next`; a mismatch is fatal to the
    /// batch. Bodies for non-empty headers are cached alongside so the
    /// canonical fill never re-downloads.
    pub async fn put_blocks(
        &mut self,
        headers: &[Header],
        bodies: &[Body],
    ) -> Result<PutStatus, SkeletonError> {
        let mut consumed = 0usize;
        let mut merged = false;
        for (header, body) in headers.iter().zip(bodies) {
            let last = self.last()?;
            if last.tail == 0 {
                break;
            }
            // Stop pulling once the gap under the skeleton is closed;
            // everything below is already canonical.
            if self.is_linked().await? {
                break;
            }
            if header.hash() != last.next {
                self.persist_progress().await?;
                return Err(SkeletonError::LinkMismatch);
            }
            self.store.put_skeleton_header(header).await?;
            if !header.has_empty_body() {
                self.store.put_skeleton_body(header.number, body).await?;
            }
            if let Some(last) = self.subchains.first_mut() {
                last.tail = header.number;
                last.next = header.parent_hash;
            }
            consumed += 1;
            self.pulled += 1;
            if self.try_subchains_merge().await? {
                merged = true;
                break;
            }
        }
        self.persist_progress().await?;
        Ok(PutStatus { consumed, merged })
    }

    /// Trims the segment below the active one and merges the two when the
    /// active tail links into it.
    async fn try_subchains_merge(&mut self) -> Result<bool, SkeletonError> {
        loop {
            if self.subchains.len() < 2 {
                return Ok(false);
            }
            let active_tail = self.subchains[0].tail;
            let below = self.subchains[1];
            if below.head < active_tail {
                break;
            }
            if below.tail >= active_tail {
                debug!(
                    "Dropping fully covered subchain {}..{}",
                    below.tail, below.head
                );
                self.subchains.remove(1);
            } else {
                self.subchains[1].head = active_tail - 1;
                break;
            }
        }

        let active = self.subchains[0];
        let below = self.subchains[1];
        let linked = match self.store.get_skeleton_header(below.head).await? {
            Some(stored) => stored.hash() == active.next,
            None => false,
        };
        if !linked {
            return Ok(false);
        }
        if below.head - below.tail > self.merge_min {
            info!(
                "Subchains merged: {}..{} absorbs {}..{}",
                active.tail, active.head, below.tail, below.head
            );
            self.subchains[0] = Subchain::new(active.head, below.tail, below.next);
            self.subchains.remove(1);
            Ok(true)
        } else {
            // Not worth a fetcher restart; drop the stub and walk through
            // its blocks over the wire instead.
            debug!(
                "Dropping short linked subchain {}..{}",
                below.tail, below.head
            );
            self.subchains.remove(1);
            Ok(false)
        }
    }

    /// True when the active subchain's `next` is a canonical block, i.e.
    /// the gap under the skeleton is closed.
    pub async fn is_linked(&self) -> Result<bool, SkeletonError> {
        let last = self.last()?;
        if last.tail == 0 {
            // The walk went all the way down; linked iff the skeleton sits
            // on our genesis.
            let stored = self.store.get_skeleton_header(0).await?;
            let canonical = self.store.get_block_hash(0).await?;
            return Ok(match (stored, canonical) {
                (Some(stored), Some(hash)) => stored.hash() == hash,
                _ => false,
            });
        }
        Ok(self.store.get_block_hash(last.tail - 1).await? == Some(last.next))
    }

    /// Imports stored skeleton headers into the canonical chain, deleting
    /// each copy as it lands. On an import failure the tail backs off by
    /// [`FILL_BACK_STEP`] so the damaged stretch is re-fetched.
    pub async fn fill_canonical_chain(&mut self) -> Result<u64, SkeletonError> {
        if !self.is_linked().await? {
            return Ok(0);
        }
        let target = self.last()?.head;
        let (mut canonical, _) = self.store.canonical_head().await?;
        let mut imported = 0u64;

        while canonical < target {
            let number = canonical + 1;
            let Some(header) = self.store.get_skeleton_header(number).await? else {
                warn!("Skeleton hole at {number} during canonical fill");
                self.back_step().await?;
                return Ok(imported);
            };
            let body = if header.has_empty_body() {
                Some(Body::default())
            } else {
                self.store.take_skeleton_body(number).await?
            };
            let Some(body) = body else {
                warn!("Missing cached body for block {number} during canonical fill");
                self.back_step().await?;
                return Ok(imported);
            };
            if let Err(err) = self
                .store
                .persist_blocks(vec![Block::new(header, body)])
                .await
            {
                warn!("Importer refused block {number}: {err}");
                self.back_step().await?;
                return Ok(imported);
            }
            if number < target {
                self.store.del_skeleton_header(number).await?;
            }
            canonical = number;
            imported += 1;
            self.filled += 1;
        }

        if imported > 0 {
            // The consumed stretch collapses to the head block.
            let new_next = match self.store.get_skeleton_header(target).await? {
                Some(head_header) => Some(head_header.parent_hash),
                None => None,
            };
            if let Some(last) = self.subchains.first_mut() {
                last.tail = target;
                if let Some(next) = new_next {
                    last.next = next;
                }
            }
            self.persist_progress().await?;
            info!("Canonical chain filled with {imported} block(s) up to {target}");
        }
        Ok(imported)
    }

    /// Rewinds the active tail upwards to re-fetch a stretch the importer
    /// refused. With nothing left to rewind to, every subchain is dropped
    /// and the caller must wait for a fresh head signal.
    pub async fn back_step(&mut self) -> Result<(), SkeletonError> {
        let last = self.last()?;
        let new_tail = last.tail.saturating_add(FILL_BACK_STEP);
        if new_tail <= last.head {
            if let Some(stored) = self.store.get_skeleton_header(new_tail).await? {
                for number in last.tail..new_tail {
                    self.store.del_skeleton_header(number).await?;
                }
                if let Some(active) = self.subchains.first_mut() {
                    active.tail = new_tail;
                    active.next = stored.parent_hash;
                }
                self.persist_progress().await?;
                debug!("Skeleton tail backed off from {} to {new_tail}", last.tail);
                return Ok(());
            }
        }
        warn!("Skeleton exhausted while backing off, awaiting a new head");
        self.subchains.clear();
        self.store.clear_skeleton().await?;
        self.persist_progress().await?;
        Err(SkeletonError::Exhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::TestChain;
    use hearth_storage::EngineType;
    use std::sync::Arc;

    async fn store_with_genesis(chain: &TestChain) -> Store {
        let store = Store::new("", EngineType::InMemory).expect("store");
        store
            .init_genesis(chain.genesis().clone(), 1)
            .await
            .expect("genesis");
        store
    }

    /// Newest-first headers `[from..=to]` walking down, with bodies.
    fn descending(chain: &TestChain, from: u64, to: u64) -> (Vec<Header>, Vec<Body>) {
        let headers: Vec<Header> = (to..=from).rev().map(|n| chain.header(n).clone()).collect();
        let bodies: Vec<Body> = (to..=from).rev().map(|n| chain.body(n).clone()).collect();
        (headers, bodies)
    }

    #[tokio::test]
    async fn init_creates_subchain_and_survives_restart() {
        let chain = Arc::new(TestChain::generate(250));
        let store = store_with_genesis(&chain).await;
        let mut skeleton = Skeleton::load(store.clone()).await.expect("load");
        skeleton.init_sync(&chain.block(200)).await.expect("init");
        assert_eq!(
            skeleton.subchains(),
            &[Subchain::new(200, 200, chain.hash_of(199))]
        );

        // A new instance over the same store resumes the progress record.
        let resumed = Skeleton::load(store).await.expect("load");
        assert_eq!(resumed.subchains(), skeleton.subchains());
    }

    #[tokio::test]
    async fn set_head_extends_and_is_idempotent() {
        // S4 head extension plus P7 idempotence.
        let chain = Arc::new(TestChain::generate(250));
        let store = store_with_genesis(&chain).await;
        let mut skeleton = Skeleton::load(store).await.expect("load");
        skeleton.init_sync(&chain.block(200)).await.expect("init");

        skeleton
            .set_head(&chain.block(201), false)
            .await
            .expect("extend");
        assert_eq!(
            skeleton.subchains()[0],
            Subchain::new(201, 200, chain.hash_of(199))
        );

        // Announcing the same head twice must not raise or change state.
        skeleton
            .set_head(&chain.block(201), false)
            .await
            .expect("idempotent");
        assert_eq!(
            skeleton.subchains()[0],
            Subchain::new(201, 200, chain.hash_of(199))
        );
    }

    #[tokio::test]
    async fn set_head_reorg_denied_then_forced() {
        let chain = Arc::new(TestChain::generate(250));
        let fork = Arc::new(TestChain::generate_with_salt(205, 0xf0));
        let store = store_with_genesis(&chain).await;
        let mut skeleton = Skeleton::load(store).await.expect("load");
        skeleton.init_sync(&chain.block(200)).await.expect("init");

        // A head skipping past the subchain is a reorg.
        let gap_head = chain.block(210);
        assert!(matches!(
            skeleton.set_head(&gap_head, false).await,
            Err(SkeletonError::ReorgDenied)
        ));
        assert!(matches!(
            skeleton.set_head(&gap_head, true).await,
            Err(SkeletonError::SyncReorged)
        ));

        // A same-height head with a different hash is a reorg too.
        let fork_head = fork.block(200);
        assert!(matches!(
            skeleton.set_head(&fork_head, false).await,
            Err(SkeletonError::ReorgDenied)
        ));
    }

    #[tokio::test]
    async fn put_blocks_extends_backwards_and_rejects_mismatch() {
        let chain = Arc::new(TestChain::generate(250));
        let store = store_with_genesis(&chain).await;
        let mut skeleton = Skeleton::load(store.clone()).await.expect("load");
        skeleton.init_sync(&chain.block(200)).await.expect("init");

        let (headers, bodies) = descending(&chain, 199, 150);
        let status = skeleton.put_blocks(&headers, &bodies).await.expect("put");
        assert_eq!(
            status,
            PutStatus {
                consumed: 50,
                merged: false
            }
        );
        assert_eq!(
            skeleton.subchains()[0],
            Subchain::new(200, 150, chain.hash_of(149))
        );
        assert_eq!(
            store
                .get_skeleton_header(150)
                .await
                .expect("stored")
                .expect("header")
                .hash(),
            chain.hash_of(150)
        );

        // A header that does not hash to `next` is fatal to the batch.
        let (mut bad_headers, bad_bodies) = descending(&chain, 149, 140);
        bad_headers[0] = chain.header(120).clone();
        assert!(matches!(
            skeleton.put_blocks(&bad_headers, &bad_bodies).await,
            Err(SkeletonError::LinkMismatch)
        ));
    }

    #[tokio::test]
    async fn subchains_merge_when_walk_reaches_stored_segment() {
        // S4 merge: an older segment with enough gain absorbs into the
        // active one and signals a fetcher restart.
        let chain = Arc::new(TestChain::generate(250));
        let store = store_with_genesis(&chain).await;
        let mut skeleton = Skeleton::load(store).await.expect("load").with_merge_min(10);

        skeleton.init_sync(&chain.block(100)).await.expect("init");
        let (headers, bodies) = descending(&chain, 99, 80);
        skeleton.put_blocks(&headers, &bodies).await.expect("put");
        assert_eq!(
            skeleton.subchains()[0],
            Subchain::new(100, 80, chain.hash_of(79))
        );

        // The consensus side jumps ahead; a second segment forms above.
        skeleton.init_sync(&chain.block(200)).await.expect("init");
        assert_eq!(skeleton.subchains().len(), 2);

        // Walking down from 199 reaches 101, whose parent is the stored
        // header at 100: segments merge and the fetcher restarts.
        let (headers, bodies) = descending(&chain, 199, 101);
        let status = skeleton.put_blocks(&headers, &bodies).await.expect("put");
        assert!(status.merged);
        assert_eq!(
            skeleton.subchains(),
            &[Subchain::new(200, 80, chain.hash_of(79))]
        );
    }

    #[tokio::test]
    async fn short_linked_segment_is_dropped_not_merged() {
        let chain = Arc::new(TestChain::generate(250));
        let store = store_with_genesis(&chain).await;
        // Default threshold: a 20-block segment is below the merge gain.
        let mut skeleton = Skeleton::load(store).await.expect("load");

        skeleton.init_sync(&chain.block(100)).await.expect("init");
        let (headers, bodies) = descending(&chain, 99, 80);
        skeleton.put_blocks(&headers, &bodies).await.expect("put");
        skeleton.init_sync(&chain.block(200)).await.expect("init");

        let (headers, bodies) = descending(&chain, 199, 101);
        let status = skeleton.put_blocks(&headers, &bodies).await.expect("put");
        assert!(!status.merged);
        assert_eq!(
            skeleton.subchains(),
            &[Subchain::new(200, 101, chain.hash_of(100))]
        );
    }

    #[tokio::test]
    async fn fill_canonical_chain_imports_and_collapses() {
        // S4 tail end: linkage at the canonical head triggers the fill.
        let chain = Arc::new(TestChain::generate(60));
        let store = store_with_genesis(&chain).await;
        let mut skeleton = Skeleton::load(store.clone()).await.expect("load");
        skeleton.init_sync(&chain.block(50)).await.expect("init");
        let (headers, bodies) = descending(&chain, 49, 1);
        skeleton.put_blocks(&headers, &bodies).await.expect("put");

        assert!(skeleton.is_linked().await.expect("linked"));
        let imported = skeleton.fill_canonical_chain().await.expect("fill");
        assert_eq!(imported, 50);
        assert_eq!(
            store.canonical_head().await.expect("head"),
            (50, chain.hash_of(50))
        );
        assert_eq!(skeleton.subchains()[0].tail, 50);
        // Filled copies are gone from the skeleton keyspace.
        assert_eq!(store.get_skeleton_header(25).await.expect("get"), None);
    }

    #[tokio::test]
    async fn fill_failure_backsteps_tail() {
        let chain = Arc::new(TestChain::generate(300));
        let store = store_with_genesis(&chain).await;
        let mut skeleton = Skeleton::load(store.clone()).await.expect("load");
        skeleton.init_sync(&chain.block(250)).await.expect("init");
        let (headers, bodies) = descending(&chain, 249, 1);
        skeleton.put_blocks(&headers, &bodies).await.expect("put");

        // Sabotage the cached body of the first non-empty block so the
        // fill cannot import it.
        let victim = (1..=250)
            .find(|n| !chain.header(*n).has_empty_body())
            .expect("victim");
        store.take_skeleton_body(victim).await.expect("take");

        let imported = skeleton.fill_canonical_chain().await.expect("fill");
        assert!(imported < 250);
        let active = skeleton.subchains()[0];
        assert_eq!(active.tail, 1 + FILL_BACK_STEP);
        assert_eq!(active.next, chain.header(1 + FILL_BACK_STEP).parent_hash);
        assert!(!skeleton.is_linked().await.expect("linked"));
    }
}
