//! Pivot negotiation.
//!
//! Before committing to a mass download the engine establishes that a
//! quorum of peers agrees on the existence of a chosen starting header.
//! Peers move between three disjoint sets: `trusted` (cross-checked
//! against each other), `relaxed` (accepted without cross-checks when
//! relaxed mode is on) and `untrusted` (failed a cross-check). A pivot is
//! only exposed to a peer once the quorum stands and the peer belongs to
//! it.

use std::sync::Arc;

use ethereum_types::U256;
use hearth_common::{BlockHash, types::Header};
use rand::{seq::SliceRandom, thread_rng};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace, warn};

use crate::peer_table::PeerId;
use crate::wire::{HeadersRequest, PeerWire};

/// Quorum size for exposing a pivot.
pub const MIN_TRUSTED_PEERS: usize = 2;
/// Consecutive best-header fetch failures before the peer is given up on.
pub const PIVOT_FAIL_MAX: u32 = 3;

/// What the caller should do with the peer after a negotiation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiateOutcome {
    /// Peer joined the trusted (or relaxed) set.
    Accepted,
    /// Peer disagreed with the quorum and is out.
    Rejected,
    /// Transient failure; try again on a later lap.
    Retry,
    /// The peer failed too often; park it as a zombie.
    Zombie,
}

struct PivotPeer {
    wire: Arc<dyn PeerWire>,
    best_hash: BlockHash,
    total_difficulty: U256,
    header: Option<Header>,
    failures: u32,
}

/// Outcome of one cross-check between two peers.
enum CrossCheck {
    Agree,
    Disagree,
    AskerDead(PeerId),
}

pub struct PivotNegotiator {
    relaxed_mode: bool,
    peers: FxHashMap<PeerId, PivotPeer>,
    trusted: FxHashSet<PeerId>,
    relaxed: FxHashSet<PeerId>,
    untrusted: FxHashSet<PeerId>,
}

impl PivotNegotiator {
    pub fn new(relaxed_mode: bool) -> Self {
        Self {
            relaxed_mode,
            peers: FxHashMap::default(),
            trusted: FxHashSet::default(),
            relaxed: FxHashSet::default(),
            untrusted: FxHashSet::default(),
        }
    }

    /// Makes a peer known to the negotiator, with its announced best hash
    /// and total difficulty from the status handshake.
    pub fn register(
        &mut self,
        peer: PeerId,
        wire: Arc<dyn PeerWire>,
        best_hash: BlockHash,
        total_difficulty: U256,
    ) {
        self.peers.insert(
            peer,
            PivotPeer {
                wire,
                best_hash,
                total_difficulty,
                header: None,
                failures: 0,
            },
        );
    }

    /// Forgets a disconnected peer entirely.
    pub fn unregister(&mut self, peer: &PeerId) {
        self.peers.remove(peer);
        self.trusted.remove(peer);
        self.relaxed.remove(peer);
        self.untrusted.remove(peer);
    }

    pub fn trusted_len(&self) -> usize {
        self.trusted.len()
    }

    /// The negotiated pivot as seen by `peer`: only exposed when the peer
    /// is part of a standing quorum, or unconditionally in relaxed mode.
    pub fn pivot_header(&self, peer: &PeerId) -> Option<Header> {
        if self.untrusted.contains(peer) {
            return None;
        }
        let in_quorum = if self.relaxed_mode {
            self.relaxed.contains(peer) || self.trusted.contains(peer)
        } else {
            self.trusted.len() >= MIN_TRUSTED_PEERS && self.trusted.contains(peer)
        };
        if !in_quorum {
            return None;
        }
        self.peers.get(peer).and_then(|p| p.header.clone())
    }

    /// Runs one negotiation step for an arriving peer.
    pub async fn negotiate(&mut self, peer: PeerId) -> NegotiateOutcome {
        if self.untrusted.contains(&peer) {
            return NegotiateOutcome::Rejected;
        }
        if self.trusted.contains(&peer) || self.relaxed.contains(&peer) {
            return NegotiateOutcome::Accepted;
        }

        // Step one: the peer must produce its own announced best header.
        match self.fetch_best_header(&peer).await {
            Some(header) => {
                if let Some(entry) = self.peers.get_mut(&peer) {
                    entry.header = Some(header);
                    entry.failures = 0;
                }
            }
            None => {
                let Some(entry) = self.peers.get_mut(&peer) else {
                    return NegotiateOutcome::Retry;
                };
                entry.failures += 1;
                if entry.failures > PIVOT_FAIL_MAX {
                    warn!("Peer {peer:#x} cannot produce its own best header, giving up");
                    return NegotiateOutcome::Zombie;
                }
                return NegotiateOutcome::Retry;
            }
        }

        if self.relaxed_mode {
            self.relaxed.insert(peer);
            debug!("Peer {peer:#x} accepted in relaxed mode");
            return NegotiateOutcome::Accepted;
        }

        if self.trusted.len() < MIN_TRUSTED_PEERS {
            self.trusted.insert(peer);
            debug!(
                "Peer {peer:#x} seeds the trusted set ({}/{MIN_TRUSTED_PEERS})",
                self.trusted.len()
            );
            return NegotiateOutcome::Accepted;
        }

        self.cross_check_against_trusted(peer).await
    }

    async fn cross_check_against_trusted(&mut self, peer: PeerId) -> NegotiateOutcome {
        let mut agree = 0usize;
        let mut disagreed: Vec<PeerId> = Vec::new();

        // Random order so a single bad trusted peer cannot dominate the
        // comparison sequence.
        let mut candidates: Vec<PeerId> = self.trusted.iter().copied().collect();
        candidates.shuffle(&mut thread_rng());
        for q in candidates {
            if !self.trusted.contains(&q) {
                continue;
            }
            match self.cross_check(peer, q).await {
                CrossCheck::Agree => agree += 1,
                CrossCheck::Disagree => disagreed.push(q),
                CrossCheck::AskerDead(dead) => {
                    if dead == peer {
                        return NegotiateOutcome::Zombie;
                    }
                    trace!("Trusted peer {dead:#x} died mid-check, removing");
                    self.trusted.remove(&dead);
                }
            }
        }

        if agree == self.trusted.len() {
            self.trusted.insert(peer);
            debug!("Peer {peer:#x} joins the trusted set (size {})", self.trusted.len());
            NegotiateOutcome::Accepted
        } else if disagreed.len() == 1 {
            // A single dissenter is the one presumed wrong; swap it out.
            let out = disagreed[0];
            self.trusted.remove(&out);
            self.untrusted.insert(out);
            self.trusted.insert(peer);
            debug!("Peer {peer:#x} replaces dissenting peer {out:#x} in the trusted set");
            NegotiateOutcome::Accepted
        } else {
            self.untrusted.insert(peer);
            debug!("Peer {peer:#x} disagrees with the quorum, marked untrusted");
            NegotiateOutcome::Rejected
        }
    }

    /// One-header reverse query for the peer's own announced best hash.
    async fn fetch_best_header(&self, peer: &PeerId) -> Option<Header> {
        let entry = self.peers.get(peer)?;
        let request = HeadersRequest::descending(entry.best_hash, 1);
        match entry.wire.get_block_headers(request).await {
            Ok(headers) => match headers.first() {
                Some(header) if header.hash() == entry.best_hash => Some(header.clone()),
                _ => None,
            },
            Err(_) => None,
        }
    }

    /// Asks the lower-difficulty of the two peers whether it knows the
    /// higher-difficulty peer's best hash.
    async fn cross_check(&self, p: PeerId, q: PeerId) -> CrossCheck {
        let (Some(peer_p), Some(peer_q)) = (self.peers.get(&p), self.peers.get(&q)) else {
            return CrossCheck::AskerDead(q);
        };
        let (asker_id, asker, target) = if peer_p.total_difficulty <= peer_q.total_difficulty {
            (p, peer_p, peer_q)
        } else {
            (q, peer_q, peer_p)
        };
        let request = HeadersRequest::descending(target.best_hash, 1);
        match asker.wire.get_block_headers(request).await {
            Ok(headers) => match headers.first() {
                Some(header) if header.hash() == target.best_hash => CrossCheck::Agree,
                _ => CrossCheck::Disagree,
            },
            Err(_) => CrossCheck::AskerDead(asker_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{ComError, DisconnectReason, Status};
    use async_trait::async_trait;
    use ethereum_types::H256;
    use hearth_common::types::{Body, HashOrNumber};
    use std::sync::Mutex;

    /// A peer that knows a fixed set of headers by hash.
    struct CannedPeer {
        known: FxHashMap<BlockHash, Header>,
        fail: Mutex<u32>,
    }

    impl CannedPeer {
        fn knowing(headers: &[Header]) -> Arc<Self> {
            Arc::new(Self {
                known: headers.iter().map(|h| (h.hash(), h.clone())).collect(),
                fail: Mutex::new(0),
            })
        }

        fn failing_first(headers: &[Header], failures: u32) -> Arc<Self> {
            Arc::new(Self {
                known: headers.iter().map(|h| (h.hash(), h.clone())).collect(),
                fail: Mutex::new(failures),
            })
        }
    }

    #[async_trait]
    impl PeerWire for CannedPeer {
        async fn get_block_headers(
            &self,
            request: HeadersRequest,
        ) -> Result<Vec<Header>, ComError> {
            {
                let mut fail = self.fail.lock().expect("lock");
                if *fail > 0 {
                    *fail -= 1;
                    return Err(ComError::ResponseTimeout);
                }
            }
            let HashOrNumber::Hash(hash) = request.start else {
                return Ok(vec![]);
            };
            Ok(self.known.get(&hash).cloned().into_iter().collect())
        }

        async fn get_block_bodies(
            &self,
            _hashes: Vec<BlockHash>,
        ) -> Result<Vec<Body>, ComError> {
            Ok(vec![])
        }

        async fn status(&self) -> Result<Status, ComError> {
            Err(ComError::NothingSerious)
        }

        async fn disconnect(&self, _reason: DisconnectReason) {}
    }

    fn header(number: u64) -> Header {
        Header {
            parent_hash: H256::from_low_u64_be(number.wrapping_sub(1)),
            uncles_hash: H256::zero(),
            tx_root: H256::zero(),
            receipts_root: H256::zero(),
            difficulty: U256::one(),
            number,
            timestamp: number,
        }
    }

    fn peer_id(n: u64) -> PeerId {
        H256::from_low_u64_be(n)
    }

    #[tokio::test]
    async fn quorum_builds_and_exposes_pivot() {
        let best = header(1000);
        let chain = vec![header(999), best.clone()];
        let mut pivot = PivotNegotiator::new(false);

        for n in 1..=2 {
            let wire = CannedPeer::knowing(&chain);
            pivot.register(peer_id(n), wire, best.hash(), U256::from(n));
            assert_eq!(pivot.negotiate(peer_id(n)).await, NegotiateOutcome::Accepted);
            // No pivot before the quorum stands for anyone but the last.
            if n < MIN_TRUSTED_PEERS as u64 {
                assert!(pivot.pivot_header(&peer_id(n)).is_none());
            }
        }
        // Quorum of two; both see the pivot now.
        assert_eq!(pivot.pivot_header(&peer_id(1)).expect("pivot").number, 1000);

        // A third agreeing peer passes the cross-check.
        let wire = CannedPeer::knowing(&chain);
        pivot.register(peer_id(3), wire, best.hash(), U256::from(3));
        assert_eq!(pivot.negotiate(peer_id(3)).await, NegotiateOutcome::Accepted);
        assert_eq!(pivot.trusted_len(), 3);
        assert_eq!(pivot.pivot_header(&peer_id(3)).expect("pivot").number, 1000);
    }

    #[tokio::test]
    async fn lone_dissenter_is_swapped_for_newcomer() {
        let best = header(1000);
        let fork_best = header(2000);
        let mut pivot = PivotNegotiator::new(false);

        // One honest seed and one peer on a fork. The fork peer announces a
        // higher difficulty, so cross-checks ask the honest side about the
        // fork's best hash, which it does not know.
        let honest = CannedPeer::knowing(&[best.clone()]);
        pivot.register(peer_id(1), honest, best.hash(), U256::from(10));
        assert_eq!(pivot.negotiate(peer_id(1)).await, NegotiateOutcome::Accepted);

        let forked = CannedPeer::knowing(&[fork_best.clone()]);
        pivot.register(peer_id(2), forked, fork_best.hash(), U256::from(1000));
        assert_eq!(pivot.negotiate(peer_id(2)).await, NegotiateOutcome::Accepted);

        // A newcomer agreeing with the honest peer: it disagrees with
        // exactly one trusted peer (the forked one), which gets swapped out.
        let newcomer = CannedPeer::knowing(&[best.clone()]);
        pivot.register(peer_id(3), newcomer, best.hash(), U256::from(10));
        assert_eq!(pivot.negotiate(peer_id(3)).await, NegotiateOutcome::Accepted);
        assert!(pivot.pivot_header(&peer_id(3)).is_some());
        assert!(pivot.pivot_header(&peer_id(2)).is_none());
    }

    #[tokio::test]
    async fn relaxed_mode_skips_cross_checks() {
        let best = header(500);
        let mut pivot = PivotNegotiator::new(true);
        let wire = CannedPeer::knowing(&[best.clone()]);
        pivot.register(peer_id(7), wire, best.hash(), U256::one());
        assert_eq!(pivot.negotiate(peer_id(7)).await, NegotiateOutcome::Accepted);
        // Single peer, no quorum needed.
        assert_eq!(pivot.pivot_header(&peer_id(7)).expect("pivot").number, 500);
    }

    #[tokio::test]
    async fn repeated_fetch_failures_zombify() {
        let best = header(500);
        let mut pivot = PivotNegotiator::new(false);
        let wire = CannedPeer::failing_first(&[best.clone()], PIVOT_FAIL_MAX + 1);
        pivot.register(peer_id(9), wire, best.hash(), U256::one());
        for _ in 0..PIVOT_FAIL_MAX {
            assert_eq!(pivot.negotiate(peer_id(9)).await, NegotiateOutcome::Retry);
        }
        assert_eq!(pivot.negotiate(peer_id(9)).await, NegotiateOutcome::Zombie);
    }

    #[tokio::test]
    async fn unregister_clears_all_sets() {
        let best = header(500);
        let mut pivot = PivotNegotiator::new(true);
        let wire = CannedPeer::knowing(&[best.clone()]);
        pivot.register(peer_id(4), wire, best.hash(), U256::one());
        assert_eq!(pivot.negotiate(peer_id(4)).await, NegotiateOutcome::Accepted);
        pivot.unregister(&peer_id(4));
        assert!(pivot.pivot_header(&peer_id(4)).is_none());
    }
}
