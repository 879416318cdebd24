//! Bounded LRU table of peer worker slots.
//!
//! Every connected peer owns one slot holding its control block and wire
//! handle. Zombie slots stay in the table so a misbehaving remote cannot
//! reconnect until its slot ages out of the LRU end.

use std::num::NonZeroUsize;
use std::sync::Arc;

use ethereum_types::H256;
use lru::LruCache;
use tracing::{debug, warn};

use crate::wire::PeerWire;

/// Stable identity of a remote peer.
pub type PeerId = H256;

/// Worker lifecycle. `Zombie*` means the worker no longer executes but
/// the slot is retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Stopped,
    ZombieRun,
    ZombieStop,
}

#[derive(Debug, Clone, Copy)]
pub struct ControlBlock {
    pub run_state: RunState,
    /// Whether this worker may run concurrently with other multi-mode
    /// workers.
    pub multi_ok: bool,
}

impl Default for ControlBlock {
    fn default() -> Self {
        Self {
            run_state: RunState::Running,
            multi_ok: false,
        }
    }
}

impl ControlBlock {
    /// Graceful stop; zombie status is preserved.
    pub fn stop(&mut self) {
        self.run_state = match self.run_state {
            RunState::Running | RunState::Stopped => RunState::Stopped,
            RunState::ZombieRun | RunState::ZombieStop => RunState::ZombieStop,
        };
    }

    /// Fatal condition; the worker stops executing and the slot is kept
    /// to block reconnection.
    pub fn zombify(&mut self) {
        self.run_state = match self.run_state {
            RunState::Running | RunState::ZombieRun => RunState::ZombieRun,
            RunState::Stopped | RunState::ZombieStop => RunState::ZombieStop,
        };
    }

    pub fn is_zombie(&self) -> bool {
        matches!(self.run_state, RunState::ZombieRun | RunState::ZombieStop)
    }

    /// True when the worker loop must exit.
    pub fn is_stopped(&self) -> bool {
        !matches!(self.run_state, RunState::Running)
    }
}

/// One admitted peer.
pub struct PeerSlot {
    pub id: PeerId,
    pub wire: Arc<dyn PeerWire>,
    pub control: ControlBlock,
    /// Best-number hint published by the worker's head tracker for the
    /// block queue.
    pub best_number: u64,
}

impl PeerSlot {
    pub fn new(id: PeerId, wire: Arc<dyn PeerWire>) -> Self {
        Self {
            id,
            wire,
            control: ControlBlock::default(),
            best_number: 0,
        }
    }
}

/// LRU-evicting table of peer slots.
pub struct PeerTable {
    slots: LruCache<PeerId, PeerSlot>,
}

impl PeerTable {
    /// Capacity is `max(1, max_peers + 1)` so one zombie can linger
    /// without starving live peers.
    pub fn new(max_peers: usize) -> Self {
        let capacity =
            NonZeroUsize::new(max_peers.saturating_add(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            slots: LruCache::new(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.slots.contains(peer)
    }

    /// Inserts a new slot at the most-recently-used end. Returns the slot
    /// evicted from the least-recently-used end, if the table was full.
    pub fn insert(&mut self, slot: PeerSlot) -> Option<PeerSlot> {
        match self.slots.push(slot.id, slot) {
            Some((evicted_id, evicted)) => {
                if evicted.control.is_zombie() {
                    debug!("Evicting zombie peer {evicted_id:#x}");
                    None
                } else {
                    warn!("peer table full, dequeuing least used {evicted_id:#x}");
                    Some(evicted)
                }
            }
            None => None,
        }
    }

    pub fn remove(&mut self, peer: &PeerId) -> Option<PeerSlot> {
        self.slots.pop(peer)
    }

    /// Promotes a peer to the most-recently-used end.
    pub fn touch(&mut self, peer: &PeerId) {
        let _ = self.slots.get(peer);
    }

    /// Access without changing LRU order.
    pub fn peek(&self, peer: &PeerId) -> Option<&PeerSlot> {
        self.slots.peek(peer)
    }

    pub fn peek_mut(&mut self, peer: &PeerId) -> Option<&mut PeerSlot> {
        self.slots.peek_mut(peer)
    }

    pub fn is_zombie(&self, peer: &PeerId) -> bool {
        self.slots
            .peek(peer)
            .map(|slot| slot.control.is_zombie())
            .unwrap_or(false)
    }

    pub fn zombify(&mut self, peer: &PeerId) {
        if let Some(slot) = self.slots.peek_mut(peer) {
            slot.control.zombify();
        }
    }

    /// Peer ids from most to least recently used.
    pub fn ids_mru(&self) -> Vec<PeerId> {
        self.slots.iter().map(|(id, _)| *id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockPeer, TestChain};

    fn slot(n: u64, chain: &Arc<TestChain>) -> PeerSlot {
        PeerSlot::new(H256::from_low_u64_be(n), MockPeer::new(chain.clone()))
    }

    fn table_with(n: u64, max_peers: usize) -> (PeerTable, Arc<TestChain>) {
        let chain = Arc::new(TestChain::generate(5));
        let mut table = PeerTable::new(max_peers);
        for i in 1..=n {
            assert!(table.insert(slot(i, &chain)).is_none());
        }
        (table, chain)
    }

    #[test]
    fn capacity_is_max_peers_plus_one() {
        let (mut table, chain) = table_with(5, 4);
        assert_eq!(table.len(), 5);
        // The sixth insert evicts the least recently used live peer.
        let evicted = table.insert(slot(6, &chain)).expect("evicted");
        assert_eq!(evicted.id, H256::from_low_u64_be(1));
        assert_eq!(table.len(), 5);
    }

    #[test]
    fn zombie_eviction_is_silent() {
        // S6: evicting a zombie slot must not surface a live worker stop.
        let (mut table, chain) = table_with(5, 4);
        table.zombify(&H256::from_low_u64_be(1));
        assert!(table.insert(slot(6, &chain)).is_none());
        assert!(!table.contains(&H256::from_low_u64_be(1)));
    }

    #[test]
    fn touch_reorders_eviction() {
        let (mut table, chain) = table_with(5, 4);
        table.touch(&H256::from_low_u64_be(1));
        let evicted = table.insert(slot(6, &chain)).expect("evicted");
        assert_eq!(evicted.id, H256::from_low_u64_be(2));
        assert!(table.contains(&H256::from_low_u64_be(1)));
    }

    #[test]
    fn mru_order_reflects_touches() {
        let (mut table, _) = table_with(3, 4);
        table.touch(&H256::from_low_u64_be(2));
        let ids = table.ids_mru();
        assert_eq!(ids[0], H256::from_low_u64_be(2));
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn control_block_transitions() {
        let mut control = ControlBlock::default();
        assert!(!control.is_stopped());
        control.zombify();
        assert_eq!(control.run_state, RunState::ZombieRun);
        assert!(control.is_stopped());
        control.stop();
        assert_eq!(control.run_state, RunState::ZombieStop);

        let mut control = ControlBlock::default();
        control.stop();
        assert_eq!(control.run_state, RunState::Stopped);
        control.zombify();
        assert_eq!(control.run_state, RunState::ZombieStop);
    }
}
