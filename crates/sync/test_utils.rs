//! Test scaffolding: deterministic chains and scriptable mock peers.
//!
//! Not compiled into release binaries in any meaningful way, but kept as a
//! regular module so integration tests under `tests/` can drive the same
//! mocks as the unit tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use ethereum_types::{H256, U256};
use hearth_common::{
    BlockHash, BlockNumber,
    types::{Block, Body, ForkId, HashOrNumber, Header},
};
use rustc_hash::FxHashMap;

use crate::wire::{ComError, DisconnectReason, HeadersRequest, PeerWire, Status};

/// A deterministic chain of linked headers and matching bodies. Every
/// third block has an empty body so the empty-body fast path gets
/// exercised by default.
pub struct TestChain {
    headers: Vec<Header>,
    bodies: Vec<Body>,
    by_hash: FxHashMap<BlockHash, BlockNumber>,
}

impl TestChain {
    pub fn generate(height: BlockNumber) -> Self {
        Self::generate_with_salt(height, 0)
    }

    /// A chain whose headers differ from the unsalted one at every height;
    /// use for fork fixtures.
    pub fn generate_with_salt(height: BlockNumber, salt: u64) -> Self {
        let mut headers = Vec::with_capacity(height as usize + 1);
        let mut bodies = Vec::with_capacity(height as usize + 1);
        let mut by_hash = FxHashMap::default();
        let mut parent_hash = H256::zero();
        for number in 0..=height {
            let body = Self::body_for(number);
            let header = Header {
                parent_hash,
                uncles_hash: body.uncles_hash(),
                tx_root: body.tx_root(),
                receipts_root: H256::from_low_u64_be(number ^ (salt << 32)),
                difficulty: U256::from(1 + number % 7),
                number,
                timestamp: 1_700_000_000 + number * 12,
            };
            parent_hash = header.hash();
            by_hash.insert(parent_hash, number);
            headers.push(header);
            bodies.push(body);
        }
        Self {
            headers,
            bodies,
            by_hash,
        }
    }

    fn body_for(number: BlockNumber) -> Body {
        if number % 3 == 0 {
            return Body::default();
        }
        let tx_count = 1 + (number % 4) as usize;
        let transactions = (0..tx_count)
            .map(|i| Bytes::from((number * 31 + i as u64).to_be_bytes().to_vec()))
            .collect();
        Body {
            transactions,
            uncles: Bytes::new(),
            withdrawals: None,
        }
    }

    pub fn height(&self) -> BlockNumber {
        self.headers.len() as u64 - 1
    }

    pub fn header(&self, number: BlockNumber) -> &Header {
        &self.headers[number as usize]
    }

    pub fn body(&self, number: BlockNumber) -> &Body {
        &self.bodies[number as usize]
    }

    pub fn block(&self, number: BlockNumber) -> Block {
        Block::new(self.header(number).clone(), self.body(number).clone())
    }

    pub fn genesis(&self) -> &Header {
        &self.headers[0]
    }

    pub fn head(&self) -> &Header {
        &self.headers[self.headers.len() - 1]
    }

    pub fn hash_of(&self, number: BlockNumber) -> BlockHash {
        self.header(number).hash()
    }

    pub fn number_of(&self, hash: &BlockHash) -> Option<BlockNumber> {
        self.by_hash.get(hash).copied()
    }

    pub fn total_difficulty(&self, up_to: BlockNumber) -> U256 {
        self.headers[..=up_to as usize]
            .iter()
            .fold(U256::zero(), |acc, h| acc + h.difficulty)
    }
}

#[derive(Default)]
struct MockBehavior {
    /// Serve the chain only up to this height; `None` serves everything.
    head_limit: Option<BlockNumber>,
    /// Fail this many header requests with a timeout before recovering.
    fail_headers: u32,
    /// Fail this many body requests with a timeout before recovering.
    fail_bodies: u32,
    /// Corrupt the parent hash of headers with numbers in this closed
    /// range.
    corrupt_parent_range: Option<(BlockNumber, BlockNumber)>,
    /// Return at most this many bodies per request.
    bodies_limit: Option<usize>,
    /// Reasons this peer was told to disconnect with.
    disconnects: Vec<DisconnectReason>,
    /// Total header requests answered.
    header_requests: u64,
}

/// A scriptable peer backed by a [`TestChain`].
pub struct MockPeer {
    chain: Arc<TestChain>,
    network_id: u64,
    fork_id: ForkId,
    behavior: Mutex<MockBehavior>,
}

impl MockPeer {
    pub fn new(chain: Arc<TestChain>) -> Arc<Self> {
        let fork_id = hearth_storage::fork_id_for_genesis(chain.genesis().hash());
        Arc::new(Self {
            chain,
            network_id: 1,
            fork_id,
            behavior: Mutex::new(MockBehavior::default()),
        })
    }

    pub fn with_identity(
        chain: Arc<TestChain>,
        network_id: u64,
        fork_id: ForkId,
    ) -> Arc<Self> {
        Arc::new(Self {
            chain,
            network_id,
            fork_id,
            behavior: Mutex::new(MockBehavior::default()),
        })
    }

    fn behavior(&self) -> std::sync::MutexGuard<'_, MockBehavior> {
        self.behavior.lock().expect("mock behavior lock")
    }

    /// Serve the chain as if the peer were still syncing at `height`.
    pub fn set_head_limit(&self, height: BlockNumber) {
        self.behavior().head_limit = Some(height);
    }

    pub fn clear_head_limit(&self) {
        self.behavior().head_limit = None;
    }

    pub fn fail_next_header_requests(&self, count: u32) {
        self.behavior().fail_headers = count;
    }

    pub fn fail_next_body_requests(&self, count: u32) {
        self.behavior().fail_bodies = count;
    }

    /// Headers from `number` on get a bogus parent hash, breaking linkage.
    pub fn corrupt_parent_from(&self, number: BlockNumber) {
        self.behavior().corrupt_parent_range = Some((number, u64::MAX));
    }

    /// Corruption limited to a band of block numbers; headers outside it
    /// are served honestly.
    pub fn corrupt_parent_between(&self, from: BlockNumber, to: BlockNumber) {
        self.behavior().corrupt_parent_range = Some((from, to));
    }

    pub fn heal(&self) {
        let mut behavior = self.behavior();
        behavior.corrupt_parent_range = None;
        behavior.fail_headers = 0;
        behavior.fail_bodies = 0;
    }

    pub fn limit_bodies_per_request(&self, limit: usize) {
        self.behavior().bodies_limit = Some(limit);
    }

    pub fn disconnects(&self) -> Vec<DisconnectReason> {
        self.behavior().disconnects.clone()
    }

    pub fn header_requests(&self) -> u64 {
        self.behavior().header_requests
    }

    fn served_height(&self) -> BlockNumber {
        self.behavior()
            .head_limit
            .unwrap_or_else(|| self.chain.height())
            .min(self.chain.height())
    }

    pub fn status_now(&self) -> Status {
        let height = self.served_height();
        Status {
            network_id: self.network_id,
            total_difficulty: self.chain.total_difficulty(height),
            best_hash: self.chain.hash_of(height),
            genesis_hash: self.chain.genesis().hash(),
            fork_id: self.fork_id,
        }
    }

    fn cooked_header(&self, number: BlockNumber) -> Header {
        let mut header = self.chain.header(number).clone();
        if let Some((from, to)) = self.behavior().corrupt_parent_range
            && number >= from
            && number <= to
        {
            header.parent_hash = H256::from_low_u64_be(0xbad0_0000 + number);
        }
        header
    }
}

#[async_trait]
impl PeerWire for MockPeer {
    async fn get_block_headers(&self, request: HeadersRequest) -> Result<Vec<Header>, ComError> {
        {
            let mut behavior = self.behavior();
            behavior.header_requests += 1;
            if behavior.fail_headers > 0 {
                behavior.fail_headers -= 1;
                return Err(ComError::ResponseTimeout);
            }
        }
        let height = self.served_height();
        let start = match request.start {
            HashOrNumber::Number(number) => number,
            HashOrNumber::Hash(hash) => match self.chain.number_of(&hash) {
                Some(number) if number <= height => number,
                _ => return Ok(vec![]),
            },
        };
        if start > height {
            return Ok(vec![]);
        }
        let stride = request.skip + 1;
        let mut out = Vec::new();
        let mut number = start;
        while (out.len() as u64) < request.max_results {
            out.push(self.cooked_header(number));
            if request.reverse {
                let Some(next) = number.checked_sub(stride) else {
                    break;
                };
                number = next;
            } else {
                let Some(next) = number.checked_add(stride) else {
                    break;
                };
                if next > height {
                    break;
                }
                number = next;
            }
        }
        Ok(out)
    }

    async fn get_block_bodies(&self, hashes: Vec<BlockHash>) -> Result<Vec<Body>, ComError> {
        {
            let mut behavior = self.behavior();
            if behavior.fail_bodies > 0 {
                behavior.fail_bodies -= 1;
                return Err(ComError::ResponseTimeout);
            }
        }
        let limit = self.behavior().bodies_limit.unwrap_or(usize::MAX);
        let mut out = Vec::new();
        // Served in reverse order on purpose: consumers must re-align
        // bodies to headers by commitment, not by position.
        for hash in hashes.iter().rev() {
            if out.len() >= limit {
                break;
            }
            if let Some(number) = self.chain.number_of(hash) {
                out.push(self.chain.body(number).clone());
            }
        }
        Ok(out)
    }

    async fn status(&self) -> Result<Status, ComError> {
        Ok(self.status_now())
    }

    async fn disconnect(&self, reason: DisconnectReason) {
        self.behavior().disconnects.push(reason);
    }
}
