//! Chain and skeleton storage for the hearth sync core.
//!
//! The sync engine consumes a narrow chain interface (canonical head,
//! header/hash lookup, total-difficulty score, `persist_blocks`) plus three
//! skeleton keyspaces that survive restarts:
//!
//! - `skeletonProgress` — one RLP-encoded list of `{head, tail, next}`
//!   subchain records.
//! - `skeletonHeader(n)` — the RLP-encoded header for block `n`.
//! - `skeletonHashToNumber(h)` — the RLP-encoded block number for hash `h`.
//! - `skeletonTx(n)` — the RLP-encoded cached body for block `n`.
//!
//! Only the in-memory engine exists in this repo; the handle and method
//! surface are written so an on-disk backend can slot in behind them.

pub mod error;

use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
};

use ethereum_types::{H256, U256};
use hearth_common::{
    BlockHash, BlockNumber,
    types::{Block, Body, ForkId, HashOrNumber, Header, Subchain, validate_block_body},
};
use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::error::StoreError;

/// Storage engine backing a [`Store`].
#[derive(Debug, Clone, Copy)]
pub enum EngineType {
    InMemory,
}

/// Fork identifier for a chain with no scheduled forks: CRC32 over the
/// genesis hash, no announced next fork.
pub fn fork_id_for_genesis(genesis: BlockHash) -> ForkId {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(genesis.as_bytes());
    ForkId::new(hasher.finalize().to_be_bytes(), 0)
}

#[derive(Debug, Default)]
struct StoreInner {
    network_id: u64,
    genesis_hash: Option<BlockHash>,
    /// Block headers keyed by hash.
    headers: FxHashMap<BlockHash, Header>,
    /// Block bodies keyed by hash.
    bodies: FxHashMap<BlockHash, Body>,
    /// Canonical chain index: block number to hash.
    canonical_hashes: BTreeMap<BlockNumber, BlockHash>,
    /// Reverse index: hash to block number.
    block_numbers: FxHashMap<BlockHash, BlockNumber>,
    /// Total difficulty per block hash.
    scores: FxHashMap<BlockHash, U256>,
    /// `skeletonHeader(n)` keyspace, RLP values.
    skeleton_headers: BTreeMap<BlockNumber, Vec<u8>>,
    /// `skeletonHashToNumber(h)` keyspace.
    skeleton_numbers: FxHashMap<BlockHash, BlockNumber>,
    /// `skeletonProgress` record, RLP list of subchains.
    skeleton_progress: Option<Vec<u8>>,
    /// `skeletonTx(n)` body cache, RLP values.
    skeleton_bodies: BTreeMap<BlockNumber, Vec<u8>>,
}

/// Cheaply clonable handle over the storage backend.
#[derive(Debug, Clone)]
pub struct Store {
    inner: Arc<RwLock<StoreInner>>,
}

impl Store {
    pub fn new(_path: &str, _engine: EngineType) -> Result<Self, StoreError> {
        Ok(Self {
            inner: Arc::new(RwLock::new(StoreInner::default())),
        })
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, StoreInner>, StoreError> {
        self.inner.read().map_err(|_| StoreError::Lock)
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, StoreInner>, StoreError> {
        self.inner.write().map_err(|_| StoreError::Lock)
    }

    /// Installs the genesis block and network id. Must run before any
    /// import; wipes nothing, so calling it twice with a different genesis
    /// is an error on the caller's side.
    pub async fn init_genesis(
        &self,
        genesis: Header,
        network_id: u64,
    ) -> Result<(), StoreError> {
        let hash = genesis.hash();
        let mut inner = self.write()?;
        inner.network_id = network_id;
        inner.genesis_hash = Some(hash);
        inner.scores.insert(hash, genesis.difficulty);
        inner.block_numbers.insert(hash, 0);
        inner.canonical_hashes.insert(0, hash);
        inner.headers.insert(hash, genesis);
        inner.bodies.insert(hash, Body::default());
        info!("Initialised store with genesis {hash:#x}");
        Ok(())
    }

    pub async fn genesis_hash(&self) -> Result<BlockHash, StoreError> {
        self.read()?.genesis_hash.ok_or(StoreError::MissingGenesis)
    }

    pub async fn network_id(&self) -> Result<u64, StoreError> {
        Ok(self.read()?.network_id)
    }

    /// EIP-2124 style fork identifier. With no scheduled forks in this
    /// repo the hash covers the genesis only and `fork_next` is zero.
    pub async fn fork_id(
        &self,
        _number: BlockNumber,
        _timestamp: u64,
    ) -> Result<ForkId, StoreError> {
        Ok(fork_id_for_genesis(self.genesis_hash().await?))
    }

    /// Highest canonical block number and its hash.
    pub async fn canonical_head(&self) -> Result<(BlockNumber, BlockHash), StoreError> {
        let inner = self.read()?;
        let (number, hash) = inner
            .canonical_hashes
            .last_key_value()
            .ok_or(StoreError::MissingGenesis)?;
        Ok((*number, *hash))
    }

    pub async fn get_block_hash(
        &self,
        number: BlockNumber,
    ) -> Result<Option<BlockHash>, StoreError> {
        Ok(self.read()?.canonical_hashes.get(&number).copied())
    }

    pub async fn get_block_header(
        &self,
        id: HashOrNumber,
    ) -> Result<Option<Header>, StoreError> {
        let inner = self.read()?;
        let hash = match id {
            HashOrNumber::Hash(hash) => hash,
            HashOrNumber::Number(number) => match inner.canonical_hashes.get(&number) {
                Some(hash) => *hash,
                None => return Ok(None),
            },
        };
        Ok(inner.headers.get(&hash).cloned())
    }

    pub async fn get_block_body(&self, hash: BlockHash) -> Result<Option<Body>, StoreError> {
        Ok(self.read()?.bodies.get(&hash).cloned())
    }

    pub async fn get_block_number(
        &self,
        hash: BlockHash,
    ) -> Result<Option<BlockNumber>, StoreError> {
        Ok(self.read()?.block_numbers.get(&hash).copied())
    }

    pub async fn is_canonical(&self, hash: BlockHash) -> Result<bool, StoreError> {
        let inner = self.read()?;
        match inner.block_numbers.get(&hash) {
            Some(number) => Ok(inner.canonical_hashes.get(number) == Some(&hash)),
            None => Ok(false),
        }
    }

    /// Total difficulty of the given block, zero for unknown hashes.
    /// Pre-merge peers are ranked by this.
    pub async fn get_score(&self, hash: BlockHash) -> Result<U256, StoreError> {
        Ok(self
            .read()?
            .scores
            .get(&hash)
            .copied()
            .unwrap_or_default())
    }

    /// Imports a run of blocks onto the canonical chain. Each block must
    /// attach by parent hash to the canonical block below it and its body
    /// must match the header commitments. A batch whose first block sits
    /// at or below the current head rewrites the canonical suffix (reorg
    /// import); everything above the batch is dropped from the canonical
    /// index.
    pub async fn persist_blocks(&self, blocks: Vec<Block>) -> Result<(), StoreError> {
        if blocks.is_empty() {
            return Ok(());
        }
        let mut inner = self.write()?;
        let (mut head_number, mut head_hash) = inner
            .canonical_hashes
            .last_key_value()
            .map(|(n, h)| (*n, *h))
            .ok_or(StoreError::MissingGenesis)?;
        for block in blocks {
            let number = block.header.number;
            let Some(parent_number) = number.checked_sub(1) else {
                return Err(StoreError::NonSequentialBlock {
                    head: head_number,
                    got: 0,
                });
            };
            if number > head_number + 1 {
                return Err(StoreError::NonSequentialBlock {
                    head: head_number,
                    got: number,
                });
            }
            let parent_hash = inner
                .canonical_hashes
                .get(&parent_number)
                .copied()
                .ok_or(StoreError::UnknownParent(block.header.parent_hash))?;
            if block.header.parent_hash != parent_hash {
                return Err(StoreError::ParentHashMismatch(number));
            }
            validate_block_body(&block.header, &block.body)?;
            if number <= head_number {
                let stale = inner.canonical_hashes.split_off(&number);
                debug!(
                    "Reorg import at {number}, dropping {} canonical entries",
                    stale.len()
                );
            }
            let hash = block.hash();
            let parent_score = inner
                .scores
                .get(&block.header.parent_hash)
                .copied()
                .ok_or(StoreError::UnknownParent(block.header.parent_hash))?;
            inner
                .scores
                .insert(hash, parent_score + block.header.difficulty);
            inner.block_numbers.insert(hash, number);
            inner.canonical_hashes.insert(number, hash);
            inner.bodies.insert(hash, block.body);
            inner.headers.insert(hash, block.header);
            head_number = number;
            head_hash = hash;
        }
        debug!("Persisted blocks up to {head_number} ({head_hash:#x})");
        Ok(())
    }

    // -- skeleton keyspaces ------------------------------------------------

    pub async fn put_skeleton_header(&self, header: &Header) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        inner.skeleton_numbers.insert(header.hash(), header.number);
        inner
            .skeleton_headers
            .insert(header.number, rlp::encode(header).to_vec());
        Ok(())
    }

    pub async fn get_skeleton_header(
        &self,
        number: BlockNumber,
    ) -> Result<Option<Header>, StoreError> {
        match self.read()?.skeleton_headers.get(&number) {
            Some(raw) => Ok(Some(rlp::decode(raw)?)),
            None => Ok(None),
        }
    }

    pub async fn del_skeleton_header(&self, number: BlockNumber) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        if let Some(raw) = inner.skeleton_headers.remove(&number) {
            let header: Header = rlp::decode(&raw)?;
            inner.skeleton_numbers.remove(&header.hash());
        }
        inner.skeleton_bodies.remove(&number);
        Ok(())
    }

    pub async fn get_skeleton_number(
        &self,
        hash: BlockHash,
    ) -> Result<Option<BlockNumber>, StoreError> {
        Ok(self.read()?.skeleton_numbers.get(&hash).copied())
    }

    pub async fn put_skeleton_body(
        &self,
        number: BlockNumber,
        body: &Body,
    ) -> Result<(), StoreError> {
        self.write()?
            .skeleton_bodies
            .insert(number, rlp::encode(body).to_vec());
        Ok(())
    }

    /// Removes and returns the cached body for block `number`, if any.
    pub async fn take_skeleton_body(
        &self,
        number: BlockNumber,
    ) -> Result<Option<Body>, StoreError> {
        match self.write()?.skeleton_bodies.remove(&number) {
            Some(raw) => Ok(Some(rlp::decode(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn put_skeleton_progress(
        &self,
        subchains: &[Subchain],
    ) -> Result<(), StoreError> {
        let mut stream = rlp::RlpStream::new_list(subchains.len());
        for subchain in subchains {
            stream.append(subchain);
        }
        self.write()?.skeleton_progress = Some(stream.out().to_vec());
        Ok(())
    }

    pub async fn get_skeleton_progress(&self) -> Result<Option<Vec<Subchain>>, StoreError> {
        match &self.read()?.skeleton_progress {
            Some(raw) => {
                let decoded = rlp::Rlp::new(raw).as_list()?;
                Ok(Some(decoded))
            }
            None => Ok(None),
        }
    }

    /// Drops every skeleton record. Used when the skeleton gives up and
    /// waits for a fresh head signal.
    pub async fn clear_skeleton(&self) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        inner.skeleton_headers.clear();
        inner.skeleton_numbers.clear();
        inner.skeleton_bodies.clear();
        inner.skeleton_progress = None;
        Ok(())
    }
}
