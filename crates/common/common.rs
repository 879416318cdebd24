//! # hearth Common
//!
//! Shared primitives for the hearth execution client: block headers and
//! bodies, protocol-wide constants, and the hashing/RLP helpers the sync
//! and storage layers build on.

pub mod constants;
pub mod types;
pub mod utils;

pub use ethereum_types::{H256, U256};

/// A block number. The wire protocol carries 256-bit values but no chain
/// in existence needs more than 64 bits here.
pub type BlockNumber = u64;

/// A block hash. Equality is byte-equality.
pub type BlockHash = H256;
