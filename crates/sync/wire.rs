//! Typed calls into the peer protocol, plus the per-peer communication
//! error classifier.
//!
//! Wire framing and message codecs live in the networking layer; the sync
//! engine only sees this trait. Every call either yields typed data or a
//! [`ComError`], and every failure is fed through [`ComCounters`] to decide
//! between backoff, ignoring, and marking the peer a zombie.

use std::time::Duration;

use async_trait::async_trait;
use ethereum_types::U256;
use hearth_common::{
    BlockHash,
    constants::{MAX_BODIES_FETCH, MAX_HEADERS_FETCH},
    types::{Body, ForkId, HashOrNumber, Header},
};

/// Headers and bodies both get this long to arrive before the request is
/// classified as a timeout.
pub const WIRE_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Backoff after a response timeout before the peer is asked again.
pub const COM_TIMEOUT_SLEEP: Duration = Duration::from_millis(500);
/// Backoff after a transport-level failure.
pub const COM_NETWORK_SLEEP: Duration = Duration::from_millis(500);
/// Backoff after a no-data reply.
pub const COM_NODATA_SLEEP: Duration = Duration::from_millis(300);

/// Consecutive timeouts tolerated before the peer becomes a zombie.
pub const COM_TIMEOUT_MAX: u32 = 2;
/// Consecutive network failures tolerated.
pub const COM_NETWORK_MAX: u32 = 3;
/// Consecutive no-data replies tolerated.
pub const COM_NODATA_MAX: u32 = 3;

/// A `GetBlockHeaders` request. `max_results` above
/// [`MAX_HEADERS_FETCH`] never leaves this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadersRequest {
    pub start: HashOrNumber,
    pub max_results: u64,
    pub skip: u64,
    pub reverse: bool,
}

impl HeadersRequest {
    /// Ascending request for `[start .. start + max_results - 1]`.
    pub fn ascending(start: impl Into<HashOrNumber>, max_results: u64) -> Self {
        Self {
            start: start.into(),
            max_results,
            skip: 0,
            reverse: false,
        }
    }

    /// Descending request walking parent links from `start`.
    pub fn descending(start: impl Into<HashOrNumber>, max_results: u64) -> Self {
        Self {
            start: start.into(),
            max_results,
            skip: 0,
            reverse: true,
        }
    }

    /// Local hygiene check, run before the request is put on the wire.
    pub fn validate(&self) -> Result<(), ComError> {
        if self.max_results == 0 {
            return Err(ComError::EmptyRequestArguments);
        }
        if self.max_results > MAX_HEADERS_FETCH {
            return Err(ComError::MaxTooLarge);
        }
        Ok(())
    }
}

/// The eth status handshake payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub network_id: u64,
    pub total_difficulty: U256,
    pub best_hash: BlockHash,
    pub genesis_hash: BlockHash,
    pub fork_id: ForkId,
}

/// Reasons given to the networking layer when dropping a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    UselessPeer,
    BreachOfProtocol,
    TooManyPeers,
}

/// The request surface the sync engine consumes from a connected peer.
#[async_trait]
pub trait PeerWire: Send + Sync {
    async fn get_block_headers(&self, request: HeadersRequest)
    -> Result<Vec<Header>, ComError>;

    async fn get_block_bodies(&self, hashes: Vec<BlockHash>) -> Result<Vec<Body>, ComError>;

    async fn status(&self) -> Result<Status, ComError>;

    async fn disconnect(&self, reason: DisconnectReason);
}

/// Caps a body request batch before sending.
pub fn clamp_bodies_request(hashes: &[BlockHash]) -> Result<(), ComError> {
    if hashes.is_empty() {
        return Err(ComError::EmptyRequestArguments);
    }
    if hashes.len() > MAX_BODIES_FETCH {
        return Err(ComError::MaxTooLarge);
    }
    Ok(())
}

/// Validates a remote status against our chain identity. A mismatch makes
/// the peer useless for sync regardless of how well it behaves otherwise.
pub fn validate_status(
    remote: &Status,
    genesis_hash: BlockHash,
    network_id: u64,
    fork_id: ForkId,
) -> Result<(), ComError> {
    if remote.genesis_hash != genesis_hash {
        return Err(ComError::GenesisMismatch);
    }
    if remote.network_id != network_id {
        return Err(ComError::NetworkIdMismatch);
    }
    if !remote.fork_id.is_compatible(&fork_id) {
        return Err(ComError::ForkIdMismatch);
    }
    Ok(())
}

/// Closed set of communication failures. Classification policy lives in
/// [`ComCounters::classify`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ComError {
    #[error("response timeout")]
    ResponseTimeout,
    #[error("network problem: {0}")]
    NetworkProblem(String),
    #[error("peer had no data for {0}")]
    NoData(&'static str),
    #[error("too many headers in reply")]
    TooManyHeaders,
    #[error("too many bodies in reply")]
    TooManyBodies,
    #[error("requested range minimum too small")]
    MinTooSmall,
    #[error("requested range maximum too large")]
    MaxTooLarge,
    #[error("empty request arguments")]
    EmptyRequestArguments,
    #[error("empty partial range")]
    EmptyPartialRange,
    #[error("nothing serious")]
    NothingSerious,
    #[error("genesis hash mismatch")]
    GenesisMismatch,
    #[error("network id mismatch")]
    NetworkIdMismatch,
    #[error("fork id mismatch")]
    ForkIdMismatch,
}

/// What the caller should do about a classified failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComOutcome {
    /// Transient: sleep the given backoff, then carry on with the peer.
    Backoff(Duration),
    /// The peer is beyond saving; park it as a zombie.
    Zombie,
    /// Not worth reacting to.
    Ignore,
}

/// Per-peer failure counters. All counters reset on any successful reply.
#[derive(Debug, Clone, Copy, Default)]
pub struct ComCounters {
    pub n_timeouts: u32,
    pub n_network: u32,
    pub n_no_data: u32,
}

impl ComCounters {
    /// Feeds one failure through the policy table.
    pub fn classify(&mut self, error: &ComError) -> ComOutcome {
        match error {
            ComError::ResponseTimeout => {
                self.n_timeouts += 1;
                if self.n_timeouts > COM_TIMEOUT_MAX {
                    ComOutcome::Zombie
                } else {
                    ComOutcome::Backoff(COM_TIMEOUT_SLEEP)
                }
            }
            ComError::NetworkProblem(_) => {
                self.n_network += 1;
                if self.n_network > COM_NETWORK_MAX {
                    ComOutcome::Zombie
                } else {
                    ComOutcome::Backoff(COM_NETWORK_SLEEP)
                }
            }
            ComError::NoData(_) => {
                self.n_no_data += 1;
                if self.n_no_data > COM_NODATA_MAX {
                    ComOutcome::Zombie
                } else {
                    ComOutcome::Backoff(COM_NODATA_SLEEP)
                }
            }
            ComError::TooManyHeaders
            | ComError::TooManyBodies
            | ComError::MinTooSmall
            | ComError::MaxTooLarge
            | ComError::GenesisMismatch
            | ComError::NetworkIdMismatch
            | ComError::ForkIdMismatch => ComOutcome::Zombie,
            ComError::EmptyRequestArguments
            | ComError::EmptyPartialRange
            | ComError::NothingSerious => ComOutcome::Ignore,
        }
    }

    /// Called after every successful reply.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_hygiene_rejects_oversized_and_empty() {
        let too_big = HeadersRequest::ascending(1u64, MAX_HEADERS_FETCH + 1);
        assert_eq!(too_big.validate(), Err(ComError::MaxTooLarge));
        let empty = HeadersRequest::ascending(1u64, 0);
        assert_eq!(empty.validate(), Err(ComError::EmptyRequestArguments));
        assert!(HeadersRequest::ascending(1u64, MAX_HEADERS_FETCH).validate().is_ok());
    }

    #[test]
    fn timeouts_become_zombie_after_threshold() {
        let mut counters = ComCounters::default();
        assert_eq!(
            counters.classify(&ComError::ResponseTimeout),
            ComOutcome::Backoff(COM_TIMEOUT_SLEEP)
        );
        assert_eq!(
            counters.classify(&ComError::ResponseTimeout),
            ComOutcome::Backoff(COM_TIMEOUT_SLEEP)
        );
        assert_eq!(
            counters.classify(&ComError::ResponseTimeout),
            ComOutcome::Zombie
        );
    }

    #[test]
    fn success_resets_all_counters() {
        let mut counters = ComCounters::default();
        counters.classify(&ComError::ResponseTimeout);
        counters.classify(&ComError::NoData("state root"));
        counters.reset();
        assert_eq!(counters.n_timeouts, 0);
        assert_eq!(counters.n_no_data, 0);
    }

    #[test]
    fn protocol_violations_are_fatal_immediately() {
        let mut counters = ComCounters::default();
        assert_eq!(counters.classify(&ComError::TooManyHeaders), ComOutcome::Zombie);
        assert_eq!(counters.classify(&ComError::MaxTooLarge), ComOutcome::Zombie);
    }

    #[test]
    fn harmless_errors_are_ignored() {
        let mut counters = ComCounters::default();
        assert_eq!(
            counters.classify(&ComError::NothingSerious),
            ComOutcome::Ignore
        );
        assert_eq!(counters.n_timeouts + counters.n_network + counters.n_no_data, 0);
    }
}
