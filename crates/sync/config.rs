//! Sync engine configuration.

use std::path::{Path, PathBuf};

use ethereum_types::H256;
use hearth_common::{BlockHash, BlockNumber};
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("max peers must be a positive integer")]
    InvalidMaxPeers,
    #[error("cannot read sync control file {0}: {1}")]
    CtrlFileUnreadable(PathBuf, std::io::Error),
    #[error("sync control file {0} holds neither a block number nor a 0x-prefixed hash")]
    CtrlFileMalformed(PathBuf),
}

/// An override target from the sync control file. A `0x`-prefixed 64-digit
/// value is a block hash, anything else must parse as a decimal number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtrlTarget {
    Number(BlockNumber),
    Hash(BlockHash),
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Scheduler capacity; the peer table holds one extra slot for a
    /// lingering zombie.
    pub max_peers: usize,
    /// Body-batch count hint, zero for the protocol default.
    pub chunk_size: usize,
    /// Only start when a prior sync state is persisted.
    pub bootstrap_resume_only: bool,
    /// Optional file whose first line overrides the sync target.
    pub sync_ctrl_file: Option<PathBuf>,
    /// Accept pivots without peer quorum.
    pub relaxed_mode: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_peers: 25,
            chunk_size: 0,
            bootstrap_resume_only: false,
            sync_ctrl_file: None,
            relaxed_mode: false,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_peers == 0 {
            return Err(ConfigError::InvalidMaxPeers);
        }
        Ok(())
    }

    /// Reads the override target, if a control file is configured. Parse
    /// problems are reported and treated as no override.
    pub fn ctrl_target(&self) -> Option<CtrlTarget> {
        let path = self.sync_ctrl_file.as_deref()?;
        match read_ctrl_target(path) {
            Ok(target) => Some(target),
            Err(err) => {
                warn!("Ignoring sync control file: {err}");
                None
            }
        }
    }
}

/// Parses the first line of a sync control file.
pub fn read_ctrl_target(path: &Path) -> Result<CtrlTarget, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|err| ConfigError::CtrlFileUnreadable(path.to_path_buf(), err))?;
    let line = content
        .lines()
        .next()
        .map(str::trim)
        .unwrap_or_default();
    if let Some(hex) = line.strip_prefix("0x") {
        if hex.len() == 64
            && let Ok(bytes) = hex::decode(hex)
        {
            return Ok(CtrlTarget::Hash(H256::from_slice(&bytes)));
        }
        return Err(ConfigError::CtrlFileMalformed(path.to_path_buf()));
    }
    line.parse::<u64>()
        .map(CtrlTarget::Number)
        .map_err(|_| ConfigError::CtrlFileMalformed(path.to_path_buf()))
}
