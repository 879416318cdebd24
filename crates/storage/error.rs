use hearth_common::{BlockHash, BlockNumber, types::InvalidBlockBodyError};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store lock poisoned")]
    Lock,
    #[error("store not initialised with a genesis block")]
    MissingGenesis,
    #[error("block {got} does not extend canonical head {head}")]
    NonSequentialBlock { head: BlockNumber, got: BlockNumber },
    #[error("parent hash mismatch importing block {0}")]
    ParentHashMismatch(BlockNumber),
    #[error("unknown parent {0:#x}")]
    UnknownParent(BlockHash),
    #[error(transparent)]
    InvalidBody(#[from] InvalidBlockBodyError),
    #[error("failed to decode stored record: {0}")]
    Decode(#[from] rlp::DecoderError),
}
