mod block;
mod fork_id;
mod subchain;

pub use block::{Block, Body, Header, InvalidBlockBodyError, validate_block_body};
pub use fork_id::ForkId;
pub use subchain::Subchain;

use ethereum_types::H256;
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};

/// Identifies the starting block of a headers request: either by hash or by
/// number. On the wire a 32-byte payload is a hash, anything shorter is a
/// number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashOrNumber {
    Hash(H256),
    Number(u64),
}

impl From<H256> for HashOrNumber {
    fn from(hash: H256) -> Self {
        HashOrNumber::Hash(hash)
    }
}

impl From<u64> for HashOrNumber {
    fn from(number: u64) -> Self {
        HashOrNumber::Number(number)
    }
}

impl Encodable for HashOrNumber {
    fn rlp_append(&self, s: &mut RlpStream) {
        match self {
            HashOrNumber::Hash(hash) => s.append(hash),
            HashOrNumber::Number(number) => s.append(number),
        };
    }
}

impl Decodable for HashOrNumber {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if rlp.data()?.len() == 32 {
            Ok(HashOrNumber::Hash(rlp.as_val()?))
        } else {
            Ok(HashOrNumber::Number(rlp.as_val()?))
        }
    }
}
