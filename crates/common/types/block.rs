use bytes::Bytes;
use ethereum_types::{H256, U256};
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};

use crate::{
    BlockHash, BlockNumber,
    constants::{EMPTY_TX_ROOT, EMPTY_UNCLES_HASH},
    utils::keccak,
};

/// A block header. Only `number`, `parent_hash` and the derived hash drive
/// the sync state machines; the commitment roots are carried for body
/// validation and the rest for supplied validators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub parent_hash: BlockHash,
    pub uncles_hash: H256,
    pub tx_root: H256,
    pub receipts_root: H256,
    pub difficulty: U256,
    pub number: BlockNumber,
    pub timestamp: u64,
}

impl Header {
    /// Keccak of the RLP encoding. Recomputed on call; sync work items keep
    /// their own precomputed hash columns.
    pub fn hash(&self) -> BlockHash {
        keccak(rlp::encode(self))
    }

    /// True iff the body behind this header is known to be empty and MUST
    /// NOT be requested over the wire.
    pub fn has_empty_body(&self) -> bool {
        self.tx_root == EMPTY_TX_ROOT && self.uncles_hash == EMPTY_UNCLES_HASH
    }
}

impl Encodable for Header {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(7);
        s.append(&self.parent_hash);
        s.append(&self.uncles_hash);
        s.append(&self.tx_root);
        s.append(&self.receipts_root);
        s.append(&self.difficulty);
        s.append(&self.number);
        s.append(&self.timestamp);
    }
}

impl Decodable for Header {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if rlp.item_count()? != 7 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        Ok(Header {
            parent_hash: rlp.val_at(0)?,
            uncles_hash: rlp.val_at(1)?,
            tx_root: rlp.val_at(2)?,
            receipts_root: rlp.val_at(3)?,
            difficulty: rlp.val_at(4)?,
            number: rlp.val_at(5)?,
            timestamp: rlp.val_at(6)?,
        })
    }
}

/// A block body. Transactions and uncles are opaque blobs to the sync
/// layer; withdrawals are present post-Shanghai.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Body {
    pub transactions: Vec<Bytes>,
    pub uncles: Bytes,
    pub withdrawals: Option<Bytes>,
}

impl Body {
    /// Commitment over the transaction blobs. The empty case is the
    /// canonical empty-trie root so that empty-body detection works against
    /// the standard header constants.
    pub fn tx_root(&self) -> H256 {
        if self.transactions.is_empty() {
            return EMPTY_TX_ROOT;
        }
        let mut acc = Vec::with_capacity(self.transactions.len() * 32);
        for tx in &self.transactions {
            acc.extend_from_slice(keccak(tx).as_bytes());
        }
        keccak(acc)
    }

    /// Commitment over the uncle blob, the canonical empty-list hash when
    /// there are none.
    pub fn uncles_hash(&self) -> H256 {
        if self.uncles.is_empty() {
            return EMPTY_UNCLES_HASH;
        }
        keccak(&self.uncles)
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty() && self.uncles.is_empty()
    }
}

impl Encodable for Body {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(if self.withdrawals.is_some() { 3 } else { 2 });
        s.begin_list(self.transactions.len());
        for tx in &self.transactions {
            s.append(&tx.to_vec());
        }
        s.append(&self.uncles.to_vec());
        if let Some(withdrawals) = &self.withdrawals {
            s.append(&withdrawals.to_vec());
        }
    }
}

impl Decodable for Body {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        let item_count = rlp.item_count()?;
        if item_count != 2 && item_count != 3 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        let transactions = rlp
            .at(0)?
            .iter()
            .map(|tx| tx.as_val::<Vec<u8>>().map(Bytes::from))
            .collect::<Result<Vec<_>, _>>()?;
        let uncles: Vec<u8> = rlp.val_at(1)?;
        let withdrawals = if item_count == 3 {
            let raw: Vec<u8> = rlp.val_at(2)?;
            Some(Bytes::from(raw))
        } else {
            None
        };
        Ok(Body {
            transactions,
            uncles: Bytes::from(uncles),
            withdrawals,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Block {
    pub header: Header,
    pub body: Body,
}

impl Block {
    pub fn new(header: Header, body: Body) -> Self {
        Self { header, body }
    }

    pub fn hash(&self) -> BlockHash {
        self.header.hash()
    }
}

impl Encodable for Block {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(2);
        s.append(&self.header);
        s.append(&self.body);
    }
}

impl Decodable for Block {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        Ok(Block {
            header: rlp.val_at(0)?,
            body: rlp.val_at(1)?,
        })
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InvalidBlockBodyError {
    #[error("transaction root mismatch for block {0}")]
    TxRootMismatch(BlockNumber),
    #[error("uncles hash mismatch for block {0}")]
    UnclesHashMismatch(BlockNumber),
}

/// Checks that a body belongs to a header by matching the commitment roots.
/// Bodies arrive from peers in arbitrary order and must pass this before
/// being aligned with their headers.
pub fn validate_block_body(header: &Header, body: &Body) -> Result<(), InvalidBlockBodyError> {
    if body.tx_root() != header.tx_root {
        return Err(InvalidBlockBodyError::TxRootMismatch(header.number));
    }
    if body.uncles_hash() != header.uncles_hash {
        return Err(InvalidBlockBodyError::UnclesHashMismatch(header.number));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_for(body: &Body, number: BlockNumber) -> Header {
        Header {
            parent_hash: H256::from_low_u64_be(number.wrapping_sub(1)),
            uncles_hash: body.uncles_hash(),
            tx_root: body.tx_root(),
            receipts_root: H256::zero(),
            difficulty: U256::one(),
            number,
            timestamp: 1_700_000_000 + number * 12,
        }
    }

    #[test]
    fn empty_body_is_recognised_from_header() {
        let header = header_for(&Body::default(), 7);
        assert!(header.has_empty_body());
    }

    #[test]
    fn nonempty_body_is_not_recognised_as_empty() {
        let body = Body {
            transactions: vec![Bytes::from_static(b"tx")],
            ..Default::default()
        };
        let header = header_for(&body, 7);
        assert!(!header.has_empty_body());
    }

    #[test]
    fn body_validation_rejects_foreign_body() {
        let body = Body {
            transactions: vec![Bytes::from_static(b"tx-a")],
            ..Default::default()
        };
        let other = Body {
            transactions: vec![Bytes::from_static(b"tx-b")],
            ..Default::default()
        };
        let header = header_for(&body, 3);
        assert!(validate_block_body(&header, &body).is_ok());
        assert_eq!(
            validate_block_body(&header, &other),
            Err(InvalidBlockBodyError::TxRootMismatch(3))
        );
    }

    #[test]
    fn header_rlp_roundtrip_preserves_hash() {
        let header = header_for(&Body::default(), 42);
        let decoded: Header = rlp::decode(&rlp::encode(&header)).expect("decode header");
        assert_eq!(decoded, header);
        assert_eq!(decoded.hash(), header.hash());
    }
}
