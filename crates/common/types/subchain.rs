use ethereum_types::H256;
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};

use crate::BlockNumber;

/// A contiguous segment `[tail..head]` of the header skeleton. `next` is
/// the parent hash of the block at `tail`, i.e. the hash the segment still
/// needs to link downwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subchain {
    pub head: BlockNumber,
    pub tail: BlockNumber,
    pub next: H256,
}

impl Subchain {
    pub fn new(head: BlockNumber, tail: BlockNumber, next: H256) -> Self {
        Self { head, tail, next }
    }

    /// Number of blocks covered by this segment.
    pub fn len(&self) -> u64 {
        self.head - self.tail + 1
    }

    pub fn is_empty(&self) -> bool {
        self.head < self.tail
    }

    pub fn contains(&self, number: BlockNumber) -> bool {
        self.tail <= number && number <= self.head
    }
}

impl Encodable for Subchain {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(3);
        s.append(&self.head);
        s.append(&self.tail);
        s.append(&self.next);
    }
}

impl Decodable for Subchain {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        Ok(Subchain {
            head: rlp.val_at(0)?,
            tail: rlp.val_at(1)?,
            next: rlp.val_at(2)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subchain_rlp_roundtrip() {
        let subchain = Subchain::new(200, 150, H256::from_low_u64_be(149));
        let encoded = rlp::encode(&subchain);
        let decoded: Subchain = rlp::decode(&encoded).expect("decode subchain");
        assert_eq!(decoded, subchain);
    }

    #[test]
    fn subchain_len_counts_both_ends() {
        assert_eq!(Subchain::new(5, 5, H256::zero()).len(), 1);
        assert_eq!(Subchain::new(200, 150, H256::zero()).len(), 51);
    }
}
