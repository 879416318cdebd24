use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};

/// EIP-2124 fork identifier, exchanged in the status handshake. Peers whose
/// fork hash is incompatible with ours are useless for sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ForkId {
    /// CRC32 of the genesis hash and all passed fork block numbers.
    pub fork_hash: [u8; 4],
    /// Block number of the next announced fork, zero if none.
    pub fork_next: u64,
}

impl ForkId {
    pub fn new(fork_hash: [u8; 4], fork_next: u64) -> Self {
        Self {
            fork_hash,
            fork_next,
        }
    }

    /// Whether a remote fork id is compatible with the local one. Without
    /// the full EIP-2124 validation table this reduces to a hash match.
    pub fn is_compatible(&self, other: &ForkId) -> bool {
        self.fork_hash == other.fork_hash
    }
}

impl Encodable for ForkId {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(2);
        s.append(&self.fork_hash.to_vec());
        s.append(&self.fork_next);
    }
}

impl Decodable for ForkId {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        let raw: Vec<u8> = rlp.val_at(0)?;
        let fork_hash: [u8; 4] = raw
            .try_into()
            .map_err(|_| DecoderError::Custom("fork hash must be 4 bytes"))?;
        Ok(ForkId {
            fork_hash,
            fork_next: rlp.val_at(1)?,
        })
    }
}
