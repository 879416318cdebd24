use ethereum_types::H256;
use hex_literal::hex;

/// Root of the empty transaction trie. A header carrying this root has no
/// transactions in its body.
pub const EMPTY_TX_ROOT: H256 = H256(hex!(
    "56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421"
));

/// Keccak of the RLP-encoded empty uncle list.
pub const EMPTY_UNCLES_HASH: H256 = H256(hex!(
    "1dcc4de8dec75d7aab85b567b6ccd41ad312451b948a7413f0a142fd40d49347"
));

/// Maximum number of block headers a single GetBlockHeaders request may ask
/// for. Requests above this limit are rejected locally before sending;
/// replies above it are a breach of protocol.
/// See: https://github.com/ethereum/devp2p/blob/master/caps/eth.md#getblockheaders-0x03
pub const MAX_HEADERS_FETCH: u64 = 192;

/// Maximum number of block bodies per GetBlockBodies request.
pub const MAX_BODIES_FETCH: usize = 128;

/// Maximum number of receipt lists per GetReceipts request.
pub const MAX_RECEIPTS_FETCH: usize = 256;

/// Maximum number of state trie nodes per request.
pub const MAX_STATE_FETCH: usize = 384;
