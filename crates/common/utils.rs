use ethereum_types::H256;
use sha3::{Digest, Keccak256};

pub fn keccak(data: impl AsRef<[u8]>) -> H256 {
    H256(Keccak256::digest(data.as_ref()).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn keccak_of_empty_input() {
        assert_eq!(
            keccak([]),
            H256(hex!(
                "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
            ))
        );
    }
}
