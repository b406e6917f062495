//! Electrum lookup keys
//!
//! The server indexes outputs by `sha256(scriptPubKey)` with the digest bytes
//! reversed and hex-encoded.

use std::fmt;

use bitcoin::{Address, Script};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScriptHash(String);

impl ScriptHash {
    pub fn from_script(script: &Script) -> Self {
        let mut digest: [u8; 32] = Sha256::digest(script.as_bytes()).into();
        digest.reverse();
        Self(hex::encode(digest))
    }

    pub fn from_address(address: &Address) -> Self {
        Self::from_script(&address.script_pubkey())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScriptHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::Network;
    use std::str::FromStr;

    #[test]
    fn test_known_scripthash() {
        // Genesis coinbase P2PKH address, as documented in the Electrum protocol
        let address = Address::from_str("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa")
            .unwrap()
            .require_network(Network::Bitcoin)
            .unwrap();
        assert_eq!(
            ScriptHash::from_address(&address).as_str(),
            "8b01df4e368ea28f8dc0423bcf7a4923e3a12d307c875e47a0cfbf90b5c39161"
        );
    }

    #[test]
    fn test_scripthash_stable() {
        let address = Address::from_str("bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu")
            .unwrap()
            .require_network(Network::Bitcoin)
            .unwrap();
        let first = ScriptHash::from_address(&address);
        let second = ScriptHash::from_address(&address);
        assert_eq!(first, second);
        assert_eq!(first.as_str().len(), 64);
    }
}
