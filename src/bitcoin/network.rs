//! Bitcoin network utilities

use std::str::FromStr;

use bitcoin::blockdata::constants::genesis_block;
use bitcoin::{Address, BlockHash, Network};

use crate::error::WalletError;

/// Testnet4 genesis; servers for the "testnet" selection may run either chain.
const TESTNET4_GENESIS: &str = "00000000da84f2bafbbc53dee25a72ae507ff4914b867c565be350b0da8bf043";

/// Parse a user-facing network name
pub fn parse_network(name: &str) -> Option<Network> {
    match name.trim().to_lowercase().as_str() {
        "mainnet" | "bitcoin" | "" => Some(Network::Bitcoin),
        "testnet" => Some(Network::Testnet),
        "signet" => Some(Network::Signet),
        "regtest" => Some(Network::Regtest),
        _ => None,
    }
}

/// Storage/partition name of a network; all persisted rows are scoped by it
pub fn network_name(network: Network) -> &'static str {
    match network {
        Network::Bitcoin => "mainnet",
        Network::Signet => "signet",
        Network::Regtest => "regtest",
        _ => "testnet",
    }
}

/// BIP44 coin type: 0 on mainnet, 1 on every test network
pub fn coin_type(network: Network) -> u32 {
    match network {
        Network::Bitcoin => 0,
        _ => 1,
    }
}

/// Genesis block hashes a server on `network` may legitimately report
pub fn accepted_genesis_hashes(network: Network) -> Vec<BlockHash> {
    let mut hashes = vec![genesis_block(network).block_hash()];
    if network == Network::Testnet {
        if let Ok(hash) = BlockHash::from_str(TESTNET4_GENESIS) {
            hashes.push(hash);
        }
    }
    hashes
}

/// Parse an address and require that it belongs to `network`
pub fn validate_address(address: &str, network: Network) -> Result<Address, WalletError> {
    Address::from_str(address.trim())
        .map_err(|e| WalletError::InvalidAddress(format!("{}: {}", address, e)))?
        .require_network(network)
        .map_err(|e| WalletError::InvalidAddress(format!("{}: {}", address, e)))
}
