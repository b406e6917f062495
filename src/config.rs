/// Wallet configuration from environment variables
///
/// Controls the Bitcoin network, the data directory and Electrum client timeouts.
/// Defaults to mainnet with the protocol's standard 10s/10s/60s timings.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use bitcoin::Network;

use crate::bitcoin::network;

#[derive(Clone, Debug)]
pub struct WalletConfig {
    /// Bitcoin network type
    pub network: Network,
    /// Root directory for per-network wallet storage
    pub data_dir: PathBuf,
    /// Per-request timeout for Electrum calls
    pub request_timeout: Duration,
    /// Timeout for opening a socket and completing the handshake
    pub connect_timeout: Duration,
    /// Interval between `server.ping` keep-alives
    pub keepalive_interval: Duration,
    /// Verify TLS certificates against webpki roots
    pub tls_verify: bool,
}

impl WalletConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `WALLET_NETWORK`: "mainnet" (default), "testnet", "signet" or "regtest"
    /// - `WALLET_DATA_DIR`: storage root (default `./wallets`)
    /// - `ELECTRUM_REQUEST_TIMEOUT_SECS`: per-request timeout (default 10)
    /// - `ELECTRUM_CONNECT_TIMEOUT_SECS`: connect + handshake timeout (default 10)
    /// - `ELECTRUM_KEEPALIVE_SECS`: ping interval (default 60)
    /// - `ELECTRUM_TLS_VERIFY`: "true" to verify server certificates (default false)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let network = match env::var("WALLET_NETWORK") {
            Ok(name) => match network::parse_network(&name) {
                Some(network) => network,
                None => {
                    log::warn!("Unknown network '{}', defaulting to mainnet", name);
                    Network::Bitcoin
                }
            },
            Err(_) => defaults.network,
        };
        log::info!("Using {} network", network::network_name(network));

        let data_dir = env::var("WALLET_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        Self {
            network,
            data_dir,
            request_timeout: secs_from_env("ELECTRUM_REQUEST_TIMEOUT_SECS")
                .unwrap_or(defaults.request_timeout),
            connect_timeout: secs_from_env("ELECTRUM_CONNECT_TIMEOUT_SECS")
                .unwrap_or(defaults.connect_timeout),
            keepalive_interval: secs_from_env("ELECTRUM_KEEPALIVE_SECS")
                .unwrap_or(defaults.keepalive_interval),
            tls_verify: env::var("ELECTRUM_TLS_VERIFY")
                .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(defaults.tls_verify),
        }
    }

    /// Get the BIP44 coin type for this network
    ///
    /// - Mainnet: 0
    /// - Testnet/Signet/Regtest: 1
    pub fn coin_type(&self) -> u32 {
        network::coin_type(self.network)
    }

    /// Get the BIP84 account path for this network
    ///
    /// Returns: "m/84'/0'/0'" for mainnet, "m/84'/1'/0'" for test networks
    pub fn account_path(&self) -> String {
        format!("m/84'/{}'/0'", self.coin_type())
    }
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            network: Network::Bitcoin,
            data_dir: PathBuf::from("./wallets"),
            request_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(60),
            tls_verify: false,
        }
    }
}

fn secs_from_env(key: &str) -> Option<Duration> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Some(Duration::from_secs(secs)),
        _ => {
            log::warn!("Ignoring invalid {}={}", key, raw);
            None
        }
    }
}
