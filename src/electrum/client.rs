//! Electrum connection manager
//!
//! `ElectrumClient` is owned by the composition root and handed out by
//! reference. It lazily opens one connection, shares it between concurrent
//! callers and replaces it after the socket dies.

use std::sync::Arc;
use std::time::Duration;

use bitcoin::block::Header;
use bitcoin::{consensus, Address, Network, Transaction, Txid};
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex};

use super::connection::{Connection, ConnectionSettings};
use super::framing::Notification;
use super::peers::{default_peers, parse_custom_node, Peer};
use super::scripthash::ScriptHash;
use super::types::{
    btc_per_kb_to_sat_per_vb, AddressStats, BalanceResponse, FeeEstimates, HeaderNotification,
    HistoryEntry, UnspentEntry,
};
use crate::bitcoin::network::{accepted_genesis_hashes, network_name};
use crate::config::WalletConfig;
use crate::error::ElectrumError;
use crate::storage::{PreferenceStore, CUSTOM_NODE_URL_KEY};

const NOTIFICATION_CAPACITY: usize = 64;

/// Confirmation targets (blocks) behind fast / normal / slow fee rates
pub const FEE_TARGETS: [u16; 3] = [1, 3, 6];

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub network: Network,
    /// Replaces the built-in fallback list when set
    pub peers: Option<Vec<Peer>>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub keepalive_interval: Duration,
    pub tls_verify: bool,
}

impl ClientConfig {
    pub fn new(network: Network) -> Self {
        Self::from_wallet_config(&WalletConfig {
            network,
            ..Default::default()
        })
    }

    pub fn from_wallet_config(config: &WalletConfig) -> Self {
        Self {
            network: config.network,
            peers: None,
            connect_timeout: config.connect_timeout,
            request_timeout: config.request_timeout,
            keepalive_interval: config.keepalive_interval,
            tls_verify: config.tls_verify,
        }
    }

    pub fn with_peers(mut self, peers: Vec<Peer>) -> Self {
        self.peers = Some(peers);
        self
    }

    fn settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            connect_timeout: self.connect_timeout,
            request_timeout: self.request_timeout,
            keepalive_interval: self.keepalive_interval,
            tls_verify: self.tls_verify,
        }
    }

    fn fallback_peers(&self) -> Vec<Peer> {
        self.peers
            .clone()
            .unwrap_or_else(|| default_peers(self.network))
    }
}

pub struct ElectrumClient {
    config: ClientConfig,
    preferences: Option<Arc<dyn PreferenceStore>>,
    /// Held for the whole connect attempt, so there is never more than one in flight
    connection: Mutex<Option<Arc<Connection>>>,
    notifications: broadcast::Sender<Notification>,
}

impl ElectrumClient {
    pub fn new(config: ClientConfig) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            config,
            preferences: None,
            connection: Mutex::new(None),
            notifications,
        }
    }

    /// Consult `customNodeUrl` in `preferences` before the fallback peers
    pub fn with_preferences(mut self, preferences: Arc<dyn PreferenceStore>) -> Self {
        self.preferences = Some(preferences);
        self
    }

    pub fn network(&self) -> Network {
        self.config.network
    }

    /// Subscription pushes (`*.subscribe` methods) from every connection
    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    /// Connect eagerly instead of on first request
    pub async fn init(&self) -> Result<(), ElectrumError> {
        self.acquire().await.map(|_| ())
    }

    /// Drop the current connection. The next request reconnects.
    pub async fn close(&self) {
        let current = self.connection.lock().await.take();
        if let Some(connection) = current {
            connection.shutdown().await;
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .await
            .as_ref()
            .is_some_and(|c| c.is_connected())
    }

    /// Peer of the live connection, if any
    pub async fn current_peer(&self) -> Option<Peer> {
        self.connection
            .lock()
            .await
            .as_ref()
            .filter(|c| c.is_connected())
            .map(|c| c.peer().clone())
    }

    /// Return the live connection or open a new one
    pub async fn acquire(&self) -> Result<Arc<Connection>, ElectrumError> {
        let mut slot = self.connection.lock().await;
        if let Some(connection) = slot.as_ref() {
            if connection.is_connected() {
                return Ok(connection.clone());
            }
            log::debug!("Discarding dead connection to {}", connection.peer());
        }
        *slot = None;

        let connection = self.connect_any().await?;
        *slot = Some(connection.clone());
        Ok(connection)
    }

    async fn connect_any(&self) -> Result<Arc<Connection>, ElectrumError> {
        let settings = self.config.settings();

        if let Some(peer) = self.custom_node() {
            match self.open_validated(&peer, &settings).await {
                Ok(connection) => return Ok(connection),
                Err(e) => log::warn!("Custom node {} rejected, using fallback peers: {}", peer, e),
            }
        }

        let peers = self.config.fallback_peers();
        let mut failures = Vec::new();
        for peer in &peers {
            match Connection::open(peer, &settings, self.notifications.clone()).await {
                Ok(connection) => return Ok(connection),
                Err(e) => {
                    log::warn!("Peer {} unavailable: {}", peer, e);
                    failures.push(format!("{}: {}", peer, e));
                }
            }
        }

        Err(ElectrumError::AllPeersFailed(if failures.is_empty() {
            format!("no peers configured for {}", network_name(self.config.network))
        } else {
            failures.join("; ")
        }))
    }

    fn custom_node(&self) -> Option<Peer> {
        let raw = match self.preferences.as_ref()?.get(CUSTOM_NODE_URL_KEY) {
            Ok(value) => value?,
            Err(e) => {
                log::warn!("Could not read custom node setting: {}", e);
                return None;
            }
        };
        if raw.trim().is_empty() {
            return None;
        }
        match parse_custom_node(&raw) {
            Ok(peer) => Some(peer),
            Err(e) => {
                log::warn!("Ignoring custom node setting: {}", e);
                None
            }
        }
    }

    async fn open_validated(
        &self,
        peer: &Peer,
        settings: &ConnectionSettings,
    ) -> Result<Arc<Connection>, ElectrumError> {
        let connection = Connection::open(peer, settings, self.notifications.clone()).await?;
        match check_genesis(&connection, self.config.network).await {
            Ok(()) => Ok(connection),
            Err(e) => {
                connection.shutdown().await;
                Err(e)
            }
        }
    }

    /// Connect to `peer` and confirm it serves this network, then disconnect
    pub async fn validate_node(&self, peer: &Peer) -> Result<(), ElectrumError> {
        let connection = self.open_validated(peer, &self.config.settings()).await?;
        connection.shutdown().await;
        Ok(())
    }

    /// Raw request. Transport failures are retried once on a fresh acquire.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, ElectrumError> {
        let connection = self.acquire().await?;
        match connection.request(method, params.clone()).await {
            Err(e) if e.is_transport() => {
                log::warn!("{} failed ({}), retrying once", method, e);
                self.acquire().await?.request(method, params).await
            }
            other => other,
        }
    }

    /// Issue every request concurrently on one connection; results come back
    /// in submission order and one failure never affects the others.
    ///
    /// The connection is acquired once for the whole batch. Items that fail at
    /// the transport level are retried together on a single re-acquired
    /// connection, so a dead peer list is walked at most twice per batch.
    pub async fn batch(&self, requests: Vec<(String, Value)>) -> Vec<Result<Value, ElectrumError>> {
        if requests.is_empty() {
            return Vec::new();
        }
        let connection = match self.acquire().await {
            Ok(connection) => connection,
            Err(e) => return requests.iter().map(|_| Err(e.clone())).collect(),
        };
        let mut results = dispatch(&connection, &requests, 0..requests.len()).await;

        let failed: Vec<usize> = results
            .iter()
            .enumerate()
            .filter(|(_, result)| matches!(result, Err(e) if e.is_transport()))
            .map(|(i, _)| i)
            .collect();
        if failed.is_empty() {
            return results;
        }

        log::warn!(
            "{} of {} batched request(s) failed in transit, retrying once",
            failed.len(),
            requests.len()
        );
        match self.acquire().await {
            Ok(connection) => {
                let retried = dispatch(&connection, &requests, failed.iter().copied()).await;
                for (i, result) in failed.into_iter().zip(retried) {
                    results[i] = result;
                }
            }
            Err(e) => {
                for i in failed {
                    results[i] = Err(e.clone());
                }
            }
        }
        results
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, ElectrumError> {
        decode(method, self.request(method, params).await?)
    }

    async fn call_many<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Vec<Result<T, ElectrumError>> {
        self.batch(params.into_iter().map(|p| (method.to_string(), p)).collect())
            .await
            .into_iter()
            .map(|result| result.and_then(|value| decode(method, value)))
            .collect()
    }

    pub async fn ping(&self) -> Result<(), ElectrumError> {
        self.request("server.ping", json!([])).await.map(|_| ())
    }

    pub async fn get_balance(&self, address: &Address) -> Result<BalanceResponse, ElectrumError> {
        self.call("blockchain.scripthash.get_balance", scripthash_params(address))
            .await
    }

    pub async fn get_balances(
        &self,
        addresses: &[Address],
    ) -> Vec<Result<BalanceResponse, ElectrumError>> {
        self.call_many(
            "blockchain.scripthash.get_balance",
            addresses.iter().map(scripthash_params).collect(),
        )
        .await
    }

    pub async fn get_history(&self, address: &Address) -> Result<Vec<HistoryEntry>, ElectrumError> {
        self.call("blockchain.scripthash.get_history", scripthash_params(address))
            .await
    }

    pub async fn get_histories(
        &self,
        addresses: &[Address],
    ) -> Vec<Result<Vec<HistoryEntry>, ElectrumError>> {
        self.call_many(
            "blockchain.scripthash.get_history",
            addresses.iter().map(scripthash_params).collect(),
        )
        .await
    }

    pub async fn list_unspent(&self, address: &Address) -> Result<Vec<UnspentEntry>, ElectrumError> {
        self.call("blockchain.scripthash.listunspent", scripthash_params(address))
            .await
    }

    pub async fn list_unspents(
        &self,
        addresses: &[Address],
    ) -> Vec<Result<Vec<UnspentEntry>, ElectrumError>> {
        self.call_many(
            "blockchain.scripthash.listunspent",
            addresses.iter().map(scripthash_params).collect(),
        )
        .await
    }

    /// Balance plus history length for each address, fetched as one batch
    pub async fn get_address_stats(
        &self,
        addresses: &[Address],
    ) -> Vec<Result<AddressStats, ElectrumError>> {
        let requests = addresses
            .iter()
            .flat_map(|address| {
                let params = scripthash_params(address);
                [
                    ("blockchain.scripthash.get_balance".to_string(), params.clone()),
                    ("blockchain.scripthash.get_history".to_string(), params),
                ]
            })
            .collect();

        let mut results = self.batch(requests).await.into_iter();
        let mut stats = Vec::with_capacity(addresses.len());
        while let (Some(balance), Some(history)) = (results.next(), results.next()) {
            stats.push(address_stats(balance, history));
        }
        stats
    }

    pub async fn get_transaction(&self, txid: &Txid) -> Result<Transaction, ElectrumError> {
        let raw: String = self
            .call("blockchain.transaction.get", json!([txid.to_string()]))
            .await?;
        decode_consensus("blockchain.transaction.get", &raw)
    }

    pub async fn get_transactions(&self, txids: &[Txid]) -> Vec<Result<Transaction, ElectrumError>> {
        self.call_many::<String>(
            "blockchain.transaction.get",
            txids.iter().map(|t| json!([t.to_string()])).collect(),
        )
        .await
        .into_iter()
        .map(|raw| decode_consensus("blockchain.transaction.get", &raw?))
        .collect()
    }

    /// Submit a signed transaction; returns the txid the server accepted
    pub async fn broadcast(&self, tx: &Transaction) -> Result<Txid, ElectrumError> {
        self.broadcast_hex(&consensus::encode::serialize_hex(tx)).await
    }

    pub async fn broadcast_hex(&self, tx_hex: &str) -> Result<Txid, ElectrumError> {
        let txid: String = self
            .call("blockchain.transaction.broadcast", json!([tx_hex]))
            .await?;
        let txid = txid
            .parse::<Txid>()
            .map_err(|e| ElectrumError::malformed("blockchain.transaction.broadcast", e))?;
        log::info!("Broadcast transaction {}", txid);
        Ok(txid)
    }

    /// Fee rate in BTC/kB for confirmation within `blocks`; -1 if the server has no estimate
    pub async fn estimate_fee(&self, blocks: u16) -> Result<f64, ElectrumError> {
        self.call("blockchain.estimatefee", json!([blocks])).await
    }

    pub async fn fee_estimates(&self) -> Result<FeeEstimates, ElectrumError> {
        let rates = self
            .call_many::<f64>(
                "blockchain.estimatefee",
                FEE_TARGETS.iter().map(|b| json!([b])).collect(),
            )
            .await
            .into_iter()
            .map(|rate| rate.map(btc_per_kb_to_sat_per_vb))
            .collect::<Result<Vec<_>, _>>()?;

        match rates.as_slice() {
            [fast, normal, slow] => Ok(FeeEstimates {
                fast: *fast,
                normal: *normal,
                slow: *slow,
            }),
            _ => Err(ElectrumError::malformed(
                "blockchain.estimatefee",
                "missing fee target",
            )),
        }
    }

    /// Current chain tip
    pub async fn tip_header(&self) -> Result<HeaderNotification, ElectrumError> {
        self.call("blockchain.headers.subscribe", json!([])).await
    }

    pub async fn block_header(&self, height: u32) -> Result<Header, ElectrumError> {
        let raw: String = self.call("blockchain.block.header", json!([height])).await?;
        decode_consensus("blockchain.block.header", &raw)
    }

    pub async fn block_headers(&self, heights: &[u32]) -> Vec<Result<Header, ElectrumError>> {
        self.call_many::<String>(
            "blockchain.block.header",
            heights.iter().map(|h| json!([h])).collect(),
        )
        .await
        .into_iter()
        .map(|raw| decode_consensus("blockchain.block.header", &raw?))
        .collect()
    }
}

async fn check_genesis(connection: &Connection, network: Network) -> Result<(), ElectrumError> {
    let method = "blockchain.block.header";
    let raw: String = decode(method, connection.request(method, json!([0])).await?)?;
    let header: Header = decode_consensus(method, &raw)?;
    let hash = header.block_hash();

    if accepted_genesis_hashes(network).contains(&hash) {
        Ok(())
    } else {
        Err(ElectrumError::malformed(
            method,
            format!(
                "{} serves genesis {}, not {}",
                connection.peer(),
                hash,
                network_name(network)
            ),
        ))
    }
}

async fn dispatch(
    connection: &Connection,
    requests: &[(String, Value)],
    indices: impl Iterator<Item = usize>,
) -> Vec<Result<Value, ElectrumError>> {
    join_all(indices.map(|i| {
        let (method, params) = &requests[i];
        connection.request(method, params.clone())
    }))
    .await
}

fn address_stats(
    balance: Result<Value, ElectrumError>,
    history: Result<Value, ElectrumError>,
) -> Result<AddressStats, ElectrumError> {
    let balance: BalanceResponse = decode("blockchain.scripthash.get_balance", balance?)?;
    let history: Vec<HistoryEntry> = decode("blockchain.scripthash.get_history", history?)?;
    Ok(AddressStats {
        balance: balance.total(),
        tx_count: history.len() as u64,
    })
}

fn scripthash_params(address: &Address) -> Value {
    json!([ScriptHash::from_address(address).as_str()])
}

fn decode<T: DeserializeOwned>(method: &str, value: Value) -> Result<T, ElectrumError> {
    serde_json::from_value(value).map_err(|e| ElectrumError::malformed(method, e))
}

fn decode_consensus<T: consensus::Decodable>(method: &str, raw: &str) -> Result<T, ElectrumError> {
    let bytes = hex::decode(raw.trim()).map_err(|e| ElectrumError::malformed(method, e))?;
    consensus::deserialize(&bytes).map_err(|e| ElectrumError::malformed(method, e))
}
