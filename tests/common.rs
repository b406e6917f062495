//! Common test utilities for wallet engine integration tests
//!
//! This module provides shared test infrastructure including:
//! - A scripted Electrum server on a loopback socket
//! - An in-memory chain backend with per-address failure injection
//! - Test environment setup around a temporary storage root
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bitcoin::block::Header;
use bitcoin::blockdata::constants::genesis_block;
use bitcoin::{consensus, Address, Network, Transaction, Txid};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use trustless_wallet::electrum::{
    AddressStats, FeeEstimates, HeaderNotification, HistoryEntry, Peer, UnspentEntry,
};
use trustless_wallet::wallet::{AccountKeys, KeyManager};
use trustless_wallet::{
    Chain, ChainBackend, ElectrumError, MemorySecretStore, Storage, WalletManager,
};

pub const TEST_MNEMONIC: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

const FOREIGN_MNEMONIC: &str =
    "legal winner thank year wave sausage worth useful legal winner thank yellow";

pub fn init_logging() {
    env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .is_test(true)
        .try_init()
        .ok();
}

/// Hex of the genesis header a server on `network` reports at height 0
pub fn genesis_header_hex(network: Network) -> String {
    consensus::encode::serialize_hex(&genesis_block(network).header)
}

pub fn genesis_header(network: Network) -> Header {
    genesis_block(network).header
}

/// What the scripted server does with one request
pub enum Reply {
    Result(Value),
    Error(i64, String),
    /// Never answer
    Silent,
    /// Close the socket without answering
    Hangup,
    /// Answer, then push extra raw lines (notifications)
    ResultThen(Value, Vec<Value>),
}

/// Reply for methods a handler does not script. The handshake falls back to
/// a canned `server.version` answer.
pub fn unknown(method: &str) -> Reply {
    Reply::Error(-32601, format!("unknown method {}", method))
}

type Handler = dyn Fn(&str, &Value) -> Reply + Send + Sync;

/// Line-delimited JSON-RPC server on 127.0.0.1 driven by a handler closure.
/// `server.version` is answered automatically unless the handler claims it.
pub struct MockElectrumServer {
    pub port: u16,
    connections: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<(String, Value)>>>,
    task: tokio::task::JoinHandle<()>,
}

impl MockElectrumServer {
    pub async fn start<F>(handler: F) -> anyhow::Result<Self>
    where
        F: Fn(&str, &Value) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let handler: Arc<Handler> = Arc::new(handler);
        let connections = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));

        let task = {
            let connections = connections.clone();
            let requests = requests.clone();
            tokio::spawn(async move {
                while let Ok((socket, _)) = listener.accept().await {
                    connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(socket, handler.clone(), requests.clone()));
                }
            })
        };

        Ok(Self {
            port,
            connections,
            requests,
            task,
        })
    }

    /// Server that only answers the handshake and pings
    pub async fn idle() -> anyhow::Result<Self> {
        Self::start(|method, _| match method {
            "server.ping" => Reply::Result(Value::Null),
            _ => unknown(method),
        })
        .await
    }

    pub fn peer(&self) -> Peer {
        Peer::tcp("127.0.0.1", self.port)
    }

    pub fn node_url(&self) -> String {
        format!("127.0.0.1:{}:tcp", self.port)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Every request received so far, handshake included
    pub fn requests(&self) -> Vec<(String, Value)> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for MockElectrumServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    socket: TcpStream,
    handler: Arc<Handler>,
    requests: Arc<Mutex<Vec<(String, Value)>>>,
) {
    let (read_half, mut write_half) = socket.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let Ok(request) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        let id = request["id"].clone();
        let method = request["method"].as_str().unwrap_or_default().to_string();
        let params = request["params"].clone();
        requests.lock().unwrap().push((method.clone(), params.clone()));

        let reply = match handler(&method, &params) {
            Reply::Error(-32601, _) if method == "server.version" => {
                Reply::Result(json!(["MockElectrum 1.0", "1.4"]))
            }
            reply => reply,
        };

        let mut out = Vec::new();
        match reply {
            Reply::Result(result) => {
                out.push(json!({"jsonrpc": "2.0", "id": id, "result": result}))
            }
            Reply::Error(code, message) => out.push(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": code, "message": message}
            })),
            Reply::Silent => {}
            Reply::Hangup => return,
            Reply::ResultThen(result, extra) => {
                out.push(json!({"jsonrpc": "2.0", "id": id, "result": result}));
                out.extend(extra);
            }
        }
        for message in out {
            let mut bytes = message.to_string().into_bytes();
            bytes.push(b'\n');
            if write_half.write_all(&bytes).await.is_err() {
                return;
            }
        }
    }
}

/// A port nothing listens on
pub async fn closed_port() -> anyhow::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

#[derive(Default)]
struct BackendState {
    stats: HashMap<String, AddressStats>,
    failing: HashSet<String>,
    unspent: HashMap<String, Vec<UnspentEntry>>,
    history: HashMap<String, Vec<HistoryEntry>>,
    transactions: HashMap<Txid, Transaction>,
    headers: HashMap<u32, Header>,
    broadcasts: Vec<Transaction>,
    stats_queries: usize,
}

/// In-memory chain view. Unknown addresses read as unused and empty.
#[derive(Default)]
pub struct MockBackend {
    state: Mutex<BackendState>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_stats(&self, address: &Address, balance: i64, tx_count: u64) {
        self.state
            .lock()
            .unwrap()
            .stats
            .insert(address.to_string(), AddressStats { balance, tx_count });
    }

    pub fn set_failing(&self, address: &Address, failing: bool) {
        let mut state = self.state.lock().unwrap();
        if failing {
            state.failing.insert(address.to_string());
        } else {
            state.failing.remove(&address.to_string());
        }
    }

    pub fn add_unspent(&self, address: &Address, txid: Txid, vout: u32, value: u64, height: i64) {
        self.state
            .lock()
            .unwrap()
            .unspent
            .entry(address.to_string())
            .or_default()
            .push(UnspentEntry {
                tx_hash: txid.to_string(),
                tx_pos: vout,
                height,
                value,
            });
    }

    pub fn clear_unspent(&self) {
        self.state.lock().unwrap().unspent.clear();
    }

    pub fn add_history(&self, address: &Address, txid: Txid, height: i64) {
        self.state
            .lock()
            .unwrap()
            .history
            .entry(address.to_string())
            .or_default()
            .push(HistoryEntry {
                tx_hash: txid.to_string(),
                height,
                fee: None,
            });
    }

    pub fn add_transaction(&self, tx: Transaction) {
        self.state
            .lock()
            .unwrap()
            .transactions
            .insert(tx.compute_txid(), tx);
    }

    pub fn set_header(&self, height: u32, header: Header) {
        self.state.lock().unwrap().headers.insert(height, header);
    }

    pub fn broadcasts(&self) -> Vec<Transaction> {
        self.state.lock().unwrap().broadcasts.clone()
    }

    /// Number of addresses stats were requested for, across all calls
    pub fn stats_queries(&self) -> usize {
        self.state.lock().unwrap().stats_queries
    }

    fn check(&self, state: &BackendState, address: &Address) -> Result<(), ElectrumError> {
        if state.failing.contains(&address.to_string()) {
            return Err(ElectrumError::Timeout {
                method: format!("mock query for {}", address),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ChainBackend for MockBackend {
    async fn address_stats(
        &self,
        addresses: &[Address],
    ) -> Vec<Result<AddressStats, ElectrumError>> {
        let mut state = self.state.lock().unwrap();
        state.stats_queries += addresses.len();
        addresses
            .iter()
            .map(|address| {
                self.check(&state, address)?;
                Ok(state
                    .stats
                    .get(&address.to_string())
                    .copied()
                    .unwrap_or_default())
            })
            .collect()
    }

    async fn list_unspent(
        &self,
        addresses: &[Address],
    ) -> Vec<Result<Vec<UnspentEntry>, ElectrumError>> {
        let state = self.state.lock().unwrap();
        addresses
            .iter()
            .map(|address| {
                self.check(&state, address)?;
                Ok(state
                    .unspent
                    .get(&address.to_string())
                    .cloned()
                    .unwrap_or_default())
            })
            .collect()
    }

    async fn address_history(
        &self,
        addresses: &[Address],
    ) -> Vec<Result<Vec<HistoryEntry>, ElectrumError>> {
        let state = self.state.lock().unwrap();
        addresses
            .iter()
            .map(|address| {
                self.check(&state, address)?;
                Ok(state
                    .history
                    .get(&address.to_string())
                    .cloned()
                    .unwrap_or_default())
            })
            .collect()
    }

    async fn transactions(&self, txids: &[Txid]) -> Vec<Result<Transaction, ElectrumError>> {
        let state = self.state.lock().unwrap();
        txids
            .iter()
            .map(|txid| {
                state.transactions.get(txid).cloned().ok_or_else(|| ElectrumError::Rpc {
                    method: "blockchain.transaction.get".into(),
                    code: 2,
                    message: format!("unknown transaction {}", txid),
                })
            })
            .collect()
    }

    async fn block_headers(&self, heights: &[u32]) -> Vec<Result<Header, ElectrumError>> {
        let state = self.state.lock().unwrap();
        heights
            .iter()
            .map(|height| {
                state.headers.get(height).copied().ok_or_else(|| ElectrumError::Rpc {
                    method: "blockchain.block.header".into(),
                    code: 1,
                    message: format!("height {} out of range", height),
                })
            })
            .collect()
    }

    async fn broadcast(&self, tx: &Transaction) -> Result<Txid, ElectrumError> {
        let txid = tx.compute_txid();
        self.state.lock().unwrap().broadcasts.push(tx.clone());
        Ok(txid)
    }

    async fn fee_estimates(&self) -> Result<FeeEstimates, ElectrumError> {
        Ok(FeeEstimates {
            fast: 20,
            normal: 10,
            slow: 2,
        })
    }

    async fn tip(&self) -> Result<HeaderNotification, ElectrumError> {
        Ok(HeaderNotification {
            height: 150,
            hex: genesis_header_hex(Network::Regtest),
        })
    }
}

/// Test environment with automatic cleanup
pub struct TestEnvironment {
    pub temp_dir: TempDir,
    pub backend: Arc<MockBackend>,
    pub manager: WalletManager,
    pub keys: AccountKeys,
}

impl TestEnvironment {
    pub fn new() -> anyhow::Result<Self> {
        init_logging();
        let temp_dir = TempDir::new()?;
        log::info!("Test directory: {:?}", temp_dir.path());

        let storage = Storage::new_with_base_dir(temp_dir.path().to_path_buf(), Network::Regtest);
        let backend = Arc::new(MockBackend::new());
        let manager = WalletManager::new(
            storage,
            Arc::new(MemorySecretStore::new()),
            backend.clone(),
        );
        let mnemonic = KeyManager::parse_mnemonic(TEST_MNEMONIC)?;
        let keys = AccountKeys::from_mnemonic(&mnemonic, Network::Regtest)?;

        Ok(Self {
            temp_dir,
            backend,
            manager,
            keys,
        })
    }

    /// Import the fixed test phrase and return the wallet id
    pub fn import(&self) -> anyhow::Result<String> {
        Ok(self.manager.import_wallet(Some("test"), TEST_MNEMONIC)?.id)
    }

    pub fn receive(&self, index: u32) -> Address {
        self.address(Chain::Receive, index)
    }

    pub fn change(&self, index: u32) -> Address {
        self.address(Chain::Change, index)
    }

    fn address(&self, chain: Chain, index: u32) -> Address {
        self.keys.derive_address(chain, index).unwrap().address
    }
}

/// Deterministic fake txid
pub fn txid(byte: u8) -> Txid {
    use std::str::FromStr;
    Txid::from_str(&format!("{:02x}", byte).repeat(32)).unwrap()
}

/// Receive address of an unrelated wallet
pub fn foreign_address(index: u32) -> Address {
    let mnemonic = KeyManager::parse_mnemonic(FOREIGN_MNEMONIC).unwrap();
    AccountKeys::from_mnemonic(&mnemonic, Network::Regtest)
        .unwrap()
        .derive_address(Chain::Receive, index)
        .unwrap()
        .address
}
