//! Electrum protocol client (JSON-RPC 2.0 over TCP/TLS)

pub mod client;
pub mod connection;
pub mod framing;
pub mod peers;
pub mod scripthash;
pub mod tls;
pub mod types;

pub use client::{ClientConfig, ElectrumClient, FEE_TARGETS};
pub use framing::Notification;
pub use peers::{default_peers, parse_custom_node, Peer, Transport};
pub use scripthash::ScriptHash;
pub use types::{
    AddressStats, BalanceResponse, FeeEstimates, HeaderNotification, HistoryEntry, UnspentEntry,
};
