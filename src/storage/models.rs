//! Data models for wallet storage

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use bitcoin::{Address, Network, OutPoint, Txid};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bitcoin::history::HistoryRecord;
use crate::error::WalletError;
use crate::wallet::keys::Chain;

/// Address string keyed lookups go through this type, never raw `&str`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WalletAddress(String);

impl WalletAddress {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse back into a network-checked address
    pub fn to_address(&self, network: Network) -> Result<Address, WalletError> {
        crate::bitcoin::network::validate_address(&self.0, network)
    }
}

impl From<&Address> for WalletAddress {
    fn from(address: &Address) -> Self {
        Self(address.to_string())
    }
}

impl From<Address> for WalletAddress {
    fn from(address: Address) -> Self {
        Self(address.to_string())
    }
}

impl fmt::Display for WalletAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Wallet row. The recovery phrase lives in the secret store, never here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletRecord {
    pub id: String,
    pub name: String,
    pub network: String,
    /// Monotonic; advanced only through the change-index guard
    pub change_address_index: u32,
    /// Monotonic counter for default `UTXO #n` labels
    pub next_utxo_count: u64,
    pub created_at: DateTime<Utc>,
    /// When address stats were last fetched; cached balances are as of this time
    #[serde(default)]
    pub last_refreshed: Option<DateTime<Utc>>,
}

/// Immutable `(chain, index) -> address` mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedAddress {
    pub chain: Chain,
    pub index: u32,
    pub address: WalletAddress,
}

/// Cached server view of one derived address. `tx_count == 0` means unused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressInfo {
    pub address: WalletAddress,
    pub index: u32,
    pub balance: i64,
    pub tx_count: u64,
}

/// Persisted address row: derivation plus cache columns
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressRow {
    pub address: WalletAddress,
    pub wallet_id: String,
    pub chain: Chain,
    pub index: u32,
    pub balance: i64,
    pub tx_count: u64,
    pub network: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum UtxoStatus {
    Unconfirmed,
    Confirmed { height: u32 },
}

impl UtxoStatus {
    /// Electrum reports mempool entries with height 0 or -1
    pub fn from_height(height: i64) -> Self {
        if height > 0 {
            UtxoStatus::Confirmed {
                height: height as u32,
            }
        } else {
            UtxoStatus::Unconfirmed
        }
    }

    pub fn height(&self) -> Option<u32> {
        match self {
            UtxoStatus::Confirmed { height } => Some(*height),
            UtxoStatus::Unconfirmed => None,
        }
    }

    /// Ascending by height, unconfirmed last
    pub fn label_order(&self, other: &Self) -> Ordering {
        match (self.height(), other.height()) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }
}

/// UTXO as reported by the server, before labels are applied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteUtxo {
    pub txid: Txid,
    pub vout: u32,
    pub address: WalletAddress,
    pub value: u64,
    pub status: UtxoStatus,
}

impl RemoteUtxo {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid, self.vout)
    }
}

/// Spendable output owned by a wallet, with its label
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub txid: Txid,
    pub vout: u32,
    pub address: WalletAddress,
    pub value: u64,
    pub status: UtxoStatus,
    pub label: String,
}

impl Utxo {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid, self.vout)
    }
}

/// Persisted UTXO row; `(txid, vout)` is the key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UtxoRow {
    pub txid: Txid,
    pub vout: u32,
    pub wallet_id: String,
    pub address: WalletAddress,
    pub value: u64,
    pub label: String,
    pub status: UtxoStatus,
    pub network: String,
}

impl UtxoRow {
    pub fn into_utxo(self) -> Utxo {
        Utxo {
            txid: self.txid,
            vout: self.vout,
            address: self.address,
            value: self.value,
            status: self.status,
            label: self.label,
        }
    }
}

/// Persisted history row; `(txid, wallet_id)` is the key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRow {
    pub txid: Txid,
    pub wallet_id: String,
    pub content: HistoryRecord,
    pub block_time: Option<i64>,
    pub network: String,
}

/// Address book lists kept per network, outside any wallet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressList {
    /// Payees picked from when sending
    Saved,
    /// Third-party addresses watched for their balance
    Tracked,
}

impl AddressList {
    pub fn file_name(self) -> &'static str {
        match self {
            AddressList::Saved => "saved_addresses.json",
            AddressList::Tracked => "tracked_addresses.json",
        }
    }
}

/// Named watch-only address with its last fetched balance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedAddress {
    pub id: String,
    pub address: String,
    pub name: String,
    pub balance: i64,
    /// `None` until the first successful balance fetch
    pub last_updated: Option<DateTime<Utc>>,
    pub network: String,
}

/// Parse a hex txid as delivered by the server
pub fn parse_txid(raw: &str) -> Result<Txid, WalletError> {
    Txid::from_str(raw).map_err(|e| WalletError::Bitcoin(format!("Invalid txid {}: {}", raw, e)))
}
