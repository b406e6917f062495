//! Trustless Wallet: self-custodial Bitcoin wallet engine
//!
//! Derives BIP84 native segwit addresses from a BIP39 recovery phrase,
//! tracks balances, UTXOs and history through an Electrum server, and builds
//! and signs spends locally.
//!
//! # Architecture
//!
//! - **Electrum client**: JSON-RPC 2.0 over TCP/TLS with peer fallback
//! - **Address ledger**: gap-limited derivation windows and cached stats
//! - **UTXO store**: label-preserving sync of spendable outputs
//! - **Transaction builder**: coin selection, fee/change decision, P2WPKH signing
//! - **Wallet manager**: per-wallet sessions over storage, secrets and backend
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use trustless_wallet::{MemoryPreferences, MemorySecretStore, WalletConfig, WalletManager};
//!
//! let config = WalletConfig::from_env();
//! let (manager, client) = WalletManager::with_electrum(
//!     &config,
//!     Arc::new(MemorySecretStore::new()),
//!     Arc::new(MemoryPreferences::new()),
//! );
//! client.init().await?;
//!
//! let (wallet, phrase) = manager.create_wallet(Some("Savings"))?;
//! manager.bootstrap(&wallet.id).await?;
//! let address = manager.receive_address(&wallet.id).await?;
//! ```

pub mod bitcoin;
pub mod config;
pub mod electrum;
pub mod error;
pub mod manager;
pub mod storage;
pub mod wallet;

pub use crate::bitcoin::history::{HistoryRecord, TxType};
pub use crate::bitcoin::transaction::{
    CoinSelection, SignedTransaction, SpendPlan, TransactionBuilder, TxMetrics,
};
pub use config::WalletConfig;
pub use electrum::{ClientConfig, ElectrumClient, FeeEstimates, Peer};
pub use error::{ElectrumError, StorageError, WalletError};
pub use manager::{SendPreview, SendResult, WalletBalance, WalletManager};
pub use storage::{
    AddressList, FilePreferences, FileSecretStore, MemoryPreferences, MemorySecretStore,
    PreferenceStore, SavedAddress, SecretStore, Storage, TransactionRow, Utxo, UtxoStatus,
    WalletRecord,
};
pub use wallet::{AddressLedger, Chain, ChainBackend, RefreshReport, UtxoStore};

// Common result type
pub type Result<T> = std::result::Result<T, WalletError>;
