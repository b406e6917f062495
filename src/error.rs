//! Error types for wallet engine operations
//!
//! `WalletError` is what every engine operation returns. The Electrum client
//! and the storage layer carry their own error types which convert into it.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WalletError {
    #[error("Wallet not found: {0}")]
    WalletNotFound(String),

    #[error("Invalid mnemonic: {0}")]
    InvalidMnemonic(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Secret not found for wallet: {0}")]
    SecretNotFound(String),

    #[error("Derivation error at {path}: {reason}")]
    Derivation { path: String, reason: String },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("UTXO not found: {0}")]
    UtxoNotFound(String),

    #[error("Saved address not found: {0}")]
    AddressNotFound(String),

    #[error("Insufficient funds: need {required} sats, have {available} sats")]
    InsufficientFunds { required: u64, available: u64 },

    #[error("Cannot resolve owning address {address} for input {txid}:{vout}")]
    UnresolvableInput {
        txid: String,
        vout: u32,
        address: String,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Electrum error: {0}")]
    Electrum(#[from] ElectrumError),

    #[error("Bitcoin error: {0}")]
    Bitcoin(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WalletError {
    pub fn derivation(path: impl Into<String>, reason: impl ToString) -> Self {
        Self::Derivation {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// True for socket, timeout and peer-exhaustion failures.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Electrum(e) if e.is_transport())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ElectrumError {
    #[error("Transport error ({peer}): {reason}")]
    Transport { peer: String, reason: String },

    #[error("Request timed out: {method}")]
    Timeout { method: String },

    #[error("Server returned error {code} for {method}: {message}")]
    Rpc {
        method: String,
        code: i64,
        message: String,
    },

    #[error("Malformed response for {method}: {reason}")]
    Malformed { method: String, reason: String },

    #[error("All peers failed: {0}")]
    AllPeersFailed(String),

    #[error("Connection closed: {0}")]
    Closed(String),
}

impl ElectrumError {
    pub fn transport(peer: impl ToString, reason: impl ToString) -> Self {
        Self::Transport {
            peer: peer.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn malformed(method: impl Into<String>, reason: impl ToString) -> Self {
        Self::Malformed {
            method: method.into(),
            reason: reason.to_string(),
        }
    }

    /// Transport-class failures are retried once across the peer list;
    /// protocol failures are surfaced and the connection stays usable.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::Timeout { .. } | Self::AllPeersFailed(_) | Self::Closed(_)
        )
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Wallet directory not found: {0}")]
    DirectoryNotFound(String),

    #[error("File not found: {0}")]
    FileNotFound(String),
}
