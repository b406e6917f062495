//! Storage and persistence layer
//!
//! - File system row storage (per network, per wallet)
//! - Secret and preference store collaborators
//! - Data models

mod file_system;
pub mod models;
pub mod preferences;
pub mod secrets;

pub use file_system::Storage;
pub use models::{
    AddressInfo, AddressList, AddressRow, DerivedAddress, RemoteUtxo, SavedAddress,
    TransactionRow, Utxo, UtxoRow, UtxoStatus, WalletAddress, WalletRecord,
};
pub use preferences::{FilePreferences, MemoryPreferences, PreferenceStore, CUSTOM_NODE_URL_KEY};
pub use secrets::{FileSecretStore, MemorySecretStore, SecretStore};
