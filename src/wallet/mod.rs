pub mod address_book;
pub mod backend;
pub mod history_sync;
pub mod keys;
pub mod ledger;
pub mod utxo_store;

pub use backend::ChainBackend;
pub use keys::{AccountKeys, AccountXpub, Chain, DerivedKey, KeyManager};
pub use ledger::{AddressLedger, RefreshReport, GAP_LIMIT};
pub use utxo_store::UtxoStore;
