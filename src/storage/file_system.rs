use std::fs;
use std::path::{Path, PathBuf};

use bitcoin::Network;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::models::{AddressList, AddressRow, SavedAddress, TransactionRow, UtxoRow, WalletRecord};
use crate::bitcoin::network::network_name;
use crate::error::StorageError;

const WALLET_FILE: &str = "wallet.json";
const ADDRESSES_FILE: &str = "addresses.json";
const UTXOS_FILE: &str = "utxos.json";
const TRANSACTIONS_FILE: &str = "transactions.json";

/// JSON-file storage, one directory per wallet under a per-network root
/// (`<base>/<network>/<wallet_id>/`), so mainnet and testnet rows never mix.
#[derive(Clone, Debug)]
pub struct Storage {
    base_path: PathBuf,
    network: Network,
}

impl Storage {
    /// Create a storage instance with the default base directory ("./wallets")
    pub fn new(network: Network) -> Self {
        Self::new_with_base_dir(PathBuf::from("./wallets"), network)
    }

    /// Create storage with custom base directory (for testing)
    pub fn new_with_base_dir(base_path: PathBuf, network: Network) -> Self {
        Self { base_path, network }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Name used in the `network` column of every row
    pub fn network_name(&self) -> &'static str {
        network_name(self.network)
    }

    fn network_dir(&self) -> PathBuf {
        self.base_path.join(self.network_name())
    }

    fn wallet_dir(&self, id: &str) -> PathBuf {
        self.network_dir().join(id)
    }

    /// Create the wallet directory and write its record
    pub fn create_wallet(&self, record: &WalletRecord) -> Result<(), StorageError> {
        fs::create_dir_all(self.wallet_dir(&record.id))?;
        self.save_wallet(record)
    }

    pub fn wallet_exists(&self, id: &str) -> bool {
        self.wallet_dir(id).join(WALLET_FILE).exists()
    }

    pub fn save_wallet(&self, record: &WalletRecord) -> Result<(), StorageError> {
        write_json(&self.wallet_dir(&record.id).join(WALLET_FILE), record)
    }

    pub fn load_wallet(&self, id: &str) -> Result<WalletRecord, StorageError> {
        let path = self.wallet_dir(id).join(WALLET_FILE);
        if !path.exists() {
            return Err(StorageError::FileNotFound(path.display().to_string()));
        }
        read_json(&path)
    }

    /// Read-modify-write of a wallet record
    pub fn update_wallet<F>(&self, id: &str, update: F) -> Result<WalletRecord, StorageError>
    where
        F: FnOnce(&mut WalletRecord),
    {
        let mut record = self.load_wallet(id)?;
        update(&mut record);
        self.save_wallet(&record)?;
        Ok(record)
    }

    /// List all wallets of this network, oldest first
    pub fn list_wallets(&self) -> Result<Vec<WalletRecord>, StorageError> {
        let dir = self.network_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut wallets = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path().join(WALLET_FILE);
            if path.exists() {
                match read_json::<WalletRecord>(&path) {
                    Ok(record) => wallets.push(record),
                    Err(e) => log::warn!("Skipping unreadable wallet record {:?}: {}", path, e),
                }
            }
        }
        wallets.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(wallets)
    }

    /// Delete a wallet and every row scoped to it
    pub fn delete_wallet(&self, id: &str) -> Result<(), StorageError> {
        let wallet_dir = self.wallet_dir(id);

        if !wallet_dir.exists() {
            return Err(StorageError::DirectoryNotFound(
                wallet_dir.display().to_string(),
            ));
        }

        log::warn!("Deleting wallet directory: {:?}", wallet_dir);
        fs::remove_dir_all(&wallet_dir)?;
        log::info!("Wallet '{}' deleted", id);
        Ok(())
    }

    pub fn load_addresses(&self, id: &str) -> Result<Vec<AddressRow>, StorageError> {
        read_json_or_default(&self.wallet_dir(id).join(ADDRESSES_FILE))
    }

    pub fn save_addresses(&self, id: &str, rows: &[AddressRow]) -> Result<(), StorageError> {
        write_json(&self.wallet_dir(id).join(ADDRESSES_FILE), &rows)
    }

    pub fn load_utxos(&self, id: &str) -> Result<Vec<UtxoRow>, StorageError> {
        read_json_or_default(&self.wallet_dir(id).join(UTXOS_FILE))
    }

    /// Replace the wallet's entire UTXO set
    pub fn replace_utxos(&self, id: &str, rows: &[UtxoRow]) -> Result<(), StorageError> {
        write_json(&self.wallet_dir(id).join(UTXOS_FILE), &rows)
    }

    /// Single-row label edit. Returns false if no such output is stored.
    pub fn update_utxo_label(
        &self,
        id: &str,
        txid: &bitcoin::Txid,
        vout: u32,
        label: &str,
    ) -> Result<bool, StorageError> {
        let mut rows = self.load_utxos(id)?;
        let mut found = false;
        for row in rows.iter_mut().filter(|r| &r.txid == txid && r.vout == vout) {
            row.label = label.to_string();
            found = true;
        }
        if found {
            self.replace_utxos(id, &rows)?;
        }
        Ok(found)
    }

    /// Unconfirmed transactions on top, then confirmed ones newest first
    pub fn load_transactions(&self, id: &str) -> Result<Vec<TransactionRow>, StorageError> {
        let mut rows: Vec<TransactionRow> =
            read_json_or_default(&self.wallet_dir(id).join(TRANSACTIONS_FILE))?;
        rows.sort_by(|a, b| {
            match (a.content.status.height(), b.content.status.height()) {
                (None, None) => a.txid.cmp(&b.txid),
                (None, Some(_)) => std::cmp::Ordering::Less,
                (Some(_), None) => std::cmp::Ordering::Greater,
                (Some(x), Some(y)) => y
                    .cmp(&x)
                    .then_with(|| b.block_time.cmp(&a.block_time))
                    .then_with(|| a.txid.cmp(&b.txid)),
            }
        });
        Ok(rows)
    }

    /// Insert or replace rows by txid
    pub fn upsert_transactions(
        &self,
        id: &str,
        updates: Vec<TransactionRow>,
    ) -> Result<(), StorageError> {
        let path = self.wallet_dir(id).join(TRANSACTIONS_FILE);
        let mut rows: Vec<TransactionRow> = read_json_or_default(&path)?;
        for update in updates {
            match rows.iter_mut().find(|r| r.txid == update.txid) {
                Some(existing) => *existing = update,
                None => rows.push(update),
            }
        }
        write_json(&path, &rows)
    }

    /// Saved or tracked addresses of this network, in insertion order
    pub fn load_saved_addresses(&self, list: AddressList) -> Result<Vec<SavedAddress>, StorageError> {
        read_json_or_default(&self.network_dir().join(list.file_name()))
    }

    pub fn add_saved_address(
        &self,
        list: AddressList,
        item: &SavedAddress,
    ) -> Result<(), StorageError> {
        let mut rows = self.load_saved_addresses(list)?;
        rows.push(item.clone());
        self.save_saved_addresses(list, &rows)
    }

    /// Returns false if no row has `id`
    pub fn remove_saved_address(&self, list: AddressList, id: &str) -> Result<bool, StorageError> {
        let mut rows = self.load_saved_addresses(list)?;
        let before = rows.len();
        rows.retain(|row| row.id != id);
        if rows.len() == before {
            return Ok(false);
        }
        self.save_saved_addresses(list, &rows)?;
        Ok(true)
    }

    /// Read-modify-write of one row; `None` if no row has `id`
    pub fn update_saved_address<F>(
        &self,
        list: AddressList,
        id: &str,
        update: F,
    ) -> Result<Option<SavedAddress>, StorageError>
    where
        F: FnOnce(&mut SavedAddress),
    {
        let mut rows = self.load_saved_addresses(list)?;
        let Some(row) = rows.iter_mut().find(|row| row.id == id) else {
            return Ok(None);
        };
        update(row);
        let updated = row.clone();
        self.save_saved_addresses(list, &rows)?;
        Ok(Some(updated))
    }

    /// Read-modify-write of every row in one file write
    pub fn update_saved_addresses<F>(
        &self,
        list: AddressList,
        mut update: F,
    ) -> Result<Vec<SavedAddress>, StorageError>
    where
        F: FnMut(&mut SavedAddress),
    {
        let mut rows = self.load_saved_addresses(list)?;
        rows.iter_mut().for_each(&mut update);
        self.save_saved_addresses(list, &rows)?;
        Ok(rows)
    }

    fn save_saved_addresses(
        &self,
        list: AddressList,
        rows: &[SavedAddress],
    ) -> Result<(), StorageError> {
        fs::create_dir_all(self.network_dir())?;
        write_json(&self.network_dir().join(list.file_name()), rows)
    }
}

/// Write through a temp file and rename so a crash never leaves a torn file
fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            return Err(StorageError::DirectoryNotFound(parent.display().to_string()));
        }
    }
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, StorageError> {
    let contents = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T, StorageError> {
    if !path.exists() {
        return Ok(T::default());
    }
    read_json(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::{UtxoStatus, WalletAddress};
    use chrono::Utc;
    use std::str::FromStr;
    use tempfile::TempDir;

    fn record(id: &str) -> WalletRecord {
        WalletRecord {
            id: id.to_string(),
            name: format!("Wallet {}", id),
            network: "testnet".to_string(),
            change_address_index: 0,
            next_utxo_count: 1,
            created_at: Utc::now(),
            last_refreshed: None,
        }
    }

    #[test]
    fn test_wallets_scoped_by_network() {
        let temp_dir = TempDir::new().unwrap();
        let testnet = Storage::new_with_base_dir(temp_dir.path().to_path_buf(), Network::Testnet);
        let mainnet = Storage::new_with_base_dir(temp_dir.path().to_path_buf(), Network::Bitcoin);

        testnet.create_wallet(&record("a")).unwrap();
        assert!(testnet.wallet_exists("a"));
        assert!(!mainnet.wallet_exists("a"));
        assert_eq!(testnet.list_wallets().unwrap().len(), 1);
        assert!(mainnet.list_wallets().unwrap().is_empty());
    }

    #[test]
    fn test_update_and_delete_wallet() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::new_with_base_dir(temp_dir.path().to_path_buf(), Network::Testnet);
        storage.create_wallet(&record("w")).unwrap();

        let updated = storage
            .update_wallet("w", |r| r.change_address_index = 3)
            .unwrap();
        assert_eq!(updated.change_address_index, 3);
        assert_eq!(storage.load_wallet("w").unwrap().change_address_index, 3);

        storage.delete_wallet("w").unwrap();
        assert!(!storage.wallet_exists("w"));
        assert!(storage.load_wallet("w").is_err());
        assert!(storage.delete_wallet("w").is_err());
    }

    #[test]
    fn test_label_update_single_row() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::new_with_base_dir(temp_dir.path().to_path_buf(), Network::Testnet);
        storage.create_wallet(&record("w")).unwrap();

        let txid = bitcoin::Txid::from_str(
            "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b",
        )
        .unwrap();
        let row = |vout: u32| UtxoRow {
            txid,
            vout,
            wallet_id: "w".to_string(),
            address: WalletAddress::from(
                crate::bitcoin::network::validate_address(
                    "tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx",
                    Network::Testnet,
                )
                .unwrap(),
            ),
            value: 1_000,
            label: format!("UTXO #{}", vout + 1),
            status: UtxoStatus::Unconfirmed,
            network: "testnet".to_string(),
        };
        storage.replace_utxos("w", &[row(0), row(1)]).unwrap();

        assert!(storage.update_utxo_label("w", &txid, 1, "cold storage").unwrap());
        assert!(!storage.update_utxo_label("w", &txid, 9, "missing").unwrap());

        let rows = storage.load_utxos("w").unwrap();
        assert_eq!(rows[0].label, "UTXO #1");
        assert_eq!(rows[1].label, "cold storage");
    }

    #[test]
    fn test_address_lists_scoped_by_network_and_list() {
        let temp_dir = TempDir::new().unwrap();
        let testnet = Storage::new_with_base_dir(temp_dir.path().to_path_buf(), Network::Testnet);
        let mainnet = Storage::new_with_base_dir(temp_dir.path().to_path_buf(), Network::Bitcoin);
        let item = |id: &str| SavedAddress {
            id: id.to_string(),
            address: "tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx".to_string(),
            name: format!("Payee {}", id),
            balance: 0,
            last_updated: None,
            network: "testnet".to_string(),
        };

        // No wallet directory yet
        testnet.add_saved_address(AddressList::Saved, &item("a")).unwrap();
        testnet.add_saved_address(AddressList::Saved, &item("b")).unwrap();
        testnet.add_saved_address(AddressList::Tracked, &item("c")).unwrap();

        assert_eq!(testnet.load_saved_addresses(AddressList::Saved).unwrap().len(), 2);
        assert_eq!(testnet.load_saved_addresses(AddressList::Tracked).unwrap().len(), 1);
        assert!(mainnet.load_saved_addresses(AddressList::Saved).unwrap().is_empty());
        // List files never show up as wallets
        assert!(testnet.list_wallets().unwrap().is_empty());

        let renamed = testnet
            .update_saved_address(AddressList::Saved, "b", |row| row.name = "Landlord".into())
            .unwrap()
            .unwrap();
        assert_eq!(renamed.name, "Landlord");
        assert!(testnet
            .update_saved_address(AddressList::Tracked, "b", |row| row.name = "x".into())
            .unwrap()
            .is_none());

        assert!(testnet.remove_saved_address(AddressList::Saved, "a").unwrap());
        assert!(!testnet.remove_saved_address(AddressList::Saved, "a").unwrap());
        let saved = testnet.load_saved_addresses(AddressList::Saved).unwrap();
        assert_eq!(saved, vec![renamed]);
    }
}
