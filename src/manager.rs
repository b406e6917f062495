//! Wallet manager: composition root of the engine
//!
//! Owns storage, the secret store and the chain backend. Each wallet gets a
//! lazily loaded session behind its own async mutex, so refreshes, syncs and
//! spends of one wallet run one at a time while different wallets proceed
//! independently.

use std::collections::HashMap;
use std::sync::Arc;

use bitcoin::{Address, Network, Txid};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::bitcoin::network::{network_name, validate_address};
use crate::bitcoin::transaction::{
    ChangeOutput, CoinSelection, SignedTransaction, SpendPlan, TransactionBuilder,
};
use crate::config::WalletConfig;
use crate::electrum::{ClientConfig, ElectrumClient, FeeEstimates};
use crate::error::WalletError;
use crate::storage::secrets::mnemonic_key;
use crate::storage::{
    AddressInfo, AddressList, DerivedAddress, PreferenceStore, SavedAddress, SecretStore, Storage,
    TransactionRow, Utxo, WalletRecord,
};
use crate::wallet::address_book;
use crate::wallet::history_sync::sync_history;
use crate::wallet::utxo_store::fetch_remote_utxos;
use crate::wallet::{AccountKeys, AddressLedger, ChainBackend, Chain, KeyManager, RefreshReport, UtxoStore};

struct WalletSession {
    ledger: AddressLedger,
    utxos: UtxoStore,
}

type SessionSlot = Arc<Mutex<Option<WalletSession>>>;

/// Cached balance view of a wallet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletBalance {
    pub total: i64,
    /// `None` until the wallet has been refreshed once
    pub last_refreshed: Option<DateTime<Utc>>,
}

/// What the confirmation screen shows before anything is signed
#[derive(Debug, Clone)]
pub struct SendPreview {
    pub recipient: Address,
    pub plan: SpendPlan,
    pub change: Option<ChangeOutput>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendResult {
    pub txid: Txid,
    pub fee: u64,
    pub used_change_index: Option<u32>,
    pub change_index_advanced: bool,
}

pub struct WalletManager {
    storage: Storage,
    secrets: Arc<dyn SecretStore>,
    backend: Arc<dyn ChainBackend>,
    builder: TransactionBuilder,
    sessions: std::sync::Mutex<HashMap<String, SessionSlot>>,
    /// Serializes edits to the saved/tracked address files
    address_book: Mutex<()>,
}

impl WalletManager {
    pub fn new(storage: Storage, secrets: Arc<dyn SecretStore>, backend: Arc<dyn ChainBackend>) -> Self {
        let builder = TransactionBuilder::new(storage.network());
        Self {
            storage,
            secrets,
            backend,
            builder,
            sessions: std::sync::Mutex::new(HashMap::new()),
            address_book: Mutex::new(()),
        }
    }

    /// Wire up file storage and an Electrum client from configuration.
    /// The client is returned too so the caller controls its `init`/`close`.
    pub fn with_electrum(
        config: &WalletConfig,
        secrets: Arc<dyn SecretStore>,
        preferences: Arc<dyn PreferenceStore>,
    ) -> (Self, Arc<ElectrumClient>) {
        let client = Arc::new(
            ElectrumClient::new(ClientConfig::from_wallet_config(config)).with_preferences(preferences),
        );
        let storage = Storage::new_with_base_dir(config.data_dir.clone(), config.network);
        let manager = Self::new(storage, secrets, client.clone());
        (manager, client)
    }

    pub fn network(&self) -> Network {
        self.storage.network()
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Fresh 12-word recovery phrase
    pub fn generate_mnemonic() -> Result<String, WalletError> {
        Ok(KeyManager::generate_mnemonic()?.to_string())
    }

    /// Create a wallet with a newly generated phrase. Returns the record and the phrase for backup.
    pub fn create_wallet(&self, name: Option<&str>) -> Result<(WalletRecord, String), WalletError> {
        let phrase = Self::generate_mnemonic()?;
        let record = self.import_wallet(name, &phrase)?;
        Ok((record, phrase))
    }

    /// Store a wallet for an existing recovery phrase
    pub fn import_wallet(&self, name: Option<&str>, phrase: &str) -> Result<WalletRecord, WalletError> {
        let mnemonic = KeyManager::parse_mnemonic(phrase)?;
        // Derive once up front so a bad phrase never produces a wallet row
        AccountKeys::from_mnemonic(&mnemonic, self.network())?;

        let name = match name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => name.to_string(),
            None => format!("Wallet {}", self.storage.list_wallets()?.len() + 1),
        };
        let record = WalletRecord {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            network: network_name(self.network()).to_string(),
            change_address_index: 0,
            next_utxo_count: 1,
            created_at: Utc::now(),
            last_refreshed: None,
        };

        self.storage.create_wallet(&record)?;
        if let Err(e) = self
            .secrets
            .set_secret(&mnemonic_key(&record.id), mnemonic.to_string().as_bytes())
        {
            let _ = self.storage.delete_wallet(&record.id);
            return Err(e.into());
        }

        log::info!("Created wallet '{}' ({}) on {}", record.name, record.id, record.network);
        Ok(record)
    }

    pub fn list_wallets(&self) -> Result<Vec<WalletRecord>, WalletError> {
        Ok(self.storage.list_wallets()?)
    }

    pub fn get_wallet(&self, id: &str) -> Result<WalletRecord, WalletError> {
        if !self.storage.wallet_exists(id) {
            return Err(WalletError::WalletNotFound(id.to_string()));
        }
        Ok(self.storage.load_wallet(id)?)
    }

    pub fn rename_wallet(&self, id: &str, name: &str) -> Result<WalletRecord, WalletError> {
        self.get_wallet(id)?;
        Ok(self.storage.update_wallet(id, |r| r.name = name.trim().to_string())?)
    }

    /// Delete the wallet, all of its rows and its recovery phrase
    pub async fn remove_wallet(&self, id: &str) -> Result<(), WalletError> {
        let slot = self.slot(id)?;
        let mut session = slot.lock().await;
        self.get_wallet(id)?;

        self.storage.delete_wallet(id)?;
        self.secrets.delete_secret(&mnemonic_key(id))?;
        *session = None;
        self.lock_sessions().remove(id);
        log::info!("Removed wallet {}", id);
        Ok(())
    }

    pub fn reveal_mnemonic(&self, id: &str) -> Result<String, WalletError> {
        self.get_wallet(id)?;
        let bytes = self
            .secrets
            .get_secret(&mnemonic_key(id))?
            .ok_or_else(|| WalletError::SecretNotFound(id.to_string()))?;
        String::from_utf8(bytes).map_err(|e| WalletError::Internal(format!("corrupt secret: {}", e)))
    }

    /// Derive the initial address windows and fetch their stats
    pub async fn bootstrap(&self, id: &str) -> Result<RefreshReport, WalletError> {
        let slot = self.slot(id)?;
        let mut guard = slot.lock().await;
        let session = self.session(&mut guard, id)?;
        session.ledger.bootstrap(&self.storage, self.backend.as_ref()).await
    }

    pub async fn refresh(&self, id: &str) -> Result<RefreshReport, WalletError> {
        let slot = self.slot(id)?;
        let mut guard = slot.lock().await;
        let session = self.session(&mut guard, id)?;
        session.ledger.refresh(&self.storage, self.backend.as_ref()).await
    }

    pub async fn balance(&self, id: &str) -> Result<WalletBalance, WalletError> {
        let slot = self.slot(id)?;
        let mut guard = slot.lock().await;
        let session = self.session(&mut guard, id)?;
        Ok(WalletBalance {
            total: session.ledger.balance(),
            last_refreshed: session.ledger.last_refreshed(),
        })
    }

    pub async fn addresses(&self, id: &str, chain: Chain) -> Result<Vec<AddressInfo>, WalletError> {
        let slot = self.slot(id)?;
        let mut guard = slot.lock().await;
        Ok(self.session(&mut guard, id)?.ledger.address_info(chain))
    }

    /// Lowest unused receive address
    pub async fn receive_address(&self, id: &str) -> Result<DerivedAddress, WalletError> {
        let slot = self.slot(id)?;
        let mut guard = slot.lock().await;
        let session = self.session(&mut guard, id)?;
        session.ledger.default_receive_address(&self.storage)
    }

    /// Next address of the rotating receive window
    pub async fn next_receive_address(&self, id: &str) -> Result<DerivedAddress, WalletError> {
        let slot = self.slot(id)?;
        let mut guard = slot.lock().await;
        let session = self.session(&mut guard, id)?;
        session.ledger.next_display_address(&self.storage)
    }

    /// Re-fetch UTXOs for the ledger's target addresses and reconcile labels
    pub async fn sync_utxos(&self, id: &str) -> Result<Vec<Utxo>, WalletError> {
        let slot = self.slot(id)?;
        let mut guard = slot.lock().await;
        let session = self.session(&mut guard, id)?;

        let targets = session.ledger.utxo_targets();
        let remote = fetch_remote_utxos(self.backend.as_ref(), &targets).await?;
        session.utxos.sync(&self.storage, remote)?;
        Ok(session.utxos.utxos().to_vec())
    }

    pub async fn utxos(&self, id: &str) -> Result<Vec<Utxo>, WalletError> {
        let slot = self.slot(id)?;
        let mut guard = slot.lock().await;
        Ok(self.session(&mut guard, id)?.utxos.utxos().to_vec())
    }

    pub async fn update_utxo_label(
        &self,
        id: &str,
        txid: &Txid,
        vout: u32,
        label: &str,
    ) -> Result<(), WalletError> {
        let slot = self.slot(id)?;
        let mut guard = slot.lock().await;
        let session = self.session(&mut guard, id)?;
        session.utxos.update_label(&self.storage, txid, vout, label)
    }

    pub async fn sync_history(&self, id: &str) -> Result<Vec<TransactionRow>, WalletError> {
        let slot = self.slot(id)?;
        let mut guard = slot.lock().await;
        let session = self.session(&mut guard, id)?;
        sync_history(&self.storage, self.backend.as_ref(), &session.ledger).await
    }

    /// Stored history: pending first, then newest first
    pub fn transactions(&self, id: &str) -> Result<Vec<TransactionRow>, WalletError> {
        self.get_wallet(id)?;
        Ok(self.storage.load_transactions(id)?)
    }

    pub async fn fee_estimates(&self) -> Result<FeeEstimates, WalletError> {
        Ok(self.backend.fee_estimates().await?)
    }

    pub async fn tip_height(&self) -> Result<u32, WalletError> {
        Ok(self.backend.tip().await?.height)
    }

    /// Parse a recipient address for the active network
    pub fn validate_address(&self, address: &str) -> Result<Address, WalletError> {
        validate_address(address, self.network())
    }

    /// Coin selection and fee/change decision without signing
    pub async fn prepare_send(
        &self,
        id: &str,
        recipient: &str,
        amount: u64,
        fee_rate: f64,
        selection: &CoinSelection,
    ) -> Result<SendPreview, WalletError> {
        let slot = self.slot(id)?;
        let mut guard = slot.lock().await;
        let session = self.session(&mut guard, id)?;
        self.preview(session, recipient, amount, fee_rate, selection)
    }

    /// Build and sign a spend. The change index is not advanced here; pass
    /// `used_change_index` to `increment_change_index` once the spend is final.
    pub async fn create_and_sign(
        &self,
        id: &str,
        recipient: &str,
        amount: u64,
        fee_rate: f64,
        selection: &CoinSelection,
    ) -> Result<SignedTransaction, WalletError> {
        let slot = self.slot(id)?;
        let mut guard = slot.lock().await;
        let session = self.session(&mut guard, id)?;
        self.sign_preview(id, session, recipient, amount, fee_rate, selection)
    }

    pub async fn broadcast(&self, signed: &SignedTransaction) -> Result<Txid, WalletError> {
        Ok(self.backend.broadcast(&signed.tx).await?)
    }

    /// Build, sign, broadcast, then advance the change index if change was used
    pub async fn send(
        &self,
        id: &str,
        recipient: &str,
        amount: u64,
        fee_rate: f64,
        selection: &CoinSelection,
    ) -> Result<SendResult, WalletError> {
        let slot = self.slot(id)?;
        let mut guard = slot.lock().await;
        let session = self.session(&mut guard, id)?;

        let signed = self.sign_preview(id, session, recipient, amount, fee_rate, selection)?;
        let txid = self.backend.broadcast(&signed.tx).await?;

        let change_index_advanced = match signed.used_change_index {
            Some(used) => session.ledger.increment_change_index(&self.storage, used)?,
            None => false,
        };

        Ok(SendResult {
            txid,
            fee: signed.fee,
            used_change_index: signed.used_change_index,
            change_index_advanced,
        })
    }

    /// Compare-and-set advance of the change index
    pub async fn increment_change_index(&self, id: &str, used_index: u32) -> Result<bool, WalletError> {
        let slot = self.slot(id)?;
        let mut guard = slot.lock().await;
        let session = self.session(&mut guard, id)?;
        session.ledger.increment_change_index(&self.storage, used_index)
    }

    pub fn saved_addresses(&self, list: AddressList) -> Result<Vec<SavedAddress>, WalletError> {
        Ok(self.storage.load_saved_addresses(list)?)
    }

    pub async fn add_saved_address(
        &self,
        list: AddressList,
        address: &str,
        name: Option<&str>,
    ) -> Result<SavedAddress, WalletError> {
        let _guard = self.address_book.lock().await;
        address_book::add(&self.storage, list, address, name)
    }

    pub async fn rename_saved_address(
        &self,
        list: AddressList,
        id: &str,
        name: &str,
    ) -> Result<SavedAddress, WalletError> {
        let _guard = self.address_book.lock().await;
        self.storage
            .update_saved_address(list, id, |row| row.name = name.trim().to_string())?
            .ok_or_else(|| WalletError::AddressNotFound(id.to_string()))
    }

    pub async fn remove_saved_address(&self, list: AddressList, id: &str) -> Result<(), WalletError> {
        let _guard = self.address_book.lock().await;
        if !self.storage.remove_saved_address(list, id)? {
            return Err(WalletError::AddressNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Re-fetch balances of every entry in `list`
    pub async fn refresh_saved_addresses(
        &self,
        list: AddressList,
    ) -> Result<Vec<SavedAddress>, WalletError> {
        let _guard = self.address_book.lock().await;
        address_book::refresh_balances(&self.storage, self.backend.as_ref(), list).await
    }

    fn preview(
        &self,
        session: &WalletSession,
        recipient: &str,
        amount: u64,
        fee_rate: f64,
        selection: &CoinSelection,
    ) -> Result<SendPreview, WalletError> {
        let recipient = self.validate_address(recipient)?;
        let plan = self
            .builder
            .plan(session.utxos.utxos(), amount, fee_rate, selection)?;
        let change = match plan.change_value() {
            Some(_) => Some(session.ledger.change_output()?),
            None => None,
        };
        Ok(SendPreview {
            recipient,
            plan,
            change,
        })
    }

    fn sign_preview(
        &self,
        id: &str,
        session: &WalletSession,
        recipient: &str,
        amount: u64,
        fee_rate: f64,
        selection: &CoinSelection,
    ) -> Result<SignedTransaction, WalletError> {
        let preview = self.preview(session, recipient, amount, fee_rate, selection)?;
        let keys = self.account_keys(id)?;
        self.builder.sign(
            &preview.plan,
            &preview.recipient,
            preview.change.as_ref(),
            &keys,
            |address| session.ledger.resolve(address),
        )
    }

    fn account_keys(&self, id: &str) -> Result<AccountKeys, WalletError> {
        let phrase = self.reveal_mnemonic(id)?;
        let mnemonic = KeyManager::parse_mnemonic(&phrase)?;
        AccountKeys::from_mnemonic(&mnemonic, self.network())
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, SessionSlot>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Session slot of an existing wallet. Unknown ids never get an entry.
    fn slot(&self, id: &str) -> Result<SessionSlot, WalletError> {
        if !self.storage.wallet_exists(id) {
            return Err(WalletError::WalletNotFound(id.to_string()));
        }
        Ok(self
            .lock_sessions()
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone())
    }

    /// Load the wallet's session into `slot` on first use
    fn session<'a>(
        &self,
        slot: &'a mut Option<WalletSession>,
        id: &str,
    ) -> Result<&'a mut WalletSession, WalletError> {
        if slot.is_none() {
            let record = self.get_wallet(id)?;
            let xpub = self.account_keys(id)?.account_xpub();
            let ledger = AddressLedger::load(&self.storage, &record, xpub)?;
            let utxos = UtxoStore::load(&self.storage, id)?;
            *slot = Some(WalletSession { ledger, utxos });
        }
        slot.as_mut()
            .ok_or_else(|| WalletError::Internal(format!("session for {} not loaded", id)))
    }
}
