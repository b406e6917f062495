//! Address ledger: derived receive/change addresses, their cached stats and
//! the gap-limit bookkeeping.
//!
//! Every mutation works on a copy, persists it, and only then replaces the
//! live state, so memory and disk never disagree.

use std::collections::{HashMap, HashSet};

use bitcoin::{Address, Network};
use chrono::{DateTime, Utc};

use super::backend::ChainBackend;
use super::keys::{AccountXpub, Chain};
use crate::bitcoin::transaction::ChangeOutput;
use crate::error::WalletError;
use crate::storage::{AddressInfo, AddressRow, DerivedAddress, Storage, WalletAddress, WalletRecord};

/// Unused receive addresses kept ahead of the last used one
pub const GAP_LIMIT: u32 = 20;

/// Bound on discovery passes when a server reports every new address as used
const MAX_DISCOVERY_ROUNDS: usize = 50;

/// Outcome of one refresh pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshReport {
    /// Addresses whose stats were fetched and merged
    pub updated: usize,
    /// Addresses whose fetch failed; their previous values were kept
    pub failed: usize,
    /// Addresses derived during this pass
    pub derived: usize,
    pub refreshed_at: DateTime<Utc>,
}

impl RefreshReport {
    /// True when some balances shown are older than `refreshed_at`
    pub fn is_stale(&self) -> bool {
        self.failed > 0
    }
}

#[derive(Clone)]
pub struct AddressLedger {
    wallet_id: String,
    network_name: String,
    xpub: AccountXpub,
    /// Position == derivation index
    receive: Vec<Address>,
    change: Vec<Address>,
    lookup: HashMap<WalletAddress, (Chain, u32)>,
    cache: HashMap<WalletAddress, AddressInfo>,
    change_index: u32,
    display_index: Option<u32>,
    last_refreshed: Option<DateTime<Utc>>,
}

impl AddressLedger {
    /// Load persisted rows, re-deriving each one to confirm it belongs to `xpub`
    pub fn load(
        storage: &Storage,
        wallet: &WalletRecord,
        xpub: AccountXpub,
    ) -> Result<Self, WalletError> {
        let mut ledger = Self {
            wallet_id: wallet.id.clone(),
            network_name: storage.network_name().to_string(),
            xpub,
            receive: Vec::new(),
            change: Vec::new(),
            lookup: HashMap::new(),
            cache: HashMap::new(),
            change_index: wallet.change_address_index,
            display_index: None,
            last_refreshed: wallet.last_refreshed,
        };

        let rows = storage.load_addresses(&wallet.id)?;
        for chain in [Chain::Receive, Chain::Change] {
            let count = rows
                .iter()
                .filter(|r| r.chain == chain)
                .map(|r| r.index + 1)
                .max()
                .unwrap_or(0);
            ledger.derive_to(chain, count)?;
        }

        for row in rows {
            match ledger.lookup.get(&row.address) {
                Some(&(chain, index)) if chain == row.chain && index == row.index => {
                    ledger.cache.insert(
                        row.address.clone(),
                        AddressInfo {
                            address: row.address,
                            index: row.index,
                            balance: row.balance,
                            tx_count: row.tx_count,
                        },
                    );
                }
                _ => {
                    return Err(WalletError::derivation(
                        format!("{}/{}", row.chain.number(), row.index),
                        format!("stored address {} does not match derivation", row.address),
                    ))
                }
            }
        }

        log::debug!(
            "Loaded ledger for wallet {}: {} receive, {} change",
            ledger.wallet_id,
            ledger.receive.len(),
            ledger.change.len()
        );
        Ok(ledger)
    }

    pub fn wallet_id(&self) -> &str {
        &self.wallet_id
    }

    pub fn network(&self) -> Network {
        self.xpub.network()
    }

    pub fn change_index(&self) -> u32 {
        self.change_index
    }

    pub fn last_refreshed(&self) -> Option<DateTime<Utc>> {
        self.last_refreshed
    }

    /// Derive the initial receive and change windows, then refresh
    pub async fn bootstrap(
        &mut self,
        storage: &Storage,
        backend: &dyn ChainBackend,
    ) -> Result<RefreshReport, WalletError> {
        let mut next = self.clone();
        next.derive_to(Chain::Receive, GAP_LIMIT)?;
        next.derive_to(Chain::Change, GAP_LIMIT.max(next.change_index + 2))?;
        next.persist(storage)?;
        *self = next;

        self.refresh(storage, backend).await
    }

    /// Re-fetch stats for every derived address and extend the receive chain.
    ///
    /// A failed fetch keeps the previous cached value. Rows are never removed
    /// and the chain never shrinks.
    pub async fn refresh(
        &mut self,
        storage: &Storage,
        backend: &dyn ChainBackend,
    ) -> Result<RefreshReport, WalletError> {
        let mut next = self.clone();
        let before = next.receive.len() + next.change.len();
        let mut updated = 0;
        let mut failed = 0;

        let mut pending: Vec<Address> = next.receive.iter().chain(next.change.iter()).cloned().collect();
        let mut rounds = 0;
        while !pending.is_empty() {
            rounds += 1;
            if rounds > MAX_DISCOVERY_ROUNDS {
                log::warn!(
                    "Stopping address discovery for wallet {} after {} rounds",
                    next.wallet_id,
                    MAX_DISCOVERY_ROUNDS
                );
                break;
            }
            let results = backend.address_stats(&pending).await;
            for (address, result) in pending.iter().zip(results) {
                match result {
                    Ok(stats) => {
                        next.merge(address, stats.balance, stats.tx_count);
                        updated += 1;
                    }
                    Err(e) => {
                        log::warn!("Keeping cached stats for {}: {}", address, e);
                        failed += 1;
                    }
                }
            }

            // Newly derived addresses may themselves be used (e.g. a restored
            // wallet), so keep scanning until the window is clean
            let receive_before = next.receive.len();
            next.extend_receive_window()?;
            pending = next.receive[receive_before..].to_vec();
        }
        next.derive_to(Chain::Change, GAP_LIMIT.max(next.change_index + 2))?;

        let refreshed_at = Utc::now();
        next.last_refreshed = Some(refreshed_at);
        next.persist(storage)?;
        storage.update_wallet(&next.wallet_id, |record| {
            record.last_refreshed = Some(refreshed_at)
        })?;
        let derived = next.receive.len() + next.change.len() - before;
        *self = next;

        let report = RefreshReport {
            updated,
            failed,
            derived,
            refreshed_at,
        };
        if report.is_stale() {
            log::warn!(
                "Refresh of wallet {} incomplete: {} of {} address(es) failed",
                self.wallet_id,
                failed,
                updated + failed
            );
        } else {
            log::info!(
                "Refreshed wallet {}: {} address(es), balance {} sats",
                self.wallet_id,
                updated,
                self.balance()
            );
        }
        Ok(report)
    }

    /// Highest receive index with any transactions
    pub fn last_used_index(&self) -> Option<u32> {
        self.receive
            .iter()
            .enumerate()
            .rev()
            .find(|(_, address)| self.tx_count(address) > 0)
            .map(|(index, _)| index as u32)
    }

    /// Lowest unused receive index, or one past the end if all are used
    pub fn first_unused_index(&self) -> u32 {
        self.receive
            .iter()
            .position(|address| self.tx_count(address) == 0)
            .unwrap_or(self.receive.len()) as u32
    }

    /// The wallet's default receive address
    pub fn default_receive_address(&mut self, storage: &Storage) -> Result<DerivedAddress, WalletError> {
        let index = self.first_unused_index();
        if index as usize >= self.receive.len() {
            let mut next = self.clone();
            next.derive_to(Chain::Receive, index + 1)?;
            next.persist(storage)?;
            *self = next;
        }
        self.derived(Chain::Receive, index)
    }

    /// Advance the display pointer over `[last_used + 1, last_used + GAP_LIMIT]`,
    /// wrapping to the start of the window
    pub fn next_display_address(&mut self, storage: &Storage) -> Result<DerivedAddress, WalletError> {
        let start = self.last_used_index().map_or(0, |i| i + 1);
        let end = start + GAP_LIMIT - 1;

        if self.receive.len() < (end + 1) as usize {
            let mut next = self.clone();
            next.derive_to(Chain::Receive, end + 1)?;
            next.persist(storage)?;
            *self = next;
        }

        let index = match self.display_index {
            Some(current) if current >= start && current < end => current + 1,
            _ => start,
        };
        self.display_index = Some(index);
        self.derived(Chain::Receive, index)
    }

    /// Compare-and-set on the change index: advances by one only if
    /// `used_index` is the current index. Returns whether it advanced.
    pub fn increment_change_index(
        &mut self,
        storage: &Storage,
        used_index: u32,
    ) -> Result<bool, WalletError> {
        let mut advanced = false;
        let record = storage.update_wallet(&self.wallet_id, |record| {
            if record.change_address_index == used_index {
                record.change_address_index = used_index + 1;
                advanced = true;
            }
        })?;

        let mut next = self.clone();
        next.change_index = record.change_address_index;
        next.derive_to(Chain::Change, GAP_LIMIT.max(next.change_index + 2))?;
        next.persist(storage)?;
        *self = next;

        if advanced {
            log::info!(
                "Wallet {} change index advanced to {}",
                self.wallet_id,
                self.change_index
            );
        } else {
            log::debug!(
                "Change index of wallet {} left at {} (used {})",
                self.wallet_id,
                self.change_index,
                used_index
            );
        }
        Ok(advanced)
    }

    /// Change address at the current change index
    pub fn change_output(&self) -> Result<ChangeOutput, WalletError> {
        let index = self.change_index;
        let address = match self.change.get(index as usize) {
            Some(address) => address.clone(),
            None => self.xpub.derive(Chain::Change, index)?.address,
        };
        Ok(ChangeOutput { address, index })
    }

    /// Owning chain and index of a wallet address
    pub fn resolve(&self, address: &WalletAddress) -> Option<(Chain, u32)> {
        self.lookup.get(address).copied()
    }

    pub fn wallet_addresses(&self) -> HashSet<WalletAddress> {
        self.lookup.keys().cloned().collect()
    }

    pub fn addresses(&self, chain: Chain) -> Vec<DerivedAddress> {
        self.chain(chain)
            .iter()
            .enumerate()
            .map(|(index, address)| DerivedAddress {
                chain,
                index: index as u32,
                address: WalletAddress::from(address),
            })
            .collect()
    }

    /// Cached stats for a chain, in index order; unfetched addresses read as zero
    pub fn address_info(&self, chain: Chain) -> Vec<AddressInfo> {
        self.addresses(chain)
            .into_iter()
            .map(|derived| {
                self.cache
                    .get(&derived.address)
                    .cloned()
                    .unwrap_or(AddressInfo {
                        address: derived.address,
                        index: derived.index,
                        balance: 0,
                        tx_count: 0,
                    })
            })
            .collect()
    }

    pub fn balance(&self) -> i64 {
        self.cache.values().map(|info| info.balance).sum()
    }

    /// Addresses worth asking for UTXOs: funded receive addresses plus change
    /// addresses up to one past the current change index
    pub fn utxo_targets(&self) -> Vec<Address> {
        let funded_receive = self
            .receive
            .iter()
            .filter(|address| self.cached(address).is_some_and(|info| info.balance != 0));
        let change = self
            .change
            .iter()
            .take(self.change_index as usize + 2);
        funded_receive.chain(change).cloned().collect()
    }

    /// Addresses with at least one transaction
    pub fn active_addresses(&self) -> Vec<Address> {
        self.receive
            .iter()
            .chain(self.change.iter())
            .filter(|address| self.tx_count(address) > 0)
            .cloned()
            .collect()
    }

    fn chain(&self, chain: Chain) -> &Vec<Address> {
        match chain {
            Chain::Receive => &self.receive,
            Chain::Change => &self.change,
        }
    }

    fn derived(&self, chain: Chain, index: u32) -> Result<DerivedAddress, WalletError> {
        let address = self.chain(chain).get(index as usize).ok_or_else(|| {
            WalletError::derivation(format!("{}/{}", chain.number(), index), "not derived")
        })?;
        Ok(DerivedAddress {
            chain,
            index,
            address: WalletAddress::from(address),
        })
    }

    fn cached(&self, address: &Address) -> Option<&AddressInfo> {
        self.cache.get(&WalletAddress::from(address))
    }

    fn tx_count(&self, address: &Address) -> u64 {
        self.cached(address).map_or(0, |info| info.tx_count)
    }

    /// Derive until the chain holds `count` addresses. Never shrinks.
    fn derive_to(&mut self, chain: Chain, count: u32) -> Result<usize, WalletError> {
        let start = self.chain(chain).len() as u32;
        if start >= count {
            return Ok(0);
        }
        let keys = self.xpub.derive_range(chain, start, count - start)?;
        for key in &keys {
            self.lookup
                .insert(WalletAddress::from(&key.address), (chain, key.index));
        }
        let addresses = keys.into_iter().map(|key| key.address);
        match chain {
            Chain::Receive => self.receive.extend(addresses),
            Chain::Change => self.change.extend(addresses),
        }
        log::debug!(
            "Derived {} {} address(es) for wallet {} ({}..{})",
            count - start,
            chain,
            self.wallet_id,
            start,
            count
        );
        Ok((count - start) as usize)
    }

    /// Keep `GAP_LIMIT` receive addresses beyond the last used one
    fn extend_receive_window(&mut self) -> Result<usize, WalletError> {
        let target = self.last_used_index().map_or(0, |i| i + 1) + GAP_LIMIT;
        self.derive_to(Chain::Receive, target)
    }

    fn merge(&mut self, address: &Address, balance: i64, tx_count: u64) {
        let key = WalletAddress::from(address);
        let Some(&(_, index)) = self.lookup.get(&key) else {
            return;
        };
        // A lagging server must not make a used address look fresh again
        let tx_count = self
            .cache
            .get(&key)
            .map_or(tx_count, |previous| previous.tx_count.max(tx_count));
        self.cache.insert(
            key.clone(),
            AddressInfo {
                address: key,
                index,
                balance,
                tx_count,
            },
        );
    }

    fn persist(&self, storage: &Storage) -> Result<(), WalletError> {
        let mut rows = Vec::with_capacity(self.receive.len() + self.change.len());
        for chain in [Chain::Receive, Chain::Change] {
            for info in self.address_info(chain) {
                rows.push(AddressRow {
                    address: info.address,
                    wallet_id: self.wallet_id.clone(),
                    chain,
                    index: info.index,
                    balance: info.balance,
                    tx_count: info.tx_count,
                    network: self.network_name.clone(),
                });
            }
        }
        storage.save_addresses(&self.wallet_id, &rows)?;
        Ok(())
    }
}
