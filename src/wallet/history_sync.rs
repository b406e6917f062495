//! Transaction history sync for one wallet

use std::collections::{BTreeMap, BTreeSet, HashMap};

use bitcoin::{Transaction, Txid};

use super::backend::ChainBackend;
use super::ledger::AddressLedger;
use crate::bitcoin::history::{classify, index_outputs, parent_txids};
use crate::error::WalletError;
use crate::storage::models::parse_txid;
use crate::storage::{Storage, TransactionRow, UtxoStatus};

/// Fetch, classify and upsert every transaction touching an active address.
///
/// Per-address and per-transaction failures are logged and skipped; rows
/// already stored stay as they were. Returns the full stored history.
pub async fn sync_history(
    storage: &Storage,
    backend: &dyn ChainBackend,
    ledger: &AddressLedger,
) -> Result<Vec<TransactionRow>, WalletError> {
    let wallet_id = ledger.wallet_id();
    let targets = ledger.active_addresses();
    if targets.is_empty() {
        return Ok(storage.load_transactions(wallet_id)?);
    }

    // txid -> height, deduplicated across addresses
    let mut seen: BTreeMap<Txid, i64> = BTreeMap::new();
    for (address, result) in targets.iter().zip(backend.address_history(&targets).await) {
        match result {
            Ok(entries) => {
                for entry in entries {
                    let txid = parse_txid(&entry.tx_hash)?;
                    let height = seen.entry(txid).or_insert(entry.height);
                    *height = (*height).max(entry.height);
                }
            }
            Err(e) => log::warn!("History fetch for {} failed: {}", address, e),
        }
    }

    let stored: HashMap<Txid, TransactionRow> = storage
        .load_transactions(wallet_id)?
        .into_iter()
        .map(|row| (row.txid, row))
        .collect();

    // Confirmed rows with an unchanged height and a known block time need no refetch
    let wanted: Vec<(Txid, UtxoStatus)> = seen
        .into_iter()
        .map(|(txid, height)| (txid, UtxoStatus::from_height(height)))
        .filter(|(txid, status)| match stored.get(txid) {
            Some(row) => {
                row.content.status != *status
                    || status.height().is_none()
                    || row.block_time.is_none()
            }
            None => true,
        })
        .collect();
    if wanted.is_empty() {
        return Ok(storage.load_transactions(wallet_id)?);
    }

    let txids: Vec<Txid> = wanted.iter().map(|(txid, _)| *txid).collect();
    let mut fetched: HashMap<Txid, Transaction> = HashMap::new();
    for (txid, result) in txids.iter().zip(backend.transactions(&txids).await) {
        match result {
            Ok(tx) => {
                fetched.insert(*txid, tx);
            }
            Err(e) => log::warn!("Transaction {} unavailable: {}", txid, e),
        }
    }

    let own: Vec<Transaction> = fetched.values().cloned().collect();
    let parents: Vec<Txid> = parent_txids(&own)
        .into_iter()
        .filter(|txid| !fetched.contains_key(txid))
        .collect();
    let mut parent_txs = Vec::new();
    for (txid, result) in parents.iter().zip(backend.transactions(&parents).await) {
        match result {
            Ok(tx) => parent_txs.push(tx),
            Err(e) => log::warn!("Parent transaction {} unavailable, inputs left unknown: {}", txid, e),
        }
    }
    let prevouts = index_outputs(own.iter().chain(parent_txs.iter()));

    let heights: Vec<u32> = wanted
        .iter()
        .filter_map(|(_, status)| status.height())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let mut block_times: HashMap<u32, i64> = HashMap::new();
    for (height, result) in heights.iter().zip(backend.block_headers(&heights).await) {
        match result {
            Ok(header) => {
                block_times.insert(*height, header.time as i64);
            }
            Err(e) => log::warn!("Header at {} unavailable: {}", height, e),
        }
    }

    let wallet_addresses = ledger.wallet_addresses();
    let network_name = storage.network_name().to_string();
    let rows: Vec<TransactionRow> = wanted
        .into_iter()
        .filter_map(|(txid, status)| {
            let tx = fetched.get(&txid)?;
            let block_time = status.height().and_then(|h| block_times.get(&h).copied());
            let record = classify(
                tx,
                &prevouts,
                &wallet_addresses,
                ledger.network(),
                status,
                block_time,
            );
            Some(TransactionRow {
                txid,
                wallet_id: wallet_id.to_string(),
                content: record,
                block_time,
                network: network_name.clone(),
            })
        })
        .collect();

    log::info!("Upserting {} transaction(s) for wallet {}", rows.len(), wallet_id);
    storage.upsert_transactions(wallet_id, rows)?;
    Ok(storage.load_transactions(wallet_id)?)
}
