//! Saved and tracked addresses
//!
//! Both lists hold named watch-only addresses of the active network. Neither
//! belongs to a wallet and nothing here ever touches keys.

use std::collections::HashMap;

use chrono::Utc;

use super::backend::ChainBackend;
use crate::bitcoin::network::validate_address;
use crate::error::WalletError;
use crate::storage::{AddressList, SavedAddress, Storage};

/// Validate `address` for the storage network and append it to `list`
pub fn add(
    storage: &Storage,
    list: AddressList,
    address: &str,
    name: Option<&str>,
) -> Result<SavedAddress, WalletError> {
    let address = validate_address(address.trim(), storage.network())?;
    let item = SavedAddress {
        id: uuid::Uuid::new_v4().to_string(),
        address: address.to_string(),
        name: name.map(str::trim).unwrap_or_default().to_string(),
        balance: 0,
        last_updated: None,
        network: storage.network_name().to_string(),
    };
    storage.add_saved_address(list, &item)?;
    log::info!("Added {} to {:?} addresses", item.address, list);
    Ok(item)
}

/// Fetch current balances for every entry of `list`.
///
/// An entry whose fetch fails keeps its previous balance and timestamp.
pub async fn refresh_balances(
    storage: &Storage,
    backend: &dyn ChainBackend,
    list: AddressList,
) -> Result<Vec<SavedAddress>, WalletError> {
    let rows = storage.load_saved_addresses(list)?;
    let mut ids = Vec::with_capacity(rows.len());
    let mut addresses = Vec::with_capacity(rows.len());
    for row in &rows {
        match validate_address(&row.address, storage.network()) {
            Ok(address) => {
                ids.push(row.id.clone());
                addresses.push(address);
            }
            Err(e) => log::warn!("Skipping stored address {}: {}", row.address, e),
        }
    }
    if addresses.is_empty() {
        return Ok(rows);
    }

    let refreshed_at = Utc::now();
    let mut balances = HashMap::new();
    for ((id, address), result) in ids
        .into_iter()
        .zip(&addresses)
        .zip(backend.address_stats(&addresses).await)
    {
        match result {
            Ok(stats) => {
                balances.insert(id, stats.balance);
            }
            Err(e) => log::warn!("Keeping previous balance for {}: {}", address, e),
        }
    }

    let rows = storage.update_saved_addresses(list, |row| {
        if let Some(balance) = balances.get(&row.id) {
            row.balance = *balance;
            row.last_updated = Some(refreshed_at);
        }
    })?;
    Ok(rows)
}
