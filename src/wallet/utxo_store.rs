//! Spendable outputs of one wallet and their labels
//!
//! A sync replaces the whole set. Labels survive by `(txid, vout)`; outputs
//! seen for the first time get `UTXO #n` from the wallet's monotonic counter.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use bitcoin::{Address, OutPoint, Txid};

use super::backend::ChainBackend;
use crate::error::WalletError;
use crate::storage::models::parse_txid;
use crate::storage::{RemoteUtxo, Storage, Utxo, UtxoRow, UtxoStatus, WalletAddress};

/// Default label for the `n`th output a wallet has seen
pub fn default_label(n: u64) -> String {
    format!("UTXO #{}", n)
}

/// Height ascending with unconfirmed last, then txid and vout ascending
fn label_order(a: &RemoteUtxo, b: &RemoteUtxo) -> Ordering {
    a.status
        .label_order(&b.status)
        .then_with(|| a.txid.to_string().cmp(&b.txid.to_string()))
        .then_with(|| a.vout.cmp(&b.vout))
}

/// Carry labels over from `existing` and number the rest from `next_counter`.
/// Returns the labelled set (in label order) and the advanced counter.
pub fn assign_labels(
    existing: &HashMap<OutPoint, String>,
    mut remote: Vec<RemoteUtxo>,
    next_counter: u64,
) -> (Vec<Utxo>, u64) {
    remote.sort_by(label_order);

    let mut counter = next_counter;
    let utxos = remote
        .into_iter()
        .map(|r| {
            let label = match existing.get(&r.outpoint()) {
                Some(label) => label.clone(),
                None => {
                    let label = default_label(counter);
                    counter += 1;
                    label
                }
            };
            Utxo {
                txid: r.txid,
                vout: r.vout,
                address: r.address,
                value: r.value,
                status: r.status,
                label,
            }
        })
        .collect();
    (utxos, counter)
}

/// Query the backend for unspent outputs of `addresses`.
///
/// Any failed address aborts the whole fetch; a partial set would make the
/// following sync drop outputs that still exist.
pub async fn fetch_remote_utxos(
    backend: &dyn ChainBackend,
    addresses: &[Address],
) -> Result<Vec<RemoteUtxo>, WalletError> {
    let results = backend.list_unspent(addresses).await;

    let mut seen = HashSet::new();
    let mut utxos = Vec::new();
    for (address, result) in addresses.iter().zip(results) {
        let entries = result.map_err(|e| {
            log::warn!("UTXO fetch for {} failed, aborting sync: {}", address, e);
            WalletError::from(e)
        })?;
        for entry in entries {
            let txid = parse_txid(&entry.tx_hash)?;
            if !seen.insert(OutPoint::new(txid, entry.tx_pos)) {
                continue;
            }
            utxos.push(RemoteUtxo {
                txid,
                vout: entry.tx_pos,
                address: WalletAddress::from(address),
                value: entry.value,
                status: UtxoStatus::from_height(entry.height),
            });
        }
    }
    Ok(utxos)
}

#[derive(Debug, Clone)]
pub struct UtxoStore {
    wallet_id: String,
    network_name: String,
    utxos: Vec<Utxo>,
}

impl UtxoStore {
    pub fn load(storage: &Storage, wallet_id: &str) -> Result<Self, WalletError> {
        let utxos = storage
            .load_utxos(wallet_id)?
            .into_iter()
            .map(UtxoRow::into_utxo)
            .collect();
        Ok(Self {
            wallet_id: wallet_id.to_string(),
            network_name: storage.network_name().to_string(),
            utxos,
        })
    }

    pub fn utxos(&self) -> &[Utxo] {
        &self.utxos
    }

    pub fn balance(&self) -> u64 {
        self.utxos.iter().map(|u| u.value).sum()
    }

    /// Replace the set with `remote`, keeping labels. Returns the new label counter.
    pub fn sync(&mut self, storage: &Storage, remote: Vec<RemoteUtxo>) -> Result<u64, WalletError> {
        let existing: HashMap<OutPoint, String> = storage
            .load_utxos(&self.wallet_id)?
            .into_iter()
            .map(|row| (OutPoint::new(row.txid, row.vout), row.label))
            .collect();

        let record = storage.load_wallet(&self.wallet_id)?;
        let (utxos, counter) = assign_labels(&existing, remote, record.next_utxo_count);
        let new_labels = counter - record.next_utxo_count;

        // Counter first: a crash in between skips label numbers but never reuses one
        if counter != record.next_utxo_count {
            storage.update_wallet(&self.wallet_id, |r| {
                r.next_utxo_count = r.next_utxo_count.max(counter);
            })?;
        }
        let rows: Vec<UtxoRow> = utxos.iter().map(|u| self.row(u)).collect();
        storage.replace_utxos(&self.wallet_id, &rows)?;

        log::info!(
            "Synced {} UTXO(s) for wallet {} ({} newly labelled)",
            utxos.len(),
            self.wallet_id,
            new_labels
        );
        self.utxos = utxos;
        Ok(counter)
    }

    /// Out-of-band label edit for one output
    pub fn update_label(
        &mut self,
        storage: &Storage,
        txid: &Txid,
        vout: u32,
        label: &str,
    ) -> Result<(), WalletError> {
        if !storage.update_utxo_label(&self.wallet_id, txid, vout, label)? {
            return Err(WalletError::UtxoNotFound(format!("{}:{}", txid, vout)));
        }
        for utxo in self.utxos.iter_mut().filter(|u| &u.txid == txid && u.vout == vout) {
            utxo.label = label.to_string();
        }
        Ok(())
    }

    fn row(&self, utxo: &Utxo) -> UtxoRow {
        UtxoRow {
            txid: utxo.txid,
            vout: utxo.vout,
            wallet_id: self.wallet_id.clone(),
            address: utxo.address.clone(),
            value: utxo.value,
            label: utxo.label.clone(),
            status: utxo.status,
            network: self.network_name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::Network;
    use std::str::FromStr;

    fn remote(txid_byte: u8, vout: u32, status: UtxoStatus) -> RemoteUtxo {
        let address = crate::bitcoin::network::validate_address(
            "tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx",
            Network::Testnet,
        )
        .unwrap();
        RemoteUtxo {
            txid: Txid::from_str(&format!("{:02x}", txid_byte).repeat(32)).unwrap(),
            vout,
            address: WalletAddress::from(address),
            value: 10_000,
            status,
        }
    }

    #[test]
    fn test_new_labels_follow_height_then_txid_then_vout() {
        let pending = remote(0x01, 0, UtxoStatus::Unconfirmed);
        let high = remote(0x02, 0, UtxoStatus::Confirmed { height: 200 });
        let low_b = remote(0x0b, 1, UtxoStatus::Confirmed { height: 100 });
        let low_a1 = remote(0x0a, 1, UtxoStatus::Confirmed { height: 100 });
        let low_a0 = remote(0x0a, 0, UtxoStatus::Confirmed { height: 100 });

        let (utxos, counter) = assign_labels(
            &HashMap::new(),
            vec![pending, high, low_b, low_a1, low_a0],
            1,
        );
        let labels: Vec<(String, u32, String)> = utxos
            .iter()
            .map(|u| (u.txid.to_string()[..2].to_string(), u.vout, u.label.clone()))
            .collect();
        assert_eq!(
            labels,
            vec![
                ("0a".into(), 0, "UTXO #1".into()),
                ("0a".into(), 1, "UTXO #2".into()),
                ("0b".into(), 1, "UTXO #3".into()),
                ("02".into(), 0, "UTXO #4".into()),
                ("01".into(), 0, "UTXO #5".into()),
            ]
        );
        assert_eq!(counter, 6);
    }

    #[test]
    fn test_existing_labels_survive_and_counter_only_moves_for_new() {
        let kept = remote(0x05, 0, UtxoStatus::Confirmed { height: 10 });
        let fresh = remote(0x06, 0, UtxoStatus::Confirmed { height: 11 });
        let mut existing = HashMap::new();
        existing.insert(kept.outpoint(), "savings".to_string());

        let (utxos, counter) = assign_labels(&existing, vec![fresh, kept], 7);
        assert_eq!(utxos[0].label, "savings");
        assert_eq!(utxos[1].label, "UTXO #7");
        assert_eq!(counter, 8);

        let (_, unchanged) = assign_labels(&existing, vec![remote(0x05, 0, UtxoStatus::Unconfirmed)], 8);
        assert_eq!(unchanged, 8);
    }
}
