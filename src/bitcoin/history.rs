//! Transaction history classification
//!
//! A transaction is judged from the wallet's point of view by comparing the
//! value it spends from wallet addresses with the value it pays back to them.

use std::collections::{BTreeSet, HashMap, HashSet};

use bitcoin::{Address, Network, OutPoint, Transaction, TxOut, Txid};
use serde::{Deserialize, Serialize};

use crate::storage::models::{UtxoStatus, WalletAddress};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxType {
    Send,
    Receive,
    Internal,
}

/// Input with its spent output, when the parent transaction could be fetched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryInput {
    pub prev_txid: Txid,
    pub prev_vout: u32,
    /// `None` when the parent transaction was unavailable
    pub value: Option<u64>,
    pub address: Option<WalletAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryOutput {
    pub value: u64,
    /// `None` for scripts without an address form (OP_RETURN and the like)
    pub address: Option<WalletAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub txid: Txid,
    pub inputs: Vec<HistoryInput>,
    pub outputs: Vec<HistoryOutput>,
    pub status: UtxoStatus,
    pub block_time: Option<i64>,
    pub tx_type: TxType,
    /// Sats moved from the wallet's perspective; the fee for internal transfers
    pub amount: u64,
    /// Known only when every input was resolved
    pub fee: Option<u64>,
    pub vsize: u64,
}

impl HistoryRecord {
    pub fn is_pending(&self) -> bool {
        self.status.height().is_none()
    }
}

/// Parent txids whose outputs are needed to value the inputs of `txs`
pub fn parent_txids(txs: &[Transaction]) -> Vec<Txid> {
    let parents: BTreeSet<Txid> = txs
        .iter()
        .flat_map(|tx| tx.input.iter())
        .map(|input| input.previous_output)
        .filter(|outpoint| !outpoint.is_null())
        .map(|outpoint| outpoint.txid)
        .collect();
    parents.into_iter().collect()
}

/// Index every output of the given parents by outpoint
pub fn index_outputs<'a>(parents: impl IntoIterator<Item = &'a Transaction>) -> HashMap<OutPoint, TxOut> {
    let mut outputs = HashMap::new();
    for tx in parents {
        let txid = tx.compute_txid();
        for (vout, out) in tx.output.iter().enumerate() {
            outputs.insert(OutPoint::new(txid, vout as u32), out.clone());
        }
    }
    outputs
}

/// Build the history record of `tx` for a wallet owning `wallet_addresses`
pub fn classify(
    tx: &Transaction,
    prevouts: &HashMap<OutPoint, TxOut>,
    wallet_addresses: &HashSet<WalletAddress>,
    network: Network,
    status: UtxoStatus,
    block_time: Option<i64>,
) -> HistoryRecord {
    let address_of = |out: &TxOut| {
        Address::from_script(&out.script_pubkey, network)
            .ok()
            .map(WalletAddress::from)
    };
    let is_ours = |address: &Option<WalletAddress>| {
        address.as_ref().is_some_and(|a| wallet_addresses.contains(a))
    };

    let inputs: Vec<HistoryInput> = tx
        .input
        .iter()
        .map(|input| {
            let prevout = prevouts.get(&input.previous_output);
            HistoryInput {
                prev_txid: input.previous_output.txid,
                prev_vout: input.previous_output.vout,
                value: prevout.map(|out| out.value.to_sat()),
                address: prevout.and_then(address_of),
            }
        })
        .collect();

    let outputs: Vec<HistoryOutput> = tx
        .output
        .iter()
        .map(|out| HistoryOutput {
            value: out.value.to_sat(),
            address: address_of(out),
        })
        .collect();

    let total_in: u64 = inputs.iter().filter_map(|i| i.value).sum();
    let total_out: u64 = outputs.iter().map(|o| o.value).sum();
    let wallet_in: u64 = inputs
        .iter()
        .filter(|i| is_ours(&i.address))
        .filter_map(|i| i.value)
        .sum();
    let wallet_out: u64 = outputs
        .iter()
        .filter(|o| is_ours(&o.address))
        .map(|o| o.value)
        .sum();

    let all_resolved = inputs.iter().all(|i| i.value.is_some());
    let fee = all_resolved.then(|| total_in.saturating_sub(total_out));

    let (tx_type, amount) = if wallet_in > wallet_out {
        let external: u64 = outputs
            .iter()
            .filter(|o| !is_ours(&o.address))
            .map(|o| o.value)
            .sum();
        (TxType::Send, external)
    } else if wallet_out > wallet_in {
        (TxType::Receive, wallet_out - wallet_in)
    } else {
        (TxType::Internal, fee.unwrap_or(0))
    };

    HistoryRecord {
        txid: tx.compute_txid(),
        inputs,
        outputs,
        status,
        block_time,
        tx_type,
        amount,
        fee,
        vsize: tx.vsize() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, ScriptBuf, Sequence, TxIn, Witness};
    use std::str::FromStr;

    const OURS_A: &str = "bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu";
    const OURS_B: &str = "bc1q8c6fshw2dlwun7ekn9qwf37cu2rn755upcp6el";
    const THEIRS: &str = "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4";

    fn script(address: &str) -> ScriptBuf {
        Address::from_str(address)
            .unwrap()
            .require_network(Network::Bitcoin)
            .unwrap()
            .script_pubkey()
    }

    fn tx(inputs: Vec<OutPoint>, outputs: Vec<(&str, u64)>) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: inputs
                .into_iter()
                .map(|previous_output| TxIn {
                    previous_output,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                    witness: Witness::new(),
                })
                .collect(),
            output: outputs
                .into_iter()
                .map(|(address, value)| TxOut {
                    value: Amount::from_sat(value),
                    script_pubkey: script(address),
                })
                .collect(),
        }
    }

    fn wallet() -> HashSet<WalletAddress> {
        [OURS_A, OURS_B]
            .iter()
            .map(|a| {
                WalletAddress::from(
                    Address::from_str(a)
                        .unwrap()
                        .require_network(Network::Bitcoin)
                        .unwrap(),
                )
            })
            .collect()
    }

    /// Funding transaction paying `value` to `address`, plus its prevout index
    fn funding(address: &str, value: u64) -> (OutPoint, HashMap<OutPoint, TxOut>) {
        let parent = tx(vec![], vec![(address, value)]);
        let outpoint = OutPoint::new(parent.compute_txid(), 0);
        (outpoint, index_outputs([&parent]))
    }

    #[test]
    fn test_receive() {
        let (outpoint, prevouts) = funding(THEIRS, 100_000);
        let incoming = tx(vec![outpoint], vec![(OURS_A, 60_000), (THEIRS, 39_000)]);

        let record = classify(
            &incoming,
            &prevouts,
            &wallet(),
            Network::Bitcoin,
            UtxoStatus::Confirmed { height: 800_000 },
            Some(1_700_000_000),
        );
        assert_eq!(record.tx_type, TxType::Receive);
        assert_eq!(record.amount, 60_000);
        assert_eq!(record.fee, Some(1_000));
        assert!(!record.is_pending());
    }

    #[test]
    fn test_send_counts_only_external_outputs() {
        let (outpoint, prevouts) = funding(OURS_A, 50_000);
        let spend = tx(vec![outpoint], vec![(THEIRS, 40_000), (OURS_B, 8_590)]);

        let record = classify(
            &spend,
            &prevouts,
            &wallet(),
            Network::Bitcoin,
            UtxoStatus::Unconfirmed,
            None,
        );
        assert_eq!(record.tx_type, TxType::Send);
        assert_eq!(record.amount, 40_000);
        assert_eq!(record.fee, Some(1_410));
        assert!(record.is_pending());
    }

    #[test]
    fn test_internal_transfer_amount_is_fee() {
        let (outpoint, prevouts) = funding(OURS_A, 20_000);
        let consolidate = tx(vec![outpoint], vec![(OURS_A, 19_000), (OURS_B, 1_000)]);

        let record = classify(
            &consolidate,
            &prevouts,
            &wallet(),
            Network::Bitcoin,
            UtxoStatus::Unconfirmed,
            None,
        );
        assert_eq!(record.tx_type, TxType::Internal);
        assert_eq!(record.fee, Some(0));
        assert_eq!(record.amount, 0);
    }

    #[test]
    fn test_unresolved_input_leaves_fee_unknown() {
        let (known, prevouts) = funding(THEIRS, 10_000);
        let missing = OutPoint::new(
            Txid::from_str("4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b")
                .unwrap(),
            3,
        );
        let incoming = tx(vec![known, missing], vec![(OURS_A, 25_000)]);

        let record = classify(
            &incoming,
            &prevouts,
            &wallet(),
            Network::Bitcoin,
            UtxoStatus::Confirmed { height: 1 },
            None,
        );
        assert_eq!(record.inputs[1].value, None);
        assert_eq!(record.inputs[1].address, None);
        assert_eq!(record.fee, None);
        assert_eq!(record.tx_type, TxType::Receive);
        assert_eq!(record.amount, 25_000);
    }

    #[test]
    fn test_parent_txids_deduplicated() {
        let (a, _) = funding(THEIRS, 1);
        let (b, _) = funding(OURS_A, 2);
        let first = tx(vec![a, b], vec![(THEIRS, 1)]);
        let second = tx(vec![OutPoint::new(a.txid, 1)], vec![(THEIRS, 1)]);

        let parents = parent_txids(&[first, second]);
        assert_eq!(parents.len(), 2);
        assert!(parents.contains(&a.txid));
        assert!(parents.contains(&b.txid));
    }
}
