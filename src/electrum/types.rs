//! Typed Electrum responses

use serde::{Deserialize, Serialize};

/// `blockchain.scripthash.get_balance`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BalanceResponse {
    pub confirmed: i64,
    pub unconfirmed: i64,
}

impl BalanceResponse {
    pub fn total(&self) -> i64 {
        self.confirmed + self.unconfirmed
    }
}

/// One entry of `blockchain.scripthash.get_history`. Height 0 or -1 is mempool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub tx_hash: String,
    pub height: i64,
    #[serde(default)]
    pub fee: Option<u64>,
}

/// One entry of `blockchain.scripthash.listunspent`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnspentEntry {
    pub tx_hash: String,
    pub tx_pos: u32,
    pub height: i64,
    pub value: u64,
}

/// `blockchain.headers.subscribe` result and push payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderNotification {
    pub height: u32,
    pub hex: String,
}

/// Per-address stats the ledger caches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AddressStats {
    pub balance: i64,
    pub tx_count: u64,
}

/// Fee rates in sat/vB for the 1, 3 and 6 block targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeEstimates {
    pub fast: u64,
    pub normal: u64,
    pub slow: u64,
}

/// Convert an `estimatefee` answer (BTC/kB, -1 if unknown) to sat/vB
pub fn btc_per_kb_to_sat_per_vb(btc_per_kb: f64) -> u64 {
    if !btc_per_kb.is_finite() || btc_per_kb <= 0.0 {
        return 1;
    }
    // Round to whole sat/kB first so float noise never bumps the ceiling
    let sat_per_kb = (btc_per_kb * 100_000_000.0).round() as u64;
    sat_per_kb.div_ceil(1000).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fee_conversion() {
        assert_eq!(btc_per_kb_to_sat_per_vb(0.00012), 12);
        assert_eq!(btc_per_kb_to_sat_per_vb(0.000011), 2);
        assert_eq!(btc_per_kb_to_sat_per_vb(0.000001), 1);
        assert_eq!(btc_per_kb_to_sat_per_vb(-1.0), 1);
        assert_eq!(btc_per_kb_to_sat_per_vb(0.0), 1);
    }

    #[test]
    fn test_history_entry_without_fee() {
        let entry: HistoryEntry =
            serde_json::from_str(r#"{"tx_hash":"ab","height":0}"#).unwrap();
        assert_eq!(entry.fee, None);
        assert_eq!(entry.height, 0);
    }

    #[test]
    fn test_balance_total() {
        let balance = BalanceResponse {
            confirmed: 10_000,
            unconfirmed: -2_500,
        };
        assert_eq!(balance.total(), 7_500);
    }
}
