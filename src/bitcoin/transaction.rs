use bitcoin::absolute::LockTime;
use bitcoin::ecdsa::Signature;
use bitcoin::hashes::Hash;
use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::{All, Message, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{consensus, Address, Amount, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};

use crate::error::WalletError;
use crate::storage::models::{Utxo, WalletAddress};
use crate::wallet::keys::{AccountKeys, Chain};

/// Outputs at or below this value are not worth creating
pub const DUST_THRESHOLD: u64 = 546;

/// Virtual size of a P2WPKH transaction: 68 vB per input, 31 vB per output and
/// 10.5 vB of overhead, rounded up.
pub fn calculate_vsize(num_inputs: usize, num_outputs: usize) -> u64 {
    (68.0 * num_inputs as f64 + 31.0 * num_outputs as f64 + 10.5).ceil() as u64
}

pub fn fee_for(vsize: u64, fee_rate: f64) -> u64 {
    (vsize as f64 * fee_rate).ceil() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxMetrics {
    pub vsize: u64,
    pub fee: u64,
    /// Negative when the inputs cannot cover amount plus fee
    pub change: i64,
    pub num_outputs: usize,
}

/// Decide between a payment-only and a payment-plus-change transaction.
///
/// The 2-output variant is used only when both it and the 1-output variant
/// leave more than `DUST_THRESHOLD` in change; otherwise any sub-dust
/// remainder goes to the miner.
pub fn calculate_transaction_metrics(
    num_inputs: usize,
    amount: u64,
    total_input: u64,
    fee_rate: f64,
) -> TxMetrics {
    let metrics_for = |num_outputs: usize| {
        let vsize = calculate_vsize(num_inputs, num_outputs);
        let fee = fee_for(vsize, fee_rate);
        let change = total_input as i128 - amount as i128 - fee as i128;
        TxMetrics {
            vsize,
            fee,
            change: change.clamp(i64::MIN as i128, i64::MAX as i128) as i64,
            num_outputs,
        }
    };

    let single = metrics_for(1);
    if single.change > DUST_THRESHOLD as i64 {
        let double = metrics_for(2);
        if double.change > DUST_THRESHOLD as i64 {
            return double;
        }
    }
    single
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoinSelection {
    /// Largest-first over every spendable UTXO
    Automatic,
    /// Exactly these outputs, in this order
    Manual(Vec<OutPoint>),
}

/// Selected inputs and the resulting fee/change decision, before signing
#[derive(Debug, Clone, PartialEq)]
pub struct SpendPlan {
    pub inputs: Vec<Utxo>,
    pub amount: u64,
    pub total_input: u64,
    pub fee_rate: f64,
    pub metrics: TxMetrics,
}

impl SpendPlan {
    /// Value of the change output, if the plan creates one
    pub fn change_value(&self) -> Option<u64> {
        (self.metrics.num_outputs == 2).then_some(self.metrics.change as u64)
    }
}

/// Wallet change output: address plus its index on the change chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeOutput {
    pub address: Address,
    pub index: u32,
}

#[derive(Debug, Clone)]
pub struct SignedTransaction {
    pub tx: Transaction,
    pub txid: Txid,
    pub hex: String,
    pub fee: u64,
    pub vsize: u64,
    /// Set when a change output was created; feed it to the change-index guard
    pub used_change_index: Option<u32>,
}

pub struct TransactionBuilder {
    network: Network,
    secp: Secp256k1<All>,
}

impl TransactionBuilder {
    /// Create a new transaction builder for the specified network
    pub fn new(network: Network) -> Self {
        Self {
            network,
            secp: Secp256k1::new(),
        }
    }

    /// Greedy largest-first: accumulate until the total covers the amount plus
    /// the fee of a 2-output transaction with the inputs chosen so far
    pub fn select_coins(
        &self,
        available: &[Utxo],
        amount: u64,
        fee_rate: f64,
    ) -> Result<Vec<Utxo>, WalletError> {
        let mut sorted = available.to_vec();
        sorted.sort_by(|a, b| b.value.cmp(&a.value));

        let mut selected = Vec::new();
        let mut total = 0u64;
        for utxo in sorted {
            total = total.saturating_add(utxo.value);
            selected.push(utxo);

            let fee = fee_for(calculate_vsize(selected.len(), 2), fee_rate);
            if total >= amount.saturating_add(fee) {
                return Ok(selected);
            }
        }

        Err(WalletError::InsufficientFunds {
            required: amount
                .saturating_add(fee_for(calculate_vsize(selected.len().max(1), 2), fee_rate)),
            available: total,
        })
    }

    /// Select inputs and compute fee and change. Fails before anything is
    /// built if the chosen variant's change is negative.
    pub fn plan(
        &self,
        available: &[Utxo],
        amount: u64,
        fee_rate: f64,
        selection: &CoinSelection,
    ) -> Result<SpendPlan, WalletError> {
        if amount == 0 {
            return Err(WalletError::InvalidAmount("amount must be positive".into()));
        }
        if amount < DUST_THRESHOLD {
            return Err(WalletError::InvalidAmount(format!(
                "{} sats is below the dust threshold of {} sats",
                amount, DUST_THRESHOLD
            )));
        }
        if amount > Amount::MAX_MONEY.to_sat() {
            return Err(WalletError::InvalidAmount(format!(
                "{} sats exceeds the 21M BTC supply",
                amount
            )));
        }
        if !fee_rate.is_finite() || fee_rate <= 0.0 {
            return Err(WalletError::InvalidAmount(format!("fee rate {} sat/vB", fee_rate)));
        }

        let inputs = match selection {
            CoinSelection::Automatic => self.select_coins(available, amount, fee_rate)?,
            CoinSelection::Manual(outpoints) => outpoints
                .iter()
                .map(|outpoint| {
                    available
                        .iter()
                        .find(|u| u.outpoint() == *outpoint)
                        .cloned()
                        .ok_or_else(|| WalletError::UtxoNotFound(outpoint.to_string()))
                })
                .collect::<Result<Vec<_>, _>>()?,
        };

        let total_input = inputs.iter().fold(0u64, |sum, u| sum.saturating_add(u.value));
        let metrics = calculate_transaction_metrics(inputs.len(), amount, total_input, fee_rate);
        if metrics.change < 0 {
            return Err(WalletError::InsufficientFunds {
                required: amount.saturating_add(metrics.fee),
                available: total_input,
            });
        }

        log::debug!(
            "Planned spend: {} input(s), {} output(s), {} vB, fee {} sats, change {} sats",
            inputs.len(),
            metrics.num_outputs,
            metrics.vsize,
            metrics.fee,
            metrics.change
        );

        Ok(SpendPlan {
            inputs,
            amount,
            total_input,
            fee_rate,
            metrics,
        })
    }

    /// Build and sign the planned transaction.
    ///
    /// `resolve` maps an input's address to its `(chain, index)`. Every input is
    /// resolved before any key is touched.
    pub fn sign<F>(
        &self,
        plan: &SpendPlan,
        recipient: &Address,
        change: Option<&ChangeOutput>,
        keys: &AccountKeys,
        resolve: F,
    ) -> Result<SignedTransaction, WalletError>
    where
        F: Fn(&WalletAddress) -> Option<(Chain, u32)>,
    {
        let origins = plan
            .inputs
            .iter()
            .map(|utxo| {
                resolve(&utxo.address).ok_or_else(|| WalletError::UnresolvableInput {
                    txid: utxo.txid.to_string(),
                    vout: utxo.vout,
                    address: utxo.address.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut outputs = vec![TxOut {
            value: Amount::from_sat(plan.amount),
            script_pubkey: recipient.script_pubkey(),
        }];
        let used_change_index = match plan.change_value() {
            Some(value) => {
                let change = change.ok_or_else(|| {
                    WalletError::Internal("change output required but no change address given".into())
                })?;
                outputs.push(TxOut {
                    value: Amount::from_sat(value),
                    script_pubkey: change.address.script_pubkey(),
                });
                Some(change.index)
            }
            None => None,
        };

        let unsigned = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: plan
                .inputs
                .iter()
                .map(|utxo| TxIn {
                    previous_output: utxo.outpoint(),
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::MAX,
                    witness: Witness::new(),
                })
                .collect(),
            output: outputs,
        };

        let mut psbt = Psbt::from_unsigned_tx(unsigned.clone())
            .map_err(|e| WalletError::Bitcoin(format!("PSBT creation failed: {}", e)))?;
        let mut sighash_cache = SighashCache::new(&unsigned);

        for (input_index, (utxo, (chain, index))) in plan.inputs.iter().zip(origins).enumerate() {
            let derived = keys.derive_address(chain, index)?;
            if WalletAddress::from(&derived.address) != utxo.address {
                return Err(WalletError::derivation(
                    format!("{}/{}", chain.number(), index),
                    format!("derived {} but input pays {}", derived.address, utxo.address),
                ));
            }

            let script_pubkey = derived.address.script_pubkey();
            let value = Amount::from_sat(utxo.value);
            let private_key = keys.derive_private_key(chain, index)?;
            let public_key = private_key.public_key(&self.secp);

            let sighash = sighash_cache
                .p2wpkh_signature_hash(input_index, &script_pubkey, value, EcdsaSighashType::All)
                .map_err(|e| WalletError::Bitcoin(e.to_string()))?;
            let message = Message::from_digest(sighash.to_byte_array());
            let ecdsa_sig = self.secp.sign_ecdsa(&message, &private_key.inner);
            let signature = Signature {
                signature: ecdsa_sig,
                sighash_type: EcdsaSighashType::All,
            };

            // P2WPKH witness: DER signature with sighash byte, then the pubkey
            let mut witness = Witness::new();
            witness.push(signature.to_vec());
            witness.push(public_key.to_bytes());

            let input = &mut psbt.inputs[input_index];
            input.witness_utxo = Some(TxOut {
                value,
                script_pubkey,
            });
            input.final_script_witness = Some(witness);

            log::debug!("Signed input {} ({} {}/{})", input_index, utxo.outpoint(), chain, index);
        }

        let tx = psbt
            .extract_tx()
            .map_err(|e| WalletError::Bitcoin(format!("Failed to extract transaction: {}", e)))?;
        let txid = tx.compute_txid();
        log::info!(
            "Signed transaction {} ({} input(s), fee {} sats)",
            txid,
            tx.input.len(),
            plan.metrics.fee
        );

        Ok(SignedTransaction {
            hex: consensus::encode::serialize_hex(&tx),
            txid,
            fee: plan.metrics.fee,
            vsize: plan.metrics.vsize,
            used_change_index,
            tx,
        })
    }

    pub fn network(&self) -> Network {
        self.network
    }
}
