//! Chain data source used by the wallet engine
//!
//! Batched calls return one result per input, in input order, so a single
//! failing address never hides the others.

use async_trait::async_trait;
use bitcoin::block::Header;
use bitcoin::{Address, Transaction, Txid};

use crate::electrum::{
    AddressStats, ElectrumClient, FeeEstimates, HeaderNotification, HistoryEntry, UnspentEntry,
};
use crate::error::ElectrumError;

#[async_trait]
pub trait ChainBackend: Send + Sync {
    async fn address_stats(&self, addresses: &[Address]) -> Vec<Result<AddressStats, ElectrumError>>;

    async fn list_unspent(
        &self,
        addresses: &[Address],
    ) -> Vec<Result<Vec<UnspentEntry>, ElectrumError>>;

    async fn address_history(
        &self,
        addresses: &[Address],
    ) -> Vec<Result<Vec<HistoryEntry>, ElectrumError>>;

    async fn transactions(&self, txids: &[Txid]) -> Vec<Result<Transaction, ElectrumError>>;

    async fn block_headers(&self, heights: &[u32]) -> Vec<Result<Header, ElectrumError>>;

    async fn broadcast(&self, tx: &Transaction) -> Result<Txid, ElectrumError>;

    async fn fee_estimates(&self) -> Result<FeeEstimates, ElectrumError>;

    async fn tip(&self) -> Result<HeaderNotification, ElectrumError>;
}

#[async_trait]
impl ChainBackend for ElectrumClient {
    async fn address_stats(&self, addresses: &[Address]) -> Vec<Result<AddressStats, ElectrumError>> {
        self.get_address_stats(addresses).await
    }

    async fn list_unspent(
        &self,
        addresses: &[Address],
    ) -> Vec<Result<Vec<UnspentEntry>, ElectrumError>> {
        self.list_unspents(addresses).await
    }

    async fn address_history(
        &self,
        addresses: &[Address],
    ) -> Vec<Result<Vec<HistoryEntry>, ElectrumError>> {
        self.get_histories(addresses).await
    }

    async fn transactions(&self, txids: &[Txid]) -> Vec<Result<Transaction, ElectrumError>> {
        self.get_transactions(txids).await
    }

    async fn block_headers(&self, heights: &[u32]) -> Vec<Result<Header, ElectrumError>> {
        ElectrumClient::block_headers(self, heights).await
    }

    async fn broadcast(&self, tx: &Transaction) -> Result<Txid, ElectrumError> {
        ElectrumClient::broadcast(self, tx).await
    }

    async fn fee_estimates(&self) -> Result<FeeEstimates, ElectrumError> {
        ElectrumClient::fee_estimates(self).await
    }

    async fn tip(&self) -> Result<HeaderNotification, ElectrumError> {
        self.tip_header().await
    }
}
