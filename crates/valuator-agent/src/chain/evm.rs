//! EVM node access over JSON-RPC with a local private-key signer

use std::time::Duration;

use alloy::eips::eip2718::Encodable2718;
use alloy::network::{EthereumWallet, ReceiptResponse, TransactionBuilder};
use alloy::primitives::{Address, TxHash};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;

use super::{ChainClient, SignedTx};
use crate::config::ChainConfig;
use crate::error::{credential, AgentError, Result};

const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct EvmChain {
    provider: DynProvider,
    wallet: EthereumWallet,
    sender: Address,
    /// RPC URL without the key, for logs and errors
    endpoint_label: String,
    receipt_timeout: Duration,
}

impl EvmChain {
    /// Validate credentials and build the provider. No network traffic yet.
    pub fn connect(config: &ChainConfig) -> Result<Self> {
        let key = credential(&config.private_key, "chain.private_key")?;
        let signer: PrivateKeySigner = key
            .parse()
            .map_err(|e| AgentError::Config(format!("Invalid wallet private key: {e}")))?;
        let sender = signer.address();

        let endpoint = config.endpoint()?;
        let url: reqwest::Url = endpoint
            .parse()
            .map_err(|e| AgentError::Config(format!("Invalid RPC URL: {e}")))?;

        let provider = ProviderBuilder::new().connect_http(url).erased();

        tracing::info!(
            rpc = %config.rpc_url,
            wallet = %sender,
            "EVM chain client ready"
        );

        Ok(Self {
            provider,
            wallet: EthereumWallet::from(signer),
            sender,
            endpoint_label: config.rpc_url.clone(),
            receipt_timeout: Duration::from_secs(config.receipt_timeout_seconds),
        })
    }

    fn unreachable(&self, err: impl std::fmt::Display) -> AgentError {
        AgentError::NetworkUnreachable {
            endpoint: self.endpoint_label.clone(),
            message: err.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl ChainClient for EvmChain {
    fn sender(&self) -> Address {
        self.sender
    }

    async fn chain_id(&self) -> Result<u64> {
        self.provider
            .get_chain_id()
            .await
            .map_err(|e| self.unreachable(e))
    }

    async fn transaction_count(&self, address: Address) -> Result<u64> {
        self.provider
            .get_transaction_count(address)
            .await
            .map_err(|e| self.unreachable(e))
    }

    async fn gas_price(&self) -> Result<u128> {
        self.provider
            .get_gas_price()
            .await
            .map_err(|e| AgentError::Chain(format!("Failed to read gas price: {e}")))
    }

    async fn sign(&self, tx: TransactionRequest) -> Result<SignedTx> {
        let nonce = tx
            .nonce
            .ok_or_else(|| AgentError::Chain("Transaction built without a nonce".to_string()))?;
        let envelope = tx
            .build(&self.wallet)
            .await
            .map_err(|e| AgentError::Chain(format!("Failed to sign transaction: {e}")))?;

        Ok(SignedTx {
            hash: *envelope.tx_hash(),
            nonce,
            raw: envelope.encoded_2718().into(),
        })
    }

    async fn send_raw(&self, tx: &SignedTx) -> Result<TxHash> {
        let pending = self
            .provider
            .send_raw_transaction(&tx.raw)
            .await
            .map_err(|e| AgentError::Chain(format!("Node rejected transaction: {e}")))?;
        Ok(*pending.tx_hash())
    }

    async fn wait_for_receipt(&self, hash: TxHash) -> Result<bool> {
        let poll = async {
            loop {
                match self.provider.get_transaction_receipt(hash).await {
                    Ok(Some(receipt)) => return Ok(receipt.status()),
                    Ok(None) => tokio::time::sleep(RECEIPT_POLL_INTERVAL).await,
                    Err(e) => {
                        return Err(AgentError::Chain(format!(
                            "Failed to fetch receipt for {hash}: {e}"
                        )))
                    }
                }
            }
        };

        tokio::time::timeout(self.receipt_timeout, poll)
            .await
            .map_err(|_| {
                AgentError::Chain(format!(
                    "No receipt for {hash} after {}s",
                    self.receipt_timeout.as_secs()
                ))
            })?
    }
}
