//! Ordered, nonce-safe submission of write ops against one contract
//!
//! The starting nonce is read once; after that it is tracked locally and only
//! advances when the node has accepted a transaction. Each op waits for its
//! receipt before the next one is built. Ops are independent: a failure is
//! recorded on that op's receipt and the sequence continues.

use alloy::network::TransactionBuilder;
use alloy::primitives::Address;
use alloy::rpc::types::TransactionRequest;
use valuator_core::{ChainWriteOp, TxPhase, TxReceipt};

use super::{calldata, ChainClient, SignedTx};
use crate::error::Result;

pub struct TransactionSequencer<'a> {
    chain: &'a dyn ChainClient,
    contract: Address,
    gas_limit: u64,
}

impl<'a> TransactionSequencer<'a> {
    pub fn new(chain: &'a dyn ChainClient, contract: Address, gas_limit: u64) -> Self {
        Self {
            chain,
            contract,
            gas_limit,
        }
    }

    /// Apply `ops` in order. Fails only if the network cannot be reached to
    /// read the chain id or starting nonce; per-op failures are in the receipts.
    pub async fn apply(&self, ops: &[ChainWriteOp]) -> Result<Vec<TxReceipt>> {
        let chain_id = self.chain.chain_id().await?;
        let sender = self.chain.sender();
        let mut nonce = self.chain.transaction_count(sender).await?;

        tracing::info!(
            chain_id = %chain_id,
            wallet = %sender,
            contract = %self.contract,
            starting_nonce = %nonce,
            ops = ops.len(),
            "Starting on-chain update"
        );

        let mut receipts = Vec::with_capacity(ops.len());
        for op in ops {
            receipts.push(self.apply_one(*op, chain_id, &mut nonce).await);
        }

        let confirmed = receipts.iter().filter(|r| r.is_confirmed()).count();
        tracing::info!(
            confirmed = confirmed,
            failed = receipts.len() - confirmed,
            next_nonce = %nonce,
            "On-chain update finished"
        );

        Ok(receipts)
    }

    async fn build_and_sign(&self, op: &ChainWriteOp, chain_id: u64, nonce: u64) -> Result<SignedTx> {
        let gas_price = self.chain.gas_price().await?;
        let tx = TransactionRequest::default()
            .with_from(self.chain.sender())
            .with_to(self.contract)
            .with_nonce(nonce)
            .with_chain_id(chain_id)
            .with_gas_limit(self.gas_limit)
            .with_gas_price(gas_price)
            .with_input(calldata(op));

        self.chain.sign(tx).await
    }

    async fn apply_one(&self, op: ChainWriteOp, chain_id: u64, nonce: &mut u64) -> TxReceipt {
        let mut receipt = TxReceipt::new(op);
        tracing::info!(function = %op.function, value = op.value, nonce = %nonce, "Preparing transaction");

        let signed = match self.build_and_sign(&op, chain_id, *nonce).await {
            Ok(signed) => signed,
            Err(e) => {
                tracing::error!(function = %op.function, error = %e, "Failed to build transaction");
                receipt.fail(e.to_string());
                return receipt;
            }
        };
        receipt.advance(TxPhase::Signed);

        let hash = match self.chain.send_raw(&signed).await {
            Ok(hash) => hash,
            Err(e) => {
                tracing::error!(function = %op.function, nonce = %signed.nonce, error = %e, "Submission failed");
                receipt.fail(e.to_string());
                return receipt;
            }
        };

        // The node has seen this nonce now, whatever happens next
        *nonce += 1;
        receipt.advance(TxPhase::Submitted);
        receipt.nonce = Some(signed.nonce);
        receipt.tx_hash = Some(format!("{hash:#x}"));
        tracing::info!(function = %op.function, tx_hash = %hash, "Transaction sent");

        match self.chain.wait_for_receipt(hash).await {
            Ok(true) => {
                receipt.advance(TxPhase::Confirmed);
                tracing::info!(function = %op.function, tx_hash = %hash, "Transaction confirmed");
            }
            Ok(false) => {
                tracing::error!(function = %op.function, tx_hash = %hash, "Transaction reverted");
                receipt.fail("transaction reverted");
            }
            Err(e) => {
                tracing::error!(function = %op.function, tx_hash = %hash, error = %e, "Confirmation failed");
                receipt.fail(e.to_string());
            }
        }

        receipt
    }
}
