//! On-chain settlement
//!
//! `ChainClient` is the narrow surface the sequencer needs from a node plus
//! a local signer. `EvmChain` implements it over alloy; tests use an
//! in-memory node.

pub mod evm;
pub mod sequencer;

use alloy::primitives::{Address, Bytes, TxHash, U256};
use alloy::rpc::types::TransactionRequest;
use alloy::sol_types::SolCall;
use valuator_core::{ChainWriteOp, WriteFunction};

use crate::error::Result;

pub use evm::EvmChain;
pub use sequencer::TransactionSequencer;

alloy::sol! {
    interface IValuationToken {
        function updateValuation(uint256 newValuation) external;
        function updateRiskScore(uint256 newRiskScore) external;
        function updateLocationScore(uint256 newLocationScore) external;
    }
}

/// A locally signed transaction ready for broadcast.
#[derive(Debug, Clone)]
pub struct SignedTx {
    pub hash: TxHash,
    pub nonce: u64,
    pub raw: Bytes,
}

#[async_trait::async_trait]
pub trait ChainClient: Send + Sync {
    /// Address of the signing wallet
    fn sender(&self) -> Address;

    async fn chain_id(&self) -> Result<u64>;

    async fn transaction_count(&self, address: Address) -> Result<u64>;

    async fn gas_price(&self) -> Result<u128>;

    async fn sign(&self, tx: TransactionRequest) -> Result<SignedTx>;

    /// Broadcast a signed transaction. `Ok` means the node accepted it.
    async fn send_raw(&self, tx: &SignedTx) -> Result<TxHash>;

    /// Wait for inclusion. `Ok(false)` means included but reverted.
    async fn wait_for_receipt(&self, hash: TxHash) -> Result<bool>;
}

/// ABI-encoded call for one write op.
pub fn calldata(op: &ChainWriteOp) -> Bytes {
    let value = U256::from(op.value);
    let encoded = match op.function {
        WriteFunction::UpdateValuation => {
            IValuationToken::updateValuationCall { newValuation: value }.abi_encode()
        }
        WriteFunction::UpdateRiskScore => {
            IValuationToken::updateRiskScoreCall { newRiskScore: value }.abi_encode()
        }
        WriteFunction::UpdateLocationScore => {
            IValuationToken::updateLocationScoreCall { newLocationScore: value }.abi_encode()
        }
    };
    Bytes::from(encoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calldata_selectors_differ_per_function() {
        let ops = [
            ChainWriteOp { function: WriteFunction::UpdateValuation, value: 300_000 },
            ChainWriteOp { function: WriteFunction::UpdateRiskScore, value: 40 },
            ChainWriteOp { function: WriteFunction::UpdateLocationScore, value: 82 },
        ];
        let encoded: Vec<Bytes> = ops.iter().map(calldata).collect();

        for data in &encoded {
            // 4-byte selector + one 32-byte word
            assert_eq!(data.len(), 36);
        }
        assert_eq!(&encoded[0][..4], IValuationToken::updateValuationCall::SELECTOR.as_slice());
        assert_ne!(&encoded[0][..4], &encoded[1][..4]);
        assert_ne!(&encoded[1][..4], &encoded[2][..4]);

        let word = U256::from_be_slice(&encoded[0][4..]);
        assert_eq!(word, U256::from(300_000u64));
    }
}
