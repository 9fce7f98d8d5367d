//! In-memory chain state for regtest simulations and tests.
//!
//! Holds a UTXO set, a configurable fee estimate and a broadcast log. A
//! successful broadcast spends the transaction's inputs and adds its outputs
//! as unconfirmed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bitcoin::{OutPoint, Transaction, TxOut};
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::domain::{FeeRate, TxOutInfo};
use crate::error::OracleError;
use crate::ports::outbound::ChainStateOracle;

#[derive(Default)]
pub struct InMemoryChainState {
    utxos: RwLock<HashMap<OutPoint, TxOutInfo>>,
    fee_rate: RwLock<Option<FeeRate>>,
    broadcasts: Mutex<Vec<Transaction>>,
    broadcast_rejection: Mutex<Option<String>>,
    unreachable: AtomicBool,
}

impl InMemoryChainState {
    pub fn new(fee_rate: FeeRate) -> Self {
        Self {
            fee_rate: RwLock::new(Some(fee_rate)),
            ..Self::default()
        }
    }

    pub fn add_utxo(&self, outpoint: OutPoint, txout: TxOut, confirmations: u32) {
        self.utxos.write().insert(
            outpoint,
            TxOutInfo {
                txout,
                confirmations,
                is_coinbase: false,
            },
        );
    }

    pub fn add_coinbase_utxo(&self, outpoint: OutPoint, txout: TxOut, confirmations: u32) {
        self.utxos.write().insert(
            outpoint,
            TxOutInfo {
                txout,
                confirmations,
                is_coinbase: true,
            },
        );
    }

    pub fn spend(&self, outpoint: &OutPoint) -> Option<TxOutInfo> {
        self.utxos.write().remove(outpoint)
    }

    pub fn is_unspent(&self, outpoint: &OutPoint) -> bool {
        self.utxos.read().contains_key(outpoint)
    }

    /// `None` makes fee estimation fail.
    pub fn set_fee_rate(&self, fee_rate: Option<FeeRate>) {
        *self.fee_rate.write() = fee_rate;
    }

    /// `Some(reason)` makes every broadcast fail with that reason.
    pub fn reject_broadcasts(&self, reason: Option<String>) {
        *self.broadcast_rejection.lock() = reason;
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn broadcasts(&self) -> Vec<Transaction> {
        self.broadcasts.lock().clone()
    }

    fn ensure_reachable(&self) -> Result<(), OracleError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(OracleError::Unreachable("in-memory chain marked unreachable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainStateOracle for InMemoryChainState {
    async fn get_tx_out(&self, outpoint: &OutPoint, include_mempool: bool) -> Result<Option<TxOutInfo>, OracleError> {
        self.ensure_reachable()?;
        Ok(self
            .utxos
            .read()
            .get(outpoint)
            .filter(|info| include_mempool || info.confirmations > 0)
            .cloned())
    }

    async fn estimate_fee_rate(&self, confirmation_target: u16) -> Result<FeeRate, OracleError> {
        self.ensure_reachable()?;
        (*self.fee_rate.read()).ok_or_else(|| {
            OracleError::FeeEstimationUnavailable(format!("no estimate for target {confirmation_target}"))
        })
    }

    async fn broadcast(&self, transaction: &Transaction) -> Result<(), OracleError> {
        self.ensure_reachable()?;
        if let Some(reason) = self.broadcast_rejection.lock().clone() {
            return Err(OracleError::BroadcastRejected(reason));
        }

        let txid = transaction.compute_txid();
        {
            let mut utxos = self.utxos.write();
            if let Some(missing) = transaction.input.iter().find(|i| !utxos.contains_key(&i.previous_output)) {
                return Err(OracleError::BroadcastRejected(format!(
                    "missing input {}",
                    missing.previous_output
                )));
            }
            for input in &transaction.input {
                utxos.remove(&input.previous_output);
            }
            for (vout, txout) in transaction.output.iter().enumerate() {
                utxos.insert(
                    OutPoint::new(txid, vout as u32),
                    TxOutInfo {
                        txout: txout.clone(),
                        confirmations: 0,
                        is_coinbase: false,
                    },
                );
            }
        }
        debug!(%txid, inputs = transaction.input.len(), "Broadcast accepted");
        self.broadcasts.lock().push(transaction.clone());
        Ok(())
    }
}
