//! Coins as seen by the coordinator.

use bitcoin::{Amount, OutPoint, TxOut};
use serde::{Deserialize, Serialize};

use super::money::{CoordinationFeeRate, FeeRate};
use super::script::ScriptType;

/// Coinbase outputs need this many confirmations before they are spendable.
pub const COINBASE_MATURITY: u32 = 100;

/// An unspent output registered as a coinjoin input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coin {
    pub outpoint: OutPoint,
    pub txout: TxOut,
}

impl Coin {
    pub fn new(outpoint: OutPoint, txout: TxOut) -> Self {
        Self { outpoint, txout }
    }

    pub fn amount(&self) -> Amount {
        self.txout.value
    }

    pub fn script_type(&self) -> Option<ScriptType> {
        ScriptType::from_script(&self.txout.script_pubkey)
    }

    /// Unknown script types are sized as the largest supported input so
    /// budget checks stay conservative until the type check rejects them.
    pub fn input_vsize(&self) -> u64 {
        self.script_type()
            .map(|t| t.input_vsize())
            .unwrap_or(ScriptType::P2wpkh.input_vsize())
    }

    /// Value contributed after the input pays for itself.
    ///
    /// Negative means the input is uneconomical at this fee rate.
    pub fn effective_value(&self, fee_rate: FeeRate, coordination: CoordinationFeeRate) -> i64 {
        let mining = fee_rate.fee_for(self.input_vsize());
        let coordination = coordination.get_fee(self.amount());
        self.amount().to_sat() as i64 - mining.to_sat() as i64 - coordination.to_sat() as i64
    }
}

/// UTXO lookup result from the chain-state oracle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutInfo {
    pub txout: TxOut,
    pub confirmations: u32,
    pub is_coinbase: bool,
}

impl TxOutInfo {
    pub fn is_immature(&self) -> bool {
        self.is_coinbase && self.confirmations <= COINBASE_MATURITY
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::{ScriptBuf, Txid, WPubkeyHash};

    fn coin(sats: u64) -> Coin {
        Coin::new(
            OutPoint::new(Txid::all_zeros(), 0),
            TxOut {
                value: Amount::from_sat(sats),
                script_pubkey: ScriptBuf::new_p2wpkh(&WPubkeyHash::all_zeros()),
            },
        )
    }

    #[test]
    fn test_effective_value_subtracts_fees() {
        let fee_rate = FeeRate::from_sat_per_vb(5);
        let coordination = CoordinationFeeRate::new(3_000, Amount::from_sat(1_000_000));
        // 69 vB * 5 = 345 mining, 5_000_000 * 0.003 = 15_000 coordination
        assert_eq!(coin(5_000_000).effective_value(fee_rate, coordination), 5_000_000 - 345 - 15_000);
        assert_eq!(coin(300).effective_value(fee_rate, CoordinationFeeRate::FREE), -45);
    }

    #[test]
    fn test_immature_coinbase() {
        let info = TxOutInfo {
            txout: coin(1).txout,
            confirmations: 100,
            is_coinbase: true,
        };
        assert!(info.is_immature());
        assert!(!TxOutInfo { confirmations: 101, ..info.clone() }.is_immature());
        assert!(!TxOutInfo { is_coinbase: false, ..info }.is_immature());
    }
}
