//! Participant registrations.

use bitcoin::{Amount, OutPoint};

use super::coin::Coin;
use super::identifiers::{AliceId, Timestamp};
use super::money::{CoordinationFeeRate, FeeRate};
use super::ownership::OwnershipProof;

/// A registered input together with the proof it was registered with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredCoin {
    pub coin: Coin,
    pub ownership_proof: OwnershipProof,
}

/// A participant's pending input registration.
///
/// Coins are fixed at creation; only the deadline and the confirmation and
/// readiness flags change afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alice {
    pub id: AliceId,
    coins: Vec<RegisteredCoin>,
    pub deadline: Timestamp,
    pub confirmed_connection: bool,
    pub ready_to_sign: bool,
    pub is_paying_zero_coordination_fee: bool,
}

impl Alice {
    /// `coins` must be non-empty; callers validate before constructing.
    pub fn new(coins: Vec<RegisteredCoin>, deadline: Timestamp, coordination: CoordinationFeeRate) -> Self {
        let total: Amount = coins.iter().map(|c| c.coin.amount()).sum();
        Self {
            id: AliceId::new_random(),
            coins,
            deadline,
            confirmed_connection: false,
            ready_to_sign: false,
            is_paying_zero_coordination_fee: coordination.is_waived_for(total),
        }
    }

    pub fn coins(&self) -> impl Iterator<Item = &Coin> {
        self.coins.iter().map(|c| &c.coin)
    }

    pub fn registered_coins(&self) -> &[RegisteredCoin] {
        &self.coins
    }

    pub fn outpoints(&self) -> impl Iterator<Item = &OutPoint> {
        self.coins.iter().map(|c| &c.coin.outpoint)
    }

    pub fn holds(&self, outpoint: &OutPoint) -> bool {
        self.outpoints().any(|o| o == outpoint)
    }

    pub fn total_input_amount(&self) -> Amount {
        self.coins().map(Coin::amount).sum()
    }

    pub fn total_input_vsize(&self) -> u64 {
        self.coins().map(Coin::input_vsize).sum()
    }

    /// Fee the participant owes; waived below the plebs threshold.
    pub fn coordination_fee(&self, coordination: CoordinationFeeRate) -> Amount {
        if self.is_paying_zero_coordination_fee {
            Amount::ZERO
        } else {
            coordination.get_fee(self.total_input_amount())
        }
    }

    /// Amount credentials the participant receives at confirmation.
    pub fn calculate_remaining_amount_credentials(&self, fee_rate: FeeRate, coordination: CoordinationFeeRate) -> i64 {
        let mining = fee_rate.fee_for(self.total_input_vsize());
        self.total_input_amount().to_sat() as i64
            - mining.to_sat() as i64
            - self.coordination_fee(coordination).to_sat() as i64
    }

    /// Vsize credentials the participant receives at confirmation.
    pub fn calculate_remaining_vsize_credentials(&self, per_alice_allocation: u64) -> i64 {
        per_alice_allocation as i64 - self.total_input_vsize() as i64
    }

    pub fn is_past_deadline(&self, now: Timestamp) -> bool {
        now >= self.deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::{ScriptBuf, TxOut, Txid, WPubkeyHash, Witness};

    fn registered(tag: u8, sats: u64) -> RegisteredCoin {
        RegisteredCoin {
            coin: Coin::new(
                OutPoint::new(Txid::from_byte_array([tag; 32]), 0),
                TxOut {
                    value: Amount::from_sat(sats),
                    script_pubkey: ScriptBuf::new_p2wpkh(&WPubkeyHash::all_zeros()),
                },
            ),
            ownership_proof: OwnershipProof::new(Witness::new()),
        }
    }

    #[test]
    fn test_totals() {
        let alice = Alice::new(
            vec![registered(1, 1_000_000), registered(2, 2_000_000)],
            0,
            CoordinationFeeRate::FREE,
        );
        assert_eq!(alice.total_input_amount(), Amount::from_sat(3_000_000));
        assert_eq!(alice.total_input_vsize(), 138);
        assert!(alice.holds(&OutPoint::new(Txid::from_byte_array([2; 32]), 0)));
        assert_eq!(alice.calculate_remaining_vsize_credentials(255), 117);
    }

    #[test]
    fn test_remaining_amount_credentials() {
        let coordination = CoordinationFeeRate::new(3_000, Amount::from_sat(1_000_000));
        let whale = Alice::new(vec![registered(1, 5_000_000)], 0, coordination);
        assert!(!whale.is_paying_zero_coordination_fee);
        assert_eq!(
            whale.calculate_remaining_amount_credentials(FeeRate::from_sat_per_vb(5), coordination),
            5_000_000 - 345 - 15_000
        );

        let pleb = Alice::new(vec![registered(2, 900_000)], 0, coordination);
        assert!(pleb.is_paying_zero_coordination_fee);
        assert_eq!(
            pleb.calculate_remaining_amount_credentials(FeeRate::from_sat_per_vb(5), coordination),
            900_000 - 345
        );
    }
}
