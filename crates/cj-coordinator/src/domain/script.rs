//! Script classification and size estimates.
//!
//! | Type   | Input vsize | Output vsize | Max witness bytes |
//! |--------|-------------|--------------|-------------------|
//! | P2WPKH | 69          | 31           | 108               |
//! | P2TR   | 58          | 43           | 67                |

use bitcoin::{Amount, Script, TxOut};
use serde::{Deserialize, Serialize};

use super::money::FeeRate;

/// Version, locktime, input and output counts, segwit marker.
pub const SHARED_OVERHEAD_VSIZE: u64 = 11;

/// Largest transaction the coordinator builds.
pub const MAX_TRANSACTION_SIZE: u64 = 100_000;

/// Script types the coordinator knows how to size and verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScriptType {
    P2wpkh,
    Taproot,
}

impl ScriptType {
    pub fn from_script(script: &Script) -> Option<Self> {
        if script.is_p2wpkh() {
            Some(ScriptType::P2wpkh)
        } else if script.is_p2tr() {
            Some(ScriptType::Taproot)
        } else {
            None
        }
    }

    pub fn input_vsize(&self) -> u64 {
        match self {
            ScriptType::P2wpkh => 69,
            ScriptType::Taproot => 58,
        }
    }

    pub fn output_vsize(&self) -> u64 {
        match self {
            ScriptType::P2wpkh => 31,
            ScriptType::Taproot => 43,
        }
    }

    /// Serialized witness budget, stack count and length prefixes included.
    pub fn max_witness_size(&self) -> usize {
        match self {
            // count + (len + 73 byte DER sig w/ sighash) + (len + 33 byte key)
            ScriptType::P2wpkh => 1 + 1 + 73 + 1 + 33,
            // count + (len + 64 byte sig + optional sighash byte)
            ScriptType::Taproot => 1 + 1 + 65,
        }
    }
}

/// Standard output/input templates accepted by relay policy.
pub fn is_standard(script: &Script) -> bool {
    script.is_p2pkh()
        || script.is_p2sh()
        || script.is_p2wpkh()
        || script.is_p2wsh()
        || script.is_p2tr()
        || script.is_op_return()
}

/// Dust threshold under `min_relay_fee`, three times the cost of spending the output.
pub fn dust_threshold(txout: &TxOut, min_relay_fee: FeeRate) -> Amount {
    if txout.script_pubkey.is_op_return() {
        return Amount::ZERO;
    }
    let script_len = txout.script_pubkey.len() as u64;
    let mut size = 8 + compact_size_len(script_len) + script_len;
    size += if txout.script_pubkey.is_witness_program() {
        32 + 4 + 1 + (107 / 4) + 4
    } else {
        32 + 4 + 1 + 107 + 4
    };
    min_relay_fee.fee_for(size) * 3
}

pub fn is_dust(txout: &TxOut, min_relay_fee: FeeRate) -> bool {
    txout.value < dust_threshold(txout, min_relay_fee)
}

/// Serialized length of a transaction witness.
pub fn witness_serialized_len(witness: &bitcoin::Witness) -> usize {
    let items: usize = witness
        .iter()
        .map(|item| compact_size_len(item.len() as u64) as usize + item.len())
        .sum();
    compact_size_len(witness.len() as u64) as usize + items
}

fn compact_size_len(n: u64) -> u64 {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}
