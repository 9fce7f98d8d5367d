//! # Signing State
//!
//! The frozen, canonically sorted coinjoin collecting witnesses.
//!
//! Witnesses are verified against the exact unsigned transaction, staged, and
//! then published together. An index accepts one witness for its lifetime.
//!
//! ```text
//! add_witness ──► staged ──publish_witnesses()──► witnesses
//!                                                   │
//!                         is_fully_signed() ◄───────┘
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{Message, Secp256k1, XOnlyPublicKey};
use bitcoin::sighash::{Prevouts, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{
    ecdsa, taproot, CompressedPublicKey, EcdsaSighashType, OutPoint, ScriptBuf, Sequence,
    Transaction, TxIn, TxOut, Witness,
};

use super::coin::Coin;
use super::parameters::RoundParameters;
use super::script::{witness_serialized_len, ScriptType};
use crate::error::{reject, ProtocolResult};

#[derive(Debug, Clone)]
pub struct SigningState {
    parameters: Arc<RoundParameters>,
    inputs: Vec<Coin>,
    outputs: Vec<TxOut>,
    witnesses: BTreeMap<usize, Witness>,
    staged: BTreeMap<usize, Witness>,
}

impl SigningState {
    pub(crate) fn new(parameters: Arc<RoundParameters>, inputs: Vec<Coin>, outputs: Vec<TxOut>) -> Self {
        Self {
            parameters,
            inputs,
            outputs,
            witnesses: BTreeMap::new(),
            staged: BTreeMap::new(),
        }
    }

    pub fn parameters(&self) -> &RoundParameters {
        &self.parameters
    }

    pub fn inputs(&self) -> &[Coin] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TxOut] {
        &self.outputs
    }

    /// Published witnesses by input index.
    pub fn witnesses(&self) -> &BTreeMap<usize, Witness> {
        &self.witnesses
    }

    pub fn index_of(&self, outpoint: &OutPoint) -> Option<usize> {
        self.inputs.iter().position(|c| &c.outpoint == outpoint)
    }

    pub fn is_input_signed(&self, index: usize) -> bool {
        self.witnesses.contains_key(&index)
    }

    pub fn is_fully_signed(&self) -> bool {
        self.witnesses.len() == self.inputs.len()
    }

    pub fn unsigned_inputs(&self) -> impl Iterator<Item = &Coin> {
        self.inputs
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.witnesses.contains_key(i))
            .map(|(_, c)| c)
    }

    pub fn create_unsigned_transaction(&self) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: self
                .inputs
                .iter()
                .map(|c| TxIn {
                    previous_output: c.outpoint,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::MAX,
                    witness: Witness::new(),
                })
                .collect(),
            output: self.outputs.clone(),
        }
    }

    /// The unsigned transaction with every published witness attached.
    pub fn create_transaction(&self) -> Transaction {
        let mut tx = self.create_unsigned_transaction();
        for (index, witness) in &self.witnesses {
            if let Some(input) = tx.input.get_mut(*index) {
                input.witness = witness.clone();
            }
        }
        tx
    }

    /// Verify and stage a witness for `index`.
    pub fn add_witness(&self, index: usize, witness: Witness) -> ProtocolResult<Self> {
        let Some(coin) = self.inputs.get(index) else {
            return Err(reject!(
                InvalidInputIndex,
                "input index {} out of range 0..{}",
                index,
                self.inputs.len()
            ));
        };
        if self.witnesses.contains_key(&index) || self.staged.contains_key(&index) {
            return Err(reject!(WitnessAlreadyProvided, "input {} already signed", index));
        }
        let Some(script_type) = coin.script_type() else {
            return Err(reject!(WrongCoinjoinSignature, "input {} has no verifiable script", index));
        };
        let len = witness_serialized_len(&witness);
        if len > script_type.max_witness_size() {
            return Err(reject!(
                SignatureTooLong,
                "witness of {} bytes exceeds {} for input {}",
                len,
                script_type.max_witness_size(),
                index
            ));
        }

        let unsigned = self.create_unsigned_transaction();
        if !self.verify_witness(&unsigned, index, coin, script_type, &witness) {
            return Err(reject!(WrongCoinjoinSignature, "invalid witness for input {}", index));
        }

        let mut next = self.clone();
        next.staged.insert(index, witness);
        Ok(next)
    }

    /// Move all staged witnesses into the published set.
    pub fn publish_witnesses(&self) -> Self {
        let mut next = self.clone();
        let staged = std::mem::take(&mut next.staged);
        next.witnesses.extend(staged);
        next
    }

    fn verify_witness(
        &self,
        tx: &Transaction,
        index: usize,
        coin: &Coin,
        script_type: ScriptType,
        witness: &Witness,
    ) -> bool {
        let secp = Secp256k1::verification_only();
        let mut cache = SighashCache::new(tx);

        match script_type {
            ScriptType::P2wpkh => {
                let (2, Some(sig), Some(key)) = (witness.len(), witness.nth(0), witness.nth(1)) else {
                    return false;
                };
                let Ok(sig) = ecdsa::Signature::from_slice(sig) else {
                    return false;
                };
                let Ok(key) = CompressedPublicKey::from_slice(key) else {
                    return false;
                };
                if sig.sighash_type != EcdsaSighashType::All
                    || ScriptBuf::new_p2wpkh(&key.wpubkey_hash()) != coin.txout.script_pubkey
                {
                    return false;
                }
                let Ok(sighash) = cache.p2wpkh_signature_hash(
                    index,
                    &coin.txout.script_pubkey,
                    coin.txout.value,
                    sig.sighash_type,
                ) else {
                    return false;
                };
                let msg = Message::from_digest(sighash.to_byte_array());
                secp.verify_ecdsa(&msg, &sig.signature, &key.0).is_ok()
            }
            ScriptType::Taproot => {
                let (1, Some(sig)) = (witness.len(), witness.nth(0)) else {
                    return false;
                };
                let Ok(sig) = taproot::Signature::from_slice(sig) else {
                    return false;
                };
                let Ok(key) = XOnlyPublicKey::from_slice(&coin.txout.script_pubkey.as_bytes()[2..34]) else {
                    return false;
                };
                let prevouts: Vec<TxOut> = self.inputs.iter().map(|c| c.txout.clone()).collect();
                let Ok(sighash) = cache.taproot_key_spend_signature_hash(
                    index,
                    &Prevouts::All(&prevouts),
                    sig.sighash_type,
                ) else {
                    return false;
                };
                let msg = Message::from_digest(sighash.to_byte_array());
                secp.verify_schnorr(&sig.signature, &msg, &key).is_ok()
            }
        }
    }
}
