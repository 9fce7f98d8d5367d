//! # Ownership Proofs
//!
//! A participant proves control of an input by signing a commitment that binds
//! the input's script to the coordinator identifier and the round id. A proof
//! made for round A therefore never verifies in round B.
//!
//! ```text
//! commitment = TaggedHash("CJ/OwnershipProof",
//!                 len(script) || script || len(identifier) || identifier || round_id)
//! ```
//!
//! | Script | Witness stack           | Check                          |
//! |--------|-------------------------|--------------------------------|
//! | P2WPKH | `[ecdsa_sig, pubkey]`   | key hashes to script, ECDSA ok |
//! | P2TR   | `[schnorr_sig]`         | BIP-340 against output key     |

use bitcoin::secp256k1::{Message, Secp256k1, XOnlyPublicKey};
use bitcoin::{ecdsa, taproot, CompressedPublicKey, Script, ScriptBuf, Witness};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::identifiers::RoundId;
use super::script::ScriptType;

const OWNERSHIP_PROOF_TAG: &[u8] = b"CJ/OwnershipProof";

/// Data the ownership signature commits to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitmentData {
    pub coordinator_identifier: String,
    pub round_id: RoundId,
}

impl CommitmentData {
    pub fn new(coordinator_identifier: impl Into<String>, round_id: RoundId) -> Self {
        Self {
            coordinator_identifier: coordinator_identifier.into(),
            round_id,
        }
    }

    /// The 32-byte message signed for `script_pubkey`.
    pub fn signature_hash(&self, script_pubkey: &Script) -> [u8; 32] {
        let tag = Sha256::digest(OWNERSHIP_PROOF_TAG);
        let mut hasher = Sha256::new();
        hasher.update(tag);
        hasher.update(tag);
        hasher.update((script_pubkey.len() as u32).to_le_bytes());
        hasher.update(script_pubkey.as_bytes());
        hasher.update((self.coordinator_identifier.len() as u32).to_le_bytes());
        hasher.update(self.coordinator_identifier.as_bytes());
        hasher.update(self.round_id.as_bytes());
        hasher.finalize().into()
    }
}

/// Proof of control over an input's spending key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipProof {
    pub witness: Witness,
}

impl OwnershipProof {
    pub fn new(witness: Witness) -> Self {
        Self { witness }
    }

    /// Verify the proof for `script_pubkey`. Malformed proofs simply fail.
    pub fn verify(&self, script_pubkey: &Script, commitment: &CommitmentData) -> bool {
        let digest = commitment.signature_hash(script_pubkey);
        let msg = Message::from_digest(digest);
        let secp = Secp256k1::verification_only();

        match ScriptType::from_script(script_pubkey) {
            Some(ScriptType::P2wpkh) => {
                if self.witness.len() != 2 {
                    return false;
                }
                let (Some(sig), Some(key)) = (self.witness.nth(0), self.witness.nth(1)) else {
                    return false;
                };
                let Ok(sig) = ecdsa::Signature::from_slice(sig) else {
                    return false;
                };
                let Ok(key) = CompressedPublicKey::from_slice(key) else {
                    return false;
                };
                if ScriptBuf::new_p2wpkh(&key.wpubkey_hash()).as_script() != script_pubkey {
                    return false;
                }
                secp.verify_ecdsa(&msg, &sig.signature, &key.0).is_ok()
            }
            Some(ScriptType::Taproot) => {
                if self.witness.len() != 1 {
                    return false;
                }
                let Some(sig) = self.witness.nth(0) else {
                    return false;
                };
                let Ok(sig) = taproot::Signature::from_slice(sig) else {
                    return false;
                };
                let Ok(key) = XOnlyPublicKey::from_slice(&script_pubkey.as_bytes()[2..34]) else {
                    return false;
                };
                secp.verify_schnorr(&sig.signature, &msg, &key).is_ok()
            }
            None => false,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_keys {
    //! Deterministic keys for building signed fixtures.

    use bitcoin::secp256k1::{Keypair, Message, PublicKey, Secp256k1, SecretKey};
    use bitcoin::{ecdsa, CompressedPublicKey, EcdsaSighashType, ScriptBuf, Witness};

    use super::{CommitmentData, OwnershipProof};

    pub fn secret(seed: u8) -> SecretKey {
        SecretKey::from_slice(&[seed.max(1); 32]).expect("valid key")
    }

    pub fn p2wpkh_script(seed: u8) -> ScriptBuf {
        let secp = Secp256k1::new();
        let key = CompressedPublicKey(PublicKey::from_secret_key(&secp, &secret(seed)));
        ScriptBuf::new_p2wpkh(&key.wpubkey_hash())
    }

    pub fn p2wpkh_witness(seed: u8, digest: [u8; 32]) -> Witness {
        let secp = Secp256k1::new();
        let sk = secret(seed);
        let key = CompressedPublicKey(PublicKey::from_secret_key(&secp, &sk));
        let sig = ecdsa::Signature {
            signature: secp.sign_ecdsa(&Message::from_digest(digest), &sk),
            sighash_type: EcdsaSighashType::All,
        };
        Witness::from_slice(&[sig.to_vec(), key.to_bytes().to_vec()])
    }

    pub fn p2wpkh_proof(seed: u8, commitment: &CommitmentData) -> OwnershipProof {
        let digest = commitment.signature_hash(&p2wpkh_script(seed));
        OwnershipProof::new(p2wpkh_witness(seed, digest))
    }

    pub fn keypair(seed: u8) -> Keypair {
        Keypair::from_secret_key(&Secp256k1::new(), &secret(seed))
    }
}

#[cfg(test)]
mod tests {
    use super::test_keys::*;
    use super::*;
    use bitcoin::key::TweakedPublicKey;
    use bitcoin::secp256k1::schnorr;

    fn commitment(tag: u8) -> CommitmentData {
        CommitmentData::new("CoinJoinCoordinatorIdentifier", RoundId::from_bytes([tag; 32]))
    }

    #[test]
    fn test_p2wpkh_proof_verifies_for_its_round_only() {
        let round_a = commitment(1);
        let round_b = commitment(2);
        let proof = p2wpkh_proof(3, &round_a);

        assert!(proof.verify(&p2wpkh_script(3), &round_a));
        assert!(!proof.verify(&p2wpkh_script(3), &round_b));
    }

    #[test]
    fn test_p2wpkh_proof_bound_to_identifier() {
        let round = commitment(1);
        let proof = p2wpkh_proof(3, &round);
        let other = CommitmentData::new("SomeOtherCoordinator", round.round_id);
        assert!(!proof.verify(&p2wpkh_script(3), &other));
    }

    #[test]
    fn test_p2wpkh_proof_rejects_foreign_key() {
        let round = commitment(1);
        let proof = p2wpkh_proof(4, &round);
        assert!(!proof.verify(&p2wpkh_script(3), &round));
    }

    #[test]
    fn test_taproot_proof() {
        let secp = Secp256k1::new();
        let keypair = keypair(9);
        let (xonly, _) = keypair.x_only_public_key();
        let script = ScriptBuf::new_p2tr_tweaked(TweakedPublicKey::dangerous_assume_tweaked(xonly));
        let round = commitment(5);

        let msg = Message::from_digest(round.signature_hash(&script));
        let sig: schnorr::Signature = secp.sign_schnorr_no_aux_rand(&msg, &keypair);
        let proof = OwnershipProof::new(Witness::from_slice(&[sig.serialize().to_vec()]));

        assert!(proof.verify(&script, &round));
        assert!(!proof.verify(&script, &commitment(6)));
    }

    #[test]
    fn test_malformed_proof_fails() {
        let proof = OwnershipProof::new(Witness::from_slice(&[vec![1u8, 2, 3]]));
        assert!(!proof.verify(&p2wpkh_script(3), &commitment(1)));
    }
}
