//! Cross-round coin registry.
//!
//! Maps every registered outpoint to the one Alice that currently owns it, in
//! whichever round. A later registration supersedes an unconfirmed owner; a
//! confirmed owner holds the coin until its round ends.
//!
//! Callers hold the target round's writer lock while calling in; the registry
//! mutex is always taken last and never held across an await.

use std::collections::HashMap;

use bitcoin::OutPoint;
use parking_lot::Mutex;

use crate::domain::{AliceId, RoundId};
use crate::error::{reject, ProtocolResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoinRegistration {
    pub round_id: RoundId,
    pub alice_id: AliceId,
    /// Set once the owning Alice confirmed; a locked coin cannot be superseded.
    pub locked: bool,
}

impl CoinRegistration {
    fn is_owned_by(&self, round_id: RoundId, alice_id: AliceId) -> bool {
        self.round_id == round_id && self.alice_id == alice_id
    }
}

/// Outpoints taken over by [`CoinRegistry::claim`] and who held them before.
#[derive(Debug, Default)]
pub struct Claim {
    displaced: Vec<(OutPoint, Option<CoinRegistration>)>,
}

impl Claim {
    /// Distinct registrations that lost at least one coin.
    pub fn superseded(&self) -> Vec<CoinRegistration> {
        let mut superseded: Vec<CoinRegistration> = Vec::new();
        for previous in self.displaced.iter().filter_map(|(_, p)| *p) {
            if !superseded.contains(&previous) {
                superseded.push(previous);
            }
        }
        superseded
    }
}

#[derive(Debug, Default)]
pub struct CoinRegistry {
    coins: Mutex<HashMap<OutPoint, CoinRegistration>>,
}

impl CoinRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, outpoint: &OutPoint) -> Option<CoinRegistration> {
        self.coins.lock().get(outpoint).copied()
    }

    pub fn len(&self) -> usize {
        self.coins.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.coins.lock().is_empty()
    }

    /// Point `outpoints` at a new Alice.
    ///
    /// Nothing changes if any outpoint belongs to a confirmed Alice.
    pub fn claim(&self, round_id: RoundId, alice_id: AliceId, outpoints: &[OutPoint]) -> ProtocolResult<Claim> {
        let mut coins = self.coins.lock();

        if let Some(outpoint) = outpoints.iter().find(|o| coins.get(o).is_some_and(|r| r.locked)) {
            return Err(reject!(AliceAlreadyRegistered, "{} is held by a confirmed registration", outpoint));
        }

        let displaced = outpoints
            .iter()
            .map(|outpoint| {
                let previous = coins.insert(
                    *outpoint,
                    CoinRegistration {
                        round_id,
                        alice_id,
                        locked: false,
                    },
                );
                (*outpoint, previous)
            })
            .collect();
        Ok(Claim { displaced })
    }

    /// Undo a claim whose registration was never published.
    ///
    /// Entries that moved on since the claim are left alone.
    pub fn revert(&self, round_id: RoundId, alice_id: AliceId, claim: Claim) {
        let mut coins = self.coins.lock();
        for (outpoint, previous) in claim.displaced {
            if !coins.get(&outpoint).is_some_and(|r| r.is_owned_by(round_id, alice_id)) {
                continue;
            }
            match previous {
                Some(previous) => coins.insert(outpoint, previous),
                None => coins.remove(&outpoint),
            };
        }
    }

    /// Lock an Alice's coins at confirmation.
    ///
    /// Fails with `AliceNotFound` unless every coin still belongs to her.
    pub fn lock(&self, round_id: RoundId, alice_id: AliceId, outpoints: &[OutPoint]) -> ProtocolResult<()> {
        self.set_locked(round_id, alice_id, outpoints, true)
    }

    pub fn unlock(&self, round_id: RoundId, alice_id: AliceId, outpoints: &[OutPoint]) -> ProtocolResult<()> {
        self.set_locked(round_id, alice_id, outpoints, false)
    }

    /// Whether every coin still belongs to this Alice.
    pub fn owns_all(&self, round_id: RoundId, alice_id: AliceId, outpoints: &[OutPoint]) -> bool {
        let coins = self.coins.lock();
        outpoints
            .iter()
            .all(|o| coins.get(o).is_some_and(|r| r.is_owned_by(round_id, alice_id)))
    }

    /// Remove entries that still point at this Alice.
    pub fn release(&self, round_id: RoundId, alice_id: AliceId, outpoints: &[OutPoint]) -> usize {
        let mut coins = self.coins.lock();
        let mut released = 0;
        for outpoint in outpoints {
            if coins.get(outpoint).is_some_and(|r| r.is_owned_by(round_id, alice_id)) {
                coins.remove(outpoint);
                released += 1;
            }
        }
        released
    }

    /// Remove every entry of an ended round.
    pub fn release_round(&self, round_id: RoundId) -> usize {
        let mut coins = self.coins.lock();
        let before = coins.len();
        coins.retain(|_, r| r.round_id != round_id);
        before - coins.len()
    }

    fn set_locked(&self, round_id: RoundId, alice_id: AliceId, outpoints: &[OutPoint], locked: bool) -> ProtocolResult<()> {
        let mut coins = self.coins.lock();
        if let Some(outpoint) = outpoints
            .iter()
            .find(|o| !coins.get(o).is_some_and(|r| r.is_owned_by(round_id, alice_id)))
        {
            return Err(reject!(AliceNotFound, "{} no longer registered to alice {}", outpoint, alice_id));
        }
        for outpoint in outpoints {
            if let Some(registration) = coins.get_mut(outpoint) {
                registration.locked = locked;
            }
        }
        Ok(())
    }
}
