//! # Transparent Credential Issuer
//!
//! Reference issuer that authenticates credentials with HMAC-SHA256 under a
//! per-issuer random key. Values are visible to the coordinator, so it
//! provides the conservation accounting of the credential contract without
//! the unlinkability of a real anonymous-credential scheme.
//!
//! ```text
//! mac = HMAC(key, kind || serial || value)
//! ```
//!
//! Spent serials are tracked per issuer; every round gets fresh issuers.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::domain::credentials::CREDENTIALS_PER_REQUEST;
use crate::domain::{
    Credential, CredentialKind, CredentialsRequest, CredentialsResponse, IssuerParameters, SerialNumber,
};
use crate::error::IssuerError;
use crate::ports::outbound::{CredentialIssuer, CredentialIssuerFactory, PreparedIssuance};

type HmacSha256 = Hmac<Sha256>;

pub struct MacCredentialIssuer {
    kind: CredentialKind,
    max_value: u64,
    key: [u8; 32],
    spent: Mutex<HashSet<SerialNumber>>,
}

impl MacCredentialIssuer {
    pub fn new(kind: CredentialKind, max_value: u64) -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self {
            kind,
            max_value,
            key,
            spent: Mutex::new(HashSet::new()),
        }
    }

    pub fn spent_count(&self) -> usize {
        self.spent.lock().len()
    }

    fn mac(&self, serial: &SerialNumber, value: u64) -> Result<HmacSha256, IssuerError> {
        let mut mac = HmacSha256::new_from_slice(&self.key).map_err(|e| IssuerError::Internal(e.to_string()))?;
        mac.update(&[self.kind as u8]);
        mac.update(&serial.0);
        mac.update(&value.to_le_bytes());
        Ok(mac)
    }

    fn is_authentic(&self, credential: &Credential) -> Result<bool, IssuerError> {
        if credential.kind != self.kind || credential.value > self.max_value {
            return Ok(false);
        }
        Ok(self
            .mac(&credential.serial, credential.value)?
            .verify_slice(&credential.mac)
            .is_ok())
    }

    fn issue(&self, value: u64) -> Result<Credential, IssuerError> {
        let mut serial = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut serial);
        let serial = SerialNumber(serial);
        let mac: [u8; 32] = self.mac(&serial, value)?.finalize().into_bytes().into();
        Ok(Credential {
            kind: self.kind,
            serial,
            value,
            mac,
        })
    }
}

#[async_trait]
impl CredentialIssuer for MacCredentialIssuer {
    fn parameters(&self) -> IssuerParameters {
        IssuerParameters {
            kind: self.kind,
            max_value: self.max_value,
            key_commitment: Sha256::digest(self.key).into(),
        }
    }

    async fn prepare(&self, request: &CredentialsRequest) -> Result<PreparedIssuance, IssuerError> {
        if request.requested.len() != CREDENTIALS_PER_REQUEST {
            return Err(IssuerError::WrongRequestedCount {
                expected: CREDENTIALS_PER_REQUEST,
                actual: request.requested.len(),
            });
        }
        if !request.presented.is_empty() && request.presented.len() != CREDENTIALS_PER_REQUEST {
            return Err(IssuerError::WrongPresentedCount {
                expected: CREDENTIALS_PER_REQUEST,
                actual: request.presented.len(),
            });
        }
        if let Some(r) = request.requested.iter().find(|r| r.value > self.max_value) {
            return Err(IssuerError::ValueTooLarge {
                value: r.value,
                max: self.max_value,
            });
        }

        let mut serials = HashSet::new();
        {
            let spent = self.spent.lock();
            for credential in &request.presented {
                if !self.is_authentic(credential)? {
                    return Err(IssuerError::InvalidCredential);
                }
                if spent.contains(&credential.serial) || !serials.insert(credential.serial) {
                    return Err(IssuerError::SerialNumberAlreadyUsed);
                }
            }
        }

        let presented = request.presented_total();
        let requested = request.requested_total();
        if requested as i128 != presented as i128 + request.delta as i128 {
            return Err(IssuerError::BalanceMismatch {
                presented,
                delta: request.delta,
                requested,
            });
        }

        let issued = request
            .requested
            .iter()
            .map(|r| self.issue(r.value))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(PreparedIssuance {
            kind: self.kind,
            spent: request.presented.iter().map(|c| c.serial).collect(),
            issued,
        })
    }

    fn commit(&self, prepared: PreparedIssuance) -> Result<CredentialsResponse, IssuerError> {
        if prepared.kind != self.kind {
            return Err(IssuerError::Internal(format!(
                "{} issuance committed to {} issuer",
                prepared.kind, self.kind
            )));
        }
        let mut spent = self.spent.lock();
        if prepared.spent.iter().any(|s| spent.contains(s)) {
            return Err(IssuerError::SerialNumberAlreadyUsed);
        }
        spent.extend(prepared.spent);
        Ok(CredentialsResponse {
            issued: prepared.issued,
        })
    }
}

/// Creates a [`MacCredentialIssuer`] per round and resource.
#[derive(Debug, Default, Clone, Copy)]
pub struct MacCredentialIssuerFactory;

impl CredentialIssuerFactory for MacCredentialIssuerFactory {
    fn create(&self, kind: CredentialKind, max_value: u64) -> Result<Arc<dyn CredentialIssuer>, IssuerError> {
        Ok(Arc::new(MacCredentialIssuer::new(kind, max_value)))
    }
}
