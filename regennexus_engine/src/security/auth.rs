//! Certificate authority and bearer tokens.
//!
//! Certificates are JSON records wrapped in PEM armor, signed by a
//! deployment-local CA (not a public one). Tokens are base64-encoded JSON
//! records signed by the same CA key. Both use the canonical signing rule:
//! sorted-key UTF-8 JSON with the signature fields absent.
//!
//! Revocation is an in-memory set; a revoked certificate or token
//! authenticates nothing, even inside its validity window.

use base64::{Engine, engine::general_purpose::STANDARD as B64};
use p384::SecretKey;
use p384::ecdsa::signature::{Signer, Verifier};
use p384::ecdsa::{Signature, SigningKey, VerifyingKey};
use p384::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use parking_lot::RwLock;
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use structured_logger::unix_ms;
use zeroize::Zeroizing;

use regennexus_core::{Error, Json, to_canonical_json, unix_seconds};

/// Subject and issuer of the deployment CA.
pub static CA_SUBJECT: &str = "ReGenNexus Core CA";
/// The only signature algorithm emitted.
pub static SIGNATURE_ALGORITHM: &str = "ecdsa-with-SHA384";

const CA_VALIDITY_SECS: u64 = 365 * 24 * 60 * 60;
const ENTITY_VALIDITY_SECS: u64 = 30 * 24 * 60 * 60;

/// `basic_constraints` certificate extension.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct BasicConstraints {
    pub ca: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_length: Option<u32>,
}

/// Certificate extensions.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Extensions {
    pub basic_constraints: BasicConstraints,
    pub key_usage: Vec<String>,
    /// Present on entity certificates; binds the cert to an entity ID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
}

/// A certificate as embedded in PEM armor.
///
/// The canonical signing bytes are the sorted-key JSON form with
/// `signature` and `signature_algorithm` absent; serde skip rules make that
/// form fall out of clearing the two options.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Certificate {
    pub version: u32,
    pub serial_number: u64,
    pub issuer: String,
    /// `entity:<id>` for entity certificates; [`CA_SUBJECT`] for the CA.
    pub subject: String,
    pub not_before: u64,
    pub not_after: u64,
    /// PEM (CA) or base64 DER (entity) public key.
    pub public_key: String,
    pub extensions: Extensions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature_algorithm: Option<String>,
}

impl Certificate {
    /// Canonical byte form used for signing and verification.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut unsigned = self.clone();
        unsigned.signature = None;
        unsigned.signature_algorithm = None;
        to_canonical_json(&unsigned)
    }

    /// Wraps the certificate JSON in PEM armor.
    pub fn to_pem(&self) -> Result<String, Error> {
        let encoded = B64.encode(serde_json::to_vec(self)?);
        Ok(format!(
            "-----BEGIN CERTIFICATE-----\n{encoded}\n-----END CERTIFICATE-----"
        ))
    }

    /// Parses a certificate out of PEM armor.
    pub fn from_pem(pem: &str) -> Result<Self, Error> {
        let body: String = pem
            .lines()
            .filter(|line| !line.starts_with("-----"))
            .collect();
        let raw = B64
            .decode(body.trim())
            .map_err(|err| Error::KeyFormat(format!("certificate armor: {err}")))?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

struct CaState {
    secret: SecretKey,
    certificate: Certificate,
}

/// A lightweight certificate authority, local to the deployment.
pub struct CertificateAuthority {
    state: RwLock<Option<Arc<CaState>>>,
    revoked: RwLock<HashSet<u64>>,
}

impl Default for CertificateAuthority {
    fn default() -> Self {
        Self::new()
    }
}

impl CertificateAuthority {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(None),
            revoked: RwLock::new(HashSet::new()),
        }
    }

    /// Generates the CA key and self-signed root certificate (1-year
    /// validity). Returns `(ca_cert_pem, ca_key_pem)`; the key PEM is
    /// zeroized on drop and never appears in any message payload.
    pub fn bootstrap(&self) -> Result<(String, Zeroizing<String>), Error> {
        let secret = SecretKey::random(&mut OsRng);
        let public_pem = secret
            .public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|err| Error::KeyFormat(err.to_string()))?;
        let key_pem = secret
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|err| Error::KeyFormat(err.to_string()))?;

        let now = unix_seconds();
        let mut certificate = Certificate {
            version: 1,
            serial_number: 1,
            issuer: CA_SUBJECT.to_string(),
            subject: CA_SUBJECT.to_string(),
            not_before: now,
            not_after: now + CA_VALIDITY_SECS,
            public_key: public_pem,
            extensions: Extensions {
                basic_constraints: BasicConstraints {
                    ca: true,
                    path_length: Some(0),
                },
                key_usage: vec!["cert_sign".to_string(), "crl_sign".to_string()],
                entity_id: None,
            },
            signature: None,
            signature_algorithm: None,
        };

        let signature = sign_with(&secret, &certificate.signing_bytes()?);
        certificate.signature = Some(hex::encode(signature));
        certificate.signature_algorithm = Some(SIGNATURE_ALGORITHM.to_string());

        let pem = certificate.to_pem()?;
        *self.state.write() = Some(Arc::new(CaState {
            secret,
            certificate,
        }));
        log::info!("certificate authority bootstrapped");
        Ok((pem, key_pem))
    }

    /// The CA root certificate in PEM armor, for distribution to peers.
    pub fn ca_certificate_pem(&self) -> Result<String, Error> {
        let state = self.ca_state()?;
        state.certificate.to_pem()
    }

    /// Issues a 30-day certificate binding `entity_id` to its public key
    /// (DER, SPKI).
    pub fn issue(&self, entity_id: &str, public_key_der: &[u8]) -> Result<String, Error> {
        let state = self.ca_state()?;
        let now = unix_seconds();
        let mut certificate = Certificate {
            version: 1,
            serial_number: unix_ms(),
            issuer: state.certificate.subject.clone(),
            subject: format!("entity:{entity_id}"),
            not_before: now,
            not_after: now + ENTITY_VALIDITY_SECS,
            public_key: B64.encode(public_key_der),
            extensions: Extensions {
                basic_constraints: BasicConstraints {
                    ca: false,
                    path_length: None,
                },
                key_usage: vec![
                    "digital_signature".to_string(),
                    "key_encipherment".to_string(),
                ],
                entity_id: Some(entity_id.to_string()),
            },
            signature: None,
            signature_algorithm: None,
        };

        let signature = sign_with(&state.secret, &certificate.signing_bytes()?);
        certificate.signature = Some(hex::encode(signature));
        certificate.signature_algorithm = Some(SIGNATURE_ALGORITHM.to_string());

        log::info!(entity = entity_id, serial = certificate.serial_number; "certificate issued");
        certificate.to_pem()
    }

    /// Verifies a certificate: not revoked, inside its validity window,
    /// issued by this CA, and carrying a valid CA signature over the
    /// canonical form.
    pub fn verify(&self, cert_pem: &str) -> bool {
        let Ok(state) = self.ca_state() else {
            log::warn!("certificate verification without a bootstrapped CA");
            return false;
        };
        let certificate = match Certificate::from_pem(cert_pem) {
            Ok(certificate) => certificate,
            Err(err) => {
                log::warn!(error = err.to_string(); "unparseable certificate");
                return false;
            }
        };

        if self.revoked.read().contains(&certificate.serial_number) {
            log::warn!(serial = certificate.serial_number; "certificate is revoked");
            return false;
        }

        let now = unix_seconds();
        if now < certificate.not_before || now > certificate.not_after {
            log::warn!(serial = certificate.serial_number; "certificate outside validity window");
            return false;
        }

        if certificate.issuer != state.certificate.subject {
            log::warn!(serial = certificate.serial_number, issuer = certificate.issuer.as_str(); "certificate has foreign issuer");
            return false;
        }

        let Some(signature_hex) = &certificate.signature else {
            return false;
        };
        let Ok(signature) = hex::decode(signature_hex) else {
            return false;
        };
        let Ok(bytes) = certificate.signing_bytes() else {
            return false;
        };
        if !verify_with(&state.secret.public_key().into(), &bytes, &signature) {
            log::warn!(serial = certificate.serial_number; "certificate signature invalid");
            return false;
        }
        true
    }

    /// Inserts a serial into the revocation set.
    pub fn revoke(&self, serial_number: u64) {
        self.revoked.write().insert(serial_number);
        log::info!(serial = serial_number; "certificate revoked");
    }

    pub(crate) fn sign_bytes(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        let state = self.ca_state()?;
        Ok(sign_with(&state.secret, data))
    }

    pub(crate) fn verify_bytes(&self, data: &[u8], signature: &[u8]) -> bool {
        match self.ca_state() {
            Ok(state) => verify_with(&state.secret.public_key().into(), data, signature),
            Err(_) => false,
        }
    }

    fn ca_state(&self) -> Result<Arc<CaState>, Error> {
        self.state
            .read()
            .clone()
            .ok_or_else(|| Error::KeyNotFound("ca".to_string()))
    }
}

fn sign_with(secret: &SecretKey, data: &[u8]) -> Vec<u8> {
    let signing_key = SigningKey::from(secret);
    let signature: Signature = signing_key.sign(data);
    signature.to_bytes().to_vec()
}

fn verify_with(verifying_key: &VerifyingKey, data: &[u8], signature: &[u8]) -> bool {
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    verifying_key.verify(data, &signature).is_ok()
}

/// A bearer token signed by the CA.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct AuthToken {
    pub token_id: String,
    pub entity_id: String,
    /// Issued-at, Unix seconds.
    pub iat: u64,
    /// Expiry, Unix seconds.
    pub exp: u64,
    #[serde(default)]
    pub claims: BTreeMap<String, Json>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl AuthToken {
    fn signing_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut unsigned = self.clone();
        unsigned.signature = None;
        to_canonical_json(&unsigned)
    }
}

/// Issues and validates bearer tokens against the CA key.
pub struct TokenService {
    ca: Arc<CertificateAuthority>,
    revoked: RwLock<HashSet<String>>,
}

impl TokenService {
    pub fn new(ca: Arc<CertificateAuthority>) -> Self {
        Self {
            ca,
            revoked: RwLock::new(HashSet::new()),
        }
    }

    /// Issues a token for an entity, valid for `ttl_hours` (default callers
    /// pass 24). Returns the base64-encoded token.
    pub fn issue(
        &self,
        entity_id: &str,
        ttl_hours: u64,
        claims: BTreeMap<String, Json>,
    ) -> Result<String, Error> {
        let now = unix_seconds();
        let mut token = AuthToken {
            token_id: xid::new().to_string(),
            entity_id: entity_id.to_string(),
            iat: now,
            exp: now + ttl_hours * 3600,
            claims,
            signature: None,
        };
        let signature = self.ca.sign_bytes(&token.signing_bytes()?)?;
        token.signature = Some(hex::encode(signature));

        log::info!(entity = entity_id, token = token.token_id; "token issued");
        Ok(B64.encode(serde_json::to_vec(&token)?))
    }

    /// Validates a token: parseable, not revoked, not expired, CA signature
    /// valid. Returns the parsed token; every failure surfaces as
    /// [`Error::AuthenticationFailed`].
    pub fn validate(&self, token: &str) -> Result<AuthToken, Error> {
        let raw = B64
            .decode(token.trim())
            .map_err(|_| Error::AuthenticationFailed("malformed token".to_string()))?;
        let token: AuthToken = serde_json::from_slice(&raw)
            .map_err(|_| Error::AuthenticationFailed("malformed token".to_string()))?;

        if self.revoked.read().contains(&token.token_id) {
            log::warn!(token = token.token_id; "token is revoked");
            return Err(Error::AuthenticationFailed(token.entity_id));
        }
        if token.exp < unix_seconds() {
            log::warn!(token = token.token_id; "token is expired");
            return Err(Error::AuthenticationFailed(token.entity_id));
        }

        let Some(signature_hex) = &token.signature else {
            return Err(Error::AuthenticationFailed(token.entity_id));
        };
        let signature = hex::decode(signature_hex)
            .map_err(|_| Error::AuthenticationFailed(token.entity_id.clone()))?;
        if !self.ca.verify_bytes(&token.signing_bytes()?, &signature) {
            log::warn!(token = token.token_id; "token signature invalid");
            return Err(Error::AuthenticationFailed(token.entity_id));
        }
        Ok(token)
    }

    /// Inserts a token ID into the revocation set.
    pub fn revoke(&self, token_id: &str) {
        self.revoked.write().insert(token_id.to_string());
        log::info!(token = token_id; "token revoked");
    }
}
