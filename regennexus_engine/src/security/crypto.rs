//! Cryptographic primitives for the security core.
//!
//! This module provides key-pair lifecycle, ECDH-P384 key agreement with
//! HKDF-SHA384 derivation, AES-256-GCM payload sealing, and ECDSA-P384
//! signatures. It has no protocol opinions: envelopes, certificates and
//! tokens are built on top of it by the rest of [`crate::security`].
//!
//! # Key management
//! Private keys are generated or imported per entity ID and never leave the
//! in-memory keyring. Derived shared keys are cached in a read-mostly cache
//! keyed by the `(local, remote)` pair.

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit},
};
use base64::{Engine, engine::general_purpose::STANDARD as B64};
use hkdf::Hkdf;
use moka::sync::Cache;
use p384::ecdsa::signature::{Signer, Verifier};
use p384::ecdsa::{Signature, SigningKey, VerifyingKey};
use p384::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use p384::{PublicKey, SecretKey};
use parking_lot::RwLock;
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha384;
use std::collections::HashMap;
use zeroize::Zeroizing;

use regennexus_core::Error;

/// HKDF info label for ECDH-derived AES keys. Fixed for wire compatibility.
static SHARED_KEY_INFO: &[u8] = b"ReGenNexus-ECDH-Key";

/// A sealed blob: AES-256-GCM ciphertext (tag appended) and its 96-bit
/// nonce, both base64-encoded. No additional authenticated data is used,
/// for cross-runtime compatibility.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct CipherText {
    pub ciphertext: String,
    pub nonce: String,
}

/// Key-pair lifecycle, key agreement, sealing and signatures.
pub struct CryptoManager {
    private_keys: RwLock<HashMap<String, SecretKey>>,
    public_keys: RwLock<HashMap<String, PublicKey>>,
    shared_keys: Cache<(String, String), [u8; 32]>,
}

impl CryptoManager {
    /// Creates a manager with the given shared-key cache capacity.
    pub fn new(shared_key_cache_capacity: u64) -> Self {
        Self {
            private_keys: RwLock::new(HashMap::new()),
            public_keys: RwLock::new(HashMap::new()),
            shared_keys: Cache::builder()
                .max_capacity(shared_key_cache_capacity)
                .support_invalidation_closures()
                .build(),
        }
    }

    /// Generates a P-384 key pair for an entity and stores it in the
    /// keyring. Returns `(private_pem, public_pem)`; the private PEM is
    /// zeroized on drop.
    pub fn generate_keypair(&self, entity_id: &str) -> Result<(Zeroizing<String>, String), Error> {
        let secret = SecretKey::random(&mut OsRng);
        let public = secret.public_key();

        let private_pem = secret
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|err| Error::KeyFormat(err.to_string()))?;
        let public_pem = public
            .to_public_key_pem(LineEnding::LF)
            .map_err(|err| Error::KeyFormat(err.to_string()))?;

        self.private_keys
            .write()
            .insert(entity_id.to_string(), secret);
        self.public_keys
            .write()
            .insert(entity_id.to_string(), public);

        log::debug!(entity = entity_id; "generated key pair");
        Ok((private_pem, public_pem))
    }

    /// Imports an externally generated key pair. The public key is derived
    /// from the private key when not provided.
    pub fn import_keypair(
        &self,
        entity_id: &str,
        private_pem: &str,
        public_pem: Option<&str>,
    ) -> Result<(), Error> {
        let secret = SecretKey::from_pkcs8_pem(private_pem)
            .map_err(|err| Error::KeyFormat(err.to_string()))?;
        let public = match public_pem {
            Some(pem) => PublicKey::from_public_key_pem(pem)
                .map_err(|err| Error::KeyFormat(err.to_string()))?,
            None => secret.public_key(),
        };

        self.private_keys
            .write()
            .insert(entity_id.to_string(), secret);
        self.public_keys
            .write()
            .insert(entity_id.to_string(), public);
        self.invalidate_shared_keys(entity_id);
        Ok(())
    }

    /// Imports a peer's public key from PEM (SPKI).
    pub fn import_public_key(&self, entity_id: &str, public_pem: &str) -> Result<(), Error> {
        let public = PublicKey::from_public_key_pem(public_pem)
            .map_err(|err| Error::KeyFormat(err.to_string()))?;
        self.public_keys
            .write()
            .insert(entity_id.to_string(), public);
        self.invalidate_shared_keys(entity_id);
        Ok(())
    }

    /// Imports a peer's public key from DER (SPKI), as carried in envelopes.
    pub fn import_public_key_der(&self, entity_id: &str, der: &[u8]) -> Result<(), Error> {
        let public = PublicKey::from_public_key_der(der)
            .map_err(|err| Error::KeyFormat(err.to_string()))?;
        self.public_keys
            .write()
            .insert(entity_id.to_string(), public);
        self.invalidate_shared_keys(entity_id);
        Ok(())
    }

    pub fn has_public_key(&self, entity_id: &str) -> bool {
        self.public_keys.read().contains_key(entity_id)
    }

    /// DER (SPKI) encoding of an entity's public key.
    pub fn public_key_der(&self, entity_id: &str) -> Result<Vec<u8>, Error> {
        let keys = self.public_keys.read();
        let public = keys
            .get(entity_id)
            .ok_or_else(|| Error::KeyNotFound(entity_id.to_string()))?;
        Ok(public
            .to_public_key_der()
            .map_err(|err| Error::KeyFormat(err.to_string()))?
            .as_bytes()
            .to_vec())
    }

    /// Derives the 32-byte shared key between a local entity (private key in
    /// the keyring) and a remote entity (public key known): ECDH over P-384
    /// followed by HKDF-SHA384 with no salt and a fixed info label.
    ///
    /// The result is cached per `(local, remote)` pair. ECDH symmetry means
    /// `derive_shared_key(a, b) == derive_shared_key(b, a)` whenever both
    /// directions are derivable.
    pub fn derive_shared_key(&self, local_id: &str, remote_id: &str) -> Result<[u8; 32], Error> {
        let cache_key = (local_id.to_string(), remote_id.to_string());
        if let Some(key) = self.shared_keys.get(&cache_key) {
            return Ok(key);
        }

        let secret = {
            let keys = self.private_keys.read();
            keys.get(local_id)
                .ok_or_else(|| Error::KeyNotFound(local_id.to_string()))?
                .clone()
        };
        let public = {
            let keys = self.public_keys.read();
            keys.get(remote_id)
                .ok_or_else(|| Error::KeyNotFound(remote_id.to_string()))?
                .clone()
        };

        let shared = p384::ecdh::diffie_hellman(secret.to_nonzero_scalar(), public.as_affine());
        let hkdf = Hkdf::<Sha384>::new(None, shared.raw_secret_bytes());
        let mut derived = [0u8; 32];
        hkdf.expand(SHARED_KEY_INFO, &mut derived)
            .map_err(|err| Error::KeyFormat(err.to_string()))?;

        self.shared_keys.insert(cache_key, derived);
        log::debug!(local = local_id, remote = remote_id; "derived shared key");
        Ok(derived)
    }

    /// Seals a plaintext under a 32-byte key with a fresh random nonce.
    pub fn encrypt(&self, plaintext: &[u8], key: &[u8; 32]) -> Result<CipherText, Error> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| Error::Codec("AEAD seal failed".to_string()))?;

        Ok(CipherText {
            ciphertext: B64.encode(ciphertext),
            nonce: B64.encode(nonce),
        })
    }

    /// Opens a sealed blob. Fails with [`Error::Decrypt`] on any tag
    /// mismatch or malformed field, without revealing partial plaintext.
    pub fn decrypt(&self, data: &CipherText, key: &[u8; 32]) -> Result<Zeroizing<Vec<u8>>, Error> {
        let ciphertext = B64.decode(&data.ciphertext).map_err(|_| Error::Decrypt)?;
        let nonce = B64.decode(&data.nonce).map_err(|_| Error::Decrypt)?;
        if nonce.len() != 12 {
            return Err(Error::Decrypt);
        }

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
            .map_err(|_| Error::Decrypt)?;
        Ok(Zeroizing::new(plaintext))
    }

    /// Signs data with an entity's private key: ECDSA over P-384 with
    /// SHA-384, fixed-size (r || s) output.
    pub fn sign(&self, entity_id: &str, data: &[u8]) -> Result<Vec<u8>, Error> {
        let keys = self.private_keys.read();
        let secret = keys
            .get(entity_id)
            .ok_or_else(|| Error::KeyNotFound(entity_id.to_string()))?;
        let signing_key = SigningKey::from(secret);
        let signature: Signature = signing_key.sign(data);
        Ok(signature.to_bytes().to_vec())
    }

    /// Verifies a signature against an entity's public key. Missing keys and
    /// malformed signatures verify false.
    pub fn verify(&self, entity_id: &str, data: &[u8], signature: &[u8]) -> bool {
        let keys = self.public_keys.read();
        let Some(public) = keys.get(entity_id) else {
            log::warn!(entity = entity_id; "no public key for signature verification");
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        VerifyingKey::from(public).verify(data, &signature).is_ok()
    }

    /// Drops cached shared keys involving an entity, after a key rotation.
    fn invalidate_shared_keys(&self, entity_id: &str) {
        let entity_id = entity_id.to_string();
        self.shared_keys
            .invalidate_entries_if(move |(local, remote), _| {
                local == &entity_id || remote == &entity_id
            })
            .ok();
    }
}
