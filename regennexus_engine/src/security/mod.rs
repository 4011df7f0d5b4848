//! The security core: crypto primitives, certificate authority, bearer
//! tokens, access-control policy, and the [`SecurityManager`] facade that
//! composes them for the router and sessions.

pub mod auth;
pub mod crypto;
pub mod policy;

pub use auth::{AuthToken, Certificate, CertificateAuthority, TokenService};
pub use crypto::{CipherText, CryptoManager};
pub use policy::{AccessContext, Condition, Effect, Policy, PolicyEngine, match_permission};

use base64::{Engine, engine::general_purpose::STANDARD as B64};
use std::sync::Arc;

use regennexus_core::{ENVELOPE_ALGORITHM, Envelope, Error, Message, Wire, to_canonical_json};

use crate::config::SecurityConfig;

/// Facade over the security subsystems, shared by the router and every
/// session of one deployment.
pub struct SecurityManager {
    crypto: CryptoManager,
    ca: Arc<CertificateAuthority>,
    tokens: TokenService,
    policy: PolicyEngine,
}

impl Default for SecurityManager {
    fn default() -> Self {
        Self::new(SecurityConfig::default())
    }
}

impl SecurityManager {
    pub fn new(config: SecurityConfig) -> Self {
        let ca = Arc::new(CertificateAuthority::new());
        Self {
            crypto: CryptoManager::new(config.shared_key_cache_capacity),
            tokens: TokenService::new(ca.clone()),
            ca,
            policy: PolicyEngine::new(),
        }
    }

    pub fn crypto(&self) -> &CryptoManager {
        &self.crypto
    }

    pub fn ca(&self) -> &CertificateAuthority {
        &self.ca
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    pub fn policy(&self) -> &PolicyEngine {
        &self.policy
    }

    /// Seals a message from `sender` to `recipient` into an envelope.
    ///
    /// The plaintext is the canonical JSON form of the message; the
    /// sender's DER public key rides along so a standalone decryptor can
    /// complete the handshake.
    pub fn encrypt_message(
        &self,
        sender: &str,
        recipient: &str,
        message: &Message,
    ) -> Result<Envelope, Error> {
        let key = self.crypto.derive_shared_key(sender, recipient)?;
        let plaintext = to_canonical_json(message)?;
        let sealed = self.crypto.encrypt(&plaintext, &key)?;
        let sender_public_key = hex::encode(self.crypto.public_key_der(sender)?);

        Ok(Envelope {
            algorithm: ENVELOPE_ALGORITHM.to_string(),
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            encrypted: true,
            id: message.id.clone(),
            timestamp: message.timestamp,
            sender_public_key,
            nonce: sealed.nonce,
            ciphertext: sealed.ciphertext,
        })
    }

    /// Opens a wire form for `recipient`. Plaintext messages pass through
    /// unchanged; envelopes are decrypted with the ECDH shared key,
    /// importing the sender's public key from the envelope when it is not
    /// already in the keyring.
    pub fn decrypt_message(&self, recipient: &str, wire: &Wire) -> Result<Message, Error> {
        let envelope = match wire {
            Wire::Plain(message) => return Ok(message.clone()),
            Wire::Sealed(envelope) => envelope,
        };
        if envelope.algorithm != ENVELOPE_ALGORITHM {
            log::warn!(algorithm = envelope.algorithm.as_str(); "unsupported envelope algorithm");
            return Err(Error::Decrypt);
        }

        if !self.crypto.has_public_key(&envelope.sender) {
            let der = hex::decode(&envelope.sender_public_key).map_err(|_| Error::Decrypt)?;
            self.crypto.import_public_key_der(&envelope.sender, &der)?;
        }

        let key = self.crypto.derive_shared_key(recipient, &envelope.sender)?;
        let sealed = CipherText {
            ciphertext: envelope.ciphertext.clone(),
            nonce: envelope.nonce.clone(),
        };
        let plaintext = self.crypto.decrypt(&sealed, &key)?;
        let message: Message = serde_json::from_slice(&plaintext)?;
        Ok(message)
    }

    /// Authenticates an entity: the certificate must verify under the CA,
    /// its `entity_id` extension must match, and its embedded public key
    /// must equal the presented DER key.
    pub fn authenticate(&self, entity_id: &str, cert_pem: &str, public_key_der: &[u8]) -> bool {
        if !self.ca.verify(cert_pem) {
            return false;
        }
        let Ok(certificate) = Certificate::from_pem(cert_pem) else {
            return false;
        };
        if certificate.extensions.entity_id.as_deref() != Some(entity_id) {
            log::warn!(entity = entity_id; "certificate entity ID mismatch");
            return false;
        }
        match B64.decode(&certificate.public_key) {
            Ok(embedded) if embedded == public_key_der => true,
            _ => {
                log::warn!(entity = entity_id; "certificate public key mismatch");
                false
            }
        }
    }

    /// Signs a message with its sender's key over the canonical form.
    pub fn sign_message(&self, message: &Message) -> Result<Message, Error> {
        let signature = self.crypto.sign(&message.sender, &message.signing_bytes()?)?;
        let mut signed = message.clone();
        signed.signature = Some(hex::encode(signature));
        Ok(signed)
    }

    /// Verifies a message signature against the sender's public key.
    /// Unsigned messages verify false.
    pub fn verify_message(&self, message: &Message) -> bool {
        let Some(signature_hex) = &message.signature else {
            return false;
        };
        let Ok(signature) = hex::decode(signature_hex) else {
            return false;
        };
        let Ok(bytes) = message.signing_bytes() else {
            return false;
        };
        self.crypto.verify(&message.sender, &bytes, &signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn security_with_peers() -> SecurityManager {
        let security = SecurityManager::default();
        security.crypto().generate_keypair("alice").unwrap();
        security.crypto().generate_keypair("bob").unwrap();
        security
    }

    #[test]
    fn test_encrypted_message_roundtrip() {
        let security = security_with_peers();
        let message = Message::new("alice", "bob", "secret", json!({"text": "hello"}));
        let envelope = security.encrypt_message("alice", "bob", &message).unwrap();

        assert_eq!(envelope.algorithm, ENVELOPE_ALGORITHM);
        assert!(envelope.encrypted);
        assert_eq!(envelope.id, message.id);

        let opened = security
            .decrypt_message("bob", &Wire::Sealed(envelope))
            .unwrap();
        assert_eq!(opened, message);
    }

    #[test]
    fn test_decrypt_imports_sender_key_from_envelope() {
        // sender and recipient live in different processes
        let sender_side = SecurityManager::default();
        sender_side.crypto().generate_keypair("alice").unwrap();

        let recipient_side = SecurityManager::default();
        recipient_side.crypto().generate_keypair("bob").unwrap();

        // alice only needs bob's public key
        let bob_der = recipient_side.crypto().public_key_der("bob").unwrap();
        sender_side
            .crypto()
            .import_public_key_der("bob", &bob_der)
            .unwrap();

        let message = Message::new("alice", "bob", "secret", json!("hi"));
        let envelope = sender_side
            .encrypt_message("alice", "bob", &message)
            .unwrap();

        // bob has never seen alice's key; the envelope carries it
        let opened = recipient_side
            .decrypt_message("bob", &Wire::Sealed(envelope))
            .unwrap();
        assert_eq!(opened, message);
    }

    #[test]
    fn test_plaintext_passthrough() {
        let security = security_with_peers();
        let message = Message::new("alice", "bob", "query", json!("ping"));
        let opened = security
            .decrypt_message("bob", &Wire::Plain(message.clone()))
            .unwrap();
        assert_eq!(opened, message);
    }

    #[test]
    fn test_tampered_envelope_fails() {
        let security = security_with_peers();
        let message = Message::new("alice", "bob", "secret", json!("hello"));
        let mut envelope = security.encrypt_message("alice", "bob", &message).unwrap();

        let mut raw = B64.decode(&envelope.ciphertext).unwrap();
        raw[0] ^= 0x01;
        envelope.ciphertext = B64.encode(raw);

        assert!(matches!(
            security.decrypt_message("bob", &Wire::Sealed(envelope.clone())),
            Err(Error::Decrypt)
        ));

        envelope.algorithm = "RSA-2048+AES-256-CBC".to_string();
        assert!(matches!(
            security.decrypt_message("bob", &Wire::Sealed(envelope)),
            Err(Error::Decrypt)
        ));
    }

    #[test]
    fn test_message_signing() {
        let security = security_with_peers();
        let message = Message::new("alice", "bob", "attest", json!({"n": 1}));
        assert!(!security.verify_message(&message));

        let signed = security.sign_message(&message).unwrap();
        assert!(security.verify_message(&signed));

        let mut altered = signed.clone();
        altered.payload = json!({"n": 2});
        assert!(!security.verify_message(&altered));
    }

    #[test]
    fn test_authenticate() {
        let security = security_with_peers();
        security.ca().bootstrap().unwrap();
        let alice_der = security.crypto().public_key_der("alice").unwrap();
        let cert = security.ca().issue("alice", &alice_der).unwrap();

        assert!(security.authenticate("alice", &cert, &alice_der));
        // wrong entity
        assert!(!security.authenticate("bob", &cert, &alice_der));
        // wrong key binding
        let bob_der = security.crypto().public_key_der("bob").unwrap();
        assert!(!security.authenticate("alice", &cert, &bob_der));
        // revoked certificate authenticates nothing
        let serial = Certificate::from_pem(&cert).unwrap().serial_number;
        security.ca().revoke(serial);
        assert!(!security.authenticate("alice", &cert, &alice_der));
    }
}
