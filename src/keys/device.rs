//! Local device keys with automatic zeroization.
//!
//! A device holds two P-256 keys: an ECDSA signing key for chain links and
//! an ECDH key that team secrets are sealed to.

use crate::chain::types::{DeviceKind, KeyId, Position, SignerRef, UserId};
use crate::keys::directory::DeviceKey;
use crate::keys::sealing::{self, SealedSecret, TeamSecret};
use elliptic_curve::sec1::ToEncodedPoint;
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use p256::{PublicKey, SecretKey};
use rand_core::OsRng;
use secrecy::{ExposeSecret, Secret};
use std::fmt;

/// Error type for key operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("Invalid key size: expected {expected}, got {got}")]
    InvalidKeySize { expected: usize, got: usize },

    #[error("Invalid key format: {0}")]
    InvalidFormat(String),

    #[error("Cryptographic operation failed: {0}")]
    CryptoError(String),
}

/// Secure wrapper for a device's EC private key (P-256).
///
/// The key material is automatically zeroized when dropped.
pub struct SecureEcPrivateKey {
    inner: Secret<[u8; 32]>,
}

impl SecureEcPrivateKey {
    /// Create from raw bytes.
    ///
    /// # Security
    /// The input bytes are copied and the original should be zeroized by the caller.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.len() != 32 {
            return Err(KeyError::InvalidKeySize {
                expected: 32,
                got: bytes.len(),
            });
        }

        let mut key_array = [0u8; 32];
        key_array.copy_from_slice(bytes);

        Ok(Self {
            inner: Secret::new(key_array),
        })
    }

    /// Generate a fresh random key.
    pub fn generate() -> Result<Self, KeyError> {
        let secret_key = SecretKey::random(&mut OsRng);
        Self::from_bytes(secret_key.to_bytes().as_slice())
    }

    /// Get the corresponding public key (compressed format, 33 bytes).
    pub fn public_key(&self) -> Result<Vec<u8>, KeyError> {
        let public_key = self.as_secret_key()?.public_key();
        let compressed = public_key.to_encoded_point(true);

        Ok(compressed.as_bytes().to_vec())
    }

    /// Perform ECDH key agreement.
    ///
    /// Returns the x-coordinate of the shared point (32 bytes).
    pub fn perform_ecdh(&self, peer_public: &PublicKey) -> Result<[u8; 32], KeyError> {
        Ok(sealing::ecdh_x(&self.as_secret_key()?, peer_public))
    }

    /// Get the raw p256 SecretKey for low-level operations.
    ///
    /// # Security
    /// Use with caution - the returned key should not be stored or logged.
    pub fn as_secret_key(&self) -> Result<SecretKey, KeyError> {
        SecretKey::from_bytes(self.inner.expose_secret().into())
            .map_err(|e| KeyError::CryptoError(e.to_string()))
    }
}

impl fmt::Debug for SecureEcPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecureEcPrivateKey([REDACTED])")
    }
}

impl Clone for SecureEcPrivateKey {
    fn clone(&self) -> Self {
        let mut new_bytes = [0u8; 32];
        new_bytes.copy_from_slice(self.inner.expose_secret());
        Self {
            inner: Secret::new(new_bytes),
        }
    }
}

/// The identity this process acts as: one user's device.
#[derive(Clone)]
pub struct LocalDevice {
    user: UserId,
    key_id: KeyId,
    kind: DeviceKind,
    signing: SigningKey,
    encryption: SecureEcPrivateKey,
}

impl LocalDevice {
    /// Generate new signing and encryption keys for `user`.
    pub fn generate(user: UserId, kind: DeviceKind) -> Result<Self, KeyError> {
        let signing = SigningKey::random(&mut OsRng);
        let encryption = SecureEcPrivateKey::generate()?;
        let key_id = KeyId::from_public_key(&encode_verifying_key(&signing));
        Ok(Self {
            user,
            key_id,
            kind,
            signing,
            encryption,
        })
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    pub fn key_id(&self) -> KeyId {
        self.key_id
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn signer(&self) -> SignerRef {
        SignerRef {
            user: self.user.clone(),
            key_id: self.key_id,
        }
    }

    /// SEC1 compressed ECDSA verifying key.
    pub fn signing_public_key(&self) -> Vec<u8> {
        encode_verifying_key(&self.signing)
    }

    /// SEC1 compressed ECDH public key that secrets are sealed to.
    pub fn encryption_public_key(&self) -> Result<Vec<u8>, KeyError> {
        self.encryption.public_key()
    }

    /// ES256 signature (64 bytes) over a 32-byte message.
    pub fn sign(&self, message: &[u8; 32]) -> Vec<u8> {
        let signature: Signature = self.signing.sign(message);
        signature.to_bytes().to_vec()
    }

    /// Unseal a team secret addressed to this device.
    pub fn open(&self, sealed: &SealedSecret) -> Result<TeamSecret, KeyError> {
        sealing::open(sealed, &self.encryption)
    }

    /// Directory record for this device, active from `active_from`.
    pub fn public_record(&self, active_from: Position) -> Result<DeviceKey, KeyError> {
        Ok(DeviceKey {
            key_id: self.key_id,
            kind: self.kind,
            signing_key: self.signing_public_key(),
            encryption_key: self.encryption_public_key()?,
            active_from,
            revoked_at: None,
        })
    }
}

impl fmt::Debug for LocalDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalDevice")
            .field("user", &self.user)
            .field("key_id", &self.key_id)
            .field("kind", &self.kind)
            .field("keys", &"[REDACTED]")
            .finish()
    }
}

fn encode_verifying_key(signing: &SigningKey) -> Vec<u8> {
    signing
        .verifying_key()
        .to_encoded_point(true)
        .as_bytes()
        .to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ec_key_from_bytes() {
        let bytes = [0x42u8; 32];
        let key = SecureEcPrivateKey::from_bytes(&bytes).unwrap();

        // Public key should be 33 bytes (compressed)
        let public = key.public_key().unwrap();
        assert_eq!(public.len(), 33);
    }

    #[test]
    fn test_ec_key_invalid_size() {
        let bytes = [0x42u8; 16];
        let result = SecureEcPrivateKey::from_bytes(&bytes);
        assert!(matches!(result, Err(KeyError::InvalidKeySize { .. })));
    }

    #[test]
    fn test_ec_key_debug_redacted() {
        let bytes = [0x42u8; 32];
        let key = SecureEcPrivateKey::from_bytes(&bytes).unwrap();

        let debug_str = format!("{:?}", key);
        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("42"));
    }

    #[test]
    fn test_device_key_id_matches_signing_key() {
        let device = LocalDevice::generate(UserId::new("alice"), DeviceKind::Desktop).unwrap();
        assert_eq!(
            device.key_id(),
            KeyId::from_public_key(&device.signing_public_key())
        );

        let record = device.public_record(7).unwrap();
        assert_eq!(record.key_id, device.key_id());
        assert_eq!(record.active_from, 7);
        assert!(record.revoked_at.is_none());
        assert_eq!(record.encryption_key.len(), 33);
    }

    #[test]
    fn test_ecdh_is_symmetric() {
        let a = SecureEcPrivateKey::generate().unwrap();
        let b = SecureEcPrivateKey::generate().unwrap();
        let a_pub = a.as_secret_key().unwrap().public_key();
        let b_pub = b.as_secret_key().unwrap().public_key();

        assert_eq!(a.perform_ecdh(&b_pub).unwrap(), b.perform_ecdh(&a_pub).unwrap());
    }
}
