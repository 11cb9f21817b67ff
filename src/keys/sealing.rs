//! Sealing of team secrets to individual device keys.
//!
//! Each recipient gets its own box: an ephemeral P-256 ECDH against the
//! device's encryption key, HKDF-SHA256 to derive a wrapping key, then
//! AES-256-GCM over the 32-byte team secret.

use crate::chain::types::{Generation, KeyId, TeamId, UserId};
use crate::keys::device::{KeyError, SecureEcPrivateKey};
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::KeyInit;
use aes_gcm::aead::{Aead, Key};
use aes_gcm::Aes256Gcm;
use hkdf::Hkdf;
use p256::{PublicKey, SecretKey};
use rand_core::{OsRng, RngCore};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// HKDF info for wrapping keys.
const SEAL_INFO: &[u8] = b"teamchain.sealed-secret.v1";

/// Domain separation for the published key check.
const KEY_CHECK_DOMAIN: &[u8] = b"teamchain.key-check.v1";

/// One generation's raw shared secret.
pub struct TeamSecret {
    inner: Secret<[u8; 32]>,
}

impl TeamSecret {
    /// Fresh random secret.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self {
            inner: Secret::new(bytes),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let array: [u8; 32] = bytes.try_into().map_err(|_| KeyError::InvalidKeySize {
            expected: 32,
            got: bytes.len(),
        })?;
        Ok(Self {
            inner: Secret::new(array),
        })
    }

    /// Raw secret bytes.
    ///
    /// # Security
    /// Handle with care - this exposes the raw key material.
    pub fn expose(&self) -> &[u8; 32] {
        self.inner.expose_secret()
    }

    /// Commitment published in rotation links.
    pub fn key_check(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(KEY_CHECK_DOMAIN);
        hasher.update(self.inner.expose_secret());
        hasher.finalize().into()
    }

    /// Constant-time comparison.
    pub fn ct_eq(&self, other: &TeamSecret) -> bool {
        constant_time_eq(self.expose(), other.expose())
    }
}

impl Clone for TeamSecret {
    fn clone(&self) -> Self {
        let mut new_bytes = [0u8; 32];
        new_bytes.copy_from_slice(self.inner.expose_secret());
        Self {
            inner: Secret::new(new_bytes),
        }
    }
}

impl fmt::Debug for TeamSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TeamSecret([REDACTED])")
    }
}

/// A team secret sealed to one recipient device.
#[derive(Clone, Serialize, Deserialize)]
pub struct SealedSecret {
    pub team: TeamId,
    pub generation: Generation,
    pub recipient: UserId,
    pub recipient_key: KeyId,
    /// Compressed SEC1 ephemeral public key.
    pub ephemeral_public: Vec<u8>,
    pub nonce: Vec<u8>,
    /// Ciphertext plus 16-byte GCM tag.
    pub ciphertext: Vec<u8>,
}

impl fmt::Debug for SealedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SealedSecret")
            .field("team", &self.team)
            .field("generation", &self.generation)
            .field("recipient", &self.recipient)
            .field("recipient_key", &self.recipient_key)
            .field("ciphertext", &format!("[{} bytes]", self.ciphertext.len()))
            .finish()
    }
}

/// ECDH returning the x-coordinate of the shared point.
pub fn ecdh_x(private_key: &SecretKey, public_key: &PublicKey) -> [u8; 32] {
    use elliptic_curve::point::AffineCoordinates;
    let scalar = private_key.to_nonzero_scalar();
    let public_point = public_key.to_projective();
    let shared_point = (public_point * *scalar).to_affine();
    let mut x = [0u8; 32];
    x.copy_from_slice(shared_point.x().as_slice());
    x
}

/// HKDF salt binding a box to its team and generation.
fn seal_salt(team: &TeamId, generation: Generation) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(team.as_bytes());
    hasher.update(generation.to_le_bytes());
    hasher.finalize().into()
}

fn wrapping_cipher(
    shared_secret: &[u8; 32],
    team: &TeamId,
    generation: Generation,
) -> Result<Aes256Gcm, KeyError> {
    let salt = seal_salt(team, generation);
    let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared_secret);
    let mut derived_key = [0u8; 32];
    hkdf.expand(SEAL_INFO, &mut derived_key)
        .map_err(|e| KeyError::CryptoError(format!("HKDF expansion failed: {}", e)))?;
    let key = Key::<Aes256Gcm>::from(derived_key);
    Ok(Aes256Gcm::new(&key))
}

/// Seal `secret` to a recipient's encryption key (SEC1 bytes).
pub fn seal(
    secret: &TeamSecret,
    team: TeamId,
    generation: Generation,
    recipient: &UserId,
    recipient_key: KeyId,
    recipient_public: &[u8],
) -> Result<SealedSecret, KeyError> {
    use elliptic_curve::sec1::ToEncodedPoint;

    let recipient_public = PublicKey::from_sec1_bytes(recipient_public)
        .map_err(|e| KeyError::InvalidFormat(format!("Invalid P-256 public key: {}", e)))?;

    let ephemeral = SecretKey::random(&mut OsRng);
    let shared = ecdh_x(&ephemeral, &recipient_public);
    let cipher = wrapping_cipher(&shared, &team, generation)?;

    let mut nonce = [0u8; 12];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(GenericArray::from_slice(&nonce), secret.expose().as_slice())
        .map_err(|e| KeyError::CryptoError(format!("AES-GCM encryption failed: {}", e)))?;

    Ok(SealedSecret {
        team,
        generation,
        recipient: recipient.clone(),
        recipient_key,
        ephemeral_public: ephemeral
            .public_key()
            .to_encoded_point(true)
            .as_bytes()
            .to_vec(),
        nonce: nonce.to_vec(),
        ciphertext,
    })
}

/// Open a box with the recipient device's encryption key.
pub fn open(sealed: &SealedSecret, key: &SecureEcPrivateKey) -> Result<TeamSecret, KeyError> {
    if sealed.nonce.len() != 12 {
        return Err(KeyError::InvalidKeySize {
            expected: 12,
            got: sealed.nonce.len(),
        });
    }
    let ephemeral = PublicKey::from_sec1_bytes(&sealed.ephemeral_public)
        .map_err(|e| KeyError::InvalidFormat(format!("Invalid ephemeral key: {}", e)))?;
    let shared = key.perform_ecdh(&ephemeral)?;
    let cipher = wrapping_cipher(&shared, &sealed.team, sealed.generation)?;

    let plaintext = cipher
        .decrypt(
            GenericArray::from_slice(&sealed.nonce),
            sealed.ciphertext.as_slice(),
        )
        .map_err(|e| KeyError::CryptoError(format!("AES-GCM decryption failed: {}", e)))?;
    TeamSecret::from_bytes(&plaintext)
}

/// Constant-time byte comparison to prevent timing attacks.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
