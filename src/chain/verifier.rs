//! Revocation-aware link signature verification.
//!
//! A signature is judged against the signing key's validity interval at the
//! position the link claims, not against the key's status today. A key
//! revoked later still vouches for what it signed before revocation.

use crate::chain::error::{DirectoryError, IntegrityError, TeamError, VerifyError};
use crate::chain::types::{ChainLink, Position};
use crate::keys::directory::{DeviceKey, UserKeyResolver};
use log::{debug, warn};
use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature, VerifyingKey};

/// Check one signed statement against a key record.
///
/// Pure: the outcome depends only on the arguments.
pub fn verify_statement(
    message: &[u8; 32],
    signature: &[u8],
    key: &DeviceKey,
    position: Position,
) -> Result<(), VerifyError> {
    if position < key.active_from {
        return Err(VerifyError::KeyNotYetValid {
            key_id: key.key_id,
            position,
            active_from: key.active_from,
        });
    }
    if let Some(revoked_at) = key.revoked_at {
        if position >= revoked_at {
            return Err(VerifyError::KeyRevoked {
                key_id: key.key_id,
                position,
                revoked_at,
            });
        }
    }
    verify_es256(&key.signing_key, message, signature)
}

/// Verify ES256 (P-256/secp256r1) signature.
fn verify_es256(public_key: &[u8], message: &[u8; 32], signature: &[u8]) -> Result<(), VerifyError> {
    let verifying_key =
        VerifyingKey::from_sec1_bytes(public_key).map_err(|e| VerifyError::BadSignature {
            reason: format!("Invalid P-256 public key: {}", e),
        })?;

    let sig = Signature::from_slice(signature).map_err(|e| VerifyError::BadSignature {
        reason: format!("Invalid ES256 signature format: {}", e),
    })?;

    verifying_key
        .verify(message, &sig)
        .map_err(|_| VerifyError::BadSignature {
            reason: "Signature does not match signing key".to_string(),
        })
}

/// Resolve a link's signer and verify its signature at the link's position.
pub async fn verify_link(
    resolver: &dyn UserKeyResolver,
    link: &ChainLink,
) -> Result<(), TeamError> {
    let signer = link.signer();
    let key = match resolver.resolve_key(&signer.user, &signer.key_id).await {
        Ok(key) => key,
        Err(DirectoryError::UnknownKey { user, key_id }) => {
            return Err(IntegrityError::Signature {
                seqno: link.seqno(),
                source: VerifyError::UnknownKey { user, key_id },
            }
            .into())
        }
        Err(e) => return Err(e.into()),
    };

    let message = link.body.signing_message()?;
    verify_statement(&message, &link.signature, &key, link.body.position).map_err(|source| {
        warn!(
            "Link {} of team {} rejected: {}",
            link.seqno(),
            link.team().short(),
            source
        );
        IntegrityError::Signature {
            seqno: link.seqno(),
            source,
        }
    })?;

    debug!(
        "Verified link {} of team {} signed by {}/{}",
        link.seqno(),
        link.team().short(),
        signer.user,
        signer.key_id.short()
    );
    Ok(())
}
