//! Boundary to the per-user public key directory.

use crate::chain::error::DirectoryError;
use crate::chain::types::{DeviceKind, KeyId, Position, UserId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Public record of one device key and its validity interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceKey {
    pub key_id: KeyId,
    pub kind: DeviceKind,
    /// SEC1 ECDSA verifying key.
    pub signing_key: Vec<u8>,
    /// SEC1 ECDH key secrets are sealed to.
    pub encryption_key: Vec<u8>,
    pub active_from: Position,
    pub revoked_at: Option<Position>,
}

impl DeviceKey {
    /// Whether a statement claiming `position` falls within the key's interval.
    ///
    /// The revocation position itself is already outside the interval.
    pub fn is_active_at(&self, position: Position) -> bool {
        position >= self.active_from && self.revoked_at.map_or(true, |r| position < r)
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }
}

/// All known device keys of one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserKeySet {
    pub user: UserId,
    pub devices: Vec<DeviceKey>,
}

impl UserKeySet {
    /// Devices that are not revoked.
    pub fn active_devices(&self) -> impl Iterator<Item = &DeviceKey> {
        self.devices.iter().filter(|d| !d.is_revoked())
    }

    pub fn get(&self, key_id: &KeyId) -> Option<&DeviceKey> {
        self.devices.iter().find(|d| d.key_id == *key_id)
    }
}

/// Resolves users and key ids to public key material.
///
/// Answers are treated as ground truth by the verifier.
#[async_trait]
pub trait UserKeyResolver: Send + Sync {
    /// Look up a single device key, including revoked ones.
    async fn resolve_key(&self, user: &UserId, key_id: &KeyId)
        -> Result<DeviceKey, DirectoryError>;

    /// Load every device key of `user`. `force_poll` bypasses any resolver cache.
    async fn load_latest(&self, user: &UserId, force_poll: bool)
        -> Result<UserKeySet, DirectoryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(active_from: Position, revoked_at: Option<Position>) -> DeviceKey {
        DeviceKey {
            key_id: KeyId::from_public_key(b"test"),
            kind: DeviceKind::Desktop,
            signing_key: vec![],
            encryption_key: vec![],
            active_from,
            revoked_at,
        }
    }

    #[test]
    fn test_validity_interval() {
        let k = key(5, Some(10));
        assert!(!k.is_active_at(4));
        assert!(k.is_active_at(5));
        assert!(k.is_active_at(9));
        assert!(!k.is_active_at(10));
        assert!(!k.is_active_at(11));

        let open = key(5, None);
        assert!(open.is_active_at(u64::MAX));
    }

    #[test]
    fn test_active_devices_skip_revoked() {
        let mut revoked = key(1, Some(3));
        revoked.key_id = KeyId::from_public_key(b"old");
        let set = UserKeySet {
            user: UserId::new("bob"),
            devices: vec![revoked, key(2, None)],
        };
        assert_eq!(set.active_devices().count(), 1);
        assert!(set.get(&KeyId::from_public_key(b"old")).is_some());
    }
}
