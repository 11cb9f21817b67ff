//! Device keys, the user key directory boundary, secret sealing and
//! shared-secret generation management.

pub mod device;
pub mod directory;
pub mod generation;
pub mod sealing;

pub use device::{KeyError, LocalDevice, SecureEcPrivateKey};
pub use directory::{DeviceKey, UserKeyResolver, UserKeySet};
pub use generation::{rotate, rotate_if_needed, RotationTrigger};
pub use sealing::{SealedSecret, TeamSecret};
