//! Keeping clients converged on the latest team state: push-driven
//! invalidation plus a bounded polling fallback.

pub mod backoff;
pub mod controller;
pub mod poll;

pub use backoff::Backoff;
pub use controller::{InvalidationController, SubscriptionState};
pub use poll::{await_seqno, await_sequence_at_least};
