//! Signed team chains: verification, state replay, caching and edits.
//!
//! A team is an append-only chain of signed links. Loading a team fetches
//! the links the local cache has not seen, verifies each one against the
//! signer's device key at the link's claimed position, and replays it onto
//! the cached state. Ancestors are loaded the same way to judge implicit
//! admin authority in subteams.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────┐     ┌──────────────┐     ┌─────────────────┐
//! │ TeamTransport │────▶│    loader    │────▶│    TeamCache    │
//! │    (trait)    │     │ (one flight  │     │ (moka, fresh-   │
//! └───────────────┘     │  per team)   │     │  ness window)   │
//!        ▲              └──────────────┘     └─────────────────┘
//!        │                 │        │
//!        │                 ▼        ▼
//! ┌───────────────┐  ┌──────────┐ ┌─────────┐     ┌─────────────────┐
//! │    editor     │  │ verifier │ │  state  │◀────│ UserKeyResolver │
//! │ (sign+submit) │  │ (ES256)  │ │ (replay)│     │     (trait)     │
//! └───────────────┘  └──────────┘ └─────────┘     └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use teamchain::chain::{editor, loader, LoadTeamArg, Role, Visibility};
//!
//! let acme = editor::create_team(&ctx, &"acme".parse()?, Visibility::Private).await?;
//! editor::add_member(&ctx, acme.id(), &UserId::new("bob"), Role::Writer).await?;
//!
//! let team = loader::load(&ctx, &LoadTeamArg::by_id(acme.id()).force_repoll()).await?;
//! assert_eq!(team.role_of(&UserId::new("bob")), Some(Role::Writer));
//! ```

pub mod cache;
pub mod editor;
pub mod error;
pub mod loader;
pub mod state;
pub mod transport;
pub mod types;
pub mod verifier;

pub use cache::TeamCache;
pub use editor::{
    add_member, change_role, create_subteam, create_team, delete_team, leave, remove_member,
    rename,
};
pub use error::{DirectoryError, IntegrityError, NameError, TeamError, TransportError, VerifyError};
pub use loader::load;
pub use transport::{FetchRequest, FetchedChain, TeamTransport};
pub use types::{
    ChainLink, ChangeFlags, Generation, LinkPayload, LoadTeamArg, Position, Role, Seqno, Team,
    TeamId, TeamName, TeamNotification, TeamSelector, UserId, Visibility,
};
pub use verifier::{verify_link, verify_statement};
