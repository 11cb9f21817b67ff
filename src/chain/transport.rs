//! Boundary to whatever carries chain links between clients and the server.

use crate::chain::error::TransportError;
use crate::chain::types::{ChainLink, Position, Seqno, SignerRef, TeamId, TeamSelector, Visibility};
use crate::keys::sealing::SealedSecret;
use async_trait::async_trait;

/// Request for the links of one team beyond a known seqno.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub selector: TeamSelector,
    pub visibility: Visibility,
    /// Return links with seqno strictly greater than this (0 for all).
    pub after: Seqno,
    /// Device asking; only boxes sealed to it are returned.
    pub requester: SignerRef,
}

/// Links and sealed secrets returned by a fetch.
#[derive(Debug, Clone)]
pub struct FetchedChain {
    pub team: TeamId,
    pub links: Vec<ChainLink>,
    pub boxes: Vec<SealedSecret>,
}

/// Append-only chain storage.
///
/// Implementations must reject a submission whose seqno is not exactly one
/// past the current tail with [`TransportError::SeqnoConflict`].
#[async_trait]
pub trait TeamTransport: Send + Sync {
    async fn fetch_links(&self, request: &FetchRequest) -> Result<FetchedChain, TransportError>;

    /// Append `link` and publish `boxes` alongside it.
    async fn submit_link(
        &self,
        link: ChainLink,
        boxes: Vec<SealedSecret>,
    ) -> Result<(), TransportError>;

    /// The global position the next signed statement should claim.
    async fn current_position(&self) -> Result<Position, TransportError>;
}
