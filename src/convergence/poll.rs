//! Bounded poll-until-observed.
//!
//! Push delivery is best-effort, so a caller that must see a particular
//! seqno polls for it. The attempt budget is always finite; waiting longer
//! is up to the caller, by calling again.

use crate::chain::error::TeamError;
use crate::chain::loader;
use crate::chain::types::{LoadTeamArg, Seqno, Team};
use crate::context::TeamContext;
use crate::convergence::backoff::Backoff;
use log::debug;
use std::sync::Arc;

/// Force-reload the team in `arg` until its seqno reaches `target`,
/// sleeping per `backoff` between attempts.
///
/// Returns the first snapshot at or past `target`, or
/// [`TeamError::TimedOut`] once `max_attempts` reloads fell short.
pub async fn await_sequence_at_least(
    ctx: &TeamContext,
    arg: &LoadTeamArg,
    target: Seqno,
    max_attempts: u32,
    mut backoff: Backoff,
) -> Result<Arc<Team>, TeamError> {
    let arg = arg.clone().force_repoll();
    let mut observed = 0;

    for attempt in 1..=max_attempts {
        ctx.check_deadline()?;
        let team = loader::load(ctx, &arg).await?;
        observed = team.current_seqno();
        if observed >= target {
            debug!(
                "Team {} reached seqno {} (wanted {}) after {} poll(s)",
                team.id().short(),
                observed,
                target,
                attempt
            );
            return Ok(team);
        }
        if attempt < max_attempts {
            let delay = backoff.next_delay();
            debug!(
                "Team {} at seqno {}, waiting for {}; retrying in {:?}",
                team.id().short(),
                observed,
                target,
                delay
            );
            ctx.bounded(async {
                tokio::time::sleep(delay).await;
                Ok(())
            })
            .await?;
        }
    }

    Err(TeamError::TimedOut {
        team: arg.selector.to_string(),
        target,
        observed,
        attempts: max_attempts,
    })
}

/// [`await_sequence_at_least`] with the attempt budget and backoff from the
/// context's settings.
pub async fn await_seqno(
    ctx: &TeamContext,
    arg: &LoadTeamArg,
    target: Seqno,
) -> Result<Arc<Team>, TeamError> {
    let settings = ctx.settings();
    await_sequence_at_least(
        ctx,
        arg,
        target,
        settings.poll_attempts,
        settings.poll_backoff(),
    )
    .await
}
