//! Loading teams: cache lookup, single-flight fetch, in-order verification
//! and merge.
//!
//! A merge works on a private copy of the cached snapshot. Only a fully
//! verified result is published, so a failed load leaves the cache as it
//! was.

use crate::chain::cache::{FlightKey, LoadResult, SharedLoad};
use crate::chain::error::{IntegrityError, TeamError};
use crate::chain::transport::{FetchRequest, FetchedChain};
use crate::chain::types::{
    ChainLink, LoadTeamArg, Team, TeamId, TeamName, TeamSelector, Visibility,
};
use crate::chain::verifier::verify_link;
use crate::context::TeamContext;
use crate::keys::generation::open_generations;
use crate::permissions::{self, Ancestry};
use futures_util::future::FutureExt;
use log::{debug, info, warn};
use std::sync::Arc;

/// Load a verified team snapshot.
///
/// A cached copy is returned when staleness is allowed or it is inside the
/// freshness window, unless a repoll or full reload is forced. Otherwise
/// the caller joins the in-flight load for the same team, or starts one.
/// A full reload never settles for a load it did not start: it waits for
/// the one in flight to finish and then runs its own.
pub async fn load(ctx: &TeamContext, arg: &LoadTeamArg) -> Result<Arc<Team>, TeamError> {
    ctx.check_deadline()?;
    let key = resolve_target(ctx, arg).await;

    if let FlightKey::Id(id) = &key {
        ctx.check_lineage(*id)?;
        if !arg.force_repoll && !arg.force_full_reload {
            if let Some(hit) = ctx.cache().lookup(id).await {
                if arg.allow_stale || hit.fresh {
                    debug!(
                        "Cache hit for team {} at seqno {}",
                        id.short(),
                        hit.team.current_seqno()
                    );
                    return Ok(hit.team);
                }
            }
        }
        debug!("Cache miss for team {}, fetching", id.short());
    }

    loop {
        let _wait = match &key {
            FlightKey::Id(id) => Some(ctx.cache().begin_wait(ctx.lineage(), *id)?),
            FlightKey::Name(..) => None,
        };
        let (flight, leader) = start_flight(ctx, arg, key.clone());
        if leader || !arg.force_full_reload {
            return ctx.bounded(flight).await;
        }
        debug!(
            "Full reload of {} waiting for the load in flight",
            arg.selector
        );
        let _ = ctx.bounded(flight).await;
        ctx.check_deadline()?;
    }
}

/// Root names map straight to ids; subteam names go through the name index.
async fn resolve_target(ctx: &TeamContext, arg: &LoadTeamArg) -> FlightKey {
    match &arg.selector {
        TeamSelector::Id(id) => FlightKey::Id(*id),
        TeamSelector::Name(name) if name.is_root() => {
            FlightKey::Id(TeamId::root(name, arg.visibility))
        }
        TeamSelector::Name(name) => match ctx.cache().resolve_name(name, arg.visibility).await {
            Some(id) => FlightKey::Id(id),
            None => FlightKey::Name(name.clone(), arg.visibility),
        },
    }
}

/// Join the flight for `key`, or start one. Returns the flight and whether
/// this caller started it.
///
/// Kept synchronous so the boxed flight future breaks the type recursion
/// between loading a team and loading its ancestors.
fn start_flight(ctx: &TeamContext, arg: &LoadTeamArg, key: FlightKey) -> (SharedLoad, bool) {
    let (flight, leader) = ctx.cache().join_or_start(key.clone(), || {
        let ctx = ctx.clone();
        let arg = arg.clone();
        async move {
            let result = match &key {
                FlightKey::Id(id) => fetch_and_merge(&ctx, &arg, *id).await,
                FlightKey::Name(name, visibility) => {
                    load_by_name(&ctx, &arg, name, *visibility).await
                }
            };
            ctx.cache().finish(&key);
            result
        }
        .boxed()
    });
    if !leader {
        debug!("Joined in-flight load of {}", arg.selector);
    }
    (flight, leader)
}

/// Learn the id behind a subteam name the index does not know, then load
/// it under the id's own flight.
async fn load_by_name(
    ctx: &TeamContext,
    arg: &LoadTeamArg,
    name: &TeamName,
    visibility: Visibility,
) -> LoadResult {
    let request = FetchRequest {
        selector: TeamSelector::Name(name.clone()),
        visibility,
        after: 0,
        requester: ctx.me().signer(),
    };
    let fetched = ctx.transport().fetch_links(&request).await?;
    debug!("Name {} resolved to team {}", name, fetched.team.short());

    let by_id = LoadTeamArg {
        selector: TeamSelector::Id(fetched.team),
        force_repoll: true,
        ..arg.clone()
    };
    let team = load(ctx, &by_id).await?;
    if team.name() != name || team.visibility() != visibility {
        warn!(
            "Name {} resolved to team {}, which is named {}",
            name,
            team.id().short(),
            team.name()
        );
        return Err(TeamError::TeamNotFound {
            selector: arg.selector.to_string(),
        });
    }
    Ok(team)
}

async fn fetch_and_merge(ctx: &TeamContext, arg: &LoadTeamArg, id: TeamId) -> LoadResult {
    let base = if arg.force_full_reload {
        None
    } else {
        ctx.cache().get(&id).await
    };

    let request = FetchRequest {
        selector: TeamSelector::Id(id),
        visibility: arg.visibility,
        after: base.as_ref().map_or(0, |team| team.current_seqno()),
        requester: ctx.me().signer(),
    };
    let fetched = ctx.transport().fetch_links(&request).await?;

    if fetched.team != id {
        return Err(IntegrityError::TeamIdMismatch {
            expected: id,
            got: fetched.team,
        }
        .into());
    }
    if base.is_none() && fetched.links.is_empty() {
        return Err(TeamError::TeamNotFound {
            selector: arg.selector.to_string(),
        });
    }

    let parent = match &base {
        Some(team) => team.parent(),
        None => fetched.links.first().and_then(ChainLink::genesis_parent),
    };
    let ancestors_ctx = ctx.descend(id);

    let ancestry = permissions::ancestry(&ancestors_ctx, parent, false).await?;
    let mut team = match merge(ctx, base.as_deref(), &fetched, &ancestry).await {
        Ok(team) => team,
        Err(e) if parent.is_some() && ancestry_may_be_stale(&e) => {
            // A recent grant or subteam creation in an ancestor may not be
            // in our copy of it yet.
            debug!(
                "Retrying merge of team {} with refreshed ancestors: {}",
                id.short(),
                e
            );
            let ancestry = permissions::ancestry(&ancestors_ctx, parent, true).await?;
            merge(ctx, base.as_deref(), &fetched, &ancestry).await?
        }
        Err(e) => {
            warn!("Load of team {} failed: {}", id.short(), e);
            return Err(e);
        }
    };

    open_generations(ctx.me(), &mut team, &fetched.boxes)?;

    if team.is_deleted() {
        ctx.cache().evict(&team.id()).await;
        info!("Team {} ({}) has been deleted", team.name(), team.id().short());
        return Err(TeamError::TeamDeleted { team: team.id() });
    }

    let previous = base.as_ref().map_or(0, |t| t.current_seqno());
    let team = ctx.cache().store(Arc::new(team)).await;
    if team.current_seqno() > previous {
        info!(
            "Merged team {} ({}) seqno {} -> {}, generation {}",
            team.name(),
            team.id().short(),
            previous,
            team.current_seqno(),
            team.generation()
        );
    }
    Ok(team)
}

/// Verify and apply `fetched` on top of a copy of `base`.
async fn merge(
    ctx: &TeamContext,
    base: Option<&Team>,
    fetched: &FetchedChain,
    ancestry: &Ancestry,
) -> Result<Team, TeamError> {
    let mut team = base.cloned();
    for link in &fetched.links {
        verify_link(ctx.keys(), link).await?;
        match team.as_mut() {
            None => team = Some(Team::from_genesis(link, ancestry)?),
            Some(team) => team.apply_link(link, ancestry)?,
        }
    }
    let team = team.ok_or_else(|| TeamError::TeamNotFound {
        selector: fetched.team.to_string(),
    })?;

    if let Some(parent) = team.parent() {
        if !ancestry.lists_child(&team.id()) {
            return Err(IntegrityError::UnknownSubteam {
                team: team.id(),
                parent,
            }
            .into());
        }
    }
    Ok(team)
}

fn ancestry_may_be_stale(e: &TeamError) -> bool {
    matches!(
        e,
        TeamError::Integrity(
            IntegrityError::Unauthorized { .. } | IntegrityError::UnknownSubteam { .. }
        )
    )
}
