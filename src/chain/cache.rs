//! Per-process cache of verified team snapshots, plus the single-flight
//! table that collapses concurrent loads of the same team.
//!
//! Snapshots are stored as `Arc<Team>` and replaced whole on every merge,
//! so a reader holding one never sees a partially merged team. A snapshot
//! never replaces one with a higher seqno.

use crate::chain::error::{IntegrityError, TeamError};
use crate::chain::types::{Seqno, Team, TeamId, TeamName, Visibility};
use crate::config::EngineSettings;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use log::{debug, warn};
use moka::future::Cache;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Result shared by every caller joined to one load.
pub type LoadResult = Result<Arc<Team>, TeamError>;

pub(crate) type SharedLoad = Shared<BoxFuture<'static, LoadResult>>;

/// What an in-flight load is for. At most one flight runs per key, so at
/// most one verify and merge runs per team id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum FlightKey {
    Id(TeamId),
    /// Subteam addressed by a name not yet in the name index. Such a flight
    /// only learns the id; the merge runs under the id's own flight.
    Name(TeamName, Visibility),
}

#[derive(Clone)]
struct CachedTeam {
    team: Arc<Team>,
    fetched_at: Instant,
}

/// A cache hit and whether it is inside the freshness window.
#[derive(Debug, Clone)]
pub struct CacheLookup {
    pub team: Arc<Team>,
    pub fresh: bool,
}

pub struct TeamCache {
    teams: Cache<TeamId, CachedTeam>,
    /// Name index; root teams never need it since their ids are derived.
    names: Cache<(TeamName, Visibility), TeamId>,
    freshness: Duration,
    in_flight: Mutex<HashMap<FlightKey, SharedLoad>>,
    /// Which flights are blocked on which: waiter -> (target -> count).
    waits: Mutex<HashMap<TeamId, HashMap<TeamId, usize>>>,
}

impl TeamCache {
    pub fn new(settings: &EngineSettings) -> Self {
        Self::with_capacity(settings.cache_capacity, settings.cache_freshness)
    }

    pub fn with_capacity(capacity: u64, freshness: Duration) -> Self {
        Self {
            teams: Cache::builder().max_capacity(capacity).build(),
            names: Cache::builder().max_capacity(capacity).build(),
            freshness,
            in_flight: Mutex::new(HashMap::new()),
            waits: Mutex::new(HashMap::new()),
        }
    }

    /// Publish a merged snapshot and return what the cache now holds.
    ///
    /// A snapshot older than the cached one is dropped and the cached one
    /// returned instead.
    pub async fn store(&self, team: Arc<Team>) -> Arc<Team> {
        if let Some(previous) = self.teams.get(&team.id()).await {
            if previous.team.current_seqno() > team.current_seqno() {
                warn!(
                    "Not caching team {} at seqno {}, already have {}",
                    team.id().short(),
                    team.current_seqno(),
                    previous.team.current_seqno()
                );
                return previous.team;
            }
            if previous.team.name() != team.name() {
                self.names
                    .invalidate(&(previous.team.name().clone(), previous.team.visibility()))
                    .await;
            }
        }
        self.names
            .insert((team.name().clone(), team.visibility()), team.id())
            .await;
        debug!(
            "Cached team {} ({}) at seqno {}",
            team.name(),
            team.id().short(),
            team.current_seqno()
        );
        self.teams
            .insert(
                team.id(),
                CachedTeam {
                    team: team.clone(),
                    fetched_at: Instant::now(),
                },
            )
            .await;
        team
    }

    pub async fn get(&self, id: &TeamId) -> Option<Arc<Team>> {
        self.teams.get(id).await.map(|entry| entry.team)
    }

    pub async fn lookup(&self, id: &TeamId) -> Option<CacheLookup> {
        let entry = self.teams.get(id).await?;
        Some(CacheLookup {
            fresh: entry.fetched_at.elapsed() < self.freshness,
            team: entry.team,
        })
    }

    pub async fn resolve_name(&self, name: &TeamName, visibility: Visibility) -> Option<TeamId> {
        self.names.get(&(name.clone(), visibility)).await
    }

    pub async fn cached_seqno(&self, id: &TeamId) -> Option<Seqno> {
        self.get(id).await.map(|team| team.current_seqno())
    }

    pub async fn evict(&self, id: &TeamId) {
        if let Some(entry) = self.teams.get(id).await {
            self.names
                .invalidate(&(entry.team.name().clone(), entry.team.visibility()))
                .await;
        }
        self.teams.invalidate(id).await;
        debug!("Evicted team {}", id.short());
    }

    /// Join the load already running for `key`, or register the one `start`
    /// builds. Returns the shared future and whether this caller started it.
    pub(crate) fn join_or_start<F>(&self, key: FlightKey, start: F) -> (SharedLoad, bool)
    where
        F: FnOnce() -> BoxFuture<'static, LoadResult>,
    {
        let mut flights = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(existing) = flights.get(&key) {
            return (existing.clone(), false);
        }
        let flight = start().shared();
        flights.insert(key, flight.clone());
        (flight, true)
    }

    /// Drop a finished flight so the next caller starts a fresh one.
    pub(crate) fn finish(&self, key: &FlightKey) {
        let mut flights = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        flights.remove(key);
    }

    /// Record that the flight of `lineage`'s last team is about to block on
    /// the flight of `target`.
    ///
    /// Fails with [`IntegrityError::AncestorCycle`] if `target` is already
    /// waiting, directly or through other flights, on any team in
    /// `lineage`: the two loads would wait on each other forever.
    pub(crate) fn begin_wait(
        &self,
        lineage: &[TeamId],
        target: TeamId,
    ) -> Result<WaitGuard<'_>, TeamError> {
        let Some(&waiter) = lineage.last() else {
            return Ok(WaitGuard {
                cache: self,
                edge: None,
            });
        };
        let mut waits = self.waits.lock().unwrap_or_else(|p| p.into_inner());

        let mut seen = vec![target];
        let mut stack = vec![target];
        while let Some(team) = stack.pop() {
            if lineage.contains(&team) {
                warn!(
                    "Load of team {} would wait on itself through team {}",
                    waiter.short(),
                    target.short()
                );
                return Err(IntegrityError::AncestorCycle { team: target }.into());
            }
            for next in waits.get(&team).into_iter().flat_map(|t| t.keys()) {
                if !seen.contains(next) {
                    seen.push(*next);
                    stack.push(*next);
                }
            }
        }

        *waits.entry(waiter).or_default().entry(target).or_insert(0) += 1;
        Ok(WaitGuard {
            cache: self,
            edge: Some((waiter, target)),
        })
    }

    fn end_wait(&self, waiter: TeamId, target: TeamId) {
        let mut waits = self.waits.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(targets) = waits.get_mut(&waiter) {
            if let Some(count) = targets.get_mut(&target) {
                *count -= 1;
                if *count == 0 {
                    targets.remove(&target);
                }
            }
            if targets.is_empty() {
                waits.remove(&waiter);
            }
        }
    }

    /// Number of loads currently in flight.
    pub fn flights_in_progress(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }
}

/// Removes its wait edge when the waiting load finishes or is dropped.
pub(crate) struct WaitGuard<'a> {
    cache: &'a TeamCache,
    edge: Option<(TeamId, TeamId)>,
}

impl std::fmt::Debug for WaitGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitGuard").field("edge", &self.edge).finish()
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        if let Some((waiter, target)) = self.edge {
            self.cache.end_wait(waiter, target);
        }
    }
}

impl std::fmt::Debug for TeamCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TeamCache")
            .field("freshness", &self.freshness)
            .field("flights", &self.flights_in_progress())
            .finish()
    }
}
