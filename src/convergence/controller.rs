//! Invalidation controller: turns push notifications into background
//! repolls.
//!
//! Notifications arrive on a bounded channel and are consumed in order by a
//! single task. The consumer only updates per-team state and spawns work;
//! fetching and verification happen in the spawned repoll, never inline.
//!
//! ```text
//!          Changed (newer than cache)            repoll reached target
//!   Idle ─────────────────────────────▶ PendingRepoll ─────────────────▶ Idle
//!                                        │      ▲
//!                                        └──────┘ Changed: raise target
//! ```

use crate::chain::error::TeamError;
use crate::chain::loader;
use crate::chain::types::{ChangeFlags, LoadTeamArg, Seqno, Team, TeamId, TeamNotification};
use crate::context::TeamContext;
use crate::keys::generation::{self, RotationTrigger};
use crate::permissions;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;

/// Per-team subscription state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscriptionState {
    #[default]
    Idle,
    PendingRepoll {
        target: Seqno,
        changes: ChangeFlags,
    },
}

type States = Arc<RwLock<HashMap<TeamId, SubscriptionState>>>;

/// Handle to a running controller.
pub struct InvalidationController {
    sender: mpsc::Sender<TeamNotification>,
    states: States,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl InvalidationController {
    /// Start the consumer task on the current runtime.
    pub fn spawn(ctx: TeamContext) -> Self {
        let (sender, receiver) = mpsc::channel(ctx.settings().notify_capacity.max(1));
        let states: States = Arc::new(RwLock::new(HashMap::new()));
        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(consume(ctx, receiver, stopped, states.clone()));
        Self {
            sender,
            states,
            stop,
            task,
        }
    }

    /// Sender for transports to deliver notifications into.
    pub fn sender(&self) -> mpsc::Sender<TeamNotification> {
        self.sender.clone()
    }

    /// Deliver a notification without waiting. Returns `false` if it was
    /// dropped because the channel is full or closed.
    pub fn notify(&self, notification: TeamNotification) -> bool {
        match self.sender.try_send(notification) {
            Ok(()) => true,
            Err(e) => {
                warn!("Dropped team notification: {}", e);
                false
            }
        }
    }

    pub async fn state_of(&self, team: &TeamId) -> SubscriptionState {
        self.states
            .read()
            .await
            .get(team)
            .copied()
            .unwrap_or_default()
    }

    /// Number of teams with a repoll outstanding.
    pub async fn pending(&self) -> usize {
        self.states
            .read()
            .await
            .values()
            .filter(|s| matches!(s, SubscriptionState::PendingRepoll { .. }))
            .count()
    }

    /// Stop the consumer and wait for it to exit. Senders handed out by
    /// [`sender`](Self::sender) see a closed channel afterwards.
    ///
    /// Repolls already spawned keep running to completion.
    pub async fn shutdown(self) {
        let Self { stop, task, .. } = self;
        // The consumer may already be gone if every sender was dropped.
        let _ = stop.send(());
        if let Err(e) = task.await {
            warn!("Invalidation controller task failed: {}", e);
        }
    }
}

async fn consume(
    ctx: TeamContext,
    mut receiver: mpsc::Receiver<TeamNotification>,
    mut stopped: oneshot::Receiver<()>,
    states: States,
) {
    loop {
        let notification = tokio::select! {
            _ = &mut stopped => break,
            received = receiver.recv() => match received {
                Some(notification) => notification,
                None => break,
            },
        };
        match notification {
            TeamNotification::Changed {
                team,
                changes,
                latest_seqno,
            } => on_changed(&ctx, &states, team, changes, latest_seqno).await,
            TeamNotification::Deleted { team } | TeamNotification::Exit { team } => {
                ctx.cache().evict(&team).await;
                states.write().await.remove(&team);
                info!("Team {} dropped from cache after deletion or exit", team.short());
            }
        }
    }
    debug!("Invalidation controller stopped");
}

async fn on_changed(
    ctx: &TeamContext,
    states: &States,
    team: TeamId,
    changes: ChangeFlags,
    latest: Seqno,
) {
    if let Some(cached) = ctx.cache().get(&team).await {
        if cached.current_seqno() >= latest {
            debug!(
                "No repoll for team {} at seqno {}, cache has {}",
                team.short(),
                latest,
                cached.current_seqno()
            );
            // Another load got there first; a pending leave still needs a
            // new generation.
            if cached.needs_rotation() {
                let ctx = ctx.clone();
                tokio::spawn(async move { rekey_if_needed(&ctx, &cached).await });
            }
            return;
        }
    }

    let mut guard = states.write().await;
    let state = guard.entry(team).or_default();
    match state {
        SubscriptionState::PendingRepoll {
            target,
            changes: pending,
        } => {
            *target = (*target).max(latest);
            *pending = pending.merge(changes);
            debug!(
                "Coalesced notification for team {}, target now {}",
                team.short(),
                target
            );
        }
        SubscriptionState::Idle => {
            *state = SubscriptionState::PendingRepoll {
                target: latest,
                changes,
            };
            drop(guard);
            debug!(
                "Scheduling repoll of team {} to seqno {} ({:?})",
                team.short(),
                latest,
                changes
            );
            tokio::spawn(repoll(ctx.clone(), states.clone(), team));
        }
    }
}

/// Force-reload until the pending target is reached, re-reading the target
/// after each attempt so later notifications extend the same repoll.
async fn repoll(ctx: TeamContext, states: States, team: TeamId) {
    let attempts = ctx.settings().poll_attempts.max(1);
    let mut backoff = ctx.settings().poll_backoff();
    let arg = LoadTeamArg::by_id(team).force_repoll();

    for attempt in 1..=attempts {
        let target = match states.read().await.get(&team) {
            Some(SubscriptionState::PendingRepoll { target, .. }) => *target,
            _ => return,
        };

        match loader::load(&ctx, &arg).await {
            Ok(loaded) if loaded.current_seqno() >= target => {
                let mut guard = states.write().await;
                let raised = match guard.get(&team) {
                    Some(SubscriptionState::PendingRepoll { target, .. }) => {
                        *target > loaded.current_seqno()
                    }
                    _ => false,
                };
                if raised {
                    continue;
                }
                guard.insert(team, SubscriptionState::Idle);
                drop(guard);
                debug!(
                    "Team {} converged at seqno {}",
                    team.short(),
                    loaded.current_seqno()
                );
                rekey_if_needed(&ctx, &loaded).await;
                return;
            }
            Ok(loaded) => {
                debug!(
                    "Team {} at seqno {}, notification promised {} (attempt {}/{})",
                    team.short(),
                    loaded.current_seqno(),
                    target,
                    attempt,
                    attempts
                );
            }
            Err(TeamError::TeamDeleted { .. }) => {
                states.write().await.remove(&team);
                return;
            }
            Err(e) => {
                warn!("Repoll of team {} failed: {}", team.short(), e);
            }
        }
        if attempt < attempts {
            tokio::time::sleep(backoff.next_delay()).await;
        }
    }

    warn!(
        "Giving up repoll of team {} after {} attempts",
        team.short(),
        attempts
    );
    states.write().await.insert(team, SubscriptionState::Idle);
}

/// Rotate after a member left, if we are allowed to manage members.
async fn rekey_if_needed(ctx: &TeamContext, team: &Team) {
    if !team.needs_rotation() {
        return;
    }
    let me = ctx.me().user();
    let can_manage = match permissions::capabilities_in(ctx, team, me).await {
        Ok(caps) => caps.manage_members,
        Err(_) => false,
    };
    if !can_manage {
        return;
    }
    match generation::rotate(ctx, team.id(), RotationTrigger::MemberLeft).await {
        Ok(generation) => info!(
            "Rekeyed team {} to generation {} after a member left",
            team.id().short(),
            generation
        ),
        Err(e) => warn!("Rekey of team {} failed: {}", team.id().short(), e),
    }
}
