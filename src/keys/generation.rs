//! Shared-secret generations: opening the boxes fetched with a chain,
//! sealing new secrets to members, and rotating.
//!
//! Rotation is optimistic. No lock is held across the network; a rotation
//! link that loses a race is rejected by the transport with a seqno
//! conflict, the chain is reloaded and the attempt repeats.

use crate::chain::editor;
use crate::chain::error::{IntegrityError, TeamError, TransportError};
use crate::chain::loader;
use crate::chain::types::{
    Generation, GenerationMeta, KeyId, LinkPayload, LoadTeamArg, Team, TeamId, UserId,
};
use crate::context::TeamContext;
use crate::keys::device::LocalDevice;
use crate::keys::sealing::{self, SealedSecret, TeamSecret};
use crate::permissions;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reason for key rotation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RotationTrigger {
    /// A member was removed from the team.
    MemberRemoved(UserId),
    /// A member's device key was revoked in the key directory.
    DeviceRevoked { user: UserId, key_id: KeyId },
    /// A member left; picked up by whoever loads the team next.
    MemberLeft,
    /// Rotation requested explicitly.
    Manual,
}

impl fmt::Display for RotationTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RotationTrigger::MemberRemoved(user) => write!(f, "MemberRemoved({})", user),
            RotationTrigger::DeviceRevoked { user, key_id } => {
                write!(f, "DeviceRevoked({}/{})", user, key_id.short())
            }
            RotationTrigger::MemberLeft => write!(f, "MemberLeft"),
            RotationTrigger::Manual => write!(f, "Manual"),
        }
    }
}

/// Open every box addressed to `me` whose generation is known but not yet
/// unsealed. Returns how many were opened.
///
/// A secret that does not match its generation's published key check is an
/// integrity error.
pub(crate) fn open_generations(
    me: &LocalDevice,
    team: &mut Team,
    boxes: &[SealedSecret],
) -> Result<usize, TeamError> {
    let mut opened = 0;
    for sealed in boxes {
        if sealed.team != team.id
            || sealed.recipient != *me.user()
            || sealed.recipient_key != me.key_id()
        {
            continue;
        }
        // Boxes can arrive ahead of the rotation link that announces them.
        let Some(generation) = team.generations.get_mut(&sealed.generation) else {
            continue;
        };
        if generation.secret.is_some() {
            continue;
        }
        let secret = me.open(sealed)?;
        if secret.key_check() != generation.meta.key_check {
            warn!(
                "Sealed secret for team {} generation {} fails its key check",
                team.id.short(),
                sealed.generation
            );
            return Err(IntegrityError::KeyCheckMismatch {
                generation: sealed.generation,
            }
            .into());
        }
        generation.secret = Some(secret);
        opened += 1;
    }
    if opened > 0 {
        debug!(
            "Opened {} shared secret(s) for team {}",
            opened,
            team.id.short()
        );
    }
    Ok(opened)
}

/// Seal `secret` to every unrevoked device of every user in `members`.
pub(crate) async fn seal_for_members<'a, I>(
    ctx: &TeamContext,
    team: TeamId,
    generation: Generation,
    secret: &TeamSecret,
    members: I,
) -> Result<Vec<SealedSecret>, TeamError>
where
    I: IntoIterator<Item = &'a UserId>,
{
    let mut boxes = Vec::new();
    for user in members {
        let keys = ctx.keys().load_latest(user, true).await?;
        for device in keys.active_devices() {
            boxes.push(sealing::seal(
                secret,
                team,
                generation,
                user,
                device.key_id,
                &device.encryption_key,
            )?);
        }
    }
    Ok(boxes)
}

/// Create the next generation of `team`'s shared secret, seal it to current
/// members and append the rotation link. Returns the new generation.
///
/// If, after losing a race, the reloaded chain shows someone else already
/// rotated and nothing is pending, that generation is returned instead of
/// rotating again.
pub async fn rotate(
    ctx: &TeamContext,
    team: TeamId,
    trigger: RotationTrigger,
) -> Result<Generation, TeamError> {
    let attempts = ctx.settings().rotate_retries.max(1);
    let mut observed: Option<Generation> = None;

    for attempt in 1..=attempts {
        ctx.check_deadline()?;
        let current = loader::load(ctx, &LoadTeamArg::by_id(team).force_repoll()).await?;

        if let Some(seen) = observed {
            if current.generation() > seen && !current.needs_rotation() {
                info!(
                    "Team {} already rotated to generation {} concurrently",
                    team.short(),
                    current.generation()
                );
                return Ok(current.generation());
            }
        }
        observed.get_or_insert(current.generation());

        authorize_rotation(ctx, &current).await?;

        let next = current.generation() + 1;
        let secret = TeamSecret::generate();
        let members: Vec<UserId> = current.members().map(|(u, _)| u.clone()).collect();
        let boxes = seal_for_members(ctx, team, next, &secret, &members).await?;
        let link = editor::sign_link(
            ctx,
            &current,
            LinkPayload::RotateKey {
                key: GenerationMeta::new(next, &secret),
            },
        )
        .await?;

        match ctx.transport().submit_link(link, boxes).await {
            Ok(()) => {
                info!(
                    "Rotated team {} to generation {} ({})",
                    team.short(),
                    next,
                    trigger
                );
                refresh(ctx, team).await;
                return Ok(next);
            }
            Err(TransportError::SeqnoConflict { submitted, current }) => {
                warn!(
                    "Rotation of team {} lost a race at seqno {} (chain at {}), attempt {}/{}",
                    team.short(),
                    submitted,
                    current,
                    attempt,
                    attempts
                );
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(TeamError::RetriesExhausted {
        operation: "rotate",
        attempts,
    })
}

/// Rotate if a member left or was removed since the last rotation.
pub async fn rotate_if_needed(
    ctx: &TeamContext,
    team: TeamId,
) -> Result<Option<Generation>, TeamError> {
    let current = loader::load(ctx, &LoadTeamArg::by_id(team)).await?;
    if !current.needs_rotation() {
        return Ok(None);
    }
    rotate(ctx, team, RotationTrigger::MemberLeft).await.map(Some)
}

async fn authorize_rotation(ctx: &TeamContext, team: &Team) -> Result<(), TeamError> {
    let me = ctx.me().user();
    if team.is_member(me) || permissions::is_implicit_admin(ctx, team, me).await? {
        return Ok(());
    }
    Err(TeamError::PermissionDenied {
        reason: format!("{} cannot rotate team {}", me, team.name()),
    })
}

/// Pull our own link back in so the cache holds the new secret.
async fn refresh(ctx: &TeamContext, team: TeamId) {
    if let Err(e) = loader::load(ctx, &LoadTeamArg::by_id(team).force_repoll()).await {
        warn!(
            "Reload of team {} after rotation failed: {}",
            team.short(),
            e
        );
    }
}

/// Current secret of a loaded team, or an error if this device holds none.
pub fn current_secret(team: &Team) -> Result<TeamSecret, TeamError> {
    team.current_secret()
        .cloned()
        .ok_or_else(|| TeamError::PermissionDenied {
            reason: format!(
                "no secret for team {} generation {}",
                team.name(),
                team.generation()
            ),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::types::{DeviceKind, Role, Visibility};
    use crate::config::EngineSettings;
    use crate::memory::MemoryNetwork;

    #[test]
    fn test_trigger_display() {
        let device = LocalDevice::generate(UserId::new("bob"), DeviceKind::Mobile).unwrap();
        let trigger = RotationTrigger::DeviceRevoked {
            user: device.user().clone(),
            key_id: device.key_id(),
        };
        let shown = trigger.to_string();
        assert!(shown.starts_with("DeviceRevoked(bob/"));
        assert_eq!(
            RotationTrigger::MemberRemoved(UserId::new("carol")).to_string(),
            "MemberRemoved(carol)"
        );
    }

    #[tokio::test]
    async fn test_rotation_runs_on_a_spawned_task() {
        let network = MemoryNetwork::new();
        let device = network.provision("alice", DeviceKind::Desktop).await.unwrap();
        network.provision("bob", DeviceKind::Mobile).await.unwrap();
        let ctx = network.context(device, EngineSettings::default());
        let team = editor::create_team(&ctx, &"acme".parse().unwrap(), Visibility::Private)
            .await
            .unwrap();
        editor::add_member(&ctx, team.id(), &UserId::new("bob"), Role::Reader)
            .await
            .unwrap();

        let id = team.id();
        let task = tokio::spawn(async move { rotate(&ctx, id, RotationTrigger::Manual).await });
        assert_eq!(task.await.unwrap().unwrap(), 2);
    }
}
