//! Team mutations: each builds a link, signs it with the local device and
//! submits it.
//!
//! Submission is append-only. A [`TransportError::SeqnoConflict`] means
//! someone else advanced the chain first; the team is reloaded and the edit
//! is rebuilt against the new tail, a bounded number of times.

use crate::chain::error::{NameError, TeamError, TransportError};
use crate::chain::loader;
use crate::chain::types::{
    ChainLink, GenerationMeta, LinkBody, LinkPayload, LoadTeamArg, Role, Seqno, Team, TeamId,
    TeamName, UserId, Visibility,
};
use crate::context::TeamContext;
use crate::keys::generation::{self, seal_for_members, RotationTrigger};
use crate::keys::sealing::TeamSecret;
use crate::permissions;
use log::{info, warn};
use std::sync::Arc;

/// A prepared mutation.
struct Edit {
    payload: LinkPayload,
    /// Users to seal the current generation's secret to.
    share_with: Vec<UserId>,
}

impl From<LinkPayload> for Edit {
    fn from(payload: LinkPayload) -> Self {
        Edit {
            payload,
            share_with: Vec::new(),
        }
    }
}

/// Sign `payload` as the next link of `team`.
pub(crate) async fn sign_link(
    ctx: &TeamContext,
    team: &Team,
    payload: LinkPayload,
) -> Result<ChainLink, TeamError> {
    let position = ctx.transport().current_position().await?;
    let body = LinkBody {
        team: team.id(),
        seqno: team.current_seqno() + 1,
        prev: team.last_link_hash(),
        position: position.max(team.last_position()),
        signer: ctx.me().signer(),
        ctime: chrono::Utc::now().timestamp(),
        payload,
    };
    sign_body(ctx, body)
}

fn sign_body(ctx: &TeamContext, body: LinkBody) -> Result<ChainLink, TeamError> {
    let message = body.signing_message()?;
    Ok(ChainLink {
        signature: ctx.me().sign(&message),
        body,
    })
}

/// Check a signed link against our own copy before sending it, so rule
/// violations surface as permission errors rather than as a poisoned chain.
async fn preview(ctx: &TeamContext, team: &Team, link: &ChainLink) -> Result<(), TeamError> {
    let ancestry = permissions::ancestry(&ctx.descend(team.id()), team.parent(), false).await?;
    let mut preview = team.clone();
    preview
        .apply_link(link, &ancestry)
        .map_err(|e| TeamError::PermissionDenied {
            reason: e.to_string(),
        })
}

/// Load, prepare, sign and submit until accepted or out of retries.
/// Returns the accepted link's seqno.
async fn submit_edit<F>(
    ctx: &TeamContext,
    team: TeamId,
    operation: &'static str,
    mut prepare: F,
) -> Result<Seqno, TeamError>
where
    F: FnMut(&Team) -> Result<Edit, TeamError>,
{
    let attempts = ctx.settings().submit_retries.max(1);
    for attempt in 1..=attempts {
        ctx.check_deadline()?;
        let current = loader::load(ctx, &LoadTeamArg::by_id(team).force_repoll()).await?;
        let edit = prepare(&current)?;
        let link = sign_link(ctx, &current, edit.payload).await?;
        preview(ctx, &current, &link).await?;

        let boxes = match current.current_secret() {
            Some(secret) if !edit.share_with.is_empty() => {
                seal_for_members(ctx, team, current.generation(), secret, &edit.share_with)
                    .await?
            }
            _ => Vec::new(),
        };

        let seqno = link.seqno();
        match ctx.transport().submit_link(link, boxes).await {
            Ok(()) => {
                info!(
                    "{} on team {} accepted at seqno {}",
                    operation,
                    team.short(),
                    seqno
                );
                return Ok(seqno);
            }
            Err(TransportError::SeqnoConflict { current, .. }) => {
                warn!(
                    "{} on team {} raced with seqno {}, attempt {}/{}",
                    operation,
                    team.short(),
                    current,
                    attempt,
                    attempts
                );
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(TeamError::RetriesExhausted {
        operation,
        attempts,
    })
}

async fn reload(ctx: &TeamContext, team: TeamId) -> Result<Arc<Team>, TeamError> {
    loader::load(ctx, &LoadTeamArg::by_id(team).force_repoll()).await
}

/// Create a root team owned by the local user.
pub async fn create_team(
    ctx: &TeamContext,
    name: &TeamName,
    visibility: Visibility,
) -> Result<Arc<Team>, TeamError> {
    if !name.is_root() {
        return Err(NameError::InvalidTeamName(name.to_string()).into());
    }
    let id = TeamId::root(name, visibility);
    let me = ctx.me().user().clone();
    let secret = TeamSecret::generate();
    let boxes = seal_for_members(ctx, id, 1, &secret, [&me]).await?;

    let body = LinkBody {
        team: id,
        seqno: 1,
        prev: None,
        position: ctx.transport().current_position().await?,
        signer: ctx.me().signer(),
        ctime: chrono::Utc::now().timestamp(),
        payload: LinkPayload::Genesis {
            name: name.clone(),
            visibility,
            parent: None,
            members: vec![(me, Role::Owner)],
            key: GenerationMeta::new(1, &secret),
        },
    };
    let genesis = sign_body(ctx, body)?;

    match ctx.transport().submit_link(genesis, boxes).await {
        Ok(()) => {}
        Err(TransportError::SeqnoConflict { .. }) => {
            return Err(TeamError::AlreadyExists {
                name: name.to_string(),
            })
        }
        Err(e) => return Err(e.into()),
    }
    info!("Created team {} ({})", name, id.short());
    reload(ctx, id).await
}

/// Create subteam `part` under `parent`. The creator becomes its admin.
pub async fn create_subteam(
    ctx: &TeamContext,
    parent: TeamId,
    part: &str,
) -> Result<Arc<Team>, TeamError> {
    let mut created = None;
    submit_edit(ctx, parent, "create_subteam", |current| {
        let name = current.name().append(part)?;
        let id = TeamId::subteam(&current.id(), &name, current.current_seqno() + 1);
        created = Some((id, name.clone()));
        Ok(LinkPayload::CreateSubteam { id, name }.into())
    })
    .await?;
    let (id, name) = created.ok_or_else(|| TeamError::PermissionDenied {
        reason: "subteam was not prepared".to_string(),
    })?;

    // The new subteam must be listed before its genesis verifies.
    let parent_team = reload(ctx, parent).await?;

    let me = ctx.me().user().clone();
    let secret = TeamSecret::generate();
    let boxes = seal_for_members(ctx, id, 1, &secret, [&me]).await?;
    let body = LinkBody {
        team: id,
        seqno: 1,
        prev: None,
        position: ctx
            .transport()
            .current_position()
            .await?
            .max(parent_team.last_position()),
        signer: ctx.me().signer(),
        ctime: chrono::Utc::now().timestamp(),
        payload: LinkPayload::Genesis {
            name: name.clone(),
            visibility: parent_team.visibility(),
            parent: Some(parent),
            members: vec![(me, Role::Admin)],
            key: GenerationMeta::new(1, &secret),
        },
    };
    let genesis = sign_body(ctx, body)?;
    match ctx.transport().submit_link(genesis, boxes).await {
        Ok(()) => {}
        Err(TransportError::SeqnoConflict { .. }) => {
            return Err(TeamError::AlreadyExists {
                name: name.to_string(),
            })
        }
        Err(e) => return Err(e.into()),
    }
    info!("Created subteam {} ({})", name, id.short());
    reload(ctx, id).await
}

/// Add `user` at `role`, sharing the current secret with them.
///
/// If the local device does not hold the current secret (an implicit admin
/// outside the team), the team is rotated instead so the new member gets
/// one.
pub async fn add_member(
    ctx: &TeamContext,
    team: TeamId,
    user: &UserId,
    role: Role,
) -> Result<Arc<Team>, TeamError> {
    submit_edit(ctx, team, "add_member", |current| {
        if current.is_member(user) {
            return Err(TeamError::PermissionDenied {
                reason: format!("{} is already a member of {}", user, current.name()),
            });
        }
        Ok(Edit {
            payload: LinkPayload::ChangeMembership {
                add: vec![(user.clone(), role)],
                remove: vec![],
            },
            share_with: vec![user.clone()],
        })
    })
    .await?;

    let updated = reload(ctx, team).await?;
    if updated.current_secret().is_none() {
        generation::rotate(ctx, team, RotationTrigger::Manual).await?;
        return reload(ctx, team).await;
    }
    Ok(updated)
}

pub async fn change_role(
    ctx: &TeamContext,
    team: TeamId,
    user: &UserId,
    role: Role,
) -> Result<Arc<Team>, TeamError> {
    submit_edit(ctx, team, "change_role", |current| {
        if current.role_of(user) == Some(role) {
            return Err(TeamError::PermissionDenied {
                reason: format!("{} is already {} of {}", user, role, current.name()),
            });
        }
        Ok(LinkPayload::ChangeRole {
            user: user.clone(),
            role,
        }
        .into())
    })
    .await?;
    reload(ctx, team).await
}

/// Remove `user` and rotate so they cannot read anything sealed afterwards.
pub async fn remove_member(
    ctx: &TeamContext,
    team: TeamId,
    user: &UserId,
) -> Result<Arc<Team>, TeamError> {
    submit_edit(ctx, team, "remove_member", |current| {
        if !current.is_member(user) {
            return Err(TeamError::NotAMember {
                team: current.id(),
                user: user.clone(),
            });
        }
        Ok(LinkPayload::ChangeMembership {
            add: vec![],
            remove: vec![user.clone()],
        }
        .into())
    })
    .await?;
    generation::rotate(ctx, team, RotationTrigger::MemberRemoved(user.clone())).await?;
    reload(ctx, team).await
}

/// Leave `team`. Remaining admins rotate the key once they notice.
pub async fn leave(ctx: &TeamContext, team: TeamId) -> Result<(), TeamError> {
    submit_edit(ctx, team, "leave", |current| {
        let me = ctx.me().user();
        if !current.is_member(me) {
            return Err(TeamError::NotAMember {
                team: current.id(),
                user: me.clone(),
            });
        }
        if current.is_sole_owner(me) {
            return Err(TeamError::PermissionDenied {
                reason: format!("{} is the last owner of {}", me, current.name()),
            });
        }
        Ok(LinkPayload::Leave.into())
    })
    .await?;
    ctx.cache().evict(&team).await;
    Ok(())
}

/// Rename a subteam, keeping it under the same parent.
pub async fn rename(ctx: &TeamContext, team: TeamId, new_part: &str) -> Result<Arc<Team>, TeamError> {
    submit_edit(ctx, team, "rename", |current| {
        if current.is_root() {
            return Err(TeamError::PermissionDenied {
                reason: format!("root team {} cannot be renamed", current.name()),
            });
        }
        let name = current.name().with_last_part(new_part)?;
        Ok(LinkPayload::Rename { name }.into())
    })
    .await?;
    reload(ctx, team).await
}

pub async fn delete_team(ctx: &TeamContext, team: TeamId) -> Result<(), TeamError> {
    submit_edit(ctx, team, "delete_team", |_| Ok(LinkPayload::Delete.into())).await?;
    ctx.cache().evict(&team).await;
    info!("Deleted team {}", team.short());
    Ok(())
}
