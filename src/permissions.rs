//! Role and capability resolution, including authority inherited from
//! ancestor teams.

use crate::chain::error::{IntegrityError, TeamError};
use crate::chain::loader;
use crate::chain::types::{
    AdminSpan, LoadTeamArg, Position, Role, Team, TeamId, TeamName, UserId,
};
use crate::context::TeamContext;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// What a user may do in a team. Derived, never stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamCapabilities {
    pub manage_members: bool,
    pub manage_subteams: bool,
    pub create_channel: bool,
    pub delete_channel: bool,
    pub rename_channel: bool,
    pub edit_channel_description: bool,
    pub set_team_showcase: bool,
    pub set_member_showcase: bool,
    pub change_open_team: bool,
    pub change_tars_enabled: bool,
    pub leave_team: bool,
}

impl TeamCapabilities {
    /// Capabilities for an explicit `role` (if any), implicit admin status
    /// and whether the user is the team's only owner.
    ///
    /// An explicit member who is also an implicit admin gets the union.
    pub fn compute(role: Option<Role>, implicit_admin: bool, sole_owner: bool) -> Self {
        let admin = role.is_some_and(|r| r.is_admin_or_above());
        let writer = role.is_some_and(|r| r >= Role::Writer);
        let member = role.is_some();
        let administers = admin || implicit_admin;

        TeamCapabilities {
            manage_members: administers,
            manage_subteams: administers,
            create_channel: writer,
            delete_channel: admin,
            rename_channel: admin,
            edit_channel_description: admin,
            set_team_showcase: administers,
            set_member_showcase: member,
            change_open_team: administers,
            change_tars_enabled: administers,
            leave_team: match role {
                Some(Role::Owner) => !sole_owner,
                Some(_) => true,
                None => false,
            },
        }
    }
}

/// Admin history of every ancestor of a team.
#[derive(Debug, Clone, Default)]
pub struct Ancestry {
    parent: Option<TeamId>,
    /// Subteams the parent has created, with the name each was created under.
    children: BTreeMap<TeamId, TeamName>,
    admins: BTreeMap<UserId, Vec<AdminSpan>>,
}

impl Ancestry {
    /// Ancestry of a root team.
    pub fn none() -> Self {
        Self::default()
    }

    /// Build from ancestors ordered nearest first.
    pub(crate) fn from_ancestors(ancestors: &[Arc<Team>]) -> Self {
        let mut admins: BTreeMap<UserId, Vec<AdminSpan>> = BTreeMap::new();
        for team in ancestors {
            for (user, spans) in team.admin_spans() {
                admins.entry(user.clone()).or_default().extend(spans.iter().copied());
            }
        }
        Self {
            parent: ancestors.first().map(|t| t.id()),
            children: ancestors
                .first()
                .map(|t| t.subteams().clone())
                .unwrap_or_default(),
            admins,
        }
    }

    pub fn parent(&self) -> Option<TeamId> {
        self.parent
    }

    /// Whether the parent records creating `team`.
    pub fn lists_child(&self, team: &TeamId) -> bool {
        self.children.contains_key(team)
    }

    /// Name the parent created `team` under.
    pub fn child_name(&self, team: &TeamId) -> Option<&TeamName> {
        self.children.get(team)
    }

    /// Whether `user` held Owner or Admin in some ancestor at `position`.
    pub fn is_admin_at(&self, user: &UserId, position: Position) -> bool {
        self.admins
            .get(user)
            .is_some_and(|spans| spans.iter().any(|s| s.covers(position)))
    }

    /// Whether `user` holds Owner or Admin in some ancestor now.
    pub fn is_admin_now(&self, user: &UserId) -> bool {
        self.admins
            .get(user)
            .is_some_and(|spans| spans.iter().any(|s| s.is_open()))
    }
}

/// Load the ancestors of a team, nearest first, ending at the root.
///
/// A parent reference that loops or cannot be resolved is an integrity
/// error.
pub(crate) async fn ancestors(
    ctx: &TeamContext,
    parent: Option<TeamId>,
    refresh: bool,
) -> Result<Vec<Arc<Team>>, TeamError> {
    let mut chain = Vec::new();
    let mut visited = HashSet::new();
    let mut next = parent;

    while let Some(id) = next {
        if !visited.insert(id) {
            return Err(IntegrityError::AncestorCycle { team: id }.into());
        }
        let mut arg = LoadTeamArg::by_id(id);
        if refresh {
            arg = arg.force_repoll();
        }
        let team = match loader::load(ctx, &arg).await {
            Ok(team) => team,
            Err(TeamError::TeamNotFound { .. }) => {
                return Err(IntegrityError::MissingAncestor { team: id }.into())
            }
            Err(e) => return Err(e),
        };
        next = team.parent();
        chain.push(team);
    }
    Ok(chain)
}

pub(crate) async fn ancestry(
    ctx: &TeamContext,
    parent: Option<TeamId>,
    refresh: bool,
) -> Result<Ancestry, TeamError> {
    if parent.is_none() {
        return Ok(Ancestry::none());
    }
    let chain = ancestors(ctx, parent, refresh).await?;
    Ok(Ancestry::from_ancestors(&chain))
}

/// Identifier of the root team above `team` (itself for a root team).
///
/// Terminates on every input: a repeated identifier is reported as
/// [`IntegrityError::AncestorCycle`].
pub async fn root_id_of(ctx: &TeamContext, team: TeamId) -> Result<TeamId, TeamError> {
    let loaded = loader::load(ctx, &LoadTeamArg::by_id(team)).await?;
    let Some(parent) = loaded.parent() else {
        return Ok(team);
    };
    let chain = ancestors(&ctx.descend(team), Some(parent), false).await?;
    if chain.iter().any(|t| t.id() == team) {
        return Err(IntegrityError::AncestorCycle { team }.into());
    }
    let root = chain
        .last()
        .map(|t| t.id())
        .ok_or(IntegrityError::MissingAncestor { team: parent })?;
    debug!("Root of team {} is {}", team.short(), root.short());
    Ok(root)
}

/// Whether `user` is Owner or Admin of any ancestor of `team`.
pub async fn is_implicit_admin(
    ctx: &TeamContext,
    team: &Team,
    user: &UserId,
) -> Result<bool, TeamError> {
    if team.is_root() {
        return Ok(false);
    }
    let ancestry = ancestry(&ctx.descend(team.id()), team.parent(), false).await?;
    Ok(ancestry.is_admin_now(user))
}

/// Explicit role of `user` in `team`.
pub async fn role_of(ctx: &TeamContext, team: TeamId, user: &UserId) -> Result<Role, TeamError> {
    let loaded = loader::load(ctx, &LoadTeamArg::by_id(team)).await?;
    loaded.role_of(user).ok_or_else(|| TeamError::NotAMember {
        team,
        user: user.clone(),
    })
}

/// Capabilities of `user` in `team`.
///
/// A team that cannot be loaded is an error, as is a user who is neither a
/// member nor an implicit admin; neither case yields an empty set.
pub async fn capabilities_of(
    ctx: &TeamContext,
    team: TeamId,
    user: &UserId,
) -> Result<TeamCapabilities, TeamError> {
    let loaded = loader::load(ctx, &LoadTeamArg::by_id(team)).await?;
    capabilities_in(ctx, &loaded, user).await
}

/// Capabilities of `user` in an already loaded team.
pub async fn capabilities_in(
    ctx: &TeamContext,
    team: &Team,
    user: &UserId,
) -> Result<TeamCapabilities, TeamError> {
    let role = team.role_of(user);
    let implicit_admin = is_implicit_admin(ctx, team, user).await?;
    if role.is_none() && !implicit_admin {
        return Err(TeamError::NotAMember {
            team: team.id(),
            user: user.clone(),
        });
    }
    Ok(TeamCapabilities::compute(
        role,
        implicit_admin,
        team.is_sole_owner(user),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_matrix() {
        for role in [Role::Owner, Role::Admin] {
            let caps = TeamCapabilities::compute(Some(role), false, false);
            assert!(caps.manage_members && caps.manage_subteams && caps.create_channel);
            assert!(caps.delete_channel && caps.rename_channel && caps.edit_channel_description);
            assert!(caps.set_team_showcase && caps.set_member_showcase);
            assert!(caps.change_open_team && caps.change_tars_enabled && caps.leave_team);
        }

        let writer = TeamCapabilities::compute(Some(Role::Writer), false, false);
        assert_eq!(
            writer,
            TeamCapabilities {
                create_channel: true,
                set_member_showcase: true,
                leave_team: true,
                ..TeamCapabilities::default()
            }
        );

        let reader = TeamCapabilities::compute(Some(Role::Reader), false, false);
        assert_eq!(
            reader,
            TeamCapabilities {
                set_member_showcase: true,
                leave_team: true,
                ..TeamCapabilities::default()
            }
        );

        let implicit = TeamCapabilities::compute(None, true, false);
        assert_eq!(
            implicit,
            TeamCapabilities {
                manage_members: true,
                manage_subteams: true,
                set_team_showcase: true,
                change_open_team: true,
                change_tars_enabled: true,
                ..TeamCapabilities::default()
            }
        );
    }

    #[test]
    fn test_sole_owner_cannot_leave() {
        assert!(!TeamCapabilities::compute(Some(Role::Owner), false, true).leave_team);
        assert!(TeamCapabilities::compute(Some(Role::Owner), false, false).leave_team);
        // Only owners are affected by the flag.
        assert!(TeamCapabilities::compute(Some(Role::Admin), false, true).leave_team);
    }

    #[test]
    fn test_member_and_implicit_admin_union() {
        let caps = TeamCapabilities::compute(Some(Role::Reader), true, false);
        assert!(caps.manage_members);
        assert!(caps.set_member_showcase);
        assert!(caps.leave_team);
        assert!(!caps.delete_channel);
        assert!(!caps.create_channel);
    }

    #[test]
    fn test_ancestry_spans() {
        let mut admins = BTreeMap::new();
        admins.insert(
            UserId::new("alice"),
            vec![AdminSpan {
                from: 3,
                until: Some(8),
            }],
        );
        admins.insert(
            UserId::new("bob"),
            vec![AdminSpan {
                from: 5,
                until: None,
            }],
        );
        let ancestry = Ancestry {
            parent: Some(TeamId::from_bytes([1u8; 16])),
            children: BTreeMap::new(),
            admins,
        };

        let alice = UserId::new("alice");
        assert!(ancestry.is_admin_at(&alice, 4));
        assert!(!ancestry.is_admin_at(&alice, 8));
        assert!(!ancestry.is_admin_now(&alice));
        assert!(ancestry.is_admin_now(&UserId::new("bob")));
        assert!(!ancestry.is_admin_at(&UserId::new("carol"), 4));
    }
}
