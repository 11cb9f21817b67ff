//! Applying verified links to a team snapshot.
//!
//! Signatures are checked by the verifier before a link gets here; this
//! module enforces continuity (team, seqno, prev hash, position) and the
//! authorization rules of each payload.

use crate::chain::error::IntegrityError;
use crate::chain::types::{
    AdminSpan, ChainLink, LinkPayload, Position, Role, SharedSecretGeneration, Team, TeamId,
    UserId,
};
use crate::permissions::Ancestry;
use std::collections::BTreeMap;

/// Authority a payload demands of its signer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Authority {
    /// Explicit Owner.
    Owner,
    /// Explicit Admin or Owner, or implicit admin.
    Admin,
    /// Explicit member of any role, or implicit admin.
    Member,
}

impl Authority {
    fn label(&self) -> &'static str {
        match self {
            Authority::Owner => "owner",
            Authority::Admin => "admin",
            Authority::Member => "membership",
        }
    }
}

impl Team {
    /// Build a snapshot from a genesis link.
    pub(crate) fn from_genesis(link: &ChainLink, ancestry: &Ancestry) -> Result<Team, IntegrityError> {
        let body = &link.body;
        if body.seqno != 1 {
            return Err(IntegrityError::UnexpectedSeqno {
                expected: 1,
                got: body.seqno,
            });
        }
        if body.prev.is_some() {
            return Err(IntegrityError::BrokenHashChain { seqno: 1 });
        }
        let (name, visibility, parent, members, key) = match &body.payload {
            LinkPayload::Genesis {
                name,
                visibility,
                parent,
                members,
                key,
            } => (name, *visibility, *parent, members, key),
            other => {
                return Err(invalid(1, format!("first link is {}", other.kind())));
            }
        };

        if key.generation != 1 {
            return Err(IntegrityError::GenerationGap {
                expected: 1,
                got: key.generation,
            });
        }

        let mut roster = BTreeMap::new();
        for (user, role) in members {
            if roster.insert(user.clone(), *role).is_some() {
                return Err(invalid(1, format!("{} listed twice", user)));
            }
        }

        match parent {
            None => {
                if !name.is_root() {
                    return Err(invalid(1, format!("root team named {}", name)));
                }
                let expected = TeamId::root(name, visibility);
                if body.team != expected {
                    return Err(IntegrityError::TeamIdMismatch {
                        expected,
                        got: body.team,
                    });
                }
                if roster.get(&body.signer.user) != Some(&Role::Owner) {
                    return Err(unauthorized(link, Authority::Owner));
                }
            }
            Some(parent) => {
                if ancestry.parent() != Some(parent) {
                    return Err(IntegrityError::MissingAncestor { team: parent });
                }
                if name.is_root() {
                    return Err(invalid(1, format!("subteam named {}", name)));
                }
                // The id itself was derived and checked when the parent
                // recorded the creation; the name must be the one recorded.
                // An unlisted subteam is rejected once the merge completes.
                if let Some(recorded) = ancestry.child_name(&body.team) {
                    if recorded != name {
                        return Err(invalid(
                            1,
                            format!("genesis names {}, parent created {}", name, recorded),
                        ));
                    }
                }
                if roster.values().any(|role| *role == Role::Owner) {
                    return Err(invalid(1, "subteams have no owners".to_string()));
                }
                if !ancestry.is_admin_at(&body.signer.user, body.position) {
                    return Err(unauthorized(link, Authority::Admin));
                }
            }
        }

        let mut generations = BTreeMap::new();
        generations.insert(
            1,
            SharedSecretGeneration {
                meta: key.clone(),
                secret: None,
            },
        );

        let mut team = Team {
            id: body.team,
            name: name.clone(),
            visibility,
            parent,
            seqno: 1,
            last_hash: Some(link.hash()?),
            last_position: body.position,
            roster: BTreeMap::new(),
            admin_spans: BTreeMap::new(),
            subteams: BTreeMap::new(),
            generations,
            needs_rotation: false,
            deleted: false,
        };
        team.replace_roster(roster, body.position);
        Ok(team)
    }

    /// Apply the next link in sequence.
    ///
    /// On error `self` is left as it was.
    pub(crate) fn apply_link(
        &mut self,
        link: &ChainLink,
        ancestry: &Ancestry,
    ) -> Result<(), IntegrityError> {
        let body = &link.body;
        let seqno = body.seqno;

        if body.team != self.id {
            return Err(IntegrityError::TeamIdMismatch {
                expected: self.id,
                got: body.team,
            });
        }
        if self.deleted {
            return Err(invalid(seqno, "link follows deletion".to_string()));
        }
        if seqno != self.seqno + 1 {
            return Err(IntegrityError::UnexpectedSeqno {
                expected: self.seqno + 1,
                got: seqno,
            });
        }
        if body.prev != self.last_hash {
            return Err(IntegrityError::BrokenHashChain { seqno });
        }
        if body.position < self.last_position {
            return Err(IntegrityError::PositionRegression {
                seqno,
                position: body.position,
                previous: self.last_position,
            });
        }

        let signer = &body.signer.user;
        let hash = link.hash()?;
        let mut roster = self.roster.clone();

        match &body.payload {
            LinkPayload::Genesis { .. } => {
                return Err(invalid(seqno, "genesis after first link".to_string()));
            }
            LinkPayload::ChangeMembership { add, remove } => {
                let mut required = Authority::Admin;
                for user in remove {
                    if add.iter().any(|(added, _)| added == user) {
                        return Err(invalid(seqno, format!("{} both added and removed", user)));
                    }
                    match roster.remove(user) {
                        Some(Role::Owner) => required = Authority::Owner,
                        Some(_) => {}
                        None => return Err(invalid(seqno, format!("{} is not a member", user))),
                    }
                }
                for (user, role) in add {
                    self.check_role_allowed(seqno, *role)?;
                    if *role == Role::Owner || roster.get(user) == Some(&Role::Owner) {
                        required = Authority::Owner;
                    }
                    roster.insert(user.clone(), *role);
                }
                self.authorize(link, ancestry, required)?;
                self.check_owned(seqno, &roster)?;
                if !remove.is_empty() {
                    self.needs_rotation = true;
                }
            }
            LinkPayload::ChangeRole { user, role } => {
                let previous = match roster.get(user) {
                    Some(previous) => *previous,
                    None => return Err(invalid(seqno, format!("{} is not a member", user))),
                };
                self.check_role_allowed(seqno, *role)?;
                let required = if *role == Role::Owner || previous == Role::Owner {
                    Authority::Owner
                } else {
                    Authority::Admin
                };
                self.authorize(link, ancestry, required)?;
                roster.insert(user.clone(), *role);
                self.check_owned(seqno, &roster)?;
            }
            LinkPayload::RotateKey { key } => {
                self.authorize(link, ancestry, Authority::Member)?;
                let expected = self.generation() + 1;
                if key.generation != expected {
                    return Err(IntegrityError::GenerationGap {
                        expected,
                        got: key.generation,
                    });
                }
                self.generations.insert(
                    key.generation,
                    SharedSecretGeneration {
                        meta: key.clone(),
                        secret: None,
                    },
                );
                self.needs_rotation = false;
            }
            LinkPayload::Rename { name } => {
                self.authorize(link, ancestry, Authority::Admin)?;
                if self.parent.is_none() {
                    return Err(invalid(seqno, "root teams cannot be renamed".to_string()));
                }
                if name.parent() != self.name.parent() {
                    return Err(invalid(seqno, format!("rename to {} changes parent", name)));
                }
                self.name = name.clone();
            }
            LinkPayload::CreateSubteam { id, name } => {
                self.authorize(link, ancestry, Authority::Admin)?;
                if name.parent().as_ref() != Some(&self.name) {
                    return Err(invalid(seqno, format!("{} is not a child of {}", name, self.name)));
                }
                if self.subteams.contains_key(id) {
                    return Err(invalid(seqno, format!("subteam {} already exists", id.short())));
                }
                let expected = TeamId::subteam(&self.id, name, seqno);
                if *id != expected {
                    return Err(IntegrityError::TeamIdMismatch { expected, got: *id });
                }
                self.subteams.insert(*id, name.clone());
            }
            LinkPayload::Leave => {
                match roster.remove(signer) {
                    Some(_) => {}
                    None => return Err(unauthorized(link, Authority::Member)),
                }
                self.check_owned(seqno, &roster)?;
                self.needs_rotation = true;
            }
            LinkPayload::Delete => {
                let required = if self.parent.is_none() {
                    Authority::Owner
                } else {
                    Authority::Admin
                };
                self.authorize(link, ancestry, required)?;
                self.deleted = true;
            }
        }

        self.replace_roster(roster, body.position);
        self.seqno = seqno;
        self.last_hash = Some(hash);
        self.last_position = body.position;
        Ok(())
    }

    fn authorize(
        &self,
        link: &ChainLink,
        ancestry: &Ancestry,
        required: Authority,
    ) -> Result<(), IntegrityError> {
        let user = &link.body.signer.user;
        let explicit = self.roster.get(user).copied();
        let implicit = ancestry.is_admin_at(user, link.body.position);
        let allowed = match required {
            Authority::Owner => explicit == Some(Role::Owner),
            Authority::Admin => explicit.is_some_and(|r| r.is_admin_or_above()) || implicit,
            Authority::Member => explicit.is_some() || implicit,
        };
        if allowed {
            Ok(())
        } else {
            Err(unauthorized(link, required))
        }
    }

    fn check_role_allowed(&self, seqno: u64, role: Role) -> Result<(), IntegrityError> {
        if role == Role::Owner && self.parent.is_some() {
            return Err(invalid(seqno, "subteams have no owners".to_string()));
        }
        Ok(())
    }

    /// A root team must keep at least one owner.
    fn check_owned(&self, seqno: u64, roster: &BTreeMap<UserId, Role>) -> Result<(), IntegrityError> {
        if self.parent.is_none() && !roster.values().any(|role| *role == Role::Owner) {
            return Err(IntegrityError::OwnerlessTeam { seqno });
        }
        Ok(())
    }

    /// Install a new roster, opening and closing admin spans at `position`.
    fn replace_roster(&mut self, roster: BTreeMap<UserId, Role>, position: Position) {
        let was_admin = |user: &UserId| self.roster.get(user).is_some_and(|r| r.is_admin_or_above());
        let mut opened = Vec::new();
        let mut closed = Vec::new();
        for (user, role) in &roster {
            if role.is_admin_or_above() && !was_admin(user) {
                opened.push(user.clone());
            }
        }
        for user in self.roster.keys() {
            let still_admin = roster.get(user).is_some_and(|r| r.is_admin_or_above());
            if was_admin(user) && !still_admin {
                closed.push(user.clone());
            }
        }

        for user in opened {
            self.admin_spans.entry(user).or_default().push(AdminSpan {
                from: position,
                until: None,
            });
        }
        for user in closed {
            if let Some(span) = self
                .admin_spans
                .get_mut(&user)
                .and_then(|spans| spans.last_mut())
            {
                span.until = Some(position);
            }
        }
        self.roster = roster;
    }
}

fn invalid(seqno: u64, reason: String) -> IntegrityError {
    IntegrityError::InvalidPayload { seqno, reason }
}

fn unauthorized(link: &ChainLink, required: Authority) -> IntegrityError {
    IntegrityError::Unauthorized {
        seqno: link.seqno(),
        user: link.body.signer.user.clone(),
        required: required.label(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::chain::types::{
        GenerationMeta, KeyId, LinkBody, SignerRef, TeamName, Visibility,
    };

    fn user(name: &str) -> UserId {
        UserId::new(name)
    }

    fn meta(generation: u32) -> GenerationMeta {
        GenerationMeta {
            generation,
            key_check: [generation as u8; 32],
            created_at: 0,
        }
    }

    /// Unsigned links: signatures are the verifier's concern, not this module's.
    struct ChainBuilder {
        team: TeamId,
        links: Vec<ChainLink>,
        position: Position,
    }

    impl ChainBuilder {
        fn root(owner: &str) -> (Self, Team) {
            let name: TeamName = "acme".parse().unwrap();
            let team = TeamId::root(&name, Visibility::Private);
            let mut builder = ChainBuilder {
                team,
                links: Vec::new(),
                position: 1,
            };
            let genesis = builder.link(
                owner,
                LinkPayload::Genesis {
                    name,
                    visibility: Visibility::Private,
                    parent: None,
                    members: vec![(user(owner), Role::Owner)],
                    key: meta(1),
                },
            );
            let state = Team::from_genesis(&genesis, &Ancestry::none()).unwrap();
            (builder, state)
        }

        fn link(&mut self, signer: &str, payload: LinkPayload) -> ChainLink {
            let prev = self.links.last().map(|l| l.hash().unwrap());
            let link = ChainLink {
                body: LinkBody {
                    team: self.team,
                    seqno: self.links.len() as u64 + 1,
                    prev,
                    position: self.position,
                    signer: SignerRef {
                        user: user(signer),
                        key_id: KeyId::from_public_key(signer.as_bytes()),
                    },
                    ctime: 0,
                    payload,
                },
                signature: vec![0u8; 64],
            };
            self.position += 1;
            self.links.push(link.clone());
            link
        }
    }

    #[test]
    fn test_membership_and_roles() {
        let (mut chain, mut team) = ChainBuilder::root("alice");
        let add = chain.link(
            "alice",
            LinkPayload::ChangeMembership {
                add: vec![(user("bob"), Role::Writer), (user("carol"), Role::Admin)],
                remove: vec![],
            },
        );
        team.apply_link(&add, &Ancestry::none()).unwrap();
        assert_eq!(team.current_seqno(), 2);
        assert_eq!(team.role_of(&user("bob")), Some(Role::Writer));
        assert!(!team.needs_rotation());

        let promote = chain.link(
            "carol",
            LinkPayload::ChangeRole {
                user: user("bob"),
                role: Role::Admin,
            },
        );
        team.apply_link(&promote, &Ancestry::none()).unwrap();
        assert_eq!(team.role_of(&user("bob")), Some(Role::Admin));
        assert!(team.admin_spans()[&user("bob")][0].is_open());
    }

    #[test]
    fn test_owner_changes_need_owner() {
        let (mut chain, mut team) = ChainBuilder::root("alice");
        let add = chain.link(
            "alice",
            LinkPayload::ChangeMembership {
                add: vec![(user("carol"), Role::Admin)],
                remove: vec![],
            },
        );
        team.apply_link(&add, &Ancestry::none()).unwrap();

        let grab = chain.link(
            "carol",
            LinkPayload::ChangeRole {
                user: user("carol"),
                role: Role::Owner,
            },
        );
        let err = team.apply_link(&grab, &Ancestry::none()).unwrap_err();
        assert!(matches!(err, IntegrityError::Unauthorized { required: "owner", .. }));
        // Rejected link leaves the snapshot untouched.
        assert_eq!(team.current_seqno(), 2);
        assert_eq!(team.role_of(&user("carol")), Some(Role::Admin));
    }

    #[test]
    fn test_sole_owner_cannot_leave_and_removal_flags_rotation() {
        let (mut chain, mut team) = ChainBuilder::root("alice");
        let leave = chain.link("alice", LinkPayload::Leave);
        assert!(matches!(
            team.apply_link(&leave, &Ancestry::none()),
            Err(IntegrityError::OwnerlessTeam { seqno: 2 })
        ));

        let (mut chain, mut team) = ChainBuilder::root("alice");
        let add = chain.link(
            "alice",
            LinkPayload::ChangeMembership {
                add: vec![(user("bob"), Role::Reader)],
                remove: vec![],
            },
        );
        team.apply_link(&add, &Ancestry::none()).unwrap();
        let remove = chain.link(
            "alice",
            LinkPayload::ChangeMembership {
                add: vec![],
                remove: vec![user("bob")],
            },
        );
        team.apply_link(&remove, &Ancestry::none()).unwrap();
        assert!(!team.is_member(&user("bob")));
        assert!(team.needs_rotation());

        let rotate = chain.link("alice", LinkPayload::RotateKey { key: meta(2) });
        team.apply_link(&rotate, &Ancestry::none()).unwrap();
        assert_eq!(team.generation(), 2);
        assert!(!team.needs_rotation());
    }

    #[test]
    fn test_continuity_checks() {
        let (mut chain, mut team) = ChainBuilder::root("alice");
        let mut skipped = chain.link("alice", LinkPayload::RotateKey { key: meta(2) });
        skipped.body.seqno = 3;
        assert!(matches!(
            team.apply_link(&skipped, &Ancestry::none()),
            Err(IntegrityError::UnexpectedSeqno { expected: 2, got: 3 })
        ));

        let mut forked = skipped.clone();
        forked.body.seqno = 2;
        forked.body.prev = None;
        assert!(matches!(
            team.apply_link(&forked, &Ancestry::none()),
            Err(IntegrityError::BrokenHashChain { seqno: 2 })
        ));

        let mut backdated = skipped.clone();
        backdated.body.seqno = 2;
        backdated.body.position = 0;
        assert!(matches!(
            team.apply_link(&backdated, &Ancestry::none()),
            Err(IntegrityError::PositionRegression { .. })
        ));

        let mut gap = skipped;
        gap.body.seqno = 2;
        gap.body.payload = LinkPayload::RotateKey { key: meta(3) };
        assert!(matches!(
            team.apply_link(&gap, &Ancestry::none()),
            Err(IntegrityError::GenerationGap { expected: 2, got: 3 })
        ));
    }

    #[test]
    fn test_nothing_follows_delete() {
        let (mut chain, mut team) = ChainBuilder::root("alice");
        let delete = chain.link("alice", LinkPayload::Delete);
        team.apply_link(&delete, &Ancestry::none()).unwrap();
        assert!(team.is_deleted());

        let after = chain.link("alice", LinkPayload::RotateKey { key: meta(2) });
        assert!(matches!(
            team.apply_link(&after, &Ancestry::none()),
            Err(IntegrityError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn test_root_genesis_id_must_be_derived() {
        let (chain, _) = ChainBuilder::root("alice");
        let mut genesis = chain.links[0].clone();
        genesis.body.team = TeamId::from_bytes([9u8; 16]);
        assert!(matches!(
            Team::from_genesis(&genesis, &Ancestry::none()),
            Err(IntegrityError::TeamIdMismatch { .. })
        ));
    }

    #[test]
    fn test_demotion_closes_admin_span() {
        let (mut chain, mut team) = ChainBuilder::root("alice");
        let add = chain.link(
            "alice",
            LinkPayload::ChangeMembership {
                add: vec![(user("bob"), Role::Admin)],
                remove: vec![],
            },
        );
        team.apply_link(&add, &Ancestry::none()).unwrap();
        let demote = chain.link(
            "alice",
            LinkPayload::ChangeRole {
                user: user("bob"),
                role: Role::Reader,
            },
        );
        team.apply_link(&demote, &Ancestry::none()).unwrap();

        let span = team.admin_spans()[&user("bob")][0];
        assert_eq!(span.from, add.body.position);
        assert_eq!(span.until, Some(demote.body.position));
        assert!(span.covers(add.body.position));
        assert!(!span.covers(demote.body.position));
    }

    /// Parent `acme` with `acme.eng` created at seqno 2, and the genesis of
    /// that subteam as its creator would sign it.
    fn parent_and_subteam_genesis() -> (Team, TeamId, ChainBuilder) {
        let (mut chain, mut parent) = ChainBuilder::root("alice");
        let name: TeamName = "acme.eng".parse().unwrap();
        let id = TeamId::subteam(&parent.id(), &name, 2);
        let create = chain.link("alice", LinkPayload::CreateSubteam { id, name });
        parent.apply_link(&create, &Ancestry::none()).unwrap();

        let sub = ChainBuilder {
            team: id,
            links: Vec::new(),
            position: chain.position,
        };
        (parent, id, sub)
    }

    fn subteam_genesis(sub: &mut ChainBuilder, parent: TeamId, name: &str) -> ChainLink {
        sub.link(
            "alice",
            LinkPayload::Genesis {
                name: name.parse().unwrap(),
                visibility: Visibility::Private,
                parent: Some(parent),
                members: vec![(user("bob"), Role::Writer)],
                key: meta(1),
            },
        )
    }

    #[test]
    fn test_create_subteam_id_must_be_derived() {
        let (mut chain, mut team) = ChainBuilder::root("alice");
        let name: TeamName = "acme.eng".parse().unwrap();

        let made_up = chain.link(
            "alice",
            LinkPayload::CreateSubteam {
                id: TeamId::from_bytes([7u8; 16]),
                name: name.clone(),
            },
        );
        assert!(matches!(
            team.apply_link(&made_up, &Ancestry::none()),
            Err(IntegrityError::TeamIdMismatch { .. })
        ));
        assert!(team.subteams().is_empty());

        // Deriving from the wrong seqno is just as wrong.
        chain.links.pop();
        let stale = chain.link(
            "alice",
            LinkPayload::CreateSubteam {
                id: TeamId::subteam(&team.id(), &name, 1),
                name: name.clone(),
            },
        );
        assert!(team.apply_link(&stale, &Ancestry::none()).is_err());

        chain.links.pop();
        let id = TeamId::subteam(&team.id(), &name, 2);
        let create = chain.link("alice", LinkPayload::CreateSubteam { id, name });
        team.apply_link(&create, &Ancestry::none()).unwrap();
        assert!(team.subteams().contains_key(&id));
    }

    #[test]
    fn test_subteam_genesis_matches_parent_record() {
        let (parent, id, mut sub) = parent_and_subteam_genesis();
        let ancestry = Ancestry::from_ancestors(&[Arc::new(parent.clone())]);

        let genesis = subteam_genesis(&mut sub, parent.id(), "acme.eng");
        let team = Team::from_genesis(&genesis, &ancestry).unwrap();
        assert_eq!(team.id(), id);
        assert_eq!(team.parent(), Some(parent.id()));
        assert!(ancestry.lists_child(&team.id()));

        let (parent, _, mut sub) = parent_and_subteam_genesis();
        let ancestry = Ancestry::from_ancestors(&[Arc::new(parent.clone())]);
        let renamed = subteam_genesis(&mut sub, parent.id(), "acme.ops");
        assert!(matches!(
            Team::from_genesis(&renamed, &ancestry),
            Err(IntegrityError::InvalidPayload { seqno: 1, .. })
        ));
    }
}
