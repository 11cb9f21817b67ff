//! Types for the verified team chain.

use crate::chain::error::{IntegrityError, NameError};
use crate::keys::sealing::TeamSecret;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Position of a link within its team chain (1-based, dense).
pub type Seqno = u64;

/// Global position at which a statement was signed.
///
/// Key activation and revocation are recorded against the same clock, which
/// is what lets a verifier decide whether a key was valid when it signed.
pub type Position = u64;

/// Shared-secret generation number (1-based, dense).
pub type Generation = u32;

/// Domain separation prefix for link signatures.
const LINK_SIGNATURE_DOMAIN: &[u8] = b"teamchain.link.v1";

/// Domain separation prefix for root team identifiers.
const ROOT_ID_DOMAIN: &[u8] = b"teamchain.root-team.v1";

/// Domain separation prefix for subteam identifiers.
const SUBTEAM_ID_DOMAIN: &[u8] = b"teamchain.subteam.v1";

/// Minimum and maximum length of a single name part.
const NAME_PART_MIN: usize = 2;
const NAME_PART_MAX: usize = 16;

/// Stable team identifier (16 bytes).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TeamId([u8; 16]);

impl TeamId {
    /// Derive the identifier of a root team from its name and visibility.
    ///
    /// Root teams can therefore be addressed by name without a lookup.
    pub fn root(name: &TeamName, visibility: Visibility) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(ROOT_ID_DOMAIN);
        hasher.update([visibility.as_byte()]);
        hasher.update(name.as_str().as_bytes());
        Self::from_digest(hasher.finalize().as_slice())
    }

    /// Derive the identifier of a subteam.
    ///
    /// Mixing in the parent's seqno at creation keeps a recreated subteam
    /// with a previously used name distinct from the old one.
    pub fn subteam(parent: &TeamId, name: &TeamName, parent_seqno: Seqno) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(SUBTEAM_ID_DOMAIN);
        hasher.update(parent.0);
        hasher.update(name.as_str().as_bytes());
        hasher.update(parent_seqno.to_le_bytes());
        Self::from_digest(hasher.finalize().as_slice())
    }

    fn from_digest(digest: &[u8]) -> Self {
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        Self(id)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// First 8 hex characters, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for TeamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for TeamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TeamId({})", hex::encode(self.0))
    }
}

/// Team visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Private,
    Public,
}

impl Visibility {
    pub fn as_byte(&self) -> u8 {
        match self {
            Visibility::Private => 0x00,
            Visibility::Public => 0x01,
        }
    }
}

/// Hierarchical team name such as `acme.eng.web`.
///
/// Each dot-separated part is 2-16 characters of `[a-z0-9_]` and starts
/// with a letter. A name with a single part names a root team.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TeamName(String);

impl TeamName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        !self.0.contains('.')
    }

    /// The name of the parent team, or `None` for a root team.
    pub fn parent(&self) -> Option<TeamName> {
        self.0
            .rsplit_once('.')
            .map(|(parent, _)| TeamName(parent.to_string()))
    }

    /// Append a subteam part.
    pub fn append(&self, part: &str) -> Result<TeamName, NameError> {
        validate_part(part)?;
        Ok(TeamName(format!("{}.{}", self.0, part)))
    }

    /// Replace the last part, keeping the same parent.
    pub fn with_last_part(&self, part: &str) -> Result<TeamName, NameError> {
        match self.parent() {
            Some(parent) => parent.append(part),
            None => {
                validate_part(part)?;
                Ok(TeamName(part.to_string()))
            }
        }
    }
}

fn validate_part(part: &str) -> Result<(), NameError> {
    let len_ok = (NAME_PART_MIN..=NAME_PART_MAX).contains(&part.len());
    let first_ok = part.chars().next().is_some_and(|c| c.is_ascii_lowercase());
    let chars_ok = part
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if len_ok && first_ok && chars_ok {
        Ok(())
    } else {
        Err(NameError::InvalidTeamName(part.to_string()))
    }
}

impl FromStr for TeamName {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.to_ascii_lowercase();
        if lowered.is_empty() {
            return Err(NameError::InvalidTeamName(s.to_string()));
        }
        for part in lowered.split('.') {
            validate_part(part).map_err(|_| NameError::InvalidTeamName(s.to_string()))?;
        }
        Ok(TeamName(lowered))
    }
}

impl TryFrom<String> for TeamName {
    type Error = NameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TeamName> for String {
    fn from(name: TeamName) -> Self {
        name.0
    }
}

impl fmt::Display for TeamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for TeamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TeamName({})", self.0)
    }
}

/// User identity (username).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of a device key: the first 16 bytes of SHA-256 over the
/// device's SEC1-encoded signing key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyId([u8; 16]);

impl KeyId {
    pub fn from_public_key(sec1: &[u8]) -> Self {
        let digest = Sha256::digest(sec1);
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({})", self.short())
    }
}

/// Kind of device a key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Desktop,
    Mobile,
    /// Offline backup key.
    Paper,
}

/// Team role, ordered by authority (`Reader < Writer < Admin < Owner`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Reader,
    Writer,
    Admin,
    Owner,
}

impl Role {
    pub fn is_admin_or_above(&self) -> bool {
        matches!(self, Role::Admin | Role::Owner)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Reader => write!(f, "reader"),
            Role::Writer => write!(f, "writer"),
            Role::Admin => write!(f, "admin"),
            Role::Owner => write!(f, "owner"),
        }
    }
}

/// The user and device key that signed a link.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignerRef {
    pub user: UserId,
    pub key_id: KeyId,
}

/// SHA-256 hash of a link (body and signature).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkHash([u8; 32]);

impl LinkHash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for LinkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LinkHash({})", hex::encode(&self.0[..8]))
    }
}

/// Public metadata of one shared-secret generation.
///
/// The secret itself never appears in a link; `key_check` is a commitment
/// members use to validate the secret they unseal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationMeta {
    pub generation: Generation,
    pub key_check: [u8; 32],
    pub created_at: i64,
}

impl GenerationMeta {
    pub fn new(generation: Generation, secret: &TeamSecret) -> Self {
        Self {
            generation,
            key_check: secret.key_check(),
            created_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// The mutation carried by a link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LinkPayload {
    /// First link of every team.
    Genesis {
        name: TeamName,
        visibility: Visibility,
        parent: Option<TeamId>,
        members: Vec<(UserId, Role)>,
        key: GenerationMeta,
    },
    ChangeMembership {
        add: Vec<(UserId, Role)>,
        remove: Vec<UserId>,
    },
    ChangeRole {
        user: UserId,
        role: Role,
    },
    RotateKey {
        key: GenerationMeta,
    },
    Rename {
        name: TeamName,
    },
    CreateSubteam {
        id: TeamId,
        name: TeamName,
    },
    /// The signer leaves the team.
    Leave,
    Delete,
}

impl LinkPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            LinkPayload::Genesis { .. } => "genesis",
            LinkPayload::ChangeMembership { .. } => "change_membership",
            LinkPayload::ChangeRole { .. } => "change_role",
            LinkPayload::RotateKey { .. } => "rotate_key",
            LinkPayload::Rename { .. } => "rename",
            LinkPayload::CreateSubteam { .. } => "create_subteam",
            LinkPayload::Leave => "leave",
            LinkPayload::Delete => "delete",
        }
    }

    /// Notification flags describing the effect of this payload.
    pub fn change_flags(&self) -> ChangeFlags {
        match self {
            LinkPayload::Genesis { .. }
            | LinkPayload::ChangeMembership { .. }
            | LinkPayload::ChangeRole { .. }
            | LinkPayload::Leave => ChangeFlags {
                membership_changed: true,
                ..ChangeFlags::default()
            },
            LinkPayload::RotateKey { .. } => ChangeFlags {
                key_rotated: true,
                ..ChangeFlags::default()
            },
            LinkPayload::Rename { .. } => ChangeFlags {
                renamed: true,
                ..ChangeFlags::default()
            },
            LinkPayload::CreateSubteam { .. } | LinkPayload::Delete => ChangeFlags::default(),
        }
    }
}

/// The signed portion of a link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkBody {
    pub team: TeamId,
    pub seqno: Seqno,
    pub prev: Option<LinkHash>,
    pub position: Position,
    pub signer: SignerRef,
    pub ctime: i64,
    pub payload: LinkPayload,
}

impl LinkBody {
    /// The 32-byte message signed by the device key.
    ///
    /// Message format: SHA256(domain || canonical_json(body))
    pub fn signing_message(&self) -> Result<[u8; 32], IntegrityError> {
        let encoded = serde_json::to_vec(self).map_err(|e| IntegrityError::Encoding {
            seqno: self.seqno,
            reason: e.to_string(),
        })?;
        let mut hasher = Sha256::new();
        hasher.update(LINK_SIGNATURE_DOMAIN);
        hasher.update(&encoded);
        Ok(hasher.finalize().into())
    }
}

/// One immutable, signed, sequence-numbered mutation of a team.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLink {
    pub body: LinkBody,
    /// ES256 signature (64 bytes, r || s) over [`LinkBody::signing_message`].
    pub signature: Vec<u8>,
}

impl ChainLink {
    pub fn seqno(&self) -> Seqno {
        self.body.seqno
    }

    pub fn team(&self) -> TeamId {
        self.body.team
    }

    pub fn signer(&self) -> &SignerRef {
        &self.body.signer
    }

    /// Hash committing to both body and signature; the next link's `prev`.
    pub fn hash(&self) -> Result<LinkHash, IntegrityError> {
        let encoded = serde_json::to_vec(&self.body).map_err(|e| IntegrityError::Encoding {
            seqno: self.body.seqno,
            reason: e.to_string(),
        })?;
        let mut hasher = Sha256::new();
        hasher.update(&encoded);
        hasher.update(&self.signature);
        Ok(LinkHash(hasher.finalize().into()))
    }

    /// Parent reference declared by a genesis link.
    pub fn genesis_parent(&self) -> Option<TeamId> {
        match &self.body.payload {
            LinkPayload::Genesis { parent, .. } => *parent,
            _ => None,
        }
    }
}

/// How a caller names the team to load.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TeamSelector {
    Id(TeamId),
    Name(TeamName),
}

impl fmt::Display for TeamSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TeamSelector::Id(id) => write!(f, "{}", id),
            TeamSelector::Name(name) => write!(f, "{}", name),
        }
    }
}

/// Load request.
#[derive(Debug, Clone)]
pub struct LoadTeamArg {
    pub selector: TeamSelector,
    pub visibility: Visibility,
    /// Fetch new links even when the cached copy is fresh.
    pub force_repoll: bool,
    /// Discard the cached copy and re-verify the whole chain.
    pub force_full_reload: bool,
    /// Accept a cached copy regardless of its age.
    pub allow_stale: bool,
}

impl LoadTeamArg {
    pub fn by_id(id: TeamId) -> Self {
        Self::new(TeamSelector::Id(id))
    }

    pub fn by_name(name: TeamName) -> Self {
        Self::new(TeamSelector::Name(name))
    }

    fn new(selector: TeamSelector) -> Self {
        Self {
            selector,
            visibility: Visibility::Private,
            force_repoll: false,
            force_full_reload: false,
            allow_stale: false,
        }
    }

    pub fn public(mut self) -> Self {
        self.visibility = Visibility::Public;
        self
    }

    pub fn force_repoll(mut self) -> Self {
        self.force_repoll = true;
        self
    }

    pub fn full_reload(mut self) -> Self {
        self.force_repoll = true;
        self.force_full_reload = true;
        self
    }

    pub fn stale_ok(mut self) -> Self {
        self.allow_stale = true;
        self
    }
}

/// What changed in a team, as reported by a push notification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeFlags {
    pub membership_changed: bool,
    pub key_rotated: bool,
    pub renamed: bool,
}

impl ChangeFlags {
    pub fn merge(self, other: ChangeFlags) -> ChangeFlags {
        ChangeFlags {
            membership_changed: self.membership_changed || other.membership_changed,
            key_rotated: self.key_rotated || other.key_rotated,
            renamed: self.renamed || other.renamed,
        }
    }
}

/// Inbound change notification. Delivery is at-least-once and best-effort.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TeamNotification {
    Changed {
        team: TeamId,
        changes: ChangeFlags,
        latest_seqno: Seqno,
    },
    Deleted {
        team: TeamId,
    },
    /// The local user is no longer a member.
    Exit {
        team: TeamId,
    },
}

impl TeamNotification {
    pub fn team(&self) -> TeamId {
        match self {
            TeamNotification::Changed { team, .. }
            | TeamNotification::Deleted { team }
            | TeamNotification::Exit { team } => *team,
        }
    }
}

/// One epoch of the team's shared secret.
///
/// `secret` is present only when the local device could unseal it.
#[derive(Debug, Clone)]
pub struct SharedSecretGeneration {
    pub meta: GenerationMeta,
    pub secret: Option<TeamSecret>,
}

/// Interval during which a user held Owner or Admin.
///
/// `until` is the position of the link that ended it; still open if `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdminSpan {
    pub from: Position,
    pub until: Option<Position>,
}

impl AdminSpan {
    pub fn covers(&self, position: Position) -> bool {
        position >= self.from && self.until.map_or(true, |until| position < until)
    }

    pub fn is_open(&self) -> bool {
        self.until.is_none()
    }
}

/// Verified, merged team snapshot.
///
/// Snapshots are immutable once published to the cache; a merge produces a
/// new snapshot.
#[derive(Debug, Clone)]
pub struct Team {
    pub(crate) id: TeamId,
    pub(crate) name: TeamName,
    pub(crate) visibility: Visibility,
    pub(crate) parent: Option<TeamId>,
    pub(crate) seqno: Seqno,
    pub(crate) last_hash: Option<LinkHash>,
    pub(crate) last_position: Position,
    pub(crate) roster: BTreeMap<UserId, Role>,
    pub(crate) admin_spans: BTreeMap<UserId, Vec<AdminSpan>>,
    pub(crate) subteams: BTreeMap<TeamId, TeamName>,
    pub(crate) generations: BTreeMap<Generation, SharedSecretGeneration>,
    pub(crate) needs_rotation: bool,
    pub(crate) deleted: bool,
}

impl Team {
    pub fn id(&self) -> TeamId {
        self.id
    }

    pub fn name(&self) -> &TeamName {
        &self.name
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    pub fn parent(&self) -> Option<TeamId> {
        self.parent
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn current_seqno(&self) -> Seqno {
        self.seqno
    }

    pub fn last_link_hash(&self) -> Option<LinkHash> {
        self.last_hash
    }

    pub fn last_position(&self) -> Position {
        self.last_position
    }

    /// Latest shared-secret generation (0 before genesis is applied).
    pub fn generation(&self) -> Generation {
        self.generations.keys().next_back().copied().unwrap_or(0)
    }

    pub fn generation_meta(&self, generation: Generation) -> Option<&GenerationMeta> {
        self.generations.get(&generation).map(|g| &g.meta)
    }

    pub fn generations(&self) -> impl Iterator<Item = &SharedSecretGeneration> {
        self.generations.values()
    }

    pub fn secret(&self, generation: Generation) -> Option<&TeamSecret> {
        self.generations
            .get(&generation)
            .and_then(|g| g.secret.as_ref())
    }

    pub fn current_secret(&self) -> Option<&TeamSecret> {
        self.secret(self.generation())
    }

    pub fn role_of(&self, user: &UserId) -> Option<Role> {
        self.roster.get(user).copied()
    }

    pub fn is_member(&self, user: &UserId) -> bool {
        self.roster.contains_key(user)
    }

    pub fn members(&self) -> impl Iterator<Item = (&UserId, Role)> {
        self.roster.iter().map(|(user, role)| (user, *role))
    }

    pub fn member_count(&self) -> usize {
        self.roster.len()
    }

    pub fn owners(&self) -> impl Iterator<Item = &UserId> {
        self.roster
            .iter()
            .filter(|(_, role)| **role == Role::Owner)
            .map(|(user, _)| user)
    }

    /// True if `user` is the only remaining Owner.
    pub fn is_sole_owner(&self, user: &UserId) -> bool {
        self.role_of(user) == Some(Role::Owner) && self.owners().count() == 1
    }

    /// Admin history, used to judge implicit authority in descendants.
    pub fn admin_spans(&self) -> &BTreeMap<UserId, Vec<AdminSpan>> {
        &self.admin_spans
    }

    /// Subteams created by this team, with the name given at creation.
    pub fn subteams(&self) -> &BTreeMap<TeamId, TeamName> {
        &self.subteams
    }

    /// A member left or was removed and no rotation has followed yet.
    pub fn needs_rotation(&self) -> bool {
        self.needs_rotation
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }
}
