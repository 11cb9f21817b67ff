//! In-process server: chain storage, key directory and push delivery sharing
//! one global clock.
//!
//! Every client of a [`MemoryNetwork`] gets its own [`TeamContext`] and
//! cache, so several users can be simulated inside one test.

use crate::chain::cache::TeamCache;
use crate::chain::error::{DirectoryError, TransportError};
use crate::chain::transport::{FetchRequest, FetchedChain, TeamTransport};
use crate::chain::types::{
    ChainLink, DeviceKind, KeyId, LinkPayload, Position, TeamId, TeamName, TeamNotification,
    TeamSelector, UserId, Visibility,
};
use crate::config::EngineSettings;
use crate::context::TeamContext;
use crate::keys::device::{KeyError, LocalDevice};
use crate::keys::directory::{DeviceKey, UserKeyResolver, UserKeySet};
use crate::keys::sealing::SealedSecret;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};

/// Transport, directory and clock wired together.
#[derive(Clone)]
pub struct MemoryNetwork {
    clock: Arc<AtomicU64>,
    pub transport: Arc<MemoryTransport>,
    pub directory: Arc<MemoryKeyDirectory>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        let clock = Arc::new(AtomicU64::new(1));
        Self {
            transport: Arc::new(MemoryTransport::new(clock.clone())),
            directory: Arc::new(MemoryKeyDirectory::new(clock.clone())),
            clock,
        }
    }

    /// Current global position.
    pub fn position(&self) -> Position {
        self.clock.load(Ordering::SeqCst)
    }

    /// Generate a device for `user` and publish it, active from now. The
    /// clock advances past the registration, so a revocation always lands
    /// strictly after `active_from`.
    pub async fn provision(
        &self,
        user: &str,
        kind: DeviceKind,
    ) -> Result<Arc<LocalDevice>, KeyError> {
        let device = LocalDevice::generate(UserId::new(user), kind)?;
        let active_from = self.clock.fetch_add(1, Ordering::SeqCst);
        let record = device.public_record(active_from)?;
        self.directory.register(device.user().clone(), record).await;
        Ok(Arc::new(device))
    }

    /// A client context for `device` with a cache of its own.
    pub fn context(&self, device: Arc<LocalDevice>, settings: EngineSettings) -> TeamContext {
        let cache = Arc::new(TeamCache::new(&settings));
        TeamContext::new(
            device,
            self.directory.clone(),
            self.transport.clone(),
            cache,
            Arc::new(settings),
        )
    }
}

/// Public key directory.
pub struct MemoryKeyDirectory {
    clock: Arc<AtomicU64>,
    users: RwLock<HashMap<UserId, Vec<DeviceKey>>>,
}

impl MemoryKeyDirectory {
    pub fn new(clock: Arc<AtomicU64>) -> Self {
        Self {
            clock,
            users: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, user: UserId, key: DeviceKey) {
        info!("Registered device {} for {}", key.key_id.short(), user);
        self.users.write().await.entry(user).or_default().push(key);
    }

    /// Revoke a device at the current position and advance the clock, so
    /// anything signed from now on with that key is rejected.
    pub async fn revoke(&self, user: &UserId, key_id: &KeyId) -> Result<Position, DirectoryError> {
        let mut users = self.users.write().await;
        let devices = users
            .get_mut(user)
            .ok_or_else(|| DirectoryError::UnknownUser(user.clone()))?;
        let device = devices
            .iter_mut()
            .find(|d| d.key_id == *key_id)
            .ok_or_else(|| DirectoryError::UnknownKey {
                user: user.clone(),
                key_id: *key_id,
            })?;
        let at = self.clock.fetch_add(1, Ordering::SeqCst);
        device.revoked_at = Some(at);
        info!("Revoked device {} of {} at {}", key_id.short(), user, at);
        Ok(at)
    }
}

#[async_trait]
impl UserKeyResolver for MemoryKeyDirectory {
    async fn resolve_key(
        &self,
        user: &UserId,
        key_id: &KeyId,
    ) -> Result<DeviceKey, DirectoryError> {
        let users = self.users.read().await;
        let devices = users
            .get(user)
            .ok_or_else(|| DirectoryError::UnknownUser(user.clone()))?;
        devices
            .iter()
            .find(|d| d.key_id == *key_id)
            .cloned()
            .ok_or_else(|| DirectoryError::UnknownKey {
                user: user.clone(),
                key_id: *key_id,
            })
    }

    async fn load_latest(
        &self,
        user: &UserId,
        _force_poll: bool,
    ) -> Result<UserKeySet, DirectoryError> {
        let users = self.users.read().await;
        let devices = users
            .get(user)
            .ok_or_else(|| DirectoryError::UnknownUser(user.clone()))?;
        Ok(UserKeySet {
            user: user.clone(),
            devices: devices.clone(),
        })
    }
}

#[derive(Default)]
struct StoredChain {
    links: Vec<ChainLink>,
    boxes: Vec<SealedSecret>,
}

#[derive(Default)]
struct ServerState {
    chains: HashMap<TeamId, StoredChain>,
    names: HashMap<(TeamName, Visibility), TeamId>,
}

struct Subscriber {
    user: UserId,
    sender: mpsc::Sender<TeamNotification>,
}

/// Chain storage enforcing strict seqno order, with push delivery to
/// subscribers.
pub struct MemoryTransport {
    clock: Arc<AtomicU64>,
    state: RwLock<ServerState>,
    subscribers: RwLock<Vec<Subscriber>>,
    fetch_delay: RwLock<Option<Duration>>,
    fetches: AtomicUsize,
}

impl MemoryTransport {
    pub fn new(clock: Arc<AtomicU64>) -> Self {
        Self {
            clock,
            state: RwLock::new(ServerState::default()),
            subscribers: RwLock::new(Vec::new()),
            fetch_delay: RwLock::new(None),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Deliver notifications about every team to `user`'s `sender`.
    pub async fn subscribe(&self, user: UserId, sender: mpsc::Sender<TeamNotification>) {
        self.subscribers.write().await.push(Subscriber { user, sender });
    }

    /// Delay every fetch, to hold loads in flight.
    pub async fn set_fetch_delay(&self, delay: Option<Duration>) {
        *self.fetch_delay.write().await = delay;
    }

    /// Number of fetches served so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub async fn chain_len(&self, team: &TeamId) -> usize {
        self.state
            .read()
            .await
            .chains
            .get(team)
            .map_or(0, |c| c.links.len())
    }

    /// Append `link` without any checks, as a misbehaving server would.
    pub async fn inject_link(&self, link: ChainLink) {
        let team = link.team();
        warn!("Injecting unchecked link {} into team {}", link.seqno(), team.short());
        self.state
            .write()
            .await
            .chains
            .entry(team)
            .or_default()
            .links
            .push(link);
        self.clock.fetch_add(1, Ordering::SeqCst);
    }

    async fn publish(&self, notification: TeamNotification, exited: &[UserId]) {
        for subscriber in self.subscribers.read().await.iter() {
            let message = if exited.contains(&subscriber.user) {
                TeamNotification::Exit {
                    team: notification.team(),
                }
            } else {
                notification.clone()
            };
            if let Err(e) = subscriber.sender.try_send(message) {
                debug!("Notification to {} not delivered: {}", subscriber.user, e);
            }
        }
    }
}

#[async_trait]
impl TeamTransport for MemoryTransport {
    async fn fetch_links(&self, request: &FetchRequest) -> Result<FetchedChain, TransportError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.fetch_delay.read().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.state.read().await;
        let team = match &request.selector {
            TeamSelector::Id(id) => *id,
            TeamSelector::Name(name) => *state
                .names
                .get(&(name.clone(), request.visibility))
                .ok_or_else(|| TransportError::NotFound(name.to_string()))?,
        };
        let chain = state
            .chains
            .get(&team)
            .ok_or_else(|| TransportError::NotFound(team.to_string()))?;

        let links = chain
            .links
            .iter()
            .filter(|l| l.seqno() > request.after)
            .cloned()
            .collect();
        let boxes = chain
            .boxes
            .iter()
            .filter(|b| {
                b.recipient == request.requester.user && b.recipient_key == request.requester.key_id
            })
            .cloned()
            .collect();
        Ok(FetchedChain { team, links, boxes })
    }

    async fn submit_link(
        &self,
        link: ChainLink,
        boxes: Vec<SealedSecret>,
    ) -> Result<(), TransportError> {
        let team = link.team();
        let seqno = link.seqno();
        let mut exited = Vec::new();
        let notification = {
            let mut state = self.state.write().await;
            let current = state.chains.get(&team).map_or(0, |c| c.links.len() as u64);
            if seqno != current + 1 {
                return Err(TransportError::SeqnoConflict {
                    submitted: seqno,
                    current,
                });
            }

            let visibility = match state.chains.get(&team).and_then(|c| c.links.first()) {
                Some(genesis) => match &genesis.body.payload {
                    LinkPayload::Genesis { visibility, .. } => *visibility,
                    _ => Visibility::Private,
                },
                None => Visibility::Private,
            };
            match &link.body.payload {
                LinkPayload::Genesis {
                    name, visibility, ..
                } => {
                    state.names.insert((name.clone(), *visibility), team);
                }
                LinkPayload::Rename { name } => {
                    state.names.retain(|_, id| *id != team);
                    state.names.insert((name.clone(), visibility), team);
                }
                LinkPayload::ChangeMembership { remove, .. } => exited.extend(remove.iter().cloned()),
                LinkPayload::Leave => exited.push(link.signer().user.clone()),
                _ => {}
            }

            let notification = match &link.body.payload {
                LinkPayload::Delete => TeamNotification::Deleted { team },
                payload => TeamNotification::Changed {
                    team,
                    changes: payload.change_flags(),
                    latest_seqno: seqno,
                },
            };

            let chain = state.chains.entry(team).or_default();
            chain.links.push(link);
            chain.boxes.extend(boxes);
            notification
        };
        let position = self.clock.fetch_add(1, Ordering::SeqCst);
        debug!(
            "Accepted link {} for team {} at position {}",
            seqno,
            team.short(),
            position
        );

        self.publish(notification, &exited).await;
        Ok(())
    }

    async fn current_position(&self) -> Result<Position, TransportError> {
        Ok(self.clock.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_directory_revocation_advances_clock() {
        let network = MemoryNetwork::new();
        let device = network.provision("alice", DeviceKind::Desktop).await.unwrap();
        let start = network.position();

        // Revoked before anything was signed, the key still covers the
        // position it was registered at.
        let at = network
            .directory
            .revoke(device.user(), &device.key_id())
            .await
            .unwrap();
        assert_eq!(at, start);
        assert_eq!(network.position(), start + 1);

        let key = network
            .directory
            .resolve_key(device.user(), &device.key_id())
            .await
            .unwrap();
        assert!(key.active_from < at);
        assert!(key.is_active_at(key.active_from));
        assert!(!key.is_active_at(at));

        let set = network
            .directory
            .load_latest(device.user(), true)
            .await
            .unwrap();
        assert_eq!(set.active_devices().count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_user_and_key() {
        let network = MemoryNetwork::new();
        let device = network.provision("alice", DeviceKind::Mobile).await.unwrap();

        let err = network
            .directory
            .resolve_key(&UserId::new("mallory"), &device.key_id())
            .await
            .unwrap_err();
        assert!(matches!(err, DirectoryError::UnknownUser(_)));

        let other = KeyId::from_public_key(b"not a key");
        let err = network
            .directory
            .resolve_key(device.user(), &other)
            .await
            .unwrap_err();
        assert!(matches!(err, DirectoryError::UnknownKey { .. }));
    }

    #[tokio::test]
    async fn test_fetch_unknown_team() {
        let network = MemoryNetwork::new();
        let device = network.provision("alice", DeviceKind::Desktop).await.unwrap();
        let request = FetchRequest {
            selector: TeamSelector::Name("nobody".parse::<TeamName>().unwrap()),
            visibility: Visibility::Private,
            after: 0,
            requester: device.signer(),
        };
        let err = network.transport.fetch_links(&request).await.unwrap_err();
        assert!(matches!(err, TransportError::NotFound(_)));
        assert_eq!(network.transport.fetch_count(), 1);
    }
}
