//! Explicit context threaded through every team operation.

use crate::chain::cache::TeamCache;
use crate::chain::error::{IntegrityError, TeamError};
use crate::chain::transport::TeamTransport;
use crate::chain::types::TeamId;
use crate::config::EngineSettings;
use crate::keys::device::LocalDevice;
use crate::keys::directory::UserKeyResolver;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Handles and limits for one caller.
///
/// Cloning is cheap; every handle is shared. The cache is the only mutable
/// state and it lives behind [`TeamCache`].
#[derive(Clone)]
pub struct TeamContext {
    me: Arc<LocalDevice>,
    keys: Arc<dyn UserKeyResolver>,
    transport: Arc<dyn TeamTransport>,
    cache: Arc<TeamCache>,
    settings: Arc<EngineSettings>,
    deadline: Option<Instant>,
    /// Teams whose load is waiting on an ancestor load through this context.
    lineage: Arc<Vec<TeamId>>,
}

impl TeamContext {
    pub fn new(
        me: Arc<LocalDevice>,
        keys: Arc<dyn UserKeyResolver>,
        transport: Arc<dyn TeamTransport>,
        cache: Arc<TeamCache>,
        settings: Arc<EngineSettings>,
    ) -> Self {
        Self {
            me,
            keys,
            transport,
            cache,
            settings,
            deadline: None,
            lineage: Arc::new(Vec::new()),
        }
    }

    pub fn me(&self) -> &LocalDevice {
        &self.me
    }

    pub fn keys(&self) -> &dyn UserKeyResolver {
        self.keys.as_ref()
    }

    pub fn transport(&self) -> &dyn TeamTransport {
        self.transport.as_ref()
    }

    pub fn cache(&self) -> &Arc<TeamCache> {
        &self.cache
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Fail fast once the deadline has passed.
    pub fn check_deadline(&self) -> Result<(), TeamError> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(TeamError::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Run `fut`, giving up at the deadline.
    pub async fn bounded<F, T>(&self, fut: F) -> Result<T, TeamError>
    where
        F: Future<Output = Result<T, TeamError>>,
    {
        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, fut)
                .await
                .map_err(|_| TeamError::DeadlineExceeded)?,
            None => fut.await,
        }
    }

    /// Refuse to wait on a team whose load is already waiting on us.
    ///
    /// Seeing `team` again while resolving ancestors means the parent
    /// references loop; joining its single-flight entry would never return.
    pub(crate) fn check_lineage(&self, team: TeamId) -> Result<(), TeamError> {
        if self.lineage.contains(&team) {
            return Err(IntegrityError::AncestorCycle { team }.into());
        }
        Ok(())
    }

    /// Teams whose loads are blocked on whatever this context loads next,
    /// innermost last.
    pub(crate) fn lineage(&self) -> &[TeamId] {
        &self.lineage
    }

    /// Context for loading the ancestors of `team`.
    pub(crate) fn descend(&self, team: TeamId) -> Self {
        let mut lineage = self.lineage.as_ref().clone();
        lineage.push(team);
        Self {
            lineage: Arc::new(lineage),
            ..self.clone()
        }
    }
}

impl std::fmt::Debug for TeamContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TeamContext")
            .field("me", &self.me)
            .field("deadline", &self.deadline)
            .field("lineage", &self.lineage)
            .finish()
    }
}
