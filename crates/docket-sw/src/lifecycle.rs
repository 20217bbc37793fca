//! Install/activate lifecycle and generation-based cleanup.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;

use docket_net::{cache_key, Request};

use crate::store::{CacheEntry, CacheStore};
use crate::strategy::StrategyContext;
use crate::{EngineEvent, Result, ServiceWorkerError};

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceWorkerState {
    /// Initial state, nothing installed yet.
    #[default]
    Parsed,
    /// Pre-warming essential resources.
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Removing old generations.
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Install failed.
    Redundant,
}

impl ServiceWorkerState {
    fn can_become(self, next: ServiceWorkerState) -> bool {
        use ServiceWorkerState::*;
        matches!(
            (self, next),
            (Parsed, Installing)
                | (Installing, Installed)
                | (Installed, Activating)
                | (Activating, Activated)
                | (_, Redundant)
        )
    }
}

/// Tracks the engine's lifecycle state for one cache generation.
#[derive(Debug)]
pub struct Lifecycle {
    version: String,
    state: ServiceWorkerState,
    skip_waiting: bool,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl Lifecycle {
    pub fn new(version: impl Into<String>, events: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self {
            version: version.into(),
            state: ServiceWorkerState::Parsed,
            skip_waiting: false,
            events,
        }
    }

    pub fn state(&self) -> ServiceWorkerState {
        self.state
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }

    /// Whether activation should happen without waiting for old instances.
    pub fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting
    }

    pub fn request_skip_waiting(&mut self) {
        self.skip_waiting = true;
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub fn transition(&mut self, next: ServiceWorkerState) -> Result<()> {
        if !self.state.can_become(next) {
            return Err(ServiceWorkerError::State(format!(
                "cannot move from {:?} to {:?}",
                self.state, next
            )));
        }
        info!(version = %self.version, from = ?self.state, to = ?next, "Lifecycle transition");
        self.state = next;
        let _ = self.events.send(EngineEvent::StateChange {
            version: self.version.clone(),
            state: next,
        });
        Ok(())
    }
}

/// Fetch every resource and store them in `partition`.
///
/// Nothing is written unless every fetch succeeds with a 2xx status.
pub async fn precache(ctx: &StrategyContext, partition: &str, resources: &[Url]) -> Result<usize> {
    let mut fetched = Vec::with_capacity(resources.len());
    for url in resources {
        let response = ctx.fetch(Request::get(url.clone())).await?;
        if !response.ok() {
            return Err(ServiceWorkerError::Cache(format!(
                "precache of {url} returned {}",
                response.status
            )));
        }
        fetched.push((cache_key(url), response));
    }

    let now = ctx.clock.now_millis();
    for (key, response) in &fetched {
        ctx.store
            .put(partition, CacheEntry::from_response(key, response, now))
            .await?;
    }
    debug!(partition, count = fetched.len(), "Precached essential resources");
    Ok(fetched.len())
}

/// Delete every partition of an older generation.
///
/// Versioned partitions are named `<prefix>-<version>` or
/// `<prefix>-<store>-<version>`. One is kept only when it ends in the active
/// version. Names outside `<prefix>-` (the queue partition, other products
/// sharing the prefix text) are never touched.
pub async fn collect_stale_generations(
    store: &dyn CacheStore,
    prefix: &str,
    version: &str,
) -> Result<Vec<String>> {
    let owned = format!("{prefix}-");
    let current = format!("-{version}");
    let mut deleted = Vec::new();
    for name in store.partitions().await? {
        if name.starts_with(&owned) && !name.ends_with(&current) {
            if store.delete_partition(&name).await? {
                info!(partition = %name, "Deleted old cache generation");
                deleted.push(name);
            } else {
                warn!(partition = %name, "Old generation vanished before deletion");
            }
        }
    }
    Ok(deleted)
}
