//! Fetch/cache strategies.
//!
//! Each [`StrategyKind`] variant has one [`Strategy`] implementation. A
//! strategy returns `None` only for a cache-only miss; every other failure is
//! turned into a synthetic response here and never reaches the caller as an
//! error.

use std::sync::Arc;

use async_trait::async_trait;
use docket_common::Clock;
use docket_net::{Fetcher, NetError, Request, Response};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use crate::fallback;
use crate::router::RouteRule;
use crate::store::{is_expired, CacheEntry, CacheStore};
use crate::{EngineEvent, RevalidationOutcome};

/// Cache/network ordering policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    CacheFirst,
    NetworkFirst,
    StaleWhileRevalidate,
    NetworkOnly,
    CacheOnly,
}

impl StrategyKind {
    /// Parse a configured strategy name. Unknown names fall back to
    /// network-first.
    pub fn parse(name: &str) -> Self {
        match name {
            "cache-first" => Self::CacheFirst,
            "network-first" => Self::NetworkFirst,
            "stale-while-revalidate" => Self::StaleWhileRevalidate,
            "network-only" => Self::NetworkOnly,
            "cache-only" => Self::CacheOnly,
            other => {
                warn!(strategy = other, "Unknown strategy, using network-first");
                Self::NetworkFirst
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CacheFirst => "cache-first",
            Self::NetworkFirst => "network-first",
            Self::StaleWhileRevalidate => "stale-while-revalidate",
            Self::NetworkOnly => "network-only",
            Self::CacheOnly => "cache-only",
        }
    }

    /// The implementation for this variant.
    pub fn strategy(&self) -> &'static dyn Strategy {
        match self {
            Self::CacheFirst => &CacheFirst,
            Self::NetworkFirst => &NetworkFirst,
            Self::StaleWhileRevalidate => &StaleWhileRevalidate,
            Self::NetworkOnly => &NetworkOnly,
            Self::CacheOnly => &CacheOnly,
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ==================== Context ====================

/// Everything a strategy needs besides the request and rule.
#[derive(Clone)]
pub struct StrategyContext {
    pub store: Arc<dyn CacheStore>,
    pub fetcher: Arc<dyn Fetcher>,
    pub clock: Arc<dyn Clock>,
    pub events: mpsc::UnboundedSender<EngineEvent>,
}

impl StrategyContext {
    /// Read one entry. Store failures are logged and count as a miss.
    pub async fn lookup(&self, partition: &str, key: &str) -> Option<CacheEntry> {
        match self.store.match_entry(partition, key).await {
            Ok(entry) => entry,
            Err(e) => {
                error!(partition, key, error = %e, "Cache read failed");
                None
            }
        }
    }

    /// Read a key from whichever partition holds it.
    pub async fn lookup_any(&self, key: &str) -> Option<CacheEntry> {
        match self.store.match_any(key).await {
            Ok(entry) => entry,
            Err(e) => {
                error!(key = %key, error = %e, "Cache read failed");
                None
            }
        }
    }

    pub async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        self.fetcher.fetch(request).await
    }

    /// Store a successful response and trim the partition to its capacity.
    /// Returns whether the entry was written.
    pub async fn store_response(
        &self,
        partition: &str,
        max_entries: Option<usize>,
        key: &str,
        response: &Response,
    ) -> bool {
        if !response.ok() {
            return false;
        }
        let entry = CacheEntry::from_response(key, response, self.clock.now_millis());
        if let Err(e) = self.store.put(partition, entry).await {
            error!(partition, key, error = %e, "Cache write failed");
            return false;
        }
        if let Some(max) = max_entries {
            match self.store.trim(partition, max).await {
                Ok(0) => {}
                Ok(evicted) => debug!(partition, evicted, "Partition trimmed"),
                Err(e) => error!(partition, error = %e, "Cache trim failed"),
            }
        }
        true
    }

    pub fn is_expired(&self, entry: &CacheEntry, max_age_seconds: Option<u64>) -> bool {
        is_expired(entry, max_age_seconds, self.clock.now())
    }

    fn emit(&self, event: EngineEvent) {
        // The host may have dropped the receiver.
        let _ = self.events.send(event);
    }
}

// ==================== Strategies ====================

/// One fetch/cache policy.
#[async_trait]
pub trait Strategy: Send + Sync {
    async fn execute(
        &self,
        ctx: &StrategyContext,
        request: Request,
        rule: &RouteRule,
    ) -> Option<Response>;
}

/// Dispatch a request to the rule's strategy.
pub async fn execute(ctx: &StrategyContext, request: Request, rule: &RouteRule) -> Option<Response> {
    trace!(url = %request.url, strategy = %rule.strategy, "Executing strategy");
    rule.strategy.strategy().execute(ctx, request, rule).await
}

pub struct CacheFirst;

#[async_trait]
impl Strategy for CacheFirst {
    async fn execute(
        &self,
        ctx: &StrategyContext,
        request: Request,
        rule: &RouteRule,
    ) -> Option<Response> {
        let key = request.cache_key();
        let cached = ctx.lookup(&rule.store_name, &key).await;

        if let Some(entry) = &cached {
            if !ctx.is_expired(entry, rule.max_age_seconds) {
                trace!(key = %key, "Cache hit");
                return Some(entry.to_response());
            }
        }

        match ctx.fetch(request).await {
            Ok(response) => {
                ctx.store_response(&rule.store_name, rule.max_entries, &key, &response)
                    .await;
                Some(response)
            }
            Err(e) => {
                debug!(key = %key, error = %e, "Network failed, serving stale copy if any");
                Some(
                    cached
                        .map(|entry| entry.to_response())
                        .unwrap_or_else(fallback::network_error),
                )
            }
        }
    }
}

pub struct NetworkFirst;

#[async_trait]
impl Strategy for NetworkFirst {
    async fn execute(
        &self,
        ctx: &StrategyContext,
        request: Request,
        rule: &RouteRule,
    ) -> Option<Response> {
        let key = request.cache_key();
        match ctx.fetch(request).await {
            Ok(response) => {
                ctx.store_response(&rule.store_name, rule.max_entries, &key, &response)
                    .await;
                Some(response)
            }
            Err(e) => {
                debug!(key = %key, error = %e, "Network failed, trying cache");
                let fresh = ctx
                    .lookup(&rule.store_name, &key)
                    .await
                    .filter(|entry| !ctx.is_expired(entry, rule.max_age_seconds));
                Some(
                    fresh
                        .map(|entry| entry.to_response())
                        .unwrap_or_else(fallback::network_error),
                )
            }
        }
    }
}

pub struct StaleWhileRevalidate;

#[async_trait]
impl Strategy for StaleWhileRevalidate {
    async fn execute(
        &self,
        ctx: &StrategyContext,
        request: Request,
        rule: &RouteRule,
    ) -> Option<Response> {
        let key = request.cache_key();
        let cached = ctx.lookup(&rule.store_name, &key).await;
        let refetch = tokio::spawn(revalidate(
            ctx.clone(),
            request,
            rule.store_name.clone(),
            rule.max_entries,
            key.clone(),
        ));

        if let Some(entry) = cached {
            trace!(key = %key, "Serving cached copy while revalidating");
            return Some(entry.to_response());
        }

        match refetch.await {
            Ok(Some(response)) => Some(response),
            Ok(None) => Some(fallback::network_error()),
            Err(e) => {
                error!(key = %key, error = %e, "Revalidation task failed");
                Some(fallback::network_error())
            }
        }
    }
}

/// Detached refetch. The outcome is reported as an event; nothing is
/// propagated to the original caller.
async fn revalidate(
    ctx: StrategyContext,
    request: Request,
    partition: String,
    max_entries: Option<usize>,
    key: String,
) -> Option<Response> {
    let (outcome, response) = match ctx.fetch(request).await {
        Ok(response) => {
            let status = response.status.as_u16();
            let outcome = if ctx
                .store_response(&partition, max_entries, &key, &response)
                .await
            {
                RevalidationOutcome::Updated { status }
            } else {
                RevalidationOutcome::NotStored { status }
            };
            (outcome, Some(response))
        }
        Err(e) => {
            debug!(key = %key, error = %e, "Revalidation fetch failed");
            (RevalidationOutcome::Failed(e.to_string()), None)
        }
    };
    ctx.emit(EngineEvent::Revalidated { key, outcome });
    response
}

pub struct NetworkOnly;

#[async_trait]
impl Strategy for NetworkOnly {
    async fn execute(
        &self,
        ctx: &StrategyContext,
        request: Request,
        _rule: &RouteRule,
    ) -> Option<Response> {
        let url = request.url.clone();
        match ctx.fetch(request).await {
            Ok(response) => Some(response),
            Err(e) => {
                debug!(url = %url, error = %e, "Network-only fetch failed");
                Some(fallback::network_error())
            }
        }
    }
}

pub struct CacheOnly;

#[async_trait]
impl Strategy for CacheOnly {
    async fn execute(
        &self,
        ctx: &StrategyContext,
        request: Request,
        rule: &RouteRule,
    ) -> Option<Response> {
        ctx.lookup(&rule.store_name, &request.cache_key())
            .await
            .map(|entry| entry.to_response())
    }
}
