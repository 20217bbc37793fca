//! The offline engine: request handling plus the event-driven subsystems.

use std::collections::BTreeMap;
use std::sync::Arc;

use docket_common::{Clock, EngineConfig, StorageConfig, SystemClock};
use docket_net::{
    Destination, Fetcher, HttpFetcher, InterceptAction, LoaderConfig, PassthroughReason, Request,
    Response,
};
use regex::Regex;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::clients::{Client, Clients};
use crate::fallback::{self, OfflineFallback};
use crate::guard::{CacheVerdict, SensitiveContentGuard};
use crate::lifecycle::{self, Lifecycle, ServiceWorkerState};
use crate::messages::{ClientMessage, WorkerMessage};
use crate::notification::{self, ClickOutcome, Notification, NotificationPayload};
use crate::queue::{self, DrainReport, QueueKind, QueueStore, SyncTag};
use crate::router::RouteMatcher;
use crate::store::{CacheStore, DiskCacheStore, MemoryCacheStore};
use crate::strategy::{self, StrategyContext};
use crate::{EngineEvent, Result};

/// Outcome of handling one outgoing request.
#[derive(Debug, Clone)]
pub enum FetchResult {
    /// Not intercepted; the request goes to the network exactly as issued.
    Passthrough(PassthroughReason),
    /// The engine answered.
    Response(Response),
    /// Cache-only route with nothing stored.
    Miss,
}

impl FetchResult {
    pub fn response(&self) -> Option<&Response> {
        match self {
            Self::Response(response) => Some(response),
            _ => None,
        }
    }

    pub fn into_response(self) -> Option<Response> {
        match self {
            Self::Response(response) => Some(response),
            _ => None,
        }
    }
}

// ==================== Builder ====================

/// Assembles an [`OfflineEngine`] from configuration, with optional overrides
/// for storage, network and time.
pub struct EngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn CacheStore>>,
    fetcher: Option<Arc<dyn Fetcher>>,
    clock: Option<Arc<dyn Clock>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            store: None,
            fetcher: None,
            clock: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Build the engine. Events for the host arrive on the returned receiver.
    pub async fn build(self) -> Result<(OfflineEngine, mpsc::UnboundedReceiver<EngineEvent>)> {
        let config = self.config;
        if let Err(e) = config.validate() {
            error!(category = e.category(), error = %e, "Rejected engine configuration");
            return Err(e.into());
        }

        let store: Arc<dyn CacheStore> = match self.store {
            Some(store) => store,
            None => match &config.storage {
                StorageConfig::Memory => Arc::new(MemoryCacheStore::new()),
                StorageConfig::Disk { path } => Arc::new(DiskCacheStore::open(path.clone()).await?),
            },
        };
        let fetcher: Arc<dyn Fetcher> = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(HttpFetcher::new(LoaderConfig {
                user_agent: config.user_agent.clone(),
                ..Default::default()
            })?),
        };
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let (events, rx) = mpsc::unbounded_channel();
        let ctx = StrategyContext {
            store: store.clone(),
            fetcher,
            clock: clock.clone(),
            events: events.clone(),
        };

        let essential = config
            .essential_resources
            .iter()
            .map(|path| config.resolve(path))
            .collect::<docket_common::Result<Vec<_>>>()?;

        let engine = OfflineEngine {
            guard: SensitiveContentGuard::from_config(&config)?,
            router: RouteMatcher::from_config(&config)?,
            education: Regex::new(&config.education.pattern)?,
            education_partition: config.partition_name(&config.education.store),
            fallback: OfflineFallback::from_config(&config)?,
            queues: QueueStore::spawn(store, clock, &config.origin)?,
            clients: Mutex::new(Clients::new(events.clone())),
            lifecycle: Mutex::new(Lifecycle::new(config.version.clone(), events)),
            upload_endpoint: config.resolve(&config.upload_endpoint)?,
            annotation_endpoint: config.resolve(&config.annotation_endpoint)?,
            essential,
            ctx,
            config,
        };
        info!(
            version = %engine.config.version,
            routes = engine.router.rules().len(),
            "Offline engine ready"
        );
        Ok((engine, rx))
    }
}

// ==================== Engine ====================

pub struct OfflineEngine {
    config: EngineConfig,
    ctx: StrategyContext,
    guard: SensitiveContentGuard,
    router: RouteMatcher,
    education: Regex,
    education_partition: String,
    fallback: OfflineFallback,
    queues: QueueStore,
    clients: Mutex<Clients>,
    lifecycle: Mutex<Lifecycle>,
    essential: Vec<Url>,
    upload_endpoint: Url,
    annotation_endpoint: Url,
}

impl OfflineEngine {
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn queues(&self) -> &QueueStore {
        &self.queues
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.ctx.store
    }

    pub async fn state(&self) -> ServiceWorkerState {
        self.lifecycle.lock().await.state()
    }

    /// Register a controlled page.
    pub async fn add_client(&self, client: Client) {
        self.clients.lock().await.add(client);
    }

    pub async fn remove_client(&self, id: &str) -> Option<Client> {
        self.clients.lock().await.remove(id)
    }

    // ==================== Fetch ====================

    /// Handle one outgoing request.
    pub async fn handle_fetch(&self, request: Request) -> FetchResult {
        if let InterceptAction::Passthrough(reason) = self.guard.check_request(&request) {
            trace!(url = %request.url, ?reason, "Passthrough");
            return FetchResult::Passthrough(reason);
        }

        if self.education.is_match(request.url.as_str()) {
            return FetchResult::Response(self.fetch_education(request).await);
        }

        if let Some(rule) = self.router.find(&request.url) {
            return match strategy::execute(&self.ctx, request, rule).await {
                Some(response) => FetchResult::Response(response),
                None => FetchResult::Miss,
            };
        }

        if request.is_navigation() {
            return FetchResult::Response(self.fetch_navigation(request).await);
        }

        FetchResult::Response(self.fetch_default(request).await)
    }

    /// Network-first with payload screening before any cache write.
    async fn fetch_education(&self, request: Request) -> Response {
        let key = request.cache_key();
        match self.ctx.fetch(request).await {
            Ok(response) => {
                if response.ok() {
                    match self.guard.screen_response(&response) {
                        CacheVerdict::Cache => {
                            self.ctx
                                .store_response(&self.education_partition, None, &key, &response)
                                .await;
                        }
                        CacheVerdict::Suppress(reason) => {
                            debug!(key = %key, reason = %reason, "Education response not cached");
                        }
                    }
                }
                response
            }
            Err(e) => {
                debug!(key = %key, error = %e, "Education fetch failed");
                match self.ctx.lookup(&self.education_partition, &key).await {
                    Some(entry) => entry.to_response(),
                    None => self.fallback.education_offline(),
                }
            }
        }
    }

    /// Unmatched navigations: network-first into the primary partition, offline
    /// page last.
    async fn fetch_navigation(&self, request: Request) -> Response {
        let key = request.cache_key();
        let primary = self.config.primary_partition();
        match self.ctx.fetch(request).await {
            Ok(response) => {
                self.ctx.store_response(&primary, None, &key, &response).await;
                response
            }
            Err(e) => {
                debug!(key = %key, error = %e, "Navigation failed");
                match self.ctx.lookup(&primary, &key).await {
                    Some(entry) => entry.to_response(),
                    None => self.fallback.navigation(&self.ctx).await,
                }
            }
        }
    }

    /// Everything else: network, then any cached copy, then a fallback.
    async fn fetch_default(&self, request: Request) -> Response {
        let key = request.cache_key();
        let is_image = request.destination == Destination::Image;
        match self.ctx.fetch(request).await {
            Ok(response) => response,
            Err(e) => {
                debug!(key = %key, error = %e, "Request failed");
                if let Some(entry) = self.ctx.lookup_any(&key).await {
                    return entry.to_response();
                }
                if is_image {
                    if let Some(icon) = self.fallback.image(&self.ctx).await {
                        return icon;
                    }
                }
                fallback::network_error()
            }
        }
    }

    // ==================== Messages ====================

    /// Handle a page command. Returns the reply to send back, if any.
    pub async fn handle_message(&self, message: ClientMessage) -> Result<Option<WorkerMessage>> {
        match message {
            ClientMessage::QueueUpload(payload) => {
                self.enqueue(QueueKind::Uploads, payload).await?;
                Ok(None)
            }
            ClientMessage::QueueAnnotation(payload) => {
                self.enqueue(QueueKind::Annotations, payload).await?;
                Ok(None)
            }
            ClientMessage::GetCacheStatus => {
                Ok(Some(WorkerMessage::CacheStatus(self.cache_status().await?)))
            }
            ClientMessage::ClearCache => {
                self.clear_cache().await?;
                Ok(Some(WorkerMessage::CacheCleared))
            }
            ClientMessage::SkipWaiting => {
                self.skip_waiting().await?;
                Ok(None)
            }
        }
    }

    /// Handle a raw `{type, payload}` envelope. Unknown types are ignored.
    pub async fn handle_raw_message(&self, raw: Value) -> Result<Option<Value>> {
        let message: ClientMessage = match serde_json::from_value(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Ignoring unrecognised message");
                return Ok(None);
            }
        };
        Ok(self
            .handle_message(message)
            .await?
            .map(|reply| reply.to_value()))
    }

    async fn enqueue(&self, queue: QueueKind, payload: Value) -> Result<()> {
        self.queues.enqueue(queue, payload).await?;
        let _ = self.ctx.events.send(EngineEvent::SyncRegistered {
            tag: queue.sync_tag(),
        });
        Ok(())
    }

    /// Entry count per partition plus pending item count per queue.
    pub async fn cache_status(&self) -> Result<BTreeMap<String, usize>> {
        let mut status = BTreeMap::new();
        for name in self.ctx.store.partitions().await? {
            let count = self.ctx.store.entry_count(&name).await?;
            status.insert(name, count);
        }
        for queue in QueueKind::ALL {
            status.insert(queue.name().to_string(), self.queues.len(queue).await?);
        }
        Ok(status)
    }

    /// Delete every partition, queued writes included.
    pub async fn clear_cache(&self) -> Result<usize> {
        let partitions = self.ctx.store.partitions().await?;
        for name in &partitions {
            self.ctx.store.delete_partition(name).await?;
        }
        info!(count = partitions.len(), "Cleared all partitions");
        Ok(partitions.len())
    }

    // ==================== Sync ====================

    /// Handle a background sync event. Returns the drain report for queue tags.
    pub async fn handle_sync(&self, tag: SyncTag) -> Result<Option<DrainReport>> {
        let Some(queue) = tag.queue() else {
            self.prewarm_search().await;
            return Ok(None);
        };

        let endpoint = match queue {
            QueueKind::Uploads => &self.upload_endpoint,
            QueueKind::Annotations => &self.annotation_endpoint,
        };
        let report = queue::drain(&self.queues, &self.ctx, queue, endpoint).await?;

        if queue == QueueKind::Uploads && !report.delivered.is_empty() {
            let clients = self.clients.lock().await;
            for item in &report.delivered {
                let message = WorkerMessage::UploadComplete {
                    id: item.id,
                    file_name: item
                        .payload
                        .get("fileName")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                };
                clients.broadcast(&message.to_value());
            }
        }
        Ok(Some(report))
    }

    /// Handle a sync event by its platform tag string.
    pub async fn handle_sync_tag(&self, tag: &str) -> Result<Option<DrainReport>> {
        match SyncTag::parse(tag) {
            Some(tag) => self.handle_sync(tag).await,
            None => {
                warn!(tag, "Unknown sync tag");
                Ok(None)
            }
        }
    }

    /// Refetch popular searches into the search route's partition.
    pub async fn prewarm_search(&self) -> usize {
        let probe = self.config.resolve("/api/search").ok();
        let rule = probe.as_ref().and_then(|url| self.router.find(url));
        let (partition, max_entries) = match rule {
            Some(rule) => (rule.store_name.clone(), rule.max_entries),
            None => (self.config.partition_name("search"), None),
        };
        let stored = queue::prewarm_search(
            &self.ctx,
            &self.config.origin,
            &self.config.popular_searches,
            &partition,
            max_entries,
        )
        .await;
        debug!(stored, partition = %partition, "Search cache prewarmed");
        stored
    }

    // ==================== Notifications ====================

    /// Turn push data into a notification and ask the host to show it.
    pub fn handle_push(&self, data: Option<&[u8]>) -> Notification {
        let defaults = &self.config.notification;
        let notification =
            Notification::from_payload(NotificationPayload::parse(data, defaults), defaults);
        let _ = self
            .ctx
            .events
            .send(EngineEvent::ShowNotification(notification.clone()));
        notification
    }

    /// Route a notification click to an open window or a new one.
    pub async fn handle_notification_click(
        &self,
        notification: &Notification,
        action: Option<&str>,
    ) -> Result<ClickOutcome> {
        let target = self.config.resolve(&notification.url)?;
        let mut clients = self.clients.lock().await;
        notification::handle_click(&mut clients, &target, action)
    }

    // ==================== Lifecycle ====================

    /// Pre-warm essential resources, then activate without waiting.
    pub async fn install(&self) -> Result<()> {
        self.lifecycle
            .lock()
            .await
            .transition(ServiceWorkerState::Installing)?;

        let primary = self.config.primary_partition();
        if let Err(e) = lifecycle::precache(&self.ctx, &primary, &self.essential).await {
            warn!(error = %e, "Install failed");
            self.lifecycle
                .lock()
                .await
                .transition(ServiceWorkerState::Redundant)?;
            return Err(e);
        }

        {
            let mut lifecycle = self.lifecycle.lock().await;
            lifecycle.transition(ServiceWorkerState::Installed)?;
            lifecycle.request_skip_waiting();
        }
        self.activate().await
    }

    /// Delete older generations and take control of open pages.
    pub async fn activate(&self) -> Result<()> {
        self.lifecycle
            .lock()
            .await
            .transition(ServiceWorkerState::Activating)?;

        let deleted = lifecycle::collect_stale_generations(
            self.ctx.store.as_ref(),
            &self.config.cache_prefix,
            &self.config.version,
        )
        .await?;
        let claimed = self.clients.lock().await.claim();

        self.lifecycle
            .lock()
            .await
            .transition(ServiceWorkerState::Activated)?;
        info!(deleted = deleted.len(), claimed, "Activated");
        Ok(())
    }

    /// Activate an installed instance immediately. Returns whether it did.
    pub async fn skip_waiting(&self) -> Result<bool> {
        let state = {
            let mut lifecycle = self.lifecycle.lock().await;
            lifecycle.request_skip_waiting();
            lifecycle.state()
        };
        if state != ServiceWorkerState::Installed {
            debug!(?state, "Nothing waiting to activate");
            return Ok(false);
        }
        self.activate().await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CacheEntry;
    use crate::test_support::MockFetcher;
    use http::StatusCode;
    use serde_json::json;

    async fn engine_with(
        fetcher: Arc<MockFetcher>,
    ) -> (OfflineEngine, Arc<MemoryCacheStore>, mpsc::UnboundedReceiver<EngineEvent>) {
        let store = Arc::new(MemoryCacheStore::new());
        let (engine, rx) = EngineBuilder::new(EngineConfig::default())
            .store(store.clone())
            .fetcher(fetcher)
            .build()
            .await
            .unwrap();
        (engine, store, rx)
    }

    fn url(path: &str) -> Url {
        Url::parse(&format!("https://app.docket.local{path}")).unwrap()
    }

    #[tokio::test]
    async fn test_non_get_is_passthrough() {
        let (engine, _, _) = engine_with(Arc::new(MockFetcher::new())).await;
        let request = Request::post_json(url("/api/cases"), &json!({})).unwrap();
        assert!(matches!(
            engine.handle_fetch(request).await,
            FetchResult::Passthrough(PassthroughReason::NonGetMethod)
        ));
    }

    #[tokio::test]
    async fn test_navigation_falls_back_to_offline_page() {
        let (engine, _, _) = engine_with(Arc::new(MockFetcher::new())).await;
        let response = engine
            .handle_fetch(Request::navigate(url("/cases/42")))
            .await
            .into_response()
            .unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert!(response.body_text().unwrap().contains("You are offline"));
    }

    #[tokio::test]
    async fn test_navigation_is_cached_in_primary_partition() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.respond(
            "https://app.docket.local/cases/42",
            Response::html(StatusCode::OK, "<h1>Case 42</h1>"),
        );
        let (engine, store, _) = engine_with(fetcher.clone()).await;
        let request = Request::navigate(url("/cases/42"));
        engine.handle_fetch(request.clone()).await;

        fetcher.fail("https://app.docket.local/cases/42");
        let response = engine.handle_fetch(request).await.into_response().unwrap();
        assert!(response.from_cache);
        assert_eq!(store.entry_count("docket-v1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unmatched_request_falls_back() {
        let (engine, store, _) = engine_with(Arc::new(MockFetcher::new())).await;

        let plain = engine
            .handle_fetch(Request::get(url("/widgets/feed")))
            .await
            .into_response()
            .unwrap();
        assert_eq!(plain.status, StatusCode::REQUEST_TIMEOUT);

        let icon = Response::new(StatusCode::OK, &b"png"[..]);
        store
            .put(
                "docket-v1",
                CacheEntry::from_response(
                    "https://app.docket.local/icons/icon-192x192.png",
                    &icon,
                    0,
                ),
            )
            .await
            .unwrap();
        let image = engine
            .handle_fetch(Request::get(url("/avatars/7")).destination(Destination::Image))
            .await
            .into_response()
            .unwrap();
        assert_eq!(&image.body[..], b"png");
    }

    #[tokio::test]
    async fn test_cache_only_route_misses() {
        let (engine, _, _) = engine_with(Arc::new(MockFetcher::new())).await;
        assert!(matches!(
            engine
                .handle_fetch(Request::get(url("/api/offline-forms/intake")))
                .await,
            FetchResult::Miss
        ));
    }

    #[tokio::test]
    async fn test_education_offline_payload() {
        let (engine, _, _) = engine_with(Arc::new(MockFetcher::new())).await;
        let response = engine
            .handle_fetch(Request::get(url("/api/education/torts")))
            .await
            .into_response()
            .unwrap();
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        let body: Value = response.body_json().unwrap();
        assert_eq!(body["offline"], true);
    }

    #[tokio::test]
    async fn test_unknown_message_is_ignored() {
        let (engine, _, _) = engine_with(Arc::new(MockFetcher::new())).await;
        let reply = engine
            .handle_raw_message(json!({"type": "SELF_DESTRUCT"}))
            .await
            .unwrap();
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn test_install_failure_is_redundant() {
        let (engine, _, _) = engine_with(Arc::new(MockFetcher::new())).await;
        assert!(engine.install().await.is_err());
        assert_eq!(engine.state().await, ServiceWorkerState::Redundant);
    }

    #[tokio::test]
    async fn test_skip_waiting_without_install_is_noop() {
        let (engine, _, _) = engine_with(Arc::new(MockFetcher::new())).await;
        assert!(!engine.skip_waiting().await.unwrap());
        assert_eq!(engine.state().await, ServiceWorkerState::Parsed);
    }

    #[tokio::test]
    async fn test_clear_cache_reports_cleared() {
        let (engine, store, _) = engine_with(Arc::new(MockFetcher::new())).await;
        store
            .put(
                "docket-api-v1",
                CacheEntry::from_response(
                    "https://app.docket.local/api/cases",
                    &Response::plain(StatusCode::OK, "x"),
                    0,
                ),
            )
            .await
            .unwrap();

        let reply = engine
            .handle_raw_message(json!({"type": "CLEAR_CACHE"}))
            .await
            .unwrap();
        assert_eq!(reply, Some(json!({"type": "CACHE_CLEARED"})));
        assert!(store.partitions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let config = EngineConfig {
            version: " ".to_string(),
            ..Default::default()
        };
        let built = EngineBuilder::new(config)
            .store(Arc::new(MemoryCacheStore::new()))
            .fetcher(Arc::new(MockFetcher::new()))
            .build()
            .await;
        match built {
            Err(crate::ServiceWorkerError::Config(e)) => assert_eq!(e.category(), "config"),
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("invalid config accepted"),
        }
    }
}
