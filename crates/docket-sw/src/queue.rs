//! Background sync queues.
//!
//! Each queue is persisted as one JSON array stored as a single entry of the
//! queue partition. All reads and writes of a queue go through one owner task,
//! so concurrent enqueues and removals never lose each other's updates.

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use docket_common::{Clock, QUEUE_PARTITION};
use docket_net::{cache_key, MultipartPart, Request, RequestBody, Response};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::store::{CacheEntry, CacheStore};
use crate::strategy::StrategyContext;
use crate::{Result, ServiceWorkerError};

pub const UPLOAD_QUEUE: &str = "document-uploads";
pub const ANNOTATION_QUEUE: &str = "annotations";

const COMMAND_BUFFER: usize = 64;

// ==================== Tags & Kinds ====================

/// Background sync registration tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncTag {
    DocumentUpload,
    AnnotationSync,
    SearchCache,
}

impl SyncTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DocumentUpload => "document-upload",
            Self::AnnotationSync => "annotation-sync",
            Self::SearchCache => "search-cache",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "document-upload" => Some(Self::DocumentUpload),
            "annotation-sync" => Some(Self::AnnotationSync),
            "search-cache" => Some(Self::SearchCache),
            _ => None,
        }
    }

    /// The persisted queue this tag drains, if any.
    pub fn queue(&self) -> Option<QueueKind> {
        match self {
            Self::DocumentUpload => Some(QueueKind::Uploads),
            Self::AnnotationSync => Some(QueueKind::Annotations),
            Self::SearchCache => None,
        }
    }
}

/// A persisted queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Uploads,
    Annotations,
}

impl QueueKind {
    pub const ALL: [QueueKind; 2] = [QueueKind::Uploads, QueueKind::Annotations];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Uploads => UPLOAD_QUEUE,
            Self::Annotations => ANNOTATION_QUEUE,
        }
    }

    pub fn sync_tag(&self) -> SyncTag {
        match self {
            Self::Uploads => SyncTag::DocumentUpload,
            Self::Annotations => SyncTag::AnnotationSync,
        }
    }
}

impl std::str::FromStr for QueueKind {
    type Err = ServiceWorkerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "uploads" | UPLOAD_QUEUE => Ok(Self::Uploads),
            "annotations" => Ok(Self::Annotations),
            other => Err(ServiceWorkerError::Queue(format!("unknown queue {other}"))),
        }
    }
}

// ==================== Items ====================

/// A pending write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    /// Creation time in ms; unique and increasing within a queue.
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
    pub target_queue: String,
}

/// Upload payload as sent by the page.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadPayload {
    pub file_name: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    /// File contents, base64.
    pub data: String,
    /// Extra form fields (case id, description, ...).
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

fn default_content_type() -> String {
    "application/octet-stream".to_string()
}

impl UploadPayload {
    pub fn into_parts(self) -> Result<Vec<MultipartPart>> {
        let data = STANDARD
            .decode(self.data.as_bytes())
            .map_err(|e| ServiceWorkerError::Queue(format!("upload data is not base64: {e}")))?;
        let mut parts: Vec<MultipartPart> = self
            .fields
            .into_iter()
            .map(|(name, value)| MultipartPart::text(name, value))
            .collect();
        parts.push(MultipartPart::file(
            "file",
            self.file_name,
            self.content_type,
            data,
        ));
        Ok(parts)
    }
}

// ==================== Queue Store ====================

enum Command {
    Enqueue {
        queue: QueueKind,
        payload: Value,
        reply: oneshot::Sender<Result<QueueItem>>,
    },
    List {
        queue: QueueKind,
        reply: oneshot::Sender<Result<Vec<QueueItem>>>,
    },
    Remove {
        queue: QueueKind,
        id: i64,
        reply: oneshot::Sender<Result<bool>>,
    },
}

/// Handle to the queue owner task. Cheap to clone.
#[derive(Clone)]
pub struct QueueStore {
    commands: mpsc::Sender<Command>,
}

impl QueueStore {
    /// Start the owner task. Queues are persisted under `<origin>/queue/<name>`.
    pub fn spawn(store: Arc<dyn CacheStore>, clock: Arc<dyn Clock>, origin: &Url) -> Result<Self> {
        let mut keys = BTreeMap::new();
        for kind in QueueKind::ALL {
            let url = origin
                .join(&format!("/queue/{}", kind.name()))
                .map_err(|e| ServiceWorkerError::Queue(e.to_string()))?;
            keys.insert(kind.name(), cache_key(&url));
        }

        let (commands, rx) = mpsc::channel(COMMAND_BUFFER);
        let owner = QueueOwner { store, clock, keys };
        tokio::spawn(owner.run(rx));
        Ok(Self { commands })
    }

    /// Append a payload to the end of a queue.
    pub async fn enqueue(&self, queue: QueueKind, payload: Value) -> Result<QueueItem> {
        self.request(|reply| Command::Enqueue {
            queue,
            payload,
            reply,
        })
        .await
    }

    /// Items in enqueue order.
    pub async fn list(&self, queue: QueueKind) -> Result<Vec<QueueItem>> {
        self.request(|reply| Command::List { queue, reply }).await
    }

    /// Remove one item by id.
    pub async fn remove(&self, queue: QueueKind, id: i64) -> Result<bool> {
        self.request(|reply| Command::Remove { queue, id, reply })
            .await
    }

    pub async fn len(&self, queue: QueueKind) -> Result<usize> {
        Ok(self.list(queue).await?.len())
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| ServiceWorkerError::Queue("queue owner stopped".to_string()))?;
        rx.await
            .map_err(|_| ServiceWorkerError::Queue("queue owner dropped reply".to_string()))?
    }
}

/// Single writer for every queue.
struct QueueOwner {
    store: Arc<dyn CacheStore>,
    clock: Arc<dyn Clock>,
    keys: BTreeMap<&'static str, String>,
}

impl QueueOwner {
    async fn run(self, mut rx: mpsc::Receiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Enqueue {
                    queue,
                    payload,
                    reply,
                } => {
                    let _ = reply.send(self.enqueue(queue, payload).await);
                }
                Command::List { queue, reply } => {
                    let _ = reply.send(self.load(queue).await);
                }
                Command::Remove { queue, id, reply } => {
                    let _ = reply.send(self.remove(queue, id).await);
                }
            }
        }
        debug!("Queue owner stopped");
    }

    fn key(&self, queue: QueueKind) -> &str {
        self.keys.get(queue.name()).map(String::as_str).unwrap_or_default()
    }

    async fn load(&self, queue: QueueKind) -> Result<Vec<QueueItem>> {
        let Some(entry) = self.store.match_entry(QUEUE_PARTITION, self.key(queue)).await? else {
            return Ok(Vec::new());
        };
        match serde_json::from_slice(&entry.body) {
            Ok(items) => Ok(items),
            Err(e) => {
                warn!(queue = queue.name(), error = %e, "Malformed queue data, treating as empty");
                Ok(Vec::new())
            }
        }
    }

    async fn save(&self, queue: QueueKind, items: &[QueueItem]) -> Result<()> {
        let key = self.key(queue);
        let body = serde_json::to_vec(items)?;
        let response = Response::new(StatusCode::OK, body)
            .with_header(http::header::CONTENT_TYPE, "application/json");
        self.store
            .put(
                QUEUE_PARTITION,
                CacheEntry::from_response(key, &response, self.clock.now_millis()),
            )
            .await
    }

    async fn enqueue(&self, queue: QueueKind, payload: Value) -> Result<QueueItem> {
        let mut items = self.load(queue).await?;
        let now = self.clock.now();
        let last_id = items.iter().map(|i| i.id).max().unwrap_or(i64::MIN);
        let item = QueueItem {
            id: now.timestamp_millis().max(last_id.saturating_add(1)),
            timestamp: now,
            payload,
            target_queue: queue.name().to_string(),
        };
        items.push(item.clone());
        self.save(queue, &items).await?;
        debug!(queue = queue.name(), id = item.id, pending = items.len(), "Enqueued item");
        Ok(item)
    }

    async fn remove(&self, queue: QueueKind, id: i64) -> Result<bool> {
        let mut items = self.load(queue).await?;
        let before = items.len();
        items.retain(|i| i.id != id);
        if items.len() == before {
            return Ok(false);
        }
        self.save(queue, &items).await?;
        Ok(true)
    }
}

// ==================== Drain ====================

/// Result of replaying one queue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    /// Items confirmed by the server and removed, in delivery order.
    pub delivered: Vec<QueueItem>,
    /// Ids left in place for the next sync.
    pub failed: Vec<i64>,
}

/// Build the delivery request for one queued item.
pub fn delivery_request(queue: QueueKind, endpoint: &Url, item: &QueueItem) -> Result<Request> {
    match queue {
        QueueKind::Uploads => {
            let payload: UploadPayload = serde_json::from_value(item.payload.clone())?;
            Ok(Request::post(
                endpoint.clone(),
                RequestBody::Multipart(payload.into_parts()?),
            ))
        }
        QueueKind::Annotations => Ok(Request::post_json(endpoint.clone(), &item.payload)?),
    }
}

/// Replay a queue in FIFO order. Items are removed only after a 2xx reply.
pub async fn drain(
    queues: &QueueStore,
    ctx: &StrategyContext,
    queue: QueueKind,
    endpoint: &Url,
) -> Result<DrainReport> {
    let items = queues.list(queue).await?;
    let mut report = DrainReport::default();
    if items.is_empty() {
        return Ok(report);
    }
    info!(queue = queue.name(), pending = items.len(), "Draining queue");

    for item in items {
        let request = match delivery_request(queue, endpoint, &item) {
            Ok(request) => request,
            Err(e) => {
                warn!(queue = queue.name(), id = item.id, error = %e, "Cannot build delivery request");
                report.failed.push(item.id);
                continue;
            }
        };

        match ctx.fetch(request).await {
            Ok(response) if response.ok() => {
                queues.remove(queue, item.id).await?;
                debug!(queue = queue.name(), id = item.id, "Delivered queued item");
                report.delivered.push(item);
            }
            Ok(response) => {
                warn!(queue = queue.name(), id = item.id, status = %response.status, "Delivery rejected");
                report.failed.push(item.id);
            }
            Err(e) => {
                warn!(queue = queue.name(), id = item.id, error = %e, "Delivery failed");
                report.failed.push(item.id);
            }
        }
    }

    info!(
        queue = queue.name(),
        delivered = report.delivered.len(),
        failed = report.failed.len(),
        "Queue drained"
    );
    Ok(report)
}

/// Refetch popular searches into the search partition. Returns how many were
/// stored.
pub async fn prewarm_search(
    ctx: &StrategyContext,
    origin: &Url,
    queries: &[String],
    partition: &str,
    max_entries: Option<usize>,
) -> usize {
    let mut stored = 0;
    for query in queries {
        let url = match origin.join(&format!("/api/search?q={}", urlencoding::encode(query))) {
            Ok(url) => url,
            Err(e) => {
                error!(query = %query, error = %e, "Invalid search URL");
                continue;
            }
        };
        let key = cache_key(&url);
        match ctx.fetch(Request::get(url)).await {
            Ok(response) => {
                if ctx.store_response(partition, max_entries, &key, &response).await {
                    stored += 1;
                }
            }
            Err(e) => debug!(query = %query, error = %e, "Search prewarm failed"),
        }
    }
    stored
}
