//! # Docket Service Worker
//!
//! Cache-strategy and offline-sync engine for the Docket web app.
//!
//! ## Features
//!
//! - **Routing**: ordered URL rules pick one of five cache strategies
//! - **Content guard**: privileged material is never read from or written to a partition
//! - **Cache store**: name-partitioned request → response storage, in memory or on disk
//! - **Offline fallbacks**: offline page, fallback icon, synthetic error responses
//! - **Background sync**: persisted upload/annotation queues replayed when online
//! - **Notifications**: push display and click routing to open windows
//! - **Lifecycle**: install pre-warm, generation-based cleanup on activate
//!
//! ## Architecture
//!
//! ```text
//! OfflineEngine
//!     ├── SensitiveContentGuard ── RequestInterceptor (passthrough decisions)
//!     ├── RouteMatcher ── RouteRule → StrategyKind → Strategy
//!     ├── OfflineFallback
//!     ├── QueueStore (single-writer actor)
//!     ├── Clients
//!     └── StrategyContext
//!             ├── CacheStore (partitions)
//!             │       └── key → CacheEntry
//!             ├── Fetcher (network)
//!             └── Clock
//! ```

use docket_common::DocketError;
use docket_net::NetError;
use thiserror::Error;

pub mod clients;
pub mod engine;
pub mod fallback;
pub mod guard;
pub mod lifecycle;
pub mod messages;
pub mod notification;
pub mod queue;
pub mod router;
pub mod store;
pub mod strategy;

#[cfg(test)]
pub(crate) mod test_support;

pub use clients::{Client, ClientType, Clients};
pub use engine::{EngineBuilder, FetchResult, OfflineEngine};
pub use fallback::OfflineFallback;
pub use guard::{CacheVerdict, SensitiveContentGuard};
pub use lifecycle::ServiceWorkerState;
pub use messages::{ClientMessage, WorkerMessage};
pub use notification::{ClickOutcome, Notification, NotificationPayload};
pub use queue::{DrainReport, QueueItem, QueueKind, QueueStore, SyncTag};
pub use router::{RouteMatcher, RouteRule};
pub use store::{CacheEntry, CacheStore, DiskCacheStore, MemoryCacheStore};
pub use strategy::{StrategyContext, StrategyKind};

// ==================== Errors ====================

/// Errors that can occur in engine operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("State error: {0}")]
    State(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Invalid route pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error(transparent)]
    Config(#[from] DocketError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ServiceWorkerError>;

// ==================== Events ====================

/// Side effects the host platform has to carry out or may observe.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Lifecycle state changed.
    StateChange {
        version: String,
        state: ServiceWorkerState,
    },
    /// A background sync registration was requested.
    SyncRegistered { tag: SyncTag },
    /// Display a notification.
    ShowNotification(Notification),
    /// Deliver a message to a client page.
    ClientMessage {
        client_id: String,
        message: serde_json::Value,
    },
    /// A window client was focused.
    ClientFocused { client_id: String },
    /// A new window was opened.
    WindowOpened { client_id: String, url: url::Url },
    /// A stale-while-revalidate refetch finished.
    Revalidated {
        key: String,
        outcome: RevalidationOutcome,
    },
}

/// Result of a detached background refetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevalidationOutcome {
    /// The partition now holds the fresh response.
    Updated { status: u16 },
    /// The network answered but with a non-success status.
    NotStored { status: u16 },
    /// The network failed.
    Failed(String),
}
