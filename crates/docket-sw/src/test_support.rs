//! Scripted network and context builders for unit tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use docket_common::Clock;
use docket_net::{format_http_date, Fetcher, NetError, Request, Response};
use hashbrown::HashMap;
use http::{header, StatusCode};
use regex::Regex;
use tokio::sync::{mpsc, Notify};

use crate::router::RouteRule;
use crate::store::CacheStore;
use crate::strategy::{StrategyContext, StrategyKind};
use crate::EngineEvent;

enum Script {
    Respond(Response),
    Fail,
}

/// Network double keyed by full URL. Unscripted URLs fail like an offline
/// network.
#[derive(Default)]
pub struct MockFetcher {
    scripts: Mutex<HashMap<String, Script>>,
    gates: Mutex<HashMap<String, Arc<Notify>>>,
    requests: Mutex<Vec<Request>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, url: &str, response: Response) {
        self.scripts
            .lock()
            .unwrap()
            .insert(url.to_string(), Script::Respond(response));
    }

    pub fn fail(&self, url: &str) {
        self.scripts.lock().unwrap().insert(url.to_string(), Script::Fail);
    }

    /// Hold fetches of `url` until the returned gate is notified.
    pub fn hang(&self, url: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.gates
            .lock()
            .unwrap()
            .insert(url.to_string(), gate.clone());
        gate
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        let url = request.url.to_string();
        self.requests.lock().unwrap().push(request);

        let gate = self.gates.lock().unwrap().get(&url).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        match self.scripts.lock().unwrap().get(&url) {
            Some(Script::Respond(response)) => Ok(response.clone()),
            Some(Script::Fail) | None => Err(NetError::RequestFailed(format!("offline: {url}"))),
        }
    }
}

pub fn ctx_with(
    store: Arc<dyn CacheStore>,
    fetcher: Arc<dyn Fetcher>,
    clock: Arc<dyn Clock>,
) -> (StrategyContext, mpsc::UnboundedReceiver<EngineEvent>) {
    let (events, rx) = mpsc::unbounded_channel();
    (
        StrategyContext {
            store,
            fetcher,
            clock,
            events,
        },
        rx,
    )
}

/// 200 text response carrying a `Date` header.
pub fn dated_ok(body: &str, date: DateTime<Utc>) -> Response {
    Response::plain(StatusCode::OK, body).with_header(header::DATE, &format_http_date(date))
}

/// Catch-all rule for strategy tests.
pub fn rule(strategy: StrategyKind, store_name: &str, max_age_seconds: Option<u64>) -> RouteRule {
    RouteRule {
        pattern: Regex::new(".*").unwrap(),
        strategy,
        store_name: store_name.to_string(),
        max_age_seconds,
        max_entries: None,
    }
}
