//! Shared fixtures for engine integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use docket_common::{EngineConfig, ManualClock};
use docket_net::{format_http_date, Fetcher, NetError, Request, Response};
use docket_sw::engine::{EngineBuilder, OfflineEngine};
use docket_sw::{EngineEvent, MemoryCacheStore};
use http::{header, StatusCode};
use tokio::sync::{mpsc, Notify};
use url::Url;

pub const ORIGIN: &str = "https://app.docket.local";

type Responder = Arc<dyn Fn(&Request) -> Option<Response> + Send + Sync>;

/// Scripted network keyed by full URL. Unscripted URLs behave as offline.
#[derive(Default)]
pub struct MockNetwork {
    routes: Mutex<HashMap<String, Responder>>,
    gates: Mutex<HashMap<String, Arc<Notify>>>,
    seen: Mutex<Vec<Request>>,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond(&self, url: &str, response: Response) {
        self.respond_with(url, move |_| Some(response.clone()));
    }

    /// Answer based on the request; `None` simulates a network failure.
    pub fn respond_with<F>(&self, url: &str, responder: F)
    where
        F: Fn(&Request) -> Option<Response> + Send + Sync + 'static,
    {
        self.routes
            .lock()
            .unwrap()
            .insert(url.to_string(), Arc::new(responder));
    }

    pub fn go_offline(&self, url: &str) {
        self.respond_with(url, |_| None);
    }

    pub fn hang(&self, url: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.gates
            .lock()
            .unwrap()
            .insert(url.to_string(), gate.clone());
        gate
    }

    pub fn seen(&self) -> Vec<Request> {
        self.seen.lock().unwrap().clone()
    }

    pub fn hits(&self, url: &str) -> usize {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.url.as_str() == url)
            .count()
    }
}

#[async_trait]
impl Fetcher for MockNetwork {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        let url = request.url.to_string();
        self.seen.lock().unwrap().push(request.clone());

        let gate = self.gates.lock().unwrap().get(&url).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let responder = self.routes.lock().unwrap().get(&url).cloned();
        responder
            .and_then(|respond| respond(&request))
            .ok_or_else(|| NetError::RequestFailed(format!("offline: {url}")))
    }
}

pub struct Harness {
    pub engine: OfflineEngine,
    pub store: Arc<MemoryCacheStore>,
    pub network: Arc<MockNetwork>,
    pub clock: Arc<ManualClock>,
    pub events: mpsc::UnboundedReceiver<EngineEvent>,
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

pub async fn harness() -> Harness {
    harness_with(EngineConfig::default()).await
}

pub async fn harness_with(config: EngineConfig) -> Harness {
    let store = Arc::new(MemoryCacheStore::new());
    let network = MockNetwork::new();
    let clock = Arc::new(ManualClock::new(start_time()));
    let (engine, events) = EngineBuilder::new(config)
        .store(store.clone())
        .fetcher(network.clone())
        .clock(clock.clone())
        .build()
        .await
        .unwrap();
    Harness {
        engine,
        store,
        network,
        clock,
        events,
    }
}

pub fn url(path: &str) -> Url {
    Url::parse(&format!("{ORIGIN}{path}")).unwrap()
}

pub fn full(path: &str) -> String {
    format!("{ORIGIN}{path}")
}

/// 200 JSON response stamped with `date`.
pub fn json_at(body: serde_json::Value, date: DateTime<Utc>) -> Response {
    Response::json(StatusCode::OK, &body).with_header(header::DATE, &format_http_date(date))
}

/// Wait for the next event matching `pred`, skipping others.
pub async fn next_event<F>(events: &mut mpsc::UnboundedReceiver<EngineEvent>, pred: F) -> EngineEvent
where
    F: Fn(&EngineEvent) -> bool,
{
    loop {
        let event = tokio::time::timeout(std::time::Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        if pred(&event) {
            return event;
        }
    }
}
