//! Controlled pages.
//!
//! The engine never talks to a page directly. Messages, focus changes and new
//! windows are emitted as [`EngineEvent`]s for the host to carry out.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use url::Url;

use crate::{EngineEvent, Result, ServiceWorkerError};

// ==================== Client ====================

/// A client (controlled page).
#[derive(Debug, Clone, PartialEq)]
pub struct Client {
    /// Client ID.
    pub id: String,

    /// Client URL.
    pub url: Url,

    /// Client type.
    pub client_type: ClientType,

    /// Whether focused.
    pub focused: bool,

    /// Whether this engine controls the page.
    pub controlled: bool,
}

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
    SharedWorker,
    All,
}

impl Client {
    pub fn window(id: impl Into<String>, url: Url) -> Self {
        Self {
            id: id.into(),
            url,
            client_type: ClientType::Window,
            focused: false,
            controlled: false,
        }
    }
}

// ==================== Clients ====================

/// Clients API.
#[derive(Debug)]
pub struct Clients {
    clients: HashMap<String, Client>,
    events: mpsc::UnboundedSender<EngineEvent>,
}

impl Clients {
    pub fn new(events: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self {
            clients: HashMap::new(),
            events,
        }
    }

    /// Get a client by ID.
    pub fn get(&self, id: &str) -> Option<&Client> {
        self.clients.get(id)
    }

    /// Clients of the given type, ordered by ID.
    pub fn match_all(&self, client_type: ClientType) -> Vec<&Client> {
        let mut matched: Vec<&Client> = self
            .clients
            .values()
            .filter(|c| client_type == ClientType::All || c.client_type == client_type)
            .collect();
        matched.sort_by(|a, b| a.id.cmp(&b.id));
        matched
    }

    /// Open a window.
    pub fn open_window(&mut self, url: Url) -> Client {
        let id = format!("client-{}", next_client_id());
        for other in self.clients.values_mut() {
            other.focused = false;
        }
        let client = Client {
            focused: true,
            controlled: true,
            ..Client::window(id.clone(), url.clone())
        };
        self.clients.insert(id.clone(), client.clone());
        debug!(client_id = %id, url = %url, "Opened window");
        self.emit(EngineEvent::WindowOpened { client_id: id, url });
        client
    }

    /// Focus a window client.
    pub fn focus(&mut self, id: &str) -> Result<()> {
        let client_type = self
            .clients
            .get(id)
            .map(|c| c.client_type)
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("client {id}")))?;
        if client_type != ClientType::Window {
            return Err(ServiceWorkerError::State(
                "Can only focus window clients".to_string(),
            ));
        }
        for client in self.clients.values_mut() {
            client.focused = client.id == id;
        }
        self.emit(EngineEvent::ClientFocused {
            client_id: id.to_string(),
        });
        Ok(())
    }

    /// Take control of every known client. Returns how many were newly claimed.
    pub fn claim(&mut self) -> usize {
        let mut claimed = 0;
        for client in self.clients.values_mut().filter(|c| !c.controlled) {
            client.controlled = true;
            claimed += 1;
        }
        debug!(claimed, "Claimed clients");
        claimed
    }

    /// Post a message to one client.
    pub fn post_message(&self, id: &str, message: Value) -> Result<()> {
        if !self.clients.contains_key(id) {
            return Err(ServiceWorkerError::NotFound(format!("client {id}")));
        }
        trace!(client_id = id, "Posting message");
        self.emit(EngineEvent::ClientMessage {
            client_id: id.to_string(),
            message,
        });
        Ok(())
    }

    /// Post a message to every window client. Returns the number reached.
    pub fn broadcast(&self, message: &Value) -> usize {
        self.match_all(ClientType::Window)
            .iter()
            .filter(|client| self.post_message(&client.id, message.clone()).is_ok())
            .count()
    }

    /// Add a client.
    pub fn add(&mut self, client: Client) {
        self.clients.insert(client.id.clone(), client);
    }

    /// Remove a client.
    pub fn remove(&mut self, id: &str) -> Option<Client> {
        self.clients.remove(id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }
}

fn next_client_id() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}
