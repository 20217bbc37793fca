//! Push notifications and click routing.

use docket_common::NotificationDefaults;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::clients::{ClientType, Clients};
use crate::Result;

/// Action identifier that closes a notification without navigating.
pub const DISMISS_ACTION: &str = "dismiss";
pub const VIEW_ACTION: &str = "view";

/// Push payload with every field resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub body: String,
    pub url: String,
    pub tag: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawPush {
    body: Option<String>,
    url: Option<String>,
    tag: Option<String>,
}

impl NotificationPayload {
    /// Parse push data, falling back to defaults for missing fields or an
    /// unreadable payload.
    pub fn parse(data: Option<&[u8]>, defaults: &NotificationDefaults) -> Self {
        let raw = match data {
            Some(bytes) => serde_json::from_slice::<RawPush>(bytes).unwrap_or_else(|e| {
                warn!(error = %e, "Malformed push payload, using defaults");
                RawPush::default()
            }),
            None => RawPush::default(),
        };
        Self {
            body: raw.body.unwrap_or_else(|| defaults.body.clone()),
            url: raw.url.unwrap_or_else(|| defaults.url.clone()),
            tag: raw.tag.unwrap_or_else(|| defaults.tag.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationAction {
    pub action: String,
    pub title: String,
}

/// A notification ready to be displayed by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub tag: String,
    /// Target opened on click.
    pub url: String,
    pub actions: Vec<NotificationAction>,
}

impl Notification {
    pub fn from_payload(payload: NotificationPayload, defaults: &NotificationDefaults) -> Self {
        Self {
            title: defaults.title.clone(),
            body: payload.body,
            icon: defaults.icon.clone(),
            badge: defaults.badge.clone(),
            tag: payload.tag,
            url: payload.url,
            actions: vec![
                NotificationAction {
                    action: VIEW_ACTION.to_string(),
                    title: "View".to_string(),
                },
                NotificationAction {
                    action: DISMISS_ACTION.to_string(),
                    title: "Dismiss".to_string(),
                },
            ],
        }
    }
}

/// What a notification click resulted in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickOutcome {
    Dismissed,
    /// An open window already showed the target and was focused.
    Focused(String),
    /// A new window was opened at the target.
    Opened(String),
}

/// Route a click: dismiss, focus a window already at the target, or open one.
pub fn handle_click(
    clients: &mut Clients,
    target: &Url,
    action: Option<&str>,
) -> Result<ClickOutcome> {
    if action == Some(DISMISS_ACTION) {
        debug!("Notification dismissed");
        return Ok(ClickOutcome::Dismissed);
    }

    let existing = clients
        .match_all(ClientType::Window)
        .into_iter()
        .find(|c| c.url == *target)
        .map(|c| c.id.clone());

    match existing {
        Some(id) => {
            clients.focus(&id)?;
            Ok(ClickOutcome::Focused(id))
        }
        None => Ok(ClickOutcome::Opened(clients.open_window(target.clone()).id)),
    }
}
