//! Offline fallbacks and synthetic responses.

use docket_common::{EngineConfig, Result as CommonResult};
use docket_net::{cache_key, Response};
use http::StatusCode;
use serde_json::json;
use tracing::debug;

use crate::strategy::StrategyContext;

/// Minimal page served when neither the network nor the cache can answer a
/// navigation.
const OFFLINE_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>Offline - Docket</title>
<style>
body { font-family: system-ui, sans-serif; max-width: 32rem; margin: 4rem auto; padding: 0 1rem; color: #1f2937; }
h1 { font-size: 1.5rem; }
button { margin-top: 1rem; padding: 0.5rem 1rem; }
</style>
</head>
<body>
<h1>You are offline</h1>
<p>Docket cannot reach the server right now. Documents and annotations you save will be sent when your connection returns.</p>
<button onclick="location.reload()">Try again</button>
</body>
</html>
"#;

/// Generic failure for non-navigation requests.
pub fn network_error() -> Response {
    Response::plain(StatusCode::REQUEST_TIMEOUT, "Network error")
}

/// Resolves offline fallbacks from pre-cached resources.
#[derive(Debug, Clone)]
pub struct OfflineFallback {
    offline_page: String,
    fallback_image: String,
    disclaimer: String,
}

impl OfflineFallback {
    pub fn from_config(config: &EngineConfig) -> CommonResult<Self> {
        Ok(Self {
            offline_page: cache_key(&config.resolve(&config.offline_page)?),
            fallback_image: cache_key(&config.resolve(&config.fallback_image)?),
            disclaimer: config.education.disclaimer.clone(),
        })
    }

    /// Cached offline page, else the built-in one.
    pub async fn offline_page(&self, ctx: &StrategyContext) -> Response {
        match ctx.lookup_any(&self.offline_page).await {
            Some(entry) => entry.to_response(),
            None => {
                debug!("Offline page not cached, synthesizing");
                Response::html(StatusCode::OK, OFFLINE_HTML)
            }
        }
    }

    /// Cached fallback icon for failed image requests.
    pub async fn image(&self, ctx: &StrategyContext) -> Option<Response> {
        ctx.lookup_any(&self.fallback_image)
            .await
            .map(|entry| entry.to_response())
    }

    /// Failed navigation.
    pub async fn navigation(&self, ctx: &StrategyContext) -> Response {
        self.offline_page(ctx).await
    }

    /// Failed education-content fetch.
    pub fn education_offline(&self) -> Response {
        Response::json(
            StatusCode::SERVICE_UNAVAILABLE,
            &json!({
                "offline": true,
                "message": "Educational content is unavailable while offline.",
                "disclaimer": self.disclaimer,
            }),
        )
    }
}
