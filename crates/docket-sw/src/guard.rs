//! Sensitive-content guard.
//!
//! Two independent checks. Requests whose path matches the denylist bypass the
//! engine entirely. Payloads on the education route are screened for keywords
//! before they may be written to a partition.

use docket_common::EngineConfig;
use docket_net::{InterceptAction, RequestInterceptor, Request, Response};
use serde_json::Value;
use tracing::{debug, warn};

use crate::Result;

/// Whether a response may be written to a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheVerdict {
    Cache,
    /// Do not store; the response is still returned to the caller.
    Suppress(String),
}

#[derive(Debug, Clone)]
pub struct SensitiveContentGuard {
    interceptor: RequestInterceptor,
    keywords: Vec<String>,
}

impl SensitiveContentGuard {
    pub fn new(interceptor: RequestInterceptor, keywords: &[String]) -> Self {
        Self {
            interceptor,
            keywords: keywords.iter().map(|k| k.to_lowercase()).collect(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let interceptor = RequestInterceptor::with_sensitive_paths(&config.sensitive_paths)?;
        Ok(Self::new(interceptor, &config.sensitive_keywords))
    }

    /// Upstream decision: handle the request or leave it alone.
    pub fn check_request(&self, request: &Request) -> InterceptAction {
        self.interceptor.intercept(request)
    }

    /// The first keyword found in the flattened, lowercased document.
    pub fn payload_is_sensitive(&self, payload: &Value) -> Option<&str> {
        let flattened = payload.to_string().to_lowercase();
        self.keywords
            .iter()
            .find(|k| flattened.contains(k.as_str()))
            .map(String::as_str)
    }

    /// Decide whether an education-route response may be cached.
    ///
    /// Non-JSON bodies are cached as-is. A JSON body that does not parse is
    /// not cached, since it cannot be screened.
    pub fn screen_response(&self, response: &Response) -> CacheVerdict {
        if !response.is_json() {
            return CacheVerdict::Cache;
        }
        match response.body_json::<Value>() {
            Ok(payload) => match self.payload_is_sensitive(&payload) {
                Some(keyword) => {
                    debug!(keyword, "Sensitive payload not cached");
                    CacheVerdict::Suppress(format!("payload mentions {keyword}"))
                }
                None => CacheVerdict::Cache,
            },
            Err(e) => {
                warn!(error = %e, "Unparseable JSON payload not cached");
                CacheVerdict::Suppress("unparseable JSON".to_string())
            }
        }
    }
}
