//! Request interception: which requests the engine may touch at all.

use crate::{Request, Url};
use http::Method;
use regex::Regex;
use tracing::{debug, trace};
use url::Position;

/// Action to take for an intercepted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterceptAction {
    /// Let the engine route the request.
    Handle,
    /// Leave the request alone; it goes to the network exactly as issued.
    Passthrough(PassthroughReason),
}

/// Why a request was not intercepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassthroughReason {
    NonGetMethod,
    UnsupportedScheme,
    /// Matched a sensitive path pattern.
    Sensitive(String),
}

/// Regular expression matched against a URL's path and query.
#[derive(Debug, Clone)]
pub struct UrlPattern {
    pub pattern: String,
    regex: Regex,
}

impl UrlPattern {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: pattern.to_string(),
            regex: Regex::new(pattern)?,
        })
    }

    pub fn matches(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

/// Decides which requests reach the engine.
///
/// Only GET requests over http(s) are eligible, and anything whose path or
/// query matches a sensitive pattern is never intercepted, so its response can
/// never be read from or written to a partition.
#[derive(Debug, Clone)]
pub struct RequestInterceptor {
    sensitive: Vec<UrlPattern>,
}

impl RequestInterceptor {
    /// Build from a list of regular expressions.
    pub fn with_sensitive_paths<S: AsRef<str>>(patterns: &[S]) -> Result<Self, regex::Error> {
        let sensitive = patterns
            .iter()
            .map(|p| UrlPattern::new(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { sensitive })
    }

    /// The first sensitive pattern matching the URL's path and query.
    pub fn sensitive_match(&self, url: &Url) -> Option<&UrlPattern> {
        let path = &url[Position::BeforePath..Position::AfterQuery];
        self.sensitive.iter().find(|p| p.matches(path))
    }

    /// Intercept a request.
    pub fn intercept(&self, request: &Request) -> InterceptAction {
        trace!(url = %request.url, "Intercepting request");

        if request.method != Method::GET {
            return InterceptAction::Passthrough(PassthroughReason::NonGetMethod);
        }

        if !matches!(request.url.scheme(), "http" | "https") {
            return InterceptAction::Passthrough(PassthroughReason::UnsupportedScheme);
        }

        if let Some(pattern) = self.sensitive_match(&request.url) {
            debug!(url = %request.url, pattern = %pattern.pattern, "Sensitive request bypasses engine");
            return InterceptAction::Passthrough(PassthroughReason::Sensitive(
                pattern.pattern.clone(),
            ));
        }

        InterceptAction::Handle
    }
}
