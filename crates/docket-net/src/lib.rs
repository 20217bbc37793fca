//! # Docket Net
//!
//! Request/response model and network access for the Docket offline engine.
//!
//! ## Design Goals
//!
//! 1. **Owned bodies**: responses are fully buffered so they can be stored and
//!    returned from the same fetch
//! 2. **Network seam**: everything goes through the [`Fetcher`] trait so the
//!    engine can run against a scripted network in tests
//! 3. **Request interception**: decide up front which requests the engine may touch

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use mime::Mime;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, info, trace};
use url::{Position, Url};

pub mod intercept;

pub use intercept::{InterceptAction, PassthroughReason, RequestInterceptor, UrlPattern};

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid body: {0}")]
    InvalidBody(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// How the request was initiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level page load.
    Navigate,
    SameOrigin,
    #[default]
    Cors,
    NoCors,
}

/// What the response will be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Destination {
    #[default]
    Empty,
    Document,
    Image,
    Script,
    Style,
    Font,
    Manifest,
}

/// A single field of a multipart body.
#[derive(Debug, Clone, PartialEq)]
pub struct MultipartPart {
    pub name: String,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub data: Bytes,
}

impl MultipartPart {
    /// Plain text form field.
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        let value: String = value.into();
        Self {
            name: name.into(),
            file_name: None,
            content_type: None,
            data: Bytes::from(value),
        }
    }

    /// File upload field.
    pub fn file(
        name: impl Into<String>,
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            name: name.into(),
            file_name: Some(file_name.into()),
            content_type: Some(content_type.into()),
            data: data.into(),
        }
    }
}

/// Request body variants.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Bytes(Bytes),
    Multipart(Vec<MultipartPart>),
}

/// HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<RequestBody>,
    pub mode: RequestMode,
    pub destination: Destination,
}

impl Request {
    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            mode: RequestMode::default(),
            destination: Destination::default(),
        }
    }

    /// Create a top-level navigation request.
    pub fn navigate(url: Url) -> Self {
        Self {
            mode: RequestMode::Navigate,
            destination: Destination::Document,
            ..Self::get(url)
        }
    }

    /// Create a POST request.
    pub fn post(url: Url, body: RequestBody) -> Self {
        Self {
            method: Method::POST,
            body: Some(body),
            ..Self::get(url)
        }
    }

    /// Create a POST request carrying a JSON document.
    pub fn post_json(url: Url, value: &serde_json::Value) -> Result<Self, NetError> {
        let body =
            serde_json::to_vec(value).map_err(|e| NetError::InvalidBody(e.to_string()))?;
        Ok(Self::post(url, RequestBody::Bytes(Bytes::from(body))).header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        ))
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the destination.
    pub fn destination(mut self, destination: Destination) -> Self {
        self.destination = destination;
        self
    }

    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }

    /// Normalised identity used as the cache key: the URL without its fragment.
    pub fn cache_key(&self) -> String {
        cache_key(&self.url)
    }
}

/// Normalise a URL into a cache key.
pub fn cache_key(url: &Url) -> String {
    url[..Position::AfterQuery].to_string()
}

/// Parse an HTTP `Date` header (IMF-fixdate is RFC 2822 compatible).
pub fn parse_http_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(raw.trim())
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// Format a timestamp as an HTTP `Date` header value.
pub fn format_http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// HTTP response with a fully buffered body.
#[derive(Debug, Clone)]
pub struct Response {
    pub url: Option<Url>,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Whether the engine answered from a partition rather than the network.
    pub from_cache: bool,
}

impl Response {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            url: None,
            status,
            headers: HeaderMap::new(),
            body: body.into(),
            from_cache: false,
        }
    }

    /// Plain-text response.
    pub fn plain(status: StatusCode, body: impl Into<String>) -> Self {
        let body: String = body.into();
        Self::new(status, body).with_header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
    }

    /// HTML response.
    pub fn html(status: StatusCode, body: impl Into<String>) -> Self {
        let body: String = body.into();
        Self::new(status, body).with_header(header::CONTENT_TYPE, "text/html; charset=utf-8")
    }

    /// JSON response.
    pub fn json(status: StatusCode, value: &serde_json::Value) -> Self {
        Self::new(status, value.to_string()).with_header(header::CONTENT_TYPE, "application/json")
    }

    /// Set a header; invalid values are skipped.
    pub fn with_header(mut self, name: HeaderName, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(name, value);
        }
        self
    }

    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    pub fn content_type(&self) -> Option<Mime> {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<Mime>().ok())
    }

    /// `application/json` or any `+json` media type.
    pub fn is_json(&self) -> bool {
        self.content_type().is_some_and(|m| {
            m.subtype() == mime::JSON || m.suffix().is_some_and(|s| s == mime::JSON)
        })
    }

    /// Parsed `Date` header.
    pub fn date(&self) -> Option<DateTime<Utc>> {
        self.headers
            .get(header::DATE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_http_date)
    }

    /// Get the body as text.
    pub fn body_text(&self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| NetError::InvalidBody(e.to_string()))
    }

    /// Get the body as JSON.
    pub fn body_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, NetError> {
        serde_json::from_slice(&self.body).map_err(|e| NetError::InvalidBody(e.to_string()))
    }
}

/// Anything that can put a request on the wire.
///
/// `Err` means the network itself failed; every HTTP status comes back as `Ok`.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: Request) -> Result<Response, NetError>;
}

/// HTTP client configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Accept-Language header.
    pub accept_language: String,
    /// Maximum redirects.
    pub max_redirects: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: "DocketOffline/1.0".to_string(),
            accept_language: "en-US,en;q=0.9".to_string(),
            max_redirects: 10,
        }
    }
}

/// [`Fetcher`] backed by reqwest.
pub struct HttpFetcher {
    client: Client,
    config: LoaderConfig,
}

impl HttpFetcher {
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(user_agent = %config.user_agent, "HttpFetcher initialized");

        Ok(Self { client, config })
    }
}

fn multipart_form(parts: Vec<MultipartPart>) -> Result<Form, NetError> {
    let mut form = Form::new();
    for part in parts {
        let mut field = Part::bytes(part.data.to_vec());
        if let Some(file_name) = part.file_name {
            field = field.file_name(file_name);
        }
        if let Some(content_type) = part.content_type {
            field = field.mime_str(&content_type)?;
        }
        form = form.part(part.name, field);
    }
    Ok(form)
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        debug!(url = %request.url, method = %request.method, "Fetching resource");

        let mut req_builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone())
            .header(header::ACCEPT_LANGUAGE, &self.config.accept_language);

        req_builder = match request.body {
            Some(RequestBody::Bytes(body)) => req_builder.body(body),
            Some(RequestBody::Multipart(parts)) => req_builder.multipart(multipart_form(parts)?),
            None => req_builder,
        };

        let response = req_builder.send().await?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response.bytes().await?;

        trace!(
            url = %url,
            status = %status,
            body_len = body.len(),
            "Response received"
        );

        Ok(Response {
            url: Some(url),
            status,
            headers,
            body,
            from_cache: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_request_builder() {
        let url = Url::parse("https://example.com/page#section").unwrap();
        let request = Request::navigate(url).header(
            HeaderName::from_static("accept"),
            HeaderValue::from_static("text/html"),
        );

        assert_eq!(request.method, Method::GET);
        assert!(request.is_navigation());
        assert_eq!(request.destination, Destination::Document);
        assert!(request.headers.contains_key("accept"));
        assert_eq!(request.cache_key(), "https://example.com/page");
    }

    #[test]
    fn test_request_id_uniqueness() {
        assert_ne!(RequestId::new(), RequestId::new());
    }

    #[test]
    fn test_post_json_sets_content_type() {
        let url = Url::parse("https://example.com/api/annotations").unwrap();
        let request = Request::post_json(url, &serde_json::json!({"note": "x"})).unwrap();
        assert_eq!(request.method, Method::POST);
        assert_eq!(
            request.headers.get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        assert_eq!(
            request.body,
            Some(RequestBody::Bytes(Bytes::from_static(br#"{"note":"x"}"#)))
        );
    }

    #[test]
    fn test_response_json_detection() {
        let json = Response::json(StatusCode::OK, &serde_json::json!({"a": 1}));
        assert!(json.is_json());

        let problem = Response::new(StatusCode::OK, "{}")
            .with_header(header::CONTENT_TYPE, "application/problem+json");
        assert!(problem.is_json());

        let html = Response::html(StatusCode::OK, "<p>hi</p>");
        assert!(!html.is_json());
    }

    #[test]
    fn test_http_date_round_trip() {
        let parsed = parse_http_date("Sun, 06 Nov 1994 08:49:37 GMT").unwrap();
        assert_eq!(parsed.timestamp(), 784111777);
        assert_eq!(format_http_date(parsed), "Sun, 06 Nov 1994 08:49:37 GMT");
        assert!(parse_http_date("yesterday").is_none());
    }

    #[test]
    fn test_loader_config_default() {
        let config = LoaderConfig::default();
        assert_eq!(config.max_redirects, 10);
    }

    #[tokio::test]
    async fn test_http_fetcher_get() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/cases"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(r#"{"cases":[]}"#, "application/json"),
            )
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(LoaderConfig::default()).unwrap();
        let url = Url::parse(&format!("{}/api/cases", server.uri())).unwrap();
        let response = fetcher.fetch(Request::get(url)).await.unwrap();

        assert!(response.ok());
        assert!(response.is_json());
        assert_eq!(response.body_text().unwrap(), r#"{"cases":[]}"#);
        assert!(!response.from_cache);
    }

    #[tokio::test]
    async fn test_http_fetcher_returns_error_statuses() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(LoaderConfig::default()).unwrap();
        let url = Url::parse(&server.uri()).unwrap();
        let response = fetcher.fetch(Request::get(url)).await.unwrap();
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(!response.ok());
    }

    #[tokio::test]
    async fn test_http_fetcher_sends_multipart() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(LoaderConfig::default()).unwrap();
        let url = Url::parse(&format!("{}/upload", server.uri())).unwrap();
        let request = Request::post(
            url,
            RequestBody::Multipart(vec![
                MultipartPart::text("caseId", "42"),
                MultipartPart::file("file", "brief.pdf", "application/pdf", &b"%PDF"[..]),
            ]),
        );
        let response = fetcher.fetch(request).await.unwrap();
        assert_eq!(response.status, StatusCode::CREATED);

        let received = server.received_requests().await.unwrap();
        assert_eq!(received.len(), 1);
        let body = String::from_utf8_lossy(&received[0].body);
        assert!(body.contains("brief.pdf"));
        assert!(body.contains("%PDF"));
    }

    #[tokio::test]
    async fn test_http_fetcher_connection_failure() {
        let fetcher = HttpFetcher::new(LoaderConfig::default()).unwrap();
        let url = Url::parse("http://127.0.0.1:9/unreachable").unwrap();
        assert!(fetcher.fetch(Request::get(url)).await.is_err());
    }
}
