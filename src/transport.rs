use std::error::Error as StdError;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};

pub type Result<T> = std::result::Result<T, TransportError>;

/// Response body as a stream of byte chunks.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum TransportError {
    /// Connect or read deadline elapsed
    Timeout(String),
    /// Host name could not be resolved
    Dns(String),
    /// Connection refused/reset before a response arrived
    Connect(String),
    /// Failure while reading the response body
    Body(String),
    Other(String),
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout(_))
    }

    pub fn is_dns(&self) -> bool {
        matches!(self, TransportError::Dns(_))
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Timeout(msg) => write!(f, "transport timeout: {msg}"),
            TransportError::Dns(msg) => write!(f, "transport dns: {msg}"),
            TransportError::Connect(msg) => write!(f, "transport connect: {msg}"),
            TransportError::Body(msg) => write!(f, "transport body: {msg}"),
            TransportError::Other(msg) => write!(f, "transport: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        let msg = e.to_string();
        if e.is_timeout() {
            TransportError::Timeout(msg)
        } else if is_dns_error(&e) {
            TransportError::Dns(msg)
        } else if e.is_connect() {
            TransportError::Connect(msg)
        } else if e.is_body() || e.is_decode() {
            TransportError::Body(msg)
        } else {
            TransportError::Other(msg)
        }
    }
}

/// Walk the source chain looking for a resolver failure. hyper reports these
/// as connect errors whose inner message names the lookup.
fn is_dns_error(e: &reqwest::Error) -> bool {
    let mut source = e.source();
    while let Some(err) = source {
        let text = err.to_string().to_ascii_lowercase();
        if text.contains("dns error") || text.contains("failed to lookup address") {
            return true;
        }
        source = err.source();
    }
    false
}

// ---------------------------------------------------------------------------
// Request / response
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    /// Form-urlencoded body, already encoded.
    pub form: Option<String>,
    /// `None` keeps the connection open indefinitely (streaming bind).
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url)
    }

    fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query: Vec::new(),
            form: None,
            timeout: None,
        }
    }

    pub fn query(mut self, query: Vec<(String, String)>) -> Self {
        self.query = query;
        self
    }

    pub fn form(mut self, body: String) -> Self {
        self.form = Some(body);
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

pub struct HttpResponse {
    pub status: u16,
    pub body: BodyStream,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Drain the whole body.
    pub async fn bytes(mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.body.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }

    pub async fn text(self) -> Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// The HTTP client the bind engine talks through.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse>;
}

// ---------------------------------------------------------------------------
// reqwest implementation
// ---------------------------------------------------------------------------

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Build a client with a cookie store: the bind endpoint hands out
    /// session cookies that later requests must echo.
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("Mozilla/5.0")
            .cookie_store(true)
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
        };
        builder = builder.query(&request.query);
        if let Some(form) = request.form {
            builder = builder
                .header("Content-Type", "application/x-www-form-urlencoded")
                .body(form);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let resp = builder.send().await?;
        let status = resp.status().as_u16();
        let body = resp.bytes_stream().map(|r| r.map_err(TransportError::from));

        Ok(HttpResponse {
            status,
            body: Box::pin(body),
        })
    }
}

// ---------------------------------------------------------------------------
// Scripted transport for tests
// ---------------------------------------------------------------------------
