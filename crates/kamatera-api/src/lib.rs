//! Typed Rust client for the Kamatera cloud server API.
//!
//! Covers the subset needed by a machine driver: the server options
//! catalog, server creation, the command queue, the server list,
//! power operations and termination.
//!
//! The client never retries. Every call maps the response status into
//! [`StatusClass`] so callers can apply their own retry policy.

mod types;

pub use types::*;

pub use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;

pub const DEFAULT_BASE_URL: &str = "https://console.kamatera.com";

const USER_AGENT: &str = concat!("docker-machine-driver-kamatera/v", env!("CARGO_PKG_VERSION"));

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("kamatera api request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("kamatera api {endpoint}: resource not found")]
    NotFound { endpoint: &'static str },

    #[error("kamatera api {endpoint} responded with the following error: {body}")]
    Rejected { endpoint: &'static str, body: String },

    #[error("kamatera api {endpoint} returned {status}: {body}")]
    Status {
        endpoint: &'static str,
        status: StatusCode,
        body: String,
    },

    #[error("kamatera api {endpoint} returned an unexpected body ({reason}): {body}")]
    Decode {
        endpoint: &'static str,
        reason: String,
        body: String,
    },
}

impl Error {
    /// Transport failures and ambiguous non-200 statuses. Everything else
    /// is a well-formed answer that retrying will not change.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Request(_) | Self::Status { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }

    /// HTTP status behind the error, when the server answered at all.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Request(e) => e.status(),
            Self::NotFound { .. } => Some(StatusCode::NOT_FOUND),
            Self::Rejected { .. } => Some(StatusCode::INTERNAL_SERVER_ERROR),
            Self::Status { status, .. } => Some(*status),
            Self::Decode { .. } => Some(StatusCode::OK),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// How a caller should treat a response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    NotFound,
    /// HTTP 500: the provider rejected the request and said why.
    Rejected,
    /// Any other non-200 status.
    Transient,
}

impl StatusClass {
    pub fn of(status: StatusCode) -> Self {
        match status.as_u16() {
            200 => Self::Success,
            404 => Self::NotFound,
            500 => Self::Rejected,
            _ => Self::Transient,
        }
    }
}

/// Raw status and body of a completed HTTP exchange.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: String,
}

impl ApiResponse {
    pub fn class(&self) -> StatusClass {
        StatusClass::of(self.status)
    }

    /// Turn a non-200 response into the matching [`Error`] variant.
    pub fn check(self, endpoint: &'static str) -> Result<String> {
        match self.class() {
            StatusClass::Success => Ok(self.body),
            StatusClass::NotFound => Err(Error::NotFound { endpoint }),
            StatusClass::Rejected => Err(Error::Rejected {
                endpoint,
                body: self.body,
            }),
            StatusClass::Transient => Err(Error::Status {
                endpoint,
                status: self.status,
                body: self.body,
            }),
        }
    }

    pub fn json<T: DeserializeOwned>(self, endpoint: &'static str) -> Result<T> {
        let body = self.check(endpoint)?;
        decode(endpoint, body)
    }
}

fn decode<T: DeserializeOwned>(endpoint: &'static str, body: String) -> Result<T> {
    serde_json::from_str(&body).map_err(|e| Error::Decode {
        endpoint,
        reason: e.to_string(),
        body,
    })
}

/// Client for the Kamatera server REST API.
#[derive(Clone)]
pub struct KamateraClient {
    client_id: String,
    secret: String,
    base_url: String,
    http: reqwest::Client,
}

impl KamateraClient {
    pub fn new(client_id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            secret: secret.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// Point the client at another host (a mock server in tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Send one request with the auth headers attached and return the raw
    /// status and body. Only transport failures are errors here.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        form: Option<&[(&str, String)]>,
    ) -> Result<ApiResponse> {
        tracing::debug!(%method, path, "kamatera api request");

        let mut builder = self
            .http
            .request(method, self.url(path))
            .header("AuthClientId", &self.client_id)
            .header("AuthSecret", &self.secret)
            .header("User-Agent", USER_AGENT)
            .header("Accept", "*/*");

        if let Some(fields) = form {
            builder = builder.form(fields);
        }

        let resp = builder.send().await?;
        let status = resp.status();
        let body = resp.text().await?;

        tracing::debug!(path, status = status.as_u16(), "kamatera api response");
        Ok(ApiResponse { status, body })
    }

    // ── Catalog ──────────────────────────────────────────────────────

    pub async fn server_options(&self) -> Result<ServerOptions> {
        self.request(Method::GET, "/service/server", None)
            .await?
            .json("server options")
    }

    // ── Servers ──────────────────────────────────────────────────────

    /// Submit a create request. Returns the id of the queued create command.
    pub async fn create_server(&self, form: &CreateServerForm) -> Result<CommandId> {
        const ENDPOINT: &str = "create server";

        let fields = form.to_fields();
        let body = self
            .request(Method::POST, "/service/server", Some(&fields[..]))
            .await?
            .check(ENDPOINT)?;

        let ids: Vec<CommandId> = decode(ENDPOINT, body.clone())?;
        ids.first().copied().ok_or(Error::Decode {
            endpoint: ENDPOINT,
            reason: "empty command id list".into(),
            body,
        })
    }

    pub async fn list_servers(&self) -> Result<Vec<ServerSummary>> {
        self.request(Method::GET, "/service/servers", None)
            .await?
            .json("list servers")
    }

    pub async fn terminate_server(&self, server_id: &str) -> Result<CommandId> {
        let fields = [("confirm", "1".to_string()), ("force", "1".to_string())];
        self.request(
            Method::DELETE,
            &format!("/service/server/{server_id}/terminate"),
            Some(&fields[..]),
        )
        .await?
        .json("terminate server")
    }

    pub async fn set_power(&self, server_id: &str, power: Power) -> Result<CommandId> {
        let fields = [("power", power.as_str().to_string())];
        self.request(
            Method::PUT,
            &format!("/service/server/{server_id}/power"),
            Some(&fields[..]),
        )
        .await?
        .json("power operation")
    }

    // ── Command queue ────────────────────────────────────────────────

    pub async fn command_info(&self, command_id: CommandId) -> Result<CommandInfo> {
        self.request(Method::GET, &format!("/service/queue/{command_id}"), None)
            .await?
            .json("command info")
    }
}
