use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::token::TokenError;

/// Teardown request. Never creates a worker.
pub const CLOSE_METHOD: &str = "close";
pub const SET_WEBHOOK_METHOD: &str = "setwebhook";
pub const DELETE_WEBHOOK_METHOD: &str = "deletewebhook";

/// Methods that change the webhook registration themselves.
pub fn is_webhook_method(method: &str) -> bool {
    method == SET_WEBHOOK_METHOD || method == DELETE_WEBHOOK_METHOD
}

pub type QueryResult = Result<serde_json::Value, QueryError>;

/// Why a query was not answered successfully.
///
/// Every variant maps to an HTTP-equivalent status the transport layer reports to the client.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("Unauthorized: invalid token specified")]
    Unauthorized,

    #[error("Misdirected Request: unallowed token specified")]
    MisdirectedRequest,

    #[error("Bad Request: {0}")]
    BadRequest(String),

    #[error("Too Many Requests: retry after {retry_after}")]
    RateLimited { retry_after: u64 },

    #[error("Too Many Requests: retry later")]
    ServiceUnavailable,

    /// An error produced by the worker itself.
    #[error("{description}")]
    Worker { status: u16, description: String },
}

impl QueryError {
    pub fn status(&self) -> u16 {
        match self {
            QueryError::Unauthorized => 401,
            QueryError::MisdirectedRequest => 421,
            QueryError::BadRequest(_) => 400,
            QueryError::RateLimited { .. } | QueryError::ServiceUnavailable => 429,
            QueryError::Worker { status, .. } => *status,
        }
    }

    pub fn retry_after(&self) -> Option<u64> {
        match self {
            QueryError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

impl From<TokenError> for QueryError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Malformed => QueryError::Unauthorized,
            TokenError::Misdirected => QueryError::MisdirectedRequest,
        }
    }
}

/// An uploaded file attached to a query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputFile {
    pub field_name: String,
    pub file_name: String,
    #[serde(default)]
    pub content: Vec<u8>,
}

/// The decoded form of one inbound API request, as produced by the transport layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub token: String,
    pub method: String,
    #[serde(default)]
    pub args: Vec<(String, String)>,
    #[serde(default)]
    pub files: Vec<InputFile>,
    #[serde(default)]
    pub is_test_dc: bool,
    /// Source address as seen by the transport, if any.
    #[serde(default)]
    pub peer_address: Option<String>,
}

/// Writes the result of a query. Dropping it unanswered reports [`QueryError::ServiceUnavailable`].
#[derive(Debug)]
struct Responder(Option<oneshot::Sender<QueryResult>>);

impl Responder {
    fn send(&mut self, result: QueryResult) {
        if let Some(tx) = self.0.take() {
            // The client may have gone away; nothing to do then.
            let _ = tx.send(result);
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        self.send(Err(QueryError::ServiceUnavailable));
    }
}

/// One inbound request in flight. It is answered exactly once: either explicitly through
/// [`Query::answer`] / [`Query::fail`], or with a retry-later error when dropped.
#[derive(Debug)]
pub struct Query {
    request: QueryRequest,
    authorized: bool,
    responder: Responder,
}

/// Receiving end of a query's completion channel.
#[derive(Debug)]
pub struct QueryReply(oneshot::Receiver<QueryResult>);

impl QueryReply {
    pub async fn recv(self) -> QueryResult {
        self.0.await.unwrap_or(Err(QueryError::ServiceUnavailable))
    }
}

impl Query {
    pub fn new(mut request: QueryRequest) -> (Self, QueryReply) {
        request.method.make_ascii_lowercase();
        let (tx, rx) = oneshot::channel();
        let query = Self {
            request,
            authorized: false,
            responder: Responder(Some(tx)),
        };
        (query, QueryReply(rx))
    }

    /// A synthetic request issued by the router itself. Nobody waits for its result.
    pub(crate) fn internal(mut request: QueryRequest) -> Self {
        request.method.make_ascii_lowercase();
        Self {
            request,
            authorized: true,
            responder: Responder(None),
        }
    }

    pub fn token(&self) -> &str {
        &self.request.token
    }

    /// Lowercased method name.
    pub fn method(&self) -> &str {
        &self.request.method
    }

    pub fn is_test_dc(&self) -> bool {
        self.request.is_test_dc
    }

    pub fn args(&self) -> &[(String, String)] {
        &self.request.args
    }

    pub fn arg(&self, name: &str) -> Option<&str> {
        self.request
            .args
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn files(&self) -> &[InputFile] {
        &self.request.files
    }

    pub fn peer_address(&self) -> Option<&str> {
        self.request.peer_address.as_deref()
    }

    /// Set for router-issued requests (e.g. webhook restore) that skip admission control.
    pub fn is_authorized(&self) -> bool {
        self.authorized
    }

    pub fn answer(self, value: serde_json::Value) {
        self.respond(Ok(value));
    }

    pub fn fail(self, error: QueryError) {
        self.respond(Err(error));
    }

    pub fn respond(mut self, result: QueryResult) {
        self.responder.send(result);
    }
}
