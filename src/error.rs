//! Error types for the mail triage service.

use std::time::Duration;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    /// Stale or dropped connection. The only class the retry wrapper retries.
    #[error("Connection lost: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    /// Whether this failure came from the transport rather than the query.
    pub fn is_connection(&self) -> bool {
        matches!(self, DatabaseError::Connection(_))
    }

    /// Classify a raw libsql error into `Connection` or `Query` by variant.
    /// SQL failures, local or remote, are always `Query`.
    pub fn from_libsql(err: libsql::Error) -> Self {
        let connection = match &err {
            libsql::Error::ConnectionFailed(_) | libsql::Error::InvalidTlsConfiguration(_) => true,
            libsql::Error::Hrana(inner) => is_hrana_transport_failure(&inner.to_string()),
            _ => false,
        };
        let message = err.to_string();
        if connection {
            DatabaseError::Connection(message)
        } else {
            DatabaseError::Query(message)
        }
    }
}

/// libsql boxes its Hrana error type, which is not exported. Its variant is
/// only visible through the display prefix. Stream and cursor errors carry
/// SQL failures reported by the server.
fn is_hrana_transport_failure(message: &str) -> bool {
    const TRANSPORT: &[&str] = &["stream closed:", "http error:", "unexpected response:"];
    TRANSPORT.iter().any(|prefix| message.starts_with(prefix))
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    /// The model stopped at its output-token limit before producing JSON.
    #[error("Response from {provider} truncated at {max_output_tokens} output tokens")]
    Truncated {
        provider: String,
        max_output_tokens: u32,
    },

    #[error("Malformed JSON from {provider}: {reason}")]
    MalformedJson { provider: String, reason: String },

    #[error("Response is missing required field `{field}`")]
    MissingField { field: String },

    #[error("Field `{field}` has an invalid value: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },
}

/// Pipeline-related errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Tracking lookup failed: {0}")]
    Tracking(#[from] DatabaseError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),
}

/// Managed datastore (result persistence) errors.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Request to {collection} failed: {reason}")]
    RequestFailed { collection: String, reason: String },

    #[error("Datastore rejected write to {collection} with status {status}: {body}")]
    Rejected {
        collection: String,
        status: u16,
        body: String,
    },

    #[error("Unexpected response from {collection}: {reason}")]
    InvalidResponse { collection: String, reason: String },
}

/// HTTP-facing errors, rendered as `{"error", "detail"}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Invalid or missing API key")]
    Unauthorized,

    #[error("Rate limit exceeded")]
    RateLimited,

    /// An upstream dependency (LLM, datastore) failed.
    #[error("{0}")]
    Upstream(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::Unauthorized => "unauthorized",
            Self::RateLimited => "rate_limited",
            Self::Upstream(_) => "upstream_error",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::InvalidInput(msg) => Self::BadRequest(msg),
            PipelineError::Tracking(e) => Self::Internal(e.to_string()),
            err @ PipelineError::Llm(_) => Self::Upstream(err.to_string()),
        }
    }
}

impl From<PersistenceError> for ApiError {
    fn from(err: PersistenceError) -> Self {
        Self::Upstream(err.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self, "Request failed");
        }
        let body = Json(serde_json::json!({
            "error": self.label(),
            "detail": self.to_string(),
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sql_failures_classify_as_query() {
        let local = DatabaseError::from_libsql(libsql::Error::SqliteFailure(
            1,
            "no such column: stream_id".into(),
        ));
        assert!(matches!(local, DatabaseError::Query(_)));

        let remote = DatabaseError::from_libsql(libsql::Error::RemoteSqliteFailure(
            1,
            1,
            "no such table: closed_orders".into(),
        ));
        assert!(matches!(remote, DatabaseError::Query(_)));

        let misuse = DatabaseError::from_libsql(libsql::Error::Misuse("connection closed".into()));
        assert!(matches!(misuse, DatabaseError::Query(_)));
    }

    #[test]
    fn transport_failures_classify_as_connection() {
        let failed = DatabaseError::from_libsql(libsql::Error::ConnectionFailed("refused".into()));
        assert!(failed.is_connection());

        let closed = DatabaseError::from_libsql(libsql::Error::Hrana("stream closed: `gone`".into()));
        assert!(closed.is_connection());

        let http = DatabaseError::from_libsql(libsql::Error::Hrana("http error: `reset`".into()));
        assert!(http.is_connection());
    }

    #[test]
    fn hrana_sql_errors_classify_as_query() {
        let step = DatabaseError::from_libsql(libsql::Error::Hrana(
            "stream error: `Error { message: \"SQLITE_ERROR: no such column: stream_id\" }`".into(),
        ));
        assert!(matches!(step, DatabaseError::Query(_)));

        let api = DatabaseError::from_libsql(libsql::Error::Hrana("api error: `bad request`".into()));
        assert!(matches!(api, DatabaseError::Query(_)));
    }

    #[test]
    fn pipeline_errors_map_to_http_statuses() {
        let bad: ApiError = PipelineError::InvalidInput("subject must not be empty".into()).into();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

        let llm: ApiError = PipelineError::Llm(LlmError::MissingField {
            field: "body".into(),
        })
        .into();
        assert_eq!(llm.status(), StatusCode::BAD_GATEWAY);

        let db: ApiError = PipelineError::Tracking(DatabaseError::Query("bad".into())).into();
        assert_eq!(db.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn only_connection_variant_is_connection_class() {
        assert!(DatabaseError::Connection("gone".into()).is_connection());
        assert!(!DatabaseError::Query("syntax".into()).is_connection());
        assert!(!DatabaseError::Pool("open".into()).is_connection());
    }
}
