use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Terminal classification of a single model attempt.
///
/// Every failed attempt maps to exactly one kind; the kind drives both the
/// health penalty and the retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// TCP/TLS/request-write/first-header-byte did not complete in time.
    TimeoutConnect,
    /// The response body did not finish within the generation budget.
    TimeoutGeneration,
    /// DNS, connection reset, protocol error — no HTTP status available.
    Transport,
    /// 401 or 403 from the upstream.
    Http4xxAuth,
    /// 429 from the upstream.
    Http429,
    /// Any 5xx from the upstream.
    Http5xx,
    /// Remaining 4xx statuses.
    Http4xxOther,
    /// 2xx with an empty or whitespace-only completion.
    EmptyResponse,
    /// 2xx whose body matched a configured retry keyword.
    BodyKeyword,
    /// The upstream SSE stream died after bytes were already flowing.
    StreamAbort,
}

impl FailureKind {
    /// Classify a non-2xx upstream status.
    pub fn from_status(status: StatusCode) -> Self {
        match status.as_u16() {
            401 | 403 => FailureKind::Http4xxAuth,
            429 => FailureKind::Http429,
            500..=599 => FailureKind::Http5xx,
            _ => FailureKind::Http4xxOther,
        }
    }

    /// Health penalty applied when an attempt fails with this kind.
    ///
    /// Ordering invariant: auth >= 5xx > stream_abort >= timeout_connect
    /// >= empty >= keyword.
    pub fn penalty(&self) -> f64 {
        match self {
            FailureKind::TimeoutConnect => 2.0,
            FailureKind::TimeoutGeneration => 3.0,
            FailureKind::Http4xxAuth => 5.0,
            FailureKind::Http429 => 1.0,
            FailureKind::Http5xx => 2.0,
            FailureKind::Http4xxOther => 1.0,
            FailureKind::EmptyResponse => 1.5,
            FailureKind::BodyKeyword => 1.0,
            FailureKind::StreamAbort => 2.0,
            FailureKind::Transport => 2.0,
        }
    }

    /// The baseline retry rule. Status codes the operator added to
    /// `retries.conditions.status_codes` widen this set at the call site.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureKind::TimeoutConnect
                | FailureKind::TimeoutGeneration
                | FailureKind::Transport
                | FailureKind::Http5xx
                | FailureKind::Http429
                | FailureKind::EmptyResponse
                | FailureKind::StreamAbort
                | FailureKind::BodyKeyword
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::TimeoutConnect => "timeout_connect",
            FailureKind::TimeoutGeneration => "timeout_generation",
            FailureKind::Transport => "transport",
            FailureKind::Http4xxAuth => "http_4xx_auth",
            FailureKind::Http429 => "http_429",
            FailureKind::Http5xx => "http_5xx",
            FailureKind::Http4xxOther => "http_4xx_other",
            FailureKind::EmptyResponse => "empty_response",
            FailureKind::BodyKeyword => "body_keyword",
            FailureKind::StreamAbort => "stream_abort",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that escape the retry loop and terminate the request.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("no provider configured for '{0}'")]
    ProviderMissing(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("all candidates failed, last reason: {last_reason}")]
    Exhausted {
        attempted: Vec<String>,
        last_reason: String,
    },

    #[error("client disconnected")]
    ClientAbort,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type RouteResult<T> = Result<T, RouteError>;
