//! Error taxonomy surfaced at the crate boundary.
//!
//! Backend adapters translate transport and parse failures into a
//! [`ProviderError`] carrying a sentinel [`ErrorKind`]; the dispatcher adds
//! its own aggregate and policy errors on top. Callers match on the sentinel
//! kinds through [`Error::matches`] and friends, which traverse aggregated
//! failures the same way a source-chain walk would.

use thiserror::Error;

use crate::model::ContentKind;

pub type Result<T> = std::result::Result<T, Error>;

/// Sentinel error kinds callers can match against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad or missing credentials. Never retried by fallback.
    Authentication,
    /// Transient throttling. Eligible for fallback to another backend.
    RateLimited,
    /// Prompt plus options exceed the model's window.
    ContextTooLong,
    /// Safety or content-filter block.
    ContentFiltered,
    /// The requested model does not exist at this backend.
    ModelNotFound,
    /// Token quota or billing exhausted.
    QuotaExhausted,
    /// The backend rejected the request parameters.
    InvalidParams,
    /// Network connectivity failure or provider outage.
    Unavailable,
    /// The message list contains a content kind the backend cannot accept.
    /// Rejected before any network call.
    UnsupportedContent,
    /// Unparsable body or an empty candidate list.
    BadResponse,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Authentication => "authentication failed",
            ErrorKind::RateLimited => "rate limit exceeded",
            ErrorKind::ContextTooLong => "context too long",
            ErrorKind::ContentFiltered => "content filtered",
            ErrorKind::ModelNotFound => "model not found",
            ErrorKind::QuotaExhausted => "token quota exhausted",
            ErrorKind::InvalidParams => "invalid model parameters",
            ErrorKind::Unavailable => "provider unavailable",
            ErrorKind::UnsupportedContent => "unsupported content type",
            ErrorKind::BadResponse => "bad response",
        };
        f.write_str(s)
    }
}

/// A failure reported by one concrete backend.
#[derive(Debug, Clone)]
pub struct ProviderError {
    pub backend: String,
    pub operation: &'static str,
    pub status: Option<u16>,
    pub message: String,
    pub kind: ErrorKind,
}

impl ProviderError {
    pub fn new(
        backend: impl Into<String>,
        operation: &'static str,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            backend: backend.into(),
            operation,
            status: None,
            message: message.into(),
            kind,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// The pre-network rejection for a content kind a backend cannot take.
    pub fn unsupported_content(backend: impl Into<String>, kind: ContentKind) -> Self {
        let backend = backend.into();
        let message = format!("backend {backend} does not support {kind} content");
        Self::new(backend, "convert_messages", ErrorKind::UnsupportedContent, message)
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}: {} ({}", self.backend, self.operation, self.message, self.kind)?;
        if let Some(status) = self.status {
            write!(f, ", HTTP {status}")?;
        }
        f.write_str(")")
    }
}

impl std::error::Error for ProviderError {}

/// Zero backends succeeded. Holds every backend's failure; the standard
/// source chain exposes the first one, the concrete type exposes all.
#[derive(Debug)]
pub struct AggregateError {
    pub failures: Vec<(String, Error)>,
}

impl AggregateError {
    pub fn new(failures: Vec<(String, Error)>) -> Self {
        Self { failures }
    }
}

impl std::fmt::Display for AggregateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("no successful calls")?;
        for (i, (backend, err)) in self.failures.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{backend}: {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.failures
            .first()
            .map(|(_, err)| err as &(dyn std::error::Error + 'static))
    }
}

/// Errors surfaced by backends and the dispatcher.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid messages: {0}")]
    InvalidMessages(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("no providers configured")]
    NoBackends,

    #[error(transparent)]
    AllFailed(#[from] AggregateError),

    #[error("deadline exceeded")]
    DeadlineExceeded,
}

impl Error {
    /// The sentinel kind of this error, when it carries one directly.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Error::Provider(p) => Some(p.kind),
            _ => None,
        }
    }

    /// Whether this error, or any failure inside an aggregate, carries the
    /// given sentinel kind.
    pub fn matches(&self, kind: ErrorKind) -> bool {
        match self {
            Error::Provider(p) => p.kind == kind,
            Error::AllFailed(agg) => agg.failures.iter().any(|(_, e)| e.matches(kind)),
            _ => false,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        self.matches(ErrorKind::RateLimited)
    }

    pub fn is_authentication(&self) -> bool {
        self.matches(ErrorKind::Authentication)
    }

    pub fn is_content_filtered(&self) -> bool {
        self.matches(ErrorKind::ContentFiltered)
    }
}

/// Map an HTTP failure status plus the provider's message to a sentinel
/// kind. The substring sets are best-effort and backend-versioned:
/// context window overflows mention "context" or "too long", exhausted
/// billing mentions "quota", "billing" or "credit", and missing models
/// mention the model by name.
pub(crate) fn classify_http(
    backend: &str,
    operation: &'static str,
    status: u16,
    message: &str,
) -> ProviderError {
    let lower = message.to_ascii_lowercase();
    let kind = match status {
        401 | 403 => ErrorKind::Authentication,
        429 => {
            if lower.contains("quota") || lower.contains("billing") || lower.contains("credit") {
                ErrorKind::QuotaExhausted
            } else {
                ErrorKind::RateLimited
            }
        }
        404 => ErrorKind::ModelNotFound,
        400..=499 => {
            if lower.contains("maximum context") || lower.contains("context length") || lower.contains("too long") {
                ErrorKind::ContextTooLong
            } else if lower.contains("model") && (lower.contains("not found") || lower.contains("does not exist")) {
                ErrorKind::ModelNotFound
            } else if lower.contains("quota") || lower.contains("billing") || lower.contains("credit") {
                ErrorKind::QuotaExhausted
            } else {
                ErrorKind::InvalidParams
            }
        }
        _ => ErrorKind::Unavailable,
    };

    ProviderError::new(backend, operation, kind, message).with_status(status)
}
