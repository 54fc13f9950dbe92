use thiserror::Error;

/// Pipeline error taxonomy. Classified by kind: callers decide per kind
/// whether to retry, log-and-continue, or surface.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed URL, unsupported source, parameter out of range.
    /// Surfaced to the caller; never retried.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Upstream 429 or local gating. Retried with backoff inside the
    /// client; surfaced only once retries are exhausted.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Network, 5xx, timeout, DNS. Retried with exponential backoff.
    #[error("transient failure: {0}")]
    Transient(String),

    /// 4xx (non-429), parse failure after the robust parser,
    /// authentication. Never retried.
    #[error("terminal failure: {0}")]
    Terminal(String),

    /// Circuit-breaker short-circuit. Transient at the orchestrator
    /// level: the next tick may succeed.
    #[error("circuit open for source '{0}'")]
    CircuitOpen(String),

    /// Pool acquisition timeout, full job channel. Backpressure — skip
    /// the iteration, do not fail the run.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Invalid UTF-8 or oversize payloads that could not be sanitised.
    #[error("corrupt data: {0}")]
    Corruption(String),

    /// Cancellation is its own kind, not a generic failure.
    #[error("operation canceled")]
    Canceled,

    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Kinds worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::RateLimited(_) | Error::Transient(_) | Error::CircuitOpen(_)
        )
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled)
    }

    /// Short stable name for logs and job records.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidInput(_) => "input_invalid",
            Error::RateLimited(_) => "rate_limited",
            Error::Transient(_) => "transient",
            Error::Terminal(_) => "terminal",
            Error::CircuitOpen(_) => "circuit_open",
            Error::ResourceExhausted(_) => "resource_exhausted",
            Error::Corruption(_) => "corruption",
            Error::Canceled => "canceled",
            Error::Storage(_) => "storage",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(Error::Transient("dns".into()).is_retryable());
        assert!(Error::RateLimited("429".into()).is_retryable());
        assert!(Error::CircuitOpen("nu.nl".into()).is_retryable());
        assert!(!Error::Terminal("401".into()).is_retryable());
        assert!(!Error::InvalidInput("bad url".into()).is_retryable());
        assert!(!Error::Canceled.is_retryable());
    }
}
