use thiserror::Error;

/// Errors raised inside the pipeline
///
/// `DataUnavailable` and `Network` are recovered locally (skip or retry).
/// `Persistence` is logged and retried on the next cycle. Only `Config`
/// and store connection failures at startup are fatal.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("insufficient data for {instrument} {interval}: got {got} candles, need {required}")]
    DataUnavailable {
        instrument: String,
        interval: String,
        got: usize,
        required: usize,
    },

    /// Transient transport failure (timeout, connect, 429, 5xx)
    #[error("network error: {0}")]
    Network(String),

    /// Upstream rejected the request (4xx other than 429)
    #[error("upstream rejected request ({status}): {body}")]
    Http { status: u16, body: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("analyzer error: {0}")]
    Analyzer(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    /// Whether the historical-fetch retry policy should try again
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Network(_) => true,
            PipelineError::Http { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return PipelineError::Http {
                status: status.as_u16(),
                body: e.to_string(),
            };
        }
        if e.is_decode() {
            return PipelineError::Parse(e.to_string());
        }
        PipelineError::Network(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for PipelineError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        PipelineError::Network(e.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        PipelineError::Parse(e.to_string())
    }
}

impl From<redis::RedisError> for PipelineError {
    fn from(e: redis::RedisError) -> Self {
        PipelineError::Persistence(e.to_string())
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(e: sqlx::Error) -> Self {
        PipelineError::Persistence(e.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for PipelineError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        PipelineError::Persistence(e.to_string())
    }
}

impl From<config::ConfigError> for PipelineError {
    fn from(e: config::ConfigError) -> Self {
        PipelineError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(PipelineError::Network("timeout".into()).is_retryable());
        assert!(PipelineError::Http { status: 429, body: String::new() }.is_retryable());
        assert!(PipelineError::Http { status: 503, body: String::new() }.is_retryable());
        assert!(!PipelineError::Http { status: 400, body: String::new() }.is_retryable());
        assert!(!PipelineError::Http { status: 404, body: String::new() }.is_retryable());
        assert!(!PipelineError::Parse("bad json".into()).is_retryable());
    }
}
