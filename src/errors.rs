use thiserror::Error;

/// Errors surfaced by the exchange client. The engine's retry-vs-abandon
/// decisions hinge on the transient/permanent split: transient failures are
/// retried with backoff and then deferred to the next tick, permanent ones
/// are not retried at all.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Rate limits, exchange-side outages, lockouts. Safe to retry.
    #[error("transient exchange error: {0}")]
    Transient(String),

    /// Rejected orders, unknown pairs, bad credentials. Retrying won't help.
    #[error("permanent exchange error: {0}")]
    Permanent(String),

    /// Network/transport failure before a Kraken response was decoded.
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Kraken error prefixes that indicate a retryable condition.
const TRANSIENT_PREFIXES: &[&str] = &[
    "EAPI:Rate limit",
    "EOrder:Rate limit",
    "EService:Unavailable",
    "EService:Busy",
    "EGeneral:Temporary",
];

impl ExchangeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ExchangeError::Transient(_) | ExchangeError::Http(_))
    }

    /// Classify the `error` array of a Kraken API response.
    pub fn from_kraken(errors: &[String]) -> Self {
        let message = errors.join(" | ");
        let transient = errors
            .iter()
            .any(|e| TRANSIENT_PREFIXES.iter().any(|p| e.starts_with(p)));
        if transient {
            ExchangeError::Transient(message)
        } else {
            ExchangeError::Permanent(message)
        }
    }
}
