// ABOUTME: Error taxonomy shared by the session pool, dispatcher, and relay protocol.
// ABOUTME: Variants distinguish transient, terminal, and flow-control failures so callers can branch on them.

use std::time::Duration;
use thiserror::Error;

/// Failure modes surfaced by the pool, session login, and relay exchanges.
///
/// The enum is `Clone` because a single in-flight login result is fanned out
/// to every caller that joined the same placeholder future.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Transient transport or network failure. Retried internally with backoff;
    /// surfaced only once the retry budget is exhausted.
    #[error("transport error: {0}")]
    Transport(String),

    /// Credential revoked or otherwise invalid. Terminal for the identity,
    /// never retried.
    #[error("authentication revoked: {0}")]
    AuthRevoked(String),

    /// No account is configured for the requested identity.
    #[error("no account configured for identity {0}")]
    UnknownIdentity(String),

    /// The platform asked us to back off for the carried duration. Sleeping
    /// exactly that long and retrying does not consume the retry budget.
    #[error("rate limited, retry after {}s", .0.as_secs())]
    RateLimited(Duration),

    /// An external wait elapsed without a result.
    #[error("request timed out")]
    Timeout,

    /// The relay peer has blocked the automation account. Terminal; the
    /// operator has to unblock the peer out of band.
    #[error("relay peer has blocked this account")]
    PeerBlocked,

    /// A relay message did not decode as the expected structured document.
    /// Logged and treated as a non-match; the exchange keeps waiting.
    #[error("malformed relay response: {0}")]
    Decode(String),
}

impl Error {
    /// Whether retrying this failure can possibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::RateLimited(_) | Error::Timeout
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Transport("reset".into()).is_transient());
        assert!(Error::RateLimited(Duration::from_secs(5)).is_transient());
        assert!(Error::Timeout.is_transient());
        assert!(!Error::AuthRevoked("revoked".into()).is_transient());
        assert!(!Error::PeerBlocked.is_transient());
        assert!(!Error::Decode("bad toml".into()).is_transient());
    }

    #[test]
    fn test_rate_limited_display_carries_wait() {
        let err = Error::RateLimited(Duration::from_secs(17));
        assert!(err.to_string().contains("17"));
    }
}
