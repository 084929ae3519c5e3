use thiserror::Error;

/// WebSocket close codes used on the client-facing socket.
///
/// 1000 is the standard normal closure; the 4xxx range is reserved for
/// application use and mirrors the HTTP status the condition would have had.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const UNAUTHORIZED: u16 = 4401;
    pub const INIT_TIMEOUT: u16 = 4408;
    pub const RATE_LIMITED: u16 = 4429;
    pub const RELAY_INTERNAL: u16 = 4500;
    pub const UPSTREAM_FAILED: u16 = 4502;
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("unauthorized")]
    Unauthenticated,

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("credential store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("invalid init: {0}")]
    InvalidInit(String),

    #[error("timed out waiting for init_session")]
    InitTimeout,

    #[error("token mint failed: {0}")]
    MintFailed(String),

    #[error("upstream session closed")]
    SessionClosed,

    #[error("upstream failed: {0}")]
    UpstreamFailed(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl RelayError {
    /// The close code sent on the client WebSocket for this error.
    pub fn close_code(&self) -> u16 {
        match self {
            RelayError::Unauthenticated => close_code::UNAUTHORIZED,
            RelayError::QuotaExceeded(_) | RelayError::RateLimited => close_code::RATE_LIMITED,
            RelayError::InvalidInit(_) | RelayError::InitTimeout => close_code::INIT_TIMEOUT,
            RelayError::MintFailed(_)
            | RelayError::SessionClosed
            | RelayError::UpstreamFailed(_) => close_code::UPSTREAM_FAILED,
            RelayError::StoreUnavailable(_) | RelayError::Internal(_) => {
                close_code::RELAY_INTERNAL
            }
        }
    }

    /// Short machine-readable reason carried in the close frame.
    pub fn close_reason(&self) -> &'static str {
        match self {
            RelayError::Unauthenticated => "unauthorized",
            RelayError::QuotaExceeded(_) => "quota_exceeded",
            RelayError::RateLimited => "rate_limited",
            RelayError::InvalidInit(_) => "invalid_init",
            RelayError::InitTimeout => "init_timeout",
            RelayError::MintFailed(_) => "relay_init_failed",
            RelayError::SessionClosed | RelayError::UpstreamFailed(_) => "upstream_failed",
            RelayError::StoreUnavailable(_) | RelayError::Internal(_) => "relay_internal",
        }
    }
}
