//! Error types for OAuth client operations

/// Errors from the token endpoint and PKCE generation.
///
/// The split between `InvalidGrant` and `Upstream` matters to callers: a
/// rejected grant means the stored refresh token is dead and the user must
/// log in again, while an upstream failure is worth retrying later.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Network-level failure reaching the token endpoint.
    #[error("token endpoint unreachable: {0}")]
    Transport(String),

    /// The endpoint rejected the grant (HTTP 400/401 or an
    /// `invalid_grant` body). The credential is no longer usable.
    #[error("grant rejected by token endpoint: {0}")]
    InvalidGrant(String),

    /// Any other non-2xx response from the token endpoint.
    #[error("token endpoint returned {status}: {body}")]
    Upstream { status: u16, body: String },

    /// The system CSPRNG failed. Fatal; never masked.
    #[error("system randomness unavailable: {0}")]
    Rng(String),
}

/// Result alias for OAuth operations.
pub type Result<T> = std::result::Result<T, Error>;
