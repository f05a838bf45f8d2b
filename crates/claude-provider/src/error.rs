//! Authentication errors surfaced to the proxy

use claude_auth::StoreError;

/// Errors from token provisioning. The proxy maps these onto HTTP status
/// codes: `LoginRequired` becomes 401, transport and upstream failures
/// become 502, storage failures become 500.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// No credential stored, or the refresh token was rejected.
    #[error("not authenticated; run `claude-gate login` first")]
    LoginRequired,

    /// Network failure reaching the token endpoint.
    #[error("token refresh transport failure: {0}")]
    Transport(String),

    /// The token endpoint failed in a way that is not the grant's fault.
    #[error("token endpoint failure: {0}")]
    Upstream(String),

    /// The credential store failed; the variant distinguishes corrupt
    /// documents from plain I/O errors.
    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl From<claude_auth::Error> for AuthError {
    fn from(err: claude_auth::Error) -> Self {
        match err {
            claude_auth::Error::Transport(reason) => AuthError::Transport(reason),
            // Callers handle InvalidGrant explicitly (it purges the stored
            // record); this arm only fires if one slips through.
            claude_auth::Error::InvalidGrant(_) => AuthError::LoginRequired,
            claude_auth::Error::Upstream { status, body } => {
                AuthError::Upstream(format!("token endpoint returned {status}: {body}"))
            }
            claude_auth::Error::Rng(reason) => AuthError::Upstream(reason),
        }
    }
}
