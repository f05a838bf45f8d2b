//! OAuth token exchange and refresh
//!
//! Handles the two token endpoint interactions:
//! 1. Authorization code exchange (initial login completion)
//! 2. Token refresh (renewing the access token before expiry)
//!
//! Both operations POST JSON to the token endpoint on Anthropic's console
//! (`console.anthropic.com`), not the inference API (`api.anthropic.com`).
//! This layer never retries; retry policy belongs to the caller.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::constants::{REDIRECT_URI, TOKEN_ENDPOINT};
use crate::error::{Error, Result};
use crate::record::{TokenRecord, unix_now};

/// Total timeout for one token endpoint round trip.
const TOKEN_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Response from the token endpoint for both exchange and refresh.
///
/// `expires_in` is a delta in seconds from the response time; callers
/// convert it to an absolute timestamp when persisting. A refresh response
/// may omit `refresh_token`, in which case the previous one stays valid.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_in: u64,
}

/// Client for the Anthropic OAuth token endpoint.
pub struct OAuthClient {
    http: reqwest::Client,
    endpoint: String,
    client_id: String,
}

impl OAuthClient {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self::with_endpoint(client_id, TOKEN_ENDPOINT)
    }

    /// Point the client at a different token endpoint. Used by tests and
    /// by deployments that front the console with their own gateway.
    pub fn with_endpoint(client_id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(TOKEN_REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http,
            endpoint: endpoint.into(),
            client_id: client_id.into(),
        }
    }

    /// Exchange an authorization code for tokens (initial login).
    ///
    /// Sends the code together with the PKCE verifier to prove this client
    /// initiated the flow. Returns a ready-to-store record whose
    /// `expires_at` is already absolute.
    pub async fn exchange_code(&self, code: &str, verifier: &str) -> Result<TokenRecord> {
        let body = json!({
            "grant_type": "authorization_code",
            "code": code,
            "code_verifier": verifier,
            "client_id": self.client_id,
            "redirect_uri": REDIRECT_URI,
        });
        let token = self.post_token(&body).await?;
        debug!(expires_in = token.expires_in, "authorization code exchanged");
        Ok(TokenRecord::Oauth {
            access_token: token.access_token,
            // The exchange response always carries a refresh token; an
            // absent one would produce an unusable record, so reject it.
            refresh_token: token.refresh_token.ok_or_else(|| Error::Upstream {
                status: 200,
                body: "exchange response missing refresh_token".into(),
            })?,
            expires_at: unix_now() + token.expires_in,
        })
    }

    /// Refresh an access token using a refresh token.
    pub async fn refresh_access_token(&self, refresh_token: &str) -> Result<TokenResponse> {
        let body = json!({
            "grant_type": "refresh_token",
            "refresh_token": refresh_token,
            "client_id": self.client_id,
        });
        let token = self.post_token(&body).await?;
        debug!(
            expires_in = token.expires_in,
            rotated = token.refresh_token.is_some(),
            "access token refreshed"
        );
        Ok(token)
    }

    async fn post_token(&self, body: &serde_json::Value) -> Result<TokenResponse> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            return Err(classify_failure(status.as_u16(), body));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| Error::Upstream {
                status: status.as_u16(),
                body: format!("unparseable token response: {e}"),
            })
    }
}

/// Map a non-2xx token endpoint response to an error kind.
///
/// 400/401 and any body carrying `invalid_grant` mean the grant itself is
/// dead; everything else is a server-side problem worth retrying later.
fn classify_failure(status: u16, body: String) -> Error {
    if status == 400 || status == 401 || body.contains("invalid_grant") {
        Error::InvalidGrant(format!("token endpoint returned {status}: {body}"))
    } else {
        Error::Upstream { status, body }
    }
}
