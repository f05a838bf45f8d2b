//! PKCE (Proof Key for Code Exchange) implementation per RFC 7636
//!
//! Generates the code verifier and S256 challenge used during the OAuth
//! authorization flow. The verifier is held by the CLI until token exchange;
//! the challenge goes into the authorization URL so the authorization server
//! can verify the exchange request came from the party that initiated the
//! flow. The `state` value rides along for CSRF protection.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::TryRngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::constants::{AUTHORIZE_ENDPOINT, REDIRECT_URI, SCOPES};
use crate::error::{Error, Result};

/// One login attempt's worth of PKCE material. Single use: discarded after
/// the code exchange completes or the attempt is abandoned.
#[derive(Debug, Clone)]
pub struct PkceSession {
    /// 32 random bytes as URL-safe base64 (43 chars, within the RFC's 43-128 range)
    pub verifier: String,
    /// `BASE64URL(SHA256(verifier))`, no padding
    pub challenge: String,
    /// Independent 32 random bytes, echoed back by the authorization server
    pub state: String,
}

impl PkceSession {
    /// Generate a fresh verifier/challenge/state triple from the OS CSPRNG.
    ///
    /// A CSPRNG failure is surfaced as `Error::Rng` rather than papered over
    /// with a weaker source.
    pub fn generate() -> Result<Self> {
        let verifier = random_urlsafe()?;
        let challenge = compute_challenge(&verifier);
        let state = random_urlsafe()?;
        Ok(Self {
            verifier,
            challenge,
            state,
        })
    }
}

/// 32 random bytes encoded as URL-safe base64 without padding.
fn random_urlsafe() -> Result<String> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| Error::Rng(e.to_string()))?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// Compute the S256 code challenge from a verifier.
pub fn compute_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

/// Build the full authorization URL with all required OAuth parameters.
pub fn build_authorization_url(client_id: &str, session: &PkceSession) -> String {
    format!(
        "{}?response_type=code&client_id={}&redirect_uri={}&scope={}&code_challenge={}&code_challenge_method=S256&state={}",
        AUTHORIZE_ENDPOINT,
        client_id,
        urlencoded(REDIRECT_URI),
        urlencoded(SCOPES),
        session.challenge,
        session.state,
    )
}

/// Minimal URL encoding for parameter values.
/// Only encodes characters that would break URL parameter parsing.
fn urlencoded(s: &str) -> String {
    s.replace(' ', "%20")
        .replace(':', "%3A")
        .replace('/', "%2F")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::DEFAULT_CLIENT_ID;

    #[test]
    fn verifier_is_43_urlsafe_chars() {
        let session = PkceSession::generate().unwrap();
        // 32 bytes of entropy encode to 43 base64url chars without padding
        assert_eq!(session.verifier.len(), 43);
        assert!(
            session
                .verifier
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'),
            "verifier must be URL-safe base64: {}",
            session.verifier
        );
    }

    #[test]
    fn state_is_independent_of_verifier() {
        let session = PkceSession::generate().unwrap();
        assert_eq!(session.state.len(), 43);
        assert_ne!(session.state, session.verifier);
    }

    #[test]
    fn sessions_do_not_collide() {
        let a = PkceSession::generate().unwrap();
        let b = PkceSession::generate().unwrap();
        assert_ne!(a.verifier, b.verifier);
        assert_ne!(a.state, b.state);
    }

    #[test]
    fn challenge_is_deterministic() {
        assert_eq!(
            compute_challenge("test-verifier-value"),
            compute_challenge("test-verifier-value"),
        );
    }

    #[test]
    fn challenge_matches_known_value() {
        // SHA256("hello") = 2cf24dba...; base64url of those 32 bytes below
        assert_eq!(
            compute_challenge("hello"),
            "LPJNul-wow4m6DsqxbninhsWHlwfp0JecwQzYpOLmCQ"
        );
    }

    #[test]
    fn challenge_decodes_to_32_bytes() {
        use base64::Engine;
        let session = PkceSession::generate().unwrap();
        let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(&session.challenge)
            .expect("valid base64url");
        assert_eq!(decoded.len(), 32, "SHA-256 digest must be 32 bytes");
    }

    #[test]
    fn authorization_url_contains_required_params() {
        let session = PkceSession::generate().unwrap();
        let url = build_authorization_url(DEFAULT_CLIENT_ID, &session);

        assert!(url.starts_with(AUTHORIZE_ENDPOINT));
        assert!(url.contains("response_type=code"));
        assert!(url.contains(&format!("client_id={DEFAULT_CLIENT_ID}")));
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.contains(&format!("code_challenge={}", session.challenge)));
        assert!(url.contains(&format!("state={}", session.state)));
        assert!(url.contains("scope="));
        assert!(url.contains("redirect_uri="));
    }
}
