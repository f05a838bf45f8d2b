//! Outbound request rewriting
//!
//! Turns an inbound client request into the exact shape the upstream API
//! expects under OAuth billing: bearer authorization, the anthropic
//! version/beta header pair, no client-supplied credentials, no hop-by-hop
//! headers, and a `system` prompt whose first element is the fixed
//! identity marker. Upstream keys OAuth billing on that marker, so it is
//! prepended to whatever the client sent rather than replacing it.

use axum::http::header::{AUTHORIZATION, HeaderName};
use axum::http::{HeaderMap, HeaderValue};
use claude_auth::IDENTITY_PROMPT;
use claude_provider::AuthorizationContext;
use serde_json::{Value, json};

/// Canonical messages path on the upstream API.
pub const MESSAGES_PATH: &str = "/v1/messages";

/// OpenAI-compatible alias accepted from clients.
const OPENAI_CHAT_PATH: &str = "/v1/chat/completions";

/// Hop-by-hop headers per RFC 9110; never forwarded by an intermediary.
/// The `proxy-` prefix family is matched separately.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Inbound headers that must not reach upstream even though they are
/// end-to-end: client credentials (replaced), framing (recomputed), and
/// the host of the proxy itself.
const DROPPED_REQUEST_HEADERS: &[&str] = &["host", "content-length", "x-api-key", "authorization"];

pub const ANTHROPIC_VERSION_HEADER: &str = "anthropic-version";
pub const ANTHROPIC_BETA_HEADER: &str = "anthropic-beta";

/// Whether a header is hop-by-hop and must be stripped in both directions.
pub fn is_hop_by_hop(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.starts_with("proxy-") || HOP_BY_HOP_HEADERS.contains(&lower.as_str())
}

/// Map the OpenAI-compatible URL form onto the upstream path. Everything
/// else forwards verbatim.
pub fn normalize_path(path: &str) -> &str {
    if path == OPENAI_CHAT_PATH {
        MESSAGES_PATH
    } else {
        path
    }
}

/// Build the outbound header map: copy safe inbound headers, then set the
/// bearer authorization and the anthropic header pair from the context,
/// overriding anything the client supplied.
pub fn outbound_headers(
    inbound: &HeaderMap,
    ctx: &AuthorizationContext,
) -> Result<HeaderMap, String> {
    let mut headers = HeaderMap::new();
    for (name, value) in inbound {
        let lower = name.as_str();
        if is_hop_by_hop(lower)
            || DROPPED_REQUEST_HEADERS.contains(&lower)
            || lower == ANTHROPIC_VERSION_HEADER
            || lower == ANTHROPIC_BETA_HEADER
        {
            continue;
        }
        headers.insert(name.clone(), value.clone());
    }

    let bearer = format!("Bearer {}", ctx.access_token.expose());
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&bearer).map_err(|e| format!("access token not header-safe: {e}"))?,
    );
    headers.insert(
        HeaderName::from_static(ANTHROPIC_VERSION_HEADER),
        HeaderValue::from_str(&ctx.anthropic_version)
            .map_err(|e| format!("anthropic-version not header-safe: {e}"))?,
    );
    headers.insert(
        HeaderName::from_static(ANTHROPIC_BETA_HEADER),
        HeaderValue::from_str(&ctx.anthropic_beta)
            .map_err(|e| format!("anthropic-beta not header-safe: {e}"))?,
    );
    Ok(headers)
}

/// Rewrite a messages request body so the `system` field starts with the
/// identity prompt.
///
/// Returns the rewritten bytes, or `None` when the body is not JSON (or
/// the `system` field has an unexpected shape), in which case the caller
/// forwards the original bytes untouched.
pub fn inject_identity_prompt(body: &[u8]) -> Option<Vec<u8>> {
    let mut root: Value = serde_json::from_slice(body).ok()?;
    let obj = root.as_object_mut()?;
    let identity = json!({"type": "text", "text": IDENTITY_PROMPT});

    match obj.get_mut("system") {
        None => {
            obj.insert("system".into(), json!([identity]));
        }
        Some(Value::String(prompt)) => {
            let client_prompt = std::mem::take(prompt);
            obj.insert(
                "system".into(),
                json!([identity, {"type": "text", "text": client_prompt}]),
            );
        }
        Some(Value::Array(items)) => {
            let already_present = items
                .first()
                .and_then(|entry| entry.get("text"))
                .and_then(Value::as_str)
                == Some(IDENTITY_PROMPT);
            if !already_present {
                items.insert(0, identity);
            }
        }
        Some(_) => return None,
    }

    serde_json::to_vec(&root).ok()
}
