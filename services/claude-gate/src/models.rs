//! Static model listing
//!
//! Anthropic's own `/v1/models` rejects OAuth bearer tokens, so the
//! gateway serves a fixed OpenAI-shaped list of the OAuth-accessible
//! models instead. `created` values are the model release dates; the
//! permission stanza's `created` is stamped at request time.

use claude_auth::unix_now;
use serde_json::{Value, json};

/// The OAuth-accessible model set with release-date timestamps.
const MODELS: &[(&str, u64)] = &[
    ("claude-opus-4-20250514", 1747353600),
    ("claude-sonnet-4-20250514", 1747353600),
    ("claude-3-7-sonnet-20250219", 1740009600),
    ("claude-3-5-sonnet-20241022", 1729555200),
    ("claude-3-5-sonnet-20240620", 1718841600),
    ("claude-3-5-haiku-20241022", 1729555200),
    ("claude-3-opus-20240229", 1709251200),
    ("claude-3-sonnet-20240229", 1709251200),
    ("claude-3-haiku-20240307", 1709769600),
];

/// Full `{object: "list", data: [...]}` document.
pub fn listing() -> Value {
    let data: Vec<Value> = MODELS.iter().map(|(id, created)| model(id, *created)).collect();
    json!({
        "object": "list",
        "data": data,
    })
}

fn model(id: &str, created: u64) -> Value {
    json!({
        "id": id,
        "object": "model",
        "created": created,
        "owned_by": "anthropic",
        "permission": [{
            "allow_create_engine": false,
            "allow_fine_tuning": false,
            "allow_logprobs": false,
            "allow_sampling": true,
            "allow_search_indices": false,
            "allow_view": true,
            "created": unix_now(),
            "group": null,
            "id": format!("modelperm-{id}"),
            "is_blocking": false,
            "object": "model_permission",
            "organization": "*",
        }],
    })
}
