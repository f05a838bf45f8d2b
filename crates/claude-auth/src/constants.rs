//! Anthropic OAuth constants
//!
//! Public OAuth client configuration matching the Claude CLI. These values
//! are not secrets. The actual secrets (access/refresh tokens) live in the
//! token store.

/// Anthropic's public OAuth client ID (same as Claude CLI).
/// Overridable at runtime through the `CLIENT_ID` environment variable.
pub const DEFAULT_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";

/// OAuth redirect URI (Anthropic's hosted callback page). The user copies
/// the displayed code back into the CLI, so no local listener is needed.
pub const REDIRECT_URI: &str = "https://console.anthropic.com/oauth/code/callback";

/// Token endpoint for code exchange and token refresh
pub const TOKEN_ENDPOINT: &str = "https://console.anthropic.com/v1/oauth/token";

/// Authorization endpoint for Pro/Max subscriptions (claude.ai, not console)
pub const AUTHORIZE_ENDPOINT: &str = "https://claude.ai/oauth/authorize";

/// OAuth scopes required for inference access.
pub const SCOPES: &str = "user:profile user:inference";

/// Default provider key under which the credential is stored.
pub const DEFAULT_PROVIDER_KEY: &str = "anthropic";

/// `anthropic-version` header value sent on every upstream request.
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// `anthropic-beta` header value that enables OAuth bearer auth upstream.
pub const OAUTH_BETA_HEADER: &str = "oauth-2025-04-20";

/// Required system prompt prefix for OAuth-billed access. Anthropic matches
/// this exact string; it must never be templated or reworded.
pub const IDENTITY_PROMPT: &str = "You are Claude Code, Anthropic's official CLI for Claude.";
