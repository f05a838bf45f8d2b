//! Login and logout commands
//!
//! Login walks the PKCE flow without a local listener: the authorization
//! page displays a `code#state` string that the user pastes back. The
//! state half is checked against the value we generated before the code
//! is exchanged.

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, bail};
use claude_auth::{
    DEFAULT_PROVIDER_KEY, OAuthClient, PkceSession, TokenStore, build_authorization_url,
};
use tracing::info;

use crate::config::Config;

pub async fn run_login(config: &Config, store: Arc<dyn TokenStore>) -> anyhow::Result<()> {
    let session = PkceSession::generate().context("generating PKCE material")?;
    let url = build_authorization_url(&config.client_id, &session);

    println!("Open this URL in your browser and authorize access:\n");
    println!("  {url}\n");
    print!("Paste the code shown after authorizing: ");
    std::io::stdout().flush()?;

    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    let pasted = line.trim();
    if pasted.is_empty() {
        bail!("no authorization code provided");
    }

    // The callback page renders the code as `code#state`.
    let (code, returned_state) = pasted.split_once('#').unwrap_or((pasted, ""));
    if !returned_state.is_empty() && returned_state != session.state {
        bail!("state mismatch in pasted code; restart the login");
    }

    let client = OAuthClient::new(config.client_id.clone());
    let record = client
        .exchange_code(code, &session.verifier)
        .await
        .context("exchanging authorization code")?;

    // Hold the cross-process lock across the write in case another gateway
    // instance is refreshing against the same storage file.
    store.lock().await?;
    let outcome = store.set(DEFAULT_PROVIDER_KEY, record).await;
    store.unlock().await?;
    outcome.context("persisting credentials")?;

    info!(key = DEFAULT_PROVIDER_KEY, "credentials stored");
    println!("Login successful. Start the gateway with `claude-gate serve`.");
    Ok(())
}

pub async fn run_logout(store: Arc<dyn TokenStore>) -> anyhow::Result<()> {
    store
        .delete(DEFAULT_PROVIDER_KEY)
        .await
        .context("removing credentials")?;
    println!("Logged out; stored credentials removed.");
    Ok(())
}
