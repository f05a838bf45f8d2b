//! Cached token provider with single-flight refresh
//!
//! The cache fast path is a read lock and a clone. When a token is stale,
//! callers funnel through a per-key gate: one of them performs the refresh
//! while the rest wait, then find the fresh record in the cache. The gate
//! is acquired without holding the cache lock, so cache readers for other
//! keys are never blocked by a slow refresh.
//!
//! The refresh itself runs on a detached task that owns the gate guard. A
//! caller that disappears mid-refresh (client disconnect) therefore does
//! not abort the refresh the remaining waiters depend on; the refresh dies
//! only with the process.
//!
//! Inside the gate the record is re-read from the store before refreshing,
//! because another process sharing the storage file may have refreshed it
//! already.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use claude_auth::constants::{ANTHROPIC_VERSION, OAUTH_BETA_HEADER};
use claude_auth::{OAuthClient, TokenRecord, TokenResponse, TokenStore, unix_now};
use common::Secret;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::AuthError;

/// Tokens are treated as expired this long before their actual expiry.
pub const DEFAULT_REFRESH_SKEW: Duration = Duration::from_secs(60);

/// Pause before the single retry of a transport-failed refresh.
const TRANSPORT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Injectable wall clock returning unix seconds.
pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Per-request authorization bundle consumed by the request transformer.
#[derive(Debug, Clone)]
pub struct AuthorizationContext {
    pub access_token: Secret<String>,
    pub anthropic_version: String,
    pub anthropic_beta: String,
}

impl AuthorizationContext {
    pub fn new(access_token: String) -> Self {
        Self {
            access_token: access_token.into(),
            anthropic_version: ANTHROPIC_VERSION.into(),
            anthropic_beta: OAUTH_BETA_HEADER.into(),
        }
    }
}

/// Seam over the refresh call so tests can count invocations and inject
/// failures without a network.
#[async_trait]
pub trait RefreshClient: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> claude_auth::Result<TokenResponse>;
}

#[async_trait]
impl RefreshClient for OAuthClient {
    async fn refresh(&self, refresh_token: &str) -> claude_auth::Result<TokenResponse> {
        self.refresh_access_token(refresh_token).await
    }
}

/// Token cache and refresh coordinator over a store and an OAuth client.
#[derive(Clone)]
pub struct TokenProvider {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn TokenStore>,
    client: Arc<dyn RefreshClient>,
    skew_secs: u64,
    clock: Clock,
    cache: RwLock<HashMap<String, TokenRecord>>,
    /// One gate per key. Entries are never pruned: keys are provider
    /// names, a handful per process, and the gates are reused.
    gates: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TokenProvider {
    pub fn new(store: Arc<dyn TokenStore>, client: Arc<dyn RefreshClient>) -> Self {
        Self::with_options(store, client, DEFAULT_REFRESH_SKEW, Arc::new(unix_now))
    }

    /// Full constructor: custom skew (`REFRESH_SKEW_SECONDS`) and clock.
    pub fn with_options(
        store: Arc<dyn TokenStore>,
        client: Arc<dyn RefreshClient>,
        skew: Duration,
        clock: Clock,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                client,
                skew_secs: skew.as_secs(),
                clock,
                cache: RwLock::new(HashMap::new()),
                gates: StdMutex::new(HashMap::new()),
            }),
        }
    }

    /// Resolve the authorization bundle for one proxied request.
    pub async fn authorization_context(&self, key: &str) -> Result<AuthorizationContext, AuthError> {
        Ok(AuthorizationContext::new(self.access_token(key).await?))
    }

    /// Return a usable token for `key`, refreshing if necessary.
    ///
    /// API-key records pass through verbatim. OAuth records are served
    /// from cache while `now + skew < expires_at`; otherwise exactly one
    /// caller refreshes and the rest reuse its result.
    pub async fn access_token(&self, key: &str) -> Result<String, AuthError> {
        if let Some(token) = self.inner.cached(key).await {
            return Ok(token);
        }

        let gate = self.inner.gate(key);
        let flight = gate.lock_owned().await;

        // Whoever held the gate before us may have refreshed already.
        if let Some(token) = self.inner.cached(key).await {
            return Ok(token);
        }

        // Detach the refresh from this caller: if the request that won the
        // gate is cancelled, the waiters behind it still get the result.
        let inner = self.inner.clone();
        let key = key.to_string();
        let refresh = tokio::spawn(async move {
            let _flight = flight;
            inner.refresh_locked(&key).await
        });
        match refresh.await {
            Ok(result) => result,
            Err(join_error) => Err(AuthError::Upstream(format!(
                "refresh task failed: {join_error}"
            ))),
        }
    }
}

impl Inner {
    /// Store re-read, refresh, persist, cache update. Runs with the
    /// single-flight gate held.
    async fn refresh_locked(&self, key: &str) -> Result<String, AuthError> {
        let Some(record) = self.store.get(key).await? else {
            self.cache.write().await.remove(key);
            return Err(AuthError::LoginRequired);
        };
        if let Some(token) = self.usable_token(&record) {
            self.cache.write().await.insert(key.to_string(), record);
            return Ok(token);
        }

        let refresh_token = match &record {
            TokenRecord::Oauth { refresh_token, .. } => refresh_token.clone(),
            // Unreachable in practice: API keys are always usable above.
            TokenRecord::ApiKey { key: api_key } => return Ok(api_key.clone()),
        };

        match self.refresh_with_retry(&refresh_token).await {
            Ok(response) => {
                let access = response.access_token.clone();
                let merged = TokenRecord::Oauth {
                    access_token: response.access_token,
                    // A refresh response may omit the refresh token; the
                    // previous one stays valid in that case.
                    refresh_token: response.refresh_token.unwrap_or(refresh_token),
                    expires_at: (self.clock)() + response.expires_in,
                };
                self.store.set(key, merged.clone()).await?;
                self.cache.write().await.insert(key.to_string(), merged);
                info!(key, "access token refreshed");
                Ok(access)
            }
            Err(claude_auth::Error::InvalidGrant(reason)) => {
                warn!(key, %reason, "refresh token rejected, clearing credential");
                self.store.delete(key).await?;
                self.cache.write().await.remove(key);
                Err(AuthError::LoginRequired)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn cached(&self, key: &str) -> Option<String> {
        let cache = self.cache.read().await;
        cache.get(key).and_then(|record| self.usable_token(record))
    }

    fn usable_token(&self, record: &TokenRecord) -> Option<String> {
        match record {
            TokenRecord::ApiKey { key } => Some(key.clone()),
            TokenRecord::Oauth { access_token, .. }
                if !record.is_expired((self.clock)(), self.skew_secs) =>
            {
                Some(access_token.clone())
            }
            _ => None,
        }
    }

    /// One transport failure earns one retry after a short pause; every
    /// other failure surfaces immediately.
    async fn refresh_with_retry(&self, refresh_token: &str) -> claude_auth::Result<TokenResponse> {
        match self.client.refresh(refresh_token).await {
            Err(claude_auth::Error::Transport(reason)) => {
                debug!(%reason, "refresh transport failure, retrying once");
                tokio::time::sleep(TRANSPORT_RETRY_DELAY).await;
                self.client.refresh(refresh_token).await
            }
            other => other,
        }
    }

    fn gate(&self, key: &str) -> Arc<Mutex<()>> {
        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        gates.entry(key.to_string()).or_default().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claude_auth::{MemoryStore, StoreError};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    /// Scripted refresh client: pops queued results, counting every call.
    /// An empty queue yields a standard successful rotation.
    struct ScriptedRefresh {
        calls: AtomicUsize,
        script: Mutex<VecDeque<claude_auth::Result<TokenResponse>>>,
        delay: Duration,
    }

    impl ScriptedRefresh {
        fn new() -> Arc<Self> {
            Self::with_delay(Duration::ZERO)
        }

        fn with_delay(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                script: Mutex::new(VecDeque::new()),
                delay,
            })
        }

        async fn push(&self, result: claude_auth::Result<TokenResponse>) {
            self.script.lock().await.push_back(result);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn ok_response(access: &str, refresh: Option<&str>, expires_in: u64) -> TokenResponse {
        TokenResponse {
            access_token: access.into(),
            refresh_token: refresh.map(String::from),
            expires_in,
        }
    }

    #[async_trait]
    impl RefreshClient for ScriptedRefresh {
        async fn refresh(&self, _refresh_token: &str) -> claude_auth::Result<TokenResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match self.script.lock().await.pop_front() {
                Some(result) => result,
                None => Ok(ok_response("at_new", Some("rt_new"), 3600)),
            }
        }
    }

    fn expired_record() -> TokenRecord {
        TokenRecord::Oauth {
            access_token: "at_old".into(),
            refresh_token: "rt_old".into(),
            expires_at: 1,
        }
    }

    fn fresh_record() -> TokenRecord {
        TokenRecord::Oauth {
            access_token: "at_fresh".into(),
            refresh_token: "rt_fresh".into(),
            expires_at: unix_now() + 7200,
        }
    }

    async fn store_with(record: TokenRecord) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.set("anthropic", record).await.unwrap();
        store
    }

    #[tokio::test]
    async fn fresh_cached_token_needs_no_refresh() {
        let store = store_with(fresh_record()).await;
        let client = ScriptedRefresh::new();
        let provider = TokenProvider::new(store, client.clone());

        // First call loads from the store, second hits the cache
        assert_eq!(provider.access_token("anthropic").await.unwrap(), "at_fresh");
        assert_eq!(provider.access_token("anthropic").await.unwrap(), "at_fresh");
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test]
    async fn api_key_records_pass_through() {
        let store = store_with(TokenRecord::ApiKey {
            key: "sk-ant-api03-xyz".into(),
        })
        .await;
        let client = ScriptedRefresh::new();
        let provider = TokenProvider::new(store, client.clone());

        assert_eq!(
            provider.access_token("anthropic").await.unwrap(),
            "sk-ant-api03-xyz"
        );
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test]
    async fn expired_record_is_refreshed_and_persisted() {
        let store = store_with(expired_record()).await;
        let client = ScriptedRefresh::new();
        let provider = TokenProvider::new(store.clone(), client.clone());

        assert_eq!(provider.access_token("anthropic").await.unwrap(), "at_new");
        assert_eq!(client.calls(), 1);

        let stored = store.get("anthropic").await.unwrap().unwrap();
        let TokenRecord::Oauth {
            access_token,
            refresh_token,
            expires_at,
        } = stored
        else {
            panic!("refresh must persist an oauth record");
        };
        assert_eq!(access_token, "at_new");
        assert_eq!(refresh_token, "rt_new");
        assert!(expires_at > unix_now() + 3000);
    }

    #[tokio::test]
    async fn empty_access_token_forces_refresh() {
        let store = store_with(TokenRecord::Oauth {
            access_token: String::new(),
            refresh_token: "rt_old".into(),
            expires_at: unix_now() + 7200,
        })
        .await;
        let client = ScriptedRefresh::new();
        let provider = TokenProvider::new(store, client.clone());

        assert_eq!(provider.access_token("anthropic").await.unwrap(), "at_new");
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let store = store_with(expired_record()).await;
        // A slow refresh so every task piles up on the gate
        let client = ScriptedRefresh::with_delay(Duration::from_millis(50));
        let provider = TokenProvider::new(store, client.clone());

        let mut handles = vec![];
        for _ in 0..32 {
            let provider = provider.clone();
            handles.push(tokio::spawn(async move {
                provider.access_token("anthropic").await.unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), "at_new");
        }
        assert_eq!(client.calls(), 1, "refresh must fire exactly once");
    }

    #[tokio::test]
    async fn cancelled_winner_does_not_abort_the_refresh() {
        let store = store_with(expired_record()).await;
        let client = ScriptedRefresh::with_delay(Duration::from_millis(80));
        let provider = TokenProvider::new(store, client.clone());

        // First caller wins the gate, then is aborted mid-refresh
        let winner = {
            let provider = provider.clone();
            tokio::spawn(async move { provider.access_token("anthropic").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        winner.abort();
        let _ = winner.await;

        // The detached refresh completes and later callers reuse it
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(provider.access_token("anthropic").await.unwrap(), "at_new");
        assert_eq!(
            client.calls(),
            1,
            "the aborted caller's refresh must complete, not rerun"
        );
    }

    #[tokio::test]
    async fn subsequent_calls_within_lifetime_are_cache_hits() {
        let store = store_with(expired_record()).await;
        let client = ScriptedRefresh::new();
        let provider = TokenProvider::new(store, client.clone());

        provider.access_token("anthropic").await.unwrap();
        for _ in 0..10 {
            assert_eq!(provider.access_token("anthropic").await.unwrap(), "at_new");
        }
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn omitted_refresh_token_preserves_the_old_one() {
        let store = store_with(expired_record()).await;
        let client = ScriptedRefresh::new();
        client.push(Ok(ok_response("at_new", None, 3600))).await;
        let provider = TokenProvider::new(store.clone(), client);

        provider.access_token("anthropic").await.unwrap();

        let stored = store.get("anthropic").await.unwrap().unwrap();
        let TokenRecord::Oauth { refresh_token, .. } = stored else {
            panic!("expected oauth record");
        };
        assert_eq!(refresh_token, "rt_old", "prior refresh token must survive");
    }

    #[tokio::test]
    async fn invalid_grant_purges_the_record() {
        let store = store_with(expired_record()).await;
        let client = ScriptedRefresh::new();
        client
            .push(Err(claude_auth::Error::InvalidGrant("revoked".into())))
            .await;
        let provider = TokenProvider::new(store.clone(), client.clone());

        let err = provider.access_token("anthropic").await.unwrap_err();
        assert!(matches!(err, AuthError::LoginRequired), "got: {err:?}");
        assert!(store.get("anthropic").await.unwrap().is_none());

        // The next call sees the empty store, without another refresh
        let err = provider.access_token("anthropic").await.unwrap_err();
        assert!(matches!(err, AuthError::LoginRequired));
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn missing_record_means_login_required() {
        let provider = TokenProvider::new(Arc::new(MemoryStore::new()), ScriptedRefresh::new());
        let err = provider.access_token("anthropic").await.unwrap_err();
        assert!(matches!(err, AuthError::LoginRequired));
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_is_retried_once() {
        let store = store_with(expired_record()).await;
        let client = ScriptedRefresh::new();
        client
            .push(Err(claude_auth::Error::Transport("reset".into())))
            .await;
        let provider = TokenProvider::new(store, client.clone());

        assert_eq!(provider.access_token("anthropic").await.unwrap(), "at_new");
        assert_eq!(client.calls(), 2, "one failure, one successful retry");
    }

    #[tokio::test(start_paused = true)]
    async fn second_transport_failure_surfaces() {
        let store = store_with(expired_record()).await;
        let client = ScriptedRefresh::new();
        client
            .push(Err(claude_auth::Error::Transport("reset".into())))
            .await;
        client
            .push(Err(claude_auth::Error::Transport("reset again".into())))
            .await;
        let provider = TokenProvider::new(store, client.clone());

        let err = provider.access_token("anthropic").await.unwrap_err();
        assert!(matches!(err, AuthError::Transport(_)), "got: {err:?}");
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test]
    async fn upstream_failure_keeps_the_record() {
        let store = store_with(expired_record()).await;
        let client = ScriptedRefresh::new();
        client
            .push(Err(claude_auth::Error::Upstream {
                status: 503,
                body: "maintenance".into(),
            }))
            .await;
        let provider = TokenProvider::new(store.clone(), client);

        let err = provider.access_token("anthropic").await.unwrap_err();
        assert!(matches!(err, AuthError::Upstream(_)), "got: {err:?}");
        assert!(
            store.get("anthropic").await.unwrap().is_some(),
            "server-side failures must not destroy the credential"
        );
    }

    #[tokio::test]
    async fn storage_faults_propagate() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next(StoreError::Corrupt("junk".into())).await;
        let provider = TokenProvider::new(store, ScriptedRefresh::new());

        let err = provider.access_token("anthropic").await.unwrap_err();
        assert!(
            matches!(err, AuthError::Storage(StoreError::Corrupt(_))),
            "got: {err:?}"
        );
    }

    #[tokio::test]
    async fn refresh_fires_exactly_at_the_skew_boundary() {
        let store = store_with(TokenRecord::Oauth {
            access_token: "A".into(),
            refresh_token: "R".into(),
            expires_at: 4600,
        })
        .await;
        let client = ScriptedRefresh::new();
        let now = Arc::new(AtomicU64::new(4539));
        let clock = now.clone();
        let provider = TokenProvider::with_options(
            store,
            client.clone(),
            Duration::from_secs(60),
            Arc::new(move || clock.load(Ordering::SeqCst)),
        );

        // 4539 + 60 < 4600: still fresh
        assert_eq!(provider.access_token("anthropic").await.unwrap(), "A");
        assert_eq!(client.calls(), 0);

        // 4540 + 60 == 4600: expired, refresh fires
        now.store(4540, Ordering::SeqCst);
        assert_eq!(provider.access_token("anthropic").await.unwrap(), "at_new");
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn authorization_context_carries_defaults() {
        let store = store_with(fresh_record()).await;
        let provider = TokenProvider::new(store, ScriptedRefresh::new());

        let ctx = provider.authorization_context("anthropic").await.unwrap();
        assert_eq!(ctx.access_token.expose(), "at_fresh");
        assert_eq!(ctx.anthropic_version, "2023-06-01");
        assert_eq!(ctx.anthropic_beta, "oauth-2025-04-20");
        // Secrets must not leak through Debug
        assert!(!format!("{ctx:?}").contains("at_fresh"));
    }
}
