//! Anthropic OAuth authentication and credential storage
//!
//! Implements the subscriber-login side of the gateway: PKCE flow
//! generation, authorization-code exchange, token refresh, and durable
//! storage of the resulting credentials. This crate has no dependency on
//! the proxy binary and can be tested and used on its own.
//!
//! Credential flow:
//! 1. `pkce::PkceSession::generate()` produces verifier, challenge, state
//! 2. User authorizes via `pkce::build_authorization_url()`
//! 3. `client::OAuthClient::exchange_code()` turns the pasted code into a
//!    `TokenRecord`
//! 4. The record is persisted through a `store::TokenStore` backend
//! 5. `client::OAuthClient::refresh_access_token()` renews it before expiry

pub mod client;
pub mod constants;
pub mod error;
pub mod pkce;
pub mod record;
pub mod store;

pub use client::{OAuthClient, TokenResponse};
pub use constants::*;
pub use error::{Error, Result};
pub use pkce::{PkceSession, build_authorization_url};
pub use record::{TokenRecord, unix_now};
pub use store::{FileStore, KeychainStore, MemoryStore, StoreError, TokenStore};
