//! Access-token provisioning for the gateway
//!
//! Sits between the proxy and the credential machinery: holds a per-key
//! in-memory cache over the token store, refreshes expiring tokens through
//! the OAuth client, and collapses concurrent refreshes for one key into a
//! single upstream call. The proxy only ever asks for an
//! `AuthorizationContext`; everything else happens here.

pub mod error;
pub mod provider;

pub use error::AuthError;
pub use provider::{AuthorizationContext, Clock, RefreshClient, TokenProvider};
