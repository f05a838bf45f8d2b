//! Shared types for the claude-gate workspace
//!
//! Holds the configuration error type used by the gateway binary and the
//! `Secret` wrapper that keeps access tokens out of Debug output and logs.

pub mod error;
pub mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
