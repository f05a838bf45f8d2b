//! Configuration types and loading
//!
//! Precedence: environment variables > config file > defaults. The config
//! file is optional; a gateway run with no file and no env vars listens on
//! loopback and stores credentials in the user config directory.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Default listen address.
const DEFAULT_BIND_ADDR: &str = "127.0.0.1:5789";

/// Default upstream API host.
const DEFAULT_UPSTREAM_BASE: &str = "https://api.anthropic.com";

/// Default expiry skew in seconds.
const DEFAULT_REFRESH_SKEW_SECS: u64 = 60;

/// Which credential backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    File,
    Keychain,
}

/// Resolved gateway configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub upstream_base: String,
    pub storage_backend: StorageBackend,
    pub storage_path: PathBuf,
    pub client_id: String,
    pub refresh_skew: Duration,
}

/// Raw shape of the optional TOML config file. Every field is optional;
/// omitted values fall back to env vars and then defaults.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    bind_addr: Option<SocketAddr>,
    upstream_base: Option<String>,
    storage_backend: Option<StorageBackend>,
    storage_path: Option<PathBuf>,
    client_id: Option<String>,
    refresh_skew_seconds: Option<u64>,
}

impl Config {
    /// Resolve the config file path from the CLI arg or `CONFIG_PATH`.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("claude-gate.toml")
    }

    /// Load configuration from the given file (missing file means pure
    /// defaults), apply env var overrides, then validate.
    pub fn load(path: &Path) -> common::Result<Self> {
        let file: FileConfig = if path.exists() {
            toml::from_str(&std::fs::read_to_string(path)?)?
        } else {
            FileConfig::default()
        };
        Self::from_sources(file, |key| std::env::var(key).ok())
    }

    /// Default credential file location: user config dir + `claude-gate/auth.json`.
    pub fn default_storage_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("claude-gate")
            .join("auth.json")
    }

    fn from_sources(
        file: FileConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> common::Result<Self> {
        let bind_addr = match env("BIND_ADDR") {
            Some(raw) => raw
                .parse()
                .map_err(|e| common::Error::Config(format!("BIND_ADDR {raw:?}: {e}")))?,
            None => file.bind_addr.unwrap_or_else(|| {
                DEFAULT_BIND_ADDR.parse().expect("default bind addr parses")
            }),
        };

        let upstream_base = env("UPSTREAM_BASE")
            .or(file.upstream_base)
            .unwrap_or_else(|| DEFAULT_UPSTREAM_BASE.to_string());
        validate_upstream(&upstream_base)?;

        let storage_backend = match env("STORAGE_BACKEND").as_deref() {
            Some("file") => StorageBackend::File,
            Some("keychain") => StorageBackend::Keychain,
            Some(other) => {
                return Err(common::Error::Config(format!(
                    "STORAGE_BACKEND must be 'file' or 'keychain', got {other:?}"
                )));
            }
            None => file.storage_backend.unwrap_or(StorageBackend::File),
        };

        let storage_path = env("STORAGE_PATH")
            .map(PathBuf::from)
            .or(file.storage_path)
            .unwrap_or_else(Self::default_storage_path);

        let client_id = env("CLIENT_ID")
            .or(file.client_id)
            .unwrap_or_else(|| claude_auth::DEFAULT_CLIENT_ID.to_string());

        let skew_secs = match env("REFRESH_SKEW_SECONDS") {
            Some(raw) => raw.parse().map_err(|e| {
                common::Error::Config(format!("REFRESH_SKEW_SECONDS {raw:?}: {e}"))
            })?,
            None => file
                .refresh_skew_seconds
                .unwrap_or(DEFAULT_REFRESH_SKEW_SECS),
        };
        if skew_secs == 0 {
            return Err(common::Error::Config(
                "refresh_skew_seconds must be greater than 0".into(),
            ));
        }

        Ok(Self {
            bind_addr,
            upstream_base,
            storage_backend,
            storage_path,
            client_id,
            refresh_skew: Duration::from_secs(skew_secs),
        })
    }
}

/// The upstream must be a parseable http(s) URL. Catches malformed values
/// at startup rather than on the first proxied request.
fn validate_upstream(upstream: &str) -> common::Result<()> {
    let url = reqwest::Url::parse(upstream)
        .map_err(|e| common::Error::Config(format!("upstream base is not a valid URL: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(common::Error::Config(format!(
            "upstream base must use http or https scheme, got: {scheme}"
        ))),
    }
}
