//! Fetch configuration.
//!
//! Defaults reproduce the device build: one fixed host and path, a pinned
//! USERTrust RSA root and 100 ms polling everywhere. A JSON file may override
//! any field; missing fields keep their default.

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::FetchError;
use crate::http::HttpRequest;

/// Trust anchor compiled into the binary.
pub const DEFAULT_TRUST_ANCHOR: &str = include_str!("../certs/usertrust_rsa_root.pem");

pub const DEFAULT_HOSTNAME: &str = "username.github.io";
pub const DEFAULT_PATH: &str = "/anki-csv-decks/cards.csv";
pub const HTTPS_PORT: u16 = 443;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Name to resolve, send as `Host` and verify the certificate against.
    pub hostname: String,
    pub port: u16,
    pub path: String,
    pub resolve_poll_ms: u64,
    pub connect_poll_ms: u64,
    pub response_poll_ms: u64,
    /// Idle callback period in 500 ms ticks.
    pub idle_poll_shots: u8,
    /// Inline PEM trust anchor. Takes precedence over `trust_anchor_path`.
    pub trust_anchor_pem: Option<String>,
    /// PEM or DER trust anchor on disk.
    pub trust_anchor_path: Option<PathBuf>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            hostname: DEFAULT_HOSTNAME.to_string(),
            port: HTTPS_PORT,
            path: DEFAULT_PATH.to_string(),
            resolve_poll_ms: 100,
            connect_poll_ms: 100,
            response_poll_ms: 100,
            idle_poll_shots: 2,
            trust_anchor_pem: None,
            trust_anchor_path: None,
        }
    }
}

impl FetchConfig {
    /// Load configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, FetchError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&content)
    }

    pub fn from_json(json: &str) -> Result<Self, FetchError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Apply `PICOFETCH_HOST`, `PICOFETCH_PORT` and `PICOFETCH_PATH`.
    /// Unparseable ports are ignored.
    pub fn apply_env(mut self) -> Self {
        if let Ok(host) = std::env::var("PICOFETCH_HOST") {
            self.hostname = host;
        }
        if let Some(port) = std::env::var("PICOFETCH_PORT").ok().and_then(|p| p.parse().ok()) {
            self.port = port;
        }
        if let Ok(path) = std::env::var("PICOFETCH_PATH") {
            self.path = path;
        }
        self
    }

    pub fn resolve_interval(&self) -> Duration {
        Duration::from_millis(self.resolve_poll_ms)
    }

    pub fn connect_interval(&self) -> Duration {
        Duration::from_millis(self.connect_poll_ms)
    }

    pub fn response_interval(&self) -> Duration {
        Duration::from_millis(self.response_poll_ms)
    }

    pub fn request(&self) -> HttpRequest {
        HttpRequest::fixed(&self.hostname, &self.path)
    }

    /// Trust anchor bytes: inline PEM, then file, then the embedded root.
    pub fn trust_anchor(&self) -> Result<Cow<'_, [u8]>, FetchError> {
        if let Some(pem) = &self.trust_anchor_pem {
            return Ok(Cow::Borrowed(pem.as_bytes()));
        }
        if let Some(path) = &self.trust_anchor_path {
            return Ok(Cow::Owned(std::fs::read(path)?));
        }
        Ok(Cow::Borrowed(DEFAULT_TRUST_ANCHOR.as_bytes()))
    }
}
