//! Hermes Proxy - MITM HTTP/HTTPS interception.
//!
//! This crate runs the proxy listener and everything that talks to the network.
//!
//! ## Features
//!
//! - Generates a root CA on first run and issues per-host leaves on demand
//! - Decrypts `CONNECT` tunnels and serves them as HTTPS
//! - Applies the first matching rule (delay, header override, close)
//! - Streams responses to the client while capturing them
//! - Replays stored entries with overrides
//! - Imports and exports HAR archives
//!
//! ## Architecture
//!
//! ```text
//! Client ─▶ listener ─┬─ CONNECT ─▶ 200 ─▶ TLS (leaf for SNI) ─┐
//!                     └─ plain HTTP ───────────────────────────┴▶ intercept ─▶ upstream
//!                                                                    │
//!                                                        ProxyState (history, rules, events)
//! ```

use std::path::PathBuf;

use directories::ProjectDirs;

mod authority;
mod ca;
mod capture;
mod controller;
mod error;
mod handler;
mod proxy;
mod replay;
mod state;
mod upstream;

#[cfg(test)]
mod test_support;

pub use authority::CertificateAuthority;
pub use ca::{export_der, read_common_name, CaManager, CA_COMMON_NAME};
pub use capture::{BoxError, CaptureBody, CaptureOutcome};
pub use controller::{ImportSummary, ProxyController};
pub use error::{CaManagerError, ProxyError, Result};
pub use handler::{intercept, ConnectionContext, ProxyBody};
pub use proxy::{bind_with_retry, ProxyConfig, ProxyHandle, ProxyServer, DEFAULT_HOST};
pub use replay::{replay, ReplayOverrides};
pub use state::{ProxyEvent, ProxyState};
pub use upstream::{Upstream, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT};

/// Default data directory holding `ca/`, `rules.json` and `logs/`.
pub fn default_data_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "hermes", "Hermes").map(|dirs| dirs.data_dir().to_path_buf())
}
