//! Control surface for a running proxy.
//!
//! [`ProxyController`] owns the shared state, the upstream transport and the
//! server handle. Every host-facing operation (rules, history, replay, HAR,
//! CA export, events) goes through it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use hermes_core::{
    normalize_rule_values, read_har, save_rules, to_har, write_har, ProxyEntry, Rule,
};

use crate::error::{ProxyError, Result};
use crate::proxy::{ProxyConfig, ProxyHandle, ProxyServer};
use crate::replay::{replay, ReplayOverrides};
use crate::state::{ProxyEvent, ProxyState};
use crate::upstream::Upstream;

/// Entries added by a HAR import.
#[derive(Debug, Clone, Default)]
pub struct ImportSummary {
    /// Imported entries in archive order.
    pub entries: Vec<Arc<ProxyEntry>>,
    /// Archive entries that were skipped.
    pub skipped: usize,
}

/// Façade over a proxy instance.
pub struct ProxyController {
    config: ProxyConfig,
    state: Arc<ProxyState>,
    upstream: Arc<Upstream>,
    handle: Mutex<Option<ProxyHandle>>,
}

impl ProxyController {
    /// Creates a controller and loads the configured rules file.
    ///
    /// Nothing is bound until [`start`](Self::start). An unreadable rules file
    /// is logged and the proxy starts with no rules.
    pub fn new(config: ProxyConfig) -> Result<Self> {
        let upstream = Arc::new(config.upstream()?);
        let state = Arc::new(ProxyState::new(
            config.history_capacity,
            config.rules_path.clone(),
        ));

        match hermes_core::load_rules(&config.rules_path) {
            Ok(rules) => state.rules().replace(rules),
            Err(e) => tracing::warn!("Failed to load rules from {:?}: {}", config.rules_path, e),
        }

        Ok(Self {
            config,
            state,
            upstream,
            handle: Mutex::new(None),
        })
    }

    /// Prepares the CA and starts listening. Returns the bound port.
    pub async fn start(&self) -> Result<u16> {
        if let Some(handle) = self.handle.lock().as_ref() {
            return Ok(handle.port());
        }

        self.prepare_ca().await?;

        let server = ProxyServer::new(
            self.config.clone(),
            Arc::clone(&self.state),
            Arc::clone(&self.upstream),
        );
        let handle = server.start().await?;
        let port = handle.port();
        *self.handle.lock() = Some(handle);
        Ok(port)
    }

    /// Stops the listener if it is running.
    pub async fn shutdown(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            handle.stop().await;
            tracing::info!("Proxy stopped");
        }
    }

    /// Shared state, for embedding hosts.
    pub fn state(&self) -> &Arc<ProxyState> {
        &self.state
    }

    /// The bound port, if listening.
    pub fn port(&self) -> Option<u16> {
        self.state.port()
    }

    /// Waits until the listener is bound.
    pub async fn wait_port(&self) -> Option<u16> {
        self.state.wait_port().await
    }

    /// Subscribes to proxy events.
    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.state.subscribe()
    }

    // ---- CA ----

    pub fn ca_cert_path(&self) -> PathBuf {
        self.config.ca_manager.cert_path()
    }

    /// Loads or creates the CA and announces its certificate path.
    pub async fn prepare_ca(&self) -> Result<PathBuf> {
        self.config.ca_manager.authority().await?;
        let path = self.config.ca_manager.cert_path();
        self.state.emit(ProxyEvent::CaReady(path.clone()));
        Ok(path)
    }

    /// Writes the CA certificate in DER form to `dest`.
    pub async fn export_ca_der(&self, dest: &Path) -> Result<()> {
        self.config.ca_manager.authority().await?;
        self.config.ca_manager.export_der_to(dest)?;
        Ok(())
    }

    // ---- Rules ----

    pub fn rules(&self) -> Arc<Vec<Rule>> {
        self.state.rules().snapshot()
    }

    pub fn rules_path(&self) -> PathBuf {
        self.state.rules_path()
    }

    /// Normalizes and activates `rules`, persisting them to the rules file.
    pub fn set_rules(&self, rules: &[Rule]) -> Result<Arc<Vec<Rule>>> {
        let rules = normalize_rule_values(rules)?;
        save_rules(&self.state.rules_path(), &rules)?;
        self.state.replace_rules(rules);
        Ok(self.state.rules().snapshot())
    }

    /// Loads rules from `path` and makes it the current rules file.
    ///
    /// On failure the active rules are left untouched.
    pub fn load_rules(&self, path: &Path) -> Result<Arc<Vec<Rule>>> {
        if !path.exists() {
            return Err(ProxyError::NotFound(format!("rules file {:?}", path)));
        }
        let rules = hermes_core::load_rules(path)?;
        self.state.set_rules_path(path);
        self.state.replace_rules(rules);
        Ok(self.state.rules().snapshot())
    }

    /// Writes the active rules to `path`.
    pub fn save_rules(&self, path: &Path) -> Result<()> {
        save_rules(path, &self.state.rules().snapshot())?;
        Ok(())
    }

    // ---- History ----

    /// Entries, most recent first.
    pub fn history(&self) -> Vec<Arc<ProxyEntry>> {
        self.state.store().list()
    }

    pub fn entry(&self, id: &str) -> Option<Arc<ProxyEntry>> {
        self.state.store().get(id)
    }

    pub fn clear_history(&self) {
        self.state.clear_history();
    }

    /// Replays a stored entry and returns the new one.
    pub async fn replay(&self, id: &str, overrides: &ReplayOverrides) -> Result<Arc<ProxyEntry>> {
        let source = self
            .entry(id)
            .ok_or_else(|| ProxyError::NotFound(format!("entry {}", id)))?;
        replay(&self.state, &self.upstream, &source, overrides).await
    }

    // ---- HAR ----

    /// Exports one entry as a HAR document.
    pub fn export_entry_har(&self, id: &str, path: &Path) -> Result<()> {
        let entry = self
            .entry(id)
            .ok_or_else(|| ProxyError::NotFound(format!("entry {}", id)))?;
        write_har(path, &to_har([entry.as_ref()]))?;
        Ok(())
    }

    /// Exports the whole history, oldest first. Returns the entry count.
    pub fn export_all_har(&self, path: &Path) -> Result<usize> {
        let entries = self.state.store().list_oldest_first();
        if entries.is_empty() {
            return Err(ProxyError::NotFound("no entries to export".into()));
        }
        write_har(path, &to_har(entries.iter().map(Arc::as_ref)))?;
        Ok(entries.len())
    }

    /// Imports a HAR file, storing and broadcasting each entry.
    pub fn import_har(&self, path: &Path) -> Result<ImportSummary> {
        let import = read_har(path)?;
        let entries: Vec<_> = import
            .entries
            .into_iter()
            .map(|entry| self.state.record(entry))
            .collect();
        tracing::info!(
            "Imported {} entries from {:?} ({} skipped)",
            entries.len(),
            path,
            import.skipped
        );
        Ok(ImportSummary {
            entries,
            skipped: import.skipped,
        })
    }
}
