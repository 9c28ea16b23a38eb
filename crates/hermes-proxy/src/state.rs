//! Shared proxy state and the event stream.
//!
//! One [`ProxyState`] is created per proxy and injected into every connection
//! task, the replay engine and the controller. It owns the history, the active
//! rule snapshot and the broadcast channel listeners subscribe to.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{broadcast, watch};

use hermes_core::{EntryStore, ProxyEntry, Rule, RuleEngine};

/// Capacity of the event channel; slow subscribers lag past this.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Notifications emitted by the proxy.
#[derive(Debug, Clone)]
pub enum ProxyEvent {
    /// A new entry was recorded (live, replayed or imported).
    Entry(Arc<ProxyEntry>),
    /// History was cleared.
    HistoryCleared,
    /// The listener is bound to this port.
    PortReady(u16),
    /// The CA certificate is available at this path.
    CaReady(PathBuf),
    /// The active rules changed.
    RulesUpdated(Arc<Vec<Rule>>),
}

/// State shared by every part of a running proxy.
#[derive(Debug)]
pub struct ProxyState {
    store: EntryStore,
    rules: RuleEngine,
    rules_path: RwLock<PathBuf>,
    events: broadcast::Sender<ProxyEvent>,
    port: watch::Sender<Option<u16>>,
}

impl ProxyState {
    /// Creates state with a history of `capacity` entries.
    pub fn new(capacity: usize, rules_path: impl Into<PathBuf>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (port, _) = watch::channel(None);
        Self {
            store: EntryStore::new(capacity),
            rules: RuleEngine::new(),
            rules_path: RwLock::new(rules_path.into()),
            events,
            port,
        }
    }

    /// The entry history.
    pub fn store(&self) -> &EntryStore {
        &self.store
    }

    /// The rule engine.
    pub fn rules(&self) -> &RuleEngine {
        &self.rules
    }

    /// Stores an entry and notifies subscribers.
    pub fn record(&self, entry: ProxyEntry) -> Arc<ProxyEntry> {
        let entry = Arc::new(entry);
        tracing::debug!(
            id = %entry.id,
            method = %entry.method,
            url = %entry.url(),
            status = ?entry.status,
            "Recorded entry"
        );
        self.store.add(Arc::clone(&entry));
        self.emit(ProxyEvent::Entry(Arc::clone(&entry)));
        entry
    }

    /// Replaces the active rules and notifies subscribers.
    pub fn replace_rules(&self, rules: Vec<Rule>) {
        self.rules.replace(rules);
        self.emit(ProxyEvent::RulesUpdated(self.rules.snapshot()));
    }

    /// Current rules file path.
    pub fn rules_path(&self) -> PathBuf {
        self.rules_path.read().clone()
    }

    pub fn set_rules_path(&self, path: &Path) {
        *self.rules_path.write() = path.to_path_buf();
    }

    /// Empties the history and notifies subscribers.
    pub fn clear_history(&self) {
        self.store.clear();
        self.emit(ProxyEvent::HistoryCleared);
    }

    /// Subscribes to proxy events.
    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.events.subscribe()
    }

    /// Sends an event; having no subscribers is not an error.
    pub fn emit(&self, event: ProxyEvent) {
        let _ = self.events.send(event);
    }

    /// Publishes the bound port.
    pub fn publish_port(&self, port: u16) {
        self.port.send_replace(Some(port));
        self.emit(ProxyEvent::PortReady(port));
    }

    /// The bound port, if the listener is up.
    pub fn port(&self) -> Option<u16> {
        *self.port.borrow()
    }

    /// Waits until a port is published.
    pub async fn wait_port(&self) -> Option<u16> {
        let mut rx = self.port.subscribe();
        let port = rx.wait_for(Option::is_some).await.ok()?;
        *port
    }
}
