use std::sync::Arc;

use tokio::sync::watch;

use crate::credentials::CredentialObserver;
use crate::resolver::CircuitResolver;
use crate::types::{CircuitPath, TabId};

/// Monotonic pulse fired whenever the join result for some tab may have
/// changed. The UI layer holds the receiving end and re-reads
/// [`CircuitDisplayState::current_circuit_data`] on each change.
pub struct RefreshSignal {
    tx: watch::Sender<u64>,
}

impl RefreshSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { tx }
    }

    pub fn pulse(&self) {
        self.tx.send_modify(|generation| *generation += 1);
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }
}

impl Default for RefreshSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Display-ready answer to "what path is this tab using right now".
#[derive(Debug, Clone)]
pub struct CircuitDisplayData {
    pub domain: String,
    pub path: Arc<CircuitPath>,
}

/// Pure join of the two observation maps.
///
/// The maps are fed by causally unrelated sources, so either side may be
/// empty at any moment; a missing side yields `None` ("no data yet") and
/// the next trigger simply recomputes. Nothing is cached here.
pub struct CircuitDisplayState {
    observer: Arc<CredentialObserver>,
    resolver: Arc<CircuitResolver>,
}

impl CircuitDisplayState {
    pub fn new(observer: Arc<CredentialObserver>, resolver: Arc<CircuitResolver>) -> Self {
        Self { observer, resolver }
    }

    /// O(1) lookup: tab + current first-party domain → credential → path.
    pub fn current_circuit_data(&self, tab: TabId, domain: &str) -> Option<CircuitDisplayData> {
        let credential = self.observer.credential_for(tab, domain)?;
        let path = self.resolver.path_for(&credential)?;
        Some(CircuitDisplayData {
            domain: domain.to_string(),
            path,
        })
    }
}
