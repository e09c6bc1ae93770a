use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::control::{ControlError, ControlSession, StreamEvent};
use crate::display::RefreshSignal;
use crate::parse::{self, BridgeEntry};
use crate::types::{CircuitId, CircuitPath, Fingerprint, NodeData, SocksCredential};

/// Turns "first stream on a new circuit" signals into resolved relay
/// paths, keyed by the circuit's stream-isolation credential.
///
/// A circuit carries many streams but is resolved at most once: the
/// circuit ID is claimed synchronously before the first query, so a second
/// stream event racing in during resolution finds it already taken.
pub struct CircuitResolver {
    session: Arc<dyn ControlSession>,
    resolved: Mutex<HashSet<CircuitId>>,
    paths: Mutex<HashMap<SocksCredential, Arc<CircuitPath>>>,
    refresh: Arc<RefreshSignal>,
}

impl CircuitResolver {
    pub fn new(session: Arc<dyn ControlSession>, refresh: Arc<RefreshSignal>) -> Self {
        Self {
            session,
            resolved: Mutex::new(HashSet::new()),
            paths: Mutex::new(HashMap::new()),
            refresh,
        }
    }

    /// Resolved path for a credential, if that circuit has completed
    /// resolution.
    pub fn path_for(&self, credential: &SocksCredential) -> Option<Arc<CircuitPath>> {
        self.paths.lock().unwrap().get(credential).cloned()
    }

    /// Entry point for subscribed stream events (already filtered to the
    /// connection-attempt-sent status).
    pub async fn handle_stream_event(&self, event: &StreamEvent) {
        {
            // Claim the circuit before any await so concurrent stream
            // events on the same circuit cannot start a second resolution.
            let mut resolved = self.resolved.lock().unwrap();
            if !resolved.insert(event.circuit_id.clone()) {
                return;
            }
        }

        match self.resolve_circuit(&event.circuit_id).await {
            Ok(Some((credential, path))) => {
                debug!(circuit = %event.circuit_id, hops = path.hops.len(), "circuit resolved");
                self.paths
                    .lock()
                    .unwrap()
                    .insert(credential, Arc::new(path));
                self.refresh.pulse();
            }
            Ok(None) => {}
            Err(error) => {
                warn!(circuit = %event.circuit_id, %error, "circuit resolution failed");
            }
        }
    }

    /// Full resolution for one circuit. `Ok(None)` is the silent-abandon
    /// case: the circuit is already gone, or carried no isolation
    /// credential. Only the circuit-status query itself can abort with an
    /// error; everything per-hop degrades to blank fields.
    async fn resolve_circuit(
        &self,
        id: &CircuitId,
    ) -> Result<Option<(SocksCredential, CircuitPath)>, ControlError> {
        let reply = self.session.query("GETINFO circuit-status").await?;
        let Some(entry) = parse::find_circuit_entry(&reply, id) else {
            debug!(circuit = %id, "circuit gone before resolution");
            return Ok(None);
        };
        let Some(credential) = entry.socks_credential() else {
            debug!(circuit = %id, "circuit has no isolation credential");
            return Ok(None);
        };

        let bridges = match self.session.query("GETCONF Bridge").await {
            Ok(reply) => parse::parse_bridge_lines(&reply),
            Err(error) => {
                debug!(%error, "bridge configuration unavailable");
                Vec::new()
            }
        };

        let mut hops = Vec::with_capacity(entry.path.len());
        for fingerprint in &entry.path {
            hops.push(self.node_data(fingerprint, &bridges).await);
        }

        Ok(Some((credential, CircuitPath { hops })))
    }

    /// Resolves one hop. A fingerprint in the bridge configuration is
    /// always a bridge, even if a relay-status lookup would also succeed;
    /// an unknown fingerprint (typical for bridges configured without one)
    /// is a bridge with unknown transport and address.
    async fn node_data(&self, fingerprint: &Fingerprint, bridges: &[BridgeEntry]) -> NodeData {
        let configured = bridges
            .iter()
            .find(|bridge| bridge.fingerprint.as_ref() == Some(fingerprint));

        let mut node = match configured {
            Some(bridge) => {
                let transport = bridge
                    .transport
                    .clone()
                    .unwrap_or_else(|| "vanilla".to_string());
                NodeData::bridge(Some(transport), bridge.ip())
            }
            None => {
                let command = format!("GETINFO ns/id/{}", fingerprint);
                match self.session.query(&command).await {
                    Ok(reply) => NodeData::relay(parse::router_status_ip(&reply)),
                    Err(error) => {
                        debug!(%fingerprint, %error, "relay status unavailable, assuming bridge");
                        NodeData::bridge(None, None)
                    }
                }
            }
        };

        if let Some(ip) = node.ip {
            node.country = self.country_for(ip).await;
        }
        node
    }

    async fn country_for(&self, ip: IpAddr) -> Option<String> {
        let command = format!("GETINFO ip-to-country/{}", ip);
        match self.session.query(&command).await {
            Ok(reply) => parse::country_code(&reply),
            Err(error) => {
                debug!(%ip, %error, "country lookup unavailable");
                None
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn detached(refresh: Arc<RefreshSignal>) -> Self {
        Self::new(
            Arc::new(crate::control::testing::MockControlSession::new()),
            refresh,
        )
    }

    #[cfg(test)]
    pub(crate) fn publish_for_tests(&self, credential: SocksCredential, path: CircuitPath) {
        self.paths
            .lock()
            .unwrap()
            .insert(credential, Arc::new(path));
        self.refresh.pulse();
    }
}
