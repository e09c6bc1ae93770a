use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::control::{
    ControlEvent, ControlSession, EventFilter, EventKind, StreamStatus, SubscriptionHandle,
};
use crate::credentials::{CredentialObserver, ProxiedRequest};
use crate::display::{CircuitDisplayData, CircuitDisplayState, RefreshSignal};
use crate::onion_auth::{AuthPromptDelegate, NavigationStatus, OnionAuthTracker};
use crate::resolver::CircuitResolver;
use crate::types::TabId;

/// Which of the two observable state machines the engine runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub enable_circuit_display: bool,
    pub enable_onion_auth: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enable_circuit_display: true,
            enable_onion_auth: true,
        }
    }
}

/// Owns the correlation state and its control-session subscriptions.
///
/// All maps and sets live as instance fields with a start/stop lifecycle;
/// independent engines never share state. Each subscription is drained by
/// one dedicated task, which preserves per-source event ordering while
/// sources stay free to interleave with each other.
pub struct CorrelationEngine {
    session: Arc<dyn ControlSession>,
    config: EngineConfig,
    observer: Arc<CredentialObserver>,
    resolver: Arc<CircuitResolver>,
    display: CircuitDisplayState,
    onion_auth: Arc<OnionAuthTracker>,
    refresh: Arc<RefreshSignal>,
    subscriptions: Mutex<Vec<SubscriptionHandle>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl CorrelationEngine {
    pub fn new(
        session: Arc<dyn ControlSession>,
        delegate: Arc<dyn AuthPromptDelegate>,
        config: EngineConfig,
    ) -> Arc<Self> {
        let refresh = Arc::new(RefreshSignal::new());
        let observer = Arc::new(CredentialObserver::new());
        let resolver = Arc::new(CircuitResolver::new(session.clone(), refresh.clone()));
        let display = CircuitDisplayState::new(observer.clone(), resolver.clone());
        let onion_auth = Arc::new(OnionAuthTracker::new(session.clone(), delegate));

        Arc::new(Self {
            session,
            config,
            observer,
            resolver,
            display,
            onion_auth,
            refresh,
            subscriptions: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    /// Subscribes to the configured event sources and spawns their drain
    /// tasks. Calling `start` on a running engine is a no-op.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        if self.config.enable_circuit_display {
            let mut subscription = self.session.subscribe(
                EventKind::Stream,
                EventFilter::stream_status(StreamStatus::SentConnect),
            );
            self.subscriptions
                .lock()
                .unwrap()
                .push(subscription.handle());
            let resolver = self.resolver.clone();
            let task = tokio::spawn(async move {
                while let Some(event) = subscription.events.recv().await {
                    if let ControlEvent::Stream(stream) = event {
                        resolver.handle_stream_event(&stream).await;
                    }
                }
                // Channel close without a cancel means the session died;
                // later queries will fail with SessionClosed.
                warn!("stream event subscription ended");
            });
            self.tasks.lock().unwrap().push(task);
        }

        if self.config.enable_onion_auth {
            let mut subscription = self
                .session
                .subscribe(EventKind::OnionAuthFailure, EventFilter::default());
            self.subscriptions
                .lock()
                .unwrap()
                .push(subscription.handle());
            let tracker = self.onion_auth.clone();
            let task = tokio::spawn(async move {
                while let Some(event) = subscription.events.recv().await {
                    if let ControlEvent::OnionAuthFailure(failure) = event {
                        tracker.handle_auth_failure(&failure);
                    }
                }
                warn!("authorization event subscription ended");
            });
            self.tasks.lock().unwrap().push(task);
        }

        info!(
            circuit_display = self.config.enable_circuit_display,
            onion_auth = self.config.enable_onion_auth,
            "correlation engine started"
        );
    }

    /// Cancels every subscription and aborts the drain tasks and any open
    /// prompt flow. Idempotent; no callback survives past this call.
    pub fn stop(&self) {
        for handle in self.subscriptions.lock().unwrap().drain(..) {
            handle.cancel();
        }
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        self.onion_auth.shutdown();
        if self.started.swap(false, Ordering::SeqCst) {
            info!("correlation engine stopped");
        }
    }

    /// Platform-layer intake for per-request proxy credentials.
    pub fn observe_proxied_request(&self, request: ProxiedRequest) {
        self.observer.observe(request);
    }

    /// Navigation progress intake for the authorization tracker.
    pub fn navigation_started(&self, tab: TabId, host: &str) {
        self.onion_auth.navigation_started(tab, host);
    }

    pub fn navigation_stopped(&self, tab: TabId, status: NavigationStatus) {
        // A spawned prompt flow joins the task list so `stop` can abort it
        // mid-prompt.
        if let Some(flow) = self.onion_auth.navigation_stopped(tab, status) {
            let mut tasks = self.tasks.lock().unwrap();
            tasks.retain(|task| !task.is_finished());
            tasks.push(flow);
        }
    }

    /// Synchronous read of the current join state for a tab.
    pub fn current_circuit_data(&self, tab: TabId, domain: &str) -> Option<CircuitDisplayData> {
        self.display.current_circuit_data(tab, domain)
    }

    /// Receiver that changes whenever a tab's join result may have
    /// changed.
    pub fn refresh_signal(&self) -> watch::Receiver<u64> {
        self.refresh.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::testing::MockControlSession;
    use crate::control::{StreamEvent, StreamStatus};
    use crate::onion_auth::PromptOutcome;
    use crate::types::CircuitId;
    use async_trait::async_trait;
    use std::time::Duration;

    struct NoPrompt;

    #[async_trait]
    impl AuthPromptDelegate for NoPrompt {
        async fn prompt_password(&self, _host: &str, _attempt: u32) -> PromptOutcome {
            PromptOutcome::Cancelled
        }
        fn auth_failed(&self, _host: &str, _message: &str) {}
        fn reload_tab(&self, _tab: TabId) {}
    }

    const FP: &str = "CCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCC9999";

    fn engine_with(session: Arc<MockControlSession>) -> Arc<CorrelationEngine> {
        CorrelationEngine::new(session, Arc::new(NoPrompt), EngineConfig::default())
    }

    #[tokio::test]
    async fn start_subscribes_and_stop_cancels() {
        let session = Arc::new(MockControlSession::new());
        let engine = engine_with(session.clone());

        engine.start();
        assert_eq!(session.live_subscriber_count(), 2);

        // Re-start must not duplicate subscriptions.
        engine.start();
        assert_eq!(session.live_subscriber_count(), 2);

        engine.stop();
        assert_eq!(session.live_subscriber_count(), 0);
        engine.stop();
    }

    #[tokio::test]
    async fn config_gates_subscriptions() {
        let session = Arc::new(MockControlSession::new());
        let engine = CorrelationEngine::new(
            session.clone(),
            Arc::new(NoPrompt),
            EngineConfig {
                enable_circuit_display: true,
                enable_onion_auth: false,
            },
        );
        engine.start();
        assert_eq!(session.live_subscriber_count(), 1);
        engine.stop();
    }

    #[tokio::test]
    async fn stream_event_flows_through_to_display() {
        let session = Arc::new(MockControlSession::new());
        session.stub(
            "GETINFO circuit-status",
            vec![format!(
                "12 BUILT ${}~exit SOCKS_USERNAME=\"bob\" SOCKS_PASSWORD=\"pw1\"",
                FP
            )],
        );
        session.stub("GETCONF Bridge", Vec::<String>::new());
        session.stub(
            &format!("GETINFO ns/id/{}", FP),
            vec![format!("r exit {} dig 2026-01-01 00:00:00 203.0.113.9 9001 0", FP)],
        );
        session.stub(
            "GETINFO ip-to-country/203.0.113.9",
            vec!["ip-to-country/203.0.113.9=nl"],
        );

        let engine = engine_with(session.clone());
        engine.start();
        let mut refresh = engine.refresh_signal();

        let tab = TabId(7);
        engine.observe_proxied_request(ProxiedRequest {
            tab: Some(tab),
            domain: "example.com".to_string(),
            username: Some("bob".to_string()),
            password: Some("pw1".to_string()),
        });
        // Credential observed, circuit not resolved yet: no data.
        assert!(engine.current_circuit_data(tab, "example.com").is_none());

        session.emit(ControlEvent::Stream(StreamEvent {
            stream_id: "55".to_string(),
            status: StreamStatus::SentConnect,
            circuit_id: CircuitId::new("12"),
            target: "example.com:443".to_string(),
        }));

        tokio::time::timeout(Duration::from_secs(1), refresh.changed())
            .await
            .expect("refresh fires")
            .expect("signal alive");

        let data = engine
            .current_circuit_data(tab, "example.com")
            .expect("join result available after resolution");
        assert_eq!(data.domain, "example.com");
        assert_eq!(data.path.hops.len(), 1);
        assert_eq!(data.path.hops[0].country.as_deref(), Some("nl"));
        engine.stop();
    }

    #[tokio::test]
    async fn filtered_stream_statuses_never_reach_the_resolver() {
        let session = Arc::new(MockControlSession::new());
        let engine = engine_with(session.clone());
        engine.start();

        session.emit(ControlEvent::Stream(StreamEvent {
            stream_id: "1".to_string(),
            status: StreamStatus::Closed,
            circuit_id: CircuitId::new("3"),
            target: "example.com:443".to_string(),
        }));
        tokio::task::yield_now().await;

        assert_eq!(session.issued_count("GETINFO circuit-status"), 0);
        engine.stop();
    }
}
