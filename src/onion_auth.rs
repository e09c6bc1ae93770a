use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::control::{AuthFailureReason, ControlError, ControlSession, OnionAuthFailureEvent};
use crate::parse;
use crate::types::TabId;

/// Why a tracked navigation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationStatus {
    Completed,
    ConnectionRefused,
    OtherFailure,
}

/// User's answer to a password prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptOutcome {
    Cancelled,
    Password(String),
}

/// UI-side collaborator for the authorization flow. The prompt is modal
/// for the user but asynchronous for the engine, so event delivery keeps
/// running while a dialog is open.
#[async_trait]
pub trait AuthPromptDelegate: Send + Sync {
    /// Asks the user for the authorization password. `attempt` starts at 1
    /// and counts retries within one prompt flow.
    async fn prompt_password(&self, host: &str, attempt: u32) -> PromptOutcome;

    /// Tells the user a submitted password was rejected, before the next
    /// prompt iteration.
    fn auth_failed(&self, host: &str, message: &str);

    /// Reloads the destination after a successful credential binding.
    fn reload_tab(&self, tab: TabId);
}

/// Per-destination authorization detection and prompt/retry state machine.
///
/// Authorization-failure events and navigation progress arrive from two
/// unrelated asynchronous sources; the machine consults shared sets rather
/// than assuming any event order, so either arrival order produces the
/// same outcome.
pub struct OnionAuthTracker {
    session: Arc<dyn ControlSession>,
    delegate: Arc<dyn AuthPromptDelegate>,
    /// Hosts whose descriptor failed with a bad-descriptor reason.
    bad_hosts: Mutex<HashSet<String>>,
    /// Hosts that already received their one automatic prompt.
    tried_hosts: Mutex<HashSet<String>>,
    /// Hosts with a prompt flow currently open.
    prompting: Mutex<HashSet<String>>,
    /// In-flight navigations to onion destinations, per tab.
    navigations: Mutex<HashMap<TabId, String>>,
}

/// Onion destinations are the only hosts this tracker cares about.
pub fn is_onion_host(host: &str) -> bool {
    host.ends_with(".onion")
}

impl OnionAuthTracker {
    pub fn new(session: Arc<dyn ControlSession>, delegate: Arc<dyn AuthPromptDelegate>) -> Self {
        Self {
            session,
            delegate,
            bad_hosts: Mutex::new(HashSet::new()),
            tried_hosts: Mutex::new(HashSet::new()),
            prompting: Mutex::new(HashSet::new()),
            navigations: Mutex::new(HashMap::new()),
        }
    }

    /// Entry point for subscribed authorization-failure events.
    pub fn handle_auth_failure(&self, event: &OnionAuthFailureEvent) {
        if event.reason != AuthFailureReason::BadDescriptor {
            return;
        }
        info!(host = %event.host, "onion service needs client authorization");
        self.bad_hosts.lock().unwrap().insert(event.host.clone());
        // A fresh failure restores eligibility for one more automatic
        // prompt, even for a host that was prompted before.
        self.tried_hosts.lock().unwrap().remove(&event.host);
    }

    /// Records a navigation start toward an onion destination.
    pub fn navigation_started(&self, tab: TabId, host: &str) {
        if !is_onion_host(host) {
            return;
        }
        self.navigations
            .lock()
            .unwrap()
            .insert(tab, host.to_string());
    }

    /// Handles a navigation stop. When the destination is known-bad and
    /// still eligible, spawns the prompt flow and returns its task handle;
    /// the flow runs on its own task so the modal prompt never blocks
    /// event delivery.
    pub fn navigation_stopped(
        self: &Arc<Self>,
        tab: TabId,
        status: NavigationStatus,
    ) -> Option<JoinHandle<()>> {
        let host = self.navigations.lock().unwrap().get(&tab).cloned()?;

        if !self.bad_hosts.lock().unwrap().contains(&host) {
            return None;
        }
        let never_tried = !self.tried_hosts.lock().unwrap().contains(&host);
        if status != NavigationStatus::ConnectionRefused && !never_tried {
            return None;
        }
        // One open prompt per host, no matter how many stops race in.
        if !self.prompting.lock().unwrap().insert(host.clone()) {
            return None;
        }
        self.navigations.lock().unwrap().remove(&tab);

        let tracker = Arc::clone(self);
        Some(tokio::spawn(async move {
            tracker.run_prompt_flow(tab, host).await;
        }))
    }

    /// Prompt/retry loop for one host. Terminates when the user cancels or
    /// a submitted password binds successfully; each rejected password is
    /// surfaced via the delegate before the next iteration.
    async fn run_prompt_flow(self: Arc<Self>, tab: TabId, host: String) {
        self.tried_hosts.lock().unwrap().insert(host.clone());

        let mut attempt: u32 = 1;
        loop {
            match self.delegate.prompt_password(&host, attempt).await {
                PromptOutcome::Cancelled => {
                    debug!(%host, attempt, "authorization prompt cancelled");
                    break;
                }
                PromptOutcome::Password(password) => {
                    match self.bind_credential(&host, &password).await {
                        Ok(()) => {
                            info!(%host, attempt, "authorization credential accepted");
                            self.delegate.reload_tab(tab);
                            break;
                        }
                        Err(error) => {
                            warn!(%host, attempt, %error, "authorization credential rejected");
                            self.delegate.auth_failed(&host, &error.to_string());
                            attempt += 1;
                        }
                    }
                }
            }
        }

        self.prompting.lock().unwrap().remove(&host);
    }

    /// Clears in-flight prompt bookkeeping after the engine aborts the
    /// flow tasks. An aborted flow never reaches its own cleanup, so the
    /// guard entries are dropped here; bad and tried marks survive so a
    /// restarted engine keeps its knowledge of failing hosts.
    pub fn shutdown(&self) {
        self.prompting.lock().unwrap().clear();
        self.navigations.lock().unwrap().clear();
    }

    /// Binds the credential to the host in the daemon configuration.
    async fn bind_credential(&self, host: &str, password: &str) -> Result<(), ControlError> {
        let value = parse::quote_string(&format!("{} {}", host, password));
        let command = format!("SETCONF HidServAuth={}", value);
        self.session.query(&command).await.map(|_| ())
    }
}
