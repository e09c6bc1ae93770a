use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::types::CircuitId;

/// Reply payload from a control-port query.
///
/// The transport collaborator strips wire framing and status codes; what
/// remains is the reply body as individual text lines. Interpreting those
/// lines is this crate's job.
#[derive(Debug, Clone, Default)]
pub struct ControlReply {
    pub lines: Vec<String>,
}

impl ControlReply {
    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
        }
    }
}

/// Failure surfaced by the control session collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    /// The daemon rejected the command.
    CommandRejected { command: String, message: String },
    /// The collaborator's own query timeout fired.
    Timeout,
    /// The session is gone; no further queries will succeed.
    SessionClosed,
}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlError::CommandRejected { command, message } => {
                write!(f, "command {:?} rejected: {}", command, message)
            }
            ControlError::Timeout => write!(f, "control query timed out"),
            ControlError::SessionClosed => write!(f, "control session closed"),
        }
    }
}

impl std::error::Error for ControlError {}

/// Stream lifecycle status transitions the engine cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    New,
    /// Connection attempt sent to the exit; the first such event on a
    /// circuit triggers resolution.
    SentConnect,
    Succeeded,
    Closed,
}

/// One stream lifecycle event.
#[derive(Debug, Clone)]
pub struct StreamEvent {
    pub stream_id: String,
    pub status: StreamStatus,
    pub circuit_id: CircuitId,
    pub target: String,
}

/// Reason attached to an onion-service authorization failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailureReason {
    /// The service descriptor could not be decrypted (missing or wrong
    /// client authorization).
    BadDescriptor,
    Other,
}

/// One authorization-failure event for an onion destination.
#[derive(Debug, Clone)]
pub struct OnionAuthFailureEvent {
    pub host: String,
    pub reason: AuthFailureReason,
    pub auth_type: Option<String>,
}

/// Event categories available for subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Stream,
    OnionAuthFailure,
}

/// A delivered event.
#[derive(Debug, Clone)]
pub enum ControlEvent {
    Stream(StreamEvent),
    OnionAuthFailure(OnionAuthFailureEvent),
}

impl ControlEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ControlEvent::Stream(_) => EventKind::Stream,
            ControlEvent::OnionAuthFailure(_) => EventKind::OnionAuthFailure,
        }
    }
}

/// Declarative event filter evaluated by the subscription mechanism.
///
/// An empty filter matches every event of the subscribed kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub stream_status: Option<StreamStatus>,
}

impl EventFilter {
    pub fn stream_status(status: StreamStatus) -> Self {
        Self {
            stream_status: Some(status),
        }
    }

    pub fn matches(&self, event: &ControlEvent) -> bool {
        match event {
            ControlEvent::Stream(stream) => match self.stream_status {
                Some(status) => stream.status == status,
                None => true,
            },
            ControlEvent::OnionAuthFailure(_) => true,
        }
    }
}

/// Cancellation handle for one subscription.
///
/// `cancel` is idempotent; the session stops delivering into a cancelled
/// subscription and may drop its sender at any point afterwards.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    cancelled: Arc<AtomicBool>,
}

impl SubscriptionHandle {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Default for SubscriptionHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// An active event subscription: the receiving end of the event channel
/// plus its cancellation handle.
///
/// The channel closing without a cancel is the session-failure signal: the
/// collaborator dropped its sender because the session died.
pub struct Subscription {
    pub events: mpsc::Receiver<ControlEvent>,
    handle: SubscriptionHandle,
}

impl Subscription {
    pub fn new(events: mpsc::Receiver<ControlEvent>, handle: SubscriptionHandle) -> Self {
        Self { events, handle }
    }

    pub fn handle(&self) -> SubscriptionHandle {
        self.handle.clone()
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }
}

/// Connected, authenticated session to the daemon's control port.
///
/// The wire protocol (framing, escaping, authentication handshake) lives
/// behind this trait; the engine only issues commands and consumes parsed
/// reply lines and typed events.
#[async_trait]
pub trait ControlSession: Send + Sync {
    /// Issues one request/response command.
    async fn query(&self, command: &str) -> Result<ControlReply, ControlError>;

    /// Registers for push events of `kind` matching `filter`.
    fn subscribe(&self, kind: EventKind, filter: EventFilter) -> Subscription;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_matches_only_requested_stream_status() {
        let filter = EventFilter::stream_status(StreamStatus::SentConnect);
        let sent = ControlEvent::Stream(StreamEvent {
            stream_id: "1".to_string(),
            status: StreamStatus::SentConnect,
            circuit_id: CircuitId::new("7"),
            target: "example.com:443".to_string(),
        });
        let closed = ControlEvent::Stream(StreamEvent {
            stream_id: "1".to_string(),
            status: StreamStatus::Closed,
            circuit_id: CircuitId::new("7"),
            target: "example.com:443".to_string(),
        });
        assert!(filter.matches(&sent));
        assert!(!filter.matches(&closed));
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = EventFilter::default();
        let event = ControlEvent::OnionAuthFailure(OnionAuthFailureEvent {
            host: "abc.onion".to_string(),
            reason: AuthFailureReason::BadDescriptor,
            auth_type: None,
        });
        assert!(filter.matches(&event));
    }

    #[test]
    fn subscription_cancel_is_idempotent() {
        let handle = SubscriptionHandle::new();
        assert!(!handle.is_cancelled());
        handle.cancel();
        handle.cancel();
        assert!(handle.is_cancelled());
    }
}
