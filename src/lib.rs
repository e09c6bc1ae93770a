//! Control-port event correlation engine for an anonymity-network browser
//! integration.
//!
//! Two independent observation sources are joined by a shared
//! stream-isolation credential: the platform layer reports which proxy
//! credential each tab uses per destination, and the control session
//! reports which relay path each credential's circuit took. The engine
//! also tracks onion-service authorization failures and drives the
//! per-host password prompt/retry flow. Wire transport, rendering, and
//! preference storage stay behind collaborator traits.

pub mod control;
pub mod credentials;
pub mod display;
pub mod engine;
pub mod onion_auth;
pub mod parse;
pub mod resolver;
pub mod types;

pub use control::{
    AuthFailureReason, ControlError, ControlEvent, ControlReply, ControlSession, EventFilter,
    EventKind, OnionAuthFailureEvent, StreamEvent, StreamStatus, Subscription, SubscriptionHandle,
};
pub use credentials::{CredentialObserver, ProxiedRequest};
pub use display::{CircuitDisplayData, CircuitDisplayState, RefreshSignal};
pub use engine::{CorrelationEngine, EngineConfig};
pub use onion_auth::{
    is_onion_host, AuthPromptDelegate, NavigationStatus, OnionAuthTracker, PromptOutcome,
};
pub use resolver::CircuitResolver;
pub use types::{CircuitId, CircuitPath, Fingerprint, NodeData, NodeKind, SocksCredential, TabId};
