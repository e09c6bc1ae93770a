use std::collections::HashMap;
use std::sync::Mutex;

use crate::types::{SocksCredential, TabId};

/// One outbound proxied connection as reported by the platform layer.
///
/// Fields are optional because the reporting path must never block or
/// fail: whatever could not be attributed simply stays `None`.
#[derive(Debug, Clone)]
pub struct ProxiedRequest {
    pub tab: Option<TabId>,
    pub domain: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Records which stream-isolation credential each (tab, domain) pair is
/// currently proxying through.
///
/// This is one side of the correlation join and is fed independently of
/// the control session; neither side may assume the other is populated.
pub struct CredentialObserver {
    map: Mutex<HashMap<(TabId, String), SocksCredential>>,
}

impl CredentialObserver {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    /// Records the credential for one request. Requests with no tab
    /// context or no credential pair are dropped without error; this
    /// signal fires on every outbound connection and must stay cheap.
    pub fn observe(&self, request: ProxiedRequest) {
        let (Some(tab), Some(username), Some(password)) =
            (request.tab, request.username, request.password)
        else {
            return;
        };
        let credential = SocksCredential::from_parts(&username, &password);
        self.map
            .lock()
            .unwrap()
            .insert((tab, request.domain), credential);
    }

    /// Most recently observed credential for (tab, domain), if any.
    pub fn credential_for(&self, tab: TabId, domain: &str) -> Option<SocksCredential> {
        self.map
            .lock()
            .unwrap()
            .get(&(tab, domain.to_string()))
            .cloned()
    }
}

impl Default for CredentialObserver {
    fn default() -> Self {
        Self::new()
    }
}
