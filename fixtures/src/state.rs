use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

/// A user known to the fixture identity directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub handle: String,
    pub did: String,
}

impl Account {
    pub fn new(handle: &str, did: &str) -> Self {
        Self {
            handle: handle.to_string(),
            did: did.to_string(),
        }
    }
}

/// Knobs tests turn to script server behavior.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Scope written into token responses. `None` echoes the requested scope.
    pub granted_scope: Option<String>,
    /// Lifetime in seconds of newly issued access tokens.
    pub access_token_lifetime: i64,
    /// Challenge every resource request with a brand new nonce.
    pub always_rotate_pds_nonce: bool,
    /// Reject every refresh_token grant with `invalid_grant`.
    pub fail_refresh: bool,
    /// Artificial latency on refresh_token grants.
    pub refresh_delay: Option<Duration>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            granted_scope: None,
            access_token_lifetime: 3600,
            always_rotate_pds_nonce: false,
            fail_refresh: false,
            refresh_delay: None,
        }
    }
}

/// Request counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    pub par_requests: usize,
    pub authorization_code_grants: usize,
    pub refresh_grants: usize,
    pub create_record_requests: usize,
    pub auth_server_nonce_challenges: usize,
    pub pds_nonce_challenges: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct ParRequest {
    pub client_id: String,
    pub redirect_uri: String,
    pub state: String,
    pub code_challenge: String,
    pub scope: String,
    pub login_hint: Option<String>,
    pub jkt: String,
}

#[derive(Debug, Clone)]
pub(crate) struct AuthorizationCode {
    pub client_id: String,
    pub redirect_uri: String,
    pub code_challenge: String,
    pub scope: String,
    pub sub: String,
    pub jkt: String,
}

#[derive(Debug, Clone)]
pub(crate) struct Grant {
    pub client_id: String,
    pub scope: String,
    pub sub: String,
    pub jkt: String,
    /// Unix seconds
    pub expires_at: i64,
}

pub(crate) struct Inner {
    pub accounts: Vec<Account>,
    pub par_requests: HashMap<String, ParRequest>,
    pub codes: HashMap<String, AuthorizationCode>,
    pub access_tokens: HashMap<String, Grant>,
    pub refresh_tokens: HashMap<String, Grant>,
    pub auth_server_nonce: String,
    pub pds_nonce: String,
    pub seen_jtis: HashSet<String>,
    pub records: Vec<Value>,
    pub settings: Settings,
    pub stats: Stats,
}

/// Shared state behind every fixture router.
#[derive(Clone)]
pub struct FixtureState {
    /// Base URL of the authorization server, also its issuer
    pub issuer: String,
    /// Base URL of the PDS named in DID documents
    pub pds_url: String,
    inner: Arc<Mutex<Inner>>,
}

pub(crate) fn new_nonce() -> String {
    Uuid::new_v4().simple().to_string()
}

impl FixtureState {
    pub fn new(issuer: &str, pds_url: &str, accounts: Vec<Account>) -> Self {
        Self {
            issuer: issuer.trim_end_matches('/').to_string(),
            pds_url: pds_url.trim_end_matches('/').to_string(),
            inner: Arc::new(Mutex::new(Inner {
                accounts,
                par_requests: HashMap::new(),
                codes: HashMap::new(),
                access_tokens: HashMap::new(),
                refresh_tokens: HashMap::new(),
                auth_server_nonce: new_nonce(),
                pds_nonce: new_nonce(),
                seen_jtis: HashSet::new(),
                records: Vec::new(),
                settings: Settings::default(),
                stats: Stats::default(),
            })),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn update_settings(&self, update: impl FnOnce(&mut Settings)) {
        update(&mut self.lock().settings);
    }

    pub fn settings(&self) -> Settings {
        self.lock().settings.clone()
    }

    pub fn stats(&self) -> Stats {
        self.lock().stats.clone()
    }

    pub fn records(&self) -> Vec<Value> {
        self.lock().records.clone()
    }

    pub fn add_account(&self, account: Account) {
        self.lock().accounts.push(account);
    }

    pub fn account_by_handle(&self, handle: &str) -> Option<Account> {
        let handle = handle.trim_start_matches('@');
        self.lock()
            .accounts
            .iter()
            .find(|a| a.handle == handle)
            .cloned()
    }

    pub fn account_by_did(&self, did: &str) -> Option<Account> {
        self.lock().accounts.iter().find(|a| a.did == did).cloned()
    }

    pub fn auth_server_nonce(&self) -> String {
        self.lock().auth_server_nonce.clone()
    }

    pub fn pds_nonce(&self) -> String {
        self.lock().pds_nonce.clone()
    }

    /// Force the next authorization server request to be challenged.
    pub fn rotate_auth_server_nonce(&self) -> String {
        let nonce = new_nonce();
        self.lock().auth_server_nonce = nonce.clone();
        nonce
    }

    /// Force the next resource server request to be challenged.
    pub fn rotate_pds_nonce(&self) -> String {
        let nonce = new_nonce();
        self.lock().pds_nonce = nonce.clone();
        nonce
    }

    /// Make an issued access token look expired to the PDS.
    pub fn expire_access_token(&self, access_token: &str) {
        if let Some(grant) = self.lock().access_tokens.get_mut(access_token) {
            grant.expires_at = Utc::now().timestamp() - 1;
        }
    }
}
