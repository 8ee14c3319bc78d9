use crate::session::api::{AccountApi, PropertyReport};
use crate::session::config::{keys, StoreConfig};
use crate::session::normalize::{normalize_session, validate_and_clean_user_data, DEFAULT_ADDRESS_ID};
use crate::session::storage::KeyValueStore;
use crate::session::types::{
    Address, Credentials, NewAddress, Plan, RawUser, RefreshOutcome, Session, SessionInfo,
    StoreError,
};
use uuid::Uuid;

/// Single source of truth for the logged in user, their plan and their
/// active address
///
/// Owned by the application shell and passed to whatever needs it. Every
/// mutation normalizes the session and writes it through to storage before
/// the in-memory copy changes. Failed operations return the typed error and
/// also leave its message in [`SessionStore::error`] for display.
pub struct SessionStore<S, A> {
    storage: S,
    api: A,
    config: StoreConfig,
    session: Option<Session>,
    token: Option<String>,
    error: Option<String>,
    property_report: Option<PropertyReport>,
}

impl<S: KeyValueStore, A: AccountApi> SessionStore<S, A> {
    /// Create the store and hydrate it from storage
    pub fn init(storage: S, api: A, config: StoreConfig) -> Self {
        let mut store = Self {
            storage,
            api,
            config,
            session: None,
            token: None,
            error: None,
            property_report: None,
        };
        store.hydrate();
        store
    }

    fn hydrate(&mut self) {
        // Load existing state
        let token = self.load_key(keys::AUTH_TOKEN).filter(|t| !t.trim().is_empty());
        let user = self.load_key(keys::USER);

        match (token, user) {
            (Some(token), Some(json)) => match serde_json::from_str::<RawUser>(&json) {
                Ok(raw) => {
                    self.api.set_bearer_token(Some(token.clone()));
                    self.token = Some(token);
                    let session = validate_and_clean_user_data(&raw);
                    if let Err(e) = self.commit(session) {
                        tracing::warn!(error = %e, "could not persist hydrated session");
                    }
                    tracing::debug!("session restored from storage");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "discarding unreadable persisted user");
                    self.clear_key(keys::USER);
                    self.api.set_bearer_token(Some(token.clone()));
                    self.token = Some(token);
                }
            },
            (None, Some(_)) => {
                tracing::warn!("persisted user without auth token, discarding");
                self.clear_key(keys::USER);
            }
            (Some(token), None) => {
                // Token alone is kept so refresh_user can rebuild the profile.
                self.api.set_bearer_token(Some(token.clone()));
                self.token = Some(token);
            }
            (None, None) => {}
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Message of the last failed operation
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn clear_error(&mut self) {
        self.error = None;
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.is_some() && self.session.is_some()
    }

    pub fn info(&self) -> SessionInfo {
        match (&self.session, &self.token) {
            (Some(session), Some(_)) => SessionInfo::from(session),
            _ => SessionInfo::anonymous(),
        }
    }

    pub fn property_report(&self) -> Option<&PropertyReport> {
        self.property_report.as_ref()
    }

    /// Property key cached for the current address
    pub fn cached_lmk_key(&self) -> Option<String> {
        self.load_key(keys::LMK_KEY)
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Authentication
    // ------------------------------------------------------------------

    pub async fn login(&mut self, credentials: Credentials) -> Result<Session, StoreError> {
        let result = self.login_inner(&credentials).await;
        self.record(result)
    }

    async fn login_inner(&mut self, credentials: &Credentials) -> Result<Session, StoreError> {
        if credentials.email.trim().is_empty() || credentials.password.is_empty() {
            return Err(StoreError::Validation(
                "Email and password are required".to_string(),
            ));
        }

        let response = self.api.login(credentials).await?;
        let token = response.token.trim().to_string();
        if token.is_empty() {
            return Err(StoreError::Api {
                status: 200,
                message: "Login response did not include a token".to_string(),
            });
        }

        // Write user, then token; nothing in memory changes until both land
        let session = normalize_session(&validate_and_clean_user_data(&response.user));
        self.persist(&session)?;
        if let Err(e) = self.storage.save(keys::AUTH_TOKEN, &token) {
            self.restore_persisted_user();
            return Err(e);
        }

        self.api.set_bearer_token(Some(token.clone()));
        self.token = Some(token);
        self.session = Some(session.clone());

        // Cached report belongs to whoever was logged in before
        self.forget_property();

        tracing::info!(user_id = %session.id, plan = %session.plan, "logged in");
        Ok(session)
    }

    /// Clear persisted credentials and reset in-memory state
    ///
    /// State is reset even when storage fails; the first storage error is
    /// returned afterwards.
    pub fn logout(&mut self) -> Result<(), StoreError> {
        let mut first_error = None;
        for key in [
            keys::AUTH_TOKEN,
            keys::USER,
            keys::LMK_KEY,
            keys::CHECKOUT_SESSION,
        ] {
            if let Err(e) = self.storage.clear(key) {
                tracing::warn!(key, error = %e, "failed to clear storage key on logout");
                first_error.get_or_insert(e);
            }
        }

        self.api.set_bearer_token(None);
        self.session = None;
        self.token = None;
        self.property_report = None;
        tracing::info!("logged out");

        match first_error {
            Some(e) => self.record(Err(e)),
            None => self.record(Ok(())),
        }
    }

    // ------------------------------------------------------------------
    // Addresses
    // ------------------------------------------------------------------

    pub fn switch_address(&mut self, address_id: &str) -> Result<Session, StoreError> {
        let result = self.switch_address_inner(address_id);
        self.record(result)
    }

    fn switch_address_inner(&mut self, address_id: &str) -> Result<Session, StoreError> {
        // Load existing state
        let mut session = self.require_session()?;
        if session.plan != Plan::Pro {
            return Err(StoreError::Permission(
                "Switching addresses requires the pro plan".to_string(),
            ));
        }
        if !session.has_address(address_id) {
            return Err(StoreError::NotFound(format!("Address {}", address_id)));
        }

        let changed = session.current_address_id.as_deref() != Some(address_id);
        session.current_address_id = Some(address_id.to_string());
        session.refresh_current_flags();

        // Save updated state
        let session = self.commit(session)?;

        if changed {
            self.forget_property();
        }
        tracing::debug!(address_id, "switched current address");
        Ok(session)
    }

    pub fn add_address(&mut self, new_address: NewAddress) -> Result<Address, StoreError> {
        let result = self.add_address_inner(new_address);
        self.record(result)
    }

    fn add_address_inner(&mut self, new_address: NewAddress) -> Result<Address, StoreError> {
        let mut session = self.require_session()?;

        // Check plan allows it
        if session.plan == Plan::Basic {
            return Err(StoreError::Permission(
                "The basic plan is limited to one address".to_string(),
            ));
        }
        if session.is_at_capacity() {
            return Err(StoreError::QuotaExceeded {
                max: session.plan.max_addresses(),
            });
        }

        let missing = new_address.missing_fields();
        if !missing.is_empty() {
            return Err(StoreError::Validation(format!(
                "Missing required fields: {}",
                missing.join(", ")
            )));
        }

        // Generate unique id
        let mut id = Uuid::new_v4().to_string();
        while session.has_address(&id) {
            id = Uuid::new_v4().to_string();
        }

        session.addresses.push(Address {
            id: id.clone(),
            address: new_address.street.trim().to_string(),
            postcode: new_address.zip.trim().to_string(),
            city: new_address.city.trim().to_string(),
            country: new_address.country.trim().to_string(),
            is_current: false,
        });

        let session = self.commit(session)?;
        tracing::debug!(address_id = %id, count = session.addresses.len(), "address added");
        session
            .find_address(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("Address {}", id)))
    }

    pub fn delete_address(&mut self, address_id: &str) -> Result<Session, StoreError> {
        let result = self.delete_address_inner(address_id);
        self.record(result)
    }

    fn delete_address_inner(&mut self, address_id: &str) -> Result<Session, StoreError> {
        let mut session = self.require_session()?;
        if session.plan == Plan::Basic {
            return Err(StoreError::Permission(
                "The basic plan cannot remove its address".to_string(),
            ));
        }
        if !session.has_address(address_id) {
            return Err(StoreError::NotFound(format!("Address {}", address_id)));
        }
        if session.addresses.len() <= 1 {
            return Err(StoreError::LastAddress);
        }

        // Reassign current if it was removed
        session.addresses.retain(|a| a.id != address_id);
        let was_current = session.current_address_id.as_deref() == Some(address_id);
        if was_current {
            session.current_address_id = session.addresses.first().map(|a| a.id.clone());
        }
        session.refresh_current_flags();
        let session = self.commit(session)?;

        if was_current {
            self.forget_property();
        }
        tracing::debug!(address_id, "address deleted");
        Ok(session)
    }

    // ------------------------------------------------------------------
    // Plan
    // ------------------------------------------------------------------

    pub fn update_plan(&mut self, new_plan: &str) -> Result<Session, StoreError> {
        let result = self.update_plan_inner(new_plan);
        self.record(result)
    }

    fn update_plan_inner(&mut self, new_plan: &str) -> Result<Session, StoreError> {
        let plan: Plan = new_plan.parse()?;
        let mut session = self.require_session()?;

        let previous = session.plan;
        session.plan = plan;
        retain_within_quota(&mut session);

        // Save updated state
        let session = self.commit(session)?;

        tracing::info!(from = %previous, to = %plan, "plan updated");
        Ok(session)
    }

    /// Re-fetch the profile after a payment redirect
    ///
    /// Trust boundary: if the backend cannot confirm, the plan is upgraded to
    /// pro locally and the outcome is flagged `fallback`. Nothing on the
    /// client proves the payment happened; a signed receipt (see
    /// `complete_checkout`) is the verified alternative. An expired session
    /// is returned as `SessionExpired` and never upgrades the plan.
    pub async fn refresh_user(&mut self) -> Result<RefreshOutcome, StoreError> {
        let result = self.refresh_user_inner().await;
        self.record(result)
    }

    async fn refresh_user_inner(&mut self) -> Result<RefreshOutcome, StoreError> {
        if self.token.is_none() {
            return Err(StoreError::NotAuthenticated);
        }

        match self.api.fetch_profile().await {
            Ok(mut raw) => {
                // Keep local identity where the server omits it
                if let Some(local) = &self.session {
                    if raw.id.is_none() {
                        raw.id = Some(serde_json::Value::String(local.id.clone()));
                    }
                    if raw.current_address_id.is_none() {
                        raw.current_address_id = local
                            .current_address_id
                            .clone()
                            .map(serde_json::Value::String);
                    }
                }

                let session = self.commit(validate_and_clean_user_data(&raw))?;
                tracing::info!(plan = %session.plan, "profile refreshed");
                Ok(RefreshOutcome {
                    session,
                    fallback: false,
                    message: None,
                })
            }
            // An expired token goes back to login, never to the local upgrade
            Err(StoreError::SessionExpired) => Err(StoreError::SessionExpired),
            Err(e) if !e.is_remote() => Err(e),
            Err(e) => {
                let Some(mut session) = self.session.clone() else {
                    return Err(e);
                };

                tracing::warn!(
                    error = %e,
                    "profile refresh failed after payment; upgrading plan locally without server confirmation"
                );
                // Degraded upgrade
                session.plan = Plan::Pro;
                let session = self.commit(session)?;
                Ok(RefreshOutcome {
                    session,
                    fallback: true,
                    message: Some(format!(
                        "Plan activated locally, server confirmation pending: {}",
                        e
                    )),
                })
            }
        }
    }

    // ------------------------------------------------------------------
    // Dashboard data
    // ------------------------------------------------------------------

    /// Fetch the energy report for the current address, retrying transient
    /// failures, and cache its property key
    pub async fn load_property_report(&mut self) -> Result<PropertyReport, StoreError> {
        let result = self.load_property_report_inner().await;
        self.record(result)
    }

    async fn load_property_report_inner(&mut self) -> Result<PropertyReport, StoreError> {
        let session = self.require_session()?;
        let address = session
            .current_address()
            .cloned()
            .ok_or_else(|| StoreError::NotFound("No current address".to_string()))?;
        if address.id == DEFAULT_ADDRESS_ID {
            return Err(StoreError::NotFound(
                "No property address on file".to_string(),
            ));
        }

        let policy = self.config.report_retry;
        let api = &self.api;
        let report = policy
            .run(|attempt| {
                tracing::debug!(attempt, postcode = %address.postcode, "fetching property report");
                api.fetch_property_report(&address.postcode, &address.address)
            })
            .await?;

        // Cache key for the dashboard
        if let Err(e) = self.storage.save(keys::LMK_KEY, &report.lmk_key) {
            tracing::warn!(error = %e, "could not cache property key");
        }
        self.property_report = Some(report.clone());
        Ok(report)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn require_session(&self) -> Result<Session, StoreError> {
        match (&self.session, &self.token) {
            (Some(session), Some(_)) => Ok(session.clone()),
            _ => Err(StoreError::NotAuthenticated),
        }
    }

    /// Normalize, persist, then publish a new session
    pub(crate) fn commit(&mut self, session: Session) -> Result<Session, StoreError> {
        let session = normalize_session(&session);
        self.persist(&session)?;
        self.session = Some(session.clone());
        Ok(session)
    }

    fn persist(&self, session: &Session) -> Result<(), StoreError> {
        let json = serde_json::to_string(session)
            .map_err(|e| StoreError::Storage(format!("Failed to serialize session: {}", e)))?;
        self.storage.save(keys::USER, &json)
    }

    /// Put the stored user back in step with the in-memory session
    fn restore_persisted_user(&self) {
        let restored = match &self.session {
            Some(previous) => self.persist(previous),
            None => self.storage.clear(keys::USER),
        };
        if let Err(e) = restored {
            tracing::warn!(error = %e, "could not roll back persisted user");
        }
    }

    /// Keep the error field in step with an operation's result
    pub(crate) fn record<T>(&mut self, result: Result<T, StoreError>) -> Result<T, StoreError> {
        match &result {
            Ok(_) => self.error = None,
            Err(e) => {
                tracing::warn!(error = %e, "session operation failed");
                self.error = Some(e.to_string());
            }
        }
        result
    }

    fn forget_property(&mut self) {
        self.property_report = None;
        self.clear_key(keys::LMK_KEY);
    }

    fn load_key(&self, key: &str) -> Option<String> {
        self.storage.load(key).unwrap_or_else(|e| {
            tracing::warn!(key, error = %e, "failed to read storage key");
            None
        })
    }

    fn clear_key(&self, key: &str) {
        if let Err(e) = self.storage.clear(key) {
            tracing::warn!(key, error = %e, "failed to clear storage key");
        }
    }
}

/// Drop addresses beyond the plan quota, never the current one
fn retain_within_quota(session: &mut Session) {
    let max = session.plan.max_addresses();
    if session.addresses.len() <= max {
        return;
    }

    let current = session.current_address_id.clone();
    let mut others_left = max.saturating_sub(1);
    session.addresses.retain(|a| {
        if current.as_deref() == Some(a.id.as_str()) {
            return true;
        }
        if others_left > 0 {
            others_left -= 1;
            return true;
        }
        false
    });
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::session::api::{CheckoutSession, LoginResponse};
    use crate::session::retry::RetryPolicy;
    use crate::session::storage::MemoryStorage;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// How the fake answers property report requests
    #[derive(Clone, Copy, Default)]
    pub enum ReportMode {
        #[default]
        Found,
        FailTimes(u32),
        NotFound,
    }

    #[derive(Default)]
    pub struct FakeApi {
        pub login_response: Mutex<Option<Result<LoginResponse, StoreError>>>,
        pub profile_response: Mutex<Option<Result<RawUser, StoreError>>>,
        pub report_mode: Mutex<ReportMode>,
        pub report_calls: AtomicU32,
        pub bearer: Mutex<Option<String>>,
    }

    impl FakeApi {
        pub fn bearer(&self) -> Option<String> {
            self.bearer.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AccountApi for FakeApi {
        fn set_bearer_token(&self, token: Option<String>) {
            *self.bearer.lock().unwrap() = token;
        }

        async fn login(&self, _credentials: &Credentials) -> Result<LoginResponse, StoreError> {
            self.login_response
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| Err(StoreError::Network("no response".to_string())))
        }

        async fn fetch_profile(&self) -> Result<RawUser, StoreError> {
            self.profile_response
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| Err(StoreError::Network("connection refused".to_string())))
        }

        async fn create_checkout_session(&self, plan: Plan) -> Result<CheckoutSession, StoreError> {
            Ok(CheckoutSession {
                url: format!("https://checkout.example/{}", plan),
                session_id: Some("cs_test_1".to_string()),
            })
        }

        async fn fetch_property_report(
            &self,
            postcode: &str,
            address: &str,
        ) -> Result<PropertyReport, StoreError> {
            let call = self.report_calls.fetch_add(1, Ordering::SeqCst) + 1;
            match *self.report_mode.lock().unwrap() {
                ReportMode::NotFound => Err(StoreError::NotFound(postcode.to_string())),
                ReportMode::FailTimes(n) if call <= n => {
                    Err(StoreError::Network("timeout".to_string()))
                }
                _ => Ok(PropertyReport {
                    lmk_key: format!("LMK-{}", postcode),
                    address: Some(address.to_string()),
                    postcode: Some(postcode.to_string()),
                    current_energy_rating: Some("C".to_string()),
                    potential_energy_rating: Some("B".to_string()),
                    current_energy_efficiency: Some(70),
                    potential_energy_efficiency: Some(84),
                    property_type: Some("House".to_string()),
                    total_floor_area: Some(92.5),
                    lodgement_date: None,
                }),
            }
        }
    }

    pub fn test_config() -> StoreConfig {
        StoreConfig::default().with_report_retry(RetryPolicy::new(3, 0))
    }

    pub fn address(id: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "address": format!("{} Station Road", id),
            "postcode": format!("AB{} 1CD", id),
            "city": "York",
            "country": "United Kingdom"
        })
    }

    /// Store hydrated from storage holding `user` and a token
    pub fn store_with(user: serde_json::Value) -> SessionStore<MemoryStorage, FakeApi> {
        let storage = MemoryStorage::new();
        storage.save(keys::AUTH_TOKEN, "tok-1").unwrap();
        storage.save(keys::USER, &user.to_string()).unwrap();
        SessionStore::init(storage, FakeApi::default(), test_config())
    }

    pub fn pro_store(ids: &[&str], current: &str) -> SessionStore<MemoryStorage, FakeApi> {
        let addresses: Vec<_> = ids.iter().map(|id| address(id)).collect();
        store_with(serde_json::json!({
            "id": "u1",
            "name": "Ada",
            "email": "ada@example.com",
            "plan": "pro",
            "addresses": addresses,
            "currentAddressId": current
        }))
    }

    pub fn persisted_session(store: &SessionStore<MemoryStorage, FakeApi>) -> Session {
        let json = store.storage().load(keys::USER).unwrap().unwrap();
        serde_json::from_str(&json).unwrap()
    }
}
