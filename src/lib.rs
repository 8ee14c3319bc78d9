//! Client core of the property energy-performance dashboard.
//!
//! The [`session`] module owns the logged in user's profile, subscription
//! plan and address list, keeps them in local storage, and talks to the
//! dashboard backend for login, profile refresh, checkout and property
//! reports.

pub mod session;

pub use session::{
    Address, Credentials, DashboardApiClient, FileStorage, KeyValueStore, MemoryStorage,
    NewAddress, Plan, Role, Session, SessionInfo, SessionStore, StoreConfig, StoreError,
};

/// Store backed by the on-disk storage file and the HTTP client, configured
/// from the environment
pub fn open_default_store() -> Result<SessionStore<FileStorage, DashboardApiClient>, StoreError> {
    let config = StoreConfig::from_env();
    let storage = FileStorage::default_location()?;
    let api = DashboardApiClient::new(&config)?;
    tracing::debug!(api = %config.api_base_url, path = %storage.path().display(), "opening session store");
    Ok(SessionStore::init(storage, api, config))
}
