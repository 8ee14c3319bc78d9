// Session and entitlement module
// Who is logged in, which plan they hold, which address is active

pub mod types;
pub mod config;
pub mod storage;
pub mod normalize;
pub mod retry;
pub mod api;
pub mod manager;
pub mod checkout;

pub use types::*;
pub use config::StoreConfig;
pub use api::{AccountApi, CheckoutSession, DashboardApiClient, PropertyReport};
pub use checkout::{ReceiptPayload, ReceiptVerifier};
pub use manager::SessionStore;
pub use normalize::validate_and_clean_user_data;
pub use storage::{FileStorage, KeyValueStore, MemoryStorage};
