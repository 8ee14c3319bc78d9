use std::time::Duration;

use crate::session::retry::RetryPolicy;

/// Dashboard backend URL
pub const API_SERVER_URL: &str = "https://api.energydashboard.app";

/// HTTP request timeout
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Address quotas per plan
pub const FREE_MAX_ADDRESSES: usize = 1;
pub const BASIC_MAX_ADDRESSES: usize = 1;
pub const PRO_MAX_ADDRESSES: usize = 100;

/// Signed checkout receipts older than this are rejected
pub const RECEIPT_MAX_AGE_HOURS: i64 = 24;

/// Property report fetch retry configuration
pub const REPORT_FETCH_ATTEMPTS: u32 = 3;
pub const REPORT_FETCH_DELAY_MS: u64 = 1000;

/// Environment overrides
pub const ENV_API_URL: &str = "ENERGY_DASHBOARD_API_URL";
pub const ENV_REQUEST_TIMEOUT: &str = "ENERGY_DASHBOARD_TIMEOUT_SECS";
pub const ENV_RECEIPT_PUBLIC_KEY: &str = "ENERGY_DASHBOARD_RECEIPT_KEY";

/// Local storage keys
pub mod keys {
    pub const AUTH_TOKEN: &str = "authToken";
    pub const USER: &str = "user";
    pub const LMK_KEY: &str = "lmkKey";
    pub const SELECTED_PLAN: &str = "selectedPlan";
    pub const CHECKOUT_SESSION: &str = "checkoutSessionId";
}

/// Default file used by the native storage backend
pub const STORAGE_DIR_NAME: &str = "energy-dashboard";
pub const STORAGE_FILE_NAME: &str = "local-storage.json";

/// API endpoints
pub mod endpoints {
    pub fn login(base: &str) -> String {
        format!("{}/api/auth/login", base)
    }

    pub fn profile(base: &str) -> String {
        format!("{}/api/auth/me", base)
    }

    pub fn create_checkout_session(base: &str) -> String {
        format!("{}/api/payments/create-checkout-session", base)
    }

    pub fn property_search(base: &str, postcode: &str, address: &str) -> String {
        format!(
            "{}/api/epc/search?postcode={}&address={}",
            base,
            urlencoding::encode(postcode),
            urlencoding::encode(address)
        )
    }
}

/// Runtime configuration for the API client and store
#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub api_base_url: String,
    pub request_timeout: Duration,
    pub report_retry: RetryPolicy,
    /// Base64 Ed25519 public key used to verify checkout receipts
    pub receipt_public_key: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            api_base_url: API_SERVER_URL.to_string(),
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            report_retry: RetryPolicy::default(),
            receipt_public_key: None,
        }
    }
}

impl StoreConfig {
    /// Defaults overridden by `ENERGY_DASHBOARD_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup(ENV_API_URL).filter(|v| !v.trim().is_empty()) {
            config.api_base_url = url.trim().trim_end_matches('/').to_string();
        }

        if let Some(raw) = lookup(ENV_REQUEST_TIMEOUT) {
            match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => config.request_timeout = Duration::from_secs(secs),
                _ => tracing::warn!(value = %raw, "ignoring invalid {}", ENV_REQUEST_TIMEOUT),
            }
        }

        config.receipt_public_key = lookup(ENV_RECEIPT_PUBLIC_KEY).filter(|v| !v.trim().is_empty());

        config
    }

    pub fn with_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_report_retry(mut self, retry: RetryPolicy) -> Self {
        self.report_retry = retry;
        self
    }

    pub fn with_receipt_public_key(mut self, key: impl Into<String>) -> Self {
        self.receipt_public_key = Some(key.into());
        self
    }
}
