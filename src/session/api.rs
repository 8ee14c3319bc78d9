use crate::session::config::{endpoints, StoreConfig};
use crate::session::types::{Credentials, Plan, RawUser, StoreError};
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};

// ============================================================================
// Common Response Types
// ============================================================================

/// Error body returned by the backend (`{message}` or `{error}`)
#[derive(Deserialize, Debug, Clone, Default)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ApiErrorBody {
    pub fn text(&self) -> Option<String> {
        self.message
            .clone()
            .or_else(|| self.error.clone())
            .filter(|m| !m.trim().is_empty())
    }
}

// ============================================================================
// Login / Profile
// ============================================================================

/// Response from `POST /api/auth/login`
#[derive(Deserialize, Debug, Clone)]
pub struct LoginResponse {
    pub user: RawUser,
    pub token: String,
}

/// Profile payloads come either bare or wrapped in `{ user }`
#[derive(Deserialize, Debug)]
#[serde(untagged)]
enum ProfileResponse {
    Wrapped { user: RawUser },
    Bare(RawUser),
}

impl ProfileResponse {
    fn into_user(self) -> RawUser {
        match self {
            ProfileResponse::Wrapped { user } => user,
            ProfileResponse::Bare(user) => user,
        }
    }
}

// ============================================================================
// Checkout
// ============================================================================

#[derive(Serialize, Debug)]
pub struct CheckoutRequest {
    pub plan: Plan,
}

/// Hosted checkout page the user is redirected to
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutSession {
    pub url: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

// ============================================================================
// Property Reports
// ============================================================================

/// Energy performance certificate summary for one property
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct PropertyReport {
    pub lmk_key: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub postcode: Option<String>,
    #[serde(default)]
    pub current_energy_rating: Option<String>,
    #[serde(default)]
    pub potential_energy_rating: Option<String>,
    #[serde(default)]
    pub current_energy_efficiency: Option<u32>,
    #[serde(default)]
    pub potential_energy_efficiency: Option<u32>,
    #[serde(default)]
    pub property_type: Option<String>,
    #[serde(default)]
    pub total_floor_area: Option<f64>,
    #[serde(default)]
    pub lodgement_date: Option<NaiveDate>,
}

#[derive(Deserialize, Debug)]
struct PropertySearchResponse {
    #[serde(default)]
    rows: Vec<PropertyReport>,
}

// ============================================================================
// API Seam
// ============================================================================

/// Backend operations the session store depends on
#[async_trait]
pub trait AccountApi: Send + Sync {
    /// Set or clear the bearer token attached to every later request
    fn set_bearer_token(&self, token: Option<String>);

    async fn login(&self, credentials: &Credentials) -> Result<LoginResponse, StoreError>;

    async fn fetch_profile(&self) -> Result<RawUser, StoreError>;

    async fn create_checkout_session(&self, plan: Plan) -> Result<CheckoutSession, StoreError>;

    async fn fetch_property_report(
        &self,
        postcode: &str,
        address: &str,
    ) -> Result<PropertyReport, StoreError>;
}

// ============================================================================
// HTTP Client
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq)]
enum Call {
    Login,
    Authenticated,
}

/// HTTP client for the dashboard backend
pub struct DashboardApiClient {
    client: reqwest::Client,
    base_url: String,
    token: Mutex<Option<String>>,
}

impl DashboardApiClient {
    pub fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| StoreError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            token: Mutex::new(None),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn bearer_token(&self) -> Option<String> {
        self.token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.bearer_token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        call: Call,
    ) -> Result<T, StoreError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| StoreError::Network(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            // Parse failures on a 2xx mean the backend contract changed
            return response.json::<T>().await.map_err(|e| StoreError::Api {
                status: status.as_u16(),
                message: format!("Unexpected response from server: {}", e),
            });
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiErrorBody>(&body)
            .ok()
            .and_then(|b| b.text());

        Err(map_error_status(status, message, call))
    }
}

fn map_error_status(status: StatusCode, message: Option<String>, call: Call) -> StoreError {
    match status {
        StatusCode::UNAUTHORIZED if call == Call::Login => StoreError::Api {
            status: status.as_u16(),
            message: message.unwrap_or_else(|| "Invalid email or password".to_string()),
        },
        StatusCode::UNAUTHORIZED => StoreError::SessionExpired,
        StatusCode::NOT_FOUND => {
            StoreError::NotFound(message.unwrap_or_else(|| "Resource not found".to_string()))
        }
        StatusCode::TOO_MANY_REQUESTS => StoreError::RateLimited,
        _ => StoreError::Api {
            status: status.as_u16(),
            message: message.unwrap_or_else(|| {
                status
                    .canonical_reason()
                    .unwrap_or("Request failed")
                    .to_string()
            }),
        },
    }
}

#[async_trait]
impl AccountApi for DashboardApiClient {
    fn set_bearer_token(&self, token: Option<String>) {
        *self.token.lock().unwrap_or_else(PoisonError::into_inner) = token;
    }

    async fn login(&self, credentials: &Credentials) -> Result<LoginResponse, StoreError> {
        let request = self
            .client
            .post(endpoints::login(&self.base_url))
            .json(credentials);
        self.send(request, Call::Login).await
    }

    async fn fetch_profile(&self) -> Result<RawUser, StoreError> {
        let request = self.client.get(endpoints::profile(&self.base_url));
        let profile: ProfileResponse = self.send(request, Call::Authenticated).await?;
        Ok(profile.into_user())
    }

    async fn create_checkout_session(&self, plan: Plan) -> Result<CheckoutSession, StoreError> {
        let request = self
            .client
            .post(endpoints::create_checkout_session(&self.base_url))
            .json(&CheckoutRequest { plan });
        self.send(request, Call::Authenticated).await
    }

    async fn fetch_property_report(
        &self,
        postcode: &str,
        address: &str,
    ) -> Result<PropertyReport, StoreError> {
        let request = self
            .client
            .get(endpoints::property_search(&self.base_url, postcode, address));
        let result: PropertySearchResponse = self.send(request, Call::Authenticated).await?;

        result
            .rows
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::NotFound(format!("No energy certificate for {}", postcode)))
    }
}
