use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::session::config::{BASIC_MAX_ADDRESSES, FREE_MAX_ADDRESSES, PRO_MAX_ADDRESSES};

/// Subscription tier
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    #[default]
    Free,
    Basic,
    Pro,
}

impl Plan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Basic => "basic",
            Plan::Pro => "pro",
        }
    }

    /// Maximum number of addresses a session on this plan may hold
    pub fn max_addresses(&self) -> usize {
        match self {
            Plan::Free => FREE_MAX_ADDRESSES,
            Plan::Basic => BASIC_MAX_ADDRESSES,
            Plan::Pro => PRO_MAX_ADDRESSES,
        }
    }

    /// Plans that can be bought through checkout
    pub fn is_purchasable(&self) -> bool {
        matches!(self, Plan::Basic | Plan::Pro)
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Plan {
    type Err = StoreError;

    // Identifiers are exchanged with the backend as exact lowercase strings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(Plan::Free),
            "basic" => Ok(Plan::Basic),
            "pro" => Ok(Plan::Pro),
            other => Err(StoreError::Validation(format!("Unknown plan: {}", other))),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Admin,
}

impl FromStr for Role {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            other => Err(StoreError::Validation(format!("Unknown role: {}", other))),
        }
    }
}

/// A property address owned by the session
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Address {
    pub id: String,
    /// First address line
    pub address: String,
    pub postcode: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub country: String,
    /// Derived from `Session::current_address_id`, never set on its own
    #[serde(default)]
    pub is_current: bool,
}

/// Normalized client-side profile of the logged in user
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub name: String,
    pub email: String,
    pub plan: Plan,
    pub role: Role,
    pub addresses: Vec<Address>,
    pub current_address_id: Option<String>,
}

impl Session {
    pub fn current_address(&self) -> Option<&Address> {
        let current = self.current_address_id.as_deref()?;
        self.find_address(current)
    }

    pub fn find_address(&self, id: &str) -> Option<&Address> {
        self.addresses.iter().find(|a| a.id == id)
    }

    pub fn has_address(&self, id: &str) -> bool {
        self.find_address(id).is_some()
    }

    /// Recompute every `is_current` flag from `current_address_id`
    pub fn refresh_current_flags(&mut self) {
        let current = self.current_address_id.clone();
        for address in &mut self.addresses {
            address.is_current = current.as_deref() == Some(address.id.as_str());
        }
    }

    pub fn is_at_capacity(&self) -> bool {
        self.addresses.len() >= self.plan.max_addresses()
    }
}

/// User payload as the backend sends it, before normalization
///
/// Addresses are kept as raw JSON so a single malformed entry can be dropped
/// without failing the whole payload.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RawUser {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addresses: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_address_id: Option<serde_json::Value>,
}

/// Address entry inside a raw user payload
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RawAddress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub street: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postcode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

impl From<&Address> for RawAddress {
    fn from(address: &Address) -> Self {
        RawAddress {
            id: Some(serde_json::Value::String(address.id.clone())),
            address: Some(address.address.clone()),
            street: None,
            postcode: Some(address.postcode.clone()),
            zip: None,
            city: Some(address.city.clone()),
            country: Some(address.country.clone()),
        }
    }
}

impl From<&Session> for RawUser {
    fn from(session: &Session) -> Self {
        let addresses = session
            .addresses
            .iter()
            .map(RawAddress::from)
            .filter_map(|a| serde_json::to_value(a).ok())
            .collect();

        RawUser {
            id: Some(serde_json::Value::String(session.id.clone())),
            first_name: None,
            last_name: None,
            name: Some(session.name.clone()),
            email: Some(session.email.clone()),
            plan: Some(session.plan.as_str().to_string()),
            role: Some(match session.role {
                Role::User => "user".to_string(),
                Role::Admin => "admin".to_string(),
            }),
            addresses: Some(addresses),
            current_address_id: session
                .current_address_id
                .clone()
                .map(serde_json::Value::String),
        }
    }
}

/// Address submitted from the "add address" form
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct NewAddress {
    #[serde(default)]
    pub street: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub zip: String,
    #[serde(default)]
    pub country: String,
}

impl NewAddress {
    /// Names of required fields that are blank
    pub fn missing_fields(&self) -> Vec<&'static str> {
        [
            ("street", &self.street),
            ("city", &self.city),
            ("zip", &self.zip),
            ("country", &self.country),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name)
        .collect()
    }
}

/// Login form input
#[derive(Serialize, Clone)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Result of a mutation for presentation layers
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OperationResult {
    pub success: bool,
    pub message: Option<String>,
}

impl<T> From<&Result<T, StoreError>> for OperationResult {
    fn from(result: &Result<T, StoreError>) -> Self {
        match result {
            Ok(_) => OperationResult {
                success: true,
                message: None,
            },
            Err(e) => OperationResult {
                success: false,
                message: Some(e.to_string()),
            },
        }
    }
}

/// Outcome of a profile refresh
#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RefreshOutcome {
    pub session: Session,
    /// True when the backend could not be reached and the plan was upgraded
    /// locally instead
    pub fallback: bool,
    pub message: Option<String>,
}

/// Entitlement view for the frontend
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub authenticated: bool,
    pub plan: Plan,
    pub role: Role,
    pub address_count: usize,
    pub max_addresses: usize,
    pub can_add_address: bool,
    pub can_switch_address: bool,
    pub can_delete_address: bool,
    pub current_address: Option<Address>,
}

impl SessionInfo {
    pub fn anonymous() -> Self {
        SessionInfo {
            authenticated: false,
            plan: Plan::Free,
            role: Role::User,
            address_count: 0,
            max_addresses: Plan::Free.max_addresses(),
            can_add_address: false,
            can_switch_address: false,
            can_delete_address: false,
            current_address: None,
        }
    }
}

impl From<&Session> for SessionInfo {
    fn from(session: &Session) -> Self {
        let plan = session.plan;
        SessionInfo {
            authenticated: true,
            plan,
            role: session.role,
            address_count: session.addresses.len(),
            max_addresses: plan.max_addresses(),
            can_add_address: plan != Plan::Basic && !session.is_at_capacity(),
            can_switch_address: plan == Plan::Pro && session.addresses.len() > 1,
            can_delete_address: plan != Plan::Basic && session.addresses.len() > 1,
            current_address: session.current_address().cloned(),
        }
    }
}

/// Error types for session operations
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Address limit reached ({max} allowed on this plan)")]
    QuotaExceeded { max: usize },

    #[error("Cannot delete the only remaining address")]
    LastAddress,

    #[error("Network error: {0}")]
    Network(String),

    #[error("{message}")]
    Api { status: u16, message: String },

    #[error("Session expired, please log in again")]
    SessionExpired,

    #[error("Not logged in")]
    NotAuthenticated,

    #[error("Rate limited")]
    RateLimited,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Receipt signature verification failed")]
    SignatureInvalid,

    #[error("Receipt expired")]
    ReceiptExpired,

    #[error("Receipt does not match the pending checkout")]
    ReceiptMismatch,
}

impl StoreError {
    /// Failures where the backend was unreachable or refused the request
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            StoreError::Network(_)
                | StoreError::Api { .. }
                | StoreError::SessionExpired
                | StoreError::NotFound(_)
                | StoreError::RateLimited
        )
    }
}

impl Serialize for StoreError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_parsing_is_case_sensitive() {
        assert_eq!("pro".parse::<Plan>().unwrap(), Plan::Pro);
        assert!("Pro".parse::<Plan>().is_err());
        assert!("enterprise".parse::<Plan>().is_err());
    }

    #[test]
    fn test_plan_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Plan::Basic).unwrap(), "\"basic\"");
    }

    #[test]
    fn test_new_address_missing_fields() {
        let input = NewAddress {
            street: "1 High St".to_string(),
            city: "  ".to_string(),
            zip: String::new(),
            country: "UK".to_string(),
        };
        assert_eq!(input.missing_fields(), vec!["city", "zip"]);
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let credentials = Credentials {
            email: "a@b.c".to_string(),
            password: "hunter2".to_string(),
        };
        assert!(!format!("{:?}", credentials).contains("hunter2"));
    }

    #[test]
    fn test_operation_result_from_error() {
        let result: Result<(), StoreError> = Err(StoreError::LastAddress);
        let view = OperationResult::from(&result);
        assert!(!view.success);
        assert_eq!(
            view.message.as_deref(),
            Some("Cannot delete the only remaining address")
        );
    }

    #[test]
    fn test_error_serializes_as_message() {
        let json = serde_json::to_string(&StoreError::QuotaExceeded { max: 100 }).unwrap();
        assert_eq!(json, "\"Address limit reached (100 allowed on this plan)\"");
    }
}
