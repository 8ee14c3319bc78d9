//! Normalization of user payloads into a [`Session`].
//!
//! Runs on every hydrate and every persist, so its output has to be a fixed
//! point: feeding a normalized session back in yields the same session.

use std::collections::HashSet;

use uuid::Uuid;

use crate::session::types::{Address, Plan, RawAddress, RawUser, Role, Session};

/// Placeholder injected when a user has no usable address
pub const DEFAULT_ADDRESS_ID: &str = "default-address";
pub const DEFAULT_ADDRESS_LINE: &str = "Default Address";
pub const DEFAULT_POSTCODE: &str = "00000";
pub const DEFAULT_CITY: &str = "Unknown";
pub const DEFAULT_COUNTRY: &str = "United Kingdom";

/// Turn a raw backend or persisted payload into a valid session
pub fn validate_and_clean_user_data(raw: &RawUser) -> Session {
    let plan = parse_or_default::<Plan>(raw.plan.as_deref(), "plan");
    let role = parse_or_default::<Role>(raw.role.as_deref(), "role");

    let mut addresses = clean_addresses(raw.addresses.as_deref().unwrap_or_default());
    addresses.truncate(plan.max_addresses());

    if addresses.is_empty() {
        addresses.push(default_address());
    }

    let requested = raw.current_address_id.as_ref().and_then(id_string);
    let current_address_id = requested
        .filter(|id| addresses.iter().any(|a| &a.id == id))
        .or_else(|| addresses.first().map(|a| a.id.clone()));

    let mut session = Session {
        id: raw
            .id
            .as_ref()
            .and_then(id_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        name: display_name(raw),
        email: trimmed(raw.email.as_deref()).unwrap_or_default(),
        plan,
        role,
        addresses,
        current_address_id,
    };
    session.refresh_current_flags();
    session
}

/// Re-run normalization over an already built session
pub fn normalize_session(session: &Session) -> Session {
    validate_and_clean_user_data(&RawUser::from(session))
}

pub fn default_address() -> Address {
    Address {
        id: DEFAULT_ADDRESS_ID.to_string(),
        address: DEFAULT_ADDRESS_LINE.to_string(),
        postcode: DEFAULT_POSTCODE.to_string(),
        city: DEFAULT_CITY.to_string(),
        country: DEFAULT_COUNTRY.to_string(),
        is_current: true,
    }
}

fn display_name(raw: &RawUser) -> String {
    let parts: Vec<String> = [raw.first_name.as_deref(), raw.last_name.as_deref()]
        .into_iter()
        .filter_map(trimmed)
        .collect();

    if !parts.is_empty() {
        return parts.join(" ");
    }

    trimmed(raw.name.as_deref()).unwrap_or_default()
}

fn clean_addresses(raw: &[serde_json::Value]) -> Vec<Address> {
    let mut seen = HashSet::new();
    let mut cleaned = Vec::with_capacity(raw.len());

    for value in raw {
        let Ok(entry) = serde_json::from_value::<RawAddress>(value.clone()) else {
            tracing::debug!("dropping malformed address entry");
            continue;
        };

        let line = trimmed(entry.address.as_deref()).or_else(|| trimmed(entry.street.as_deref()));
        let postcode = trimmed(entry.postcode.as_deref()).or_else(|| trimmed(entry.zip.as_deref()));
        let (Some(line), Some(postcode)) = (line, postcode) else {
            tracing::debug!("dropping address without line or postcode");
            continue;
        };

        let id = entry
            .id
            .as_ref()
            .and_then(id_string)
            .filter(|id| !seen.contains(id))
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        seen.insert(id.clone());

        cleaned.push(Address {
            id,
            address: line,
            postcode,
            city: trimmed(entry.city.as_deref()).unwrap_or_default(),
            country: trimmed(entry.country.as_deref()).unwrap_or_default(),
            is_current: false,
        });
    }

    cleaned
}

fn parse_or_default<T>(value: Option<&str>, field: &str) -> T
where
    T: std::str::FromStr + Default,
{
    match value {
        None => T::default(),
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(field, value = raw, "unrecognized value in user payload, using default");
            T::default()
        }),
    }
}

/// Ids arrive as strings or numbers depending on the endpoint
pub(crate) fn id_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => trimmed(Some(s)),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn trimmed(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: serde_json::Value) -> RawUser {
        serde_json::from_value(value).unwrap()
    }

    fn addresses(count: usize) -> serde_json::Value {
        (1..=count)
            .map(|i| json!({ "id": i, "address": format!("{} High St", i), "postcode": "AB1 2CD" }))
            .collect()
    }

    #[test]
    fn test_missing_addresses_injects_default() {
        let session = validate_and_clean_user_data(&raw(json!({ "email": "a@b.c" })));

        assert_eq!(session.addresses.len(), 1);
        assert_eq!(session.addresses[0].id, DEFAULT_ADDRESS_ID);
        assert!(session.addresses[0].is_current);
        assert_eq!(session.current_address_id.as_deref(), Some(DEFAULT_ADDRESS_ID));
    }

    #[test]
    fn test_malformed_addresses_dropped() {
        let session = validate_and_clean_user_data(&raw(json!({
            "plan": "pro",
            "addresses": [
                "not an object",
                { "id": 1, "address": "1 High St" },
                { "id": 2, "postcode": "AB1 2CD" },
                { "id": 3, "street": "3 Low Rd", "zip": "ZZ9 9ZZ", "city": "Leeds" }
            ]
        })));

        assert_eq!(session.addresses.len(), 1);
        let kept = &session.addresses[0];
        assert_eq!(kept.id, "3");
        assert_eq!(kept.address, "3 Low Rd");
        assert_eq!(kept.postcode, "ZZ9 9ZZ");
        assert_eq!(kept.city, "Leeds");
    }

    #[test]
    fn test_basic_plan_truncates_to_one() {
        let session = validate_and_clean_user_data(&raw(json!({
            "plan": "basic",
            "addresses": addresses(5)
        })));
        assert_eq!(session.addresses.len(), 1);
        assert_eq!(session.addresses[0].id, "1");
    }

    #[test]
    fn test_pro_plan_truncates_to_quota() {
        let session = validate_and_clean_user_data(&raw(json!({
            "plan": "pro",
            "addresses": addresses(130)
        })));
        assert_eq!(session.addresses.len(), 100);
    }

    #[test]
    fn test_name_coalescing() {
        let from_parts = validate_and_clean_user_data(&raw(json!({
            "firstName": " Ada ", "lastName": "Lovelace", "name": "ignored"
        })));
        assert_eq!(from_parts.name, "Ada Lovelace");

        let from_name = validate_and_clean_user_data(&raw(json!({ "name": "Grace" })));
        assert_eq!(from_name.name, "Grace");
    }

    #[test]
    fn test_missing_ids_assigned_and_unique() {
        let session = validate_and_clean_user_data(&raw(json!({
            "plan": "pro",
            "addresses": [
                { "address": "1 High St", "postcode": "A1" },
                { "id": "x", "address": "2 High St", "postcode": "A2" },
                { "id": "x", "address": "3 High St", "postcode": "A3" }
            ]
        })));

        let ids: HashSet<_> = session.addresses.iter().map(|a| a.id.clone()).collect();
        assert_eq!(ids.len(), 3);
        assert!(session.addresses.iter().all(|a| !a.id.is_empty()));
        assert!(!session.id.is_empty());
    }

    #[test]
    fn test_current_address_kept_when_present() {
        let session = validate_and_clean_user_data(&raw(json!({
            "plan": "pro",
            "addresses": addresses(3),
            "currentAddressId": 2
        })));

        assert_eq!(session.current_address_id.as_deref(), Some("2"));
        let flags: Vec<bool> = session.addresses.iter().map(|a| a.is_current).collect();
        assert_eq!(flags, vec![false, true, false]);
    }

    #[test]
    fn test_dangling_current_address_defaults_to_first() {
        let session = validate_and_clean_user_data(&raw(json!({
            "plan": "pro",
            "addresses": addresses(2),
            "currentAddressId": "gone"
        })));
        assert_eq!(session.current_address_id.as_deref(), Some("1"));
        assert_eq!(session.addresses.iter().filter(|a| a.is_current).count(), 1);
    }

    #[test]
    fn test_unknown_plan_falls_back_to_free() {
        let session = validate_and_clean_user_data(&raw(json!({ "plan": "Enterprise", "role": "admin" })));
        assert_eq!(session.plan, Plan::Free);
        assert_eq!(session.role, Role::Admin);
    }

    #[test]
    fn test_idempotent() {
        let inputs = [
            json!({}),
            json!({ "plan": "basic", "addresses": addresses(4), "currentAddressId": 3 }),
            json!({ "plan": "pro", "firstName": "Ada", "addresses": addresses(120) }),
            json!({ "plan": "pro", "addresses": [{ "street": "x", "zip": "y" }, { "address": "only line" }] }),
        ];

        for input in inputs {
            let once = validate_and_clean_user_data(&raw(input));
            let twice = normalize_session(&once);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_survives_json_round_trip() {
        let once = validate_and_clean_user_data(&raw(json!({ "plan": "pro", "addresses": addresses(2) })));
        let stored = serde_json::to_string(&once).unwrap();
        let restored: RawUser = serde_json::from_str(&stored).unwrap();
        assert_eq!(validate_and_clean_user_data(&restored), once);
    }
}
