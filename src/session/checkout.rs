//! Subscription checkout: pending plan selection, hosted checkout creation and
//! post-payment confirmation.
//!
//! Confirmation prefers a server-issued receipt signed with Ed25519. Without
//! one, the store falls back to [`SessionStore::refresh_user`], which trusts
//! the payment redirect and upgrades the plan locally if the backend cannot
//! be reached.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::session::api::{AccountApi, CheckoutSession};
use crate::session::config::{keys, RECEIPT_MAX_AGE_HOURS};
use crate::session::manager::SessionStore;
use crate::session::storage::KeyValueStore;
use crate::session::types::{Plan, RefreshOutcome, StoreError};

/// Allowed clock skew between the receipt issuer and this client
const RECEIPT_CLOCK_SKEW_MINUTES: i64 = 5;

/// Signed content of a checkout receipt
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptPayload {
    pub session_id: String,
    pub plan: Plan,
    pub issued_at: DateTime<Utc>,
}

/// Verifies `base64url(payload) "." base64url(signature)` receipt tokens
pub struct ReceiptVerifier {
    key: VerifyingKey,
}

impl ReceiptVerifier {
    /// Build from a standard base64 encoded 32 byte public key
    pub fn from_base64(public_key: &str) -> Result<Self, StoreError> {
        let bytes = STANDARD
            .decode(public_key.trim())
            .map_err(|e| StoreError::Validation(format!("Invalid receipt public key: {}", e)))?;
        let bytes: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::Validation("Receipt public key must be 32 bytes".to_string()))?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| StoreError::Validation(format!("Invalid receipt public key: {}", e)))?;

        Ok(Self { key })
    }

    pub fn verify(&self, token: &str) -> Result<ReceiptPayload, StoreError> {
        self.verify_at(token, Utc::now())
    }

    pub fn verify_at(&self, token: &str, now: DateTime<Utc>) -> Result<ReceiptPayload, StoreError> {
        let (payload_part, signature_part) = token
            .trim()
            .split_once('.')
            .ok_or(StoreError::SignatureInvalid)?;

        let payload_bytes = URL_SAFE_NO_PAD
            .decode(payload_part)
            .map_err(|_| StoreError::SignatureInvalid)?;
        let signature_bytes = URL_SAFE_NO_PAD
            .decode(signature_part)
            .map_err(|_| StoreError::SignatureInvalid)?;
        let signature =
            Signature::from_slice(&signature_bytes).map_err(|_| StoreError::SignatureInvalid)?;

        self.key
            .verify(&payload_bytes, &signature)
            .map_err(|_| StoreError::SignatureInvalid)?;

        // Only trusted after the signature check
        let payload: ReceiptPayload = serde_json::from_slice(&payload_bytes)
            .map_err(|e| StoreError::Validation(format!("Malformed receipt payload: {}", e)))?;

        if payload.issued_at > now + Duration::minutes(RECEIPT_CLOCK_SKEW_MINUTES) {
            return Err(StoreError::Validation("Receipt issued in the future".to_string()));
        }
        if now - payload.issued_at > Duration::hours(RECEIPT_MAX_AGE_HOURS) {
            return Err(StoreError::ReceiptExpired);
        }
        if !payload.plan.is_purchasable() {
            return Err(StoreError::Validation(format!(
                "Receipt names a plan that cannot be purchased: {}",
                payload.plan
            )));
        }

        Ok(payload)
    }
}

impl<S: KeyValueStore, A: AccountApi> SessionStore<S, A> {
    /// Plan chosen before the redirect to checkout, if any
    pub fn pending_plan(&self) -> Option<Plan> {
        match self.storage().load(keys::SELECTED_PLAN) {
            Ok(value) => value.and_then(|v| v.parse().ok()),
            Err(e) => {
                tracing::warn!(error = %e, "could not read pending plan");
                None
            }
        }
    }

    /// Remember the selected plan and create a hosted checkout session
    pub async fn begin_checkout(&mut self, plan: &str) -> Result<CheckoutSession, StoreError> {
        let result = self.begin_checkout_inner(plan).await;
        self.record(result)
    }

    async fn begin_checkout_inner(&mut self, plan: &str) -> Result<CheckoutSession, StoreError> {
        // Check the plan can be bought
        let plan: Plan = plan.parse()?;
        if !plan.is_purchasable() {
            return Err(StoreError::Validation(format!("Plan {} cannot be purchased", plan)));
        }
        if !self.is_authenticated() {
            return Err(StoreError::NotAuthenticated);
        }

        self.storage().save(keys::SELECTED_PLAN, plan.as_str())?;
        let session = self.api().create_checkout_session(plan).await?;

        // Remember which checkout a receipt has to name
        match &session.session_id {
            Some(id) => self.storage().save(keys::CHECKOUT_SESSION, id)?,
            None => self.storage().clear(keys::CHECKOUT_SESSION)?,
        }
        tracing::info!(%plan, session_id = ?session.session_id, "checkout session created");
        Ok(session)
    }

    /// Confirm a plan change after the payment redirect
    ///
    /// A receipt is only honoured when a receipt public key is configured, its
    /// signature verifies and it names the checkout session started by
    /// [`SessionStore::begin_checkout`]. Otherwise the profile is refreshed, with the
    /// degraded fallback described on [`SessionStore::refresh_user`].
    pub async fn complete_checkout(
        &mut self,
        receipt: Option<&str>,
    ) -> Result<RefreshOutcome, StoreError> {
        let public_key = self.config().receipt_public_key.clone();
        let verifier = match (receipt, public_key.as_deref()) {
            (Some(_), Some(key)) => match ReceiptVerifier::from_base64(key) {
                Ok(verifier) => Some(verifier),
                Err(e) => return self.record(Err(e)),
            },
            (Some(_), None) => {
                tracing::warn!("receipt supplied but no receipt key configured, refreshing profile instead");
                None
            }
            _ => None,
        };

        let outcome = match (receipt, verifier) {
            (Some(token), Some(verifier)) => {
                let result = self.apply_receipt(&verifier, token);
                self.record(result)?
            }
            _ => self.refresh_user().await?,
        };

        // Checkout is settled either way
        for key in [keys::SELECTED_PLAN, keys::CHECKOUT_SESSION] {
            if let Err(e) = self.storage().clear(key) {
                tracing::warn!(key, error = %e, "could not clear pending checkout");
            }
        }
        Ok(outcome)
    }

    fn apply_receipt(
        &mut self,
        verifier: &ReceiptVerifier,
        token: &str,
    ) -> Result<RefreshOutcome, StoreError> {
        let payload = verifier.verify(token)?;
        let mut session = self.session().cloned().ok_or(StoreError::NotAuthenticated)?;

        // Receipt must name the checkout this client started
        let pending = self.storage().load(keys::CHECKOUT_SESSION)?;
        if pending.as_deref() != Some(payload.session_id.as_str()) {
            tracing::warn!(
                receipt_session = %payload.session_id,
                pending_session = ?pending,
                "receipt does not match the pending checkout"
            );
            return Err(StoreError::ReceiptMismatch);
        }

        // Save updated state
        session.plan = payload.plan;
        let session = self.commit(session)?;

        tracing::info!(plan = %payload.plan, session_id = %payload.session_id, "plan confirmed by signed receipt");
        Ok(RefreshOutcome {
            session,
            fallback: false,
            message: None,
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    pub fn signing_key() -> SigningKey {
        SigningKey::from_bytes(&[7u8; 32])
    }

    pub fn public_key_base64() -> String {
        STANDARD.encode(signing_key().verifying_key().to_bytes())
    }

    pub fn sign(payload: &ReceiptPayload) -> String {
        let bytes = serde_json::to_vec(payload).unwrap();
        let signature = signing_key().sign(&bytes);
        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&bytes),
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        )
    }

    pub fn receipt(plan: Plan, issued_at: DateTime<Utc>) -> String {
        sign(&ReceiptPayload {
            session_id: "cs_test_1".to_string(),
            plan,
            issued_at,
        })
    }
}
