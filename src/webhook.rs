//! Settlement webhooks
//!
//! Signature: `hex(HMAC-SHA256(secret, "{timestamp}.{raw_body}"))`, or over
//! the raw body alone in legacy mode. Comparison is constant-time and the
//! timestamp must be within `tolerance_secs` of now.
//!
//! Verified events drive the ledger: deposits arrive as pending entries and
//! are flipped to settled by a later `entry_settled` event.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::config::WebhookConfig;
use crate::core_types::{Cents, UserId};
use crate::error::EngineError;
use crate::ledger::{JournalEntry, Ledger, PostEntryRequest, Posting};

type HmacSha256 = Hmac<Sha256>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WebhookError {
    #[error("Missing webhook signature")]
    MissingSignature,

    #[error("Missing webhook timestamp")]
    MissingTimestamp,

    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Webhook timestamp outside tolerance ({skew_secs}s skew)")]
    StaleTimestamp { skew_secs: i64 },

    #[error("Webhook verification is not configured")]
    NotConfigured,

    #[error("Malformed webhook payload: {0}")]
    MalformedPayload(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl WebhookError {
    pub fn http_status(&self) -> u16 {
        match self {
            WebhookError::MissingSignature
            | WebhookError::MissingTimestamp
            | WebhookError::InvalidSignature
            | WebhookError::StaleTimestamp { .. } => 401,
            WebhookError::MalformedPayload(_) => 400,
            WebhookError::NotConfigured => 500,
            WebhookError::Engine(e) => e.http_status(),
        }
    }
}

pub struct WebhookVerifier {
    secret: String,
    tolerance_secs: i64,
    legacy_mode: bool,
}

impl WebhookVerifier {
    pub fn new(config: &WebhookConfig) -> Self {
        Self {
            secret: config.secret.clone(),
            tolerance_secs: config.tolerance_secs,
            legacy_mode: config.legacy_mode,
        }
    }

    fn mac(&self, timestamp: Option<i64>, body: &[u8]) -> Result<HmacSha256, WebhookError> {
        if self.secret.is_empty() {
            return Err(WebhookError::NotConfigured);
        }
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|_| WebhookError::NotConfigured)?;
        if !self.legacy_mode {
            let ts = timestamp.ok_or(WebhookError::MissingTimestamp)?;
            mac.update(ts.to_string().as_bytes());
            mac.update(b".");
        }
        mac.update(body);
        Ok(mac)
    }

    /// Signature a sender would attach. Used by tests and replay tooling.
    pub fn sign(&self, timestamp: i64, body: &[u8]) -> Result<String, WebhookError> {
        let mac = self.mac(Some(timestamp), body)?;
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    pub fn verify(
        &self,
        signature: Option<&str>,
        timestamp: Option<i64>,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Result<(), WebhookError> {
        let signature = signature
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or(WebhookError::MissingSignature)?;
        let signature = signature.strip_prefix("sha256=").unwrap_or(signature);

        if !self.legacy_mode {
            let ts = timestamp.ok_or(WebhookError::MissingTimestamp)?;
            let skew_secs = (now.timestamp() - ts).abs();
            if skew_secs > self.tolerance_secs {
                return Err(WebhookError::StaleTimestamp { skew_secs });
            }
        }

        let presented = hex::decode(signature).map_err(|_| WebhookError::InvalidSignature)?;
        self.mac(timestamp, body)?
            .verify_slice(&presented)
            .map_err(|_| WebhookError::InvalidSignature)
    }
}

/// Events a settlement provider posts to us
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WebhookEvent {
    /// Cash arrived for a user; booked pending until settled
    Deposit {
        source: String,
        external_id: String,
        user_id: UserId,
        amount_cents: Cents,
    },
    /// A previously booked entry has settled
    EntrySettled { source: String, external_id: String },
}

pub struct WebhookHandler {
    verifier: WebhookVerifier,
    ledger: Arc<Ledger>,
}

impl WebhookHandler {
    pub fn new(config: &WebhookConfig, ledger: Arc<Ledger>) -> Self {
        Self {
            verifier: WebhookVerifier::new(config),
            ledger,
        }
    }

    pub fn verifier(&self) -> &WebhookVerifier {
        &self.verifier
    }

    /// Verify and apply one delivery. Redeliveries are idempotent.
    pub async fn handle(
        &self,
        signature: Option<&str>,
        timestamp: Option<i64>,
        body: &[u8],
    ) -> Result<JournalEntry, WebhookError> {
        if let Err(e) = self.verifier.verify(signature, timestamp, body, Utc::now()) {
            tracing::warn!(error = %e, "Webhook rejected");
            return Err(e);
        }
        let event: WebhookEvent = serde_json::from_slice(body)
            .map_err(|e| WebhookError::MalformedPayload(e.to_string()))?;

        let entry = match event {
            WebhookEvent::Deposit {
                source,
                external_id,
                user_id,
                amount_cents,
            } => {
                if amount_cents <= 0 {
                    return Err(WebhookError::MalformedPayload(format!(
                        "deposit amount must be positive, got {amount_cents}"
                    )));
                }
                let cash = self.ledger.cash_account(user_id).await?;
                let house = self.ledger.house_accounts().await?;
                self.ledger
                    .post_entry(
                        PostEntryRequest::new(
                            source,
                            external_id,
                            "deposit",
                            vec![
                                Posting::new(house.clearing.account_id, -amount_cents),
                                Posting::new(cash.account_id, amount_cents),
                            ],
                        )
                        .pending()
                        .cross_user(),
                    )
                    .await?
            }
            WebhookEvent::EntrySettled {
                source,
                external_id,
            } => self.ledger.settle_entry(&source, &external_id).await?,
        };
        tracing::info!(
            source = %entry.external_source,
            external_id = %entry.external_id,
            status = ?entry.status,
            "Webhook applied"
        );
        Ok(entry)
    }
}
