//! Payment gateway adapter.
//!
//! The ledger only sees the narrow [`PaymentGateway`] capability: create an
//! intent, read its status back, refund it. [`StripeGateway`] talks to the
//! Stripe REST API; [`SandboxGateway`] keeps intents in process for local runs
//! and tests.
//!
//! Calls are never retried here. A timeout or a provider rejection surfaces
//! as [`GatewayError`] and the retry decision belongs to the caller.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use giftpool_protocol::ReportedStatus;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("unknown payment intent: {0}")]
    UnknownIntent(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

/// A freshly created payment intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub intent_id: String,
    pub client_secret: String,
}

/// Provider view of an intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentStatus {
    pub status: ReportedStatus,
    pub amount_received: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundReceipt {
    pub refund_id: String,
    pub status: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Create a payment intent for `amount` (smallest currency unit).
    async fn create_intent(
        &self,
        amount: i64,
        currency: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<PaymentIntent, GatewayError>;

    /// Read the current status of an intent.
    async fn retrieve_intent(&self, intent_id: &str) -> Result<IntentStatus, GatewayError>;

    /// Refund `amount` of a captured intent. `idempotency_key` makes repeated
    /// attempts for the same contribution collapse into one refund.
    async fn refund(
        &self,
        intent_id: &str,
        amount: i64,
        idempotency_key: &str,
    ) -> Result<RefundReceipt, GatewayError>;
}

// ─────────────────────────────────────────────────────────
// Stripe
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct StripeIntent {
    id: String,
    status: String,
    #[serde(default)]
    client_secret: Option<String>,
    #[serde(default)]
    amount_received: i64,
}

#[derive(Debug, Deserialize)]
struct StripeRefund {
    id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    error: StripeErrorDetail,
}

#[derive(Debug, Deserialize)]
struct StripeErrorDetail {
    message: Option<String>,
    code: Option<String>,
}

pub struct StripeGateway {
    client: Client,
    api_base: String,
    secret_key: String,
}

impl StripeGateway {
    pub fn new(secret_key: &str, api_base: &str, timeout: Duration) -> Result<Self, GatewayError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            secret_key: secret_key.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.api_base, path)
    }

    async fn read<T: serde::de::DeserializeOwned>(
        resp: reqwest::Response,
    ) -> Result<T, GatewayError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp.json().await?);
        }

        let message = match resp.json::<StripeErrorBody>().await {
            Ok(body) => {
                let detail = body.error;
                match (detail.code, detail.message) {
                    (Some(code), Some(msg)) => format!("{code}: {msg}"),
                    (None, Some(msg)) => msg,
                    (Some(code), None) => code,
                    (None, None) => "no error detail".to_string(),
                }
            }
            Err(_) => "unreadable error body".to_string(),
        };
        warn!(status = status.as_u16(), %message, "Stripe request rejected");
        Err(GatewayError::Rejected {
            status: status.as_u16(),
            message,
        })
    }
}

/// Map a Stripe PaymentIntent status onto the reconciliation vocabulary.
///
/// `requires_payment_method` after a declined attempt is left pending: the
/// client may attach another card to the same intent.
pub fn map_stripe_status(status: &str) -> ReportedStatus {
    match status {
        "succeeded" => ReportedStatus::Succeeded,
        "canceled" => ReportedStatus::Failed,
        _ => ReportedStatus::Pending,
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_intent(
        &self,
        amount: i64,
        currency: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<PaymentIntent, GatewayError> {
        let mut form: Vec<(String, String)> = vec![
            ("amount".to_string(), amount.to_string()),
            ("currency".to_string(), currency.to_string()),
            (
                "automatic_payment_methods[enabled]".to_string(),
                "true".to_string(),
            ),
        ];
        form.extend(
            metadata
                .iter()
                .map(|(k, v)| (format!("metadata[{k}]"), v.clone())),
        );

        let resp = self
            .client
            .post(self.url("payment_intents"))
            .bearer_auth(&self.secret_key)
            .form(&form)
            .send()
            .await?;
        let intent: StripeIntent = Self::read(resp).await?;
        debug!(intent_id = %intent.id, amount, "Created payment intent");

        let client_secret = intent.client_secret.ok_or_else(|| GatewayError::Rejected {
            status: 200,
            message: format!("intent {} returned without client secret", intent.id),
        })?;
        Ok(PaymentIntent {
            intent_id: intent.id,
            client_secret,
        })
    }

    async fn retrieve_intent(&self, intent_id: &str) -> Result<IntentStatus, GatewayError> {
        let resp = self
            .client
            .get(self.url(&format!("payment_intents/{intent_id}")))
            .bearer_auth(&self.secret_key)
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(GatewayError::UnknownIntent(intent_id.to_string()));
        }
        let intent: StripeIntent = Self::read(resp).await?;
        Ok(IntentStatus {
            status: map_stripe_status(&intent.status),
            amount_received: intent.amount_received,
        })
    }

    async fn refund(
        &self,
        intent_id: &str,
        amount: i64,
        idempotency_key: &str,
    ) -> Result<RefundReceipt, GatewayError> {
        let resp = self
            .client
            .post(self.url("refunds"))
            .bearer_auth(&self.secret_key)
            .header("Idempotency-Key", idempotency_key)
            .form(&[
                ("payment_intent", intent_id.to_string()),
                ("amount", amount.to_string()),
            ])
            .send()
            .await?;
        let refund: StripeRefund = Self::read(resp).await?;
        debug!(intent_id, refund_id = %refund.id, amount, "Refund issued");
        Ok(RefundReceipt {
            refund_id: refund.id,
            status: refund.status,
        })
    }
}

// ─────────────────────────────────────────────────────────
// Sandbox
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct SandboxIntent {
    amount: i64,
    status: ReportedStatus,
    refunded: i64,
}

/// In-process gateway.
///
/// Intents start pending unless `auto_capture` is set, in which case they are
/// reported as succeeded immediately (handy for driving the API by hand).
#[derive(Default)]
pub struct SandboxGateway {
    intents: Mutex<HashMap<String, SandboxIntent>>,
    refunds: Mutex<HashMap<String, RefundReceipt>>,
    counter: AtomicU64,
    auto_capture: bool,
    fail_create: AtomicBool,
    fail_refund: AtomicBool,
    refund_calls: AtomicU64,
}

impl SandboxGateway {
    pub fn auto_capturing() -> Self {
        Self {
            auto_capture: true,
            ..Self::default()
        }
    }

    fn next_id(&self, prefix: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{prefix}_sandbox_{n:06}")
    }

    fn poisoned() -> GatewayError {
        GatewayError::Unavailable("sandbox state poisoned".to_string())
    }
}

#[async_trait]
impl PaymentGateway for SandboxGateway {
    async fn create_intent(
        &self,
        amount: i64,
        _currency: &str,
        _metadata: &BTreeMap<String, String>,
    ) -> Result<PaymentIntent, GatewayError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(GatewayError::Unavailable("sandbox create disabled".to_string()));
        }
        let intent_id = self.next_id("pi");
        let status = if self.auto_capture {
            ReportedStatus::Succeeded
        } else {
            ReportedStatus::Pending
        };
        self.intents.lock().map_err(|_| Self::poisoned())?.insert(
            intent_id.clone(),
            SandboxIntent {
                amount,
                status,
                refunded: 0,
            },
        );
        Ok(PaymentIntent {
            client_secret: format!("{intent_id}_secret"),
            intent_id,
        })
    }

    async fn retrieve_intent(&self, intent_id: &str) -> Result<IntentStatus, GatewayError> {
        let intents = self.intents.lock().map_err(|_| Self::poisoned())?;
        let intent = intents
            .get(intent_id)
            .ok_or_else(|| GatewayError::UnknownIntent(intent_id.to_string()))?;
        let amount_received = match intent.status {
            ReportedStatus::Succeeded => intent.amount,
            _ => 0,
        };
        Ok(IntentStatus {
            status: intent.status,
            amount_received,
        })
    }

    async fn refund(
        &self,
        intent_id: &str,
        amount: i64,
        idempotency_key: &str,
    ) -> Result<RefundReceipt, GatewayError> {
        self.refund_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_refund.load(Ordering::SeqCst) {
            return Err(GatewayError::Unavailable("sandbox refund disabled".to_string()));
        }

        let mut refunds = self.refunds.lock().map_err(|_| Self::poisoned())?;
        if let Some(existing) = refunds.get(idempotency_key) {
            return Ok(existing.clone());
        }

        let mut intents = self.intents.lock().map_err(|_| Self::poisoned())?;
        let intent = intents
            .get_mut(intent_id)
            .ok_or_else(|| GatewayError::UnknownIntent(intent_id.to_string()))?;
        if intent.status != ReportedStatus::Succeeded || intent.refunded + amount > intent.amount {
            return Err(GatewayError::Rejected {
                status: 400,
                message: format!("intent {intent_id} cannot be refunded {amount}"),
            });
        }
        intent.refunded += amount;

        let receipt = RefundReceipt {
            refund_id: self.next_id("re"),
            status: "succeeded".to_string(),
        };
        refunds.insert(idempotency_key.to_string(), receipt.clone());
        Ok(receipt)
    }
}

/// Test controls for driving the sandbox by hand.
#[cfg(test)]
impl SandboxGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the provider finishing (or failing) a payment.
    pub fn settle(&self, intent_id: &str, status: ReportedStatus) {
        if let Ok(mut intents) = self.intents.lock() {
            if let Some(intent) = intents.get_mut(intent_id) {
                intent.status = status;
            }
        }
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_refund(&self, fail: bool) {
        self.fail_refund.store(fail, Ordering::SeqCst);
    }

    /// Number of refund calls that reached the sandbox (including failures).
    pub fn refund_calls(&self) -> u64 {
        self.refund_calls.load(Ordering::SeqCst)
    }
}
