//! Payment webhook reconciliation.
//!
//! Per event: `RECEIVED → VERIFIED → {DUPLICATE | RECORDED} → {NOTIFIED |
//! NOTIFY_FAILED}`. The processor reference is the idempotency key; a
//! uniqueness conflict is a successful duplicate, never an error.
//! Notification failures are logged and do not undo the recording.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use super::db::{DbHandle, TransactionInsert};
use super::models::{NewTransaction, Tenant, TransactionRecord, TransactionStatus};
use super::notify::{FALLBACK_REPLY_TO, Notifier, PaymentConfirmation};
use crate::config::PaymentsSection;
use crate::errors::WebhookError;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying `t=<unix>,v1=<hex>` signatures.
pub const SIGNATURE_HEADER: &str = "stripe-signature";

pub const EVENT_CHECKOUT_COMPLETED: &str = "checkout.session.completed";
pub const EVENT_ACCOUNT_UPDATED: &str = "account.updated";

const META_TENANT: &str = "promedia_negocio_id";
const META_PRODUCT: &str = "promedia_producto_id";
const META_OFFER: &str = "promedia_oferta_id";
const META_ORIGIN_TYPE: &str = "promedia_origen_tipo";

// ── Signatures ───────────────────────────────────────────────────────

fn mac_for(secret: &str, timestamp: i64, payload: &str) -> Result<HmacSha256, WebhookError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| WebhookError::SignatureInvalid("invalid webhook secret key".into()))?;
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    Ok(mac)
}

/// Build a signature header value for `payload` signed at `timestamp`.
pub fn sign_payload(payload: &str, secret: &str, timestamp: i64) -> Result<String, WebhookError> {
    let mac = mac_for(secret, timestamp, payload)?;
    Ok(format!(
        "t={},v1={}",
        timestamp,
        hex::encode(mac.finalize().into_bytes())
    ))
}

/// Check a signature header against the raw payload.
///
/// Any `v1` entry may match (providers send several during secret
/// rotation). Timestamps further than `tolerance` from `now` are rejected.
pub fn verify_signature(
    payload: &str,
    header: &str,
    secret: &str,
    tolerance: Duration,
    now: i64,
) -> Result<(), WebhookError> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp
        .ok_or_else(|| WebhookError::SignatureInvalid("missing timestamp".into()))?;
    if signatures.is_empty() {
        return Err(WebhookError::SignatureInvalid("missing v1 signature".into()));
    }
    if now.abs_diff(timestamp) > tolerance.as_secs() {
        return Err(WebhookError::SignatureInvalid(format!(
            "timestamp {} outside tolerance",
            timestamp
        )));
    }

    let mac = mac_for(secret, timestamp, payload)?;
    let matched = signatures.iter().any(|sig| {
        hex::decode(sig)
            .map(|bytes| mac.clone().verify_slice(&bytes).is_ok())
            .unwrap_or(false)
    });
    if matched {
        Ok(())
    } else {
        Err(WebhookError::SignatureInvalid(
            "no signature matches the payload".into(),
        ))
    }
}

// ── Event payloads ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct WebhookEvent {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: EventData,
}

#[derive(Debug, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

/// `payment_intent` arrives either as an id or as an expanded object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PaymentIntentRef {
    Id(String),
    Expanded { id: String },
}

impl PaymentIntentRef {
    pub fn id(&self) -> &str {
        match self {
            Self::Id(id) | Self::Expanded { id } => id,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CustomerDetails {
    pub email: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LineItem {
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LineItems {
    #[serde(default)]
    pub data: Vec<LineItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub payment_status: Option<String>,
    pub amount_total: Option<i64>,
    pub currency: Option<String>,
    pub payment_intent: Option<PaymentIntentRef>,
    pub mode: Option<String>,
    pub line_items: Option<LineItems>,
    pub payment_method_types: Option<Vec<String>>,
    pub customer_details: Option<CustomerDetails>,
    pub customer_email: Option<String>,
    pub metadata: Option<BTreeMap<String, String>>,
    pub created: Option<i64>,
}

impl CheckoutSession {
    pub fn is_paid(&self) -> bool {
        self.payment_status.as_deref() == Some("paid")
    }

    fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get(key))
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.metadata_value(META_TENANT)
    }

    /// Payment intent id, falling back to the session id.
    pub fn processor_reference(&self) -> &str {
        self.payment_intent
            .as_ref()
            .map(PaymentIntentRef::id)
            .filter(|id| !id.is_empty())
            .unwrap_or(&self.id)
    }

    pub fn concept(&self) -> String {
        let first_item = self
            .line_items
            .as_ref()
            .and_then(|items| items.data.first())
            .and_then(|item| item.description.clone())
            .filter(|d| !d.is_empty());
        match first_item {
            Some(description) => description,
            None if self.mode.as_deref() == Some("subscription") => "Suscripción".to_string(),
            None => "Pago online".to_string(),
        }
    }

    /// First method type, uppercased with underscores as spaces.
    pub fn payment_method(&self) -> String {
        self.payment_method_types
            .as_ref()
            .and_then(|types| types.first())
            .map(String::as_str)
            .unwrap_or("desconocido")
            .to_uppercase()
            .replace('_', " ")
    }

    pub fn payer_email(&self) -> Option<String> {
        self.customer_details
            .as_ref()
            .and_then(|c| c.email.clone())
            .or_else(|| self.customer_email.clone())
            .filter(|e| !e.is_empty())
    }

    pub fn payer_name(&self) -> Option<String> {
        self.customer_details.as_ref().and_then(|c| c.name.clone())
    }

    /// `amount_total` is in minor units.
    pub fn gross_amount(&self) -> Decimal {
        Decimal::new(self.amount_total.unwrap_or(0), 2)
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.created
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .unwrap_or_else(Utc::now)
    }

    pub fn to_transaction(
        &self,
        tenant_id: &str,
        fees: &FeeSchedule,
        default_currency: &str,
    ) -> NewTransaction {
        let gross_amount = self.gross_amount();
        let derived = fees.derive(gross_amount);
        NewTransaction {
            tenant_id: tenant_id.to_string(),
            occurred_at: self.occurred_at(),
            concept: self.concept(),
            gross_amount,
            currency: self
                .currency
                .as_deref()
                .filter(|c| !c.is_empty())
                .unwrap_or(default_currency)
                .to_uppercase(),
            processor_fee: derived.processor_fee,
            platform_fee: derived.platform_fee,
            net_amount: derived.net_amount,
            payment_method: self.payment_method(),
            processor_reference: self.processor_reference().to_string(),
            payer_email: self.payer_email(),
            payer_name: self.payer_name(),
            status: TransactionStatus::Completed,
            origin_id: self
                .metadata_value(META_PRODUCT)
                .or_else(|| self.metadata_value(META_OFFER))
                .map(str::to_string),
            origin_type: self.metadata_value(META_ORIGIN_TYPE).map(str::to_string),
            metadata: self.metadata.clone().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderAccount {
    pub id: String,
    pub charges_enabled: Option<bool>,
    pub payouts_enabled: Option<bool>,
    pub details_submitted: Option<bool>,
}

// ── Fees ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct FeeSchedule {
    pub platform_percent: Decimal,
    pub processor_percent: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedFees {
    pub platform_fee: Decimal,
    pub processor_fee: Decimal,
    pub net_amount: Decimal,
}

fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

impl FeeSchedule {
    pub fn from_config(payments: &PaymentsSection) -> Self {
        Self {
            platform_percent: payments.platform_fee_percent,
            processor_percent: payments.processor_fee_percent,
        }
    }

    /// Fees as percentages of gross; net = gross − platform − processor.
    pub fn derive(&self, gross: Decimal) -> DerivedFees {
        let hundred = Decimal::ONE_HUNDRED;
        let platform_fee = round_money(gross * self.platform_percent / hundred);
        let processor_fee = round_money(gross * self.processor_percent / hundred);
        DerivedFees {
            platform_fee,
            processor_fee,
            net_amount: round_money(gross - platform_fee - processor_fee),
        }
    }
}

// ── Reconciler ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReconcileState {
    Received,
    Verified,
    Duplicate,
    Recorded,
    Notified,
    NotifyFailed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NotificationOutcome {
    Sent,
    Failed(String),
    /// The payer left no email address.
    NoRecipient,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// Event type this service does not handle.
    Ignored { event_type: String },
    Unpaid { session_id: String },
    /// Session metadata names no known tenant.
    MissingTenant { session_id: String },
    AccountUpdated { account_id: String, found: bool },
    Duplicate { processor_reference: String },
    Recorded {
        record: TransactionRecord,
        notification: NotificationOutcome,
    },
}

impl ReconcileOutcome {
    /// Terminal state reached for this event.
    pub fn state(&self) -> ReconcileState {
        match self {
            Self::Duplicate { .. } => ReconcileState::Duplicate,
            Self::Recorded {
                notification: NotificationOutcome::Sent,
                ..
            } => ReconcileState::Notified,
            Self::Recorded { .. } => ReconcileState::NotifyFailed,
            _ => ReconcileState::Verified,
        }
    }

    /// JSON acknowledgement returned to the event source.
    pub fn acknowledgement(&self) -> serde_json::Value {
        match self {
            Self::MissingTenant { .. } => {
                serde_json::json!({"received": true, "error": "Missing tenant metadata."})
            }
            _ => serde_json::json!({"received": true}),
        }
    }
}

enum Recording {
    UnknownTenant,
    Duplicate,
    Inserted(TransactionRecord, Tenant),
}

pub struct WebhookReconciler {
    db: DbHandle,
    notifier: Arc<dyn Notifier>,
    fees: FeeSchedule,
    default_currency: String,
}

impl WebhookReconciler {
    pub fn new(
        db: DbHandle,
        notifier: Arc<dyn Notifier>,
        fees: FeeSchedule,
        default_currency: impl Into<String>,
    ) -> Self {
        Self {
            db,
            notifier,
            fees,
            default_currency: default_currency.into(),
        }
    }

    pub fn from_config(db: DbHandle, notifier: Arc<dyn Notifier>, payments: &PaymentsSection) -> Self {
        Self::new(
            db,
            notifier,
            FeeSchedule::from_config(payments),
            payments.default_currency.clone(),
        )
    }

    /// Verify the signature, then reconcile. `secret` is `None` when the
    /// service has no webhook secret configured.
    pub async fn handle(
        &self,
        payload: &str,
        signature: Option<&str>,
        secret: Option<&str>,
        tolerance: Duration,
    ) -> Result<ReconcileOutcome, WebhookError> {
        let secret = secret.ok_or(WebhookError::MissingSecret)?;
        let signature = signature
            .ok_or_else(|| WebhookError::SignatureInvalid(format!("missing {} header", SIGNATURE_HEADER)))?;
        verify_signature(payload, signature, secret, tolerance, Utc::now().timestamp())?;
        self.reconcile(payload).await
    }

    /// Apply an already-verified event.
    pub async fn reconcile(&self, payload: &str) -> Result<ReconcileOutcome, WebhookError> {
        let event: WebhookEvent = serde_json::from_str(payload)
            .map_err(|e| WebhookError::MalformedPayload(e.to_string()))?;
        tracing::debug!(event_id = ?event.id, event_type = %event.event_type, "webhook verified");

        match event.event_type.as_str() {
            EVENT_CHECKOUT_COMPLETED => {
                let session: CheckoutSession = serde_json::from_value(event.data.object)
                    .map_err(|e| WebhookError::MalformedPayload(e.to_string()))?;
                self.checkout_completed(session).await
            }
            EVENT_ACCOUNT_UPDATED => {
                let account: ProviderAccount = serde_json::from_value(event.data.object)
                    .map_err(|e| WebhookError::MalformedPayload(e.to_string()))?;
                self.account_updated(account).await
            }
            other => {
                tracing::info!(event_type = %other, "unhandled webhook event acknowledged");
                Ok(ReconcileOutcome::Ignored {
                    event_type: other.to_string(),
                })
            }
        }
    }

    async fn checkout_completed(&self, session: CheckoutSession) -> Result<ReconcileOutcome, WebhookError> {
        if !session.is_paid() {
            tracing::info!(
                session_id = %session.id,
                payment_status = ?session.payment_status,
                "checkout session not paid; nothing recorded"
            );
            return Ok(ReconcileOutcome::Unpaid {
                session_id: session.id,
            });
        }

        let Some(tenant_id) = session.tenant_id().map(str::to_string) else {
            tracing::error!(session_id = %session.id, "checkout session has no tenant metadata");
            return Ok(ReconcileOutcome::MissingTenant {
                session_id: session.id,
            });
        };

        let input = session.to_transaction(&tenant_id, &self.fees, &self.default_currency);
        let reference = input.processor_reference.clone();

        let recording = self
            .db
            .call(move |db| {
                let Some(tenant) = db.get_tenant(&input.tenant_id)? else {
                    return Ok(Recording::UnknownTenant);
                };
                if db
                    .find_transaction_by_reference(&input.processor_reference)?
                    .is_some()
                {
                    return Ok(Recording::Duplicate);
                }
                Ok(match db.insert_transaction(&input)? {
                    TransactionInsert::Inserted(record) => Recording::Inserted(record, tenant),
                    TransactionInsert::Duplicate => Recording::Duplicate,
                })
            })
            .await
            .map_err(|e| {
                tracing::error!(processor_reference = %reference, error = %e, "failed to record transaction");
                WebhookError::Recording(e)
            })?;

        match recording {
            Recording::UnknownTenant => {
                tracing::error!(tenant_id = %tenant_id, session_id = %session.id, "checkout session names an unknown tenant");
                Ok(ReconcileOutcome::MissingTenant {
                    session_id: session.id,
                })
            }
            Recording::Duplicate => {
                tracing::info!(processor_reference = %reference, "duplicate delivery; already recorded");
                Ok(ReconcileOutcome::Duplicate {
                    processor_reference: reference,
                })
            }
            Recording::Inserted(record, tenant) => {
                tracing::info!(
                    tenant_id = %tenant.id,
                    processor_reference = %reference,
                    gross = %record.details.gross_amount,
                    "transaction recorded"
                );
                let notification = self.notify(&record, &tenant).await;
                Ok(ReconcileOutcome::Recorded {
                    record,
                    notification,
                })
            }
        }
    }

    async fn notify(&self, record: &TransactionRecord, tenant: &Tenant) -> NotificationOutcome {
        let details = &record.details;
        let Some(payer_email) = details.payer_email.clone() else {
            tracing::warn!(
                processor_reference = %details.processor_reference,
                "no payer email; confirmation not sent"
            );
            return NotificationOutcome::NoRecipient;
        };
        let confirmation = PaymentConfirmation {
            payer_email,
            payer_name: details.payer_name.clone(),
            tenant_name: tenant.name.clone(),
            reply_to: tenant
                .email
                .clone()
                .unwrap_or_else(|| FALLBACK_REPLY_TO.to_string()),
            concept: details.concept.clone(),
            amount: details.gross_amount,
            currency: details.currency.clone(),
            processor_reference: details.processor_reference.clone(),
        };
        match self.notifier.send_payment_confirmation(&confirmation).await {
            Ok(()) => NotificationOutcome::Sent,
            Err(e) => {
                tracing::warn!(
                    processor_reference = %details.processor_reference,
                    error = %e,
                    "payment confirmation failed"
                );
                NotificationOutcome::Failed(e.to_string())
            }
        }
    }

    async fn account_updated(&self, account: ProviderAccount) -> Result<ReconcileOutcome, WebhookError> {
        let account_id = account.id.clone();
        let updated = self
            .db
            .call(move |db| {
                db.update_payment_account_flags(
                    &account.id,
                    account.charges_enabled.unwrap_or(false),
                    account.payouts_enabled.unwrap_or(false),
                    account.details_submitted.unwrap_or(false),
                )
            })
            .await
            .map_err(WebhookError::Recording)?;
        match &updated {
            Some(acct) => tracing::info!(
                account_id = %account_id,
                tenant_id = %acct.tenant_id,
                charges_enabled = acct.charges_enabled,
                "payment account updated"
            ),
            None => tracing::warn!(account_id = %account_id, "no tenant linked to payment account"),
        }
        Ok(ReconcileOutcome::AccountUpdated {
            account_id,
            found: updated.is_some(),
        })
    }
}
