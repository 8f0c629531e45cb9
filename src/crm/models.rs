use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// An isolated business whose stages, leads and transactions never mix with
/// another tenant's.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    /// Reply-to address used on payment confirmations.
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Active,
    Inactive,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }
}

impl FromStr for StageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            _ => Err(format!("Invalid stage status: {}", s)),
        }
    }
}

/// Highest display order a stage may carry. Reorders above it are refused
/// so appending after the last stage can never overflow.
pub const MAX_STAGE_ORDER: i32 = 1_000_000;

/// One pipeline column. `order` drives left-to-right rendering only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Stage {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub order: i32,
    pub status: StageStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Where a lead came from. Known intake channels are typed; anything else
/// keeps its attributes as an opaque map.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LeadSource {
    #[default]
    Manual,
    WebForm {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        form_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        page_url: Option<String>,
    },
    Campaign {
        campaign_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ad_set_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ad_id: Option<String>,
    },
    Other {
        #[serde(default)]
        attributes: serde_json::Map<String, serde_json::Value>,
    },
}

impl LeadSource {
    /// Interpret a persisted parameter bag. Untyped objects become `Other`;
    /// null or non-object values become `Manual`.
    pub fn from_value(value: serde_json::Value) -> Self {
        if let Ok(source) = serde_json::from_value::<LeadSource>(value.clone()) {
            return source;
        }
        match value {
            serde_json::Value::Object(mut attributes) => {
                attributes.remove("kind");
                Self::Other { attributes }
            }
            _ => Self::Manual,
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tag {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub color: Option<String>,
}

/// Tag as shown on a lead card.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TagSummary {
    pub id: String,
    pub name: String,
    pub color: Option<String>,
}

impl From<Tag> for TagSummary {
    fn from(tag: Tag) -> Self {
        Self {
            id: tag.id,
            name: tag.name,
            color: tag.color,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lead {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub stage_id: String,
    pub estimated_value: Option<Decimal>,
    pub source: LeadSource,
    pub next_appointment_at: Option<DateTime<Utc>>,
    pub tags: Vec<TagSummary>,
    pub stage_entered_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A lead row exactly as persisted in the `leads` table. This is the shape
/// carried by change-feed insert events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeadRow {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub stage_id: String,
    pub estimated_value: Option<String>,
    pub params: serde_json::Value,
    pub stage_entered_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LeadRow {
    pub fn estimated_value(&self) -> Option<Decimal> {
        self.estimated_value
            .as_deref()
            .and_then(|v| Decimal::from_str(v).ok())
    }

    pub fn into_lead(
        self,
        tags: Vec<TagSummary>,
        next_appointment_at: Option<DateTime<Utc>>,
    ) -> Lead {
        let estimated_value = self.estimated_value();
        Lead {
            id: self.id,
            tenant_id: self.tenant_id,
            name: self.name,
            email: self.email,
            phone: self.phone,
            stage_id: self.stage_id,
            estimated_value,
            source: LeadSource::from_value(self.params),
            next_appointment_at,
            tags,
            stage_entered_at: self.stage_entered_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// Project down to a card. Tags and scheduling live outside the row
    /// and start out empty.
    pub fn to_summary(&self) -> LeadSummary {
        LeadSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            estimated_value: self.estimated_value(),
            tags: Vec::new(),
            next_appointment_at: None,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

// Board projection types

/// A lead card. Stage membership is given by the column holding it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeadSummary {
    pub id: String,
    pub name: String,
    pub estimated_value: Option<Decimal>,
    pub tags: Vec<TagSummary>,
    pub next_appointment_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BoardColumn {
    pub stage_id: String,
    pub name: String,
    pub order: i32,
    pub leads: Vec<LeadSummary>,
}

/// Per-session, in-memory aggregation of stages and their leads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BoardProjection {
    pub tenant_id: String,
    pub columns: Vec<BoardColumn>,
}

impl BoardProjection {
    pub fn empty(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            columns: Vec::new(),
        }
    }

    /// Index of the column holding the given lead.
    pub fn column_of_lead(&self, lead_id: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.leads.iter().any(|l| l.id == lead_id))
    }

    /// Index of the column for the given stage.
    pub fn column_of_stage(&self, stage_id: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.stage_id == stage_id)
    }

    pub fn contains_lead(&self, lead_id: &str) -> bool {
        self.column_of_lead(lead_id).is_some()
    }

    pub fn lead_count(&self) -> usize {
        self.columns.iter().map(|c| c.leads.len()).sum()
    }
}

// Payment reconciliation types

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Refunded => "REFUNDED",
        }
    }
}

impl FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "REFUNDED" => Ok(Self::Refunded),
            _ => Err(format!("Invalid transaction status: {}", s)),
        }
    }
}

/// Input for recording one completed payment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewTransaction {
    pub tenant_id: String,
    pub occurred_at: DateTime<Utc>,
    pub concept: String,
    pub gross_amount: Decimal,
    pub currency: String,
    pub processor_fee: Decimal,
    pub platform_fee: Decimal,
    pub net_amount: Decimal,
    pub payment_method: String,
    /// Idempotency key: at most one record exists per reference.
    pub processor_reference: String,
    pub payer_email: Option<String>,
    pub payer_name: Option<String>,
    pub status: TransactionStatus,
    pub origin_id: Option<String>,
    pub origin_type: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransactionRecord {
    pub id: String,
    #[serde(flatten)]
    pub details: NewTransaction,
    pub created_at: DateTime<Utc>,
}

/// Connected payment-provider account state for a tenant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaymentAccount {
    pub tenant_id: String,
    pub provider_account_id: String,
    pub charges_enabled: bool,
    pub payouts_enabled: bool,
    pub onboarding_complete: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_status_roundtrip() {
        for s in &["active", "inactive"] {
            let parsed: StageStatus = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("archived".parse::<StageStatus>().is_err());
    }

    #[test]
    fn test_transaction_status_serde_is_uppercase() {
        assert_eq!(
            serde_json::to_string(&TransactionStatus::Completed).unwrap(),
            "\"COMPLETED\""
        );
        assert_eq!(
            "REFUNDED".parse::<TransactionStatus>().unwrap(),
            TransactionStatus::Refunded
        );
        assert!("completed".parse::<TransactionStatus>().is_err());
    }

    #[test]
    fn test_lead_source_typed_campaign() {
        let value = serde_json::json!({
            "kind": "campaign",
            "campaign_id": "cmp-1",
            "ad_id": "ad-9"
        });
        let source = LeadSource::from_value(value);
        assert_eq!(
            source,
            LeadSource::Campaign {
                campaign_id: "cmp-1".into(),
                ad_set_id: None,
                ad_id: Some("ad-9".into()),
            }
        );
    }

    #[test]
    fn test_lead_source_untyped_object_falls_back_to_other() {
        let value = serde_json::json!({"utm_source": "facebook", "utm_medium": "cpc"});
        match LeadSource::from_value(value) {
            LeadSource::Other { attributes } => {
                assert_eq!(attributes["utm_source"], "facebook");
                assert_eq!(attributes.len(), 2);
            }
            other => panic!("Expected Other, got {:?}", other),
        }
    }

    #[test]
    fn test_lead_source_unknown_kind_keeps_attributes() {
        let value = serde_json::json!({"kind": "whatsapp", "phone": "555"});
        match LeadSource::from_value(value) {
            LeadSource::Other { attributes } => {
                assert_eq!(attributes["phone"], "555");
                assert!(!attributes.contains_key("kind"));
            }
            other => panic!("Expected Other, got {:?}", other),
        }
    }

    #[test]
    fn test_lead_source_null_is_manual() {
        assert_eq!(
            LeadSource::from_value(serde_json::Value::Null),
            LeadSource::Manual
        );
        assert_eq!(
            LeadSource::Manual.to_value(),
            serde_json::json!({"kind": "manual"})
        );
    }

    #[test]
    fn test_lead_row_summary_drops_tags_and_schedule() {
        let now = Utc::now();
        let row = LeadRow {
            id: "l1".into(),
            tenant_id: "t1".into(),
            name: "Ana".into(),
            email: None,
            phone: None,
            stage_id: "s1".into(),
            estimated_value: Some("1500.50".into()),
            params: serde_json::Value::Null,
            stage_entered_at: now,
            created_at: now,
            updated_at: now,
        };
        let summary = row.to_summary();
        assert_eq!(summary.id, "l1");
        assert_eq!(summary.estimated_value, Some(Decimal::new(150050, 2)));
        assert!(summary.tags.is_empty());
        assert!(summary.next_appointment_at.is_none());
    }

    #[test]
    fn test_board_lookup_helpers() {
        let now = Utc::now();
        let card = |id: &str| LeadSummary {
            id: id.into(),
            name: id.into(),
            estimated_value: None,
            tags: vec![],
            next_appointment_at: None,
            created_at: now,
            updated_at: now,
        };
        let board = BoardProjection {
            tenant_id: "t1".into(),
            columns: vec![
                BoardColumn {
                    stage_id: "a".into(),
                    name: "A".into(),
                    order: 1,
                    leads: vec![card("x")],
                },
                BoardColumn {
                    stage_id: "b".into(),
                    name: "B".into(),
                    order: 2,
                    leads: vec![card("y"), card("z")],
                },
            ],
        };
        assert_eq!(board.column_of_lead("z"), Some(1));
        assert_eq!(board.column_of_stage("a"), Some(0));
        assert_eq!(board.column_of_lead("missing"), None);
        assert_eq!(board.lead_count(), 3);
        assert!(board.contains_lead("x"));
    }

    #[test]
    fn test_transaction_record_flattens_details() {
        let record = TransactionRecord {
            id: "tx1".into(),
            details: NewTransaction {
                tenant_id: "t1".into(),
                occurred_at: Utc::now(),
                concept: "Pago online".into(),
                gross_amount: Decimal::new(100000, 2),
                currency: "MXN".into(),
                processor_fee: Decimal::ZERO,
                platform_fee: Decimal::new(3000, 2),
                net_amount: Decimal::new(97000, 2),
                payment_method: "CARD".into(),
                processor_reference: "pi_123".into(),
                payer_email: None,
                payer_name: None,
                status: TransactionStatus::Completed,
                origin_id: None,
                origin_type: None,
                metadata: BTreeMap::new(),
            },
            created_at: Utc::now(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["processor_reference"], "pi_123");
        assert_eq!(json["status"], "COMPLETED");
        assert_eq!(json["net_amount"], "970.00");
    }
}
