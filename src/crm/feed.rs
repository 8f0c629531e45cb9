//! Tenant-scoped change feed for newly inserted leads.
//!
//! The server side is [`ChangeFeed`]: one broadcast channel per
//! `pipeline-updates-{tenantId}` name, created lazily on first use. The
//! client side is a [`FeedChannel`] (explicit connect/disconnect) wrapped by
//! a [`FeedListener`], plus the pure [`merge_insert`] that splices an insert
//! into a board projection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::models::{BoardProjection, LeadRow};

/// Channel name for a tenant's pipeline updates.
pub fn channel_name(tenant_id: &str) -> String {
    format!("pipeline-updates-{}", tenant_id)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum FeedEvent {
    /// Carries the full row exactly as persisted.
    LeadInserted { record: LeadRow },
    /// The subscriber fell behind and `skipped` events were dropped. Sent to
    /// that subscriber only; its board must be reloaded.
    Lagged { tenant_id: String, skipped: u64 },
}

impl FeedEvent {
    pub fn tenant_id(&self) -> &str {
        match self {
            Self::LeadInserted { record } => &record.tenant_id,
            Self::Lagged { tenant_id, .. } => tenant_id,
        }
    }
}

/// What a [`FeedListener`] hands to the board.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedUpdate {
    Inserted(LeadRow),
    /// Inserts were missed; merging is no longer enough.
    Lagged { skipped: u64 },
}

// ── Server-side publisher ────────────────────────────────────────────

/// Registry of per-tenant broadcast channels carrying serialized
/// [`FeedEvent`]s.
#[derive(Clone)]
pub struct ChangeFeed {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>,
    capacity: usize,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Publish an event on its tenant's channel. Returns how many
    /// subscribers received it; zero subscribers is not an error.
    pub fn publish(&self, event: &FeedEvent) -> usize {
        let channel = channel_name(event.tenant_id());
        match serde_json::to_string(event) {
            Ok(json) => self.sender(&channel).send(json).unwrap_or(0),
            Err(e) => {
                tracing::error!(channel = %channel, error = %e, "failed to serialize feed event");
                0
            }
        }
    }

    pub fn subscribe(&self, tenant_id: &str) -> broadcast::Receiver<String> {
        self.sender(&channel_name(tenant_id)).subscribe()
    }

    /// Drop channels nobody is listening to.
    pub fn prune(&self) -> usize {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let before = channels.len();
        channels.retain(|_, tx| tx.receiver_count() > 0);
        before - channels.len()
    }
}

// ── Client-side channel and listener ─────────────────────────────────

/// A subscription to one tenant's insert events with an explicit lifecycle.
#[async_trait]
pub trait FeedChannel: Send {
    async fn connect(&mut self, tenant_id: &str) -> Result<()>;

    /// Next event, or `None` once disconnected or the channel closed.
    /// Missed events surface as [`FeedEvent::Lagged`].
    async fn next_event(&mut self) -> Option<FeedEvent>;

    async fn disconnect(&mut self);
}

/// In-process [`FeedChannel`] over a [`ChangeFeed`].
pub struct BroadcastFeedChannel {
    feed: ChangeFeed,
    tenant_id: String,
    rx: Option<broadcast::Receiver<String>>,
}

impl BroadcastFeedChannel {
    pub fn new(feed: ChangeFeed) -> Self {
        Self {
            feed,
            tenant_id: String::new(),
            rx: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.rx.is_some()
    }
}

#[async_trait]
impl FeedChannel for BroadcastFeedChannel {
    async fn connect(&mut self, tenant_id: &str) -> Result<()> {
        self.rx = Some(self.feed.subscribe(tenant_id));
        self.tenant_id = tenant_id.to_string();
        tracing::debug!(channel = %channel_name(tenant_id), "feed channel connected");
        Ok(())
    }

    async fn next_event(&mut self) -> Option<FeedEvent> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(json) => match serde_json::from_str::<FeedEvent>(&json) {
                    Ok(event) => return Some(event),
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping undecodable feed event");
                    }
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(tenant_id = %self.tenant_id, skipped, "feed receiver lagged");
                    return Some(FeedEvent::Lagged {
                        tenant_id: self.tenant_id.clone(),
                        skipped,
                    });
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    async fn disconnect(&mut self) {
        self.rx = None;
    }
}

/// Listens on one tenant's feed and yields inserted rows and lag notices.
pub struct FeedListener<C: FeedChannel> {
    channel: C,
    tenant_id: String,
    connected: bool,
}

impl<C: FeedChannel> FeedListener<C> {
    pub fn new(channel: C, tenant_id: impl Into<String>) -> Self {
        Self {
            channel,
            tenant_id: tenant_id.into(),
            connected: false,
        }
    }

    pub async fn start(&mut self) -> Result<()> {
        if !self.connected {
            self.channel.connect(&self.tenant_id).await?;
            self.connected = true;
        }
        Ok(())
    }

    pub async fn stop(&mut self) {
        if self.connected {
            self.channel.disconnect().await;
            self.connected = false;
        }
    }

    /// Next update for this tenant. Events for other tenants are skipped.
    pub async fn next_update(&mut self) -> Option<FeedUpdate> {
        if !self.connected {
            return None;
        }
        loop {
            let event = self.channel.next_event().await?;
            if event.tenant_id() != self.tenant_id {
                tracing::warn!(
                    tenant_id = %self.tenant_id,
                    other_tenant = %event.tenant_id(),
                    "ignoring feed event for another tenant"
                );
                continue;
            }
            return Some(match event {
                FeedEvent::LeadInserted { record } => FeedUpdate::Inserted(record),
                FeedEvent::Lagged { skipped, .. } => FeedUpdate::Lagged { skipped },
            });
        }
    }
}

// ── Merge ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted { stage_id: String },
    /// A card with the same lead id is already on the board.
    Duplicate,
    ForeignTenant,
    NoColumns,
}

/// Prepend an inserted lead to the intake column.
///
/// The intake column is the one whose name equals `intake_label`
/// (case-insensitive), else the first column. Other columns are untouched.
pub fn merge_insert(board: &mut BoardProjection, row: &LeadRow, intake_label: &str) -> MergeOutcome {
    if row.tenant_id != board.tenant_id {
        return MergeOutcome::ForeignTenant;
    }
    if board.contains_lead(&row.id) {
        return MergeOutcome::Duplicate;
    }
    if board.columns.is_empty() {
        return MergeOutcome::NoColumns;
    }
    let label = intake_label.to_lowercase();
    let idx = board
        .columns
        .iter()
        .position(|c| c.name.to_lowercase() == label)
        .unwrap_or(0);
    let column = &mut board.columns[idx];
    column.leads.insert(0, row.to_summary());
    MergeOutcome::Inserted {
        stage_id: column.stage_id.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crm::models::{BoardColumn, LeadSummary};
    use chrono::Utc;

    fn row(id: &str, tenant: &str) -> LeadRow {
        let now = Utc::now();
        LeadRow {
            id: id.into(),
            tenant_id: tenant.into(),
            name: format!("Lead {}", id),
            email: None,
            phone: None,
            stage_id: "s-other".into(),
            estimated_value: None,
            params: serde_json::json!({"kind": "manual"}),
            stage_entered_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    fn card(id: &str) -> LeadSummary {
        row(id, "t1").to_summary()
    }

    fn board(columns: Vec<(&str, &str, Vec<&str>)>) -> BoardProjection {
        BoardProjection {
            tenant_id: "t1".into(),
            columns: columns
                .into_iter()
                .enumerate()
                .map(|(i, (stage_id, name, leads))| BoardColumn {
                    stage_id: stage_id.to_string(),
                    name: name.to_string(),
                    order: i as i32 + 1,
                    leads: leads.iter().map(|id| card(id)).collect(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_channel_name_format() {
        assert_eq!(channel_name("abc"), "pipeline-updates-abc");
    }

    #[test]
    fn test_feed_event_serialization() {
        let event = FeedEvent::LeadInserted { record: row("l1", "t1") };
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "LeadInserted");
        assert_eq!(json["data"]["record"]["id"], "l1");
        assert_eq!(json["data"]["record"]["stage_id"], "s-other");
    }

    #[test]
    fn test_merge_prepends_to_intake_column_only() {
        let mut b = board(vec![
            ("s1", "Contactado", vec!["a"]),
            ("s2", "Nuevo", vec!["b", "c"]),
        ]);
        let before_other = b.columns[0].clone();

        let outcome = merge_insert(&mut b, &row("n", "t1"), "Nuevo");
        assert_eq!(outcome, MergeOutcome::Inserted { stage_id: "s2".into() });
        let ids: Vec<&str> = b.columns[1].leads.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, vec!["n", "b", "c"]);
        assert_eq!(b.columns[0], before_other);
    }

    #[test]
    fn test_merge_label_is_case_insensitive() {
        let mut b = board(vec![("s1", "Contactado", vec![]), ("s2", "NUEVO", vec![])]);
        merge_insert(&mut b, &row("n", "t1"), "nuevo");
        assert_eq!(b.columns[1].leads.len(), 1);
    }

    #[test]
    fn test_merge_falls_back_to_first_column() {
        let mut b = board(vec![("s1", "Prospecto", vec!["a"]), ("s2", "Cerrado", vec![])]);
        let outcome = merge_insert(&mut b, &row("n", "t1"), "Nuevo");
        assert_eq!(outcome, MergeOutcome::Inserted { stage_id: "s1".into() });
        assert_eq!(b.columns[0].leads[0].id, "n");
    }

    #[test]
    fn test_merge_summary_has_empty_tags_and_schedule() {
        let mut b = board(vec![("s1", "Nuevo", vec![])]);
        merge_insert(&mut b, &row("n", "t1"), "Nuevo");
        let summary = &b.columns[0].leads[0];
        assert!(summary.tags.is_empty());
        assert!(summary.next_appointment_at.is_none());
    }

    #[test]
    fn test_merge_drops_duplicates() {
        let mut b = board(vec![("s1", "Nuevo", vec![]), ("s2", "Contactado", vec!["x"])]);
        let before = b.clone();
        assert_eq!(merge_insert(&mut b, &row("x", "t1"), "Nuevo"), MergeOutcome::Duplicate);
        assert_eq!(b, before);
    }

    #[test]
    fn test_merge_rejects_foreign_tenant_and_empty_board() {
        let mut b = board(vec![("s1", "Nuevo", vec![])]);
        assert_eq!(merge_insert(&mut b, &row("x", "t2"), "Nuevo"), MergeOutcome::ForeignTenant);
        let mut empty = BoardProjection::empty("t1");
        assert_eq!(merge_insert(&mut empty, &row("x", "t1"), "Nuevo"), MergeOutcome::NoColumns);
    }

    #[tokio::test]
    async fn test_publish_reaches_tenant_subscribers_only() {
        let feed = ChangeFeed::new(16);
        let mut rx_t1 = feed.subscribe("t1");
        let mut rx_t2 = feed.subscribe("t2");

        let delivered = feed.publish(&FeedEvent::LeadInserted { record: row("l1", "t1") });
        assert_eq!(delivered, 1);

        let msg = rx_t1.recv().await.unwrap();
        assert!(msg.contains("\"LeadInserted\""));
        assert!(rx_t2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_does_not_panic() {
        let feed = ChangeFeed::new(16);
        assert_eq!(feed.publish(&FeedEvent::LeadInserted { record: row("l1", "t1") }), 0);
        assert_eq!(feed.prune(), 1);
    }

    #[tokio::test]
    async fn test_listener_lifecycle() {
        let feed = ChangeFeed::new(16);
        let mut listener = FeedListener::new(BroadcastFeedChannel::new(feed.clone()), "t1");
        assert!(listener.next_update().await.is_none(), "not started yet");

        listener.start().await.unwrap();
        feed.publish(&FeedEvent::LeadInserted { record: row("l1", "t1") });
        let received = listener.next_update().await.unwrap();
        assert!(matches!(received, FeedUpdate::Inserted(ref r) if r.id == "l1"));

        listener.stop().await;
        feed.publish(&FeedEvent::LeadInserted { record: row("l2", "t1") });
        assert!(listener.next_update().await.is_none());
    }

    #[tokio::test]
    async fn test_listener_reports_lag_then_resumes() {
        let feed = ChangeFeed::new(1);
        let mut listener = FeedListener::new(BroadcastFeedChannel::new(feed.clone()), "t1");
        listener.start().await.unwrap();

        for id in ["l1", "l2", "l3"] {
            feed.publish(&FeedEvent::LeadInserted { record: row(id, "t1") });
        }

        assert_eq!(listener.next_update().await, Some(FeedUpdate::Lagged { skipped: 2 }));
        let next = listener.next_update().await.unwrap();
        assert!(matches!(next, FeedUpdate::Inserted(ref r) if r.id == "l3"));
    }

    #[test]
    fn test_lagged_event_serialization() {
        let event = FeedEvent::Lagged {
            tenant_id: "t1".into(),
            skipped: 4,
        };
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "Lagged");
        assert_eq!(json["data"]["skipped"], 4);
        assert_eq!(event.tenant_id(), "t1");
        let back: FeedEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[tokio::test]
    async fn test_broadcast_channel_disconnect() {
        let feed = ChangeFeed::new(4);
        let mut channel = BroadcastFeedChannel::new(feed.clone());
        channel.connect("t1").await.unwrap();
        assert!(channel.is_connected());
        channel.disconnect().await;
        assert!(!channel.is_connected());
        assert!(channel.next_event().await.is_none());
    }
}
