//! Board Controller: optimistic drag-and-drop over a [`BoardProjection`].
//!
//! The pure half is [`reduce`], which turns a drag-end into a
//! [`Transition`], and [`apply_undo`], which restores a pre-move snapshot.
//! [`BoardController`] keeps the current projection plus one [`UndoToken`]
//! per in-flight Stage-Move and talks to the server through a
//! [`BoardBackend`].
//!
//! Within-column order is presentation only; only stage membership is sent
//! to the server.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::feed::{FeedUpdate, MergeOutcome, merge_insert};
use super::models::{BoardProjection, LeadRow};
use crate::config::PipelineSection;
use crate::errors::BoardError;

/// End of a drag gesture. `over_id` is a lead id or a stage id, or `None`
/// when dropped outside any drop zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DragEnd {
    pub active_id: String,
    pub over_id: Option<String>,
}

impl DragEnd {
    pub fn new(active_id: impl Into<String>, over_id: impl Into<String>) -> Self {
        Self {
            active_id: active_id.into(),
            over_id: Some(over_id.into()),
        }
    }

    pub fn cancelled(active_id: impl Into<String>) -> Self {
        Self {
            active_id: active_id.into(),
            over_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveLeadCommand {
    pub lead_id: String,
    pub stage_id: String,
    pub tenant_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveLeadResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MoveLeadResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Server operations a board controller depends on.
#[async_trait]
pub trait BoardBackend: Send + Sync + 'static {
    async fn move_lead(&self, command: &MoveLeadCommand) -> MoveLeadResponse;

    async fn load_board(&self, tenant_id: &str) -> Result<BoardProjection, BoardError>;
}

// ── Pure reducer ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Unknown lead or target, cancelled drag, or a drop in place.
    Unchanged,
    /// Same-column reorder. Local only.
    Reordered(BoardProjection),
    /// Cross-column move needing server confirmation.
    Moved {
        next: BoardProjection,
        command: MoveLeadCommand,
    },
}

/// Compute the projection that results from a drag-end.
///
/// A target lead resolves to its column and insertion happens at its
/// index; a target column means the end of that column.
pub fn reduce(board: &BoardProjection, drag: &DragEnd) -> Transition {
    let Some(over_id) = drag.over_id.as_deref() else {
        return Transition::Unchanged;
    };
    if over_id == drag.active_id {
        return Transition::Unchanged;
    }
    let Some(source) = board.column_of_lead(&drag.active_id) else {
        return Transition::Unchanged;
    };
    let Some(dest) = board
        .column_of_lead(over_id)
        .or_else(|| board.column_of_stage(over_id))
    else {
        return Transition::Unchanged;
    };

    let mut next = board.clone();
    let from = match next.columns[source]
        .leads
        .iter()
        .position(|l| l.id == drag.active_id)
    {
        Some(i) => i,
        None => return Transition::Unchanged,
    };
    let over_index = next.columns[dest].leads.iter().position(|l| l.id == over_id);

    if source == dest {
        let leads = &mut next.columns[source].leads;
        let to = over_index.unwrap_or(leads.len() - 1);
        if from == to {
            return Transition::Unchanged;
        }
        let card = leads.remove(from);
        leads.insert(to, card);
        return Transition::Reordered(next);
    }

    let card = next.columns[source].leads.remove(from);
    let dest_leads = &mut next.columns[dest].leads;
    let at = over_index.unwrap_or(dest_leads.len());
    dest_leads.insert(at, card);

    let command = MoveLeadCommand {
        lead_id: drag.active_id.clone(),
        stage_id: next.columns[dest].stage_id.clone(),
        tenant_id: board.tenant_id.clone(),
    };
    Transition::Moved { next, command }
}

/// The projection as it was before an optimistic move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoToken {
    snapshot: BoardProjection,
}

impl UndoToken {
    pub fn capture(board: &BoardProjection) -> Self {
        Self {
            snapshot: board.clone(),
        }
    }

    pub fn snapshot(&self) -> &BoardProjection {
        &self.snapshot
    }
}

/// Roll back to the token's snapshot.
///
/// Cards that arrived after the snapshot (feed inserts) are kept at the
/// head of their column; with none, the result equals the snapshot.
pub fn apply_undo(current: &BoardProjection, token: UndoToken) -> BoardProjection {
    let mut restored = token.snapshot;
    for column in &current.columns {
        let arrivals: Vec<_> = column
            .leads
            .iter()
            .filter(|l| !restored.contains_lead(&l.id))
            .cloned()
            .collect();
        if arrivals.is_empty() {
            continue;
        }
        if let Some(idx) = restored.column_of_stage(&column.stage_id) {
            restored.columns[idx].leads.splice(0..0, arrivals);
        }
    }
    restored
}

// ── Controller ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MoveTicket(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DragEffect {
    None,
    Reordered,
    Dispatched(MoveTicket),
}

/// What a feed update did to the board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEffect {
    Merged(MergeOutcome),
    Reloaded,
    /// Moves are in flight; the reload runs once they settle.
    ReloadDeferred,
}

/// Result of running one in-flight command.
#[derive(Debug)]
pub struct MoveSettlement {
    pub ticket: MoveTicket,
    pub result: Result<(), BoardError>,
}

struct PendingMove {
    command: MoveLeadCommand,
    undo: UndoToken,
}

pub struct BoardController<B: BoardBackend> {
    backend: Arc<B>,
    tenant_id: String,
    projection: BoardProjection,
    pending: HashMap<MoveTicket, PendingMove>,
    next_ticket: u64,
    timeout: Duration,
    intake_label: String,
    last_error: Option<String>,
    /// A rollback happened while other moves were in flight.
    stale: bool,
}

impl<B: BoardBackend> BoardController<B> {
    pub fn new(
        backend: Arc<B>,
        projection: BoardProjection,
        timeout: Duration,
        intake_label: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            tenant_id: projection.tenant_id.clone(),
            projection,
            pending: HashMap::new(),
            next_ticket: 0,
            timeout,
            intake_label: intake_label.into(),
            last_error: None,
            stale: false,
        }
    }

    /// Fetch the initial projection and build a controller around it.
    pub async fn load(
        backend: Arc<B>,
        tenant_id: &str,
        timeout: Duration,
        intake_label: impl Into<String>,
    ) -> Result<Self, BoardError> {
        let projection = backend.load_board(tenant_id).await?;
        Ok(Self::new(backend, projection, timeout, intake_label))
    }

    /// [`Self::load`] with timeout and intake label from `[pipeline]`.
    pub async fn load_configured(
        backend: Arc<B>,
        tenant_id: &str,
        pipeline: &PipelineSection,
    ) -> Result<Self, BoardError> {
        Self::load(
            backend,
            tenant_id,
            pipeline.move_timeout(),
            pipeline.intake_stage_label.clone(),
        )
        .await
    }

    pub fn projection(&self) -> &BoardProjection {
        &self.projection
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Error from the most recent rolled-back move, for display.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn clear_error(&mut self) {
        self.last_error = None;
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_command(&self, ticket: MoveTicket) -> Option<&MoveLeadCommand> {
        self.pending.get(&ticket).map(|p| &p.command)
    }

    /// Apply a drag-end locally. A cross-column move is painted immediately
    /// and registered as pending; send it with [`Self::dispatch`].
    pub fn begin(&mut self, drag: &DragEnd) -> DragEffect {
        match reduce(&self.projection, drag) {
            Transition::Unchanged => DragEffect::None,
            Transition::Reordered(next) => {
                self.projection = next;
                DragEffect::Reordered
            }
            Transition::Moved { next, command } => {
                let undo = UndoToken::capture(&self.projection);
                self.projection = next;
                let ticket = MoveTicket(self.next_ticket);
                self.next_ticket += 1;
                tracing::debug!(
                    lead_id = %command.lead_id,
                    stage_id = %command.stage_id,
                    ticket = ticket.0,
                    "optimistic stage move"
                );
                self.pending.insert(ticket, PendingMove { command, undo });
                DragEffect::Dispatched(ticket)
            }
        }
    }

    /// Move a card to the end of a column without a drag gesture.
    pub fn begin_move(&mut self, lead_id: &str, stage_id: &str) -> Result<DragEffect, BoardError> {
        if !self.projection.contains_lead(lead_id) {
            return Err(BoardError::UnknownLead {
                id: lead_id.to_string(),
            });
        }
        if self.projection.column_of_stage(stage_id).is_none() {
            return Err(BoardError::UnknownStage {
                id: stage_id.to_string(),
            });
        }
        Ok(self.begin(&DragEnd::new(lead_id, stage_id)))
    }

    /// Future that sends a pending command under the controller's timeout.
    /// It owns everything it needs, so the caller may spawn it and keep
    /// handling gestures while it runs.
    pub fn dispatch(
        &self,
        ticket: MoveTicket,
    ) -> Option<impl Future<Output = MoveSettlement> + Send + 'static + use<B>> {
        let command = self.pending.get(&ticket)?.command.clone();
        let backend = Arc::clone(&self.backend);
        let timeout = self.timeout;
        Some(async move {
            let result = match tokio::time::timeout(timeout, backend.move_lead(&command)).await {
                Ok(response) if response.success => Ok(()),
                Ok(response) => Err(BoardError::CommandFailed(
                    response
                        .error
                        .unwrap_or_else(|| "stage move failed".to_string()),
                )),
                Err(_) => Err(BoardError::TimedOut(timeout)),
            };
            MoveSettlement { ticket, result }
        })
    }

    /// Resolve a pending move.
    ///
    /// Success refreshes from the server once nothing else is in flight.
    /// Failure or timeout restores the move's undo token and returns the
    /// error for display.
    pub async fn settle(&mut self, settlement: MoveSettlement) -> Result<(), BoardError> {
        let Some(pending) = self.pending.remove(&settlement.ticket) else {
            return Ok(());
        };
        match settlement.result {
            Ok(()) => {
                tracing::debug!(lead_id = %pending.command.lead_id, "stage move confirmed");
                if self.pending.is_empty() {
                    self.refresh_after_settle().await;
                }
                Ok(())
            }
            Err(err) => {
                tracing::warn!(
                    lead_id = %pending.command.lead_id,
                    stage_id = %pending.command.stage_id,
                    error = %err,
                    "stage move failed; rolling back"
                );
                self.projection = apply_undo(&self.projection, pending.undo);
                self.last_error = Some(err.to_string());
                if self.pending.is_empty() {
                    if self.stale {
                        self.refresh_after_settle().await;
                    }
                } else {
                    self.stale = true;
                }
                Err(err)
            }
        }
    }

    async fn refresh_after_settle(&mut self) {
        if let Err(e) = self.refresh().await {
            tracing::warn!(tenant_id = %self.tenant_id, error = %e, "board refresh failed; keeping local state");
        }
    }

    /// Replace the projection with the server's.
    pub async fn refresh(&mut self) -> Result<(), BoardError> {
        let fresh = self.backend.load_board(&self.tenant_id).await?;
        self.projection = fresh;
        self.stale = false;
        Ok(())
    }

    /// Apply a drag-end and, for cross-column moves, wait for the server.
    pub async fn handle_drag_end(&mut self, drag: &DragEnd) -> Result<DragEffect, BoardError> {
        let effect = self.begin(drag);
        if let DragEffect::Dispatched(ticket) = effect {
            if let Some(send) = self.dispatch(ticket) {
                let settlement = send.await;
                self.settle(settlement).await?;
            }
        }
        Ok(effect)
    }

    /// Merge a change-feed insert into the board.
    pub fn apply_insert(&mut self, row: &LeadRow) -> MergeOutcome {
        let outcome = merge_insert(&mut self.projection, row, &self.intake_label);
        if outcome == MergeOutcome::Duplicate {
            tracing::debug!(lead_id = %row.id, "duplicate insert ignored");
        }
        outcome
    }

    /// Apply one change-feed update. An insert is merged; a lag notice
    /// means inserts were lost, so the board is reloaded from the server.
    pub async fn apply_feed_update(&mut self, update: FeedUpdate) -> Result<FeedEffect, BoardError> {
        match update {
            FeedUpdate::Inserted(row) => Ok(FeedEffect::Merged(self.apply_insert(&row))),
            FeedUpdate::Lagged { skipped } => {
                tracing::info!(tenant_id = %self.tenant_id, skipped, "feed lagged; reloading board");
                if self.pending.is_empty() {
                    self.refresh().await?;
                    Ok(FeedEffect::Reloaded)
                } else {
                    self.stale = true;
                    Ok(FeedEffect::ReloadDeferred)
                }
            }
        }
    }
}
