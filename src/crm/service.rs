//! CRM service layer: stage directory, lead intake, Stage-Move handler and
//! board queries, with storage errors mapped into [`CrmError`].

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;

use super::board::{BoardBackend, MoveLeadCommand, MoveLeadResponse};
use super::db::{
    DbHandle, LockPoisoned, MoveOutcome, NewLead, StageDeletion, StageOrderExhausted,
};
use super::feed::{ChangeFeed, FeedEvent};
use super::models::*;
use crate::errors::{BoardError, CrmError};

/// Input for lead intake.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LeadIntake {
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub estimated_value: Option<Decimal>,
    #[serde(default)]
    pub source: LeadSource,
}

fn db_error(e: anyhow::Error) -> CrmError {
    if e.is::<LockPoisoned>() {
        CrmError::LockPoisoned
    } else if let Some(exhausted) = e.downcast_ref::<StageOrderExhausted>() {
        CrmError::Validation(exhausted.to_string())
    } else {
        CrmError::Database(e)
    }
}

fn require(value: &str, what: &str) -> Result<(), CrmError> {
    if value.trim().is_empty() {
        return Err(CrmError::Validation(format!("{} is required", what)));
    }
    Ok(())
}

#[derive(Clone)]
pub struct CrmService {
    db: DbHandle,
    feed: ChangeFeed,
    tag_limit: usize,
}

impl CrmService {
    pub fn new(db: DbHandle, feed: ChangeFeed, tag_limit: usize) -> Self {
        Self { db, feed, tag_limit }
    }

    pub fn db(&self) -> &DbHandle {
        &self.db
    }

    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    // ── Tenants ──

    pub async fn create_tenant(&self, name: &str, email: Option<String>) -> Result<Tenant, CrmError> {
        require(name, "tenant name")?;
        let name = name.trim().to_string();
        let tenant = self
            .db
            .call(move |db| db.create_tenant(&name, email.as_deref()))
            .await
            .map_err(db_error)?;
        tracing::info!(tenant_id = %tenant.id, "tenant created");
        Ok(tenant)
    }

    pub async fn get_tenant(&self, tenant_id: &str) -> Result<Tenant, CrmError> {
        let id = tenant_id.to_string();
        self.db
            .call(move |db| db.get_tenant(&id))
            .await
            .map_err(db_error)?
            .ok_or_else(|| CrmError::TenantNotFound {
                id: tenant_id.to_string(),
            })
    }

    // ── Stage directory ──

    pub async fn list_stages(&self, tenant_id: &str) -> Result<Vec<Stage>, CrmError> {
        self.get_tenant(tenant_id).await?;
        let id = tenant_id.to_string();
        self.db
            .call(move |db| db.list_stages(&id))
            .await
            .map_err(db_error)
    }

    pub async fn create_stage(&self, tenant_id: &str, name: &str) -> Result<Stage, CrmError> {
        require(name, "stage name")?;
        self.get_tenant(tenant_id).await?;
        let id = tenant_id.to_string();
        let stage_name = name.trim().to_string();
        let created = self
            .db
            .call(move |db| db.create_stage(&id, &stage_name))
            .await
            .map_err(db_error)?;
        match created {
            Some(stage) => {
                tracing::info!(tenant_id = %tenant_id, stage_id = %stage.id, order = stage.order, "stage created");
                Ok(stage)
            }
            None => Err(CrmError::Validation(format!(
                "A stage named '{}' already exists",
                name.trim()
            ))),
        }
    }

    pub async fn update_stage(
        &self,
        stage_id: &str,
        name: Option<String>,
        status: Option<StageStatus>,
    ) -> Result<Stage, CrmError> {
        if let Some(n) = &name {
            require(n, "stage name")?;
        }
        let id = stage_id.to_string();
        let name = name.map(|n| n.trim().to_string());
        self.db
            .call(move |db| {
                let Some(stage) = db.get_stage(&id)? else {
                    return Ok(Err(CrmError::StageNotFound { id }));
                };
                if let Some(n) = &name {
                    let taken = db
                        .list_stages(&stage.tenant_id)?
                        .iter()
                        .any(|s| s.id != stage.id && &s.name == n);
                    if taken {
                        return Ok(Err(CrmError::Validation(format!(
                            "A stage named '{}' already exists",
                            n
                        ))));
                    }
                }
                Ok(db
                    .update_stage(&id, name.as_deref(), status)?
                    .ok_or(CrmError::StageNotFound { id }))
            })
            .await
            .map_err(db_error)?
    }

    pub async fn delete_stage(&self, stage_id: &str) -> Result<(), CrmError> {
        let id = stage_id.to_string();
        let deletion = self
            .db
            .call(move |db| db.delete_stage(&id))
            .await
            .map_err(db_error)?;
        match deletion {
            StageDeletion::Deleted => {
                tracing::info!(stage_id = %stage_id, "stage deleted");
                Ok(())
            }
            StageDeletion::NotFound => Err(CrmError::StageNotFound {
                id: stage_id.to_string(),
            }),
            StageDeletion::HasLeads(count) => Err(CrmError::StageHasLeads {
                id: stage_id.to_string(),
                count,
            }),
        }
    }

    /// Apply new display orders in one transaction. An empty list is a no-op.
    /// Orders must lie in `1..=MAX_STAGE_ORDER`.
    pub async fn reorder_stages(
        &self,
        tenant_id: &str,
        orders: Vec<(String, i32)>,
    ) -> Result<Vec<Stage>, CrmError> {
        if let Some((stage_id, order)) = orders
            .iter()
            .find(|(_, order)| !(1..=MAX_STAGE_ORDER).contains(order))
        {
            return Err(CrmError::Validation(format!(
                "Stage {} order {} is outside 1..={}",
                stage_id, order, MAX_STAGE_ORDER
            )));
        }
        self.get_tenant(tenant_id).await?;
        if orders.is_empty() {
            return self.list_stages(tenant_id).await;
        }
        let tenant = tenant_id.to_string();
        self.db
            .call(move |db| {
                for (stage_id, _) in &orders {
                    let owned = db
                        .get_stage(stage_id)?
                        .is_some_and(|s| s.tenant_id == tenant);
                    if !owned {
                        return Ok(Err(CrmError::StageNotFound {
                            id: stage_id.clone(),
                        }));
                    }
                }
                if !db.reorder_stages(&tenant, &orders)? {
                    anyhow::bail!("stage reorder rolled back");
                }
                Ok(Ok(db.list_stages(&tenant)?))
            })
            .await
            .map_err(db_error)?
    }

    // ── Leads ──

    /// Create a lead in the tenant's intake stage and publish it on the
    /// tenant's change feed.
    pub async fn create_lead(&self, tenant_id: &str, intake: LeadIntake) -> Result<Lead, CrmError> {
        require(&intake.name, "lead name")?;
        self.get_tenant(tenant_id).await?;
        let tenant = tenant_id.to_string();
        let row = self
            .db
            .call(move |db| {
                let Some(stage) = db.first_active_stage(&tenant)? else {
                    return Ok(Err(CrmError::NoIntakeStage { tenant_id: tenant }));
                };
                let new_lead = NewLead {
                    tenant_id: tenant,
                    stage_id: stage.id,
                    name: intake.name.trim().to_string(),
                    email: intake.email,
                    phone: intake.phone,
                    estimated_value: intake.estimated_value,
                    source: intake.source,
                };
                Ok(Ok(db.insert_lead(&new_lead, Utc::now())?))
            })
            .await
            .map_err(db_error)??;

        tracing::info!(tenant_id = %row.tenant_id, lead_id = %row.id, stage_id = %row.stage_id, "lead created");
        let delivered = self.feed.publish(&FeedEvent::LeadInserted {
            record: row.clone(),
        });
        tracing::debug!(lead_id = %row.id, delivered, "lead insert published");
        Ok(row.into_lead(Vec::new(), None))
    }

    pub async fn get_lead(&self, lead_id: &str) -> Result<Lead, CrmError> {
        let id = lead_id.to_string();
        self.db
            .call(move |db| db.get_lead(&id))
            .await
            .map_err(db_error)?
            .ok_or_else(|| CrmError::LeadNotFound {
                id: lead_id.to_string(),
            })
    }

    /// Stage-Move handler: reassign one lead's stage, scoped to a tenant.
    /// Does not publish on the change feed.
    pub async fn move_lead(&self, command: &MoveLeadCommand) -> Result<LeadRow, CrmError> {
        require(&command.lead_id, "lead id")?;
        require(&command.stage_id, "stage id")?;
        require(&command.tenant_id, "tenant id")?;

        let cmd = command.clone();
        let outcome = self
            .db
            .call(move |db| db.move_lead(&cmd.lead_id, &cmd.stage_id, &cmd.tenant_id, Utc::now()))
            .await
            .map_err(|e| {
                tracing::error!(lead_id = %command.lead_id, error = %e, "stage move failed");
                db_error(e)
            })?;

        match outcome {
            MoveOutcome::Moved {
                previous_stage_id,
                lead,
            } => {
                tracing::info!(
                    tenant_id = %command.tenant_id,
                    lead_id = %lead.id,
                    from_stage = %previous_stage_id,
                    stage_id = %lead.stage_id,
                    "lead moved"
                );
                Ok(lead)
            }
            MoveOutcome::LeadNotFound => {
                tracing::warn!(tenant_id = %command.tenant_id, lead_id = %command.lead_id, "stage move rejected: lead not found");
                Err(CrmError::LeadNotFound {
                    id: command.lead_id.clone(),
                })
            }
            MoveOutcome::StageNotFound => {
                tracing::warn!(tenant_id = %command.tenant_id, stage_id = %command.stage_id, "stage move rejected: stage not found");
                Err(CrmError::StageNotFound {
                    id: command.stage_id.clone(),
                })
            }
        }
    }

    // ── Tags and scheduling ──

    pub async fn create_tag(
        &self,
        tenant_id: &str,
        name: &str,
        color: Option<String>,
    ) -> Result<Tag, CrmError> {
        require(name, "tag name")?;
        self.get_tenant(tenant_id).await?;
        let tenant = tenant_id.to_string();
        let tag_name = name.trim().to_string();
        self.db
            .call(move |db| db.create_tag(&tenant, &tag_name, color.as_deref()))
            .await
            .map_err(db_error)?
            .ok_or_else(|| CrmError::Validation(format!("A tag named '{}' already exists", name.trim())))
    }

    /// Replace a lead's tags. Every tag must belong to the lead's tenant.
    pub async fn assign_tags(&self, lead_id: &str, tag_ids: Vec<String>) -> Result<Lead, CrmError> {
        let id = lead_id.to_string();
        let unique: Vec<String> = tag_ids
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        self.db
            .call(move |db| {
                let Some(lead) = db.get_lead_row(&id)? else {
                    return Ok(Err(CrmError::LeadNotFound { id }));
                };
                for tag_id in &unique {
                    let owned = db
                        .get_tag(tag_id)?
                        .is_some_and(|t| t.tenant_id == lead.tenant_id);
                    if !owned {
                        return Ok(Err(CrmError::TagNotFound { id: tag_id.clone() }));
                    }
                }
                db.set_lead_tags(&id, &unique)?;
                db.get_lead(&id)?
                    .map(Ok)
                    .ok_or_else(|| anyhow::anyhow!("Lead {} vanished after tagging", id))
            })
            .await
            .map_err(db_error)?
    }

    pub async fn set_next_appointment(
        &self,
        lead_id: &str,
        at: Option<DateTime<Utc>>,
    ) -> Result<Lead, CrmError> {
        let id = lead_id.to_string();
        self.db
            .call(move |db| {
                if db.get_lead_row(&id)?.is_none() {
                    return Ok(Err(CrmError::LeadNotFound { id }));
                }
                db.set_next_appointment(&id, at)?;
                db.get_lead(&id)?
                    .map(Ok)
                    .ok_or_else(|| anyhow::anyhow!("Lead {} vanished after scheduling", id))
            })
            .await
            .map_err(db_error)?
    }

    // ── Board ──

    pub async fn load_board(&self, tenant_id: &str) -> Result<BoardProjection, CrmError> {
        self.get_tenant(tenant_id).await?;
        let id = tenant_id.to_string();
        let tag_limit = self.tag_limit;
        self.db
            .call(move |db| db.load_board(&id, tag_limit))
            .await
            .map_err(db_error)
    }
}

/// In-process backend for a board controller running next to the service.
#[async_trait]
impl BoardBackend for CrmService {
    async fn move_lead(&self, command: &MoveLeadCommand) -> MoveLeadResponse {
        match CrmService::move_lead(self, command).await {
            Ok(_) => MoveLeadResponse::ok(),
            Err(e) => MoveLeadResponse::failed(e.to_string()),
        }
    }

    async fn load_board(&self, tenant_id: &str) -> Result<BoardProjection, BoardError> {
        CrmService::load_board(self, tenant_id)
            .await
            .map_err(|e| BoardError::Transport(anyhow::Error::new(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crm::db::CrmDb;

    async fn service() -> (CrmService, Tenant) {
        let svc = CrmService::new(DbHandle::new(CrmDb::new_in_memory().unwrap()), ChangeFeed::new(16), 3);
        let tenant = svc.create_tenant("Clínica Sol", None).await.unwrap();
        (svc, tenant)
    }

    fn intake(name: &str) -> LeadIntake {
        LeadIntake {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn command(lead: &str, stage: &str, tenant: &str) -> MoveLeadCommand {
        MoveLeadCommand {
            lead_id: lead.into(),
            stage_id: stage.into(),
            tenant_id: tenant.into(),
        }
    }

    #[tokio::test]
    async fn test_create_lead_requires_intake_stage() {
        let (svc, tenant) = service().await;
        let err = svc.create_lead(&tenant.id, intake("Ana")).await.unwrap_err();
        assert!(matches!(err, CrmError::NoIntakeStage { .. }));
    }

    #[tokio::test]
    async fn test_create_lead_uses_first_active_stage_and_publishes() {
        let (svc, tenant) = service().await;
        let archivo = svc.create_stage(&tenant.id, "Archivo").await.unwrap();
        let nuevo = svc.create_stage(&tenant.id, "Nuevo").await.unwrap();
        svc.update_stage(&archivo.id, None, Some(StageStatus::Inactive))
            .await
            .unwrap();

        let mut rx = svc.feed().subscribe(&tenant.id);
        let lead = svc.create_lead(&tenant.id, intake("Ana")).await.unwrap();
        assert_eq!(lead.stage_id, nuevo.id);

        let msg = rx.recv().await.unwrap();
        let event: FeedEvent = serde_json::from_str(&msg).unwrap();
        let record = match event {
            FeedEvent::LeadInserted { record } => record,
            other => panic!("Expected LeadInserted, got {:?}", other),
        };
        assert_eq!(record.id, lead.id);
        assert_eq!(record.stage_id, nuevo.id);
    }

    #[tokio::test]
    async fn test_create_lead_validates_name_and_tenant() {
        let (svc, tenant) = service().await;
        svc.create_stage(&tenant.id, "Nuevo").await.unwrap();
        assert!(matches!(
            svc.create_lead(&tenant.id, intake("  ")).await.unwrap_err(),
            CrmError::Validation(_)
        ));
        assert!(matches!(
            svc.create_lead("missing", intake("Ana")).await.unwrap_err(),
            CrmError::TenantNotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_move_lead_validates_ids_before_storage() {
        let (svc, tenant) = service().await;
        let err = svc.move_lead(&command("", "s", &tenant.id)).await.unwrap_err();
        assert!(matches!(err, CrmError::Validation(_)));
        let err = svc.move_lead(&command("l", " ", &tenant.id)).await.unwrap_err();
        assert!(matches!(err, CrmError::Validation(_)));
    }

    #[tokio::test]
    async fn test_move_lead_cross_tenant_is_not_found_and_unchanged() {
        let (svc, tenant) = service().await;
        let nuevo = svc.create_stage(&tenant.id, "Nuevo").await.unwrap();
        let lead = svc.create_lead(&tenant.id, intake("Ana")).await.unwrap();

        let other = svc.create_tenant("Otro", None).await.unwrap();
        let foreign = svc.create_stage(&other.id, "Nuevo").await.unwrap();

        let err = svc
            .move_lead(&command(&lead.id, &foreign.id, &tenant.id))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(svc.get_lead(&lead.id).await.unwrap().stage_id, nuevo.id);

        let err = svc
            .move_lead(&command(&lead.id, &foreign.id, &other.id))
            .await
            .unwrap_err();
        assert!(matches!(err, CrmError::LeadNotFound { .. }));
    }

    #[tokio::test]
    async fn test_move_lead_does_not_publish() {
        let (svc, tenant) = service().await;
        svc.create_stage(&tenant.id, "Nuevo").await.unwrap();
        let contactado = svc.create_stage(&tenant.id, "Contactado").await.unwrap();
        let lead = svc.create_lead(&tenant.id, intake("Ana")).await.unwrap();

        let mut rx = svc.feed().subscribe(&tenant.id);
        let moved = svc
            .move_lead(&command(&lead.id, &contactado.id, &tenant.id))
            .await
            .unwrap();
        assert_eq!(moved.stage_id, contactado.id);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stage_crud() {
        let (svc, tenant) = service().await;
        let nuevo = svc.create_stage(&tenant.id, "Nuevo").await.unwrap();
        let ganado = svc.create_stage(&tenant.id, "Ganado").await.unwrap();

        assert!(matches!(
            svc.create_stage(&tenant.id, "Nuevo").await.unwrap_err(),
            CrmError::Validation(_)
        ));
        assert!(matches!(
            svc.update_stage(&ganado.id, Some("Nuevo".into()), None).await.unwrap_err(),
            CrmError::Validation(_)
        ));

        let renamed = svc
            .update_stage(&ganado.id, Some("Cerrado".into()), None)
            .await
            .unwrap();
        assert_eq!(renamed.name, "Cerrado");

        svc.create_lead(&tenant.id, intake("Ana")).await.unwrap();
        assert!(matches!(
            svc.delete_stage(&nuevo.id).await.unwrap_err(),
            CrmError::StageHasLeads { count: 1, .. }
        ));
        svc.delete_stage(&ganado.id).await.unwrap();
        assert!(matches!(
            svc.delete_stage(&ganado.id).await.unwrap_err(),
            CrmError::StageNotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_reorder_stages() {
        let (svc, tenant) = service().await;
        let a = svc.create_stage(&tenant.id, "A").await.unwrap();
        let b = svc.create_stage(&tenant.id, "B").await.unwrap();

        let unchanged = svc.reorder_stages(&tenant.id, vec![]).await.unwrap();
        assert_eq!(unchanged.len(), 2);

        let stages = svc
            .reorder_stages(&tenant.id, vec![(a.id.clone(), 2), (b.id.clone(), 1)])
            .await
            .unwrap();
        assert_eq!(stages[0].id, b.id);

        let other = svc.create_tenant("Otro", None).await.unwrap();
        let foreign = svc.create_stage(&other.id, "X").await.unwrap();
        let err = svc
            .reorder_stages(&tenant.id, vec![(a.id.clone(), 1), (foreign.id.clone(), 2)])
            .await
            .unwrap_err();
        assert!(matches!(err, CrmError::StageNotFound { id } if id == foreign.id));
        let stages = svc.list_stages(&tenant.id).await.unwrap();
        assert_eq!(stages[0].id, b.id, "failed reorder changes nothing");
    }

    #[tokio::test]
    async fn test_reorder_out_of_range_keeps_stage_creation_working() {
        let (svc, tenant) = service().await;
        let a = svc.create_stage(&tenant.id, "A").await.unwrap();

        for order in [i32::MAX, MAX_STAGE_ORDER + 1, 0, -1] {
            let err = svc
                .reorder_stages(&tenant.id, vec![(a.id.clone(), order)])
                .await
                .unwrap_err();
            assert!(matches!(err, CrmError::Validation(_)), "order {order}: {err:?}");
        }

        let b = svc.create_stage(&tenant.id, "B").await.unwrap();
        assert_eq!(b.order, 2);
        assert_eq!(svc.list_stages(&tenant.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_create_stage_at_max_order_is_validation_error() {
        let handle = DbHandle::new(CrmDb::new_in_memory().unwrap());
        let svc = CrmService::new(handle.clone(), ChangeFeed::new(16), 3);
        let tenant = svc.create_tenant("Clínica Sol", None).await.unwrap();
        let a = svc.create_stage(&tenant.id, "A").await.unwrap();
        svc.reorder_stages(&tenant.id, vec![(a.id.clone(), MAX_STAGE_ORDER)])
            .await
            .unwrap();

        let err = svc.create_stage(&tenant.id, "B").await.unwrap_err();
        assert!(matches!(err, CrmError::Validation(_)), "{err:?}");

        // The handle is still usable afterwards.
        assert_eq!(svc.list_stages(&tenant.id).await.unwrap().len(), 1);
        assert!(handle.lock_sync().is_ok());
    }

    #[tokio::test]
    async fn test_poisoned_lock_maps_to_lock_poisoned() {
        let handle = DbHandle::new(CrmDb::new_in_memory().unwrap());
        let svc = CrmService::new(handle.clone(), ChangeFeed::new(16), 3);
        let tenant = svc.create_tenant("Clínica Sol", None).await.unwrap();

        let crashed = handle
            .call(|_db| -> anyhow::Result<()> { panic!("storage thread crashed") })
            .await;
        assert!(crashed.is_err());

        let err = svc.list_stages(&tenant.id).await.unwrap_err();
        assert!(matches!(err, CrmError::LockPoisoned), "{err:?}");
        assert!(handle.lock_sync().err().is_some_and(|e| e.is::<LockPoisoned>()));
    }

    #[test]
    fn test_db_error_classification() {
        assert!(matches!(
            db_error(anyhow::Error::new(LockPoisoned)),
            CrmError::LockPoisoned
        ));
        // Message text alone does not mark a lock failure.
        assert!(matches!(
            db_error(anyhow::anyhow!("lock poisoned somewhere in a message")),
            CrmError::Database(_)
        ));
        let exhausted = StageOrderExhausted {
            tenant_id: "t1".into(),
            max_order: MAX_STAGE_ORDER,
        };
        assert!(matches!(
            db_error(anyhow::Error::new(exhausted).context("Failed to create stage")),
            CrmError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn test_assign_tags_scoped_to_lead_tenant() {
        let (svc, tenant) = service().await;
        svc.create_stage(&tenant.id, "Nuevo").await.unwrap();
        let lead = svc.create_lead(&tenant.id, intake("Ana")).await.unwrap();
        let vip = svc.create_tag(&tenant.id, "vip", Some("#f00".into())).await.unwrap();

        let other = svc.create_tenant("Otro", None).await.unwrap();
        let foreign = svc.create_tag(&other.id, "vip", None).await.unwrap();

        let err = svc
            .assign_tags(&lead.id, vec![vip.id.clone(), foreign.id.clone()])
            .await
            .unwrap_err();
        assert!(matches!(err, CrmError::TagNotFound { .. }));

        let tagged = svc
            .assign_tags(&lead.id, vec![vip.id.clone(), vip.id.clone()])
            .await
            .unwrap();
        assert_eq!(tagged.tags.len(), 1);
        assert_eq!(tagged.tags[0].name, "vip");
    }

    #[tokio::test]
    async fn test_set_next_appointment() {
        let (svc, tenant) = service().await;
        svc.create_stage(&tenant.id, "Nuevo").await.unwrap();
        let lead = svc.create_lead(&tenant.id, intake("Ana")).await.unwrap();
        let at = Utc::now() + chrono::Duration::days(2);
        let updated = svc.set_next_appointment(&lead.id, Some(at)).await.unwrap();
        assert_eq!(updated.next_appointment_at, Some(at));
        assert!(matches!(
            svc.set_next_appointment("missing", None).await.unwrap_err(),
            CrmError::LeadNotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_in_process_backend_reports_failures() {
        let (svc, tenant) = service().await;
        let response = BoardBackend::move_lead(&svc, &command("missing", "s", &tenant.id)).await;
        assert!(!response.success);
        assert!(response.error.unwrap().contains("not found"));

        let board = BoardBackend::load_board(&svc, &tenant.id).await.unwrap();
        assert!(board.columns.is_empty());
    }
}
