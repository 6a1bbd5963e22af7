pub mod scheduler;

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;

pub type CrmStore = Arc<dyn CrmStoreType>;

/// Minimal deal projection the automation layer needs. The full CRM record
/// lives with the host application.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Deal {
    pub id: Uuid,
    pub org_id: Uuid,
    pub name: String,
    pub contact_phone: String,
    pub contact_name: String,
    pub funnel_id: Uuid,
    pub stage_id: Uuid,
}

/// Per-stage automation rule: which flow to fire when a deal lands on the
/// stage, how long to wait for a reply, and where the deal goes on timeout.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct StageAutomation {
    pub id: Uuid,
    pub org_id: Uuid,
    pub funnel_id: Uuid,
    pub stage_id: Uuid,
    pub flow_id: Uuid,
    pub wait_hours: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_stage_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_funnel_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_stage_id: Option<Uuid>,
    #[serde(default)]
    pub execute_immediately: bool,
    #[serde(default = "StageAutomation::default_active")]
    pub is_active: bool,
}

impl StageAutomation {
    fn default_active() -> bool {
        true
    }

    /// Where the deal goes when the wait expires: explicit next stage first,
    /// then the fallback funnel/stage pair.
    pub fn timeout_destination(&self) -> Option<(Option<Uuid>, Uuid)> {
        if let Some(stage) = self.next_stage_id {
            return Some((None, stage));
        }
        self.fallback_stage_id
            .map(|stage| (self.fallback_funnel_id, stage))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AutomationStatus {
    Pending,
    FlowSent,
    Waiting,
    Responded,
    Moved,
    Failed,
}

impl AutomationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AutomationStatus::Responded | AutomationStatus::Moved | AutomationStatus::Failed
        )
    }

    /// States in which a contact reply resolves the automation.
    pub fn awaits_reply(&self) -> bool {
        matches!(self, AutomationStatus::FlowSent | AutomationStatus::Waiting)
    }
}

/// One live automation run for one deal. At most one non-terminal instance
/// per deal, the same insert-or-fail shape as flow sessions.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct DealAutomation {
    pub id: Uuid,
    pub org_id: Uuid,
    pub deal_id: Uuid,
    pub stage_automation_id: Uuid,
    pub status: AutomationStatus,
    pub chain_depth: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_sent_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_session_id: Option<Uuid>,
}

impl DealAutomation {
    pub fn new(deal: &Deal, config: &StageAutomation, chain_depth: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            org_id: deal.org_id,
            deal_id: deal.id,
            stage_automation_id: config.id,
            status: AutomationStatus::Pending,
            chain_depth,
            created_at: Utc::now(),
            flow_sent_at: None,
            wait_until: None,
            flow_session_id: None,
        }
    }
}

/// Append-only audit row, one per automation transition. Never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct AutomationLog {
    pub id: Uuid,
    pub deal_automation_id: Uuid,
    pub deal_id: Uuid,
    pub event: String,
    pub detail: String,
    pub created_at: DateTime<Utc>,
}

impl AutomationLog {
    pub fn new(
        instance: &DealAutomation,
        event: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            deal_automation_id: instance.id,
            deal_id: instance.deal_id,
            event: event.into(),
            detail: detail.into(),
            created_at: Utc::now(),
        }
    }
}

/// A deal crossing into a stage, the scheduler's entry event.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct StageChange {
    pub deal_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_stage: Option<Uuid>,
    pub to_stage: Uuid,
}

#[async_trait]
pub trait CrmStoreType: Send + Sync + Debug {
    async fn upsert_deal(&self, deal: Deal);
    async fn deal(&self, deal_id: Uuid) -> Option<Deal>;
    /// Moves a deal to another stage (and funnel when given), returning the
    /// updated record.
    async fn move_deal(
        &self,
        deal_id: Uuid,
        funnel_id: Option<Uuid>,
        stage_id: Uuid,
    ) -> Result<Deal, EngineError>;

    async fn put_automation(&self, config: StageAutomation);
    async fn automation(&self, id: Uuid) -> Option<StageAutomation>;
    /// The active automation configured for a stage, if any.
    async fn automation_for_stage(&self, stage_id: Uuid) -> Option<StageAutomation>;

    /// Insert-or-fail against the one-live-instance-per-deal slot.
    async fn create_instance(&self, instance: DealAutomation) -> Result<(), EngineError>;
    /// Write back a mutated instance. A terminal status frees the slot.
    async fn update_instance(&self, instance: DealAutomation) -> Result<(), EngineError>;
    async fn instance(&self, id: Uuid) -> Option<DealAutomation>;
    async fn live_instance_for_deal(&self, deal_id: Uuid) -> Option<DealAutomation>;
    /// Instances created with deferred execution, still waiting to fire.
    async fn pending_instances(&self) -> Vec<DealAutomation>;
    /// Instances in `flow_sent`, due for promotion to `waiting`.
    async fn sent_instances(&self) -> Vec<DealAutomation>;
    /// Reply-awaiting instances whose wait expired at `now`.
    async fn due_instances(&self, now: DateTime<Utc>) -> Vec<DealAutomation>;
    /// Live reply-awaiting instances for a contact phone number.
    async fn waiting_for_contact(&self, contact_phone: &str) -> Vec<DealAutomation>;

    async fn append_log(&self, log: AutomationLog);
    async fn logs_for_deal(&self, deal_id: Uuid) -> Vec<AutomationLog>;
}

#[derive(Debug, Default)]
pub struct InMemoryCrmStore {
    deals: DashMap<Uuid, Deal>,
    configs: DashMap<Uuid, StageAutomation>,
    instances: DashMap<Uuid, DealAutomation>,
    /// deal_id -> live instance id, the uniqueness slot.
    live: DashMap<Uuid, Uuid>,
    logs: DashMap<Uuid, Vec<AutomationLog>>,
}

impl InMemoryCrmStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn instances_where(&self, keep: impl Fn(&DealAutomation) -> bool) -> Vec<DealAutomation> {
        let mut rows: Vec<DealAutomation> = self
            .instances
            .iter()
            .filter(|i| keep(i))
            .map(|i| i.clone())
            .collect();
        rows.sort_by_key(|i| i.created_at);
        rows
    }
}

#[async_trait]
impl CrmStoreType for InMemoryCrmStore {
    async fn upsert_deal(&self, deal: Deal) {
        self.deals.insert(deal.id, deal);
    }

    async fn deal(&self, deal_id: Uuid) -> Option<Deal> {
        self.deals.get(&deal_id).map(|d| d.clone())
    }

    async fn move_deal(
        &self,
        deal_id: Uuid,
        funnel_id: Option<Uuid>,
        stage_id: Uuid,
    ) -> Result<Deal, EngineError> {
        let mut deal = self
            .deals
            .get_mut(&deal_id)
            .ok_or(EngineError::DealNotFound(deal_id))?;
        if let Some(funnel_id) = funnel_id {
            deal.funnel_id = funnel_id;
        }
        deal.stage_id = stage_id;
        Ok(deal.clone())
    }

    async fn put_automation(&self, config: StageAutomation) {
        self.configs.insert(config.stage_id, config);
    }

    async fn automation(&self, id: Uuid) -> Option<StageAutomation> {
        self.configs.iter().find(|c| c.id == id).map(|c| c.clone())
    }

    async fn automation_for_stage(&self, stage_id: Uuid) -> Option<StageAutomation> {
        self.configs
            .get(&stage_id)
            .filter(|c| c.is_active)
            .map(|c| c.clone())
    }

    async fn create_instance(&self, instance: DealAutomation) -> Result<(), EngineError> {
        match self.live.entry(instance.deal_id) {
            Entry::Occupied(slot) => Err(EngineError::Concurrency(format!(
                "deal {} already has live automation {}",
                instance.deal_id,
                slot.get()
            ))),
            Entry::Vacant(slot) => {
                slot.insert(instance.id);
                self.instances.insert(instance.id, instance);
                Ok(())
            }
        }
    }

    async fn update_instance(&self, instance: DealAutomation) -> Result<(), EngineError> {
        if instance.status.is_terminal() {
            self.live
                .remove_if(&instance.deal_id, |_, live_id| *live_id == instance.id);
        }
        self.instances.insert(instance.id, instance);
        Ok(())
    }

    async fn instance(&self, id: Uuid) -> Option<DealAutomation> {
        self.instances.get(&id).map(|i| i.clone())
    }

    async fn live_instance_for_deal(&self, deal_id: Uuid) -> Option<DealAutomation> {
        let live_id = *self.live.get(&deal_id)?;
        self.instances.get(&live_id).map(|i| i.clone())
    }

    async fn pending_instances(&self) -> Vec<DealAutomation> {
        self.instances_where(|i| i.status == AutomationStatus::Pending)
    }

    async fn sent_instances(&self) -> Vec<DealAutomation> {
        self.instances_where(|i| i.status == AutomationStatus::FlowSent)
    }

    async fn due_instances(&self, now: DateTime<Utc>) -> Vec<DealAutomation> {
        self.instances_where(|i| {
            i.status.awaits_reply() && i.wait_until.is_some_and(|until| until <= now)
        })
    }

    async fn waiting_for_contact(&self, contact_phone: &str) -> Vec<DealAutomation> {
        self.instances_where(|i| {
            i.status.awaits_reply()
                && self
                    .deals
                    .get(&i.deal_id)
                    .is_some_and(|d| d.contact_phone == contact_phone)
        })
    }

    async fn append_log(&self, log: AutomationLog) {
        self.logs.entry(log.deal_id).or_default().push(log);
    }

    async fn logs_for_deal(&self, deal_id: Uuid) -> Vec<AutomationLog> {
        self.logs
            .get(&deal_id)
            .map(|rows| rows.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deal() -> Deal {
        Deal {
            id: Uuid::new_v4(),
            org_id: Uuid::new_v4(),
            name: "Proposta ACME".into(),
            contact_phone: "5511988887777".into(),
            contact_name: "Ana".into(),
            funnel_id: Uuid::new_v4(),
            stage_id: Uuid::new_v4(),
        }
    }

    fn config(stage_id: Uuid) -> StageAutomation {
        StageAutomation {
            id: Uuid::new_v4(),
            org_id: Uuid::new_v4(),
            funnel_id: Uuid::new_v4(),
            stage_id,
            flow_id: Uuid::new_v4(),
            wait_hours: 24,
            next_stage_id: None,
            fallback_funnel_id: None,
            fallback_stage_id: Some(Uuid::new_v4()),
            execute_immediately: true,
            is_active: true,
        }
    }

    #[test]
    fn timeout_destination_prefers_next_stage() {
        let stage = Uuid::new_v4();
        let mut c = config(stage);
        let next = Uuid::new_v4();
        c.next_stage_id = Some(next);
        assert_eq!(c.timeout_destination(), Some((None, next)));

        c.next_stage_id = None;
        let funnel = Uuid::new_v4();
        c.fallback_funnel_id = Some(funnel);
        let fallback = c.fallback_stage_id.unwrap();
        assert_eq!(c.timeout_destination(), Some((Some(funnel), fallback)));

        c.fallback_stage_id = None;
        assert_eq!(c.timeout_destination(), None);
    }

    #[tokio::test]
    async fn one_live_instance_per_deal() {
        let store = InMemoryCrmStore::new();
        let deal = deal();
        store.upsert_deal(deal.clone()).await;
        let config = config(deal.stage_id);

        let first = DealAutomation::new(&deal, &config, 0);
        store.create_instance(first.clone()).await.unwrap();

        let second = DealAutomation::new(&deal, &config, 0);
        let err = store.create_instance(second).await.unwrap_err();
        assert!(matches!(err, EngineError::Concurrency(_)));

        // ending the first frees the slot
        let mut ended = first;
        ended.status = AutomationStatus::Responded;
        store.update_instance(ended).await.unwrap();
        assert!(store.live_instance_for_deal(deal.id).await.is_none());

        let third = DealAutomation::new(&deal, &config, 0);
        store.create_instance(third).await.unwrap();
    }

    #[tokio::test]
    async fn due_and_waiting_queries_filter_by_status() {
        let store = InMemoryCrmStore::new();
        let deal = deal();
        store.upsert_deal(deal.clone()).await;
        let config = config(deal.stage_id);
        let now = Utc::now();

        let mut due = DealAutomation::new(&deal, &config, 0);
        due.status = AutomationStatus::Waiting;
        due.wait_until = Some(now - chrono::Duration::minutes(1));
        store.create_instance(due.clone()).await.unwrap();

        assert_eq!(store.due_instances(now).await.len(), 1);
        assert_eq!(
            store.waiting_for_contact(&deal.contact_phone).await.len(),
            1
        );
        assert!(store.waiting_for_contact("550000000000").await.is_empty());

        // responded instances stop matching both queries
        due.status = AutomationStatus::Responded;
        store.update_instance(due).await.unwrap();
        assert!(store.due_instances(now).await.is_empty());
        assert!(
            store
                .waiting_for_contact(&deal.contact_phone)
                .await
                .is_empty()
        );
    }

    #[tokio::test]
    async fn move_deal_updates_stage_and_optionally_funnel() {
        let store = InMemoryCrmStore::new();
        let deal = deal();
        store.upsert_deal(deal.clone()).await;

        let stage = Uuid::new_v4();
        let moved = store.move_deal(deal.id, None, stage).await.unwrap();
        assert_eq!(moved.stage_id, stage);
        assert_eq!(moved.funnel_id, deal.funnel_id);

        let funnel = Uuid::new_v4();
        let stage2 = Uuid::new_v4();
        let moved = store.move_deal(deal.id, Some(funnel), stage2).await.unwrap();
        assert_eq!(moved.funnel_id, funnel);
        assert_eq!(moved.stage_id, stage2);

        let err = store
            .move_deal(Uuid::new_v4(), None, stage)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DealNotFound(_)));
    }

    #[tokio::test]
    async fn logs_accumulate_in_order() {
        let store = InMemoryCrmStore::new();
        let deal = deal();
        let config = config(deal.stage_id);
        let instance = DealAutomation::new(&deal, &config, 0);

        store
            .append_log(AutomationLog::new(&instance, "automation_created", ""))
            .await;
        store
            .append_log(AutomationLog::new(&instance, "flow_sent", "flow x"))
            .await;

        let logs = store.logs_for_deal(deal.id).await;
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].event, "automation_created");
        assert_eq!(logs[1].event, "flow_sent");
    }
}
