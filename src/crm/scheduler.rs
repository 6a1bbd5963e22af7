//! Stage automation: a deal entering a configured funnel stage fires a
//! follow-up flow and opens a reply window. A reply resolves the automation;
//! silence past `wait_until` moves the deal to the configured next or
//! fallback stage, which may chain into that stage's own automation.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::crm::{
    AutomationLog, AutomationStatus, CrmStore, Deal, DealAutomation, StageAutomation, StageChange,
};
use crate::error::EngineError;
use crate::flow::engine::FlowEngine;
use crate::flow::resolver::FlowResolver;
use crate::flow::session::ConversationKey;
use crate::logger;

/// Automation-triggered moves may land on another automated stage. The chain
/// fails closed past this depth instead of bouncing a deal forever.
pub const MAX_CHAIN_DEPTH: u32 = 5;

/// What one timer sweep did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    /// Deferred instances whose flow went out this sweep.
    pub fired: usize,
    /// Instances promoted from `flow_sent` to `waiting`.
    pub promoted: usize,
    /// Expired waits resolved, whether the deal moved or the instance failed.
    pub timed_out: usize,
}

pub struct StageAutomationScheduler {
    store: CrmStore,
    engine: Arc<FlowEngine>,
    resolver: Arc<FlowResolver>,
}

impl StageAutomationScheduler {
    pub fn new(
        store: CrmStore,
        engine: Arc<FlowEngine>,
        resolver: Arc<FlowResolver>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            engine,
            resolver,
        })
    }

    pub fn store(&self) -> CrmStore {
        self.store.clone()
    }

    /// Reacts to a deal moving into a stage. No automation on the stage is a
    /// quiet no-op; losing the live-instance slot to another worker discards
    /// this attempt.
    pub async fn on_stage_change(&self, change: StageChange) -> Result<(), EngineError> {
        self.enter_stage(change.deal_id, change.to_stage, 0).await
    }

    /// Marks every reply-awaiting automation of this contact as responded.
    /// Runs on the inbound hot path, so store failures are logged rather
    /// than propagated.
    pub async fn note_reply(&self, contact_phone: &str) -> usize {
        let mut resolved = 0;
        for mut instance in self.store.waiting_for_contact(contact_phone).await {
            instance.status = AutomationStatus::Responded;
            match self.store.update_instance(instance.clone()).await {
                Ok(()) => {
                    self.log(&instance, "contact_responded", String::new())
                        .await;
                    resolved += 1;
                }
                Err(err) => {
                    warn!(
                        instance_id = %instance.id,
                        error = %err,
                        "failed to mark automation as responded"
                    );
                }
            }
        }
        resolved
    }

    /// Timer sweep. Promotes freshly sent instances to `waiting`, fires
    /// deferred ones, then resolves every wait that expired at `now`.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, EngineError> {
        let mut report = TickReport::default();

        for mut instance in self.store.sent_instances().await {
            instance.status = AutomationStatus::Waiting;
            self.store.update_instance(instance.clone()).await?;
            self.log(&instance, "awaiting_reply", String::new()).await;
            report.promoted += 1;
        }

        for mut instance in self.store.pending_instances().await {
            let Some(config) = self.store.automation(instance.stage_automation_id).await else {
                self.fail(instance, "stage automation removed").await?;
                continue;
            };
            let Some(deal) = self.store.deal(instance.deal_id).await else {
                self.fail(instance, "deal removed").await?;
                continue;
            };
            self.fire_flow(&mut instance, &config, &deal).await?;
            if instance.status == AutomationStatus::FlowSent {
                report.fired += 1;
            }
        }

        for instance in self.store.due_instances(now).await {
            self.resolve_timeout(instance).await?;
            report.timed_out += 1;
        }

        Ok(report)
    }

    async fn enter_stage(
        &self,
        deal_id: Uuid,
        stage_id: Uuid,
        chain_depth: u32,
    ) -> Result<(), EngineError> {
        let Some(config) = self.store.automation_for_stage(stage_id).await else {
            return Ok(());
        };
        let deal = self
            .store
            .deal(deal_id)
            .await
            .ok_or(EngineError::DealNotFound(deal_id))?;

        let mut instance = DealAutomation::new(&deal, &config, chain_depth);
        if let Err(err) = self.store.create_instance(instance.clone()).await {
            return match err {
                EngineError::Concurrency(detail) => {
                    debug!(deal_id = %deal_id, %detail, "deal already owned, discarding stage entry");
                    Ok(())
                }
                other => Err(other),
            };
        }
        self.log(
            &instance,
            "automation_created",
            format!("stage {stage_id}, chain depth {chain_depth}"),
        )
        .await;

        if chain_depth >= MAX_CHAIN_DEPTH {
            warn!(deal_id = %deal_id, chain_depth, "automation chain depth cap reached");
            return self.fail(instance, "chain depth cap reached").await;
        }

        if config.execute_immediately {
            self.fire_flow(&mut instance, &config, &deal).await?;
        }
        Ok(())
    }

    /// Starts the configured flow for the deal's contact and arms the reply
    /// window. An already-active conversation is not interrupted: the
    /// instance waits on the running exchange instead.
    async fn fire_flow(
        &self,
        instance: &mut DealAutomation,
        config: &StageAutomation,
        deal: &Deal,
    ) -> Result<(), EngineError> {
        let compiled = match self.resolver.resolve(config.flow_id).await {
            Ok(compiled) => compiled,
            Err(err)
                if err.is_configuration() || matches!(err, EngineError::FlowNotFound(_)) =>
            {
                self.fail_in_place(instance, &format!("flow unavailable: {err}"))
                    .await?;
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        let conversation = ConversationKey::direct(
            compiled.definition().connection_id,
            &deal.contact_phone,
        );

        let now = Utc::now();
        let started = self
            .engine
            .start_flow(
                config.flow_id,
                conversation,
                &deal.contact_phone,
                &deal.contact_name,
            )
            .await;
        match started {
            Ok(outcome) => {
                instance.status = AutomationStatus::FlowSent;
                instance.flow_sent_at = Some(now);
                instance.wait_until = Some(now + Duration::hours(config.wait_hours));
                instance.flow_session_id = Some(outcome.session_id);
                self.store.update_instance(instance.clone()).await?;
                self.log(
                    instance,
                    "flow_sent",
                    format!("flow {} session {}", config.flow_id, outcome.session_id),
                )
                .await;
            }
            Err(EngineError::Concurrency(detail)) => {
                // the contact is mid-conversation; let that exchange count
                instance.status = AutomationStatus::Waiting;
                instance.wait_until = Some(now + Duration::hours(config.wait_hours));
                self.store.update_instance(instance.clone()).await?;
                self.log(instance, "flow_skipped", detail).await;
            }
            Err(err) if err.is_transient() => {
                // stays pending, retried on the next tick
                self.log(instance, "flow_error", err.to_string()).await;
            }
            Err(err) => {
                self.fail_in_place(instance, &format!("flow start failed: {err}"))
                    .await?;
            }
        }
        Ok(())
    }

    /// Wait expired without a reply. Moves the deal to the configured
    /// destination and hands the new stage back to `enter_stage` so chained
    /// automations fire.
    async fn resolve_timeout(&self, mut instance: DealAutomation) -> Result<(), EngineError> {
        let Some(config) = self.store.automation(instance.stage_automation_id).await else {
            return self.fail(instance, "stage automation removed").await;
        };
        let Some((funnel_id, stage_id)) = config.timeout_destination() else {
            return self
                .fail(instance, "wait expired with no destination stage")
                .await;
        };

        let deal = match self
            .store
            .move_deal(instance.deal_id, funnel_id, stage_id)
            .await
        {
            Ok(deal) => deal,
            Err(EngineError::DealNotFound(_)) => {
                return self.fail(instance, "deal removed").await;
            }
            Err(err) => return Err(err),
        };

        instance.status = AutomationStatus::Moved;
        self.store.update_instance(instance.clone()).await?;
        self.log(&instance, "deal_moved", format!("stage {stage_id}"))
            .await;

        self.enter_stage(deal.id, stage_id, instance.chain_depth + 1)
            .await
    }

    async fn fail(&self, instance: DealAutomation, reason: &str) -> Result<(), EngineError> {
        let mut instance = instance;
        self.fail_in_place(&mut instance, reason).await
    }

    async fn fail_in_place(
        &self,
        instance: &mut DealAutomation,
        reason: &str,
    ) -> Result<(), EngineError> {
        instance.status = AutomationStatus::Failed;
        self.store.update_instance(instance.clone()).await?;
        self.log(instance, "automation_failed", reason.to_string())
            .await;
        Ok(())
    }

    /// Every transition lands in both sinks: the append-only per-deal table
    /// and the JSON audit log.
    async fn log(&self, instance: &DealAutomation, event: &str, detail: String) {
        logger::audit(&instance.deal_id.to_string(), event, &detail);
        self.store
            .append_log(AutomationLog::new(instance, event, detail))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use gateway_client::test_util::RecordingGateway;
    use uuid::Uuid;

    use super::*;
    use crate::crm::InMemoryCrmStore;
    use crate::flow::definition::{FlowDefinition, InputNode, MessageNode, NodeKind};
    use crate::flow::engine::NoopHooks;
    use crate::flow::resolver::InMemoryFlowStore;
    use crate::flow::session::InMemorySessionStore;
    use crate::llm::LlmClient;

    struct CannedLlm;

    #[async_trait]
    impl LlmClient for CannedLlm {
        async fn complete(&self, _prompt: &str) -> Result<String, EngineError> {
            Ok("ok".into())
        }
    }

    struct Rig {
        scheduler: Arc<StageAutomationScheduler>,
        crm: CrmStore,
        resolver: Arc<FlowResolver>,
        engine: Arc<FlowEngine>,
        recorder: RecordingGateway,
    }

    fn rig() -> Rig {
        let resolver = FlowResolver::new(InMemoryFlowStore::new());
        let recorder = RecordingGateway::new();
        let engine = FlowEngine::new(
            resolver.clone(),
            InMemorySessionStore::new(),
            Arc::new(recorder.clone()),
            Arc::new(CannedLlm),
            Arc::new(NoopHooks),
        );
        let crm: CrmStore = InMemoryCrmStore::new();
        let scheduler = StageAutomationScheduler::new(crm.clone(), engine.clone(), resolver.clone());
        Rig {
            scheduler,
            crm,
            resolver,
            engine,
            recorder,
        }
    }

    fn deal(stage_id: Uuid) -> Deal {
        Deal {
            id: Uuid::new_v4(),
            org_id: Uuid::new_v4(),
            name: "Proposta ACME".into(),
            contact_phone: "5511988887777".into(),
            contact_name: "Ana".into(),
            funnel_id: Uuid::new_v4(),
            stage_id,
        }
    }

    fn automation(stage_id: Uuid, flow_id: Uuid) -> StageAutomation {
        StageAutomation {
            id: Uuid::new_v4(),
            org_id: Uuid::new_v4(),
            funnel_id: Uuid::new_v4(),
            stage_id,
            flow_id,
            wait_hours: 24,
            next_stage_id: None,
            fallback_funnel_id: None,
            fallback_stage_id: Some(Uuid::new_v4()),
            execute_immediately: true,
            is_active: true,
        }
    }

    /// start -> one nudge message -> end. Completes in a single walk.
    fn followup_flow(connection_id: Uuid) -> FlowDefinition {
        FlowDefinition::new(Uuid::new_v4(), connection_id, "cobranca")
            .add_node("start", NodeKind::Start)
            .add_node(
                "nudge",
                NodeKind::Message(MessageNode {
                    text: "Oi {{contact.name}}, conseguiu ver a proposta?".into(),
                    media: None,
                }),
            )
            .add_node("done", NodeKind::End)
            .add_edge("start", "nudge")
            .add_edge("nudge", "done")
    }

    /// start -> input. Parks and keeps the conversation slot occupied.
    fn parking_flow(connection_id: Uuid) -> FlowDefinition {
        FlowDefinition::new(Uuid::new_v4(), connection_id, "pesquisa")
            .add_node("start", NodeKind::Start)
            .add_node(
                "ask",
                NodeKind::Input(InputNode {
                    field_name: "resposta".into(),
                    prompt: Some("Me conta o que achou.".into()),
                }),
            )
            .add_node("done", NodeKind::End)
            .add_edge("start", "ask")
            .add_edge("ask", "done")
    }

    /// Publishes a follow-up flow and returns its id.
    async fn publish_followup(r: &Rig) -> Uuid {
        let flow = followup_flow(Uuid::new_v4());
        let flow_id = flow.id;
        r.resolver.publish(flow).await.expect("publish");
        flow_id
    }

    async fn seed(r: &Rig, deal: &Deal, config: &StageAutomation) {
        r.crm.upsert_deal(deal.clone()).await;
        r.crm.put_automation(config.clone()).await;
    }

    async fn enter(r: &Rig, deal: &Deal) {
        r.scheduler
            .on_stage_change(StageChange {
                deal_id: deal.id,
                from_stage: None,
                to_stage: deal.stage_id,
            })
            .await
            .expect("stage change");
    }

    async fn events(r: &Rig, deal_id: Uuid) -> Vec<String> {
        r.crm
            .logs_for_deal(deal_id)
            .await
            .into_iter()
            .map(|l| l.event)
            .collect()
    }

    #[tokio::test]
    async fn stage_entry_fires_the_flow_and_arms_the_wait() {
        let r = rig();
        let flow_id = publish_followup(&r).await;
        let stage = Uuid::new_v4();
        let deal = deal(stage);
        let config = automation(stage, flow_id);
        seed(&r, &deal, &config).await;

        enter(&r, &deal).await;

        let instance = r.crm.live_instance_for_deal(deal.id).await.unwrap();
        assert_eq!(instance.status, AutomationStatus::FlowSent);
        assert!(instance.flow_session_id.is_some());
        let sent_at = instance.flow_sent_at.unwrap();
        assert_eq!(instance.wait_until.unwrap(), sent_at + Duration::hours(24));

        let sent = r.recorder.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "5511988887777@s.whatsapp.net");
        assert_eq!(
            sent[0].text_body(),
            Some("Oi Ana, conseguiu ver a proposta?")
        );
        assert_eq!(events(&r, deal.id).await, vec!["automation_created", "flow_sent"]);
    }

    #[tokio::test]
    async fn a_reply_before_the_deadline_resolves_the_automation() {
        let r = rig();
        let flow_id = publish_followup(&r).await;
        let stage = Uuid::new_v4();
        let deal = deal(stage);
        let config = automation(stage, flow_id);
        seed(&r, &deal, &config).await;
        enter(&r, &deal).await;

        let live = r.crm.live_instance_for_deal(deal.id).await.unwrap();
        assert_eq!(r.scheduler.note_reply(&deal.contact_phone).await, 1);

        let after = r.crm.instance(live.id).await.unwrap();
        assert_eq!(after.status, AutomationStatus::Responded);
        assert!(r.crm.live_instance_for_deal(deal.id).await.is_none());

        // the timer never fires for a resolved automation
        let report = r
            .scheduler
            .tick(Utc::now() + Duration::hours(48))
            .await
            .unwrap();
        assert_eq!(report.timed_out, 0);
        assert_eq!(r.crm.deal(deal.id).await.unwrap().stage_id, stage);
    }

    #[tokio::test]
    async fn silence_past_the_wait_moves_the_deal_to_the_fallback() {
        let r = rig();
        let flow_id = publish_followup(&r).await;
        let stage = Uuid::new_v4();
        let deal = deal(stage);
        let mut config = automation(stage, flow_id);
        config.wait_hours = 1;
        let fallback_funnel = Uuid::new_v4();
        config.fallback_funnel_id = Some(fallback_funnel);
        let fallback_stage = config.fallback_stage_id.unwrap();
        seed(&r, &deal, &config).await;
        enter(&r, &deal).await;

        let live = r.crm.live_instance_for_deal(deal.id).await.unwrap();
        let report = r
            .scheduler
            .tick(Utc::now() + Duration::hours(2))
            .await
            .unwrap();

        assert_eq!(report.timed_out, 1);
        assert_eq!(
            r.crm.instance(live.id).await.unwrap().status,
            AutomationStatus::Moved
        );
        let moved = r.crm.deal(deal.id).await.unwrap();
        assert_eq!(moved.stage_id, fallback_stage);
        assert_eq!(moved.funnel_id, fallback_funnel);
        assert!(events(&r, deal.id).await.contains(&"deal_moved".to_string()));
    }

    #[tokio::test]
    async fn timeout_prefers_the_next_stage_over_the_fallback() {
        let r = rig();
        let flow_id = publish_followup(&r).await;
        let stage = Uuid::new_v4();
        let deal = deal(stage);
        let funnel_before = deal.funnel_id;
        let mut config = automation(stage, flow_id);
        config.wait_hours = 1;
        let next = Uuid::new_v4();
        config.next_stage_id = Some(next);
        seed(&r, &deal, &config).await;
        enter(&r, &deal).await;

        r.scheduler
            .tick(Utc::now() + Duration::hours(2))
            .await
            .unwrap();

        let moved = r.crm.deal(deal.id).await.unwrap();
        assert_eq!(moved.stage_id, next);
        assert_eq!(moved.funnel_id, funnel_before);
    }

    #[tokio::test]
    async fn the_destination_stage_automation_chains() {
        let r = rig();
        let flow_id = publish_followup(&r).await;
        let stage_a = Uuid::new_v4();
        let stage_b = Uuid::new_v4();
        let deal = deal(stage_a);

        let mut first = automation(stage_a, flow_id);
        first.wait_hours = 1;
        first.next_stage_id = Some(stage_b);
        let second = automation(stage_b, flow_id);
        seed(&r, &deal, &first).await;
        r.crm.put_automation(second).await;

        enter(&r, &deal).await;
        r.scheduler
            .tick(Utc::now() + Duration::hours(2))
            .await
            .unwrap();

        assert_eq!(r.crm.deal(deal.id).await.unwrap().stage_id, stage_b);
        let chained = r.crm.live_instance_for_deal(deal.id).await.unwrap();
        assert_eq!(chained.status, AutomationStatus::FlowSent);
        assert_eq!(chained.chain_depth, 1);
        assert_eq!(r.recorder.sent_count().await, 2);
    }

    #[tokio::test]
    async fn the_chain_depth_cap_fails_closed() {
        let r = rig();
        let flow_id = publish_followup(&r).await;
        let stage = Uuid::new_v4();
        let deal = deal(stage);
        let mut config = automation(stage, flow_id);
        config.wait_hours = 0;
        // moves back onto its own stage, an endless loop without the cap
        config.next_stage_id = Some(stage);
        config.fallback_stage_id = None;
        seed(&r, &deal, &config).await;
        enter(&r, &deal).await;

        for _ in 0..8 {
            r.scheduler
                .tick(Utc::now() + Duration::hours(1))
                .await
                .unwrap();
        }

        assert!(r.crm.live_instance_for_deal(deal.id).await.is_none());
        let logs = r.crm.logs_for_deal(deal.id).await;
        let moves = logs.iter().filter(|l| l.event == "deal_moved").count();
        assert_eq!(moves, MAX_CHAIN_DEPTH as usize);
        assert!(
            logs.iter()
                .any(|l| l.event == "automation_failed" && l.detail.contains("chain depth"))
        );
        assert_eq!(r.recorder.sent_count().await, MAX_CHAIN_DEPTH as usize);
    }

    #[tokio::test]
    async fn deferred_automations_fire_on_the_first_tick() {
        let r = rig();
        let flow_id = publish_followup(&r).await;
        let stage = Uuid::new_v4();
        let deal = deal(stage);
        let mut config = automation(stage, flow_id);
        config.execute_immediately = false;
        seed(&r, &deal, &config).await;
        enter(&r, &deal).await;

        let created = r.crm.live_instance_for_deal(deal.id).await.unwrap();
        assert_eq!(created.status, AutomationStatus::Pending);
        assert_eq!(r.recorder.sent_count().await, 0);

        let report = r.scheduler.tick(Utc::now()).await.unwrap();
        assert_eq!(report.fired, 1);
        assert_eq!(
            r.crm.instance(created.id).await.unwrap().status,
            AutomationStatus::FlowSent
        );
        assert_eq!(r.recorder.sent_count().await, 1);

        // the next sweep promotes it to waiting
        let report = r.scheduler.tick(Utc::now()).await.unwrap();
        assert_eq!(report.promoted, 1);
        assert_eq!(
            r.crm.instance(created.id).await.unwrap().status,
            AutomationStatus::Waiting
        );
    }

    #[tokio::test]
    async fn an_active_conversation_parks_the_automation_as_waiting() {
        let r = rig();
        let connection_id = Uuid::new_v4();
        let stage = Uuid::new_v4();
        let deal = deal(stage);

        // the contact is already answering a survey on this connection
        let survey = parking_flow(connection_id);
        let survey_id = survey.id;
        r.resolver.publish(survey).await.unwrap();
        r.engine
            .start_flow(
                survey_id,
                ConversationKey::direct(connection_id, &deal.contact_phone),
                &deal.contact_phone,
                &deal.contact_name,
            )
            .await
            .unwrap();
        let sent_before = r.recorder.sent_count().await;

        let flow = followup_flow(connection_id);
        let flow_id = flow.id;
        r.resolver.publish(flow).await.unwrap();
        let config = automation(stage, flow_id);
        seed(&r, &deal, &config).await;
        enter(&r, &deal).await;

        let instance = r.crm.live_instance_for_deal(deal.id).await.unwrap();
        assert_eq!(instance.status, AutomationStatus::Waiting);
        assert!(instance.flow_session_id.is_none());
        assert!(instance.wait_until.is_some());
        assert_eq!(r.recorder.sent_count().await, sent_before);
        assert!(events(&r, deal.id).await.contains(&"flow_skipped".to_string()));
    }

    #[tokio::test]
    async fn a_stage_without_automation_is_ignored() {
        let r = rig();
        let stage = Uuid::new_v4();
        let deal = deal(stage);
        r.crm.upsert_deal(deal.clone()).await;

        enter(&r, &deal).await;
        assert!(r.crm.live_instance_for_deal(deal.id).await.is_none());

        // an inactive automation counts as absent
        let flow_id = publish_followup(&r).await;
        let mut config = automation(stage, flow_id);
        config.is_active = false;
        r.crm.put_automation(config).await;

        enter(&r, &deal).await;
        assert!(r.crm.live_instance_for_deal(deal.id).await.is_none());
        assert!(events(&r, deal.id).await.is_empty());
        assert_eq!(r.recorder.sent_count().await, 0);
    }

    #[tokio::test]
    async fn a_missing_flow_fails_the_automation_closed() {
        let r = rig();
        let stage = Uuid::new_v4();
        let deal = deal(stage);
        let config = automation(stage, Uuid::new_v4());
        seed(&r, &deal, &config).await;

        enter(&r, &deal).await;

        assert!(r.crm.live_instance_for_deal(deal.id).await.is_none());
        let logs = r.crm.logs_for_deal(deal.id).await;
        assert!(
            logs.iter()
                .any(|l| l.event == "automation_failed" && l.detail.contains("flow unavailable"))
        );
        assert_eq!(r.crm.deal(deal.id).await.unwrap().stage_id, stage);
        assert_eq!(r.recorder.sent_count().await, 0);
    }

    #[tokio::test]
    async fn a_wait_with_no_destination_fails_the_automation() {
        let r = rig();
        let flow_id = publish_followup(&r).await;
        let stage = Uuid::new_v4();
        let deal = deal(stage);
        let mut config = automation(stage, flow_id);
        config.wait_hours = 0;
        config.next_stage_id = None;
        config.fallback_stage_id = None;
        seed(&r, &deal, &config).await;
        enter(&r, &deal).await;

        let live = r.crm.live_instance_for_deal(deal.id).await.unwrap();
        let report = r
            .scheduler
            .tick(Utc::now() + Duration::hours(1))
            .await
            .unwrap();

        assert_eq!(report.timed_out, 1);
        assert_eq!(
            r.crm.instance(live.id).await.unwrap().status,
            AutomationStatus::Failed
        );
        assert_eq!(r.crm.deal(deal.id).await.unwrap().stage_id, stage);
    }
}
