use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use gateway_client::client::Gateway;
use gateway_client::message::OutboundMessage;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::campaign::{CampaignStatus, CampaignStore};
use crate::error::EngineError;
use crate::flow::engine::send_with_retry;
use crate::logger::audit;
use crate::template;

/// How one dispatch cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Every row reached a terminal status and the campaign completed.
    Completed,
    /// The campaign was complete before the cycle started.
    AlreadyComplete,
    /// The campaign is not in `running` status.
    NotRunning,
    Paused,
    Cancelled,
    /// Outside the schedule window. Pending rows were rescheduled for
    /// `reopens_at`, or the campaign failed when the window never reopens.
    WindowClosed { reopens_at: Option<DateTime<Utc>> },
    /// Process shutdown requested.
    Interrupted,
    /// The batch finished but rows remained pending; a follow-up cycle
    /// picks them up.
    Drained,
}

/// Paced bulk sender. One worker task per running campaign; within a
/// campaign, recipients go out strictly in the order fixed at cycle start.
pub struct CampaignDispatcher {
    store: CampaignStore,
    gateway: Gateway,
    running: DashMap<Uuid, JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl CampaignDispatcher {
    pub fn new(store: CampaignStore, gateway: Gateway) -> Arc<Self> {
        Arc::new(Self {
            store,
            gateway,
            running: DashMap::new(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn store(&self) -> CampaignStore {
        self.store.clone()
    }

    pub fn active_workers(&self) -> usize {
        self.running
            .iter()
            .filter(|entry| !entry.value().is_finished())
            .count()
    }

    /// Moves a pending or paused campaign to `running` and spawns its
    /// worker. Starting a terminal campaign or one whose worker is still
    /// live is a no-op.
    pub async fn start(self: &Arc<Self>, campaign_id: Uuid) -> Result<(), EngineError> {
        let campaign = self
            .store
            .get(campaign_id)
            .await
            .ok_or(EngineError::CampaignNotFound(campaign_id))?;
        match campaign.status {
            CampaignStatus::Pending | CampaignStatus::Paused => {}
            CampaignStatus::Running => {
                if let Some(worker) = self.running.get(&campaign_id) {
                    if !worker.is_finished() {
                        return Ok(());
                    }
                }
                // status says running but no live worker, e.g. after restart
            }
            terminal => {
                debug!(campaign = %campaign_id, status = ?terminal, "start ignored");
                return Ok(());
            }
        }
        self.store
            .set_status(campaign_id, CampaignStatus::Running)
            .await?;
        // concurrent starts race for the slot; only the winner spawns
        if self.spawn_worker(campaign_id) {
            audit(&campaign_id.to_string(), "campaign_started", &campaign.name);
        }
        Ok(())
    }

    pub async fn pause(&self, campaign_id: Uuid) -> Result<(), EngineError> {
        match self.store.status(campaign_id).await {
            None => Err(EngineError::CampaignNotFound(campaign_id)),
            Some(CampaignStatus::Running) => {
                self.store
                    .set_status(campaign_id, CampaignStatus::Paused)
                    .await?;
                audit(&campaign_id.to_string(), "campaign_paused", "");
                Ok(())
            }
            Some(CampaignStatus::Paused) => Ok(()),
            Some(other) => Err(EngineError::Configuration(format!(
                "campaign {campaign_id} is {other:?}, cannot pause"
            ))),
        }
    }

    pub async fn resume(self: &Arc<Self>, campaign_id: Uuid) -> Result<(), EngineError> {
        match self.store.status(campaign_id).await {
            None => Err(EngineError::CampaignNotFound(campaign_id)),
            Some(CampaignStatus::Paused) => {
                audit(&campaign_id.to_string(), "campaign_resumed", "");
                self.start(campaign_id).await
            }
            Some(CampaignStatus::Running) => Ok(()),
            Some(other) => Err(EngineError::Configuration(format!(
                "campaign {campaign_id} is {other:?}, cannot resume"
            ))),
        }
    }

    /// Cancels a campaign; its worker exits at the next pacing checkpoint.
    /// Cancelling a terminal campaign is a no-op.
    pub async fn cancel(&self, campaign_id: Uuid) -> Result<(), EngineError> {
        match self.store.status(campaign_id).await {
            None => Err(EngineError::CampaignNotFound(campaign_id)),
            Some(status) if status.is_terminal() => Ok(()),
            Some(_) => {
                self.store
                    .set_status(campaign_id, CampaignStatus::Cancelled)
                    .await?;
                audit(&campaign_id.to_string(), "campaign_cancelled", "");
                Ok(())
            }
        }
    }

    /// Stops every worker and waits for them to finish their in-flight row.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let ids: Vec<Uuid> = self.running.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, worker)) = self.running.remove(&id) {
                if let Err(e) = worker.await {
                    debug!(campaign = %id, error = %e, "worker join failed");
                }
            }
        }
    }

    /// Claims the campaign's worker slot and spawns its task. At most one
    /// live worker per campaign: a finished handle in the slot is replaced,
    /// a live one keeps it and the claim returns false.
    fn spawn_worker(self: &Arc<Self>, campaign_id: Uuid) -> bool {
        match self.running.entry(campaign_id) {
            Entry::Occupied(mut slot) => {
                if !slot.get().is_finished() {
                    return false;
                }
                slot.insert(self.worker_task(campaign_id));
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(self.worker_task(campaign_id));
                true
            }
        }
    }

    fn worker_task(self: &Arc<Self>, campaign_id: Uuid) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match dispatcher.run_cycle(campaign_id).await {
                    Ok(CycleOutcome::WindowClosed {
                        reopens_at: Some(at),
                    }) => {
                        let wait = (at - Utc::now()).to_std().unwrap_or_default();
                        tokio::select! {
                            _ = dispatcher.shutdown.cancelled() => break,
                            _ = sleep(wait) => {}
                        }
                    }
                    Ok(CycleOutcome::Drained) => {}
                    Ok(outcome) => {
                        info!(campaign = %campaign_id, ?outcome, "campaign worker finished");
                        break;
                    }
                    Err(e) => {
                        error!(campaign = %campaign_id, error = %e, "campaign cycle failed");
                        if let Err(e) = dispatcher
                            .store
                            .set_status(campaign_id, CampaignStatus::Failed)
                            .await
                        {
                            error!(campaign = %campaign_id, error = %e, "could not mark campaign failed");
                        }
                        break;
                    }
                }
            }
            // the finished handle stays in the slot until the next claim
        })
    }

    /// One dispatch cycle: snapshot the pending rows, fix their order, then
    /// send with two-tier pacing. Status changes and shutdown are observed
    /// at the checkpoint between sends, never mid-send.
    pub async fn run_cycle(&self, campaign_id: Uuid) -> Result<CycleOutcome, EngineError> {
        let campaign = self
            .store
            .get(campaign_id)
            .await
            .ok_or(EngineError::CampaignNotFound(campaign_id))?;
        match campaign.status {
            CampaignStatus::Running => {}
            CampaignStatus::Completed => return Ok(CycleOutcome::AlreadyComplete),
            _ => return Ok(CycleOutcome::NotRunning),
        }

        let mut batch = self.store.pending_messages(campaign_id).await;
        if batch.is_empty() {
            return self.complete(campaign_id).await;
        }
        if campaign.random_order {
            let mut order_rng = StdRng::seed_from_u64(campaign.effective_seed());
            batch.shuffle(&mut order_rng);
        }

        let mut delay_rng = StdRng::from_os_rng();
        let mut sent_since_pause = 0u32;
        let mut first = true;

        for row in batch {
            if !first {
                let pacing = &campaign.pacing;
                let gap = if pacing.pause_after_messages > 0
                    && sent_since_pause >= pacing.pause_after_messages
                {
                    sent_since_pause = 0;
                    Duration::from_secs(pacing.pause_duration_secs)
                } else {
                    let low = pacing.min_delay_secs;
                    let high = pacing.max_delay_secs.max(low);
                    Duration::from_secs(delay_rng.random_range(low..=high))
                };
                tokio::select! {
                    _ = self.shutdown.cancelled() => return Ok(CycleOutcome::Interrupted),
                    _ = sleep(gap) => {}
                }
            }
            first = false;

            match self.store.status(campaign_id).await {
                Some(CampaignStatus::Running) => {}
                Some(CampaignStatus::Paused) => {
                    info!(campaign = %campaign_id, "pause observed, worker exiting");
                    return Ok(CycleOutcome::Paused);
                }
                Some(CampaignStatus::Cancelled) => {
                    info!(campaign = %campaign_id, "cancel observed, worker exiting");
                    return Ok(CycleOutcome::Cancelled);
                }
                _ => return Ok(CycleOutcome::NotRunning),
            }
            if self.shutdown.is_cancelled() {
                return Ok(CycleOutcome::Interrupted);
            }

            let now = Utc::now();
            if !campaign.window.contains(now) {
                return match campaign.window.next_opening(now) {
                    Some(at) => {
                        let moved = self.store.reschedule_pending(campaign_id, at).await;
                        info!(
                            campaign = %campaign_id,
                            moved,
                            reopens = %at,
                            "outside send window, rows rescheduled"
                        );
                        Ok(CycleOutcome::WindowClosed { reopens_at: Some(at) })
                    }
                    None => {
                        warn!(campaign = %campaign_id, "send window expired with rows pending");
                        self.store
                            .set_status(campaign_id, CampaignStatus::Failed)
                            .await?;
                        audit(
                            &campaign_id.to_string(),
                            "campaign_failed",
                            "send window expired",
                        );
                        Ok(CycleOutcome::WindowClosed { reopens_at: None })
                    }
                };
            }

            let data = template::campaign_context(
                &row.recipient_name,
                &row.recipient_phone,
                &campaign.name,
            );
            let text = match template::render(&campaign.message_template, &data) {
                Ok(text) => text,
                Err(e) => {
                    self.store.mark_failed(row.id, &e.to_string()).await?;
                    continue;
                }
            };
            let message = match &campaign.media {
                Some(media) => {
                    let mut media = media.clone();
                    if media.caption.is_none() && !text.is_empty() {
                        media.caption = Some(text);
                    }
                    OutboundMessage::media(
                        campaign.connection_id,
                        row.recipient_phone.clone(),
                        media,
                    )
                }
                None => {
                    OutboundMessage::text(campaign.connection_id, row.recipient_phone.clone(), text)
                }
            };

            match send_with_retry(self.gateway.as_ref(), &message).await {
                Ok(receipt) => {
                    self.store.mark_sent(row.id, &receipt).await?;
                    sent_since_pause += 1;
                }
                Err(e) => {
                    debug!(
                        campaign = %campaign_id,
                        to = %row.recipient_phone,
                        error = %e,
                        "campaign send failed, moving on"
                    );
                    self.store.mark_failed(row.id, &e.to_string()).await?;
                }
            }
        }

        if self.store.pending_messages(campaign_id).await.is_empty() {
            return self.complete(campaign_id).await;
        }
        Ok(CycleOutcome::Drained)
    }

    async fn complete(&self, campaign_id: Uuid) -> Result<CycleOutcome, EngineError> {
        self.store
            .set_status(campaign_id, CampaignStatus::Completed)
            .await?;
        audit(&campaign_id.to_string(), "campaign_completed", "");
        Ok(CycleOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign::{
        Campaign, CampaignStoreType, InMemoryCampaignStore, MessageStatus, Pacing, Recipient,
        ScheduleWindow,
    };
    use chrono::NaiveDate;
    use gateway_client::test_util::{FlakyGateway, RecordingGateway};

    fn pacing() -> Pacing {
        Pacing {
            min_delay_secs: 5,
            max_delay_secs: 30,
            pause_after_messages: 2,
            pause_duration_secs: 300,
        }
    }

    fn recipients(n: usize) -> Vec<Recipient> {
        (0..n)
            .map(|i| Recipient::new(format!("55119000000{i}"), format!("Contato {i}")))
            .collect()
    }

    async fn seeded(
        store: &Arc<InMemoryCampaignStore>,
        campaign: Campaign,
        recipients: &[Recipient],
    ) -> Uuid {
        let id = campaign.id;
        store.create(campaign, recipients).await.unwrap();
        store
            .set_status(id, CampaignStatus::Running)
            .await
            .unwrap();
        id
    }

    #[tokio::test(start_paused = true)]
    async fn pacing_gaps_stay_inside_the_configured_bounds() {
        let store = InMemoryCampaignStore::new();
        let recorder = RecordingGateway::new();
        let dispatcher = CampaignDispatcher::new(store.clone(), Arc::new(recorder.clone()));

        let campaign = Campaign::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "promo",
            "Oi {{contact.name}}!",
        )
        .with_pacing(pacing());
        let id = seeded(&store, campaign, &recipients(5)).await;

        let outcome = dispatcher.run_cycle(id).await.unwrap();
        assert_eq!(outcome, CycleOutcome::Completed);

        let at = recorder.sent_at().await;
        assert_eq!(at.len(), 5);
        let gaps: Vec<Duration> = at.windows(2).map(|w| w[1] - w[0]).collect();

        // after every 2 successful sends the gap is the cool-down, exactly
        assert_eq!(gaps[1], Duration::from_secs(300));
        assert_eq!(gaps[3], Duration::from_secs(300));
        for gap in [gaps[0], gaps[2]] {
            assert!(gap >= Duration::from_secs(5), "gap {gap:?} under minimum");
            assert!(gap <= Duration::from_secs(30), "gap {gap:?} over maximum");
        }

        let campaign = store.get(id).await.unwrap();
        assert_eq!(campaign.status, CampaignStatus::Completed);
        assert_eq!(campaign.sent_count, 5);
        assert_eq!(campaign.failed_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn send_failures_do_not_halt_the_cycle() {
        let store = InMemoryCampaignStore::new();
        let flaky = FlakyGateway::rejecting(1);
        let recorder = flaky.recorder();
        let dispatcher = CampaignDispatcher::new(store.clone(), Arc::new(flaky));

        let campaign = Campaign::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "promo",
            "Oi {{contact.name}}!",
        )
        .with_pacing(pacing());
        let id = seeded(&store, campaign, &recipients(3)).await;

        let outcome = dispatcher.run_cycle(id).await.unwrap();
        assert_eq!(outcome, CycleOutcome::Completed);
        assert_eq!(recorder.sent_count().await, 2);

        let campaign = store.get(id).await.unwrap();
        assert_eq!(campaign.sent_count, 2);
        assert_eq!(campaign.failed_count, 1);

        let rows = store.messages(id).await;
        let non_pending = rows
            .iter()
            .filter(|r| r.status != MessageStatus::Pending)
            .count() as u32;
        assert_eq!(campaign.sent_count + campaign.failed_count, non_pending);
        let failed = rows
            .iter()
            .find(|r| r.status == MessageStatus::Failed)
            .unwrap();
        assert!(failed.error_message.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn random_order_shuffles_once_per_cycle_with_the_seed() {
        let store = InMemoryCampaignStore::new();
        let recorder = RecordingGateway::new();
        let dispatcher = CampaignDispatcher::new(store.clone(), Arc::new(recorder.clone()));

        let campaign = Campaign::new(Uuid::new_v4(), Uuid::new_v4(), "promo", "Oi!")
            .with_pacing(pacing())
            .with_random_order(Some(7));
        let id = seeded(&store, campaign, &recipients(4)).await;

        let mut expected = store.pending_messages(id).await;
        expected.shuffle(&mut StdRng::seed_from_u64(7));
        let expected_order: Vec<String> =
            expected.iter().map(|r| r.recipient_phone.clone()).collect();

        dispatcher.run_cycle(id).await.unwrap();

        let sent_order: Vec<String> = recorder
            .sent()
            .await
            .iter()
            .map(|m| m.to.clone())
            .collect();
        assert_eq!(sent_order, expected_order);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_is_observed_at_the_next_checkpoint_and_resume_finishes() {
        let store = InMemoryCampaignStore::new();
        let recorder = RecordingGateway::new();
        let dispatcher = CampaignDispatcher::new(store.clone(), Arc::new(recorder.clone()));

        let campaign = Campaign::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "promo",
            "Oi {{contact.name}}!",
        )
        .with_pacing(pacing());
        let id = seeded(&store, campaign, &recipients(3)).await;

        let cycle = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.run_cycle(id).await })
        };

        // first send is immediate; pause lands while the worker sleeps the
        // first gap (>= 5s), so it is seen at the next checkpoint
        tokio::time::sleep(Duration::from_secs(1)).await;
        dispatcher.pause(id).await.unwrap();

        let outcome = cycle.await.unwrap().unwrap();
        assert_eq!(outcome, CycleOutcome::Paused);
        assert_eq!(recorder.sent_count().await, 1);
        assert_eq!(store.pending_messages(id).await.len(), 2);

        // resuming processes only the rows still pending
        store.set_status(id, CampaignStatus::Running).await.unwrap();
        let outcome = dispatcher.run_cycle(id).await.unwrap();
        assert_eq!(outcome, CycleOutcome::Completed);

        let sent = recorder.sent().await;
        assert_eq!(sent.len(), 3);
        let mut phones: Vec<String> = sent.iter().map(|m| m.to.clone()).collect();
        phones.sort_unstable();
        phones.dedup();
        assert_eq!(phones.len(), 3, "no recipient was sent twice");
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_observed_at_the_next_checkpoint() {
        let store = InMemoryCampaignStore::new();
        let recorder = RecordingGateway::new();
        let dispatcher = CampaignDispatcher::new(store.clone(), Arc::new(recorder.clone()));

        let campaign = Campaign::new(Uuid::new_v4(), Uuid::new_v4(), "promo", "Oi!")
            .with_pacing(pacing());
        let id = seeded(&store, campaign, &recipients(3)).await;

        let cycle = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.run_cycle(id).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        dispatcher.cancel(id).await.unwrap();

        let outcome = cycle.await.unwrap().unwrap();
        assert_eq!(outcome, CycleOutcome::Cancelled);
        assert_eq!(recorder.sent_count().await, 1);
        assert_eq!(
            store.status(id).await.unwrap(),
            CampaignStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn window_in_the_future_reschedules_rows() {
        let store = InMemoryCampaignStore::new();
        let recorder = RecordingGateway::new();
        let dispatcher = CampaignDispatcher::new(store.clone(), Arc::new(recorder.clone()));

        let window = ScheduleWindow {
            start_date: Some(NaiveDate::from_ymd_opt(2999, 1, 1).unwrap()),
            end_date: Some(NaiveDate::from_ymd_opt(2999, 1, 2).unwrap()),
            start_time: None,
            end_time: None,
        };
        let campaign = Campaign::new(Uuid::new_v4(), Uuid::new_v4(), "promo", "Oi!")
            .with_window(window);
        let id = seeded(&store, campaign, &recipients(2)).await;

        let outcome = dispatcher.run_cycle(id).await.unwrap();
        let CycleOutcome::WindowClosed {
            reopens_at: Some(at),
        } = outcome
        else {
            panic!("expected a rescheduling outcome, got {outcome:?}");
        };

        assert_eq!(recorder.sent_count().await, 0);
        assert_eq!(store.status(id).await.unwrap(), CampaignStatus::Running);
        for row in store.messages(id).await {
            assert_eq!(row.status, MessageStatus::Pending);
            assert_eq!(row.scheduled_at, Some(at));
        }
    }

    #[tokio::test]
    async fn expired_window_fails_the_campaign_without_touching_rows() {
        let store = InMemoryCampaignStore::new();
        let recorder = RecordingGateway::new();
        let dispatcher = CampaignDispatcher::new(store.clone(), Arc::new(recorder.clone()));

        let window = ScheduleWindow {
            start_date: None,
            end_date: Some(NaiveDate::from_ymd_opt(2000, 1, 1).unwrap()),
            start_time: None,
            end_time: None,
        };
        let campaign = Campaign::new(Uuid::new_v4(), Uuid::new_v4(), "promo", "Oi!")
            .with_window(window);
        let id = seeded(&store, campaign, &recipients(2)).await;

        let outcome = dispatcher.run_cycle(id).await.unwrap();
        assert_eq!(outcome, CycleOutcome::WindowClosed { reopens_at: None });
        assert_eq!(store.status(id).await.unwrap(), CampaignStatus::Failed);
        for row in store.messages(id).await {
            assert_eq!(row.status, MessageStatus::Pending);
        }
    }

    #[tokio::test]
    async fn completed_campaign_cycles_are_no_ops() {
        let store = InMemoryCampaignStore::new();
        let recorder = RecordingGateway::new();
        let dispatcher = CampaignDispatcher::new(store.clone(), Arc::new(recorder.clone()));

        let campaign = Campaign::new(Uuid::new_v4(), Uuid::new_v4(), "promo", "Oi!");
        let id = seeded(&store, campaign, &[]).await;

        assert_eq!(
            dispatcher.run_cycle(id).await.unwrap(),
            CycleOutcome::Completed
        );
        assert_eq!(
            dispatcher.run_cycle(id).await.unwrap(),
            CycleOutcome::AlreadyComplete
        );
        assert_eq!(recorder.sent_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn start_spawns_a_worker_that_runs_to_completion() {
        let store = InMemoryCampaignStore::new();
        let recorder = RecordingGateway::new();
        let dispatcher = CampaignDispatcher::new(store.clone(), Arc::new(recorder.clone()));

        let campaign = Campaign::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "promo",
            "Oi {{contact.name}}!",
        )
        .with_pacing(pacing());
        let id = campaign.id;
        store.create(campaign, &recipients(3)).await.unwrap();

        dispatcher.start(id).await.unwrap();
        assert_eq!(dispatcher.active_workers(), 1);

        tokio::time::timeout(Duration::from_secs(3600), async {
            while store.status(id).await != Some(CampaignStatus::Completed) {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("campaign should complete");

        assert_eq!(recorder.sent_count().await, 3);
        // starting again is a no-op
        dispatcher.start(id).await.unwrap();
        assert_eq!(store.status(id).await.unwrap(), CampaignStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_starts_elect_a_single_worker() {
        let store = InMemoryCampaignStore::new();
        let recorder = RecordingGateway::new();
        let dispatcher = CampaignDispatcher::new(store.clone(), Arc::new(recorder.clone()));

        let campaign = Campaign::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "promo",
            "Oi {{contact.name}}!",
        )
        .with_pacing(pacing());
        let id = campaign.id;
        store.create(campaign, &recipients(2)).await.unwrap();

        let (a, b) = tokio::join!(dispatcher.start(id), dispatcher.start(id));
        a.unwrap();
        b.unwrap();
        assert_eq!(dispatcher.active_workers(), 1);

        tokio::time::timeout(Duration::from_secs(3600), async {
            while store.status(id).await != Some(CampaignStatus::Completed) {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("campaign should complete");

        let sent = recorder.sent().await;
        assert_eq!(sent.len(), 2);
        let mut phones: Vec<String> = sent.iter().map(|m| m.to.clone()).collect();
        phones.sort_unstable();
        phones.dedup();
        assert_eq!(phones.len(), 2, "no recipient was sent twice");

        let campaign = store.get(id).await.unwrap();
        assert_eq!(campaign.sent_count, 2);
        assert_eq!(campaign.failed_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn resume_while_the_worker_sleeps_keeps_a_single_worker() {
        let store = InMemoryCampaignStore::new();
        let recorder = RecordingGateway::new();
        let dispatcher = CampaignDispatcher::new(store.clone(), Arc::new(recorder.clone()));

        let campaign = Campaign::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "promo",
            "Oi {{contact.name}}!",
        )
        .with_pacing(pacing());
        let id = campaign.id;
        store.create(campaign, &recipients(3)).await.unwrap();

        dispatcher.start(id).await.unwrap();

        // first send is immediate; the worker is now sleeping its first gap
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(recorder.sent_count().await, 1);

        // pause and resume land before the worker's next checkpoint; the
        // sleeping worker keeps its slot and no second one spawns
        dispatcher.pause(id).await.unwrap();
        dispatcher.resume(id).await.unwrap();
        assert_eq!(dispatcher.active_workers(), 1);

        tokio::time::timeout(Duration::from_secs(3600), async {
            while store.status(id).await != Some(CampaignStatus::Completed) {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("campaign should complete");

        let sent = recorder.sent().await;
        assert_eq!(sent.len(), 3);
        let mut phones: Vec<String> = sent.iter().map(|m| m.to.clone()).collect();
        phones.sort_unstable();
        phones.dedup();
        assert_eq!(phones.len(), 3, "no recipient was sent twice");

        let campaign = store.get(id).await.unwrap();
        assert_eq!(campaign.sent_count, 3);
        assert_eq!(campaign.failed_count, 0);
    }
}
