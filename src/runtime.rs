//! Worker-pool composition. One `Runtime` owns the engine, the campaign
//! dispatcher, the stage automation scheduler and the periodic sweeps, routes
//! inbound webhook events to the right flow session, and tears everything
//! down on shutdown.

use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use gateway_client::message::InboundEvent;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::campaign::dispatcher::CampaignDispatcher;
use crate::crm::scheduler::StageAutomationScheduler;
use crate::error::EngineError;
use crate::flow::engine::{FlowEngine, StepOutcome};
use crate::flow::resolver::{FlowResolver, FlowStore};
use crate::flow::session::{ConversationKey, SessionStore};
use crate::flow::trigger;
use crate::logger;

/// A periodic background task with an explicit lifecycle. Owns its
/// CancellationToken and join handle; dropping the Ticker without `stop`
/// leaves the task running, so the runtime keeps them until shutdown.
pub struct Ticker {
    name: &'static str,
    shutdown: CancellationToken,
    worker: JoinHandle<()>,
}

impl Ticker {
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut work: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let worker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => work().await,
                }
            }
            debug!(ticker = name, "ticker stopped");
        });
        Self {
            name,
            shutdown,
            worker,
        }
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        if let Err(err) = self.worker.await {
            warn!(ticker = self.name, error = %err, "ticker task aborted");
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Active sessions idle longer than this are cancelled by the sweep.
    pub session_max_idle: chrono::Duration,
    /// How often the stage automation scheduler scans its timers.
    pub crm_tick_period: Duration,
    /// How often idle sessions and stale conversation locks are swept.
    pub sweep_period: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            session_max_idle: chrono::Duration::hours(24),
            crm_tick_period: Duration::from_secs(60),
            sweep_period: Duration::from_secs(3600),
        }
    }
}

/// Composition root of the worker process.
pub struct Runtime {
    engine: Arc<FlowEngine>,
    sessions: SessionStore,
    flows: FlowStore,
    dispatcher: Arc<CampaignDispatcher>,
    scheduler: Arc<StageAutomationScheduler>,
    config: RuntimeConfig,
    /// Per-conversation writer locks. All session reads and writes for one
    /// conversation happen under its lock, so advances never interleave.
    conversation_locks: DashMap<ConversationKey, Arc<Mutex<()>>>,
    tickers: StdMutex<Vec<Ticker>>,
}

impl Runtime {
    pub fn new(
        engine: Arc<FlowEngine>,
        resolver: Arc<FlowResolver>,
        dispatcher: Arc<CampaignDispatcher>,
        scheduler: Arc<StageAutomationScheduler>,
        config: RuntimeConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: engine.sessions(),
            flows: resolver.store(),
            engine,
            dispatcher,
            scheduler,
            config,
            conversation_locks: DashMap::new(),
            tickers: StdMutex::new(Vec::new()),
        })
    }

    pub fn dispatcher(&self) -> Arc<CampaignDispatcher> {
        self.dispatcher.clone()
    }

    pub fn scheduler(&self) -> Arc<StageAutomationScheduler> {
        self.scheduler.clone()
    }

    pub fn engine(&self) -> Arc<FlowEngine> {
        self.engine.clone()
    }

    /// Conversations currently holding a writer lock entry.
    pub fn tracked_conversations(&self) -> usize {
        self.conversation_locks.len()
    }

    /// Spawns the periodic workers. Calling it again while they run is a
    /// no-op.
    pub fn start(self: &Arc<Self>) {
        let mut tickers = self
            .tickers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !tickers.is_empty() {
            return;
        }

        let me = self.clone();
        tickers.push(Ticker::spawn(
            "stage-automations",
            self.config.crm_tick_period,
            move || {
                let me = me.clone();
                async move {
                    if let Err(err) = me.scheduler.tick(Utc::now()).await {
                        warn!(error = %err, "stage automation sweep failed");
                    }
                }
            },
        ));

        let me = self.clone();
        tickers.push(Ticker::spawn(
            "session-sweeper",
            self.config.sweep_period,
            move || {
                let me = me.clone();
                async move { me.sweep(Utc::now()).await }
            },
        ));

        info!("runtime started");
    }

    /// Stops the tickers, then the campaign workers. In-flight sends finish
    /// before their worker exits.
    pub async fn shutdown(&self) {
        let drained: Vec<Ticker> = {
            let mut tickers = self
                .tickers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            tickers.drain(..).collect()
        };
        for ticker in drained {
            ticker.stop().await;
        }
        self.dispatcher.shutdown().await;
        info!("runtime stopped");
    }

    /// Routes one webhook event. An active session consumes the reply;
    /// otherwise the connection's triggers are consulted and the best match
    /// starts a flow. Unclaimed, unmatched messages are dropped.
    pub async fn handle_inbound(
        &self,
        event: InboundEvent,
    ) -> Result<Option<StepOutcome>, EngineError> {
        let conversation = ConversationKey::new(event.connection_id, event.remote_jid.clone());
        let lock = self
            .conversation_locks
            .entry(conversation.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let text = event.text_body().unwrap_or_default().to_string();
        let phone = event.contact_phone().to_string();

        let resolved = self.scheduler.note_reply(&phone).await;
        if resolved > 0 {
            debug!(contact = %phone, resolved, "reply resolved stage automations");
        }

        if let Some(session) = self.sessions.active_for_conversation(&conversation).await {
            return self.engine.advance(session, &text).await.map(Some);
        }

        let flows = self.flows.active_for_connection(event.connection_id).await;
        let Some(flow) = trigger::best_match(&flows, &text) else {
            debug!(conversation = %conversation, "no trigger matched, message dropped");
            return Ok(None);
        };

        // webhook events carry no display name, the phone stands in
        match self
            .engine
            .start_flow(flow.id, conversation, &phone, &phone)
            .await
        {
            Ok(outcome) => Ok(Some(outcome)),
            Err(EngineError::Concurrency(detail)) => {
                debug!(%detail, "conversation claimed elsewhere, start discarded");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Cancels sessions idle past the configured window and drops writer
    /// locks nobody holds.
    pub async fn sweep(&self, now: DateTime<Utc>) {
        let cutoff = now - self.config.session_max_idle;
        let expired = self.sessions.expire_idle(cutoff).await;
        for session in &expired {
            logger::audit(
                &session.id.to_string(),
                "session_expired",
                &format!("idle since {}", session.last_interaction_at),
            );
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "cancelled idle sessions");
        }

        self.conversation_locks
            .retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}
