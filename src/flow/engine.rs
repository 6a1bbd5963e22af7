use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gateway_client::client::{Gateway, GatewayClient};
use gateway_client::message::{DeliveryReceipt, OutboundMessage};
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::flow::definition::{ActionKind, ConditionRule, ConditionOperator, MenuNode, NodeKind};
use crate::flow::resolver::{CompiledFlow, FlowResolver};
use crate::flow::session::{ConversationKey, FlowSession, SessionStatus, SessionStore};
use crate::llm::SharedLlm;
use crate::logger::audit;
use crate::template;

/// Nodes executed in a single advance before the engine declares the graph
/// runaway. Sanctioned cycles (ai free chat, menu re-present) rest on a
/// waiting node long before this.
const MAX_STEPS_PER_ADVANCE: usize = 50;

/// Gateway delivery attempts per message, with doubling backoff in between.
const SEND_ATTEMPTS: usize = 3;
const SEND_BACKOFF: Duration = Duration::from_secs(1);

/// Side effects `action` and `transfer` nodes request from the surrounding
/// system. They run before the session persists, so under crash-replay they
/// execute at least once; implementations must stay idempotent.
#[async_trait]
pub trait ConversationHooks: Send + Sync {
    async fn add_tag(&self, session: &FlowSession, tag: &str) -> Result<(), EngineError>;
    async fn assign_queue(&self, session: &FlowSession, queue_id: Uuid) -> Result<(), EngineError>;
    async fn handoff(&self, session: &FlowSession, queue_id: Option<Uuid>)
    -> Result<(), EngineError>;
}

pub type SharedHooks = Arc<dyn ConversationHooks>;

/// Hooks for deployments without CRM wiring.
#[derive(Debug, Default)]
pub struct NoopHooks;

#[async_trait]
impl ConversationHooks for NoopHooks {
    async fn add_tag(&self, session: &FlowSession, tag: &str) -> Result<(), EngineError> {
        debug!(session = %session.id, tag, "add_tag ignored, no hooks wired");
        Ok(())
    }

    async fn assign_queue(&self, session: &FlowSession, queue_id: Uuid) -> Result<(), EngineError> {
        debug!(session = %session.id, %queue_id, "assign_queue ignored, no hooks wired");
        Ok(())
    }

    async fn handoff(
        &self,
        session: &FlowSession,
        queue_id: Option<Uuid>,
    ) -> Result<(), EngineError> {
        debug!(session = %session.id, ?queue_id, "handoff ignored, no hooks wired");
        Ok(())
    }
}

/// What one advance did: the messages that went out, in order, and where
/// the session ended up.
#[derive(Debug)]
pub struct StepOutcome {
    pub session_id: Uuid,
    pub sent: Vec<OutboundMessage>,
    pub status: SessionStatus,
}

enum Entry {
    /// Begin executing at this node (start path, crash recovery).
    Node(String),
    /// Apply the inbound text to the waiting node first.
    Input,
}

pub struct FlowEngine {
    resolver: Arc<FlowResolver>,
    sessions: SessionStore,
    gateway: Gateway,
    llm: SharedLlm,
    hooks: SharedHooks,
}

impl FlowEngine {
    pub fn new(
        resolver: Arc<FlowResolver>,
        sessions: SessionStore,
        gateway: Gateway,
        llm: SharedLlm,
        hooks: SharedHooks,
    ) -> Arc<Self> {
        Arc::new(Self {
            resolver,
            sessions,
            gateway,
            llm,
            hooks,
        })
    }

    pub fn sessions(&self) -> SessionStore {
        self.sessions.clone()
    }

    /// Start `flow_id` for a conversation. Fails with
    /// [`EngineError::Concurrency`] when the conversation already has an
    /// active session; the caller discards its attempt in that case.
    pub async fn start_flow(
        &self,
        flow_id: Uuid,
        conversation: ConversationKey,
        contact_phone: &str,
        contact_name: &str,
    ) -> Result<StepOutcome, EngineError> {
        let compiled = self.resolver.resolve(flow_id).await?;
        let start = compiled.start_node_id()?.to_string();
        let session = FlowSession::new(
            flow_id,
            compiled.definition().org_id,
            conversation,
            contact_phone,
            contact_name,
            &start,
        );
        self.sessions.create_active(session.clone()).await?;
        audit(
            &session.id.to_string(),
            "session_started",
            &format!("flow {flow_id}"),
        );
        self.step(&compiled, session, Entry::Node(start), None).await
    }

    /// Drive a session with one inbound message. Advancing a terminal
    /// session is a strict no-op: nothing is sent, nothing is written.
    pub async fn advance(
        &self,
        session: FlowSession,
        input: &str,
    ) -> Result<StepOutcome, EngineError> {
        if !session.is_active {
            return Ok(StepOutcome {
                session_id: session.id,
                sent: Vec::new(),
                status: session.status,
            });
        }
        let compiled = match self.resolver.resolve(session.flow_id).await {
            Ok(compiled) => compiled,
            Err(e @ (EngineError::FlowNotFound(_) | EngineError::Configuration(_))) => {
                return self.fail_and_handoff(session, e).await;
            }
            Err(e) => return Err(e),
        };
        self.step(&compiled, session, Entry::Input, Some(input)).await
    }

    /// One guarded step: walk the graph, send everything queued in order,
    /// only then persist. A crash between send and persist re-runs the node
    /// on the next identical event, which is the documented at-least-once
    /// trade-off.
    async fn step(
        &self,
        compiled: &CompiledFlow,
        session: FlowSession,
        entry: Entry,
        input: Option<&str>,
    ) -> Result<StepOutcome, EngineError> {
        let original = session.clone();
        let mut session = session;

        match self.walk(compiled, &mut session, entry, input).await {
            Ok(queued) => {
                let mut sent = Vec::new();
                for message in queued {
                    if let Err(e) = self.send_with_retry(&message).await {
                        warn!(session = %original.id, error = %e, "delivery failed, session not advanced");
                        let mut parked = original;
                        parked.failure_count += 1;
                        parked.touch();
                        self.sessions.persist(parked).await?;
                        return Err(e);
                    }
                    sent.push(message);
                }
                session.touch();
                self.sessions.persist(session.clone()).await?;
                if session.status.is_terminal() {
                    audit(
                        &session.id.to_string(),
                        "session_ended",
                        &format!("{:?}", session.status),
                    );
                }
                Ok(StepOutcome {
                    session_id: session.id,
                    sent,
                    status: session.status,
                })
            }
            Err(e) if e.is_configuration() => self.fail_and_handoff(original, e).await,
            Err(e) => {
                // Transient collaborator failure: stay parked, count it,
                // let the next inbound retry.
                let mut parked = original;
                parked.failure_count += 1;
                parked.touch();
                self.sessions.persist(parked).await?;
                Err(e)
            }
        }
    }

    /// Fatal flow configuration: the session fails, the contact goes to a
    /// human, the worker moves on.
    async fn fail_and_handoff(
        &self,
        session: FlowSession,
        cause: EngineError,
    ) -> Result<StepOutcome, EngineError> {
        error!(session = %session.id, flow = %session.flow_id, error = %cause, "flow broken, failing session");
        let mut failed = session;
        failed.end(SessionStatus::Failed);
        self.sessions.persist(failed.clone()).await?;
        if let Err(e) = self.hooks.handoff(&failed, None).await {
            warn!(session = %failed.id, error = %e, "handoff hook failed");
        }
        audit(&failed.id.to_string(), "session_failed", &cause.to_string());
        Ok(StepOutcome {
            session_id: failed.id,
            sent: Vec::new(),
            status: SessionStatus::Failed,
        })
    }

    async fn walk(
        &self,
        compiled: &CompiledFlow,
        session: &mut FlowSession,
        entry: Entry,
        input: Option<&str>,
    ) -> Result<Vec<OutboundMessage>, EngineError> {
        let mut queued = Vec::new();
        let mut cursor = match entry {
            Entry::Node(node_id) => Some(node_id),
            Entry::Input => {
                self.apply_input(compiled, session, input.unwrap_or(""), &mut queued)
                    .await?
            }
        };

        let mut steps = 0usize;
        while let Some(node_id) = cursor {
            steps += 1;
            if steps > MAX_STEPS_PER_ADVANCE {
                return Err(EngineError::Configuration(format!(
                    "flow {}: more than {MAX_STEPS_PER_ADVANCE} nodes in one advance",
                    compiled.id()
                )));
            }
            cursor = self
                .execute_node(compiled, session, &node_id, input, &mut queued)
                .await?;
        }
        Ok(queued)
    }

    /// Feed the inbound text to the node the session is resting on. Returns
    /// the next node to execute, or `None` when the step already settled
    /// (menu re-present, menu handoff).
    async fn apply_input(
        &self,
        compiled: &CompiledFlow,
        session: &mut FlowSession,
        input: &str,
        queued: &mut Vec<OutboundMessage>,
    ) -> Result<Option<String>, EngineError> {
        let node_id = session.current_node_id.clone();
        let node = compiled.node(&node_id)?;

        match &node.kind {
            NodeKind::Menu(menu) => match select_option(menu, input) {
                Some(index) => {
                    session.failure_count = 0;
                    let target = compiled.option_target(&node_id, index).ok_or_else(|| {
                        EngineError::Configuration(format!(
                            "flow {}: menu `{node_id}` has no edge for option {index}",
                            compiled.id()
                        ))
                    })?;
                    Ok(Some(target.to_string()))
                }
                None => {
                    session.failure_count += 1;
                    if session.failure_count >= menu.transfer_after_failures {
                        if let Err(e) = self.hooks.handoff(session, None).await {
                            warn!(session = %session.id, error = %e, "handoff hook failed");
                        }
                        session.end(SessionStatus::Transferred);
                    } else {
                        let data = session_context(session);
                        queued.push(self.text_out(session, menu_prompt(menu, &data)?));
                    }
                    Ok(None)
                }
            },
            NodeKind::Input(input_node) => {
                session
                    .variables
                    .insert(input_node.field_name.clone(), input.to_string());
                Ok(Some(compiled.follow_default(&node_id)?.to_string()))
            }
            // Ai nodes re-execute with the fresh input; anything else means
            // the last persist never landed, so re-run the node as-is.
            NodeKind::AiResponse(_) => Ok(Some(node_id)),
            _ => Ok(Some(node_id)),
        }
    }

    async fn execute_node(
        &self,
        compiled: &CompiledFlow,
        session: &mut FlowSession,
        node_id: &str,
        input: Option<&str>,
        queued: &mut Vec<OutboundMessage>,
    ) -> Result<Option<String>, EngineError> {
        let node = compiled.node(node_id)?;
        let data = session_context(session);

        match &node.kind {
            NodeKind::Start => Ok(Some(compiled.follow_default(node_id)?.to_string())),
            NodeKind::Message(message) => {
                let text = template::render(&message.text, &data)?;
                let out = match &message.media {
                    Some(media) => {
                        let mut media = media.clone();
                        if media.caption.is_none() && !text.is_empty() {
                            media.caption = Some(text);
                        }
                        OutboundMessage::media(
                            session.conversation.connection_id,
                            session.conversation.remote_jid.clone(),
                            media,
                        )
                    }
                    None => self.text_out(session, text),
                };
                queued.push(out);
                Ok(Some(compiled.follow_default(node_id)?.to_string()))
            }
            NodeKind::Menu(menu) => {
                queued.push(self.text_out(session, menu_prompt(menu, &data)?));
                session.current_node_id = node_id.to_string();
                Ok(None)
            }
            NodeKind::Input(input_node) => {
                if let Some(prompt) = &input_node.prompt {
                    let text = template::render(prompt, &data)?;
                    queued.push(self.text_out(session, text));
                }
                session.current_node_id = node_id.to_string();
                Ok(None)
            }
            NodeKind::Condition(cond) => {
                let (branch_edges, else_edge) = compiled.branches(node_id);
                if branch_edges.len() != cond.rules.len() {
                    return Err(EngineError::Configuration(format!(
                        "flow {}: condition `{node_id}` rules and edges diverged",
                        compiled.id()
                    )));
                }
                let else_edge = else_edge.ok_or_else(|| {
                    EngineError::Configuration(format!(
                        "flow {}: condition `{node_id}` lost its else edge",
                        compiled.id()
                    ))
                })?;
                let mut target = else_edge.target.as_str();
                for (rule, edge) in cond.rules.iter().zip(branch_edges) {
                    if rule_matches(rule, &session.variables) {
                        target = edge.target.as_str();
                        break;
                    }
                }
                Ok(Some(target.to_string()))
            }
            NodeKind::Action(action) => {
                let ended = self.run_action(session, &action.action, &data).await?;
                if ended {
                    Ok(None)
                } else {
                    Ok(Some(compiled.follow_default(node_id)?.to_string()))
                }
            }
            NodeKind::Transfer(transfer) => {
                if let Some(message) = &transfer.message {
                    let text = template::render(message, &data)?;
                    queued.push(self.text_out(session, text));
                }
                if let Err(e) = self.hooks.handoff(session, transfer.queue_id).await {
                    warn!(session = %session.id, error = %e, "handoff hook failed");
                }
                session.end(SessionStatus::Transferred);
                Ok(None)
            }
            NodeKind::AiResponse(ai) => {
                let mut prompt = template::render(&ai.prompt, &data)?;
                if let Some(text) = input {
                    prompt = format!("{prompt}\n\nContact message: {text}");
                }
                let reply = self.llm.complete(&prompt).await?;
                queued.push(self.text_out(session, reply));
                if compiled.has_self_loop(node_id) {
                    session.current_node_id = node_id.to_string();
                    Ok(None)
                } else {
                    let target = compiled.non_loop_target(node_id).ok_or_else(|| {
                        EngineError::Configuration(format!(
                            "flow {}: ai node `{node_id}` has no outgoing edge",
                            compiled.id()
                        ))
                    })?;
                    Ok(Some(target.to_string()))
                }
            }
            NodeKind::End => {
                session.end(SessionStatus::Completed);
                Ok(None)
            }
        }
    }

    /// Returns true when the action ended the session.
    async fn run_action(
        &self,
        session: &mut FlowSession,
        action: &ActionKind,
        data: &Value,
    ) -> Result<bool, EngineError> {
        match action {
            ActionKind::AddTag { tag } => {
                if let Err(e) = self.hooks.add_tag(session, tag).await {
                    warn!(session = %session.id, error = %e, "add_tag hook failed");
                }
                Ok(false)
            }
            ActionKind::AssignQueue { queue_id } => {
                if let Err(e) = self.hooks.assign_queue(session, *queue_id).await {
                    warn!(session = %session.id, error = %e, "assign_queue hook failed");
                }
                Ok(false)
            }
            ActionKind::SetVariable { name, value } => {
                let rendered = template::render(value, data)?;
                session.variables.insert(name.clone(), rendered);
                Ok(false)
            }
            ActionKind::Handoff => {
                if let Err(e) = self.hooks.handoff(session, None).await {
                    warn!(session = %session.id, error = %e, "handoff hook failed");
                }
                session.end(SessionStatus::Transferred);
                Ok(true)
            }
        }
    }

    fn text_out(&self, session: &FlowSession, text: String) -> OutboundMessage {
        OutboundMessage::text(
            session.conversation.connection_id,
            session.conversation.remote_jid.clone(),
            text,
        )
    }

    async fn send_with_retry(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, EngineError> {
        send_with_retry(self.gateway.as_ref(), message).await
    }
}

/// Shared bounded-backoff delivery used by the engine and the campaign
/// dispatcher: up to [`SEND_ATTEMPTS`] tries while the error stays
/// transient, sleeping 1s then 2s in between.
pub(crate) async fn send_with_retry(
    gateway: &dyn GatewayClient,
    message: &OutboundMessage,
) -> Result<DeliveryReceipt, EngineError> {
    let mut delay = SEND_BACKOFF;
    let mut attempt = 1;
    loop {
        match gateway.send(message).await {
            Ok(receipt) => return Ok(receipt),
            Err(e) if e.is_transient() && attempt < SEND_ATTEMPTS => {
                warn!(to = %message.to, attempt, error = %e, "gateway send failed, retrying");
                sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(EngineError::Gateway(e)),
        }
    }
}

fn session_context(session: &FlowSession) -> Value {
    template::conversation_context(
        &session.contact_name,
        &session.contact_phone,
        &session.variables,
    )
}

/// Numbered title-plus-options text the contact answers to.
fn menu_prompt(menu: &MenuNode, data: &Value) -> Result<String, EngineError> {
    let title = template::render(&menu.title, data)?;
    let mut lines = Vec::with_capacity(menu.options.len() + 1);
    lines.push(title);
    for (index, option) in menu.options.iter().enumerate() {
        lines.push(format!("{}. {}", index + 1, option.label));
    }
    Ok(lines.join("\n"))
}

/// Accepts the 1-based option number or the option label, trimmed and
/// case-folded.
fn select_option(menu: &MenuNode, input: &str) -> Option<usize> {
    let trimmed = input.trim();
    if let Ok(number) = trimmed.parse::<usize>() {
        if (1..=menu.options.len()).contains(&number) {
            return Some(number);
        }
        return None;
    }
    let folded = trimmed.to_lowercase();
    menu.options
        .iter()
        .position(|option| option.label.trim().to_lowercase() == folded)
        .map(|index| index + 1)
}

fn rule_matches(rule: &ConditionRule, variables: &HashMap<String, String>) -> bool {
    let Some(actual) = variables.get(&rule.variable) else {
        return false;
    };
    let actual = actual.trim();
    let expected = rule.value.trim();
    match rule.operator {
        ConditionOperator::Equals => actual.to_lowercase() == expected.to_lowercase(),
        ConditionOperator::NotEquals => actual.to_lowercase() != expected.to_lowercase(),
        ConditionOperator::Contains => actual.to_lowercase().contains(&expected.to_lowercase()),
        ConditionOperator::GreaterThan => match (actual.parse::<f64>(), expected.parse::<f64>()) {
            (Ok(a), Ok(b)) => a > b,
            _ => false,
        },
        ConditionOperator::LessThan => match (actual.parse::<f64>(), expected.parse::<f64>()) {
            (Ok(a), Ok(b)) => a < b,
            _ => false,
        },
    }
}
