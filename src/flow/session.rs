use std::collections::HashMap;
use std::fmt;
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

pub type SessionStore = Arc<dyn SessionStoreType>;

/// One WhatsApp chat on one gateway connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct ConversationKey {
    pub connection_id: Uuid,
    pub remote_jid: String,
}

impl ConversationKey {
    pub fn new(connection_id: Uuid, remote_jid: impl Into<String>) -> Self {
        Self {
            connection_id,
            remote_jid: remote_jid.into(),
        }
    }

    /// Key for a direct chat with a bare phone number.
    pub fn direct(connection_id: Uuid, phone: &str) -> Self {
        Self::new(connection_id, format!("{phone}@s.whatsapp.net"))
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.connection_id, self.remote_jid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Cancelled,
    Transferred,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Active)
    }
}

/// Execution state of one contact inside one flow. Soft-destroyed: ended
/// sessions keep their row (status + ended_at) for the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct FlowSession {
    pub id: Uuid,
    pub flow_id: Uuid,
    pub org_id: Uuid,
    pub conversation: ConversationKey,
    pub contact_phone: String,
    pub contact_name: String,
    pub current_node_id: String,
    /// Captured by `input` nodes, read by templates and conditions.
    pub variables: HashMap<String, String>,
    pub failure_count: u32,
    pub is_active: bool,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub last_interaction_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl FlowSession {
    pub fn new(
        flow_id: Uuid,
        org_id: Uuid,
        conversation: ConversationKey,
        contact_phone: impl Into<String>,
        contact_name: impl Into<String>,
        current_node_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            flow_id,
            org_id,
            conversation,
            contact_phone: contact_phone.into(),
            contact_name: contact_name.into(),
            current_node_id: current_node_id.into(),
            variables: HashMap::new(),
            failure_count: 0,
            is_active: true,
            status: SessionStatus::Active,
            started_at: now,
            last_interaction_at: now,
            ended_at: None,
        }
    }

    pub fn touch(&mut self) {
        self.last_interaction_at = Utc::now();
    }

    pub fn end(&mut self, status: SessionStatus) {
        self.is_active = false;
        self.status = status;
        self.ended_at = Some(Utc::now());
    }
}

/// Session persistence. `create_active` is the engine's mutual-exclusion
/// primitive: at most one active session may exist per conversation, and
/// losing the race is a [`EngineError::Concurrency`], not a retry.
#[async_trait]
pub trait SessionStoreType: Send + Sync + Debug {
    /// Insert-or-fail against the one-active-session-per-conversation slot.
    async fn create_active(&self, session: FlowSession) -> Result<(), EngineError>;
    async fn get(&self, session_id: Uuid) -> Option<FlowSession>;
    async fn active_for_conversation(&self, conversation: &ConversationKey)
    -> Option<FlowSession>;
    /// Write back a mutated session. A terminal status frees the slot.
    async fn persist(&self, session: FlowSession) -> Result<(), EngineError>;
    /// Cancel active sessions with no interaction since `cutoff`. Competes
    /// only with idle conversations; advances are serialized by the caller.
    async fn expire_idle(&self, cutoff: DateTime<Utc>) -> Vec<FlowSession>;
    fn clear(&self);
}

#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<Uuid, FlowSession>,
    active: DashMap<ConversationKey, Uuid>,
}

impl InMemorySessionStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl SessionStoreType for InMemorySessionStore {
    async fn create_active(&self, session: FlowSession) -> Result<(), EngineError> {
        match self.active.entry(session.conversation.clone()) {
            Entry::Occupied(_) => Err(EngineError::Concurrency(format!(
                "conversation {} already has an active session",
                session.conversation
            ))),
            Entry::Vacant(slot) => {
                slot.insert(session.id);
                self.sessions.insert(session.id, session);
                Ok(())
            }
        }
    }

    async fn get(&self, session_id: Uuid) -> Option<FlowSession> {
        self.sessions.get(&session_id).map(|s| s.clone())
    }

    async fn active_for_conversation(
        &self,
        conversation: &ConversationKey,
    ) -> Option<FlowSession> {
        let id = *self.active.get(conversation)?;
        self.sessions
            .get(&id)
            .map(|s| s.clone())
            .filter(|s| s.is_active)
    }

    async fn persist(&self, session: FlowSession) -> Result<(), EngineError> {
        if session.status.is_terminal() {
            self.active
                .remove_if(&session.conversation, |_, sid| *sid == session.id);
        }
        self.sessions.insert(session.id, session);
        Ok(())
    }

    async fn expire_idle(&self, cutoff: DateTime<Utc>) -> Vec<FlowSession> {
        let stale: Vec<Uuid> = self
            .sessions
            .iter()
            .filter(|s| s.is_active && s.last_interaction_at < cutoff)
            .map(|s| s.id)
            .collect();

        let mut expired = Vec::new();
        for id in stale {
            if let Some(mut entry) = self.sessions.get_mut(&id) {
                if !entry.is_active {
                    continue;
                }
                entry.end(SessionStatus::Cancelled);
                let snapshot = entry.clone();
                drop(entry);
                self.active
                    .remove_if(&snapshot.conversation, |_, sid| *sid == id);
                expired.push(snapshot);
            }
        }
        expired
    }

    fn clear(&self) {
        self.sessions.clear();
        self.active.clear();
    }
}
