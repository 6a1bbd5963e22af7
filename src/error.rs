use thiserror::Error;
use uuid::Uuid;

use gateway_client::client::GatewayError;

/// Error taxonomy of the engine. Three families with different blast radius:
/// configuration errors are fatal for the flow/campaign/automation instance
/// they belong to (the worker degrades it and moves on), gateway errors are
/// retried while transient, and concurrency violations mean another worker
/// already owns the contested key so the caller discards its attempt.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("template rendering failed: {0}")]
    Template(String),
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),
    #[error("llm error: {0}")]
    Llm(String),
    #[error("concurrency violation: {0}")]
    Concurrency(String),
    #[error("flow {0} not found")]
    FlowNotFound(Uuid),
    #[error("session {0} not found")]
    SessionNotFound(Uuid),
    #[error("campaign {0} not found")]
    CampaignNotFound(Uuid),
    #[error("deal {0} not found")]
    DealNotFound(Uuid),
}

impl EngineError {
    /// Worth retrying with backoff. Everything else is settled.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Gateway(e) => e.is_transient(),
            EngineError::Llm(_) => true,
            _ => false,
        }
    }

    /// Fatal for the owning instance: the caller should degrade it
    /// (transfer to human, mark failed) instead of retrying.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            EngineError::Configuration(_) | EngineError::Template(_)
        )
    }
}
