use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::message::{DeliveryReceipt, OutboundMessage};

#[derive(Debug, Error)]
pub enum GatewayError {
    /// The gateway refused the message; retrying the same payload will not help.
    #[error("gateway rejected the message: {0}")]
    Rejected(String),
    /// The gateway could not be reached or answered with a server error.
    #[error("gateway unavailable: {0}")]
    Unavailable(String),
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Unavailable(_))
    }
}

/// Send seam for the WhatsApp gateway. One call, one message, one receipt.
#[async_trait]
pub trait GatewayClient: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, GatewayError>;
}

pub type Gateway = Arc<dyn GatewayClient>;

/// HTTP client for gateway deployments exposing the `messages/send` endpoint.
#[derive(Debug, Clone)]
pub struct HttpGateway {
    base: Url,
    token: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    message_id: String,
}

impl HttpGateway {
    pub fn new(mut base: Url, token: impl Into<String>) -> Self {
        // Url::join drops the last path segment unless the base ends in `/`.
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Self {
            base,
            token: token.into(),
            client: reqwest::Client::new(),
        }
    }

    fn send_url(&self) -> Result<Url, GatewayError> {
        self.base
            .join("messages/send")
            .map_err(|e| GatewayError::Rejected(format!("invalid gateway url: {e}")))
    }
}

#[async_trait]
impl GatewayClient for HttpGateway {
    async fn send(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, GatewayError> {
        let url = self.send_url()?;
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .json(message)
            .send()
            .await
            .map_err(|e| GatewayError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(GatewayError::Unavailable(format!(
                "gateway answered {status}"
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Rejected(format!("{status}: {body}")));
        }

        let parsed: SendResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Unavailable(format!("unreadable gateway response: {e}")))?;
        tracing::debug!(to = %message.to, id = %parsed.message_id, "gateway accepted message");
        Ok(DeliveryReceipt {
            provider_message_id: parsed.message_id,
            timestamp: Utc::now(),
        })
    }
}
