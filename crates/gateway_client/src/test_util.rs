use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::client::{GatewayClient, GatewayError};
use crate::message::{DeliveryReceipt, OutboundMessage};

#[derive(Clone)]
pub struct SentRecord {
    pub message: OutboundMessage,
    pub at: Instant,
}

/// Records every accepted send together with the tokio instant it happened
/// at, so pacing tests can assert on gaps under virtual time.
#[derive(Clone, Default)]
pub struct RecordingGateway {
    sent: Arc<Mutex<Vec<SentRecord>>>,
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<OutboundMessage> {
        self.sent
            .lock()
            .await
            .iter()
            .map(|r| r.message.clone())
            .collect()
    }

    pub async fn sent_at(&self) -> Vec<Instant> {
        self.sent.lock().await.iter().map(|r| r.at).collect()
    }

    pub async fn sent_count(&self) -> usize {
        self.sent.lock().await.len()
    }
}

#[async_trait]
impl GatewayClient for RecordingGateway {
    async fn send(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, GatewayError> {
        self.sent.lock().await.push(SentRecord {
            message: message.clone(),
            at: Instant::now(),
        });
        Ok(DeliveryReceipt::new(Uuid::new_v4().to_string()))
    }
}

/// Fails the first `failures` sends, then records like [`RecordingGateway`].
pub struct FlakyGateway {
    failures_left: AtomicUsize,
    transient: bool,
    inner: RecordingGateway,
}

impl FlakyGateway {
    /// Injected failures report as retryable.
    pub fn transient(failures: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(failures),
            transient: true,
            inner: RecordingGateway::new(),
        }
    }

    /// Injected failures report as permanent rejections.
    pub fn rejecting(failures: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(failures),
            transient: false,
            inner: RecordingGateway::new(),
        }
    }

    /// Handle onto the recording half, for assertions after the failures.
    pub fn recorder(&self) -> RecordingGateway {
        self.inner.clone()
    }
}

#[async_trait]
impl GatewayClient for FlakyGateway {
    async fn send(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, GatewayError> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(if self.transient {
                GatewayError::Unavailable("injected gateway outage".into())
            } else {
                GatewayError::Rejected("injected gateway rejection".into())
            });
        }
        self.inner.send(message).await
    }
}
