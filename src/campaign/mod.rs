pub mod dispatcher;

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use gateway_client::message::{DeliveryReceipt, MediaPayload};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;

pub type CampaignStore = Arc<dyn CampaignStoreType>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl CampaignStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CampaignStatus::Completed | CampaignStatus::Cancelled | CampaignStatus::Failed
        )
    }
}

/// Date range plus daily time-of-day range a campaign may send in. All
/// bounds optional and inclusive; times are wall clock UTC.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ScheduleWindow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<NaiveTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<NaiveTime>,
}

impl ScheduleWindow {
    pub fn always() -> Self {
        Self::default()
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        let date = at.date_naive();
        if let Some(start) = self.start_date {
            if date < start {
                return false;
            }
        }
        if let Some(end) = self.end_date {
            if date > end {
                return false;
            }
        }
        let time = at.time();
        if let Some(start) = self.start_time {
            if time < start {
                return false;
            }
        }
        if let Some(end) = self.end_time {
            if time > end {
                return false;
            }
        }
        true
    }

    /// Earliest instant at or after `at` inside the window, or `None` when
    /// the window can never open again.
    pub fn next_opening(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.contains(at) {
            return Some(at);
        }
        let date = at.date_naive();
        if let Some(end) = self.end_date {
            if date > end {
                return None;
            }
        }
        if let Some(start) = self.start_date {
            if date < start {
                return Some(Self::day_opening(start, self.start_time));
            }
        }
        if let Some(start) = self.start_time {
            if at.time() < start {
                return Some(Self::day_opening(date, self.start_time));
            }
        }
        // past today's closing time, try tomorrow
        let next = date.succ_opt()?;
        if let Some(end) = self.end_date {
            if next > end {
                return None;
            }
        }
        Some(Self::day_opening(next, self.start_time))
    }

    fn day_opening(date: NaiveDate, start_time: Option<NaiveTime>) -> DateTime<Utc> {
        date.and_time(start_time.unwrap_or(NaiveTime::MIN)).and_utc()
    }
}

/// Two-tier anti-ban pacing: a random per-message delay, and a longer
/// cool-down that replaces the delay after every `pause_after_messages`
/// successful sends. `pause_after_messages == 0` disables the cool-down.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct Pacing {
    pub min_delay_secs: u64,
    pub max_delay_secs: u64,
    #[serde(default)]
    pub pause_after_messages: u32,
    #[serde(default)]
    pub pause_duration_secs: u64,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            min_delay_secs: 5,
            max_delay_secs: 30,
            pause_after_messages: 20,
            pause_duration_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Campaign {
    pub id: Uuid,
    pub org_id: Uuid,
    pub connection_id: Uuid,
    pub name: String,
    /// Handlebars template rendered once per recipient.
    pub message_template: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaPayload>,
    pub status: CampaignStatus,
    #[serde(default)]
    pub window: ScheduleWindow,
    pub pacing: Pacing,
    #[serde(default)]
    pub random_order: bool,
    /// Fixed shuffle seed; derived from the campaign id when unset, so a
    /// cycle's order is reproducible either way.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shuffle_seed: Option<u64>,
    #[serde(default)]
    pub sent_count: u32,
    #[serde(default)]
    pub failed_count: u32,
    pub created_at: DateTime<Utc>,
}

impl Campaign {
    pub fn new(
        org_id: Uuid,
        connection_id: Uuid,
        name: impl Into<String>,
        message_template: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            org_id,
            connection_id,
            name: name.into(),
            message_template: message_template.into(),
            media: None,
            status: CampaignStatus::Pending,
            window: ScheduleWindow::always(),
            pacing: Pacing::default(),
            random_order: false,
            shuffle_seed: None,
            sent_count: 0,
            failed_count: 0,
            created_at: Utc::now(),
        }
    }

    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn with_window(mut self, window: ScheduleWindow) -> Self {
        self.window = window;
        self
    }

    pub fn with_random_order(mut self, seed: Option<u64>) -> Self {
        self.random_order = true;
        self.shuffle_seed = seed;
        self
    }

    pub fn effective_seed(&self) -> u64 {
        if let Some(seed) = self.shuffle_seed {
            return seed;
        }
        let bytes = self.id.as_bytes();
        u64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ])
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Recipient {
    pub phone: String,
    pub name: String,
}

impl Recipient {
    pub fn new(phone: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            phone: phone.into(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Sent,
    Failed,
}

/// One recipient row of a campaign.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct CampaignMessage {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub recipient_phone: String,
    pub recipient_name: String,
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl CampaignMessage {
    pub fn new(campaign_id: Uuid, recipient: &Recipient) -> Self {
        Self {
            id: Uuid::new_v4(),
            campaign_id,
            recipient_phone: recipient.phone.clone(),
            recipient_name: recipient.name.clone(),
            status: MessageStatus::Pending,
            scheduled_at: None,
            sent_at: None,
            provider_message_id: None,
            error_message: None,
        }
    }
}

/// Persistence seam for campaigns. Row transitions update the parent
/// counters in the same call, which is what keeps
/// `sent_count + failed_count == non-pending rows` true after every cycle.
#[async_trait]
pub trait CampaignStoreType: Send + Sync + Debug {
    /// Stores the campaign with one pending row per recipient.
    async fn create(&self, campaign: Campaign, recipients: &[Recipient])
    -> Result<(), EngineError>;
    async fn get(&self, campaign_id: Uuid) -> Option<Campaign>;
    /// Cheap status read for pacing checkpoints.
    async fn status(&self, campaign_id: Uuid) -> Option<CampaignStatus>;
    async fn set_status(&self, campaign_id: Uuid, status: CampaignStatus)
    -> Result<(), EngineError>;
    /// Pending rows in insertion order.
    async fn pending_messages(&self, campaign_id: Uuid) -> Vec<CampaignMessage>;
    async fn messages(&self, campaign_id: Uuid) -> Vec<CampaignMessage>;
    async fn mark_sent(
        &self,
        message_id: Uuid,
        receipt: &DeliveryReceipt,
    ) -> Result<(), EngineError>;
    async fn mark_failed(&self, message_id: Uuid, error: &str) -> Result<(), EngineError>;
    /// Pushes `scheduled_at` of every pending row to `at`. Returns how many
    /// rows moved.
    async fn reschedule_pending(&self, campaign_id: Uuid, at: DateTime<Utc>) -> usize;
}

#[derive(Debug, Default)]
pub struct InMemoryCampaignStore {
    campaigns: DashMap<Uuid, Campaign>,
    rows: DashMap<Uuid, CampaignMessage>,
    /// Row ids per campaign, in insertion order.
    order: DashMap<Uuid, Vec<Uuid>>,
}

impl InMemoryCampaignStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl CampaignStoreType for InMemoryCampaignStore {
    async fn create(
        &self,
        campaign: Campaign,
        recipients: &[Recipient],
    ) -> Result<(), EngineError> {
        let campaign_id = campaign.id;
        match self.campaigns.entry(campaign_id) {
            Entry::Occupied(_) => {
                return Err(EngineError::Concurrency(format!(
                    "campaign {campaign_id} already exists"
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(campaign);
            }
        }
        let mut ids = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            let row = CampaignMessage::new(campaign_id, recipient);
            ids.push(row.id);
            self.rows.insert(row.id, row);
        }
        self.order.insert(campaign_id, ids);
        Ok(())
    }

    async fn get(&self, campaign_id: Uuid) -> Option<Campaign> {
        self.campaigns.get(&campaign_id).map(|c| c.clone())
    }

    async fn status(&self, campaign_id: Uuid) -> Option<CampaignStatus> {
        self.campaigns.get(&campaign_id).map(|c| c.status)
    }

    async fn set_status(
        &self,
        campaign_id: Uuid,
        status: CampaignStatus,
    ) -> Result<(), EngineError> {
        let mut campaign = self
            .campaigns
            .get_mut(&campaign_id)
            .ok_or(EngineError::CampaignNotFound(campaign_id))?;
        campaign.status = status;
        Ok(())
    }

    async fn pending_messages(&self, campaign_id: Uuid) -> Vec<CampaignMessage> {
        self.in_order(campaign_id, |row| row.status == MessageStatus::Pending)
    }

    async fn messages(&self, campaign_id: Uuid) -> Vec<CampaignMessage> {
        self.in_order(campaign_id, |_| true)
    }

    async fn mark_sent(
        &self,
        message_id: Uuid,
        receipt: &DeliveryReceipt,
    ) -> Result<(), EngineError> {
        let campaign_id = {
            let Some(mut row) = self.rows.get_mut(&message_id) else {
                return Err(EngineError::Configuration(format!(
                    "campaign message {message_id} not found"
                )));
            };
            // replayed transition, the counter already saw this row
            if row.status != MessageStatus::Pending {
                return Ok(());
            }
            row.status = MessageStatus::Sent;
            row.sent_at = Some(Utc::now());
            row.provider_message_id = Some(receipt.provider_message_id.clone());
            row.campaign_id
        };
        if let Some(mut campaign) = self.campaigns.get_mut(&campaign_id) {
            campaign.sent_count += 1;
        }
        Ok(())
    }

    async fn mark_failed(&self, message_id: Uuid, error: &str) -> Result<(), EngineError> {
        let campaign_id = {
            let Some(mut row) = self.rows.get_mut(&message_id) else {
                return Err(EngineError::Configuration(format!(
                    "campaign message {message_id} not found"
                )));
            };
            if row.status != MessageStatus::Pending {
                return Ok(());
            }
            row.status = MessageStatus::Failed;
            row.error_message = Some(error.to_string());
            row.campaign_id
        };
        if let Some(mut campaign) = self.campaigns.get_mut(&campaign_id) {
            campaign.failed_count += 1;
        }
        Ok(())
    }

    async fn reschedule_pending(&self, campaign_id: Uuid, at: DateTime<Utc>) -> usize {
        let ids = self
            .order
            .get(&campaign_id)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        let mut moved = 0;
        for id in ids {
            if let Some(mut row) = self.rows.get_mut(&id) {
                if row.status == MessageStatus::Pending {
                    row.scheduled_at = Some(at);
                    moved += 1;
                }
            }
        }
        moved
    }
}

impl InMemoryCampaignStore {
    fn in_order(
        &self,
        campaign_id: Uuid,
        keep: impl Fn(&CampaignMessage) -> bool,
    ) -> Vec<CampaignMessage> {
        let ids = self
            .order
            .get(&campaign_id)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        ids.iter()
            .filter_map(|id| self.rows.get(id))
            .filter(|row| keep(row))
            .map(|row| row.clone())
            .collect()
    }
}
