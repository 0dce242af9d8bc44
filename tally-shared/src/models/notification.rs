use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Whatsapp,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Whatsapp => "whatsapp",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to the order that warrants a message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum NotificationEvent {
    OrderCreated,
    PaymentApproved,
    PaymentRejected,
    OrderShipped,
    OrderDelivered,
    OrderCancelled,
    PaymentReminder,
    /// Admin-facing: a new order waits for a decision.
    AdminApprovalRequested,
    /// Admin-facing: the customer uploaded proof of payment.
    ReceiptSubmitted,
}

impl NotificationEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationEvent::OrderCreated => "orderCreated",
            NotificationEvent::PaymentApproved => "paymentApproved",
            NotificationEvent::PaymentRejected => "paymentRejected",
            NotificationEvent::OrderShipped => "orderShipped",
            NotificationEvent::OrderDelivered => "orderDelivered",
            NotificationEvent::OrderCancelled => "orderCancelled",
            NotificationEvent::PaymentReminder => "paymentReminder",
            NotificationEvent::AdminApprovalRequested => "adminApprovalRequested",
            NotificationEvent::ReceiptSubmitted => "receiptSubmitted",
        }
    }

    pub fn is_admin_facing(&self) -> bool {
        matches!(
            self,
            NotificationEvent::AdminApprovalRequested | NotificationEvent::ReceiptSubmitted
        )
    }
}

impl fmt::Display for NotificationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Retrying,
    Sent,
    DeadLettered,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Sent | JobStatus::DeadLettered)
    }
}

/// Values the templates render. Amount is in minor units.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct NotificationPayload {
    pub order_id: Uuid,
    pub order_number: String,
    pub customer_name: String,
    pub amount: Option<i64>,
    pub currency: String,
    pub payment_method: Option<String>,
    pub approve_url: Option<String>,
    pub reject_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationJob {
    pub id: Uuid,
    pub channel: Channel,
    pub event: NotificationEvent,
    pub recipient: String,
    pub payload: NotificationPayload,
    pub attempts: u32,
    pub status: JobStatus,
    pub last_error: Option<String>,
    /// Earliest moment a worker may pick the job up (backoff).
    pub available_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NotificationJob {
    pub fn new(
        channel: Channel,
        event: NotificationEvent,
        recipient: impl Into<String>,
        payload: NotificationPayload,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            channel,
            event,
            recipient: recipient.into(),
            payload,
            attempts: 0,
            status: JobStatus::Queued,
            last_error: None,
            available_at: now,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Sent,
    Failed,
    DeadLettered,
}

/// One delivery attempt. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageLog {
    pub id: Uuid,
    pub job_id: Uuid,
    pub channel: Channel,
    pub event: NotificationEvent,
    pub recipient: String,
    pub attempt: u32,
    pub outcome: DeliveryOutcome,
    pub provider_message_id: Option<String>,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl MessageLog {
    pub fn for_job(job: &NotificationJob, outcome: DeliveryOutcome) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id: job.id,
            channel: job.channel,
            event: job.event,
            recipient: job.recipient.clone(),
            attempt: job.attempts,
            outcome,
            provider_message_id: None,
            detail: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_provider_id(mut self, id: impl Into<String>) -> Self {
        self.provider_message_id = Some(id.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}
