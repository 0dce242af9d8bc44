use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AdminAction {
    Approve,
    Reject,
}

impl AdminAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdminAction::Approve => "approve",
            AdminAction::Reject => "reject",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AdminActionOutcome {
    /// The transition was applied by this attempt.
    Applied,
    /// A repeat of an already applied decision; nothing changed.
    AlreadyResolved,
    /// The attempt was refused (bad, expired or stale token, wrong state).
    Refused,
}

/// Audit trail entry for an approval or rejection attempt. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdminActionLog {
    pub id: Uuid,
    pub order_id: Uuid,
    pub action: AdminAction,
    pub outcome: AdminActionOutcome,
    pub admin_email: Option<String>,
    pub origin: Option<String>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AdminActionLog {
    pub fn new(order_id: Uuid, action: AdminAction, outcome: AdminActionOutcome) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id,
            action,
            outcome,
            admin_email: None,
            origin: None,
            reason: None,
            created_at: Utc::now(),
        }
    }
}
