use uuid::Uuid;

/// Failure reported by a channel provider for one send.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// Timeouts, 5xx, 429. Worth another attempt later.
    #[error("Transient provider failure: {0}")]
    Transient(String),

    /// The provider refused the message itself (bad recipient, 4xx).
    #[error("Provider rejected message: {0}")]
    Rejected(String),

    #[error("No template registered for {0}")]
    NoTemplate(String),
}

impl ProviderError {
    /// Permanent failures skip the remaining attempts and go straight to the dead-letter queue.
    pub fn is_permanent(&self) -> bool {
        !matches!(self, ProviderError::Transient(_))
    }

    pub(crate) fn from_status(status: reqwest::StatusCode, body: String) -> Self {
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            ProviderError::Transient(format!("{}: {}", status, body))
        } else {
            ProviderError::Rejected(format!("{}: {}", status, body))
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        ProviderError::Transient(err.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue backend error: {0}")]
    Backend(String),

    #[error("Job serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Job not found: {0}")]
    UnknownJob(Uuid),

    #[error("Job {0} is not dead-lettered")]
    NotDeadLettered(Uuid),
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        QueueError::Backend(err.to_string())
    }
}

pub type QueueResult<T> = Result<T, QueueError>;
