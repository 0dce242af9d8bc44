pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod providers;
pub mod queue;
pub mod redis_queue;
pub mod templates;

pub use dispatcher::{DispatcherSettings, NotificationDispatcher, Recipients};
pub use error::{ProviderError, QueueError, QueueResult};
pub use metrics::DispatcherMetrics;
pub use providers::{EmailProvider, HttpEmailProvider, WhatsAppCloudProvider, WhatsAppProvider};
pub use queue::{JobQueue, MemoryQueue};
pub use redis_queue::RedisQueue;
