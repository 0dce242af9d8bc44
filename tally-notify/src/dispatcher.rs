use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tally_core::Store;
use tally_shared::pii::Masked;
use tally_shared::{
    Channel, DeliveryOutcome, JobStatus, MessageLog, NotificationEvent, NotificationJob,
    NotificationPayload,
};

use crate::error::{ProviderError, QueueResult};
use crate::metrics::DispatcherMetrics;
use crate::providers::{EmailProvider, WhatsAppProvider};
use crate::queue::JobQueue;
use crate::templates;

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub email_concurrency: usize,
    pub whatsapp_concurrency: usize,
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub visibility_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            email_concurrency: 5,
            whatsapp_concurrency: 3,
            max_attempts: 5,
            base_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(300),
            visibility_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl DispatcherSettings {
    /// Delay before attempt `attempt + 1`: `base * 2^(attempt - 1)`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_backoff.saturating_mul(factor).min(self.max_backoff)
    }

    fn concurrency(&self, channel: Channel) -> usize {
        match channel {
            Channel::Email => self.email_concurrency,
            Channel::Whatsapp => self.whatsapp_concurrency,
        }
    }
}

/// Where a notification should go. A channel without an address gets no job.
#[derive(Debug, Clone, Default)]
pub struct Recipients {
    pub email: Option<String>,
    pub phone: Option<String>,
}

impl Recipients {
    pub fn email(address: impl Into<String>) -> Self {
        Self {
            email: Some(address.into()),
            phone: None,
        }
    }
}

/// A successful send and anything worth noting about how it got there.
struct Delivered {
    message_id: String,
    note: Option<String>,
}

/// Turns order events into per-channel jobs and drives them to a terminal
/// state (`sent` or `dead_lettered`) from bounded worker pools.
pub struct NotificationDispatcher {
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn Store>,
    email: Arc<dyn EmailProvider>,
    whatsapp: Arc<dyn WhatsAppProvider>,
    settings: DispatcherSettings,
    metrics: Option<DispatcherMetrics>,
}

impl NotificationDispatcher {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn Store>,
        email: Arc<dyn EmailProvider>,
        whatsapp: Arc<dyn WhatsAppProvider>,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            queue,
            store,
            email,
            whatsapp,
            settings,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: DispatcherMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn settings(&self) -> &DispatcherSettings {
        &self.settings
    }

    /// One job per channel that has an address. Returns the job ids.
    pub async fn enqueue(
        &self,
        event: NotificationEvent,
        recipients: &Recipients,
        payload: NotificationPayload,
    ) -> QueueResult<Vec<Uuid>> {
        let targets = [
            (Channel::Email, recipients.email.as_deref()),
            (Channel::Whatsapp, recipients.phone.as_deref()),
        ];

        let mut ids = Vec::new();
        for (channel, address) in targets {
            let Some(address) = address.filter(|a| !a.trim().is_empty()) else {
                continue;
            };
            let job = NotificationJob::new(channel, event, address, payload.clone());
            self.queue.enqueue(&job).await?;
            debug!("Enqueued {} {} job {} for {}", event, channel, job.id, Masked(address));
            ids.push(job.id);
        }
        Ok(ids)
    }

    /// Lease and handle at most one job of `channel`. Returns whether a job was handled.
    pub async fn process_next(&self, channel: Channel) -> QueueResult<bool> {
        match self.queue.dequeue(channel, self.settings.visibility_timeout).await? {
            Some(job) => {
                self.handle(job).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn handle(&self, mut job: NotificationJob) -> QueueResult<()> {
        job.attempts += 1;
        job.updated_at = Utc::now();

        match self.deliver(&job).await {
            Ok(delivered) => {
                job.status = JobStatus::Sent;
                job.last_error = None;

                let mut entry = MessageLog::for_job(&job, DeliveryOutcome::Sent).with_provider_id(&delivered.message_id);
                if let Some(note) = delivered.note {
                    entry = entry.with_detail(note);
                }
                self.record(entry).await;
                self.count(job.channel, "sent");

                info!(
                    "Delivered {} via {} (job {}, attempt {})",
                    job.event, job.channel, job.id, job.attempts
                );
                self.queue.ack(&job).await
            }
            Err(err) => {
                job.last_error = Some(err.to_string());
                self.record(MessageLog::for_job(&job, DeliveryOutcome::Failed).with_detail(err.to_string()))
                    .await;
                self.count(job.channel, "failed");

                if err.is_permanent() || job.attempts >= self.settings.max_attempts {
                    job.status = JobStatus::DeadLettered;
                    self.record(
                        MessageLog::for_job(&job, DeliveryOutcome::DeadLettered)
                            .with_detail(format!("gave up after {} attempt(s): {}", job.attempts, err)),
                    )
                    .await;
                    if let Some(metrics) = &self.metrics {
                        metrics.dead_lettered(job.channel);
                    }

                    error!(
                        "Dead-lettered {} {} job {} for {} after {} attempt(s): {}",
                        job.event,
                        job.channel,
                        job.id,
                        Masked(job.recipient.as_str()),
                        job.attempts,
                        err
                    );
                    self.queue.dead_letter(&job).await
                } else {
                    job.status = JobStatus::Retrying;
                    let delay = self.settings.backoff(job.attempts);
                    warn!(
                        "Attempt {} of {} job {} failed, retrying in {:?}: {}",
                        job.attempts, job.channel, job.id, delay, err
                    );
                    self.queue.retry(&job, delay).await
                }
            }
        }
    }

    async fn deliver(&self, job: &NotificationJob) -> Result<Delivered, ProviderError> {
        match job.channel {
            Channel::Email => {
                let content = templates::email(job.event, &job.payload);
                let message_id = self.email.send(&job.recipient, &content).await?;
                Ok(Delivered { message_id, note: None })
            }
            Channel::Whatsapp => self.deliver_whatsapp(job).await,
        }
    }

    /// Template first; on failure the same content goes out as free-form text.
    async fn deliver_whatsapp(&self, job: &NotificationJob) -> Result<Delivered, ProviderError> {
        let body = templates::text(job.event, &job.payload);

        let Some(template) = templates::whatsapp_template(job.event, &job.payload) else {
            let message_id = self.whatsapp.send_text(&job.recipient, &body).await?;
            return Ok(Delivered { message_id, note: None });
        };

        let template_err = match self.whatsapp.send_template(&job.recipient, &template).await {
            Ok(message_id) => return Ok(Delivered { message_id, note: None }),
            Err(e) => e,
        };

        warn!(
            "Template {} failed for job {}, falling back to text: {}",
            template.name, job.id, template_err
        );

        match self.whatsapp.send_text(&job.recipient, &body).await {
            Ok(message_id) => Ok(Delivered {
                message_id,
                note: Some(format!("template {} failed ({}); sent as text", template.name, template_err)),
            }),
            Err(text_err) => {
                let detail = format!("template {}: {}; text: {}", template.name, template_err, text_err);
                if template_err.is_permanent() && text_err.is_permanent() {
                    Err(ProviderError::Rejected(detail))
                } else {
                    Err(ProviderError::Transient(detail))
                }
            }
        }
    }

    async fn record(&self, entry: MessageLog) {
        if let Err(e) = self.store.append_message_log(&entry).await {
            error!("Failed to write message log for job {}: {}", entry.job_id, e);
        }
    }

    fn count(&self, channel: Channel, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.attempt(channel, outcome);
        }
    }

    pub async fn dead_letters(&self, channel: Channel) -> QueueResult<Vec<NotificationJob>> {
        self.queue.dead_letters(channel).await
    }

    pub async fn replay(&self, job_id: Uuid) -> QueueResult<NotificationJob> {
        let job = self.queue.replay(job_id).await?;
        info!("Replayed dead-lettered {} job {}", job.channel, job.id);
        Ok(job)
    }

    pub async fn job(&self, job_id: Uuid) -> QueueResult<Option<NotificationJob>> {
        self.queue.get_job(job_id).await
    }

    /// Start both worker pools. Workers stop once `shutdown` flips to `true`
    /// or its sender is dropped; a job in flight is finished first.
    pub fn spawn_workers(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for channel in [Channel::Email, Channel::Whatsapp] {
            for worker in 0..self.settings.concurrency(channel) {
                let dispatcher = Arc::clone(self);
                let shutdown = shutdown.clone();
                handles.push(tokio::spawn(async move {
                    dispatcher.run_worker(channel, worker, shutdown).await;
                }));
            }
        }
        info!(
            "Notification workers started (email: {}, whatsapp: {})",
            self.settings.email_concurrency, self.settings.whatsapp_concurrency
        );
        handles
    }

    async fn run_worker(&self, channel: Channel, worker: usize, mut shutdown: watch::Receiver<bool>) {
        debug!("{} worker {} started", channel, worker);

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.process_next(channel).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => error!("{} worker {} queue error: {}", channel, worker, e),
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }

        debug!("{} worker {} stopped", channel, worker);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryQueue;
    use crate::templates::{EmailContent, WhatsAppTemplate};
    use async_trait::async_trait;
    use prometheus::Registry;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tally_core::LogStore;
    use tally_store::LocalStore;

    /// Replies from a script, then succeeds once the script runs out.
    #[derive(Default)]
    struct Scripted {
        replies: Mutex<VecDeque<Result<String, ProviderError>>>,
        calls: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn with(replies: Vec<Result<String, ProviderError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn failing() -> Arc<Self> {
            Self::with((0..20).map(|_| Err(ProviderError::Transient("503".to_string()))).collect())
        }

        fn reply(&self, call: String) -> Result<String, ProviderError> {
            let mut calls = self.calls.lock().unwrap();
            calls.push(call);
            let n = calls.len();
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(format!("msg-{}", n)))
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EmailProvider for Scripted {
        async fn send(&self, _recipient: &str, content: &EmailContent) -> Result<String, ProviderError> {
            self.reply(format!("email:{}", content.subject))
        }
    }

    #[async_trait]
    impl WhatsAppProvider for Scripted {
        async fn send_template(&self, _recipient: &str, template: &WhatsAppTemplate) -> Result<String, ProviderError> {
            self.reply(format!("template:{}", template.name))
        }

        async fn send_text(&self, _recipient: &str, _body: &str) -> Result<String, ProviderError> {
            self.reply("text".to_string())
        }
    }

    struct Harness {
        dispatcher: Arc<NotificationDispatcher>,
        queue: Arc<MemoryQueue>,
        store: Arc<LocalStore>,
        metrics: DispatcherMetrics,
    }

    fn harness(email: Arc<Scripted>, whatsapp: Arc<Scripted>) -> Harness {
        let queue = Arc::new(MemoryQueue::new());
        let store = Arc::new(LocalStore::in_memory());
        let metrics = DispatcherMetrics::register(&Registry::new()).unwrap();
        let settings = DispatcherSettings {
            max_attempts: 3,
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            poll_interval: Duration::from_millis(5),
            ..Default::default()
        };
        let dispatcher = NotificationDispatcher::new(queue.clone(), store.clone(), email, whatsapp, settings)
            .with_metrics(metrics.clone());

        Harness {
            dispatcher: Arc::new(dispatcher),
            queue,
            store,
            metrics,
        }
    }

    fn payload() -> NotificationPayload {
        NotificationPayload {
            order_id: Uuid::new_v4(),
            order_number: "ORD-20260101-ABC123".to_string(),
            customer_name: "Ayesha".to_string(),
            amount: Some(250_000),
            currency: "PKR".to_string(),
            ..Default::default()
        }
    }

    fn both() -> Recipients {
        Recipients {
            email: Some("ayesha@example.com".to_string()),
            phone: Some("+923001234567".to_string()),
        }
    }

    async fn drain(h: &Harness, channel: Channel) {
        while h.dispatcher.process_next(channel).await.unwrap() {}
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let settings = DispatcherSettings {
            base_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(10),
            ..Default::default()
        };
        assert_eq!(settings.backoff(1), Duration::from_secs(2));
        assert_eq!(settings.backoff(2), Duration::from_secs(4));
        assert_eq!(settings.backoff(3), Duration::from_secs(8));
        assert_eq!(settings.backoff(4), Duration::from_secs(10));
        assert_eq!(settings.backoff(40), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_enqueue_one_job_per_addressed_channel() {
        let h = harness(Scripted::with(vec![]), Scripted::with(vec![]));

        let ids = h.dispatcher.enqueue(NotificationEvent::OrderCreated, &both(), payload()).await.unwrap();
        assert_eq!(ids.len(), 2);

        let ids = h
            .dispatcher
            .enqueue(NotificationEvent::AdminApprovalRequested, &Recipients::email("admin@example.com"), payload())
            .await
            .unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(h.queue.pending(Channel::Email).await, 2);
        assert_eq!(h.queue.pending(Channel::Whatsapp).await, 1);
    }

    #[tokio::test]
    async fn test_always_failing_provider_ends_in_dead_letter_queue() {
        let h = harness(Scripted::failing(), Scripted::with(vec![]));
        let ids = h
            .dispatcher
            .enqueue(NotificationEvent::PaymentApproved, &Recipients::email("a@example.com"), payload())
            .await
            .unwrap();

        drain(&h, Channel::Email).await;

        let job = h.dispatcher.job(ids[0]).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::DeadLettered);
        assert_eq!(job.attempts, 3);
        assert!(job.last_error.is_some());

        let dead = h.dispatcher.dead_letters(Channel::Email).await.unwrap();
        assert_eq!(dead.len(), 1);

        let logs = h.store.message_logs_for_job(ids[0]).await.unwrap();
        let failed = logs.iter().filter(|l| l.outcome == DeliveryOutcome::Failed).count();
        let parked = logs.iter().filter(|l| l.outcome == DeliveryOutcome::DeadLettered).count();
        assert_eq!(failed, 3);
        assert_eq!(parked, 1);
        assert_eq!(h.metrics.attempts_for(Channel::Email, "failed"), 3);
    }

    #[tokio::test]
    async fn test_transient_failure_retries_then_sends() {
        let email = Scripted::with(vec![Err(ProviderError::Transient("timeout".to_string()))]);
        let h = harness(email.clone(), Scripted::with(vec![]));
        let ids = h
            .dispatcher
            .enqueue(NotificationEvent::OrderShipped, &Recipients::email("a@example.com"), payload())
            .await
            .unwrap();

        drain(&h, Channel::Email).await;

        let job = h.dispatcher.job(ids[0]).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Sent);
        assert_eq!(job.attempts, 2);
        assert_eq!(email.calls().len(), 2);

        let logs = h.store.message_logs_for_job(ids[0]).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[1].outcome, DeliveryOutcome::Sent);
        assert_eq!(logs[1].provider_message_id.as_deref(), Some("msg-2"));
    }

    #[tokio::test]
    async fn test_permanent_failure_skips_remaining_attempts() {
        let email = Scripted::with(vec![Err(ProviderError::Rejected("invalid recipient".to_string()))]);
        let h = harness(email.clone(), Scripted::with(vec![]));
        let ids = h
            .dispatcher
            .enqueue(NotificationEvent::OrderCreated, &Recipients::email("nobody"), payload())
            .await
            .unwrap();

        drain(&h, Channel::Email).await;

        let job = h.dispatcher.job(ids[0]).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::DeadLettered);
        assert_eq!(job.attempts, 1);
        assert_eq!(email.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_whatsapp_falls_back_to_text() {
        let whatsapp = Scripted::with(vec![Err(ProviderError::Rejected("template paused".to_string()))]);
        let h = harness(Scripted::with(vec![]), whatsapp.clone());
        let ids = h
            .dispatcher
            .enqueue(
                NotificationEvent::OrderCreated,
                &Recipients { email: None, phone: Some("+923001234567".to_string()) },
                payload(),
            )
            .await
            .unwrap();

        drain(&h, Channel::Whatsapp).await;

        assert_eq!(whatsapp.calls(), vec!["template:order_created".to_string(), "text".to_string()]);
        let job = h.dispatcher.job(ids[0]).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Sent);

        let logs = h.store.message_logs_for_job(ids[0]).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].detail.as_deref().unwrap_or_default().contains("sent as text"));
    }

    #[tokio::test]
    async fn test_whatsapp_without_template_sends_text() {
        let whatsapp = Scripted::with(vec![]);
        let h = harness(Scripted::with(vec![]), whatsapp.clone());
        h.dispatcher
            .enqueue(
                NotificationEvent::PaymentRejected,
                &Recipients { email: None, phone: Some("+923001234567".to_string()) },
                payload(),
            )
            .await
            .unwrap();

        drain(&h, Channel::Whatsapp).await;
        assert_eq!(whatsapp.calls(), vec!["text".to_string()]);
    }

    #[tokio::test]
    async fn test_replayed_job_is_delivered() {
        let email = Scripted::with(
            (0..3).map(|_| Err(ProviderError::Transient("503".to_string()))).collect(),
        );
        let h = harness(email, Scripted::with(vec![]));
        let ids = h
            .dispatcher
            .enqueue(NotificationEvent::OrderDelivered, &Recipients::email("a@example.com"), payload())
            .await
            .unwrap();
        drain(&h, Channel::Email).await;
        assert_eq!(h.dispatcher.job(ids[0]).await.unwrap().unwrap().status, JobStatus::DeadLettered);

        h.dispatcher.replay(ids[0]).await.unwrap();
        drain(&h, Channel::Email).await;

        let job = h.dispatcher.job(ids[0]).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Sent);
        assert_eq!(job.attempts, 1);
        assert!(h.dispatcher.dead_letters(Channel::Email).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_workers_drain_queues_and_stop() {
        let h = harness(Scripted::with(vec![]), Scripted::with(vec![]));
        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.extend(h.dispatcher.enqueue(NotificationEvent::OrderCreated, &both(), payload()).await.unwrap());
        }

        let (tx, rx) = watch::channel(false);
        let handles = h.dispatcher.spawn_workers(rx);
        assert_eq!(handles.len(), 8);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let mut done = 0;
            for id in &ids {
                if h.dispatcher.job(*id).await.unwrap().map(|j| j.status) == Some(JobStatus::Sent) {
                    done += 1;
                }
            }
            if done == ids.len() {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "workers did not drain the queues");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
