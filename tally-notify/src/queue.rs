use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use tally_shared::{Channel, JobStatus, NotificationJob};

use crate::error::{QueueError, QueueResult};

/// Durable per-channel job queue.
///
/// A dequeued job is leased, not removed: unless the worker acks, retries or
/// dead-letters it before the visibility timeout lapses, it becomes due again.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: &NotificationJob) -> QueueResult<()>;

    /// Lease the oldest due job of `channel`.
    async fn dequeue(&self, channel: Channel, visibility: Duration) -> QueueResult<Option<NotificationJob>>;

    /// Delivery succeeded; `job` carries its final state.
    async fn ack(&self, job: &NotificationJob) -> QueueResult<()>;

    /// Release the lease and make `job` due again after `delay`.
    async fn retry(&self, job: &NotificationJob, delay: Duration) -> QueueResult<()>;

    /// Park `job` in the channel's dead-letter queue.
    async fn dead_letter(&self, job: &NotificationJob) -> QueueResult<()>;

    async fn dead_letters(&self, channel: Channel) -> QueueResult<Vec<NotificationJob>>;

    /// Move a dead-lettered job back into its live queue with a fresh attempt budget.
    async fn replay(&self, job_id: Uuid) -> QueueResult<NotificationJob>;

    async fn get_job(&self, job_id: Uuid) -> QueueResult<Option<NotificationJob>>;
}

/// How long a delivered job stays queryable before the queue forgets it.
pub(crate) const SENT_JOB_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);

/// Reset a dead-lettered job for another full round of attempts.
pub(crate) fn revive(job: &mut NotificationJob, now: DateTime<Utc>) {
    job.attempts = 0;
    job.status = JobStatus::Queued;
    job.last_error = None;
    job.available_at = now;
    job.updated_at = now;
}

pub(crate) fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    now + chrono::Duration::milliseconds(delay.as_millis() as i64)
}

fn before(now: DateTime<Utc>, span: Duration) -> DateTime<Utc> {
    now - chrono::Duration::milliseconds(span.as_millis() as i64)
}

#[derive(Default)]
struct ChannelLanes {
    /// (due time, job id), oldest first.
    ready: BTreeSet<(DateTime<Utc>, Uuid)>,
    /// job id -> lease expiry
    leased: HashMap<Uuid, DateTime<Utc>>,
    dead: Vec<Uuid>,
}

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<Uuid, NotificationJob>,
    lanes: HashMap<Channel, ChannelLanes>,
    /// (ack time, job id), oldest first.
    sent: VecDeque<(DateTime<Utc>, Uuid)>,
}

impl MemoryState {
    fn lane(&mut self, channel: Channel) -> &mut ChannelLanes {
        self.lanes.entry(channel).or_default()
    }

    /// Drop delivered jobs acked at or before `cutoff`.
    fn evict_sent(&mut self, cutoff: DateTime<Utc>) {
        while let Some(&(sent_at, id)) = self.sent.front() {
            if sent_at > cutoff {
                break;
            }
            self.sent.pop_front();
            self.jobs.remove(&id);
        }
    }
}

/// Single-process queue for tests and deployments without Redis. Jobs do not
/// survive a restart; delivered jobs are forgotten after the retention window.
pub struct MemoryQueue {
    state: Mutex<MemoryState>,
    sent_retention: Duration,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::with_sent_retention(SENT_JOB_RETENTION)
    }

    pub fn with_sent_retention(sent_retention: Duration) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            sent_retention,
        }
    }

    /// Jobs of `channel` waiting or leased, excluding dead letters.
    pub async fn pending(&self, channel: Channel) -> usize {
        let mut state = self.state.lock().await;
        let lane = state.lane(channel);
        lane.ready.len() + lane.leased.len()
    }

    /// Every job still held, in no particular order.
    pub async fn jobs(&self) -> Vec<NotificationJob> {
        self.state.lock().await.jobs.values().cloned().collect()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, job: &NotificationJob) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        state.jobs.insert(job.id, job.clone());
        state.lane(job.channel).ready.insert((job.available_at, job.id));
        Ok(())
    }

    async fn dequeue(&self, channel: Channel, visibility: Duration) -> QueueResult<Option<NotificationJob>> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let lane = state.lane(channel);

        // Leases that lapsed belong to workers that never reported back
        let lapsed: Vec<Uuid> = lane
            .leased
            .iter()
            .filter(|(_, until)| **until <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in lapsed {
            lane.leased.remove(&id);
            lane.ready.insert((now, id));
        }

        let next = match lane.ready.iter().next() {
            Some(&(due, id)) if due <= now => (due, id),
            _ => return Ok(None),
        };
        lane.ready.remove(&next);
        lane.leased.insert(next.1, after(now, visibility));

        Ok(state.jobs.get(&next.1).cloned())
    }

    async fn ack(&self, job: &NotificationJob) -> QueueResult<()> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        state.lane(job.channel).leased.remove(&job.id);
        state.jobs.insert(job.id, job.clone());
        state.sent.push_back((now, job.id));
        state.evict_sent(before(now, self.sent_retention));
        Ok(())
    }

    async fn retry(&self, job: &NotificationJob, delay: Duration) -> QueueResult<()> {
        let due = after(Utc::now(), delay);
        let mut state = self.state.lock().await;
        let lane = state.lane(job.channel);
        lane.leased.remove(&job.id);
        lane.ready.insert((due, job.id));

        let mut stored = job.clone();
        stored.available_at = due;
        state.jobs.insert(job.id, stored);
        Ok(())
    }

    async fn dead_letter(&self, job: &NotificationJob) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        let lane = state.lane(job.channel);
        lane.leased.remove(&job.id);
        if !lane.dead.contains(&job.id) {
            lane.dead.push(job.id);
        }
        state.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn dead_letters(&self, channel: Channel) -> QueueResult<Vec<NotificationJob>> {
        let mut state = self.state.lock().await;
        let ids = state.lane(channel).dead.clone();
        Ok(ids.iter().filter_map(|id| state.jobs.get(id).cloned()).collect())
    }

    async fn replay(&self, job_id: Uuid) -> QueueResult<NotificationJob> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let mut job = state.jobs.get(&job_id).cloned().ok_or(QueueError::UnknownJob(job_id))?;

        let lane = state.lane(job.channel);
        let Some(pos) = lane.dead.iter().position(|id| *id == job_id) else {
            return Err(QueueError::NotDeadLettered(job_id));
        };
        lane.dead.remove(pos);
        lane.ready.insert((now, job_id));

        revive(&mut job, now);
        state.jobs.insert(job_id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, job_id: Uuid) -> QueueResult<Option<NotificationJob>> {
        Ok(self.state.lock().await.jobs.get(&job_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_shared::{NotificationEvent, NotificationPayload};

    fn job(channel: Channel) -> NotificationJob {
        NotificationJob::new(
            channel,
            NotificationEvent::OrderCreated,
            "buyer@example.com",
            NotificationPayload::default(),
        )
    }

    #[tokio::test]
    async fn test_channels_are_independent() {
        let queue = MemoryQueue::new();
        queue.enqueue(&job(Channel::Whatsapp)).await.unwrap();

        let email = queue.dequeue(Channel::Email, Duration::from_secs(30)).await.unwrap();
        assert!(email.is_none());

        let wa = queue.dequeue(Channel::Whatsapp, Duration::from_secs(30)).await.unwrap();
        assert!(wa.is_some());
    }

    #[tokio::test]
    async fn test_leased_job_is_invisible_until_timeout() {
        let queue = MemoryQueue::new();
        let j = job(Channel::Email);
        queue.enqueue(&j).await.unwrap();

        let first = queue.dequeue(Channel::Email, Duration::from_secs(60)).await.unwrap();
        assert_eq!(first.map(|j| j.id), Some(j.id));
        assert!(queue.dequeue(Channel::Email, Duration::from_secs(60)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lapsed_lease_is_redelivered() {
        let queue = MemoryQueue::new();
        let j = job(Channel::Email);
        queue.enqueue(&j).await.unwrap();

        // Worker leases with a zero timeout and never reports back
        queue.dequeue(Channel::Email, Duration::ZERO).await.unwrap();
        let again = queue.dequeue(Channel::Email, Duration::from_secs(60)).await.unwrap();
        assert_eq!(again.map(|j| j.id), Some(j.id));
    }

    #[tokio::test]
    async fn test_retry_delays_visibility() {
        let queue = MemoryQueue::new();
        let mut j = job(Channel::Email);
        queue.enqueue(&j).await.unwrap();
        queue.dequeue(Channel::Email, Duration::from_secs(60)).await.unwrap();

        j.attempts = 1;
        j.status = JobStatus::Retrying;
        queue.retry(&j, Duration::from_secs(3600)).await.unwrap();

        assert!(queue.dequeue(Channel::Email, Duration::from_secs(60)).await.unwrap().is_none());
        let stored = queue.get_job(j.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Retrying);
        assert!(stored.available_at > Utc::now());
    }

    #[tokio::test]
    async fn test_replay_resets_attempts() {
        let queue = MemoryQueue::new();
        let mut j = job(Channel::Whatsapp);
        queue.enqueue(&j).await.unwrap();
        queue.dequeue(Channel::Whatsapp, Duration::from_secs(60)).await.unwrap();

        j.attempts = 5;
        j.status = JobStatus::DeadLettered;
        j.last_error = Some("boom".to_string());
        queue.dead_letter(&j).await.unwrap();
        assert_eq!(queue.dead_letters(Channel::Whatsapp).await.unwrap().len(), 1);

        let replayed = queue.replay(j.id).await.unwrap();
        assert_eq!(replayed.attempts, 0);
        assert_eq!(replayed.status, JobStatus::Queued);
        assert!(queue.dead_letters(Channel::Whatsapp).await.unwrap().is_empty());

        let leased = queue.dequeue(Channel::Whatsapp, Duration::from_secs(60)).await.unwrap();
        assert_eq!(leased.map(|j| j.id), Some(j.id));
    }

    #[tokio::test]
    async fn test_sent_jobs_are_evicted_after_retention() {
        let queue = MemoryQueue::with_sent_retention(Duration::ZERO);
        let mut sent = job(Channel::Email);
        let parked = job(Channel::Email);
        queue.enqueue(&sent).await.unwrap();
        queue.enqueue(&parked).await.unwrap();

        queue.dequeue(Channel::Email, Duration::from_secs(60)).await.unwrap();
        queue.dequeue(Channel::Email, Duration::from_secs(60)).await.unwrap();
        queue.dead_letter(&parked).await.unwrap();

        sent.status = JobStatus::Sent;
        queue.ack(&sent).await.unwrap();

        assert!(queue.get_job(sent.id).await.unwrap().is_none());
        assert!(queue.get_job(parked.id).await.unwrap().is_some());
        assert_eq!(queue.jobs().await.len(), 1);
    }

    #[tokio::test]
    async fn test_sent_jobs_stay_within_retention() {
        let queue = MemoryQueue::new();
        let mut j = job(Channel::Whatsapp);
        queue.enqueue(&j).await.unwrap();
        queue.dequeue(Channel::Whatsapp, Duration::from_secs(60)).await.unwrap();

        j.status = JobStatus::Sent;
        queue.ack(&j).await.unwrap();
        let stored = queue.get_job(j.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Sent);
    }

    #[tokio::test]
    async fn test_replay_requires_dead_letter() {
        let queue = MemoryQueue::new();
        let j = job(Channel::Email);
        queue.enqueue(&j).await.unwrap();

        assert!(matches!(queue.replay(j.id).await, Err(QueueError::NotDeadLettered(_))));
        assert!(matches!(queue.replay(Uuid::new_v4()).await, Err(QueueError::UnknownJob(_))));
    }
}
