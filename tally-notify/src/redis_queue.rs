use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use tally_shared::{Channel, NotificationJob};

use crate::error::{QueueError, QueueResult};
use crate::queue::{after, revive, JobQueue, SENT_JOB_RETENTION};

/// Redis-backed queue. Per channel there are three sorted sets of job ids:
/// `ready` scored by due time, `leased` scored by lease expiry and `dead`
/// scored by the time the job was parked. Job bodies live under their own key.
#[derive(Clone)]
pub struct RedisQueue {
    client: redis::Client,
    prefix: String,
}

// Moves lapsed leases back to ready, then leases the oldest due job.
const LEASE_SCRIPT: &str = r#"
    local lapsed = redis.call("ZRANGEBYSCORE", KEYS[2], "-inf", ARGV[1])
    for _, id in ipairs(lapsed) do
        redis.call("ZREM", KEYS[2], id)
        redis.call("ZADD", KEYS[1], ARGV[1], id)
    end
    local due = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1], "LIMIT", 0, 1)
    if #due == 0 then
        return false
    end
    redis.call("ZREM", KEYS[1], due[1])
    redis.call("ZADD", KEYS[2], ARGV[2], due[1])
    return due[1]
"#;

impl RedisQueue {
    pub fn new(client: redis::Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }

    fn job_key(&self, id: Uuid) -> String {
        format!("{}:job:{}", self.prefix, id)
    }

    fn lane_key(&self, channel: Channel, lane: &str) -> String {
        format!("{}:{}:{}", self.prefix, channel.as_str(), lane)
    }

    async fn conn(&self) -> QueueResult<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    async fn load(&self, conn: &mut redis::aio::MultiplexedConnection, id: Uuid) -> QueueResult<Option<NotificationJob>> {
        let raw: Option<String> = conn.get(self.job_key(id)).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn enqueue(&self, job: &NotificationJob) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let body = serde_json::to_string(job)?;

        redis::pipe()
            .atomic()
            .set(self.job_key(job.id), body)
            .ignore()
            .zadd(
                self.lane_key(job.channel, "ready"),
                job.id.to_string(),
                job.available_at.timestamp_millis(),
            )
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn dequeue(&self, channel: Channel, visibility: Duration) -> QueueResult<Option<NotificationJob>> {
        let mut conn = self.conn().await?;
        let now = Utc::now();

        let leased: Option<String> = redis::Script::new(LEASE_SCRIPT)
            .key(self.lane_key(channel, "ready"))
            .key(self.lane_key(channel, "leased"))
            .arg(now.timestamp_millis())
            .arg(after(now, visibility).timestamp_millis())
            .invoke_async(&mut conn)
            .await?;

        let Some(raw_id) = leased else {
            return Ok(None);
        };
        let id = Uuid::parse_str(&raw_id).map_err(|e| QueueError::Backend(e.to_string()))?;

        match self.load(&mut conn, id).await? {
            Some(job) => Ok(Some(job)),
            None => {
                // Body expired or was never written; drop the orphaned id
                let _: () = conn.zrem(self.lane_key(channel, "leased"), raw_id).await?;
                debug!("Dropped orphaned job id {}", id);
                Ok(None)
            }
        }
    }

    async fn ack(&self, job: &NotificationJob) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let body = serde_json::to_string(job)?;

        redis::pipe()
            .atomic()
            .zrem(self.lane_key(job.channel, "leased"), job.id.to_string())
            .ignore()
            .set_ex(self.job_key(job.id), body, SENT_JOB_RETENTION.as_secs())
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn retry(&self, job: &NotificationJob, delay: Duration) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let mut stored = job.clone();
        stored.available_at = after(Utc::now(), delay);
        let body = serde_json::to_string(&stored)?;

        redis::pipe()
            .atomic()
            .zrem(self.lane_key(job.channel, "leased"), job.id.to_string())
            .ignore()
            .set(self.job_key(job.id), body)
            .ignore()
            .zadd(
                self.lane_key(job.channel, "ready"),
                job.id.to_string(),
                stored.available_at.timestamp_millis(),
            )
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn dead_letter(&self, job: &NotificationJob) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let body = serde_json::to_string(job)?;

        redis::pipe()
            .atomic()
            .zrem(self.lane_key(job.channel, "leased"), job.id.to_string())
            .ignore()
            .set(self.job_key(job.id), body)
            .ignore()
            .zadd(
                self.lane_key(job.channel, "dead"),
                job.id.to_string(),
                Utc::now().timestamp_millis(),
            )
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn dead_letters(&self, channel: Channel) -> QueueResult<Vec<NotificationJob>> {
        let mut conn = self.conn().await?;
        let ids: Vec<String> = conn.zrange(self.lane_key(channel, "dead"), 0, -1).await?;

        let mut jobs = Vec::with_capacity(ids.len());
        for raw in ids {
            let id = Uuid::parse_str(&raw).map_err(|e| QueueError::Backend(e.to_string()))?;
            if let Some(job) = self.load(&mut conn, id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn replay(&self, job_id: Uuid) -> QueueResult<NotificationJob> {
        let mut conn = self.conn().await?;
        let mut job = self
            .load(&mut conn, job_id)
            .await?
            .ok_or(QueueError::UnknownJob(job_id))?;

        // ZREM is the claim: two concurrent replays cannot both requeue the job
        let removed: i64 = conn.zrem(self.lane_key(job.channel, "dead"), job_id.to_string()).await?;
        if removed == 0 {
            return Err(QueueError::NotDeadLettered(job_id));
        }

        revive(&mut job, Utc::now());
        self.enqueue(&job).await?;
        Ok(job)
    }

    async fn get_job(&self, job_id: Uuid) -> QueueResult<Option<NotificationJob>> {
        let mut conn = self.conn().await?;
        self.load(&mut conn, job_id).await
    }
}
