use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tally_api::{app, AppState, AuthConfig};
use tally_core::{RateLimiter, Store};
use tally_notify::{
    DispatcherMetrics, DispatcherSettings, HttpEmailProvider, JobQueue, MemoryQueue,
    NotificationDispatcher, RedisQueue, WhatsAppCloudProvider,
};
use tally_order::{ApprovalTokenService, MachineSettings, OrderStateMachine, ReceiptPolicy};
use tally_store::app_config::{Config, QueueBackend, StorageBackend};
use tally_store::{LocalStore, MemoryRateLimiter, PgStore, RedisRateLimiter};

/// Multipart framing on top of the receipt itself.
const UPLOAD_OVERHEAD_BYTES: usize = 64 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tally_api=debug,tally_notify=info,tower_http=debug,axum::rejection=trace".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().context("Failed to load config")?;
    tracing::info!("Starting Tally API on port {}", config.server.port);

    let store: Arc<dyn Store> = match config.storage.backend {
        StorageBackend::Postgres => {
            let url = config
                .storage
                .database_url
                .as_deref()
                .context("storage.database_url is required for the postgres backend")?;
            let pg = PgStore::connect(url, config.storage.max_connections)
                .await
                .context("Failed to connect to Postgres")?;
            pg.migrate().await.context("Failed to run migrations")?;
            Arc::new(pg)
        }
        StorageBackend::Local => match &config.storage.snapshot_path {
            Some(path) => Arc::new(LocalStore::open(path).await.context("Failed to open local store")?),
            None => {
                tracing::warn!("Local store without snapshot path; state is lost on restart");
                Arc::new(LocalStore::in_memory())
            }
        },
    };

    let uploads = &config.uploads;
    let (queue, upload_limiter): (Arc<dyn JobQueue>, Arc<dyn RateLimiter>) = match config.queue.backend {
        QueueBackend::Redis => {
            let client = redis::Client::open(config.redis.url.as_str()).context("Invalid Redis URL")?;
            (
                Arc::new(RedisQueue::new(client.clone(), config.queue.key_prefix.clone())),
                Arc::new(RedisRateLimiter::new(
                    client,
                    uploads.rate_limit_attempts,
                    uploads.rate_limit_window_secs,
                )),
            )
        }
        QueueBackend::Memory => {
            tracing::warn!("In-memory notification queue; pending jobs are lost on restart");
            (
                Arc::new(MemoryQueue::new()),
                Arc::new(MemoryRateLimiter::new(
                    uploads.rate_limit_attempts,
                    Duration::from_secs(uploads.rate_limit_window_secs.max(0) as u64),
                )),
            )
        }
    };

    let notifications = &config.notifications;
    let email = HttpEmailProvider::new(
        &notifications.email.endpoint,
        &notifications.email.api_key,
        &notifications.email.from,
    )?;
    let whatsapp = WhatsAppCloudProvider::new(
        &notifications.whatsapp.endpoint,
        &notifications.whatsapp.access_token,
        &notifications.whatsapp.phone_number_id,
        &notifications.whatsapp.template_language,
    )?;

    let registry = prometheus::Registry::new();
    let metrics = DispatcherMetrics::register(&registry)?;

    let dispatcher = Arc::new(
        NotificationDispatcher::new(
            queue,
            store.clone(),
            Arc::new(email),
            Arc::new(whatsapp),
            DispatcherSettings {
                email_concurrency: notifications.email_concurrency,
                whatsapp_concurrency: notifications.whatsapp_concurrency,
                max_attempts: notifications.max_attempts,
                base_backoff: Duration::from_millis(notifications.base_backoff_ms),
                max_backoff: Duration::from_millis(notifications.max_backoff_ms),
                visibility_timeout: Duration::from_secs(notifications.visibility_timeout_secs),
                poll_interval: Duration::from_millis(notifications.poll_interval_ms),
            },
        )
        .with_metrics(metrics),
    );

    let approval = &config.approval;
    let tokens = Arc::new(ApprovalTokenService::new(
        approval.token_secret.as_bytes(),
        approval.token_ttl_hours,
    ));
    let orders = Arc::new(OrderStateMachine::new(
        store.clone(),
        tokens,
        dispatcher.clone(),
        MachineSettings {
            admin_email: approval.admin_email.clone(),
            admin_origin: approval.admin_origin.clone(),
            public_base_url: approval.public_base_url.clone(),
            currency: config.server.currency.clone(),
            receipts: ReceiptPolicy {
                allowed_extensions: uploads.allowed_extensions.clone(),
                max_bytes: uploads.max_bytes,
            },
        },
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = dispatcher.spawn_workers(shutdown_rx);
    tracing::info!("Started {} notification workers", workers.len());

    let app_state = AppState {
        store,
        orders,
        dispatcher,
        upload_limiter,
        upload_body_limit: uploads.max_bytes + UPLOAD_OVERHEAD_BYTES,
        auth: AuthConfig {
            secret: config.auth.jwt_secret.clone(),
            expiration: config.auth.jwt_expiration_seconds,
        },
        registry,
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app(app_state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutdown signal received");
    })
    .await?;

    // Let in-flight deliveries finish
    let _ = shutdown_tx.send(true);
    for worker in workers {
        let _ = worker.await;
    }
    tracing::info!("Notification workers stopped");

    Ok(())
}
