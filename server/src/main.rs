mod config;
mod unconfigured;
mod webhook_listener;

use std::sync::Arc;

use mediaforge_core::gateway::CompletionGateway;
use mediaforge_core::handlers::{Dispatcher, HandlerDeps};
use mediaforge_core::orchestrator::Orchestrator;
use mediaforge_core::provider::HttpMediaService;
use mediaforge_core::queue::Queue;
use mediaforge_core::queue_memory::MemoryQueue;
use mediaforge_core::store::ExecutionStore;
use mediaforge_core::store_memory::MemoryExecutionStore;
use mediaforge_core::types::OperationKind;
use mediaforge_core::webhook::WebhookDispatcher;
use mediaforge_core::worker::PipelineWorker;
use tracing_subscriber::EnvFilter;

use config::Config;
use unconfigured::{UnconfiguredProvider, UnconfiguredStorage};

const ALL_OPERATIONS: &[OperationKind] = &[
    OperationKind::Generate,
    OperationKind::GenerateImage,
    OperationKind::GenerateAudio,
    OperationKind::Transcribe,
    OperationKind::Merge,
    OperationKind::Layer,
    OperationKind::AddSubtitles,
    OperationKind::Reframe,
    OperationKind::LipSync,
    OperationKind::RemoveBackground,
    OperationKind::RemoveImageBackground,
];

/// Workers spawned per operation topic, for parallelism within a topic
/// (spec §4.5 "Concurrency model").
const WORKERS_PER_TOPIC: usize = 2;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let config = Config::from_env_and_args();

    let (store, queue): (Arc<dyn ExecutionStore>, Arc<dyn Queue>) = match &config.database_url {
        #[cfg(feature = "postgres")]
        Some(url) => {
            tracing::info!("connecting to PostgreSQL");
            let pool = sqlx::PgPool::connect(url).await?;
            let pg_store = mediaforge_core::store_postgres::PostgresExecutionStore::new(pool.clone());
            pg_store.migrate().await?;
            let pg_queue = mediaforge_core::queue_postgres::PostgresQueue::new(pool);
            tracing::info!("using PostgresExecutionStore + PostgresQueue (migrations applied)");
            (Arc::new(pg_store), Arc::new(pg_queue))
        }
        #[cfg(not(feature = "postgres"))]
        Some(_) => {
            tracing::warn!("database URL configured but postgres feature not enabled, using in-memory backends");
            (
                Arc::new(MemoryExecutionStore::new()),
                Arc::new(MemoryQueue::new()),
            )
        }
        None => {
            tracing::info!("no database URL configured, using in-memory backends");
            (
                Arc::new(MemoryExecutionStore::new()),
                Arc::new(MemoryQueue::new()),
            )
        }
    };

    let orchestrator = Arc::new(Orchestrator::new(store.clone(), queue.clone()));

    let handler_deps = HandlerDeps {
        provider: Arc::new(UnconfiguredProvider),
        storage: Arc::new(UnconfiguredStorage),
        media: Arc::new(HttpMediaService::new(config.media_service_url.clone())),
    };
    let callback_base_url = config.public_base_url.clone();
    let dispatcher = Dispatcher::new(handler_deps.clone(), callback_base_url);

    // Recovery bootstrap (spec §4.4 "Recovery"): re-invoke emitReadyJobs
    // for every non-terminal execution left over from a previous run.
    for execution_id in store.list_non_terminal_executions().await? {
        if let Some(execution) = store.load_execution(execution_id).await? {
            if let Err(e) = orchestrator
                .emit_ready_jobs(execution_id, execution.base_execution_id)
                .await
            {
                tracing::error!(execution_id = %execution_id, error = %e, "recovery emit failed");
            }
        }
    }

    // One PipelineWorker loop per operation topic, N instances each.
    for operation in ALL_OPERATIONS {
        let handler = dispatcher.handler_for(*operation);
        for _ in 0..WORKERS_PER_TOPIC {
            let worker = PipelineWorker::new(
                operation.topic(),
                queue.clone(),
                store.clone(),
                orchestrator.clone(),
                handler.clone(),
            );
            tokio::spawn(async move { worker.run().await });
        }
    }

    // Async Completion Gateway (C7): the poller half. The webhook-callback
    // half is the axum route below, sharing the same gateway instance.
    let gateway = Arc::new(CompletionGateway::new(
        store.clone(),
        queue.clone(),
        orchestrator.clone(),
        handler_deps.storage.clone(),
    ));
    if config.poll_enabled {
        let poller_gateway = gateway.clone();
        let poller_provider = handler_deps.provider.clone();
        tokio::spawn(async move { poller_gateway.run_poller(poller_provider).await });
    }

    // Queue archival sweep (spec §4.1(d)): periodically mark tickets past
    // their `expires_at` as expired, on the same cadence as the poller.
    {
        let archival_queue = queue.clone();
        tokio::spawn(async move {
            loop {
                match archival_queue.archive_expired().await {
                    Ok(0) => {}
                    Ok(n) => tracing::info!(count = n, "archived expired queue tickets"),
                    Err(e) => tracing::error!(error = %e, "queue archival sweep failed"),
                }
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            }
        });
    }

    // Webhook Dispatcher (C8): one loop per internal delivery topic.
    let execution_dispatcher = WebhookDispatcher::new(
        mediaforge_core::queue::TOPIC_WEBHOOK_DELIVERY,
        store.clone(),
        queue.clone(),
    );
    tokio::spawn(async move { execution_dispatcher.run().await });
    let job_dispatcher = WebhookDispatcher::new(
        mediaforge_core::queue::TOPIC_JOB_WEBHOOK_DELIVERY,
        store.clone(),
        queue.clone(),
    );
    tokio::spawn(async move { job_dispatcher.run().await });

    let listener_state = webhook_listener::WebhookListenerState {
        gateway,
        callback_secret: std::env::var("PROVIDER_CALLBACK_SECRET").ok(),
    };
    let app = webhook_listener::router(listener_state);
    let listener = tokio::net::TcpListener::bind(&config.webhook_listen_addr).await?;
    tracing::info!(addr = %config.webhook_listen_addr, "completion callback listener started");
    axum::serve(listener, app).await?;

    Ok(())
}
