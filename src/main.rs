use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use job_runner::cluster::KubeCluster;
use job_runner::dispatcher::Dispatcher;
use job_runner::lifecycle::Coordinator;
use job_runner::reconciler::Reconciler;
use job_runner::repository::PgJobStore;
use job_runner::server::{build_router, AppState};
use job_runner::storage::GcsStorage;
use job_runner::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("job_runner={}", config.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting batch job orchestrator...");
    config.validate()?;

    let pool = job_runner::db::create_pool(&config.database.url()).await?;
    job_runner::db::run_migrations(&pool).await?;

    let store: Arc<dyn job_runner::repository::JobStore> = Arc::new(PgJobStore::new(pool));
    let cluster: Arc<dyn job_runner::cluster::BatchCluster> = Arc::new(
        KubeCluster::connect(
            &config.kubernetes,
            &config.google_cloud,
            config.backoff_limit,
        )
        .await?,
    );
    let storage: Arc<dyn job_runner::storage::ObjectStorage> = Arc::new(GcsStorage::new(
        &config.google_cloud,
        config.kubernetes.request_timeout,
    )?);

    let coordinator = Arc::new(Coordinator::new(
        store.clone(),
        cluster.clone(),
        storage.clone(),
    ));

    let (dispatcher, _dispatch_handle) =
        Dispatcher::start(coordinator.clone(), config.provision_workers);

    // a restart must not strand records that never reached the cluster
    dispatcher.requeue_pending(store.as_ref()).await?;

    let reconciler = Reconciler::new(
        store.clone(),
        cluster,
        storage,
        coordinator.clone(),
        config.synchronization_interval,
    );
    tokio::spawn(reconciler.run());

    let app = build_router(AppState {
        store,
        coordinator,
        dispatcher,
    });

    let addr = format!("{}:{}", config.api_host, config.api_port);
    info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
