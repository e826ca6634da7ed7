use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use taskforge_api::app::{build_app, AppServices};
use taskforge_api::config::AppConfig;
use taskforge_infra::{
    InMemoryTaskStore, PoolConfig, PostgresTaskStore, ScheduleEntry, Scheduler, SchedulerConfig,
    TaskStore, TempCleanupHandler, WorkerPool,
};
use taskforge_ratelimit::{RateLimitConfig, StaticSubscriptions};
use taskforge_tasks::TaskType;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    taskforge_observability::init();

    let config = AppConfig::from_env()?;

    let store: Arc<dyn TaskStore> = match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections((config.workers as u32 + 4).max(8))
                .connect(url)
                .await
                .context("failed to connect to DATABASE_URL")?;
            let store = PostgresTaskStore::new(pool, tokio::runtime::Handle::current());
            store.migrate().await.context("failed to create task schema")?;
            info!("using postgres task store");
            Arc::new(store)
        }
        None => {
            warn!("DATABASE_URL not set; tasks are kept in memory and lost on restart");
            Arc::new(InMemoryTaskStore::new())
        }
    };

    let mut pool = WorkerPool::new(store.clone());
    pool.register_handler(
        TaskType::Maintenance,
        TempCleanupHandler::new(config.temp_dir.clone(), config.temp_max_age),
    );
    for task_type in TaskType::ALL {
        if !pool.handles(task_type) {
            warn!(task_type = %task_type, "no handler registered; tasks of this type will fail");
        }
    }
    let pool = pool.spawn(
        PoolConfig::default()
            .with_workers(config.workers)
            .with_poll_interval(config.poll_interval),
    );

    let services = Arc::new(AppServices::new(
        store,
        RateLimitConfig::default(),
        Arc::new(StaticSubscriptions::default()),
    )?);

    let scheduler = Scheduler::new(
        services.tasks.clone(),
        SchedulerConfig::default().with_entry(
            ScheduleEntry::new("temp-cleanup", config.cleanup_interval)
                .with_field("max_age_secs", config.temp_max_age.as_secs()),
        ),
    )?
    .spawn();

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, build_app(services))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("draining workers");
    tokio::task::spawn_blocking(move || {
        scheduler.shutdown();
        pool.shutdown();
    })
    .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
