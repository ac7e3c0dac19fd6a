use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use flowdesk_backend::config::Config;
use flowdesk_backend::jobs::JobScheduler;
use flowdesk_backend::{database, postgres_runtime, router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let db_pool = database::connect(&config.database_url, &config.pool).await?;

    database::migrate(&db_pool).await?;

    let runtime = postgres_runtime(db_pool.clone(), &config.smtp);
    let state = AppState::new(runtime, Duration::from_secs(config.jobs.schedule_row_timeout_secs))
        .with_pool(db_pool);

    let jobs = Arc::new(JobScheduler::new(state.schedules.clone(), config.jobs.clone()).await?);
    jobs.start().await?;
    let app_state = Arc::new(state.with_jobs(jobs.clone()));

    let app = router(app_state);

    let listener = tokio::net::TcpListener::bind(&config.server_addr).await?;
    tracing::info!("Server running on {}", config.server_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    jobs.shutdown().await?;

    Ok(())
}
