use std::sync::Arc;

use envconfig::Envconfig;
use eyre::Result;
use funnel_archiver::{
    aggregator::BatchAggregator,
    config::{Config, Mode},
    jobs::{archive_period, rollup_periods},
    pg::PgStore,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();

    let config = Config::init_from_env()?;
    let period = config.period()?;
    let mode = config.mode()?;

    info!(site_id = config.site_id, %period, ?mode, "starting funnel archiver");

    let store = PgStore::new(&config.database_url, config.max_pg_connections).await?;
    if config.run_migrations {
        store.run_migrations().await?;
    }

    match mode {
        Mode::Archive => {
            let aggregator =
                BatchAggregator::new(Arc::new(store.clone()), config.aggregator_settings());
            let summary = archive_period(
                &store,
                &aggregator,
                &store,
                config.site_id,
                &period,
                config.dropoff_url_limit,
            )
            .await?;
            info!(
                pages = summary.pages,
                visits = summary.visits,
                hits = summary.hits,
                funnels = summary.funnels,
                "archive run finished"
            );
        }
        Mode::Rollup => {
            let parts = config.rollup_parts()?;
            let written = rollup_periods(
                &store,
                &store,
                config.site_id,
                &period,
                &parts,
                config.dropoff_url_limit,
            )
            .await?;
            info!(written, "rollup run finished");
        }
    }

    Ok(())
}
