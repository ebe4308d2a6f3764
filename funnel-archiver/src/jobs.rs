use std::time::Instant;

use funnel_core::FunnelArchive;
use tracing::{info, instrument, warn};

use crate::aggregator::{load_funnels, BatchAggregator, RunSummary};
use crate::error::ArchiverError;
use crate::metrics_consts::{ARCHIVES_WRITTEN, ROLLUP_MISSING_PARTS, RUN_STARTS, RUN_TIME};
use crate::period::Period;
use crate::store::{ArchiveStore, DefinitionStore};

/// Aggregates one period from raw hits and writes an archive per funnel.
///
/// Nothing is written unless every page was evaluated, so a run cut short
/// by its deadline leaves previously stored archives untouched.
#[instrument(skip_all, fields(site_id = site_id, period = %period))]
pub async fn archive_period<D, A>(
    definitions: &D,
    aggregator: &BatchAggregator,
    archives: &A,
    site_id: i64,
    period: &Period,
    dropoff_limit: usize,
) -> Result<RunSummary, ArchiverError>
where
    D: DefinitionStore + ?Sized,
    A: ArchiveStore + ?Sized,
{
    metrics::counter!(RUN_STARTS).increment(1);
    let start = Instant::now();

    let funnels = load_funnels(definitions, site_id).await?;
    let output = aggregator.run(site_id, &funnels, period).await?;

    if !output.summary.complete {
        return Err(ArchiverError::DeadlineExceeded {
            pages: output.summary.pages,
        });
    }

    for metrics in output.metrics.values() {
        let archive = FunnelArchive::from_metrics(metrics, dropoff_limit);
        archives.write(period, &archive).await?;
        metrics::counter!(ARCHIVES_WRITTEN).increment(1);
    }

    metrics::histogram!(RUN_TIME).record(start.elapsed().as_millis() as f64);
    info!(
        pages = output.summary.pages,
        visits = output.summary.visits,
        hits = output.summary.hits,
        funnels = output.summary.funnels,
        "period archived"
    );

    Ok(output.summary)
}

/// Combines stored archives of `parts` into one archive for `target`, for
/// every active funnel of the site. Returns how many archives were written.
#[instrument(skip_all, fields(site_id = site_id, target = %target, parts = parts.len()))]
pub async fn rollup_periods<D, A>(
    definitions: &D,
    archives: &A,
    site_id: i64,
    target: &Period,
    parts: &[Period],
    dropoff_limit: usize,
) -> Result<usize, ArchiverError>
where
    D: DefinitionStore + ?Sized,
    A: ArchiveStore + ?Sized,
{
    metrics::counter!(RUN_STARTS).increment(1);
    let start = Instant::now();

    for part in parts.iter().filter(|part| !target.contains(part)) {
        warn!(part = %part, "part lies outside the rollup period");
    }

    let funnels = load_funnels(definitions, site_id).await?;
    let mut written = 0;

    for funnel in funnels.iter().filter(|funnel| !funnel.steps.is_empty()) {
        let mut found = Vec::with_capacity(parts.len());
        for part in parts {
            match archives.read(funnel.id, part).await? {
                Some(archive) => found.push(archive),
                None => {
                    warn!(funnel_id = funnel.id, part = %part, "no archive for part, skipping it");
                    metrics::counter!(ROLLUP_MISSING_PARTS).increment(1);
                }
            }
        }

        if let Some(combined) = FunnelArchive::rollup(found, dropoff_limit)? {
            archives.write(target, &combined).await?;
            metrics::counter!(ARCHIVES_WRITTEN).increment(1);
            written += 1;
        }
    }

    metrics::histogram!(RUN_TIME).record(start.elapsed().as_millis() as f64);
    info!(written, "rollup finished");

    Ok(written)
}
