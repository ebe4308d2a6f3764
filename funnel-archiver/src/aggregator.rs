use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use funnel_core::hit::{attach_conversions, group_into_visits};
use funnel_core::{evaluate, CompiledFunnel, FunnelDefinition, FunnelMetrics, Visit};
use rayon::prelude::*;
use tracing::{debug, info, instrument, warn};

use crate::error::ArchiverError;
use crate::metrics_consts::{
    CONVERSIONS_FETCHED, HITS_FETCHED, INVALID_DEFINITIONS, PAGES_FETCHED, PAGE_EVALUATION_TIME,
    PAGE_FETCH_TIME, RUN_INCOMPLETE, VISITS_EVALUATED,
};
use crate::period::Period;
use crate::store::{DefinitionStore, HitSource};

#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    pub page_size: usize,
    // None evaluates every page inline
    pub parallel_threshold: Option<usize>,
    // No page is fetched once this has passed
    pub deadline: Option<tokio::time::Instant>,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            page_size: 1000,
            parallel_threshold: None,
            deadline: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub pages: u64,
    pub visits: u64,
    pub hits: u64,
    pub funnels: usize,
    pub complete: bool,
}

#[derive(Debug, Clone)]
pub struct RunOutput {
    pub metrics: BTreeMap<i64, FunnelMetrics>,
    pub summary: RunSummary,
}

/// Loads the site's active funnels. Funnels whose steps don't parse are
/// skipped with a warning so one bad definition can't block the others.
pub async fn load_funnels<S>(store: &S, site_id: i64) -> Result<Vec<FunnelDefinition>, ArchiverError>
where
    S: DefinitionStore + ?Sized,
{
    let records = store.active_funnels(site_id).await?;

    let mut funnels = Vec::with_capacity(records.len());
    for record in records {
        if record.site_id != site_id || !record.active {
            continue;
        }
        let funnel_id = record.id;
        match FunnelDefinition::try_from(record) {
            Ok(funnel) => funnels.push(funnel),
            Err(e) => {
                warn!(funnel_id, error = %e, "skipping funnel with invalid definition");
                metrics::counter!(INVALID_DEFINITIONS).increment(1);
            }
        }
    }

    Ok(funnels)
}

/// Pages through a period's visits and evaluates every funnel against
/// each page, so the hit log is read once however many funnels there are.
pub struct BatchAggregator {
    source: Arc<dyn HitSource + Send + Sync>,
    settings: AggregatorSettings,
}

impl BatchAggregator {
    pub fn new(source: Arc<dyn HitSource + Send + Sync>, settings: AggregatorSettings) -> Self {
        Self { source, settings }
    }

    pub fn settings(&self) -> &AggregatorSettings {
        &self.settings
    }

    fn deadline_passed(&self) -> bool {
        self.settings
            .deadline
            .is_some_and(|deadline| tokio::time::Instant::now() >= deadline)
    }

    /// Aggregates the metrics of every active, non-empty funnel of the site
    /// over `period`. Any fetch failure fails the whole run.
    ///
    /// When the deadline passes between pages, the totals merged so far are
    /// returned with `summary.complete` unset.
    #[instrument(skip_all, fields(site_id = site_id, period = %period))]
    pub async fn run(
        &self,
        site_id: i64,
        funnels: &[FunnelDefinition],
        period: &Period,
    ) -> Result<RunOutput, ArchiverError> {
        let compiled: Vec<CompiledFunnel> = funnels
            .iter()
            .filter(|funnel| funnel.active && funnel.site_id == site_id)
            .filter(|funnel| !funnel.steps.is_empty())
            .cloned()
            .map(CompiledFunnel::compile)
            .collect();

        let mut summary = RunSummary {
            funnels: compiled.len(),
            complete: true,
            ..Default::default()
        };

        if compiled.is_empty() {
            info!("no funnels to evaluate");
            return Ok(RunOutput {
                metrics: BTreeMap::new(),
                summary,
            });
        }

        let needs_conversions = compiled
            .iter()
            .any(|funnel| funnel.definition().is_goal_linked());
        let page_size = self.settings.page_size.max(1);

        let mut totals = empty_totals(&compiled);
        let mut after = None;

        loop {
            if self.deadline_passed() {
                warn!(pages = summary.pages, "deadline passed, stopping early");
                metrics::counter!(RUN_INCOMPLETE).increment(1);
                summary.complete = false;
                break;
            }

            let fetch_start = Instant::now();
            let visit_ids = self
                .source
                .visit_page(site_id, period, after, page_size)
                .await?;
            if visit_ids.is_empty() {
                break;
            }

            let rows = self.source.hits(site_id, period, &visit_ids).await?;
            let hit_count = rows.len() as u64;
            let mut visits = group_into_visits(rows);

            if needs_conversions {
                let conversions = self
                    .source
                    .conversions(site_id, period, &visit_ids)
                    .await?;
                metrics::counter!(CONVERSIONS_FETCHED).increment(conversions.len() as u64);
                attach_conversions(&mut visits, conversions);
            }
            metrics::histogram!(PAGE_FETCH_TIME).record(fetch_start.elapsed().as_millis() as f64);

            summary.pages += 1;
            summary.visits += visit_ids.len() as u64;
            summary.hits += hit_count;
            metrics::counter!(PAGES_FETCHED).increment(1);
            metrics::counter!(HITS_FETCHED).increment(hit_count);
            metrics::counter!(VISITS_EVALUATED).increment(visit_ids.len() as u64);

            let evaluation_start = Instant::now();
            let partial = self.evaluate_page(&compiled, &visits);
            for (total, page) in totals.iter_mut().zip(&partial) {
                total.merge(page);
            }
            metrics::histogram!(PAGE_EVALUATION_TIME)
                .record(evaluation_start.elapsed().as_millis() as f64);

            debug!(
                page = summary.pages,
                visits = visit_ids.len(),
                hits = hit_count,
                "page evaluated"
            );

            if visit_ids.len() < page_size {
                break;
            }
            after = visit_ids.last().copied();
        }

        Ok(RunOutput {
            metrics: totals
                .into_iter()
                .map(|metrics| (metrics.funnel_id, metrics))
                .collect(),
            summary,
        })
    }

    fn evaluate_page(&self, funnels: &[CompiledFunnel], visits: &[Visit]) -> Vec<FunnelMetrics> {
        match self.settings.parallel_threshold {
            Some(threshold) if visits.len() >= threshold => {
                tokio::task::block_in_place(|| evaluate_parallel(funnels, visits))
            }
            _ => evaluate_sequential(funnels, visits),
        }
    }
}

fn empty_totals(funnels: &[CompiledFunnel]) -> Vec<FunnelMetrics> {
    funnels
        .iter()
        .map(|funnel| FunnelMetrics::new(funnel.id(), funnel.step_count()))
        .collect()
}

fn record_visit(totals: &mut [FunnelMetrics], funnels: &[CompiledFunnel], visit: &Visit) {
    for (total, funnel) in totals.iter_mut().zip(funnels) {
        total.record(&evaluate(funnel, visit));
    }
}

pub fn evaluate_sequential(funnels: &[CompiledFunnel], visits: &[Visit]) -> Vec<FunnelMetrics> {
    let mut totals = empty_totals(funnels);
    for visit in visits {
        record_visit(&mut totals, funnels, visit);
    }
    totals
}

/// Same result as [`evaluate_sequential`]; each rayon worker folds into
/// its own accumulators and they are summed at the end.
pub fn evaluate_parallel(funnels: &[CompiledFunnel], visits: &[Visit]) -> Vec<FunnelMetrics> {
    visits
        .par_iter()
        .fold(
            || empty_totals(funnels),
            |mut totals, visit| {
                record_visit(&mut totals, funnels, visit);
                totals
            },
        )
        .reduce(
            || empty_totals(funnels),
            |mut left, right| {
                for (total, other) in left.iter_mut().zip(&right) {
                    total.merge(other);
                }
                left
            },
        )
}
