use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ArchiveError;
use crate::metrics::{FunnelMetrics, StepMetrics};

/// Drop-off URLs beyond the per-step limit are summed under this key.
pub const OTHERS_DROPOFF_KEY: &str = "__others__";

/// One persisted row: a step's counters labelled by its index.
/// The label is the merge key when archives are combined.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct MetricsRow {
    pub label: usize,
    #[serde(flatten)]
    pub metrics: StepMetrics,
}

/// The archived metrics of one funnel over one period.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct FunnelArchive {
    pub funnel_id: i64,
    pub rows: Vec<MetricsRow>,
}

impl FunnelArchive {
    /// One row per step. A `dropoff_limit` of 0 keeps every drop-off URL.
    pub fn from_metrics(metrics: &FunnelMetrics, dropoff_limit: usize) -> Self {
        let rows = metrics
            .steps
            .iter()
            .enumerate()
            .map(|(label, step)| {
                let mut metrics = step.clone();
                truncate_dropoff_urls(&mut metrics.dropoff_urls, dropoff_limit);
                MetricsRow { label, metrics }
            })
            .collect();

        Self {
            funnel_id: metrics.funnel_id,
            rows,
        }
    }

    pub fn to_metrics(&self) -> FunnelMetrics {
        let step_count = self.rows.iter().map(|row| row.label + 1).max().unwrap_or(0);
        let mut metrics = FunnelMetrics::new(self.funnel_id, step_count);
        for row in &self.rows {
            metrics.steps[row.label].merge(&row.metrics);
        }
        metrics
    }

    pub fn to_blob(&self) -> Result<Vec<u8>, ArchiveError> {
        serde_json::to_vec(self).map_err(ArchiveError::Serialize)
    }

    pub fn from_blob(blob: &[u8]) -> Result<Self, ArchiveError> {
        serde_json::from_slice(blob).map_err(ArchiveError::Deserialize)
    }

    /// Sums same-label rows of `other` into this archive, with the same
    /// semantics as merging accumulators during a run.
    pub fn merge(&mut self, other: &FunnelArchive) -> Result<(), ArchiveError> {
        if other.funnel_id != self.funnel_id {
            return Err(ArchiveError::FunnelMismatch {
                expected: self.funnel_id,
                found: other.funnel_id,
            });
        }

        let mut by_label: BTreeMap<usize, StepMetrics> = self
            .rows
            .drain(..)
            .map(|row| (row.label, row.metrics))
            .collect();
        for row in &other.rows {
            by_label.entry(row.label).or_default().merge(&row.metrics);
        }

        self.rows = by_label
            .into_iter()
            .map(|(label, metrics)| MetricsRow { label, metrics })
            .collect();
        Ok(())
    }

    /// Combines archives of the same funnel, e.g. daily ones into a week.
    /// Returns None for no input.
    pub fn rollup(
        archives: impl IntoIterator<Item = FunnelArchive>,
        dropoff_limit: usize,
    ) -> Result<Option<FunnelArchive>, ArchiveError> {
        let mut archives = archives.into_iter();
        let Some(mut combined) = archives.next() else {
            return Ok(None);
        };
        for archive in archives {
            combined.merge(&archive)?;
        }
        for row in &mut combined.rows {
            truncate_dropoff_urls(&mut row.metrics.dropoff_urls, dropoff_limit);
        }
        Ok(Some(combined))
    }
}

/// Keeps the `limit` most frequent URLs (ties broken by URL) and sums the
/// rest under [`OTHERS_DROPOFF_KEY`]. A previous others bucket always
/// stays in the remainder. A limit of 0 disables truncation.
pub fn truncate_dropoff_urls(urls: &mut BTreeMap<String, u64>, limit: usize) {
    if limit == 0 || urls.len() <= limit {
        return;
    }

    let mut others = urls.remove(OTHERS_DROPOFF_KEY).unwrap_or(0);
    let mut ranked: Vec<(String, u64)> = std::mem::take(urls).into_iter().collect();
    ranked.sort_by(|(a_url, a_count), (b_url, b_count)| {
        b_count.cmp(a_count).then_with(|| a_url.cmp(b_url))
    });

    for (index, (url, count)) in ranked.into_iter().enumerate() {
        if index < limit {
            urls.insert(url, count);
        } else {
            others += count;
        }
    }
    if others > 0 {
        urls.insert(OTHERS_DROPOFF_KEY.to_string(), others);
    }
}
