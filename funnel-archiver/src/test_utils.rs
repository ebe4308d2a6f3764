use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use funnel_core::{FunnelArchive, FunnelRecord, HitRow};
use tokio::sync::Mutex;

use crate::error::ArchiverError;
use crate::period::Period;
use crate::store::{ArchiveStore, DefinitionStore, HitSource};

/// In-memory stand-in for the Postgres store.
///
/// A visit belongs to a period when any of its timed hits falls inside it,
/// or when none of its hits carry a time. Archives are kept as blobs so
/// every write and read goes through serialization.
#[derive(Default)]
pub struct MemoryStore {
    pub funnels: Vec<FunnelRecord>,
    pub visits: BTreeMap<i64, Vec<HitRow>>,
    pub conversions: Vec<(i64, i64)>,
    archives: Mutex<HashMap<(i64, Period), Vec<u8>>>,
    fail_hits: AtomicBool,
    page_calls: AtomicUsize,
    conversion_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_funnel(mut self, record: FunnelRecord) -> Self {
        self.funnels.push(record);
        self
    }

    pub fn with_visit(mut self, visit_id: i64, rows: Vec<HitRow>) -> Self {
        let rows = rows
            .into_iter()
            .map(|row| HitRow { visit_id, ..row })
            .collect();
        self.visits.insert(visit_id, rows);
        self
    }

    pub fn with_conversion(mut self, visit_id: i64, goal_id: i64) -> Self {
        self.conversions.push((visit_id, goal_id));
        self
    }

    /// Makes every following hit fetch fail.
    pub fn fail_hits(&self) {
        self.fail_hits.store(true, Ordering::SeqCst);
    }

    pub fn page_calls(&self) -> usize {
        self.page_calls.load(Ordering::SeqCst)
    }

    pub fn conversion_calls(&self) -> usize {
        self.conversion_calls.load(Ordering::SeqCst)
    }

    pub async fn stored_archives(&self) -> usize {
        self.archives.lock().await.len()
    }

    fn in_period(period: &Period, row: &HitRow) -> bool {
        row.timestamp
            .map_or(true, |timestamp| period.start <= timestamp && timestamp < period.end)
    }
}

#[async_trait]
impl DefinitionStore for MemoryStore {
    async fn active_funnels(&self, site_id: i64) -> Result<Vec<FunnelRecord>, ArchiverError> {
        Ok(self
            .funnels
            .iter()
            .filter(|record| record.site_id == site_id && record.active)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl HitSource for MemoryStore {
    async fn visit_page(
        &self,
        _site_id: i64,
        period: &Period,
        after: Option<i64>,
        limit: usize,
    ) -> Result<Vec<i64>, ArchiverError> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .visits
            .iter()
            .filter(|(id, _)| after.map_or(true, |after| **id > after))
            .filter(|(_, rows)| {
                rows.iter().all(|row| row.timestamp.is_none())
                    || rows
                        .iter()
                        .any(|row| row.timestamp.is_some() && Self::in_period(period, row))
            })
            .map(|(id, _)| *id)
            .take(limit)
            .collect())
    }

    async fn hits(
        &self,
        _site_id: i64,
        period: &Period,
        visit_ids: &[i64],
    ) -> Result<Vec<HitRow>, ArchiverError> {
        if self.fail_hits.load(Ordering::SeqCst) {
            return Err(ArchiverError::Query {
                command: "hits".to_string(),
                error: sqlx::Error::PoolTimedOut,
            });
        }

        Ok(visit_ids
            .iter()
            .filter_map(|id| self.visits.get(id))
            .flatten()
            .filter(|row| Self::in_period(period, row))
            .cloned()
            .collect())
    }

    async fn conversions(
        &self,
        _site_id: i64,
        _period: &Period,
        visit_ids: &[i64],
    ) -> Result<Vec<(i64, i64)>, ArchiverError> {
        self.conversion_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .conversions
            .iter()
            .filter(|(visit_id, _)| visit_ids.contains(visit_id))
            .copied()
            .collect())
    }
}

#[async_trait]
impl ArchiveStore for MemoryStore {
    async fn write(&self, period: &Period, archive: &FunnelArchive) -> Result<(), ArchiverError> {
        let blob = archive.to_blob()?;
        self.archives
            .lock()
            .await
            .insert((archive.funnel_id, *period), blob);
        Ok(())
    }

    async fn read(
        &self,
        funnel_id: i64,
        period: &Period,
    ) -> Result<Option<FunnelArchive>, ArchiverError> {
        let archives = self.archives.lock().await;
        Ok(archives
            .get(&(funnel_id, *period))
            .map(|blob| FunnelArchive::from_blob(blob))
            .transpose()?)
    }
}
