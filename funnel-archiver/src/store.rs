use async_trait::async_trait;
use funnel_core::{FunnelArchive, FunnelRecord, HitRow};

use crate::error::ArchiverError;
use crate::period::Period;

/// Read access to stored funnel definitions.
#[async_trait]
pub trait DefinitionStore {
    /// Active funnels of a site, steps not yet validated.
    async fn active_funnels(&self, site_id: i64) -> Result<Vec<FunnelRecord>, ArchiverError>;
}

/// Read access to the hit log.
#[async_trait]
pub trait HitSource {
    /// Up to `limit` ids of visits in `period`, ascending, all greater than `after`.
    async fn visit_page(
        &self,
        site_id: i64,
        period: &Period,
        after: Option<i64>,
        limit: usize,
    ) -> Result<Vec<i64>, ArchiverError>;

    /// Hits of the given visits, grouped by visit and in chronological
    /// order within each visit.
    async fn hits(
        &self,
        site_id: i64,
        period: &Period,
        visit_ids: &[i64],
    ) -> Result<Vec<HitRow>, ArchiverError>;

    /// `(visit_id, goal_id)` pairs of the given visits.
    async fn conversions(
        &self,
        site_id: i64,
        period: &Period,
        visit_ids: &[i64],
    ) -> Result<Vec<(i64, i64)>, ArchiverError>;
}

/// Period-keyed storage of funnel archives. A write replaces whatever was
/// stored for the same funnel and period.
#[async_trait]
pub trait ArchiveStore {
    async fn write(&self, period: &Period, archive: &FunnelArchive) -> Result<(), ArchiverError>;

    async fn read(
        &self,
        funnel_id: i64,
        period: &Period,
    ) -> Result<Option<FunnelArchive>, ArchiverError>;
}
