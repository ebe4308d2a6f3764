use async_trait::async_trait;
use chrono::{DateTime, Utc};
use funnel_core::{FunnelArchive, FunnelRecord, HitRow};
use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::instrument;

use crate::error::ArchiverError;
use crate::period::Period;
use crate::store::{ArchiveStore, DefinitionStore, HitSource};

/// Postgres-backed definition store, hit source and archive store.
///
/// Hits are read from the action log tables (`log_visit`,
/// `log_link_visit_action`, `log_action`, `log_conversion`), which belong
/// to the tracker. Only `funnel_archive` is owned by this service.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct FunnelRow {
    id: i64,
    site_id: i64,
    name: String,
    steps: serde_json::Value,
    goal_id: Option<i64>,
    active: bool,
    strict_mode: bool,
    step_time_limit_seconds: i32,
}

impl From<FunnelRow> for FunnelRecord {
    fn from(row: FunnelRow) -> Self {
        FunnelRecord {
            id: row.id,
            site_id: row.site_id,
            name: row.name,
            steps: row.steps,
            goal_id: row.goal_id,
            active: row.active,
            strict_mode: row.strict_mode,
            step_time_limit_seconds: i64::from(row.step_time_limit_seconds),
        }
    }
}

#[derive(sqlx::FromRow)]
struct HitRecord {
    visit_id: i64,
    server_time: Option<DateTime<Utc>>,
    url: Option<String>,
    url_type: Option<i16>,
    name: Option<String>,
    name_type: Option<i16>,
    event_category: Option<String>,
    event_action: Option<String>,
}

impl From<HitRecord> for HitRow {
    fn from(record: HitRecord) -> Self {
        HitRow {
            visit_id: record.visit_id,
            timestamp: record.server_time,
            url: record.url,
            url_action_type: record.url_type,
            name: record.name,
            name_action_type: record.name_type,
            event_category: record.event_category,
            event_action: record.event_action,
        }
    }
}

const FUNNELS_QUERY: &str = r#"
SELECT id, site_id, name, steps, goal_id, active, strict_mode, step_time_limit_seconds
FROM funnel_definition
WHERE site_id = $1 AND active AND NOT deleted
ORDER BY id"#;

const VISIT_PAGE_QUERY: &str = r#"
SELECT idvisit
FROM log_visit
WHERE idsite = $1
  AND visit_last_action_time >= $2
  AND visit_first_action_time < $3
  AND ($4::bigint IS NULL OR idvisit > $4)
ORDER BY idvisit
LIMIT $5"#;

// Ties on server_time fall back to log order; hits without a time sort last
const HITS_QUERY: &str = r#"
SELECT
    lva.idvisit AS visit_id,
    lva.server_time,
    url_action.name AS url,
    url_action.type AS url_type,
    name_action.name AS name,
    name_action.type AS name_type,
    category_action.name AS event_category,
    event_action.name AS event_action
FROM log_link_visit_action lva
LEFT JOIN log_action url_action ON url_action.idaction = lva.idaction_url
LEFT JOIN log_action name_action ON name_action.idaction = lva.idaction_name
LEFT JOIN log_action category_action ON category_action.idaction = lva.idaction_event_category
LEFT JOIN log_action event_action ON event_action.idaction = lva.idaction_event_action
WHERE lva.idsite = $1
  AND lva.idvisit = ANY($2)
  AND (lva.server_time IS NULL OR (lva.server_time >= $3 AND lva.server_time < $4))
ORDER BY lva.idvisit, lva.server_time, lva.idlink_va"#;

const CONVERSIONS_QUERY: &str = r#"
SELECT idvisit, idgoal
FROM log_conversion
WHERE idsite = $1
  AND idvisit = ANY($2)
  AND server_time >= $3
  AND server_time < $4"#;

const WRITE_ARCHIVE_QUERY: &str = r#"
INSERT INTO funnel_archive (funnel_id, period_start, period_end, blob, archived_at)
VALUES ($1, $2, $3, $4, NOW())
ON CONFLICT (funnel_id, period_start, period_end)
DO UPDATE SET blob = EXCLUDED.blob, archived_at = EXCLUDED.archived_at"#;

const READ_ARCHIVE_QUERY: &str = r#"
SELECT blob
FROM funnel_archive
WHERE funnel_id = $1 AND period_start = $2 AND period_end = $3"#;

impl PgStore {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self, ArchiverError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_migrations(&self) -> Result<(), ArchiverError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl DefinitionStore for PgStore {
    #[instrument(skip_all, fields(site_id = site_id))]
    async fn active_funnels(&self, site_id: i64) -> Result<Vec<FunnelRecord>, ArchiverError> {
        let rows = sqlx::query_as::<_, FunnelRow>(FUNNELS_QUERY)
            .bind(site_id)
            .fetch_all(&self.pool)
            .await
            .map_err(ArchiverError::query("active_funnels"))?;

        Ok(rows.into_iter().map(FunnelRecord::from).collect())
    }
}

#[async_trait]
impl HitSource for PgStore {
    #[instrument(skip_all, fields(site_id = site_id, after = ?after, limit = limit))]
    async fn visit_page(
        &self,
        site_id: i64,
        period: &Period,
        after: Option<i64>,
        limit: usize,
    ) -> Result<Vec<i64>, ArchiverError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        sqlx::query_scalar::<_, i64>(VISIT_PAGE_QUERY)
            .bind(site_id)
            .bind(period.start)
            .bind(period.end)
            .bind(after)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(ArchiverError::query("visit_page"))
    }

    #[instrument(skip_all, fields(site_id = site_id, visits = visit_ids.len()))]
    async fn hits(
        &self,
        site_id: i64,
        period: &Period,
        visit_ids: &[i64],
    ) -> Result<Vec<HitRow>, ArchiverError> {
        let records = sqlx::query_as::<_, HitRecord>(HITS_QUERY)
            .bind(site_id)
            .bind(visit_ids)
            .bind(period.start)
            .bind(period.end)
            .fetch_all(&self.pool)
            .await
            .map_err(ArchiverError::query("hits"))?;

        Ok(records.into_iter().map(HitRow::from).collect())
    }

    #[instrument(skip_all, fields(site_id = site_id, visits = visit_ids.len()))]
    async fn conversions(
        &self,
        site_id: i64,
        period: &Period,
        visit_ids: &[i64],
    ) -> Result<Vec<(i64, i64)>, ArchiverError> {
        sqlx::query_as::<_, (i64, i64)>(CONVERSIONS_QUERY)
            .bind(site_id)
            .bind(visit_ids)
            .bind(period.start)
            .bind(period.end)
            .fetch_all(&self.pool)
            .await
            .map_err(ArchiverError::query("conversions"))
    }
}

#[async_trait]
impl ArchiveStore for PgStore {
    #[instrument(skip_all, fields(funnel_id = archive.funnel_id, period = %period))]
    async fn write(&self, period: &Period, archive: &FunnelArchive) -> Result<(), ArchiverError> {
        let blob = archive.to_blob()?;
        sqlx::query(WRITE_ARCHIVE_QUERY)
            .bind(archive.funnel_id)
            .bind(period.start)
            .bind(period.end)
            .bind(blob)
            .execute(&self.pool)
            .await
            .map_err(ArchiverError::query("write_archive"))?;
        Ok(())
    }

    #[instrument(skip_all, fields(funnel_id = funnel_id, period = %period))]
    async fn read(
        &self,
        funnel_id: i64,
        period: &Period,
    ) -> Result<Option<FunnelArchive>, ArchiverError> {
        let blob = sqlx::query_scalar::<_, Vec<u8>>(READ_ARCHIVE_QUERY)
            .bind(funnel_id)
            .bind(period.start)
            .bind(period.end)
            .fetch_optional(&self.pool)
            .await
            .map_err(ArchiverError::query("read_archive"))?;

        Ok(blob
            .map(|blob| FunnelArchive::from_blob(&blob))
            .transpose()?)
    }
}
