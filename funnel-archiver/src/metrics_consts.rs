pub const RUN_STARTS: &str = "funnel_archiver_run_starts";
pub const RUN_TIME: &str = "funnel_archiver_run_time_ms";
pub const RUN_INCOMPLETE: &str = "funnel_archiver_run_incomplete";
pub const PAGES_FETCHED: &str = "funnel_archiver_pages_fetched";
pub const PAGE_FETCH_TIME: &str = "funnel_archiver_page_fetch_time_ms";
pub const PAGE_EVALUATION_TIME: &str = "funnel_archiver_page_evaluation_time_ms";
pub const VISITS_EVALUATED: &str = "funnel_archiver_visits_evaluated";
pub const HITS_FETCHED: &str = "funnel_archiver_hits_fetched";
pub const CONVERSIONS_FETCHED: &str = "funnel_archiver_conversions_fetched";
pub const INVALID_DEFINITIONS: &str = "funnel_archiver_invalid_definitions";
pub const ARCHIVES_WRITTEN: &str = "funnel_archiver_archives_written";
pub const ROLLUP_MISSING_PARTS: &str = "funnel_archiver_rollup_missing_parts";
