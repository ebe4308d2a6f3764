pub mod aggregator;
pub mod config;
pub mod error;
pub mod jobs;
pub mod metrics_consts;
pub mod period;
pub mod pg;
pub mod store;

// Used by this crate's integration tests
pub mod test_utils;
