use thiserror::Error;

/// Errors raised while turning stored funnel records into definitions.
#[derive(Error, Debug)]
pub enum DefinitionError {
    #[error("funnel {funnel_id} has invalid steps: {error}")]
    InvalidSteps {
        funnel_id: i64,
        error: serde_json::Error,
    },
    #[error("funnel {funnel_id} has a negative step time limit: {limit}")]
    InvalidTimeLimit { funnel_id: i64, limit: i64 },
}

/// Errors raised while encoding, decoding or merging archived metrics.
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("could not serialize archive: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("could not deserialize archive: {0}")]
    Deserialize(#[source] serde_json::Error),
    #[error("archive of funnel {found} cannot be merged into funnel {expected}")]
    FunnelMismatch { expected: i64, found: i64 },
}
