use funnel_core::{ArchiveError, DefinitionError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArchiverError {
    #[error("config error: {0}")]
    Config(#[from] envconfig::Error),
    #[error("invalid period {value:?}: {reason}")]
    InvalidPeriod { value: String, reason: String },
    #[error("invalid mode {0:?}, expected \"archive\" or \"rollup\"")]
    InvalidMode(String),
    #[error("{command} query failed with: {error}")]
    Query { command: String, error: sqlx::Error },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed with: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Definition(#[from] DefinitionError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error("run stopped at its deadline after {pages} pages, nothing was persisted")]
    DeadlineExceeded { pages: u64 },
}

impl ArchiverError {
    pub fn query(command: &str) -> impl FnOnce(sqlx::Error) -> ArchiverError + '_ {
        move |error| ArchiverError::Query {
            command: command.to_string(),
            error,
        }
    }
}
