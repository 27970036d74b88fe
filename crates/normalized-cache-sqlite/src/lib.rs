//! SQLite storage for the GraphQL normalized cache.
//!
//! Each record is one row of the `records` table: its key, its fields as JSON and, when the
//! database tracks dates, the receive date of each field as JSON. Whether dates are tracked is
//! decided when the database is created and checked on every open.

mod cache;

pub use cache::SqliteCache;

#[derive(Debug, thiserror::Error)]
pub enum SqliteError {
    #[error("SQLite error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("The database has date tracking set to {database}, it cannot be opened with {requested}")]
    DateTrackingMismatch { database: bool, requested: bool },
}
