//! Source adapters for rill queries.
//!
//! Architecture role:
//! - implements the execution-layer `SourceExecutor` contract for CSV
//!   files, PostgreSQL tables, and Redis hash databases
//! - translates pushed predicates to each source's native query form
//!   (parameterized SQL, per-key lookups)
//!
//! Key modules:
//! - [`csv`]
//! - [`postgres`]
//! - [`redis`]
//! - [`options`]

pub mod csv;
pub mod options;
pub mod postgres;
pub mod redis;

pub use csv::CsvSource;
pub use options::Options;
pub use postgres::PostgresSource;
pub use redis::RedisSource;
