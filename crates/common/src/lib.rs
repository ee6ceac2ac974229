#![deny(missing_docs)]

//! Shared configuration, error types, cancellation, and the value model for
//! rill crates.
//!
//! Architecture role:
//! - defines the dynamically typed [`Value`]/[`Type`] data model every layer
//!   exchanges
//! - provides common [`RillError`] / [`Result`] contracts
//! - hosts engine configuration and the root cancellation token
//!
//! Key modules:
//! - [`value`]
//! - [`types`]
//! - [`config`]
//! - [`error`]
//! - [`cancel`]

/// Cooperative cancellation token.
pub mod cancel;
/// Shared engine/runtime configuration types.
pub mod config;
/// Shared error taxonomy.
pub mod error;
/// Type descriptors and source schemas.
pub mod types;
/// The tagged runtime value model.
pub mod value;

pub use cancel::CancelToken;
pub use config::{EngineConfig, LateRecordPolicy};
pub use error::{Result, RillError};
pub use types::{Schema, SchemaField, Type};
pub use value::{TypeId, Value};
