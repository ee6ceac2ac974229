//! Logical and physical planning stack for rill query execution.
//!
//! Architecture role:
//! - the logical algebra produced by the query frontend
//! - logical-to-physical lowering with shuffle insertion
//! - the physical plan model with pushdown metadata
//! - the scenario-based fixpoint optimizer
//!
//! Key modules:
//! - [`logical`]
//! - [`physical`]
//! - [`optimizer`]
//! - [`explain`]

pub mod explain;
pub mod logical;
pub mod optimizer;
pub mod physical;

pub use explain::{explain_logical, explain_physical};
pub use logical::{
    AggregateSpec, Expr, LogicalPlan, NamedExpr, PlanContext, SourceDescription, SourceResolver,
};
pub use optimizer::{
    default_scenarios, optimize, Scenario, MERGE_DATA_SOURCE_BUILDER_WITH_FILTER,
    MERGE_DATA_SOURCE_BUILDER_WITH_REQUALIFIER, MERGE_FILTERS, MERGE_REQUALIFIERS,
};
pub use physical::{
    AggregateKind, Cardinality, DataSourceBuilder, Expression, FieldType, FilterCapabilities,
    GroupBy, NamedExpression, Node, NodeMetadata, Relation, Shuffle, ShuffleStrategy, TriggerSpec,
};
