//! Embedded query engine.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use rill_common::{CancelToken, EngineConfig, Result, RillError};
use rill_execution::exec_node::{discard_meta, ExecutionContext};
use rill_execution::materialize::{materialize, MaterializationContext};
use rill_execution::record::Record;
use rill_execution::source::SourceExecutor;
use rill_planner::{
    default_scenarios, explain_physical, optimize, LogicalPlan, PlanContext, Scenario,
    SourceDescription, SourceResolver,
};

/// Registry of sources plus the full plan-optimize-materialize-run
/// pipeline.
pub struct Engine {
    sources: HashMap<String, Arc<dyn SourceExecutor>>,
    config: EngineConfig,
    scenarios: Vec<Scenario>,
}

impl Engine {
    /// Engine with the default optimizer scenario list.
    pub fn new(config: EngineConfig) -> Self {
        Engine {
            sources: HashMap::new(),
            config,
            scenarios: default_scenarios(),
        }
    }

    /// Register a source under a name queries refer to.
    pub fn register_source(&mut self, name: impl Into<String>, source: Arc<dyn SourceExecutor>) {
        self.sources.insert(name.into(), source);
    }

    /// Lower a logical plan and run the optimizer to fixpoint.
    pub fn plan(&self, logical: &LogicalPlan) -> Result<rill_planner::Node> {
        let ctx = PlanContext { resolver: self };
        let (merged, _free_variables) = logical.to_physical_merged(&ctx)?;
        let optimized = optimize(&self.scenarios, merged);
        debug!(plan = %explain_physical(&optimized), "optimized physical plan");
        Ok(optimized)
    }

    /// Plan, materialize and drive the query, invoking `on_record` for
    /// every produced record.
    pub fn run(
        &self,
        logical: &LogicalPlan,
        cancel: CancelToken,
        mut on_record: impl FnMut(&Record) -> Result<()>,
    ) -> Result<()> {
        let physical = self.plan(logical)?;
        let materialization = MaterializationContext {
            sources: self.sources.clone(),
            config: self.config.clone(),
        };
        let executable = materialize(&physical, &materialization)?;
        let ctx = ExecutionContext::new(cancel);
        executable.produce(
            &ctx,
            &mut |_pctx, record| on_record(&record),
            &mut discard_meta,
        )
    }

    /// Run a bounded query and collect its output records.
    pub fn collect(&self, logical: &LogicalPlan) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        self.run(logical, CancelToken::new(), |record| {
            records.push(record.clone());
            Ok(())
        })?;
        Ok(records)
    }
}

impl SourceResolver for Engine {
    fn describe(&self, name: &str) -> Result<SourceDescription> {
        self.sources
            .get(name)
            .map(|source| source.description())
            .ok_or_else(|| RillError::Plan(format!("unknown source: {name}")))
    }
}
