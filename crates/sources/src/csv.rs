//! CSV file source.
//!
//! Comma-separated only; the reader trims surrounding whitespace of every
//! field. With a header row, columns are named `<alias>.<header>` and must
//! be unique; without one, they are `<alias>.colN` (1-indexed) and the
//! first row is data.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use rill_common::{Result, RillError, Schema, SchemaField, Value};
use rill_execution::exec_node::{
    watermark_max_value, ExecNode, ExecutionContext, MetaSendFn, MetadataMessage, ProduceFn,
};
use rill_execution::materialize::MaterializationContext;
use rill_execution::record::Record;
use rill_execution::source::SourceExecutor;
use rill_planner::{Cardinality, Expression, SourceDescription};

use crate::options::{get_bool_or, get_string, scalar_type, parse_scalar, Options};

/// A CSV file registered as a source.
pub struct CsvSource {
    path: PathBuf,
    header_row: bool,
}

impl CsvSource {
    /// Build from a source option map: `path` (required), `headerRow`
    /// (default true).
    pub fn from_options(options: &Options) -> Result<Self> {
        Ok(CsvSource {
            path: PathBuf::from(get_string(options, "path")?),
            header_row: get_bool_or(options, "headerRow", true)?,
        })
    }

    fn reader(&self) -> Result<csv::Reader<std::fs::File>> {
        csv::ReaderBuilder::new()
            .has_headers(false)
            .trim(csv::Trim::All)
            .flexible(false)
            .from_path(&self.path)
            .map_err(|e| RillError::source(format!("couldn't open {}: {e}", self.path.display())))
    }

    fn column_names(&self) -> Result<Vec<String>> {
        let mut reader = self.reader()?;
        let mut first = csv::StringRecord::new();
        let has_row = reader
            .read_record(&mut first)
            .map_err(|e| RillError::source(format!("couldn't read header row: {e}")))?;
        if !has_row {
            return Err(RillError::source(format!(
                "{} is empty",
                self.path.display()
            )));
        }
        let names: Vec<String> = if self.header_row {
            first.iter().map(str::to_string).collect()
        } else {
            (1..=first.len()).map(|i| format!("col{i}")).collect()
        };
        let mut seen = std::collections::BTreeSet::new();
        for name in &names {
            if !seen.insert(name) {
                return Err(RillError::InvalidConfig(format!(
                    "column names not unique: {name}"
                )));
            }
        }
        Ok(names)
    }
}

impl SourceExecutor for CsvSource {
    fn description(&self) -> SourceDescription {
        SourceDescription {
            primary_keys: vec![],
            available_filters: BTreeMap::new(),
            cardinality: Cardinality::BoundedFitsInLocalStorage,
            time_field: None,
        }
    }

    fn schema(&self) -> Result<Schema> {
        let fields = self
            .column_names()?
            .into_iter()
            .map(|name| SchemaField {
                name,
                typ: scalar_type(),
            })
            .collect();
        Ok(Schema::new(fields))
    }

    fn materialize(
        &self,
        _ctx: &MaterializationContext,
        _pushed: &[Expression],
        alias: &str,
    ) -> Result<Arc<dyn ExecNode>> {
        let fields: Arc<[String]> = self
            .column_names()?
            .into_iter()
            .map(|name| format!("{alias}.{name}"))
            .collect();
        Ok(Arc::new(CsvScanExec {
            source: CsvSource {
                path: self.path.clone(),
                header_row: self.header_row,
            },
            fields,
        }))
    }

    fn push_down_predicates(
        &self,
        new: Vec<Expression>,
        pushed: Vec<Expression>,
    ) -> (Vec<Expression>, Vec<Expression>, bool) {
        // File scans evaluate nothing natively.
        (new, pushed, false)
    }
}

struct CsvScanExec {
    source: CsvSource,
    fields: Arc<[String]>,
}

impl ExecNode for CsvScanExec {
    fn name(&self) -> &'static str {
        "CsvScan"
    }

    fn produce(
        &self,
        ctx: &ExecutionContext,
        on_record: ProduceFn,
        on_meta: MetaSendFn,
    ) -> Result<()> {
        debug!(path = %self.source.path.display(), "csv scan start");
        let pctx = ctx.produce_context();
        let mut reader = self.source.reader()?;
        let mut row = csv::StringRecord::new();
        let mut first = true;

        loop {
            ctx.cancel.check()?;
            let has_row = reader
                .read_record(&mut row)
                .map_err(|e| RillError::source(format!("couldn't read record: {e}")))?;
            if !has_row {
                break;
            }
            if first && self.source.header_row {
                first = false;
                continue;
            }
            first = false;
            if row.len() != self.fields.len() {
                return Err(RillError::source(format!(
                    "row has {} fields, expected {}",
                    row.len(),
                    self.fields.len()
                )));
            }
            let values: Vec<Value> = row.iter().map(parse_scalar).collect();
            on_record(&pctx, Record::new(Arc::clone(&self.fields), values))?;
        }

        on_meta(&pctx, MetadataMessage::Watermark(watermark_max_value()))?;
        debug!(path = %self.source.path.display(), "csv scan done");
        Ok(())
    }
}
