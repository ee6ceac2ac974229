//! Fixed record list as an executable node.

use chrono::{DateTime, Utc};

use rill_common::Result;

use crate::exec_node::{
    watermark_max_value, ExecNode, ExecutionContext, MetaSendFn, MetadataMessage, ProduceFn,
};
use crate::record::Record;

/// One element of an in-memory stream.
#[derive(Debug, Clone)]
pub enum StreamElement {
    /// A data record.
    Record(Record),
    /// An explicit watermark.
    Watermark(DateTime<Utc>),
}

/// Bounded node emitting a fixed element sequence.
///
/// Used as the materialization of inline value lists and as the stream
/// fixture of operator tests. Emits the maximum watermark on exhaustion
/// unless constructed with `emit_final_watermark = false`.
pub struct InMemoryStream {
    elements: Vec<StreamElement>,
    emit_final_watermark: bool,
}

impl InMemoryStream {
    /// Stream of plain records followed by the final watermark.
    pub fn new(records: Vec<Record>) -> Self {
        InMemoryStream {
            elements: records.into_iter().map(StreamElement::Record).collect(),
            emit_final_watermark: true,
        }
    }

    /// Stream of records and interleaved explicit watermarks.
    pub fn with_elements(elements: Vec<StreamElement>, emit_final_watermark: bool) -> Self {
        InMemoryStream {
            elements,
            emit_final_watermark,
        }
    }
}

impl ExecNode for InMemoryStream {
    fn name(&self) -> &'static str {
        "InMemoryStream"
    }

    fn produce(
        &self,
        ctx: &ExecutionContext,
        on_record: ProduceFn,
        on_meta: MetaSendFn,
    ) -> Result<()> {
        let pctx = ctx.produce_context();
        for element in &self.elements {
            ctx.cancel.check()?;
            match element {
                StreamElement::Record(record) => on_record(&pctx, record.clone())?,
                StreamElement::Watermark(t) => {
                    on_meta(&pctx, MetadataMessage::Watermark(*t))?
                }
            }
        }
        if self.emit_final_watermark {
            on_meta(&pctx, MetadataMessage::Watermark(watermark_max_value()))?;
        }
        Ok(())
    }
}
