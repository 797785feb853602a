//! Whole-input aggregation operator.

use strand_common::{Result, StrandError};
use tracing::debug;

use crate::agg::{AggOps, Aggregator, ColumnAggregator};
use crate::batch::{Batch, BatchBuffer, Schema};
use crate::operator::{check_children_eos_and_eoi, expect_children, Operator, OperatorState};

/// Folds its child's entire output into one summary row.
///
/// One aggregator is built per `(field, ops)` pair from the child's column
/// types; the output schema is the concatenation of their result schemas.
pub struct Aggregate {
    state: OperatorState,
    children: Vec<Box<dyn Operator>>,
    agg_fields: Vec<usize>,
    agg_ops: Vec<AggOps>,
    aggregators: Vec<ColumnAggregator>,
    schema: Option<Schema>,
    emitted: bool,
}

impl Aggregate {
    pub fn new(agg_fields: Vec<usize>, agg_ops: Vec<AggOps>) -> Result<Self> {
        if agg_fields.is_empty() {
            return Err(StrandError::InvalidConfig(
                "aggregate requires at least one field".to_string(),
            ));
        }
        if agg_fields.len() != agg_ops.len() {
            return Err(StrandError::InvalidConfig(format!(
                "aggregate has {} fields but {} op masks",
                agg_fields.len(),
                agg_ops.len()
            )));
        }
        Ok(Self {
            state: OperatorState::default(),
            children: Vec::new(),
            agg_fields,
            agg_ops,
            aggregators: Vec::new(),
            schema: None,
            emitted: false,
        })
    }

    pub fn with_child(mut self, child: Box<dyn Operator>) -> Result<Self> {
        self.set_children(vec![child])?;
        Ok(self)
    }

    fn emit(&mut self) -> Result<Option<Batch>> {
        let schema = self.schema.clone().ok_or_else(|| {
            StrandError::Execution("aggregate pulled without a child".to_string())
        })?;
        let mut buffer = BatchBuffer::with_batch_size(schema, 1);
        let mut column = 0;
        for agg in &self.aggregators {
            column = agg.get_result(&mut buffer, column)?;
        }
        self.emitted = true;
        debug!(operator = "Aggregate", columns = column, "emitted summary row");
        buffer.pop_any()
    }
}

impl Operator for Aggregate {
    fn name(&self) -> &'static str {
        "Aggregate"
    }

    fn state(&self) -> &OperatorState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut OperatorState {
        &mut self.state
    }

    fn children(&self) -> &[Box<dyn Operator>] {
        &self.children
    }

    fn children_mut(&mut self) -> &mut [Box<dyn Operator>] {
        &mut self.children
    }

    fn set_children(&mut self, children: Vec<Box<dyn Operator>>) -> Result<()> {
        expect_children(self.name(), 1, &children)?;
        let child_schema = children[0].schema().ok_or_else(|| {
            StrandError::InvalidConfig("aggregate child has no schema".to_string())
        })?;
        let aggregators = self
            .agg_fields
            .iter()
            .zip(&self.agg_ops)
            .map(|(&field, &ops)| ColumnAggregator::for_column(&child_schema, field, ops))
            .collect::<Result<Vec<_>>>()?;
        let schema = aggregators
            .iter()
            .skip(1)
            .fold(aggregators[0].result_schema().clone(), |acc, a| {
                acc.merge(a.result_schema())
            });
        schema.ensure_unique_names()?;
        self.aggregators = aggregators;
        self.schema = Some(schema);
        self.children = children;
        Ok(())
    }

    fn schema(&self) -> Option<Schema> {
        self.schema.clone()
    }

    fn init(&mut self) -> Result<()> {
        self.aggregators = self.aggregators.iter().map(Aggregator::fresh_copy).collect();
        self.emitted = false;
        Ok(())
    }

    fn fetch_next(&mut self) -> Result<Option<Batch>> {
        if self.emitted {
            return Ok(None);
        }
        let child = self.children.first_mut().ok_or_else(|| {
            StrandError::Execution("aggregate pulled without a child".to_string())
        })?;
        loop {
            match child.next()? {
                Some(batch) => {
                    for agg in &mut self.aggregators {
                        agg.add(&batch)?;
                    }
                }
                None if child.eos() => return self.emit(),
                None => return Ok(None),
            }
        }
    }

    fn check_eos_and_eoi(&mut self) {
        if self.emitted {
            self.state.set_eos();
        } else {
            check_children_eos_and_eoi(self);
        }
    }
}
