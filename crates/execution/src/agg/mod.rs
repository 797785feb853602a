//! Streaming per-column aggregation.
//!
//! An aggregator consumes batches one at a time and keeps running
//! statistics for a single column. Results are emitted as one row fragment
//! into a [`BatchBuffer`], one column per enabled operation, in the fixed
//! order COUNT, MIN, MAX, SUM, AVG, STDEV.

mod numeric;

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};
use strand_common::{Result, StrandError};

use crate::batch::{Batch, BatchBuffer, ColumnType, Schema};

pub use numeric::{
    AggValue, DoubleAggregator, FloatAggregator, IntAggregator, LongAggregator, NumericAggregator,
};

/// Bitmask of aggregate operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct AggOps(u8);

impl AggOps {
    pub const NONE: AggOps = AggOps(0);
    pub const COUNT: AggOps = AggOps(0x01);
    pub const MIN: AggOps = AggOps(0x02);
    pub const MAX: AggOps = AggOps(0x04);
    pub const SUM: AggOps = AggOps(0x08);
    pub const AVG: AggOps = AggOps(0x10);
    pub const STDEV: AggOps = AggOps(0x20);
    /// Everything a numeric column supports.
    pub const ALL_NUMERIC: AggOps = AggOps(0x3f);

    /// Emission order, with the result column prefix of each op.
    pub const ORDER: [(AggOps, &'static str); 6] = [
        (AggOps::COUNT, "count"),
        (AggOps::MIN, "min"),
        (AggOps::MAX, "max"),
        (AggOps::SUM, "sum"),
        (AggOps::AVG, "avg"),
        (AggOps::STDEV, "stdev"),
    ];

    pub const fn from_bits(bits: u8) -> Self {
        AggOps(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: AggOps) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Enabled ops with their result prefixes, in emission order.
    pub fn enabled(self) -> impl Iterator<Item = (AggOps, &'static str)> {
        Self::ORDER
            .into_iter()
            .filter(move |(op, _)| self.contains(*op))
    }

    /// Validate a requested mask against what an aggregator supports.
    pub fn validate_against(self, available: AggOps) -> Result<()> {
        if self.is_empty() {
            return Err(StrandError::InvalidConfig(
                "no aggregate operation selected".to_string(),
            ));
        }
        if !available.contains(self) {
            return Err(StrandError::InvalidConfig(format!(
                "unsupported aggregate operations {self} (available: {available})"
            )));
        }
        Ok(())
    }
}

impl BitOr for AggOps {
    type Output = AggOps;

    fn bitor(self, rhs: AggOps) -> AggOps {
        AggOps(self.0 | rhs.0)
    }
}

impl BitOrAssign for AggOps {
    fn bitor_assign(&mut self, rhs: AggOps) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for AggOps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("NONE");
        }
        let names: Vec<String> = self.enabled().map(|(_, n)| n.to_uppercase()).collect();
        f.write_str(&names.join("|"))
    }
}

/// Per-column streaming accumulator.
pub trait Aggregator: fmt::Debug + Send {
    /// Fold every value of the aggregated column of `batch` into the
    /// running statistics. An empty batch is a no-op.
    fn add(&mut self, batch: &Batch) -> Result<()>;

    /// Operations this aggregator supports.
    fn available_agg(&self) -> AggOps;

    /// Same configuration, identity statistics.
    fn fresh_copy(&self) -> Self
    where
        Self: Sized;

    /// Write the enabled results into `buffer` starting at `start_column`;
    /// returns the next free column.
    fn get_result(&self, buffer: &mut BatchBuffer, start_column: usize) -> Result<usize>;

    fn result_schema(&self) -> &Schema;
}

/// Closed set of aggregators, chosen by the aggregated column's type.
#[derive(Debug, Clone)]
pub enum ColumnAggregator {
    Int(IntAggregator),
    Long(LongAggregator),
    Float(FloatAggregator),
    Double(DoubleAggregator),
}

macro_rules! each_variant {
    ($self:expr, $agg:ident => $body:expr) => {
        match $self {
            ColumnAggregator::Int($agg) => $body,
            ColumnAggregator::Long($agg) => $body,
            ColumnAggregator::Float($agg) => $body,
            ColumnAggregator::Double($agg) => $body,
        }
    };
}

impl ColumnAggregator {
    pub fn new(
        column_type: ColumnType,
        column: usize,
        column_name: &str,
        ops: AggOps,
    ) -> Result<Self> {
        Ok(match column_type {
            ColumnType::Int => Self::Int(IntAggregator::new(column, column_name, ops)?),
            ColumnType::Long => Self::Long(LongAggregator::new(column, column_name, ops)?),
            ColumnType::Float => Self::Float(FloatAggregator::new(column, column_name, ops)?),
            ColumnType::Double => Self::Double(DoubleAggregator::new(column, column_name, ops)?),
            ColumnType::Boolean | ColumnType::String => {
                return Err(StrandError::InvalidConfig(format!(
                    "cannot aggregate {column_type} column '{column_name}'"
                )))
            }
        })
    }

    /// Build the aggregator for `column` of `schema`.
    pub fn for_column(schema: &Schema, column: usize, ops: AggOps) -> Result<Self> {
        let ty = schema
            .column_type(column)
            .map_err(|e| StrandError::InvalidConfig(e.to_string()))?;
        let name = schema
            .column_name(column)
            .map_err(|e| StrandError::InvalidConfig(e.to_string()))?;
        Self::new(ty, column, name, ops)
    }
}

impl Aggregator for ColumnAggregator {
    fn add(&mut self, batch: &Batch) -> Result<()> {
        each_variant!(self, a => a.add(batch))
    }

    fn available_agg(&self) -> AggOps {
        each_variant!(self, a => a.available_agg())
    }

    fn fresh_copy(&self) -> Self {
        match self {
            Self::Int(a) => Self::Int(a.fresh_copy()),
            Self::Long(a) => Self::Long(a.fresh_copy()),
            Self::Float(a) => Self::Float(a.fresh_copy()),
            Self::Double(a) => Self::Double(a.fresh_copy()),
        }
    }

    fn get_result(&self, buffer: &mut BatchBuffer, start_column: usize) -> Result<usize> {
        each_variant!(self, a => a.get_result(buffer, start_column))
    }

    fn result_schema(&self) -> &Schema {
        each_variant!(self, a => a.result_schema())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_validation() {
        assert!(AggOps::NONE.validate_against(AggOps::ALL_NUMERIC).is_err());
        assert!((AggOps::SUM | AggOps::AVG)
            .validate_against(AggOps::ALL_NUMERIC)
            .is_ok());
        assert!(AggOps::from_bits(0x40)
            .validate_against(AggOps::ALL_NUMERIC)
            .is_err());
        assert_eq!((AggOps::STDEV | AggOps::COUNT).to_string(), "COUNT|STDEV");
    }

    #[test]
    fn string_columns_are_not_aggregatable() {
        let schema = Schema::new([("name", ColumnType::String)]);
        let err = ColumnAggregator::for_column(&schema, 0, AggOps::COUNT).expect_err("string");
        assert!(matches!(err, StrandError::InvalidConfig(_)));
        assert!(ColumnAggregator::for_column(&schema, 3, AggOps::COUNT).is_err());
    }
}
