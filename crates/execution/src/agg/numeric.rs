use std::cmp::Ordering;
use std::fmt;

use strand_common::Result;

use super::{AggOps, Aggregator};
use crate::batch::{Batch, BatchBuffer, ColumnType, Schema};

/// Primitive element type a [`NumericAggregator`] can fold.
pub trait AggValue: Copy + fmt::Debug + Send + Sync + 'static {
    /// Running-sum representation (widened for integers).
    type Sum: Copy + fmt::Debug + Send + Sync + 'static;

    const COLUMN_TYPE: ColumnType;
    const SUM_TYPE: ColumnType;
    /// Starting value of a running minimum.
    const MIN_IDENTITY: Self;
    /// Starting value of a running maximum.
    const MAX_IDENTITY: Self;
    const SUM_ZERO: Self::Sum;

    fn values(batch: &Batch, column: usize) -> Result<&[Self]>;
    fn accumulate(sum: Self::Sum, value: Self) -> Self::Sum;
    fn total_cmp(&self, other: &Self) -> Ordering;
    fn to_f64(self) -> f64;
    fn sum_to_f64(sum: Self::Sum) -> f64;
    fn put(self, buffer: &mut BatchBuffer, column: usize) -> Result<()>;
    fn put_sum(sum: Self::Sum, buffer: &mut BatchBuffer, column: usize) -> Result<()>;
}

macro_rules! int_agg_value {
    ($t:ty, $col:expr, $values:ident, $put:ident) => {
        impl AggValue for $t {
            type Sum = i64;

            const COLUMN_TYPE: ColumnType = $col;
            const SUM_TYPE: ColumnType = ColumnType::Long;
            const MIN_IDENTITY: Self = <$t>::MAX;
            const MAX_IDENTITY: Self = <$t>::MIN;
            const SUM_ZERO: i64 = 0;

            fn values(batch: &Batch, column: usize) -> Result<&[Self]> {
                batch.$values(column)
            }

            fn accumulate(sum: i64, value: Self) -> i64 {
                sum.wrapping_add(i64::from(value))
            }

            fn total_cmp(&self, other: &Self) -> Ordering {
                self.cmp(other)
            }

            fn to_f64(self) -> f64 {
                self as f64
            }

            fn sum_to_f64(sum: i64) -> f64 {
                sum as f64
            }

            fn put(self, buffer: &mut BatchBuffer, column: usize) -> Result<()> {
                buffer.$put(column, self)
            }

            fn put_sum(sum: i64, buffer: &mut BatchBuffer, column: usize) -> Result<()> {
                buffer.put_long(column, sum)
            }
        }
    };
}

macro_rules! float_agg_value {
    ($t:ty, $col:expr, $values:ident, $put:ident) => {
        impl AggValue for $t {
            type Sum = $t;

            const COLUMN_TYPE: ColumnType = $col;
            const SUM_TYPE: ColumnType = $col;
            const MIN_IDENTITY: Self = <$t>::INFINITY;
            const MAX_IDENTITY: Self = <$t>::NEG_INFINITY;
            const SUM_ZERO: $t = 0.0;

            fn values(batch: &Batch, column: usize) -> Result<&[Self]> {
                batch.$values(column)
            }

            fn accumulate(sum: $t, value: Self) -> $t {
                sum + value
            }

            fn total_cmp(&self, other: &Self) -> Ordering {
                <$t>::total_cmp(self, other)
            }

            fn to_f64(self) -> f64 {
                f64::from(self)
            }

            fn sum_to_f64(sum: $t) -> f64 {
                f64::from(sum)
            }

            fn put(self, buffer: &mut BatchBuffer, column: usize) -> Result<()> {
                buffer.$put(column, self)
            }

            fn put_sum(sum: $t, buffer: &mut BatchBuffer, column: usize) -> Result<()> {
                buffer.$put(column, sum)
            }
        }
    };
}

int_agg_value!(i32, ColumnType::Int, int_values, put_int);
int_agg_value!(i64, ColumnType::Long, long_values, put_long);
float_agg_value!(f32, ColumnType::Float, float_values, put_float);
float_agg_value!(f64, ColumnType::Double, double_values, put_double);

/// Running COUNT/MIN/MAX/SUM/AVG/STDEV over one numeric column.
///
/// STDEV is the sample deviation of the most recent non-empty batch, computed
/// with Welford's recurrence; it is not carried across batches.
#[derive(Debug, Clone)]
pub struct NumericAggregator<T: AggValue> {
    column: usize,
    ops: AggOps,
    result_schema: Schema,
    count: u64,
    sum: T::Sum,
    min: T,
    max: T,
    stdev: f64,
}

pub type IntAggregator = NumericAggregator<i32>;
pub type LongAggregator = NumericAggregator<i64>;
pub type FloatAggregator = NumericAggregator<f32>;
pub type DoubleAggregator = NumericAggregator<f64>;

fn result_type<T: AggValue>(op: AggOps) -> ColumnType {
    match op {
        AggOps::COUNT => ColumnType::Long,
        AggOps::MIN | AggOps::MAX => T::COLUMN_TYPE,
        AggOps::SUM => T::SUM_TYPE,
        _ => ColumnType::Double,
    }
}

impl<T: AggValue> NumericAggregator<T> {
    pub fn new(column: usize, column_name: &str, ops: AggOps) -> Result<Self> {
        ops.validate_against(AggOps::ALL_NUMERIC)?;
        let result_schema = Schema::new(
            ops.enabled()
                .map(|(op, prefix)| (format!("{prefix}_{column_name}"), result_type::<T>(op))),
        );
        Ok(Self {
            column,
            ops,
            result_schema,
            count: 0,
            sum: T::SUM_ZERO,
            min: T::MIN_IDENTITY,
            max: T::MAX_IDENTITY,
            stdev: 0.0,
        })
    }

    pub fn column(&self) -> usize {
        self.column
    }

    pub fn ops(&self) -> AggOps {
        self.ops
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn min(&self) -> T {
        self.min
    }

    pub fn max(&self) -> T {
        self.max
    }

    pub fn sum(&self) -> T::Sum {
        self.sum
    }

    pub fn stdev(&self) -> f64 {
        self.stdev
    }
}

impl<T: AggValue> Aggregator for NumericAggregator<T> {
    fn add(&mut self, batch: &Batch) -> Result<()> {
        let values = T::values(batch, self.column)?;
        if values.is_empty() {
            return Ok(());
        }
        let mut mean = 0.0_f64;
        let mut s = 0.0_f64;
        for (i, &v) in values.iter().enumerate() {
            self.sum = T::accumulate(self.sum, v);
            if v.total_cmp(&self.min) == Ordering::Less {
                self.min = v;
            }
            if v.total_cmp(&self.max) == Ordering::Greater {
                self.max = v;
            }
            let x = v.to_f64();
            let prev = mean;
            mean += (x - prev) / (i + 1) as f64;
            s += (x - prev) * (x - mean);
        }
        let n = values.len();
        self.count += n as u64;
        self.stdev = if n > 1 {
            (s / (n - 1) as f64).sqrt()
        } else {
            0.0
        };
        Ok(())
    }

    fn available_agg(&self) -> AggOps {
        AggOps::ALL_NUMERIC
    }

    fn fresh_copy(&self) -> Self {
        Self {
            column: self.column,
            ops: self.ops,
            result_schema: self.result_schema.clone(),
            count: 0,
            sum: T::SUM_ZERO,
            min: T::MIN_IDENTITY,
            max: T::MAX_IDENTITY,
            stdev: 0.0,
        }
    }

    fn get_result(&self, buffer: &mut BatchBuffer, start_column: usize) -> Result<usize> {
        let mut column = start_column;
        for (op, _) in self.ops.enabled() {
            match op {
                AggOps::COUNT => buffer.put_long(column, self.count as i64)?,
                AggOps::MIN => self.min.put(buffer, column)?,
                AggOps::MAX => self.max.put(buffer, column)?,
                AggOps::SUM => T::put_sum(self.sum, buffer, column)?,
                AggOps::AVG => {
                    buffer.put_double(column, T::sum_to_f64(self.sum) / self.count as f64)?
                }
                _ => buffer.put_double(column, self.stdev)?,
            }
            column += 1;
        }
        Ok(column)
    }

    fn result_schema(&self) -> &Schema {
        &self.result_schema
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchBuilder;

    fn float_batch(values: &[f32]) -> Batch {
        let mut b = BatchBuilder::new(Schema::new([("x", ColumnType::Float)]));
        for v in values {
            b.put_float(0, *v).expect("put");
        }
        b.finish().expect("finish")
    }

    fn int_batch(values: &[i32]) -> Batch {
        let mut b = BatchBuilder::new(Schema::new([("x", ColumnType::Int)]));
        for v in values {
            b.put_int(0, *v).expect("put");
        }
        b.finish().expect("finish")
    }

    fn single_row<A: Aggregator>(agg: &A) -> Batch {
        let mut buffer = BatchBuffer::new(agg.result_schema().clone());
        let next = agg.get_result(&mut buffer, 0).expect("result");
        assert_eq!(next, agg.result_schema().num_columns());
        let mut batches = buffer.into_batches().expect("seal");
        assert_eq!(batches.len(), 1);
        batches.remove(0)
    }

    #[test]
    fn float_sum_count_avg() {
        let mut agg =
            FloatAggregator::new(0, "x", AggOps::SUM | AggOps::COUNT | AggOps::AVG).expect("agg");
        agg.add(&float_batch(&[1.0, 2.0, 3.0])).expect("add");

        let schema = agg.result_schema();
        assert_eq!(schema.column_names(), vec!["count_x", "sum_x", "avg_x"]);
        assert_eq!(
            schema.types(),
            &[ColumnType::Long, ColumnType::Float, ColumnType::Double]
        );
        let row = single_row(&agg);
        assert_eq!(row.get_long(0, 0).expect("count"), 3);
        assert_eq!(row.get_float(1, 0).expect("sum"), 6.0);
        assert_eq!(row.get_double(2, 0).expect("avg"), 2.0);
    }

    #[test]
    fn count_grows_by_batch_size_and_empty_batch_is_noop() {
        let mut agg = IntAggregator::new(0, "x", AggOps::ALL_NUMERIC).expect("agg");
        agg.add(&int_batch(&[5, -2, 9])).expect("add");
        assert_eq!(agg.count(), 3);
        let before = (agg.count(), agg.sum(), agg.min(), agg.max(), agg.stdev());
        agg.add(&int_batch(&[])).expect("add empty");
        assert_eq!((agg.count(), agg.sum(), agg.min(), agg.max(), agg.stdev()), before);
        agg.add(&int_batch(&[100])).expect("add");
        assert_eq!(agg.count(), 4);
        assert_eq!(agg.sum(), 112);
        assert_eq!((agg.min(), agg.max()), (-2, 100));
    }

    #[test]
    fn integer_sum_widens_to_long() {
        let mut agg = IntAggregator::new(0, "x", AggOps::SUM).expect("agg");
        agg.add(&int_batch(&[i32::MAX, i32::MAX])).expect("add");
        let row = single_row(&agg);
        assert_eq!(row.get_long(0, 0).expect("sum"), 2 * i64::from(i32::MAX));
    }

    #[test]
    fn stdev_is_sample_deviation_of_batch() {
        let mut agg = DoubleAggregator::new(0, "x", AggOps::STDEV).expect("agg");
        let mut b = BatchBuilder::new(Schema::new([("x", ColumnType::Double)]));
        for v in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            b.put_double(0, v).expect("put");
        }
        agg.add(&b.finish().expect("finish")).expect("add");
        let expected = (32.0_f64 / 7.0).sqrt();
        assert!((agg.stdev() - expected).abs() < 1e-12);
    }

    #[test]
    fn single_value_batch_has_zero_stdev() {
        let mut agg = FloatAggregator::new(0, "x", AggOps::STDEV).expect("agg");
        agg.add(&float_batch(&[4.5])).expect("add");
        assert_eq!(agg.stdev(), 0.0);
    }

    #[test]
    fn fresh_copy_yields_identity_results() {
        let mut agg = IntAggregator::new(0, "x", AggOps::ALL_NUMERIC).expect("agg");
        agg.add(&int_batch(&[3, 4])).expect("add");
        let fresh = agg.fresh_copy();

        assert_eq!(fresh.ops(), agg.ops());
        assert_eq!(fresh.result_schema(), agg.result_schema());
        let row = single_row(&fresh);
        assert_eq!(row.get_long(0, 0).expect("count"), 0);
        assert_eq!(row.get_int(1, 0).expect("min"), i32::MAX);
        assert_eq!(row.get_int(2, 0).expect("max"), i32::MIN);
        assert_eq!(row.get_long(3, 0).expect("sum"), 0);
        assert!(row.get_double(4, 0).expect("avg").is_nan());
        assert_eq!(row.get_double(5, 0).expect("stdev"), 0.0);

        assert_eq!(agg.count(), 2);
        assert_eq!(agg.sum(), 7);
    }

    #[test]
    fn float_identities_are_infinite() {
        let fresh = FloatAggregator::new(0, "x", AggOps::MIN | AggOps::MAX).expect("agg");
        assert_eq!(fresh.min(), f32::INFINITY);
        assert_eq!(fresh.max(), f32::NEG_INFINITY);
    }

    #[test]
    fn wrong_column_type_is_an_execution_error() {
        let mut agg = LongAggregator::new(0, "x", AggOps::COUNT).expect("agg");
        let err = agg.add(&int_batch(&[1])).expect_err("int column");
        assert!(err.to_string().contains("type mismatch"));
    }
}
