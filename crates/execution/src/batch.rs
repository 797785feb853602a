//! Columnar batch model: column types, schemas, sealed batches, builders and
//! accumulation buffers.
//!
//! Batches are arrow `RecordBatch`es bound to a strand [`Schema`]; every
//! column is non-nullable and homogeneous. A [`Batch`] never carries control
//! meaning: end-of-stream and end-of-iteration are explicit message kinds in
//! the exchange layer, not batches of a particular size.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use arrow::array::{
    Array, ArrayBuilder, ArrayRef, BooleanArray, BooleanBuilder, Float32Array, Float32Builder,
    Float64Array, Float64Builder, Int32Array, Int32Builder, Int64Array, Int64Builder,
    StringArray, StringBuilder,
};
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema as ArrowSchema, SchemaRef};
use serde::{Deserialize, Serialize};
use strand_common::{Result, StrandError, DEFAULT_BATCH_SIZE};

/// Element type of one column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    Boolean,
    Int,
    Long,
    Float,
    Double,
    String,
}

impl ColumnType {
    /// Arrow storage type backing this column type.
    pub fn data_type(self) -> DataType {
        match self {
            ColumnType::Boolean => DataType::Boolean,
            ColumnType::Int => DataType::Int32,
            ColumnType::Long => DataType::Int64,
            ColumnType::Float => DataType::Float32,
            ColumnType::Double => DataType::Float64,
            ColumnType::String => DataType::Utf8,
        }
    }

    pub fn from_data_type(dt: &DataType) -> Result<Self> {
        match dt {
            DataType::Boolean => Ok(ColumnType::Boolean),
            DataType::Int32 => Ok(ColumnType::Int),
            DataType::Int64 => Ok(ColumnType::Long),
            DataType::Float32 => Ok(ColumnType::Float),
            DataType::Float64 => Ok(ColumnType::Double),
            DataType::Utf8 => Ok(ColumnType::String),
            other => Err(StrandError::Unsupported(format!(
                "arrow type {other:?} has no strand column type"
            ))),
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            ColumnType::Int | ColumnType::Long | ColumnType::Float | ColumnType::Double
        )
    }

    /// Width in bytes of one fixed-size value, `None` for strings.
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            ColumnType::Boolean => Some(1),
            ColumnType::Int | ColumnType::Float => Some(4),
            ColumnType::Long | ColumnType::Double => Some(8),
            ColumnType::String => None,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Int => "INT",
            ColumnType::Long => "LONG",
            ColumnType::Float => "FLOAT",
            ColumnType::Double => "DOUBLE",
            ColumnType::String => "STRING",
        };
        f.write_str(name)
    }
}

/// Ordered `(name, type)` pairs. Immutable and cheap to clone.
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    arrow: SchemaRef,
    types: Arc<[ColumnType]>,
}

impl Schema {
    pub fn new<N: Into<String>>(columns: impl IntoIterator<Item = (N, ColumnType)>) -> Self {
        let (fields, types): (Vec<Field>, Vec<ColumnType>) = columns
            .into_iter()
            .map(|(name, ty)| (Field::new(name.into(), ty.data_type(), false), ty))
            .unzip();
        Self {
            arrow: Arc::new(ArrowSchema::new(fields)),
            types: types.into(),
        }
    }

    /// Pair parallel type and name lists.
    pub fn from_types_and_names(types: Vec<ColumnType>, names: Vec<String>) -> Result<Self> {
        if types.len() != names.len() {
            return Err(StrandError::InvalidConfig(format!(
                "schema has {} types but {} names",
                types.len(),
                names.len()
            )));
        }
        Ok(Self::new(names.into_iter().zip(types)))
    }

    pub fn from_arrow(schema: SchemaRef) -> Result<Self> {
        let types = schema
            .fields()
            .iter()
            .map(|f| ColumnType::from_data_type(f.data_type()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            arrow: schema,
            types: types.into(),
        })
    }

    pub fn num_columns(&self) -> usize {
        self.types.len()
    }

    pub fn types(&self) -> &[ColumnType] {
        &self.types
    }

    pub fn column_type(&self, column: usize) -> Result<ColumnType> {
        self.types.get(column).copied().ok_or_else(|| {
            StrandError::Execution(format!(
                "column {column} out of range for schema with {} columns",
                self.num_columns()
            ))
        })
    }

    pub fn column_name(&self, column: usize) -> Result<&str> {
        self.arrow
            .fields()
            .get(column)
            .map(|f| f.name().as_str())
            .ok_or_else(|| {
                StrandError::Execution(format!(
                    "column {column} out of range for schema with {} columns",
                    self.num_columns()
                ))
            })
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.arrow.fields().iter().map(|f| f.name().as_str()).collect()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.arrow.fields().iter().position(|f| f.name() == name)
    }

    /// Columns of `self` followed by columns of `other`.
    pub fn merge(&self, other: &Schema) -> Schema {
        let left = self.column_names().into_iter().zip(self.types.iter().copied());
        let right = other
            .column_names()
            .into_iter()
            .zip(other.types.iter().copied());
        Schema::new(left.chain(right))
    }

    pub fn project(&self, columns: &[usize]) -> Result<Schema> {
        let mut out = Vec::with_capacity(columns.len());
        for &c in columns {
            out.push((self.column_name(c)?.to_string(), self.column_type(c)?));
        }
        Ok(Schema::new(out))
    }

    /// Reject schemas whose column names collide.
    pub fn ensure_unique_names(&self) -> Result<()> {
        let names = self.column_names();
        for (i, name) in names.iter().enumerate() {
            if names[..i].contains(name) {
                return Err(StrandError::InvalidConfig(format!(
                    "duplicate column name '{name}' in schema"
                )));
            }
        }
        Ok(())
    }

    pub fn arrow(&self) -> &SchemaRef {
        &self.arrow
    }
}

/// One typed cell, used for key comparison, hashing and row projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Boolean(bool),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
}

impl Value {
    pub fn column_type(&self) -> ColumnType {
        match self {
            Value::Boolean(_) => ColumnType::Boolean,
            Value::Int(_) => ColumnType::Int,
            Value::Long(_) => ColumnType::Long,
            Value::Float(_) => ColumnType::Float,
            Value::Double(_) => ColumnType::Double,
            Value::String(_) => ColumnType::String,
        }
    }

    /// Total order: integers compare exactly, any float comparison goes
    /// through `f64::total_cmp`, and values of unrelated types order by type.
    pub fn cmp_total(&self, other: &Value) -> Ordering {
        use Value::*;
        match (self, other) {
            (Boolean(a), Boolean(b)) => a.cmp(b),
            (String(a), String(b)) => a.cmp(b),
            (Int(a), Int(b)) => a.cmp(b),
            (Long(a), Long(b)) => a.cmp(b),
            (Int(a), Long(b)) => i64::from(*a).cmp(b),
            (Long(a), Int(b)) => a.cmp(&i64::from(*b)),
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a.total_cmp(&b),
                _ => type_rank(self.column_type()).cmp(&type_rank(other.column_type())),
            },
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(f64::from(*v)),
            Value::Long(v) => Some(*v as f64),
            Value::Float(v) => Some(f64::from(*v)),
            Value::Double(v) => Some(*v),
            Value::Boolean(_) | Value::String(_) => None,
        }
    }
}

fn type_rank(ty: ColumnType) -> u8 {
    match ty {
        ColumnType::Boolean => 0,
        ColumnType::Int | ColumnType::Long | ColumnType::Float | ColumnType::Double => 1,
        ColumnType::String => 2,
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::Boolean(v) => {
                0_u8.hash(state);
                v.hash(state);
            }
            Value::Int(v) => {
                1_u8.hash(state);
                i64::from(*v).hash(state);
            }
            Value::Long(v) => {
                1_u8.hash(state);
                v.hash(state);
            }
            Value::Float(v) => {
                2_u8.hash(state);
                f64::from(*v).to_bits().hash(state);
            }
            Value::Double(v) => {
                2_u8.hash(state);
                v.to_bits().hash(state);
            }
            Value::String(v) => {
                3_u8.hash(state);
                v.hash(state);
            }
        }
    }
}

/// Sealed, immutable set of tuples bound to one [`Schema`].
#[derive(Debug, Clone)]
pub struct Batch {
    schema: Schema,
    inner: RecordBatch,
}

impl Batch {
    pub fn try_new(schema: Schema, columns: Vec<ArrayRef>) -> Result<Self> {
        let inner = RecordBatch::try_new(Arc::clone(schema.arrow()), columns)
            .map_err(|e| StrandError::Execution(format!("batch build failed: {e}")))?;
        Ok(Self { schema, inner })
    }

    pub fn from_record_batch(batch: RecordBatch) -> Result<Self> {
        let schema = Schema::from_arrow(batch.schema())?;
        Ok(Self {
            schema,
            inner: batch,
        })
    }

    pub fn empty(schema: Schema) -> Self {
        let inner = RecordBatch::new_empty(Arc::clone(schema.arrow()));
        Self { schema, inner }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn num_tuples(&self) -> usize {
        self.inner.num_rows()
    }

    pub fn num_columns(&self) -> usize {
        self.inner.num_columns()
    }

    pub fn record_batch(&self) -> &RecordBatch {
        &self.inner
    }

    pub fn column(&self, column: usize) -> Result<&ArrayRef> {
        if column >= self.num_columns() {
            return Err(StrandError::Execution(format!(
                "column {column} out of range for batch with {} columns",
                self.num_columns()
            )));
        }
        Ok(self.inner.column(column))
    }

    fn typed_column<A: Array + 'static>(&self, column: usize, expected: ColumnType) -> Result<&A> {
        let actual = self.schema.column_type(column)?;
        if actual != expected {
            return Err(StrandError::Execution(format!(
                "type mismatch: column {column} is {actual}, requested {expected}"
            )));
        }
        self.column(column)?
            .as_any()
            .downcast_ref::<A>()
            .ok_or_else(|| {
                StrandError::Execution(format!("column {column} storage is not {expected}"))
            })
    }

    fn check_row(&self, row: usize) -> Result<()> {
        if row >= self.num_tuples() {
            return Err(StrandError::Execution(format!(
                "row {row} out of range for batch with {} tuples",
                self.num_tuples()
            )));
        }
        Ok(())
    }

    pub fn get_boolean(&self, column: usize, row: usize) -> Result<bool> {
        let a = self.typed_column::<BooleanArray>(column, ColumnType::Boolean)?;
        self.check_row(row)?;
        Ok(a.value(row))
    }

    pub fn get_int(&self, column: usize, row: usize) -> Result<i32> {
        let values = self.int_values(column)?;
        self.check_row(row)?;
        Ok(values[row])
    }

    pub fn get_long(&self, column: usize, row: usize) -> Result<i64> {
        let values = self.long_values(column)?;
        self.check_row(row)?;
        Ok(values[row])
    }

    pub fn get_float(&self, column: usize, row: usize) -> Result<f32> {
        let values = self.float_values(column)?;
        self.check_row(row)?;
        Ok(values[row])
    }

    pub fn get_double(&self, column: usize, row: usize) -> Result<f64> {
        let values = self.double_values(column)?;
        self.check_row(row)?;
        Ok(values[row])
    }

    pub fn get_string(&self, column: usize, row: usize) -> Result<&str> {
        let a = self.typed_column::<StringArray>(column, ColumnType::String)?;
        self.check_row(row)?;
        Ok(a.value(row))
    }

    pub fn int_values(&self, column: usize) -> Result<&[i32]> {
        Ok(self
            .typed_column::<Int32Array>(column, ColumnType::Int)?
            .values())
    }

    pub fn long_values(&self, column: usize) -> Result<&[i64]> {
        Ok(self
            .typed_column::<Int64Array>(column, ColumnType::Long)?
            .values())
    }

    pub fn float_values(&self, column: usize) -> Result<&[f32]> {
        Ok(self
            .typed_column::<Float32Array>(column, ColumnType::Float)?
            .values())
    }

    pub fn double_values(&self, column: usize) -> Result<&[f64]> {
        Ok(self
            .typed_column::<Float64Array>(column, ColumnType::Double)?
            .values())
    }

    pub fn value(&self, column: usize, row: usize) -> Result<Value> {
        match self.schema.column_type(column)? {
            ColumnType::Boolean => self.get_boolean(column, row).map(Value::Boolean),
            ColumnType::Int => self.get_int(column, row).map(Value::Int),
            ColumnType::Long => self.get_long(column, row).map(Value::Long),
            ColumnType::Float => self.get_float(column, row).map(Value::Float),
            ColumnType::Double => self.get_double(column, row).map(Value::Double),
            ColumnType::String => self
                .get_string(column, row)
                .map(|s| Value::String(s.to_string())),
        }
    }

    /// Copy every row, in order, into `buffer`.
    pub fn compact_into(&self, buffer: &mut BatchBuffer) -> Result<()> {
        if buffer.schema().types() != self.schema.types() {
            return Err(StrandError::Execution(
                "cannot compact batch into buffer with a different schema".to_string(),
            ));
        }
        for row in 0..self.num_tuples() {
            buffer.append_row(self, row)?;
        }
        Ok(())
    }

    pub fn project(&self, columns: &[usize]) -> Result<Batch> {
        let schema = self.schema.project(columns)?;
        let inner = self
            .inner
            .project(columns)
            .map_err(|e| StrandError::Execution(format!("batch projection failed: {e}")))?;
        Ok(Self { schema, inner })
    }
}

enum ColumnBuilder {
    Boolean(BooleanBuilder),
    Int(Int32Builder),
    Long(Int64Builder),
    Float(Float32Builder),
    Double(Float64Builder),
    String(StringBuilder),
}

impl ColumnBuilder {
    fn new(ty: ColumnType, capacity: usize) -> Self {
        match ty {
            ColumnType::Boolean => Self::Boolean(BooleanBuilder::with_capacity(capacity)),
            ColumnType::Int => Self::Int(Int32Builder::with_capacity(capacity)),
            ColumnType::Long => Self::Long(Int64Builder::with_capacity(capacity)),
            ColumnType::Float => Self::Float(Float32Builder::with_capacity(capacity)),
            ColumnType::Double => Self::Double(Float64Builder::with_capacity(capacity)),
            ColumnType::String => {
                Self::String(StringBuilder::with_capacity(capacity, capacity * 8))
            }
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::Boolean(b) => b.len(),
            Self::Int(b) => b.len(),
            Self::Long(b) => b.len(),
            Self::Float(b) => b.len(),
            Self::Double(b) => b.len(),
            Self::String(b) => b.len(),
        }
    }

    fn append(&mut self, value: Value) -> Result<()> {
        match (self, value) {
            (Self::Boolean(b), Value::Boolean(v)) => b.append_value(v),
            (Self::Int(b), Value::Int(v)) => b.append_value(v),
            (Self::Long(b), Value::Long(v)) => b.append_value(v),
            (Self::Float(b), Value::Float(v)) => b.append_value(v),
            (Self::Double(b), Value::Double(v)) => b.append_value(v),
            (Self::String(b), Value::String(v)) => b.append_value(v),
            (_, value) => {
                return Err(StrandError::Execution(format!(
                    "type mismatch: cannot append {} value",
                    value.column_type()
                )))
            }
        }
        Ok(())
    }

    fn append_from(&mut self, batch: &Batch, column: usize, row: usize) -> Result<()> {
        match self {
            Self::Boolean(b) => b.append_value(batch.get_boolean(column, row)?),
            Self::Int(b) => b.append_value(batch.get_int(column, row)?),
            Self::Long(b) => b.append_value(batch.get_long(column, row)?),
            Self::Float(b) => b.append_value(batch.get_float(column, row)?),
            Self::Double(b) => b.append_value(batch.get_double(column, row)?),
            Self::String(b) => b.append_value(batch.get_string(column, row)?),
        }
        Ok(())
    }

    fn finish(&mut self) -> ArrayRef {
        match self {
            Self::Boolean(b) => Arc::new(b.finish()),
            Self::Int(b) => Arc::new(b.finish()),
            Self::Long(b) => Arc::new(b.finish()),
            Self::Float(b) => Arc::new(b.finish()),
            Self::Double(b) => Arc::new(b.finish()),
            Self::String(b) => Arc::new(b.finish()),
        }
    }
}

/// Mutable, column-wise accumulator sealing into a [`Batch`].
///
/// Values are written column by column; a row is complete once every column
/// has received its value for that row. Writing the same column twice for
/// one row is an error.
pub struct BatchBuilder {
    schema: Schema,
    columns: Vec<ColumnBuilder>,
    rows: usize,
    capacity: usize,
}

impl BatchBuilder {
    pub fn new(schema: Schema) -> Self {
        Self::with_capacity(schema, DEFAULT_BATCH_SIZE)
    }

    pub fn with_capacity(schema: Schema, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let columns = schema
            .types()
            .iter()
            .map(|ty| ColumnBuilder::new(*ty, capacity))
            .collect();
        Self {
            schema,
            columns,
            rows: 0,
            capacity,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Completed rows.
    pub fn num_tuples(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn is_full(&self) -> bool {
        self.rows >= self.capacity
    }

    fn column_builder(&mut self, column: usize) -> Result<&mut ColumnBuilder> {
        let rows = self.rows;
        let width = self.columns.len();
        let b = self.columns.get_mut(column).ok_or_else(|| {
            StrandError::Execution(format!(
                "column {column} out of range for builder with {width} columns"
            ))
        })?;
        if b.len() != rows {
            return Err(StrandError::Execution(format!(
                "column {column} already holds a value for row {rows}"
            )));
        }
        Ok(b)
    }

    fn complete_row_if_ready(&mut self) {
        let next = self.rows + 1;
        if self.columns.iter().all(|c| c.len() == next) {
            self.rows = next;
        }
    }

    pub fn put_value(&mut self, column: usize, value: Value) -> Result<()> {
        self.column_builder(column)?.append(value)?;
        self.complete_row_if_ready();
        Ok(())
    }

    pub fn put_boolean(&mut self, column: usize, v: bool) -> Result<()> {
        self.put_value(column, Value::Boolean(v))
    }

    pub fn put_int(&mut self, column: usize, v: i32) -> Result<()> {
        self.put_value(column, Value::Int(v))
    }

    pub fn put_long(&mut self, column: usize, v: i64) -> Result<()> {
        self.put_value(column, Value::Long(v))
    }

    pub fn put_float(&mut self, column: usize, v: f32) -> Result<()> {
        self.put_value(column, Value::Float(v))
    }

    pub fn put_double(&mut self, column: usize, v: f64) -> Result<()> {
        self.put_value(column, Value::Double(v))
    }

    pub fn put_string(&mut self, column: usize, v: &str) -> Result<()> {
        self.put_value(column, Value::String(v.to_string()))
    }

    /// Copy one cell of `batch` into `column`, without materialising a [`Value`].
    pub fn put_from(
        &mut self,
        column: usize,
        batch: &Batch,
        source_column: usize,
        row: usize,
    ) -> Result<()> {
        self.column_builder(column)?
            .append_from(batch, source_column, row)?;
        self.complete_row_if_ready();
        Ok(())
    }

    pub fn append_row(&mut self, batch: &Batch, row: usize) -> Result<()> {
        for column in 0..self.columns.len() {
            self.put_from(column, batch, column, row)?;
        }
        Ok(())
    }

    /// Seal the completed rows into a batch and reset the builder.
    pub fn finish(&mut self) -> Result<Batch> {
        if self.columns.iter().any(|c| c.len() != self.rows) {
            return Err(StrandError::Execution(
                "cannot seal a batch with a partially written row".to_string(),
            ));
        }
        let arrays = self.columns.iter_mut().map(ColumnBuilder::finish).collect();
        self.rows = 0;
        Batch::try_new(self.schema.clone(), arrays)
    }
}

/// Growable accumulation of tuples, sealed into batch-size batches.
///
/// Target of [`Batch::compact_into`] and of aggregate result emission.
pub struct BatchBuffer {
    current: BatchBuilder,
    ready: VecDeque<Batch>,
    batch_size: usize,
    ready_tuples: usize,
}

impl BatchBuffer {
    pub fn new(schema: Schema) -> Self {
        Self::with_batch_size(schema, DEFAULT_BATCH_SIZE)
    }

    pub fn with_batch_size(schema: Schema, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            current: BatchBuilder::with_capacity(schema, batch_size),
            ready: VecDeque::new(),
            batch_size,
            ready_tuples: 0,
        }
    }

    pub fn schema(&self) -> &Schema {
        self.current.schema()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Completed tuples across sealed and in-progress batches.
    pub fn num_tuples(&self) -> usize {
        self.ready_tuples + self.current.num_tuples()
    }

    pub fn is_empty(&self) -> bool {
        self.num_tuples() == 0
    }

    /// Number of sealed, full batches waiting to be popped.
    pub fn num_full_batches(&self) -> usize {
        self.ready.len()
    }

    fn seal_if_full(&mut self) -> Result<()> {
        if self.current.num_tuples() >= self.batch_size {
            let batch = self.current.finish()?;
            self.ready_tuples += batch.num_tuples();
            self.ready.push_back(batch);
        }
        Ok(())
    }

    pub fn put_value(&mut self, column: usize, value: Value) -> Result<()> {
        self.current.put_value(column, value)?;
        self.seal_if_full()
    }

    pub fn put_boolean(&mut self, column: usize, v: bool) -> Result<()> {
        self.put_value(column, Value::Boolean(v))
    }

    pub fn put_int(&mut self, column: usize, v: i32) -> Result<()> {
        self.put_value(column, Value::Int(v))
    }

    pub fn put_long(&mut self, column: usize, v: i64) -> Result<()> {
        self.put_value(column, Value::Long(v))
    }

    pub fn put_float(&mut self, column: usize, v: f32) -> Result<()> {
        self.put_value(column, Value::Float(v))
    }

    pub fn put_double(&mut self, column: usize, v: f64) -> Result<()> {
        self.put_value(column, Value::Double(v))
    }

    pub fn put_string(&mut self, column: usize, v: &str) -> Result<()> {
        self.put_value(column, Value::String(v.to_string()))
    }

    pub fn put_from(
        &mut self,
        column: usize,
        batch: &Batch,
        source_column: usize,
        row: usize,
    ) -> Result<()> {
        self.current.put_from(column, batch, source_column, row)?;
        self.seal_if_full()
    }

    pub fn append_row(&mut self, batch: &Batch, row: usize) -> Result<()> {
        self.current.append_row(batch, row)?;
        self.seal_if_full()
    }

    /// Pop the oldest full batch, if any.
    pub fn pop_filled(&mut self) -> Option<Batch> {
        let batch = self.ready.pop_front()?;
        self.ready_tuples -= batch.num_tuples();
        Some(batch)
    }

    /// Pop the oldest full batch, or seal and return the partial one.
    pub fn pop_any(&mut self) -> Result<Option<Batch>> {
        if let Some(batch) = self.pop_filled() {
            return Ok(Some(batch));
        }
        if self.current.is_empty() {
            return Ok(None);
        }
        self.current.finish().map(Some)
    }

    /// Seal everything, preserving row order.
    pub fn into_batches(mut self) -> Result<Vec<Batch>> {
        let mut out = Vec::with_capacity(self.ready.len() + 1);
        while let Some(batch) = self.pop_any()? {
            out.push(batch);
        }
        Ok(out)
    }
}

impl fmt::Debug for BatchBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchBuffer")
            .field("schema", self.schema())
            .field("tuples", &self.num_tuples())
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair_schema() -> Schema {
        Schema::new([("id", ColumnType::Long), ("name", ColumnType::String)])
    }

    fn pair_batch(rows: &[(i64, &str)]) -> Batch {
        let mut b = BatchBuilder::new(pair_schema());
        for (id, name) in rows {
            b.put_long(0, *id).expect("id");
            b.put_string(1, name).expect("name");
        }
        b.finish().expect("finish")
    }

    #[test]
    fn typed_accessors_reject_wrong_type() {
        let batch = pair_batch(&[(7, "seven")]);
        assert_eq!(batch.get_long(0, 0).expect("long"), 7);
        assert_eq!(batch.get_string(1, 0).expect("string"), "seven");
        let err = batch.get_int(0, 0).expect_err("int on long column");
        assert!(err.to_string().contains("type mismatch"));
        assert!(batch.get_long(0, 1).is_err());
    }

    #[test]
    fn builder_tracks_rows_column_wise() {
        let mut b = BatchBuilder::new(pair_schema());
        b.put_long(0, 1).expect("id");
        assert_eq!(b.num_tuples(), 0);
        assert!(b.put_long(0, 2).is_err(), "second id for the same row");
        assert!(b.finish().is_err(), "partial row cannot be sealed");
        b.put_string(1, "one").expect("name");
        assert_eq!(b.num_tuples(), 1);
        let batch = b.finish().expect("finish");
        assert_eq!(batch.num_tuples(), 1);
        assert!(b.is_empty());
    }

    #[test]
    fn compaction_preserves_row_count_and_order() {
        let batches = vec![
            pair_batch(&[(1, "a"), (2, "b")]),
            pair_batch(&[]),
            pair_batch(&[(3, "c"), (4, "d"), (5, "e")]),
        ];
        let mut buffer = BatchBuffer::with_batch_size(pair_schema(), 2);
        for b in &batches {
            b.compact_into(&mut buffer).expect("compact");
        }
        let expected: usize = batches.iter().map(Batch::num_tuples).sum();
        assert_eq!(buffer.num_tuples(), expected);

        let sealed = buffer.into_batches().expect("seal");
        assert_eq!(sealed.iter().map(Batch::num_tuples).collect::<Vec<_>>(), vec![2, 2, 1]);
        let ids = sealed
            .iter()
            .flat_map(|b| b.long_values(0).expect("ids").to_vec())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn compaction_rejects_foreign_schema() {
        let batch = pair_batch(&[(1, "a")]);
        let mut buffer = BatchBuffer::new(Schema::new([("x", ColumnType::Int)]));
        assert!(batch.compact_into(&mut buffer).is_err());
    }

    #[test]
    fn value_ordering_crosses_numeric_widths() {
        assert_eq!(Value::Int(3).cmp_total(&Value::Long(3)), Ordering::Equal);
        assert_eq!(Value::Long(2).cmp_total(&Value::Double(2.5)), Ordering::Less);
        assert_eq!(
            Value::String("b".into()).cmp_total(&Value::String("a".into())),
            Ordering::Greater
        );
    }

    #[test]
    fn schema_merge_and_uniqueness() {
        let merged = pair_schema().merge(&pair_schema());
        assert_eq!(merged.num_columns(), 4);
        assert!(merged.ensure_unique_names().is_err());
        assert!(pair_schema().ensure_unique_names().is_ok());
        assert!(Schema::from_types_and_names(vec![ColumnType::Int], vec![]).is_err());
    }
}
