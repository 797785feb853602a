//! Wire message model.
//!
//! Three top-level kinds travel between processes: DATA (column payloads
//! plus explicit end-of-stream / end-of-iteration tags), CONTROL (liveness
//! and query lifecycle) and QUERY (a serialized plan fragment).

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, Float32Array, Float64Array, Int32Array, Int64Array,
    StringArray,
};
use serde::{Deserialize, Serialize};
use strand_common::{ExchangeId, QueryId, Result, StrandError};
use strand_execution::{Batch, ColumnType, Schema};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TransportMessage {
    Data(DataMessage),
    Control(ControlMessage),
    Query(QueryMessage),
}

impl TransportMessage {
    /// Short label used in logs and metrics.
    pub fn kind_label(&self) -> &'static str {
        match self {
            TransportMessage::Data(d) => d.kind.label(),
            TransportMessage::Control(_) => "control",
            TransportMessage::Query(_) => "query",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataMessageKind {
    Normal,
    Eoi,
    Eos,
}

impl DataMessageKind {
    pub fn label(self) -> &'static str {
        match self {
            DataMessageKind::Normal => "data",
            DataMessageKind::Eoi => "eoi",
            DataMessageKind::Eos => "eos",
        }
    }
}

/// Column payloads for one exchange edge. EOS and EOI carry no columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataMessage {
    pub exchange_id: ExchangeId,
    pub kind: DataMessageKind,
    pub columns: Vec<ColumnMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMessage {
    pub num_tuples: usize,
    pub data: ColumnData,
}

/// Typed values of one column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColumnData {
    Boolean(Vec<bool>),
    Int(Vec<i32>),
    Long(Vec<i64>),
    Float(Vec<f32>),
    Double(Vec<f64>),
    String(Vec<String>),
}

impl ColumnData {
    pub fn column_type(&self) -> ColumnType {
        match self {
            ColumnData::Boolean(_) => ColumnType::Boolean,
            ColumnData::Int(_) => ColumnType::Int,
            ColumnData::Long(_) => ColumnType::Long,
            ColumnData::Float(_) => ColumnType::Float,
            ColumnData::Double(_) => ColumnType::Double,
            ColumnData::String(_) => ColumnType::String,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ColumnData::Boolean(v) => v.len(),
            ColumnData::Int(v) => v.len(),
            ColumnData::Long(v) => v.len(),
            ColumnData::Float(v) => v.len(),
            ColumnData::Double(v) => v.len(),
            ColumnData::String(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn from_column(batch: &Batch, column: usize) -> Result<Self> {
        let ty = batch.schema().column_type(column)?;
        Ok(match ty {
            ColumnType::Int => ColumnData::Int(batch.int_values(column)?.to_vec()),
            ColumnType::Long => ColumnData::Long(batch.long_values(column)?.to_vec()),
            ColumnType::Float => ColumnData::Float(batch.float_values(column)?.to_vec()),
            ColumnType::Double => ColumnData::Double(batch.double_values(column)?.to_vec()),
            ColumnType::Boolean => {
                let array = downcast::<BooleanArray>(batch.column(column)?, ty)?;
                ColumnData::Boolean((0..array.len()).map(|i| array.value(i)).collect())
            }
            ColumnType::String => {
                let array = downcast::<StringArray>(batch.column(column)?, ty)?;
                ColumnData::String((0..array.len()).map(|i| array.value(i).to_string()).collect())
            }
        })
    }

    fn to_array(&self) -> ArrayRef {
        match self {
            ColumnData::Boolean(v) => Arc::new(BooleanArray::from(v.clone())),
            ColumnData::Int(v) => Arc::new(Int32Array::from(v.clone())),
            ColumnData::Long(v) => Arc::new(Int64Array::from(v.clone())),
            ColumnData::Float(v) => Arc::new(Float32Array::from(v.clone())),
            ColumnData::Double(v) => Arc::new(Float64Array::from(v.clone())),
            ColumnData::String(v) => Arc::new(StringArray::from(v.clone())),
        }
    }
}

fn downcast<A: Array + 'static>(array: &ArrayRef, ty: ColumnType) -> Result<&A> {
    array
        .as_any()
        .downcast_ref::<A>()
        .ok_or_else(|| StrandError::Execution(format!("column storage is not {ty}")))
}

impl DataMessage {
    pub fn eos(exchange_id: ExchangeId) -> Self {
        Self {
            exchange_id,
            kind: DataMessageKind::Eos,
            columns: Vec::new(),
        }
    }

    pub fn eoi(exchange_id: ExchangeId) -> Self {
        Self {
            exchange_id,
            kind: DataMessageKind::Eoi,
            columns: Vec::new(),
        }
    }

    pub fn from_batch(exchange_id: ExchangeId, batch: &Batch) -> Result<Self> {
        let columns = (0..batch.num_columns())
            .map(|c| {
                Ok(ColumnMessage {
                    num_tuples: batch.num_tuples(),
                    data: ColumnData::from_column(batch, c)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            exchange_id,
            kind: DataMessageKind::Normal,
            columns,
        })
    }

    pub fn num_tuples(&self) -> usize {
        self.columns.first().map_or(0, |c| c.num_tuples)
    }

    /// Decode a NORMAL payload with the receiver's schema.
    pub fn to_batch(&self, schema: &Schema) -> Result<Batch> {
        if self.kind != DataMessageKind::Normal {
            return Err(StrandError::Execution(format!(
                "cannot decode {} message on exchange {} as a batch",
                self.kind.label(),
                self.exchange_id
            )));
        }
        if self.columns.len() != schema.num_columns() {
            return Err(StrandError::Execution(format!(
                "exchange {} delivered {} columns, schema expects {}",
                self.exchange_id,
                self.columns.len(),
                schema.num_columns()
            )));
        }
        let rows = self.num_tuples();
        let mut arrays = Vec::with_capacity(self.columns.len());
        for (i, column) in self.columns.iter().enumerate() {
            let expected = schema.column_type(i)?;
            if column.data.column_type() != expected {
                return Err(StrandError::Execution(format!(
                    "type mismatch on exchange {}: column {i} is {}, schema expects {expected}",
                    self.exchange_id,
                    column.data.column_type()
                )));
            }
            if column.num_tuples != rows || column.data.len() != rows {
                return Err(StrandError::Execution(format!(
                    "exchange {} column {i} has {} values, expected {rows}",
                    self.exchange_id,
                    column.data.len()
                )));
            }
            arrays.push(column.data.to_array());
        }
        Batch::try_new(schema.clone(), arrays)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlKind {
    WorkerAlive,
    QueryReadyToExecute,
    QueryComplete,
    Disconnect,
    Connect,
    Shutdown,
    StartQuery,
}

/// Liveness and lifecycle notice; `query_id` is set for per-query kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub query_id: Option<QueryId>,
    pub kind: ControlKind,
}

impl ControlMessage {
    pub fn new(kind: ControlKind) -> Self {
        Self {
            query_id: None,
            kind,
        }
    }

    pub fn for_query(query_id: QueryId, kind: ControlKind) -> Self {
        Self {
            query_id: Some(query_id),
            kind,
        }
    }
}

/// A plan fragment for one worker, as a serialized plan document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryMessage {
    pub query_id: QueryId,
    pub fragment: Vec<u8>,
}
