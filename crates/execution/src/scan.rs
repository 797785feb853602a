//! Leaf operators: in-memory batches, discovered iterator sources and
//! fixed-width binary files.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use strand_common::{Result, StrandError, DEFAULT_BATCH_SIZE};
use tracing::debug;

use crate::batch::{Batch, BatchBuilder, ColumnType, Schema};
use crate::operator::{leaf_children, Operator, OperatorState};

/// Emits pre-built batches, optionally split into iteration rounds.
///
/// Between rounds the scan reports EOI; after the last round it reports EOS.
pub struct MemoryScan {
    state: OperatorState,
    schema: Schema,
    rounds: VecDeque<VecDeque<Batch>>,
}

impl MemoryScan {
    pub fn new(schema: Schema, batches: Vec<Batch>) -> Self {
        Self::with_rounds(schema, vec![batches])
    }

    pub fn with_rounds(schema: Schema, rounds: Vec<Vec<Batch>>) -> Self {
        let mut rounds: VecDeque<VecDeque<Batch>> =
            rounds.into_iter().map(VecDeque::from).collect();
        if rounds.is_empty() {
            rounds.push_back(VecDeque::new());
        }
        Self {
            state: OperatorState::default(),
            schema,
            rounds,
        }
    }
}

impl Operator for MemoryScan {
    fn name(&self) -> &'static str {
        "MemoryScan"
    }

    fn state(&self) -> &OperatorState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut OperatorState {
        &mut self.state
    }

    fn children(&self) -> &[Box<dyn Operator>] {
        &[]
    }

    fn children_mut(&mut self) -> &mut [Box<dyn Operator>] {
        &mut []
    }

    fn set_children(&mut self, children: Vec<Box<dyn Operator>>) -> Result<()> {
        leaf_children(self.name(), children)
    }

    fn schema(&self) -> Option<Schema> {
        Some(self.schema.clone())
    }

    fn fetch_next(&mut self) -> Result<Option<Batch>> {
        Ok(self.rounds.front_mut().and_then(VecDeque::pop_front))
    }

    fn check_eos_and_eoi(&mut self) {
        if self.rounds.len() > 1 {
            self.rounds.pop_front();
            self.state.set_eoi(true);
        } else {
            self.state.set_eos();
        }
    }
}

/// Boxed fallible batch source.
pub type BatchSource = Box<dyn Iterator<Item = Result<Batch>> + Send>;

/// Wraps an external source whose schema is only known from its data.
///
/// The first batch is pulled eagerly at construction and cached; a source
/// that yields nothing leaves the schema undefined.
pub struct IteratorScan {
    state: OperatorState,
    source: BatchSource,
    cached: Option<Batch>,
    schema: Option<Schema>,
}

impl IteratorScan {
    pub fn new(source: impl Iterator<Item = Result<Batch>> + Send + 'static) -> Result<Self> {
        let mut source: BatchSource = Box::new(source);
        let cached = source.next().transpose()?;
        let schema = cached.as_ref().map(|b| b.schema().clone());
        Ok(Self {
            state: OperatorState::default(),
            source,
            cached,
            schema,
        })
    }
}

impl Operator for IteratorScan {
    fn name(&self) -> &'static str {
        "IteratorScan"
    }

    fn state(&self) -> &OperatorState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut OperatorState {
        &mut self.state
    }

    fn children(&self) -> &[Box<dyn Operator>] {
        &[]
    }

    fn children_mut(&mut self) -> &mut [Box<dyn Operator>] {
        &mut []
    }

    fn set_children(&mut self, children: Vec<Box<dyn Operator>>) -> Result<()> {
        leaf_children(self.name(), children)
    }

    fn schema(&self) -> Option<Schema> {
        self.schema.clone()
    }

    fn fetch_next(&mut self) -> Result<Option<Batch>> {
        if let Some(batch) = self.cached.take() {
            return Ok(Some(batch));
        }
        self.source.next().transpose()
    }
}

/// Reads fixed-width records laid out column after column, big-endian by
/// default. String columns have no fixed width and are rejected.
pub struct BinaryFileScan {
    state: OperatorState,
    schema: Schema,
    path: PathBuf,
    little_endian: bool,
    batch_size: usize,
    record_len: usize,
    reader: Option<BufReader<File>>,
}

impl BinaryFileScan {
    pub fn new(schema: Schema, path: impl AsRef<Path>) -> Result<Self> {
        let mut record_len = 0;
        for (i, ty) in schema.types().iter().enumerate() {
            record_len += ty.fixed_width().ok_or_else(|| {
                StrandError::InvalidConfig(format!(
                    "binary scan cannot read {ty} column {i}"
                ))
            })?;
        }
        if record_len == 0 {
            return Err(StrandError::InvalidConfig(
                "binary scan requires at least one column".to_string(),
            ));
        }
        Ok(Self {
            state: OperatorState::default(),
            schema,
            path: path.as_ref().to_path_buf(),
            little_endian: false,
            batch_size: DEFAULT_BATCH_SIZE,
            record_len,
            reader: None,
        })
    }

    pub fn little_endian(mut self, little_endian: bool) -> Self {
        self.little_endian = little_endian;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

fn decode_record(
    types: &[ColumnType],
    little_endian: bool,
    record: &[u8],
    out: &mut BatchBuilder,
) -> Result<()> {
    let mut offset = 0;
    for (col, ty) in types.iter().enumerate() {
        match ty {
            ColumnType::Boolean => {
                out.put_boolean(col, record[offset] != 0)?;
                offset += 1;
            }
            ColumnType::Int => {
                let raw = fixed::<4>(&record[offset..offset + 4]);
                let v = if little_endian {
                    i32::from_le_bytes(raw)
                } else {
                    i32::from_be_bytes(raw)
                };
                out.put_int(col, v)?;
                offset += 4;
            }
            ColumnType::Long => {
                let raw = fixed::<8>(&record[offset..offset + 8]);
                let v = if little_endian {
                    i64::from_le_bytes(raw)
                } else {
                    i64::from_be_bytes(raw)
                };
                out.put_long(col, v)?;
                offset += 8;
            }
            ColumnType::Float => {
                let raw = fixed::<4>(&record[offset..offset + 4]);
                let v = if little_endian {
                    f32::from_le_bytes(raw)
                } else {
                    f32::from_be_bytes(raw)
                };
                out.put_float(col, v)?;
                offset += 4;
            }
            ColumnType::Double => {
                let raw = fixed::<8>(&record[offset..offset + 8]);
                let v = if little_endian {
                    f64::from_le_bytes(raw)
                } else {
                    f64::from_be_bytes(raw)
                };
                out.put_double(col, v)?;
                offset += 8;
            }
            ColumnType::String => {
                return Err(StrandError::Execution(format!(
                    "binary scan cannot decode STRING column {col}"
                )))
            }
        }
    }
    Ok(())
}

fn fixed<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    out
}

/// Fill `buf` with one record. `Ok(false)` on a clean end of file.
fn read_record(reader: &mut impl Read, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    match filled {
        0 => Ok(false),
        n if n == buf.len() => Ok(true),
        n => Err(StrandError::Execution(format!(
            "truncated record: read {n} of {} bytes",
            buf.len()
        ))),
    }
}

impl Operator for BinaryFileScan {
    fn name(&self) -> &'static str {
        "BinaryFileScan"
    }

    fn state(&self) -> &OperatorState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut OperatorState {
        &mut self.state
    }

    fn children(&self) -> &[Box<dyn Operator>] {
        &[]
    }

    fn children_mut(&mut self) -> &mut [Box<dyn Operator>] {
        &mut []
    }

    fn set_children(&mut self, children: Vec<Box<dyn Operator>>) -> Result<()> {
        leaf_children(self.name(), children)
    }

    fn schema(&self) -> Option<Schema> {
        Some(self.schema.clone())
    }

    fn init(&mut self) -> Result<()> {
        let file = File::open(&self.path)?;
        debug!(
            operator = "BinaryFileScan",
            path = %self.path.display(),
            little_endian = self.little_endian,
            "opened binary input"
        );
        self.reader = Some(BufReader::new(file));
        Ok(())
    }

    fn cleanup(&mut self) -> Result<()> {
        self.reader = None;
        Ok(())
    }

    fn fetch_next(&mut self) -> Result<Option<Batch>> {
        let reader = self.reader.as_mut().ok_or_else(|| {
            StrandError::Execution("binary scan read before open".to_string())
        })?;
        let mut builder = BatchBuilder::with_capacity(self.schema.clone(), self.batch_size);
        let mut record = vec![0_u8; self.record_len];
        while builder.num_tuples() < self.batch_size {
            if !read_record(&mut *reader, &mut record)? {
                break;
            }
            decode_record(self.schema.types(), self.little_endian, &record, &mut builder)?;
        }
        if builder.is_empty() {
            return Ok(None);
        }
        builder.finish().map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_path(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock before epoch")
            .as_nanos();
        std::env::temp_dir().join(format!("strand_{name}_{nanos}.bin"))
    }

    fn int_batch(values: &[i32]) -> Batch {
        let mut b = BatchBuilder::new(Schema::new([("v", ColumnType::Int)]));
        for v in values {
            b.put_int(0, *v).expect("put");
        }
        b.finish().expect("finish")
    }

    #[test]
    fn iterator_scan_discovers_schema_from_first_batch() {
        let batches = vec![Ok(int_batch(&[1, 2])), Ok(int_batch(&[3]))];
        let mut scan = IteratorScan::new(batches.into_iter()).expect("scan");
        assert_eq!(scan.schema().expect("schema").num_columns(), 1);
        scan.open().expect("open");
        let mut total = 0;
        while let Some(b) = scan.next().expect("next") {
            total += b.num_tuples();
        }
        assert_eq!(total, 3);
        assert!(scan.eos());
    }

    #[test]
    fn iterator_scan_over_empty_source_has_no_schema() {
        let scan = IteratorScan::new(std::iter::empty()).expect("scan");
        assert!(scan.schema().is_none());
    }

    #[test]
    fn iterator_scan_surfaces_first_batch_error() {
        let source = vec![Err(StrandError::Execution("source down".to_string()))];
        assert!(IteratorScan::new(source.into_iter()).is_err());
    }

    #[test]
    fn memory_scan_reports_round_boundaries() {
        let schema = Schema::new([("v", ColumnType::Int)]);
        let mut scan =
            MemoryScan::with_rounds(schema, vec![vec![int_batch(&[1])], vec![int_batch(&[2])]]);
        scan.open().expect("open");
        assert!(scan.next().expect("next").is_some());
        assert!(scan.next().expect("next").is_none());
        assert!(scan.eoi() && !scan.eos());
        scan.set_eoi(false);
        assert_eq!(scan.next().expect("next").expect("batch").get_int(0, 0).expect("v"), 2);
        assert!(scan.next().expect("next").is_none());
        assert!(scan.eos());
    }

    #[test]
    fn binary_scan_reads_big_endian_records() {
        let path = temp_path("binary_scan");
        let mut bytes = Vec::new();
        for (id, score) in [(1_i32, 0.5_f64), (2, 1.5), (3, -2.0)] {
            bytes.extend_from_slice(&id.to_be_bytes());
            bytes.extend_from_slice(&score.to_be_bytes());
        }
        std::fs::write(&path, &bytes).expect("write input");

        let schema = Schema::new([("id", ColumnType::Int), ("score", ColumnType::Double)]);
        let mut scan = BinaryFileScan::new(schema, &path)
            .expect("scan")
            .with_batch_size(2);
        scan.open().expect("open");
        let first = scan.next().expect("next").expect("batch");
        let second = scan.next().expect("next").expect("batch");
        assert!(scan.next().expect("next").is_none());
        assert!(scan.eos());
        scan.close().expect("close");
        let _ = std::fs::remove_file(&path);

        assert_eq!(first.int_values(0).expect("ids"), &[1, 2]);
        assert_eq!(second.get_int(0, 0).expect("id"), 3);
        assert_eq!(second.get_double(1, 0).expect("score"), -2.0);
    }

    #[test]
    fn binary_scan_rejects_truncated_record() {
        let path = temp_path("binary_truncated");
        std::fs::write(&path, [0_u8, 0, 0, 1, 0, 0]).expect("write input");
        let schema = Schema::new([("id", ColumnType::Int)]);
        let mut scan = BinaryFileScan::new(schema, &path).expect("scan").little_endian(true);
        scan.open().expect("open");
        let err = scan.next().expect_err("truncated");
        let _ = std::fs::remove_file(&path);
        assert!(err.to_string().contains("truncated record"));
    }

    #[test]
    fn binary_scan_rejects_string_columns() {
        let schema = Schema::new([("name", ColumnType::String)]);
        assert!(matches!(
            BinaryFileScan::new(schema, "unused"),
            Err(StrandError::InvalidConfig(_))
        ));
    }
}
