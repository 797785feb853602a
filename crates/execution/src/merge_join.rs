//! Sort-merge equi-join over two inputs sorted on their join keys.

use std::cmp::Ordering;
use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use strand_common::{Result, StrandError, DEFAULT_BATCH_SIZE};
use tracing::trace;

use crate::batch::{Batch, BatchBuffer, Schema};
use crate::operator::{expect_children, Operator, OperatorState};

/// Join configuration. Key lists pair up position by position; `ascending`
/// gives the sort direction of each key position in both inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeJoinConfig {
    pub left_keys: Vec<usize>,
    pub right_keys: Vec<usize>,
    pub left_select: Vec<usize>,
    pub right_select: Vec<usize>,
    pub output_names: Option<Vec<String>>,
    pub ascending: Vec<bool>,
}

impl MergeJoinConfig {
    pub fn validate(&self) -> Result<()> {
        if self.left_keys.is_empty() {
            return Err(StrandError::InvalidConfig(
                "merge join requires at least one key column".to_string(),
            ));
        }
        if self.left_keys.len() != self.right_keys.len() {
            return Err(StrandError::InvalidConfig(format!(
                "merge join key lists differ in length: {} vs {}",
                self.left_keys.len(),
                self.right_keys.len()
            )));
        }
        if self.ascending.len() != self.left_keys.len() {
            return Err(StrandError::InvalidConfig(format!(
                "merge join has {} keys but {} sort directions",
                self.left_keys.len(),
                self.ascending.len()
            )));
        }
        if self.left_select.is_empty() && self.right_select.is_empty() {
            return Err(StrandError::InvalidConfig(
                "merge join must output at least one column".to_string(),
            ));
        }
        if let Some(names) = &self.output_names {
            let width = self.left_select.len() + self.right_select.len();
            if names.len() != width {
                return Err(StrandError::InvalidConfig(format!(
                    "merge join outputs {width} columns but {} names were given",
                    names.len()
                )));
            }
        }
        Ok(())
    }

    fn compare(&self, left: &Batch, lrow: usize, right: &Batch, rrow: usize) -> Result<Ordering> {
        for (i, (&lk, &rk)) in self.left_keys.iter().zip(&self.right_keys).enumerate() {
            let ord = left.value(lk, lrow)?.cmp_total(&right.value(rk, rrow)?);
            let ord = if self.ascending[i] { ord } else { ord.reverse() };
            if ord != Ordering::Equal {
                return Ok(ord);
            }
        }
        Ok(Ordering::Equal)
    }

    fn output_schema(&self, left: &Schema, right: &Schema) -> Result<Schema> {
        check_columns("left key", &self.left_keys, left)?;
        check_columns("right key", &self.right_keys, right)?;
        check_columns("left select", &self.left_select, left)?;
        check_columns("right select", &self.right_select, right)?;
        for (&lk, &rk) in self.left_keys.iter().zip(&self.right_keys) {
            let (lt, rt) = (left.column_type(lk)?, right.column_type(rk)?);
            if lt != rt && !(lt.is_numeric() && rt.is_numeric()) {
                return Err(StrandError::InvalidConfig(format!(
                    "cannot join {lt} key column {lk} with {rt} key column {rk}"
                )));
            }
        }
        let projected = left
            .project(&self.left_select)?
            .merge(&right.project(&self.right_select)?);
        match &self.output_names {
            Some(names) => {
                let schema =
                    Schema::from_types_and_names(projected.types().to_vec(), names.clone())?;
                schema.ensure_unique_names()?;
                Ok(schema)
            }
            None => Ok(projected),
        }
    }
}

fn check_columns(what: &str, columns: &[usize], schema: &Schema) -> Result<()> {
    match columns.iter().find(|&&c| c >= schema.num_columns()) {
        Some(c) => Err(StrandError::InvalidConfig(format!(
            "{what} column {c} out of range for input with {} columns",
            schema.num_columns()
        ))),
        None => Ok(()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Left,
    Right,
}

/// Outcome of asking a side for more input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pull {
    Ready,
    Exhausted,
    Suspended,
}

/// Buffered batches of one input plus the current row in the front batch.
#[derive(Debug, Default)]
struct Cursor {
    batches: VecDeque<Batch>,
    row: usize,
}

/// Position `(batch index, row)` within a cursor's buffered batches.
type Position = (usize, usize);

impl Cursor {
    fn normalize(&mut self) {
        while let Some(front) = self.batches.front() {
            if self.row < front.num_tuples() {
                break;
            }
            self.batches.pop_front();
            self.row = 0;
        }
    }

    fn current(&self) -> Option<(&Batch, usize)> {
        self.batches
            .front()
            .filter(|b| self.row < b.num_tuples())
            .map(|b| (b, self.row))
    }

    fn advance_one(&mut self) {
        self.row += 1;
        self.normalize();
    }

    /// Move to `end`, dropping fully consumed batches.
    fn seek(&mut self, (batch, row): Position) {
        self.batches.drain(..batch.min(self.batches.len()));
        self.row = row;
        self.normalize();
    }

    /// Positions from the current row up to, not including, `end`.
    fn positions_until(&self, end: Position) -> Vec<Position> {
        let mut out = Vec::new();
        let (mut b, mut r) = (0, self.row);
        while (b, r) < end && b < self.batches.len() {
            if r < self.batches[b].num_tuples() {
                out.push((b, r));
                r += 1;
            } else {
                b += 1;
                r = 0;
            }
        }
        out
    }
}

/// Pull one non-empty batch from `child` into `cursor`.
fn pull(child: &mut Box<dyn Operator>, cursor: &mut Cursor) -> Result<Pull> {
    match child.next()? {
        Some(batch) => {
            cursor.batches.push_back(batch);
            Ok(Pull::Ready)
        }
        None if child.eos() => Ok(Pull::Exhausted),
        None => Ok(Pull::Suspended),
    }
}

/// Make sure the cursor points at a row, pulling if needed.
fn fill(child: &mut Box<dyn Operator>, cursor: &mut Cursor) -> Result<Pull> {
    cursor.normalize();
    if cursor.current().is_some() {
        return Ok(Pull::Ready);
    }
    pull(child, cursor)
}

/// Find the end of the run of rows sharing the current row's key, pulling
/// more input while the run touches the end of the buffer. `None` when the
/// child suspended before the run could be closed.
fn run_end(
    child: &mut Box<dyn Operator>,
    cursor: &mut Cursor,
    keys: &[usize],
) -> Result<Option<Position>> {
    let start = cursor.row;
    let (mut b, mut r) = (0, start);
    loop {
        r += 1;
        while b < cursor.batches.len() && r >= cursor.batches[b].num_tuples() {
            b += 1;
            r = 0;
        }
        if b == cursor.batches.len() {
            match pull(child, cursor)? {
                Pull::Ready => {}
                Pull::Exhausted => return Ok(Some((b, 0))),
                Pull::Suspended => return Ok(None),
            }
        }
        let head = &cursor.batches[0];
        let probe = &cursor.batches[b];
        for &k in keys {
            if head.value(k, start)?.cmp_total(&probe.value(k, r)?) != Ordering::Equal {
                return Ok(Some((b, r)));
            }
        }
    }
}

enum Step {
    Progress,
    Finished,
    Suspended,
}

/// Inner equi-join of two key-sorted children.
///
/// Runs of equal keys may span batch boundaries on either side. When a
/// child reports end-of-iteration the join stops where it is, reports EOI
/// itself, and continues from the same cursor positions in the next round.
pub struct MergeJoin {
    state: OperatorState,
    children: Vec<Box<dyn Operator>>,
    config: MergeJoinConfig,
    schema: Option<Schema>,
    batch_size: usize,
    left: Cursor,
    right: Cursor,
    output: Option<BatchBuffer>,
    finished: bool,
}

impl MergeJoin {
    pub fn new(config: MergeJoinConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            state: OperatorState::default(),
            children: Vec::new(),
            config,
            schema: None,
            batch_size: DEFAULT_BATCH_SIZE,
            left: Cursor::default(),
            right: Cursor::default(),
            output: None,
            finished: false,
        })
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_children(
        mut self,
        left: Box<dyn Operator>,
        right: Box<dyn Operator>,
    ) -> Result<Self> {
        self.set_children(vec![left, right])?;
        Ok(self)
    }

    pub fn config(&self) -> &MergeJoinConfig {
        &self.config
    }

    fn side(&mut self, side: Side) -> (&mut Box<dyn Operator>, &mut Cursor) {
        let (left_child, right_child) = self.children.split_at_mut(1);
        match side {
            Side::Left => (&mut left_child[0], &mut self.left),
            Side::Right => (&mut right_child[0], &mut self.right),
        }
    }

    fn step(&mut self) -> Result<Step> {
        for side in [Side::Left, Side::Right] {
            let (child, cursor) = self.side(side);
            match fill(child, cursor)? {
                Pull::Ready => {}
                Pull::Exhausted => return Ok(Step::Finished),
                Pull::Suspended => return Ok(Step::Suspended),
            }
        }
        let ord = match (self.left.current(), self.right.current()) {
            (Some((lb, lr)), Some((rb, rr))) => self.config.compare(lb, lr, rb, rr)?,
            _ => return Ok(Step::Suspended),
        };
        match ord {
            Ordering::Less => self.left.advance_one(),
            Ordering::Greater => self.right.advance_one(),
            Ordering::Equal => {
                let left_keys = self.config.left_keys.clone();
                let right_keys = self.config.right_keys.clone();
                let (child, cursor) = self.side(Side::Left);
                let Some(left_end) = run_end(child, cursor, &left_keys)? else {
                    return Ok(Step::Suspended);
                };
                let (child, cursor) = self.side(Side::Right);
                let Some(right_end) = run_end(child, cursor, &right_keys)? else {
                    return Ok(Step::Suspended);
                };
                self.emit_group(left_end, right_end)?;
                self.left.seek(left_end);
                self.right.seek(right_end);
            }
        }
        Ok(Step::Progress)
    }

    fn emit_group(&mut self, left_end: Position, right_end: Position) -> Result<()> {
        let output = self
            .output
            .as_mut()
            .ok_or_else(|| StrandError::Execution("merge join pulled before open".to_string()))?;
        let left_rows = self.left.positions_until(left_end);
        let right_rows = self.right.positions_until(right_end);
        trace!(
            operator = "MergeJoin",
            left = left_rows.len(),
            right = right_rows.len(),
            "joining key group"
        );
        let width = self.config.left_select.len();
        for &(lb, lr) in &left_rows {
            let lbatch = &self.left.batches[lb];
            for &(rb, rr) in &right_rows {
                let rbatch = &self.right.batches[rb];
                for (out, &src) in self.config.left_select.iter().enumerate() {
                    output.put_from(out, lbatch, src, lr)?;
                }
                for (out, &src) in self.config.right_select.iter().enumerate() {
                    output.put_from(width + out, rbatch, src, rr)?;
                }
            }
        }
        Ok(())
    }
}

impl Operator for MergeJoin {
    fn name(&self) -> &'static str {
        "MergeJoin"
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
        expect_children(self.name(), 2, &children)?;
        let left = children[0].schema().ok_or_else(|| {
            StrandError::InvalidConfig("merge join left child has no schema".to_string())
        })?;
        let right = children[1].schema().ok_or_else(|| {
            StrandError::InvalidConfig("merge join right child has no schema".to_string())
        })?;
        self.schema = Some(self.config.output_schema(&left, &right)?);
        self.children = children;
        Ok(())
    }

    fn schema(&self) -> Option<Schema> {
        self.schema.clone()
    }

    fn init(&mut self) -> Result<()> {
        let schema = self.schema.clone().ok_or_else(|| {
            StrandError::InvalidConfig("merge join opened without children".to_string())
        })?;
        self.output = Some(BatchBuffer::with_batch_size(schema, self.batch_size));
        self.left = Cursor::default();
        self.right = Cursor::default();
        self.finished = false;
        Ok(())
    }

    fn cleanup(&mut self) -> Result<()> {
        self.output = None;
        self.left = Cursor::default();
        self.right = Cursor::default();
        Ok(())
    }

    fn fetch_next(&mut self) -> Result<Option<Batch>> {
        loop {
            let output = self.output.as_mut().ok_or_else(|| {
                StrandError::Execution("merge join pulled before open".to_string())
            })?;
            if let Some(batch) = output.pop_filled() {
                return Ok(Some(batch));
            }
            if self.finished {
                return output.pop_any();
            }
            match self.step()? {
                Step::Progress => {}
                Step::Finished => self.finished = true,
                Step::Suspended => {
                    return match self.output.as_mut() {
                        Some(output) => output.pop_any(),
                        None => Ok(None),
                    }
                }
            }
        }
    }

    fn check_eos_and_eoi(&mut self) {
        let drained = self.output.as_ref().map_or(true, BatchBuffer::is_empty);
        if self.finished && drained {
            self.state.set_eos();
            return;
        }
        if self.children.iter().any(|c| c.eoi()) {
            for child in &mut self.children {
                if child.eoi() {
                    child.set_eoi(false);
                }
            }
            self.state.set_eoi(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{BatchBuilder, ColumnType};
    use crate::scan::MemoryScan;

    fn kv_schema() -> Schema {
        Schema::new([("k", ColumnType::Int), ("v", ColumnType::String)])
    }

    fn kv(rows: &[(i32, &str)]) -> Batch {
        let mut b = BatchBuilder::new(kv_schema());
        for (k, v) in rows {
            b.put_int(0, *k).expect("k");
            b.put_string(1, v).expect("v");
        }
        b.finish().expect("finish")
    }

    fn config() -> MergeJoinConfig {
        MergeJoinConfig {
            left_keys: vec![0],
            right_keys: vec![0],
            left_select: vec![0, 1],
            right_select: vec![0, 1],
            output_names: Some(vec!["lk".into(), "lv".into(), "rk".into(), "rv".into()]),
            ascending: vec![true],
        }
    }

    fn rows_of(join: &mut MergeJoin) -> Vec<(i32, String, i32, String)> {
        let mut out = Vec::new();
        while let Some(b) = join.next().expect("next") {
            for r in 0..b.num_tuples() {
                out.push((
                    b.get_int(0, r).expect("lk"),
                    b.get_string(1, r).expect("lv").to_string(),
                    b.get_int(2, r).expect("rk"),
                    b.get_string(3, r).expect("rv").to_string(),
                ));
            }
        }
        out
    }

    #[test]
    fn validates_configuration() {
        let mut c = config();
        c.left_keys.clear();
        c.right_keys.clear();
        c.ascending.clear();
        assert!(MergeJoin::new(c).is_err());

        let mut c = config();
        c.right_keys.push(1);
        assert!(MergeJoin::new(c).is_err());

        let mut c = config();
        c.left_select.clear();
        c.right_select.clear();
        c.output_names = None;
        let err = MergeJoin::new(c).err().expect("zero-width output");
        assert!(err.to_string().contains("at least one column"));

        let mut c = config();
        c.left_select = vec![7];
        c.output_names = None;
        let join = MergeJoin::new(c).expect("join");
        let err = join
            .with_children(
                Box::new(MemoryScan::new(kv_schema(), vec![])),
                Box::new(MemoryScan::new(kv_schema(), vec![])),
            )
            .err()
            .expect("bad index");
        assert!(matches!(err, StrandError::InvalidConfig(_)));
    }

    #[test]
    fn rejects_incompatible_key_types() {
        let mut c = config();
        c.right_keys = vec![1];
        let join = MergeJoin::new(c).expect("join");
        assert!(join
            .with_children(
                Box::new(MemoryScan::new(kv_schema(), vec![])),
                Box::new(MemoryScan::new(kv_schema(), vec![])),
            )
            .is_err());
    }

    #[test]
    fn requires_two_children() {
        let mut join = MergeJoin::new(config()).expect("join");
        let err = join
            .set_children(vec![Box::new(MemoryScan::new(kv_schema(), vec![]))])
            .expect_err("one child");
        assert!(matches!(err, StrandError::InvalidConfig(_)));
    }

    #[test]
    fn output_names_default_to_child_columns() {
        let mut c = config();
        c.output_names = None;
        c.right_select = vec![1];
        let join = MergeJoin::new(c)
            .expect("join")
            .with_children(
                Box::new(MemoryScan::new(kv_schema(), vec![])),
                Box::new(MemoryScan::new(kv_schema(), vec![])),
            )
            .expect("wire");
        assert_eq!(join.schema().expect("schema").column_names(), vec!["k", "v", "v"]);
    }

    #[test]
    fn suspends_on_child_round_boundary_and_resumes() {
        let left = MemoryScan::with_rounds(
            kv_schema(),
            vec![vec![kv(&[(1, "a"), (2, "b")])], vec![kv(&[(2, "c"), (3, "d")])]],
        );
        let right = MemoryScan::new(kv_schema(), vec![kv(&[(2, "x"), (3, "y")])]);
        let mut join = MergeJoin::new(config())
            .expect("join")
            .with_children(Box::new(left), Box::new(right))
            .expect("wire");
        join.open().expect("open");

        let first = rows_of(&mut join);
        assert!(first.is_empty(), "run for key 2 is still open: {first:?}");
        assert!(join.eoi() && !join.eos());

        join.set_eoi(false);
        let second = rows_of(&mut join);
        assert_eq!(
            second,
            vec![
                (2, "b".to_string(), 2, "x".to_string()),
                (2, "c".to_string(), 2, "x".to_string()),
                (3, "d".to_string(), 3, "y".to_string()),
            ]
        );
        assert!(join.eos());
        join.close().expect("close");
    }
}
