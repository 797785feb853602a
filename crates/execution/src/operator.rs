//! Pull-based operator protocol.
//!
//! Every operator is a node in a tree that exclusively owns its children.
//! Parents pull batches with [`Operator::next`]; a `None` return is not
//! terminal by itself. Callers inspect [`Operator::eos`] (no more data, ever)
//! and [`Operator::eoi`] (end of the current iteration round) to decide
//! whether to stop, or clear the round flag and pull again.

use std::fmt;

use strand_common::{global_metrics, Result, StrandError};

use crate::batch::{Batch, Schema};

/// Lifecycle phase derived from an operator's flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorPhase {
    Closed,
    Running,
    AwaitingNextRound,
    Exhausted,
}

/// Flags shared by every operator: opened, end-of-stream, end-of-iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperatorState {
    open: bool,
    eos: bool,
    eoi: bool,
}

impl OperatorState {
    pub fn phase(&self) -> OperatorPhase {
        match (self.open, self.eos, self.eoi) {
            (false, _, _) => OperatorPhase::Closed,
            (true, true, _) => OperatorPhase::Exhausted,
            (true, false, true) => OperatorPhase::AwaitingNextRound,
            (true, false, false) => OperatorPhase::Running,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn eos(&self) -> bool {
        self.eos
    }

    pub fn eoi(&self) -> bool {
        self.eoi
    }

    /// EOS is sticky for the lifetime of the instance.
    pub fn set_eos(&mut self) {
        self.eos = true;
    }

    pub fn set_eoi(&mut self, eoi: bool) {
        self.eoi = eoi;
    }

    fn mark_open(&mut self) {
        self.open = true;
    }

    fn mark_closed(&mut self) {
        self.open = false;
    }
}

/// A dataflow operator.
///
/// Implementors provide the operator-specific hooks (`fetch_next`, `init`,
/// `cleanup`, child wiring); the iteration driver, open/close recursion and
/// flag handling are provided.
pub trait Operator: Send {
    fn name(&self) -> &'static str;

    fn state(&self) -> &OperatorState;

    fn state_mut(&mut self) -> &mut OperatorState;

    fn children(&self) -> &[Box<dyn Operator>];

    fn children_mut(&mut self) -> &mut [Box<dyn Operator>];

    /// Replace the children. Leaves reject this with `Unsupported`,
    /// fixed-arity operators reject wrong counts with `InvalidConfig`.
    fn set_children(&mut self, children: Vec<Box<dyn Operator>>) -> Result<()>;

    /// Output schema; `None` while undefined (e.g. a discovered source with no data).
    fn schema(&self) -> Option<Schema>;

    /// Operator-specific setup, run after the children are open.
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    /// Operator-specific teardown, run once per successful open.
    fn cleanup(&mut self) -> Result<()> {
        Ok(())
    }

    /// Produce the next batch, or `None` when nothing is available right now.
    fn fetch_next(&mut self) -> Result<Option<Batch>>;

    /// Update EOS/EOI after `fetch_next` returned `None`.
    fn check_eos_and_eoi(&mut self) {
        check_children_eos_and_eoi(self);
    }

    fn open(&mut self) -> Result<()> {
        if self.state().is_open() {
            return Ok(());
        }
        for child in self.children_mut() {
            child.open()?;
        }
        self.init()?;
        self.state_mut().mark_open();
        Ok(())
    }

    fn next(&mut self) -> Result<Option<Batch>> {
        if !self.state().is_open() {
            return Err(StrandError::Execution(format!(
                "operator {} pulled before open",
                self.name()
            )));
        }
        if self.eos() || self.eoi() {
            return Ok(None);
        }
        loop {
            match self.fetch_next()? {
                Some(batch) if batch.num_tuples() == 0 => continue,
                Some(batch) => return Ok(Some(batch)),
                None => {
                    self.check_eos_and_eoi();
                    return Ok(None);
                }
            }
        }
    }

    fn eos(&self) -> bool {
        self.state().eos()
    }

    fn eoi(&self) -> bool {
        self.state().eoi()
    }

    fn set_eoi(&mut self, eoi: bool) {
        self.state_mut().set_eoi(eoi);
    }

    /// Close children, then this operator. Safe to call more than once; the
    /// first error is returned after every child has been closed.
    fn close(&mut self) -> Result<()> {
        let mut first_err = None;
        for child in self.children_mut() {
            if let Err(e) = child.close() {
                first_err.get_or_insert(e);
            }
        }
        if self.state().is_open() {
            if let Err(e) = self.cleanup() {
                first_err.get_or_insert(e);
            }
            self.state_mut().mark_closed();
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for dyn Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(self.name())
            .field("state", self.state())
            .field("children", &self.children().len())
            .finish()
    }
}

/// Default flag propagation: a leaf with nothing left is at EOS; an inner
/// operator is at EOS when all children are, and at EOI when every child has
/// ended the round (EOS or EOI) and at least one reported EOI.
pub fn check_children_eos_and_eoi<O: Operator + ?Sized>(op: &mut O) {
    let children = op.children();
    if children.is_empty() {
        op.state_mut().set_eos();
        return;
    }
    let all_eos = children.iter().all(|c| c.eos());
    let round_over =
        children.iter().all(|c| c.eos() || c.eoi()) && children.iter().any(|c| c.eoi());
    if all_eos {
        op.state_mut().set_eos();
    } else if round_over {
        for child in op.children_mut() {
            if child.eoi() {
                child.set_eoi(false);
            }
        }
        op.state_mut().set_eoi(true);
    }
}

/// Reject `set_children` on a leaf.
pub fn leaf_children(name: &str, children: Vec<Box<dyn Operator>>) -> Result<()> {
    Err(StrandError::Unsupported(format!(
        "{name} is a leaf operator and cannot take {} children",
        children.len()
    )))
}

/// Check a fixed child count.
pub fn expect_children(
    name: &str,
    expected: usize,
    children: &[Box<dyn Operator>],
) -> Result<()> {
    if children.len() != expected {
        return Err(StrandError::InvalidConfig(format!(
            "{name} requires {expected} children, got {}",
            children.len()
        )));
    }
    Ok(())
}

/// Pull `root` until EOS, clearing EOI between rounds, handing every
/// non-empty batch to `on_batch`. Returns the number of tuples seen.
///
/// The tree must already be open; the caller closes it.
pub fn drive_to_eos(
    root: &mut dyn Operator,
    query_label: &str,
    mut on_batch: impl FnMut(Batch) -> Result<()>,
) -> Result<u64> {
    let metrics = global_metrics();
    let mut rows = 0_u64;
    while !root.eos() {
        match root.next()? {
            Some(batch) => {
                let tuples = batch.num_tuples() as u64;
                rows += tuples;
                metrics.record_operator_output(query_label, root.name(), tuples);
                on_batch(batch)?;
            }
            None => {
                if root.eoi() {
                    root.set_eoi(false);
                }
            }
        }
    }
    Ok(rows)
}
