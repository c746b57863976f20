//! Evaluator.
//!
//! Runs a [`VerifiedExpression`] on one operand stack. CALL, LOOP_N, DO_WHILE and
//! FOLD_CONTEXT open frames that are windows over that stack; nothing recurses on the host.
//! Every executed instruction burns one unit of fuel. `Set` writes are buffered and only
//! reach a store through [`Outcome::commit`].

use std::collections::BTreeMap;

use ruint::aliases::U256;
use tracing::{trace, warn};

use crate::opcode::Opcode;
use crate::operand::{CallOperand, ContextOperand, DoWhileOperand, FoldOperand, LoopOperand};
use crate::providers::Store;
use crate::report::ReportError;
use crate::table::{Eval, OpTable};
use crate::types::{Word, Context};
use crate::verify::{VerifiedExpression, VerifiedInstr};

pub type Fuel = u64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecError {
    #[error("fuel exhausted")]
    FuelExhausted,
    #[error("call depth exceeded")]
    CallDepthExceeded,
    #[error("source {0} is not an entrypoint")]
    NotEntrypoint(usize),
    #[error("overflow in {0:?}")]
    Overflow(Opcode),
    #[error("underflow in {0:?}")]
    Underflow(Opcode),
    #[error("division by zero in {0:?}")]
    DivisionByZero(Opcode),
    #[error("stack underflow in {0:?}")]
    StackUnderflow(Opcode),
    #[error("context cell ({column}, {row}) out of bounds")]
    ContextOutOfBounds { column: usize, row: usize },
    #[error("report: {0}")]
    Report(#[from] ReportError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    /// Host step budget: one unit per executed instruction.
    pub fuel_limit: Fuel,
    pub max_call_depth: usize,
    pub trace: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            fuel_limit: 1_000_000,
            max_call_depth: 256,
            trace: false,
        }
    }
}

impl VmConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = std::env::var("EXPR_VM_FUEL_LIMIT")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            cfg.fuel_limit = v;
        }
        if let Some(v) = std::env::var("EXPR_VM_MAX_CALL_DEPTH")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            cfg.max_call_depth = v;
        }
        cfg.trace = std::env::var("EXPR_VM_TRACE")
            .ok()
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes" | "on"))
            .unwrap_or(false);
        cfg
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct TraceStep {
    pub step: u64,
    pub source: usize,
    pub pc: usize,
    pub op: &'static str,
    pub operand: u16,
    pub fuel_after: u64,
    pub stack_depth: usize,
}

/// Result of one successful evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// Final stack, bottom first.
    pub stack: Vec<Word>,
    /// Buffered `Set` writes, key order. Not yet applied to any store.
    pub writes: Vec<(Word, Word)>,
    pub steps: u64,
    pub fuel_used: Fuel,
    pub trace: Vec<TraceStep>,
}

impl Outcome {
    pub fn top(&self) -> Option<Word> {
        self.stack.last().copied()
    }

    /// Applies the buffered writes to `store`.
    pub fn commit<S: Store + ?Sized>(&self, store: &mut S) {
        for (k, v) in &self.writes {
            store.set(*k, *v);
        }
    }
}

/// What happens when a frame runs off the end of its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Entry,
    Call,
    LoopN { remaining: u8 },
    DoWhile,
    Fold { column: usize, width: usize, row: usize, rows: usize },
}

/// A window over the shared operand stack, `base..top`, running one source.
#[derive(Debug, Clone, Copy)]
struct Frame {
    source: usize,
    pc: usize,
    base: usize,
    kind: FrameKind,
}

pub struct Vm<'a, S: Store + ?Sized> {
    table: &'a OpTable,
    cfg: VmConfig,
    store: &'a S,
}

impl<'a, S: Store + ?Sized> Vm<'a, S> {
    pub fn new(table: &'a OpTable, cfg: VmConfig, store: &'a S) -> Self {
        Self { table, cfg, store }
    }

    pub fn config(&self) -> &VmConfig {
        &self.cfg
    }

    /// Evaluates entrypoint `source` of `expr` against `context`.
    ///
    /// All-or-nothing: an abort returns only the error, never a partial stack or partial
    /// writes. State is allocated per call, so one `Vm` may evaluate concurrently shared
    /// expressions from several threads.
    pub fn evaluate(
        &self,
        expr: &VerifiedExpression,
        source: usize,
        context: &Context,
    ) -> Result<Outcome, ExecError> {
        if !expr.is_entrypoint(source) {
            return Err(ExecError::NotEntrypoint(source));
        }
        let mut state = EvalState {
            table: self.table,
            cfg: &self.cfg,
            store: self.store,
            expr,
            context,
            stack: Vec::with_capacity(expr.stack_capacity()),
            frames: Vec::with_capacity(8),
            writes: BTreeMap::new(),
            steps: 0,
            fuel_used: 0,
            trace: Vec::new(),
        };
        match state.run(source) {
            Ok(()) => Ok(Outcome {
                stack: state.stack,
                writes: state.writes.into_iter().collect(),
                steps: state.steps,
                fuel_used: state.fuel_used,
                trace: state.trace,
            }),
            Err(e) => {
                warn!(source, steps = state.steps, error = %e, "evaluation aborted");
                Err(e)
            }
        }
    }
}

struct EvalState<'a, S: Store + ?Sized> {
    table: &'a OpTable,
    cfg: &'a VmConfig,
    store: &'a S,
    expr: &'a VerifiedExpression,
    context: &'a Context,
    stack: Vec<Word>,
    frames: Vec<Frame>,
    writes: BTreeMap<Word, Word>,
    steps: u64,
    fuel_used: Fuel,
    trace: Vec<TraceStep>,
}

impl<'a, S: Store + ?Sized> EvalState<'a, S> {
    fn charge(&mut self, units: Fuel) -> Result<(), ExecError> {
        let next = self.fuel_used.saturating_add(units);
        if next > self.cfg.fuel_limit {
            return Err(ExecError::FuelExhausted);
        }
        self.fuel_used = next;
        Ok(())
    }

    fn pop(&mut self, op: Opcode) -> Result<Word, ExecError> {
        self.stack.pop().ok_or(ExecError::StackUnderflow(op))
    }

    /// Stack index `n` words below the top.
    fn below(&self, n: usize, op: Opcode) -> Result<usize, ExecError> {
        self.stack
            .len()
            .checked_sub(n)
            .ok_or(ExecError::StackUnderflow(op))
    }

    fn push(&mut self, v: Word) {
        self.stack.push(v);
    }

    fn code(&self, source: usize) -> &'a [VerifiedInstr] {
        self.expr.source(source).unwrap_or(&[])
    }

    fn enter(&mut self, source: usize, base: usize, kind: FrameKind) -> Result<(), ExecError> {
        if self.frames.len() >= self.cfg.max_call_depth {
            return Err(ExecError::CallDepthExceeded);
        }
        trace!(source, base, ?kind, "enter frame");
        self.frames.push(Frame {
            source,
            pc: 0,
            base,
            kind,
        });
        Ok(())
    }

    fn run(&mut self, entry: usize) -> Result<(), ExecError> {
        self.enter(entry, 0, FrameKind::Entry)?;
        while let Some(frame) = self.frames.last().copied() {
            match self.code(frame.source).get(frame.pc).copied() {
                Some(ins) => {
                    if let Some(top) = self.frames.last_mut() {
                        top.pc += 1;
                    }
                    self.charge(1)?;
                    self.steps += 1;
                    self.step(frame, ins)?;
                    if self.cfg.trace {
                        self.trace.push(TraceStep {
                            step: self.steps,
                            source: frame.source,
                            pc: frame.pc,
                            op: self.table.get(ins.opcode).name,
                            operand: ins.operand,
                            fuel_after: self.fuel_used,
                            stack_depth: self.stack.len(),
                        });
                    }
                }
                None => self.leave(frame)?,
            }
        }
        Ok(())
    }

    fn step(&mut self, frame: Frame, ins: VerifiedInstr) -> Result<(), ExecError> {
        let spec = self.table.get(ins.opcode);
        if let Eval::Pure(f) = spec.eval {
            let n = spec.inputs.resolve(ins.operand);
            let at = self.below(n, ins.opcode)?;
            let out = f(ins.operand, &self.stack[at..])?;
            self.stack.truncate(at);
            self.push(out);
            return Ok(());
        }

        match ins.opcode {
            Opcode::Constant => {
                let v = self.expr.constants()[usize::from(ins.operand)];
                self.push(v);
            }
            Opcode::Context => {
                let cell = ContextOperand::decode(ins.operand);
                let v = self.context_cell(cell.column.into(), cell.row.into())?;
                self.push(v);
            }
            Opcode::Stack => {
                let v = self.stack[frame.base + usize::from(ins.operand)];
                self.push(v);
            }
            Opcode::Call => {
                let call = CallOperand::decode(ins.operand);
                let base = self.below(call.inputs.into(), ins.opcode)?;
                self.enter(call.source.into(), base, FrameKind::Call)?;
            }
            Opcode::LoopN => {
                let l = LoopOperand::decode(ins.operand);
                if l.n > 0 {
                    let base = self.below(l.inputs.into(), ins.opcode)?;
                    self.enter(l.source.into(), base, FrameKind::LoopN { remaining: l.n - 1 })?;
                }
            }
            Opcode::DoWhile => {
                let d = DoWhileOperand::decode(ins.operand);
                if !self.pop(ins.opcode)?.is_zero() {
                    let base = self.below(d.inputs.into(), ins.opcode)?;
                    self.enter(d.source.into(), base, FrameKind::DoWhile)?;
                }
            }
            Opcode::FoldContext => {
                let fold = FoldOperand::decode(ins.operand);
                let column = usize::from(fold.column);
                let width = usize::from(fold.width);
                let rows = self.fold_rows(column, width)?;
                if rows > 0 {
                    let base = self.below(fold.accumulators.into(), ins.opcode)?;
                    self.push_row(column, width, 0)?;
                    self.enter(
                        fold.source.into(),
                        base,
                        FrameKind::Fold {
                            column,
                            width,
                            row: 0,
                            rows,
                        },
                    )?;
                }
            }
            Opcode::Storage => {
                let v = self.read(&U256::from(ins.operand));
                self.push(v);
            }
            Opcode::Get => {
                let key = self.pop(ins.opcode)?;
                let v = self.read(&key);
                self.push(v);
            }
            Opcode::Set => {
                let value = self.pop(ins.opcode)?;
                let key = self.pop(ins.opcode)?;
                self.writes.insert(key, value);
            }
            // every other opcode is pure
            _ => {}
        }
        Ok(())
    }

    fn leave(&mut self, frame: Frame) -> Result<(), ExecError> {
        debug_assert!(self.stack.len() >= frame.base);
        let restart = match frame.kind {
            FrameKind::Entry | FrameKind::Call => None,
            FrameKind::LoopN { remaining } => {
                (remaining > 0).then_some(FrameKind::LoopN { remaining: remaining - 1 })
            }
            FrameKind::DoWhile => {
                (!self.pop(Opcode::DoWhile)?.is_zero()).then_some(FrameKind::DoWhile)
            }
            FrameKind::Fold {
                column,
                width,
                row,
                rows,
            } => {
                let next = row + 1;
                if next < rows {
                    self.push_row(column, width, next)?;
                    Some(FrameKind::Fold {
                        column,
                        width,
                        row: next,
                        rows,
                    })
                } else {
                    None
                }
            }
        };
        match restart {
            Some(kind) => {
                if let Some(top) = self.frames.last_mut() {
                    top.pc = 0;
                    top.kind = kind;
                }
            }
            None => {
                trace!(source = frame.source, outputs = self.stack.len() - frame.base, "leave frame");
                self.frames.pop();
            }
        }
        Ok(())
    }

    fn context_cell(&self, column: usize, row: usize) -> Result<Word, ExecError> {
        self.context
            .get(column)
            .and_then(|c| c.get(row))
            .copied()
            .ok_or(ExecError::ContextOutOfBounds { column, row })
    }

    /// Rows a fold over `column..column + width` visits. Every folded column must hold at
    /// least as many rows as the first one.
    fn fold_rows(&self, column: usize, width: usize) -> Result<usize, ExecError> {
        let rows = self
            .context
            .get(column)
            .map(Vec::len)
            .ok_or(ExecError::ContextOutOfBounds { column, row: 0 })?;
        for c in column..column + width {
            let len = self
                .context
                .get(c)
                .map(Vec::len)
                .ok_or(ExecError::ContextOutOfBounds { column: c, row: 0 })?;
            if len < rows {
                return Err(ExecError::ContextOutOfBounds { column: c, row: len });
            }
        }
        Ok(rows)
    }

    fn push_row(&mut self, column: usize, width: usize, row: usize) -> Result<(), ExecError> {
        for c in column..column + width {
            let v = self.context_cell(c, row)?;
            self.push(v);
        }
        Ok(())
    }

    fn read(&self, key: &Word) -> Word {
        match self.writes.get(key) {
            Some(v) => *v,
            None => self.store.get(key),
        }
    }
}
