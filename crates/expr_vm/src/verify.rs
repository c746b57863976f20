//! Static integrity verification.
//!
//! Every source is walked once per distinct starting height with a symbolic stack height
//! interval. Nothing is executed: only the arities and operand predicates of the opcode table
//! are consulted. The body graph formed by CALL, LOOP_N, DO_WHILE and FOLD_CONTEXT targets is
//! collected first, so the entrypoint set does not depend on source order. A
//! [`VerifiedExpression`] is the only thing the evaluator accepts.

use std::collections::HashMap;

use tracing::debug;

use crate::opcode::Opcode;
use crate::operand::{CallOperand, DoWhileOperand, FoldOperand, LoopOperand};
use crate::table::{OpTable, OperandCtx};
use crate::types::{Expression, Word};

/// Sources are addressed by an 8-bit operand field.
pub const MAX_SOURCES: usize = 256;

/// Symbolic stack height, relative to the bottom of the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StackBounds {
    pub min: usize,
    pub max: usize,
}

impl StackBounds {
    pub const fn exact(h: usize) -> Self {
        Self { min: h, max: h }
    }

    fn apply(self, inputs: usize, outputs: usize) -> Self {
        Self {
            min: self.min - inputs + outputs,
            max: self.max - inputs + outputs,
        }
    }
}

impl std::fmt::Display for StackBounds {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.min == self.max {
            write!(f, "{}", self.min)
        } else {
            write!(f, "[{}, {}]", self.min, self.max)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    #[error("expression has no sources")]
    NoSources,
    #[error("expression has {0} sources (max 256)")]
    TooManySources(usize),
    #[error("unknown opcode {opcode:#04x} at source {src} offset {offset}")]
    UnknownOpcode {
        src: usize,
        offset: usize,
        opcode: u8,
    },
    #[error("stack underflow at source {src} offset {offset}: needs {needed}, has {available}")]
    StackUnderflow {
        src: usize,
        offset: usize,
        needed: usize,
        available: usize,
    },
    #[error("final stack {actual} below minimum {required}")]
    MinFinalStack { required: usize, actual: usize },
    #[error("loop body {body} shifts the stack: expected {expected}, ends at {actual}")]
    LoopShift {
        body: usize,
        expected: usize,
        actual: StackBounds,
    },
    #[error("tier {tier} out of range at source {src} offset {offset}")]
    MaxTier {
        src: usize,
        offset: usize,
        tier: usize,
    },
    #[error("call arity ({inputs} in, {outputs} out) out of range at source {src} offset {offset}")]
    CallArity {
        src: usize,
        offset: usize,
        inputs: u8,
        outputs: u8,
    },
    #[error("callee {callee} ends at {actual}, declared {expected} outputs")]
    CallOutputs {
        callee: usize,
        expected: usize,
        actual: StackBounds,
    },
    #[error("fold body {body} ends at {actual}, expected {expected} accumulators")]
    FoldOutputs {
        body: usize,
        expected: usize,
        actual: StackBounds,
    },
    #[error("select over {length} reports at source {src} offset {offset} (expected 1..=8)")]
    SelectArity {
        src: usize,
        offset: usize,
        length: usize,
    },
    #[error("operand {operand:#06x} out of range for {opcode:?} at source {src} offset {offset}")]
    OperandOutOfRange {
        src: usize,
        offset: usize,
        opcode: Opcode,
        operand: u16,
    },
    #[error("source {target} out of bounds at source {src} offset {offset}")]
    SourceOutOfBounds {
        src: usize,
        offset: usize,
        target: usize,
    },
    #[error("constant {index} out of bounds ({constants} constants) at source {src} offset {offset}")]
    ConstantOutOfBounds {
        src: usize,
        offset: usize,
        index: usize,
        constants: usize,
    },
    #[error("stack read {index} beyond frame height {height} at source {src} offset {offset}")]
    StackReadOutOfBounds {
        src: usize,
        offset: usize,
        index: usize,
        height: usize,
    },
    #[error("storage slot {slot} out of bounds ({slots} slots) at source {src} offset {offset}")]
    StorageOutOfBounds {
        src: usize,
        offset: usize,
        slot: u16,
        slots: u16,
    },
    #[error("source {0} is reachable from itself")]
    RecursiveCall(usize),
    #[error("stack reaches {peak}, limit {limit}")]
    StackTooDeep { peak: usize, limit: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyConfig {
    /// Number of fixed storage slots `Storage` may address.
    pub storage_slots: u16,
    /// Upper bound on the stack any entrypoint may reach.
    pub max_stack: usize,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            storage_slots: 16,
            max_stack: 1024,
        }
    }
}

impl VerifyConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = std::env::var("EXPR_VM_STORAGE_SLOTS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            cfg.storage_slots = v;
        }
        if let Some(v) = std::env::var("EXPR_VM_MAX_STACK")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            cfg.max_stack = v;
        }
        cfg
    }
}

/// One decoded instruction of a verified source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifiedInstr {
    pub opcode: Opcode,
    pub operand: u16,
}

/// An expression that passed verification. Immutable: the evaluator and the serializer only
/// ever read it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedExpression {
    expression: Expression,
    code: Vec<Vec<VerifiedInstr>>,
    entrypoints: Vec<bool>,
    stack_capacity: usize,
}

impl VerifiedExpression {
    pub fn expression(&self) -> &Expression {
        &self.expression
    }

    pub fn into_expression(self) -> Expression {
        self.expression
    }

    pub fn constants(&self) -> &[Word] {
        &self.expression.constants
    }

    pub fn source_count(&self) -> usize {
        self.code.len()
    }

    pub fn source(&self, index: usize) -> Option<&[VerifiedInstr]> {
        self.code.get(index).map(Vec::as_slice)
    }

    /// Whether `index` was verified from an empty stack and may start an evaluation.
    pub fn is_entrypoint(&self, index: usize) -> bool {
        self.entrypoints.get(index).copied().unwrap_or(false)
    }

    pub fn entrypoints(&self) -> &[bool] {
        &self.entrypoints
    }

    /// Highest stack height any evaluation of this expression can reach.
    pub fn stack_capacity(&self) -> usize {
        self.stack_capacity
    }

    pub fn min_final_stack(&self) -> u16 {
        self.expression.min_final_stack
    }
}

/// Stack effect of one source walked from a given starting height.
#[derive(Debug, Clone, Copy)]
struct Effect {
    end: StackBounds,
    /// Highest height reached, including nested frames.
    peak: usize,
}

struct Verifier<'a> {
    table: &'a OpTable,
    expr: &'a Expression,
    code: &'a [Vec<VerifiedInstr>],
    cfg: &'a VerifyConfig,
    memo: HashMap<(usize, StackBounds), Effect>,
}

/// Verifies `expression` against `table`. Fails closed: the first violation is returned and
/// nothing is accepted.
pub fn verify(
    table: &OpTable,
    expression: Expression,
    cfg: &VerifyConfig,
) -> Result<VerifiedExpression, VerifyError> {
    let sources = expression.sources.len();
    if sources == 0 {
        return Err(VerifyError::NoSources);
    }
    if sources > MAX_SOURCES {
        return Err(VerifyError::TooManySources(sources));
    }
    let code = decode_sources(&expression)?;
    let targets = body_targets(&code);
    reject_cycles(&targets)?;
    let mut referenced = vec![false; sources];
    for target in targets.iter().flatten() {
        referenced[*target] = true;
    }

    let mut v = Verifier {
        table,
        expr: &expression,
        code: &code,
        cfg,
        memo: HashMap::new(),
    };

    let entry = v.source(0, StackBounds::exact(0))?;
    let required = usize::from(expression.min_final_stack);
    if entry.end.max < required {
        return Err(VerifyError::MinFinalStack {
            required,
            actual: entry.end.max,
        });
    }

    let mut entrypoints = vec![false; sources];
    entrypoints[0] = true;
    let mut peak = entry.peak;
    for index in 1..sources {
        if referenced[index] {
            continue;
        }
        let effect = v.source(index, StackBounds::exact(0))?;
        entrypoints[index] = true;
        peak = peak.max(effect.peak);
    }

    if peak > cfg.max_stack {
        return Err(VerifyError::StackTooDeep {
            peak,
            limit: cfg.max_stack,
        });
    }

    debug!(
        sources,
        constants = expression.constants.len(),
        stack_capacity = peak,
        "expression verified"
    );
    Ok(VerifiedExpression {
        expression,
        code,
        entrypoints,
        stack_capacity: peak,
    })
}

fn decode_sources(expression: &Expression) -> Result<Vec<Vec<VerifiedInstr>>, VerifyError> {
    expression
        .sources
        .iter()
        .enumerate()
        .map(|(source, instrs)| {
            instrs
                .iter()
                .enumerate()
                .map(|(offset, ins)| {
                    let opcode = Opcode::try_from(ins.opcode).map_err(|_| {
                        VerifyError::UnknownOpcode {
                            src: source,
                            offset,
                            opcode: ins.opcode,
                        }
                    })?;
                    Ok(VerifiedInstr {
                        opcode,
                        operand: ins.operand,
                    })
                })
                .collect()
        })
        .collect()
}

/// Body source a control-flow instruction runs, if any.
fn body_target(ins: &VerifiedInstr) -> Option<usize> {
    let source = match ins.opcode {
        Opcode::Call => CallOperand::decode(ins.operand).source,
        Opcode::LoopN => LoopOperand::decode(ins.operand).source,
        Opcode::DoWhile => DoWhileOperand::decode(ins.operand).source,
        Opcode::FoldContext => FoldOperand::decode(ins.operand).source,
        _ => return None,
    };
    Some(usize::from(source))
}

/// In-bounds body targets per source. Out-of-bounds targets are left to the operand check,
/// which reports them with their position.
fn body_targets(code: &[Vec<VerifiedInstr>]) -> Vec<Vec<usize>> {
    code.iter()
        .map(|instrs| {
            let mut targets: Vec<usize> = instrs
                .iter()
                .filter_map(body_target)
                .filter(|t| *t < code.len())
                .collect();
            targets.sort_unstable();
            targets.dedup();
            targets
        })
        .collect()
}

/// Rejects any cycle in the body graph, reachable or not. An acyclic graph also guarantees
/// every referenced source is reached from some entrypoint and therefore walked.
fn reject_cycles(targets: &[Vec<usize>]) -> Result<(), VerifyError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        New,
        Open,
        Done,
    }
    let mut marks = vec![Mark::New; targets.len()];
    for root in 0..targets.len() {
        if marks[root] != Mark::New {
            continue;
        }
        marks[root] = Mark::Open;
        // (source, next target position)
        let mut path = vec![(root, 0usize)];
        while let Some((node, next)) = path.last().copied() {
            match targets[node].get(next) {
                Some(&target) => {
                    if let Some(top) = path.last_mut() {
                        top.1 += 1;
                    }
                    match marks[target] {
                        Mark::Open => return Err(VerifyError::RecursiveCall(target)),
                        Mark::New => {
                            marks[target] = Mark::Open;
                            path.push((target, 0));
                        }
                        Mark::Done => {}
                    }
                }
                None => {
                    marks[node] = Mark::Done;
                    path.pop();
                }
            }
        }
    }
    Ok(())
}

impl Verifier<'_> {
    fn source(&mut self, index: usize, start: StackBounds) -> Result<Effect, VerifyError> {
        if let Some(effect) = self.memo.get(&(index, start)) {
            return Ok(*effect);
        }
        let effect = self.walk(index, start)?;
        self.memo.insert((index, start), effect);
        Ok(effect)
    }

    fn walk(&mut self, index: usize, start: StackBounds) -> Result<Effect, VerifyError> {
        let code = self.code;
        let mut height = start;
        let mut peak = start.max;

        for (offset, ins) in code[index].iter().enumerate() {
            let spec = self.table.get(ins.opcode);
            let ctx = OperandCtx {
                opcode: ins.opcode,
                source: index,
                offset,
                constants: self.expr.constants.len(),
                sources: code.len(),
                storage_slots: self.cfg.storage_slots,
                height,
            };
            (spec.check)(ins.operand, &ctx)?;

            let inputs = spec.inputs.resolve(ins.operand);
            let outputs = spec.outputs.resolve(ins.operand);
            if height.min < inputs {
                return Err(VerifyError::StackUnderflow {
                    src: index,
                    offset,
                    needed: inputs,
                    available: height.min,
                });
            }

            if ins.opcode.is_control_flow() {
                // the callee frame opens `inputs` below the current top
                let frame_peak = self.control_flow(ins.opcode, ins.operand)?;
                peak = peak.max(height.max - inputs + frame_peak);
            }

            height = height.apply(inputs, outputs);
            peak = peak.max(height.max);
        }

        Ok(Effect { end: height, peak })
    }

    /// Verifies the body a control-flow opcode runs and returns the peak height of its frame.
    fn control_flow(&mut self, op: Opcode, operand: u16) -> Result<usize, VerifyError> {
        match op {
            Opcode::Call => {
                let call = CallOperand::decode(operand);
                let callee = usize::from(call.source);
                let expected = usize::from(call.outputs);
                let effect = self.body(callee, call.inputs.into())?;
                if effect.end != StackBounds::exact(expected) {
                    return Err(VerifyError::CallOutputs {
                        callee,
                        expected,
                        actual: effect.end,
                    });
                }
                Ok(effect.peak)
            }
            Opcode::LoopN => {
                let l = LoopOperand::decode(operand);
                let body = usize::from(l.source);
                let expected = usize::from(l.inputs);
                let effect = self.body(body, expected)?;
                if effect.end != StackBounds::exact(expected) {
                    return Err(VerifyError::LoopShift {
                        body,
                        expected,
                        actual: effect.end,
                    });
                }
                Ok(effect.peak)
            }
            Opcode::DoWhile => {
                let d = DoWhileOperand::decode(operand);
                let body = usize::from(d.source);
                let inputs = usize::from(d.inputs);
                let effect = self.body(body, inputs)?;
                // the body hands back its inputs plus a fresh condition
                if effect.end != StackBounds::exact(inputs + 1) {
                    return Err(VerifyError::LoopShift {
                        body,
                        expected: inputs + 1,
                        actual: effect.end,
                    });
                }
                Ok(effect.peak)
            }
            Opcode::FoldContext => {
                let fold = FoldOperand::decode(operand);
                let body = usize::from(fold.source);
                let expected = usize::from(fold.accumulators);
                let effect = self.body(body, expected + usize::from(fold.width))?;
                if effect.end != StackBounds::exact(expected) {
                    return Err(VerifyError::FoldOutputs {
                        body,
                        expected,
                        actual: effect.end,
                    });
                }
                Ok(effect.peak)
            }
            _ => Ok(0),
        }
    }

    fn body(&mut self, index: usize, inputs: usize) -> Result<Effect, VerifyError> {
        self.source(index, StackBounds::exact(inputs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Instruction;
    use ruint::aliases::U256;

    fn constant(i: u16) -> Instruction {
        Instruction::new(Opcode::Constant, i)
    }

    fn run(sources: Vec<Vec<Instruction>>, constants: usize, min: u16) -> Result<VerifiedExpression, VerifyError> {
        let expr = Expression::new(sources, vec![U256::from(1u64); constants], min);
        verify(&OpTable::standard(), expr, &VerifyConfig::default())
    }

    #[test]
    fn empty_expression_rejected() {
        assert_eq!(run(vec![], 0, 0), Err(VerifyError::NoSources));
    }

    #[test]
    fn underflow_reports_position() {
        let err = run(vec![vec![constant(0), Instruction::new(Opcode::Add, 2)]], 1, 0).unwrap_err();
        assert_eq!(
            err,
            VerifyError::StackUnderflow {
                src: 0,
                offset: 1,
                needed: 2,
                available: 1
            }
        );
    }

    #[test]
    fn unknown_opcode_rejected() {
        let err = run(vec![vec![Instruction { opcode: 0xEE, operand: 0 }]], 0, 0).unwrap_err();
        assert!(matches!(err, VerifyError::UnknownOpcode { opcode: 0xEE, .. }));
    }

    #[test]
    fn constant_index_checked() {
        let err = run(vec![vec![constant(3)]], 2, 0).unwrap_err();
        assert!(matches!(err, VerifyError::ConstantOutOfBounds { index: 3, .. }));
    }

    #[test]
    fn stack_capacity_tracks_peak() {
        let v = run(
            vec![vec![
                constant(0),
                constant(0),
                constant(0),
                Instruction::new(Opcode::Add, 3),
            ]],
            1,
            1,
        )
        .unwrap();
        assert_eq!(v.stack_capacity(), 3);
        assert!(v.is_entrypoint(0));
    }

    #[test]
    fn recursion_rejected() {
        let call_self = Instruction::new(
            Opcode::Call,
            CallOperand {
                inputs: 0,
                outputs: 1,
                source: 1,
            }
            .encode(),
        );
        let err = run(vec![vec![call_self], vec![call_self]], 0, 0).unwrap_err();
        assert_eq!(err, VerifyError::RecursiveCall(1));
    }

    #[test]
    fn unreferenced_sources_are_entrypoints() {
        let v = run(vec![vec![constant(0)], vec![constant(0)]], 1, 1).unwrap();
        assert_eq!(v.entrypoints(), &[true, true]);
    }

    #[test]
    fn unreachable_cycle_rejected() {
        let to = |source| {
            Instruction::new(
                Opcode::Call,
                CallOperand {
                    inputs: 0,
                    outputs: 1,
                    source,
                }
                .encode(),
            )
        };
        let err = run(vec![vec![constant(0)], vec![to(2)], vec![to(1)]], 1, 0).unwrap_err();
        assert_eq!(err, VerifyError::RecursiveCall(1));
    }

    #[test]
    fn stack_limit_enforced() {
        let expr = Expression::new(vec![vec![constant(0); 5]], vec![U256::ZERO], 0);
        let cfg = VerifyConfig {
            max_stack: 4,
            ..VerifyConfig::default()
        };
        assert_eq!(
            verify(&OpTable::standard(), expr, &cfg),
            Err(VerifyError::StackTooDeep { peak: 5, limit: 4 })
        );
    }
}
