//! The opcode table: one immutable entry per opcode describing its stack effect, its operand
//! predicate and, for pure opcodes, its body.
//!
//! Both the verifier and the evaluator take the table by reference; the verifier only ever
//! reads arities and operand predicates.

use crate::opcode::Opcode;
use crate::operand::{
    spare_bits, CallOperand, DoWhileOperand, FoldOperand, LoopOperand, SelectOperand,
    UpdateRangeOperand,
};
use crate::ops::{self, PureFn};
use crate::report::{Mode, MAX_SELECT, TIERS};
use crate::verify::{StackBounds, VerifyError};

/// Largest count a variadic opcode accepts.
pub const MAX_VARIADIC: u16 = 255;

#[derive(Clone, Copy)]
pub enum Arity {
    Fixed(usize),
    /// Derived from the operand.
    Operand(fn(u16) -> usize),
}

impl Arity {
    pub fn resolve(self, operand: u16) -> usize {
        match self {
            Arity::Fixed(n) => n,
            Arity::Operand(f) => f(operand),
        }
    }
}

impl std::fmt::Debug for Arity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Arity::Fixed(n) => write!(f, "Fixed({n})"),
            Arity::Operand(_) => f.write_str("Operand"),
        }
    }
}

#[derive(Clone, Copy)]
pub enum Eval {
    Pure(PureFn),
    /// Needs evaluation state (constants, context, frames, storage).
    Machine,
}

/// What an operand predicate gets to see.
#[derive(Debug, Clone, Copy)]
pub struct OperandCtx {
    pub opcode: Opcode,
    pub source: usize,
    pub offset: usize,
    pub constants: usize,
    pub sources: usize,
    pub storage_slots: u16,
    pub height: StackBounds,
}

impl OperandCtx {
    fn out_of_range(&self, operand: u16) -> VerifyError {
        VerifyError::OperandOutOfRange {
            src: self.source,
            offset: self.offset,
            opcode: self.opcode,
            operand,
        }
    }
}

pub type OperandCheck = fn(u16, &OperandCtx) -> Result<(), VerifyError>;

#[derive(Clone, Copy)]
pub struct OpSpec {
    pub opcode: Opcode,
    pub name: &'static str,
    pub inputs: Arity,
    pub outputs: Arity,
    pub check: OperandCheck,
    pub eval: Eval,
}

impl std::fmt::Debug for OpSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpSpec")
            .field("opcode", &self.opcode)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct OpTable {
    specs: Vec<OpSpec>,
}

impl Default for OpTable {
    fn default() -> Self {
        Self::standard()
    }
}

impl OpTable {
    pub fn standard() -> Self {
        let specs = Opcode::ALL.iter().map(|op| standard_spec(*op)).collect();
        Self { specs }
    }

    pub fn get(&self, op: Opcode) -> &OpSpec {
        &self.specs[op as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = &OpSpec> {
        self.specs.iter()
    }
}

fn standard_spec(op: Opcode) -> OpSpec {
    use Arity::{Fixed, Operand};
    use Opcode::*;

    let spec = |name, inputs, outputs, check: OperandCheck, eval| OpSpec {
        opcode: op,
        name,
        inputs,
        outputs,
        check,
        eval,
    };
    let variadic = |name, f: PureFn| spec(name, Operand(count), Fixed(1), check_count, Eval::Pure(f));
    let fixed = |name, inputs, f: PureFn| spec(name, Fixed(inputs), Fixed(1), check_zero, Eval::Pure(f));

    match op {
        Constant => spec("constant", Fixed(0), Fixed(1), check_constant, Eval::Machine),
        Context => spec("context", Fixed(0), Fixed(1), check_any, Eval::Machine),
        Stack => spec("stack", Fixed(0), Fixed(1), check_stack, Eval::Machine),
        Call => spec("call", Operand(call_inputs), Operand(call_outputs), check_call, Eval::Machine),
        LoopN => spec("loop-n", Operand(loop_inputs), Operand(loop_inputs), check_loop, Eval::Machine),
        DoWhile => spec(
            "do-while",
            Operand(do_while_inputs),
            Operand(do_while_outputs),
            check_do_while,
            Eval::Machine,
        ),
        FoldContext => spec(
            "fold-context",
            Operand(fold_accumulators),
            Operand(fold_accumulators),
            check_fold,
            Eval::Machine,
        ),
        Add => variadic("add", ops::add),
        Sub => variadic("sub", ops::sub),
        Mul => variadic("mul", ops::mul),
        Div => variadic("div", ops::div),
        Mod => variadic("mod", ops::rem),
        Exp => variadic("exp", ops::exp),
        Min => variadic("min", ops::min),
        Max => variadic("max", ops::max),
        SaturatingAdd => variadic("saturating-add", ops::saturating_add),
        SaturatingSub => variadic("saturating-sub", ops::saturating_sub),
        SaturatingMul => variadic("saturating-mul", ops::saturating_mul),
        IsZero => fixed("is-zero", 1, ops::is_zero),
        EqualTo => fixed("equal-to", 2, ops::equal_to),
        LessThan => fixed("less-than", 2, ops::less_than),
        GreaterThan => fixed("greater-than", 2, ops::greater_than),
        EagerIf => fixed("eager-if", 3, ops::eager_if),
        Every => variadic("every", ops::every),
        Any => variadic("any", ops::any),
        ReportAt => spec("report-at", Fixed(1), Fixed(1), check_tier, Eval::Pure(ops::report_at)),
        ReportLane => fixed("report-lane", 2, ops::report_lane),
        TruncateAbove => spec(
            "truncate-above",
            Fixed(1),
            Fixed(1),
            check_tier,
            Eval::Pure(ops::truncate_above),
        ),
        UpdateRange => spec(
            "update-range",
            Fixed(2),
            Fixed(1),
            check_update_range,
            Eval::Pure(ops::update_range),
        ),
        SaturatingDiff => fixed("saturating-diff", 2, ops::saturating_diff),
        SelectLte => spec(
            "select-lte",
            Operand(select_inputs),
            Fixed(1),
            check_select,
            Eval::Pure(ops::select_lte),
        ),
        Storage => spec("storage", Fixed(0), Fixed(1), check_storage, Eval::Machine),
        Get => spec("get", Fixed(1), Fixed(1), check_zero, Eval::Machine),
        Set => spec("set", Fixed(2), Fixed(0), check_zero, Eval::Machine),
    }
}

fn count(operand: u16) -> usize {
    usize::from(operand)
}

fn call_inputs(operand: u16) -> usize {
    CallOperand::decode(operand).inputs.into()
}

fn call_outputs(operand: u16) -> usize {
    CallOperand::decode(operand).outputs.into()
}

fn loop_inputs(operand: u16) -> usize {
    LoopOperand::decode(operand).inputs.into()
}

fn do_while_inputs(operand: u16) -> usize {
    usize::from(DoWhileOperand::decode(operand).inputs) + 1
}

fn do_while_outputs(operand: u16) -> usize {
    DoWhileOperand::decode(operand).inputs.into()
}

fn fold_accumulators(operand: u16) -> usize {
    FoldOperand::decode(operand).accumulators.into()
}

fn select_inputs(operand: u16) -> usize {
    usize::from(SelectOperand::decode(operand).length) + 1
}

fn check_any(_: u16, _: &OperandCtx) -> Result<(), VerifyError> {
    Ok(())
}

fn check_zero(operand: u16, ctx: &OperandCtx) -> Result<(), VerifyError> {
    if operand != 0 {
        return Err(ctx.out_of_range(operand));
    }
    Ok(())
}

fn check_count(operand: u16, ctx: &OperandCtx) -> Result<(), VerifyError> {
    if !(2..=MAX_VARIADIC).contains(&operand) {
        return Err(ctx.out_of_range(operand));
    }
    Ok(())
}

fn check_constant(operand: u16, ctx: &OperandCtx) -> Result<(), VerifyError> {
    if usize::from(operand) >= ctx.constants {
        return Err(VerifyError::ConstantOutOfBounds {
            src: ctx.source,
            offset: ctx.offset,
            index: operand.into(),
            constants: ctx.constants,
        });
    }
    Ok(())
}

fn check_stack(operand: u16, ctx: &OperandCtx) -> Result<(), VerifyError> {
    if usize::from(operand) >= ctx.height.min {
        return Err(VerifyError::StackReadOutOfBounds {
            src: ctx.source,
            offset: ctx.offset,
            index: operand.into(),
            height: ctx.height.min,
        });
    }
    Ok(())
}

fn check_storage(operand: u16, ctx: &OperandCtx) -> Result<(), VerifyError> {
    if operand >= ctx.storage_slots {
        return Err(VerifyError::StorageOutOfBounds {
            src: ctx.source,
            offset: ctx.offset,
            slot: operand,
            slots: ctx.storage_slots,
        });
    }
    Ok(())
}

fn check_tier(operand: u16, ctx: &OperandCtx) -> Result<(), VerifyError> {
    if usize::from(operand) >= TIERS {
        return Err(VerifyError::MaxTier {
            src: ctx.source,
            offset: ctx.offset,
            tier: operand.into(),
        });
    }
    Ok(())
}

fn check_update_range(operand: u16, ctx: &OperandCtx) -> Result<(), VerifyError> {
    if spare_bits(operand, UpdateRangeOperand::WIDTHS) != 0 {
        return Err(ctx.out_of_range(operand));
    }
    let range = UpdateRangeOperand::decode(operand);
    for tier in [range.start, range.end] {
        check_tier(tier.into(), ctx)?;
    }
    Ok(())
}

fn check_select(operand: u16, ctx: &OperandCtx) -> Result<(), VerifyError> {
    if spare_bits(operand, SelectOperand::WIDTHS) != 0 {
        return Err(ctx.out_of_range(operand));
    }
    let select = SelectOperand::decode(operand);
    if Mode::from_bits(select.mode).is_none() {
        return Err(ctx.out_of_range(operand));
    }
    let length = usize::from(select.length);
    if length == 0 || length > MAX_SELECT {
        return Err(VerifyError::SelectArity {
            src: ctx.source,
            offset: ctx.offset,
            length,
        });
    }
    Ok(())
}

fn check_source(index: u8, ctx: &OperandCtx) -> Result<(), VerifyError> {
    if usize::from(index) >= ctx.sources {
        return Err(VerifyError::SourceOutOfBounds {
            src: ctx.source,
            offset: ctx.offset,
            target: index.into(),
        });
    }
    Ok(())
}

fn check_call_inputs(inputs: u8, outputs: u8, ctx: &OperandCtx) -> Result<(), VerifyError> {
    if inputs > CallOperand::MAX_INPUTS
        || !(CallOperand::MIN_OUTPUTS..=CallOperand::MAX_OUTPUTS).contains(&outputs)
    {
        return Err(VerifyError::CallArity {
            src: ctx.source,
            offset: ctx.offset,
            inputs,
            outputs,
        });
    }
    Ok(())
}

fn check_call(operand: u16, ctx: &OperandCtx) -> Result<(), VerifyError> {
    if spare_bits(operand, CallOperand::WIDTHS) != 0 {
        return Err(ctx.out_of_range(operand));
    }
    let call = CallOperand::decode(operand);
    check_call_inputs(call.inputs, call.outputs, ctx)?;
    check_source(call.source, ctx)
}

fn check_loop(operand: u16, ctx: &OperandCtx) -> Result<(), VerifyError> {
    let l = LoopOperand::decode(operand);
    if l.inputs > CallOperand::MAX_INPUTS {
        return Err(VerifyError::CallArity {
            src: ctx.source,
            offset: ctx.offset,
            inputs: l.inputs,
            outputs: l.inputs,
        });
    }
    check_source(l.source, ctx)
}

fn check_do_while(operand: u16, ctx: &OperandCtx) -> Result<(), VerifyError> {
    if spare_bits(operand, DoWhileOperand::WIDTHS) != 0 {
        return Err(ctx.out_of_range(operand));
    }
    let d = DoWhileOperand::decode(operand);
    if d.inputs > CallOperand::MAX_INPUTS {
        return Err(VerifyError::CallArity {
            src: ctx.source,
            offset: ctx.offset,
            inputs: d.inputs,
            outputs: d.inputs + 1,
        });
    }
    check_source(d.source, ctx)
}

fn check_fold(operand: u16, ctx: &OperandCtx) -> Result<(), VerifyError> {
    let fold = FoldOperand::decode(operand);
    if fold.accumulators == 0 {
        return Err(ctx.out_of_range(operand));
    }
    check_source(fold.source, ctx)
}
