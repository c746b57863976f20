use expr_vm::operand::{ContextOperand, SelectOperand, UpdateRangeOperand};
use expr_vm::report::{self, ReportError, NEVER, TIERS};
use expr_vm::{
    verify, Context, ExecError, Expression, Instruction, MemStore, OpTable, Opcode,
    VerifiedExpression, VerifyConfig, VerifyError, Vm, VmConfig, Word,
};
use ruint::aliases::U256;

fn w(v: u64) -> Word {
    U256::from(v)
}

fn op(op: Opcode, operand: u16) -> Instruction {
    Instruction::new(op, operand)
}

/// Pushes every constant in order, then runs `tail`.
fn program(constants: Vec<Word>, tail: Vec<Instruction>) -> Result<VerifiedExpression, VerifyError> {
    let mut code: Vec<Instruction> = (0..constants.len() as u16)
        .map(|i| op(Opcode::Constant, i))
        .collect();
    code.extend(tail);
    verify(
        &OpTable::standard(),
        Expression::new(vec![code], constants, 0),
        &VerifyConfig::default(),
    )
}

fn eval_ctx(constants: Vec<Word>, tail: Vec<Instruction>, ctx: &Context) -> Result<Word, ExecError> {
    let v = program(constants, tail).unwrap();
    let table = OpTable::standard();
    let store = MemStore::new();
    let out = Vm::new(&table, VmConfig::default(), &store).evaluate(&v, 0, ctx)?;
    Ok(out.top().unwrap_or(U256::ZERO))
}

fn eval(constants: Vec<Word>, tail: Vec<Instruction>) -> Result<Word, ExecError> {
    eval_ctx(constants, tail, &vec![])
}

fn binary(opcode: Opcode, a: Word, b: Word) -> Result<Word, ExecError> {
    eval(vec![a, b], vec![op(opcode, 2)])
}

#[test]
fn variadic_arithmetic_folds_left() {
    assert_eq!(eval(vec![w(1), w(2), w(3), w(4)], vec![op(Opcode::Add, 4)]), Ok(w(10)));
    assert_eq!(eval(vec![w(100), w(5), w(2)], vec![op(Opcode::Div, 3)]), Ok(w(10)));
    assert_eq!(eval(vec![w(2), w(3), w(2)], vec![op(Opcode::Exp, 3)]), Ok(w(64)));
    assert_eq!(eval(vec![w(9), w(3), w(7)], vec![op(Opcode::Min, 3)]), Ok(w(3)));
    assert_eq!(eval(vec![w(9), w(3), w(7)], vec![op(Opcode::Max, 3)]), Ok(w(9)));
}

#[test]
fn checked_arithmetic_aborts() {
    assert_eq!(binary(Opcode::Sub, w(1), w(2)), Err(ExecError::Underflow(Opcode::Sub)));
    assert_eq!(
        binary(Opcode::Mul, U256::MAX, w(2)),
        Err(ExecError::Overflow(Opcode::Mul))
    );
    assert_eq!(
        binary(Opcode::Div, w(1), U256::ZERO),
        Err(ExecError::DivisionByZero(Opcode::Div))
    );
    assert_eq!(
        binary(Opcode::Mod, w(1), U256::ZERO),
        Err(ExecError::DivisionByZero(Opcode::Mod))
    );
    assert_eq!(binary(Opcode::Mod, w(17), w(5)), Ok(w(2)));
}

#[test]
fn saturating_arithmetic_clamps() {
    assert_eq!(binary(Opcode::SaturatingAdd, U256::MAX, w(1)), Ok(U256::MAX));
    assert_eq!(binary(Opcode::SaturatingSub, w(1), w(2)), Ok(U256::ZERO));
    assert_eq!(binary(Opcode::SaturatingMul, U256::MAX, w(3)), Ok(U256::MAX));
    assert_eq!(binary(Opcode::SaturatingSub, w(5), w(2)), Ok(w(3)));
}

#[test]
fn comparisons_yield_zero_or_one() {
    assert_eq!(binary(Opcode::EqualTo, w(4), w(4)), Ok(w(1)));
    assert_eq!(binary(Opcode::EqualTo, w(4), w(5)), Ok(w(0)));
    assert_eq!(binary(Opcode::LessThan, w(4), w(5)), Ok(w(1)));
    assert_eq!(binary(Opcode::GreaterThan, w(4), w(5)), Ok(w(0)));
    assert_eq!(eval(vec![w(0)], vec![op(Opcode::IsZero, 0)]), Ok(w(1)));
}

#[test]
fn logic_opcodes() {
    assert_eq!(eval(vec![w(1), w(7), w(9)], vec![op(Opcode::EagerIf, 0)]), Ok(w(7)));
    assert_eq!(eval(vec![w(0), w(7), w(9)], vec![op(Opcode::EagerIf, 0)]), Ok(w(9)));
    assert_eq!(eval(vec![w(3), w(4)], vec![op(Opcode::Every, 2)]), Ok(w(3)));
    assert_eq!(eval(vec![w(3), w(0)], vec![op(Opcode::Every, 2)]), Ok(w(0)));
    assert_eq!(eval(vec![w(0), w(4)], vec![op(Opcode::Any, 2)]), Ok(w(4)));
}

#[test]
fn context_reads_cells() {
    let cell = ContextOperand { column: 1, row: 2 }.encode();
    let ctx = vec![vec![w(1)], vec![w(10), w(20), w(30)]];
    assert_eq!(eval_ctx(vec![], vec![op(Opcode::Context, cell)], &ctx), Ok(w(30)));
}

#[test]
fn variadic_count_checked_statically() {
    for n in [0u16, 1, 256] {
        let err = program(vec![w(1), w(1)], vec![op(Opcode::Add, n)]).unwrap_err();
        assert!(
            matches!(err, VerifyError::OperandOutOfRange { operand, .. } if operand == n),
            "{err:?}"
        );
    }
}

#[test]
fn fixed_arity_opcodes_take_no_operand() {
    let err = program(vec![w(1)], vec![op(Opcode::IsZero, 3)]).unwrap_err();
    assert!(matches!(err, VerifyError::OperandOutOfRange { operand: 3, .. }));
}

// ── report opcodes ──────────────────────────────────────────────

fn sample_report() -> Word {
    report::from_lanes([10, 20, 30, 40, 50, 60, 70, 80])
}

#[test]
fn report_at_reads_lane() {
    assert_eq!(eval(vec![sample_report()], vec![op(Opcode::ReportAt, 3)]), Ok(w(40)));
}

#[test]
fn report_at_tier_checked_statically() {
    let err = program(vec![sample_report()], vec![op(Opcode::ReportAt, 8)]).unwrap_err();
    assert!(matches!(err, VerifyError::MaxTier { tier: 8, .. }));
}

#[test]
fn report_lane_tier_checked_at_runtime() {
    assert_eq!(
        eval(vec![sample_report(), w(7)], vec![op(Opcode::ReportLane, 0)]),
        Ok(w(80))
    );
    assert_eq!(
        eval(vec![sample_report(), w(8)], vec![op(Opcode::ReportLane, 0)]),
        Err(ExecError::Report(ReportError::MaxTier(8)))
    );
}

#[test]
fn truncate_above_through_vm() {
    let out = eval(vec![sample_report()], vec![op(Opcode::TruncateAbove, 1)]).unwrap();
    assert_eq!(
        report::lanes(out),
        [10, 20, NEVER, NEVER, NEVER, NEVER, NEVER, NEVER]
    );
}

#[test]
fn update_range_through_vm() {
    let range = UpdateRangeOperand { start: 1, end: 2 }.encode();
    let out = eval(vec![sample_report(), w(5)], vec![op(Opcode::UpdateRange, range)]).unwrap();
    assert_eq!(report::lanes(out), [10, 5, 5, 40, 50, 60, 70, 80]);

    let inverted = UpdateRangeOperand { start: 2, end: 1 }.encode();
    assert_eq!(
        eval(vec![sample_report(), w(5)], vec![op(Opcode::UpdateRange, inverted)]),
        Ok(sample_report())
    );
}

#[test]
fn update_range_rejects_wide_time() {
    let range = UpdateRangeOperand { start: 0, end: 0 }.encode();
    assert_eq!(
        eval(
            vec![sample_report(), w(u64::from(u32::MAX) + 1)],
            vec![op(Opcode::UpdateRange, range)]
        ),
        Err(ExecError::Report(ReportError::TimeOverflow))
    );
}

#[test]
fn saturating_diff_through_vm() {
    let later = report::from_lanes([15; TIERS]);
    let out = binary(Opcode::SaturatingDiff, later, sample_report()).unwrap();
    assert_eq!(report::lanes(out), [5, 0, 0, 0, 0, 0, 0, 0]);
}

#[test]
fn select_lte_arity_checked_statically() {
    for length in [0u8, 9] {
        let select = SelectOperand {
            logic: 0,
            mode: 0,
            length,
        }
        .encode();
        let err = program(vec![w(1)], vec![op(Opcode::SelectLte, select)]).unwrap_err();
        assert!(
            matches!(err, VerifyError::SelectArity { length: l, .. } if l == usize::from(length)),
            "{err:?}"
        );
    }
}

#[test]
fn select_lte_rejects_unknown_mode() {
    let select = SelectOperand {
        logic: 0,
        mode: 3,
        length: 1,
    }
    .encode();
    let err = program(vec![w(1), w(1)], vec![op(Opcode::SelectLte, select)]).unwrap_err();
    assert!(matches!(err, VerifyError::OperandOutOfRange { .. }));
}

#[test]
fn select_lte_max_and_first() {
    let a = report::from_lanes([100; TIERS]);
    let b = report::from_lanes([50; TIERS]);
    let run = |mode| {
        let select = SelectOperand {
            logic: 0,
            mode,
            length: 2,
        }
        .encode();
        eval(
            vec![b, a, w(1_000)],
            vec![op(Opcode::SelectLte, select), op(Opcode::ReportAt, 0)],
        )
    };
    assert_eq!(run(0), Ok(w(50)));
    assert_eq!(run(1), Ok(w(100)));
    assert_eq!(run(2), Ok(w(50)));
}
