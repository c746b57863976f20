//! Pure opcode bodies: every function maps the popped inputs (bottom of the stack first) to
//! one output word, or aborts the evaluation.

use ruint::aliases::U256;

use crate::exec::ExecError;
use crate::opcode::Opcode;
use crate::operand::{SelectOperand, UpdateRangeOperand};
use crate::report::{self, Logic, Mode, ReportError};
use crate::types::{word_from_bool, word_to_usize, Word};

pub type PureFn = fn(u16, &[Word]) -> Result<Word, ExecError>;

fn fold_checked(
    inputs: &[Word],
    op: Opcode,
    f: impl Fn(Word, Word) -> Result<Word, ExecError>,
) -> Result<Word, ExecError> {
    let (first, rest) = inputs.split_first().ok_or(ExecError::Underflow(op))?;
    rest.iter().try_fold(*first, |acc, x| f(acc, *x))
}

pub fn add(_: u16, inputs: &[Word]) -> Result<Word, ExecError> {
    fold_checked(inputs, Opcode::Add, |a, b| {
        a.checked_add(b).ok_or(ExecError::Overflow(Opcode::Add))
    })
}

pub fn sub(_: u16, inputs: &[Word]) -> Result<Word, ExecError> {
    fold_checked(inputs, Opcode::Sub, |a, b| {
        a.checked_sub(b).ok_or(ExecError::Underflow(Opcode::Sub))
    })
}

pub fn mul(_: u16, inputs: &[Word]) -> Result<Word, ExecError> {
    fold_checked(inputs, Opcode::Mul, |a, b| {
        a.checked_mul(b).ok_or(ExecError::Overflow(Opcode::Mul))
    })
}

pub fn div(_: u16, inputs: &[Word]) -> Result<Word, ExecError> {
    fold_checked(inputs, Opcode::Div, |a, b| {
        a.checked_div(b).ok_or(ExecError::DivisionByZero(Opcode::Div))
    })
}

pub fn rem(_: u16, inputs: &[Word]) -> Result<Word, ExecError> {
    fold_checked(inputs, Opcode::Mod, |a, b| {
        a.checked_rem(b).ok_or(ExecError::DivisionByZero(Opcode::Mod))
    })
}

pub fn exp(_: u16, inputs: &[Word]) -> Result<Word, ExecError> {
    fold_checked(inputs, Opcode::Exp, |a, b| {
        a.checked_pow(b).ok_or(ExecError::Overflow(Opcode::Exp))
    })
}

pub fn min(_: u16, inputs: &[Word]) -> Result<Word, ExecError> {
    fold_checked(inputs, Opcode::Min, |a, b| Ok(a.min(b)))
}

pub fn max(_: u16, inputs: &[Word]) -> Result<Word, ExecError> {
    fold_checked(inputs, Opcode::Max, |a, b| Ok(a.max(b)))
}

pub fn saturating_add(_: u16, inputs: &[Word]) -> Result<Word, ExecError> {
    fold_checked(inputs, Opcode::SaturatingAdd, |a, b| Ok(a.saturating_add(b)))
}

pub fn saturating_sub(_: u16, inputs: &[Word]) -> Result<Word, ExecError> {
    fold_checked(inputs, Opcode::SaturatingSub, |a, b| Ok(a.saturating_sub(b)))
}

pub fn saturating_mul(_: u16, inputs: &[Word]) -> Result<Word, ExecError> {
    fold_checked(inputs, Opcode::SaturatingMul, |a, b| Ok(a.saturating_mul(b)))
}

pub fn is_zero(_: u16, inputs: &[Word]) -> Result<Word, ExecError> {
    Ok(word_from_bool(inputs[0].is_zero()))
}

pub fn equal_to(_: u16, inputs: &[Word]) -> Result<Word, ExecError> {
    Ok(word_from_bool(inputs[0] == inputs[1]))
}

pub fn less_than(_: u16, inputs: &[Word]) -> Result<Word, ExecError> {
    Ok(word_from_bool(inputs[0] < inputs[1]))
}

pub fn greater_than(_: u16, inputs: &[Word]) -> Result<Word, ExecError> {
    Ok(word_from_bool(inputs[0] > inputs[1]))
}

/// `cond ? then : else`, both branches already evaluated.
pub fn eager_if(_: u16, inputs: &[Word]) -> Result<Word, ExecError> {
    Ok(if inputs[0].is_zero() {
        inputs[2]
    } else {
        inputs[1]
    })
}

/// First input when every input is non-zero, else zero.
pub fn every(_: u16, inputs: &[Word]) -> Result<Word, ExecError> {
    if inputs.iter().all(|x| !x.is_zero()) {
        Ok(inputs[0])
    } else {
        Ok(U256::ZERO)
    }
}

/// First non-zero input, else zero.
pub fn any(_: u16, inputs: &[Word]) -> Result<Word, ExecError> {
    Ok(inputs
        .iter()
        .copied()
        .find(|x| !x.is_zero())
        .unwrap_or(U256::ZERO))
}

pub fn report_at(operand: u16, inputs: &[Word]) -> Result<Word, ExecError> {
    let lane = report::read_lane(inputs[0], usize::from(operand))?;
    Ok(U256::from(lane))
}

pub fn report_lane(_: u16, inputs: &[Word]) -> Result<Word, ExecError> {
    let tier = word_to_usize(&inputs[1]).unwrap_or(usize::MAX);
    let lane = report::read_lane(inputs[0], tier)?;
    Ok(U256::from(lane))
}

pub fn truncate_above(operand: u16, inputs: &[Word]) -> Result<Word, ExecError> {
    Ok(report::truncate_above(inputs[0], usize::from(operand))?)
}

pub fn update_range(operand: u16, inputs: &[Word]) -> Result<Word, ExecError> {
    let range = UpdateRangeOperand::decode(operand);
    let time = word_to_usize(&inputs[1])
        .and_then(|t| u32::try_from(t).ok())
        .ok_or(ReportError::TimeOverflow)?;
    Ok(report::update_range(
        inputs[0],
        usize::from(range.start),
        usize::from(range.end),
        time,
    )?)
}

pub fn saturating_diff(_: u16, inputs: &[Word]) -> Result<Word, ExecError> {
    Ok(report::saturating_diff(inputs[0], inputs[1]))
}

/// Inputs: the reports, then the reference time on top.
pub fn select_lte(operand: u16, inputs: &[Word]) -> Result<Word, ExecError> {
    let select = SelectOperand::decode(operand);
    // logic and mode are range-checked by the verifier
    let logic = Logic::from_bits(select.logic).unwrap_or(Logic::Any);
    let mode = Mode::from_bits(select.mode).unwrap_or(Mode::Min);
    let (reference, reports) = inputs
        .split_last()
        .ok_or(ReportError::SelectArity(0))?;
    Ok(report::select_lte(reports, logic, mode, *reference)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn w(v: u64) -> Word {
        U256::from(v)
    }

    #[test]
    fn variadic_sub_folds_left() {
        assert_eq!(sub(3, &[w(10), w(3), w(2)]).unwrap(), w(5));
        assert_eq!(
            sub(2, &[w(1), w(2)]),
            Err(ExecError::Underflow(Opcode::Sub))
        );
    }

    #[test]
    fn div_and_mod_by_zero_abort() {
        assert_eq!(div(2, &[w(1), w(0)]), Err(ExecError::DivisionByZero(Opcode::Div)));
        assert_eq!(rem(2, &[w(1), w(0)]), Err(ExecError::DivisionByZero(Opcode::Mod)));
        assert_eq!(div(2, &[w(7), w(2)]).unwrap(), w(3));
        assert_eq!(rem(2, &[w(7), w(2)]).unwrap(), w(1));
    }

    #[test]
    fn exp_overflow_aborts() {
        assert_eq!(exp(2, &[w(2), w(10)]).unwrap(), w(1024));
        assert_eq!(exp(2, &[w(2), w(256)]), Err(ExecError::Overflow(Opcode::Exp)));
    }

    #[test]
    fn saturating_family_clamps() {
        assert_eq!(saturating_add(2, &[U256::MAX, w(1)]).unwrap(), U256::MAX);
        assert_eq!(saturating_sub(2, &[w(1), w(2)]).unwrap(), U256::ZERO);
        assert_eq!(saturating_mul(2, &[U256::MAX, w(2)]).unwrap(), U256::MAX);
    }

    #[test]
    fn logic_ops() {
        assert_eq!(eager_if(0, &[w(1), w(7), w(9)]).unwrap(), w(7));
        assert_eq!(eager_if(0, &[w(0), w(7), w(9)]).unwrap(), w(9));
        assert_eq!(every(3, &[w(4), w(5), w(6)]).unwrap(), w(4));
        assert_eq!(every(3, &[w(4), w(0), w(6)]).unwrap(), w(0));
        assert_eq!(any(3, &[w(0), w(0), w(6)]).unwrap(), w(6));
        assert_eq!(any(2, &[w(0), w(0)]).unwrap(), w(0));
    }

    #[test]
    fn report_lane_out_of_range_aborts() {
        assert_eq!(
            report_lane(0, &[U256::ZERO, w(8)]),
            Err(ExecError::Report(ReportError::MaxTier(8)))
        );
    }

    #[test]
    fn update_range_rejects_wide_time() {
        assert_eq!(
            update_range(0, &[U256::ZERO, w(u64::from(u32::MAX) + 1)]),
            Err(ExecError::Report(ReportError::TimeOverflow))
        );
    }
}
