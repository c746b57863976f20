//! Disassembler: human-readable listing of a verified expression.

use crate::opcode::Opcode;
use crate::operand::{
    CallOperand, ContextOperand, DoWhileOperand, FoldOperand, LoopOperand, SelectOperand,
    UpdateRangeOperand,
};
use crate::state::{deserialize, DecodeError};
use crate::table::OpTable;
use crate::verify::{VerifiedExpression, VerifyConfig};

/// One section per source, one line per instruction: `offset opcode name (operand)`.
pub fn disassemble(expr: &VerifiedExpression) -> String {
    let table = OpTable::standard();
    let mut out = String::new();
    for index in 0..expr.source_count() {
        let entry = if expr.is_entrypoint(index) { " entry" } else { "" };
        out.push_str(&format!("source {index}{entry}:\n"));
        let code = expr.source(index).unwrap_or(&[]);
        if code.is_empty() {
            out.push_str("  (empty)\n");
        }
        for (offset, ins) in code.iter().enumerate() {
            let name = table.get(ins.opcode).name;
            let detail = format_operand(ins.opcode, ins.operand, expr);
            if detail.is_empty() {
                out.push_str(&format!("  {:04x}  {:02x}  {}\n", offset, ins.opcode as u8, name));
            } else {
                out.push_str(&format!(
                    "  {:04x}  {:02x}  {} {}\n",
                    offset, ins.opcode as u8, name, detail
                ));
            }
        }
    }
    if !expr.constants().is_empty() {
        out.push_str("constants:\n");
        for (i, c) in expr.constants().iter().enumerate() {
            out.push_str(&format!("  [{i}] {c}\n"));
        }
    }
    out
}

/// Disassembles serialized state. The state is decoded and verified first.
pub fn disassemble_bytes(bytes: &[u8], cfg: &VerifyConfig) -> Result<String, DecodeError> {
    Ok(disassemble(&deserialize(bytes, &OpTable::standard(), cfg)?))
}

fn format_operand(op: Opcode, operand: u16, expr: &VerifiedExpression) -> String {
    use Opcode::*;
    match op {
        Constant => match expr.constants().get(usize::from(operand)) {
            Some(c) => format!("({operand} = {c})"),
            None => format!("({operand})"),
        },
        Context => {
            let c = ContextOperand::decode(operand);
            format!("(column={}, row={})", c.column, c.row)
        }
        Stack => format!("(index={operand})"),
        Storage => format!("(slot={operand})"),
        Call => {
            let c = CallOperand::decode(operand);
            format!("(source={}, inputs={}, outputs={})", c.source, c.inputs, c.outputs)
        }
        LoopN => {
            let l = LoopOperand::decode(operand);
            format!("(source={}, n={}, inputs={})", l.source, l.n, l.inputs)
        }
        DoWhile => {
            let d = DoWhileOperand::decode(operand);
            format!("(source={}, inputs={})", d.source, d.inputs)
        }
        FoldContext => {
            let f = FoldOperand::decode(operand);
            format!(
                "(source={}, column={}, width={}, accumulators={})",
                f.source, f.column, f.width, f.accumulators
            )
        }
        ReportAt | TruncateAbove => format!("(tier={operand})"),
        UpdateRange => {
            let r = UpdateRangeOperand::decode(operand);
            format!("(tiers={}..={})", r.start, r.end)
        }
        SelectLte => {
            let s = SelectOperand::decode(operand);
            let logic = if s.logic == 0 { "any" } else { "every" };
            let mode = match s.mode {
                0 => "min",
                1 => "max",
                _ => "first",
            };
            format!("({logic}, {mode}, reports={})", s.length)
        }
        Add | Sub | Mul | Div | Mod | Exp | Min | Max | SaturatingAdd | SaturatingSub
        | SaturatingMul | Every | Any => format!("(n={operand})"),
        _ => String::new(),
    }
}
