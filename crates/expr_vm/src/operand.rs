//! Operand codec: small integer fields packed into the 16-bit operand of an instruction.
//!
//! Fields are laid out low bits first. Packing truncates every field modulo `2^width`, so
//! producers range-check before packing; the verifier rejects operands whose decoded fields
//! fall outside an opcode's legal range.

/// Width of every instruction operand, in bits.
pub const OPERAND_BITS: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum OperandError {
    #[error("field widths sum to {total} bits, operand holds 16")]
    WidthOverflow { total: u32 },
}

/// Packs `fields` with the given bit `widths`, lowest field first.
pub fn pack<const N: usize>(fields: [u16; N], widths: [u8; N]) -> Result<u16, OperandError> {
    let total: u32 = widths.iter().map(|w| u32::from(*w)).sum();
    if total > OPERAND_BITS {
        return Err(OperandError::WidthOverflow { total });
    }
    Ok(pack_truncating(fields, widths))
}

/// Unpacks `N` fields. Total: bits past the operand width read as zero.
pub fn unpack<const N: usize>(operand: u16, widths: [u8; N]) -> [u16; N] {
    let mut out = [0u16; N];
    let mut shift = 0u32;
    for (slot, width) in out.iter_mut().zip(widths) {
        let width = u32::from(width);
        if shift < OPERAND_BITS {
            *slot = ((u32::from(operand) >> shift) & mask(width)) as u16;
        }
        shift += width;
    }
    out
}

/// Bits above the last field of a layout. Legal operands keep them clear.
pub fn spare_bits<const N: usize>(operand: u16, widths: [u8; N]) -> u16 {
    let used: u32 = widths.iter().map(|w| u32::from(*w)).sum();
    if used >= OPERAND_BITS {
        0
    } else {
        operand >> used
    }
}

fn pack_truncating<const N: usize>(fields: [u16; N], widths: [u8; N]) -> u16 {
    let mut out = 0u32;
    let mut shift = 0u32;
    for (field, width) in fields.into_iter().zip(widths) {
        let width = u32::from(width);
        if shift < OPERAND_BITS {
            out |= (u32::from(field) & mask(width)) << shift;
        }
        shift += width;
    }
    out as u16
}

fn mask(width: u32) -> u32 {
    if width >= 32 {
        u32::MAX
    } else {
        (1u32 << width) - 1
    }
}

/// `Call(inputs, outputs, source)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallOperand {
    pub inputs: u8,
    pub outputs: u8,
    pub source: u8,
}

impl CallOperand {
    pub const WIDTHS: [u8; 3] = [4, 2, 8];
    pub const MAX_INPUTS: u8 = 7;
    pub const MIN_OUTPUTS: u8 = 1;
    pub const MAX_OUTPUTS: u8 = 3;

    pub fn decode(operand: u16) -> Self {
        let [inputs, outputs, source] = unpack(operand, Self::WIDTHS);
        Self {
            inputs: inputs as u8,
            outputs: outputs as u8,
            source: source as u8,
        }
    }

    pub fn encode(self) -> u16 {
        pack_truncating(
            [self.inputs.into(), self.outputs.into(), self.source.into()],
            Self::WIDTHS,
        )
    }
}

/// `LoopN(n, inputs, source)`: the body returns as many values as it takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopOperand {
    pub n: u8,
    pub inputs: u8,
    pub source: u8,
}

impl LoopOperand {
    pub const WIDTHS: [u8; 3] = [4, 4, 8];

    pub fn decode(operand: u16) -> Self {
        let [n, inputs, source] = unpack(operand, Self::WIDTHS);
        Self {
            n: n as u8,
            inputs: inputs as u8,
            source: source as u8,
        }
    }

    pub fn encode(self) -> u16 {
        pack_truncating(
            [self.n.into(), self.inputs.into(), self.source.into()],
            Self::WIDTHS,
        )
    }
}

/// `DoWhile(inputs, source)`: the body returns its inputs plus a fresh condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoWhileOperand {
    pub inputs: u8,
    pub source: u8,
}

impl DoWhileOperand {
    pub const WIDTHS: [u8; 2] = [4, 8];

    pub fn decode(operand: u16) -> Self {
        let [inputs, source] = unpack(operand, Self::WIDTHS);
        Self {
            inputs: inputs as u8,
            source: source as u8,
        }
    }

    pub fn encode(self) -> u16 {
        pack_truncating([self.inputs.into(), self.source.into()], Self::WIDTHS)
    }
}

/// `FoldContext(source, column, width, accumulators)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FoldOperand {
    pub source: u8,
    pub column: u8,
    pub width: u8,
    pub accumulators: u8,
}

impl FoldOperand {
    pub const WIDTHS: [u8; 4] = [4, 4, 4, 4];

    pub fn decode(operand: u16) -> Self {
        let [source, column, width, accumulators] = unpack(operand, Self::WIDTHS);
        Self {
            source: source as u8,
            column: column as u8,
            width: width as u8,
            accumulators: accumulators as u8,
        }
    }

    pub fn encode(self) -> u16 {
        pack_truncating(
            [
                self.source.into(),
                self.column.into(),
                self.width.into(),
                self.accumulators.into(),
            ],
            Self::WIDTHS,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextOperand {
    pub column: u8,
    pub row: u8,
}

impl ContextOperand {
    pub const WIDTHS: [u8; 2] = [8, 8];

    pub fn decode(operand: u16) -> Self {
        let [column, row] = unpack(operand, Self::WIDTHS);
        Self {
            column: column as u8,
            row: row as u8,
        }
    }

    pub fn encode(self) -> u16 {
        pack_truncating([self.column.into(), self.row.into()], Self::WIDTHS)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateRangeOperand {
    pub start: u8,
    pub end: u8,
}

impl UpdateRangeOperand {
    pub const WIDTHS: [u8; 2] = [4, 4];

    pub fn decode(operand: u16) -> Self {
        let [start, end] = unpack(operand, Self::WIDTHS);
        Self {
            start: start as u8,
            end: end as u8,
        }
    }

    pub fn encode(self) -> u16 {
        pack_truncating([self.start.into(), self.end.into()], Self::WIDTHS)
    }
}

/// `SelectLte(logic, mode, length)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectOperand {
    pub logic: u8,
    pub mode: u8,
    pub length: u8,
}

impl SelectOperand {
    pub const WIDTHS: [u8; 3] = [1, 2, 5];

    pub fn decode(operand: u16) -> Self {
        let [logic, mode, length] = unpack(operand, Self::WIDTHS);
        Self {
            logic: logic as u8,
            mode: mode as u8,
            length: length as u8,
        }
    }

    pub fn encode(self) -> u16 {
        pack_truncating(
            [self.logic.into(), self.mode.into(), self.length.into()],
            Self::WIDTHS,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_lays_fields_low_bits_first() {
        assert_eq!(pack([0b11, 0b1, 0xAB], [2, 1, 8]).unwrap(), 0b1010_1011_1_11);
        assert_eq!(unpack(0b1010_1011_1_11, [2, 1, 8]), [0b11, 0b1, 0xAB]);
    }

    #[test]
    fn pack_rejects_wide_layouts() {
        assert_eq!(
            pack([1, 1, 1], [8, 8, 1]),
            Err(OperandError::WidthOverflow { total: 17 })
        );
        assert!(pack([1, 1], [8, 8]).is_ok());
    }

    #[test]
    fn pack_truncates_oversized_fields() {
        // 9 does not fit 3 bits: 9 mod 8 = 1
        assert_eq!(pack([9, 0], [3, 3]).unwrap(), 1);
    }

    #[test]
    fn unpack_is_total() {
        assert_eq!(unpack(0xFFFF, [12, 12]), [0x0FFF, 0x000F]);
        assert_eq!(unpack(0xFFFF, [16, 4]), [0xFFFF, 0]);
        assert_eq!(unpack::<0>(0xFFFF, []), [] as [u16; 0]);
    }

    #[test]
    fn spare_bits_reports_unused_high_bits() {
        assert_eq!(spare_bits(0x00FF, [4, 4]), 0);
        assert_eq!(spare_bits(0x01FF, [4, 4]), 1);
        assert_eq!(spare_bits(0xFFFF, [8, 8]), 0);
    }

    #[test]
    fn call_operand_layout() {
        let op = CallOperand {
            inputs: 2,
            outputs: 1,
            source: 3,
        };
        let raw = op.encode();
        assert_eq!(raw, 2 | (1 << 4) | (3 << 6));
        assert_eq!(CallOperand::decode(raw), op);
    }

    #[test]
    fn fold_operand_uses_every_bit() {
        let op = FoldOperand {
            source: 15,
            column: 14,
            width: 13,
            accumulators: 12,
        };
        assert_eq!(op.encode(), 0xCDEF);
        assert_eq!(FoldOperand::decode(0xCDEF), op);
    }

    #[test]
    fn select_operand_layout() {
        let op = SelectOperand {
            logic: 1,
            mode: 2,
            length: 8,
        };
        assert_eq!(op.encode(), 1 | (2 << 1) | (8 << 3));
        assert_eq!(SelectOperand::decode(op.encode()), op);
    }
}
