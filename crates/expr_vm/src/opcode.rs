//! Opcode ids and their byte encoding.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Opcode {
    Constant = 0x00,     // operand: constant index
    Context = 0x01,      // operand: column (low 8) | row (high 8)
    Stack = 0x02,        // operand: index within the current frame
    Call = 0x03,         // operand: CallOperand
    LoopN = 0x04,        // operand: LoopOperand
    DoWhile = 0x05,      // operand: DoWhileOperand
    FoldContext = 0x06,  // operand: FoldOperand
    Add = 0x07,          // operand: input count
    Sub = 0x08,          // operand: input count
    Mul = 0x09,          // operand: input count
    Div = 0x0A,          // operand: input count
    Mod = 0x0B,          // operand: input count
    Exp = 0x0C,          // operand: input count
    Min = 0x0D,          // operand: input count
    Max = 0x0E,          // operand: input count
    SaturatingAdd = 0x0F, // operand: input count
    SaturatingSub = 0x10, // operand: input count
    SaturatingMul = 0x11, // operand: input count
    IsZero = 0x12,
    EqualTo = 0x13,
    LessThan = 0x14,
    GreaterThan = 0x15,
    EagerIf = 0x16,       // pop else, then, cond -> push one
    Every = 0x17,         // operand: input count
    Any = 0x18,           // operand: input count
    ReportAt = 0x19,      // operand: tier index
    ReportLane = 0x1A,    // pop tier, report -> push lane
    TruncateAbove = 0x1B, // operand: tier index
    UpdateRange = 0x1C,   // operand: start (low 4) | end (next 4); pop time, report
    SaturatingDiff = 0x1D,
    SelectLte = 0x1E,     // operand: SelectOperand
    Storage = 0x1F,       // operand: storage slot
    Get = 0x20,           // pop key -> push value
    Set = 0x21,           // pop value, key -> push nothing
}

impl Opcode {
    pub const ALL: [Opcode; 34] = [
        Opcode::Constant,
        Opcode::Context,
        Opcode::Stack,
        Opcode::Call,
        Opcode::LoopN,
        Opcode::DoWhile,
        Opcode::FoldContext,
        Opcode::Add,
        Opcode::Sub,
        Opcode::Mul,
        Opcode::Div,
        Opcode::Mod,
        Opcode::Exp,
        Opcode::Min,
        Opcode::Max,
        Opcode::SaturatingAdd,
        Opcode::SaturatingSub,
        Opcode::SaturatingMul,
        Opcode::IsZero,
        Opcode::EqualTo,
        Opcode::LessThan,
        Opcode::GreaterThan,
        Opcode::EagerIf,
        Opcode::Every,
        Opcode::Any,
        Opcode::ReportAt,
        Opcode::ReportLane,
        Opcode::TruncateAbove,
        Opcode::UpdateRange,
        Opcode::SaturatingDiff,
        Opcode::SelectLte,
        Opcode::Storage,
        Opcode::Get,
        Opcode::Set,
    ];

    /// Opcodes that open a frame over another source.
    pub fn is_control_flow(self) -> bool {
        matches!(
            self,
            Opcode::Call | Opcode::LoopN | Opcode::DoWhile | Opcode::FoldContext
        )
    }
}

impl TryFrom<u8> for Opcode {
    type Error = ();
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Opcode::ALL.get(v as usize).copied().ok_or(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_dense_and_ordered() {
        for (i, op) in Opcode::ALL.iter().enumerate() {
            assert_eq!(*op as usize, i, "{op:?} out of place");
            assert_eq!(Opcode::try_from(i as u8), Ok(*op));
        }
        assert!(Opcode::try_from(Opcode::ALL.len() as u8).is_err());
        assert!(Opcode::try_from(0xFF).is_err());
    }
}
