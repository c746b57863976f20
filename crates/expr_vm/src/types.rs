use ruint::aliases::U256;
use serde::{Deserialize, Serialize};

use crate::opcode::Opcode;

/// Every stack slot, constant and context cell is one 256-bit word.
pub type Word = U256;

/// Read-only external input for one evaluation, addressed `context[column][row]`.
pub type Context = Vec<Vec<Word>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cid(pub String); // `b3:<hex>`

/// One raw instruction as supplied by a configurer.
///
/// The opcode stays a raw byte until verification so that unknown ids are reported by the
/// verifier rather than silently dropped by deserialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instruction {
    pub opcode: u8,
    pub operand: u16,
}

impl Instruction {
    pub const fn new(op: Opcode, operand: u16) -> Self {
        Self {
            opcode: op as u8,
            operand,
        }
    }

    /// An instruction whose operand is ignored.
    pub const fn bare(op: Opcode) -> Self {
        Self::new(op, 0)
    }
}

/// Unit of deployment: sources, a shared constants pool and the minimum height the entry
/// source must leave on the stack.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expression {
    pub sources: Vec<Vec<Instruction>>,
    pub constants: Vec<Word>,
    #[serde(default)]
    pub min_final_stack: u16,
}

impl Expression {
    pub fn new(sources: Vec<Vec<Instruction>>, constants: Vec<Word>, min_final_stack: u16) -> Self {
        Self {
            sources,
            constants,
            min_final_stack,
        }
    }
}

/// Converts a word to `usize` when it fits.
pub(crate) fn word_to_usize(w: &Word) -> Option<usize> {
    let limbs = w.as_limbs();
    if limbs[1] | limbs[2] | limbs[3] != 0 {
        return None;
    }
    usize::try_from(limbs[0]).ok()
}

pub(crate) fn word_from_bool(b: bool) -> Word {
    if b {
        U256::from(1u64)
    } else {
        U256::ZERO
    }
}
