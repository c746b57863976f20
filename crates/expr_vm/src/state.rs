//! Flat serialized form of a verified expression.
//!
//! ```text
//! [0..4)   magic "EXVM"
//! [4]      version
//! [5]      reserved
//! [6..8)   min_final_stack      u16
//! [8..12)  stack_capacity       u32
//! [12..14) source_count         u16
//! [14..18) constants_bottom     u32
//! [18..22) stack_bottom         u32
//! [22..)   source offsets u32 x source_count, entrypoint bitmap,
//!          sources (3-byte instructions), constants (32-byte words)
//! ```
//!
//! All integers are big-endian. `stack_bottom` is the buffer length; the evaluator's stack is
//! allocated fresh per call and never stored.

use ruint::aliases::U256;

use crate::opcode::Opcode;
use crate::table::OpTable;
use crate::types::{Cid, Expression, Instruction, Word};
use crate::verify::{verify, VerifiedExpression, VerifyConfig, VerifyError};

pub const MAGIC: &[u8; 4] = b"EXVM";
pub const VERSION: u8 = 1;
pub const HEADER_LEN: usize = 22;
pub const INSTRUCTION_LEN: usize = 3;
pub const WORD_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("bad magic")]
    BadMagic,
    #[error("unsupported version {0}")]
    UnsupportedVersion(u8),
    #[error("truncated")]
    Truncated,
    #[error("bad layout: {0}")]
    BadLayout(&'static str),
    #[error("unknown opcode {opcode:#04x} in source {src} at {offset}")]
    UnknownOpcode { src: usize, offset: usize, opcode: u8 },
    #[error("decoded expression fails verification: {0}")]
    Verify(#[from] VerifyError),
    #[error("header {field} disagrees with verification")]
    HeaderMismatch { field: &'static str },
}

/// Region boundaries read from a state header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub min_final_stack: u16,
    pub stack_capacity: usize,
    /// Start offset of every source, in buffer coordinates.
    pub source_offsets: Vec<usize>,
    pub entrypoints: Vec<bool>,
    pub constants_bottom: usize,
    pub stack_bottom: usize,
}

impl Layout {
    /// Reads and checks the header, offset table and entrypoint bitmap. Does not look at
    /// instruction bytes.
    pub fn read(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < HEADER_LEN {
            if buf.len() >= 4 && &buf[..4] != MAGIC {
                return Err(DecodeError::BadMagic);
            }
            return Err(DecodeError::Truncated);
        }
        if &buf[..4] != MAGIC {
            return Err(DecodeError::BadMagic);
        }
        if buf[4] != VERSION {
            return Err(DecodeError::UnsupportedVersion(buf[4]));
        }
        let min_final_stack = be_u16(buf, 6);
        let stack_capacity = be_u32(buf, 8) as usize;
        let count = usize::from(be_u16(buf, 12));
        let constants_bottom = be_u32(buf, 14) as usize;
        let stack_bottom = be_u32(buf, 18) as usize;

        let bitmap_at = HEADER_LEN + 4 * count;
        let code_at = bitmap_at + count.div_ceil(8);
        if buf.len() < code_at {
            return Err(DecodeError::Truncated);
        }
        if stack_bottom != buf.len() {
            return Err(if stack_bottom > buf.len() {
                DecodeError::Truncated
            } else {
                DecodeError::BadLayout("stack bottom is not the buffer end")
            });
        }
        if constants_bottom < code_at || constants_bottom > stack_bottom {
            return Err(DecodeError::BadLayout("constants region out of range"));
        }
        if (stack_bottom - constants_bottom) % WORD_LEN != 0 {
            return Err(DecodeError::BadLayout("constants region is not whole words"));
        }

        let source_offsets: Vec<usize> = (0..count)
            .map(|i| be_u32(buf, HEADER_LEN + 4 * i) as usize)
            .collect();
        let mut expected = code_at;
        for (i, start) in source_offsets.iter().enumerate() {
            if *start != expected {
                return Err(DecodeError::BadLayout("source offsets are not contiguous"));
            }
            let end = source_offsets.get(i + 1).copied().unwrap_or(constants_bottom);
            if end < *start || (end - start) % INSTRUCTION_LEN != 0 {
                return Err(DecodeError::BadLayout("source is not whole instructions"));
            }
            expected = end;
        }
        if expected != constants_bottom {
            return Err(DecodeError::BadLayout("sources do not end at constants bottom"));
        }

        let entrypoints = (0..count)
            .map(|i| buf[bitmap_at + i / 8] & (0x80 >> (i % 8)) != 0)
            .collect();

        Ok(Self {
            min_final_stack,
            stack_capacity,
            source_offsets,
            entrypoints,
            constants_bottom,
            stack_bottom,
        })
    }

    fn source_span(&self, index: usize) -> (usize, usize) {
        let start = self.source_offsets[index];
        let end = self
            .source_offsets
            .get(index + 1)
            .copied()
            .unwrap_or(self.constants_bottom);
        (start, end)
    }
}

/// Serializes a verified expression. Only verified expressions can be serialized, so every
/// buffer this produces deserializes back to an equal value.
pub fn serialize(expr: &VerifiedExpression) -> Vec<u8> {
    let count = expr.source_count();
    let code_len: usize = (0..count)
        .map(|i| expr.source(i).map_or(0, <[_]>::len) * INSTRUCTION_LEN)
        .sum();
    let code_at = HEADER_LEN + 4 * count + count.div_ceil(8);
    let constants_bottom = code_at + code_len;
    let stack_bottom = constants_bottom + expr.constants().len() * WORD_LEN;

    let mut out = Vec::with_capacity(stack_bottom);
    out.extend_from_slice(MAGIC);
    out.push(VERSION);
    out.push(0);
    out.extend_from_slice(&expr.min_final_stack().to_be_bytes());
    out.extend_from_slice(&(expr.stack_capacity() as u32).to_be_bytes());
    out.extend_from_slice(&(count as u16).to_be_bytes());
    out.extend_from_slice(&(constants_bottom as u32).to_be_bytes());
    out.extend_from_slice(&(stack_bottom as u32).to_be_bytes());

    let mut at = code_at;
    for i in 0..count {
        out.extend_from_slice(&(at as u32).to_be_bytes());
        at += expr.source(i).map_or(0, <[_]>::len) * INSTRUCTION_LEN;
    }

    let mut bitmap = vec![0u8; count.div_ceil(8)];
    for (i, entry) in expr.entrypoints().iter().enumerate() {
        if *entry {
            bitmap[i / 8] |= 0x80 >> (i % 8);
        }
    }
    out.extend_from_slice(&bitmap);

    for i in 0..count {
        for ins in expr.source(i).unwrap_or(&[]) {
            out.push(ins.opcode as u8);
            out.extend_from_slice(&ins.operand.to_be_bytes());
        }
    }
    for c in expr.constants() {
        out.extend_from_slice(&c.to_be_bytes::<WORD_LEN>());
    }
    debug_assert_eq!(out.len(), stack_bottom);
    out
}

/// Rebuilds a verified expression from [`serialize`] output.
///
/// The decoded expression is verified again against `table` and `cfg`, and the stack
/// capacity and entrypoint bitmap recorded in the header must match what verification
/// derives. Corrupted or hand-edited state fails here instead of inside the evaluator.
pub fn deserialize(
    buf: &[u8],
    table: &OpTable,
    cfg: &VerifyConfig,
) -> Result<VerifiedExpression, DecodeError> {
    let layout = Layout::read(buf)?;
    let count = layout.source_offsets.len();

    let mut sources = Vec::with_capacity(count);
    for src in 0..count {
        let (start, end) = layout.source_span(src);
        let mut raw = Vec::with_capacity((end - start) / INSTRUCTION_LEN);
        for (offset, chunk) in buf[start..end].chunks_exact(INSTRUCTION_LEN).enumerate() {
            if Opcode::try_from(chunk[0]).is_err() {
                return Err(DecodeError::UnknownOpcode {
                    src,
                    offset,
                    opcode: chunk[0],
                });
            }
            raw.push(Instruction {
                opcode: chunk[0],
                operand: u16::from_be_bytes([chunk[1], chunk[2]]),
            });
        }
        sources.push(raw);
    }

    let constants: Vec<Word> = buf[layout.constants_bottom..layout.stack_bottom]
        .chunks_exact(WORD_LEN)
        .map(U256::from_be_slice)
        .collect();

    let expression = Expression::new(sources, constants, layout.min_final_stack);
    let verified = verify(table, expression, cfg)?;
    if verified.stack_capacity() != layout.stack_capacity {
        return Err(DecodeError::HeaderMismatch {
            field: "stack_capacity",
        });
    }
    if verified.entrypoints() != layout.entrypoints.as_slice() {
        return Err(DecodeError::HeaderMismatch {
            field: "entrypoints",
        });
    }
    Ok(verified)
}

/// Content id of a serialized state: `b3:` + BLAKE3 hex.
pub fn cid(bytes: &[u8]) -> Cid {
    Cid(format!("b3:{}", hex::encode(blake3::hash(bytes).as_bytes())))
}

fn be_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

fn be_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}
