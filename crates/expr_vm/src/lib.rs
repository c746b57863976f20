//! expr-vm - deterministic stack VM for configurable numeric expressions
//!
//! Goals:
//! - Expressions are verified once, at configuration time, and never re-checked per call
//! - 256-bit words with checked and saturating arithmetic
//! - Bounded control flow (CALL, LOOP_N, DO_WHILE, FOLD_CONTEXT) over an explicit frame stack
//! - Packed 8-tier reports as first-class words
//! - No I/O except through the injected [`providers::Store`]

pub mod disasm;
pub mod exec;
pub mod opcode;
pub mod operand;
pub mod ops;
pub mod providers;
pub mod report;
pub mod state;
pub mod table;
pub mod types;
pub mod verify;

pub use disasm::{disassemble, disassemble_bytes};
pub use exec::{ExecError, Fuel, Outcome, TraceStep, Vm, VmConfig};
pub use opcode::Opcode;
pub use providers::{MemStore, ScopedStore, Store};
pub use report::ReportError;
pub use state::{cid, deserialize, serialize, DecodeError, Layout};
pub use table::OpTable;
pub use types::{Cid, Context, Expression, Instruction, Word};
pub use verify::{verify, StackBounds, VerifiedExpression, VerifyConfig, VerifyError};
