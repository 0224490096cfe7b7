// This module defines error types for the corten backend using the thiserror crate for
// idiomatic Rust error handling. CompileError is the unit-wide error enum covering the
// failure taxonomy: usage errors (relinking nodes, invalid variable ids, nested or
// unfinished function definitions), resource exhaustion in the register allocator,
// encoder-reported failures, and architecture mismatches such as unallocatable variable
// classes. Errors are recorded sticky-first on the Compiler instance; the first error wins
// and suppresses all further lowering and code output. CompileResult<T> is the convenience
// alias used throughout the crate.

//! Error types for the compiler backend.

use thiserror::Error;

/// Unit-wide error type for graph construction and lowering.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("emittable is already linked into the instruction stream")]
    AlreadyLinked,

    #[error("operand id {id:#010x} does not reference a variable")]
    InvalidVariable { id: u32 },

    #[error("operand id {id:#010x} does not reference a label")]
    InvalidLabel { id: u32 },

    #[error("a function definition is already open")]
    FunctionNested,

    #[error("no function is open")]
    NoFunction,

    #[error("function body is incomplete")]
    IncompleteFunction,

    #[error("no free register of the required class and no spillable variable")]
    NotEnoughRegisters,

    #[error("required register is pinned by the current instruction")]
    RegistersOverlap,

    #[error("jump target label {label} was never bound")]
    UnboundLabel { label: u32 },

    #[error("label bound in unreachable code with no recorded state")]
    UnknownState,

    #[error("variable class {class} cannot be register-allocated")]
    UnsupportedVarClass { class: &'static str },

    #[error("unsupported operand combination for {name}")]
    UnsupportedInstruction { name: &'static str },

    #[error("immediate {value} does not fit the operand size")]
    ImmediateOverflow { value: i64 },

    #[error("encoding failed: {reason}")]
    Encoding { reason: String },

    #[error("argument index {index} out of range")]
    InvalidArgument { index: usize },
}

/// Result type alias for compile operations.
pub type CompileResult<T> = Result<T, CompileError>;
