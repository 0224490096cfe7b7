//! corten - an x86-64 JIT compiler backend.
//!
//! corten lets a host program build a control-flow graph of abstract instructions
//! over virtual registers ("compiler variables"), then lowers that graph into
//! machine code: physical register assignment by a linear-scan style allocator,
//! spill and reload insertion, prologue/epilogue synthesis, and jump resolution,
//! with bytes produced through an iced-x86 based encoder.
//!
//! # Primary usage
//!
//! ```ignore
//! use corten::core::{Compiler, Session};
//! use corten::x64::{ArgType, CallConv};
//! use bumpalo::Bump;
//!
//! let arena = Bump::new();
//! let session = Session::new(&arena);
//! let mut c = Compiler::new(&session);
//!
//! c.new_func(CallConv::SysV64, &[ArgType::Int64, ArgType::Int64], Some(ArgType::Int64))?;
//! let (a, b) = (c.arg(0)?, c.arg(1)?);
//! c.add(c.var_op(a), c.var_op(b))?;
//! c.ret(Some(c.var_op(a)))?;
//! c.end_func()?;
//!
//! let code = c.make(0x1000)?;
//! ```
//!
//! # Architecture
//!
//! - [`core`] - target-independent core: operand model, emittable graph,
//!   variable registry, register allocator, framing, driver, builder
//! - [`x64`] - x86-64 collaborators: registers, calling conventions,
//!   instruction metadata, the byte encoder

pub mod core;
pub mod x64;

pub use crate::core::{
    CompileError, CompileResult, Compiler, Imm, LabelId, Mem, MemBase, Operand, Reg, Session,
    SessionStats, VarClass, VarId,
};
pub use crate::x64::{ArgType, CallConv, CodeBuffer, Encoder, InstCode, RegIndex, RegMask};
