// This module groups the target-independent core of the backend: the operand model, the
// variable registry records, the emittable graph, the allocator context with its state
// snapshots, function framing, the builder API and the serialize driver, plus the ambient
// error and session types. The x64 module supplies the collaborators (registers, calling
// conventions, instruction metadata, the encoder) this core treats as opaque.

//! Target-independent compiler core.

pub mod builder;
pub mod context;
pub mod driver;
pub mod error;
pub mod func;
pub mod ir;
pub mod operand;
pub mod session;
pub mod state;
pub mod var;

pub use builder::Compiler;
pub use context::Context;
pub use error::{CompileError, CompileResult};
pub use func::{FuncDecl, FuncId, Prototype};
pub use ir::{Emittable, EmittableKind, NodeId};
pub use operand::{Imm, LabelId, Mem, MemBase, Operand, Reg, VarId};
pub use session::{Session, SessionStats};
pub use state::{RegState, StateSnapshot};
pub use var::{VarClass, VarData, VarHintKind, VarState};
