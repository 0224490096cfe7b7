// This module groups the x86-64 specific collaborators of the backend: the physical
// register model and masks, the calling-convention tables, the instruction metadata the
// allocator consults, and the iced-x86 based byte encoder.

//! x86-64 target collaborators.

pub mod conv;
pub mod encoder;
pub mod inst;
pub mod regs;

pub use conv::{ArgType, CallConv};
pub use encoder::{CodeBuffer, Encoder};
pub use inst::InstCode;
pub use regs::{RegIndex, RegMask};
