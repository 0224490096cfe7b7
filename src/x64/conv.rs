// This module implements the calling-convention collaborator for x86-64. It covers the
// System V AMD64 ABI (Linux/Unix) and the Windows x64 convention: which registers carry
// the first arguments of each bank, which registers the callee must preserve, shadow-space
// requirements, and return-value placement. bind_args maps a prototype's argument list to
// concrete register or caller-frame stack assignments; the function-framing code consumes
// the preserved masks when deciding what the prologue saves. System V passes the first six
// integer arguments in RDI, RSI, RDX, RCX, R8, R9 and the first eight floating arguments
// in XMM0-XMM7; Windows x64 uses four positional slots shared between RCX, RDX, R8, R9 and
// XMM0-XMM3 plus 32 bytes of shadow space, and additionally preserves RSI, RDI and
// XMM6-XMM15.

//! System V AMD64 and Windows x64 calling conventions.

use crate::core::var::VarClass;
use crate::x64::regs::{
    RegIndex, RegMask, R12, R13, R14, R15, R8, R9, RAX, RBP, RBX, RCX, RDI, RDX, RSI,
};

/// Supported calling conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallConv {
    SysV64,
    Win64,
}

/// Static description of one calling convention.
#[derive(Debug, Clone, Copy)]
pub struct ConvInfo {
    pub gp_args: &'static [RegIndex],
    pub xmm_args: &'static [RegIndex],
    pub preserved_gp: RegMask,
    pub preserved_mm: RegMask,
    pub preserved_xmm: RegMask,
    /// Stack bytes the caller reserves below its arguments (Win64 shadow space).
    pub shadow_space: u32,
    pub ret_gp: RegIndex,
    pub ret_xmm: RegIndex,
    /// Argument slots are positional across banks (Win64) rather than per-bank.
    pub positional_args: bool,
}

const SYSV_GP_ARGS: [RegIndex; 6] = [RDI, RSI, RDX, RCX, R8, R9];
const SYSV_XMM_ARGS: [RegIndex; 8] = [0, 1, 2, 3, 4, 5, 6, 7];

const WIN64_GP_ARGS: [RegIndex; 4] = [RCX, RDX, R8, R9];
const WIN64_XMM_ARGS: [RegIndex; 4] = [0, 1, 2, 3];

impl CallConv {
    /// Convention of the build host.
    pub fn host() -> Self {
        if cfg!(windows) {
            CallConv::Win64
        } else {
            CallConv::SysV64
        }
    }

    pub fn info(self) -> ConvInfo {
        match self {
            CallConv::SysV64 => ConvInfo {
                gp_args: &SYSV_GP_ARGS,
                xmm_args: &SYSV_XMM_ARGS,
                preserved_gp: RegMask::from_indices(&[RBX, RBP, R12, R13, R14, R15]),
                preserved_mm: RegMask::EMPTY,
                preserved_xmm: RegMask::EMPTY,
                shadow_space: 0,
                ret_gp: RAX,
                ret_xmm: 0,
                positional_args: false,
            },
            CallConv::Win64 => ConvInfo {
                gp_args: &WIN64_GP_ARGS,
                xmm_args: &WIN64_XMM_ARGS,
                preserved_gp: RegMask::from_indices(&[RBX, RBP, RSI, RDI, R12, R13, R14, R15]),
                preserved_mm: RegMask::EMPTY,
                preserved_xmm: RegMask::from_indices(&[6, 7, 8, 9, 10, 11, 12, 13, 14, 15]),
                shadow_space: 32,
                ret_gp: RAX,
                ret_xmm: 0,
                positional_args: true,
            },
        }
    }

    /// Callee-preserved mask for a register bank.
    pub fn preserved(self, bank: usize) -> RegMask {
        let info = self.info();
        match bank {
            crate::x64::regs::BANK_GP => info.preserved_gp,
            crate::x64::regs::BANK_MM => info.preserved_mm,
            _ => info.preserved_xmm,
        }
    }
}

/// Declared type of a function argument or return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    Int32,
    Int64,
    Ptr,
    F32,
    F64,
}

impl ArgType {
    pub fn class(self) -> VarClass {
        match self {
            ArgType::Int32 | ArgType::Int64 | ArgType::Ptr => VarClass::Gp,
            ArgType::F32 | ArgType::F64 => VarClass::Xmm,
        }
    }

    pub fn size(self) -> u8 {
        match self {
            ArgType::Int32 => 4,
            ArgType::Int64 | ArgType::Ptr | ArgType::F64 => 8,
            ArgType::F32 => 4,
        }
    }
}

/// Where one argument arrives.
#[derive(Debug, Clone, Copy)]
pub struct ArgAssign {
    pub class: VarClass,
    pub size: u8,
    pub reg: Option<RegIndex>,
    /// Displacement from the incoming-arguments base when passed on the stack.
    pub stack_offset: Option<i32>,
}

/// Map a prototype's arguments to registers and caller-frame stack slots.
pub fn bind_args(conv: CallConv, args: &[ArgType]) -> Vec<ArgAssign> {
    let info = conv.info();
    let mut out = Vec::with_capacity(args.len());

    let mut gp_used = 0usize;
    let mut xmm_used = 0usize;
    // Stack arguments start above any shadow space the caller reserves.
    let mut stack: i32 = info.shadow_space as i32;

    for (pos, arg) in args.iter().enumerate() {
        let class = arg.class();
        let mut assign =
            ArgAssign { class, size: arg.size(), reg: None, stack_offset: None };

        let slot = if info.positional_args { pos } else { usize::MAX };

        match class {
            VarClass::Gp => {
                let used = if info.positional_args { slot } else { gp_used };
                if used < info.gp_args.len() {
                    assign.reg = Some(info.gp_args[used]);
                    gp_used = used + 1;
                } else {
                    assign.stack_offset = Some(stack);
                    stack += 8;
                }
            }
            VarClass::Xmm => {
                let used = if info.positional_args { slot } else { xmm_used };
                if used < info.xmm_args.len() {
                    assign.reg = Some(info.xmm_args[used]);
                    xmm_used = used + 1;
                } else {
                    assign.stack_offset = Some(stack);
                    stack += 8;
                }
            }
            VarClass::Mm | VarClass::X87 => {
                log::warn!("argument {pos} uses class {class:?}; passing on the stack");
                assign.stack_offset = Some(stack);
                stack += 8;
            }
        }

        out.push(assign);
    }

    out
}

/// Total caller-frame bytes occupied by stack-passed arguments.
pub fn stack_arg_bytes(assigns: &[ArgAssign]) -> u32 {
    assigns
        .iter()
        .filter_map(|a| a.stack_offset)
        .map(|off| off as u32 + 8)
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x64::regs::{BANK_GP, BANK_XMM};

    #[test]
    fn test_sysv_gp_argument_assignment() {
        let args = vec![ArgType::Int64; 8];
        let assigns = bind_args(CallConv::SysV64, &args);

        for (i, expected) in SYSV_GP_ARGS.iter().enumerate() {
            assert_eq!(assigns[i].reg, Some(*expected));
            assert_eq!(assigns[i].stack_offset, None);
        }
        // Seventh and eighth arguments go to the stack at 0 and 8.
        assert_eq!(assigns[6].reg, None);
        assert_eq!(assigns[6].stack_offset, Some(0));
        assert_eq!(assigns[7].stack_offset, Some(8));
    }

    #[test]
    fn test_sysv_mixed_banks_do_not_interfere() {
        let args = [ArgType::Int64, ArgType::F64, ArgType::Int64, ArgType::F64];
        let assigns = bind_args(CallConv::SysV64, &args);
        assert_eq!(assigns[0].reg, Some(RDI));
        assert_eq!(assigns[1].reg, Some(0)); // xmm0
        assert_eq!(assigns[2].reg, Some(RSI));
        assert_eq!(assigns[3].reg, Some(1)); // xmm1
    }

    #[test]
    fn test_win64_positional_slots() {
        let args = [ArgType::Int64, ArgType::F64, ArgType::Int64, ArgType::F64];
        let assigns = bind_args(CallConv::Win64, &args);
        assert_eq!(assigns[0].reg, Some(RCX));
        assert_eq!(assigns[1].reg, Some(1)); // slot 1 -> xmm1
        assert_eq!(assigns[2].reg, Some(R8));
        assert_eq!(assigns[3].reg, Some(3)); // slot 3 -> xmm3
    }

    #[test]
    fn test_win64_stack_args_above_shadow_space() {
        let args = vec![ArgType::Int64; 6];
        let assigns = bind_args(CallConv::Win64, &args);
        assert_eq!(assigns[4].stack_offset, Some(32));
        assert_eq!(assigns[5].stack_offset, Some(40));
        assert_eq!(stack_arg_bytes(&assigns), 48);
    }

    #[test]
    fn test_preserved_masks() {
        let sysv = CallConv::SysV64;
        assert!(sysv.preserved(BANK_GP).contains(RBX));
        assert!(!sysv.preserved(BANK_GP).contains(RAX));
        assert!(sysv.preserved(BANK_XMM).is_empty());

        let win = CallConv::Win64;
        assert!(win.preserved(BANK_GP).contains(RSI));
        assert!(win.preserved(BANK_XMM).contains(6));
        assert!(!win.preserved(BANK_XMM).contains(5));
    }
}
