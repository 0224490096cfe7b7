// This module holds the per-function records of the backend: the declared prototype
// (calling convention, argument and return types), the argument-to-register/stack bindings
// produced by the convention collaborator, the boundary node and label handles, and the
// frame computation run once allocation is final. prepare_frame intersects the registers
// the allocator actually modified with the convention's callee-preserved set, sizes the
// push/pop area, the XMM save area and the local variable area, and picks the padding that
// keeps rsp 16-byte aligned at call sites. prolog_insts and epilog_insts synthesize the
// instruction sequences the driver injects around the function body.
//
// Frame layout, low to high addresses, after the prologue:
//   rsp + 0                         outgoing call arguments
//   rsp + call_stack                variable home slots
//   rsp + call_stack + locals       saved XMM registers
//   (alignment padding)
//   saved GP registers (push/pop)
//   saved rbp
//   return address                  <- rbp + 8
//   stack-passed arguments          <- rbp + 16 + offset

//! Function prototypes, frame layout and prologue/epilogue synthesis.

use crate::core::ir::NodeId;
use crate::core::operand::{LabelId, Mem, Operand, Reg, VarId};
use crate::x64::conv::{ArgAssign, ArgType, CallConv};
use crate::x64::inst::InstCode;
use crate::x64::regs::{RegMask, BANK_COUNT, BANK_GP, BANK_XMM, RBP, RSP};

/// Index of a function within the compilation unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FuncId(pub u32);

impl FuncId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Declared signature of a function.
#[derive(Debug, Clone)]
pub struct Prototype {
    pub conv: CallConv,
    pub args: Vec<ArgType>,
    pub ret: Option<ArgType>,
}

/// Register/stack base pair memory operands are patched against.
#[derive(Debug, Clone, Copy)]
pub struct FrameBase {
    pub reg: crate::x64::regs::RegIndex,
    pub offset: i32,
}

/// One function under construction or lowering.
#[derive(Debug)]
pub struct FuncDecl {
    pub proto: Prototype,
    pub entry: LabelId,
    pub exit: LabelId,

    pub node: NodeId,
    pub prolog: NodeId,
    pub epilog: NodeId,
    pub end: NodeId,

    pub arg_assigns: Vec<ArgAssign>,
    pub arg_vars: Vec<VarId>,
    pub finished: bool,

    /// The body calls out; affects allocation order and stack reservation.
    pub is_caller: bool,
    /// Bytes reserved at the stack bottom for outgoing call arguments.
    pub call_stack: u32,

    // Filled by prepare_frame.
    pub saved: [RegMask; BANK_COUNT],
    pub stack_sub: u32,
    pub local_bytes: u32,
    pub xmm_save_offset: u32,
    pub args_base: FrameBase,
    pub vars_base: FrameBase,
}

fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) & !(align - 1)
}

impl FuncDecl {
    pub fn new(
        proto: Prototype,
        entry: LabelId,
        exit: LabelId,
        node: NodeId,
        prolog: NodeId,
        epilog: NodeId,
        end: NodeId,
        arg_assigns: Vec<ArgAssign>,
        arg_vars: Vec<VarId>,
    ) -> Self {
        FuncDecl {
            proto,
            entry,
            exit,
            node,
            prolog,
            epilog,
            end,
            arg_assigns,
            arg_vars,
            finished: false,
            is_caller: false,
            call_stack: 0,
            saved: [RegMask::EMPTY; BANK_COUNT],
            stack_sub: 0,
            local_bytes: 0,
            xmm_save_offset: 0,
            args_base: FrameBase { reg: RBP, offset: 16 },
            vars_base: FrameBase { reg: RSP, offset: 0 },
        }
    }

    /// Reserve outgoing argument space for a call in the body.
    pub fn reserve_call_stack(&mut self, bytes: u32) {
        let bytes = align_up(bytes, 16);
        if bytes > self.call_stack {
            self.call_stack = bytes;
        }
        self.is_caller = true;
    }

    /// Compute the frame once the set of modified registers and the total local
    /// slot bytes are known.
    pub fn prepare_frame(&mut self, modified: &[RegMask; BANK_COUNT], local_bytes: u32) {
        for bank in 0..BANK_COUNT {
            self.saved[bank] = modified[bank].intersect(self.proto.conv.preserved(bank));
        }
        // rsp is never allocated; rbp is the frame pointer, saved explicitly.
        self.saved[BANK_GP].clear(RSP);
        self.saved[BANK_GP].clear(RBP);

        self.local_bytes = align_up(local_bytes, 16);
        let xmm_bytes = self.saved[BANK_XMM].count() * 16;
        self.xmm_save_offset = self.call_stack + self.local_bytes;

        let base_sub = self.call_stack + self.local_bytes + xmm_bytes;
        let push_bytes = self.saved[BANK_GP].count() * 8;
        // Keep rsp 16-byte aligned at call sites: entry misalignment is 8, the
        // rbp push cancels it, each further push adds 8.
        let pad = (16 - ((push_bytes + base_sub) % 16)) % 16;
        self.stack_sub = base_sub + pad;

        self.args_base = FrameBase { reg: RBP, offset: 16 };
        self.vars_base = FrameBase { reg: RSP, offset: self.call_stack as i32 };

        log::debug!(
            "frame: locals={} call_stack={} saved_gp={} saved_xmm={} sub={}",
            self.local_bytes,
            self.call_stack,
            self.saved[BANK_GP].count(),
            self.saved[BANK_XMM].count(),
            self.stack_sub
        );
    }

    /// Prologue instruction sequence, injected after the Prolog marker.
    pub fn prolog_insts(&self) -> Vec<(InstCode, Vec<Operand>)> {
        let mut out = Vec::new();

        out.push((InstCode::Push, vec![Operand::Reg(Reg::gpq(RBP))]));
        out.push((InstCode::Mov, vec![Operand::Reg(Reg::gpq(RBP)), Operand::Reg(Reg::gpq(RSP))]));

        for index in self.saved[BANK_GP].iter() {
            out.push((InstCode::Push, vec![Operand::Reg(Reg::gpq(index))]));
        }

        if self.stack_sub > 0 {
            out.push((
                InstCode::Sub,
                vec![Operand::Reg(Reg::gpq(RSP)), Operand::imm(self.stack_sub as i64)],
            ));
        }

        let mut offset = self.xmm_save_offset as i32;
        for index in self.saved[BANK_XMM].iter() {
            out.push((
                InstCode::Movdqa,
                vec![
                    Operand::Mem(Mem::base_disp(RSP, offset, 16)),
                    Operand::Reg(Reg::xmm(index)),
                ],
            ));
            offset += 16;
        }

        out
    }

    /// Epilogue instruction sequence, injected after the Epilog marker.
    pub fn epilog_insts(&self) -> Vec<(InstCode, Vec<Operand>)> {
        let mut out = Vec::new();

        let mut offset = self.xmm_save_offset as i32;
        for index in self.saved[BANK_XMM].iter() {
            out.push((
                InstCode::Movdqa,
                vec![
                    Operand::Reg(Reg::xmm(index)),
                    Operand::Mem(Mem::base_disp(RSP, offset, 16)),
                ],
            ));
            offset += 16;
        }

        if self.stack_sub > 0 {
            out.push((
                InstCode::Add,
                vec![Operand::Reg(Reg::gpq(RSP)), Operand::imm(self.stack_sub as i64)],
            ));
        }

        // Pops restore in the reverse of push order.
        let pushed: Vec<_> = self.saved[BANK_GP].iter().collect();
        for index in pushed.into_iter().rev() {
            out.push((InstCode::Pop, vec![Operand::Reg(Reg::gpq(index))]));
        }

        out.push((InstCode::Mov, vec![Operand::Reg(Reg::gpq(RSP)), Operand::Reg(Reg::gpq(RBP))]));
        out.push((InstCode::Pop, vec![Operand::Reg(Reg::gpq(RBP))]));
        out.push((InstCode::Ret, vec![]));

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x64::regs::{RBX, R12};

    fn decl() -> FuncDecl {
        let proto =
            Prototype { conv: CallConv::SysV64, args: vec![ArgType::Int64], ret: Some(ArgType::Int64) };
        let assigns = crate::x64::conv::bind_args(proto.conv, &proto.args);
        FuncDecl::new(
            proto,
            LabelId::from_index(0),
            LabelId::from_index(1),
            NodeId(0),
            NodeId(1),
            NodeId(2),
            NodeId(3),
            assigns,
            vec![VarId::from_index(0)],
        )
    }

    #[test]
    fn test_frame_alignment() {
        let mut f = decl();
        let mut modified = [RegMask::EMPTY; BANK_COUNT];
        modified[BANK_GP] = RegMask::from_indices(&[RBX, R12]);
        f.prepare_frame(&modified, 20);

        // Two saved registers, 32 locals after alignment.
        assert_eq!(f.saved[BANK_GP].count(), 2);
        assert_eq!(f.local_bytes, 32);
        // push rbp cancels entry misalignment; 2 pushes + sub must re-align.
        assert_eq!((f.saved[BANK_GP].count() * 8 + f.stack_sub) % 16, 0);
    }

    #[test]
    fn test_frame_never_saves_rsp_rbp() {
        let mut f = decl();
        let mut modified = [RegMask::EMPTY; BANK_COUNT];
        modified[BANK_GP] = RegMask::from_indices(&[RSP, RBP, RBX]);
        f.prepare_frame(&modified, 0);
        assert!(!f.saved[BANK_GP].contains(RSP));
        assert!(!f.saved[BANK_GP].contains(RBP));
        assert!(f.saved[BANK_GP].contains(RBX));
    }

    #[test]
    fn test_prolog_epilog_symmetry() {
        let mut f = decl();
        let mut modified = [RegMask::EMPTY; BANK_COUNT];
        modified[BANK_GP] = RegMask::from_indices(&[RBX, R12]);
        f.prepare_frame(&modified, 8);

        let prolog = f.prolog_insts();
        let epilog = f.epilog_insts();

        let pushes = prolog.iter().filter(|(c, _)| *c == InstCode::Push).count();
        let pops = epilog.iter().filter(|(c, _)| *c == InstCode::Pop).count();
        // The epilogue pops everything pushed, including rbp.
        assert_eq!(pushes, pops);

        // First prologue instruction establishes the frame pointer chain.
        assert_eq!(prolog[0].0, InstCode::Push);
        assert_eq!(prolog[1].0, InstCode::Mov);
    }

    #[test]
    fn test_call_stack_reservation() {
        let mut f = decl();
        f.reserve_call_stack(24);
        f.reserve_call_stack(8);
        assert!(f.is_caller);
        assert_eq!(f.call_stack, 32); // 24 aligned up, 8 does not shrink it
    }
}
