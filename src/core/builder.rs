// This module is the builder, the public surface host programs use to construct the
// emittable graph: variable declaration per storage class, label creation and binding,
// function open/close with argument binding through the calling convention, the one
// generic inst(code, operands) primitive every mnemonic helper forwards to, variable
// hints, comments and embedded data. The Compiler owns the node arena, the variable
// registry, the label table and the function list for one compilation unit, and records
// the unit's sticky first error: once set, construction calls become no-ops and
// serialization refuses to emit anything. Insertion goes through a cursor so passes that
// inject code (spills, reloads, prologues, state switches) can splice instructions at any
// point of the stream.

//! The builder API and compilation-unit state.

use crate::core::error::{CompileError, CompileResult};
use crate::core::func::{FuncDecl, FuncId, Prototype};
use crate::core::ir::{
    CallNode, EmittableKind, Emittable, HintNode, InstNode, JmpNode, NodeId, NodeList, RetNode,
    TargetNode,
};
use crate::core::operand::{LabelId, Operand, VarId, VarOperand};
use crate::core::session::Session;
use crate::core::var::{VarClass, VarData, VarHintKind};
use crate::x64::conv::{bind_args, ArgType, CallConv};
use crate::x64::inst::InstCode;
use crate::x64::regs::RegIndex;

/// Builder and unit state for one compilation unit.
///
/// One instance per unit, confined to one thread; independent instances share
/// nothing and may run concurrently.
pub struct Compiler<'a> {
    session: &'a Session<'a>,
    pub(crate) nodes: NodeList<'a>,
    pub(crate) cursor: Option<NodeId>,
    vars: Vec<VarData<'a>>,
    /// Label index -> its Target node.
    pub(crate) targets: Vec<NodeId>,
    pub(crate) funcs: Vec<FuncDecl>,
    pub(crate) current_func: Option<FuncId>,
    error: Option<CompileError>,
    pub(crate) emit_comments: bool,
}

impl<'a> Compiler<'a> {
    pub fn new(session: &'a Session<'a>) -> Self {
        Compiler {
            session,
            nodes: NodeList::new(),
            cursor: None,
            vars: Vec::new(),
            targets: Vec::new(),
            funcs: Vec::new(),
            current_func: None,
            error: None,
            emit_comments: log::log_enabled!(log::Level::Debug),
        }
    }

    pub fn session(&self) -> &'a Session<'a> {
        self.session
    }

    /// First error recorded on this unit, if any.
    pub fn error(&self) -> Option<&CompileError> {
        self.error.as_ref()
    }

    pub(crate) fn set_error(&mut self, e: CompileError) {
        if self.error.is_none() {
            log::debug!("unit error: {e}");
            self.error = Some(e);
        }
    }

    fn record<T>(&mut self, r: CompileResult<T>) -> CompileResult<T> {
        if let Err(e) = &r {
            self.set_error(e.clone());
        }
        r
    }

    // ------------------------------------------------------------------
    // Registry access
    // ------------------------------------------------------------------

    pub(crate) fn var(&self, id: VarId) -> &VarData<'a> {
        &self.vars[id.index()]
    }

    pub(crate) fn var_mut(&mut self, id: VarId) -> &mut VarData<'a> {
        &mut self.vars[id.index()]
    }

    /// Checked lookup through a raw operand id.
    pub fn var_data(&self, raw: u32) -> CompileResult<&VarData<'a>> {
        let id = VarId::from_raw(raw).ok_or(CompileError::InvalidVariable { id: raw })?;
        self.vars.get(id.index()).ok_or(CompileError::InvalidVariable { id: raw })
    }

    pub(crate) fn node(&self, id: NodeId) -> &Emittable<'a> {
        self.nodes.get(id)
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut Emittable<'a> {
        self.nodes.get_mut(id)
    }

    pub(crate) fn alloc_comment(&self, action: &str, name: &str) -> Option<&'a str> {
        if !self.emit_comments {
            return None;
        }
        Some(self.session.intern_str(&format!("{action} {name}")))
    }

    // ------------------------------------------------------------------
    // Variables
    // ------------------------------------------------------------------

    fn new_var(&mut self, class: VarClass, size: u8, name: Option<&str>) -> CompileResult<VarId> {
        if class == VarClass::X87 {
            return self.record(Err(CompileError::UnsupportedVarClass { class: "x87" }));
        }
        let id = VarId::from_index(self.vars.len());
        let name = match name {
            Some(n) => self.session.intern_str(n),
            None => self.session.intern_str(&format!("v{}", id.index())),
        };
        self.vars.push(VarData::new(name, id, class, size));
        Ok(id)
    }

    /// Declare a 64-bit general-purpose variable.
    pub fn gpq(&mut self, name: Option<&str>) -> CompileResult<VarId> {
        self.new_var(VarClass::Gp, 8, name)
    }

    /// Declare a 32-bit general-purpose variable.
    pub fn gpd(&mut self, name: Option<&str>) -> CompileResult<VarId> {
        self.new_var(VarClass::Gp, 4, name)
    }

    /// Declare a 128-bit XMM variable.
    pub fn xmm(&mut self, name: Option<&str>) -> CompileResult<VarId> {
        self.new_var(VarClass::Xmm, 16, name)
    }

    /// Declare a scalar-double XMM variable.
    pub fn xmm_sd(&mut self, name: Option<&str>) -> CompileResult<VarId> {
        self.new_var(VarClass::Xmm, 8, name)
    }

    /// Declare a scalar-single XMM variable.
    pub fn xmm_ss(&mut self, name: Option<&str>) -> CompileResult<VarId> {
        self.new_var(VarClass::Xmm, 4, name)
    }

    /// Declare an MMX variable.
    pub fn mm(&mut self, name: Option<&str>) -> CompileResult<VarId> {
        self.new_var(VarClass::Mm, 8, name)
    }

    /// Operand referencing a declared variable.
    pub fn var_op(&self, id: VarId) -> Operand {
        let vd = self.var(id);
        Operand::Var(VarOperand { id, class: vd.class, size: vd.size })
    }

    /// Spill priority weight; higher spills sooner, zero resists spilling.
    pub fn set_priority(&mut self, id: VarId, priority: u8) {
        self.var_mut(id).priority = priority;
    }

    /// Flush the value to memory when the variable's scope ends.
    pub fn set_save_on_unuse(&mut self, id: VarId, save: bool) {
        self.var_mut(id).save_on_unuse = save;
    }

    /// Ask the allocator to prefer a specific register.
    pub fn set_preferred_reg(&mut self, id: VarId, reg: RegIndex) {
        self.var_mut(id).pref_reg = Some(reg);
    }

    // ------------------------------------------------------------------
    // Node insertion
    // ------------------------------------------------------------------

    /// Insert a node at the cursor and advance the cursor onto it.
    pub(crate) fn add_node(&mut self, kind: EmittableKind<'a>) -> CompileResult<NodeId> {
        let id = self.nodes.alloc(kind);
        self.link_node(id)
    }

    pub(crate) fn link_node(&mut self, id: NodeId) -> CompileResult<NodeId> {
        let cursor = self.cursor;
        let r = self.nodes.link_after(id, cursor);
        self.record(r)?;
        self.cursor = Some(id);
        Ok(id)
    }

    /// Insert an already-resolved instruction at the cursor (spills, prologues,
    /// state switches). These nodes skip prepare and translate.
    pub(crate) fn inject_inst(
        &mut self,
        code: InstCode,
        operands: Vec<Operand>,
        comment: Option<&'a str>,
    ) -> CompileResult<NodeId> {
        let id = self.nodes.alloc(EmittableKind::Inst(InstNode::new(code, operands)));
        self.nodes.get_mut(id).translated = true;
        self.nodes.get_mut(id).comment = comment;
        self.link_node(id)
    }

    /// Insert an already-translated jump to a bound-or-later-bound label.
    pub(crate) fn inject_jump(&mut self, target: LabelId) -> CompileResult<NodeId> {
        self.bump_target_jumps(target);
        let node = JmpNode {
            inst: InstNode::new(InstCode::Jmp, vec![Operand::Label(target)]),
            target,
            state: None,
            taken: true,
        };
        let id = self.nodes.alloc(EmittableKind::Jmp(node));
        self.nodes.get_mut(id).translated = true;
        self.link_node(id)
    }

    fn bump_target_jumps(&mut self, label: LabelId) {
        let tnode = self.targets[label.index()];
        if let EmittableKind::Target(t) = &mut self.nodes.get_mut(tnode).kind {
            t.jumps += 1;
        }
    }

    // ------------------------------------------------------------------
    // Labels
    // ------------------------------------------------------------------

    /// Create a label; its target node is linked into the stream by bind().
    pub fn new_label(&mut self) -> LabelId {
        let label = LabelId::from_index(self.targets.len());
        let node = self.nodes.alloc(EmittableKind::Target(TargetNode::new(label)));
        self.targets.push(node);
        label
    }

    /// Bind a label to the current position. Binding twice is a usage error.
    pub fn bind(&mut self, label: LabelId) -> CompileResult<()> {
        let node = self.targets[label.index()];
        self.link_node(node)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Instructions
    // ------------------------------------------------------------------

    /// The generic emit primitive: append one instruction with its operand list.
    pub fn inst(&mut self, code: InstCode, operands: &[Operand]) -> CompileResult<NodeId> {
        if code.is_jump() {
            return self
                .record(Err(CompileError::UnsupportedInstruction { name: code.info().name }));
        }
        self.add_node(EmittableKind::Inst(InstNode::new(code, operands.to_vec())))
    }

    /// Append a jump (conditional or not) to a label.
    pub fn j(&mut self, code: InstCode, target: LabelId) -> CompileResult<NodeId> {
        if !code.is_jump() {
            return self
                .record(Err(CompileError::UnsupportedInstruction { name: code.info().name }));
        }
        self.bump_target_jumps(target);
        let node = JmpNode {
            inst: InstNode::new(code, vec![Operand::Label(target)]),
            target,
            state: None,
            taken: code == InstCode::Jmp,
        };
        self.add_node(EmittableKind::Jmp(node))
    }

    pub fn jmp(&mut self, target: LabelId) -> CompileResult<NodeId> {
        self.j(InstCode::Jmp, target)
    }

    // Mnemonic sugar; every helper forwards to inst().

    pub fn mov(&mut self, dst: Operand, src: Operand) -> CompileResult<NodeId> {
        self.inst(InstCode::Mov, &[dst, src])
    }

    pub fn add(&mut self, dst: Operand, src: Operand) -> CompileResult<NodeId> {
        self.inst(InstCode::Add, &[dst, src])
    }

    pub fn sub(&mut self, dst: Operand, src: Operand) -> CompileResult<NodeId> {
        self.inst(InstCode::Sub, &[dst, src])
    }

    pub fn and(&mut self, dst: Operand, src: Operand) -> CompileResult<NodeId> {
        self.inst(InstCode::And, &[dst, src])
    }

    pub fn or(&mut self, dst: Operand, src: Operand) -> CompileResult<NodeId> {
        self.inst(InstCode::Or, &[dst, src])
    }

    pub fn xor(&mut self, dst: Operand, src: Operand) -> CompileResult<NodeId> {
        self.inst(InstCode::Xor, &[dst, src])
    }

    pub fn cmp(&mut self, a: Operand, b: Operand) -> CompileResult<NodeId> {
        self.inst(InstCode::Cmp, &[a, b])
    }

    pub fn test(&mut self, a: Operand, b: Operand) -> CompileResult<NodeId> {
        self.inst(InstCode::Test, &[a, b])
    }

    pub fn imul(&mut self, dst: Operand, src: Operand) -> CompileResult<NodeId> {
        self.inst(InstCode::Imul, &[dst, src])
    }

    /// Signed division in the three-operand rdx:rax form.
    pub fn idiv(&mut self, hi: Operand, lo: Operand, src: Operand) -> CompileResult<NodeId> {
        self.inst(InstCode::Idiv, &[hi, lo, src])
    }

    pub fn shl(&mut self, dst: Operand, count: Operand) -> CompileResult<NodeId> {
        self.inst(InstCode::Shl, &[dst, count])
    }

    pub fn shr(&mut self, dst: Operand, count: Operand) -> CompileResult<NodeId> {
        self.inst(InstCode::Shr, &[dst, count])
    }

    pub fn sar(&mut self, dst: Operand, count: Operand) -> CompileResult<NodeId> {
        self.inst(InstCode::Sar, &[dst, count])
    }

    pub fn neg(&mut self, dst: Operand) -> CompileResult<NodeId> {
        self.inst(InstCode::Neg, &[dst])
    }

    pub fn lea(&mut self, dst: Operand, src: Operand) -> CompileResult<NodeId> {
        self.inst(InstCode::Lea, &[dst, src])
    }

    pub fn movsd(&mut self, dst: Operand, src: Operand) -> CompileResult<NodeId> {
        self.inst(InstCode::Movsd, &[dst, src])
    }

    pub fn addsd(&mut self, dst: Operand, src: Operand) -> CompileResult<NodeId> {
        self.inst(InstCode::Addsd, &[dst, src])
    }

    pub fn mulsd(&mut self, dst: Operand, src: Operand) -> CompileResult<NodeId> {
        self.inst(InstCode::Mulsd, &[dst, src])
    }

    // ------------------------------------------------------------------
    // Hints, comments, data
    // ------------------------------------------------------------------

    fn hint(&mut self, var: VarId, kind: VarHintKind, value: Option<RegIndex>) -> CompileResult<()> {
        self.add_node(EmittableKind::VarHint(HintNode { var, kind, value }))?;
        Ok(())
    }

    /// Materialize a variable now, optionally in a specific register.
    pub fn alloc_hint(&mut self, var: VarId, reg: Option<RegIndex>) -> CompileResult<()> {
        self.hint(var, VarHintKind::Alloc, reg)
    }

    pub fn spill_hint(&mut self, var: VarId) -> CompileResult<()> {
        self.hint(var, VarHintKind::Spill, None)
    }

    pub fn save_hint(&mut self, var: VarId) -> CompileResult<()> {
        self.hint(var, VarHintKind::Save, None)
    }

    pub fn unuse_hint(&mut self, var: VarId) -> CompileResult<()> {
        self.hint(var, VarHintKind::Unuse, None)
    }

    /// Attach a free-form comment node to the stream.
    pub fn comment(&mut self, text: &str) -> CompileResult<()> {
        let interned = self.session.intern_str(text);
        let id = self.add_node(EmittableKind::Comment)?;
        self.node_mut(id).comment = Some(interned);
        Ok(())
    }

    /// Embed raw bytes into the instruction stream.
    pub fn data(&mut self, bytes: &[u8]) -> CompileResult<()> {
        let interned = self.session.intern_bytes(bytes);
        self.add_node(EmittableKind::Data(interned))?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Functions
    // ------------------------------------------------------------------

    /// Open a function: emits the Func marker, binds the entry label, places the
    /// Prolog placeholder and binds argument variables per the convention.
    pub fn new_func(
        &mut self,
        conv: CallConv,
        args: &[ArgType],
        ret: Option<ArgType>,
    ) -> CompileResult<FuncId> {
        if self.current_func.is_some() {
            return self.record(Err(CompileError::FunctionNested));
        }

        let func = FuncId(self.funcs.len() as u32);
        let entry = self.new_label();
        let exit = self.new_label();

        let node = self.add_node(EmittableKind::Func(func))?;
        self.bind(entry)?;
        let prolog = self.add_node(EmittableKind::Prolog(func))?;

        // Epilog and End are created now and linked by end_func().
        let epilog = self.nodes.alloc(EmittableKind::Epilog(func));
        let end = self.nodes.alloc(EmittableKind::End(func));

        let assigns = bind_args(conv, args);
        let mut arg_vars = Vec::with_capacity(args.len());
        for (i, assign) in assigns.iter().enumerate() {
            let var = self.new_var(assign.class, assign.size, Some(&format!("arg{i}")))?;
            let vd = self.var_mut(var);
            vd.is_arg = true;
            match assign.reg {
                Some(r) => vd.home_reg = Some(r),
                None => {
                    vd.is_mem_arg = true;
                    vd.arg_offset = assign.stack_offset.unwrap_or(0);
                }
            }
            arg_vars.push(var);
        }

        let proto = Prototype { conv, args: args.to_vec(), ret };
        self.funcs.push(FuncDecl::new(
            proto, entry, exit, node, prolog, epilog, end, assigns, arg_vars,
        ));
        self.current_func = Some(func);
        Ok(func)
    }

    /// Entry label of a function; resolve it against the finished code buffer
    /// to obtain the function's address.
    pub fn func_entry(&self, func: FuncId) -> LabelId {
        self.funcs[func.index()].entry
    }

    /// Variable bound to the i-th argument of the open function.
    pub fn arg(&mut self, index: usize) -> CompileResult<VarId> {
        let func = match self.current_func {
            Some(f) => f,
            None => return self.record(Err(CompileError::NoFunction)),
        };
        match self.funcs[func.index()].arg_vars.get(index) {
            Some(v) => Ok(*v),
            None => self.record(Err(CompileError::InvalidArgument { index })),
        }
    }

    /// Close the open function: binds the exit label and appends Epilog and End.
    pub fn end_func(&mut self) -> CompileResult<FuncId> {
        let func = match self.current_func.take() {
            Some(f) => f,
            None => return self.record(Err(CompileError::NoFunction)),
        };

        let (exit, epilog, end) = {
            let f = &self.funcs[func.index()];
            (f.exit, f.epilog, f.end)
        };
        self.bind(exit)?;
        self.link_node(epilog)?;
        self.link_node(end)?;
        self.funcs[func.index()].finished = true;
        Ok(func)
    }

    /// Return from the open function, yielding an optional value.
    pub fn ret(&mut self, value: Option<Operand>) -> CompileResult<NodeId> {
        let func = match self.current_func {
            Some(f) => f,
            None => return self.record(Err(CompileError::NoFunction)),
        };
        self.add_node(EmittableKind::Ret(RetNode { value, vars: Vec::new(), func }))
    }

    /// Call out-of-unit code. The result variable, if any, receives the callee's
    /// return register.
    pub fn call(
        &mut self,
        target: Operand,
        args: &[Operand],
        ret: Option<VarId>,
    ) -> CompileResult<NodeId> {
        let func = match self.current_func {
            Some(f) => f,
            None => return self.record(Err(CompileError::NoFunction)),
        };
        self.add_node(EmittableKind::Call(CallNode {
            target,
            args: args.to_vec(),
            ret,
            vars: Vec::new(),
            func,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bumpalo::Bump;

    #[test]
    fn test_variable_declaration() {
        let arena = Bump::new();
        let session = Session::new(&arena);
        let mut c = Compiler::new(&session);

        let a = c.gpq(Some("a")).unwrap();
        let b = c.gpd(None).unwrap();
        assert_eq!(c.var(a).size, 8);
        assert_eq!(c.var(b).size, 4);
        assert_eq!(c.var(b).name, "v1");
        assert!(c.var_data(a.raw()).is_ok());
        // A label id is not a variable id.
        let label = c.new_label();
        assert!(matches!(
            c.var_data(label.raw()),
            Err(CompileError::InvalidVariable { .. })
        ));
    }

    #[test]
    fn test_x87_rejected() {
        let arena = Bump::new();
        let session = Session::new(&arena);
        let mut c = Compiler::new(&session);
        let r = c.new_var(VarClass::X87, 10, None);
        assert!(matches!(r, Err(CompileError::UnsupportedVarClass { .. })));
        assert!(c.error().is_some());
    }

    #[test]
    fn test_nested_function_rejected() {
        let arena = Bump::new();
        let session = Session::new(&arena);
        let mut c = Compiler::new(&session);
        c.new_func(CallConv::SysV64, &[], None).unwrap();
        let r = c.new_func(CallConv::SysV64, &[], None);
        assert!(matches!(r, Err(CompileError::FunctionNested)));
    }

    #[test]
    fn test_double_bind_rejected() {
        let arena = Bump::new();
        let session = Session::new(&arena);
        let mut c = Compiler::new(&session);
        let label = c.new_label();
        c.bind(label).unwrap();
        assert!(matches!(c.bind(label), Err(CompileError::AlreadyLinked)));
    }

    #[test]
    fn test_jump_codes_rejected_by_inst() {
        let arena = Bump::new();
        let session = Session::new(&arena);
        let mut c = Compiler::new(&session);
        let r = c.inst(InstCode::Jmp, &[]);
        assert!(matches!(r, Err(CompileError::UnsupportedInstruction { .. })));
    }

    #[test]
    fn test_function_arguments_bound() {
        let arena = Bump::new();
        let session = Session::new(&arena);
        let mut c = Compiler::new(&session);
        let args = vec![ArgType::Int64; 7];
        c.new_func(CallConv::SysV64, &args, Some(ArgType::Int64)).unwrap();
        let a0 = c.arg(0).unwrap();
        let a6 = c.arg(6).unwrap();
        assert!(c.var(a0).home_reg.is_some());
        assert!(!c.var(a0).is_mem_arg);
        assert!(c.var(a6).is_mem_arg);
        assert!(c.arg(7).is_err());
    }
}
