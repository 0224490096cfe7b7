// This module is the multi-pass lowering engine. serialize() walks the emittable list
// looking for function markers; for each finished function it runs, in order: the prepare
// walk (offsets, liveness windows, reference counters, allocation records), the translate
// walk (register assignment and operand rewriting, with state snapshots at jumps and
// labels), the FIFO replay of deferred forward jumps, home-slot offset assignment, frame
// computation with prologue/epilogue injection, the memory-operand patch pass, the emit
// walk handing resolved nodes to the encoder, and a post walk that verifies every jump
// found a bound target. The per-node-kind behavior of each pass lives here as one
// exhaustive match per pass instead of virtual dispatch on the nodes. Any failure is
// recorded as the unit's sticky error and stops all further functions; nothing is emitted
// from a failed unit.

//! The serialize driver: prepare, translate, fix up, emit.

use crate::core::builder::Compiler;
use crate::core::context::Context;
use crate::core::error::{CompileError, CompileResult};
use crate::core::ir::{EmittableKind, HintNode, NodeId};
use crate::core::operand::{Mem, MemBase, Operand, Reg, VarId};
use crate::core::state::RegState;
use crate::core::var::{AllocFlags, VarAllocRecord, VarHintKind, VarState, INVALID_OFFSET};
use crate::x64::conv::{bind_args, stack_arg_bytes, ArgType};
use crate::x64::encoder::{CodeBuffer, Encoder};
use crate::x64::inst::InstCode;
use crate::x64::regs::{RegIndex, BANK_GP, BANK_XMM, RAX, RCX, RDX, RSP};

impl<'a> Compiler<'a> {
    /// Lower the whole unit into the encoder.
    pub fn serialize(&mut self, enc: &mut Encoder) -> CompileResult<()> {
        if let Some(e) = self.error() {
            return Err(e.clone());
        }
        let r = self.serialize_inner(enc);
        if let Err(e) = &r {
            self.set_error(e.clone());
        }
        r
    }

    /// Lower and assemble, returning the finished code buffer.
    pub fn make(&mut self, base: u64) -> CompileResult<CodeBuffer> {
        let mut enc = Encoder::new(base)?;
        self.serialize(&mut enc)?;
        let buffer = enc.finish()?;
        self.session().record(|s| s.code_bytes += buffer.len());
        log::info!("compiled unit: {}", self.session().stats());
        Ok(buffer)
    }

    fn serialize_inner(&mut self, enc: &mut Encoder) -> CompileResult<()> {
        let mut start_opt = self.nodes.first();

        loop {
            // Find the next function, emitting loose nodes directly.
            let (start, func) = loop {
                let Some(id) = start_opt else { return Ok(()) };
                let func = match &self.node(id).kind {
                    EmittableKind::Func(f) => Some(*f),
                    _ => None,
                };
                match func {
                    Some(f) => break (id, f),
                    None => self.emit_node(enc, id)?,
                }
                start_opt = self.node(id).next;
            };

            let fd = &self.funcs[func.index()];
            if !fd.finished {
                return Err(CompileError::IncompleteFunction);
            }
            let stop = fd.end;
            let extra = self.node(stop).prev.ok_or(CompileError::IncompleteFunction)?;
            let conv = fd.proto.conv;
            let preserved = [conv.preserved(0), conv.preserved(1), conv.preserved(2)];
            let mut cc = Context::new(func, start, stop, extra, preserved, fd.is_caller);

            log::debug!("serializing function {}", func.index());

            // Step 1: prepare walk.
            let mut cur = start;
            loop {
                self.prepare_node(&mut cc, cur)?;
                if cur == stop {
                    break;
                }
                cur = self.node(cur).next.ok_or(CompileError::IncompleteFunction)?;
            }

            // Step 2a: translate walk.
            let mut cur = start;
            loop {
                self.cursor = self.node(cur).prev;
                cc.current_offset = self.node(cur).offset;
                self.translate_node(&mut cc, cur)?;
                self.node_mut(cur).translated = true;
                if cur == stop {
                    break;
                }
                cur = self.node(cur).next.ok_or(CompileError::IncompleteFunction)?;
            }

            // Step 2b: replay deferred forward jumps in deferral order.
            let pending = std::mem::take(&mut cc.forward_jumps);
            for fj in pending {
                cc.assign_state(self, &fj.state);
                self.cursor = self.node(fj.node).prev;
                self.do_jump(&mut cc, fj.node)?;
                self.session().record(|s| s.forward_jumps_resolved += 1);
            }

            // Step 2c: final home-slot offsets.
            cc.alloc_memory_operands();

            // Step 2d: frame, prologue/epilogue, memory patching.
            let modified = cc.modified;
            let mem_bytes = cc.mem_bytes_total;
            let (prolog_node, epilog_node) = {
                let fd = &mut self.funcs[func.index()];
                fd.prepare_frame(&modified, mem_bytes);
                cc.args_base = fd.args_base;
                cc.vars_base = fd.vars_base;
                (fd.prolog, fd.epilog)
            };

            let prolog = self.funcs[func.index()].prolog_insts();
            self.cursor = Some(prolog_node);
            for (code, ops) in prolog {
                self.inject_inst(code, ops, None)?;
            }

            let epilog = self.funcs[func.index()].epilog_insts();
            self.cursor = Some(epilog_node);
            for (code, ops) in epilog {
                self.inject_inst(code, ops, None)?;
            }

            cc.patch_memory_operands(self)?;

            // Step 3: hand every node to the encoder.
            let extra = cc.extra;
            let mut cur = start;
            loop {
                self.emit_node(enc, cur)?;
                if cur == extra {
                    break;
                }
                cur = self.node(cur).next.ok_or(CompileError::IncompleteFunction)?;
            }

            // Step 4: post pass; no function finishes with unresolved jumps.
            let mut cur = start;
            loop {
                self.post_node(enc, cur)?;
                if cur == extra {
                    break;
                }
                cur = self.node(cur).next.ok_or(CompileError::IncompleteFunction)?;
            }

            self.session().record(|s| s.functions_compiled += 1);
            start_opt = self.node(extra).next;
        }
    }

    // ------------------------------------------------------------------
    // Prepare pass
    // ------------------------------------------------------------------

    fn node_tag(&self, id: NodeId) -> NodeTag {
        match &self.node(id).kind {
            EmittableKind::Inst(_) => NodeTag::Inst,
            EmittableKind::Jmp(_) => NodeTag::Jmp,
            EmittableKind::Ret(_) => NodeTag::Ret,
            EmittableKind::Call(_) => NodeTag::Call,
            EmittableKind::Func(f) => NodeTag::Func(*f),
            EmittableKind::Target(_) => NodeTag::Target,
            EmittableKind::VarHint(h) => NodeTag::Hint(*h),
            EmittableKind::Prolog(_)
            | EmittableKind::Epilog(_)
            | EmittableKind::End(_)
            | EmittableKind::Comment
            | EmittableKind::Data(_) => NodeTag::Skip,
        }
    }

    fn prepare_node(&mut self, cc: &mut Context, id: NodeId) -> CompileResult<()> {
        self.node_mut(id).offset = cc.current_offset;

        match self.node_tag(id) {
            NodeTag::Inst => self.prepare_inst(cc, id),
            NodeTag::Jmp => self.prepare_jump(cc, id),
            NodeTag::Ret => self.prepare_ret(cc, id),
            NodeTag::Call => self.prepare_call(cc, id),
            NodeTag::Target => {
                cc.current_offset += 1;
                Ok(())
            }
            NodeTag::Hint(h) => self.prepare_hint(cc, id, h),
            NodeTag::Func(_) | NodeTag::Skip => Ok(()),
        }
    }

    fn activate(&mut self, cc: &mut Context, v: VarId) {
        if !cc.is_active(self, v) {
            cc.add_active(self, v);
        }
    }

    fn prepare_inst(&mut self, cc: &mut Context, id: NodeId) -> CompileResult<()> {
        let (code, operands, mem_op) = match &self.node(id).kind {
            EmittableKind::Inst(i) => (i.code(), i.operands.clone(), i.mem_op),
            _ => unreachable!(),
        };
        let offset = self.node(id).offset;

        // First scan: activate variables and count distinct register candidates.
        let mut var_count = 0usize;
        for op in &operands {
            match op {
                Operand::Var(vo) => {
                    let v = vo.id;
                    if self.var(v).work_offset == offset {
                        continue;
                    }
                    self.activate(cc, v);
                    self.var_mut(v).work_offset = offset;
                    var_count += 1;
                }
                Operand::Mem(m) => {
                    if let Some(v) = m.home {
                        cc.mark_memory_used(self, v);
                        self.activate(cc, v);
                        continue;
                    }
                    if let MemBase::Var(v) = m.base {
                        if self.var(v).work_offset != offset {
                            self.activate(cc, v);
                            self.var_mut(v).work_offset = offset;
                            var_count += 1;
                        }
                    }
                    if let MemBase::Var(v) = m.index {
                        if self.var(v).work_offset != offset {
                            self.activate(cc, v);
                            self.var_mut(v).work_offset = offset;
                            var_count += 1;
                        }
                    }
                }
                _ => {}
            }
        }

        if var_count == 0 {
            cc.current_offset += 1;
            return Ok(());
        }

        // Second scan: build allocation records with access flags and pins.
        let mut records: Vec<VarAllocRecord> = Vec::with_capacity(var_count);
        let special = code.is_special() && operands.len() == 3;

        for (i, op) in operands.iter().enumerate() {
            match op {
                Operand::Var(vo) => {
                    let v = vo.id;
                    let idx = record_index(&mut records, v);
                    records[idx].flags.insert(AllocFlags::REGISTER);

                    let mut pin: Option<RegIndex> = None;
                    if special {
                        // The rdx:rax family: remainder/high, quotient/low, source.
                        match i {
                            0 => {
                                self.var_mut(v).reg_write += 1;
                                records[idx].flags.insert(AllocFlags::WRITE);
                                pin = Some(RDX);
                            }
                            1 => {
                                self.var_mut(v).reg_rw += 1;
                                records[idx].flags.insert(AllocFlags::READ_WRITE);
                                pin = Some(RAX);
                            }
                            _ => {
                                self.var_mut(v).reg_read += 1;
                                records[idx].flags.insert(AllocFlags::READ);
                            }
                        }
                    } else if code.is_shift() && i == 1 {
                        self.var_mut(v).reg_read += 1;
                        records[idx].flags.insert(AllocFlags::READ);
                        pin = Some(RCX);
                    } else if i == 0 {
                        if code == InstCode::Cmp || code == InstCode::Test {
                            self.var_mut(v).reg_read += 1;
                            records[idx].flags.insert(AllocFlags::READ);
                        } else if code.is_mov() {
                            self.var_mut(v).reg_write += 1;
                            records[idx].flags.insert(AllocFlags::WRITE);
                        } else {
                            self.var_mut(v).reg_rw += 1;
                            records[idx].flags.insert(AllocFlags::READ_WRITE);
                        }
                    } else {
                        self.var_mut(v).reg_read += 1;
                        records[idx].flags.insert(AllocFlags::READ);
                    }

                    if mem_op.is_none() && i < 2 && code.mem_allowed(i) {
                        records[idx].flags.insert(AllocFlags::MEMORY);
                    }

                    if let Some(p) = pin {
                        records[idx].pref = Some(p);
                        if self.var(v).home_reg.is_none() {
                            self.var_mut(v).home_reg = Some(p);
                        }
                    }
                }
                Operand::Mem(m) => {
                    if let Some(v) = m.home {
                        if i == 0 {
                            if code.is_mov() {
                                self.var_mut(v).mem_write += 1;
                            } else {
                                self.var_mut(v).mem_rw += 1;
                            }
                        } else {
                            self.var_mut(v).mem_read += 1;
                        }
                    }
                    if let MemBase::Var(v) = m.base {
                        let idx = record_index(&mut records, v);
                        self.var_mut(v).reg_read += 1;
                        records[idx]
                            .flags
                            .insert(AllocFlags::REGISTER.union(AllocFlags::READ));
                    }
                    if let MemBase::Var(v) = m.index {
                        let idx = record_index(&mut records, v);
                        self.var_mut(v).reg_read += 1;
                        records[idx]
                            .flags
                            .insert(AllocFlags::REGISTER.union(AllocFlags::READ));
                    }
                }
                _ => {}
            }
        }

        for r in &records {
            let vd = self.var_mut(r.var);
            if vd.first_node.is_none() {
                vd.first_node = Some(id);
            }
            vd.last_node = Some(id);
        }

        // xor r,r and friends: the result ignores the old value, so a spilled
        // variable need not be reloaded first.
        if records.len() == 1
            && operands.len() > 1
            && operands[0].is_var()
            && operands[1].is_var()
            && mem_op.is_none()
            && code.is_zero_idiom()
        {
            records[0].flags = AllocFlags::WRITE.union(AllocFlags::REGISTER);
            let vd = self.var_mut(records[0].var);
            vd.reg_read = vd.reg_read.saturating_sub(1);
        }

        match &mut self.node_mut(id).kind {
            EmittableKind::Inst(i) => i.vars = records,
            _ => unreachable!(),
        }
        cc.current_offset += 1;
        Ok(())
    }

    fn prepare_jump(&mut self, cc: &mut Context, id: NodeId) -> CompileResult<()> {
        let offset = self.node(id).offset;
        let (code, target) = match &self.node(id).kind {
            EmittableKind::Jmp(j) => (j.inst.code(), j.target),
            _ => unreachable!(),
        };

        let tnode = self.targets[target.index()];
        let toffset = self.node(tnode).offset;

        // A conditional jump backward is presumed taken (loops).
        if code != InstCode::Jmp && toffset != INVALID_OFFSET && toffset < offset {
            match &mut self.node_mut(id).kind {
                EmittableKind::Jmp(j) => j.taken = true,
                _ => unreachable!(),
            }
        }

        // A variable live anywhere across the jump target stays live through
        // this jump; the loop body may run again.
        if toffset != INVALID_OFFSET {
            for v in cc.active_vars(self) {
                let vd = self.var(v);
                if let (Some(f), Some(l)) = (vd.first_node, vd.last_node) {
                    let s = self.node(f).offset;
                    let e = self.node(l).offset;
                    if toffset >= s && toffset <= e {
                        self.var_mut(v).last_node = Some(id);
                    }
                }
            }
        }

        cc.current_offset += 1;
        Ok(())
    }

    fn prepare_ret(&mut self, cc: &mut Context, id: NodeId) -> CompileResult<()> {
        let offset = self.node(id).offset;
        let (value, func) = match &self.node(id).kind {
            EmittableKind::Ret(r) => (r.value, r.func),
            _ => unreachable!(),
        };

        let mut records = Vec::new();
        if let Some(Operand::Var(vo)) = value {
            let v = vo.id;
            self.activate(cc, v);
            self.var_mut(v).work_offset = offset;
            self.var_mut(v).reg_read += 1;

            let info = self.funcs[func.index()].proto.conv.info();
            let pin = match vo.class.bank() {
                crate::x64::regs::BANK_GP => info.ret_gp,
                _ => info.ret_xmm,
            };
            records.push(VarAllocRecord {
                var: v,
                flags: AllocFlags::READ.union(AllocFlags::REGISTER),
                pref: Some(pin),
            });

            let vd = self.var_mut(v);
            if vd.first_node.is_none() {
                vd.first_node = Some(id);
            }
            vd.last_node = Some(id);
        }

        match &mut self.node_mut(id).kind {
            EmittableKind::Ret(r) => r.vars = records,
            _ => unreachable!(),
        }
        cc.current_offset += 1;
        Ok(())
    }

    fn prepare_call(&mut self, cc: &mut Context, id: NodeId) -> CompileResult<()> {
        let offset = self.node(id).offset;
        let (target, args, ret, func) = match &self.node(id).kind {
            EmittableKind::Call(c) => (c.target, c.args.clone(), c.ret, c.func),
            _ => unreachable!(),
        };

        let conv = self.funcs[func.index()].proto.conv;
        let assigns = bind_args(conv, &call_arg_types(&args));
        let shadow = conv.info().shadow_space;
        let stack = stack_arg_bytes(&assigns).max(shadow);
        self.funcs[func.index()].reserve_call_stack(stack);

        let mut records = Vec::new();

        if let Operand::Var(vo) = target {
            let v = vo.id;
            self.activate(cc, v);
            self.var_mut(v).work_offset = offset;
            self.var_mut(v).reg_read += 1;
            records.push(VarAllocRecord {
                var: v,
                flags: AllocFlags::READ.union(AllocFlags::REGISTER),
                // rax is never an argument register, and the call clobbers it
                // anyway.
                pref: Some(RAX),
            });
            let vd = self.var_mut(v);
            if vd.first_node.is_none() {
                vd.first_node = Some(id);
            }
            vd.last_node = Some(id);
        }

        for (arg, assign) in args.iter().zip(&assigns) {
            if let Operand::Var(vo) = arg {
                let v = vo.id;
                if self.var(v).work_offset != offset {
                    self.activate(cc, v);
                    self.var_mut(v).work_offset = offset;
                }
                self.var_mut(v).reg_read += 1;
                records.push(VarAllocRecord {
                    var: v,
                    flags: AllocFlags::READ.union(AllocFlags::REGISTER),
                    pref: assign.reg,
                });
                let vd = self.var_mut(v);
                if vd.first_node.is_none() {
                    vd.first_node = Some(id);
                }
                vd.last_node = Some(id);
            }
        }

        if let Some(v) = ret {
            self.activate(cc, v);
            self.var_mut(v).reg_write += 1;
            let vd = self.var_mut(v);
            if vd.first_node.is_none() {
                vd.first_node = Some(id);
            }
            vd.last_node = Some(id);
        }

        match &mut self.node_mut(id).kind {
            EmittableKind::Call(c) => c.vars = records,
            _ => unreachable!(),
        }
        cc.current_offset += 1;
        Ok(())
    }

    fn prepare_hint(&mut self, cc: &mut Context, id: NodeId, h: HintNode) -> CompileResult<()> {
        let vd = self.var_mut(h.var);
        if vd.first_node.is_none() {
            vd.first_node = Some(id);
        }
        vd.last_node = Some(id);

        match h.kind {
            VarHintKind::Alloc | VarHintKind::Spill | VarHintKind::Save | VarHintKind::SaveAndUnuse => {
                self.activate(cc, h.var);
            }
            VarHintKind::Unuse => {}
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Translate pass
    // ------------------------------------------------------------------

    fn translate_node(&mut self, cc: &mut Context, id: NodeId) -> CompileResult<()> {
        if self.node(id).translated {
            return Ok(());
        }
        match self.node_tag(id) {
            NodeTag::Inst => self.translate_inst(cc, id),
            NodeTag::Jmp => self.translate_jump(cc, id),
            NodeTag::Ret => self.translate_ret(cc, id),
            NodeTag::Call => self.translate_call(cc, id),
            NodeTag::Func(f) => self.translate_func(cc, f),
            NodeTag::Target => self.translate_target(cc, id),
            NodeTag::Hint(h) => self.translate_hint(cc, id, h),
            NodeTag::Skip => Ok(()),
        }
    }

    fn translate_inst(&mut self, cc: &mut Context, id: NodeId) -> CompileResult<()> {
        let (mut operands, records, mem_op) = match &mut self.node_mut(id).kind {
            EmittableKind::Inst(i) => {
                (std::mem::take(&mut i.operands), std::mem::take(&mut i.vars), i.mem_op)
            }
            _ => unreachable!(),
        };

        if !records.is_empty() {
            // Variables of this instruction are pinned against spilling by it.
            for r in &records {
                self.var_mut(r.var).work_offset = cc.current_offset;
            }

            // Fixed-register operands first; they have the least freedom.
            for r in &records {
                if r.pref.is_some() {
                    cc.alloc_var(self, r.var, r.pref, r.flags)?;
                }
            }
            let mut mem_slot_used = mem_op.is_some();
            for r in &records {
                if r.pref.is_some() {
                    continue;
                }
                // A spilled variable may serve directly as the one memory
                // operand when the instruction form allows it.
                if !mem_slot_used
                    && r.flags.contains(AllocFlags::MEMORY)
                    && self.var(r.var).state == VarState::InMemory
                {
                    mem_slot_used = true;
                    continue;
                }
                cc.alloc_var(self, r.var, None, r.flags)?;
            }

            cc.translate_operands(self, &mut operands)?;
        }

        // Direct stores through a variable's home slot change where the
        // authoritative value lives.
        if let Some(pos) = mem_op {
            if let Operand::Mem(m) = operands[pos] {
                if let Some(v) = m.home {
                    match self.var(v).state {
                        VarState::Unused => self.var_mut(v).state = VarState::InMemory,
                        VarState::InRegister => {
                            self.var_mut(v).changed = false;
                            cc.unuse_var(self, v, VarState::InMemory);
                        }
                        VarState::InMemory => {}
                    }
                }
            }
        }

        for r in &records {
            cc.unuse_on_end_of_scope(self, id, r.var)?;
        }

        match &mut self.node_mut(id).kind {
            EmittableKind::Inst(i) => {
                i.operands = operands;
                i.vars = records;
            }
            _ => unreachable!(),
        }
        self.session().record(|s| s.instructions_translated += 1);
        Ok(())
    }

    fn translate_jump(&mut self, cc: &mut Context, id: NodeId) -> CompileResult<()> {
        let (code, target) = match &self.node(id).kind {
            EmittableKind::Jmp(j) => (j.inst.code(), j.target),
            _ => unreachable!(),
        };

        let tnode = self.targets[target.index()];
        let target_translated = self.node(tnode).translated;

        let state = cc.save_state(self);
        match &mut self.node_mut(id).kind {
            EmittableKind::Jmp(j) => j.state = Some(state.clone()),
            _ => unreachable!(),
        }

        if target_translated {
            // Backward jump: the target state is authoritative, reconcile now.
            self.do_jump(cc, id)?;
        } else {
            // Forward jump: defer until the bind point's state is known.
            cc.add_forward_jump(id, state.clone());
            match &mut self.node_mut(tnode).kind {
                EmittableKind::Target(t) => t.state = Some(state),
                _ => unreachable!(),
            }
        }

        if code == InstCode::Jmp {
            cc.unreachable = true;
        }

        for v in cc.active_vars(self) {
            cc.unuse_on_end_of_scope(self, id, v)?;
        }
        Ok(())
    }

    /// Finalize a jump whose target state is known, reconciling allocator state
    /// across the edge.
    fn do_jump(&mut self, cc: &mut Context, id: NodeId) -> CompileResult<()> {
        let (code, target, taken, jstate) = match &self.node(id).kind {
            EmittableKind::Jmp(j) => (j.inst.code(), j.target, j.taken, j.state.clone()),
            _ => unreachable!(),
        };

        let tnode = self.targets[target.index()];
        let toffset = self.node(tnode).offset;
        let joffset = self.node(id).offset;
        let tstate = match &self.node(tnode).kind {
            EmittableKind::Target(t) => t.state.clone(),
            _ => unreachable!(),
        }
        .ok_or(CompileError::UnboundLabel { label: target.raw() })?;

        if code == InstCode::Jmp || (taken && toffset < joffset) {
            // Taken path: emit the reconciling moves right at the jump site.
            cc.restore_state(self, &tstate)?;
        } else {
            // Not-taken path: reconciling code would burden the fall-through, so
            // it goes to the extra block after the epilog, reached through a
            // fresh label that jumps on to the real target.
            let saved_cursor = self.cursor;
            let ext = cc.extra;
            self.cursor = Some(ext);

            cc.restore_state(self, &tstate)?;

            if self.cursor != Some(ext) {
                self.inject_jump(target)?;
                let new_ext = self.cursor.expect("cursor lost after injection");

                let switch = self.new_label();
                let st = self.targets[switch.index()];
                self.nodes.link_after(st, Some(ext))?;
                self.node_mut(st).translated = true;

                match &mut self.node_mut(id).kind {
                    EmittableKind::Jmp(j) => {
                        j.target = switch;
                        j.inst.operands[0] = Operand::Label(switch);
                    }
                    _ => unreachable!(),
                }
                cc.extra = new_ext;
            }

            self.cursor = saved_cursor;

            // The fall-through continues from the state at the jump site.
            if let Some(js) = jstate {
                cc.assign_state(self, &js);
            }
        }
        Ok(())
    }

    fn translate_ret(&mut self, cc: &mut Context, id: NodeId) -> CompileResult<()> {
        let (mut value, records, func) = match &mut self.node_mut(id).kind {
            EmittableKind::Ret(r) => (r.value, std::mem::take(&mut r.vars), r.func),
            _ => unreachable!(),
        };

        for r in &records {
            self.var_mut(r.var).work_offset = cc.current_offset;
        }
        for r in &records {
            cc.alloc_var(self, r.var, r.pref, r.flags)?;
        }
        if let Some(op) = value.as_mut() {
            let mut ops = [*op];
            cc.translate_operands(self, &mut ops)?;
            *op = ops[0];
        }

        // Variable values are pinned onto the return register by the allocation
        // above; anything else needs an explicit move.
        if records.is_empty() {
            if let Some(op) = value {
                let info = self.funcs[func.index()].proto.conv.info();
                match op {
                    Operand::Var(_) => {}
                    Operand::Imm(_) | Operand::Reg(_) => {
                        if let Some(holder) = cc.state.slot(BANK_GP, info.ret_gp) {
                            cc.spill_var(self, holder)?;
                        }
                        let dst = Operand::Reg(Reg::gpq(info.ret_gp));
                        self.inject_inst(InstCode::Mov, vec![dst, op], None)?;
                    }
                    Operand::Mem(m) => {
                        if m.size <= 8 {
                            if let Some(holder) = cc.state.slot(BANK_GP, info.ret_gp) {
                                cc.spill_var(self, holder)?;
                            }
                            let dst = Operand::Reg(Reg::gpq(info.ret_gp));
                            self.inject_inst(InstCode::Mov, vec![dst, op], None)?;
                        } else {
                            return Err(CompileError::UnsupportedInstruction { name: "ret" });
                        }
                    }
                    Operand::Label(_) => {
                        return Err(CompileError::UnsupportedInstruction { name: "ret" });
                    }
                }
            }
        }

        for r in &records {
            cc.unuse_on_end_of_scope(self, id, r.var)?;
        }

        match &mut self.node_mut(id).kind {
            EmittableKind::Ret(r) => {
                r.value = value;
                r.vars = records;
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    fn translate_call(&mut self, cc: &mut Context, id: NodeId) -> CompileResult<()> {
        let (mut target, args, ret, records, func) = match &mut self.node_mut(id).kind {
            EmittableKind::Call(c) => (
                c.target,
                c.args.clone(),
                c.ret,
                std::mem::take(&mut c.vars),
                c.func,
            ),
            _ => unreachable!(),
        };

        let conv = self.funcs[func.index()].proto.conv;
        let info = conv.info();
        let assigns = bind_args(conv, &call_arg_types(&args));

        for r in &records {
            self.var_mut(r.var).work_offset = cc.current_offset;
        }

        // Place register arguments and the target on their pinned homes.
        for r in &records {
            cc.alloc_var(self, r.var, r.pref, r.flags)?;
        }

        // Resolve the target while its variable still has a register; the byte
        // value survives the flushing below.
        let mut ops = [target];
        cc.translate_operands(self, &mut ops)?;
        target = ops[0];

        // Immediate register arguments and stack-passed arguments.
        for (arg, assign) in args.iter().zip(&assigns) {
            match (arg, assign.reg, assign.stack_offset) {
                (Operand::Imm(imm), Some(reg), _) => {
                    // The register may still hold an unrelated variable.
                    if let Some(holder) = cc.state.slot(BANK_GP, reg) {
                        if !records.iter().any(|r| r.var == holder) {
                            cc.spill_var(self, holder)?;
                        }
                    }
                    let dst = Operand::Reg(Reg::gpq(reg));
                    self.inject_inst(InstCode::Mov, vec![dst, Operand::Imm(*imm)], None)?;
                }
                (Operand::Var(vo), None, Some(off)) => {
                    let reg = self.var(vo.id).reg.ok_or(CompileError::RegistersOverlap)?;
                    if vo.class.bank() == BANK_XMM {
                        let slot = Mem::base_disp(RSP, off, vo.size);
                        let src = Operand::Reg(Reg { bank: BANK_XMM, index: reg, size: vo.size });
                        let code = if vo.size == 4 { InstCode::Movss } else { InstCode::Movsd };
                        self.inject_inst(code, vec![Operand::Mem(slot), src], None)?;
                    } else {
                        let slot = Mem::base_disp(RSP, off, 8);
                        let src = Operand::Reg(Reg::gpq(reg));
                        self.inject_inst(InstCode::Mov, vec![Operand::Mem(slot), src], None)?;
                    }
                }
                (Operand::Imm(imm), None, Some(off)) => {
                    let slot = Mem::base_disp(RSP, off, 8);
                    self.inject_inst(
                        InstCode::Mov,
                        vec![Operand::Mem(slot), Operand::Imm(*imm)],
                        None,
                    )?;
                }
                _ => {}
            }
        }

        // The callee preserves nothing else: flush every caller-saved register.
        for (bank, i) in RegState::all_regs() {
            if conv.preserved(bank).contains(i) {
                continue;
            }
            let Some(v) = cc.state.slot(bank, i) else { continue };
            if records.iter().any(|r| r.var == v) {
                // Argument values die in the call; keep memory consistent.
                if self.var(v).changed {
                    cc.save_var(self, v)?;
                }
                cc.unuse_var(self, v, VarState::InMemory);
            } else {
                cc.spill_var(self, v)?;
            }
        }

        // The return value materializes in the convention's return register.
        if let Some(v) = ret {
            let bank = self.var(v).class.bank();
            let reg = match bank {
                BANK_GP => info.ret_gp,
                _ => info.ret_xmm,
            };
            if let Some(holder) = cc.state.slot(bank, reg) {
                cc.unuse_var(self, holder, VarState::InMemory);
            }
            let vd = self.var_mut(v);
            vd.state = VarState::InRegister;
            vd.reg = Some(reg);
            vd.home_reg = Some(reg);
            vd.changed = true;
            cc.state.set_slot(bank, reg, Some(v));
            cc.state.mark_used(bank, reg);
            cc.modified[bank].set(reg);
        }

        for r in &records {
            cc.unuse_on_end_of_scope(self, id, r.var)?;
        }
        if let Some(v) = ret {
            cc.unuse_on_end_of_scope(self, id, v)?;
        }

        match &mut self.node_mut(id).kind {
            EmittableKind::Call(c) => {
                c.target = target;
                c.vars = records;
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    /// The Func marker seeds allocator state with the argument bindings.
    fn translate_func(&mut self, cc: &mut Context, func: crate::core::func::FuncId) -> CompileResult<()> {
        let arg_vars = self.funcs[func.index()].arg_vars.clone();
        for v in arg_vars {
            let vd = self.var(v);
            if vd.first_node.is_none() {
                // Argument never referenced; leave it unbound.
                continue;
            }
            if vd.is_mem_arg {
                self.var_mut(v).state = VarState::InMemory;
            } else {
                let reg = vd.home_reg.expect("register argument without home");
                let bank = vd.class.bank();
                let vd = self.var_mut(v);
                vd.state = VarState::InRegister;
                vd.reg = Some(reg);
                // No home slot holds this value yet; a spill must write it out.
                vd.changed = true;
                cc.state.set_slot(bank, reg, Some(v));
                cc.state.mark_used(bank, reg);
                cc.modified[bank].set(reg);
            }
        }
        Ok(())
    }

    fn translate_target(&mut self, cc: &mut Context, id: NodeId) -> CompileResult<()> {
        if cc.unreachable {
            cc.unreachable = false;
            let state = match &self.node(id).kind {
                EmittableKind::Target(t) => t.state.clone(),
                _ => unreachable!(),
            }
            .ok_or(CompileError::UnknownState)?;
            cc.assign_state(self, &state);
        } else {
            let state = cc.save_state(self);
            match &mut self.node_mut(id).kind {
                EmittableKind::Target(t) => t.state = Some(state),
                _ => unreachable!(),
            }
        }
        Ok(())
    }

    fn translate_hint(&mut self, cc: &mut Context, id: NodeId, h: HintNode) -> CompileResult<()> {
        match h.kind {
            VarHintKind::Alloc => {
                cc.alloc_var(self, h.var, h.value, AllocFlags::READ_WRITE)?;
            }
            VarHintKind::Spill => {
                if self.var(h.var).state == VarState::InRegister {
                    cc.spill_var(self, h.var)?;
                }
            }
            VarHintKind::Save | VarHintKind::SaveAndUnuse => {
                let vd = self.var(h.var);
                if vd.state == VarState::InRegister && vd.changed {
                    cc.save_var(self, h.var)?;
                }
                if h.kind == VarHintKind::SaveAndUnuse {
                    cc.unuse_var(self, h.var, VarState::Unused);
                    return Ok(());
                }
            }
            VarHintKind::Unuse => {
                cc.unuse_var(self, h.var, VarState::Unused);
                return Ok(());
            }
        }
        cc.unuse_on_end_of_scope(self, id, h.var)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Emit and post passes
    // ------------------------------------------------------------------

    fn emit_node(&self, enc: &mut Encoder, id: NodeId) -> CompileResult<()> {
        if let Some(comment) = self.node(id).comment {
            log::trace!("; {comment}");
        }
        match &self.node(id).kind {
            EmittableKind::Inst(i) => {
                let code = i.code();
                if code.is_special() && i.operands.len() == 3 {
                    // rdx:rax forms encode only the explicit source operand.
                    enc.emit(code, &i.operands[2..])
                } else {
                    enc.emit(code, &i.operands)
                }
            }
            EmittableKind::Jmp(j) => enc.jump(j.inst.code(), j.target),
            EmittableKind::Ret(r) => {
                let exit = self.funcs[r.func.index()].exit;
                if self.falls_through_to_epilog(id) {
                    Ok(())
                } else {
                    enc.jump(InstCode::Jmp, exit)
                }
            }
            EmittableKind::Call(c) => enc.call(c.target),
            EmittableKind::Target(t) => enc.bind_label(t.label),
            EmittableKind::Data(bytes) => enc.data(bytes),
            EmittableKind::Func(_)
            | EmittableKind::Prolog(_)
            | EmittableKind::Epilog(_)
            | EmittableKind::End(_)
            | EmittableKind::Comment
            | EmittableKind::VarHint(_) => Ok(()),
        }
    }

    /// Whether only markers separate this node from the function epilog.
    fn falls_through_to_epilog(&self, id: NodeId) -> bool {
        let mut cur = self.node(id).next;
        while let Some(n) = cur {
            match &self.node(n).kind {
                EmittableKind::Epilog(_) | EmittableKind::End(_) => return true,
                EmittableKind::Target(_) | EmittableKind::Comment | EmittableKind::VarHint(_) => {
                    cur = self.node(n).next;
                }
                _ => return false,
            }
        }
        true
    }

    fn post_node(&self, enc: &mut Encoder, id: NodeId) -> CompileResult<()> {
        if let EmittableKind::Jmp(j) = &self.node(id).kind {
            if !enc.is_bound(j.target) {
                return Err(CompileError::UnboundLabel { label: j.target.raw() });
            }
        }
        Ok(())
    }
}

/// Copyable per-node dispatch tag; keeps pass dispatch free of long-lived
/// borrows into the node arena.
#[derive(Clone, Copy)]
enum NodeTag {
    Inst,
    Jmp,
    Ret,
    Call,
    Func(crate::core::func::FuncId),
    Target,
    Hint(HintNode),
    Skip,
}

fn record_index(records: &mut Vec<VarAllocRecord>, v: VarId) -> usize {
    if let Some(i) = records.iter().position(|r| r.var == v) {
        return i;
    }
    records.push(VarAllocRecord { var: v, flags: AllocFlags::NONE, pref: None });
    records.len() - 1
}

/// Infer the convention argument type of each call operand.
fn call_arg_types(args: &[Operand]) -> Vec<ArgType> {
    args.iter()
        .map(|op| match op {
            Operand::Var(vo) => match vo.class.bank() {
                BANK_XMM => {
                    if vo.size == 4 {
                        ArgType::F32
                    } else {
                        ArgType::F64
                    }
                }
                _ => {
                    if vo.size <= 4 {
                        ArgType::Int32
                    } else {
                        ArgType::Int64
                    }
                }
            },
            _ => ArgType::Int64,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::Session;
    use crate::x64::conv::CallConv;
    use bumpalo::Bump;

    #[test]
    fn test_serialize_empty_unit() {
        let arena = Bump::new();
        let session = Session::new(&arena);
        let mut c = Compiler::new(&session);
        let buffer = c.make(0).unwrap();
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_unfinished_function_rejected() {
        let arena = Bump::new();
        let session = Session::new(&arena);
        let mut c = Compiler::new(&session);
        c.new_func(CallConv::SysV64, &[], None).unwrap();
        // end_func() never called.
        let r = c.make(0);
        assert!(matches!(r, Err(CompileError::IncompleteFunction)));
        assert!(c.error().is_some());
    }

    #[test]
    fn test_error_is_sticky_across_make() {
        let arena = Bump::new();
        let session = Session::new(&arena);
        let mut c = Compiler::new(&session);
        c.new_func(CallConv::SysV64, &[], None).unwrap();
        assert!(c.make(0).is_err());
        // The unit stays poisoned.
        assert!(c.make(0).is_err());
    }
}
