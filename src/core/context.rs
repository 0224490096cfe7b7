// This module is the register allocator: the per-function working state the translate
// pass threads through every node. It tracks which variable occupies which physical
// register per bank, the active-variable ring, the pending forward-jump list, home-slot
// accounting for spilled variables, and the modified-register masks the frame synthesis
// consumes. Allocation follows a fixed preference order (pinned register, then the
// variable's home register, then a free-register scan that avoids rsp/rbp and leans
// toward caller-saved registers in leaf functions, then rax, then a spill victim chosen
// by priority weight and use-distance score). Spills write dirty values to lazily
// assigned home slots; reloads read them back. State snapshots captured here are what
// forward jumps defer against and what backward jumps reconcile with, emitting the
// moves, saves and loads that make both paths agree on every variable's location.

//! The per-function register allocator context.

use crate::core::builder::Compiler;
use crate::core::error::{CompileError, CompileResult};
use crate::core::func::{FrameBase, FuncId};
use crate::core::ir::{EmittableKind, NodeId};
use crate::core::operand::{Mem, MemBase, Operand, Reg, VarId};
use crate::core::state::{ForwardJump, RegState, StateSnapshot};
use crate::core::var::{AllocFlags, SlotId, VarClass, VarState};
use crate::x64::inst::InstCode;
use crate::x64::regs::{
    bank_reg_count, RegIndex, RegMask, BANK_COUNT, BANK_GP, RAX, RBP, RSP,
};

/// One home slot in the function frame.
#[derive(Debug, Clone, Copy)]
pub struct MemSlot {
    pub size: u8,
    pub offset: i32,
}

/// Allocator working state for one function body.
pub struct Context {
    pub func: FuncId,
    pub start: NodeId,
    pub stop: NodeId,
    /// Cursor for late-emitted code placed after the epilog.
    pub extra: NodeId,

    pub state: RegState,
    /// Head of the active-variable ring.
    pub active: Option<VarId>,
    pub forward_jumps: Vec<ForwardJump>,

    pub current_offset: u32,
    pub unreachable: bool,
    /// Registers written at any point; drives callee-save decisions.
    pub modified: [RegMask; BANK_COUNT],

    slots: Vec<MemSlot>,
    free_slots: Vec<SlotId>,
    counts: [u32; 3], // 16-, 8- and 4-byte slot counts
    pub mem_bytes_total: u32,

    pub args_base: FrameBase,
    pub vars_base: FrameBase,

    /// Prefer caller-saved registers when the function makes no calls.
    nonpreserved_first: bool,
    preserved: [RegMask; BANK_COUNT],
}

impl Context {
    pub fn new(
        func: FuncId,
        start: NodeId,
        stop: NodeId,
        extra: NodeId,
        preserved: [RegMask; BANK_COUNT],
        is_caller: bool,
    ) -> Self {
        Context {
            func,
            start,
            stop,
            extra,
            state: RegState::new(),
            active: None,
            forward_jumps: Vec::new(),
            current_offset: 0,
            unreachable: false,
            modified: [RegMask::EMPTY; BANK_COUNT],
            slots: Vec::new(),
            free_slots: Vec::new(),
            counts: [0; 3],
            mem_bytes_total: 0,
            args_base: FrameBase { reg: RBP, offset: 16 },
            vars_base: FrameBase { reg: RSP, offset: 0 },
            nonpreserved_first: !is_caller,
            preserved,
        }
    }

    // ------------------------------------------------------------------
    // Active ring
    // ------------------------------------------------------------------

    pub fn is_active(&self, c: &Compiler, v: VarId) -> bool {
        c.var(v).next_active.is_some()
    }

    pub fn add_active(&mut self, c: &mut Compiler, v: VarId) {
        debug_assert!(!self.is_active(c, v));
        match self.active {
            None => {
                let vd = c.var_mut(v);
                vd.next_active = Some(v);
                vd.prev_active = Some(v);
                self.active = Some(v);
            }
            Some(head) => {
                let tail = c.var(head).prev_active.expect("ring without tail");
                c.var_mut(tail).next_active = Some(v);
                c.var_mut(head).prev_active = Some(v);
                let vd = c.var_mut(v);
                vd.next_active = Some(head);
                vd.prev_active = Some(tail);
            }
        }
    }

    /// Visit every active variable once.
    pub fn active_vars(&self, c: &Compiler) -> Vec<VarId> {
        let mut out = Vec::new();
        let Some(head) = self.active else { return out };
        let mut cur = head;
        loop {
            out.push(cur);
            cur = c.var(cur).next_active.expect("broken active ring");
            if cur == head {
                break;
            }
        }
        out
    }

    // ------------------------------------------------------------------
    // Home slots
    // ------------------------------------------------------------------

    /// Ensure the variable has a home slot. Memory arguments live in the
    /// caller's frame and never get one.
    pub fn mark_memory_used(&mut self, c: &mut Compiler, v: VarId) {
        let vd = c.var(v);
        if vd.is_mem_arg || vd.home_slot.is_some() {
            return;
        }
        let slot = self.alloc_slot(vd.size);
        c.var_mut(v).home_slot = Some(slot);
    }

    fn alloc_slot(&mut self, size: u8) -> SlotId {
        if let Some(pos) = self.free_slots.iter().position(|s| self.slots[s.0 as usize].size == size)
        {
            return self.free_slots.swap_remove(pos);
        }

        let id = SlotId(self.slots.len() as u32);
        self.slots.push(MemSlot { size, offset: 0 });
        match size {
            16 => self.counts[0] += 1,
            8 => self.counts[1] += 1,
            4 => self.counts[2] += 1,
            _ => {}
        }
        id
    }

    pub fn slot(&self, id: SlotId) -> MemSlot {
        self.slots[id.0 as usize]
    }

    /// Assign final offsets to every home slot. Wide slots first keeps their
    /// 16-byte alignment without per-slot padding.
    pub fn alloc_memory_operands(&mut self) {
        let start16 = 0u32;
        let start8 = start16 + self.counts[0] * 16;
        let start4 = start8 + self.counts[1] * 8;
        let start_other = (start4 + self.counts[2] * 4 + 15) & !15;

        let mut next16 = start16;
        let mut next8 = start8;
        let mut next4 = start4;
        let mut next_other = start_other;

        for slot in &mut self.slots {
            let size = slot.size as u32;
            let offset = match size {
                16 => {
                    let o = next16;
                    next16 += 16;
                    o
                }
                8 => {
                    let o = next8;
                    next8 += 8;
                    o
                }
                4 => {
                    let o = next4;
                    next4 += 4;
                    o
                }
                _ => {
                    let aligned = if size >= 16 { (size + 15) & !15 } else { size };
                    next_other = if size >= 16 { (next_other + 15) & !15 } else { next_other };
                    let o = next_other;
                    next_other += aligned;
                    o
                }
            };
            slot.offset = offset as i32;
            self.mem_bytes_total += if size >= 16 { (size + 15) & !15 } else { size };
        }
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    fn class_checked(&self, c: &Compiler, v: VarId) -> CompileResult<VarClass> {
        let class = c.var(v).class;
        if class == VarClass::X87 {
            return Err(CompileError::UnsupportedVarClass { class: "x87" });
        }
        Ok(class)
    }

    /// Materialize a variable into a physical register.
    pub fn alloc_var(
        &mut self,
        c: &mut Compiler,
        v: VarId,
        pref: Option<RegIndex>,
        flags: AllocFlags,
    ) -> CompileResult<()> {
        let class = self.class_checked(c, v)?;
        let bank = class.bank();
        let pref = pref.or(c.var(v).pref_reg);
        let home = c.var(v).home_reg;

        // Already in a register: done, unless a specific other register is required.
        if c.var(v).state == VarState::InRegister {
            let old = c.var(v).reg.expect("in-register variable without register");
            let new = match pref {
                None => return Ok(()),
                Some(p) if p == old => return Ok(()),
                Some(p) => p,
            };

            let other = self.state.slot(bank, new);
            if bank == BANK_GP {
                // GP variables swap via xchg; both values survive.
                self.emit_exchange(c, v, new, flags, other)?;
                if let Some(o) = other {
                    c.var_mut(o).reg = Some(old);
                    c.var_mut(o).home_reg = Some(old);
                }
                self.state.set_slot(bank, old, other);
                if other.is_none() {
                    self.state.mark_free(bank, old);
                }
            } else {
                // Vector variables evict the occupant and move over.
                if let Some(o) = other {
                    self.spill_var(c, o)?;
                }
                self.emit_move_to(c, v, new, flags)?;
                self.state.set_slot(bank, old, None);
                self.state.mark_free(bank, old);
            }

            let vd = c.var_mut(v);
            vd.reg = Some(new);
            vd.home_reg = Some(new);
            self.state.set_slot(bank, new, Some(v));
            self.state.mark_used(bank, new);
            self.modified[bank].set(new);
            if flags.contains(AllocFlags::WRITE) {
                c.var_mut(v).changed = true;
            }
            return Ok(());
        }

        let mut idx: Option<RegIndex> = None;
        let mut candidate: Option<VarId> = None;

        // Pinned register first; if occupied, its holder is the spill victim.
        if let Some(p) = pref {
            if !self.state.is_used(bank, p) {
                idx = Some(p);
            } else {
                candidate = self.state.slot(bank, p);
            }
        }

        if idx.is_none() && candidate.is_none() {
            if let Some(h) = home {
                if !self.state.is_used(bank, h) {
                    idx = Some(h);
                }
            }
            if idx.is_none() {
                idx = self.scan_free(bank);
            }
            // rax is kept for last; many special forms want it explicitly.
            if idx.is_none() && bank == BANK_GP && !self.state.is_used(bank, RAX) {
                idx = Some(RAX);
            }
        }

        if idx.is_none() {
            let victim = match candidate.or_else(|| self.spill_candidate(c, bank)) {
                Some(victim) => victim,
                None => return Err(CompileError::NotEnoughRegisters),
            };
            if c.var(victim).work_offset == self.current_offset {
                return Err(CompileError::RegistersOverlap);
            }
            idx = c.var(victim).reg;
            self.spill_var(c, victim)?;
        }

        let idx = idx.expect("allocation fell through without a register");

        if c.var(v).state == VarState::InMemory && flags.contains(AllocFlags::READ) {
            self.emit_load(c, v, idx)?;
        }

        let vd = c.var_mut(v);
        vd.state = VarState::InRegister;
        vd.reg = Some(idx);
        vd.home_reg = Some(idx);
        self.state.set_slot(bank, idx, Some(v));
        self.state.mark_used(bank, idx);
        self.modified[bank].set(idx);

        if flags.contains(AllocFlags::WRITE) {
            c.var_mut(v).changed = true;
        }
        Ok(())
    }

    /// Free-register scan, preferring registers that avoid prologue saves.
    fn scan_free(&self, bank: usize) -> Option<RegIndex> {
        let preserved = self.preserved[bank];
        let start = if bank == BANK_GP { 1 } else { 0 };
        let count = bank_reg_count(bank) as u8;

        let mut picked = None;
        for i in start as u8..count {
            if bank == BANK_GP && (i == RSP || i == RBP) {
                continue;
            }
            if self.state.is_used(bank, i) {
                continue;
            }
            let is_preserved = preserved.contains(i);
            if self.nonpreserved_first {
                if picked.is_some() && is_preserved {
                    continue;
                }
                picked = Some(i);
                if !is_preserved {
                    break;
                }
            } else {
                if picked.is_some() && !is_preserved {
                    continue;
                }
                picked = Some(i);
                if is_preserved {
                    break;
                }
            }
        }
        picked
    }

    /// Pick the variable to evict: highest priority weight wins, ties broken by
    /// spill score. Variables used by the current instruction are never chosen.
    fn spill_candidate(&self, c: &Compiler, bank: usize) -> Option<VarId> {
        let mut best: Option<VarId> = None;
        let mut best_priority = 0u8;
        let mut best_score = 0i64;

        for i in 0..bank_reg_count(bank) as u8 {
            let Some(v) = self.state.slot(bank, i) else { continue };
            let vd = c.var(v);
            if vd.work_offset == self.current_offset {
                continue;
            }

            let priority = vd.priority;
            let score = self.spill_score(c, v);
            if best.is_none()
                || priority > best_priority
                || (priority == best_priority && score > best_score)
            {
                best = Some(v);
                best_priority = priority;
                best_score = score;
            }
        }
        best
    }

    /// Larger score means better spill victim: far-off last use and read-heavy
    /// access patterns raise it, register writes lower it.
    fn spill_score(&self, c: &Compiler, v: VarId) -> i64 {
        let vd = c.var(v);
        let mut score = 0i64;

        if let Some(last) = vd.last_node {
            let last_offset = c.node(last).offset;
            if last_offset != crate::core::var::INVALID_OFFSET && last_offset >= self.current_offset
            {
                score += (last_offset - self.current_offset) as i64;
            }
        }

        score -= (vd.reg_write + vd.reg_rw) as i64;
        score += vd.reg_read as i64;
        score += (vd.mem_write + vd.mem_rw + vd.mem_read) as i64;
        score
    }

    /// Move a register-resident variable to its home slot.
    pub fn spill_var(&mut self, c: &mut Compiler, v: VarId) -> CompileResult<()> {
        let vd = c.var(v);
        debug_assert_eq!(vd.state, VarState::InRegister);
        let bank = vd.class.bank();
        let idx = vd.reg.expect("spill of variable without register");

        if c.var(v).changed {
            self.emit_save(c, v, idx)?;
        }

        let vd = c.var_mut(v);
        vd.reg = None;
        vd.state = VarState::InMemory;
        vd.changed = false;

        self.state.set_slot(bank, idx, None);
        self.state.mark_free(bank, idx);

        log::debug!("spill {} from {}", c.var(v).name, bank_reg_name(bank, idx));
        c.session().record(|s| s.spills += 1);
        Ok(())
    }

    /// Write the value back to memory, keeping the register.
    pub fn save_var(&mut self, c: &mut Compiler, v: VarId) -> CompileResult<()> {
        let vd = c.var(v);
        debug_assert_eq!(vd.state, VarState::InRegister);
        let idx = vd.reg.expect("save of variable without register");
        self.emit_save(c, v, idx)?;
        c.var_mut(v).changed = false;
        Ok(())
    }

    /// Release a variable without reconciling memory.
    pub fn unuse_var(&mut self, c: &mut Compiler, v: VarId, to: VarState) {
        debug_assert_ne!(to, VarState::InRegister);
        let vd = c.var(v);
        if vd.state == VarState::InRegister {
            let bank = vd.class.bank();
            if let Some(idx) = vd.reg {
                self.state.set_slot(bank, idx, None);
                self.state.mark_free(bank, idx);
            }
        }
        let vd = c.var_mut(v);
        vd.state = to;
        vd.changed = false;
        vd.reg = None;
    }

    /// Release the variable if `node` ends its live range.
    pub fn unuse_on_end_of_scope(
        &mut self,
        c: &mut Compiler,
        node: NodeId,
        v: VarId,
    ) -> CompileResult<()> {
        if c.var(v).last_node != Some(node) {
            return Ok(());
        }
        let vd = c.var(v);
        if vd.save_on_unuse && vd.state == VarState::InRegister && vd.changed {
            self.save_var(c, v)?;
        }
        self.unuse_var(c, v, VarState::Unused);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Spill/fill instruction emission
    // ------------------------------------------------------------------

    /// Home-slot memory operand for a variable.
    pub fn var_mem(&mut self, c: &mut Compiler, v: VarId) -> Mem {
        self.mark_memory_used(c, v);
        let vd = c.var(v);
        Mem::var_home(v, vd.size)
    }

    fn move_code(class: VarClass, size: u8) -> InstCode {
        match class {
            VarClass::Gp => InstCode::Mov,
            VarClass::Mm => InstCode::Movq,
            VarClass::Xmm | VarClass::X87 => match size {
                4 => InstCode::Movss,
                8 => InstCode::Movsd,
                _ => InstCode::Movdqa,
            },
        }
    }

    fn phys_reg(class: VarClass, idx: RegIndex, size: u8) -> Reg {
        match class {
            VarClass::Gp => {
                if size <= 4 {
                    Reg::gpd(idx)
                } else {
                    Reg::gpq(idx)
                }
            }
            VarClass::Mm => Reg::mm(idx),
            VarClass::Xmm | VarClass::X87 => Reg { bank: crate::x64::regs::BANK_XMM, index: idx, size },
        }
    }

    fn emit_load(&mut self, c: &mut Compiler, v: VarId, idx: RegIndex) -> CompileResult<()> {
        let mem = self.var_mem(c, v);
        let vd = c.var(v);
        let code = Self::move_code(vd.class, vd.size);
        let dst = Self::phys_reg(vd.class, idx, vd.size);
        let comment = c.alloc_comment("load", vd.name);
        c.inject_inst(code, vec![Operand::Reg(dst), Operand::Mem(mem)], comment)?;
        c.session().record(|s| s.reloads += 1);
        Ok(())
    }

    fn emit_save(&mut self, c: &mut Compiler, v: VarId, idx: RegIndex) -> CompileResult<()> {
        let mem = self.var_mem(c, v);
        let vd = c.var(v);
        let code = Self::move_code(vd.class, vd.size);
        let src = Self::phys_reg(vd.class, idx, vd.size);
        let comment = c.alloc_comment("save", vd.name);
        c.inject_inst(code, vec![Operand::Mem(mem), Operand::Reg(src)], comment)?;
        Ok(())
    }

    /// Move a register-resident variable's value into `dst`.
    fn emit_move_to(
        &mut self,
        c: &mut Compiler,
        v: VarId,
        dst: RegIndex,
        flags: AllocFlags,
    ) -> CompileResult<()> {
        if !flags.contains(AllocFlags::READ) {
            return Ok(());
        }
        let vd = c.var(v);
        let src = vd.reg.expect("move of variable without register");
        let code = Self::move_code(vd.class, vd.size);
        let d = Self::phys_reg(vd.class, dst, vd.size);
        let s = Self::phys_reg(vd.class, src, vd.size);
        let comment = c.alloc_comment("move", vd.name);
        c.inject_inst(code, vec![Operand::Reg(d), Operand::Reg(s)], comment)?;
        Ok(())
    }

    /// Swap a GP variable into `dst`, exchanging with whatever holds it.
    fn emit_exchange(
        &mut self,
        c: &mut Compiler,
        v: VarId,
        dst: RegIndex,
        flags: AllocFlags,
        other: Option<VarId>,
    ) -> CompileResult<()> {
        let old = c.var(v).reg.expect("exchange of variable without register");
        match other {
            None => self.emit_move_to(c, v, dst, flags),
            Some(o) => {
                if !flags.contains(AllocFlags::READ) {
                    // Write-only request: the occupant moves out instead.
                    self.emit_move_to(c, o, old, AllocFlags::READ)
                } else {
                    let comment = c.alloc_comment("exchange", c.var(v).name);
                    c.inject_inst(
                        InstCode::Xchg,
                        vec![Operand::Reg(Reg::gpq(dst)), Operand::Reg(Reg::gpq(old))],
                        comment,
                    )?;
                    Ok(())
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Operand rewriting and memory patching
    // ------------------------------------------------------------------

    /// Rewrite variable operands to their physical locations.
    pub fn translate_operands(
        &mut self,
        c: &mut Compiler,
        operands: &mut [Operand],
    ) -> CompileResult<()> {
        for op in operands.iter_mut() {
            match *op {
                Operand::Var(vo) => {
                    let vd = c.var(vo.id);
                    match vd.reg {
                        Some(idx) => {
                            *op = Operand::Reg(Self::phys_reg(vd.class, idx, vo.size));
                        }
                        None => {
                            // Left in memory by the allocator; address its home slot.
                            let mem = self.var_mem(c, vo.id);
                            *op = Operand::Mem(mem);
                        }
                    }
                }
                Operand::Mem(ref mut mem) => {
                    if let MemBase::Var(v) = mem.base {
                        let idx = c.var(v).reg.ok_or(CompileError::RegistersOverlap)?;
                        mem.base = MemBase::Reg(idx);
                    }
                    if let MemBase::Var(v) = mem.index {
                        let idx = c.var(v).reg.ok_or(CompileError::RegistersOverlap)?;
                        mem.index = MemBase::Reg(idx);
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Point one home-slot memory operand at its final frame address.
    fn patch_mem(&self, c: &Compiler, mem: &mut Mem) -> CompileResult<()> {
        let Some(v) = mem.home else { return Ok(()) };
        let vd = c.var(v);
        if vd.is_mem_arg {
            mem.base = MemBase::Reg(self.args_base.reg);
            mem.disp += vd.arg_offset + self.args_base.offset;
        } else {
            let slot = vd.home_slot.ok_or(CompileError::UnknownState)?;
            mem.base = MemBase::Reg(self.vars_base.reg);
            mem.disp += self.slot(slot).offset + self.vars_base.offset;
        }
        Ok(())
    }

    /// Point every home-slot memory operand at its final frame address.
    pub fn patch_memory_operands(&self, c: &mut Compiler) -> CompileResult<()> {
        let mut cur = Some(self.start);
        while let Some(id) = cur {
            let next = c.node(id).next;

            // Only instruction-carrying nodes hold memory operands.
            let operands = match &mut c.node_mut(id).kind {
                EmittableKind::Inst(i) => Some(std::mem::take(&mut i.operands)),
                EmittableKind::Jmp(j) => Some(std::mem::take(&mut j.inst.operands)),
                _ => None,
            };

            if let Some(mut ops) = operands {
                for op in ops.iter_mut() {
                    if let Operand::Mem(mem) = op {
                        self.patch_mem(c, mem)?;
                    }
                }
                match &mut c.node_mut(id).kind {
                    EmittableKind::Inst(i) => i.operands = ops,
                    EmittableKind::Jmp(j) => j.inst.operands = ops,
                    _ => {}
                }
            }

            if id == self.stop {
                break;
            }
            cur = next;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // State snapshots
    // ------------------------------------------------------------------

    pub fn save_state(&self, c: &Compiler) -> Box<StateSnapshot> {
        let mut changed = [RegMask::EMPTY; BANK_COUNT];
        for (bank, i) in RegState::all_regs() {
            if let Some(v) = self.state.slot(bank, i) {
                if c.var(v).changed {
                    changed[bank].set(i);
                }
            }
        }

        let mem_vars = self
            .active_vars(c)
            .into_iter()
            .filter(|v| c.var(*v).state == VarState::InMemory)
            .collect();

        Box::new(StateSnapshot::new(self.state.clone(), changed, mem_vars))
    }

    /// Overwrite allocator state wholesale; used when replaying forward jumps.
    pub fn assign_state(&mut self, c: &mut Compiler, snap: &StateSnapshot) {
        self.state = snap.regs.clone();

        for v in self.active_vars(c) {
            let vd = c.var_mut(v);
            vd.state = VarState::Unused;
            vd.reg = None;
            vd.changed = false;
        }
        for v in &snap.mem_vars {
            c.var_mut(*v).state = VarState::InMemory;
        }
        for (bank, i) in RegState::all_regs() {
            if let Some(v) = snap.regs.slot(bank, i) {
                let vd = c.var_mut(v);
                vd.state = VarState::InRegister;
                vd.reg = Some(i);
                vd.changed = snap.changed[bank].contains(i);
            }
        }
    }

    /// Emit the moves, saves and loads that turn the current state into `snap`.
    pub fn restore_state(&mut self, c: &mut Compiler, snap: &StateSnapshot) -> CompileResult<()> {
        // Mark target state per variable.
        for v in self.active_vars(c) {
            c.var_mut(v).temp_state = Some(VarState::Unused);
        }
        for v in &snap.mem_vars {
            c.var_mut(*v).temp_state = Some(VarState::InMemory);
        }
        for (bank, i) in RegState::all_regs() {
            if let Some(v) = snap.regs.slot(bank, i) {
                c.var_mut(v).temp_state = Some(VarState::InRegister);
            }
        }

        // Spill or release registers that disagree with the target.
        for (bank, i) in RegState::all_regs() {
            let from = self.state.slot(bank, i);
            let to = snap.regs.slot(bank, i);
            if from != to {
                if let Some(fv) = from {
                    if c.var(fv).temp_state == Some(VarState::Unused) {
                        self.unuse_var(c, fv, VarState::Unused);
                    } else {
                        self.spill_var(c, fv)?;
                    }
                }
            } else if let Some(fv) = from {
                // Same binding; a dirty value must be flushed if the target
                // expects clean memory.
                if c.var(fv).changed && !snap.changed[bank].contains(i) {
                    self.save_var(c, fv)?;
                }
            }
        }

        // Materialize the target bindings.
        for (bank, i) in RegState::all_regs() {
            let from = self.state.slot(bank, i);
            let to = snap.regs.slot(bank, i);
            if from != to {
                if let Some(tv) = to {
                    self.alloc_var(c, tv, Some(i), AllocFlags::READ)?;
                }
            }
        }

        self.state.used = snap.regs.used;

        // Settle every active variable on its target state.
        for v in self.active_vars(c) {
            let target = c.var(v).temp_state;
            if target != Some(VarState::InRegister) {
                let vd = c.var_mut(v);
                vd.state = target.unwrap_or(VarState::Unused);
                vd.changed = false;
                vd.reg = None;
            }
            c.var_mut(v).temp_state = None;
        }
        Ok(())
    }

    /// Defer a jump whose target is not yet bound.
    ///
    /// Multiple forward jumps converging on one label each reconcile against the
    /// state recorded at its bind point; the last replay wins where they differ.
    pub fn add_forward_jump(&mut self, node: NodeId, state: Box<StateSnapshot>) {
        self.forward_jumps.push(ForwardJump { node, state });
    }
}

fn bank_reg_name(bank: usize, idx: RegIndex) -> &'static str {
    match bank {
        BANK_GP => crate::x64::regs::gp_name(idx),
        crate::x64::regs::BANK_XMM => crate::x64::regs::xmm_name(idx),
        _ => "mm",
    }
}
