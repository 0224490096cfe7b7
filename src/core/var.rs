// This module defines the bookkeeping record kept for every virtual variable in a
// compilation unit: storage class and size, the allocation state machine
// (Unused -> InRegister <-> InMemory -> Unused), the assigned physical register and home
// stack slot, read/write reference counters gathered by the prepare pass and consumed by
// the spill-victim heuristic, the priority weight, live-range bounds, and the intrusive
// links that form the allocator's active-variable ring. Links are arena indices (VarId /
// NodeId), not pointers. VarAllocRecord is the per-instruction allocation request the
// prepare pass attaches to instructions and the translate pass consumes.

//! Virtual-variable records and allocation requests.

use crate::core::ir::NodeId;
use crate::core::operand::VarId;
use crate::x64::regs::{RegIndex, BANK_GP, BANK_MM, BANK_XMM, NUM_GP, NUM_MM, NUM_XMM};

/// Storage class of a virtual variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarClass {
    /// General-purpose integer register.
    Gp,
    /// MMX register.
    Mm,
    /// XMM register.
    Xmm,
    /// x87 stack register. Declarable but not allocatable.
    X87,
}

impl VarClass {
    /// Register bank this class allocates from.
    pub fn bank(self) -> usize {
        match self {
            VarClass::Gp => BANK_GP,
            VarClass::Mm => BANK_MM,
            VarClass::Xmm | VarClass::X87 => BANK_XMM,
        }
    }

    pub fn reg_count(self) -> usize {
        match self {
            VarClass::Gp => NUM_GP,
            VarClass::Mm => NUM_MM,
            VarClass::Xmm | VarClass::X87 => NUM_XMM,
        }
    }
}

/// Allocation state of a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarState {
    Unused,
    InRegister,
    InMemory,
}

/// Access flags for one variable within one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocFlags(u8);

impl AllocFlags {
    pub const NONE: AllocFlags = AllocFlags(0);
    pub const READ: AllocFlags = AllocFlags(1);
    pub const WRITE: AllocFlags = AllocFlags(2);
    pub const READ_WRITE: AllocFlags = AllocFlags(3);
    /// The operand must be materialized in a register.
    pub const REGISTER: AllocFlags = AllocFlags(4);
    /// The instruction tolerates this operand staying in memory.
    pub const MEMORY: AllocFlags = AllocFlags(8);

    pub fn contains(self, other: AllocFlags) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn insert(&mut self, other: AllocFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: AllocFlags) {
        self.0 &= !other.0;
    }

    pub fn union(self, other: AllocFlags) -> AllocFlags {
        AllocFlags(self.0 | other.0)
    }
}

/// Variable hint kinds the builder can inject into the instruction stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarHintKind {
    /// Materialize the variable in a register (optionally a specific one).
    Alloc,
    /// Spill the variable to its home slot.
    Spill,
    /// Write the value back to memory but keep the register.
    Save,
    /// Save if changed, then release the variable.
    SaveAndUnuse,
    /// Release the variable without saving.
    Unuse,
}

/// Home stack slot handle, an index into the context's slot arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotId(pub u32);

/// Offset value meaning "not yet assigned".
pub const INVALID_OFFSET: u32 = u32::MAX;

/// Default spill priority for fresh variables; higher weights spill sooner.
pub const DEFAULT_PRIORITY: u8 = 10;

/// Bookkeeping record for one virtual variable.
#[derive(Debug)]
pub struct VarData<'a> {
    pub name: &'a str,
    pub id: VarId,
    pub class: VarClass,
    pub size: u8,

    pub state: VarState,
    /// Currently assigned physical register.
    pub reg: Option<RegIndex>,
    /// Last register this variable lived in; preferred on re-allocation.
    pub home_reg: Option<RegIndex>,
    /// Builder-requested register preference.
    pub pref_reg: Option<RegIndex>,
    /// Home stack slot, assigned lazily on first spill or memory use.
    pub home_slot: Option<SlotId>,

    pub priority: u8,
    /// Register content differs from the home slot.
    pub changed: bool,
    /// Flush to memory before the variable is released at end of scope.
    pub save_on_unuse: bool,

    pub reg_read: u32,
    pub reg_write: u32,
    pub reg_rw: u32,
    pub mem_read: u32,
    pub mem_write: u32,
    pub mem_rw: u32,

    /// Live-range bounds discovered by the prepare pass.
    pub first_node: Option<NodeId>,
    pub last_node: Option<NodeId>,
    /// Offset of the instruction currently using this variable; such variables
    /// are never spill candidates.
    pub work_offset: u32,

    /// Active-ring links.
    pub prev_active: Option<VarId>,
    pub next_active: Option<VarId>,
    /// Scratch slot for state reconciliation.
    pub temp_state: Option<VarState>,

    /// Bound to an incoming argument.
    pub is_arg: bool,
    /// Argument lives in the caller's frame, not a local slot.
    pub is_mem_arg: bool,
    /// Displacement of a memory argument relative to the arguments base.
    pub arg_offset: i32,
}

impl<'a> VarData<'a> {
    pub fn new(name: &'a str, id: VarId, class: VarClass, size: u8) -> Self {
        VarData {
            name,
            id,
            class,
            size,
            state: VarState::Unused,
            reg: None,
            home_reg: None,
            pref_reg: None,
            home_slot: None,
            priority: DEFAULT_PRIORITY,
            changed: false,
            save_on_unuse: false,
            reg_read: 0,
            reg_write: 0,
            reg_rw: 0,
            mem_read: 0,
            mem_write: 0,
            mem_rw: 0,
            first_node: None,
            last_node: None,
            work_offset: INVALID_OFFSET,
            prev_active: None,
            next_active: None,
            temp_state: None,
            is_arg: false,
            is_mem_arg: false,
            arg_offset: 0,
        }
    }
}

/// Allocation request for one variable within one instruction.
#[derive(Debug, Clone, Copy)]
pub struct VarAllocRecord {
    pub var: VarId,
    pub flags: AllocFlags,
    /// Register pinned by the instruction form (e.g. shift counts in rcx).
    pub pref: Option<RegIndex>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_flags() {
        let mut flags = AllocFlags::READ;
        assert!(flags.contains(AllocFlags::READ));
        assert!(!flags.contains(AllocFlags::WRITE));
        flags.insert(AllocFlags::WRITE);
        assert!(flags.contains(AllocFlags::READ_WRITE));
        flags.remove(AllocFlags::READ);
        assert!(!flags.contains(AllocFlags::READ));
    }

    #[test]
    fn test_var_class_banks() {
        assert_eq!(VarClass::Gp.bank(), BANK_GP);
        assert_eq!(VarClass::Mm.bank(), BANK_MM);
        assert_eq!(VarClass::Xmm.bank(), BANK_XMM);
        assert_eq!(VarClass::Gp.reg_count(), 16);
        assert_eq!(VarClass::Mm.reg_count(), 8);
    }

    #[test]
    fn test_fresh_var_defaults() {
        let v = VarData::new("v0", VarId::from_index(0), VarClass::Gp, 8);
        assert_eq!(v.state, VarState::Unused);
        assert_eq!(v.reg, None);
        assert_eq!(v.work_offset, INVALID_OFFSET);
        assert_eq!(v.priority, DEFAULT_PRIORITY);
        assert!(!v.changed);
    }
}
