// This module defines the physical register model for the x86-64 target: bank indices for
// the three register files the allocator manages (general purpose, MMX, XMM), well-known
// register index constants, and the RegMask bitset used throughout the allocator to track
// used, modified and preserved register sets. RegMask provides constant-time set/clear/
// contains/count operations over a u32 and is the unit the calling-convention tables and
// the prologue/epilogue synthesis exchange with the register allocator.

//! Physical register banks, indices and bit masks for x86-64.

/// Index of a physical register within its bank.
pub type RegIndex = u8;

/// General-purpose register bank.
pub const BANK_GP: usize = 0;
/// MMX register bank.
pub const BANK_MM: usize = 1;
/// XMM register bank.
pub const BANK_XMM: usize = 2;

/// Number of register banks the allocator tracks.
pub const BANK_COUNT: usize = 3;

/// Registers per bank.
pub const NUM_GP: usize = 16;
pub const NUM_MM: usize = 8;
pub const NUM_XMM: usize = 16;

/// Register count for a bank index.
pub fn bank_reg_count(bank: usize) -> usize {
    match bank {
        BANK_GP => NUM_GP,
        BANK_MM => NUM_MM,
        BANK_XMM => NUM_XMM,
        _ => 0,
    }
}

// GP register indices, in hardware encoding order.
pub const RAX: RegIndex = 0;
pub const RCX: RegIndex = 1;
pub const RDX: RegIndex = 2;
pub const RBX: RegIndex = 3;
pub const RSP: RegIndex = 4;
pub const RBP: RegIndex = 5;
pub const RSI: RegIndex = 6;
pub const RDI: RegIndex = 7;
pub const R8: RegIndex = 8;
pub const R9: RegIndex = 9;
pub const R10: RegIndex = 10;
pub const R11: RegIndex = 11;
pub const R12: RegIndex = 12;
pub const R13: RegIndex = 13;
pub const R14: RegIndex = 14;
pub const R15: RegIndex = 15;

/// Bit set over one register bank.
///
/// Mirrors the per-bank masks the allocator keeps for used/modified registers and the
/// calling conventions publish for preserved registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegMask(pub u32);

impl RegMask {
    pub const EMPTY: RegMask = RegMask(0);

    /// Mask with a single register set.
    pub const fn from_index(index: RegIndex) -> Self {
        RegMask(1 << index)
    }

    /// Mask built from a list of register indices.
    pub const fn from_indices(indices: &[RegIndex]) -> Self {
        let mut bits = 0u32;
        let mut i = 0;
        while i < indices.len() {
            bits |= 1 << indices[i];
            i += 1;
        }
        RegMask(bits)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, index: RegIndex) -> bool {
        (self.0 & (1 << index)) != 0
    }

    pub fn set(&mut self, index: RegIndex) {
        self.0 |= 1 << index;
    }

    pub fn clear(&mut self, index: RegIndex) {
        self.0 &= !(1 << index);
    }

    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    pub const fn intersect(self, other: RegMask) -> RegMask {
        RegMask(self.0 & other.0)
    }

    pub const fn union(self, other: RegMask) -> RegMask {
        RegMask(self.0 | other.0)
    }

    /// Iterate set register indices in ascending order.
    pub fn iter(self) -> impl Iterator<Item = RegIndex> {
        (0..32u8).filter(move |i| self.contains(*i))
    }
}

/// Printable name of a GP register (64-bit form).
pub fn gp_name(index: RegIndex) -> &'static str {
    const NAMES: [&str; NUM_GP] = [
        "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
        "r13", "r14", "r15",
    ];
    NAMES.get(index as usize).copied().unwrap_or("gp?")
}

/// Printable name of an XMM register.
pub fn xmm_name(index: RegIndex) -> &'static str {
    const NAMES: [&str; NUM_XMM] = [
        "xmm0", "xmm1", "xmm2", "xmm3", "xmm4", "xmm5", "xmm6", "xmm7", "xmm8", "xmm9", "xmm10",
        "xmm11", "xmm12", "xmm13", "xmm14", "xmm15",
    ];
    NAMES.get(index as usize).copied().unwrap_or("xmm?")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regmask_operations() {
        let mut mask = RegMask::EMPTY;
        assert!(!mask.contains(RBX));
        mask.set(RBX);
        assert!(mask.contains(RBX));
        mask.clear(RBX);
        assert!(!mask.contains(RBX));
    }

    #[test]
    fn test_regmask_from_indices() {
        let mask = RegMask::from_indices(&[RBX, R12, R13, R14, R15]);
        assert_eq!(mask.count(), 5);
        assert!(mask.contains(RBX));
        assert!(mask.contains(R15));
        assert!(!mask.contains(RAX));
    }

    #[test]
    fn test_regmask_iter_ascending() {
        let mask = RegMask::from_indices(&[R9, RCX, RBX]);
        let collected: Vec<_> = mask.iter().collect();
        assert_eq!(collected, vec![RCX, RBX, R9]);
    }

    #[test]
    fn test_bank_reg_counts() {
        assert_eq!(bank_reg_count(BANK_GP), 16);
        assert_eq!(bank_reg_count(BANK_MM), 8);
        assert_eq!(bank_reg_count(BANK_XMM), 16);
    }
}
