// This module provides arena-based session management using the bumpalo crate. A Session
// owns the arena for one or more compilation units and interns the strings whose lifetime
// must outlive builder calls: variable names and stream comments. It also aggregates
// SessionStats, the counters the driver and allocator bump while lowering (functions
// compiled, instructions translated, spill and reload traffic, resolved forward jumps,
// emitted code bytes). Stats live behind a RefCell so read-mostly borrows of the session
// can record events without threading mutability through every call site.

//! Arena-backed compilation session and statistics.

use bumpalo::Bump;
use std::cell::RefCell;
use std::fmt;

/// Counters accumulated across one session.
#[derive(Debug, Default, Clone, Copy)]
pub struct SessionStats {
    pub functions_compiled: usize,
    pub instructions_translated: usize,
    pub spills: usize,
    pub reloads: usize,
    pub forward_jumps_resolved: usize,
    pub code_bytes: usize,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} function(s), {} instruction(s), {} spill(s), {} reload(s), {} byte(s)",
            self.functions_compiled,
            self.instructions_translated,
            self.spills,
            self.reloads,
            self.code_bytes
        )
    }
}

/// Owns the arena and statistics for a compilation session.
pub struct Session<'arena> {
    arena: &'arena Bump,
    stats: RefCell<SessionStats>,
}

impl<'arena> Session<'arena> {
    pub fn new(arena: &'arena Bump) -> Self {
        Session { arena, stats: RefCell::new(SessionStats::default()) }
    }

    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    /// Copy a string into the arena.
    pub fn intern_str(&self, s: &str) -> &'arena str {
        self.arena.alloc_str(s)
    }

    /// Copy a byte slice into the arena.
    pub fn intern_bytes(&self, bytes: &[u8]) -> &'arena [u8] {
        self.arena.alloc_slice_copy(bytes)
    }

    pub fn stats(&self) -> SessionStats {
        *self.stats.borrow()
    }

    pub fn record<F: FnOnce(&mut SessionStats)>(&self, f: F) {
        f(&mut self.stats.borrow_mut());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_str() {
        let arena = Bump::new();
        let session = Session::new(&arena);
        let s = session.intern_str("counter");
        assert_eq!(s, "counter");
    }

    #[test]
    fn test_stats_recording() {
        let arena = Bump::new();
        let session = Session::new(&arena);
        session.record(|s| s.spills += 2);
        session.record(|s| {
            s.spills += 1;
            s.functions_compiled += 1;
        });
        let stats = session.stats();
        assert_eq!(stats.spills, 3);
        assert_eq!(stats.functions_compiled, 1);
    }
}
