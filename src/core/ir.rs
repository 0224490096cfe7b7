// This module defines the emittable graph, the linear IR the whole backend operates on.
// Nodes live in an arena (a Vec) addressed by NodeId; prev/next links are indices, which
// keeps O(1) insertion and unlinking without aliased pointers. The node kind set is a
// closed sum type matched exhaustively by the driver: ordinary instructions, jumps,
// returns, calls, function boundary markers (Func/Prolog/Epilog/End), bound label targets,
// comments, variable hints and embedded data. The list is acyclic; each function body is
// bounded by its Func and End markers, which delimit one allocator context.

//! The emittable graph: arena-backed linear IR nodes.

use crate::core::error::{CompileError, CompileResult};
use crate::core::func::FuncId;
use crate::core::operand::{LabelId, Operand, VarId};
use crate::core::state::StateSnapshot;
use crate::core::var::{VarAllocRecord, VarHintKind, INVALID_OFFSET};
use crate::x64::inst::InstCode;
use crate::x64::regs::RegIndex;

/// Index of a node in the emittable arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// An ordinary instruction: code, operand list, and the allocation requests the
/// prepare pass extracted from the operands.
#[derive(Debug, Clone, Default)]
pub struct InstNode {
    pub code: Option<InstCode>,
    pub operands: Vec<Operand>,
    pub vars: Vec<VarAllocRecord>,
    /// Operand position of the memory operand, if any.
    pub mem_op: Option<usize>,
}

impl InstNode {
    pub fn new(code: InstCode, operands: Vec<Operand>) -> Self {
        let mem_op = operands.iter().position(|o| o.is_mem());
        InstNode { code: Some(code), operands, vars: Vec::new(), mem_op }
    }

    pub fn code(&self) -> InstCode {
        // A default-constructed placeholder never reaches the driver.
        self.code.expect("instruction without code")
    }
}

/// A jump: the underlying instruction plus branch bookkeeping.
#[derive(Debug, Clone)]
pub struct JmpNode {
    pub inst: InstNode,
    pub target: LabelId,
    /// Allocator state at the jump site, captured during translation.
    pub state: Option<Box<StateSnapshot>>,
    /// Branch predicted taken; unconditional and backward conditional jumps.
    pub taken: bool,
}

/// A function return. The value operand is pinned to the convention's return
/// register during translation.
#[derive(Debug, Clone)]
pub struct RetNode {
    pub value: Option<Operand>,
    pub vars: Vec<VarAllocRecord>,
    pub func: FuncId,
}

/// A call to out-of-unit code. Arguments are bound to the callee convention's
/// registers and stack slots; caller-saved registers are flushed around it.
#[derive(Debug, Clone)]
pub struct CallNode {
    pub target: Operand,
    pub args: Vec<Operand>,
    /// Variable receiving the return value.
    pub ret: Option<VarId>,
    pub vars: Vec<VarAllocRecord>,
    pub func: FuncId,
}

/// The bound location of a label.
#[derive(Debug, Clone)]
pub struct TargetNode {
    pub label: LabelId,
    /// Allocator state at the bind point, authoritative for jumps landing here.
    pub state: Option<Box<StateSnapshot>>,
    /// Number of jumps referencing this target.
    pub jumps: u32,
}

impl TargetNode {
    pub fn new(label: LabelId) -> Self {
        TargetNode { label, state: None, jumps: 0 }
    }
}

/// Allocator directive injected by the builder.
#[derive(Debug, Clone, Copy)]
pub struct HintNode {
    pub var: VarId,
    pub kind: VarHintKind,
    pub value: Option<RegIndex>,
}

/// Closed set of node kinds; the driver matches on this instead of virtual dispatch.
#[derive(Debug, Clone)]
pub enum EmittableKind<'a> {
    Inst(InstNode),
    Jmp(JmpNode),
    Ret(RetNode),
    Call(CallNode),
    Func(FuncId),
    Prolog(FuncId),
    Epilog(FuncId),
    End(FuncId),
    Target(TargetNode),
    Comment,
    VarHint(HintNode),
    Data(&'a [u8]),
}

/// One node of the emittable graph.
#[derive(Debug)]
pub struct Emittable<'a> {
    pub prev: Option<NodeId>,
    pub next: Option<NodeId>,
    /// Provisional position assigned by the prepare pass, used for jump-distance
    /// and liveness decisions.
    pub offset: u32,
    pub translated: bool,
    pub comment: Option<&'a str>,
    pub kind: EmittableKind<'a>,
}

impl<'a> Emittable<'a> {
    pub fn new(kind: EmittableKind<'a>) -> Self {
        Emittable {
            prev: None,
            next: None,
            offset: INVALID_OFFSET,
            translated: false,
            comment: None,
            kind,
        }
    }

    fn is_linked(&self) -> bool {
        self.prev.is_some() || self.next.is_some()
    }
}

/// The arena plus list head/tail. Insertion is always relative to a cursor owned
/// by the builder.
#[derive(Debug, Default)]
pub struct NodeList<'a> {
    nodes: Vec<Emittable<'a>>,
    first: Option<NodeId>,
    last: Option<NodeId>,
}

impl<'a> NodeList<'a> {
    pub fn new() -> Self {
        NodeList::default()
    }

    /// Allocate a node without linking it into the list.
    pub fn alloc(&mut self, kind: EmittableKind<'a>) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Emittable::new(kind));
        id
    }

    pub fn get(&self, id: NodeId) -> &Emittable<'a> {
        &self.nodes[id.index()]
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut Emittable<'a> {
        &mut self.nodes[id.index()]
    }

    pub fn first(&self) -> Option<NodeId> {
        self.first
    }

    pub fn last(&self) -> Option<NodeId> {
        self.last
    }

    /// Link `id` after `after`, or at the list head when `after` is None.
    /// Linking an already-linked node is a usage error.
    pub fn link_after(&mut self, id: NodeId, after: Option<NodeId>) -> CompileResult<()> {
        if self.get(id).is_linked() || self.first == Some(id) {
            return Err(CompileError::AlreadyLinked);
        }

        match after {
            None => {
                let old_first = self.first;
                self.get_mut(id).next = old_first;
                match old_first {
                    Some(f) => self.get_mut(f).prev = Some(id),
                    None => self.last = Some(id),
                }
                self.first = Some(id);
            }
            Some(prev) => {
                let next = self.get(prev).next;
                self.get_mut(id).prev = Some(prev);
                self.get_mut(id).next = next;
                self.get_mut(prev).next = Some(id);
                match next {
                    Some(n) => self.get_mut(n).prev = Some(id),
                    None => self.last = Some(id),
                }
            }
        }
        Ok(())
    }

    /// Walk node ids from `from` inclusive, following next links.
    pub fn iter_from(&self, from: Option<NodeId>) -> NodeIter<'_, 'a> {
        NodeIter { list: self, cur: from }
    }
}

pub struct NodeIter<'l, 'a> {
    list: &'l NodeList<'a>,
    cur: Option<NodeId>,
}

impl<'l, 'a> Iterator for NodeIter<'l, 'a> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.cur?;
        self.cur = self.list.get(id).next;
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comment_node<'a>() -> EmittableKind<'a> {
        EmittableKind::Comment
    }

    #[test]
    fn test_link_after_cursor() {
        let mut list = NodeList::new();
        let a = list.alloc(comment_node());
        let b = list.alloc(comment_node());
        let c = list.alloc(comment_node());

        list.link_after(a, None).unwrap();
        list.link_after(b, Some(a)).unwrap();
        // Insert between a and b.
        list.link_after(c, Some(a)).unwrap();

        let order: Vec<_> = list.iter_from(list.first()).collect();
        assert_eq!(order, vec![a, c, b]);
        assert_eq!(list.last(), Some(b));
        assert_eq!(list.get(b).prev, Some(c));
    }

    #[test]
    fn test_relink_is_an_error() {
        let mut list = NodeList::new();
        let a = list.alloc(comment_node());
        let b = list.alloc(comment_node());
        list.link_after(a, None).unwrap();
        list.link_after(b, Some(a)).unwrap();
        assert!(matches!(list.link_after(b, Some(a)), Err(CompileError::AlreadyLinked)));
        // A lone head node has no prev/next but is still linked.
        let mut single = NodeList::new();
        let s = single.alloc(comment_node());
        single.link_after(s, None).unwrap();
        assert!(matches!(single.link_after(s, None), Err(CompileError::AlreadyLinked)));
    }

    #[test]
    fn test_head_insertion() {
        let mut list = NodeList::new();
        let a = list.alloc(comment_node());
        let b = list.alloc(comment_node());
        list.link_after(a, None).unwrap();
        list.link_after(b, None).unwrap();
        let order: Vec<_> = list.iter_from(list.first()).collect();
        assert_eq!(order, vec![b, a]);
    }
}
