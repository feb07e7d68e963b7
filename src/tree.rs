//! The token tree: one node per document or prediction token, stored in a
//! generational arena. Children own their subtrees through the arena, so a
//! rebuild can splice a surviving suffix in O(1) id moves.

use crate::engine::{Snapshot, Token};

#[cfg(test)]
mod tests;

/// Arena handle. A freed slot bumps its generation, so ids held past a free
/// stop resolving instead of silently pointing at a reused slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
pub struct Node {
    pub tok: Token,
    /// Byte piece this token renders as; valid UTF-8 only as part of a path.
    pub bytes: Vec<u8>,
    /// Document length this node contributes. A piece that is not valid
    /// UTF-8 on its own counts 1 when it begins a codepoint and 0 when it is
    /// a bare continuation byte.
    pub str_size: usize,
    pub base_pos: usize,
    pub depth: usize,
    pub is_accepted: bool,
    pub has_logit: bool,
    pub logit: f32,
    pub max_logit: f32,
    /// Engine state captured *before* this token was consumed.
    pub snapshot: Option<Snapshot>,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub sel: usize,
}

impl Node {
    pub fn fresh(tok: Token, bytes: Vec<u8>, base_pos: usize, depth: usize) -> Self {
        let str_size = str_size_of(&bytes);
        Node {
            tok,
            bytes,
            str_size,
            base_pos,
            depth,
            is_accepted: true,
            has_logit: false,
            logit: 0.0,
            max_logit: 0.0,
            snapshot: None,
            parent: None,
            children: Vec::new(),
            sel: 0,
        }
    }

    pub fn end_pos(&self) -> usize {
        self.base_pos + self.str_size
    }

    pub fn selected_child(&self) -> Option<NodeId> {
        self.children.get(self.sel).copied()
    }

    /// Whether the piece starts mid-codepoint.
    pub fn starts_with_continuation(&self) -> bool {
        self.bytes.first().is_some_and(|b| b & 0xC0 == 0x80)
    }
}

/// Document length contributed by one token piece.
pub fn str_size_of(bytes: &[u8]) -> usize {
    if std::str::from_utf8(bytes).is_ok() {
        bytes.len()
    } else if bytes.first().is_some_and(|b| b & 0xC0 != 0x80) {
        1
    } else {
        0
    }
}

struct Slot {
    generation: u32,
    node: Option<Node>,
}

pub struct TokenTree {
    slots: Vec<Slot>,
    free: Vec<u32>,
    root: NodeId,
}

impl TokenTree {
    /// Build a tree holding only the root sentinel: BOS at depth 0, empty
    /// piece, accepted, carrying the engine's initial state.
    pub fn new(bos: Token, initial: Snapshot) -> Self {
        let mut root = Node::fresh(bos, Vec::new(), 0, 0);
        root.snapshot = Some(initial);
        let mut tree = TokenTree {
            slots: Vec::new(),
            free: Vec::new(),
            root: NodeId {
                index: 0,
                generation: 0,
            },
        };
        tree.root = tree.alloc(root);
        tree
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.slots
            .get(id.index as usize)
            .is_some_and(|s| s.generation == id.generation && s.node.is_some())
    }

    pub fn get(&self, id: NodeId) -> &Node {
        let slot = &self.slots[id.index as usize];
        assert_eq!(slot.generation, id.generation, "stale node id");
        slot.node.as_ref().expect("freed node id")
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut Node {
        let slot = &mut self.slots[id.index as usize];
        assert_eq!(slot.generation, id.generation, "stale node id");
        slot.node.as_mut().expect("freed node id")
    }

    pub fn alloc(&mut self, node: Node) -> NodeId {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.node = Some(node);
                NodeId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                NodeId {
                    index,
                    generation: 0,
                }
            }
        }
    }

    fn take(&mut self, id: NodeId) -> Option<Node> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let node = slot.node.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Some(node)
    }

    /// Free `id` and everything below it. The node must already be detached.
    pub fn free_subtree(&mut self, id: NodeId) {
        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            if let Some(node) = self.take(id) {
                stack.extend(node.children);
            }
        }
    }

    /// Append `child`, selecting it if it is the first.
    pub fn push_child(&mut self, parent: NodeId, child: NodeId) {
        self.get_mut(child).parent = Some(parent);
        let p = self.get_mut(parent);
        if p.children.is_empty() {
            p.sel = 0;
        }
        p.children.push(child);
    }

    /// Place `child` at the parent's selection point, keeping lateral
    /// siblings in order around it.
    pub fn attach_at_sel(&mut self, parent: NodeId, child: NodeId) {
        self.get_mut(child).parent = Some(parent);
        let p = self.get_mut(parent);
        if p.children.is_empty() {
            p.sel = 0;
            p.children.push(child);
        } else {
            let at = p.sel.min(p.children.len());
            p.children.insert(at, child);
            p.sel = at;
        }
    }

    /// Unlink `child` from `parent` without freeing it. Detaching the
    /// selected child leaves `sel` pointing at the vacated slot, so a
    /// follow-up `attach_at_sel` restores the original sibling order.
    pub fn detach_child(&mut self, parent: NodeId, child: NodeId) {
        let p = self.get_mut(parent);
        if let Some(idx) = p.children.iter().position(|&c| c == child) {
            p.children.remove(idx);
            if idx < p.sel {
                p.sel -= 1;
            }
        }
        self.get_mut(child).parent = None;
    }

    /// Free every child subtree of `id`.
    pub fn clear_children(&mut self, id: NodeId) {
        let children = std::mem::take(&mut self.get_mut(id).children);
        for c in children {
            self.free_subtree(c);
        }
        self.get_mut(id).sel = 0;
    }

    /// The accepted node whose span covers byte offset `pos` on the selected
    /// path. Zero-size pieces (bare continuation bytes) never terminate the
    /// walk, so a position just past them lands on their visible carrier.
    pub fn pos_to_node(&self, pos: usize) -> NodeId {
        let mut offs = 0usize;
        let mut cur = self.root;
        loop {
            let node = self.get(cur);
            if cur != self.root && offs >= pos && node.str_size != 0 {
                return node.parent.unwrap_or(self.root);
            }
            offs += node.str_size;
            match node.selected_child() {
                Some(c) => cur = c,
                None => return cur,
            }
        }
    }

    /// Like `pos_to_node`, then back up to the nearest piece containing a
    /// space (or the root). Retokenizing from a word boundary keeps the
    /// tokenizer from splitting pieces mid-word and maximizes prefix reuse.
    pub fn pos_to_word_node(&self, pos: usize) -> NodeId {
        let mut offs = 0usize;
        let mut cur = self.root;
        let mut ran_out = false;
        while offs < pos {
            let node = self.get(cur);
            offs += node.str_size;
            match node.selected_child() {
                Some(c) => cur = c,
                None => {
                    ran_out = true;
                    break;
                }
            }
        }
        if !ran_out {
            if let Some(p) = self.get(cur).parent {
                cur = p;
            }
        }
        loop {
            let node = self.get(cur);
            if node.parent.is_none() || node.bytes.contains(&b' ') {
                return cur;
            }
            cur = node.parent.unwrap_or(self.root);
        }
    }

    /// Concatenate pieces along the selected path from `from`, stopping at
    /// the end of the chain, after `max_tokens`, or at the first unaccepted
    /// node unless `include_predictions`.
    pub fn render_bytes(
        &self,
        from: NodeId,
        max_tokens: usize,
        include_predictions: bool,
    ) -> Vec<u8> {
        let mut out = Vec::new();
        let mut cur = Some(from);
        let mut left = max_tokens;
        while let Some(id) = cur {
            if left == 0 {
                break;
            }
            let node = self.get(id);
            if !include_predictions && !node.is_accepted {
                break;
            }
            out.extend_from_slice(&node.bytes);
            cur = node.selected_child();
            left -= 1;
        }
        out
    }

    pub fn render(&self, from: NodeId, max_tokens: usize, include_predictions: bool) -> String {
        String::from_utf8_lossy(&self.render_bytes(from, max_tokens, include_predictions))
            .into_owned()
    }

    /// Relocate a spliced subtree: shift depth and position throughout the
    /// accepted part, drop predictions (their prefix changed under them),
    /// and clear logits stamped under the old prefix.
    pub fn reroot(&mut self, id: NodeId, delta_depth: isize, delta_pos: isize) {
        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            {
                let node = self.get_mut(id);
                node.has_logit = false;
                node.depth = (node.depth as isize + delta_depth).max(0) as usize;
                node.base_pos = (node.base_pos as isize + delta_pos).max(0) as usize;
            }
            let children = self.get(id).children.clone();
            let mut sel = self.get(id).sel;
            let mut kept = Vec::with_capacity(children.len());
            for (i, c) in children.into_iter().enumerate() {
                if self.get(c).is_accepted {
                    kept.push(c);
                    stack.push(c);
                } else {
                    self.free_subtree(c);
                    if sel >= i {
                        sel = sel.saturating_sub(1);
                    }
                }
            }
            let node = self.get_mut(id);
            if !kept.is_empty() {
                sel = sel.min(kept.len() - 1);
            } else {
                sel = 0;
            }
            node.children = kept;
            node.sel = sel;
        }
    }
}
