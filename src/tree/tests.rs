#![cfg(test)]

use super::*;
use crate::engine::{Snapshot, Token};

fn snap() -> Snapshot {
    Vec::new().into()
}

fn empty_tree() -> TokenTree {
    TokenTree::new(Token(27), snap())
}

/// Chain accepted nodes along the selected path, one per piece.
fn chain(tree: &mut TokenTree, from: NodeId, pieces: &[&[u8]]) -> Vec<NodeId> {
    let mut ids = Vec::new();
    let mut cur = from;
    for (i, p) in pieces.iter().enumerate() {
        let (base, depth) = {
            let n = tree.get(cur);
            (n.end_pos(), n.depth + 1)
        };
        let id = tree.alloc(Node::fresh(Token(100 + i as i32), p.to_vec(), base, depth));
        tree.push_child(cur, id);
        ids.push(id);
        cur = id;
    }
    ids
}

#[test]
fn str_size_rules() {
    let cases: &[(&[u8], usize)] = &[
        (b"", 0),
        (b"a", 1),
        (b"hello", 5),
        ("é".as_bytes(), 2),    // whole codepoint
        (&[0xC3], 1),           // lead byte alone
        (&[0xA9], 0),           // bare continuation byte
        (&[0xE2, 0x82], 1),     // two of a three-byte codepoint
        (&[0x82, 0xAC], 0),     // continuation tail
    ];
    for (i, (bytes, want)) in cases.iter().enumerate() {
        assert_eq!(str_size_of(bytes), *want, "case {i}");
    }
}

#[test]
fn arena_generations_detect_stale_ids() {
    let mut tree = empty_tree();
    let ids = chain(&mut tree, tree.root(), &[b"a", b"b"]);
    assert!(tree.contains(ids[0]));
    tree.detach_child(tree.root(), ids[0]);
    tree.free_subtree(ids[0]);
    assert!(!tree.contains(ids[0]));
    assert!(!tree.contains(ids[1]));
    // the recycled slot does not resurrect the old id
    let fresh = tree.alloc(Node::fresh(Token(1), b"x".to_vec(), 0, 1));
    assert!(tree.contains(fresh));
    assert!(!tree.contains(ids[0]));
    assert!(!tree.contains(ids[1]));
}

#[test]
fn pos_to_node_walks_the_selected_path() {
    let mut tree = empty_tree();
    let ids = chain(&mut tree, tree.root(), &[b"he", b"llo", b" wo", b"rld"]);
    assert_eq!(tree.pos_to_node(0), tree.root());
    assert_eq!(tree.pos_to_node(1), ids[0]);
    assert_eq!(tree.pos_to_node(2), ids[0]);
    assert_eq!(tree.pos_to_node(3), ids[1]);
    assert_eq!(tree.pos_to_node(5), ids[1]);
    assert_eq!(tree.pos_to_node(7), ids[2]);
    assert_eq!(tree.pos_to_node(11), ids[3]);
    // past the end lands on the last node
    assert_eq!(tree.pos_to_node(50), ids[3]);
}

#[test]
fn pos_to_node_skips_zero_size_pieces() {
    let mut tree = empty_tree();
    let ids = chain(&mut tree, tree.root(), &[b"a", &[0xC3], &[0xA9], b"b"]);
    // position 2 falls after the lead byte; the bare continuation piece is
    // invisible, so its successor's check resolves to it
    assert_eq!(tree.pos_to_node(2), ids[2]);
}

#[test]
fn pos_to_word_node_backs_up_to_a_space() {
    let mut tree = empty_tree();
    let ids = chain(&mut tree, tree.root(), &[b"hel", b"lo", b" wor", b"ld"]);
    assert_eq!(tree.pos_to_word_node(9), ids[2]);
    assert_eq!(tree.pos_to_word_node(4), tree.root());
    assert_eq!(tree.pos_to_word_node(0), tree.root());
    // past the end: walks off the chain, then back to the last space
    assert_eq!(tree.pos_to_word_node(20), ids[2]);
}

#[test]
fn render_respects_acceptance_and_caps() {
    let mut tree = empty_tree();
    let ids = chain(&mut tree, tree.root(), &[b"ab", b"cd"]);
    let ghost = tree.alloc(Node::fresh(Token(7), b"ef".to_vec(), 4, 3));
    tree.get_mut(ghost).is_accepted = false;
    tree.push_child(ids[1], ghost);

    assert_eq!(tree.render(tree.root(), usize::MAX, false), "abcd");
    assert_eq!(tree.render(tree.root(), usize::MAX, true), "abcdef");
    // the cap counts nodes from the start, root included
    assert_eq!(tree.render(tree.root(), 2, false), "ab");
    assert_eq!(tree.render(ids[1], usize::MAX, false), "cd");
}

#[test]
fn reroot_shifts_and_drops_predictions() {
    let mut tree = empty_tree();
    let ids = chain(&mut tree, tree.root(), &[b"x", b"y"]);
    let head = ids[0];
    tree.get_mut(head).has_logit = true;
    tree.get_mut(head).logit = -1.0;
    let ghost = tree.alloc(Node::fresh(Token(9), b"g".to_vec(), 2, 3));
    tree.get_mut(ghost).is_accepted = false;
    tree.push_child(ids[1], ghost);

    tree.detach_child(tree.root(), head);
    tree.reroot(head, 2, 3);

    assert_eq!(tree.get(head).depth, 3);
    assert_eq!(tree.get(head).base_pos, 3);
    assert!(!tree.get(head).has_logit, "stale logit must not survive");
    assert_eq!(tree.get(ids[1]).depth, 4);
    assert_eq!(tree.get(ids[1]).base_pos, 4);
    assert!(!tree.contains(ghost), "predictions die on relocation");
    assert!(tree.get(ids[1]).children.is_empty());
}

#[test]
fn reroot_keeps_selection_on_surviving_child() {
    let mut tree = empty_tree();
    let parent = chain(&mut tree, tree.root(), &[b"p"])[0];
    let dead = tree.alloc(Node::fresh(Token(1), b"a".to_vec(), 1, 2));
    tree.get_mut(dead).is_accepted = false;
    let live = tree.alloc(Node::fresh(Token(2), b"b".to_vec(), 1, 2));
    tree.push_child(parent, dead);
    tree.push_child(parent, live);
    tree.get_mut(parent).sel = 1;

    tree.detach_child(tree.root(), parent);
    tree.reroot(parent, 0, 0);

    let p = tree.get(parent);
    assert_eq!(p.children, vec![live]);
    assert_eq!(p.sel, 0);
    assert_eq!(p.selected_child(), Some(live));
}

#[test]
fn detach_then_attach_preserves_sibling_order() {
    let mut tree = empty_tree();
    let parent = chain(&mut tree, tree.root(), &[b"p"])[0];
    let mut kids = Vec::new();
    for (i, piece) in [b"a", b"b", b"c"].iter().enumerate() {
        let id = tree.alloc(Node::fresh(Token(i as i32), piece.to_vec(), 1, 2));
        tree.push_child(parent, id);
        kids.push(id);
    }
    tree.get_mut(parent).sel = 1;

    tree.detach_child(parent, kids[1]);
    let repl = tree.alloc(Node::fresh(Token(9), b"z".to_vec(), 1, 2));
    tree.attach_at_sel(parent, repl);

    let p = tree.get(parent);
    assert_eq!(p.children, vec![kids[0], repl, kids[2]]);
    assert_eq!(p.sel, 1);
}

#[test]
fn clear_children_frees_recursively() {
    let mut tree = empty_tree();
    let ids = chain(&mut tree, tree.root(), &[b"a", b"b", b"c"]);
    tree.clear_children(ids[0]);
    assert!(tree.contains(ids[0]));
    assert!(!tree.contains(ids[1]));
    assert!(!tree.contains(ids[2]));
    assert!(tree.get(ids[0]).children.is_empty());
}
