#![cfg(test)]

use crate::buffer::testing::{Ev, assert_path_lengths, make_buffer};
use crate::engine::Token;
use crate::tree::{Node, NodeId};

#[test]
fn insert_roundtrips_through_the_tokenizer() {
    let (mut buffer, recorder, _log) = make_buffer();
    buffer.insert(0, "hello world");
    buffer.pump_until_idle();
    assert_eq!(buffer.render_document(), "hello world");
    assert_path_lengths(&buffer);
    assert!(recorder.saw(&Ev::Invalidate(0, 11)));
}

#[test]
fn sequential_edits_match_reference_string() {
    let (mut buffer, _recorder, _log) = make_buffer();
    let mut reference = String::new();

    for (pos, text) in [(0, "hello world"), (5, "o"), (0, "ah "), (9, "x")] {
        buffer.insert(pos, text);
        buffer.pump_until_idle();
        reference.insert_str(pos, text);
        assert_eq!(buffer.render_document(), reference, "after insert at {pos}");
        assert_path_lengths(&buffer);
    }

    for (from, to) in [(1, 3), (0, 1), (5, 9)] {
        buffer.erase(from, to);
        buffer.pump_until_idle();
        reference.replace_range(from..to, "");
        assert_eq!(buffer.render_document(), reference, "after erase {from}..{to}");
        assert_path_lengths(&buffer);
    }
}

#[test]
fn erase_everything_leaves_an_empty_document() {
    let (mut buffer, _recorder, _log) = make_buffer();
    buffer.insert(0, "some words here");
    buffer.pump_until_idle();
    buffer.erase(0, 15);
    buffer.pump_until_idle();
    assert_eq!(buffer.render_document(), "");
}

/// Collect the accepted selected path below the root.
fn accepted_path(buffer: &crate::buffer::Buffer) -> Vec<NodeId> {
    let tree = &buffer.tree;
    let mut out = Vec::new();
    let mut cur = tree.get(tree.root()).selected_child();
    while let Some(id) = cur {
        if !tree.get(id).is_accepted {
            break;
        }
        out.push(id);
        cur = tree.get(id).selected_child();
    }
    out
}

#[test]
fn matching_prefix_is_reused_by_identity() {
    let (mut buffer, _recorder, _log) = make_buffer();
    buffer.insert(0, "hello world");
    buffer.pump_until_idle();
    let before = accepted_path(&buffer);

    buffer.insert(11, "s");
    buffer.pump_until_idle();
    let after = accepted_path(&buffer);

    assert_eq!(after.len(), before.len() + 1);
    // appending retokenizes from the last word boundary but keeps every
    // matching node, pointer-identically
    assert_eq!(&after[..before.len()], &before[..]);
    assert_eq!(buffer.render_document(), "hello worlds");
}

#[test]
fn realigned_suffix_is_spliced_and_rerooted() {
    let (mut buffer, _recorder, _log) = make_buffer();
    buffer.insert(0, "hello world");
    buffer.pump_until_idle();
    let before = accepted_path(&buffer);

    buffer.insert(1, "x");
    buffer.pump_until_idle();
    let after = accepted_path(&buffer);

    assert_eq!(buffer.render_document(), "hxello world");
    // "h" is prefix-reused, "x" is fresh, "ello world" is the old subtree
    assert_eq!(after[0], before[0]);
    let spliced = &after[2..];
    assert_eq!(spliced, &before[1..]);
    for &id in spliced {
        let node = buffer.tree.get(id);
        assert!(!node.has_logit, "relocated nodes carry stale logits");
    }
    // positions shifted by the insertion
    let e = buffer.tree.get(spliced[0]);
    assert_eq!(e.base_pos, 2);
    assert_path_lengths(&buffer);
}

#[test]
fn identical_rebuild_changes_nothing() {
    let (mut buffer, _recorder, _log) = make_buffer();
    buffer.insert(0, "stable text");
    buffer.pump_until_idle();
    let before = accepted_path(&buffer);

    // an empty insertion at the end retokenizes the last word to no effect
    buffer.insert(11, "");
    buffer.pump_until_idle();
    let after = accepted_path(&buffer);

    assert_eq!(before, after);
    assert_eq!(buffer.render_document(), "stable text");
}

/// Hand-build an unaccepted chain below `from`.
fn ghost_chain(
    buffer: &mut crate::buffer::Buffer,
    from: NodeId,
    pieces: &[&[u8]],
) -> Vec<NodeId> {
    let mut ids = Vec::new();
    let mut cur = from;
    for (i, p) in pieces.iter().enumerate() {
        let (base, depth) = {
            let n = buffer.tree.get(cur);
            (n.end_pos(), n.depth + 1)
        };
        let mut node = Node::fresh(Token(200 + i as i32), p.to_vec(), base, depth);
        node.is_accepted = false;
        let id = buffer.tree.alloc(node);
        buffer.tree.push_child(cur, id);
        ids.push(id);
        cur = id;
    }
    ids
}

#[test]
fn actualize_leaps_over_a_split_codepoint() {
    let (mut buffer, recorder, _log) = make_buffer();
    buffer.insert(0, "a");
    buffer.pump_until_idle();
    let a = accepted_path(&buffer)[0];

    // "é" split into a lead byte and a continuation byte
    let ghosts = ghost_chain(&mut buffer, a, &[&[0xC3], &[0xA9]]);
    buffer.tree.get_mut(ghosts[0]).is_accepted = true;
    recorder.take();

    buffer.actualize(ghosts[0]);

    assert!(buffer.tree.get(ghosts[1]).is_accepted, "leap promotes the continuation");
    assert!(recorder.saw(&Ev::TailReplace(1, "é".to_string())));
}

#[test]
fn actualize_abandons_an_uncompletable_tail() {
    let (mut buffer, recorder, _log) = make_buffer();
    buffer.insert(0, "a");
    buffer.pump_until_idle();
    let a = accepted_path(&buffer)[0];

    let ghosts = ghost_chain(&mut buffer, a, &[&[0xC3]]);
    buffer.tree.get_mut(ghosts[0]).is_accepted = true;
    recorder.take();

    buffer.actualize(ghosts[0]);

    assert!(!buffer.tree.get(ghosts[0]).is_accepted);
    assert!(recorder.saw(&Ev::TailReplace(1, String::new())));
}

#[test]
fn alt_commit_advances_past_continuation_pieces() {
    let (mut buffer, _recorder, _log) = make_buffer();
    buffer.insert(0, "a");
    buffer.pump_until_idle();
    let a = accepted_path(&buffer)[0];

    let ghosts = ghost_chain(&mut buffer, a, &[&[0xC3], &[0xA9]]);
    let _ = ghosts;
    let pos = buffer.alt_commit(1);
    // the commit accepts the lead byte; the leap pulls the continuation in,
    // and the cursor lands after the completed codepoint
    assert_eq!(pos, 2);
    assert_eq!(buffer.render_document(), "aé");
}

#[test]
fn alt_back_skips_continuation_pieces() {
    let (mut buffer, _recorder, _log) = make_buffer();
    buffer.insert(0, "a");
    buffer.pump_until_idle();
    let a = accepted_path(&buffer)[0];
    let ghosts = ghost_chain(&mut buffer, a, &[&[0xC3], &[0xA9]]);
    for g in &ghosts {
        buffer.tree.get_mut(*g).is_accepted = true;
    }

    // from the end of "aé", one step back crosses the whole codepoint
    assert_eq!(buffer.alt_back(2), 1);
    assert_eq!(buffer.alt_back(1), 0);
}

#[test]
fn commit_without_predictions_is_a_no_op_move() {
    let (mut buffer, _recorder, _log) = make_buffer();
    buffer.insert(0, "ab");
    buffer.pump_until_idle();
    // no prediction children below 'b': commit just reports the token end
    assert_eq!(buffer.alt_commit(2), 2);
    assert_eq!(buffer.render_document(), "ab");
}
