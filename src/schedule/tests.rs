#![cfg(test)]

use crate::buffer::testing::{Ev, assert_path_lengths, make_buffer, make_buffer_with};
use crate::config::Config;
use crate::engine::mock::{self, Call};

fn forward_lens(log: &mock::CallLog) -> Vec<usize> {
    log.lock()
        .unwrap()
        .iter()
        .filter_map(|c| match c {
            Call::Forward { len } => Some(*len),
            _ => None,
        })
        .collect()
}

fn load_count(log: &mock::CallLog) -> usize {
    log.lock()
        .unwrap()
        .iter()
        .filter(|c| matches!(c, Call::Load))
        .count()
}

#[test]
fn alts_on_an_empty_document() {
    let (mut buffer, recorder, _log) = make_buffer();
    recorder.take();

    buffer.request_alts_at(0);
    buffer.pump_until_idle();

    assert!(recorder.saw_predictions_changed());
    // predictions never touch the committed document
    assert_eq!(buffer.render_document(), "");

    let alts = buffer.get_alts_at(0);
    assert_eq!(alts.above, "");
    assert!(alts.selected.starts_with("ab"), "selected = {:?}", alts.selected);
    assert!(alts.below.starts_with("bj"), "below = {:?}", alts.below);
    assert_eq!(alts.delta, 0);
    assert!(buffer.is_idle());
}

#[test]
fn predict_leaves_an_unaccepted_selected_child() {
    let (mut buffer, _recorder, _log) = make_buffer();
    buffer.request_alts_at(0);
    buffer.pump_until_idle();

    let root = buffer.tree.root();
    let node = buffer.tree.get(root);
    assert!(!node.children.is_empty());
    let sel = node.selected_child().unwrap();
    assert!(!buffer.tree.get(sel).is_accepted);
}

#[test]
fn branch_widens_with_distinct_tokens() {
    let (mut buffer, _recorder, _log) = make_buffer();
    buffer.insert(0, "he");
    buffer.request_alts_at(2);
    buffer.pump_until_idle();

    let cur = buffer.tree.pos_to_node(2);
    let node = buffer.tree.get(cur);
    assert!(node.children.len() >= node.sel + 2);
    let mut toks: Vec<i32> = node
        .children
        .iter()
        .map(|&c| buffer.tree.get(c).tok.0)
        .collect();
    toks.sort_unstable();
    toks.dedup();
    assert_eq!(toks.len(), node.children.len(), "branch tokens must differ");
}

#[test]
fn scoring_is_monotonic_and_complete() {
    let (mut buffer, recorder, _log) = make_buffer();
    buffer.insert(0, "he");
    buffer.pump_until_idle();

    assert!(recorder.saw(&Ev::Logit(0, 1)));
    assert!(recorder.saw(&Ev::Logit(1, 2)));

    let mut cur = buffer.tree.get(buffer.tree.root()).selected_child();
    while let Some(id) = cur {
        let node = buffer.tree.get(id);
        if !node.is_accepted {
            break;
        }
        assert!(node.has_logit, "accepted path fully scored");
        assert!(node.logit <= node.max_logit);
        cur = node.selected_child();
    }
}

#[test]
fn commit_extends_by_the_greedy_token() {
    let (mut buffer, recorder, _log) = make_buffer();
    buffer.insert(0, "he");
    buffer.request_alts_at(2);
    buffer.pump_until_idle();
    recorder.take();

    let pos = buffer.alt_commit(2);
    buffer.pump_until_idle();

    // the mock prefers 'd' after "he"
    assert_eq!(
        mock::preferred(&[mock::BOS, mock::letter('h'), mock::letter('e')]),
        3
    );
    assert_eq!(pos, 3);
    assert_eq!(buffer.render_document(), "hed");
    assert!(recorder.saw(&Ev::TailReplace(2, "d".to_string())));
    assert_path_lengths(&buffer);
}

#[test]
fn lateral_navigation_moves_the_selection() {
    let (mut buffer, recorder, _log) = make_buffer();
    buffer.insert(0, "he");
    buffer.request_alts_at(2);
    buffer.pump_until_idle();
    buffer.alt_commit(2);
    buffer.pump_until_idle();
    recorder.take();

    buffer.alt_next(2);
    buffer.pump_until_idle();
    buffer.alt_next(2);
    buffer.pump_until_idle();
    buffer.alt_prev(2);
    buffer.pump_until_idle();

    let cur = buffer.tree.pos_to_node(2);
    assert_eq!(buffer.tree.get(cur).sel, 1, "second child selected");
    // switching to an uncommitted alternative clears the displayed tail
    assert!(recorder.saw(&Ev::TailReplace(2, String::new())));
    // each move keeps widening the frontier
    assert!(buffer.tree.get(cur).children.len() >= 3);

    let alts = buffer.get_alts_at(2);
    assert!(alts.above.starts_with('d'), "above = {:?}", alts.above);
}

#[test]
fn replay_is_bounded_by_snapshot_freq() {
    let config = Config {
        snapshot_freq: 3,
        ..Config::default()
    };
    let (mut buffer, _recorder, log) = make_buffer_with(config);
    buffer.insert(0, "abcdefghij");
    buffer.pump_until_idle();

    // snapshots were captured on the way down
    assert!(
        log.lock()
            .unwrap()
            .iter()
            .filter(|c| matches!(c, Call::Save))
            .count()
            >= 3
    );
    log.lock().unwrap().clear();

    buffer.alt_next(9);
    buffer.pump_until_idle();

    let lens = forward_lens(&log);
    assert!(!lens.is_empty());
    assert!(
        lens.iter().all(|&l| l <= 3),
        "replay exceeded snapshot_freq: {lens:?}"
    );
    assert!(load_count(&log) >= 1, "a jump must restore from a snapshot");
}

#[test]
fn stale_exploration_is_discarded_on_cursor_move() {
    let (mut buffer, _recorder, _log) = make_buffer();
    buffer.insert(0, "ab cd");
    buffer.pump_until_idle();

    // first request launches a pass; the second arrives before it is polled
    buffer.request_alts_at(2);
    buffer.request_alts_at(5);
    buffer.pump_until_idle();

    let stale = buffer.tree.pos_to_node(2);
    assert!(
        buffer.tree.get(stale).children.is_empty(),
        "results of the invalidated pass must be dropped"
    );
    let live = buffer.tree.pos_to_node(5);
    assert!(buffer.tree.get(live).children.len() >= 2);
}

#[test]
fn edits_mid_flight_purge_cleanly() {
    let (mut buffer, _recorder, _log) = make_buffer();
    buffer.insert(0, "abc");
    // no pump: the score pass for the first edit is still in flight
    buffer.insert(3, "d");
    buffer.pump_until_idle();

    assert_eq!(buffer.render_document(), "abcd");
    let mut cur = buffer.tree.get(buffer.tree.root()).selected_child();
    while let Some(id) = cur {
        let node = buffer.tree.get(id);
        assert!(node.has_logit);
        cur = node.selected_child();
    }
    assert_path_lengths(&buffer);
}

#[test]
fn single_step_batches_follow_the_scoring_cascade() {
    let (mut buffer, _recorder, log) = make_buffer();
    buffer.insert(0, "abcd");
    buffer.pump_until_idle();

    let lens = forward_lens(&log);
    // one replay pass from the root snapshot, then one token per step
    assert_eq!(lens[0], 1);
    assert!(lens.iter().all(|&l| l == 1), "cascade batches: {lens:?}");
    assert_eq!(load_count(&log), 1);
}

#[test]
fn engine_replacement_preserves_the_document() {
    let (mut buffer, _recorder, _log) = make_buffer();
    buffer.insert(0, "keep me");
    buffer.request_alts_at(7);
    buffer.pump_until_idle();

    let (vocab, engine, _log2) = mock::rig();
    buffer.replace_engine(vocab, engine).unwrap();
    assert_eq!(buffer.render_document(), "keep me");

    buffer.pump_until_idle();
    assert_eq!(buffer.render_document(), "keep me");
    // the resynthesized tree rescored the whole path
    let mut cur = buffer.tree.get(buffer.tree.root()).selected_child();
    while let Some(id) = cur {
        let node = buffer.tree.get(id);
        if !node.is_accepted {
            break;
        }
        assert!(node.has_logit);
        cur = node.selected_child();
    }
}
