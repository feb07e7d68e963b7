//! The model-backed text buffer. Owns the token tree, the work queue, and
//! the engine, translates editor events into tree surgery, and raises UI
//! callbacks for everything the display needs to repaint.

use std::sync::Arc;

use crate::config::Config;
use crate::engine::{BatchItem, Engine, Vocab};
use crate::queue::{JobKind, WorkQueue};
use crate::tree::{Node, NodeId, TokenTree};

#[cfg(test)]
pub(crate) mod testing;
#[cfg(test)]
mod tests;

/// Callbacks into the display layer. Registered once at construction.
pub trait BufferEvents: Send {
    /// Colouring/annotation over a byte range is stale and should be cleared.
    fn on_invalidate(&mut self, _from: usize, _to: usize) {}

    /// A token covering the byte range was scored; the value is
    /// `logit - max_logit` (non-positive, zero meaning the greedy choice).
    fn on_logit(&mut self, _from: usize, _to: usize, _logit_minus_max: f32) {}

    /// The above/selected/below continuations changed; refetch them.
    fn on_predictions_changed(&mut self) {}

    /// Replace the document suffix starting at `from` with `text`. The
    /// display must not feed this change back as an edit.
    fn on_tail_replace(&mut self, _from: usize, _text: &str) {}
}

/// Alternative continuations around the selected one at a position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Alts {
    pub above: String,
    pub selected: String,
    pub below: String,
    /// Bytes from the queried position to the end of the covering token.
    pub delta: usize,
}

pub(crate) struct Inflight {
    pub(crate) rx: std::sync::mpsc::Receiver<PassReturn>,
}

pub(crate) struct PassReturn {
    pub(crate) engine: Box<dyn Engine>,
    pub(crate) result: Result<crate::engine::PassOutput, crate::engine::EngineError>,
}

pub struct Buffer {
    pub(crate) tree: TokenTree,
    pub(crate) queue: WorkQueue,
    pub(crate) vocab: Arc<dyn Vocab>,
    /// `None` only while a pass holds the engine, or after a worker died.
    pub(crate) engine: Option<Box<dyn Engine>>,
    pub(crate) inflight: Option<Inflight>,
    pub(crate) events: Box<dyn BufferEvents>,
    pub(crate) config: Config,
    /// Node the engine's KV cache represents the state *after*, if known.
    pub(crate) ctx_state: Option<NodeId>,
    /// First node of the in-flight batch.
    pub(crate) work_base: NodeId,
    /// Whether the engine state moved since the last scheduling decision.
    pub(crate) state_changed: bool,
    /// The batch of the in-flight (or most recent) pass.
    pub(crate) batch: Vec<BatchItem>,
}

impl Buffer {
    pub fn new(
        vocab: Arc<dyn Vocab>,
        mut engine: Box<dyn Engine>,
        config: Config,
        events: Box<dyn BufferEvents>,
    ) -> Result<Self, crate::engine::EngineError> {
        let initial = engine.save_state()?;
        let tree = TokenTree::new(vocab.bos_token(), initial);
        let root = tree.root();
        let mut buffer = Buffer {
            tree,
            queue: WorkQueue::new(),
            vocab,
            engine: Some(engine),
            inflight: None,
            events,
            config,
            ctx_state: None,
            work_base: root,
            state_changed: false,
            batch: Vec::new(),
        };
        buffer.rebuild(root, String::new(), 0, 0);
        buffer.try_start();
        Ok(buffer)
    }

    /// The committed document.
    pub fn render_document(&self) -> String {
        self.tree.render(self.tree.root(), usize::MAX, false)
    }

    /// Swap in a freshly loaded model, preserving the committed text. The
    /// tree is torn down and resynthesized against the new engine's state.
    pub fn replace_engine(
        &mut self,
        vocab: Arc<dyn Vocab>,
        mut engine: Box<dyn Engine>,
    ) -> Result<(), crate::engine::EngineError> {
        self.cancel_all();
        let text = self.render_document();
        let initial = engine.save_state()?;
        self.tree = TokenTree::new(vocab.bos_token(), initial);
        self.vocab = vocab;
        self.engine = Some(engine);
        self.ctx_state = None;
        self.work_base = self.tree.root();
        self.state_changed = false;
        self.batch.clear();
        let change_end = text.len();
        self.rebuild(self.tree.root(), text, change_end, 0);
        self.try_start();
        Ok(())
    }

    /// Wait out any in-flight pass (discarding its result) and empty the
    /// queue.
    pub(crate) fn cancel_all(&mut self) {
        if let Some(inflight) = self.inflight.take() {
            match inflight.rx.recv() {
                Ok(ret) => {
                    self.engine = Some(ret.engine);
                }
                Err(_) => {
                    tracing::error!("inference thread died during cancel");
                }
            }
        }
        self.queue = WorkQueue::new();
        self.ctx_state = None;
    }

    // ---- editor-facing operations ----

    pub fn insert(&mut self, pos: usize, text: &str) {
        let start = self.tree.pos_to_word_node(pos);
        let base = self.tree.get(start).base_pos;
        let mut tail = self.tree.render(start, usize::MAX, false);
        let at = (pos - base).min(tail.len());
        tail.insert_str(at, text);
        tracing::debug!(pos, len = text.len(), "insert");
        self.rebuild(start, tail, pos + text.len(), text.len() as isize);
        self.try_start();
    }

    pub fn erase(&mut self, from: usize, to: usize) {
        let start = self.tree.pos_to_word_node(from);
        let base = self.tree.get(start).base_pos;
        let mut tail = self.tree.render(start, usize::MAX, false);
        let a = (from - base).min(tail.len());
        let b = (to - base).min(tail.len());
        tail.replace_range(a..b, "");
        tracing::debug!(from, to, "erase");
        self.rebuild(start, tail, from, from as isize - to as isize);
        self.try_start();
    }

    /// Start exploring alternatives at `pos`: the greedy continuation plus a
    /// lateral branch, ahead of any queued background work.
    pub fn request_alts_at(&mut self, pos: usize) {
        let cur = self.tree.pos_to_node(pos);
        tracing::trace!(pos, depth = self.tree.get(cur).depth, "request alts");
        self.queue.purge_predictions(self.inflight.is_some());
        self.inject(JobKind::Branch, cur, self.config.predict_alt as i32);
        self.inject(JobKind::Predict, cur, self.config.predict_main as i32);
        self.try_start();
    }

    pub fn get_alts_at(&self, pos: usize) -> Alts {
        let cur = self.tree.pos_to_node(pos);
        let node = self.tree.get(cur);
        let delta = node.end_pos().saturating_sub(pos);
        let above_len = self.config.predict_alt.max(1) as usize;
        let main_len = self.config.predict_main.max(1) as usize;
        let above = if node.sel > 0 {
            node.children
                .get(node.sel - 1)
                .map(|&c| self.tree.render(c, above_len, true))
                .unwrap_or_default()
        } else {
            String::new()
        };
        let selected = node
            .selected_child()
            .map(|c| self.tree.render(c, main_len, true))
            .unwrap_or_default();
        let below = node
            .children
            .get(node.sel + 1)
            .map(|&c| self.tree.render(c, above_len, true))
            .unwrap_or_default();
        Alts {
            above,
            selected,
            below,
            delta,
        }
    }

    pub fn alt_next(&mut self, pos: usize) {
        let cur = self.tree.pos_to_node(pos);
        let moved = {
            let node = self.tree.get_mut(cur);
            if node.children.len() > node.sel + 1 {
                node.sel += 1;
                true
            } else {
                false
            }
        };
        if let Some(c) = self.tree.get(cur).selected_child() {
            self.actualize(c);
            if moved {
                // earlier lateral moves may have left this branch unscored
                self.enqueue(JobKind::Score, c, 0);
            }
        }
        self.inject(JobKind::Branch, cur, self.config.predict_alt as i32);
        self.try_start();
    }

    pub fn alt_prev(&mut self, pos: usize) {
        let cur = self.tree.pos_to_node(pos);
        let moved = {
            let node = self.tree.get_mut(cur);
            if node.sel > 0 {
                node.sel -= 1;
                true
            } else {
                false
            }
        };
        if let Some(c) = self.tree.get(cur).selected_child() {
            self.actualize(c);
            if moved {
                self.enqueue(JobKind::Score, c, 0);
            }
        }
        self.inject(JobKind::Branch, cur, self.config.predict_alt as i32);
        self.try_start();
    }

    /// Accept the selected continuation token. Returns the byte offset just
    /// past it, advanced over continuation-byte pieces so the cursor never
    /// lands inside a codepoint.
    pub fn alt_commit(&mut self, pos: usize) -> usize {
        let cur = self.tree.pos_to_node(pos);
        let Some(child) = self.tree.get(cur).selected_child() else {
            return self.tree.get(cur).end_pos();
        };
        self.tree.get_mut(child).is_accepted = true;
        self.actualize(child);
        let mut cur = child;
        loop {
            let node = self.tree.get(cur);
            let posn = node.end_pos();
            let next = node
                .selected_child()
                .filter(|&c| self.tree.get(c).is_accepted)
                .filter(|&c| self.tree.get(c).starts_with_continuation());
            match next {
                Some(c) => cur = c,
                None => return posn,
            }
        }
    }

    /// Step the cursor back one token, again skipping over continuation-byte
    /// pieces. Returns the new byte offset.
    pub fn alt_back(&mut self, pos: usize) -> usize {
        let mut cur = self.tree.pos_to_node(pos);
        if self.tree.get(cur).base_pos == pos {
            if let Some(p) = self.tree.get(cur).parent {
                cur = p;
            }
        }
        let mut posn = self.tree.get(cur).base_pos;
        while self.tree.get(cur).starts_with_continuation() {
            match self.tree.get(cur).parent {
                Some(p) => {
                    cur = p;
                    posn = self.tree.get(cur).base_pos;
                }
                None => break,
            }
        }
        posn
    }

    /// One line per queued job, for the readout pane.
    pub fn queue_summary(&self) -> Vec<String> {
        self.queue
            .iter()
            .enumerate()
            .map(|(i, job)| {
                let what = match job.kind {
                    JobKind::Score => "score",
                    JobKind::Predict => "predict",
                    JobKind::Branch => "branch",
                };
                let target = if self.tree.contains(job.target) {
                    let n = self.tree.get(job.target);
                    format!(
                        "'{}' @{} (+{})",
                        String::from_utf8_lossy(&n.bytes),
                        n.depth,
                        n.base_pos
                    )
                } else {
                    "<gone>".to_string()
                };
                let dead = if i == 0 && self.queue.head_invalid() {
                    " [dropped]"
                } else {
                    ""
                };
                format!("{what} {target} +{}{dead}", job.budget)
            })
            .collect()
    }

    // ---- reconciliation ----

    /// Retokenize `text` in place of the subtree at `anchor` and reconcile:
    /// keep the matching prefix, splice the old suffix back once positions
    /// realign past `change_end`, lay down fresh nodes for the rest.
    pub(crate) fn rebuild(
        &mut self,
        anchor: NodeId,
        text: String,
        change_end: usize,
        reconcile_offset: isize,
    ) {
        let bos = self.vocab.bos_token();
        let add_bos = self.tree.get(anchor).tok == bos;
        let mut tokens = match self.vocab.tokenize(&text, add_bos) {
            Ok(t) => t,
            Err(e) => {
                tracing::error!(%e, "retokenization failed; edit dropped");
                return;
            }
        };
        if add_bos && !tokens.is_empty() && tokens[0] != bos {
            tokens.insert(0, bos);
        }

        let anchor_depth = self.tree.get(anchor).depth;
        let anchor_base = self.tree.get(anchor).base_pos;
        self.queue
            .purge_at_or_below(anchor_depth, self.inflight.is_some());
        self.events.on_invalidate(anchor_base, anchor_base + text.len());

        if tokens.is_empty() {
            if let Some(parent) = self.tree.get(anchor).parent {
                self.tree.detach_child(parent, anchor);
                self.tree.free_subtree(anchor);
                return;
            }
        }

        let rebuild_root = self.tree.get(anchor).parent.unwrap_or(anchor);
        tracing::debug!(text = %text, depth = anchor_depth, "rebuild");

        let mut target = rebuild_root;
        let mut old: Option<NodeId> = Some(anchor);
        let mut i = 0usize;

        // keep the matching prefix
        while i < tokens.len() {
            let Some(o) = old else { break };
            if self.tree.get(o).tok != tokens[i] {
                break;
            }
            i += 1;
            target = o;
            old = match self.tree.get(target).selected_child() {
                Some(c) if self.tree.get(c).is_accepted => Some(c),
                Some(c) => {
                    // reuse stops at the prediction frontier
                    self.tree.detach_child(target, c);
                    self.tree.free_subtree(c);
                    None
                }
                None => None,
            };
        }

        let mut spliced = false;
        let mut detached = false;
        while i < tokens.len() {
            let (next_basepos, next_depth) = {
                let t = self.tree.get(target);
                (t.end_pos(), t.depth + 1)
            };

            // the whole edit is laid down and the old tokenisation realigned:
            // hook the surviving suffix back in and relocate it
            if let Some(o) = old {
                let (o_tok, o_base, o_depth) = {
                    let n = self.tree.get(o);
                    (n.tok, n.base_pos, n.depth)
                };
                if o_tok == tokens[i]
                    && next_basepos >= change_end
                    && o_base as isize + reconcile_offset == next_basepos as isize
                {
                    if !detached {
                        self.tree.detach_child(target, o);
                    }
                    self.tree.attach_at_sel(target, o);
                    self.tree
                        .reroot(o, next_depth as isize - o_depth as isize, reconcile_offset);
                    spliced = true;
                    break;
                }
            }

            // lay a fresh token
            let tok = tokens[i];
            let bytes = self.vocab.detokenize(tok, next_depth > 0);
            let node = Node::fresh(tok, bytes, next_basepos, next_depth);
            let id = self.tree.alloc(node);
            if !detached {
                if let Some(o) = old {
                    self.tree.detach_child(target, o);
                }
                detached = true;
            }
            self.tree.attach_at_sel(target, id);
            i += 1;
            target = id;

            // walk the old chain past the bytes just laid down, freeing what
            // it leaves behind
            let target_end = self.tree.get(target).end_pos() as isize;
            while let Some(o) = old {
                if self.tree.get(o).base_pos as isize + reconcile_offset >= target_end {
                    break;
                }
                old = match self.tree.get(o).selected_child() {
                    Some(keep) => {
                        self.tree.detach_child(o, keep);
                        self.tree.free_subtree(o);
                        if self.tree.get(keep).is_accepted {
                            Some(keep)
                        } else {
                            self.tree.free_subtree(keep);
                            None
                        }
                    }
                    None => {
                        self.tree.free_subtree(o);
                        None
                    }
                };
            }
        }

        if !spliced {
            if detached {
                if let Some(o) = old {
                    self.tree.free_subtree(o);
                }
            }
            // the full token string was deposited; nothing may live past it
            self.tree.clear_children(target);
        }

        self.enqueue(JobKind::Score, rebuild_root, 0);
    }

    /// Materialise the selected path from `start` as the displayed tail. If
    /// the accepted render ends mid-codepoint, promote predictions one by
    /// one until it validates (the UTF-8 leap), or abandon the tail.
    pub(crate) fn actualize(&mut self, start: NodeId) {
        let mut bytes = self.tree.render_bytes(start, usize::MAX, false);
        if std::str::from_utf8(&bytes).is_err() {
            tracing::debug!("utf-8 leap");
            let mut pos = start;
            while let Some(c) = self.tree.get(pos).selected_child() {
                if !self.tree.get(c).is_accepted {
                    break;
                }
                pos = c;
            }
            loop {
                let Some(c) = self.tree.get(pos).selected_child() else {
                    break;
                };
                if self.tree.get(c).is_accepted {
                    break;
                }
                self.tree.get_mut(c).is_accepted = true;
                pos = c;
                bytes = self.tree.render_bytes(start, usize::MAX, false);
                if std::str::from_utf8(&bytes).is_ok() {
                    break;
                }
            }
            if std::str::from_utf8(&bytes).is_err() {
                self.tree.get_mut(start).is_accepted = false;
                bytes.clear();
            }
        }

        let from = self.tree.get(start).base_pos;
        let text = String::from_utf8_lossy(&bytes).into_owned();
        tracing::debug!(from, len = text.len(), "actualize");
        self.events.on_tail_replace(from, &text);

        let mut cur = Some(start);
        while let Some(id) = cur {
            let (accepted, has_logit, base, end, value, next) = {
                let n = self.tree.get(id);
                (
                    n.is_accepted,
                    n.has_logit,
                    n.base_pos,
                    n.end_pos(),
                    n.logit - n.max_logit,
                    n.selected_child(),
                )
            };
            if !accepted {
                break;
            }
            if has_logit {
                self.events.on_logit(base, end, value);
            }
            cur = next;
        }
    }
}
