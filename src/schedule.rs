//! Scheduler half of `Buffer`: drain the work queue against the engine, one
//! asynchronous forward pass at a time. The pass runs on a one-shot worker
//! thread that takes the engine by value and hands it back over a channel;
//! all tree mutation happens here, on the editor thread, when `poll` sees
//! the completion.

use std::collections::HashSet;

use crate::buffer::{Buffer, Inflight, PassReturn};
use crate::engine::{BatchItem, PassOutput, Snapshot, Token};
use crate::queue::{Job, JobKind};
use crate::tree::Node;

#[cfg(test)]
mod tests;

fn max_of(row: &[f32]) -> f32 {
    row.iter().copied().fold(f32::NEG_INFINITY, f32::max)
}

fn argmax_excluding(row: &[f32], exclude: &HashSet<i32>) -> Option<(usize, f32)> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &v) in row.iter().enumerate() {
        if exclude.contains(&(i as i32)) {
            continue;
        }
        if best.is_none_or(|(_, b)| v > b) {
            best = Some((i, v));
        }
    }
    best
}

impl Buffer {
    pub(crate) fn enqueue(&mut self, kind: JobKind, target: crate::tree::NodeId, budget: i32) {
        let depth = self.tree.get(target).depth;
        tracing::trace!(?kind, depth, budget, "enqueue");
        self.queue.push_back(Job {
            kind,
            target,
            depth,
            budget,
        });
    }

    pub(crate) fn inject(&mut self, kind: JobKind, target: crate::tree::NodeId, budget: i32) {
        let depth = self.tree.get(target).depth;
        tracing::trace!(?kind, depth, budget, "inject");
        self.queue.push_after_head(
            Job {
                kind,
                target,
                depth,
                budget,
            },
            self.inflight.is_some(),
        );
    }

    /// Nothing in flight and nothing queued.
    pub fn is_idle(&self) -> bool {
        self.inflight.is_none() && self.queue.is_empty()
    }

    /// Check for a finished pass and apply it. Never blocks; call once per
    /// UI tick. Returns whether a completion was processed.
    pub fn poll(&mut self) -> bool {
        let Some(inflight) = &self.inflight else {
            return false;
        };
        match inflight.rx.try_recv() {
            Ok(ret) => {
                self.inflight = None;
                self.finish_pass(ret);
                true
            }
            Err(std::sync::mpsc::TryRecvError::Empty) => false,
            Err(std::sync::mpsc::TryRecvError::Disconnected) => {
                tracing::error!("inference thread died mid-pass");
                self.inflight = None;
                self.queue.pop_head();
                self.ctx_state = None;
                self.try_start();
                true
            }
        }
    }

    /// Block until all queued work has been executed. Shutdown and tests.
    pub fn pump_until_idle(&mut self) {
        loop {
            if let Some(inflight) = self.inflight.take() {
                match inflight.rx.recv() {
                    Ok(ret) => self.finish_pass(ret),
                    Err(_) => {
                        tracing::error!("inference thread died mid-pass");
                        self.queue.pop_head();
                        self.ctx_state = None;
                        self.try_start();
                    }
                }
            } else if !self.queue.is_empty() {
                self.try_start();
                if self.inflight.is_none() && !self.queue.is_empty() {
                    break;
                }
            } else {
                break;
            }
        }
    }

    /// Start the head job if nothing is running: either satisfy it without
    /// the engine (fast path) or dispatch one forward pass.
    pub(crate) fn try_start(&mut self) {
        loop {
            if self.inflight.is_some() {
                return;
            }
            if self.queue.head_invalid() {
                self.queue.pop_head();
            }
            let Some(head) = self.queue.head().copied() else {
                return;
            };
            if !self.tree.contains(head.target) {
                debug_assert!(false, "queued job targets a freed node");
                self.queue.pop_head();
                self.ctx_state = None;
                continue;
            }
            self.state_changed = false;
            if self.fast_path(&head) {
                self.complete_head(None);
                continue;
            }
            if self.engine.is_none() {
                tracing::error!("no engine; dropping queued work");
                self.queue.pop_head();
                continue;
            }
            let Some(restore) = self.prepare_batch(&head) else {
                self.queue.pop_head();
                self.ctx_state = None;
                continue;
            };
            let Some(engine) = self.engine.take() else {
                self.queue.pop_head();
                self.ctx_state = None;
                continue;
            };
            let batch = self.batch.clone();
            let (tx, rx) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let mut engine = engine;
                let result = match restore {
                    Some(snap) => engine
                        .load_state(&snap)
                        .and_then(|()| engine.forward(&batch)),
                    None => engine.forward(&batch),
                };
                let _ = tx.send(PassReturn { engine, result });
            });
            self.inflight = Some(Inflight { rx });
            return;
        }
    }

    /// Jobs whose postcondition already holds skip the engine entirely.
    fn fast_path(&self, job: &Job) -> bool {
        let n = self.tree.get(job.target);
        match job.kind {
            JobKind::Predict => !n.children.is_empty(),
            JobKind::Branch => n.children.len() > n.sel + 1,
            JobKind::Score => {
                n.children.is_empty()
                    || n.selected_child()
                        .is_none_or(|c| self.tree.get(c).has_logit)
            }
        }
    }

    /// Build the batch for `job`, returning the snapshot to restore first
    /// (if any). `None` means the replay path is broken; drop the job.
    fn prepare_batch(&mut self, job: &Job) -> Option<Option<Snapshot>> {
        self.batch.clear();
        let target = job.target;
        let t = self.tree.get(target);

        if self.ctx_state.is_some() && self.ctx_state == t.parent {
            // cache is exactly one step behind: feed the single token
            self.batch.push(BatchItem {
                tok: t.tok,
                pos: t.depth,
                logits: true,
            });
            tracing::trace!(depth = t.depth, "single-step batch");
            self.work_base = target;
            self.ctx_state = Some(target);
            return Some(None);
        }

        // walk up to the nearest snapshot and replay from it
        let mut toks: Vec<Token> = Vec::new();
        let mut need: Vec<bool> = vec![true];
        let mut pos = target;
        loop {
            let node = self.tree.get(pos);
            if node.snapshot.is_some() {
                break;
            }
            toks.push(node.tok);
            need.push(!node.has_logit);
            match node.parent {
                Some(p) => pos = p,
                None => break,
            }
        }
        let base = self.tree.get(pos);
        let Some(restore) = base.snapshot.clone() else {
            debug_assert!(false, "replay path reached a node with no snapshot");
            tracing::error!("replay path has no snapshot; dropping job");
            return None;
        };
        toks.push(base.tok);
        let d0 = base.depth;
        let len = toks.len();
        for i in (0..len).rev() {
            self.batch.push(BatchItem {
                tok: toks[i],
                pos: d0 + (len - 1 - i),
                logits: need.get(i).copied().unwrap_or(false),
            });
        }
        tracing::trace!(
            from_depth = d0,
            len,
            "replay batch from snapshot"
        );
        self.work_base = pos;
        self.ctx_state = Some(target);
        Some(Some(restore))
    }

    /// Handle a pass coming back from the worker thread.
    pub(crate) fn finish_pass(&mut self, ret: PassReturn) {
        self.engine = Some(ret.engine);
        match ret.result {
            Ok(out) => {
                self.state_changed = true;
                if self.queue.head_invalid() {
                    tracing::trace!("discarding pass for purged job");
                    self.queue.pop_head();
                } else {
                    self.complete_head(Some(&out));
                }
            }
            Err(e) => {
                // treat as purged; force a snapshot restore on the next pass
                tracing::error!(%e, "forward pass failed");
                self.queue.pop_head();
                self.ctx_state = None;
            }
        }
        self.try_start();
    }

    /// Apply the head job's results. `out` is `None` on the fast path, where
    /// the job-specific early exits guarantee no logits are read.
    fn complete_head(&mut self, out: Option<&PassOutput>) {
        let Some(job) = self.queue.pop_head() else {
            debug_assert!(false, "completion with an empty queue");
            return;
        };
        if !self.tree.contains(job.target) {
            self.ctx_state = None;
            return;
        }

        let snap = if out.is_some() && self.state_changed {
            self.maybe_capture_snapshot()
        } else {
            None
        };

        match job.kind {
            JobKind::Score => self.complete_score(job, out, snap),
            JobKind::Predict => self.complete_predict(job, out, snap),
            JobKind::Branch => self.complete_branch(job, out, snap),
        }
    }

    /// Capture the engine state when the pass carried the cache across a
    /// snapshot boundary, bounding future replays to `snapshot_freq` tokens.
    fn maybe_capture_snapshot(&mut self) -> Option<Snapshot> {
        let freq = self.config.snapshot_freq.max(1) as usize;
        if !self.tree.contains(self.work_base) {
            debug_assert!(false, "work base vanished under a valid head");
            return None;
        }
        let wb_depth = self.tree.get(self.work_base).depth;
        if (wb_depth % freq) + self.batch.len() < freq {
            return None;
        }
        let engine = self.engine.as_mut()?;
        match engine.save_state() {
            Ok(snap) => {
                tracing::debug!(
                    bytes = snap.len(),
                    base_depth = wb_depth,
                    batch = self.batch.len(),
                    "snapshot captured"
                );
                Some(snap)
            }
            Err(e) => {
                tracing::error!(%e, "snapshot capture failed");
                None
            }
        }
    }

    /// Stamp logits for intermediate batch positions that requested them,
    /// walking the selected path down from the work base. The final
    /// position's row is left for the job-specific completion.
    fn stamp_batch_logits(&mut self, out: &PassOutput) {
        let n = self.batch.len().saturating_sub(1);
        if n == 0 {
            return;
        }
        if !self.tree.contains(self.work_base) {
            debug_assert!(false, "work base vanished under a valid head");
            return;
        }
        let mut t = self.work_base;
        for i in 0..n {
            let Some(tt) = self.tree.get(t).selected_child() else {
                break;
            };
            if self.batch[i].logits {
                if let Some(row) = out.row(i) {
                    let max_logit = max_of(row);
                    let tok = self.tree.get(tt).tok;
                    let logit = *row.get(tok.0.max(0) as usize).unwrap_or(&f32::NEG_INFINITY);
                    {
                        let node = self.tree.get_mut(tt);
                        node.logit = logit;
                        node.max_logit = max_logit;
                        node.has_logit = true;
                    }
                    let (accepted, base, end, value) = {
                        let node = self.tree.get(tt);
                        (
                            node.is_accepted,
                            node.base_pos,
                            node.end_pos(),
                            node.logit - node.max_logit,
                        )
                    };
                    tracing::trace!(tok = tok.0, logit, "batch logit");
                    if accepted {
                        self.events.on_logit(base, end, value);
                    }
                }
            }
            t = tt;
        }
    }

    fn complete_score(&mut self, job: Job, out: Option<&PassOutput>, snap: Option<Snapshot>) {
        let t = job.target;
        let satisfied = {
            let n = self.tree.get(t);
            n.children.is_empty()
                || n.selected_child()
                    .is_none_or(|c| self.tree.get(c).has_logit)
        };
        if satisfied {
            // cross all already-scored children at once
            let mut cur = t;
            loop {
                let Some(c) = self.tree.get(cur).selected_child() else {
                    break;
                };
                if !self.tree.get(c).has_logit {
                    break;
                }
                cur = c;
            }
            if !self.tree.get(cur).children.is_empty() {
                self.inject(JobKind::Score, cur, job.budget);
            }
            return;
        }

        let Some(out) = out else {
            debug_assert!(false, "score completion without a pass");
            self.ctx_state = None;
            return;
        };
        self.stamp_batch_logits(out);
        let Some(logits) = out.last_row() else {
            tracing::error!("score pass carried no logits");
            self.ctx_state = None;
            return;
        };
        let logits = &logits[..self.vocab.vocab_size().min(logits.len())];
        let max_logit = max_of(logits);

        let children = self.tree.get(t).children.clone();
        let sel = self.tree.get(t).sel;
        for (i, &c) in children.iter().enumerate() {
            let (tok, scored) = {
                let n = self.tree.get(c);
                (n.tok, n.has_logit)
            };
            if scored {
                continue;
            }
            let logit = *logits.get(tok.0.max(0) as usize).unwrap_or(&f32::NEG_INFINITY);
            {
                let node = self.tree.get_mut(c);
                node.logit = logit;
                node.max_logit = max_logit;
                node.has_logit = true;
                node.snapshot = snap.clone();
            }
            tracing::trace!(tok = tok.0, logit, "scored child");
            let (accepted, base, end, value) = {
                let node = self.tree.get(c);
                (
                    node.is_accepted,
                    node.base_pos,
                    node.end_pos(),
                    node.logit - node.max_logit,
                )
            };
            if i == sel && accepted {
                self.events.on_logit(base, end, value);
                self.inject(JobKind::Score, c, job.budget);
            }
        }
    }

    fn complete_predict(&mut self, job: Job, out: Option<&PassOutput>, snap: Option<Snapshot>) {
        let t = job.target;
        if !self.tree.get(t).children.is_empty() {
            // something is already predicted here; advance quietly
            if job.budget > 0 {
                if let Some(c) = self.tree.get(t).selected_child() {
                    self.inject(JobKind::Predict, c, job.budget - 1);
                }
            }
            return;
        }

        let Some(out) = out else {
            debug_assert!(false, "predict completion without a pass");
            self.ctx_state = None;
            return;
        };
        self.stamp_batch_logits(out);
        let Some(logits) = out.last_row() else {
            tracing::error!("predict pass carried no logits");
            self.ctx_state = None;
            return;
        };
        let logits = &logits[..self.vocab.vocab_size().min(logits.len())];
        let Some((i_max, l_max)) = argmax_excluding(logits, &HashSet::new()) else {
            return;
        };

        let (base, depth) = {
            let n = self.tree.get(t);
            (n.end_pos(), n.depth + 1)
        };
        let tok = Token(i_max as i32);
        let bytes = self.vocab.detokenize(tok, depth > 0);
        let mut node = Node::fresh(tok, bytes, base, depth);
        node.is_accepted = false;
        node.has_logit = true;
        node.logit = l_max;
        node.max_logit = l_max;
        node.snapshot = snap;
        let id = self.tree.alloc(node);
        self.tree.push_child(t, id);
        tracing::debug!(tok = i_max, logit = l_max, depth, "new prediction");

        self.events.on_predictions_changed();
        if job.budget > 0 {
            self.inject(JobKind::Predict, id, job.budget - 1);
        }
    }

    fn complete_branch(&mut self, job: Job, out: Option<&PassOutput>, snap: Option<Snapshot>) {
        let t = job.target;
        let (sel, kids) = {
            let n = self.tree.get(t);
            (n.sel, n.children.clone())
        };
        if kids.len() > sel + 1 {
            // a lateral alternative already exists; deepen instead
            if job.budget > 0 {
                if sel > 0 {
                    self.inject(JobKind::Predict, kids[sel - 1], job.budget - 1);
                }
                self.inject(JobKind::Predict, kids[sel + 1], job.budget - 1);
                self.inject(
                    JobKind::Predict,
                    kids[sel],
                    self.config.predict_main as i32 - 1,
                );
            }
            return;
        }

        let Some(out) = out else {
            debug_assert!(false, "branch completion without a pass");
            self.ctx_state = None;
            return;
        };
        self.stamp_batch_logits(out);
        let Some(logits) = out.last_row() else {
            tracing::error!("branch pass carried no logits");
            self.ctx_state = None;
            return;
        };
        let logits = &logits[..self.vocab.vocab_size().min(logits.len())];
        let max_logit = max_of(logits);

        let mut exclude: HashSet<i32> = kids.iter().map(|&c| self.tree.get(c).tok.0).collect();
        loop {
            let (sel, len) = {
                let n = self.tree.get(t);
                (n.sel, n.children.len())
            };
            if len > sel + 1 {
                break;
            }
            let Some((i_max, l_max)) = argmax_excluding(logits, &exclude) else {
                tracing::warn!("vocabulary exhausted while branching");
                break;
            };
            let (base, depth) = {
                let n = self.tree.get(t);
                (n.end_pos(), n.depth + 1)
            };
            let tok = Token(i_max as i32);
            let bytes = self.vocab.detokenize(tok, depth > 0);
            let mut node = Node::fresh(tok, bytes, base, depth);
            node.is_accepted = false;
            node.has_logit = true;
            node.logit = l_max;
            node.max_logit = max_logit;
            node.snapshot = snap.clone();
            let id = self.tree.alloc(node);
            self.tree.push_child(t, id);
            tracing::debug!(tok = i_max, logit = l_max, "new branch");
            exclude.insert(i_max as i32);
        }

        self.events.on_predictions_changed();
        if job.budget > 0 {
            let (sel, kids) = {
                let n = self.tree.get(t);
                (n.sel, n.children.clone())
            };
            if kids.len() > sel + 1 {
                self.inject(
                    JobKind::Predict,
                    kids[sel],
                    self.config.predict_main as i32 - 1,
                );
                self.enqueue(JobKind::Predict, kids[sel + 1], job.budget - 1);
                if sel > 0 {
                    self.enqueue(JobKind::Predict, kids[sel - 1], job.budget - 1);
                }
            }
        }
    }
}
