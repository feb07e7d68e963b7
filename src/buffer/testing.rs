#![cfg(test)]
//! Shared fixtures for buffer and scheduler tests.

use std::sync::{Arc, Mutex};

use crate::buffer::{Buffer, BufferEvents};
use crate::config::Config;
use crate::engine::mock::{self, CallLog};

#[derive(Debug, Clone, PartialEq)]
pub enum Ev {
    Invalidate(usize, usize),
    Logit(usize, usize),
    PredictionsChanged,
    TailReplace(usize, String),
}

/// Event sink that records everything for later assertions.
#[derive(Clone, Default)]
pub struct Recorder(pub Arc<Mutex<Vec<Ev>>>);

impl Recorder {
    pub fn take(&self) -> Vec<Ev> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }

    pub fn saw(&self, ev: &Ev) -> bool {
        self.0.lock().unwrap().contains(ev)
    }

    pub fn saw_predictions_changed(&self) -> bool {
        self.saw(&Ev::PredictionsChanged)
    }
}

impl BufferEvents for Recorder {
    fn on_invalidate(&mut self, from: usize, to: usize) {
        self.0.lock().unwrap().push(Ev::Invalidate(from, to));
    }
    fn on_logit(&mut self, from: usize, to: usize, _logit_minus_max: f32) {
        self.0.lock().unwrap().push(Ev::Logit(from, to));
    }
    fn on_predictions_changed(&mut self) {
        self.0.lock().unwrap().push(Ev::PredictionsChanged);
    }
    fn on_tail_replace(&mut self, from: usize, text: &str) {
        self.0
            .lock()
            .unwrap()
            .push(Ev::TailReplace(from, text.to_string()));
    }
}

pub fn make_buffer() -> (Buffer, Recorder, CallLog) {
    make_buffer_with(Config::default())
}

pub fn make_buffer_with(config: Config) -> (Buffer, Recorder, CallLog) {
    let (vocab, engine, log) = mock::rig();
    let recorder = Recorder::default();
    let buffer = Buffer::new(vocab, engine, config, Box::new(recorder.clone()))
        .expect("mock engine never fails to start");
    (buffer, recorder, log)
}

/// Sum of `str_size` along root→n equals each node's end position.
pub fn assert_path_lengths(buffer: &Buffer) {
    let tree = &buffer.tree;
    let mut cur = Some(tree.root());
    let mut sum = 0usize;
    while let Some(id) = cur {
        let node = tree.get(id);
        if !node.is_accepted {
            break;
        }
        assert_eq!(node.base_pos, sum, "base_pos drifted from path sum");
        sum += node.str_size;
        assert_eq!(node.end_pos(), sum);
        cur = node.selected_child();
    }
}
