#![cfg(test)]
//! Deterministic toy engine: 26 letters plus space, greedy preference a
//! fixed function of the consumed prefix, and a KV "cache" that is just the
//! prefix itself (so snapshot save/load is honest). Every call lands in a
//! shared log the tests can assert on.

use std::sync::{Arc, Mutex};

use super::{BatchItem, Engine, EngineError, PassOutput, Snapshot, Token, Vocab};

pub const SPACE: Token = Token(26);
pub const BOS: Token = Token(27);
pub const VOCAB_SIZE: usize = 28;

pub fn letter(c: char) -> Token {
    Token(c as i32 - 'a' as i32)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Forward { len: usize },
    Save,
    Load,
}

pub type CallLog = Arc<Mutex<Vec<Call>>>;

pub struct MockVocab;

impl Vocab for MockVocab {
    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<Token>, EngineError> {
        let mut out = Vec::new();
        if add_bos {
            out.push(BOS);
        }
        for ch in text.chars() {
            match ch {
                'a'..='z' => out.push(letter(ch)),
                ' ' => out.push(SPACE),
                _ => {
                    return Err(EngineError::Tokenize(format!("unmappable char {ch:?}")));
                }
            }
        }
        Ok(out)
    }

    fn detokenize(&self, tok: Token, _render_specials: bool) -> Vec<u8> {
        match tok {
            BOS => Vec::new(),
            SPACE => vec![b' '],
            Token(i) if (0..26).contains(&i) => vec![b'a' + i as u8],
            _ => Vec::new(),
        }
    }

    fn vocab_size(&self) -> usize {
        VOCAB_SIZE
    }

    fn bos_token(&self) -> Token {
        BOS
    }
}

/// Index of the letter the mock prefers after this prefix.
pub fn preferred(cells: &[Token]) -> usize {
    let mut sum = 0usize;
    let mut count = 0usize;
    let mut last = 0usize;
    for t in cells {
        if (0..26).contains(&t.0) {
            sum += t.0 as usize;
            count += 1;
            last = t.0 as usize;
        }
    }
    (5 * last + 3 * sum + count) % 26
}

/// Logits after consuming `cells`: the preferred letter scores 0, each step
/// away one less; space and BOS never win.
pub fn logits_after(cells: &[Token]) -> Vec<f32> {
    let pref = preferred(cells);
    let mut row = vec![-90.0f32; VOCAB_SIZE];
    for (v, slot) in row.iter_mut().enumerate().take(26) {
        *slot = -(((v + 26 - pref) % 26) as f32);
    }
    row[SPACE.0 as usize] = -40.0;
    row[BOS.0 as usize] = -80.0;
    row
}

pub struct MockEngine {
    cells: Vec<Token>,
    log: CallLog,
}

impl Engine for MockEngine {
    fn forward(&mut self, batch: &[BatchItem]) -> Result<PassOutput, EngineError> {
        self.log
            .lock()
            .unwrap()
            .push(Call::Forward { len: batch.len() });
        let mut rows: Vec<Option<Vec<f32>>> = vec![None; batch.len()];
        for (i, it) in batch.iter().enumerate() {
            if it.pos > self.cells.len() {
                return Err(EngineError::Pass(format!(
                    "position gap: {} past {}",
                    it.pos,
                    self.cells.len()
                )));
            }
            self.cells.truncate(it.pos);
            self.cells.push(it.tok);
            if it.logits {
                rows[i] = Some(logits_after(&self.cells));
            }
        }
        Ok(PassOutput { rows })
    }

    fn state_size(&self) -> usize {
        4 + 4 * self.cells.len()
    }

    fn save_state(&mut self) -> Result<Snapshot, EngineError> {
        self.log.lock().unwrap().push(Call::Save);
        let mut buf = Vec::with_capacity(self.state_size());
        buf.extend((self.cells.len() as u32).to_le_bytes());
        for t in &self.cells {
            buf.extend(t.0.to_le_bytes());
        }
        Ok(buf.into())
    }

    fn load_state(&mut self, snap: &Snapshot) -> Result<(), EngineError> {
        self.log.lock().unwrap().push(Call::Load);
        let bytes: &[u8] = snap;
        if bytes.len() < 4 {
            return Err(EngineError::State("truncated snapshot".to_string()));
        }
        let count = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        if bytes.len() != 4 + 4 * count {
            return Err(EngineError::State("snapshot size mismatch".to_string()));
        }
        self.cells = bytes[4..]
            .chunks_exact(4)
            .map(|c| Token(i32::from_le_bytes([c[0], c[1], c[2], c[3]])))
            .collect();
        Ok(())
    }
}

/// A fresh vocab/engine pair with a shared call log.
pub fn rig() -> (Arc<MockVocab>, Box<MockEngine>, CallLog) {
    let log = CallLog::default();
    let engine = MockEngine {
        cells: Vec::new(),
        log: log.clone(),
    };
    (Arc::new(MockVocab), Box::new(engine), log)
}
