//! Inference engine contract, split at llama.cpp's model/context seam:
//! `Vocab` is the immutable tokenizer side (shareable, always available to the
//! editor thread), `Engine` is the mutable KV-cache side (moved wholesale to a
//! worker thread for the duration of one forward pass).

use std::sync::Arc;

pub mod intuition;
pub mod llama;
pub mod mock;

/// Opaque serialized KV-cache state, taken before a given prefix position.
/// Cheap to share; many tree nodes may hold the same capture.
pub type Snapshot = Arc<[u8]>;

/// Vocabulary index of one token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub i32);

/// One slot of a forward batch: a token consumed at a context position,
/// optionally asking for the logits produced *after* it.
#[derive(Debug, Clone, Copy)]
pub struct BatchItem {
    pub tok: Token,
    pub pos: usize,
    pub logits: bool,
}

/// Per-position logit rows of one pass; `Some` only where requested.
#[derive(Debug, Default)]
pub struct PassOutput {
    pub rows: Vec<Option<Vec<f32>>>,
}

impl PassOutput {
    pub fn row(&self, idx: usize) -> Option<&[f32]> {
        self.rows.get(idx).and_then(|r| r.as_deref())
    }

    /// The row of the final batch position.
    pub fn last_row(&self) -> Option<&[f32]> {
        self.rows.last().and_then(|r| r.as_deref())
    }
}

#[derive(Debug)]
pub enum EngineError {
    ModelLoad(String),
    Tokenize(String),
    Pass(String),
    State(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::ModelLoad(e) => write!(f, "model load failed: {e}"),
            EngineError::Tokenize(e) => write!(f, "tokenization failed: {e}"),
            EngineError::Pass(e) => write!(f, "forward pass failed: {e}"),
            EngineError::State(e) => write!(f, "state transfer failed: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

/// Tokenizer side of the model. Immutable after load.
pub trait Vocab: Send + Sync {
    /// Deterministic text-to-token mapping.
    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<Token>, EngineError>;

    /// Byte piece a token renders as. Need not be valid UTF-8 in isolation.
    fn detokenize(&self, tok: Token, render_specials: bool) -> Vec<u8>;

    fn vocab_size(&self) -> usize;

    fn bos_token(&self) -> Token;
}

/// Stateful side of the model: one KV cache, advanced by `forward` and
/// rewound by snapshot transfer.
pub trait Engine: Send {
    /// Consume `batch` in order, returning logit rows where requested.
    fn forward(&mut self, batch: &[BatchItem]) -> Result<PassOutput, EngineError>;

    /// Serialized size of the full cache state.
    fn state_size(&self) -> usize;

    fn save_state(&mut self) -> Result<Snapshot, EngineError>;

    fn load_state(&mut self, snap: &Snapshot) -> Result<(), EngineError>;
}

/// Basic facts about a loaded model, for the status line.
#[derive(Debug, Clone, Default)]
pub struct ModelInfo {
    pub path: String,
    pub architecture: String,
    pub size_label: String,
    pub n_ctx: u32,
}
