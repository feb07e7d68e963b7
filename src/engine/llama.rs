//! Production engine over llama.cpp. The model is loaded once with full GPU
//! offload; one long-lived context carries the KV cache between passes.

use std::num::NonZeroU32;
use std::sync::Arc;

use gg::context::LlamaContext;
use gg::context::params::LlamaContextParams;
use gg::llama_backend::LlamaBackend;
use gg::llama_batch::LlamaBatch;
use gg::model::params::LlamaModelParams;
use gg::model::{AddBos, LlamaModel, Special};
use gg::token::LlamaToken;

use super::intuition::{pick_n_ctx_by_vram, vram_free_bytes};
use super::{BatchItem, Engine, EngineError, ModelInfo, PassOutput, Snapshot, Token, Vocab};

/// Everything `load` produces: the two engine halves plus display metadata.
pub struct LlamaRig {
    pub vocab: Arc<LlamaVocab>,
    pub engine: Box<LlamaEngine>,
    pub info: ModelInfo,
}

pub struct LlamaVocab {
    model: Arc<LlamaModel>,
    _backend: Arc<LlamaBackend>,
    n_vocab: usize,
    bos: Token,
}

pub struct LlamaEngine {
    // Declaration order matters: the context must drop before the model and
    // backend it was transmuted to borrow for `'static`.
    ctx: LlamaContext<'static>,
    _model: Arc<LlamaModel>,
    _backend: Arc<LlamaBackend>,
}

// Safety: the context is only ever driven by one thread at a time — the
// buffer hands the engine to a worker by value for the duration of a pass and
// takes it back through a channel. The `'static` borrow it holds points into
// the `Arc`s stored alongside it, which outlive it by field order.
unsafe impl Send for LlamaEngine {}

/// Load the model (GPU layers enabled) and build both engine halves.
pub fn load(model_path: &str) -> Result<LlamaRig, EngineError> {
    let backend = LlamaBackend::init().map_err(|e| EngineError::ModelLoad(e.to_string()))?;
    let backend = Arc::new(backend);

    let model_params = LlamaModelParams::default().with_n_gpu_layers(u32::MAX);
    let model = LlamaModel::load_from_file(&backend, model_path, &model_params)
        .map_err(|e| EngineError::ModelLoad(e.to_string()))?;
    let model = Arc::new(model);

    let architecture = model
        .meta_val_str("general.architecture")
        .unwrap_or_default();
    let size_label = model.meta_val_str("general.size_label").unwrap_or_default();

    let num_threads = std::thread::available_parallelism()
        .ok()
        .map(|n| n.get())
        .unwrap_or(1);

    let n_ctx = vram_free_bytes()
        .map(|free| pick_n_ctx_by_vram(&model, free))
        .unwrap_or_else(|| {
            NonZeroU32::new(2_048.min(model.n_ctx_train().max(1))).unwrap_or(NonZeroU32::MIN)
        });

    let batch_cap = 512;
    let ctx_params = LlamaContextParams::default()
        .with_n_ctx(Some(n_ctx))
        .with_n_threads(num_threads as i32)
        .with_n_threads_batch(num_threads as i32)
        .with_n_batch(batch_cap)
        .with_n_ubatch(batch_cap);

    let ctx = {
        // Safety: the borrow is extended to `'static` only so the context can
        // live in the same struct as its model. `LlamaEngine` keeps the model
        // `Arc` alive for at least as long as the context, and the `Arc`'s
        // heap allocation never moves.
        let model_ref: &'static LlamaModel = unsafe { std::mem::transmute(model.as_ref()) };
        model_ref
            .new_context(&backend, ctx_params)
            .map_err(|e| EngineError::ModelLoad(e.to_string()))?
    };

    let info = ModelInfo {
        path: model_path.to_string(),
        architecture,
        size_label,
        n_ctx: ctx.n_ctx(),
    };
    tracing::info!(
        model = %info.path,
        arch = %info.architecture,
        size = %info.size_label,
        n_ctx = info.n_ctx,
        "model loaded"
    );

    let vocab = Arc::new(LlamaVocab {
        model: model.clone(),
        _backend: backend.clone(),
        n_vocab: model.n_vocab().max(0) as usize,
        bos: Token(model.token_bos().0),
    });
    let engine = Box::new(LlamaEngine {
        ctx,
        _model: model,
        _backend: backend,
    });

    Ok(LlamaRig {
        vocab,
        engine,
        info,
    })
}

impl Vocab for LlamaVocab {
    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<Token>, EngineError> {
        let add = if add_bos { AddBos::Always } else { AddBos::Never };
        let toks = self
            .model
            .str_to_token(text, add)
            .map_err(|e| EngineError::Tokenize(e.to_string()))?;
        Ok(toks.into_iter().map(|t| Token(t.0)).collect())
    }

    fn detokenize(&self, tok: Token, render_specials: bool) -> Vec<u8> {
        let special = if render_specials {
            Special::Tokenize
        } else {
            Special::Plaintext
        };
        self.model
            .token_to_bytes(LlamaToken::new(tok.0), special)
            .unwrap_or_default()
    }

    fn vocab_size(&self) -> usize {
        self.n_vocab
    }

    fn bos_token(&self) -> Token {
        self.bos
    }
}

impl Engine for LlamaEngine {
    fn forward(&mut self, batch: &[BatchItem]) -> Result<PassOutput, EngineError> {
        let mut b = LlamaBatch::new(batch.len().max(1), 1);
        for it in batch {
            b.add(LlamaToken::new(it.tok.0), it.pos as i32, &[0], it.logits)
                .map_err(|e| EngineError::Pass(e.to_string()))?;
        }

        // Evict any cells at or beyond the first new position; they belong to
        // a path this pass is diverging from.
        if let Some(first) = batch.first() {
            self.ctx
                .clear_kv_cache_seq(Some(0), Some(first.pos as u32), None)
                .map_err(|e| EngineError::Pass(e.to_string()))?;
        }

        self.ctx
            .decode(&mut b)
            .map_err(|e| EngineError::Pass(e.to_string()))?;

        let mut rows: Vec<Option<Vec<f32>>> = vec![None; batch.len()];
        for (i, it) in batch.iter().enumerate() {
            if it.logits {
                rows[i] = Some(self.ctx.get_logits_ith(i as i32).to_vec());
            }
        }
        Ok(PassOutput { rows })
    }

    fn state_size(&self) -> usize {
        self.ctx.get_state_size()
    }

    fn save_state(&mut self) -> Result<Snapshot, EngineError> {
        let size = self.ctx.get_state_size();
        let mut buf = vec![0u8; size];
        // Safety: `buf` was sized by `get_state_size` just above.
        let copied = unsafe { self.ctx.copy_state_data(buf.as_mut_ptr()) };
        if copied > size {
            return Err(EngineError::State(format!(
                "state overflow: {copied} > {size}"
            )));
        }
        buf.truncate(copied);
        Ok(buf.into())
    }

    fn load_state(&mut self, snap: &Snapshot) -> Result<(), EngineError> {
        // Safety: the snapshot was produced by `copy_state_data` on a context
        // of the same model and parameters.
        let read = unsafe { self.ctx.set_state_data(snap) };
        if read == 0 {
            return Err(EngineError::State("state rejected".to_string()));
        }
        Ok(())
    }
}
