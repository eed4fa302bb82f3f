//! Generation engine interface
//!
//! The engine is the sharded model itself. Every rank owns one instance and
//! calls it with the same [`GenerationParams`] in the same round; the
//! tensor-parallel collectives inside the engine only line up when they do.

use std::path::PathBuf;

use lockstep_protocol::{Alternative, GenerationParams, TokenEvent};

use crate::error::EngineError;

/// Lazy, finite, non-restartable sequence of token events
pub type TokenSequence = Box<dyn Iterator<Item = Result<TokenEvent, EngineError>> + Send>;

/// A sharded text generator.
///
/// `generate` and the returned sequence run on blocking threads. Only one
/// call is ever active per rank at a time.
pub trait GenerationEngine: Send + Sync + 'static {
    fn generate(&self, params: &GenerationParams) -> Result<TokenSequence, EngineError>;
}

/// Startup settings handed to the engine unchanged
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory holding the checkpoint shards
    pub ckpt_dir: Option<PathBuf>,
    /// Tokenizer model file
    pub tokenizer_path: Option<PathBuf>,
    /// Maximum sequence length (prompt + generation)
    pub max_seq_len: usize,
    /// Maximum batch size
    pub max_batch_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ckpt_dir: None,
            tokenizer_path: None,
            max_seq_len: 2048,
            max_batch_size: 1,
        }
    }
}

/// Vocabulary size used to derive stable token ids for echoed words
const ECHO_VOCAB_SIZE: u32 = 32_000;

/// Deterministic stand-in engine: replays the prompt's whitespace-separated
/// words as tokens, capped by `max_gen_len` and `max_seq_len`.
///
/// Sampling parameters are accepted and ignored. Every rank produces the
/// same sequence, which makes it usable for exercising the group without
/// model weights.
#[derive(Debug, Clone, Default)]
pub struct EchoEngine {
    config: EngineConfig,
}

impl EchoEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl GenerationEngine for EchoEngine {
    fn generate(&self, params: &GenerationParams) -> Result<TokenSequence, EngineError> {
        let limit = (params.max_gen_len as usize).min(self.config.max_seq_len);

        let events: Vec<TokenEvent> = params
            .prompt
            .split_whitespace()
            .take(limit)
            .enumerate()
            .map(|(i, word)| {
                let text = if i == 0 {
                    word.to_string()
                } else {
                    format!(" {word}")
                };
                TokenEvent::new(echo_token_id(word), text.clone(), 1.0, 0)
                    .with_alternatives([Alternative(text, 1.0)])
            })
            .collect();

        Ok(Box::new(events.into_iter().map(Ok)))
    }
}

fn echo_token_id(word: &str) -> u32 {
    word.bytes()
        .fold(0u32, |h, b| h.wrapping_mul(31).wrapping_add(b as u32))
        % ECHO_VOCAB_SIZE
}
