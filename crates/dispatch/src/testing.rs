//! Test doubles for exercising a process group without model weights

use std::sync::Arc;
use std::time::Duration;

use lockstep_protocol::{Alternative, GenerationParams, TokenEvent};
use parking_lot::Mutex;

use crate::engine::{GenerationEngine, TokenSequence};
use crate::error::EngineError;
use crate::group::Rank;

/// Something an engine did, tagged with the rank that did it
#[derive(Debug, Clone, PartialEq)]
pub enum JournalEntry {
    Started { label: Rank, params: GenerationParams },
    Finished { label: Rank, prompt: String, tokens: u32 },
    Failed { label: Rank, prompt: String, at: usize },
}

impl JournalEntry {
    pub fn label(&self) -> Rank {
        match self {
            Self::Started { label, .. } | Self::Finished { label, .. } | Self::Failed { label, .. } => *label,
        }
    }

    pub fn prompt(&self) -> &str {
        match self {
            Self::Started { params, .. } => &params.prompt,
            Self::Finished { prompt, .. } | Self::Failed { prompt, .. } => prompt,
        }
    }
}

/// Shared, append-only record of engine activity across ranks
#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<JournalEntry>>>,
}

impl Journal {
    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries.lock().clone()
    }

    fn push(&self, entry: JournalEntry) {
        self.entries.lock().push(entry);
    }
}

/// Engine that replays a fixed list of `(text, probability)` tokens
#[derive(Debug, Clone)]
pub struct ScriptedEngine {
    script: Vec<(String, f32)>,
    fail_at: Option<usize>,
    fail_prompt: Option<String>,
    delay: Duration,
    journal: Option<(Rank, Journal)>,
}

impl ScriptedEngine {
    pub fn new<S: Into<String>>(script: impl IntoIterator<Item = (S, f32)>) -> Self {
        Self {
            script: script.into_iter().map(|(text, p)| (text.into(), p)).collect(),
            fail_at: None,
            fail_prompt: None,
            delay: Duration::ZERO,
            journal: None,
        }
    }

    /// Yield an error instead of the token at `index`
    pub fn failing_at(mut self, index: usize) -> Self {
        self.fail_at = Some(index);
        self
    }

    /// Restrict the failure to calls with this prompt
    pub fn only_for_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.fail_prompt = Some(prompt.into());
        self
    }

    /// Sleep before producing each token
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_journal(mut self, label: Rank, journal: Journal) -> Self {
        self.journal = Some((label, journal));
        self
    }
}

impl GenerationEngine for ScriptedEngine {
    fn generate(&self, params: &GenerationParams) -> Result<TokenSequence, EngineError> {
        if let Some((label, journal)) = &self.journal {
            journal.push(JournalEntry::Started {
                label: *label,
                params: params.clone(),
            });
        }

        let fail_at = match &self.fail_prompt {
            Some(prompt) if *prompt != params.prompt => None,
            _ => self.fail_at,
        };
        let limit = self.script.len().min(params.max_gen_len as usize);

        Ok(Box::new(ScriptedSequence {
            tokens: self.script[..limit].to_vec(),
            position: 0,
            fail_at,
            delay: self.delay,
            prompt: params.prompt.clone(),
            journal: self.journal.clone(),
            done: false,
        }))
    }
}

struct ScriptedSequence {
    tokens: Vec<(String, f32)>,
    position: usize,
    fail_at: Option<usize>,
    delay: Duration,
    prompt: String,
    journal: Option<(Rank, Journal)>,
    done: bool,
}

impl ScriptedSequence {
    fn record(&self, entry: impl FnOnce(Rank, String) -> JournalEntry) {
        if let Some((label, journal)) = &self.journal {
            journal.push(entry(*label, self.prompt.clone()));
        }
    }
}

impl Iterator for ScriptedSequence {
    type Item = Result<TokenEvent, EngineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let at = self.position;
        if self.fail_at == Some(at) {
            self.done = true;
            self.record(|label, prompt| JournalEntry::Failed { label, prompt, at });
            return Some(Err(EngineError::Generation(format!("scripted failure at token {at}"))));
        }

        let Some((text, probability)) = self.tokens.get(at).cloned() else {
            self.done = true;
            let tokens = at as u32;
            self.record(|label, prompt| JournalEntry::Finished { label, prompt, tokens });
            return None;
        };

        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.position += 1;
        Some(Ok(TokenEvent::new(at as u32, text.clone(), probability, 0)
            .with_alternatives([Alternative(text, probability)])))
    }
}
