use serde::Serialize;

use crate::types::{Stage, TokenChunk};

/// Full output of one stage.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AccumulatedResult {
    pub stage: Stage,
    pub text: String,
    pub chunks: usize,
    pub model: String,
    pub fell_back: bool,
}

/// Tags deltas with their stage and keeps the running text. Request-local.
#[derive(Debug)]
pub struct StageAccumulator {
    stage: Stage,
    model: String,
    fell_back: bool,
    buffer: String,
    chunks: usize,
}

impl StageAccumulator {
    pub fn new(stage: Stage, model: &str, fell_back: bool) -> Self {
        Self {
            stage,
            model: model.to_string(),
            fell_back,
            buffer: String::new(),
            chunks: 0,
        }
    }

    pub fn accept(&mut self, delta: &str) -> Option<TokenChunk> {
        if delta.is_empty() {
            return None;
        }
        self.buffer.push_str(delta);
        self.chunks += 1;
        Some(TokenChunk::new(self.stage, delta))
    }

    pub fn finish(self) -> AccumulatedResult {
        tracing::debug!(
            "[ACCUMULATOR] {} finished: {} chunks, {} chars (model {})",
            self.stage,
            self.chunks,
            self.buffer.len(),
            self.model
        );
        AccumulatedResult {
            stage: self.stage,
            text: self.buffer,
            chunks: self.chunks,
            model: self.model,
            fell_back: self.fell_back,
        }
    }
}
