//! Single-line SSE frame decoding for OpenAI-compatible completion streams.

use crate::constants::{DONE_SENTINEL, SSE_DATA_PREFIX};
use crate::specs::openai::{ProviderError, StreamPulse};
use crate::types::Usage;

/// Classification of one line of a streamed completion body.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameEvent {
    /// Content of `choices[0].delta.content`. May be empty.
    Delta { content: String, usage: Option<Usage> },
    Done,
    ProviderError(String),
    /// Blank line, `:` comment, or a non-`data` field.
    Keepalive,
    /// A `data:` frame that could not be decoded. Recovered, never raised.
    Malformed(String),
}

fn data_payload(line: &str) -> Option<&str> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let rest = line.strip_prefix(SSE_DATA_PREFIX)?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

pub fn parse_frame(line: &str) -> FrameEvent {
    let Some(data) = data_payload(line) else {
        return FrameEvent::Keepalive;
    };
    if data.trim() == DONE_SENTINEL {
        return FrameEvent::Done;
    }
    if data.trim().is_empty() {
        return FrameEvent::Keepalive;
    }

    // Error frames first: they carry an "error" key and no choices
    if let Ok(err) = serde_json::from_str::<ProviderError>(data) {
        return FrameEvent::ProviderError(err.error.message);
    }

    match serde_json::from_str::<StreamPulse>(data) {
        Ok(pulse) => {
            let content = pulse
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.delta.content)
                .unwrap_or_default();
            FrameEvent::Delta {
                content,
                usage: pulse.usage,
            }
        }
        Err(e) => FrameEvent::Malformed(e.to_string()),
    }
}

/// Text delta of a frame, or `""` for anything that is not a content frame.
pub fn extract_delta(line: &str) -> String {
    match parse_frame(line) {
        FrameEvent::Delta { content, .. } => content,
        _ => String::new(),
    }
}
