use crate::domain::errors::InferenceError;
use crate::domain::ports::ProviderChunk;
use serde::Deserialize;

/// Incremental decoder for OpenAI-style `text/event-stream` completions.
///
/// Bytes arrive in arbitrary slices; an event is only decoded once its blank
/// line terminator has been seen, so multi-byte characters and JSON payloads
/// split across reads are reassembled first.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    finished: bool,
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<Choice>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    delta: Delta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once a terminal marker was decoded; later input is ignored
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<ProviderChunk, InferenceError>> {
        if self.finished {
            return Vec::new();
        }
        self.buffer.extend_from_slice(bytes);

        let mut out = Vec::new();
        while let Some((end, skip)) = event_boundary(&self.buffer) {
            let raw: Vec<u8> = self.buffer.drain(..end + skip).take(end).collect();
            self.decode_event(&String::from_utf8_lossy(&raw), &mut out);
            if self.finished {
                self.buffer.clear();
                break;
            }
        }
        out
    }

    /// Decodes whatever is left once the body has ended
    pub fn finish(&mut self) -> Vec<Result<ProviderChunk, InferenceError>> {
        let mut out = Vec::new();
        if !self.finished && !self.buffer.is_empty() {
            let raw = std::mem::take(&mut self.buffer);
            self.decode_event(&String::from_utf8_lossy(&raw), &mut out);
        }
        out
    }

    fn decode_event(&mut self, event: &str, out: &mut Vec<Result<ProviderChunk, InferenceError>>) {
        let data: Vec<&str> = event
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(|d| d.strip_prefix(' ').unwrap_or(d))
            .collect();
        if data.is_empty() {
            // comment or keep-alive
            return;
        }
        let payload = data.join("\n");
        let payload = payload.trim();

        if payload == "[DONE]" {
            self.finished = true;
            out.push(Ok(ProviderChunk::Finished { reason: None }));
            return;
        }

        let chunk: CompletionChunk = match serde_json::from_str(payload) {
            Ok(chunk) => chunk,
            Err(e) => {
                self.finished = true;
                out.push(Err(InferenceError::StreamInterrupted {
                    reason: format!("undecodable event: {}", e),
                }));
                return;
            }
        };

        if let Some(error) = chunk.error {
            self.finished = true;
            out.push(Err(InferenceError::ProviderError {
                reason: error.message,
            }));
            return;
        }

        for choice in chunk.choices {
            if let Some(content) = choice.delta.content {
                if !content.is_empty() {
                    out.push(Ok(ProviderChunk::Delta(content)));
                }
            }
            if let Some(reason) = choice.finish_reason {
                self.finished = true;
                out.push(Ok(ProviderChunk::Finished {
                    reason: Some(reason),
                }));
                return;
            }
        }
    }
}

/// Position of the first event terminator and its length
fn event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n").map(|i| (i, 2));
    let crlf = buffer.windows(4).position(|w| w == b"\r\n\r\n").map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}
