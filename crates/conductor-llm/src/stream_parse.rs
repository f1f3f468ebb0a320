//! Transport-stream parsing shared by the HTTP backends.
//!
//! Backends hand a raw byte stream plus a per-frame extractor to
//! [`sse_chunks`] or [`ndjson_chunks`] and get back a [`ChunkStream`].
//! Byte boundaries never line up with lines (or with UTF-8 code points), so
//! bytes are buffered until a full line is available.

use std::fmt::Display;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Deserialize;

use conductor_core::errors::ProviderError;
use conductor_core::provider::ChunkStream;

/// What a single decoded frame contributes to the chunk stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Skip,
    Done,
}

/// One server-sent event. Multiple `data:` lines are joined with `\n`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE decoder: feed it lines, it yields an event on each blank
/// line that terminates a non-empty event.
#[derive(Default)]
struct SseDecoder {
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    fn push_line(&mut self, line: &str) -> Option<SseEvent> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            return self.flush();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn flush(&mut self) -> Option<SseEvent> {
        if self.event.is_none() && self.data.is_empty() {
            return None;
        }
        Some(SseEvent {
            event: self.event.take(),
            data: std::mem::take(&mut self.data).join("\n"),
        })
    }
}

/// Parse complete SSE text into events. A trailing event without a
/// terminating blank line is still returned.
pub fn parse_sse_lines(raw: &str) -> Vec<SseEvent> {
    let mut decoder = SseDecoder::default();
    let mut events: Vec<SseEvent> = raw.lines().filter_map(|l| decoder.push_line(l)).collect();
    events.extend(decoder.flush());
    events
}

/// Splits a byte stream into lines without corrupting multi-byte characters
/// that straddle chunk boundaries.
#[derive(Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line[..line.len() - 1]).into_owned());
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

fn interrupted(err: impl Display) -> ProviderError {
    ProviderError::StreamInterrupted(err.to_string())
}

/// Turn an SSE byte stream into text chunks. `extract` is applied to the
/// `data` of every event; a literal `[DONE]` payload ends the stream.
pub fn sse_chunks<S, E>(bytes: S, extract: fn(&str) -> Result<Frame, ProviderError>) -> ChunkStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut bytes = Box::pin(bytes);
        let mut lines = LineBuffer::default();
        let mut decoder = SseDecoder::default();
        let mut finished = false;

        while !finished {
            let batch = match bytes.next().await {
                Some(Ok(chunk)) => lines.push(&chunk),
                Some(Err(e)) => {
                    yield Err(interrupted(e));
                    return;
                }
                None => {
                    finished = true;
                    // A final "\n" flushes whatever event is still open.
                    lines.finish().into_iter().chain(Some(String::new())).collect()
                }
            };
            for line in batch {
                let Some(event) = decoder.push_line(&line) else {
                    continue;
                };
                if event.data.trim() == "[DONE]" {
                    return;
                }
                match extract(&event.data) {
                    Ok(Frame::Text(text)) => yield Ok(text),
                    Ok(Frame::Skip) => {}
                    Ok(Frame::Done) => return,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        }
    })
}

/// Turn a newline-delimited JSON byte stream into text chunks. Blank lines
/// are ignored.
pub fn ndjson_chunks<S, E>(
    bytes: S,
    extract: fn(&str) -> Result<Frame, ProviderError>,
) -> ChunkStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut bytes = Box::pin(bytes);
        let mut lines = LineBuffer::default();
        let mut finished = false;

        while !finished {
            let batch = match bytes.next().await {
                Some(Ok(chunk)) => lines.push(&chunk),
                Some(Err(e)) => {
                    yield Err(interrupted(e));
                    return;
                }
                None => {
                    finished = true;
                    lines.finish().into_iter().collect()
                }
            };
            for line in batch {
                if line.trim().is_empty() {
                    continue;
                }
                match extract(line.trim()) {
                    Ok(Frame::Text(text)) => yield Ok(text),
                    Ok(Frame::Skip) => {}
                    Ok(Frame::Done) => return,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        }
    })
}

// --- OpenAI-compatible chat completion chunks ---

#[derive(Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Default, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    message: String,
}

/// Extract the text delta from an OpenAI-style `chat.completion.chunk`.
pub fn openai_delta(data: &str) -> Result<Frame, ProviderError> {
    let chunk: CompletionChunk =
        serde_json::from_str(data).map_err(|e| ProviderError::Parse(e.to_string()))?;
    if let Some(err) = chunk.error {
        return Err(ProviderError::StreamInterrupted(err.message));
    }
    let text: String = chunk
        .choices
        .into_iter()
        .filter_map(|c| c.delta.content)
        .collect();
    Ok(if text.is_empty() {
        Frame::Skip
    } else {
        Frame::Text(text)
    })
}

// --- Ollama /api/chat lines ---

#[derive(Deserialize)]
struct OllamaLine {
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
    error: Option<String>,
}

#[derive(Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
}

/// Extract the text from one Ollama `/api/chat` streaming line.
pub fn ollama_line(line: &str) -> Result<Frame, ProviderError> {
    let parsed: OllamaLine =
        serde_json::from_str(line).map_err(|e| ProviderError::Parse(e.to_string()))?;
    if let Some(err) = parsed.error {
        return Err(ProviderError::StreamInterrupted(err));
    }
    let text = parsed.message.map(|m| m.content).unwrap_or_default();
    match (text.is_empty(), parsed.done) {
        (false, _) => Ok(Frame::Text(text)),
        (true, true) => Ok(Frame::Done),
        (true, false) => Ok(Frame::Skip),
    }
}
