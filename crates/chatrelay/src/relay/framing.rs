//! Server-sent-event line framing for streamed completions.

use serde::{Deserialize, Serialize};

use crate::upstream::StreamChunk;

const DATA_PREFIX: &str = "data:";
const DONE_MARKER: &str = "[DONE]";

/// How transport chunks are split into event lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FramingMode {
    /// Each transport chunk is split on its own. A line cut across two
    /// chunks is parsed as two fragments and its delta is usually lost.
    #[default]
    PerChunk,
    /// An unterminated trailing line is carried into the next chunk.
    Buffered,
}

/// Outcome of one event line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEvent {
    Delta(String),
    Done,
    Skip,
}

/// Classify a single line of the event stream.
pub fn parse_line(line: &str) -> LineEvent {
    let line = line.trim();
    let Some(data) = line.strip_prefix(DATA_PREFIX) else {
        return LineEvent::Skip;
    };
    let data = data.trim();
    if data == DONE_MARKER {
        return LineEvent::Done;
    }

    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => chunk.first_delta().map_or(LineEvent::Skip, LineEvent::Delta),
        Err(err) => {
            tracing::trace!(error = %err, "dropping unparsable event line");
            LineEvent::Skip
        }
    }
}

/// Deltas extracted from one transport chunk.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChunkOutput {
    pub deltas: Vec<String>,
    /// `[DONE]` was seen; anything after it in the chunk was discarded.
    pub done: bool,
}

/// Stateful splitter turning transport chunks into text deltas.
#[derive(Debug, Default)]
pub struct EventDecoder {
    mode: FramingMode,
    carry: Vec<u8>,
    done: bool,
}

impl EventDecoder {
    pub fn new(mode: FramingMode) -> Self {
        Self {
            mode,
            carry: Vec::new(),
            done: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Process one transport chunk.
    pub fn feed(&mut self, chunk: &[u8]) -> ChunkOutput {
        if self.done {
            return ChunkOutput {
                deltas: Vec::new(),
                done: true,
            };
        }

        match self.mode {
            FramingMode::PerChunk => {
                let text = String::from_utf8_lossy(chunk);
                self.scan(text.split('\n'))
            }
            FramingMode::Buffered => {
                self.carry.extend_from_slice(chunk);
                let Some(last_newline) = self.carry.iter().rposition(|b| *b == b'\n') else {
                    return ChunkOutput::default();
                };
                let complete: Vec<u8> = self.carry.drain(..=last_newline).collect();
                let text = String::from_utf8_lossy(&complete);
                self.scan(text.split('\n'))
            }
        }
    }

    /// Flush a trailing unterminated line at end of stream.
    pub fn finish(&mut self) -> ChunkOutput {
        if self.done || self.carry.is_empty() {
            return ChunkOutput {
                deltas: Vec::new(),
                done: self.done,
            };
        }
        let rest = std::mem::take(&mut self.carry);
        let text = String::from_utf8_lossy(&rest);
        self.scan(std::iter::once(text.as_ref()))
    }

    fn scan<'a>(&mut self, lines: impl Iterator<Item = &'a str>) -> ChunkOutput {
        let mut out = ChunkOutput::default();
        for line in lines {
            match parse_line(line) {
                LineEvent::Delta(delta) => out.deltas.push(delta),
                LineEvent::Done => {
                    self.done = true;
                    self.carry.clear();
                    out.done = true;
                    break;
                }
                LineEvent::Skip => {}
            }
        }
        out
    }
}
