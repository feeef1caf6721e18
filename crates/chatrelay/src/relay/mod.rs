//! Stream relay.
//!
//! Turns the provider's server-sent-event byte stream into a flat stream of
//! text deltas. Unparsable lines are dropped, `data: [DONE]` ends the output
//! immediately, and the output also ends when the upstream stream does.

mod decode;
mod framing;

use std::collections::VecDeque;
use std::pin::Pin;

use bytes::Bytes;
use futures::{Stream, StreamExt, stream};
use serde::{Deserialize, Serialize};

pub use decode::Utf8StreamDecoder;
pub use framing::{ChunkOutput, EventDecoder, FramingMode, LineEvent, parse_line};

/// Relay behaviour for `POST /relay/chat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Stream deltas as they arrive. When false the relay asks upstream for a
    /// buffered completion and answers with a single JSON reply.
    pub stream: bool,
    pub framing: FramingMode,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            stream: true,
            framing: FramingMode::PerChunk,
        }
    }
}

struct RelayState<S> {
    upstream: Pin<Box<S>>,
    decoder: EventDecoder,
    pending: VecDeque<String>,
    closed: bool,
}

/// Relay an upstream event stream as plain text chunks, one per delta.
///
/// An upstream transport error is forwarded once and ends the stream.
pub fn relay_text<S, E>(upstream: S, framing: FramingMode) -> impl Stream<Item = Result<Bytes, E>>
where
    S: Stream<Item = Result<Bytes, E>>,
{
    let state = RelayState {
        upstream: Box::pin(upstream),
        decoder: EventDecoder::new(framing),
        pending: VecDeque::new(),
        closed: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(delta) = state.pending.pop_front() {
                return Some((Ok(Bytes::from(delta)), state));
            }
            if state.closed {
                return None;
            }

            match state.upstream.next().await {
                Some(Ok(chunk)) => {
                    let out = state.decoder.feed(&chunk);
                    state.pending.extend(out.deltas);
                    if out.done {
                        tracing::debug!("upstream signalled end of stream");
                        state.closed = true;
                    }
                }
                Some(Err(err)) => {
                    state.closed = true;
                    return Some((Err(err), state));
                }
                None => {
                    state.closed = true;
                    state.pending.extend(state.decoder.finish().deltas);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    fn chunks(parts: &[&str]) -> impl Stream<Item = Result<Bytes, std::io::Error>> {
        let owned: Vec<Result<Bytes, std::io::Error>> = parts
            .iter()
            .map(|p| Ok(Bytes::from(p.to_string())))
            .collect();
        stream::iter(owned)
    }

    fn collect(
        s: impl Stream<Item = Result<Bytes, std::io::Error>>,
    ) -> Vec<Result<String, String>> {
        block_on(
            s.map(|item| {
                item.map(|b| String::from_utf8(b.to_vec()).unwrap())
                    .map_err(|e| e.to_string())
            })
            .collect(),
        )
    }

    #[test]
    fn test_reconstructs_hello() {
        let upstream = chunks(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"He\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"llo\"}}]}\n\n",
            "data: [DONE]\n\n",
        ]);
        let out = collect(relay_text(upstream, FramingMode::PerChunk));
        assert_eq!(out, vec![Ok("He".to_string()), Ok("llo".to_string())]);
    }

    #[test]
    fn test_done_closes_before_upstream_ends() {
        let upstream = chunks(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\ndata: [DONE]\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"never\"}}]}\n",
        ]);
        let out = collect(relay_text(upstream, FramingMode::PerChunk));
        assert_eq!(out, vec![Ok("a".to_string())]);
    }

    #[test]
    fn test_malformed_json_is_skipped() {
        let upstream = chunks(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n",
            "data: {broken\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"y\"}}]}\n",
        ]);
        let out = collect(relay_text(upstream, FramingMode::PerChunk));
        assert_eq!(out, vec![Ok("x".to_string()), Ok("y".to_string())]);
    }

    #[test]
    fn test_ends_without_done_marker() {
        let upstream = chunks(&["data: {\"choices\":[{\"delta\":{\"content\":\"z\"}}]}\n"]);
        let out = collect(relay_text(upstream, FramingMode::PerChunk));
        assert_eq!(out, vec![Ok("z".to_string())]);
    }

    #[test]
    fn test_upstream_error_is_forwarded_once() {
        let upstream = stream::iter(vec![
            Ok(Bytes::from_static(
                b"data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n",
            )),
            Err(std::io::Error::other("reset")),
            Ok(Bytes::from_static(
                b"data: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n",
            )),
        ]);
        let out = collect(relay_text(upstream, FramingMode::PerChunk));
        assert_eq!(out, vec![Ok("ok".to_string()), Err("reset".to_string())]);
    }
}
