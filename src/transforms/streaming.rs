//! Completion stream transcoding.
//!
//! Turns the upstream `chat.completion.chunk` SSE stream into a plain byte
//! stream of text deltas. Each delta is yielded as soon as its frame is
//! complete, and the upstream body is only polled when the caller polls, so a
//! slow reader stalls the upstream read instead of growing a buffer.

use async_stream::stream;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use std::io;

use super::sse::{SseDecoder, StreamEvent};
use crate::constants::DONE_SENTINEL;
use crate::error::ProxyError;

// ============================================================================
// Upstream chunk types
// ============================================================================

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
}

/// What a single event contributes to the output.
#[derive(Debug, PartialEq, Eq)]
enum Decoded {
    Delta(String),
    Skip,
    Done,
}

fn decode_event(event: &StreamEvent) -> Result<Decoded, ProxyError> {
    let StreamEvent::Event { data, .. } = event else {
        return Ok(Decoded::Skip);
    };

    if data.trim() == DONE_SENTINEL {
        return Ok(Decoded::Done);
    }

    let chunk: CompletionChunk = serde_json::from_str(data)
        .map_err(|e| ProxyError::StreamDecodeError(e.to_string()))?;

    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .filter(|text| !text.is_empty())
        .map_or(Decoded::Skip, Decoded::Delta))
}

/// Logs when the stream is dropped before reaching a terminal state, which
/// happens when the caller disconnects. Dropping the generator also drops the
/// upstream body and closes that connection.
struct DisconnectGuard {
    finished: bool,
    deltas: usize,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if !self.finished {
            tracing::debug!(
                deltas = self.deltas,
                "Client disconnected mid-stream, closing upstream connection"
            );
        }
    }
}

// ============================================================================
// Stream Transformation
// ============================================================================

/// Transcode an upstream SSE body into raw text deltas.
///
/// Ends cleanly on `[DONE]` or upstream EOF. A malformed event payload or an
/// upstream transport error yields one `Err` item and ends the stream, which
/// aborts the response body the caller is reading.
pub fn transcode<S, E>(body: S) -> impl Stream<Item = Result<Bytes, io::Error>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    stream! {
        let mut body = std::pin::pin!(body);
        let mut decoder = SseDecoder::new();
        let mut upstream_ended = false;
        let mut guard = DisconnectGuard { finished: false, deltas: 0 };

        loop {
            let event = if let Some(event) = decoder.next_event() {
                event
            } else if upstream_ended {
                match decoder.finish() {
                    Some(event) => event,
                    None => break,
                }
            } else {
                match body.next().await {
                    Some(Ok(chunk)) => {
                        decoder.push(&chunk);
                        continue;
                    }
                    Some(Err(e)) => {
                        tracing::warn!("Upstream stream failed: {e}");
                        guard.finished = true;
                        yield Err(io::Error::other(e));
                        return;
                    }
                    None => {
                        upstream_ended = true;
                        continue;
                    }
                }
            };

            match decode_event(&event) {
                Ok(Decoded::Delta(text)) => {
                    guard.deltas += 1;
                    yield Ok(Bytes::from(text));
                }
                Ok(Decoded::Skip) => {}
                Ok(Decoded::Done) => break,
                Err(e) => {
                    tracing::warn!("Aborting stream: {e}");
                    guard.finished = true;
                    yield Err(io::Error::other(e));
                    return;
                }
            }
        }

        guard.finished = true;
        tracing::debug!(deltas = guard.deltas, "Completion stream finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn chunks(parts: &[&str]) -> impl Stream<Item = Result<Bytes, io::Error>> + Send + 'static {
        let owned: Vec<Result<Bytes, io::Error>> = parts
            .iter()
            .map(|p| Ok(Bytes::from(p.to_string())))
            .collect();
        stream::iter(owned)
    }

    fn delta_frame(text: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({"choices": [{"index": 0, "delta": {"content": text}}]})
        )
    }

    /// Collects output bytes and whether the stream ended with an error.
    async fn run(
        body: impl Stream<Item = Result<Bytes, io::Error>> + Send + 'static,
    ) -> (String, bool) {
        let mut out = Box::pin(transcode(body));
        let mut text = String::new();
        let mut errored = false;
        while let Some(item) = out.next().await {
            match item {
                Ok(bytes) => {
                    assert!(!errored, "bytes emitted after error");
                    text.push_str(std::str::from_utf8(&bytes).unwrap());
                }
                Err(_) => errored = true,
            }
        }
        (text, errored)
    }

    #[tokio::test]
    async fn test_deltas_concatenate_and_done_closes() {
        let frames = [
            r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#.to_string() + "\n\n",
            r#"data: {"choices":[{"delta":{"content":" there"}}]}"#.to_string() + "\n\n",
            "data: [DONE]\n\n".to_string(),
        ];
        let parts: Vec<&str> = frames.iter().map(String::as_str).collect();
        let (text, errored) = run(chunks(&parts)).await;
        assert_eq!(text, "Hi there");
        assert!(!errored);
    }

    #[tokio::test]
    async fn test_malformed_json_aborts() {
        let parts = [
            delta_frame("ok"),
            "data: {not json\n\n".to_string(),
            delta_frame("never"),
        ];
        let refs: Vec<&str> = parts.iter().map(String::as_str).collect();
        let (text, errored) = run(chunks(&refs)).await;
        assert_eq!(text, "ok");
        assert!(errored);
    }

    #[tokio::test]
    async fn test_single_malformed_event_emits_nothing() {
        let (text, errored) = run(chunks(&["data: {oops}\n\n"])).await;
        assert_eq!(text, "");
        assert!(errored);
    }

    #[tokio::test]
    async fn test_frames_split_across_chunks_keep_order() {
        let joined = format!(
            "{}{}{}data: [DONE]\n\n",
            delta_frame("a"),
            delta_frame("é"),
            delta_frame("c")
        );
        let bytes = joined.as_bytes();
        // three-byte chunks split frames and the multi-byte character
        let owned: Vec<Result<Bytes, io::Error>> = bytes
            .chunks(3)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        let (text, errored) = run(stream::iter(owned)).await;
        assert_eq!(text, "aéc");
        assert!(!errored);
    }

    #[tokio::test]
    async fn test_role_and_empty_deltas_skipped() {
        let parts = [
            r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#.to_string() + "\n\n",
            delta_frame(""),
            delta_frame("x"),
            r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}]}"#.to_string() + "\n\n",
        ];
        let refs: Vec<&str> = parts.iter().map(String::as_str).collect();
        let (text, errored) = run(chunks(&refs)).await;
        assert_eq!(text, "x");
        assert!(!errored);
    }

    #[tokio::test]
    async fn test_nothing_after_done() {
        let parts = [delta_frame("a"), "data: [DONE]\n\n".to_string(), delta_frame("b")];
        let refs: Vec<&str> = parts.iter().map(String::as_str).collect();
        let (text, _) = run(chunks(&refs)).await;
        assert_eq!(text, "a");
    }

    #[tokio::test]
    async fn test_upstream_error_aborts() {
        let items: Vec<Result<Bytes, io::Error>> = vec![
            Ok(Bytes::from(delta_frame("partial"))),
            Err(io::Error::other("connection reset")),
        ];
        let (text, errored) = run(stream::iter(items)).await;
        assert_eq!(text, "partial");
        assert!(errored);
    }

    #[tokio::test]
    async fn test_eof_without_done_closes_cleanly() {
        let first = delta_frame("tail");
        let (text, errored) = run(chunks(&[first.trim_end()])).await;
        assert_eq!(text, "tail");
        assert!(!errored);
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    /// Endless upstream producing one delta frame per chunk.
    fn endless(
        flag: DropFlag,
        produced: Arc<AtomicUsize>,
    ) -> impl Stream<Item = Result<Bytes, io::Error>> + Send + 'static {
        stream::unfold((flag, produced), |(flag, produced)| async move {
            let n = produced.fetch_add(1, Ordering::SeqCst);
            let chunk = Bytes::from(delta_frame(&format!("t{n}")));
            Some((Ok::<_, io::Error>(chunk), (flag, produced)))
        })
    }

    #[tokio::test]
    async fn test_drop_releases_upstream_body() {
        let dropped = Arc::new(AtomicBool::new(false));
        let source = endless(DropFlag(dropped.clone()), Arc::new(AtomicUsize::new(0)));

        let mut out = Box::pin(transcode(source));
        let first = out.next().await.unwrap().unwrap();
        assert_eq!(first, Bytes::from_static(b"t0"));
        assert!(!dropped.load(Ordering::SeqCst));

        drop(out);
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_upstream_read_only_as_far_as_consumer_pulls() {
        let produced = Arc::new(AtomicUsize::new(0));
        let source = endless(DropFlag(Arc::new(AtomicBool::new(false))), produced.clone());

        let mut out = Box::pin(transcode(source));
        assert_eq!(produced.load(Ordering::SeqCst), 0);

        assert_eq!(out.next().await.unwrap().unwrap(), Bytes::from_static(b"t0"));
        assert_eq!(out.next().await.unwrap().unwrap(), Bytes::from_static(b"t1"));
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(produced.load(Ordering::SeqCst), 2);
    }
}
