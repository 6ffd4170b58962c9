//! Streaming state machine for generated text.
//!
//! Generation backends yield a [`DeltaStream`]: incremental pieces of text,
//! any of which may be an error. [`TextStream`] turns that into a stream of
//! plain strings that never fails:
//!
//! - [`TextStream::cumulative`] yields the full answer so far after every
//!   delta, so a consumer can render progress without concatenating.
//! - [`TextStream::deltas`] forwards deltas unchanged; used by transports that
//!   do their own concatenation.
//!
//! States move `NotStarted → Active → Completed`, or to `Errored` from either
//! of the first two. On an error one terminal item carrying
//! [`error_marker`] is emitted and the stream ends; the error itself is never
//! propagated, so the transport framing stays well-formed.

use std::pin::Pin;
use std::task::{ready, Context, Poll};

use futures::stream::{BoxStream, Stream, StreamExt};

use crate::error::PipelineError;

/// Incremental generation output.
pub type DeltaStream = BoxStream<'static, Result<String, PipelineError>>;

/// Lifecycle of a [`TextStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    NotStarted,
    Active,
    Completed,
    Errored,
}

/// Terminal text appended when a stream fails part-way.
pub fn error_marker(err: &PipelineError) -> String {
    format!("\n\nError during streaming: {}", err)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Emit {
    Delta,
    Cumulative,
}

/// Infallible text stream over a [`DeltaStream`]-like source.
pub struct TextStream<S> {
    inner: S,
    emit: Emit,
    buffer: String,
    state: StreamState,
}

impl<S> TextStream<S>
where
    S: Stream<Item = Result<String, PipelineError>> + Unpin,
{
    /// Yield the accumulated text after each delta.
    pub fn cumulative(inner: S) -> Self {
        Self::new(inner, Emit::Cumulative)
    }

    /// Yield each delta as-is.
    pub fn deltas(inner: S) -> Self {
        Self::new(inner, Emit::Delta)
    }

    fn new(inner: S, emit: Emit) -> Self {
        Self {
            inner,
            emit,
            buffer: String::new(),
            state: StreamState::NotStarted,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Everything received so far, including a terminal error marker.
    pub fn text(&self) -> &str {
        &self.buffer
    }
}

impl<S> Stream for TextStream<S>
where
    S: Stream<Item = Result<String, PipelineError>> + Unpin,
{
    type Item = String;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        let this = self.get_mut();
        loop {
            if matches!(this.state, StreamState::Completed | StreamState::Errored) {
                return Poll::Ready(None);
            }
            match ready!(this.inner.poll_next_unpin(cx)) {
                Some(Ok(delta)) => {
                    // Keep-alives and empty choices carry no text.
                    if delta.is_empty() {
                        continue;
                    }
                    this.state = StreamState::Active;
                    this.buffer.push_str(&delta);
                    let item = match this.emit {
                        Emit::Delta => delta,
                        Emit::Cumulative => this.buffer.clone(),
                    };
                    return Poll::Ready(Some(item));
                }
                Some(Err(err)) => {
                    tracing::warn!(error = %err, received = this.buffer.len(), "generation stream failed");
                    this.state = StreamState::Errored;
                    let marker = error_marker(&err);
                    this.buffer.push_str(&marker);
                    let item = match this.emit {
                        Emit::Delta => marker,
                        Emit::Cumulative => this.buffer.clone(),
                    };
                    return Poll::Ready(Some(item));
                }
                None => {
                    this.state = StreamState::Completed;
                    return Poll::Ready(None);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use futures::stream;

    fn ok(parts: &[&str]) -> Vec<Result<String, PipelineError>> {
        parts.iter().map(|p| Ok(p.to_string())).collect()
    }

    #[test]
    fn test_cumulative_outputs() {
        let source = stream::iter(ok(&["Hel", "lo", " world"]));
        let out: Vec<String> = block_on(TextStream::cumulative(source).collect());
        assert_eq!(out, vec!["Hel", "Hello", "Hello world"]);
    }

    #[test]
    fn test_error_mid_stream_yields_prefix_then_marker() {
        let mut items = ok(&["Hel", "lo"]);
        items.push(Err(PipelineError::GenerationBackend("connection reset".into())));
        items.push(Ok("never seen".into()));

        let mut s = TextStream::cumulative(stream::iter(items));
        let out: Vec<String> = block_on((&mut s).collect());
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], "Hel");
        assert_eq!(out[1], "Hello");
        assert!(out[2].starts_with("Hello\n\nError during streaming:"));
        assert!(out[2].contains("connection reset"));
        assert_eq!(s.state(), StreamState::Errored);
    }

    #[test]
    fn test_delta_mode_forwards_pieces_and_marker() {
        let mut items = ok(&["a", "", "b"]);
        items.push(Err(PipelineError::GenerationBackend("boom".into())));
        let out: Vec<String> = block_on(TextStream::deltas(stream::iter(items)).collect());
        assert_eq!(out[..2], ["a".to_string(), "b".to_string()]);
        assert_eq!(out.len(), 3);
        assert!(out[2].starts_with("\n\nError during streaming:"));
    }

    #[test]
    fn test_state_transitions() {
        block_on(async {
            let mut s = TextStream::cumulative(stream::iter(ok(&["x"])));
            assert_eq!(s.state(), StreamState::NotStarted);
            assert_eq!(s.next().await.as_deref(), Some("x"));
            assert_eq!(s.state(), StreamState::Active);
            assert_eq!(s.next().await, None);
            assert_eq!(s.state(), StreamState::Completed);
            assert_eq!(s.next().await, None);
            assert_eq!(s.text(), "x");
        });
    }

    #[test]
    fn test_error_before_first_delta() {
        let items: Vec<Result<String, PipelineError>> =
            vec![Err(PipelineError::GenerationBackend("unreachable".into()))];
        let out: Vec<String> = block_on(TextStream::cumulative(stream::iter(items)).collect());
        assert_eq!(out.len(), 1);
        assert!(out[0].contains("unreachable"));
    }

    #[test]
    fn test_empty_source_completes_without_items() {
        let out: Vec<String> =
            block_on(TextStream::cumulative(stream::iter(ok(&[]))).collect());
        assert!(out.is_empty());
    }
}
