//! Fragment streams and their plumbing.
//!
//! A [`FragmentStream`] is lazy, finite and non-restartable. It owns the
//! HTTP response it reads from, so dropping it (consumer abandonment,
//! error, or normal completion) releases the connection.

use std::collections::VecDeque;

use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};

use crate::error::{LlmError, Result};

/// Sequence of text deltas produced by a streaming call.
pub type FragmentStream = BoxStream<'static, Result<String>>;

type TextCallback = Box<dyn Fn(&str) + Send + Sync>;
type ErrorCallback = Box<dyn Fn(&LlmError) + Send + Sync>;

/// Optional observers for a fragment stream.
#[derive(Default)]
pub struct StreamCallbacks {
    on_token: Option<TextCallback>,
    on_complete: Option<TextCallback>,
    on_error: Option<ErrorCallback>,
}

impl StreamCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called with every fragment.
    pub fn on_token(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_token = Some(Box::new(f));
        self
    }

    /// Called once with the full text when the stream ends cleanly.
    pub fn on_complete(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Box::new(f));
        self
    }

    /// Called once when the stream yields an error.
    pub fn on_error(mut self, f: impl Fn(&LlmError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }
}

/// Attach callbacks to a stream. Fragments pass through unchanged; the
/// stream ends after the first error.
pub fn observe(inner: FragmentStream, callbacks: StreamCallbacks) -> FragmentStream {
    struct State {
        inner: FragmentStream,
        callbacks: StreamCallbacks,
        text: String,
        finished: bool,
    }

    let state = State {
        inner,
        callbacks,
        text: String::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }
        match state.inner.next().await {
            Some(Ok(fragment)) => {
                if let Some(cb) = &state.callbacks.on_token {
                    cb(&fragment);
                }
                state.text.push_str(&fragment);
                Some((Ok(fragment), state))
            }
            Some(Err(e)) => {
                if let Some(cb) = &state.callbacks.on_error {
                    cb(&e);
                }
                state.finished = true;
                Some((Err(e), state))
            }
            None => {
                if let Some(cb) = &state.callbacks.on_complete {
                    cb(&state.text);
                }
                None
            }
        }
    })
    .boxed()
}

/// What one decoded wire frame contributes to a fragment stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A fragment; more may follow.
    Text(String),
    /// The last fragment (possibly empty).
    Final(String),
    /// Nothing to emit (keep-alives, metadata events).
    Skip,
    /// End of stream.
    End,
}

/// Decode framed lines into fragments. Empty fragments are dropped; the
/// stream ends at the first `Final`/`End` frame or the first error.
pub fn fragments<F>(source: BoxStream<'static, Result<String>>, decode: F) -> FragmentStream
where
    F: FnMut(&str) -> Result<Frame> + Send + 'static,
{
    stream::unfold((source, decode, false), |(mut source, mut decode, finished)| async move {
        if finished {
            return None;
        }
        loop {
            let line = match source.next().await? {
                Ok(line) => line,
                Err(e) => return Some((Err(e), (source, decode, true))),
            };
            match decode(&line) {
                Ok(Frame::Text(text)) if !text.is_empty() => {
                    return Some((Ok(text), (source, decode, false)));
                }
                Ok(Frame::Final(text)) if !text.is_empty() => {
                    return Some((Ok(text), (source, decode, true)));
                }
                Ok(Frame::Final(_)) | Ok(Frame::End) => return None,
                Ok(Frame::Text(_)) | Ok(Frame::Skip) => continue,
                Err(e) => return Some((Err(e), (source, decode, true))),
            }
        }
    })
    .boxed()
}

/// Drain a stream into a single string.
pub async fn collect_text(mut stream: FragmentStream) -> Result<String> {
    let mut text = String::new();
    while let Some(fragment) = stream.next().await {
        text.push_str(&fragment?);
    }
    Ok(text)
}

/// Split a response body into complete, non-empty lines.
///
/// Partial lines are buffered across chunk boundaries; a trailing line
/// without a newline is emitted when the body ends.
pub fn lines<S, B>(body: S) -> BoxStream<'static, Result<String>>
where
    S: Stream<Item = std::result::Result<B, reqwest::Error>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    struct State<B> {
        body: BoxStream<'static, std::result::Result<B, reqwest::Error>>,
        buf: Vec<u8>,
        pending: VecDeque<String>,
        eof: bool,
    }

    fn push_line(pending: &mut VecDeque<String>, raw: &[u8]) {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim_end_matches('\r');
        if !line.trim().is_empty() {
            pending.push_back(line.to_string());
        }
    }

    let state = State {
        body: body.boxed(),
        buf: Vec::new(),
        pending: VecDeque::new(),
        eof: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(line) = state.pending.pop_front() {
                return Some((Ok(line), state));
            }
            if state.eof {
                return None;
            }
            match state.body.next().await {
                Some(Ok(chunk)) => {
                    state.buf.extend_from_slice(chunk.as_ref());
                    while let Some(pos) = state.buf.iter().position(|&b| b == b'\n') {
                        let rest = state.buf.split_off(pos + 1);
                        push_line(&mut state.pending, &state.buf[..pos]);
                        state.buf = rest;
                    }
                }
                Some(Err(e)) => {
                    state.eof = true;
                    return Some((Err(LlmError::from(e)), state));
                }
                None => {
                    state.eof = true;
                    let rest = std::mem::take(&mut state.buf);
                    push_line(&mut state.pending, &rest);
                }
            }
        }
    })
    .boxed()
}

/// Payloads of the `data:` lines of a server-sent event stream.
pub fn sse_data<S, B>(body: S) -> BoxStream<'static, Result<String>>
where
    S: Stream<Item = std::result::Result<B, reqwest::Error>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    lines(body)
        .filter_map(|line| async move {
            match line {
                Ok(line) => line
                    .strip_prefix("data:")
                    .map(|data| Ok(data.trim_start().to_string())),
                Err(e) => Some(Err(e)),
            }
        })
        .boxed()
}
