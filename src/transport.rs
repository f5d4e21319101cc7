//! The transport seam between the session store and the backend.
//!
//! [`ChatTransport`] hides endpoint URLs behind three calls.  [`send`] wraps the chat call in
//! a [`ChatTurn`]: a stream of raw chunks that ends in exactly one terminal event and enforces
//! both an overall deadline and a per-chunk deadline.  Nothing here retries.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::{self, Stream, StreamExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::decoder::StreamDecoder;
use crate::error::{Error, Result};
use crate::observability::{STREAM_BYTES, STREAM_CHUNKS, TURN_CANCELLATIONS, TURN_TIMEOUTS};

/// Default deadline for a whole turn and for each chunk read.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Raw body of a streamed chat reply.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Backend operations consumed by the session store.
#[async_trait::async_trait]
pub trait ChatTransport: Send + Sync {
    /// Asks the backend for a new session id.
    async fn create_session(&self) -> Result<String>;

    /// Deletes a session on the backend.
    async fn delete_session(&self, session_id: &str) -> Result<()>;

    /// Opens a streamed chat request.  A non-success status is an error; the body is not read.
    async fn open_chat(&self, user_input: &str, session_id: &str) -> Result<ByteStream>;

    /// Deadlines applied to turns opened through this transport.
    fn turn_options(&self) -> TurnOptions {
        TurnOptions::default()
    }
}

#[async_trait::async_trait]
impl<T: ChatTransport + ?Sized> ChatTransport for Arc<T> {
    async fn create_session(&self) -> Result<String> {
        (**self).create_session().await
    }

    async fn delete_session(&self, session_id: &str) -> Result<()> {
        (**self).delete_session(session_id).await
    }

    async fn open_chat(&self, user_input: &str, session_id: &str) -> Result<ByteStream> {
        (**self).open_chat(user_input, session_id).await
    }

    fn turn_options(&self) -> TurnOptions {
        (**self).turn_options()
    }
}

/// Deadlines for one turn.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TurnOptions {
    /// Deadline for the whole turn, measured from the moment the request starts.
    pub timeout: Duration,
    /// Deadline for each read of the next chunk.
    pub chunk_timeout: Duration,
}

impl TurnOptions {
    /// Uses one value for both deadlines.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            chunk_timeout: timeout,
        }
    }
}

impl Default for TurnOptions {
    fn default() -> Self {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }
}

/// Something that happened on a turn.  The last event of every turn is terminal.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A piece of the response body.
    Chunk(Bytes),
    /// The body ended normally.
    Done,
    /// The request failed or the connection broke.
    NetworkError(Error),
    /// The overall or per-chunk deadline expired.
    Timeout(Error),
    /// The caller cancelled the turn.
    Cancelled,
}

impl TransportEvent {
    /// Returns true for the event that ends a turn.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransportEvent::Chunk(_))
    }
}

/// Cancels a turn.  Cloneable, idempotent, and harmless after the turn has ended.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    /// Creates a handle that is not yet cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stops the deadline timers and the underlying transfer.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns true once `cancel` has been called.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Callback surface for consumers that prefer sinks over iteration.
pub trait TransportSink: Send {
    /// A piece of the response body arrived.
    fn on_chunk(&mut self, chunk: &[u8]);
    /// The body ended normally.
    fn on_done(&mut self);
    /// The request failed.
    fn on_network_error(&mut self, error: &Error);
    /// A deadline expired.
    fn on_timeout(&mut self, error: &Error);
    /// The caller cancelled the turn.
    fn on_cancelled(&mut self) {}
    /// Returns true once the sink wants no further events.  The driver then drops the turn.
    fn is_closed(&self) -> bool {
        false
    }
}

/// Receives the decoded text of a reply.
pub trait MessageSink: Send {
    /// Full text received so far; `done` is true exactly once.
    fn on_message(&mut self, text: &str, done: bool);
    /// The turn failed.  Called after the final `on_message`.
    fn on_error(&mut self, error: &Error);
}

/// Adapts a [`MessageSink`] into a [`TransportSink`] by running a [`StreamDecoder`].
pub struct DecodingSink<M: MessageSink> {
    decoder: StreamDecoder,
    sink: M,
}

impl<M: MessageSink> DecodingSink<M> {
    /// Wraps a message sink.
    pub fn new(sink: M) -> Self {
        Self {
            decoder: StreamDecoder::new(),
            sink,
        }
    }

    /// Returns the wrapped sink.
    pub fn into_inner(self) -> M {
        self.sink
    }

    fn finish_with_error(&mut self, error: &Error) {
        // A reply that already ended with `done` stays successful.
        if let Some(update) = self.decoder.finish() {
            self.sink.on_message(&update.text, true);
            self.sink.on_error(error);
        }
    }
}

impl<M: MessageSink> TransportSink for DecodingSink<M> {
    fn on_chunk(&mut self, chunk: &[u8]) {
        for update in self.decoder.push(chunk) {
            self.sink.on_message(&update.text, update.done);
        }
    }

    fn on_done(&mut self) {
        for update in self.decoder.end_of_input() {
            self.sink.on_message(&update.text, update.done);
        }
    }

    fn on_network_error(&mut self, error: &Error) {
        self.finish_with_error(error);
    }

    fn on_timeout(&mut self, error: &Error) {
        self.finish_with_error(error);
    }

    fn on_cancelled(&mut self) {
        if let Some(update) = self.decoder.finish() {
            self.sink.on_message(&update.text, true);
        }
    }

    fn is_closed(&self) -> bool {
        self.decoder.is_finished()
    }
}

/// One in-flight chat request.
pub struct ChatTurn<'a> {
    events: Pin<Box<dyn Stream<Item = TransportEvent> + Send + 'a>>,
    cancel: CancelHandle,
}

impl ChatTurn<'_> {
    /// Returns a handle that cancels this turn.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Returns the next event, or `None` after the terminal event.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.next().await
    }

    /// Delivers the events of the turn to a sink until the turn ends or the sink closes.
    pub async fn drive(mut self, sink: &mut dyn TransportSink) {
        while let Some(event) = self.next_event().await {
            let terminal = event.is_terminal();
            match event {
                TransportEvent::Chunk(bytes) => sink.on_chunk(&bytes),
                TransportEvent::Done => sink.on_done(),
                TransportEvent::NetworkError(err) => sink.on_network_error(&err),
                TransportEvent::Timeout(err) => sink.on_timeout(&err),
                TransportEvent::Cancelled => sink.on_cancelled(),
            }
            if terminal || sink.is_closed() {
                break;
            }
        }
    }
}

impl Stream for ChatTurn<'_> {
    type Item = TransportEvent;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.events.as_mut().poll_next(cx)
    }
}

/// Opens a turn with the transport's own deadlines.
pub fn send<'a, T>(transport: &'a T, user_input: &'a str, session_id: &'a str) -> ChatTurn<'a>
where
    T: ChatTransport + ?Sized,
{
    send_with(
        transport,
        user_input,
        session_id,
        transport.turn_options(),
        CancelHandle::new(),
    )
}

/// Opens a turn with explicit deadlines and cancel handle.
///
/// The request is not issued until the turn is first polled; the overall deadline starts then.
pub fn send_with<'a, T>(
    transport: &'a T,
    user_input: &'a str,
    session_id: &'a str,
    options: TurnOptions,
    cancel: CancelHandle,
) -> ChatTurn<'a>
where
    T: ChatTransport + ?Sized,
{
    let state = TurnState {
        phase: Phase::Idle(transport.open_chat(user_input, session_id)),
        deadline: None,
        options,
        token: cancel.token.clone(),
    };
    let events = stream::unfold(state, |mut state| async move {
        state.advance().await.map(|event| (event, state))
    });
    ChatTurn {
        events: Box::pin(events),
        cancel,
    }
}

enum Phase<'a> {
    Idle(BoxFuture<'a, Result<ByteStream>>),
    Connecting(BoxFuture<'a, Result<ByteStream>>),
    Streaming(ByteStream),
    Closed,
}

struct TurnState<'a> {
    phase: Phase<'a>,
    deadline: Option<Instant>,
    options: TurnOptions,
    token: CancellationToken,
}

impl TurnState<'_> {
    async fn advance(&mut self) -> Option<TransportEvent> {
        loop {
            match std::mem::replace(&mut self.phase, Phase::Closed) {
                Phase::Closed => return None,
                Phase::Idle(request) => {
                    self.deadline = Some(Instant::now() + self.options.timeout);
                    self.phase = Phase::Connecting(request);
                }
                Phase::Connecting(request) => {
                    let deadline = self.overall_deadline();
                    let result = tokio::select! {
                        biased;
                        _ = self.token.cancelled() => return Some(cancelled()),
                        result = tokio::time::timeout_at(deadline, request) => result,
                    };
                    match result {
                        Err(_) => return Some(self.timed_out("no response before the deadline")),
                        Ok(Err(err)) => return Some(classify(err)),
                        Ok(Ok(body)) => self.phase = Phase::Streaming(body),
                    }
                }
                Phase::Streaming(mut body) => {
                    let chunk_deadline = std::cmp::min(
                        Instant::now() + self.options.chunk_timeout,
                        self.overall_deadline(),
                    );
                    let result = tokio::select! {
                        biased;
                        _ = self.token.cancelled() => return Some(cancelled()),
                        result = tokio::time::timeout_at(chunk_deadline, body.next()) => result,
                    };
                    match result {
                        Err(_) => return Some(self.timed_out("stream stalled")),
                        Ok(None) => return Some(TransportEvent::Done),
                        Ok(Some(Err(err))) => return Some(classify(err)),
                        Ok(Some(Ok(bytes))) => {
                            STREAM_CHUNKS.click();
                            STREAM_BYTES.count(bytes.len() as u64);
                            self.phase = Phase::Streaming(body);
                            return Some(TransportEvent::Chunk(bytes));
                        }
                    }
                }
            }
        }
    }

    fn overall_deadline(&self) -> Instant {
        self.deadline
            .unwrap_or_else(|| Instant::now() + self.options.timeout)
    }

    fn timed_out(&self, what: &str) -> TransportEvent {
        TURN_TIMEOUTS.click();
        tracing::warn!(timeout = ?self.options.timeout, "{what}");
        TransportEvent::Timeout(Error::timeout(
            what,
            Some(self.options.timeout.as_secs_f64()),
        ))
    }
}

fn cancelled() -> TransportEvent {
    TURN_CANCELLATIONS.click();
    tracing::debug!("turn cancelled");
    TransportEvent::Cancelled
}

fn classify(err: Error) -> TransportEvent {
    if err.is_timeout() {
        TURN_TIMEOUTS.click();
        TransportEvent::Timeout(err)
    } else {
        tracing::warn!(error = %err, "chat request failed");
        TransportEvent::NetworkError(err)
    }
}

/// Runs a turn to completion and returns the decoded reply.
///
/// Used for side requests such as topic labels and summaries, where only the final text
/// matters.
pub async fn collect_response<T>(transport: &T, user_input: &str, session_id: &str) -> Result<String>
where
    T: ChatTransport + ?Sized,
{
    let mut turn = send(transport, user_input, session_id);
    let mut decoder = StreamDecoder::new();
    while let Some(event) = turn.next_event().await {
        match event {
            TransportEvent::Chunk(bytes) => {
                if let Some(update) = decoder.push(&bytes).into_iter().find(|u| u.done) {
                    return Ok(update.text);
                }
            }
            TransportEvent::Done => {
                if let Some(update) = decoder.end_of_input().into_iter().find(|u| u.done) {
                    return Ok(update.text);
                }
            }
            TransportEvent::NetworkError(err) | TransportEvent::Timeout(err) => return Err(err),
            TransportEvent::Cancelled => return Err(Error::cancelled("side request cancelled")),
        }
    }
    Err(Error::streaming("turn ended without a terminal event", None))
}


#[cfg(test)]
mod tests {
    use super::testing::{MockTransport, Script};
    use super::*;

    #[derive(Default)]
    struct Recorder {
        messages: Vec<(String, bool)>,
        errors: Vec<String>,
    }

    impl MessageSink for Recorder {
        fn on_message(&mut self, text: &str, done: bool) {
            self.messages.push((text.to_string(), done));
        }

        fn on_error(&mut self, error: &Error) {
            self.errors.push(error.to_string());
        }
    }

    async fn collect_events(turn: &mut ChatTurn<'_>) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        while let Some(event) = turn.next_event().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn reply_ends_with_done() {
        let transport = MockTransport::new();
        transport.script(Script::text("hello"));
        let mut turn = send(&transport, "hi", "s1");
        let events = collect_events(&mut turn).await;
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], TransportEvent::Chunk(_)));
        assert!(matches!(events[2], TransportEvent::Done));
        assert_eq!(
            transport.requests(),
            vec![("hi".to_string(), "s1".to_string())]
        );
    }

    #[tokio::test]
    async fn status_error_is_network_error() {
        let transport = MockTransport::new();
        transport.script(Script::Status(503));
        let mut turn = send(&transport, "hi", "s1");
        let events = collect_events(&mut turn).await;
        assert_eq!(events.len(), 1);
        match &events[0] {
            TransportEvent::NetworkError(err) => assert_eq!(err.status_code(), Some(503)),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn broken_connection_is_network_error() {
        let transport = MockTransport::new();
        transport.script(Script::Break(vec![b"{\"type\":\"a\",\"content\":\"x\"}\n".to_vec()]));
        let mut turn = send(&transport, "hi", "s1");
        let events = collect_events(&mut turn).await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], TransportEvent::NetworkError(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_stream_times_out_once() {
        let transport = MockTransport::with_options(TurnOptions {
            timeout: Duration::from_secs(30),
            chunk_timeout: Duration::from_secs(5),
        });
        transport.script(Script::Stall(vec![b"{\"type\":\"a\",\"content\":\"x\"}\n".to_vec()]));
        let started = Instant::now();
        let mut turn = send(&transport, "hi", "s1");
        let events = collect_events(&mut turn).await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], TransportEvent::Timeout(_)));
        assert_eq!(started.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn overall_deadline_bounds_the_turn() {
        let transport =
            MockTransport::with_options(TurnOptions::with_timeout(Duration::from_secs(30)));
        transport.script(Script::Stall(Vec::new()));
        let started = Instant::now();
        let mut turn = send(&transport, "hi", "s1");
        let events = collect_events(&mut turn).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], TransportEvent::Timeout(_)));
        assert_eq!(started.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn trickling_stream_hits_overall_deadline() {
        let transport = MockTransport::with_options(TurnOptions {
            timeout: Duration::from_secs(30),
            chunk_timeout: Duration::from_secs(5),
        });
        transport.script(Script::Trickle(
            b"{\"type\":\"a\",\"content\":\"x\"}\n".to_vec(),
            Duration::from_secs(4),
        ));
        let started = Instant::now();
        let mut turn = send(&transport, "hi", "s1");
        let events = collect_events(&mut turn).await;
        // chunks at 4s, 8s, ..., 28s, then the overall deadline
        assert_eq!(events.len(), 8);
        assert!(events[..7].iter().all(|e| matches!(e, TransportEvent::Chunk(_))));
        assert!(matches!(events[7], TransportEvent::Timeout(_)));
        assert_eq!(started.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_hits_overall_deadline() {
        let transport = MockTransport::with_options(TurnOptions {
            timeout: Duration::from_secs(30),
            chunk_timeout: Duration::from_secs(5),
        });
        transport.script(Script::Hang);
        let started = Instant::now();
        let mut turn = send(&transport, "hi", "s1");
        let events = collect_events(&mut turn).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], TransportEvent::Timeout(_)));
        assert!(events[0].is_terminal());
        assert_eq!(started.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn cancel_stops_the_turn() {
        let transport = MockTransport::new();
        transport.script(Script::Stall(vec![b"{\"type\":\"a\",\"content\":\"x\"}\n".to_vec()]));
        let mut turn = send(&transport, "hi", "s1");
        let handle = turn.cancel_handle();
        assert!(matches!(
            turn.next_event().await,
            Some(TransportEvent::Chunk(_))
        ));
        handle.cancel();
        handle.cancel();
        assert!(matches!(
            turn.next_event().await,
            Some(TransportEvent::Cancelled)
        ));
        assert!(turn.next_event().await.is_none());
        handle.cancel();
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn decoding_sink_reports_messages() {
        let transport = MockTransport::new();
        transport.script(Script::Reply(vec![
            b"data: {\"type\":\"a\",\"content\":\"Hi\"}\n".to_vec(),
            b"data: {\"type\":\"a\",\"content\":\" there\"}\ndata: {\"type\":\"done\"}\n".to_vec(),
        ]));
        let mut sink = DecodingSink::new(Recorder::default());
        send(&transport, "hi", "s1").drive(&mut sink).await;
        let recorder = sink.into_inner();
        assert_eq!(
            recorder.messages,
            vec![
                ("Hi".to_string(), false),
                ("Hi there".to_string(), false),
                ("Hi there".to_string(), true),
            ]
        );
        assert!(recorder.errors.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn decoding_sink_stops_after_done() {
        let transport = MockTransport::new();
        transport.script(Script::Stall(vec![
            b"data: {\"type\":\"a\",\"content\":\"Hi\"}\ndata: {\"type\":\"done\"}\n".to_vec(),
        ]));
        let started = Instant::now();
        let mut sink = DecodingSink::new(Recorder::default());
        send(&transport, "hi", "s1").drive(&mut sink).await;
        assert!(sink.is_closed());
        let recorder = sink.into_inner();
        assert_eq!(
            recorder.messages,
            vec![("Hi".to_string(), false), ("Hi".to_string(), true)]
        );
        assert!(recorder.errors.is_empty());
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[test]
    fn finished_sink_ignores_late_errors() {
        let mut sink = DecodingSink::new(Recorder::default());
        sink.on_chunk(b"{\"type\":\"a\",\"content\":\"Hi\"}\n{\"type\":\"done\"}\n");
        sink.on_timeout(&Error::timeout("stream stalled", Some(30.0)));
        let recorder = sink.into_inner();
        assert_eq!(recorder.messages.last(), Some(&("Hi".to_string(), true)));
        assert!(recorder.errors.is_empty());
    }

    #[tokio::test]
    async fn decoding_sink_finishes_before_error() {
        let transport = MockTransport::new();
        transport.script(Script::Break(vec![b"{\"type\":\"a\",\"content\":\"part\"}\n".to_vec()]));
        let mut sink = DecodingSink::new(Recorder::default());
        send(&transport, "hi", "s1").drive(&mut sink).await;
        let recorder = sink.into_inner();
        assert_eq!(
            recorder.messages,
            vec![("part".to_string(), false), ("part".to_string(), true)]
        );
        assert_eq!(recorder.errors.len(), 1);
    }

    #[tokio::test]
    async fn collect_response_returns_final_text() {
        let transport = MockTransport::new();
        transport.script(Script::records(&[("think", "hmm"), ("answer", "Title")]));
        let text = collect_response(&transport, "name it", "s1").await.unwrap();
        assert_eq!(text, "hmm\n\nTitle");

        transport.script(Script::Status(500));
        let err = collect_response(&transport, "name it", "s1").await.unwrap_err();
        assert!(err.is_network());
    }
}
