//! Per-connection session: state, receive loop, send path, teardown.
//!
//! # Responsibilities
//! - Own the connection's transport halves and cancellation scope
//! - Reassemble inbound chunks into messages and emit them as events
//! - Serialize outbound writes through the per-session lock
//! - Run teardown exactly once, whatever ended the connection
//!
//! # Design Decisions
//! - One receive-loop task per session; sends run on the caller's task
//! - The session token is a child of the server root token, so server
//!   shutdown cascades into every pending receive and lock wait
//! - Forced disconnect only cancels the token; cleanup always flows
//!   through the receive loop so there is a single teardown path

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::events::{EventBus, ServerEvent};
use crate::net::transport::{Frame, MessageKind, TransportReader, TransportWriter};
use crate::registry::ConnectionRegistry;
use crate::stats::Statistics;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

const STATE_CONNECTING: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_CLOSING: u8 = 2;
const STATE_CLOSED: u8 = 3;

/// State and control handles for one live connection.
pub struct Session {
    identity: String,
    /// Cancelling this token is the sole trigger for forced teardown.
    cancel: CancellationToken,
    /// Write-serialization lock. At most one physical write is in flight
    /// per connection; the lock also owns the writer half outright.
    writer: Mutex<Box<dyn TransportWriter>>,
    state: AtomicU8,
}

impl Session {
    pub(crate) fn new(
        identity: String,
        cancel: CancellationToken,
        writer: Box<dyn TransportWriter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity,
            cancel,
            writer: Mutex::new(writer),
            state: AtomicU8::new(STATE_CONNECTING),
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn state(&self) -> SessionState {
        match self.state.load(Ordering::Acquire) {
            STATE_CONNECTING => SessionState::Connecting,
            STATE_OPEN => SessionState::Open,
            STATE_CLOSING => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }

    pub(crate) fn mark_open(&self) {
        self.state.store(STATE_OPEN, Ordering::Release);
    }

    fn set_state(&self, value: u8) {
        self.state.store(value, Ordering::Release);
    }

    /// Cancel this session's scope. Teardown itself happens in the receive
    /// loop, which this unblocks.
    pub(crate) fn force_disconnect(&self) {
        self.cancel.cancel();
    }

    /// Write one complete message, serialized against other senders.
    ///
    /// The lock wait and the write are both bounded by the session's own
    /// token and, when supplied, the caller's token. Returns false on any
    /// failure; failures never propagate.
    pub(crate) async fn send_payload(
        &self,
        data: Bytes,
        kind: MessageKind,
        caller_cancel: Option<&CancellationToken>,
    ) -> bool {
        let mut writer = tokio::select! {
            guard = self.writer.lock() => guard,
            _ = self.cancel.cancelled() => {
                tracing::debug!(identity = %self.identity, "send abandoned: session closing");
                return false;
            }
            _ = cancelled_opt(caller_cancel) => {
                tracing::debug!(identity = %self.identity, "send abandoned: caller cancelled");
                return false;
            }
        };

        let result = tokio::select! {
            result = writer.send(data, kind) => result,
            _ = self.cancel.cancelled() => {
                tracing::debug!(identity = %self.identity, "send aborted: session closing");
                return false;
            }
            _ = cancelled_opt(caller_cancel) => {
                tracing::debug!(identity = %self.identity, "send aborted: caller cancelled");
                return false;
            }
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(identity = %self.identity, error = %e, "websocket send failed");
                false
            }
        }
    }
}

/// Pending-forever when no caller token was supplied.
async fn cancelled_opt(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// Receive loop: one task per session, bounded by the session token.
///
/// Chunks accumulate until a final chunk completes a message, which is
/// emitted as one `MessageReceived` event. Peer close, transport error, and
/// cancellation all end the loop and flow into the same teardown.
pub(crate) async fn run_receive_loop(
    session: Arc<Session>,
    mut reader: Box<dyn TransportReader>,
    registry: Arc<ConnectionRegistry>,
    events: Arc<EventBus>,
    stats: Arc<Statistics>,
) {
    let mut buffer = BytesMut::new();
    let mut kind = MessageKind::Binary;

    loop {
        let frame = tokio::select! {
            _ = session.cancel.cancelled() => {
                tracing::debug!(identity = %session.identity, "session cancelled");
                break;
            }
            frame = reader.next_frame() => frame,
        };

        match frame {
            Ok(Frame::Chunk {
                data,
                kind: chunk_kind,
                is_final,
            }) => {
                if buffer.is_empty() {
                    // Message kind comes from the first chunk.
                    kind = chunk_kind;
                }
                buffer.extend_from_slice(&data);
                if !is_final {
                    continue;
                }
                if buffer.is_empty() {
                    // A completed message always carries at least its final
                    // chunk; an entirely empty one carries nothing to emit.
                    continue;
                }
                let payload = buffer.split().freeze();
                stats.record_received(payload.len() as u64);
                events.emit(&ServerEvent::MessageReceived {
                    identity: session.identity.clone(),
                    payload,
                    kind,
                });
            }
            Ok(Frame::Closed) => {
                tracing::debug!(identity = %session.identity, "peer closed connection");
                break;
            }
            Err(e) => {
                tracing::warn!(
                    identity = %session.identity,
                    error = %e,
                    "transport error, closing session"
                );
                break;
            }
        }
    }

    teardown(session, &registry, &events).await;
}

/// One-time cleanup: notify, release the transport, deregister — in that
/// order. A consumer reacting to `Disconnected` may still observe the
/// identity in the connection list; that ordering is a documented contract.
async fn teardown(session: Arc<Session>, registry: &ConnectionRegistry, events: &EventBus) {
    session.set_state(STATE_CLOSING);
    events.emit(&ServerEvent::Disconnected {
        identity: session.identity.clone(),
    });

    let mut writer = session.writer.lock().await;
    if let Err(e) = writer.close().await {
        tracing::debug!(identity = %session.identity, error = %e, "error closing transport");
    }
    drop(writer);

    session.set_state(STATE_CLOSED);
    registry.remove(&session.identity);
    tracing::info!(identity = %session.identity, "connection closed");
}

#[cfg(test)]
impl Session {
    /// Session over a discarding transport, for registry and server tests.
    pub(crate) fn for_tests(identity: &str) -> Arc<Self> {
        Self::new(
            identity.to_owned(),
            CancellationToken::new(),
            Box::new(tests::NullWriter),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::transport::TransportError;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    pub(crate) struct NullWriter;

    #[async_trait]
    impl TransportWriter for NullWriter {
        async fn send(&mut self, _data: Bytes, _kind: MessageKind) -> Result<(), TransportError> {
            Ok(())
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    /// Replays a fixed sequence of frames, then pends or reports close.
    struct ScriptedReader {
        frames: VecDeque<Result<Frame, TransportError>>,
        pend_when_empty: bool,
    }

    impl ScriptedReader {
        fn new(frames: Vec<Result<Frame, TransportError>>) -> Self {
            Self {
                frames: frames.into(),
                pend_when_empty: false,
            }
        }

        fn pending() -> Self {
            Self {
                frames: VecDeque::new(),
                pend_when_empty: true,
            }
        }
    }

    #[async_trait]
    impl TransportReader for ScriptedReader {
        async fn next_frame(&mut self) -> Result<Frame, TransportError> {
            match self.frames.pop_front() {
                Some(frame) => frame,
                None if self.pend_when_empty => std::future::pending().await,
                None => Ok(Frame::Closed),
            }
        }
    }

    struct RecordingWriter {
        sent: Arc<StdMutex<Vec<(Bytes, MessageKind)>>>,
    }

    #[async_trait]
    impl TransportWriter for RecordingWriter {
        async fn send(&mut self, data: Bytes, kind: MessageKind) -> Result<(), TransportError> {
            // Yield so concurrent senders actually contend for the lock.
            tokio::time::sleep(Duration::from_millis(1)).await;
            self.sent.lock().unwrap().push((data, kind));
            Ok(())
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn chunk(data: &[u8], kind: MessageKind, is_final: bool) -> Result<Frame, TransportError> {
        Ok(Frame::Chunk {
            data: Bytes::copy_from_slice(data),
            kind,
            is_final,
        })
    }

    struct Harness {
        registry: Arc<ConnectionRegistry>,
        events: Arc<EventBus>,
        stats: Arc<Statistics>,
        received: Arc<StdMutex<Vec<(String, Bytes, MessageKind)>>>,
        disconnected: Arc<StdMutex<Vec<String>>>,
    }

    impl Harness {
        fn new() -> Self {
            let events = Arc::new(EventBus::new());
            let received = Arc::new(StdMutex::new(Vec::new()));
            let disconnected = Arc::new(StdMutex::new(Vec::new()));

            let received_log = Arc::clone(&received);
            let disconnected_log = Arc::clone(&disconnected);
            events.subscribe(move |event| match event {
                ServerEvent::MessageReceived {
                    identity,
                    payload,
                    kind,
                } => received_log
                    .lock()
                    .unwrap()
                    .push((identity.clone(), payload.clone(), *kind)),
                ServerEvent::Disconnected { identity } => {
                    disconnected_log.lock().unwrap().push(identity.clone())
                }
                _ => {}
            });

            Self {
                registry: Arc::new(ConnectionRegistry::new()),
                events,
                stats: Arc::new(Statistics::new()),
                received,
                disconnected,
            }
        }

        async fn run(&self, session: Arc<Session>, reader: ScriptedReader) {
            self.registry
                .insert(session.identity(), Arc::clone(&session));
            session.mark_open();
            run_receive_loop(
                session,
                Box::new(reader),
                Arc::clone(&self.registry),
                Arc::clone(&self.events),
                Arc::clone(&self.stats),
            )
            .await;
        }
    }

    fn test_session(identity: &str) -> Arc<Session> {
        Session::new(
            identity.to_owned(),
            CancellationToken::new(),
            Box::new(NullWriter),
        )
    }

    #[tokio::test]
    async fn reassembles_chunks_into_one_message() {
        let harness = Harness::new();
        let reader = ScriptedReader::new(vec![
            chunk(b"hel", MessageKind::Text, false),
            chunk(b"lo", MessageKind::Text, true),
            Ok(Frame::Closed),
        ]);

        harness.run(test_session("peer:1"), reader).await;

        let received = harness.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(&received[0].1[..], b"hello");
        assert_eq!(received[0].2, MessageKind::Text);

        let snap = harness.stats.snapshot();
        assert_eq!(snap.messages_received, 1);
        assert_eq!(snap.bytes_received, 5);
    }

    #[tokio::test]
    async fn one_byte_chunks_reassemble() {
        let harness = Harness::new();
        let reader = ScriptedReader::new(vec![
            chunk(b"a", MessageKind::Binary, false),
            chunk(b"b", MessageKind::Binary, false),
            chunk(b"c", MessageKind::Binary, true),
        ]);

        harness.run(test_session("peer:2"), reader).await;

        let received = harness.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(&received[0].1[..], b"abc");
    }

    #[tokio::test]
    async fn large_single_chunk_passes_through() {
        let harness = Harness::new();
        let big = vec![0x5au8; 100_000];
        let reader = ScriptedReader::new(vec![chunk(&big, MessageKind::Binary, true)]);

        harness.run(test_session("peer:3"), reader).await;

        let received = harness.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].1.len(), 100_000);
        assert_eq!(harness.stats.snapshot().bytes_received, 100_000);
    }

    #[tokio::test]
    async fn empty_final_chunk_without_data_emits_nothing() {
        let harness = Harness::new();
        let reader = ScriptedReader::new(vec![chunk(b"", MessageKind::Text, true)]);

        harness.run(test_session("peer:4"), reader).await;

        assert!(harness.received.lock().unwrap().is_empty());
        assert_eq!(harness.stats.snapshot().messages_received, 0);
        // Teardown still ran.
        assert_eq!(harness.disconnected.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn peer_close_tears_down_exactly_once() {
        let harness = Harness::new();
        let session = test_session("peer:5");

        harness.run(Arc::clone(&session), ScriptedReader::new(vec![])).await;

        assert_eq!(*harness.disconnected.lock().unwrap(), vec!["peer:5"]);
        assert!(harness.registry.is_empty());
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn transport_error_tears_down() {
        let harness = Harness::new();
        let reader = ScriptedReader::new(vec![Err(TransportError::Utf8)]);

        harness.run(test_session("peer:6"), reader).await;

        assert_eq!(harness.disconnected.lock().unwrap().len(), 1);
        assert!(harness.registry.is_empty());
    }

    #[tokio::test]
    async fn disconnected_fires_before_registry_removal() {
        let harness = Harness::new();
        let session = test_session("peer:7");

        let registry = Arc::clone(&harness.registry);
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_log = Arc::clone(&seen);
        harness.events.subscribe(move |event| {
            if let ServerEvent::Disconnected { .. } = event {
                seen_log.lock().unwrap().push(registry.identities());
            }
        });

        harness.run(session, ScriptedReader::new(vec![])).await;

        // The identity was still listed while the handler ran.
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], vec!["peer:7"]);
        assert!(harness.registry.is_empty());
    }

    #[tokio::test]
    async fn forced_disconnect_unblocks_idle_receive() {
        let harness = Harness::new();
        let session = test_session("peer:8");

        let loop_session = Arc::clone(&session);
        harness
            .registry
            .insert(session.identity(), Arc::clone(&session));
        session.mark_open();
        let task = tokio::spawn(run_receive_loop(
            loop_session,
            Box::new(ScriptedReader::pending()),
            Arc::clone(&harness.registry),
            Arc::clone(&harness.events),
            Arc::clone(&harness.stats),
        ));

        tokio::task::yield_now().await;
        session.force_disconnect();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("receive loop did not exit")
            .unwrap();

        assert_eq!(*harness.disconnected.lock().unwrap(), vec!["peer:8"]);
        assert!(harness.registry.is_empty());
    }

    #[tokio::test]
    async fn concurrent_sends_are_serialized_and_complete() {
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let session = Session::new(
            "peer:9".to_owned(),
            CancellationToken::new(),
            Box::new(RecordingWriter {
                sent: Arc::clone(&sent),
            }),
        );

        let mut handles = Vec::new();
        for i in 0..8u8 {
            let session = Arc::clone(&session);
            handles.push(tokio::spawn(async move {
                let payload = Bytes::from(vec![i; 64]);
                session.send_payload(payload, MessageKind::Binary, None).await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap());
        }

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 8);
        // Every payload arrived whole: uniform bytes, full length.
        for (payload, _) in sent.iter() {
            assert_eq!(payload.len(), 64);
            assert!(payload.iter().all(|b| *b == payload[0]));
        }
    }

    #[tokio::test]
    async fn caller_cancellation_aborts_lock_wait() {
        let session = test_session("peer:10");
        let guard = session.writer.lock().await;

        let caller = CancellationToken::new();
        let send_session = Arc::clone(&session);
        let send_cancel = caller.clone();
        let task = tokio::spawn(async move {
            send_session
                .send_payload(Bytes::from_static(b"x"), MessageKind::Text, Some(&send_cancel))
                .await
        });

        tokio::task::yield_now().await;
        caller.cancel();
        let sent = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("send did not abort")
            .unwrap();
        assert!(!sent);
        drop(guard);
    }

    #[tokio::test]
    async fn session_cancellation_aborts_lock_wait() {
        let session = test_session("peer:11");
        let guard = session.writer.lock().await;

        let send_session = Arc::clone(&session);
        let task = tokio::spawn(async move {
            send_session
                .send_payload(Bytes::from_static(b"x"), MessageKind::Text, None)
                .await
        });

        tokio::task::yield_now().await;
        session.force_disconnect();
        let sent = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("send did not abort")
            .unwrap();
        assert!(!sent);
        drop(guard);
    }
}
