//! Reconnecting client transport.
//!
//! One WebSocket per viewer, opened lazily and re-opened after drops.
//! Submissions made while offline are queued and flushed in order once
//! the socket comes back. Fragments for the in-flight submission are
//! surfaced as a `FragmentStream`; everything addressed to the viewer
//! rather than the stream (init snapshots, sibling echoes, resync
//! nudges) goes out on a side channel of [`TransportEvent`]s.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{SinkExt, Stream, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::{
    AbortFrame, AbortTag, ClientFrame, Fragment, Message, ServerFrame, SubmitFrame, Trigger,
};

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// HTTP base of the relay server, e.g. `http://127.0.0.1:4820`.
    pub server_url: String,
    pub conversation_id: String,
    /// Pause before re-dialing after a dropped socket.
    pub reconnect_delay: Duration,
}

impl TransportConfig {
    fn ws_url(&self) -> String {
        let base = self
            .server_url
            .replacen("http://", "ws://", 1)
            .replacen("https://", "wss://", 1);
        format!("{}/api/conv/{}/ws", base, self.conversation_id)
    }

    fn log_url(&self) -> String {
        format!("{}/api/conv/{}", self.server_url, self.conversation_id)
    }
}

/// Conversation-level notifications outside the in-flight stream.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Snapshot delivered right after attaching to a non-empty log.
    InitMessages(Vec<Message>),
    /// Another viewer submitted; their message, verbatim.
    SiblingSubmitted { message: Message, trigger: Trigger },
    /// Incremental state may be stale; re-fetch the log.
    Resync,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("connection dropped mid-stream")]
    Disconnected,
    #[error("submission aborted")]
    Aborted,
    #[error("a submission is already in flight")]
    SubmissionInFlight,
    #[error("transport is closed")]
    Closed,
    #[error("log fetch failed: {0}")]
    Fetch(String),
}

type FragmentResult = Result<Fragment, TransportError>;

/// Fragment stream for one submission. Ends after the terminal
/// fragment is yielded, or with an `Err` when the transport gives up
/// on the submission.
pub struct FragmentStream {
    inner: UnboundedReceiverStream<FragmentResult>,
}

impl Stream for FragmentStream {
    type Item = FragmentResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

struct Shared {
    config: TransportConfig,
    /// Sink into the writer task of the live socket, if any.
    writer: Mutex<Option<mpsc::UnboundedSender<tungstenite::Message>>>,
    /// Frames written while offline, flushed in order on reconnect.
    queue: Mutex<VecDeque<ClientFrame>>,
    /// Serializes dial attempts; concurrent callers reuse one socket.
    dialing: Mutex<()>,
    current: Mutex<Option<mpsc::UnboundedSender<FragmentResult>>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    closed: CancellationToken,
    http: reqwest::Client,
}

pub struct ChatTransport {
    shared: Arc<Shared>,
}

impl ChatTransport {
    /// Build a transport. The socket is not dialed until the first
    /// submission (or an explicit [`connect`](Self::connect)).
    pub fn new(config: TransportConfig) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            config,
            writer: Mutex::new(None),
            queue: Mutex::new(VecDeque::new()),
            dialing: Mutex::new(()),
            current: Mutex::new(None),
            events,
            closed: CancellationToken::new(),
            http: reqwest::Client::new(),
        });
        (ChatTransport { shared }, events_rx)
    }

    /// Dial eagerly, e.g. to receive the init snapshot before the
    /// first submission.
    pub async fn connect(&self) -> Result<(), TransportError> {
        ensure_connection(&self.shared).await
    }

    /// Submit the full message list and stream back the reply. At most
    /// one submission per transport may be in flight.
    pub async fn send_messages(
        &self,
        messages: Vec<Message>,
        trigger: Trigger,
        abort: CancellationToken,
    ) -> Result<FragmentStream, TransportError> {
        if self.shared.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let stream_gone = tx.clone();
        {
            let mut current = self.shared.current.lock().await;
            if current.is_some() {
                return Err(TransportError::SubmissionInFlight);
            }
            *current = Some(tx);
        }

        let frame = ClientFrame::Submit(SubmitFrame {
            messages,
            trigger,
            id: uuid::Uuid::new_v4().to_string(),
        });
        send_or_queue(&self.shared, frame).await;

        let shared = self.shared.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = abort.cancelled() => {
                    let chat_id = shared.config.conversation_id.clone();
                    send_or_queue(
                        &shared,
                        ClientFrame::Abort(AbortFrame { tag: AbortTag::Abort, chat_id }),
                    )
                    .await;
                    fail_current(&shared, TransportError::Aborted).await;
                }
                _ = stream_gone.closed() => {
                    // Consumer dropped the stream without aborting;
                    // free the slot for the next submission. Guarded
                    // so a successor's slot is never cleared.
                    let mut current = shared.current.lock().await;
                    if current.as_ref().is_some_and(|tx| tx.same_channel(&stream_gone)) {
                        *current = None;
                    }
                }
                _ = shared.closed.cancelled() => {}
            }
        });

        Ok(FragmentStream {
            inner: UnboundedReceiverStream::new(rx),
        })
    }

    /// Fetch the folded log over the read path. This is the recovery
    /// mechanism behind [`TransportEvent::Resync`].
    pub async fn fetch_log(&self) -> Result<Vec<Message>, TransportError> {
        let response = self
            .shared
            .http
            .get(self.shared.config.log_url())
            .send()
            .await
            .map_err(|e| TransportError::Fetch(e.to_string()))?;
        if !response.status().is_success() {
            return Err(TransportError::Fetch(format!(
                "unexpected status {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| TransportError::Fetch(e.to_string()))
    }

    /// Tear down the socket and fail any in-flight submission. The
    /// transport cannot be reused afterwards.
    pub async fn close(&self) {
        self.shared.closed.cancel();
        fail_current(&self.shared, TransportError::Closed).await;
        *self.shared.writer.lock().await = None;
    }
}

/// Write a frame if the socket is up, otherwise queue it and kick off
/// a (re)connect that will flush the queue.
async fn send_or_queue(shared: &Arc<Shared>, frame: ClientFrame) {
    {
        let writer = shared.writer.lock().await;
        if let Some(tx) = writer.as_ref() {
            if tx.send(text_frame(&frame)).is_ok() {
                return;
            }
        }
    }
    shared.queue.lock().await.push_back(frame);

    let shared = shared.clone();
    tokio::spawn(async move {
        match connect_once(shared.clone()).await {
            Ok(()) | Err(TransportError::Closed) => {}
            Err(e) => {
                warn!("Dial for queued frame failed, retrying: {e}");
                // The queued frame is flushed on connect, so the
                // server answers on the waiting stream; no resync.
                retry_until_connected(shared, false).await;
            }
        }
    });
}

/// Boxed at the dial entry point so the dial/reader/disconnect cycle
/// does not force rustc to name a recursive future type.
fn connect_once(shared: Arc<Shared>) -> BoxFuture<'static, Result<(), TransportError>> {
    Box::pin(async move { ensure_connection(&shared).await })
}

/// Fixed-delay dial loop, entered only while a consumer still cares
/// (a current stream or queued frames). On success, optionally nudge
/// the consumer back onto the read path.
async fn retry_until_connected(shared: Arc<Shared>, resync_on_success: bool) {
    loop {
        tokio::select! {
            _ = shared.closed.cancelled() => return,
            _ = tokio::time::sleep(shared.config.reconnect_delay) => {}
        }
        match connect_once(shared.clone()).await {
            Ok(()) => {
                if resync_on_success {
                    let _ = shared.events.send(TransportEvent::Resync);
                }
                return;
            }
            Err(TransportError::Closed) => return,
            Err(e) => warn!("Reconnect failed, retrying: {e}"),
        }
    }
}

fn text_frame(frame: &ClientFrame) -> tungstenite::Message {
    // ClientFrame serialization is infallible: plain structs, no maps
    // with non-string keys.
    let json = serde_json::to_string(frame).unwrap_or_default();
    tungstenite::Message::Text(json.into())
}

async fn fail_current(shared: &Shared, error: TransportError) {
    if let Some(tx) = shared.current.lock().await.take() {
        let _ = tx.send(Err(error));
    }
}

/// Dial the server unless a socket is already up. On success the
/// offline queue is flushed in order and the reader task takes over.
async fn ensure_connection(shared: &Arc<Shared>) -> Result<(), TransportError> {
    if shared.closed.is_cancelled() {
        return Err(TransportError::Closed);
    }
    let _dial = shared.dialing.lock().await;
    {
        let writer = shared.writer.lock().await;
        if writer.is_some() {
            return Ok(());
        }
    }

    let ws_url = shared.config.ws_url();
    let (ws_stream, _) = tokio_tungstenite::connect_async(&ws_url)
        .await
        .map_err(|e| TransportError::Connection(e.to_string()))?;
    debug!(url = %ws_url, "Transport connected");

    let (mut ws_write, mut ws_read) = ws_stream.split();
    let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<tungstenite::Message>();

    tokio::spawn(async move {
        while let Some(msg) = writer_rx.recv().await {
            if ws_write.send(msg).await.is_err() {
                break;
            }
        }
        let _ = ws_write.close().await;
    });

    // Queue lock held across the writer install so a frame queued
    // concurrently cannot slip between flush and install.
    {
        let mut queue = shared.queue.lock().await;
        for frame in queue.drain(..) {
            let _ = writer_tx.send(text_frame(&frame));
        }
        *shared.writer.lock().await = Some(writer_tx.clone());
    }

    let reader_shared = shared.clone();
    tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                _ = reader_shared.closed.cancelled() => break,
                msg = ws_read.next() => msg,
            };
            match msg {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    match serde_json::from_str::<ServerFrame>(&text) {
                        Ok(frame) => dispatch(&reader_shared, frame, &writer_tx).await,
                        Err(e) => warn!("Unparseable server frame: {e}"),
                    }
                }
                Some(Ok(tungstenite::Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
        on_disconnect(&reader_shared).await;
    });

    Ok(())
}

/// Route one inbound frame: stream-addressed fragments go to the
/// in-flight submission, everything else becomes a transport event.
async fn dispatch(
    shared: &Arc<Shared>,
    frame: ServerFrame,
    writer: &mpsc::UnboundedSender<tungstenite::Message>,
) {
    match frame {
        ServerFrame::Init(init) => {
            let _ = shared.events.send(TransportEvent::InitMessages(init.messages));
        }
        ServerFrame::Echo(echo) => {
            let _ = shared.events.send(TransportEvent::SiblingSubmitted {
                message: echo.message,
                trigger: echo.trigger,
            });
        }
        ServerFrame::Resync(_) => {
            let _ = shared.events.send(TransportEvent::Resync);
        }
        ServerFrame::Fragment(fragment) => {
            let mut current = shared.current.lock().await;
            match current.as_ref() {
                Some(tx) => {
                    let terminal = fragment.is_terminal();
                    let _ = tx.send(Ok(fragment));
                    if terminal {
                        *current = None;
                    }
                }
                None => {
                    // Fragment from a sibling's submission; we fold
                    // nothing here, but answer with an empty frame so
                    // the server sees the connection alive.
                    let _ = writer.send(tungstenite::Message::Binary(Vec::new().into()));
                }
            }
        }
    }
}

/// Socket dropped. Fail the in-flight stream (the caller re-fetches
/// via the read path) and re-dial after a delay, but only while
/// someone still cares: a consumer was waiting on a stream or frames
/// are queued. An idle viewer reconnects on its next submission.
async fn on_disconnect(shared: &Arc<Shared>) {
    *shared.writer.lock().await = None;
    let had_current = shared.current.lock().await.is_some();
    fail_current(shared, TransportError::Disconnected).await;

    let queued = !shared.queue.lock().await.is_empty();
    if shared.closed.is_cancelled() || (!had_current && !queued) {
        return;
    }
    debug!(
        conversation = %shared.config.conversation_id,
        "Transport disconnected, scheduling reconnect"
    );

    // Fragments may have been produced while offline; a resync nudge on
    // success sends the consumer back to the read path.
    tokio::spawn(retry_until_connected(shared.clone(), had_current));
}
