use std::{borrow::Cow, fmt, io, pin::Pin, sync::Arc};

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures_util::{future, sink, stream, Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::ConnectionError;

/// One frame as read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Data(Vec<u8>),
    /// Ping/pong and similar frames with no application payload.
    Control,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

impl OutboundFrame {
    fn from_payload(payload: &[u8]) -> Self {
        match std::str::from_utf8(payload) {
            Ok(text) => OutboundFrame::Text(text.to_owned()),
            Err(_) => OutboundFrame::Binary(payload.to_vec()),
        }
    }
}

pub type FrameSink = Pin<Box<dyn Sink<OutboundFrame, Error = ConnectionError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<InboundFrame, ConnectionError>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A live duplex stream owned by one user identity.
///
/// The write half sits behind a per-connection lock so concurrent pushes to
/// the same user are serialized frame by frame. The read half is owned by the
/// event loop, which stops polling it once the connection is retired.
pub struct Connection {
    id: ConnectionId,
    user_id: String,
    writer: Mutex<FrameSink>,
    retired: CancellationToken,
}

impl Connection {
    pub fn new(user_id: impl Into<String>, writer: FrameSink) -> Arc<Self> {
        Arc::new(Self {
            id: ConnectionId::new(),
            user_id: user_id.into(),
            writer: Mutex::new(writer),
            retired: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Writes `payload` as a single frame.
    pub async fn write(&self, payload: &[u8]) -> Result<(), ConnectionError> {
        if self.is_retired() {
            return Err(ConnectionError::Closed);
        }
        let frame = OutboundFrame::from_payload(payload);
        let mut writer = self.writer.lock().await;
        writer.send(frame).await
    }

    /// Stops the event loop from reading this connection. Idempotent.
    pub fn retire(&self) {
        self.retired.cancel();
    }

    pub fn is_retired(&self) -> bool {
        self.retired.is_cancelled()
    }

    /// Resolves once the connection has been retired.
    pub async fn retired(&self) {
        self.retired.cancelled().await
    }

    /// Retires the connection and closes the write half. Errors from an
    /// already-dead peer are ignored.
    pub async fn close(&self) {
        self.retire();
        let mut writer = self.writer.lock().await;
        let _ = writer.send(OutboundFrame::Close).await;
        let _ = writer.close().await;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("retired", &self.is_retired())
            .finish()
    }
}

/// Splits an upgraded axum socket into the frame halves the registry and
/// event loop work with.
pub fn split_websocket(socket: WebSocket) -> (FrameSink, FrameStream) {
    let (ws_tx, ws_rx) = socket.split();

    let writer = ws_tx
        .sink_map_err(|err| ConnectionError::Transport(err.to_string()))
        .with(|frame: OutboundFrame| future::ready(Ok::<_, ConnectionError>(into_message(frame))));
    let reader = ws_rx.map(|item| item.map(from_message).map_err(classify_error));

    (Box::pin(writer), Box::pin(reader))
}

fn into_message(frame: OutboundFrame) -> Message {
    match frame {
        OutboundFrame::Text(text) => Message::Text(text),
        OutboundFrame::Binary(bytes) => Message::Binary(bytes),
        OutboundFrame::Close => Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: Cow::Borrowed("closing"),
        })),
    }
}

fn from_message(message: Message) -> InboundFrame {
    match message {
        Message::Text(text) => InboundFrame::Data(text.into_bytes()),
        Message::Binary(bytes) => InboundFrame::Data(bytes),
        Message::Close(_) => InboundFrame::Close,
        Message::Ping(_) | Message::Pong(_) => InboundFrame::Control,
    }
}

fn classify_error(err: axum::Error) -> ConnectionError {
    let inner = err.into_inner();
    let root: &(dyn std::error::Error + 'static) = &*inner;
    let mut source = Some(root);
    while let Some(current) = source {
        if let Some(io_err) = current.downcast_ref::<io::Error>() {
            if io_err.kind() == io::ErrorKind::Interrupted {
                return ConnectionError::Interrupted;
            }
        }
        source = current.source();
    }
    ConnectionError::Transport(inner.to_string())
}

/// In-memory peer for tests and embedding without a socket.
pub struct LocalPeer {
    inbound: mpsc::UnboundedSender<Result<InboundFrame, ConnectionError>>,
    outbound: mpsc::UnboundedReceiver<OutboundFrame>,
}

/// Builds a connected (writer, reader, peer) triple backed by channels.
pub fn local_pair() -> (FrameSink, FrameStream, LocalPeer) {
    let (out_tx, out_rx) = mpsc::unbounded_channel::<OutboundFrame>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<Result<InboundFrame, ConnectionError>>();

    let writer = sink::unfold(out_tx, |out_tx, frame: OutboundFrame| async move {
        out_tx.send(frame).map_err(|_| ConnectionError::Closed)?;
        Ok::<_, ConnectionError>(out_tx)
    });
    let reader = stream::unfold(in_rx, |mut in_rx| async move {
        in_rx.recv().await.map(|item| (item, in_rx))
    });

    let peer = LocalPeer {
        inbound: in_tx,
        outbound: out_rx,
    };
    (Box::pin(writer), Box::pin(reader), peer)
}

impl LocalPeer {
    /// Queues a text frame for the server. Returns false once the server
    /// side has stopped reading.
    pub fn send_text(&self, text: &str) -> bool {
        self.send(InboundFrame::Data(text.as_bytes().to_vec()))
    }

    pub fn send(&self, frame: InboundFrame) -> bool {
        self.inbound.send(Ok(frame)).is_ok()
    }

    pub fn fail(&self, error: ConnectionError) -> bool {
        self.inbound.send(Err(error)).is_ok()
    }

    /// Next frame the server wrote, or `None` once the writer is gone.
    pub async fn recv(&mut self) -> Option<OutboundFrame> {
        self.outbound.recv().await
    }

    /// Next frame as text; `None` if it is not a text frame.
    pub async fn recv_text(&mut self) -> Option<String> {
        match self.recv().await? {
            OutboundFrame::Text(text) => Some(text),
            _ => None,
        }
    }
}
