//! Logical byte streams over one [`Transport`].
//!
//! Every transport frame carries one mux frame: a one byte kind, a big-endian `u32` stream id
//! and the payload. Clients open odd stream ids, servers even ones. Writes are cut into
//! chunks of at most [`MAX_CHUNK`] bytes so a single large message never needs a large
//! transport frame.

use std::{
    collections::HashMap,
    io,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
    task::{Context, Poll, ready},
    time::Duration,
};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    sync::{mpsc, oneshot},
};
use tokio_util::{sync::CancellationToken, sync::PollSender, task::TaskTracker};

use crate::{
    WireError,
    transport::{CloseCode, CloseFrame, Frame, FrameSink, FrameStream, Transport},
};

pub const MAX_CHUNK: usize = 32 * 1024;

const HEADER_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Kind {
    Open = 1,
    Data = 2,
    Fin = 3,
    Reset = 4,
    Ping = 5,
    Pong = 6,
}

impl Kind {
    fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => Self::Open,
            2 => Self::Data,
            3 => Self::Fin,
            4 => Self::Reset,
            5 => Self::Ping,
            6 => Self::Pong,
            _ => return None,
        })
    }
}

#[derive(Debug)]
struct MuxFrame {
    kind: Kind,
    stream_id: u32,
    payload: Bytes,
}

impl MuxFrame {
    fn new(kind: Kind, stream_id: u32, payload: Bytes) -> Self {
        Self {
            kind,
            stream_id,
            payload,
        }
    }

    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u8(self.kind as u8);
        buf.put_u32(self.stream_id);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    fn decode(mut raw: Bytes) -> Result<Self, WireError> {
        if raw.len() < HEADER_LEN {
            return Err(WireError::Protocol(format!(
                "short mux frame ({} bytes)",
                raw.len()
            )));
        }
        let kind = raw.get_u8();
        let kind = Kind::from_u8(kind)
            .ok_or_else(|| WireError::Protocol(format!("unknown mux frame kind {kind}")))?;
        let stream_id = raw.get_u32();
        Ok(Self {
            kind,
            stream_id,
            payload: raw,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Close the session when nothing arrives for this long.
    pub idle_timeout: Option<Duration>,
    /// Inbound chunks buffered per stream before the session stops reading.
    pub stream_window: usize,
    /// Opened streams waiting for [`Session::accept`].
    pub accept_backlog: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            idle_timeout: None,
            // 8 MiB of buffered chunks per stream.
            stream_window: 256,
            accept_backlog: 128,
        }
    }
}

enum Chunk {
    Data(Bytes),
    Reset,
}

struct Shared {
    role: Role,
    config: Config,
    out: mpsc::Sender<MuxFrame>,
    ctrl: mpsc::UnboundedSender<MuxFrame>,
    streams: Mutex<HashMap<u32, mpsc::Sender<Chunk>>>,
    accept_tx: mpsc::Sender<MuxStream>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<MuxStream>>,
    next_stream: AtomicU32,
    next_ping: AtomicU64,
    pings: Mutex<HashMap<u64, oneshot::Sender<()>>>,
    closed: CancellationToken,
    local_close: Mutex<Option<CloseFrame>>,
    remote_close: Mutex<Option<CloseFrame>>,
    failure: Mutex<Option<WireError>>,
    tasks: TaskTracker,
}

impl Shared {
    fn shutdown(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        let streams: Vec<_> = self.streams.lock().drain().map(|(_, tx)| tx).collect();
        for tx in streams {
            let _ = tx.try_send(Chunk::Reset);
        }
        self.pings.lock().clear();
    }

    fn fail(&self, err: WireError) {
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(err);
        }
    }

    fn register(self: &Arc<Self>, id: u32) -> MuxStream {
        let (tx, rx) = mpsc::channel(self.config.stream_window.max(1));
        self.streams.lock().insert(id, tx);
        MuxStream {
            id,
            shared: self.clone(),
            rx,
            pending: Bytes::new(),
            out: PollSender::new(self.out.clone()),
            write_closed: false,
        }
    }
}

/// A multiplexed session. Cheap to clone; all clones share the same connection.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    pub fn new(transport: Transport, role: Role, config: Config) -> Self {
        let (out_tx, out_rx) = mpsc::channel(1024);
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog.max(1));
        let shared = Arc::new(Shared {
            role,
            config,
            out: out_tx,
            ctrl: ctrl_tx,
            streams: Mutex::new(HashMap::new()),
            accept_tx,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            next_stream: AtomicU32::new(match role {
                Role::Client => 1,
                Role::Server => 2,
            }),
            next_ping: AtomicU64::new(1),
            pings: Mutex::new(HashMap::new()),
            closed: CancellationToken::new(),
            local_close: Mutex::new(None),
            remote_close: Mutex::new(None),
            failure: Mutex::new(None),
            tasks: TaskTracker::new(),
        });
        let Transport { sink, stream } = transport;
        shared
            .tasks
            .spawn(write_loop(shared.clone(), sink, out_rx, ctrl_rx));
        shared.tasks.spawn(read_loop(shared.clone(), stream));
        shared.tasks.close();
        Self { shared }
    }

    pub fn client(transport: Transport) -> Self {
        Self::new(transport, Role::Client, Config::default())
    }

    pub fn server(transport: Transport) -> Self {
        Self::new(transport, Role::Server, Config::default())
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Opens a new logical stream to the peer.
    pub async fn open(&self) -> Result<MuxStream, WireError> {
        if self.is_closed() {
            return Err(WireError::Closed);
        }
        let id = self.shared.next_stream.fetch_add(2, Ordering::Relaxed);
        let stream = self.shared.register(id);
        self.shared
            .out
            .send(MuxFrame::new(Kind::Open, id, Bytes::new()))
            .await
            .map_err(|_| WireError::Closed)?;
        Ok(stream)
    }

    /// Waits for the peer to open a stream. `None` once the session is closed.
    pub async fn accept(&self) -> Option<MuxStream> {
        let mut rx = self.shared.accept_rx.lock().await;
        tokio::select! {
            stream = rx.recv() => stream,
            _ = self.shared.closed.cancelled() => None,
        }
    }

    /// Round trip through the peer's mux. Blocks until the pong arrives or the session closes.
    pub async fn ping(&self) -> Result<(), WireError> {
        let id = self.shared.next_ping.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pings.lock().insert(id, tx);
        if self.is_closed() {
            self.shared.pings.lock().remove(&id);
            return Err(WireError::Closed);
        }
        let _ = self.shared.ctrl.send(MuxFrame::new(
            Kind::Ping,
            0,
            Bytes::copy_from_slice(&id.to_be_bytes()),
        ));
        tokio::select! {
            res = rx => res.map_err(|_| WireError::Closed),
            _ = self.shared.closed.cancelled() => Err(WireError::Closed),
        }
    }

    /// Closes the session with a status sent to the peer. Only the first call has an effect.
    pub fn close(&self, code: CloseCode, reason: impl Into<String>) {
        {
            let mut local = self.shared.local_close.lock();
            if local.is_some() || self.shared.closed.is_cancelled() {
                return;
            }
            *local = Some(CloseFrame::new(code, reason));
        }
        self.shared.shutdown();
    }

    /// Closes and waits for the connection tasks to finish flushing.
    pub async fn shutdown(&self, code: CloseCode, reason: impl Into<String>) {
        self.close(code, reason);
        self.shared.tasks.wait().await;
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Resolves once the session is closed by either side.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await
    }

    pub fn close_token(&self) -> CancellationToken {
        self.shared.closed.clone()
    }

    /// Status the peer closed with, if it sent one.
    pub fn remote_close(&self) -> Option<CloseFrame> {
        self.shared.remote_close.lock().clone()
    }

    /// Why the session broke, when it was neither closed locally nor by the peer.
    pub fn failure(&self) -> Option<WireError> {
        self.shared.failure.lock().clone()
    }
}

async fn write_loop(
    shared: Arc<Shared>,
    mut sink: FrameSink,
    mut out: mpsc::Receiver<MuxFrame>,
    mut ctrl: mpsc::UnboundedReceiver<MuxFrame>,
) {
    loop {
        let frame = tokio::select! {
            biased;
            Some(f) = ctrl.recv() => f,
            Some(f) = out.recv() => f,
            _ = shared.closed.cancelled() => break,
        };
        if let Err(e) = sink.send(Frame::Binary(frame.encode())).await {
            shared.fail(e);
            shared.shutdown();
            return;
        }
    }

    // Flush what was queued before the close so replies written just before it still arrive.
    while let Ok(f) = out.try_recv() {
        if sink.send(Frame::Binary(f.encode())).await.is_err() {
            return;
        }
    }
    let local = shared.local_close.lock().clone();
    if shared.remote_close.lock().is_none() {
        let frame = local.unwrap_or_else(|| CloseFrame::new(CloseCode::NORMAL, ""));
        let _ = sink.send(Frame::Close(Some(frame))).await;
    }
    let _ = sink.close().await;
}

async fn read_loop(shared: Arc<Shared>, mut stream: FrameStream) {
    let idle = shared.config.idle_timeout;
    loop {
        let next = tokio::select! {
            _ = shared.closed.cancelled() => return,
            next = next_frame(&mut stream, idle) => next,
        };
        let frame = match next {
            Ok(Some(Frame::Binary(raw))) => raw,
            Ok(Some(Frame::Close(close))) => {
                tracing::debug!(?close, "peer closed mux session");
                *shared.remote_close.lock() =
                    Some(close.unwrap_or_else(|| CloseFrame::new(CloseCode::NORMAL, "")));
                break;
            }
            Ok(None) => {
                shared.fail(WireError::Closed);
                break;
            }
            Err(e) => {
                shared.fail(e);
                break;
            }
        };
        let frame = match MuxFrame::decode(frame) {
            Ok(f) => f,
            Err(e) => {
                tracing::debug!(error = %e, "dropping mux session");
                shared.fail(e);
                *shared.local_close.lock() =
                    Some(CloseFrame::new(CloseCode::PROTOCOL_ERROR, "malformed mux frame"));
                break;
            }
        };
        dispatch(&shared, frame).await;
    }
    shared.shutdown();
}

async fn next_frame(
    stream: &mut FrameStream,
    idle: Option<Duration>,
) -> Result<Option<Frame>, WireError> {
    let Some(idle) = idle else {
        return stream.next().await.transpose();
    };
    match tokio::time::timeout(idle, stream.next()).await {
        Ok(next) => next.transpose(),
        Err(_) => Err(WireError::IdleTimeout(idle)),
    }
}

async fn dispatch(shared: &Arc<Shared>, frame: MuxFrame) {
    match frame.kind {
        Kind::Open => {
            let stream = shared.register(frame.stream_id);
            if shared.accept_tx.try_send(stream).is_err() {
                // MuxStream's drop already tells the peer.
                tracing::warn!(stream_id = frame.stream_id, "mux accept backlog full");
            }
        }
        Kind::Data => {
            let tx = shared.streams.lock().get(&frame.stream_id).cloned();
            match tx {
                Some(tx) => {
                    // Blocks the whole session while this stream's window is full.
                    tokio::select! {
                        res = tx.send(Chunk::Data(frame.payload)) => {
                            if res.is_err() {
                                shared.streams.lock().remove(&frame.stream_id);
                            }
                        }
                        _ = shared.closed.cancelled() => {}
                    }
                }
                None => {
                    let _ = shared
                        .ctrl
                        .send(MuxFrame::new(Kind::Reset, frame.stream_id, Bytes::new()));
                }
            }
        }
        Kind::Fin => {
            shared.streams.lock().remove(&frame.stream_id);
        }
        Kind::Reset => {
            let tx = shared.streams.lock().remove(&frame.stream_id);
            if let Some(tx) = tx {
                let _ = tx.try_send(Chunk::Reset);
            }
        }
        Kind::Ping => {
            let _ = shared
                .ctrl
                .send(MuxFrame::new(Kind::Pong, 0, frame.payload));
        }
        Kind::Pong => {
            if frame.payload.len() == 8 {
                let mut raw = frame.payload;
                let id = raw.get_u64();
                if let Some(tx) = shared.pings.lock().remove(&id) {
                    let _ = tx.send(());
                }
            }
        }
    }
}

/// One logical stream. Reading returns EOF after the peer finishes writing; shutting down the
/// write half tells the peer the same.
pub struct MuxStream {
    id: u32,
    shared: Arc<Shared>,
    rx: mpsc::Receiver<Chunk>,
    pending: Bytes,
    out: PollSender<MuxFrame>,
    write_closed: bool,
}

impl MuxStream {
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pending.is_empty() {
            match ready!(self.rx.poll_recv(cx)) {
                Some(Chunk::Data(b)) => self.pending = b,
                Some(Chunk::Reset) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::ConnectionReset,
                        "mux stream reset",
                    )));
                }
                None => return Poll::Ready(Ok(())),
            }
        }
        let n = self.pending.len().min(buf.remaining());
        let chunk = self.pending.split_to(n);
        buf.put_slice(&chunk);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.write_closed {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        if self.shared.closed.is_cancelled() {
            return Poll::Ready(Err(io::ErrorKind::NotConnected.into()));
        }
        if ready!(self.out.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(io::ErrorKind::NotConnected.into()));
        }
        let n = buf.len().min(MAX_CHUNK);
        let frame = MuxFrame::new(Kind::Data, self.id, Bytes::copy_from_slice(&buf[..n]));
        if self.out.send_item(frame).is_err() {
            return Poll::Ready(Err(io::ErrorKind::NotConnected.into()));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.write_closed {
            return Poll::Ready(Ok(()));
        }
        if ready!(self.out.poll_reserve(cx)).is_err() {
            self.write_closed = true;
            return Poll::Ready(Ok(()));
        }
        let id = self.id;
        let _ = self.out.send_item(MuxFrame::new(Kind::Fin, id, Bytes::new()));
        self.write_closed = true;
        Poll::Ready(Ok(()))
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        self.shared.streams.lock().remove(&self.id);
        if self.write_closed || self.shared.closed.is_cancelled() {
            return;
        }
        // Dropped before finishing: FIN must stay behind queued data, so it goes through the
        // data queue.
        let frame = MuxFrame::new(Kind::Fin, self.id, Bytes::new());
        match self.shared.out.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(frame)) => {
                let out = self.shared.out.clone();
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        let _ = out.send(frame).await;
                    });
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::transport::memory_pair;

    fn pair() -> (Session, Session) {
        let (a, b) = memory_pair();
        (Session::client(a), Session::server(b))
    }

    #[tokio::test]
    async fn streams_carry_data_larger_than_a_chunk() {
        let (client, server) = pair();
        let payload: Vec<u8> = (0..(MAX_CHUNK * 5 + 17)).map(|i| (i % 251) as u8).collect();

        let expected = payload.clone();
        let srv = tokio::spawn(async move {
            let mut s = server.accept().await.unwrap();
            let mut got = Vec::new();
            s.read_to_end(&mut got).await.unwrap();
            assert_eq!(got, expected);
            s.write_all(b"done").await.unwrap();
            s.shutdown().await.unwrap();
        });

        let mut s = client.open().await.unwrap();
        s.write_all(&payload).await.unwrap();
        s.shutdown().await.unwrap();
        let mut reply = Vec::new();
        s.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"done");
        srv.await.unwrap();
    }

    #[tokio::test]
    async fn independent_streams_interleave() {
        let (client, server) = pair();
        let mut a = client.open().await.unwrap();
        let mut b = client.open().await.unwrap();
        assert_ne!(a.id(), b.id());
        b.write_all(b"second").await.unwrap();
        a.write_all(b"first").await.unwrap();
        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();

        let mut got = Vec::new();
        for _ in 0..2 {
            let mut s = server.accept().await.unwrap();
            let mut buf = String::new();
            s.read_to_string(&mut buf).await.unwrap();
            got.push((s.id(), buf));
        }
        got.sort();
        assert_eq!(
            got,
            vec![(a.id(), "first".to_string()), (b.id(), "second".to_string())]
        );
    }

    #[tokio::test]
    async fn ping_round_trips() {
        let (client, server) = pair();
        client.ping().await.unwrap();
        server.ping().await.unwrap();
    }

    #[tokio::test]
    async fn close_is_idempotent_and_reaches_peer() {
        let (client, server) = pair();
        let tasks: Vec<_> = (0..4)
            .map(|i| {
                let server = server.clone();
                tokio::spawn(async move { server.close(CloseCode::GOING_AWAY, format!("bye {i}")) })
            })
            .collect();
        for t in tasks {
            t.await.unwrap();
        }
        server.shutdown(CloseCode::INTERNAL_ERROR, "ignored").await;

        client.closed().await;
        let remote = client.remote_close().unwrap();
        assert_eq!(remote.code, CloseCode::GOING_AWAY);
        assert!(remote.reason.starts_with("bye "));
        assert!(client.accept().await.is_none());
        assert!(client.ping().await.is_err());
    }

    #[tokio::test]
    async fn session_close_resets_open_streams() {
        let (client, server) = pair();
        let mut s = client.open().await.unwrap();
        let _peer = server.accept().await.unwrap();
        server.close(CloseCode::GOING_AWAY, "ping timeout");
        let mut buf = Vec::new();
        let err = s.read_to_end(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_closes_session() {
        let (a, b) = memory_pair();
        let server = Session::new(
            b,
            Role::Server,
            Config {
                idle_timeout: Some(Duration::from_secs(5)),
                ..Config::default()
            },
        );
        let _client = Session::client(a);
        tokio::time::timeout(Duration::from_secs(10), server.closed())
            .await
            .unwrap();
        assert!(matches!(server.failure(), Some(WireError::IdleTimeout(_))));
    }
}
