use std::{fmt, pin::Pin};

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt, stream};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

use crate::WireError;

/// Websocket close status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CloseCode(pub u16);

impl CloseCode {
    pub const NORMAL: Self = Self(1000);
    pub const GOING_AWAY: Self = Self(1001);
    pub const PROTOCOL_ERROR: Self = Self(1002);
    pub const UNSUPPORTED_DATA: Self = Self(1003);
    pub const POLICY_VIOLATION: Self = Self(1008);
    pub const INTERNAL_ERROR: Self = Self(1011);
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::NORMAL => "normal",
            Self::GOING_AWAY => "going away",
            Self::PROTOCOL_ERROR => "protocol error",
            Self::UNSUPPORTED_DATA => "unsupported data",
            Self::POLICY_VIOLATION => "policy violation",
            Self::INTERNAL_ERROR => "internal error",
            _ => "other",
        };
        write!(f, "{} ({name})", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: CloseCode,
    pub reason: String,
}

impl CloseFrame {
    pub fn new(code: CloseCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// One message of a binary-only duplex transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Binary(Bytes),
    Close(Option<CloseFrame>),
}

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = WireError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, WireError>> + Send>>;

/// A message-oriented duplex connection, usually an upgraded websocket.
pub struct Transport {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl Transport {
    pub fn new(
        sink: impl Sink<Frame, Error = WireError> + Send + 'static,
        stream: impl Stream<Item = Result<Frame, WireError>> + Send + 'static,
    ) -> Self {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

/// Two connected in-process transports.
pub fn memory_pair() -> (Transport, Transport) {
    let (a_tx, a_rx) = mpsc::channel::<Frame>(64);
    let (b_tx, b_rx) = mpsc::channel::<Frame>(64);
    (memory_end(a_tx, b_rx), memory_end(b_tx, a_rx))
}

fn memory_end(tx: mpsc::Sender<Frame>, mut rx: mpsc::Receiver<Frame>) -> Transport {
    let sink = PollSender::new(tx).sink_map_err(|_| WireError::Closed);
    let stream = stream::poll_fn(move |cx| rx.poll_recv(cx).map(|f| f.map(Ok)));
    Transport::new(sink, stream)
}

/// Adapts a client-side tungstenite websocket. Text frames are rejected; ping and pong are
/// answered by tungstenite itself and never surface.
pub fn from_tungstenite<S>(ws: tokio_tungstenite::WebSocketStream<S>) -> Transport
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    use tokio_tungstenite::tungstenite::{
        Message,
        protocol::{CloseFrame as WsCloseFrame, frame::coding::CloseCode as WsCode},
    };

    let (sink, stream) = ws.split();
    let sink = sink
        .sink_map_err(|e| WireError::Transport(e.to_string()))
        .with(|frame: Frame| async move {
            Ok::<_, WireError>(match frame {
                Frame::Binary(b) => Message::Binary(b),
                Frame::Close(close) => Message::Close(close.map(|c| WsCloseFrame {
                    code: WsCode::from(c.code.0),
                    reason: c.reason.into(),
                })),
            })
        });
    let stream = stream.filter_map(|msg| async move {
        match msg {
            Ok(Message::Binary(b)) => Some(Ok(Frame::Binary(b))),
            Ok(Message::Close(close)) => Some(Ok(Frame::Close(close.map(|c| {
                CloseFrame::new(CloseCode(u16::from(c.code)), c.reason.as_str())
            })))),
            Ok(Message::Text(_)) => Some(Err(WireError::Protocol(
                "text frames are not accepted".to_string(),
            ))),
            Ok(_) => None,
            Err(e) => Some(Err(WireError::Transport(e.to_string()))),
        }
    });
    Transport::new(sink, stream)
}

/// Dials a websocket endpoint with an optional bearer token.
pub async fn dial(url: &str, bearer: Option<&str>) -> Result<Transport, WireError> {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    let mut req = url
        .into_client_request()
        .map_err(|e| WireError::Transport(format!("invalid url {url}: {e}")))?;
    if let Some(token) = bearer {
        let value = format!("Bearer {token}")
            .parse()
            .map_err(|_| WireError::Transport("invalid bearer token".to_string()))?;
        req.headers_mut().insert("authorization", value);
    }
    let (ws, _resp) = tokio_tungstenite::connect_async(req)
        .await
        .map_err(|e| WireError::Transport(format!("dial {url}: {e}")))?;
    Ok(from_tungstenite(ws))
}
