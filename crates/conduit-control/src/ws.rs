use axum::extract::ws::{CloseFrame as WsCloseFrame, Message, WebSocket};
use bytes::Bytes;
use conduit_wire::{CloseCode, CloseFrame, Frame, Transport, WireError};
use futures_util::{SinkExt, StreamExt};

/// Adapts an accepted axum websocket to a binary-only [`Transport`].
pub fn transport(socket: WebSocket) -> Transport {
    let (sink, stream) = socket.split();
    let sink = sink
        .sink_map_err(|e| WireError::Transport(e.to_string()))
        .with(|frame: Frame| async move {
            Ok::<_, WireError>(match frame {
                Frame::Binary(b) => Message::Binary(b.to_vec()),
                Frame::Close(close) => Message::Close(close.map(|c| WsCloseFrame {
                    code: c.code.0,
                    reason: truncate_reason(c.reason).into(),
                })),
            })
        });
    let stream = stream.filter_map(|msg| async move {
        match msg {
            Ok(Message::Binary(b)) => Some(Ok(Frame::Binary(Bytes::from(b)))),
            Ok(Message::Close(close)) => Some(Ok(Frame::Close(
                close.map(|c| CloseFrame::new(CloseCode(c.code), c.reason.into_owned())),
            ))),
            Ok(Message::Text(_)) => Some(Err(WireError::Protocol(
                "text frames are not accepted".to_string(),
            ))),
            Ok(_) => None,
            Err(e) => Some(Err(WireError::Transport(e.to_string()))),
        }
    });
    Transport::new(sink, stream)
}

/// Close reasons are capped at 123 bytes by the websocket protocol.
fn truncate_reason(mut reason: String) -> String {
    const MAX: usize = 123;
    if reason.len() > MAX {
        let mut end = MAX;
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        reason.truncate(end);
    }
    reason
}
