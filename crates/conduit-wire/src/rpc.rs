//! Request/response calls over mux streams.
//!
//! Each call owns one logical stream. Frames are length-delimited protobuf: the client opens
//! with an [`RpcRequest`] naming the method (its payload is the request for unary calls), then
//! may stream more `RpcRequest` frames. The server answers with [`RpcResponse`] frames and
//! ends the call by finishing its write half, after an error status if the call failed.

use std::{any::type_name, sync::Arc};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use conduit_proto::rpc::{RpcRequest, RpcResponse};
use futures_util::{SinkExt, StreamExt};
use prost::Message;
use tokio::io::{ReadHalf, WriteHalf};
use tokio_util::{
    codec::{FramedRead, FramedWrite, LengthDelimitedCodec},
    sync::CancellationToken,
    task::TaskTracker,
};
use tonic::Status;

use crate::{MuxStream, Session, WireError};

/// Largest single RPC message. Large manifests travel as one message split into mux chunks.
pub const MAX_MESSAGE_BYTES: usize = 64 << 20;

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_MESSAGE_BYTES)
        .new_codec()
}

fn code_from_i32(v: i32) -> tonic::Code {
    match v {
        0 => tonic::Code::Ok,
        1 => tonic::Code::Cancelled,
        2 => tonic::Code::Unknown,
        3 => tonic::Code::InvalidArgument,
        4 => tonic::Code::DeadlineExceeded,
        5 => tonic::Code::NotFound,
        6 => tonic::Code::AlreadyExists,
        7 => tonic::Code::PermissionDenied,
        8 => tonic::Code::ResourceExhausted,
        9 => tonic::Code::FailedPrecondition,
        10 => tonic::Code::Aborted,
        11 => tonic::Code::OutOfRange,
        12 => tonic::Code::Unimplemented,
        13 => tonic::Code::Internal,
        14 => tonic::Code::Unavailable,
        15 => tonic::Code::DataLoss,
        16 => tonic::Code::Unauthenticated,
        _ => tonic::Code::Unknown,
    }
}

pub fn decode<M: Message + Default>(raw: &[u8]) -> Result<M, Status> {
    M::decode(raw).map_err(|e| Status::invalid_argument(format!("decode {}: {e}", type_name::<M>())))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Client,
    Server,
}

pub struct CallSender {
    inner: FramedWrite<WriteHalf<MuxStream>, LengthDelimitedCodec>,
    side: Side,
}

impl CallSender {
    pub async fn send<M: Message>(&mut self, msg: &M) -> Result<(), Status> {
        let frame = match self.side {
            Side::Server => RpcResponse {
                ok: true,
                payload: msg.encode_to_vec(),
                status_code: 0,
                status_message: String::new(),
            }
            .encode_to_vec(),
            Side::Client => RpcRequest {
                method: String::new(),
                payload: msg.encode_to_vec(),
            }
            .encode_to_vec(),
        };
        self.send_raw(frame).await
    }

    async fn send_raw(&mut self, frame: Vec<u8>) -> Result<(), Status> {
        self.inner
            .send(Bytes::from(frame))
            .await
            .map_err(|e| Status::unavailable(format!("send: {e}")))
    }

    async fn send_status(&mut self, status: &Status) -> Result<(), Status> {
        let frame = RpcResponse {
            ok: false,
            payload: Vec::new(),
            status_code: i32::from(status.code()),
            status_message: status.message().to_string(),
        };
        self.send_raw(frame.encode_to_vec()).await
    }

    /// Ends this side of the call. The peer reads end-of-stream after the last message.
    pub async fn finish(&mut self) -> Result<(), Status> {
        SinkExt::<Bytes>::close(&mut self.inner)
            .await
            .map_err(|e| Status::unavailable(format!("finish: {e}")))
    }
}

pub struct CallReceiver {
    inner: FramedRead<ReadHalf<MuxStream>, LengthDelimitedCodec>,
    side: Side,
}

impl CallReceiver {
    async fn next_frame(&mut self) -> Result<Option<BytesMut>, Status> {
        match self.inner.next().await {
            None => Ok(None),
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => Err(Status::unavailable(format!("recv: {e}"))),
        }
    }

    /// Next message, or `None` once the peer finished its side.
    pub async fn recv<M: Message + Default>(&mut self) -> Result<Option<M>, Status> {
        let Some(frame) = self.next_frame().await? else {
            return Ok(None);
        };
        match self.side {
            Side::Server => {
                let req: RpcRequest = decode(&frame)?;
                decode(&req.payload).map(Some)
            }
            Side::Client => {
                let resp: RpcResponse = decode(&frame)?;
                if !resp.ok {
                    return Err(Status::new(
                        code_from_i32(resp.status_code),
                        resp.status_message,
                    ));
                }
                decode(&resp.payload).map(Some)
            }
        }
    }
}

fn split(stream: MuxStream, side: Side) -> (CallReceiver, CallSender) {
    let (r, w) = tokio::io::split(stream);
    (
        CallReceiver {
            inner: FramedRead::new(r, codec()),
            side,
        },
        CallSender {
            inner: FramedWrite::new(w, codec()),
            side,
        },
    )
}

/// An inbound call as seen by a [`Service`].
pub struct ServerCall {
    method: String,
    payload: Vec<u8>,
    pub rx: CallReceiver,
    cancel: CancellationToken,
}

impl ServerCall {
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Decodes the request carried by the opening frame.
    pub fn request<M: Message + Default>(&self) -> Result<M, Status> {
        decode(&self.payload)
    }

    pub async fn recv<M: Message + Default>(&mut self) -> Result<Option<M>, Status> {
        self.rx.recv().await
    }

    /// Cancelled when the session serving this call goes away.
    pub fn cancelled(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Handles one call. Replies go through `tx`; an `Err` is sent to the client as the final
    /// frame of the call.
    async fn call(&self, call: ServerCall, tx: &mut CallSender) -> Result<(), Status>;
}

/// Serves calls until the session closes. Returns an error when the session broke rather than
/// being closed by either side.
pub async fn serve<S: Service + ?Sized>(session: Session, service: Arc<S>) -> Result<(), WireError> {
    let tracker = TaskTracker::new();
    let cancel = session.close_token().child_token();
    while let Some(stream) = session.accept().await {
        tracing::trace!(stream_id = stream.id(), "accepted rpc stream");
        tracker.spawn(handle_stream(stream, service.clone(), cancel.clone()));
    }
    tracker.close();
    cancel.cancel();
    tracker.wait().await;
    match session.failure() {
        None | Some(WireError::Closed) => Ok(()),
        Some(err) => Err(err),
    }
}

async fn handle_stream<S: Service + ?Sized>(
    stream: MuxStream,
    service: Arc<S>,
    cancel: CancellationToken,
) {
    let (mut rx, mut tx) = split(stream, Side::Server);
    let header = match rx.next_frame().await {
        Ok(Some(frame)) => frame,
        Ok(None) => return,
        Err(status) => {
            tracing::debug!(error = %status.message(), "read rpc header");
            return;
        }
    };
    let req: RpcRequest = match decode(&header) {
        Ok(req) => req,
        Err(status) => {
            let _ = tx.send_status(&status).await;
            let _ = tx.finish().await;
            return;
        }
    };
    let method = req.method;
    let call = ServerCall {
        method: method.clone(),
        payload: req.payload,
        rx,
        cancel,
    };
    if let Err(status) = service.call(call, &mut tx).await {
        tracing::debug!(
            %method,
            code = ?status.code(),
            message = %status.message(),
            "rpc call failed"
        );
        let _ = tx.send_status(&status).await;
    }
    let _ = tx.finish().await;
}

/// Outbound half of a call started with [`RpcClient::start`] or [`RpcClient::stream`].
pub struct ClientCall {
    pub tx: CallSender,
    pub rx: CallReceiver,
}

impl ClientCall {
    pub async fn send<M: Message>(&mut self, msg: &M) -> Result<(), Status> {
        self.tx.send(msg).await
    }

    pub async fn recv<M: Message + Default>(&mut self) -> Result<Option<M>, Status> {
        self.rx.recv().await
    }

    pub fn split(self) -> (CallSender, CallReceiver) {
        (self.tx, self.rx)
    }
}

#[derive(Clone)]
pub struct RpcClient {
    session: Session,
}

impl RpcClient {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Opens a call whose opening frame carries `req`.
    pub async fn start<Req: Message>(&self, method: &str, req: &Req) -> Result<ClientCall, Status> {
        let stream = self
            .session
            .open()
            .await
            .map_err(|e| Status::unavailable(format!("{method}: {e}")))?;
        let (rx, mut tx) = split(stream, Side::Client);
        let header = RpcRequest {
            method: method.to_string(),
            payload: req.encode_to_vec(),
        };
        tx.send_raw(header.encode_to_vec()).await?;
        Ok(ClientCall { tx, rx })
    }

    /// Opens a streaming call; messages follow with [`ClientCall::send`].
    pub async fn stream(&self, method: &str) -> Result<ClientCall, Status> {
        self.start(method, &conduit_proto::rpc::Empty {}).await
    }

    pub async fn unary<Req, Resp>(&self, method: &str, req: &Req) -> Result<Resp, Status>
    where
        Req: Message,
        Resp: Message + Default,
    {
        let mut call = self.start(method, req).await?;
        call.tx.finish().await?;
        call.rx
            .recv()
            .await?
            .ok_or_else(|| Status::unavailable(format!("{method}: call ended without a response")))
    }
}
