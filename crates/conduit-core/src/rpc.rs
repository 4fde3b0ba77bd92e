//! Symmetric multiplexed RPC session between a node and the manager.
//!
//! One long-lived stream carries length-prefixed JSON frames. Either side
//! may issue requests; responses are correlated by id. The very first frame
//! on a session is a `hello` carrying the caller's machine ID as session
//! metadata.
//!
//! Incoming requests are surfaced through an `mpsc` queue and answered via
//! a oneshot, so the owning task processes them strictly in arrival order.

use crate::codec::{read_control_frame, write_control_frame};
use crate::error::{ConduitError, ConduitResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, warn};

/// Any stream a session can run over (plain TCP or TLS).
pub trait SessionStream: AsyncRead + AsyncWrite + Send + Unpin + std::fmt::Debug {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin + std::fmt::Debug> SessionStream for T {}

/// Boxed stream used by dialers that choose TLS at runtime.
pub type BoxedStream = Box<dyn SessionStream>;

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);
const OUTGOING_QUEUE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum FrameKind {
    Hello,
    Request,
    Response,
}

#[derive(Debug, Serialize, Deserialize)]
struct Frame {
    id: u64,
    kind: FrameKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    meta: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Value>,
}

/// A request received from the remote side, to be answered exactly once.
#[derive(Debug)]
pub struct IncomingRequest {
    pub method: String,
    pub payload: Value,
    reply: oneshot::Sender<Result<Value, String>>,
}

impl IncomingRequest {
    /// Decode the request payload.
    pub fn parse<T: DeserializeOwned>(&self) -> ConduitResult<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// Answer the request. A serialization failure or an `Err` result is
    /// reported to the caller as an RPC error string.
    pub fn respond<T: Serialize>(self, result: ConduitResult<T>) {
        let reply = match result {
            Ok(value) => match serde_json::to_value(value) {
                Ok(value) => Ok(value),
                Err(e) => Err(e.to_string()),
            },
            Err(e) => Err(e.to_string()),
        };
        // The session may have closed while the handler ran.
        let _ = self.reply.send(reply);
    }
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, String>>>>>;

/// Handle to a live RPC session. Cheap to clone; all clones share the same
/// underlying stream.
#[derive(Clone)]
pub struct RpcSession {
    outgoing: mpsc::Sender<Frame>,
    pending: Pending,
    next_id: Arc<AtomicU64>,
    closed: watch::Receiver<bool>,
    call_timeout: Duration,
}

impl RpcSession {
    /// Open the client side of a session: send the hello frame carrying
    /// this node's machine ID, then start the frame pumps.
    pub fn client<S: SessionStream + 'static>(
        stream: S,
        meta: &str,
    ) -> (RpcSession, mpsc::UnboundedReceiver<IncomingRequest>) {
        let (session, incoming) = Self::start(stream);
        let hello = Frame {
            id: 0,
            kind: FrameKind::Hello,
            method: None,
            meta: Some(meta.to_string()),
            error: None,
            payload: None,
        };
        // The queue is empty at this point; failure means the writer
        // already died and calls will fail with SessionClosed anyway.
        let _ = session.outgoing.try_send(hello);
        (session, incoming)
    }

    /// Accept the server side of a session: the first frame must be a
    /// hello; its metadata (the peer's machine ID) is returned.
    pub async fn server<S: SessionStream + 'static>(
        mut stream: S,
    ) -> ConduitResult<(RpcSession, String, mpsc::UnboundedReceiver<IncomingRequest>)> {
        let payload = read_control_frame(&mut stream).await?;
        let frame: Frame = serde_json::from_slice(&payload)?;
        if frame.kind != FrameKind::Hello {
            return Err(ConduitError::Rpc("expected hello frame".to_string()));
        }
        let meta = frame
            .meta
            .ok_or_else(|| ConduitError::Rpc("hello frame without metadata".to_string()))?;
        let (session, incoming) = Self::start(stream);
        Ok((session, meta, incoming))
    }

    fn start<S: SessionStream + 'static>(
        stream: S,
    ) -> (RpcSession, mpsc::UnboundedReceiver<IncomingRequest>) {
        let (read_half, write_half) = tokio::io::split(stream);
        let (outgoing_tx, outgoing_rx) = mpsc::channel::<Frame>(OUTGOING_QUEUE);
        // Unbounded so a backlog of incoming requests can never wedge the
        // read loop while the owner is itself awaiting a response.
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel::<IncomingRequest>();
        let (closed_tx, closed_rx) = watch::channel(false);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(write_loop(write_half, outgoing_rx));
        tokio::spawn(read_loop(
            read_half,
            outgoing_tx.clone(),
            incoming_tx,
            pending.clone(),
            closed_tx,
        ));

        let session = RpcSession {
            outgoing: outgoing_tx,
            pending,
            next_id: Arc::new(AtomicU64::new(1)),
            closed: closed_rx,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        };
        (session, incoming_rx)
    }

    /// Issue a request and wait for the peer's response.
    pub async fn call<Req, Rsp>(&self, method: &str, request: &Req) -> ConduitResult<Rsp>
    where
        Req: Serialize,
        Rsp: DeserializeOwned,
    {
        if self.is_closed() {
            return Err(ConduitError::SessionClosed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let frame = Frame {
            id,
            kind: FrameKind::Request,
            method: Some(method.to_string()),
            meta: None,
            error: None,
            payload: Some(serde_json::to_value(request)?),
        };
        if self.outgoing.send(frame).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(ConduitError::SessionClosed);
        }

        match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(serde_json::from_value(value)?),
            Ok(Ok(Err(message))) => Err(ConduitError::Rpc(message)),
            Ok(Err(_)) => Err(ConduitError::SessionClosed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(ConduitError::Timeout)
            }
        }
    }

    /// Whether the underlying stream has gone away.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolve when the underlying stream goes away.
    pub async fn wait_closed(&self) {
        let mut closed = self.closed.clone();
        while !*closed.borrow() {
            if closed.changed().await.is_err() {
                return;
            }
        }
    }
}

async fn write_loop<S: SessionStream>(
    mut writer: WriteHalf<S>,
    mut outgoing: mpsc::Receiver<Frame>,
) {
    while let Some(frame) = outgoing.recv().await {
        let payload = match serde_json::to_vec(&frame) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "unserializable rpc frame dropped");
                continue;
            }
        };
        if let Err(e) = write_control_frame(&mut writer, &payload).await {
            debug!(error = %e, "rpc write failed, closing session");
            break;
        }
    }
}

async fn read_loop<S: SessionStream>(
    mut reader: ReadHalf<S>,
    outgoing: mpsc::Sender<Frame>,
    incoming: mpsc::UnboundedSender<IncomingRequest>,
    pending: Pending,
    closed: watch::Sender<bool>,
) {
    loop {
        let payload = match read_control_frame(&mut reader).await {
            Ok(payload) => payload,
            Err(e) => {
                debug!(error = %e, "rpc session ended");
                break;
            }
        };
        let frame: Frame = match serde_json::from_slice(&payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "malformed rpc frame, closing session");
                break;
            }
        };
        match frame.kind {
            FrameKind::Hello => {
                // Late hello frames carry nothing actionable.
            }
            FrameKind::Response => {
                let Some(tx) = pending.lock().await.remove(&frame.id) else {
                    debug!(id = frame.id, "response for unknown call");
                    continue;
                };
                let result = match frame.error {
                    Some(message) => Err(message),
                    None => Ok(frame.payload.unwrap_or(Value::Null)),
                };
                let _ = tx.send(result);
            }
            FrameKind::Request => {
                let id = frame.id;
                let method = frame.method.unwrap_or_default();
                let (reply_tx, reply_rx) = oneshot::channel();
                let request = IncomingRequest {
                    method,
                    payload: frame.payload.unwrap_or(Value::Null),
                    reply: reply_tx,
                };
                if incoming.send(request).is_err() {
                    // Owner stopped consuming; nothing left to serve.
                    break;
                }
                let outgoing = outgoing.clone();
                tokio::spawn(async move {
                    let reply = reply_rx.await.unwrap_or_else(|_| {
                        Err("handler dropped without responding".to_string())
                    });
                    let (error, payload) = match reply {
                        Ok(value) => (None, Some(value)),
                        Err(message) => (Some(message), None),
                    };
                    let frame = Frame {
                        id,
                        kind: FrameKind::Response,
                        method: None,
                        meta: None,
                        error,
                        payload,
                    };
                    let _ = outgoing.send(frame).await;
                });
            }
        }
    }

    // Fail every in-flight call and let owners observe the close.
    pending.lock().await.clear();
    let _ = closed.send(true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn call_round_trip_with_meta() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);

        let server = tokio::spawn(async move {
            let (_session, meta, mut incoming) = RpcSession::server(server_io).await.unwrap();
            assert_eq!(meta, "machine-a");
            let request = incoming.recv().await.unwrap();
            assert_eq!(request.method, "echo");
            let payload = request.payload.clone();
            request.respond(Ok(payload));
        });

        let (client, _incoming) = RpcSession::client(client_io, "machine-a");
        let reply: Value = client.call("echo", &json!({"n": 7})).await.unwrap();
        assert_eq!(reply, json!({"n": 7}));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn handler_error_propagates() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);

        tokio::spawn(async move {
            let (_session, _meta, mut incoming) = RpcSession::server(server_io).await.unwrap();
            while let Some(request) = incoming.recv().await {
                request.respond::<Value>(Err(ConduitError::PolicyNotFound("x".to_string())));
            }
        });

        let (client, _incoming) = RpcSession::client(client_io, "machine-b");
        let err = client.call::<_, Value>("boom", &json!({})).await.unwrap_err();
        assert!(matches!(err, ConduitError::Rpc(_)));
    }

    #[tokio::test]
    async fn peer_drop_closes_session() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (client, _incoming) = RpcSession::client(client_io, "machine-c");
        drop(server_io);
        client.wait_closed().await;
        assert!(client.is_closed());
        let err = client.call::<_, Value>("gone", &json!({})).await.unwrap_err();
        assert!(matches!(
            err,
            ConduitError::SessionClosed | ConduitError::Timeout
        ));
    }

    #[tokio::test]
    async fn server_can_call_client() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);

        let (client, mut client_incoming) = RpcSession::client(client_io, "machine-d");
        tokio::spawn(async move {
            while let Some(request) = client_incoming.recv().await {
                assert_eq!(request.method, "sync_conduit_offline");
                request.respond(Ok(json!({})));
            }
            drop(client);
        });

        let (server, _meta, _incoming) = RpcSession::server(server_io).await.unwrap();
        let reply: Value = server
            .call("sync_conduit_offline", &json!({"machineID": "m9"}))
            .await
            .unwrap();
        assert_eq!(reply, json!({}));
    }
}
