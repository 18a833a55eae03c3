//! Server-side per-connection state (C9): reads request messages off a
//! socket and dispatches them through the [`Router`], while concurrently
//! draining every stream this client subscribed to onto the same
//! connection's write half.
//!
//! Speaks the general TLV [`Message`] protocol; the socket is split so
//! request handling and stream delivery don't block each other, and a
//! client may open any number of sources and streams over one
//! connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::message::{Message, MessageFlags};
use crate::router::Router;
use crate::source::ClientId;
use crate::stream::StreamId;
use crate::{Error, MAX_MESSAGE_LEN, STATUS_SUCCESS};

/// One connected client's session state, shared between its request
/// loop and the per-stream delivery tasks it spawns.
pub struct ClientSession {
    id: ClientId,
    router: Router,
    timeout: Duration,
    closing: AtomicBool,
    write_half: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    stream_tasks: Mutex<HashMap<StreamId, JoinHandle<()>>>,
}

impl ClientSession {
    /// Begin a new session for `id` against `router`. The socket is
    /// supplied later, to [`ClientSession::run`].
    pub fn new(id: ClientId, router: Router, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            id,
            router,
            timeout,
            closing: AtomicBool::new(false),
            write_half: tokio::sync::Mutex::new(None),
            stream_tasks: Mutex::new(HashMap::new()),
        })
    }

    /// This session's client id.
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Mark the session as closing; the request loop exits at its next
    /// iteration and every per-stream delivery task is aborted.
    pub fn close(&self) {
        self.closing.store(true, Ordering::Relaxed);
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Relaxed)
    }

    /// Drive one connection to completion: reads requests and `Data`
    /// messages off `socket`, dispatching them through the router, while
    /// streams this client opened deliver concurrently on the same
    /// connection's write half. Returns once the peer disconnects or the
    /// session is closed, always releasing the client's sources/streams
    /// first (§3's ownership invariant).
    pub async fn run(self: Arc<Self>, socket: TcpStream) -> Result<(), Error> {
        socket.set_nodelay(true)?;
        let (read_half, write_half) = socket.into_split();
        *self.write_half.lock().await = Some(write_half);

        let result = self.read_loop(read_half).await;

        self.close();
        for (_, handle) in self.stream_tasks.lock().drain() {
            handle.abort();
        }
        self.router.release_client(self.id);
        debug!(client_id = self.id, "session ended, resources released");
        result
    }

    async fn read_loop(self: &Arc<Self>, mut read_half: tokio::net::tcp::OwnedReadHalf) -> Result<(), Error> {
        let mut buf = BytesMut::with_capacity(64 * 1024);
        loop {
            if self.is_closing() {
                return Ok(());
            }
            let total_len = match tokio::time::timeout(self.timeout, read_half.read_u32_le()).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Ok(Err(e)) => return Err(Error::Io(e)),
                Err(_) => return Err(Error::Timeout),
            };
            if total_len > MAX_MESSAGE_LEN {
                return Err(Error::InvalidArgument("message exceeds MAX_MESSAGE_LEN"));
            }
            buf.resize(total_len as usize, 0);
            tokio::time::timeout(self.timeout, read_half.read_exact(&mut buf))
                .await
                .map_err(|_| Error::Timeout)??;
            let body = buf.split_to(total_len as usize).freeze();
            let request = Message::decode_body(body)?;

            if request.verb() == "Data" {
                let source_name = request.component(1);
                let is_boundary = request.flags().contains(MessageFlags::IS_BOUNDARY);
                let payload = request.payload().map(|b| b.as_ref()).unwrap_or(&[]);
                if let Err(e) = self.router.handle_data(source_name, payload, is_boundary) {
                    warn!(client_id = self.id, source = source_name, error = %e, "data delivery failed");
                }
                continue;
            }

            let verb = request.verb().to_string();
            let response = self.router.dispatch(self.id, &request);
            self.on_dispatched(&verb, &request, &response);
            self.write_message(&response).await?;
        }
    }

    /// Spawn or tear down a per-stream delivery task in reaction to a
    /// successfully dispatched `Stream.open`/`Stream.close`.
    fn on_dispatched(self: &Arc<Self>, verb: &str, request: &Message, response: &Message) {
        if response.status_code() != Some(STATUS_SUCCESS) {
            return;
        }
        match verb {
            "Stream.open" => {
                let Ok(stream_id) = response.component(1).parse::<StreamId>() else {
                    return;
                };
                if let Some(stream) = self.router.registries().streams.get(stream_id) {
                    self.spawn_stream_writer(stream);
                }
            }
            "Stream.close" => {
                if let Ok(stream_id) = request.component(1).parse::<StreamId>() {
                    if let Some(handle) = self.stream_tasks.lock().remove(&stream_id) {
                        handle.abort();
                    }
                }
            }
            _ => {}
        }
    }

    fn spawn_stream_writer(self: &Arc<Self>, stream: Arc<crate::stream::Stream>) {
        let session = self.clone();
        let stream_id = stream.id();
        let handle = tokio::spawn(async move {
            while let Some(chunk) = stream.recv().await {
                let mut msg = Message::request("Data", [chunk.stream_id.to_string()]);
                msg.set_boundary(chunk.is_boundary);
                msg.set_payload(chunk.bytes);
                if session.write_message(&msg).await.is_err() {
                    session.close();
                    break;
                }
            }
        });
        self.stream_tasks.lock().insert(stream_id, handle);
    }

    async fn write_message(&self, msg: &Message) -> Result<(), Error> {
        let encoded = msg.encode()?;
        let mut guard = self.write_half.lock().await;
        let Some(half) = guard.as_mut() else {
            return Err(Error::PeerDisconnected);
        };
        tokio::time::timeout(self.timeout, half.write_all(&encoded))
            .await
            .map_err(|_| Error::Timeout)??;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::Registries;

    #[test]
    fn new_session_is_not_closing() {
        let router = Router::new(Arc::new(Registries::new()));
        let session = ClientSession::new(1, router, Duration::from_secs(1));
        assert!(!session.is_closing());
        session.close();
        assert!(session.is_closing());
    }
}
