//! The broker process (C8/C9 glue): owns the shared registries and
//! router, accepts connections, and drives one [`ClientSession`] per
//! connection.
//!
//! Owns the general source/stream/codec registries and an admission
//! limiter (`semaphore.rs`, condvar-based), bridged onto the async
//! accept loop via `spawn_blocking` since the semaphore blocks on a
//! condvar rather than yielding to the executor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::ToSocketAddrs;
use tracing::debug;

use crate::frame::RawFrame;
use crate::router::{Registries, Router};
use crate::semaphore::Semaphore;
use crate::session::ClientSession;
use crate::source::{Source, SourceKind};
use crate::Error;

const DEFAULT_MAX_CLIENTS: usize = 16;

/// Construction-time parameters for a [`Server`] (§9's ambient
/// configuration surface: in-process parameters only, no file/env
/// loading).
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Per-I/O-operation timeout applied to every client connection.
    pub timeout: Duration,
    /// Maximum number of concurrently connected clients.
    pub max_clients: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            timeout: crate::DEFAULT_TIMEOUT,
            max_clients: DEFAULT_MAX_CLIENTS,
        }
    }
}

/// A running broker instance: the source/stream/codec registries, the
/// verb router, and the accept loop. Cheap to clone; every clone shares
/// the same registries.
#[derive(Clone)]
pub struct Server {
    registries: Arc<Registries>,
    router: Router,
    config: ServerConfig,
    next_client_id: Arc<AtomicU64>,
}

impl Server {
    /// A new server with default configuration.
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    /// A new server with explicit configuration.
    pub fn with_config(config: ServerConfig) -> Self {
        let registries = Arc::new(Registries::new());
        let router = Router::new(registries.clone());
        Self {
            registries,
            router,
            config,
            next_client_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// The router dispatching against this server's registries, for
    /// callers that want to issue verbs in-process without a socket
    /// round trip (e.g. tests, or an embedding application driving the
    /// broker directly).
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Open a server-owned source directly, bypassing the wire protocol.
    /// Convenient for an embedding process that captures frames itself.
    pub fn open_source(&self, name: &str) -> Result<Arc<Source>, Error> {
        self.registries.sources.open(name, SourceKind::Server)
    }

    /// Accept connections on `addr` until the listener errors. Each
    /// connection is admitted only once a semaphore permit frees up
    /// (bounding concurrent clients to `config.max_clients`), then
    /// handled by its own [`ClientSession`] on a spawned task.
    pub async fn serve(&self, addr: impl ToSocketAddrs + std::fmt::Debug) -> Result<(), Error> {
        debug!(?addr, "starting server");
        let semaphore = Arc::new(Semaphore::new(self.config.max_clients));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        while let Ok((socket, peer)) = listener.accept().await {
            debug!(?peer, "new connection");
            let semaphore = semaphore.clone();
            let permit = tokio::task::spawn_blocking(move || semaphore.acquire())
                .await
                .map_err(|_| Error::Internal("semaphore task panicked"))?;
            let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
            let session = ClientSession::new(client_id, self.router.clone(), self.config.timeout);
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(e) = session.run(socket).await {
                    debug!(client_id, error = %e, "session ended with error");
                }
            });
        }
        Ok(())
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::STATUS_SUCCESS;

    #[test]
    fn router_dispatches_in_process_without_a_socket() {
        let server = Server::new();
        server.open_source("cam").unwrap();
        let resp = server.router().dispatch(
            1,
            &Message::request("Source.setEncoding", ["cam".to_string(), "raw".to_string()]),
        );
        assert_eq!(resp.status_code(), Some(STATUS_SUCCESS));
    }
}
