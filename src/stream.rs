//! Stream state machine and per-subscriber delivery (C6).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_channel::TrySendError;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::codec::Encoding;
use crate::lockable::{CondWait, Lockable};
use crate::options::Options;
use crate::reencode::{self, NativeRegistry, Reencoder};
use crate::source::ClientId;
use crate::{frame::FrameProperties, Error};

/// Identifier for a stream, assigned by [`StreamRegistry::open`].
pub type StreamId = u64;

/// How a stream handles a subscriber that cannot keep up (§5, glossary).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DropPolicy {
    /// Suspend the delivering call until outbox space frees, up to the
    /// stream's configured timeout; past that, the stream is closed.
    Block,
    /// Discard the chunk that doesn't fit, then keep discarding until
    /// the next frame boundary so delivered bytes stay frame-aligned.
    DropNewest,
    /// Evict the oldest queued chunk to make room, then mark the next
    /// delivered chunk as a boundary so the subscriber can resync.
    DropOldest,
}

impl Default for DropPolicy {
    fn default() -> Self {
        DropPolicy::DropNewest
    }
}

/// A stream's lifecycle state (§4.5).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StreamState {
    /// Delivering chunks normally.
    Flowing,
    /// Delivery is suspended; chunks are dropped, not buffered.
    Paused,
    /// The source closed; no more frames will ever arrive.
    Orphaned,
    /// Closed by verb or subscriber disconnect; terminal.
    Closed,
}

/// One re-encoded chunk queued for delivery to a stream's subscriber.
#[derive(Clone, Debug)]
pub struct QueuedChunk {
    /// Which stream produced this chunk.
    pub stream_id: StreamId,
    /// Re-encoded payload bytes.
    pub bytes: Bytes,
    /// Whether this chunk ends a logical frame.
    pub is_boundary: bool,
}

struct Binding {
    source_encoding_name: String,
    source_opts: Options,
    props: FrameProperties,
}

struct StreamInner {
    source_name: Option<String>,
    requested_encoding: Encoding,
    requested_opts: Options,
    reencoder: Option<Reencoder>,
    binding: Option<Binding>,
    drop_policy: DropPolicy,
    state: StreamState,
    dropping_until_boundary: bool,
    force_next_boundary: bool,
}

/// Default bound on how many chunks may be queued for one stream's
/// subscriber before the drop policy kicks in.
pub const DEFAULT_STREAM_QUEUE_CAPACITY: usize = 8;

/// A per-subscriber egress: owns a reencoder, delivery state, and a
/// bounded delivery queue governed by its drop policy (§4.5, §3).
pub struct Stream {
    id: StreamId,
    subscriber: ClientId,
    state: Lockable<StreamInner>,
    tx: async_channel::Sender<QueuedChunk>,
    rx: async_channel::Receiver<QueuedChunk>,
    block_timeout: Duration,
    /// Bumped and notified every time a chunk is dequeued, so the
    /// `block` drop policy can wait on a condvar (§4.2, §5) instead of
    /// busy-polling for queue space.
    queue_freed: CondWait<u64>,
}

impl Stream {
    /// The stream's id.
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// The subscribing client.
    pub fn subscriber(&self) -> ClientId {
        self.subscriber
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StreamState {
        self.state.with_ref(|s| s.state)
    }

    /// Whether the stream is orphaned (its source closed).
    pub fn is_orphaned(&self) -> bool {
        self.state() == StreamState::Orphaned
    }

    /// Whether the stream is closed.
    pub fn is_closed(&self) -> bool {
        self.state() == StreamState::Closed
    }

    /// The source name this stream is attached to, if any.
    pub fn source_name(&self) -> Option<String> {
        self.state.with_ref(|s| s.source_name.clone())
    }

    /// Which [`reencode::ReencoderKind`] is currently bound, if the
    /// reencoder has been built at least once. Exposed for introspection
    /// and for asserting selection outcomes in tests (§4.7, §8 scenarios
    /// 1/2/3).
    pub fn reencoder_kind(&self) -> Option<reencode::ReencoderKind> {
        self.state.with_ref(|s| s.reencoder.as_ref().map(Reencoder::kind))
    }

    /// `Stream.pause` (§4.5).
    pub fn pause(&self) {
        self.state.with(|s| {
            if s.state == StreamState::Flowing {
                s.state = StreamState::Paused;
            }
        });
    }

    /// `Stream.resume` (§4.5).
    pub fn resume(&self) {
        self.state.with(|s| {
            if s.state == StreamState::Paused {
                s.state = StreamState::Flowing;
            }
        });
    }

    /// `Stream.close` (§4.5): terminal, idempotent.
    pub fn close(&self) {
        self.state.with(|s| s.state = StreamState::Closed);
        self.rx.close();
    }

    fn mark_closed(&self) {
        self.close();
    }

    /// Source-closure transition: `flowing -> orphaned` (§4.5). A no-op
    /// if the stream is already closed.
    pub fn orphan(&self) {
        self.state.with(|s| {
            if s.state != StreamState::Closed {
                s.state = StreamState::Orphaned;
            }
        });
    }

    /// `Stream.setEncoding` (§4.5): replaces the requested encoding; the
    /// reencoder is torn down and rebuilt lazily on the next delivery.
    pub fn set_encoding(&self, descriptor: &str, codecs: &crate::codec::CodecRegistry) -> Result<(), Error> {
        let opts = Options::parse(descriptor)?;
        let encoding = codecs
            .get(&opts.name)
            .ok_or_else(|| Error::NoSuchEncoding(opts.name.clone()))?;
        self.state.with(|s| {
            s.requested_encoding = encoding;
            s.requested_opts = opts;
            s.reencoder = None;
            s.binding = None;
        });
        Ok(())
    }

    /// `Stream.attach`/`detach` (§4.5): rebind to a different source
    /// name. The reencoder is discarded; it rebuilds lazily against the
    /// new source on the next delivery.
    pub fn attach(&self, source_name: Option<&str>) {
        self.state.with(|s| {
            s.source_name = source_name.map(String::from);
            s.reencoder = None;
            s.binding = None;
            if s.state == StreamState::Orphaned {
                s.state = StreamState::Flowing;
            }
        });
    }

    /// Receive the next chunk ready for this stream's subscriber. Used
    /// by the client session's writer loop.
    pub async fn recv(&self) -> Option<QueuedChunk> {
        let chunk = self.rx.recv().await.ok();
        if chunk.is_some() {
            self.notify_queue_freed();
        }
        chunk
    }

    /// Non-blocking poll of the delivery queue, for callers (and tests)
    /// that know a chunk was already enqueued synchronously by
    /// [`Stream::deliver`] and don't want to spin up an executor to read
    /// it back.
    pub fn try_recv(&self) -> Option<QueuedChunk> {
        let chunk = self.rx.try_recv().ok();
        if chunk.is_some() {
            self.notify_queue_freed();
        }
        chunk
    }

    /// Wake any deliverer parked in the `block` drop policy (§4.2, §5):
    /// called whenever a chunk leaves the queue, freeing a slot.
    fn notify_queue_freed(&self) {
        self.queue_freed.with(|g| *g = g.wrapping_add(1));
        self.queue_freed.notify_all();
    }

    /// Whether the delivery queue currently holds no chunks.
    pub fn queue_is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// The delivery path driven by the owning source while holding its
    /// own lock (§4.5): rebuild the reencoder if the source's
    /// `(encoding, options, props)` triple changed since it was last
    /// built, run the chunk through it, and enqueue the result per the
    /// stream's drop policy.
    pub fn deliver(
        &self,
        source_encoding: &Encoding,
        source_opts: &Options,
        props: FrameProperties,
        chunk: &[u8],
        is_boundary: bool,
        natives: &NativeRegistry,
    ) -> Result<(), Error> {
        let plan = self.state.with(|s| -> Result<Option<(Bytes, bool, DropPolicy)>, Error> {
            if !matches!(s.state, StreamState::Flowing) {
                return Ok(None);
            }
            let needs_rebuild = match &s.binding {
                Some(b) => {
                    b.source_encoding_name != source_encoding.name()
                        || !b.source_opts.equiv(source_opts)
                        || b.props != props
                }
                None => true,
            };
            if needs_rebuild || s.reencoder.is_none() {
                let reencoder = reencode::select(
                    natives,
                    source_encoding,
                    source_opts,
                    &s.requested_encoding,
                    &s.requested_opts,
                    props,
                )?;
                debug!(stream_id = self.id, kind = ?reencoder.kind(), "reencoder rebuilt");
                s.reencoder = Some(reencoder);
                s.binding = Some(Binding {
                    source_encoding_name: source_encoding.name().to_string(),
                    source_opts: source_opts.clone(),
                    props,
                });
            }
            let reencoder = s.reencoder.as_mut().expect("constructed above");
            let output = match reencoder.reencode(chunk, is_boundary) {
                Ok(out) => out,
                Err(e) => {
                    warn!(stream_id = self.id, error = %e, "reencoder desynced on bad input, discarding to next boundary");
                    s.reencoder = None;
                    s.binding = None;
                    return Ok(None);
                }
            };
            let mut out_boundary = output.is_boundary;
            if s.force_next_boundary {
                out_boundary = true;
                s.force_next_boundary = false;
            }
            if s.dropping_until_boundary {
                if out_boundary {
                    s.dropping_until_boundary = false;
                }
                return Ok(None);
            }
            Ok(Some((Bytes::from(output.bytes), out_boundary, s.drop_policy)))
        })?;

        let Some((bytes, is_boundary, drop_policy)) = plan else {
            return Ok(());
        };
        let mut outgoing = QueuedChunk {
            stream_id: self.id,
            bytes,
            is_boundary,
        };
        match drop_policy {
            DropPolicy::Block => {
                let deadline = Instant::now() + self.block_timeout;
                loop {
                    match self.tx.try_send(outgoing) {
                        Ok(()) => break,
                        Err(TrySendError::Full(returned)) => {
                            outgoing = returned;
                            let remaining = deadline.saturating_duration_since(Instant::now());
                            if remaining.is_zero() {
                                warn!(stream_id = self.id, "block policy timed out, closing subscriber");
                                self.mark_closed();
                                break;
                            }
                            let seen_gen = self.queue_freed.with(|g| *g);
                            self.queue_freed.wait_while(remaining, |g| *g == seen_gen);
                        }
                        Err(TrySendError::Closed(_)) => {
                            self.mark_closed();
                            break;
                        }
                    }
                }
            }
            DropPolicy::DropNewest => {
                if self.tx.try_send(outgoing).is_err() {
                    self.state.with(|s| {
                        if !is_boundary {
                            s.dropping_until_boundary = true;
                        }
                    });
                }
            }
            DropPolicy::DropOldest => {
                if let Err(TrySendError::Full(returned)) = self.tx.try_send(outgoing) {
                    let evicted = self.rx.try_recv().is_ok();
                    let _ = self.tx.try_send(returned);
                    if evicted {
                        self.state.with(|s| s.force_next_boundary = true);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Process-scoped table of live streams, keyed by [`StreamId`] (§4.5,
/// §9). Owned by [`crate::server::Server`].
#[derive(Default)]
pub struct StreamRegistry {
    streams: Mutex<HashMap<StreamId, Arc<Stream>>>,
    next_id: AtomicU64,
}

impl StreamRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// `Stream.open` (§4.5). Always succeeds; stream ids are minted
    /// fresh.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        &self,
        subscriber: ClientId,
        source_name: &str,
        requested_encoding: Encoding,
        requested_opts: Options,
        drop_policy: DropPolicy,
    ) -> Arc<Stream> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = async_channel::bounded(DEFAULT_STREAM_QUEUE_CAPACITY);
        let stream = Arc::new(Stream {
            id,
            subscriber,
            state: Lockable::new(StreamInner {
                source_name: Some(source_name.to_string()),
                requested_encoding,
                requested_opts,
                reencoder: None,
                binding: None,
                drop_policy,
                state: StreamState::Flowing,
                dropping_until_boundary: false,
                force_next_boundary: false,
            }),
            tx,
            rx,
            block_timeout: crate::DEFAULT_TIMEOUT,
            queue_freed: CondWait::new(0u64),
        });
        self.streams.lock().insert(id, stream.clone());
        debug!(stream_id = id, subscriber, source = source_name, "stream opened");
        stream
    }

    /// Look a stream up by id.
    pub fn get(&self, id: StreamId) -> Option<Arc<Stream>> {
        self.streams.lock().get(&id).cloned()
    }

    /// `Stream.close` (§4.5).
    pub fn close(&self, id: StreamId) -> Result<(), Error> {
        let stream = self
            .streams
            .lock()
            .remove(&id)
            .ok_or(Error::NoSuchStream(id))?;
        stream.close();
        Ok(())
    }

    /// Close and remove every stream owned by `client_id` (subscriber
    /// disconnect).
    pub fn close_owned_by(&self, client_id: ClientId) {
        let ids: Vec<StreamId> = self
            .streams
            .lock()
            .iter()
            .filter(|(_, s)| s.subscriber() == client_id)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            let _ = self.close(id);
        }
    }

    /// Number of live streams.
    pub fn len(&self) -> usize {
        self.streams.lock().len()
    }

    /// Whether the registry holds no streams.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
