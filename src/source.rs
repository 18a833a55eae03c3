//! Source registry and frame fan-out (C5).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::codec::{CodecRegistry, Encoder, Encoding};
use crate::frame::{FrameProperties, RawFrame};
use crate::lockable::Lockable;
use crate::options::Options;
use crate::reencode::NativeRegistry;
use crate::stream::{StreamId, StreamRegistry};
use crate::Error;

/// Opaque identifier for a connected client session, used as a source's
/// owner when `kind` is [`SourceKind::Client`].
pub type ClientId = u64;

/// A source's shared identity: the registry key, `"c:"`/`"s:"`-prefixed
/// in `Source.getSourcesList` (§4.4, §6).
pub type SourceId = Arc<str>;

/// Whether a source is a server-side capture or a client-pushed feed
/// (§3).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SourceKind {
    /// Owned by the process itself; survives any single client
    /// disconnecting.
    Server,
    /// Owned by the connected client that opened it; destroyed when
    /// that client disconnects.
    Client(ClientId),
}

impl SourceKind {
    fn list_prefix(self) -> &'static str {
        match self {
            SourceKind::Client(_) => "c:",
            SourceKind::Server => "s:",
        }
    }
}

/// Bytes are drained from a source's encoder in chunks no larger than
/// this, matching the "source's payload-buffer size" referenced in
/// §4.4's hot path.
pub const PAYLOAD_CHUNK_SIZE: usize = 64 * 1024;

struct SourceState {
    kind: SourceKind,
    props: Option<FrameProperties>,
    encoding: Option<Encoding>,
    encoding_options: Option<Options>,
    encoder: Option<Box<dyn Encoder>>,
    streams: BTreeSet<StreamId>,
    closed: bool,
}

/// A named ingress: owns its current encoding, encoder, frame
/// properties, and the set of attached stream ids (§4.4).
pub struct Source {
    name: SourceId,
    state: Lockable<SourceState>,
}

impl Source {
    fn new(name: SourceId, kind: SourceKind) -> Self {
        Self {
            name,
            state: Lockable::new(SourceState {
                kind,
                props: None,
                encoding: None,
                encoding_options: None,
                encoder: None,
                streams: BTreeSet::new(),
                closed: false,
            }),
        }
    }

    /// The source's registry name (without the `c:`/`s:` prefix).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Which kind of source this is, and its owner if client-owned.
    pub fn kind(&self) -> SourceKind {
        self.state.with_ref(|s| s.kind)
    }

    /// Current frame properties, if any have been installed.
    pub fn frame_properties(&self) -> Option<FrameProperties> {
        self.state.with_ref(|s| s.props)
    }

    /// Current encoding, if any has been set.
    pub fn encoding(&self) -> Option<(Encoding, Options)> {
        self.state
            .with_ref(|s| s.encoding.clone().zip(s.encoding_options.clone()))
    }

    /// Whether the source has been closed.
    pub fn is_closed(&self) -> bool {
        self.state.with_ref(|s| s.closed)
    }

    /// Attach a stream id to this source's fan-out set.
    pub fn attach_stream(&self, stream_id: StreamId) {
        self.state.with(|s| {
            s.streams.insert(stream_id);
        });
    }

    /// Detach a stream id.
    pub fn detach_stream(&self, stream_id: StreamId) {
        self.state.with(|s| {
            s.streams.remove(&stream_id);
        });
    }

    /// `Source.setEncoding` (§4.4): parse `descriptor`, look the codec up
    /// by its `%name` key, and replace the source's encoding. Any
    /// existing encoder is discarded; it is lazily rebuilt by the next
    /// `send_frame`. Existing streams are not touched here — they
    /// observe the change and rebuild their own reencoders lazily
    /// (§9's open-question resolution).
    pub fn set_encoding(&self, descriptor: &str, codecs: &CodecRegistry) -> Result<(), Error> {
        let opts = Options::parse(descriptor)?;
        let encoding = codecs
            .get(&opts.name)
            .ok_or_else(|| Error::NoSuchEncoding(opts.name.clone()))?;
        self.state.with(|s| {
            s.encoding = Some(encoding);
            s.encoding_options = Some(opts);
            s.encoder = None;
        });
        debug!(source = %self.name, "encoding changed");
        Ok(())
    }

    /// `Source.setFrameProperties` (§4.4): install or replace the
    /// pinned frame shape. Discards any existing encoder bound to the
    /// old shape.
    pub fn set_frame_properties(&self, props: FrameProperties) -> Result<(), Error> {
        self.state.with(|s| {
            s.props = Some(props);
            s.encoder = None;
        });
        Ok(())
    }

    /// The hot path (§4.4): push one raw frame through the source's
    /// encoder and fan the encoded bytes out to every attached stream,
    /// acquiring stream locks in ascending id order to avoid ABBA
    /// deadlocks with the global `Source -> Stream(ascending)` ordering
    /// (§5).
    pub fn send_frame(
        &self,
        frame: RawFrame,
        streams: &StreamRegistry,
        natives: &NativeRegistry,
    ) -> Result<(), Error> {
        let chunks = self.state.with(|s| -> Result<Vec<(Vec<u8>, bool)>, Error> {
            if s.closed {
                return Err(Error::InvalidState("source is closed"));
            }
            if s.props.is_none() {
                s.props = Some(frame.props);
            }
            let props = s.props.expect("just installed above");
            if frame.props != props {
                return Err(Error::InvalidArgument(
                    "frame shape does not match the source's pinned frame properties",
                ));
            }
            if s.encoder.is_none() {
                let encoding = s
                    .encoding
                    .as_ref()
                    .ok_or(Error::InvalidState("source has no encoding set"))?;
                let opts = s.encoding_options.as_ref().expect("set alongside encoding");
                s.encoder = Some(encoding.make_encoder(props, opts)?);
            }
            let encoder = s.encoder.as_mut().expect("constructed above");
            encoder.encode(&frame)?;

            let mut chunks = Vec::new();
            loop {
                let ready = encoder.data_ready();
                if ready == 0 {
                    break;
                }
                let mut buf = vec![0u8; ready.min(PAYLOAD_CHUNK_SIZE)];
                let n = encoder.read_data(&mut buf);
                buf.truncate(n);
                let is_boundary = encoder.data_ready() == 0 && encoder.frame_boundary_after_drain();
                chunks.push((buf, is_boundary));
            }
            Ok(chunks)
        })?;

        let (props, encoding, opts) = self.state.with_ref(|s| {
            (
                s.props.expect("pinned above"),
                s.encoding.clone().expect("checked above"),
                s.encoding_options.clone().expect("set alongside encoding"),
            )
        });
        let stream_ids = self.state.with_ref(|s| s.streams.iter().copied().collect::<Vec<_>>());
        for (chunk, is_boundary) in chunks {
            for stream_id in &stream_ids {
                if let Some(stream) = streams.get(*stream_id) {
                    if let Err(e) =
                        stream.deliver(&encoding, &opts, props, &chunk, is_boundary, natives)
                    {
                        warn!(source = %self.name, stream_id, error = %e, "stream delivery failed");
                    }
                }
            }
        }
        Ok(())
    }

    /// The server-side analogue of the hot path's drain step, used by
    /// the router when the producer (a remote client) already encoded
    /// the frame itself (§4.6). `is_boundary` is taken from the `Data`
    /// message's header flag rather than derived from an encoder.
    pub fn send_encoded_chunk(
        &self,
        chunk: &[u8],
        is_boundary: bool,
        streams: &StreamRegistry,
        natives: &NativeRegistry,
    ) -> Result<(), Error> {
        let (props, encoding, opts) = self.state.with_ref(|s| -> Result<_, Error> {
            if s.closed {
                return Err(Error::InvalidState("source is closed"));
            }
            let props = s.props.ok_or(Error::InvalidState("source has no frame properties set"))?;
            let encoding = s
                .encoding
                .clone()
                .ok_or(Error::InvalidState("source has no encoding set"))?;
            let opts = s.encoding_options.clone().expect("set alongside encoding");
            Ok((props, encoding, opts))
        })?;
        let stream_ids = self.state.with_ref(|s| s.streams.iter().copied().collect::<Vec<_>>());
        for stream_id in &stream_ids {
            if let Some(stream) = streams.get(*stream_id) {
                if let Err(e) =
                    stream.deliver(&encoding, &opts, props, chunk, is_boundary, natives)
                {
                    warn!(source = %self.name, stream_id, error = %e, "stream delivery failed");
                }
            }
        }
        Ok(())
    }

    /// `Source.close` (§4.4): mark the source closed, release its
    /// encoder and properties, and orphan every attached stream.
    fn close(&self, streams: &StreamRegistry) {
        let stream_ids = self.state.with(|s| {
            s.closed = true;
            s.encoder = None;
            s.props = None;
            s.streams.iter().copied().collect::<Vec<_>>()
        });
        for stream_id in stream_ids {
            if let Some(stream) = streams.get(stream_id) {
                stream.orphan();
            }
        }
    }
}

/// Process-scoped table of named sources (§4.4, §9). Owned by
/// [`crate::server::Server`] rather than exposed as a bare global, so
/// independent brokers (and tests) don't share state.
#[derive(Default)]
pub struct SourceRegistry {
    sources: Mutex<BTreeMap<SourceId, Arc<Source>>>,
}

impl SourceRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// `Source.open` (§4.4).
    pub fn open(&self, name: &str, kind: SourceKind) -> Result<Arc<Source>, Error> {
        let mut sources = self.sources.lock();
        if sources.contains_key(name) {
            return Err(Error::NameInUse(name.to_string()));
        }
        let id: SourceId = Arc::from(name);
        let source = Arc::new(Source::new(id.clone(), kind));
        sources.insert(id, source.clone());
        debug!(source = name, ?kind, "source opened");
        Ok(source)
    }

    /// Look a source up by name.
    pub fn get(&self, name: &str) -> Option<Arc<Source>> {
        self.sources.lock().get(name).cloned()
    }

    /// `Source.close` (§4.4): removes the name from the registry (a
    /// later `open` of the same name succeeds immediately) and orphans
    /// attached streams. The `Source` object itself is dropped once the
    /// last `Arc` (held here and by any in-flight hot-path call) goes
    /// away, taking its encoder with it — satisfying the "no leaked
    /// sources" invariant (§8).
    pub fn close(&self, name: &str, streams: &StreamRegistry) -> Result<(), Error> {
        let source = self
            .sources
            .lock()
            .remove(name)
            .ok_or_else(|| Error::NoSuchSource(name.to_string()))?;
        source.close(streams);
        debug!(source = name, "source closed");
        Ok(())
    }

    /// Close and remove every source owned by `client_id` (client
    /// disconnect, §3's ownership invariant).
    pub fn close_owned_by(&self, client_id: ClientId, streams: &StreamRegistry) {
        let names: Vec<SourceId> = self
            .sources
            .lock()
            .iter()
            .filter(|(_, s)| matches!(s.kind(), SourceKind::Client(id) if id == client_id))
            .map(|(name, _)| name.clone())
            .collect();
        for name in names {
            let _ = self.close(&name, streams);
        }
    }

    /// `Source.getSourcesList` (§4.4, §8 scenario 6): every source name,
    /// `c:`/`s:`-prefixed. Order is unspecified; callers treat the
    /// result as a set.
    pub fn list(&self) -> Vec<String> {
        self.sources
            .lock()
            .values()
            .map(|s| format!("{}{}", s.kind().list_prefix(), s.name()))
            .collect()
    }

    /// Number of registered sources, used by the "no leaked sources"
    /// invariant (§8).
    pub fn len(&self) -> usize {
        self.sources.lock().len()
    }

    /// Whether the registry holds no sources.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecRegistry;
    use crate::frame::SampleDepth;
    use crate::stream::{DropPolicy, StreamRegistry};

    fn props() -> FrameProperties {
        FrameProperties::new(2, 2, SampleDepth::U8, 1)
    }

    #[test]
    fn open_rejects_duplicate_names() {
        let registry = SourceRegistry::new();
        registry.open("cam", SourceKind::Server).unwrap();
        let err = registry.open("cam", SourceKind::Server).unwrap_err();
        assert!(matches!(err, Error::NameInUse(_)));
    }

    #[test]
    fn list_reports_prefixed_names() {
        let registry = SourceRegistry::new();
        registry.open("a", SourceKind::Client(1)).unwrap();
        registry.open("b", SourceKind::Server).unwrap();
        let mut list = registry.list();
        list.sort();
        assert_eq!(list, vec!["c:a".to_string(), "s:b".to_string()]);
    }

    #[test]
    fn send_frame_rejects_mismatched_shape_after_pinning() {
        let registry = SourceRegistry::new();
        let codecs = CodecRegistry::with_builtins();
        let streams = StreamRegistry::new();
        let natives = crate::reencode::NativeRegistry::new();
        let source = registry.open("cam", SourceKind::Server).unwrap();
        source.set_encoding("raw", &codecs).unwrap();
        let frame = RawFrame::new(props(), Arc::new(vec![0; props().frame_byte_size()]));
        source.send_frame(frame, &streams, &natives).unwrap();

        let wrong_props = FrameProperties::new(4, 4, SampleDepth::U8, 1);
        let bad_frame = RawFrame::new(wrong_props, Arc::new(vec![0; wrong_props.frame_byte_size()]));
        let err = source.send_frame(bad_frame, &streams, &natives).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn close_orphans_attached_streams() {
        let registry = SourceRegistry::new();
        let streams = StreamRegistry::new();
        let codecs = CodecRegistry::with_builtins();
        let source = registry.open("cam", SourceKind::Server).unwrap();
        source.set_encoding("raw", &codecs).unwrap();
        let raw = codecs.get("raw").unwrap();
        let opts = Options::parse("raw").unwrap();
        let stream = streams.open(1, "cam", raw, opts, DropPolicy::default());
        source.attach_stream(stream.id());

        registry.close("cam", &streams).unwrap();
        assert!(stream.is_orphaned());
        assert!(registry.is_empty());
    }
}
