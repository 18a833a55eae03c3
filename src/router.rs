//! Verb dispatch table and request/response correlation (C8).
//!
//! A [`Router`] holds no per-connection state; it is shared (via
//! `Arc`) across every [`crate::session::ClientSession`] and dispatches
//! each request [`Message`] to the registry operation its verb names.
//! `Data` messages skip verb dispatch entirely and go straight to
//! [`crate::source::Source::send_encoded_chunk`] (§4.6's fast path).

use std::sync::Arc;

use tracing::warn;

use crate::codec::CodecRegistry;
use crate::frame::FrameProperties;
use crate::message::Message;
use crate::options::Options;
use crate::reencode::NativeRegistry;
use crate::source::{ClientId, SourceKind, SourceRegistry};
use crate::stream::{DropPolicy, StreamRegistry};
use crate::{Error, STATUS_SUCCESS};

/// Registries a [`Router`] dispatches verbs against, shared by every
/// session for the lifetime of one running [`crate::server::Server`].
pub struct Registries {
    /// Named ingress sources.
    pub sources: SourceRegistry,
    /// Per-subscriber egress streams.
    pub streams: StreamRegistry,
    /// Named codec factories.
    pub codecs: CodecRegistry,
    /// Codec-pair-specific native recoders.
    pub natives: NativeRegistry,
}

impl Registries {
    /// A fresh set of registries, pre-populated with the built-in codecs.
    pub fn new() -> Self {
        Self {
            sources: SourceRegistry::new(),
            streams: StreamRegistry::new(),
            codecs: CodecRegistry::with_builtins(),
            natives: NativeRegistry::new(),
        }
    }
}

impl Default for Registries {
    fn default() -> Self {
        Self::new()
    }
}

/// Stateless verb dispatcher, shared across every session.
#[derive(Clone)]
pub struct Router {
    registries: Arc<Registries>,
}

impl Router {
    /// Build a router over `registries`.
    pub fn new(registries: Arc<Registries>) -> Self {
        Self { registries }
    }

    /// Handle one request on behalf of `client_id`, returning the
    /// response message to send back. `Data` messages are not routed
    /// through here; see [`Router::handle_data`].
    pub fn dispatch(&self, client_id: ClientId, request: &Message) -> Message {
        let request_id = request.request_id();
        match self.try_dispatch(client_id, request) {
            Ok(extra) => Message::response(request_id, STATUS_SUCCESS, extra),
            Err(e) => {
                warn!(client_id, verb = request.verb(), error = %e, "verb failed");
                Message::response(request_id, e.status_code(), [e.to_string()])
            }
        }
    }

    fn try_dispatch(&self, client_id: ClientId, request: &Message) -> Result<Vec<String>, Error> {
        let r = &self.registries;
        match request.verb() {
            "Source.open" => {
                let name = request.component(1);
                let server_owned = request.component(2) == "server";
                let kind = if server_owned {
                    SourceKind::Server
                } else {
                    SourceKind::Client(client_id)
                };
                r.sources.open(name, kind)?;
                Ok(vec![])
            }
            "Source.setEncoding" => {
                let source = r
                    .sources
                    .get(request.component(1))
                    .ok_or_else(|| Error::NoSuchSource(request.component(1).to_string()))?;
                source.set_encoding(request.component(2), &r.codecs)?;
                Ok(vec![])
            }
            "Source.setFrameProperties" => {
                let source = r
                    .sources
                    .get(request.component(1))
                    .ok_or_else(|| Error::NoSuchSource(request.component(1).to_string()))?;
                let props = FrameProperties::parse(request.component(2))?;
                source.set_frame_properties(props)?;
                Ok(vec![])
            }
            "Source.close" => {
                r.sources.close(request.component(1), &r.streams)?;
                Ok(vec![])
            }
            "Source.getSourcesList" => Ok(r.sources.list()),
            "Stream.open" => {
                let source_name = request.component(1);
                if r.sources.get(source_name).is_none() {
                    return Err(Error::NoSuchSource(source_name.to_string()));
                }
                let opts = Options::parse(request.component(2))?;
                let encoding = r
                    .codecs
                    .get(&opts.name)
                    .ok_or_else(|| Error::NoSuchEncoding(opts.name.clone()))?;
                let drop_policy = parse_drop_policy(request.component(3));
                let stream = r
                    .streams
                    .open(client_id, source_name, encoding, opts, drop_policy);
                if let Some(source) = r.sources.get(source_name) {
                    source.attach_stream(stream.id());
                }
                Ok(vec![stream.id().to_string()])
            }
            "Stream.setEncoding" => {
                let stream_id: u64 = request
                    .component(1)
                    .parse()
                    .map_err(|_| Error::InvalidArgument("stream id is not a number"))?;
                let stream = r.streams.get(stream_id).ok_or(Error::NoSuchStream(stream_id))?;
                stream.set_encoding(request.component(2), &r.codecs)?;
                Ok(vec![])
            }
            "Stream.pause" => {
                let stream = get_stream(r, request.component(1))?;
                stream.pause();
                Ok(vec![])
            }
            "Stream.resume" => {
                let stream = get_stream(r, request.component(1))?;
                stream.resume();
                Ok(vec![])
            }
            "Stream.close" => {
                let stream_id: u64 = request
                    .component(1)
                    .parse()
                    .map_err(|_| Error::InvalidArgument("stream id is not a number"))?;
                if let Some(stream) = r.streams.get(stream_id) {
                    if let Some(source_name) = stream.source_name() {
                        if let Some(source) = r.sources.get(&source_name) {
                            source.detach_stream(stream_id);
                        }
                    }
                }
                r.streams.close(stream_id)?;
                Ok(vec![])
            }
            "Stream.attach" => {
                let stream = get_stream(r, request.component(1))?;
                let new_source_name = request.component(2);
                if let Some(old_name) = stream.source_name() {
                    if let Some(old_source) = r.sources.get(&old_name) {
                        old_source.detach_stream(stream.id());
                    }
                }
                let new_source = r
                    .sources
                    .get(new_source_name)
                    .ok_or_else(|| Error::NoSuchSource(new_source_name.to_string()))?;
                stream.attach(Some(new_source_name));
                new_source.attach_stream(stream.id());
                Ok(vec![])
            }
            other => Err(Error::UnknownVerb(other.to_string())),
        }
    }

    /// The `Data` fast path (§4.6): push an already-encoded chunk from
    /// `client_id`'s owned source straight to its attached streams,
    /// bypassing verb dispatch entirely.
    pub fn handle_data(&self, source_name: &str, chunk: &[u8], is_boundary: bool) -> Result<(), Error> {
        let source = self
            .registries
            .sources
            .get(source_name)
            .ok_or_else(|| Error::NoSuchSource(source_name.to_string()))?;
        source.send_encoded_chunk(chunk, is_boundary, &self.registries.streams, &self.registries.natives)
    }

    /// Release every source and stream owned by a disconnecting client
    /// (§3's ownership invariant, §8's no-leaked-sources property).
    pub fn release_client(&self, client_id: ClientId) {
        self.registries.streams.close_owned_by(client_id);
        self.registries.sources.close_owned_by(client_id, &self.registries.streams);
    }

    /// Shared registries, for callers (e.g. the hot path driven directly
    /// by a server-owned source) that need direct access.
    pub fn registries(&self) -> &Registries {
        &self.registries
    }
}

fn get_stream(r: &Registries, id_str: &str) -> Result<Arc<crate::stream::Stream>, Error> {
    let stream_id: u64 = id_str
        .parse()
        .map_err(|_| Error::InvalidArgument("stream id is not a number"))?;
    r.streams.get(stream_id).ok_or(Error::NoSuchStream(stream_id))
}

fn parse_drop_policy(s: &str) -> DropPolicy {
    match s {
        "block" => DropPolicy::Block,
        "drop_oldest" => DropPolicy::DropOldest,
        _ => DropPolicy::DropNewest,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_open_then_stream_open_round_trips() {
        let router = Router::new(Arc::new(Registries::new()));
        let open = Message::request(
            "Source.open",
            ["cam".to_string(), "server".to_string()],
        );
        let resp = router.dispatch(1, &open);
        assert_eq!(resp.status_code(), Some(STATUS_SUCCESS));

        let set_enc = Message::request(
            "Source.setEncoding",
            ["cam".to_string(), "raw".to_string()],
        );
        let resp = router.dispatch(1, &set_enc);
        assert_eq!(resp.status_code(), Some(STATUS_SUCCESS));

        let open_stream = Message::request(
            "Stream.open",
            ["cam".to_string(), "raw".to_string(), "drop_newest".to_string()],
        );
        let resp = router.dispatch(2, &open_stream);
        assert_eq!(resp.status_code(), Some(STATUS_SUCCESS));
        assert_eq!(resp.component(1), "0");
    }

    #[test]
    fn unknown_source_reports_error_status() {
        let router = Router::new(Arc::new(Registries::new()));
        let req = Message::request(
            "Source.setEncoding",
            ["missing".to_string(), "raw".to_string()],
        );
        let resp = router.dispatch(1, &req);
        assert_eq!(resp.status_code(), Some(Error::NoSuchSource(String::new()).status_code()));
    }

    #[test]
    fn release_client_closes_owned_sources() {
        let router = Router::new(Arc::new(Registries::new()));
        let open = Message::request("Source.open", ["cam".to_string(), "client".to_string()]);
        router.dispatch(9, &open);
        assert_eq!(router.registries().sources.len(), 1);
        router.release_client(9);
        assert_eq!(router.registries().sources.len(), 0);
    }

    #[test]
    fn getsourceslist_reports_prefixed_names() {
        let router = Router::new(Arc::new(Registries::new()));
        router.dispatch(1, &Message::request("Source.open", ["a".to_string(), "server".to_string()]));
        let resp = router.dispatch(1, &Message::request("Source.getSourcesList", []));
        assert_eq!(resp.component(1), "s:a");
    }

    #[test]
    fn stream_attach_rebinds_to_a_different_source() {
        let router = Router::new(Arc::new(Registries::new()));
        for name in ["cam1", "cam2"] {
            router.dispatch(1, &Message::request("Source.open", [name.to_string(), "server".to_string()]));
            router.dispatch(1, &Message::request("Source.setEncoding", [name.to_string(), "raw".to_string()]));
        }
        let resp = router.dispatch(
            2,
            &Message::request(
                "Stream.open",
                ["cam1".to_string(), "raw".to_string(), "drop_newest".to_string()],
            ),
        );
        let stream_id = resp.component(1).to_string();

        let resp = router.dispatch(
            2,
            &Message::request("Stream.attach", [stream_id.clone(), "cam2".to_string()]),
        );
        assert_eq!(resp.status_code(), Some(STATUS_SUCCESS));

        let stream = router
            .registries()
            .streams
            .get(stream_id.parse().unwrap())
            .unwrap();
        assert_eq!(stream.source_name().as_deref(), Some("cam2"));
    }

    #[test]
    fn stream_attach_to_missing_source_reports_error() {
        let router = Router::new(Arc::new(Registries::new()));
        router.dispatch(1, &Message::request("Source.open", ["cam1".to_string(), "server".to_string()]));
        router.dispatch(1, &Message::request("Source.setEncoding", ["cam1".to_string(), "raw".to_string()]));
        let resp = router.dispatch(
            2,
            &Message::request(
                "Stream.open",
                ["cam1".to_string(), "raw".to_string(), "drop_newest".to_string()],
            ),
        );
        let stream_id = resp.component(1).to_string();

        let resp = router.dispatch(
            2,
            &Message::request("Stream.attach", [stream_id, "missing".to_string()]),
        );
        assert_eq!(resp.status_code(), Some(Error::NoSuchSource(String::new()).status_code()));
    }
}
