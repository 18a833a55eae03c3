//! Encoder/decoder registry (C3): named codec factories, plus the two
//! built-in codecs this crate ships so the reencoder pipeline is
//! testable without linking an external image/codec library (out of
//! scope per §1).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::frame::{FrameProperties, RawFrame};
use crate::options::Options;
use crate::Error;

bitflags! {
    /// Capabilities an [`Encoding`] advertises, consulted by the
    /// reencoder's selection algorithm (§4.7).
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct EncodingFlags: u8 {
        /// A byte-exact `DirectCopy` is possible between two sources
        /// using this encoding with equivalent options.
        const BYTE_EXACT_PASSTHROUGH = 0b0000_0001;
        /// Consecutive frames may reference each other (e.g. FFV1
        /// delta frames); a `CodecNative` recode must preserve this.
        const INTERFRAME_FRIENDLY = 0b0000_0010;
        /// The encoding is lossless; round-tripping through
        /// decode+encode reproduces the input exactly.
        const LOSSLESS = 0b0000_0100;
    }
}

/// A push-in/pull-out encode engine bound to a fixed frame shape.
///
/// `encode` pushes one uncompressed frame; the caller then drains
/// output in chunks via `data_ready`/`read_data` until `data_ready`
/// returns zero. An encoder that cannot itself mark a chunk as ending a
/// logical frame reports [`Encoder::frame_boundary_after_drain`] so the
/// source can assert the boundary once draining is exhausted (§4.4).
pub trait Encoder: Send {
    /// Push one uncompressed frame into the encoder.
    fn encode(&mut self, frame: &RawFrame) -> Result<(), Error>;
    /// Bytes currently buffered and ready to be read out.
    fn data_ready(&self) -> usize;
    /// Drain up to `buf.len()` bytes of encoded output, returning the
    /// number of bytes written.
    fn read_data(&mut self, buf: &mut [u8]) -> usize;
    /// Whether the caller must assert a frame boundary itself once
    /// `data_ready()` returns zero after a push, rather than relying on
    /// the encoder to mark it inline.
    fn frame_boundary_after_drain(&self) -> bool {
        true
    }
    /// Force any output the encoder is holding back (e.g. waiting for a
    /// full coding unit) to become readable via `data_ready`/
    /// `read_data`, even if incomplete. Called on a frame boundary so a
    /// buffering encoder doesn't swallow it (§4.7); codecs that never
    /// buffer output across a boundary can leave this as a no-op.
    fn flush(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// The dual of [`Encoder`]: a push-in/pull-out decode engine.
pub trait Decoder: Send {
    /// Feed `buf` into the decoder.
    fn write_data(&mut self, buf: &[u8]) -> Result<(), Error>;
    /// Whether a complete frame is ready to be read out.
    fn frame_ready(&self) -> bool;
    /// Take the next decoded frame. Returns `None` if
    /// [`Decoder::frame_ready`] was false.
    fn read_frame(&mut self) -> Option<RawFrame>;
    /// Force any partially-written bytes the decoder is holding onto to
    /// be treated as a complete frame, making it available via
    /// `frame_ready`/`read_frame`. Called on a frame boundary (§4.7);
    /// codecs that never hold a partial frame across a boundary can
    /// leave this as a no-op.
    fn finish(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

type MakeEncoder = dyn Fn(FrameProperties, &Options) -> Result<Box<dyn Encoder>, Error> + Send + Sync;
type MakeDecoder = dyn Fn(FrameProperties, &Options) -> Result<Box<dyn Decoder>, Error> + Send + Sync;

/// A named codec factory: produces streaming [`Encoder`]/[`Decoder`]
/// engines bound to frame properties and parsed options (§3).
#[derive(Clone)]
pub struct Encoding {
    name: Arc<str>,
    flags: EncodingFlags,
    make_encoder: Arc<MakeEncoder>,
    make_decoder: Arc<MakeDecoder>,
}

impl fmt::Debug for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Encoding")
            .field("name", &self.name)
            .field("flags", &self.flags)
            .finish()
    }
}

impl Encoding {
    /// Register a new encoding under `name`.
    pub fn new(
        name: impl Into<Arc<str>>,
        flags: EncodingFlags,
        make_encoder: impl Fn(FrameProperties, &Options) -> Result<Box<dyn Encoder>, Error>
            + Send
            + Sync
            + 'static,
        make_decoder: impl Fn(FrameProperties, &Options) -> Result<Box<dyn Decoder>, Error>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            flags,
            make_encoder: Arc::new(make_encoder),
            make_decoder: Arc::new(make_decoder),
        }
    }

    /// The encoding's registered name (the `%name` option key).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Capability flags.
    pub fn flags(&self) -> EncodingFlags {
        self.flags
    }

    /// Construct a new encoder bound to `props` and `opts`.
    pub fn make_encoder(&self, props: FrameProperties, opts: &Options) -> Result<Box<dyn Encoder>, Error> {
        (self.make_encoder)(props, opts)
    }

    /// Construct a new decoder bound to `props` and `opts`.
    pub fn make_decoder(&self, props: FrameProperties, opts: &Options) -> Result<Box<dyn Decoder>, Error> {
        (self.make_decoder)(props, opts)
    }
}

/// Registry mapping encoding name to [`Encoding`] factory.
///
/// One registry is created per running broker (owned by
/// [`crate::server::Server`]); this crate deliberately avoids a bare
/// global `static` registry so that multiple independent brokers (and
/// tests) don't share mutable codec state, even though §9's design
/// notes describe the registry as a process-wide singleton — a single
/// `Server` per process gets the same effect without the global.
#[derive(Default)]
pub struct CodecRegistry {
    encodings: Mutex<HashMap<String, Encoding>>,
}

impl CodecRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-populated with this crate's built-in codecs
    /// (`raw` and `mjpeg_passthrough`).
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register(builtin::raw_encoding());
        registry.register(builtin::mjpeg_passthrough_encoding());
        registry
    }

    /// Register `encoding`, replacing any prior registration under the
    /// same name.
    pub fn register(&self, encoding: Encoding) {
        self.encodings.lock().insert(encoding.name().to_string(), encoding);
    }

    /// Look up an encoding by name.
    pub fn get(&self, name: &str) -> Option<Encoding> {
        self.encodings.lock().get(name).cloned()
    }
}

/// Built-in codecs. These stand in for the external JPEG/raw/FFV1
/// libraries §1 places out of scope, giving the reencoder pipeline
/// something real to drive in tests and examples.
pub mod builtin {
    use super::*;

    /// The identity codec: "encoding" a frame is copying its bytes
    /// verbatim, since the wire representation of `raw` *is* the
    /// uncompressed sample data. Every frame is its own boundary.
    pub fn raw_encoding() -> Encoding {
        Encoding::new(
            "raw",
            EncodingFlags::BYTE_EXACT_PASSTHROUGH | EncodingFlags::LOSSLESS,
            |props, _opts| Ok(Box::new(RawCodec::new(props)) as Box<dyn Encoder>),
            |props, _opts| Ok(Box::new(RawCodec::new(props)) as Box<dyn Decoder>),
        )
    }

    struct RawCodec {
        props: FrameProperties,
        buffered: Vec<u8>,
        pending_frame: Option<RawFrame>,
    }

    impl RawCodec {
        fn new(props: FrameProperties) -> Self {
            Self {
                props,
                buffered: Vec::new(),
                pending_frame: None,
            }
        }
    }

    impl Encoder for RawCodec {
        fn encode(&mut self, frame: &RawFrame) -> Result<(), Error> {
            if frame.props != self.props {
                return Err(Error::InvalidArgument("frame shape does not match encoder props"));
            }
            self.buffered.extend_from_slice(&frame.data);
            Ok(())
        }

        fn data_ready(&self) -> usize {
            self.buffered.len()
        }

        fn read_data(&mut self, buf: &mut [u8]) -> usize {
            let n = buf.len().min(self.buffered.len());
            buf[..n].copy_from_slice(&self.buffered[..n]);
            self.buffered.drain(..n);
            n
        }

        fn frame_boundary_after_drain(&self) -> bool {
            true
        }
    }

    impl Decoder for RawCodec {
        fn write_data(&mut self, buf: &[u8]) -> Result<(), Error> {
            self.buffered.extend_from_slice(buf);
            let frame_size = self.props.frame_byte_size();
            if frame_size > 0 && self.buffered.len() >= frame_size {
                let data = self.buffered.drain(..frame_size).collect::<Vec<u8>>();
                self.pending_frame = Some(RawFrame::new(self.props, Arc::new(data)));
            }
            Ok(())
        }

        fn frame_ready(&self) -> bool {
            self.pending_frame.is_some()
        }

        fn read_frame(&mut self) -> Option<RawFrame> {
            self.pending_frame.take()
        }
    }

    /// Stands in for an external motion-JPEG encoder: treats the
    /// uncompressed input as already encoded opaque bytes and passes it
    /// through, so `CodecNative`/passthrough selection can be exercised
    /// without a real JPEG dependency.
    pub fn mjpeg_passthrough_encoding() -> Encoding {
        Encoding::new(
            "mjpeg_passthrough",
            EncodingFlags::BYTE_EXACT_PASSTHROUGH,
            |props, _opts| Ok(Box::new(RawCodec::new(props)) as Box<dyn Encoder>),
            |props, _opts| Ok(Box::new(RawCodec::new(props)) as Box<dyn Decoder>),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::SampleDepth;

    fn props() -> FrameProperties {
        FrameProperties::new(2, 2, SampleDepth::U8, 1)
    }

    #[test]
    fn registry_round_trips_builtin_lookup() {
        let registry = CodecRegistry::with_builtins();
        let enc = registry.get("raw").expect("raw registered");
        assert!(enc.flags().contains(EncodingFlags::LOSSLESS));
        assert!(registry.get("nope").is_none());
    }

    #[test]
    fn raw_codec_encode_decode_round_trips() {
        let registry = CodecRegistry::with_builtins();
        let encoding = registry.get("raw").unwrap();
        let opts = Options::parse("raw").unwrap();
        let mut encoder = encoding.make_encoder(props(), &opts).unwrap();
        let frame = RawFrame::new(props(), Arc::new(vec![1, 2, 3, 4]));
        encoder.encode(&frame).unwrap();
        let mut out = vec![0u8; encoder.data_ready()];
        let n = encoder.read_data(&mut out);
        assert_eq!(&out[..n], &[1, 2, 3, 4]);

        let mut decoder = encoding.make_decoder(props(), &opts).unwrap();
        decoder.write_data(&out[..n]).unwrap();
        assert!(decoder.frame_ready());
        let decoded = decoder.read_frame().unwrap();
        assert_eq!(decoded.data.as_ref(), frame.data.as_ref());
    }

    #[test]
    fn raw_codec_rejects_mismatched_shape() {
        let registry = CodecRegistry::with_builtins();
        let encoding = registry.get("raw").unwrap();
        let opts = Options::parse("raw").unwrap();
        let mut encoder = encoding.make_encoder(props(), &opts).unwrap();
        let other_props = FrameProperties::new(4, 4, SampleDepth::U8, 1);
        let frame = RawFrame::new(other_props, Arc::new(vec![0; 16]));
        assert!(encoder.encode(&frame).is_err());
    }
}
