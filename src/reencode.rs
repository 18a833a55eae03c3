//! The reencoder adapter (C7): bridges a source's encoded byte stream to
//! a stream's requested encoding, and the deterministic selection
//! algorithm that picks which variant to build (§4.7).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::codec::{Decoder, Encoder, Encoding};
use crate::frame::FrameProperties;
use crate::options::Options;
use crate::Error;

/// The bytes produced by one call to [`Reencoder::reencode`], and
/// whether they end a logical frame in the stream's requested encoding.
pub struct ReencodeOutput {
    /// Re-encoded bytes ready for delivery to the subscriber.
    pub bytes: Vec<u8>,
    /// Whether `bytes` ends a logical frame.
    pub is_boundary: bool,
}

/// A codec-pair-specific in-place recode, used by the
/// [`Reencoder::CodecNative`] variant (e.g. an FFV1-to-FFV1 container
/// metadata rewrite that avoids a full decode/encode round trip).
pub trait NativeRecoder: Send {
    /// Recode one chunk of input bytes, preserving frame-boundary
    /// semantics: the output is a boundary iff `is_boundary` is set.
    fn reencode(&mut self, in_bytes: &[u8], is_boundary: bool) -> Result<Vec<u8>, Error>;
}

type NativeFactory =
    dyn Fn(FrameProperties, &Options, &Options) -> Result<Box<dyn NativeRecoder>, Error> + Send + Sync;

/// Registry of `(in_encoding, out_encoding) -> NativeRecoder` factories,
/// consulted by step 2 of the selection algorithm.
#[derive(Default)]
pub struct NativeRegistry {
    table: Mutex<HashMap<(String, String), Arc<NativeFactory>>>,
}

impl NativeRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a native recoder factory for the `(in_name, out_name)`
    /// encoding pair.
    pub fn register(
        &self,
        in_name: impl Into<String>,
        out_name: impl Into<String>,
        factory: impl Fn(FrameProperties, &Options, &Options) -> Result<Box<dyn NativeRecoder>, Error>
            + Send
            + Sync
            + 'static,
    ) {
        self.table
            .lock()
            .insert((in_name.into(), out_name.into()), Arc::new(factory));
    }

    fn get(&self, in_name: &str, out_name: &str) -> Option<Arc<NativeFactory>> {
        self.table
            .lock()
            .get(&(in_name.to_string(), out_name.to_string()))
            .cloned()
    }
}

/// The adapter a [`crate::stream::Stream`] drives to turn a source's
/// encoded bytes into bytes in the stream's requested encoding (§4.7).
pub enum Reencoder {
    /// Source and stream share an encoding with equivalent options:
    /// bytes pass through untouched.
    DirectCopy,
    /// Full decode into an intermediate raw frame, then re-encode.
    DecodeEncode {
        /// Decodes the source's encoding into raw frames.
        decoder: Box<dyn Decoder>,
        /// Encodes raw frames into the stream's requested encoding.
        encoder: Box<dyn Encoder>,
    },
    /// A codec-pair-specific in-place recode.
    CodecNative(Box<dyn NativeRecoder>),
}

/// Which [`Reencoder`] variant is active, for introspection/logging and
/// for asserting selection outcomes in tests (§8 scenario 1/2).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReencoderKind {
    /// See [`Reencoder::DirectCopy`].
    DirectCopy,
    /// See [`Reencoder::DecodeEncode`].
    DecodeEncode,
    /// See [`Reencoder::CodecNative`].
    CodecNative,
}

impl Reencoder {
    /// The variant currently active.
    pub fn kind(&self) -> ReencoderKind {
        match self {
            Reencoder::DirectCopy => ReencoderKind::DirectCopy,
            Reencoder::DecodeEncode { .. } => ReencoderKind::DecodeEncode,
            Reencoder::CodecNative(_) => ReencoderKind::CodecNative,
        }
    }

    /// Run one chunk of source-encoded bytes through the adapter.
    pub fn reencode(&mut self, in_bytes: &[u8], is_boundary: bool) -> Result<ReencodeOutput, Error> {
        match self {
            Reencoder::DirectCopy => Ok(ReencodeOutput {
                bytes: in_bytes.to_vec(),
                is_boundary,
            }),
            Reencoder::CodecNative(native) => Ok(ReencodeOutput {
                bytes: native.reencode(in_bytes, is_boundary)?,
                is_boundary,
            }),
            Reencoder::DecodeEncode { decoder, encoder } => {
                decoder.write_data(in_bytes)?;
                // §4.7(2): a boundary flushes both halves, so a
                // buffering decoder/encoder doesn't swallow a partial
                // frame at the end of the input.
                if is_boundary {
                    decoder.finish()?;
                }
                while decoder.frame_ready() {
                    if let Some(frame) = decoder.read_frame() {
                        encoder.encode(&frame)?;
                    }
                }
                if is_boundary {
                    encoder.flush()?;
                }
                let mut out = vec![0u8; encoder.data_ready()];
                let n = encoder.read_data(&mut out);
                out.truncate(n);
                Ok(ReencodeOutput {
                    bytes: out,
                    is_boundary,
                })
            }
        }
    }
}

/// Selection algorithm (§4.7): deterministic given
/// `(source_encoding, stream_encoding, source_opts, stream_opts, props)`.
///
/// 1. If encodings match by name and options are equivalent per
///    [`Options::equiv`] → [`Reencoder::DirectCopy`].
/// 2. Else if `(source, stream)` is registered in `natives` →
///    [`Reencoder::CodecNative`].
/// 3. Else → [`Reencoder::DecodeEncode`].
pub fn select(
    natives: &NativeRegistry,
    source_encoding: &Encoding,
    source_opts: &Options,
    stream_encoding: &Encoding,
    stream_opts: &Options,
    props: FrameProperties,
) -> Result<Reencoder, Error> {
    if source_encoding.name() == stream_encoding.name() && source_opts.equiv(stream_opts) {
        return Ok(Reencoder::DirectCopy);
    }
    if let Some(factory) = natives.get(source_encoding.name(), stream_encoding.name()) {
        let native = factory(props, source_opts, stream_opts)?;
        return Ok(Reencoder::CodecNative(native));
    }
    let decoder = source_encoding.make_decoder(props, source_opts)?;
    let encoder = stream_encoding.make_encoder(props, stream_opts)?;
    Ok(Reencoder::DecodeEncode { decoder, encoder })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecRegistry;
    use crate::frame::{RawFrame, SampleDepth};

    fn props() -> FrameProperties {
        FrameProperties::new(2, 2, SampleDepth::U8, 1)
    }

    #[test]
    fn selects_direct_copy_for_identical_encoding_and_options() {
        let codecs = CodecRegistry::with_builtins();
        let natives = NativeRegistry::new();
        let enc = codecs.get("raw").unwrap();
        let opts = Options::parse("raw").unwrap();
        let mut reencoder = select(&natives, &enc, &opts, &enc, &opts, props()).unwrap();
        assert_eq!(reencoder.kind(), ReencoderKind::DirectCopy);
        let out = reencoder.reencode(&[1, 2, 3], true).unwrap();
        assert_eq!(out.bytes, vec![1, 2, 3]);
        assert!(out.is_boundary);
    }

    #[test]
    fn selects_decode_encode_when_no_native_pair_registered() {
        let codecs = CodecRegistry::with_builtins();
        let natives = NativeRegistry::new();
        let raw = codecs.get("raw").unwrap();
        let mjpeg = codecs.get("mjpeg_passthrough").unwrap();
        let raw_opts = Options::parse("raw").unwrap();
        let mjpeg_opts = Options::parse("mjpeg_passthrough").unwrap();
        let reencoder = select(&natives, &raw, &raw_opts, &mjpeg, &mjpeg_opts, props()).unwrap();
        assert_eq!(reencoder.kind(), ReencoderKind::DecodeEncode);
    }

    #[test]
    fn decode_encode_round_trips_raw_frame_bytes() {
        let codecs = CodecRegistry::with_builtins();
        let natives = NativeRegistry::new();
        let raw = codecs.get("raw").unwrap();
        let opts_a = Options::parse("raw:x=1").unwrap();
        let opts_b = Options::parse("raw:x=2").unwrap();
        // different options on the same encoding name -> not DirectCopy
        let mut reencoder = select(&natives, &raw, &opts_a, &raw, &opts_b, props()).unwrap();
        assert_eq!(reencoder.kind(), ReencoderKind::DecodeEncode);
        let frame = RawFrame::new(props(), Arc::new(vec![9, 9, 9, 9]));
        let out = reencoder.reencode(&frame.data, true).unwrap();
        assert_eq!(out.bytes, vec![9, 9, 9, 9]);
    }

    #[test]
    fn selects_codec_native_when_pair_registered() {
        let codecs = CodecRegistry::with_builtins();
        let natives = NativeRegistry::new();
        natives.register("raw", "mjpeg_passthrough", |_props, _in_opts, _out_opts| {
            struct PassThrough;
            impl NativeRecoder for PassThrough {
                fn reencode(&mut self, in_bytes: &[u8], _is_boundary: bool) -> Result<Vec<u8>, Error> {
                    Ok(in_bytes.to_vec())
                }
            }
            Ok(Box::new(PassThrough) as Box<dyn NativeRecoder>)
        });
        let raw = codecs.get("raw").unwrap();
        let mjpeg = codecs.get("mjpeg_passthrough").unwrap();
        let raw_opts = Options::parse("raw").unwrap();
        let mjpeg_opts = Options::parse("mjpeg_passthrough").unwrap();
        let mut reencoder = select(&natives, &raw, &raw_opts, &mjpeg, &mjpeg_opts, props()).unwrap();
        assert_eq!(reencoder.kind(), ReencoderKind::CodecNative);
        let out = reencoder.reencode(&[5, 6, 7], false).unwrap();
        assert_eq!(out.bytes, vec![5, 6, 7]);
    }
}
