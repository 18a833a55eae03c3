//! Frame properties and the uncompressed frame value type (C4).

use std::sync::Arc;

/// Sample depth of a single channel in an uncompressed frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SampleDepth {
    /// 8-bit unsigned samples.
    U8,
    /// 16-bit unsigned samples.
    U16,
    /// 32-bit floating point samples.
    F32,
}

impl SampleDepth {
    /// Size of one sample in bytes.
    pub fn byte_size(self) -> usize {
        match self {
            SampleDepth::U8 => 1,
            SampleDepth::U16 => 2,
            SampleDepth::F32 => 4,
        }
    }
}

/// Immutable shape descriptor for frames flowing through a source.
///
/// Installed once on a [`crate::source::Source`] (either explicitly via
/// `set_frame_properties` or implicitly from the first pushed frame) and
/// never mutated afterwards; a later frame whose shape differs is
/// rejected (§4.4).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct FrameProperties {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Per-channel sample depth.
    pub depth: SampleDepth,
    /// Number of channels (e.g. 1 for luma, 3 for RGB, 4 for RGBA).
    pub channels: u8,
}

impl FrameProperties {
    /// Create a new shape descriptor.
    pub fn new(width: u32, height: u32, depth: SampleDepth, channels: u8) -> Self {
        Self {
            width,
            height,
            depth,
            channels,
        }
    }

    /// Size in bytes of one uncompressed frame of this shape.
    pub fn frame_byte_size(&self) -> usize {
        self.width as usize
            * self.height as usize
            * self.channels as usize
            * self.depth.byte_size()
    }

    /// Parse the `"w,h,depth,channels"` wire encoding used by
    /// `Source.setFrameProperties` (§6).
    pub fn parse(s: &str) -> Result<Self, crate::Error> {
        let mut parts = s.split(',');
        let mut next_int = |field: &'static str| -> Result<u64, crate::Error> {
            let part = parts
                .next()
                .ok_or_else(|| parse_err(s, field, "missing field"))?;
            part.trim()
                .parse::<u64>()
                .map_err(|_| parse_err(s, field, "not an integer"))
        };
        let width = next_int("width")?;
        let height = next_int("height")?;
        let depth_raw = parts
            .next()
            .ok_or_else(|| parse_err(s, "depth", "missing field"))?;
        let depth = match depth_raw.trim() {
            "U8" => SampleDepth::U8,
            "U16" => SampleDepth::U16,
            "F32" => SampleDepth::F32,
            _ => return Err(parse_err(s, "depth", "unknown sample depth")),
        };
        let channels = next_int("channels")?;
        if parts.next().is_some() {
            return Err(parse_err(s, "channels", "trailing data"));
        }
        Ok(Self {
            width: width as u32,
            height: height as u32,
            depth,
            channels: channels as u8,
        })
    }
}

fn parse_err(s: &str, field: &'static str, reason: &'static str) -> crate::Error {
    // Offset reporting is best-effort: point at the start of the field's
    // segment rather than tracking exact cursor position through split().
    let offset = s.find(field).unwrap_or(0);
    crate::Error::ParseError {
        offset,
        message: format!("{field}: {reason}"),
    }
}

impl std::fmt::Display for FrameProperties {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{},{},{:?},{}",
            self.width, self.height, self.depth, self.channels
        )
    }
}

/// A single uncompressed frame, as pushed into a source or produced by a
/// [`crate::codec::Decoder`].
#[derive(Clone, Debug)]
pub struct RawFrame {
    /// Shape this frame claims to have; the source validates it against
    /// its pinned [`FrameProperties`] before accepting the frame.
    pub props: FrameProperties,
    /// Packed uncompressed sample data, `props.frame_byte_size()` bytes.
    pub data: Arc<Vec<u8>>,
}

impl RawFrame {
    /// Create a new raw frame, wrapping `data` in an `Arc` to avoid
    /// copying when fanned out to multiple streams.
    pub fn new(props: FrameProperties, data: Arc<Vec<u8>>) -> Self {
        Self { props, data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_properties() {
        let props = FrameProperties::parse("640,480,U8,3").unwrap();
        assert_eq!(props, FrameProperties::new(640, 480, SampleDepth::U8, 3));
    }

    #[test]
    fn rejects_unknown_depth() {
        let err = FrameProperties::parse("640,480,U4,3").unwrap_err();
        assert!(matches!(err, crate::Error::ParseError { .. }));
    }

    #[test]
    fn rejects_trailing_data() {
        assert!(FrameProperties::parse("640,480,U8,3,extra").is_err());
    }

    #[test]
    fn frame_byte_size_accounts_for_depth_and_channels() {
        let props = FrameProperties::new(2, 2, SampleDepth::U16, 3);
        assert_eq!(props.frame_byte_size(), 2 * 2 * 3 * 2);
    }
}
