#![doc = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/", "README.md"))]
#![deny(missing_docs)]
//! SVR is a video broker: named [`source::Source`]s push encoded frames,
//! named [`stream::Stream`]s subscribe and receive them re-encoded to
//! whatever encoding they asked for. Clients and the broker talk over a
//! single TLV message protocol (see [`message`]).

pub mod client;
#[cfg(feature = "async-client")]
pub mod client_async;
pub mod codec;
pub mod frame;
pub mod lockable;
pub mod message;
pub mod options;
pub mod reencode;
pub mod router;
mod semaphore;
pub mod server;
pub mod session;
pub mod source;
pub mod stream;

pub use codec::{CodecRegistry, Decoder, Encoder, Encoding, EncodingFlags};
pub use frame::{FrameProperties, RawFrame, SampleDepth};
pub use message::{Message, MessageFlags};
pub use reencode::{Reencoder, ReencoderKind};
pub use server::{Server, ServerConfig};
pub use source::{SourceId, SourceKind};
pub use stream::{DropPolicy, Stream, StreamId, StreamState};

/// Wire protocol version advertised by this crate's message header.
pub const API_VERSION: u8 = 1;

/// Maximum total length of a single message frame on the wire (§6).
pub const MAX_MESSAGE_LEN: u32 = 16 * 1024 * 1024;

/// Default request/response timeout, used unless a [`ServerConfig`]
/// overrides it.
pub const DEFAULT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Status code meaning success, carried in component 0 of a response message.
pub const STATUS_SUCCESS: i32 = 0;

/// Closed error taxonomy shared by every fallible verb in the broker.
///
/// Every variant except [`Error::Io`] and [`Error::Decode`] has a stable
/// wire status code via [`Error::status_code`], used to fill component 0
/// of a response message.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A component or option string could not be parsed.
    #[error("parse error at byte {offset}: {message}")]
    ParseError {
        /// Byte offset of the offending character.
        offset: usize,
        /// Human-readable description.
        message: String,
    },
    /// No encoding is registered under the requested name.
    #[error("no such encoding: {0}")]
    NoSuchEncoding(String),
    /// No source is registered under the requested name.
    #[error("no such source: {0}")]
    NoSuchSource(String),
    /// The request's verb (component 0) is not in the router's dispatch
    /// table.
    #[error("unknown verb: {0}")]
    UnknownVerb(String),
    /// No stream is registered under the requested id.
    #[error("no such stream: {0}")]
    NoSuchStream(u64),
    /// A source or stream name is already registered.
    #[error("name in use: {0}")]
    NameInUse(String),
    /// The object is not in a state that permits the requested operation.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    /// The caller-supplied argument is invalid (e.g. mismatched frame shape).
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// The caller is not permitted to perform this operation.
    #[error("unauthorized")]
    Unauthorized,
    /// A request/response wait exceeded its timeout.
    #[error("timed out")]
    Timeout,
    /// The peer disconnected before a response (or more data) arrived.
    #[error("peer disconnected")]
    PeerDisconnected,
    /// An internal invariant was violated; the caller should treat this as fatal.
    #[error("internal error: {0}")]
    Internal(&'static str),
    /// Transport I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The wire status code for this error, transmitted as a signed
    /// integer in component 0 of an error response (§6, §7). `0` is
    /// reserved for success and is never returned here.
    pub fn status_code(&self) -> i32 {
        match self {
            Error::ParseError { .. } => -1,
            Error::NoSuchEncoding(_) => -2,
            Error::NoSuchSource(_) => -3,
            Error::UnknownVerb(_) => -13,
            Error::NoSuchStream(_) => -4,
            Error::NameInUse(_) => -5,
            Error::InvalidState(_) => -6,
            Error::InvalidArgument(_) => -7,
            Error::Unauthorized => -8,
            Error::Timeout => -9,
            Error::PeerDisconnected => -10,
            Error::Internal(_) => -11,
            Error::Io(_) => -12,
        }
    }
}
