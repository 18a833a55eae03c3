//! The message value type and its wire codec (C1).
//!
//! The distilled spec describes an arena that owns each message's
//! component strings for the message's lifetime, freed on `release`.
//! In safe Rust that guarantee is simply ordinary ownership: a
//! [`Message`] owns its components and payload, and `Drop` frees them
//! when the message (or whatever is holding it) goes out of scope —
//! there is no separate arena object to model.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Error, MAX_MESSAGE_LEN};

bitflags! {
    /// Header flag bits (§6, plus the boundary bit added by this crate
    /// per §9's open question).
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct MessageFlags: u8 {
        /// Set on a message that is a response to an earlier request.
        const IS_RESPONSE = 0b0000_0001;
        /// Set on a `Data` message whose payload ends a logical frame.
        /// This is the explicit frame-boundary signal §9 recommends in
        /// place of relying on codec self-synchronization.
        const IS_BOUNDARY = 0b0000_0010;
    }
}

/// A discrete, length-delimited protocol message: an ordered list of
/// UTF-8 components (component 0 is the verb for a request, the status
/// code for a response) plus an optional opaque payload.
#[derive(Clone, Debug, Default)]
pub struct Message {
    request_id: u32,
    flags: MessageFlags,
    components: Vec<Box<str>>,
    payload: Option<Bytes>,
}

impl Message {
    /// Create a new message with `n_components` empty string components.
    pub fn new(n_components: usize) -> Self {
        Self {
            request_id: 0,
            flags: MessageFlags::empty(),
            components: vec![Box::from(""); n_components],
            payload: None,
        }
    }

    /// Build a request message for `verb` with the given components
    /// (component 0 is `verb`).
    pub fn request(verb: &str, args: impl IntoIterator<Item = String>) -> Self {
        let mut components = vec![Box::from(verb)];
        components.extend(args.into_iter().map(Box::from));
        Self {
            request_id: 0,
            flags: MessageFlags::empty(),
            components,
            payload: None,
        }
    }

    /// Build a response message carrying `status` in component 0.
    pub fn response(request_id: u32, status: i32, extra: impl IntoIterator<Item = String>) -> Self {
        let mut components = vec![Box::from(status.to_string())];
        components.extend(extra.into_iter().map(Box::from));
        Self {
            request_id,
            flags: MessageFlags::IS_RESPONSE,
            components,
            payload: None,
        }
    }

    /// Replace component `i`. Panics if `i` is out of range, matching
    /// the fixed-arity construction implied by `new(n_components)`.
    pub fn set_component(&mut self, i: usize, value: impl Into<Box<str>>) {
        self.components[i] = value.into();
    }

    /// Attach an opaque payload.
    pub fn set_payload(&mut self, data: impl Into<Bytes>) {
        self.payload = Some(data.into());
    }

    /// The verb (component 0) of a request message.
    pub fn verb(&self) -> &str {
        self.components.first().map(Box::as_ref).unwrap_or("")
    }

    /// Component `i`, or `""` if absent.
    pub fn component(&self, i: usize) -> &str {
        self.components.get(i).map(Box::as_ref).unwrap_or("")
    }

    /// All components.
    pub fn components(&self) -> &[Box<str>] {
        &self.components
    }

    /// The opaque payload, if any.
    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    /// Take ownership of the payload, leaving `None` behind.
    pub fn take_payload(&mut self) -> Option<Bytes> {
        self.payload.take()
    }

    /// The request id used to correlate a response with its request.
    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    /// Set the request id.
    pub fn set_request_id(&mut self, id: u32) {
        self.request_id = id;
    }

    /// Header flags.
    pub fn flags(&self) -> MessageFlags {
        self.flags
    }

    /// Set header flags.
    pub fn set_flags(&mut self, flags: MessageFlags) {
        self.flags = flags;
    }

    /// Whether this message is a response.
    pub fn is_response(&self) -> bool {
        self.flags.contains(MessageFlags::IS_RESPONSE)
    }

    /// Whether this message's payload ends a logical frame.
    pub fn is_boundary(&self) -> bool {
        self.flags.contains(MessageFlags::IS_BOUNDARY)
    }

    /// Mark this message as carrying a frame boundary.
    pub fn set_boundary(&mut self, boundary: bool) {
        self.flags.set(MessageFlags::IS_BOUNDARY, boundary);
    }

    /// Parse the status code out of a response's component 0.
    pub fn status_code(&self) -> Option<i32> {
        self.component(0).parse().ok()
    }

    /// Encode this message to its wire representation, including the
    /// leading `total_len` prefix. `total_len` is the byte count of
    /// everything *after* the `total_len` field itself.
    pub fn encode(&self) -> Result<Bytes, Error> {
        let mut body = BytesMut::new();
        body.put_u16_le(u16::try_from(self.components.len()).map_err(|_| {
            Error::InvalidArgument("too many components")
        })?);
        body.put_u32_le(self.request_id);
        body.put_u8(self.flags.bits());
        for component in &self.components {
            let bytes = component.as_bytes();
            body.put_u32_le(u32::try_from(bytes.len()).map_err(|_| {
                Error::InvalidArgument("component too large")
            })?);
            body.put_slice(bytes);
        }
        let payload = self.payload.as_deref().unwrap_or(&[]);
        body.put_u32_le(u32::try_from(payload.len()).map_err(|_| {
            Error::InvalidArgument("payload too large")
        })?);
        body.put_slice(payload);

        let total_len = u32::try_from(body.len())
            .map_err(|_| Error::InvalidArgument("message too large"))?;
        if total_len > MAX_MESSAGE_LEN {
            return Err(Error::InvalidArgument("message exceeds MAX_MESSAGE_LEN"));
        }
        let mut framed = BytesMut::with_capacity(4 + body.len());
        framed.put_u32_le(total_len);
        framed.extend_from_slice(&body);
        Ok(framed.freeze())
    }

    /// Parse a message body (everything after the `total_len` prefix,
    /// exactly `total_len` bytes) already read off the wire.
    pub fn decode_body(mut body: Bytes) -> Result<Self, Error> {
        if body.len() < 7 {
            return Err(decode_err("truncated header"));
        }
        let n_components = body.get_u16_le() as usize;
        let request_id = body.get_u32_le();
        let flags = MessageFlags::from_bits_truncate(body.get_u8());
        let mut components = Vec::with_capacity(n_components);
        for _ in 0..n_components {
            if body.remaining() < 4 {
                return Err(decode_err("truncated component length"));
            }
            let len = body.get_u32_le() as usize;
            if body.remaining() < len {
                return Err(decode_err("truncated component data"));
            }
            let bytes = body.split_to(len);
            let s = std::str::from_utf8(&bytes).map_err(|_| decode_err("component is not UTF-8"))?;
            components.push(Box::from(s));
        }
        if body.remaining() < 4 {
            return Err(decode_err("truncated payload length"));
        }
        let payload_len = body.get_u32_le() as usize;
        if body.remaining() < payload_len {
            return Err(decode_err("truncated payload data"));
        }
        let payload = if payload_len > 0 {
            Some(body.split_to(payload_len))
        } else {
            None
        };
        Ok(Self {
            request_id,
            flags,
            components,
            payload,
        })
    }
}

fn decode_err(message: &'static str) -> Error {
    Error::ParseError {
        offset: 0,
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_wire_encoding() {
        let mut msg = Message::request(
            "Source.open",
            ["cam".to_string(), "client".to_string()],
        );
        msg.set_request_id(42);
        msg.set_payload(Bytes::from_static(b"hello"));
        msg.set_boundary(true);

        let encoded = msg.encode().unwrap();
        // total_len prefix does not include itself.
        let total_len = u32::from_le_bytes(encoded[..4].try_into().unwrap());
        assert_eq!(total_len as usize, encoded.len() - 4);

        let decoded = Message::decode_body(encoded.slice(4..)).unwrap();
        assert_eq!(decoded.request_id(), 42);
        assert_eq!(decoded.verb(), "Source.open");
        assert_eq!(decoded.component(1), "cam");
        assert_eq!(decoded.payload().unwrap().as_ref(), b"hello");
        assert!(decoded.is_boundary());
        assert!(!decoded.is_response());
    }

    #[test]
    fn response_carries_status_in_component_zero() {
        let msg = Message::response(7, crate::STATUS_SUCCESS, []);
        assert!(msg.is_response());
        assert_eq!(msg.status_code(), Some(0));
    }

    #[test]
    fn decode_rejects_truncated_body() {
        let body = Bytes::from_static(&[0, 0]);
        assert!(Message::decode_body(body).is_err());
    }

    #[test]
    fn decode_rejects_invalid_utf8_component() {
        let mut body = BytesMut::new();
        body.put_u16_le(1);
        body.put_u32_le(0);
        body.put_u8(0);
        body.put_u32_le(2);
        body.put_slice(&[0xff, 0xff]);
        body.put_u32_le(0);
        assert!(Message::decode_body(body.freeze()).is_err());
    }
}
