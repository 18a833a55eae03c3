//! Synchronous peer client (C9, peer side). Connects over a blocking
//! `std::net::TcpStream` and speaks the TLV [`Message`] protocol: issue
//! a verb with [`Client::call`], wait for its correlated response, and
//! drain stream chunks with [`Client::recv_data`].
//!
//! No fixed handshake: any verb sequence is valid, and a connection can
//! carry any number of open sources/streams at once.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use bytes::Bytes;

use crate::message::Message;
use crate::{Error, MAX_MESSAGE_LEN};

/// A blocking connection to a broker.
pub struct Client {
    stream: TcpStream,
    next_request_id: u32,
    /// `Data` messages received while waiting on a different request's
    /// response, held until the caller asks for them via
    /// [`Client::recv_data`].
    pending_data: VecDeque<Message>,
}

impl Client {
    /// Connect to `addr`, failing if the connection isn't established
    /// within `timeout`. All subsequent I/O also honors `timeout`.
    pub fn connect(addr: impl ToSocketAddrs, timeout: Duration) -> Result<Self, Error> {
        let mut stream = TcpStream::connect_timeout(
            &addr.to_socket_addrs()?.next().ok_or(Error::InvalidArgument("no address resolved"))?,
            timeout,
        )?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            next_request_id: 0,
            pending_data: VecDeque::new(),
        })
    }

    fn next_id(&mut self) -> u32 {
        self.next_request_id = self.next_request_id.wrapping_add(1);
        self.next_request_id
    }

    fn write_message(&mut self, msg: &Message) -> Result<(), Error> {
        let encoded = msg.encode()?;
        self.stream.write_all(&encoded)?;
        Ok(())
    }

    fn read_message(&mut self) -> Result<Message, Error> {
        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf)?;
        let total_len = u32::from_le_bytes(len_buf);
        if total_len > MAX_MESSAGE_LEN {
            return Err(Error::InvalidArgument("message exceeds MAX_MESSAGE_LEN"));
        }
        let mut body = vec![0u8; total_len as usize];
        self.stream.read_exact(&mut body)?;
        Message::decode_body(Bytes::from(body))
    }

    /// Issue a request and block for its correlated response. Any `Data`
    /// messages that arrive first (from a stream this client already
    /// subscribed to) are queued for [`Client::recv_data`] rather than
    /// discarded.
    pub fn call(&mut self, verb: &str, args: impl IntoIterator<Item = String>) -> Result<Message, Error> {
        let mut request = Message::request(verb, args);
        let request_id = self.next_id();
        request.set_request_id(request_id);
        self.write_message(&request)?;
        loop {
            let msg = self.read_message()?;
            if msg.is_response() && msg.request_id() == request_id {
                return Ok(msg);
            }
            self.pending_data.push_back(msg);
        }
    }

    /// Push one already-encoded chunk into a source this client owns.
    /// Fire-and-forget: `Data` never elicits a response (§4.6).
    pub fn send_data(&mut self, source_name: &str, payload: impl Into<Bytes>, is_boundary: bool) -> Result<(), Error> {
        let mut msg = Message::request("Data", [source_name.to_string()]);
        msg.set_boundary(is_boundary);
        msg.set_payload(payload);
        self.write_message(&msg)
    }

    /// Block for the next `Data` message addressed to any stream this
    /// client subscribed to, pulling from the queue filled by
    /// [`Client::call`] first.
    pub fn recv_data(&mut self) -> Result<Message, Error> {
        if let Some(msg) = self.pending_data.pop_front() {
            return Ok(msg);
        }
        self.read_message()
    }
}

impl Iterator for Client {
    type Item = Result<Message, Error>;

    /// Equivalent to repeatedly calling [`Client::recv_data`].
    fn next(&mut self) -> Option<Self::Item> {
        Some(self.recv_data())
    }
}
