//! Asynchronous peer client (C9, peer side), mirroring [`crate::client::Client`]
//! over a `tokio::net::TcpStream` instead of a blocking one.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::message::Message;
use crate::{Error, MAX_MESSAGE_LEN};

/// An async connection to a broker.
pub struct ClientAsync {
    stream: TcpStream,
    timeout: Duration,
    next_request_id: u32,
    pending_data: VecDeque<Message>,
}

impl ClientAsync {
    /// Connect to `addr`, failing if the connection isn't established
    /// within `timeout`. All subsequent I/O also honors `timeout`.
    pub async fn connect(addr: impl ToSocketAddrs, timeout: Duration) -> Result<Self, Error> {
        let mut stream = tokio::time::timeout(timeout, TcpStream::connect(addr)).await??;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            timeout,
            next_request_id: 0,
            pending_data: VecDeque::new(),
        })
    }

    fn next_id(&mut self) -> u32 {
        self.next_request_id = self.next_request_id.wrapping_add(1);
        self.next_request_id
    }

    async fn write_message(&mut self, msg: &Message) -> Result<(), Error> {
        let encoded = msg.encode()?;
        tokio::time::timeout(self.timeout, self.stream.write_all(&encoded)).await??;
        Ok(())
    }

    async fn read_message(&mut self) -> Result<Message, Error> {
        let total_len = tokio::time::timeout(self.timeout, self.stream.read_u32_le()).await??;
        if total_len > MAX_MESSAGE_LEN {
            return Err(Error::InvalidArgument("message exceeds MAX_MESSAGE_LEN"));
        }
        let mut body = vec![0u8; total_len as usize];
        tokio::time::timeout(self.timeout, self.stream.read_exact(&mut body)).await??;
        Message::decode_body(Bytes::from(body))
    }

    /// Issue a request and wait for its correlated response, queuing any
    /// interleaved `Data` messages for [`ClientAsync::recv_data`].
    pub async fn call(&mut self, verb: &str, args: impl IntoIterator<Item = String>) -> Result<Message, Error> {
        let mut request = Message::request(verb, args);
        let request_id = self.next_id();
        request.set_request_id(request_id);
        self.write_message(&request).await?;
        loop {
            let msg = self.read_message().await?;
            if msg.is_response() && msg.request_id() == request_id {
                return Ok(msg);
            }
            self.pending_data.push_back(msg);
        }
    }

    /// Push one already-encoded chunk into a source this client owns.
    pub async fn send_data(&mut self, source_name: &str, payload: impl Into<Bytes>, is_boundary: bool) -> Result<(), Error> {
        let mut msg = Message::request("Data", [source_name.to_string()]);
        msg.set_boundary(is_boundary);
        msg.set_payload(payload);
        self.write_message(&msg).await
    }

    /// Await the next `Data` message addressed to any stream this client
    /// subscribed to.
    pub async fn recv_data(&mut self) -> Result<Message, Error> {
        if let Some(msg) = self.pending_data.pop_front() {
            return Ok(msg);
        }
        self.read_message().await
    }
}
