//! A single peer's TCP socket wrapped for non-blocking, buffered framing.
//! Registration with the shared `mio::Poll` and the handshake exchange are
//! driven by the owning session's event loop (`peer::session`), not by
//! this type — one `Poll` per peer does not scale once a torrent has
//! hundreds of connections.

use crate::peer::message::Message;
use mio::net::TcpStream;
use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;

/// Buffered non-blocking framing over one peer's socket. `fill_read_buf`
/// and `flush_write_buf` should be called whenever mio reports the
/// registered token as readable/writable; `poll_message` then extracts
/// complete frames without blocking.
pub struct Connection {
    pub stream: TcpStream,
    pub addr: SocketAddr,
    read_buf: Vec<u8>,
    write_buf: VecDeque<u8>,
    pub handshake_done: bool,
}

impl Connection {
    pub fn from_stream(stream: TcpStream, addr: SocketAddr) -> Connection {
        Connection {
            stream,
            addr,
            read_buf: Vec::new(),
            write_buf: VecDeque::new(),
            handshake_done: false,
        }
    }

    pub fn connect(addr: SocketAddr) -> io::Result<Connection> {
        let stream = TcpStream::connect(addr)?;
        Ok(Connection::from_stream(stream, addr))
    }

    /// Queues bytes to be sent on the next writable tick; does not write
    /// directly, so callers never observe a partial-write error.
    pub fn queue(&mut self, bytes: &[u8]) {
        self.write_buf.extend(bytes.iter().copied());
    }

    pub fn queue_message(&mut self, message: &Message) {
        self.queue(&message.serialize());
    }

    pub fn has_pending_write(&self) -> bool {
        !self.write_buf.is_empty()
    }

    /// Drains as much of the write buffer as the socket accepts right now.
    /// A `WouldBlock` is not an error: the caller re-registers interest and
    /// tries again on the next writable event.
    pub fn flush_write_buf(&mut self) -> io::Result<()> {
        while !self.write_buf.is_empty() {
            let (front, _) = self.write_buf.as_slices();
            if front.is_empty() {
                break;
            }
            match self.stream.write(front) {
                Ok(0) => return Err(io::Error::new(ErrorKind::WriteZero, "peer closed socket")),
                Ok(n) => {
                    self.write_buf.drain(..n);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Reads whatever is available into the internal buffer without
    /// blocking. Returns `true` if the peer closed the connection.
    pub fn fill_read_buf(&mut self) -> io::Result<bool> {
        let mut chunk = [0u8; 16 * 1024];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(true),
                Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Pops the first fully-buffered wire message, if any, leaving
    /// anything past it in the buffer for the next call.
    pub fn poll_message(&mut self) -> io::Result<Option<Message>> {
        if self.read_buf.len() < 4 {
            return Ok(None);
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&self.read_buf[0..4]);
        let declared_len = u32::from_be_bytes(len_bytes) as usize;
        let total_len = 4 + declared_len;
        if self.read_buf.len() < total_len {
            return Ok(None);
        }
        let frame = self.read_buf[..total_len].to_vec();
        self.read_buf.drain(..total_len);
        Message::deserialize(&frame).map(Some)
    }

    pub fn shutdown(&mut self) -> io::Result<()> {
        self.stream.shutdown(std::net::Shutdown::Both)
    }
}
