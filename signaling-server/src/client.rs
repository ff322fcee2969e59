//! Per-connection state for the relay server

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;

use mio::net::TcpStream;
use rendezvous::frame::next_line;
use rendezvous::PeerIdentity;

// ============================================================================
// Client Structure
// ============================================================================

/// One connected signaling endpoint
pub struct Client {
    /// Non-blocking socket
    pub stream: TcpStream,
    /// Remote address (for logging)
    pub addr: SocketAddr,
    /// Identity from the greeting line; None until it arrives
    pub identity: Option<PeerIdentity>,
    /// Bytes read but not yet split into lines
    pub inbound: Vec<u8>,
    /// Framed lines not yet accepted by the socket, oldest first
    outbound: VecDeque<Vec<u8>>,
    /// Bytes of the front line already written
    front_written: usize,
    /// Total length of the lines in `outbound`
    outbound_bytes: usize,
    /// Marked for removal at the end of the loop iteration
    pub closed: bool,
}

impl Client {
    pub fn new(stream: TcpStream, addr: SocketAddr) -> Self {
        Client {
            stream,
            addr,
            identity: None,
            inbound: Vec::new(),
            outbound: VecDeque::new(),
            front_written: 0,
            outbound_bytes: 0,
            closed: false,
        }
    }

    /// Read until the socket would block. Returns true on end of stream.
    pub fn read_available(&mut self, scratch: &mut [u8]) -> io::Result<bool> {
        loop {
            match self.stream.read(scratch) {
                Ok(0) => return Ok(true),
                Ok(n) => self.inbound.extend_from_slice(&scratch[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Remove and return the first complete line, terminator included
    pub fn take_line(&mut self) -> Option<Vec<u8>> {
        let (_, consumed) = next_line(&self.inbound)?;
        Some(self.inbound.drain(..consumed).collect())
    }

    /// Append a framed line to the send buffer.
    ///
    /// Oldest whole lines are discarded while the buffer would exceed
    /// `limit` bytes. A line the socket has started taking is never
    /// discarded. Returns how many lines were dropped.
    pub fn queue(&mut self, line: &str, limit: usize) -> usize {
        let mut dropped = 0;
        while self.outbound_bytes + line.len() > limit {
            // Index 0 may be half written
            let oldest = if self.front_written > 0 { 1 } else { 0 };
            let Some(old) = self.outbound.remove(oldest) else {
                break;
            };
            self.outbound_bytes -= old.len();
            dropped += 1;
        }

        self.outbound_bytes += line.len();
        self.outbound.push_back(line.as_bytes().to_vec());
        dropped
    }

    /// Bytes waiting for the socket
    pub fn pending_bytes(&self) -> usize {
        self.outbound_bytes - self.front_written
    }

    /// Write as much of the send buffer as the socket takes.
    ///
    /// Unlike the client side, a short write here just leaves the rest
    /// buffered for the next writable event.
    pub fn flush(&mut self) -> io::Result<()> {
        while let Some(front) = self.outbound.front() {
            match self.stream.write(&front[self.front_written..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.front_written += n;
                    let len = front.len();
                    if self.front_written == len {
                        self.outbound.pop_front();
                        self.outbound_bytes -= len;
                        self.front_written = 0;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Label for log lines
    pub fn label(&self) -> String {
        match &self.identity {
            Some(id) => format!("'{}' ({})", id, self.addr),
            None => self.addr.to_string(),
        }
    }
}
