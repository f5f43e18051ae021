//! The leaf transport seam.
//!
//! The engine never touches sockets directly; everything below the frame
//! layer is reached through [`Transport`]. TCP, TLS wrappers, and the
//! in-memory pipe used by tests all implement the same four calls.
//! Non-blocking endpoints signal backpressure with
//! `io::ErrorKind::WouldBlock`; a read of zero bytes means the peer
//! closed the stream.

use std::io::{self, IoSlice, Read, Write};
use std::net::{Shutdown, TcpStream};

pub trait Transport: Send {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Vectored write. Endpoints that cannot gather fall back to writing
    /// the first slice; the scheduler treats the result as a partial
    /// write and resumes.
    fn writev(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        match bufs.first() {
            Some(first) => self.write(first),
            None => Ok(0),
        }
    }

    fn supports_writev(&self) -> bool {
        false
    }

    fn shutdown(&mut self);
}

/// Plain TCP endpoint.
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> TcpTransport {
        TcpTransport { stream }
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }
}

impl Transport for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn writev(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        self.stream.write_vectored(bufs)
    }

    fn supports_writev(&self) -> bool {
        true
    }

    fn shutdown(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}
