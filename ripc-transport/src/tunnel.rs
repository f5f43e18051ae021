//! HTTP tunneling: the two-FD "control + streaming" model.
//!
//! A tunneled session reads a long-lived chunked response on the
//! streaming channel and uploads through POSTs on a persistent control
//! channel, so proxies see ordinary HTTP in both directions. On proxy
//! timeout the client dials a replacement streaming connection,
//! announces it with a reconnect notice, and both sides swap FDs once
//! the server acknowledges with a single-byte chunk on the new channel.

use std::io::{self, IoSlice};

use tracing::{debug, warn};

use ripc_proto::chunk::{
    self, Chunk, TUNNEL_HEADER_LEN, TunnelConnAck, TunnelHeader, tunnel_ops,
};

use crate::transport::Transport;

/// Which side of the tunnel this endpoint is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelRole {
    Client,
    Server,
}

enum SwitchState {
    Idle,
    /// A replacement streaming connection is live; the client waits for
    /// the proxy-side ack before swapping.
    ClientWaitProxyAck { replacement: Box<dyn Transport> },
    /// The swap finished; the next session read reports an FD change.
    Switched,
}

/// De-framing state of the server-side control channel: the client
/// uploads a sequence of POSTs, each carrying the tunnel header and an
/// opaque body.
#[derive(Default)]
struct PostReader {
    /// Body bytes still expected from the current POST (tunnel header
    /// already stripped).
    body_remaining: usize,
}

/// A tunneled transport built from a streaming channel and a control
/// channel.
pub struct TunnelTransport {
    role: TunnelRole,
    streaming: Box<dyn Transport>,
    control: Box<dyn Transport>,
    header: TunnelHeader,
    url: String,
    /// Raw bytes read off the wire, not yet de-framed.
    raw: Vec<u8>,
    /// De-framed payload ready for the caller.
    decoded: Vec<u8>,
    decoded_pos: usize,
    post: PostReader,
    switch: SwitchState,
    /// Greeting bytes read off a replacement channel while waiting for
    /// the switch ack.
    switch_raw: Vec<u8>,
    /// Streaming channel saw the zero chunk; no more payload arrives on
    /// it until a swap.
    stream_ended: bool,
}

impl TunnelTransport {
    pub fn new(
        role: TunnelRole,
        streaming: Box<dyn Transport>,
        control: Box<dyn Transport>,
        header: TunnelHeader,
        url: String,
    ) -> TunnelTransport {
        TunnelTransport {
            role,
            streaming,
            control,
            header,
            url,
            raw: Vec::new(),
            decoded: Vec::new(),
            decoded_pos: 0,
            post: PostReader::default(),
            switch: SwitchState::Idle,
            switch_raw: Vec::new(),
            stream_ended: false,
        }
    }

    pub fn role(&self) -> TunnelRole {
        self.role
    }

    pub fn session_id(&self) -> u32 {
        self.header.session_id
    }

    pub fn header(&self) -> TunnelHeader {
        self.header
    }

    /// Whether a swap is pending; the scheduler clamps batches to one
    /// iovec while this holds.
    pub fn is_switching(&self) -> bool {
        matches!(self.switch, SwitchState::ClientWaitProxyAck { .. })
    }

    /// Whether the streaming channel already delivered its terminating
    /// zero chunk.
    pub fn stream_ended(&self) -> bool {
        self.stream_ended
    }

    /// Consumes the FD-change notification after a completed swap.
    pub fn take_fd_change(&mut self) -> bool {
        if matches!(self.switch, SwitchState::Switched) {
            self.switch = SwitchState::Idle;
            true
        } else {
            false
        }
    }

    /// Client side: adopt a freshly dialed streaming connection. The
    /// reconnect notice rides the new channel so the server can associate
    /// it with this session.
    pub fn begin_switch(&mut self, mut replacement: Box<dyn Transport>) -> io::Result<()> {
        let mut body = Vec::with_capacity(TUNNEL_HEADER_LEN + 3);
        body.extend_from_slice(&self.header.encode());
        body.extend_from_slice(&chunk::encode_reconnect_notice());
        let mut request = chunk::tunnel_request(&self.url, body.len());
        request.extend_from_slice(&body);
        write_all(replacement.as_mut(), &request)?;
        debug!(session_id = self.header.session_id, "reconnect notice sent");
        self.switch = SwitchState::ClientWaitProxyAck { replacement };
        Ok(())
    }

    /// Server side: adopt a replacement streaming connection routed here
    /// by the `{session_id, pid, ip}` tuple. Ends the old stream with a
    /// zero chunk and acknowledges on the new one.
    pub fn accept_switch(&mut self, mut replacement: Box<dyn Transport>) -> io::Result<()> {
        let _ = write_all(self.streaming.as_mut(), chunk::ZERO_CHUNK);
        let mut greeting = chunk::streaming_response_header();
        chunk::encode_chunk(&[tunnel_ops::SWITCH_ACK], &mut greeting);
        write_all(replacement.as_mut(), &greeting)?;
        let mut old = std::mem::replace(&mut self.streaming, replacement);
        old.shutdown();
        self.stream_ended = false;
        self.switch = SwitchState::Switched;
        debug!(session_id = self.header.session_id, "streaming fd swapped");
        Ok(())
    }

    /// Client side: poll the replacement channel for the switch ack and
    /// finish the swap when it arrives.
    fn poll_switch(&mut self) -> io::Result<()> {
        let SwitchState::ClientWaitProxyAck { replacement } = &mut self.switch else {
            return Ok(());
        };
        let mut probe = [0u8; 512];
        let n = match replacement.read(&mut probe) {
            Ok(0) => {
                warn!("replacement streaming channel closed before ack");
                self.switch = SwitchState::Idle;
                return Err(io::ErrorKind::ConnectionReset.into());
            }
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(err) => return Err(err),
        };
        self.switch_raw.extend_from_slice(&probe[..n]);
        let Some(end) = chunk::http_header_end(&self.switch_raw) else {
            return Ok(());
        };
        let body = &self.switch_raw[end..];
        match chunk::parse_chunk(body) {
            Ok(Some((Chunk::Data { payload }, consumed))) => {
                if body[payload] != [tunnel_ops::SWITCH_ACK] {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "unexpected chunk while waiting for switch ack",
                    ));
                }
                let leftover = body[consumed..].to_vec();
                self.switch_raw.clear();
                let SwitchState::ClientWaitProxyAck { replacement } =
                    std::mem::replace(&mut self.switch, SwitchState::Switched)
                else {
                    unreachable!("variant checked above");
                };
                let mut old = std::mem::replace(&mut self.streaming, replacement);
                old.shutdown();
                self.raw = leftover;
                self.stream_ended = false;
                debug!(session_id = self.header.session_id, "streaming fd swapped");
                Ok(())
            }
            Ok(Some((Chunk::End, _))) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "stream ended while waiting for switch ack",
            )),
            Ok(None) => Ok(()),
            Err(err) => Err(io::Error::new(io::ErrorKind::InvalidData, err.to_string())),
        }
    }

    /// Client read path: de-chunk the streaming response body.
    fn decode_chunks(&mut self) -> io::Result<()> {
        loop {
            match chunk::parse_chunk(&self.raw) {
                Ok(Some((Chunk::Data { payload }, consumed))) => {
                    self.decoded.extend_from_slice(&self.raw[payload]);
                    self.raw.drain(..consumed);
                }
                Ok(Some((Chunk::End, consumed))) => {
                    self.raw.drain(..consumed);
                    self.stream_ended = true;
                    debug!("streaming channel end-of-stream chunk");
                }
                Ok(None) => return Ok(()),
                Err(err) => {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, err.to_string()));
                }
            }
        }
    }

    /// Server read path: de-frame back-to-back POSTs on the control
    /// channel, stripping headers and the per-POST tunnel header.
    fn decode_posts(&mut self) -> io::Result<()> {
        loop {
            if self.post.body_remaining > 0 {
                let take = self.post.body_remaining.min(self.raw.len());
                self.decoded.extend_from_slice(&self.raw[..take]);
                self.raw.drain(..take);
                self.post.body_remaining -= take;
                if self.post.body_remaining > 0 {
                    return Ok(());
                }
            }
            let Some(end) = chunk::http_header_end(&self.raw) else {
                return Ok(());
            };
            let head = std::str::from_utf8(&self.raw[..end])
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-ascii POST header"))?;
            let content_length = parse_content_length(head)
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "POST without length"))?;
            if content_length < TUNNEL_HEADER_LEN {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "POST body shorter than tunnel header",
                ));
            }
            if self.raw.len() < end + TUNNEL_HEADER_LEN {
                return Ok(());
            }
            let header = TunnelHeader::parse(&self.raw[end..end + TUNNEL_HEADER_LEN])
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
            if header.session_id != self.header.session_id {
                warn!(
                    expected = self.header.session_id,
                    got = header.session_id,
                    "control POST for a different session"
                );
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "tunnel identity mismatch",
                ));
            }
            self.raw.drain(..end + TUNNEL_HEADER_LEN);
            self.post.body_remaining = content_length - TUNNEL_HEADER_LEN;
        }
    }
}

impl Transport for TunnelTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if matches!(self.role, TunnelRole::Client) {
            self.poll_switch()?;
        }

        if self.decoded_pos == self.decoded.len() {
            self.decoded.clear();
            self.decoded_pos = 0;
            let source = match self.role {
                TunnelRole::Client => self.streaming.as_mut(),
                TunnelRole::Server => self.control.as_mut(),
            };
            let mut scratch = [0u8; 4096];
            match source.read(&mut scratch) {
                Ok(0) => {
                    // A closed channel only matters once no swap can
                    // replace it.
                    if !self.is_switching() {
                        return Ok(0);
                    }
                }
                Ok(n) => self.raw.extend_from_slice(&scratch[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => return Err(err),
            }
            match self.role {
                TunnelRole::Client => self.decode_chunks()?,
                TunnelRole::Server => self.decode_posts()?,
            }
        }

        let available = self.decoded.len() - self.decoded_pos;
        if available == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(available);
        buf[..n].copy_from_slice(&self.decoded[self.decoded_pos..self.decoded_pos + n]);
        self.decoded_pos += n;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.role {
            TunnelRole::Client => {
                // Each upload is a self-contained POST carrying the
                // tunnel identity so the server can route it to this
                // session.
                let mut body = Vec::with_capacity(TUNNEL_HEADER_LEN + buf.len());
                body.extend_from_slice(&self.header.encode());
                body.extend_from_slice(buf);
                let mut request = chunk::tunnel_request(&self.url, body.len());
                request.extend_from_slice(&body);
                write_all(self.control.as_mut(), &request)?;
                Ok(buf.len())
            }
            TunnelRole::Server => {
                let mut framed = Vec::with_capacity(buf.len() + 16);
                chunk::encode_chunk(buf, &mut framed);
                write_all(self.streaming.as_mut(), &framed)?;
                Ok(buf.len())
            }
        }
    }

    fn writev(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let mut total = 0;
        for buf in bufs {
            if buf.is_empty() {
                continue;
            }
            self.write(buf)?;
            total += buf.len();
        }
        Ok(total)
    }

    fn supports_writev(&self) -> bool {
        true
    }

    fn shutdown(&mut self) {
        if matches!(self.role, TunnelRole::Server) {
            let _ = write_all(self.streaming.as_mut(), chunk::ZERO_CHUNK);
        }
        self.streaming.shutdown();
        self.control.shutdown();
        if let SwitchState::ClientWaitProxyAck { replacement } =
            &mut std::mem::replace(&mut self.switch, SwitchState::Idle)
        {
            replacement.shutdown();
        }
    }
}

/// States of the tunnel opening handshake on the client side.
enum DialState {
    /// The opening POST has not reached the proxy yet.
    ProxyConnecting,
    /// Opening POST sent; waiting for the chunked connack that assigns
    /// the session id.
    ClientWaitProxyAck,
    Done,
}

/// Client-side tunnel establishment: sends the opening POST on the
/// streaming connection and waits for the chunked connack assigning the
/// session id.
pub struct TunnelDialer {
    streaming: Option<Box<dyn Transport>>,
    control: Option<Box<dyn Transport>>,
    url: String,
    pid: u16,
    ip_address: u32,
    state: DialState,
    raw: Vec<u8>,
}

impl TunnelDialer {
    pub fn new(
        streaming: Box<dyn Transport>,
        control: Box<dyn Transport>,
        url: &str,
        pid: u16,
        ip_address: u32,
    ) -> TunnelDialer {
        TunnelDialer {
            streaming: Some(streaming),
            control: Some(control),
            url: url.to_string(),
            pid,
            ip_address,
            state: DialState::ProxyConnecting,
            raw: Vec::new(),
        }
    }

    /// Drives establishment; returns the tunnel once the server has
    /// assigned a session id.
    pub fn step(&mut self) -> io::Result<Option<TunnelTransport>> {
        if matches!(self.state, DialState::Done) {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "dialer already finished",
            ));
        }
        let streaming = self
            .streaming
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "dialer already finished"))?;

        if matches!(self.state, DialState::ProxyConnecting) {
            let header = TunnelHeader {
                session_id: 0,
                pid: self.pid,
                ip_address: self.ip_address,
            };
            let body = header.encode();
            let mut request = chunk::tunnel_request(&self.url, body.len());
            request.extend_from_slice(&body);
            write_all(streaming.as_mut(), &request)?;
            self.state = DialState::ClientWaitProxyAck;
        }

        let mut probe = [0u8; 1024];
        match streaming.read(&mut probe) {
            Ok(0) => {
                return Err(io::ErrorKind::ConnectionReset.into());
            }
            Ok(n) => self.raw.extend_from_slice(&probe[..n]),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(err) => return Err(err),
        }
        let Some(end) = chunk::http_header_end(&self.raw) else {
            return Ok(None);
        };
        let body = &self.raw[end..];
        let Some((Chunk::Data { payload }, consumed)) = chunk::parse_chunk(body)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?
        else {
            return Ok(None);
        };
        let ack = TunnelConnAck::parse(&body[payload])
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
        let leftover = body[consumed..].to_vec();
        debug!(session_id = ack.session_id, "tunnel connack received");
        self.state = DialState::Done;

        let mut tunnel = TunnelTransport::new(
            TunnelRole::Client,
            self.streaming.take().expect("still connected"),
            self.control.take().expect("still connected"),
            TunnelHeader {
                session_id: ack.session_id,
                pid: self.pid,
                ip_address: self.ip_address,
            },
            std::mem::take(&mut self.url),
        );
        tunnel.raw = leftover;
        Ok(Some(tunnel))
    }
}

/// Server-side tunnel establishment: reads the opening POST from the
/// streaming connection, assigns `session_id`, and replies with the
/// chunked greeting.
pub fn accept_tunnel(
    mut streaming: Box<dyn Transport>,
    control: Box<dyn Transport>,
    session_id: u32,
) -> io::Result<(TunnelTransport, TunnelHeader)> {
    let mut raw = Vec::new();
    let mut probe = [0u8; 1024];
    let client_header = loop {
        match streaming.read(&mut probe) {
            Ok(0) => return Err(io::ErrorKind::ConnectionReset.into()),
            Ok(n) => raw.extend_from_slice(&probe[..n]),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                if raw.is_empty() {
                    return Err(io::ErrorKind::WouldBlock.into());
                }
            }
            Err(err) => return Err(err),
        }
        if let Some(end) = chunk::http_header_end(&raw) {
            if raw.len() >= end + TUNNEL_HEADER_LEN {
                break TunnelHeader::parse(&raw[end..end + TUNNEL_HEADER_LEN])
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
            }
        }
    };

    let mut greeting = chunk::streaming_response_header();
    chunk::encode_chunk(&TunnelConnAck { session_id }.encode(), &mut greeting);
    write_all(streaming.as_mut(), &greeting)?;

    let header = TunnelHeader {
        session_id,
        pid: client_header.pid,
        ip_address: client_header.ip_address,
    };
    Ok((
        TunnelTransport::new(
            TunnelRole::Server,
            streaming,
            control,
            header,
            String::new(),
        ),
        header,
    ))
}

fn parse_content_length(head: &str) -> Option<usize> {
    for line in head.split("\r\n") {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                return value.trim().parse().ok();
            }
        }
    }
    None
}

fn write_all(transport: &mut dyn Transport, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match transport.write(buf) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => buf = &buf[n..],
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                std::hint::spin_loop();
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}
