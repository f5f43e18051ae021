//! Session negotiation: the client connector, the server acceptor, and
//! the version-downgrade retry loop.
//!
//! Both machines are driven by repeated `step` calls so they work over
//! non-blocking transports; every call either makes progress, reports
//! `InProgress`, or fails. A WebSocket opening handshake slots in front
//! of the RIPC exchange when configured (client) or sniffed (server);
//! the JSON subprotocols skip the RIPC exchange entirely and go active
//! straight after the HTTP 101.

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tracing::{debug, warn};

use ripc_proto::constants::{
    CompressionType, DEFAULT_MAX_FRAGMENT_SIZE, DEFAULT_MIN_PING_TIMEOUT, DEFAULT_PING_TIMEOUT,
    ProtocolType, RipcVersion, session_flags,
};
use ripc_proto::handshake::{
    ClientKey, ConnectAck, ConnectNak, ConnectRequest, KeyExchangeBlock, next_handshake_frame,
};
use ripc_proto::keyx::{DEFAULT_G, DEFAULT_P, KeyExchange};
use ripc_proto::ws::frame::{WsFrameHeader, WsOpcode, apply_mask, encode_frame};
use ripc_proto::ws::handshake::{
    DeflateParams, UpgradeRequest, UpgradeResponse, accept_key, client_request, encode_key,
};
use ripc_proto::ws::SubProtocol;

use crate::error::{Result, TransportError};
use crate::pool::BufferPool;
use crate::session::{Negotiated, Role, Session, SessionLimits, SessionTransport};
use crate::transport::Transport;
use crate::tunnel::TunnelTransport;
use crate::ws::WsState;

/// Client-side connection options.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Version to offer first.
    pub version: RipcVersion,
    /// Floor for the downgrade loop (HTTP tunnels require v11 or later).
    pub min_version: RipcVersion,
    pub hostname: String,
    pub ip_address: String,
    pub component_version: String,
    pub protocol_type: ProtocolType,
    pub ping_timeout: u8,
    /// Bitmap of compression algorithms the client accepts.
    pub compression_bitmap: u8,
    pub key_exchange: bool,
    pub limits: SessionLimits,
    /// Fixed Diffie-Hellman private exponent; random when unset.
    pub dh_private: Option<u64>,
}

impl Default for ConnectOptions {
    fn default() -> ConnectOptions {
        ConnectOptions {
            version: RipcVersion::LATEST,
            min_version: RipcVersion::OLDEST,
            hostname: String::new(),
            ip_address: String::new(),
            component_version: String::new(),
            protocol_type: ProtocolType::Rwf,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            compression_bitmap: 0,
            key_exchange: false,
            limits: SessionLimits::default(),
            dh_private: None,
        }
    }
}

/// WebSocket layer options for a client connection.
#[derive(Debug, Clone)]
pub struct WsConnectOptions {
    pub host: String,
    pub path: String,
    pub protocols: Vec<SubProtocol>,
    pub offer_deflate: bool,
    /// Fixed handshake nonce; random when unset.
    pub key_nonce: Option<[u8; 16]>,
}

impl Default for WsConnectOptions {
    fn default() -> WsConnectOptions {
        WsConnectOptions {
            host: String::new(),
            path: "/WebSocket".to_string(),
            protocols: SubProtocol::DEFAULT_LIST.to_vec(),
            offer_deflate: false,
            key_nonce: None,
        }
    }
}

/// One `step` outcome.
pub enum Progress {
    InProgress,
    Ready(Box<Session>),
}

impl std::fmt::Debug for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Progress::InProgress => f.write_str("Progress::InProgress"),
            Progress::Ready(_) => f.write_str("Progress::Ready(..)"),
        }
    }
}

enum ConnectState {
    WsSendOpeningHandshake,
    WsWaitHandshakeResponse,
    SendRequest,
    WaitAck,
    SendClientKey,
    /// The peer closed the WebSocket session mid-negotiation; nothing is
    /// left to do but surface the teardown.
    WsClosedPending,
    Done,
}

pub struct Connector {
    opts: ConnectOptions,
    ws_opts: Option<WsConnectOptions>,
    ws_key: String,
    ws_agreed: Option<(SubProtocol, Option<DeflateParams>)>,
    /// Unwrapped handshake bytes when the RIPC exchange rides WebSocket
    /// binary frames.
    ws_inner: Vec<u8>,
    transport: Option<SessionTransport>,
    state: ConnectState,
    outbuf: Vec<u8>,
    outpos: usize,
    inbuf: Vec<u8>,
    keyx: Option<KeyExchange>,
    shared_key: Option<u64>,
    ack: Option<ConnectAck>,
    rng: StdRng,
}

impl Connector {
    pub fn new(transport: Box<dyn Transport>, opts: ConnectOptions) -> Connector {
        Connector::with_transport(SessionTransport::Plain(transport), opts, None)
    }

    /// Connects through an established HTTP tunnel; the tunnel floor is
    /// protocol version 11.
    pub fn new_tunnel(tunnel: TunnelTransport, mut opts: ConnectOptions) -> Connector {
        if opts.min_version < RipcVersion::V11 {
            opts.min_version = RipcVersion::V11;
        }
        if opts.version < opts.min_version {
            opts.version = opts.min_version;
        }
        Connector::with_transport(SessionTransport::Tunnel(tunnel), opts, None)
    }

    /// Connects with a WebSocket opening handshake in front.
    pub fn new_ws(
        transport: Box<dyn Transport>,
        opts: ConnectOptions,
        ws_opts: WsConnectOptions,
    ) -> Connector {
        Connector::with_transport(SessionTransport::Plain(transport), opts, Some(ws_opts))
    }

    fn with_transport(
        transport: SessionTransport,
        opts: ConnectOptions,
        ws_opts: Option<WsConnectOptions>,
    ) -> Connector {
        let mut rng = StdRng::from_entropy();
        let (state, ws_key) = match &ws_opts {
            Some(ws) => {
                let nonce = ws.key_nonce.unwrap_or_else(|| {
                    let mut nonce = [0u8; 16];
                    rng.fill_bytes(&mut nonce);
                    nonce
                });
                (ConnectState::WsSendOpeningHandshake, encode_key(nonce))
            }
            None => (ConnectState::SendRequest, String::new()),
        };
        Connector {
            opts,
            ws_opts,
            ws_key,
            ws_agreed: None,
            ws_inner: Vec::new(),
            transport: Some(transport),
            state,
            outbuf: Vec::new(),
            outpos: 0,
            inbuf: Vec::new(),
            keyx: None,
            shared_key: None,
            ack: None,
            rng,
        }
    }

    /// Drives the handshake one step.
    pub fn step(&mut self) -> Result<Progress> {
        if !self.drain_out()? {
            return Ok(Progress::InProgress);
        }
        match self.state {
            ConnectState::WsSendOpeningHandshake => {
                let ws = self.ws_opts.as_ref().expect("ws state");
                self.outbuf = client_request(
                    &ws.host,
                    &ws.path,
                    &self.ws_key,
                    &ws.protocols,
                    ws.offer_deflate,
                );
                self.outpos = 0;
                self.state = ConnectState::WsWaitHandshakeResponse;
                self.step()
            }
            ConnectState::WsWaitHandshakeResponse => {
                if !self.fill_in()? {
                    return Ok(Progress::InProgress);
                }
                let Some((response, consumed)) = UpgradeResponse::parse(&self.inbuf, &self.ws_key)?
                else {
                    return Ok(Progress::InProgress);
                };
                self.inbuf.drain(..consumed);
                debug!(protocol = response.protocol.as_str(), "websocket upgrade accepted");
                self.ws_agreed = Some((response.protocol, response.deflate));
                if response.protocol.is_json() {
                    self.state = ConnectState::Done;
                    return Ok(Progress::Ready(Box::new(self.build_json_session())));
                }
                self.state = ConnectState::SendRequest;
                self.step()
            }
            ConnectState::SendRequest => {
                let request = ConnectRequest {
                    version: self.opts.version,
                    key_exchange: self.opts.key_exchange,
                    compression_bitmap: self.opts.compression_bitmap,
                    ping_timeout: self.opts.ping_timeout,
                    session_flags: session_flags::SERVER_TO_CLIENT_PING
                        | session_flags::CLIENT_TO_SERVER_PING,
                    protocol_type: self.opts.protocol_type,
                    major_version: 14,
                    minor_version: 1,
                    hostname: self.opts.hostname.clone(),
                    ip_address: self.opts.ip_address.clone(),
                    component_version: self.opts.component_version.clone(),
                };
                self.queue_handshake_frame(request.encode()?);
                self.state = ConnectState::WaitAck;
                self.step()
            }
            ConnectState::WaitAck => {
                let Some(frame) = self.next_frame()? else {
                    return Ok(Progress::InProgress);
                };
                let ack = ConnectAck::parse(&frame)?;
                if ack.version > self.opts.version {
                    return Err(TransportError::ProtocolError(format!(
                        "server answered with version {:?} above the offer",
                        ack.version
                    )));
                }
                if ack.compression != CompressionType::None
                    && ack.compression.bitmap_bit() & self.opts.compression_bitmap == 0
                {
                    return Err(TransportError::ProtocolError(format!(
                        "server selected unoffered compression {:?}",
                        ack.compression
                    )));
                }
                debug!(
                    version = ?ack.version,
                    compression = ?ack.compression,
                    max_msg_size = ack.max_msg_size,
                    "connect ack"
                );
                if self.opts.key_exchange {
                    if let Some(block) = ack.key_exchange {
                        let private = self
                            .opts
                            .dh_private
                            .unwrap_or_else(|| self.rng.next_u64() | 1);
                        let keyx = KeyExchange::new(block.p, block.g, private);
                        self.shared_key = Some(keyx.shared_key(block.server_public));
                        let reply = ClientKey {
                            key_type: block.key_type,
                            client_public: keyx.public_key(),
                        };
                        self.keyx = Some(keyx);
                        self.ack = Some(ack);
                        self.queue_handshake_frame(reply.encode()?);
                        self.state = ConnectState::SendClientKey;
                        return self.step();
                    }
                }
                self.ack = Some(ack);
                self.state = ConnectState::Done;
                Ok(Progress::Ready(Box::new(self.build_session())))
            }
            ConnectState::SendClientKey => {
                // drain_out above already finished the write.
                self.state = ConnectState::Done;
                Ok(Progress::Ready(Box::new(self.build_session())))
            }
            ConnectState::WsClosedPending => Err(TransportError::ChannelClosed(
                "websocket closed during negotiation".into(),
            )),
            ConnectState::Done => Err(TransportError::InvalidArgument(
                "connector already finished".into(),
            )),
        }
    }

    fn build_session(&mut self) -> Session {
        let ack = self.ack.take().expect("ack present");
        let negotiated = Negotiated {
            version: ack.version,
            max_msg_size: ack.max_msg_size,
            ping_timeout: ack.ping_timeout,
            protocol_type: self.opts.protocol_type,
            compression: ack.compression,
            compression_level: ack.compression_level,
            shared_key: self.shared_key,
            peer_component: ack.component_version,
            peer_hostname: String::new(),
            peer_ip: String::new(),
        };
        let ws = self
            .ws_agreed
            .take()
            .map(|(protocol, deflate)| WsState::new(protocol, deflate, 6));
        let mut session = Session::establish(
            Role::Client,
            self.transport.take().expect("transport present"),
            negotiated,
            &self.opts.limits,
            None,
            ws,
        );
        session.input = std::mem::take(&mut self.inbuf);
        if let Some(ws) = &mut session.ws {
            ws.inner = std::mem::take(&mut self.ws_inner);
        }
        session
    }

    fn build_json_session(&mut self) -> Session {
        let (protocol, deflate) = self.ws_agreed.take().expect("ws agreed");
        let negotiated = Negotiated {
            version: self.opts.version,
            max_msg_size: DEFAULT_MAX_FRAGMENT_SIZE,
            ping_timeout: self.opts.ping_timeout,
            protocol_type: ProtocolType::Json,
            compression: CompressionType::None,
            compression_level: 0,
            shared_key: None,
            peer_component: String::new(),
            peer_hostname: String::new(),
            peer_ip: String::new(),
        };
        let mut session = Session::establish(
            Role::Client,
            self.transport.take().expect("transport present"),
            negotiated,
            &self.opts.limits,
            None,
            Some(WsState::new(protocol, deflate, 6)),
        );
        session.input = std::mem::take(&mut self.inbuf);
        session
    }

    /// Queues a handshake frame, wrapping it in a masked binary frame
    /// when the exchange rides WebSocket.
    fn queue_handshake_frame(&mut self, frame: Vec<u8>) {
        if self.ws_agreed.is_some() {
            let mut key = [0u8; 4];
            self.rng.fill_bytes(&mut key);
            if key == [0, 0, 0, 0] {
                key = [1, 0, 0, 0];
            }
            let header = WsFrameHeader {
                fin: true,
                rsv1: false,
                opcode: WsOpcode::Binary,
                payload_len: frame.len() as u64,
                mask_key: Some(key),
            };
            let mut out = Vec::with_capacity(frame.len() + 8);
            encode_frame(&header, &frame, &mut out);
            self.outbuf = out;
        } else {
            self.outbuf = frame;
        }
        self.outpos = 0;
    }

    /// Returns the next complete handshake frame, unwrapping WebSocket
    /// binary frames when applicable.
    fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            let source_has_frame = if self.ws_agreed.is_some() {
                if unwrap_ws_frames(&mut self.inbuf, &mut self.ws_inner, Role::Client)? {
                    self.state = ConnectState::WsClosedPending;
                    return Err(TransportError::ChannelClosed(
                        "websocket closed during negotiation".into(),
                    ));
                }
                frame_from(&mut self.ws_inner)?
            } else {
                frame_from(&mut self.inbuf)?
            };
            if let Some(frame) = source_has_frame {
                return Ok(Some(frame));
            }
            if !self.fill_in()? {
                return Ok(None);
            }
        }
    }

    fn drain_out(&mut self) -> Result<bool> {
        drain(
            self.transport.as_mut().expect("transport present"),
            &mut self.outbuf,
            &mut self.outpos,
        )
    }

    fn fill_in(&mut self) -> Result<bool> {
        fill(
            self.transport.as_mut().expect("transport present"),
            &mut self.inbuf,
        )
    }
}

/// Server-side endpoint options.
#[derive(Debug, Clone)]
pub struct BindOptions {
    pub max_fragment_size: u16,
    /// Highest protocol version this endpoint accepts.
    pub max_version: RipcVersion,
    /// Bitmap of compression algorithms offered to clients.
    pub compression_allowed: u8,
    /// Compress regardless of the size threshold.
    pub force_compression: bool,
    pub zlib_level: u8,
    pub ping_timeout: u8,
    pub min_ping_timeout: u8,
    pub server_to_client_pings: bool,
    pub client_to_server_pings: bool,
    pub component_version: String,
    /// Shared overflow pool size in slabs.
    pub shared_pool_size: usize,
    pub limits: SessionLimits,
    pub subprotocols: Vec<SubProtocol>,
    pub accept_deflate: bool,
    /// Diffie-Hellman group; the built-in default group when unset.
    pub dh_params: Option<(u64, u64)>,
    /// Fixed Diffie-Hellman private exponent; random when unset.
    pub dh_private: Option<u64>,
}

impl Default for BindOptions {
    fn default() -> BindOptions {
        BindOptions {
            max_fragment_size: DEFAULT_MAX_FRAGMENT_SIZE,
            max_version: RipcVersion::LATEST,
            compression_allowed: 0,
            force_compression: false,
            zlib_level: 6,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            min_ping_timeout: DEFAULT_MIN_PING_TIMEOUT,
            server_to_client_pings: true,
            client_to_server_pings: true,
            component_version: String::new(),
            shared_pool_size: 100,
            limits: SessionLimits::default(),
            subprotocols: SubProtocol::DEFAULT_LIST.to_vec(),
            accept_deflate: true,
            dh_params: None,
            dh_private: None,
        }
    }
}

enum AcceptState {
    Sniff,
    ReadHeader,
    WaitClientKey,
    /// Negotiation is agreed; the reply still needs to finish draining.
    Finish,
    Done,
}

pub struct Acceptor {
    opts: BindOptions,
    shared_pool: BufferPool,
    transport: Option<SessionTransport>,
    state: AcceptState,
    inbuf: Vec<u8>,
    outbuf: Vec<u8>,
    outpos: usize,
    ws_agreed: Option<(SubProtocol, Option<DeflateParams>)>,
    ws_inner: Vec<u8>,
    keyx: Option<KeyExchange>,
    negotiated: Option<Negotiated>,
    rng: StdRng,
}

impl Acceptor {
    pub(crate) fn new(
        transport: SessionTransport,
        opts: BindOptions,
        shared_pool: BufferPool,
    ) -> Acceptor {
        Acceptor {
            opts,
            shared_pool,
            transport: Some(transport),
            state: AcceptState::Sniff,
            inbuf: Vec::new(),
            outbuf: Vec::new(),
            outpos: 0,
            ws_agreed: None,
            ws_inner: Vec::new(),
            keyx: None,
            negotiated: None,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn step(&mut self) -> Result<Progress> {
        if !self.drain_out()? {
            return Ok(Progress::InProgress);
        }
        match self.state {
            AcceptState::Sniff => {
                if self.inbuf.len() < 4 && !self.fill_in()? {
                    return Ok(Progress::InProgress);
                }
                if self.inbuf.len() < 4 {
                    return Ok(Progress::InProgress);
                }
                if &self.inbuf[..4] == b"GET " {
                    self.accept_ws_upgrade()
                } else {
                    self.state = AcceptState::ReadHeader;
                    self.step()
                }
            }
            AcceptState::ReadHeader => {
                let Some(frame) = self.next_frame()? else {
                    return Ok(Progress::InProgress);
                };
                let request = match ConnectRequest::parse(&frame) {
                    Ok(request) => request,
                    Err(err) => {
                        warn!(error = %err, "malformed connect request");
                        self.refuse(&format!("malformed connect request: {err}"))?;
                        return Err(TransportError::ChannelClosed(
                            "malformed connect request".into(),
                        ));
                    }
                };
                if request.version > self.opts.max_version {
                    self.refuse(&format!(
                        "connection version {:?} not supported",
                        request.version
                    ))?;
                    return Err(TransportError::ChannelClosed(
                        "unsupported connection version".into(),
                    ));
                }
                self.accept_request(request)
            }
            AcceptState::WaitClientKey => {
                let Some(frame) = self.next_frame()? else {
                    return Ok(Progress::InProgress);
                };
                let client_key = ClientKey::parse(&frame)?;
                let keyx = self.keyx.take().expect("key exchange in progress");
                let shared = keyx.shared_key(client_key.client_public);
                if let Some(negotiated) = &mut self.negotiated {
                    negotiated.shared_key = Some(shared);
                }
                self.state = AcceptState::Finish;
                self.step()
            }
            AcceptState::Finish => {
                // drain_out above flushed the pending reply.
                self.state = AcceptState::Done;
                Ok(Progress::Ready(Box::new(self.build_session())))
            }
            AcceptState::Done => Err(TransportError::InvalidArgument(
                "acceptor already finished".into(),
            )),
        }
    }

    fn accept_ws_upgrade(&mut self) -> Result<Progress> {
        let parsed = UpgradeRequest::parse(&self.inbuf, &self.opts.subprotocols)?;
        let Some(outcome) = parsed else {
            if !self.fill_in()? {
                return Ok(Progress::InProgress);
            }
            return Ok(Progress::InProgress);
        };
        match outcome {
            Err(rejection) => {
                warn!(status = rejection.status, "websocket upgrade refused");
                self.outbuf = rejection.to_http();
                self.outpos = 0;
                let _ = self.drain_out();
                Err(TransportError::ChannelClosed(format!(
                    "websocket upgrade refused ({})",
                    rejection.status
                )))
            }
            Ok((request, consumed)) => {
                self.inbuf.drain(..consumed);
                let protocol = request.protocols[0];
                let deflate = if self.opts.accept_deflate {
                    request.deflate
                } else {
                    None
                };
                let response = UpgradeResponse {
                    accept: accept_key(&request.key),
                    protocol,
                    deflate,
                };
                self.outbuf = response.encode();
                self.outpos = 0;
                debug!(protocol = protocol.as_str(), "websocket upgrade accepted");
                self.ws_agreed = Some((protocol, deflate));
                if protocol.is_json() {
                    self.negotiated = Some(Negotiated {
                        version: RipcVersion::LATEST,
                        max_msg_size: self.opts.max_fragment_size,
                        ping_timeout: self.opts.ping_timeout,
                        protocol_type: ProtocolType::Json,
                        compression: CompressionType::None,
                        compression_level: 0,
                        shared_key: None,
                        peer_component: String::new(),
                        peer_hostname: String::new(),
                        peer_ip: String::new(),
                    });
                    self.state = AcceptState::Finish;
                    return self.step();
                }
                self.state = AcceptState::ReadHeader;
                self.step()
            }
        }
    }

    fn accept_request(&mut self, request: ConnectRequest) -> Result<Progress> {
        let version = request.version;
        let allowed = request.compression_bitmap & self.opts.compression_allowed;
        let compression = if allowed & CompressionType::Zlib.bitmap_bit() != 0 {
            CompressionType::Zlib
        } else if allowed & CompressionType::Lz4.bitmap_bit() != 0 {
            CompressionType::Lz4
        } else {
            CompressionType::None
        };
        let ping_timeout = request
            .ping_timeout
            .clamp(self.opts.min_ping_timeout, self.opts.ping_timeout);
        let mut flags = 0u8;
        if self.opts.server_to_client_pings {
            flags |= session_flags::SERVER_TO_CLIENT_PING;
        }
        if self.opts.client_to_server_pings {
            flags |= session_flags::CLIENT_TO_SERVER_PING;
        }

        let key_exchange = if request.key_exchange && version.has_key_exchange() {
            let (p, g) = self.opts.dh_params.unwrap_or((DEFAULT_P, DEFAULT_G));
            let private = self
                .opts
                .dh_private
                .unwrap_or_else(|| self.rng.next_u64() | 1);
            let keyx = KeyExchange::new(p, g, private);
            let block = KeyExchangeBlock {
                key_type: 1,
                p,
                g,
                server_public: keyx.public_key(),
            };
            self.keyx = Some(keyx);
            Some(block)
        } else {
            None
        };

        let ack = ConnectAck {
            version,
            max_msg_size: self.opts.max_fragment_size,
            session_flags: flags,
            ping_timeout,
            major_version: 14,
            minor_version: 1,
            compression,
            compression_level: self.opts.zlib_level,
            key_exchange,
            component_version: self.opts.component_version.clone(),
        };
        debug!(
            version = ?version,
            compression = ?compression,
            key_exchange = key_exchange.is_some(),
            "connect request accepted"
        );
        self.queue_handshake_frame(ack.encode()?);
        self.negotiated = Some(Negotiated {
            version,
            max_msg_size: self.opts.max_fragment_size,
            ping_timeout,
            protocol_type: request.protocol_type,
            compression,
            compression_level: self.opts.zlib_level,
            shared_key: None,
            peer_component: request.component_version,
            peer_hostname: request.hostname,
            peer_ip: request.ip_address,
        });

        if key_exchange.is_some() {
            self.state = AcceptState::WaitClientKey;
        } else {
            self.state = AcceptState::Finish;
        }
        self.step()
    }

    fn build_session(&mut self) -> Session {
        let negotiated = self.negotiated.take().expect("negotiated present");
        let force = self.opts.force_compression;
        let ws = self
            .ws_agreed
            .take()
            .map(|(protocol, deflate)| WsState::new(protocol, deflate, self.opts.zlib_level));
        let mut session = Session::establish(
            Role::Server,
            self.transport.take().expect("transport present"),
            negotiated,
            &self.opts.limits,
            Some(self.shared_pool.clone()),
            ws,
        );
        session.force_compression = force;
        session.input = std::mem::take(&mut self.inbuf);
        if let Some(ws) = &mut session.ws {
            ws.inner = std::mem::take(&mut self.ws_inner);
        }
        session
    }

    /// Sends a nak with refusal text on the handshake channel.
    fn refuse(&mut self, text: &str) -> Result<()> {
        let nak = ConnectNak {
            text: text.to_string(),
        };
        self.queue_handshake_frame(nak.encode()?);
        let _ = self.drain_out()?;
        Ok(())
    }

    fn queue_handshake_frame(&mut self, frame: Vec<u8>) {
        if self.ws_agreed.is_some() {
            let header = WsFrameHeader {
                fin: true,
                rsv1: false,
                opcode: WsOpcode::Binary,
                payload_len: frame.len() as u64,
                mask_key: None,
            };
            let mut out = Vec::with_capacity(frame.len() + 8);
            encode_frame(&header, &frame, &mut out);
            self.outbuf = out;
        } else {
            self.outbuf = frame;
        }
        self.outpos = 0;
    }

    fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            let frame = if self.ws_agreed.is_some() {
                if unwrap_ws_frames(&mut self.inbuf, &mut self.ws_inner, Role::Server)? {
                    return Err(TransportError::ChannelClosed(
                        "websocket closed during negotiation".into(),
                    ));
                }
                frame_from(&mut self.ws_inner)?
            } else {
                frame_from(&mut self.inbuf)?
            };
            if let Some(frame) = frame {
                return Ok(Some(frame));
            }
            if !self.fill_in()? {
                return Ok(None);
            }
        }
    }

    fn drain_out(&mut self) -> Result<bool> {
        drain(
            self.transport.as_mut().expect("transport present"),
            &mut self.outbuf,
            &mut self.outpos,
        )
    }

    fn fill_in(&mut self) -> Result<bool> {
        fill(
            self.transport.as_mut().expect("transport present"),
            &mut self.inbuf,
        )
    }
}

/// Retries `dial` with successively lower connection versions until a
/// session comes up or the floor is hit. Each retry starts from a fresh
/// transport and a fresh session; no state survives a downgrade.
///
/// Intended for blocking transports; non-blocking callers drive a
/// [`Connector`] directly.
pub fn connect_with_downgrade<F>(opts: ConnectOptions, mut dial: F) -> Result<Session>
where
    F: FnMut() -> std::io::Result<Box<dyn Transport>>,
{
    let mut version = opts.version;
    loop {
        let transport = dial().map_err(|err| TransportError::ChannelClosed(err.to_string()))?;
        let mut attempt = opts.clone();
        attempt.version = version;
        let mut connector = Connector::new(transport, attempt);
        match drive(&mut connector) {
            Ok(session) => return Ok(session),
            Err(err) if err.is_fatal() => {
                let Some(lower) = version.downgrade() else {
                    return Err(err);
                };
                if lower < opts.min_version {
                    return Err(err);
                }
                warn!(error = %err, from = ?version, to = ?lower, "downgrading connection version");
                version = lower;
            }
            Err(err) => return Err(err),
        }
    }
}

fn drive(connector: &mut Connector) -> Result<Session> {
    loop {
        match connector.step()? {
            Progress::Ready(session) => return Ok(*session),
            Progress::InProgress => std::hint::spin_loop(),
        }
    }
}

/// Moves complete WebSocket binary frames from `inbuf` into `inner`,
/// unmasking as required for `role`'s inbound direction. Returns `true`
/// when the peer sent a CLOSE frame instead of handshake data.
fn unwrap_ws_frames(inbuf: &mut Vec<u8>, inner: &mut Vec<u8>, role: Role) -> Result<bool> {
    loop {
        let Some((header, header_len)) = WsFrameHeader::parse(inbuf)? else {
            return Ok(false);
        };
        let total = header_len + header.payload_len as usize;
        if inbuf.len() < total {
            return Ok(false);
        }
        match (role, header.mask_key) {
            (Role::Server, None) => {
                return Err(TransportError::ProtocolError(
                    "client handshake frame arrived unmasked".into(),
                ));
            }
            (Role::Client, Some(_)) => {
                return Err(TransportError::ProtocolError(
                    "server handshake frame arrived masked".into(),
                ));
            }
            _ => {}
        }
        if header.opcode == WsOpcode::Close {
            inbuf.drain(..total);
            return Ok(true);
        }
        if header.opcode != WsOpcode::Binary {
            return Err(TransportError::ProtocolError(format!(
                "unexpected websocket opcode {:?} during negotiation",
                header.opcode
            )));
        }
        let mut payload = inbuf[header_len..total].to_vec();
        if let Some(key) = header.mask_key {
            apply_mask(&mut payload, key, 0);
        }
        inner.extend_from_slice(&payload);
        inbuf.drain(..total);
    }
}

/// Pops one length-prefixed handshake frame off the front of `buf`.
fn frame_from(buf: &mut Vec<u8>) -> Result<Option<Vec<u8>>> {
    match next_handshake_frame(buf)? {
        Some((frame, consumed)) => {
            let frame = frame.to_vec();
            buf.drain(..consumed);
            Ok(Some(frame))
        }
        None => Ok(None),
    }
}

fn drain(
    transport: &mut SessionTransport,
    outbuf: &mut Vec<u8>,
    outpos: &mut usize,
) -> Result<bool> {
    while *outpos < outbuf.len() {
        match transport.as_transport().write(&outbuf[*outpos..]) {
            Ok(0) => {
                return Err(TransportError::ChannelClosed(
                    "peer closed during negotiation".into(),
                ));
            }
            Ok(n) => *outpos += n,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return Ok(false),
            Err(err) => return Err(TransportError::ChannelClosed(err.to_string())),
        }
    }
    outbuf.clear();
    *outpos = 0;
    Ok(true)
}

fn fill(transport: &mut SessionTransport, inbuf: &mut Vec<u8>) -> Result<bool> {
    let mut scratch = [0u8; 4096];
    match transport.as_transport().read(&mut scratch) {
        Ok(0) => Err(TransportError::ChannelClosed(
            "peer closed during negotiation".into(),
        )),
        Ok(n) => {
            inbuf.extend_from_slice(&scratch[..n]);
            Ok(true)
        }
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(false),
        Err(err) => Err(TransportError::ChannelClosed(err.to_string())),
    }
}
