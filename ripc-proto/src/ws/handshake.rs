//! WebSocket opening handshake: HTTP upgrade parsing and construction.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha1::{Digest, Sha1};

use crate::ProtoError;
use crate::ws::SubProtocol;

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Computes the `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Encodes a caller-supplied 16-byte nonce as a `Sec-WebSocket-Key`.
pub fn encode_key(nonce: [u8; 16]) -> String {
    BASE64.encode(nonce)
}

/// permessage-deflate parameters agreed during the upgrade.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeflateParams {
    pub client_no_context_takeover: bool,
    pub server_no_context_takeover: bool,
}

/// A parsed client upgrade request.
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    pub path: String,
    pub key: String,
    pub protocols: Vec<SubProtocol>,
    pub deflate: Option<DeflateParams>,
}

/// HTTP status and reason used when an upgrade is refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub status: u16,
    pub reason: String,
}

impl Rejection {
    fn new(status: u16, reason: &str) -> Rejection {
        Rejection {
            status,
            reason: reason.to_string(),
        }
    }

    /// Renders the refusal as a complete HTTP response.
    pub fn to_http(&self) -> Vec<u8> {
        let status_text = match self.status {
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            413 => "Request Entity Too Large",
            _ => "Internal Server Error",
        };
        format!(
            "HTTP/1.1 {} {}\r\nContent-Length: {}\r\n\r\n{}",
            self.status,
            status_text,
            self.reason.len(),
            self.reason
        )
        .into_bytes()
    }
}

/// Upper bound on the upgrade request size before it is refused with 413.
pub const MAX_HANDSHAKE_LEN: usize = 16 * 1024;

impl UpgradeRequest {
    /// Parses a complete HTTP upgrade request (terminated by a blank
    /// line). Returns `Ok(None)` when the terminator has not arrived.
    pub fn parse(
        buf: &[u8],
        offered: &[SubProtocol],
    ) -> Result<Option<Result<(UpgradeRequest, usize), Rejection>>, ProtoError> {
        let end = match find_header_end(buf) {
            Some(end) => end,
            None => {
                if buf.len() > MAX_HANDSHAKE_LEN {
                    return Ok(Some(Err(Rejection::new(413, "handshake too large"))));
                }
                return Ok(None);
            }
        };
        let head = std::str::from_utf8(&buf[..end])
            .map_err(|_| ProtoError::BadHttp("non-ascii upgrade request".into()))?;
        let mut lines = head.split("\r\n");
        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or_default();
        let path = parts.next().unwrap_or_default().to_string();
        if method != "GET" {
            return Ok(Some(Err(Rejection::new(400, "method must be GET"))));
        }

        let mut upgrade_ok = false;
        let mut connection_ok = false;
        let mut version_ok = false;
        let mut key = None;
        let mut protocols = Vec::new();
        let mut deflate = None;
        for line in lines {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match name.trim().to_ascii_lowercase().as_str() {
                "upgrade" => upgrade_ok = value.eq_ignore_ascii_case("websocket"),
                "connection" => {
                    connection_ok = value
                        .split(',')
                        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
                }
                "sec-websocket-version" => version_ok = value == "13",
                "sec-websocket-key" => key = Some(value.to_string()),
                "sec-websocket-protocol" => {
                    for token in value.split(',') {
                        if let Some(proto) = SubProtocol::from_str_token(token) {
                            if offered.contains(&proto) {
                                protocols.push(proto);
                            }
                        }
                    }
                }
                "sec-websocket-extensions" => {
                    if let Some(params) = parse_deflate_extension(value) {
                        deflate = Some(params);
                    }
                }
                _ => {}
            }
        }

        if !upgrade_ok || !connection_ok {
            return Ok(Some(Err(Rejection::new(400, "not a websocket upgrade"))));
        }
        if !version_ok {
            return Ok(Some(Err(Rejection::new(400, "unsupported websocket version"))));
        }
        let Some(key) = key else {
            return Ok(Some(Err(Rejection::new(400, "missing Sec-WebSocket-Key"))));
        };
        if protocols.is_empty() {
            return Ok(Some(Err(Rejection::new(
                400,
                "no mutually supported subprotocol",
            ))));
        }

        Ok(Some(Ok((
            UpgradeRequest {
                path,
                key,
                protocols,
                deflate,
            },
            end,
        ))))
    }
}

/// Server's `101 Switching Protocols` reply.
#[derive(Debug, Clone)]
pub struct UpgradeResponse {
    pub accept: String,
    pub protocol: SubProtocol,
    pub deflate: Option<DeflateParams>,
}

impl UpgradeResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = String::from("HTTP/1.1 101 Switching Protocols\r\n");
        out.push_str("Upgrade: websocket\r\n");
        out.push_str("Connection: Upgrade\r\n");
        out.push_str(&format!("Sec-WebSocket-Accept: {}\r\n", self.accept));
        out.push_str(&format!(
            "Sec-WebSocket-Protocol: {}\r\n",
            self.protocol.as_str()
        ));
        if let Some(params) = self.deflate {
            out.push_str("Sec-WebSocket-Extensions: permessage-deflate");
            if params.client_no_context_takeover {
                out.push_str("; client_no_context_takeover");
            }
            if params.server_no_context_takeover {
                out.push_str("; server_no_context_takeover");
            }
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.into_bytes()
    }

    /// Parses the server reply on the client side, validating the accept
    /// key echo. Returns `Ok(None)` while incomplete.
    pub fn parse(
        buf: &[u8],
        sent_key: &str,
    ) -> Result<Option<(UpgradeResponse, usize)>, ProtoError> {
        let Some(end) = find_header_end(buf) else {
            return Ok(None);
        };
        let head = std::str::from_utf8(&buf[..end])
            .map_err(|_| ProtoError::BadHttp("non-ascii upgrade response".into()))?;
        let mut lines = head.split("\r\n");
        let status_line = lines.next().unwrap_or_default();
        let status: u16 = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|raw| raw.parse().ok())
            .ok_or_else(|| ProtoError::BadHttp("bad status line".into()))?;
        if status != 101 {
            return Err(ProtoError::WsRejected {
                status,
                reason: status_line.to_string(),
            });
        }

        let mut accept = None;
        let mut protocol = None;
        let mut deflate = None;
        for line in lines {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match name.trim().to_ascii_lowercase().as_str() {
                "sec-websocket-accept" => accept = Some(value.to_string()),
                "sec-websocket-protocol" => protocol = SubProtocol::from_str_token(value),
                "sec-websocket-extensions" => deflate = parse_deflate_extension(value),
                _ => {}
            }
        }

        let accept = accept.ok_or_else(|| ProtoError::BadHttp("missing accept key".into()))?;
        if accept != accept_key(sent_key) {
            return Err(ProtoError::BadHandshake("accept key mismatch".into()));
        }
        let protocol = protocol
            .ok_or_else(|| ProtoError::BadHandshake("server chose no subprotocol".into()))?;

        Ok(Some((
            UpgradeResponse {
                accept,
                protocol,
                deflate,
            },
            end,
        )))
    }
}

/// Builds the client upgrade request. `key` is the caller-generated
/// 16-byte nonce, already base64 encoded.
pub fn client_request(
    host: &str,
    path: &str,
    key: &str,
    protocols: &[SubProtocol],
    offer_deflate: bool,
) -> Vec<u8> {
    let list = protocols
        .iter()
        .map(|p| p.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    let mut out = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Protocol: {list}\r\n"
    );
    if offer_deflate {
        out.push_str("Sec-WebSocket-Extensions: permessage-deflate\r\n");
    }
    out.push_str("\r\n");
    out.into_bytes()
}

fn parse_deflate_extension(value: &str) -> Option<DeflateParams> {
    let mut found = false;
    let mut params = DeflateParams::default();
    for offer in value.split(',') {
        let mut tokens = offer.split(';').map(str::trim);
        if tokens.next() != Some("permessage-deflate") {
            continue;
        }
        found = true;
        for token in tokens {
            match token.split('=').next().unwrap_or_default() {
                "client_no_context_takeover" => params.client_no_context_takeover = true,
                "server_no_context_takeover" => params.server_no_context_takeover = true,
                _ => {}
            }
        }
        break;
    }
    if found { Some(params) } else { None }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
}
