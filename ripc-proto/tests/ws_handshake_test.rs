use ripc_proto::ws::handshake::{UpgradeRequest, UpgradeResponse, accept_key, client_request};
use ripc_proto::ws::SubProtocol;

const KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

#[test]
fn test_accept_key_rfc_example() {
    // Literal example from RFC 6455 §1.3.
    assert_eq!(accept_key(KEY), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
}

fn request_bytes(protocols: &str, extensions: Option<&str>) -> Vec<u8> {
    let mut out = format!(
        "GET /WebSocket HTTP/1.1\r\n\
         Host: md-host\r\n\
         Upgrade: websocket\r\n\
         Connection: keep-alive, Upgrade\r\n\
         Sec-WebSocket-Key: {KEY}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Protocol: {protocols}\r\n"
    );
    if let Some(ext) = extensions {
        out.push_str(&format!("Sec-WebSocket-Extensions: {ext}\r\n"));
    }
    out.push_str("\r\n");
    out.into_bytes()
}

#[test]
fn test_server_parses_upgrade() {
    let raw = request_bytes("tr_json2, rssl.rwf", None);
    let (request, consumed) = UpgradeRequest::parse(&raw, &SubProtocol::DEFAULT_LIST)
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(consumed, raw.len());
    assert_eq!(request.path, "/WebSocket");
    assert_eq!(request.key, KEY);
    assert_eq!(
        request.protocols,
        vec![SubProtocol::TrJson2, SubProtocol::Rwf]
    );
    assert!(request.deflate.is_none());
}

#[test]
fn test_server_parses_deflate_params() {
    let raw = request_bytes(
        "rssl.rwf",
        Some("permessage-deflate; client_no_context_takeover; server_no_context_takeover"),
    );
    let (request, _) = UpgradeRequest::parse(&raw, &SubProtocol::DEFAULT_LIST)
        .unwrap()
        .unwrap()
        .unwrap();
    let deflate = request.deflate.unwrap();
    assert!(deflate.client_no_context_takeover);
    assert!(deflate.server_no_context_takeover);
}

#[test]
fn test_incomplete_request_waits() {
    let raw = request_bytes("rssl.rwf", None);
    let cut = raw.len() - 3;
    assert!(
        UpgradeRequest::parse(&raw[..cut], &SubProtocol::DEFAULT_LIST)
            .unwrap()
            .is_none()
    );
}

#[test]
fn test_missing_upgrade_header_is_400() {
    let raw = format!(
        "GET / HTTP/1.1\r\nHost: x\r\nSec-WebSocket-Key: {KEY}\r\n\
         Sec-WebSocket-Version: 13\r\nSec-WebSocket-Protocol: rssl.rwf\r\n\r\n"
    );
    let rejection = UpgradeRequest::parse(raw.as_bytes(), &SubProtocol::DEFAULT_LIST)
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert_eq!(rejection.status, 400);
    let http = rejection.to_http();
    assert!(http.starts_with(b"HTTP/1.1 400"));
}

#[test]
fn test_unknown_subprotocol_is_400() {
    let raw = request_bytes("chat.v7", None);
    let rejection = UpgradeRequest::parse(&raw, &SubProtocol::DEFAULT_LIST)
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert_eq!(rejection.status, 400);
}

#[test]
fn test_bad_version_is_400() {
    let raw = format!(
        "GET / HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
         Sec-WebSocket-Key: {KEY}\r\nSec-WebSocket-Version: 8\r\n\
         Sec-WebSocket-Protocol: rssl.rwf\r\n\r\n"
    );
    let rejection = UpgradeRequest::parse(raw.as_bytes(), &SubProtocol::DEFAULT_LIST)
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert_eq!(rejection.status, 400);
}

#[test]
fn test_response_roundtrip() {
    let response = UpgradeResponse {
        accept: accept_key(KEY),
        protocol: SubProtocol::Rwf,
        deflate: None,
    };
    let encoded = response.encode();
    let (parsed, consumed) = UpgradeResponse::parse(&encoded, KEY).unwrap().unwrap();
    assert_eq!(consumed, encoded.len());
    assert_eq!(parsed.protocol, SubProtocol::Rwf);
}

#[test]
fn test_response_accept_mismatch_rejected() {
    let response = UpgradeResponse {
        accept: accept_key("AAAAAAAAAAAAAAAAAAAAAA=="),
        protocol: SubProtocol::Rwf,
        deflate: None,
    };
    assert!(UpgradeResponse::parse(&response.encode(), KEY).is_err());
}

#[test]
fn test_non_101_response_is_rejection() {
    let raw = b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n";
    assert!(UpgradeResponse::parse(raw, KEY).is_err());
}

#[test]
fn test_client_request_contains_offer() {
    let raw = client_request("md-host:14002", "/WebSocket", KEY, &SubProtocol::DEFAULT_LIST, true);
    let text = String::from_utf8(raw).unwrap();
    assert!(text.contains("Sec-WebSocket-Protocol: rssl.json.v2, rssl.rwf, tr_json2"));
    assert!(text.contains("Sec-WebSocket-Extensions: permessage-deflate"));
    assert!(text.ends_with("\r\n\r\n"));
}
