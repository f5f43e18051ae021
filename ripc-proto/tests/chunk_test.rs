use ripc_proto::chunk::{
    Chunk, TunnelConnAck, TunnelHeader, ZERO_CHUNK, encode_chunk, encode_reconnect_notice,
    http_header_end, parse_chunk, streaming_response_header, tunnel_request,
};

#[test]
fn test_chunk_roundtrip() {
    let mut wire = Vec::new();
    encode_chunk(b"hello world", &mut wire);
    assert!(wire.starts_with(b"b\r\n"));

    let (chunk, consumed) = parse_chunk(&wire).unwrap().unwrap();
    assert_eq!(consumed, wire.len());
    match chunk {
        Chunk::Data { payload } => assert_eq!(&wire[payload], b"hello world"),
        Chunk::End => panic!("unexpected end chunk"),
    }
}

#[test]
fn test_zero_chunk_is_end_marker() {
    let (chunk, consumed) = parse_chunk(ZERO_CHUNK).unwrap().unwrap();
    assert_eq!(chunk, Chunk::End);
    assert_eq!(consumed, ZERO_CHUNK.len());
}

#[test]
fn test_partial_chunk_waits() {
    let mut wire = Vec::new();
    encode_chunk(&[0xAA; 300], &mut wire);
    for cut in [0, 2, 5, 150, wire.len() - 1] {
        assert!(parse_chunk(&wire[..cut]).unwrap().is_none());
    }
}

#[test]
fn test_chunk_bad_hex_rejected() {
    assert!(parse_chunk(b"xyz\r\n").is_err());
}

#[test]
fn test_chunk_missing_terminator_rejected() {
    let wire = b"2\r\nabXX";
    assert!(parse_chunk(wire).is_err());
}

#[test]
fn test_consecutive_chunks() {
    let mut wire = Vec::new();
    encode_chunk(b"first", &mut wire);
    encode_chunk(b"second", &mut wire);
    wire.extend_from_slice(ZERO_CHUNK);

    let mut cursor = 0;
    let mut payloads = Vec::new();
    loop {
        let (chunk, consumed) = parse_chunk(&wire[cursor..]).unwrap().unwrap();
        match chunk {
            Chunk::Data { payload } => {
                let start = cursor + payload.start;
                let end = cursor + payload.end;
                payloads.push(wire[start..end].to_vec());
            }
            Chunk::End => break,
        }
        cursor += consumed;
    }
    assert_eq!(payloads, vec![b"first".to_vec(), b"second".to_vec()]);
}

#[test]
fn test_tunnel_header_roundtrip() {
    let header = TunnelHeader {
        session_id: 0xDEAD_BEEF,
        pid: 4242,
        ip_address: 0x0A01_0203,
    };
    let encoded = header.encode();
    assert_eq!(TunnelHeader::parse(&encoded).unwrap(), header);
}

#[test]
fn test_tunnel_connack_roundtrip() {
    let ack = TunnelConnAck {
        session_id: 0x0000_1234,
    };
    let encoded = ack.encode();
    assert_eq!(encoded.len(), 7);
    assert_eq!(TunnelConnAck::parse(&encoded).unwrap(), ack);
}

#[test]
fn test_reconnect_notice_is_three_bytes() {
    let notice = encode_reconnect_notice();
    assert_eq!(notice.len(), 3);
    assert_eq!(u16::from_be_bytes([notice[0], notice[1]]), 3);
}

#[test]
fn test_tunnel_request_headers() {
    let raw = tunnel_request("/md/stream", 18);
    let text = String::from_utf8(raw).unwrap();
    assert!(text.starts_with("POST /md/stream HTTP/1.0\r\n"));
    assert!(text.contains("Content-Length: 18\r\n"));
    assert!(text.contains("Accept-Encoding: gzip\r\n"));
    assert!(text.contains("Proxy-Connection: Keep-Alive\r\n"));
    assert!(text.ends_with("\r\n\r\n"));
}

#[test]
fn test_streaming_response_is_chunked() {
    let raw = streaming_response_header();
    let text = String::from_utf8(raw.clone()).unwrap();
    assert!(text.contains("Transfer-Encoding: chunked"));
    assert!(text.contains("Content-Type: application/octet-stream"));
    assert_eq!(http_header_end(&raw), Some(raw.len()));
}
