use ripc_proto::constants::{CompressionType, flags, opcodes};
use ripc_transport::testing::{PipeEnd, pipe};
use ripc_transport::{
    BindOptions, ConnectOptions, Connector, Priority, Progress, ReadStatus, Server, Session,
    WriteArgs,
};

fn establish(bitmap: u8) -> (Session, Session, PipeEnd) {
    let (client_end, server_end) = pipe();
    let client_wire = client_end.clone();
    let mut server = Server::new(BindOptions {
        compression_allowed: bitmap,
        ..BindOptions::default()
    });
    let mut acceptor = server.accept_transport(Box::new(server_end));
    let mut connector = Connector::new(
        Box::new(client_end),
        ConnectOptions {
            compression_bitmap: bitmap,
            ..ConnectOptions::default()
        },
    );

    let mut client = None;
    let mut accepted = None;
    for _ in 0..64 {
        if client.is_none() {
            if let Progress::Ready(session) = connector.step().unwrap() {
                client = Some(*session);
            }
        }
        if accepted.is_none() {
            if let Progress::Ready(session) = acceptor.step().unwrap() {
                accepted = Some(*session);
            }
        }
        if client.is_some() && accepted.is_some() {
            break;
        }
    }
    (client.unwrap(), accepted.unwrap(), client_wire)
}

fn read_message(session: &mut Session) -> Vec<u8> {
    for _ in 0..1024 {
        let event = session.read().unwrap();
        if let Some(buffer) = event.buffer {
            return buffer;
        }
        if event.status == ReadStatus::WouldBlock {
            panic!("peer had no complete message buffered");
        }
    }
    panic!("read never produced a message");
}

/// Deterministic incompressible bytes.
fn noise(len: usize, mut seed: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    for _ in 0..len {
        seed = seed.wrapping_mul(1664525).wrapping_add(1013904223);
        out.push((seed >> 24) as u8);
    }
    out
}

#[test]
fn test_zlib_negotiated_and_roundtrips() {
    let (mut client, mut server, wire) = establish(0x01);
    assert_eq!(client.negotiated().compression, CompressionType::Zlib);

    let payload = b"tick|bid=101.25|ask=101.27|".repeat(100);
    let mut buffer = client.get_buffer(payload.len(), false).unwrap();
    buffer.put(&payload).unwrap();
    client.write(&mut buffer, &WriteArgs::default()).unwrap();
    client.flush().unwrap();

    let bytes = wire.peek_written();
    assert_eq!(bytes[2] & flags::COMP_DATA, flags::COMP_DATA);
    let frame_len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
    assert!(frame_len < payload.len(), "payload should have shrunk");

    assert_eq!(read_message(&mut server), payload);
}

#[test]
fn test_zlib_stream_survives_many_messages() {
    let (mut client, mut server, _wire) = establish(0x01);
    for i in 0..50usize {
        let payload = format!("update {i} ").repeat(30).into_bytes();
        let mut buffer = client.get_buffer(payload.len(), false).unwrap();
        buffer.put(&payload).unwrap();
        client.write(&mut buffer, &WriteArgs::default()).unwrap();
        client.flush().unwrap();
        assert_eq!(read_message(&mut server), payload);
    }
}

#[test]
fn test_small_payload_skips_compression() {
    let (mut client, mut server, wire) = establish(0x01);

    // 10 bytes is under the 30-byte zlib threshold.
    let mut buffer = client.get_buffer(10, false).unwrap();
    buffer.put(b"tiny quote").unwrap();
    client.write(&mut buffer, &WriteArgs::default()).unwrap();
    client.flush().unwrap();

    let bytes = wire.peek_written();
    assert_eq!(bytes[2] & flags::COMP_DATA, 0);
    assert_eq!(read_message(&mut server), b"tiny quote");
}

#[test]
fn test_do_not_compress_flag_respected() {
    let (mut client, mut server, wire) = establish(0x01);

    let payload = vec![b'x'; 500];
    let mut buffer = client.get_buffer(payload.len(), false).unwrap();
    buffer.put(&payload).unwrap();
    client
        .write(
            &mut buffer,
            &WriteArgs {
                do_not_compress: true,
                ..WriteArgs::default()
            },
        )
        .unwrap();
    client.flush().unwrap();

    let bytes = wire.peek_written();
    assert_eq!(bytes[2] & flags::COMP_DATA, 0);
    assert_eq!(read_message(&mut server), payload);
}

#[test]
fn test_compression_pins_to_first_queue() {
    let (mut client, _server, wire) = establish(0x01);

    let payload = vec![b'h'; 400];
    let mut buffer = client.get_buffer(payload.len(), false).unwrap();
    buffer.put(&payload).unwrap();
    client
        .write(
            &mut buffer,
            &WriteArgs {
                priority: Priority::High,
                ..WriteArgs::default()
            },
        )
        .unwrap();
    client.flush().unwrap();
    assert_eq!(
        wire.drain_written()[2] & flags::COMP_DATA,
        flags::COMP_DATA
    );

    // A different priority queue must not compress: the deflate stream
    // belongs to the High queue now.
    let payload2 = vec![b'm'; 400];
    let mut buffer = client.get_buffer(payload2.len(), false).unwrap();
    buffer.put(&payload2).unwrap();
    client
        .write(
            &mut buffer,
            &WriteArgs {
                priority: Priority::Medium,
                ..WriteArgs::default()
            },
        )
        .unwrap();
    client.flush().unwrap();
    let bytes = wire.peek_written();
    assert_eq!(bytes[2] & flags::COMP_DATA, 0);
}

#[test]
fn test_lz4_negotiated_and_roundtrips() {
    let (mut client, mut server, _wire) = establish(0x02);
    assert_eq!(client.negotiated().compression, CompressionType::Lz4);

    let payload = b"level2 depth update ".repeat(60);
    let mut buffer = client.get_buffer(payload.len(), false).unwrap();
    buffer.put(&payload).unwrap();
    client.write(&mut buffer, &WriteArgs::default()).unwrap();
    client.flush().unwrap();
    assert_eq!(read_message(&mut server), payload);
}

#[test]
fn test_lz4_fragmented_spillover_two_frames() {
    let (mut client, mut server, wire) = establish(0x02);

    // Half noise, half zeros: LZ4 lands between one and two frames.
    let mut payload = noise(10000, 0xBEEF);
    payload.extend(std::iter::repeat(0u8).take(10000));

    let mut buffer = client.get_buffer(payload.len(), false).unwrap();
    buffer.put(&payload).unwrap();
    client.write(&mut buffer, &WriteArgs::default()).unwrap();
    client.flush().unwrap();

    let bytes = wire.peek_written();
    // Frame 1: full frame, compressed + spillover + first-fragment
    // fields advertising the uncompressed total.
    let frame1_len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
    assert_eq!(frame1_len, 6144);
    assert_eq!(
        bytes[2],
        flags::DATA | flags::EXTENDED_FLAGS | flags::COMP_DATA | flags::COMP_FRAG
    );
    assert_eq!(bytes[3], opcodes::FRAG_HEADER);
    assert_eq!(&bytes[4..8], &20000u32.to_be_bytes());
    assert_eq!(&bytes[8..10], &1u16.to_be_bytes());

    // Frame 2: the remaining compressed bytes as a continuation.
    let frame2 = &bytes[frame1_len..];
    assert_eq!(
        frame2[2],
        flags::DATA | flags::EXTENDED_FLAGS | flags::COMP_DATA
    );
    assert_eq!(frame2[3], opcodes::FRAG);
    assert_eq!(&frame2[4..6], &1u16.to_be_bytes());

    // Exactly two frames on the wire.
    let frame2_len = u16::from_be_bytes([frame2[0], frame2[1]]) as usize;
    assert_eq!(bytes.len(), frame1_len + frame2_len);

    assert_eq!(read_message(&mut server), payload);
}

#[test]
fn test_lz4_incompressible_large_message_falls_back_to_plain_chain() {
    let (mut client, mut server, wire) = establish(0x02);

    let payload = noise(20000, 0x1234);
    let mut buffer = client.get_buffer(payload.len(), false).unwrap();
    buffer.put(&payload).unwrap();
    client.write(&mut buffer, &WriteArgs::default()).unwrap();
    client.flush().unwrap();

    let bytes = wire.peek_written();
    // Worst-case LZ4 output exceeds two frames, so the chain goes out
    // uncompressed.
    assert_eq!(bytes[2] & flags::COMP_DATA, 0);
    assert_eq!(read_message(&mut server), payload);
}

#[test]
fn test_packed_frame_compresses_as_a_unit() {
    let (mut client, mut server, wire) = establish(0x01);

    let mut buffer = client.get_buffer(600, true).unwrap();
    for _ in 0..3 {
        buffer.put(&[b'q'; 150]).unwrap();
        client.pack(&mut buffer).unwrap();
    }
    client.write(&mut buffer, &WriteArgs::default()).unwrap();
    client.flush().unwrap();

    let bytes = wire.peek_written();
    assert_eq!(
        bytes[2] & (flags::COMP_DATA | flags::PACKING),
        flags::COMP_DATA | flags::PACKING
    );

    for _ in 0..3 {
        let event = server.read().unwrap();
        assert_eq!(event.buffer.as_deref(), Some(&[b'q'; 150][..]));
    }
}

#[test]
fn test_zlib_fragmented_chain_roundtrip() {
    let (mut client, mut server, wire) = establish(0x01);

    let payload = b"orderbook snapshot row ".repeat(1200);
    assert!(payload.len() > 20000);
    let mut buffer = client.get_buffer(payload.len(), false).unwrap();
    buffer.put(&payload).unwrap();
    client.write(&mut buffer, &WriteArgs::default()).unwrap();
    client.flush().unwrap();

    let bytes = wire.peek_written();
    assert_eq!(bytes[2] & flags::COMP_DATA, flags::COMP_DATA);
    assert_eq!(bytes[3] & opcodes::FRAG_HEADER, opcodes::FRAG_HEADER);

    assert_eq!(read_message(&mut server), payload);
}
