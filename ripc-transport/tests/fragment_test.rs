use ripc_proto::constants::{RipcVersion, flags, opcodes};
use ripc_transport::testing::{PipeEnd, pipe};
use ripc_transport::{
    BindOptions, ConnectOptions, Connector, Progress, ReadStatus, Server, Session, SessionLimits,
    TransportError, WriteArgs,
};

fn establish(copts: ConnectOptions, bopts: BindOptions) -> (Session, Session, PipeEnd) {
    let (client_end, server_end) = pipe();
    let client_wire = client_end.clone();
    let mut server = Server::new(bopts);
    let mut acceptor = server.accept_transport(Box::new(server_end));
    let mut connector = Connector::new(Box::new(client_end), copts);

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

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
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

#[test]
fn test_large_message_roundtrip() {
    let (mut client, mut server, _wire) =
        establish(ConnectOptions::default(), BindOptions::default());

    let payload = patterned(20000);
    let mut buffer = client.get_buffer(payload.len(), false).unwrap();
    buffer.put(&payload).unwrap();
    client.write(&mut buffer, &WriteArgs::default()).unwrap();
    client.flush().unwrap();

    assert_eq!(read_message(&mut server), payload);
}

#[test]
fn test_first_fragment_wire_header() {
    let (mut client, _server, wire) =
        establish(ConnectOptions::default(), BindOptions::default());

    let payload = patterned(10000);
    let mut buffer = client.get_buffer(payload.len(), false).unwrap();
    buffer.put(&payload).unwrap();
    client.write(&mut buffer, &WriteArgs::default()).unwrap();
    client.flush().unwrap();

    let bytes = wire.peek_written();
    // v14 first-fragment header: len(2) flags(1) opcode(1) total(4) id(2).
    assert_eq!(bytes[2], flags::DATA | flags::EXTENDED_FLAGS);
    assert_eq!(bytes[3], opcodes::FRAG_HEADER);
    assert_eq!(&bytes[4..8], &10000u32.to_be_bytes());
    assert_eq!(&bytes[8..10], &1u16.to_be_bytes());
}

#[test]
fn test_fragment_ids_increase_and_wrap_v12() {
    // One-byte fragment id space before v13.
    let (mut client, mut server, _wire) = establish(
        ConnectOptions {
            version: RipcVersion::V12,
            ..ConnectOptions::default()
        },
        BindOptions::default(),
    );
    assert_eq!(client.negotiated().version, RipcVersion::V12);

    // 256 large writes walk the id space 1..=255 and wrap back to 1.
    let payload = patterned(irregular_size());
    for _ in 0..256 {
        let mut buffer = client.get_buffer(payload.len(), false).unwrap();
        buffer.put(&payload).unwrap();
        client.write(&mut buffer, &WriteArgs::default()).unwrap();
        client.flush().unwrap();
        assert_eq!(read_message(&mut server), payload);
    }
}

fn irregular_size() -> usize {
    // Just above one frame so every write fragments.
    7000
}

#[test]
fn test_write_call_again_resumes_mid_chain() {
    let (mut client, mut server, wire) = establish(
        ConnectOptions {
            limits: SessionLimits {
                guaranteed_buffers: 2,
                max_buffers: 2,
                high_water_mark: usize::MAX,
                read_frames: 10,
            },
            ..ConnectOptions::default()
        },
        BindOptions::default(),
    );

    // Stall the transport so flushing cannot free slabs mid-write; the
    // two-slab session starves partway through a five-frame chain.
    wire.set_write_capacity(Some(0));
    let payload = patterned(30000);
    let mut buffer = client.get_buffer(payload.len(), false).unwrap();
    buffer.put(&payload).unwrap();
    assert!(matches!(
        client.write(&mut buffer, &WriteArgs::default()),
        Err(TransportError::WriteCallAgain)
    ));

    // Un-stall and retry with the same buffer handle until the chain
    // finishes; every retry resumes where the last one starved.
    wire.set_write_capacity(None);
    let mut attempts = 0;
    loop {
        client.flush().unwrap();
        match client.write(&mut buffer, &WriteArgs::default()) {
            Ok(_) => break,
            Err(TransportError::WriteCallAgain) => {
                attempts += 1;
                assert!(attempts < 64, "chain never completed");
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    client.flush().unwrap();

    assert_eq!(read_message(&mut server), payload);
}

#[test]
fn test_oversized_message_rejected_up_front() {
    let (mut client, _server, _wire) = establish(
        ConnectOptions {
            version: RipcVersion::V12,
            ..ConnectOptions::default()
        },
        BindOptions::default(),
    );
    // v12 has a one-byte fragment id space.
    let limit = client.max_user_payload() * 255;
    assert!(client.get_buffer(limit + 1, false).is_err());
}

#[test]
fn test_interleaved_small_and_fragmented() {
    let (mut client, mut server, _wire) =
        establish(ConnectOptions::default(), BindOptions::default());

    let big = patterned(15000);
    let mut buffer = client.get_buffer(big.len(), false).unwrap();
    buffer.put(&big).unwrap();
    client.write(&mut buffer, &WriteArgs::default()).unwrap();

    let mut small = client.get_buffer(5, false).unwrap();
    small.put(b"small").unwrap();
    client.write(&mut small, &WriteArgs::default()).unwrap();
    client.flush().unwrap();

    // Same priority queue: the fragmented message completes first.
    assert_eq!(read_message(&mut server), big);
    assert_eq!(read_message(&mut server), b"small");
}
