use ripc_transport::testing::{PipeEnd, pipe};
use ripc_transport::{
    BindOptions, ConnectOptions, Connector, IoctlCmd, Priority, Progress, ReadStatus, Server,
    Session, SessionState, TransportError, WriteArgs,
};

fn establish(
    copts: ConnectOptions,
    bopts: BindOptions,
) -> (Session, Session, PipeEnd, PipeEnd) {
    let (client_end, server_end) = pipe();
    let client_wire = client_end.clone();
    let server_wire = server_end.clone();
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
    (
        client.expect("client handshake finished"),
        accepted.expect("server handshake finished"),
        client_wire,
        server_wire,
    )
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
fn test_small_message_roundtrip() {
    let (mut client, mut server, _cw, _sw) = establish(
        ConnectOptions::default(),
        BindOptions::default(),
    );

    let mut buffer = client.get_buffer(11, false).unwrap();
    buffer.put(b"hello world").unwrap();
    client.write(&mut buffer, &WriteArgs::default()).unwrap();
    client.flush().unwrap();

    assert_eq!(read_message(&mut server), b"hello world");
}

#[test]
fn test_messages_arrive_in_call_order() {
    let (mut client, mut server, _cw, _sw) =
        establish(ConnectOptions::default(), BindOptions::default());

    for i in 0..10u8 {
        let mut buffer = client.get_buffer(3, false).unwrap();
        buffer.put(&[i, i, i]).unwrap();
        client
            .write(
                &mut buffer,
                &WriteArgs {
                    priority: Priority::High,
                    ..WriteArgs::default()
                },
            )
            .unwrap();
    }
    client.flush().unwrap();

    for i in 0..10u8 {
        assert_eq!(read_message(&mut server), vec![i, i, i]);
    }
}

#[test]
fn test_read_would_block_when_idle() {
    let (mut client, _server, _cw, _sw) =
        establish(ConnectOptions::default(), BindOptions::default());
    let event = client.read().unwrap();
    assert_eq!(event.status, ReadStatus::WouldBlock);
    assert!(event.buffer.is_none());
}

#[test]
fn test_ping_roundtrip() {
    let (mut client, mut server, _cw, _sw) =
        establish(ConnectOptions::default(), BindOptions::default());

    client.ping().unwrap();
    let event = server.read().unwrap();
    assert_eq!(event.status, ReadStatus::Ping);
    assert!(event.buffer.is_none());
    assert_eq!(server.stats().pings_received, 1);
    assert_eq!(client.stats().pings_sent, 1);
}

#[test]
fn test_write_returns_queued_bytes_until_flush() {
    let (mut client, _server, _cw, _sw) =
        establish(ConnectOptions::default(), BindOptions::default());

    let mut buffer = client.get_buffer(100, false).unwrap();
    buffer.put(&[7u8; 100]).unwrap();
    let queued = client.write(&mut buffer, &WriteArgs::default()).unwrap();
    assert_eq!(queued, 103);
    assert_eq!(client.flush().unwrap(), 0);
}

#[test]
fn test_direct_write_flushes_immediately() {
    let (mut client, _server, client_wire, _sw) =
        establish(ConnectOptions::default(), BindOptions::default());

    let mut buffer = client.get_buffer(4, false).unwrap();
    buffer.put(b"data").unwrap();
    let queued = client
        .write(
            &mut buffer,
            &WriteArgs {
                direct_write: true,
                ..WriteArgs::default()
            },
        )
        .unwrap();
    assert_eq!(queued, 0);
    assert_eq!(client_wire.pending_bytes(), 7);
}

#[test]
fn test_high_water_mark_triggers_flush() {
    let (mut client, _server, client_wire, _sw) =
        establish(ConnectOptions::default(), BindOptions::default());
    client.ioctl(IoctlCmd::HighWaterMark(64)).unwrap();

    let mut buffer = client.get_buffer(100, false).unwrap();
    buffer.put(&[1u8; 100]).unwrap();
    client.write(&mut buffer, &WriteArgs::default()).unwrap();
    // 103 queued bytes exceeded the 64-byte mark, so write flushed.
    assert_eq!(client_wire.pending_bytes(), 103);
}

#[test]
fn test_write_spent_buffer_rejected() {
    let (mut client, _server, _cw, _sw) =
        establish(ConnectOptions::default(), BindOptions::default());

    let mut buffer = client.get_buffer(4, false).unwrap();
    buffer.put(b"once").unwrap();
    client.write(&mut buffer, &WriteArgs::default()).unwrap();
    assert!(matches!(
        client.write(&mut buffer, &WriteArgs::default()),
        Err(TransportError::InvalidArgument(_))
    ));
}

#[test]
fn test_get_buffer_validation() {
    let (mut client, _server, _cw, _sw) =
        establish(ConnectOptions::default(), BindOptions::default());

    assert!(matches!(
        client.get_buffer(0, false),
        Err(TransportError::InvalidArgument(_))
    ));
    let max = client.max_user_payload();
    assert!(matches!(
        client.get_buffer(max + 1, true),
        Err(TransportError::InvalidArgument(_))
    ));
}

#[test]
fn test_close_is_idempotent_and_poisons_operations() {
    let (mut client, _server, _cw, _sw) =
        establish(ConnectOptions::default(), BindOptions::default());

    client.close().unwrap();
    client.close().unwrap();
    assert_eq!(client.state(), SessionState::Inactive);
    assert!(matches!(
        client.read(),
        Err(TransportError::ChannelClosed(_))
    ));
    assert!(matches!(
        client.get_buffer(10, false),
        Err(TransportError::ChannelClosed(_))
    ));
    assert!(matches!(
        client.ping(),
        Err(TransportError::ChannelClosed(_))
    ));
}

#[test]
fn test_peer_close_surfaces_channel_closed() {
    let (mut client, server, _cw, _sw) =
        establish(ConnectOptions::default(), BindOptions::default());
    drop(server);
    assert!(matches!(
        client.read(),
        Err(TransportError::ChannelClosed(_))
    ));
    assert_eq!(client.state(), SessionState::Inactive);
}

#[test]
fn test_ioctl_validation() {
    let (mut client, _server, _cw, _sw) = establish(
        ConnectOptions {
            compression_bitmap: 0x01,
            ..ConnectOptions::default()
        },
        BindOptions {
            compression_allowed: 0x01,
            ..BindOptions::default()
        },
    );

    assert!(client.ioctl(IoctlCmd::MaxNumBuffers(0)).is_err());
    assert!(client.ioctl(IoctlCmd::MaxNumBuffers(10)).is_ok());
    assert!(client.ioctl(IoctlCmd::NumGuaranteedBuffers(20)).is_ok());
    assert!(client.ioctl(IoctlCmd::SysReadBuffers(4)).is_ok());
    assert!(client.ioctl(IoctlCmd::SysReadBuffers(0)).is_err());
    assert!(client.ioctl(IoctlCmd::SysWriteBuffers(8)).is_ok());
    assert!(client.ioctl(IoctlCmd::DebugFlags(0x3)).is_ok());

    // zlib threshold floor is 30.
    assert!(client.ioctl(IoctlCmd::CompressionThreshold(29)).is_err());
    assert!(client.ioctl(IoctlCmd::CompressionThreshold(30)).is_ok());

    // Flush order needs at least one H and one M.
    assert!(
        client
            .ioctl(IoctlCmd::PriorityFlushOrder("HLLLL".into()))
            .is_err()
    );
    assert!(
        client
            .ioctl(IoctlCmd::PriorityFlushOrder("HMLHM".into()))
            .is_ok()
    );
    assert!(
        client
            .ioctl(IoctlCmd::PriorityFlushOrder("HMQ".into()))
            .is_err()
    );
}

#[test]
fn test_lz4_threshold_floor() {
    let (mut client, _server, _cw, _sw) = establish(
        ConnectOptions {
            compression_bitmap: 0x02,
            ..ConnectOptions::default()
        },
        BindOptions {
            compression_allowed: 0x02,
            ..BindOptions::default()
        },
    );
    assert!(client.ioctl(IoctlCmd::CompressionThreshold(299)).is_err());
    assert!(client.ioctl(IoctlCmd::CompressionThreshold(300)).is_ok());
}

#[test]
fn test_stats_track_messages() {
    let (mut client, mut server, _cw, _sw) =
        establish(ConnectOptions::default(), BindOptions::default());

    let mut buffer = client.get_buffer(5, false).unwrap();
    buffer.put(b"stats").unwrap();
    client.write(&mut buffer, &WriteArgs::default()).unwrap();
    client.flush().unwrap();
    assert_eq!(client.stats().messages_written, 1);
    assert_eq!(client.stats().bytes_out_last_msg, 8);

    read_message(&mut server);
    assert_eq!(server.stats().messages_read, 1);
    assert!(server.stats().bytes_read >= 8);
}

#[test]
fn test_negotiated_parameters_visible() {
    let (client, server, _cw, _sw) = establish(
        ConnectOptions {
            component_version: "CoreImpl/1.0".into(),
            hostname: "md-client".into(),
            ip_address: "10.0.0.1".into(),
            ..ConnectOptions::default()
        },
        BindOptions {
            component_version: "CoreSrv/2.1".into(),
            max_fragment_size: 6144,
            ..BindOptions::default()
        },
    );

    assert_eq!(client.negotiated().max_msg_size, 6144);
    assert_eq!(client.negotiated().peer_component, "CoreSrv/2.1");
    assert_eq!(server.negotiated().peer_component, "CoreImpl/1.0");
    assert_eq!(server.negotiated().peer_hostname, "md-client");
    assert_eq!(server.negotiated().peer_ip, "10.0.0.1");
}
