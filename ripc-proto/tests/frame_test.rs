use ripc_proto::constants::{PING_FRAME, RipcVersion, flags, opcodes};
use ripc_proto::frame::{FragmentInfo, FrameHeader, next_packed_entry};

#[test]
fn test_plain_data_header_roundtrip() {
    let header = FrameHeader::data();
    let encoded = header.encode(100, RipcVersion::V14).unwrap();
    assert_eq!(encoded, vec![0x00, 0x67, flags::DATA]);

    let (parsed, consumed) = FrameHeader::parse(&encoded, RipcVersion::V14)
        .unwrap()
        .unwrap();
    assert_eq!(consumed, 3);
    assert_eq!(parsed.length, 103);
    assert_eq!(parsed.flags, flags::DATA);
    assert_eq!(parsed.payload_len(consumed), 100);
}

#[test]
fn test_ping_is_empty_data_frame() {
    assert_eq!(PING_FRAME, [0x00, 0x03, flags::DATA]);
    let (parsed, consumed) = FrameHeader::parse(&PING_FRAME, RipcVersion::V14)
        .unwrap()
        .unwrap();
    assert!(parsed.is_data());
    assert_eq!(parsed.payload_len(consumed), 0);
}

#[test]
fn test_first_fragment_header_v14() {
    let header = FrameHeader {
        length: 0,
        flags: flags::DATA | flags::EXTENDED_FLAGS,
        opcode: 0,
        fragment: Some(FragmentInfo::First {
            total_len: 20000,
            id: 1,
        }),
    };
    let encoded = header.encode(6134, RipcVersion::V14).unwrap();
    // 3 base + 1 opcode + 4 total + 2 id
    assert_eq!(encoded.len(), 10);
    assert_eq!(encoded[3] & opcodes::FRAG_HEADER, opcodes::FRAG_HEADER);
    assert_eq!(&encoded[4..8], &20000u32.to_be_bytes());
    assert_eq!(&encoded[8..10], &1u16.to_be_bytes());

    let (parsed, consumed) = FrameHeader::parse(&encoded, RipcVersion::V14)
        .unwrap()
        .unwrap();
    assert_eq!(consumed, 10);
    assert_eq!(
        parsed.fragment,
        Some(FragmentInfo::First {
            total_len: 20000,
            id: 1
        })
    );
}

#[test]
fn test_fragment_id_is_one_byte_before_v13() {
    let header = FrameHeader {
        length: 0,
        flags: flags::DATA | flags::EXTENDED_FLAGS,
        opcode: 0,
        fragment: Some(FragmentInfo::Continuation { id: 200 }),
    };
    let encoded = header.encode(0, RipcVersion::V12).unwrap();
    assert_eq!(encoded.len(), 5);
    assert_eq!(encoded[4], 200);

    let encoded = header.encode(0, RipcVersion::V13).unwrap();
    assert_eq!(encoded.len(), 6);
    assert_eq!(&encoded[4..6], &200u16.to_be_bytes());
}

#[test]
fn test_parse_incomplete_header_asks_for_more() {
    let header = FrameHeader {
        length: 0,
        flags: flags::DATA | flags::EXTENDED_FLAGS,
        opcode: 0,
        fragment: Some(FragmentInfo::First {
            total_len: 9000,
            id: 7,
        }),
    };
    let encoded = header.encode(100, RipcVersion::V14).unwrap();
    for cut in 0..encoded.len() {
        assert!(
            FrameHeader::parse(&encoded[..cut], RipcVersion::V14)
                .unwrap()
                .is_none(),
            "prefix of {cut} bytes should be incomplete"
        );
    }
}

#[test]
fn test_bogus_length_rejected() {
    let bad = [0x00, 0x01, flags::DATA];
    assert!(FrameHeader::parse(&bad, RipcVersion::V14).is_err());
}

#[test]
fn test_packed_entries_walk_in_order() {
    // Three packed messages "AB" "CD" "EF" with 2-byte length prefixes.
    let mut payload = Vec::new();
    for msg in [b"AB", b"CD", b"EF"] {
        payload.extend_from_slice(&2u16.to_be_bytes());
        payload.extend_from_slice(msg);
    }

    let mut cursor = 0;
    let mut seen = Vec::new();
    while let Some((range, next)) = next_packed_entry(&payload, cursor).unwrap() {
        seen.push(payload[range].to_vec());
        cursor = next;
    }
    assert_eq!(seen, vec![b"AB".to_vec(), b"CD".to_vec(), b"EF".to_vec()]);
}

#[test]
fn test_packed_zero_length_terminates() {
    let mut payload = Vec::new();
    payload.extend_from_slice(&2u16.to_be_bytes());
    payload.extend_from_slice(b"AB");
    payload.extend_from_slice(&0u16.to_be_bytes());

    let (range, cursor) = next_packed_entry(&payload, 0).unwrap().unwrap();
    assert_eq!(&payload[range], b"AB");
    assert!(next_packed_entry(&payload, cursor).unwrap().is_none());
}

#[test]
fn test_packed_truncated_entry_is_error() {
    let mut payload = Vec::new();
    payload.extend_from_slice(&9u16.to_be_bytes());
    payload.extend_from_slice(b"AB");
    assert!(next_packed_entry(&payload, 0).is_err());
}
