use proptest::prelude::*;
use ripc_proto::constants::{RipcVersion, flags};
use ripc_proto::frame::{FragmentInfo, FrameHeader};
use ripc_proto::ws::frame::{WsFrameHeader, WsOpcode, apply_mask};

fn version_strategy() -> impl Strategy<Value = RipcVersion> {
    prop_oneof![
        Just(RipcVersion::V10),
        Just(RipcVersion::V11),
        Just(RipcVersion::V12),
        Just(RipcVersion::V13),
        Just(RipcVersion::V14),
    ]
}

proptest! {
    #[test]
    fn prop_frame_header_roundtrip(
        version in version_strategy(),
        payload_len in 0usize..8000,
        compressed in any::<bool>(),
        fragment in prop_oneof![
            Just(None),
            (1u32..1_000_000, 1u16..255).prop_map(|(total, id)| {
                Some(FragmentInfo::First { total_len: total, id })
            }),
            (1u16..255).prop_map(|id| Some(FragmentInfo::Continuation { id })),
        ],
    ) {
        let mut frame_flags = flags::DATA;
        if fragment.is_some() {
            frame_flags |= flags::EXTENDED_FLAGS;
        }
        if compressed {
            frame_flags |= flags::COMP_DATA;
        }
        let header = FrameHeader {
            length: 0,
            flags: frame_flags,
            opcode: 0,
            fragment,
        };
        let encoded = header.encode(payload_len, version).unwrap();
        let (parsed, consumed) = FrameHeader::parse(&encoded, version).unwrap().unwrap();
        prop_assert_eq!(consumed, encoded.len());
        prop_assert_eq!(parsed.fragment, fragment);
        prop_assert_eq!(parsed.is_compressed(), compressed);
        prop_assert_eq!(parsed.payload_len(consumed), payload_len);
    }

    #[test]
    fn prop_ws_header_roundtrip(
        fin in any::<bool>(),
        rsv1 in any::<bool>(),
        payload_len in 0u64..1_000_000,
        mask in prop::option::of(any::<[u8; 4]>()),
    ) {
        let header = WsFrameHeader {
            fin,
            rsv1,
            opcode: WsOpcode::Binary,
            payload_len,
            mask_key: mask,
        };
        let mut out = Vec::new();
        header.encode_into(&mut out);
        let (parsed, consumed) = WsFrameHeader::parse(&out).unwrap().unwrap();
        prop_assert_eq!(consumed, out.len());
        prop_assert_eq!(parsed, header);
    }

    #[test]
    fn prop_mask_is_involution(data in prop::collection::vec(any::<u8>(), 0..2048), key in any::<[u8; 4]>()) {
        let mut masked = data.clone();
        apply_mask(&mut masked, key, 0);
        if !data.is_empty() && key != [0, 0, 0, 0] {
            // A nonzero key changes at least the bytes under nonzero lanes.
            prop_assert!(masked.len() == data.len());
        }
        apply_mask(&mut masked, key, 0);
        prop_assert_eq!(masked, data);
    }
}
