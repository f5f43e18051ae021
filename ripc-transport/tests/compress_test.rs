use ripc_transport::compress::{CompressionType, Compressor, Decompressor, lz4_worst_case};

#[test]
fn test_none_has_no_context() {
    assert!(Compressor::new(CompressionType::None, 6, true).is_none());
    assert!(Decompressor::new(CompressionType::None, true).is_none());
}

#[test]
fn test_zlib_roundtrip() {
    let mut comp = Compressor::new(CompressionType::Zlib, 6, true).unwrap();
    let mut decomp = Decompressor::new(CompressionType::Zlib, true).unwrap();

    let payload = b"a quick brown fox jumps over the lazy dog".repeat(20);
    let mut compressed = Vec::new();
    let outcome = comp.compress(&payload, &mut compressed).unwrap();
    assert_eq!(outcome.bytes_in_used, payload.len());
    assert_eq!(outcome.bytes_out_used, compressed.len());
    assert!(compressed.len() < payload.len());

    let mut restored = Vec::new();
    let outcome = decomp
        .decompress(&compressed, &mut restored, payload.len())
        .unwrap();
    assert_eq!(outcome.bytes_out_used, payload.len());
    assert_eq!(restored, payload);
}

#[test]
fn test_zlib_sync_flush_keeps_message_boundaries() {
    // Each message must decompress on its own; the sync flush aligns
    // the stream at every boundary.
    let mut comp = Compressor::new(CompressionType::Zlib, 6, true).unwrap();
    let mut decomp = Decompressor::new(CompressionType::Zlib, true).unwrap();

    for message in [&b"first message"[..], b"second", b"third and last"] {
        let mut compressed = Vec::new();
        comp.compress(message, &mut compressed).unwrap();
        let mut restored = Vec::new();
        decomp
            .decompress(&compressed, &mut restored, message.len())
            .unwrap();
        assert_eq!(restored, message);
    }
}

#[test]
fn test_zlib_decompress_limit_enforced() {
    let mut comp = Compressor::new(CompressionType::Zlib, 6, true).unwrap();
    let mut decomp = Decompressor::new(CompressionType::Zlib, true).unwrap();

    let payload = vec![0u8; 4096];
    let mut compressed = Vec::new();
    comp.compress(&payload, &mut compressed).unwrap();

    let mut out = Vec::new();
    assert!(decomp.decompress(&compressed, &mut out, 100).is_err());
}

#[test]
fn test_lz4_roundtrip() {
    let mut comp = Compressor::new(CompressionType::Lz4, 0, true).unwrap();
    let mut decomp = Decompressor::new(CompressionType::Lz4, true).unwrap();

    let payload = b"market data payload ".repeat(100);
    let mut compressed = Vec::new();
    let outcome = comp.compress(&payload, &mut compressed).unwrap();
    assert_eq!(outcome.bytes_in_used, payload.len());
    assert!(compressed.len() <= lz4_worst_case(payload.len()));

    let mut restored = Vec::new();
    decomp
        .decompress(&compressed, &mut restored, payload.len())
        .unwrap();
    assert_eq!(restored, payload);
}

#[test]
fn test_lz4_is_contextless_across_messages() {
    let mut comp = Compressor::new(CompressionType::Lz4, 0, true).unwrap();

    let payload = b"independent message".repeat(10);
    let mut first = Vec::new();
    comp.compress(&payload, &mut first).unwrap();
    let mut second = Vec::new();
    comp.compress(&payload, &mut second).unwrap();
    // No shared dictionary: identical inputs give identical outputs.
    assert_eq!(first, second);

    // A fresh decompressor handles either block.
    let mut decomp = Decompressor::new(CompressionType::Lz4, true).unwrap();
    let mut restored = Vec::new();
    decomp
        .decompress(&second, &mut restored, payload.len())
        .unwrap();
    assert_eq!(restored, payload);
}

#[test]
fn test_lz4_garbage_input_is_error() {
    let mut decomp = Decompressor::new(CompressionType::Lz4, true).unwrap();
    let mut out = Vec::new();
    assert!(decomp.decompress(&[0xff, 0x00, 0x13], &mut out, 64).is_err());
}

#[test]
fn test_raw_deflate_roundtrip_for_permessage_deflate() {
    let mut comp = Compressor::new(CompressionType::Zlib, 6, false).unwrap();
    let mut decomp = Decompressor::new(CompressionType::Zlib, false).unwrap();

    let payload = b"[{\"Type\":\"Refresh\"}]".repeat(8);
    let mut compressed = Vec::new();
    comp.compress(&payload, &mut compressed).unwrap();
    // Sync flush leaves the 00 00 ff ff trailer on a raw stream.
    assert!(compressed.ends_with(&[0x00, 0x00, 0xff, 0xff]));

    let mut restored = Vec::new();
    decomp
        .decompress(&compressed, &mut restored, payload.len())
        .unwrap();
    assert_eq!(restored, payload);
}

#[test]
fn test_reset_drops_dictionary() {
    let mut comp = Compressor::new(CompressionType::Zlib, 6, false).unwrap();
    let payload = b"repetitive repetitive repetitive".repeat(4);

    let mut first = Vec::new();
    comp.compress(&payload, &mut first).unwrap();
    comp.reset();
    let mut second = Vec::new();
    comp.compress(&payload, &mut second).unwrap();
    // After a reset the second block compresses exactly like the first.
    assert_eq!(first, second);
}
