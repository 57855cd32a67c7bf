//! Integration tests for the frame layer.
//!
//! These tests verify that the wire codec, frame buffer and payload
//! encodings fit together the way the dispatcher relies on.

use duplexwire::protocol::{build_frame, flags, FrameBuffer, FrameKind, Header, HEADER_SIZE};
use duplexwire::{DuplexError, Metadata, ResetCode, ResetReason};

/// HEADERS frame carrying MsgPack-encoded metadata.
#[test]
fn test_headers_frame_with_metadata_payload() {
    let md = Metadata::request("POST", "/upload").with("h1", "v1").with("h1", "v2");
    let payload = md.encode().unwrap();

    let header = Header::new(1, FrameKind::Headers, 0, payload.len() as u32);
    let frame_bytes = build_frame(&header, &payload);

    let mut buffer = FrameBuffer::new();
    let frames = buffer.push(&frame_bytes).unwrap();

    assert_eq!(frames.len(), 1);
    let frame = &frames[0];
    assert_eq!(frame.stream_id(), 1);
    assert_eq!(frame.kind(), Some(FrameKind::Headers));
    assert!(!frame.is_end_stream());

    let decoded = Metadata::decode(frame.payload()).unwrap();
    assert_eq!(decoded, md);
    assert_eq!(decoded.get_all("h1").collect::<Vec<_>>(), vec!["v1", "v2"]);
}

/// Body interleaved with metadata on one stream: DATA, HEADERS, DATA, END.
#[test]
fn test_interleaved_body_and_metadata_sequence() {
    let mut all_bytes = Vec::new();

    let data1 = Header::new(3, FrameKind::Data, 0, 6);
    all_bytes.extend(build_frame(&data1, b"staten"));

    let md = Metadata::of(&[("brooklyn", "zoo")]).encode().unwrap();
    let headers = Header::new(3, FrameKind::Headers, 0, md.len() as u32);
    all_bytes.extend(build_frame(&headers, &md));

    let data2 = Header::new(3, FrameKind::Data, 0, 7);
    all_bytes.extend(build_frame(&data2, b" island"));

    let end = Header::new(3, FrameKind::Data, flags::END_STREAM, 0);
    all_bytes.extend(build_frame(&end, &[]));

    let mut buffer = FrameBuffer::new();
    let frames = buffer.push(&all_bytes).unwrap();
    assert_eq!(frames.len(), 4);

    let kinds: Vec<_> = frames.iter().map(|f| f.kind().unwrap()).collect();
    assert_eq!(
        kinds,
        vec![FrameKind::Data, FrameKind::Headers, FrameKind::Data, FrameKind::Data]
    );

    let body: Vec<u8> = frames
        .iter()
        .filter(|f| f.kind() == Some(FrameKind::Data))
        .flat_map(|f| f.payload().to_vec())
        .collect();
    assert_eq!(body, b"staten island");

    assert!(frames[3].is_end_stream());
    assert!(frames[3].payload.is_empty());
}

/// Frames from several streams interleave freely.
#[test]
fn test_multiplexed_streams() {
    let mut all_bytes = Vec::new();
    for stream_id in [1u32, 2, 3, 4, 5] {
        let payload = format!("stream_{}", stream_id);
        let header = Header::new(stream_id, FrameKind::Data, 0, payload.len() as u32);
        all_bytes.extend(build_frame(&header, payload.as_bytes()));
    }

    let mut buffer = FrameBuffer::new();
    let frames = buffer.push(&all_bytes).unwrap();
    assert_eq!(frames.len(), 5);

    for (i, frame) in frames.iter().enumerate() {
        let stream_id = (i + 1) as u32;
        assert_eq!(frame.stream_id(), stream_id);
        assert_eq!(frame.header.is_client_initiated(), stream_id % 2 == 1);
        assert_eq!(frame.payload(), format!("stream_{}", stream_id).as_bytes());
    }
}

/// RST_STREAM payload survives the frame layer.
#[test]
fn test_rst_stream_frame() {
    let reason = ResetReason::new(ResetCode::RefusedStream, "no responder for GET /x");
    let payload = reason.encode().unwrap();

    let header = Header::new(7, FrameKind::RstStream, 0, payload.len() as u32);
    let mut buffer = FrameBuffer::new();
    let frames = buffer.push(&build_frame(&header, &payload)).unwrap();

    assert_eq!(frames[0].kind(), Some(FrameKind::RstStream));
    assert_eq!(ResetReason::decode(frames[0].payload()).unwrap(), reason);
}

/// Invalid headers are rejected before their payload is buffered.
#[test]
fn test_invalid_headers_rejected() {
    let mut buffer = FrameBuffer::new();
    let reserved_stream = Header::new(0, FrameKind::Data, 0, 0);
    assert!(matches!(
        buffer.push(&build_frame(&reserved_stream, &[])),
        Err(DuplexError::Protocol(_))
    ));

    let mut buffer = FrameBuffer::new();
    let mut bad_kind = build_frame(&Header::new(1, FrameKind::Data, 0, 0), &[]);
    bad_kind[4] = 0x2;
    assert!(matches!(
        buffer.push(&bad_kind),
        Err(DuplexError::Protocol(_))
    ));

    let mut buffer = FrameBuffer::with_max_payload(8);
    let oversized = Header::new(1, FrameKind::Data, 0, 9);
    assert!(matches!(
        buffer.push(&oversized.encode()),
        Err(DuplexError::Protocol(_))
    ));
}

/// Any split of a metadata frame across reads yields it exactly once.
#[test]
fn test_metadata_frame_survives_every_split() {
    let payload = Metadata::of(&[("note", "split me anywhere")]).encode().unwrap();
    let header = Header::new(1, FrameKind::Headers, 0, payload.len() as u32);
    let wire = build_frame(&header, &payload);

    for cut in 1..wire.len() {
        let mut decoder = FrameBuffer::new();
        assert!(decoder.push(&wire[..cut]).unwrap().is_empty(), "cut at {}", cut);
        assert_eq!(decoder.awaiting_payload(), cut >= HEADER_SIZE);

        let frames = decoder.push(&wire[cut..]).unwrap();
        assert_eq!(frames.len(), 1, "cut at {}", cut);
        let decoded = Metadata::decode(frames[0].payload()).unwrap();
        assert_eq!(decoded.get("note"), Some("split me anywhere"));
    }
}
