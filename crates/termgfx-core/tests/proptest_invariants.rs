//! Property-based invariant tests for the graphics core:
//!
//! 1. Base64 decoding inverts encoding for arbitrary byte strings.
//! 2. Raw pixel files reload bit-identically (RGB/RGBA, plain and zlib).
//! 3. The animation scheduler is idempotent for a repeated `now`.
//! 4. Bookkeeping counters survive arbitrary command interleavings.

use std::io::Write as _;

use proptest::prelude::*;
use termgfx_core::raw::{self, RawFormat};
use termgfx_core::{base64, GraphicsConfig, GraphicsContext, NullGrid};

// ── Helpers ─────────────────────────────────────────────────────────────

/// Standard base64 encoding, for driving the decoder.
fn encode_base64(data: &[u8]) -> String {
    const ALPHABET: &[u8; 64] =
        b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut out = String::new();
    for chunk in data.chunks(3) {
        let b = [chunk[0], *chunk.get(1).unwrap_or(&0), *chunk.get(2).unwrap_or(&0)];
        let n = (u32::from(b[0]) << 16) | (u32::from(b[1]) << 8) | u32::from(b[2]);
        out.push(ALPHABET[(n >> 18) as usize & 63] as char);
        out.push(ALPHABET[(n >> 12) as usize & 63] as char);
        out.push(if chunk.len() > 1 { ALPHABET[(n >> 6) as usize & 63] as char } else { '=' });
        out.push(if chunk.len() > 2 { ALPHABET[n as usize & 63] as char } else { '=' });
    }
    out
}

fn write_temp(bytes: &[u8]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(bytes).unwrap();
    file.flush().unwrap();
    file
}

fn deflate(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::fast());
    encoder.write_all(bytes).unwrap();
    encoder.finish().unwrap()
}

/// Build an animated image through the command interface: one root frame
/// plus one frame per extra gap, then set the gaps and start looping.
fn animated_context(image_id: u32, gaps: &[i32]) -> GraphicsContext {
    let mut ctx = GraphicsContext::new(GraphicsConfig::default());
    let mut grid = NullGrid;
    let payload = encode_base64(&[0x40, 0x41, 0x42]);
    let first = format!("Ga=t,i={},f=24,s=1,v=1,t=d,m=0;{}", image_id, payload);
    ctx.parse_and_execute(first.as_bytes(), &mut grid);
    for gap in &gaps[1..] {
        let cmd = format!("Ga=f,i={},f=24,s=1,v=1,z={},m=0;{}", image_id, gap, payload);
        ctx.parse_and_execute(cmd.as_bytes(), &mut grid);
    }
    let edit = format!("Ga=a,i={},r=1,z={}", image_id, gaps[0]);
    ctx.parse_and_execute(edit.as_bytes(), &mut grid);
    let looping = format!("Ga=a,i={},s=3", image_id);
    ctx.parse_and_execute(looping.as_bytes(), &mut grid);
    ctx
}

// ═════════════════════════════════════════════════════════════════════════
// 1. Base64 round-trip
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn base64_roundtrip(data in proptest::collection::vec(any::<u8>(), 0..512)) {
        let encoded = encode_base64(&data);
        prop_assert_eq!(base64::decode(encoded.as_bytes()), data);
    }

    #[test]
    fn base64_roundtrip_with_whitespace(
        data in proptest::collection::vec(any::<u8>(), 1..128),
        split in 1usize..64,
    ) {
        // Transports wrap payloads in whitespace; decoding must not care.
        let encoded = encode_base64(&data);
        let mut wrapped = String::new();
        for (i, c) in encoded.chars().enumerate() {
            if i % split == 0 {
                wrapped.push_str("\r\n ");
            }
            wrapped.push(c);
        }
        prop_assert_eq!(base64::decode(wrapped.as_bytes()), data);
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 2. Raw loader round-trip
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn raw_rgb24_roundtrip(
        width in 1u32..16,
        height in 1u32..16,
        seed in any::<u8>(),
        zlib in any::<bool>(),
    ) {
        let bytes: Vec<u8> = (0..width * height * 3)
            .map(|i| (i as u8).wrapping_add(seed))
            .collect();
        let stored = if zlib { deflate(&bytes) } else { bytes.clone() };
        let file = write_temp(&stored);
        let pixels =
            raw::load_file(file.path(), RawFormat::Rgb24, width, height, zlib, u64::MAX).unwrap();
        for (i, pixel) in pixels.iter().enumerate() {
            let expected = 0xFF00_0000
                | u32::from(bytes[i * 3]) << 16
                | u32::from(bytes[i * 3 + 1]) << 8
                | u32::from(bytes[i * 3 + 2]);
            prop_assert_eq!(*pixel, expected, "pixel {}", i);
        }
    }

    #[test]
    fn raw_rgba32_roundtrip(
        width in 1u32..16,
        height in 1u32..16,
        seed in any::<u8>(),
        zlib in any::<bool>(),
    ) {
        let bytes: Vec<u8> = (0..width * height * 4)
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
            .collect();
        let stored = if zlib { deflate(&bytes) } else { bytes.clone() };
        let file = write_temp(&stored);
        let pixels =
            raw::load_file(file.path(), RawFormat::Rgba32, width, height, zlib, u64::MAX).unwrap();
        for (i, pixel) in pixels.iter().enumerate() {
            let expected = u32::from(bytes[i * 4 + 3]) << 24
                | u32::from(bytes[i * 4]) << 16
                | u32::from(bytes[i * 4 + 1]) << 8
                | u32::from(bytes[i * 4 + 2]);
            prop_assert_eq!(*pixel, expected, "pixel {}", i);
        }
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 3. Scheduler idempotence
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn advance_idempotent_at_equal_now(
        gaps in proptest::collection::vec(-5i32..500, 1..6),
        times in proptest::collection::vec(0i64..10_000, 1..8),
    ) {
        let mut ctx = animated_context(2, &gaps);
        let mut times = times;
        times.sort_unstable();
        for now in times {
            ctx.advance_animation(2, now);
            let snapshot = {
                let img = ctx.image(2).unwrap();
                (img.current_frame, img.current_frame_time, img.next_redraw)
            };
            ctx.advance_animation(2, now);
            let img = ctx.image(2).unwrap();
            prop_assert_eq!(
                (img.current_frame, img.current_frame_time, img.next_redraw),
                snapshot,
                "not idempotent at now={}",
                now
            );
        }
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 4. Counter invariants under arbitrary command interleavings
// ═════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
enum Op {
    Upload { image_id: u32, side: u32 },
    AppendFrame { image_id: u32, gap: i32 },
    Put { image_id: u32, placement_id: u32 },
    Delete { image_id: u32, free_data: bool },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1u32..6, 1u32..4).prop_map(|(image_id, side)| Op::Upload { image_id, side }),
        (1u32..6, -2i32..300).prop_map(|(image_id, gap)| Op::AppendFrame { image_id, gap }),
        (1u32..6, 1u32..4).prop_map(|(image_id, placement_id)| Op::Put { image_id, placement_id }),
        (1u32..6, any::<bool>()).prop_map(|(image_id, free_data)| Op::Delete { image_id, free_data }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn counters_consistent_for_any_command_sequence(
        ops in proptest::collection::vec(op_strategy(), 1..24),
    ) {
        let mut ctx = GraphicsContext::new(GraphicsConfig::default());
        let mut grid = NullGrid;
        for op in ops {
            match op {
                Op::Upload { image_id, side } => {
                    let payload =
                        encode_base64(&vec![0x55u8; (side * side * 3) as usize]);
                    let cmd = format!(
                        "Ga=t,i={},f=24,s={},v={},t=d,m=0;{}",
                        image_id, side, side, payload
                    );
                    ctx.parse_and_execute(cmd.as_bytes(), &mut grid);
                }
                Op::AppendFrame { image_id, gap } => {
                    let payload = encode_base64(&[1, 2, 3]);
                    let cmd = format!(
                        "Ga=f,i={},f=24,s=1,v=1,z={},m=0;{}",
                        image_id, gap, payload
                    );
                    ctx.parse_and_execute(cmd.as_bytes(), &mut grid);
                }
                Op::Put { image_id, placement_id } => {
                    let cmd = format!("Ga=p,i={},p={},c=2,r=2", image_id, placement_id);
                    ctx.parse_and_execute(cmd.as_bytes(), &mut grid);
                }
                Op::Delete { image_id, free_data } => {
                    let specifier = if free_data { 'I' } else { 'i' };
                    let cmd = format!("Ga=d,d={},i={}", specifier, image_id);
                    ctx.parse_and_execute(cmd.as_bytes(), &mut grid);
                }
            }
            prop_assert!(ctx.counters_consistent(), "counters diverged after {:?}", op);
        }
    }
}
