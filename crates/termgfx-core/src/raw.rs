//! Raw RGB/RGBA pixel data loading.
//!
//! Frames uploaded with `f=24` or `f=32` are stored on disk exactly as
//! transmitted: packed RGB or RGBA bytes, optionally zlib-compressed. This
//! module streams such a file into an ARGB32 buffer (one `u32` per pixel,
//! `0xAARRGGBB`), with opaque alpha synthesized for 24-bit data.
//!
//! The file may be shorter than declared (missing pixels stay transparent
//! black) or longer (excess data is truncated at `width * height` pixels).

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use flate2::bufread::ZlibDecoder;

/// Input window for the streaming inflater.
const INPUT_WINDOW: usize = 8 * 1024;
/// Output window for pixel conversion; also the uncompressed read chunk.
const OUTPUT_WINDOW: usize = 16 * 1024;

/// Pixel layout of the on-disk data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawFormat {
    /// 3 bytes per pixel, alpha synthesized as opaque.
    Rgb24,
    /// 4 bytes per pixel.
    Rgba32,
}

impl RawFormat {
    /// Map the protocol's `f=` value; anything but 24 means RGBA here.
    pub fn from_protocol(format: i32) -> Self {
        if format == 24 {
            Self::Rgb24
        } else {
            Self::Rgba32
        }
    }

    fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgb24 => 3,
            Self::Rgba32 => 4,
        }
    }
}

/// Load raw pixel data from `path` into an ARGB32 buffer of exactly
/// `width * height` pixels.
///
/// Fails before allocating anything if the decoded buffer (4 bytes per
/// pixel, regardless of the on-disk format) would exceed `max_bytes`.
pub fn load_file(
    path: &Path,
    format: RawFormat,
    width: u32,
    height: u32,
    zlib: bool,
    max_bytes: u64,
) -> io::Result<Vec<u32>> {
    let total_pixels = u64::from(width) * u64::from(height);
    if total_pixels * 4 > max_bytes {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("image too big to load: {} > {}", total_pixels * 4, max_bytes),
        ));
    }

    let file = File::open(path)?;
    let mut pixels = vec![0u32; total_pixels as usize];
    if zlib {
        let reader = ZlibDecoder::new(BufReader::with_capacity(INPUT_WINDOW, file));
        read_pixels(reader, format, &mut pixels)?;
    } else {
        read_pixels(file, format, &mut pixels)?;
    }
    Ok(pixels)
}

/// Stream bytes from `reader`, converting full pixels into `out`. Partial
/// pixels are carried across read boundaries. Stops at the end of the
/// stream, on a truncated stream, or once `out` is full.
fn read_pixels<R: Read>(mut reader: R, format: RawFormat, out: &mut [u32]) -> io::Result<()> {
    let bpp = format.bytes_per_pixel();
    let mut chunk = [0u8; OUTPUT_WINDOW];
    let mut filled = 0usize;
    let mut written = 0usize;

    while written < out.len() {
        let read = match reader.read(&mut chunk[filled..]) {
            Ok(0) => break,
            Ok(n) => n,
            // A truncated stream loads what it has, like a short file.
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        };
        filled += read;

        let full_pixels = (filled / bpp).min(out.len() - written);
        convert_pixels(&chunk[..full_pixels * bpp], format, &mut out[written..written + full_pixels]);
        written += full_pixels;

        let consumed = full_pixels * bpp;
        chunk.copy_within(consumed..filled, 0);
        filled -= consumed;
    }
    Ok(())
}

/// Convert packed RGB/RGBA bytes into ARGB32 words.
fn convert_pixels(bytes: &[u8], format: RawFormat, out: &mut [u32]) {
    match format {
        RawFormat::Rgba32 => {
            for (chunk, pixel) in bytes.chunks_exact(4).zip(out.iter_mut()) {
                *pixel = u32::from(chunk[3]) << 24
                    | u32::from(chunk[0]) << 16
                    | u32::from(chunk[1]) << 8
                    | u32::from(chunk[2]);
            }
        }
        RawFormat::Rgb24 => {
            for (chunk, pixel) in bytes.chunks_exact(3).zip(out.iter_mut()) {
                *pixel = 0xFF00_0000
                    | u32::from(chunk[0]) << 16
                    | u32::from(chunk[1]) << 8
                    | u32::from(chunk[2]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        file
    }

    fn deflate(bytes: &[u8]) -> Vec<u8> {
        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn rgb24_opaque_alpha() {
        let file = write_temp(&[1, 2, 3, 4, 5, 6]);
        let pixels =
            load_file(file.path(), RawFormat::Rgb24, 2, 1, false, u64::MAX).unwrap();
        assert_eq!(pixels, vec![0xFF010203, 0xFF040506]);
    }

    #[test]
    fn rgba32_preserves_alpha() {
        let file = write_temp(&[0x10, 0x20, 0x30, 0x80]);
        let pixels =
            load_file(file.path(), RawFormat::Rgba32, 1, 1, false, u64::MAX).unwrap();
        assert_eq!(pixels, vec![0x80102030]);
    }

    #[test]
    fn short_file_leaves_transparent_tail() {
        let file = write_temp(&[1, 2, 3]);
        let pixels =
            load_file(file.path(), RawFormat::Rgb24, 2, 1, false, u64::MAX).unwrap();
        assert_eq!(pixels, vec![0xFF010203, 0]);
    }

    #[test]
    fn long_file_truncated() {
        let file = write_temp(&[1, 2, 3, 4, 5, 6, 7, 8, 9]);
        let pixels =
            load_file(file.path(), RawFormat::Rgb24, 1, 1, false, u64::MAX).unwrap();
        assert_eq!(pixels, vec![0xFF010203]);
    }

    #[test]
    fn zlib_roundtrip() {
        let raw: Vec<u8> = (0..48u8).collect(); // 4x4 RGB
        let file = write_temp(&deflate(&raw));
        let pixels = load_file(file.path(), RawFormat::Rgb24, 4, 4, true, u64::MAX).unwrap();
        let direct = write_temp(&raw);
        let expected =
            load_file(direct.path(), RawFormat::Rgb24, 4, 4, false, u64::MAX).unwrap();
        assert_eq!(pixels, expected);
    }

    #[test]
    fn zlib_excess_output_truncated() {
        let raw = vec![7u8; 4 * 100]; // 100 RGBA pixels
        let file = write_temp(&deflate(&raw));
        let pixels = load_file(file.path(), RawFormat::Rgba32, 2, 2, true, u64::MAX).unwrap();
        assert_eq!(pixels.len(), 4);
        assert!(pixels.iter().all(|&p| p == 0x07070707));
    }

    #[test]
    fn zlib_corrupt_stream_fails() {
        let file = write_temp(&[0x12, 0x34, 0x56, 0x78, 0x9a]);
        let result = load_file(file.path(), RawFormat::Rgba32, 1, 1, true, u64::MAX);
        assert!(result.is_err());
    }

    #[test]
    fn over_ram_limit_rejected_before_allocation() {
        let file = write_temp(&[0u8; 16]);
        let result = load_file(file.path(), RawFormat::Rgba32, 100, 100, false, 1024);
        assert!(result.is_err());
    }

    #[test]
    fn pixel_carries_across_chunk_boundary() {
        // 16 KiB output window; RGB pixels straddle it because 3 does not
        // divide the window size evenly.
        let pixel_count = (OUTPUT_WINDOW / 3) + 7;
        let raw: Vec<u8> = (0..pixel_count * 3).map(|i| (i % 251) as u8).collect();
        let file = write_temp(&raw);
        let pixels = load_file(
            file.path(),
            RawFormat::Rgb24,
            pixel_count as u32,
            1,
            false,
            u64::MAX,
        )
        .unwrap();
        for (i, &pixel) in pixels.iter().enumerate() {
            let r = (i * 3 % 251) as u32;
            let g = ((i * 3 + 1) % 251) as u32;
            let b = ((i * 3 + 2) % 251) as u32;
            assert_eq!(pixel, 0xFF000000 | r << 16 | g << 8 | b, "pixel {}", i);
        }
    }
}
