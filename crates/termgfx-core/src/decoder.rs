//! The container-format decoder seam.
//!
//! Frames uploaded with `f=0` or `f=100` are in some container format
//! (PNG, JPEG, ...) that the core does not parse itself. The host plugs a
//! decoder in through [`ImageDecoder`]; `f=0` falls back to raw 32-bit
//! data when the decoder declines. A PNG decoder backed by the `png` crate
//! is available behind the `png-images` feature.

use std::fmt;
use std::io;
use std::path::Path;

/// A decoded bitmap: ARGB32 words at the image's own pixel size.
#[derive(Debug, Clone)]
pub struct DecodedBitmap {
    /// Pixel width.
    pub width: u32,
    /// Pixel height.
    pub height: u32,
    /// `width * height` ARGB32 (`0xAARRGGBB`) words, not premultiplied.
    pub pixels: Vec<u32>,
}

/// Why a decode attempt produced no bitmap.
#[derive(Debug)]
pub enum DecodeError {
    /// The decoder does not handle this data (lets `f=0` fall back to raw).
    Unsupported,
    /// The data was recognised but is corrupt.
    Invalid(String),
    /// Reading the file failed.
    Io(io::Error),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsupported => write!(f, "format not supported by this decoder"),
            Self::Invalid(msg) => write!(f, "invalid image data: {}", msg),
            Self::Io(e) => write!(f, "decode I/O error: {}", e),
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<io::Error> for DecodeError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Host-provided decoder for container image formats.
pub trait ImageDecoder {
    /// Decode the file at `path` into an ARGB32 bitmap.
    fn decode_file(&self, path: &Path) -> Result<DecodedBitmap, DecodeError>;
}

/// A decoder that declines everything; the default when the host supplies
/// none. `f=0` uploads then always take the raw-data fallback.
#[derive(Debug, Default)]
pub struct NoDecoder;

impl ImageDecoder for NoDecoder {
    fn decode_file(&self, _path: &Path) -> Result<DecodedBitmap, DecodeError> {
        Err(DecodeError::Unsupported)
    }
}

/// PNG decoder backed by the `png` crate.
#[cfg(feature = "png-images")]
#[derive(Debug, Default)]
pub struct PngDecoder;

#[cfg(feature = "png-images")]
impl ImageDecoder for PngDecoder {
    fn decode_file(&self, path: &Path) -> Result<DecodedBitmap, DecodeError> {
        let file = std::fs::File::open(path)?;
        let decoder = png::Decoder::new(std::io::BufReader::new(file));
        let mut reader = decoder
            .read_info()
            .map_err(|e| DecodeError::Invalid(format!("PNG decode error: {}", e)))?;
        let mut buf = vec![0u8; reader.output_buffer_size()];
        let info = reader
            .next_frame(&mut buf)
            .map_err(|e| DecodeError::Invalid(format!("PNG frame error: {}", e)))?;

        let width = info.width;
        let height = info.height;
        let data = &buf[..info.buffer_size()];
        let mut pixels = Vec::with_capacity(width as usize * height as usize);
        match info.color_type {
            png::ColorType::Rgba => {
                for px in data.chunks_exact(4) {
                    pixels.push(argb(px[3], px[0], px[1], px[2]));
                }
            }
            png::ColorType::Rgb => {
                for px in data.chunks_exact(3) {
                    pixels.push(argb(0xFF, px[0], px[1], px[2]));
                }
            }
            png::ColorType::GrayscaleAlpha => {
                for px in data.chunks_exact(2) {
                    pixels.push(argb(px[1], px[0], px[0], px[0]));
                }
            }
            png::ColorType::Grayscale => {
                for &gray in data {
                    pixels.push(argb(0xFF, gray, gray, gray));
                }
            }
            png::ColorType::Indexed => {
                return Err(DecodeError::Invalid("PNG indexed color not supported".to_string()));
            }
        }

        Ok(DecodedBitmap { width, height, pixels })
    }
}

#[cfg(feature = "png-images")]
fn argb(a: u8, r: u8, g: u8, b: u8) -> u32 {
    u32::from(a) << 24 | u32::from(r) << 16 | u32::from(g) << 8 | u32::from(b)
}
