//! Terminal-side implementation of the kitty graphics protocol core.
//!
//! This crate parses inbound graphics commands, maintains a two-tier
//! cache of image frames (files on disk, decoded bitmaps and scaled
//! pixmaps in RAM) under strict budgets, drives per-image frame
//! animation, and produces protocol responses. The host terminal owns
//! the window, the cell grid, and the pixel output surface; it talks to
//! the core through three seams:
//!
//! - [`Surface`]: allocate/upload/composite/free pixmaps.
//! - [`GridHost`]: iterate image cells and schedule redraws.
//! - [`ImageDecoder`]: decode container formats (PNG, ...); raw RGB/RGBA
//!   with optional zlib compression is handled by the core itself.
//!
//! ## Typical integration
//!
//! ```
//! use termgfx_core::{GraphicsConfig, GraphicsContext, NullGrid, SoftwareSurface};
//!
//! let mut gfx = GraphicsContext::new(GraphicsConfig::default());
//! let mut grid = NullGrid;
//!
//! // Feed commands as they arrive on the wire (envelope stripped):
//! let result = gfx.parse_and_execute(b"Ga=t,i=1,f=24,s=1,v=1,m=0;////", &mut grid);
//! if let Some(response) = &result.response {
//!     // send the response back to the client
//!     assert!(response.starts_with("Gi=1;"));
//! }
//!
//! // Each frame, composite the visible placements:
//! let mut surface = SoftwareSurface::new(800, 600);
//! gfx.start_drawing(10, 20);
//! let mut dirty = vec![false; 30];
//! gfx.mark_dirty_animations(&mut dirty);
//! gfx.append_image_rect(&mut surface, 1, 0, 0, 1, 0, 1, 0, 0, 0, 10, 20, false);
//! gfx.finish_drawing(&mut surface);
//! ```
//!
//! ## References
//!
//! - [Kitty graphics protocol](https://sw.kovidgoyal.net/kitty/graphics-protocol/)

mod animation;
pub mod base64;
pub mod command;
mod compose;
pub mod config;
mod context;
pub mod decoder;
mod dispatch;
mod draw;
pub mod error;
mod evict;
pub mod image;
pub mod raw;
pub mod surface;

pub use config::GraphicsConfig;
pub use context::GraphicsContext;
pub use decoder::{DecodeError, DecodedBitmap, ImageDecoder, NoDecoder};
#[cfg(feature = "png-images")]
pub use decoder::PngDecoder;
pub use dispatch::{
    CellDisposition, CellImage, CommandResult, GridHost, NullGrid, PlaceholderRequest,
};
pub use draw::MAX_IMAGE_RECTS;
pub use error::{ErrorKind, GraphicsError};
pub use image::{
    AnimationState, FrameStatus, Image, ImageFrame, ImagePlacement, ScaleMode, UploadFailure,
};
pub use surface::{CompositeOp, PixmapId, SoftwareSurface, Surface};

/// The time unit used throughout: milliseconds since the context was
/// created. Used both for instants and durations.
pub type Milliseconds = i64;
