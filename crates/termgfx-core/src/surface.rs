//! The pixel surface seam.
//!
//! The core never talks to a window system directly; it asks the host's
//! surface to hold scaled pixmaps and composite them onto the output. The
//! capability set is deliberately small so GPU, X11, and software backends
//! can all satisfy it. [`SoftwareSurface`] is a complete in-memory
//! implementation used by the tests.

use std::collections::HashMap;

/// Opaque handle to a surface-side pixmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PixmapId(pub(crate) u64);

/// Porter-Duff operator used when compositing onto the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositeOp {
    /// Source-over; the pixmap alpha blends onto the output.
    Over,
    /// Source copy; the pixmap replaces the output rectangle.
    Src,
}

/// Host-provided pixel surface.
///
/// Pixel buffers handed to the surface are premultiplied ARGB32
/// (`0xAARRGGBB` words).
pub trait Surface {
    /// Allocate a `width x height` pixmap and return its handle.
    fn allocate_pixmap(&mut self, width: u32, height: u32) -> PixmapId;

    /// Upload premultiplied pixels into a previously allocated pixmap.
    fn upload_rgba_premultiplied(&mut self, pixmap: PixmapId, pixels: &[u32], width: u32, height: u32);

    /// Composite a rectangle of `src` onto the output.
    #[allow(clippy::too_many_arguments)]
    fn composite(
        &mut self,
        src: PixmapId,
        src_x: i32,
        src_y: i32,
        dst_x: i32,
        dst_y: i32,
        width: u32,
        height: u32,
        op: CompositeOp,
    );

    /// Create a bitwise-inverted copy of `src` (used for reverse video).
    fn invert_copy(&mut self, src: PixmapId, width: u32, height: u32) -> PixmapId;

    /// Release a pixmap.
    fn free_pixmap(&mut self, pixmap: PixmapId);
}

/// A pixmap held by [`SoftwareSurface`].
#[derive(Debug, Clone)]
struct SoftwarePixmap {
    width: u32,
    height: u32,
    pixels: Vec<u32>,
}

/// In-memory [`Surface`] implementation.
///
/// The output buffer is a plain ARGB32 canvas that tests can inspect.
#[derive(Debug)]
pub struct SoftwareSurface {
    next_id: u64,
    pixmaps: HashMap<PixmapId, SoftwarePixmap>,
    output_width: u32,
    output_height: u32,
    output: Vec<u32>,
}

impl SoftwareSurface {
    /// Create a surface with an output canvas of the given pixel size.
    pub fn new(output_width: u32, output_height: u32) -> Self {
        Self {
            next_id: 1,
            pixmaps: HashMap::new(),
            output_width,
            output_height,
            output: vec![0; output_width as usize * output_height as usize],
        }
    }

    /// The output canvas.
    pub fn output(&self) -> &[u32] {
        &self.output
    }

    /// One output pixel, or 0 outside the canvas.
    pub fn output_pixel(&self, x: u32, y: u32) -> u32 {
        if x >= self.output_width || y >= self.output_height {
            return 0;
        }
        self.output[(y * self.output_width + x) as usize]
    }

    /// Number of live pixmaps (tests use this to watch for leaks).
    pub fn live_pixmaps(&self) -> usize {
        self.pixmaps.len()
    }

    /// The raw pixels of a live pixmap.
    pub fn pixmap_pixels(&self, pixmap: PixmapId) -> Option<&[u32]> {
        self.pixmaps.get(&pixmap).map(|p| p.pixels.as_slice())
    }
}

impl Surface for SoftwareSurface {
    fn allocate_pixmap(&mut self, width: u32, height: u32) -> PixmapId {
        let id = PixmapId(self.next_id);
        self.next_id += 1;
        self.pixmaps.insert(
            id,
            SoftwarePixmap {
                width,
                height,
                pixels: vec![0; width as usize * height as usize],
            },
        );
        id
    }

    fn upload_rgba_premultiplied(&mut self, pixmap: PixmapId, pixels: &[u32], width: u32, height: u32) {
        if let Some(p) = self.pixmaps.get_mut(&pixmap) {
            debug_assert_eq!((p.width, p.height), (width, height));
            let len = p.pixels.len().min(pixels.len());
            p.pixels[..len].copy_from_slice(&pixels[..len]);
        }
    }

    fn composite(
        &mut self,
        src: PixmapId,
        src_x: i32,
        src_y: i32,
        dst_x: i32,
        dst_y: i32,
        width: u32,
        height: u32,
        op: CompositeOp,
    ) {
        let Some(pixmap) = self.pixmaps.get(&src) else { return };
        for row in 0..height as i32 {
            for col in 0..width as i32 {
                let (sx, sy) = (src_x + col, src_y + row);
                let (dx, dy) = (dst_x + col, dst_y + row);
                if sx < 0
                    || sy < 0
                    || sx >= pixmap.width as i32
                    || sy >= pixmap.height as i32
                    || dx < 0
                    || dy < 0
                    || dx >= self.output_width as i32
                    || dy >= self.output_height as i32
                {
                    continue;
                }
                let source = pixmap.pixels[(sy as u32 * pixmap.width + sx as u32) as usize];
                let dst_idx = (dy as u32 * self.output_width + dx as u32) as usize;
                self.output[dst_idx] = match op {
                    CompositeOp::Src => source,
                    CompositeOp::Over => over_premultiplied(source, self.output[dst_idx]),
                };
            }
        }
    }

    fn invert_copy(&mut self, src: PixmapId, width: u32, height: u32) -> PixmapId {
        let inverted: Vec<u32> = self
            .pixmaps
            .get(&src)
            .map(|p| p.pixels.iter().map(|&px| !px).collect())
            .unwrap_or_else(|| vec![0; width as usize * height as usize]);
        let id = self.allocate_pixmap(width, height);
        if let Some(p) = self.pixmaps.get_mut(&id) {
            let len = p.pixels.len().min(inverted.len());
            p.pixels[..len].copy_from_slice(&inverted[..len]);
        }
        id
    }

    fn free_pixmap(&mut self, pixmap: PixmapId) {
        self.pixmaps.remove(&pixmap);
    }
}

/// Source-over for premultiplied ARGB32: `out = src + dst * (1 - src_a)`.
fn over_premultiplied(src: u32, dst: u32) -> u32 {
    let src_a = src >> 24;
    if src_a == 255 {
        return src;
    }
    if src_a == 0 {
        return dst;
    }
    let inv = 255 - src_a;
    let channel = |shift: u32| {
        let s = (src >> shift) & 0xFF;
        let d = (dst >> shift) & 0xFF;
        (s + d * inv / 255).min(255)
    };
    channel(24) << 24 | channel(16) << 16 | channel(8) << 8 | channel(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_upload_composite_src() {
        let mut surface = SoftwareSurface::new(4, 4);
        let pixmap = surface.allocate_pixmap(2, 2);
        surface.upload_rgba_premultiplied(pixmap, &[0xFF111111; 4], 2, 2);
        surface.composite(pixmap, 0, 0, 1, 1, 2, 2, CompositeOp::Src);
        assert_eq!(surface.output_pixel(1, 1), 0xFF111111);
        assert_eq!(surface.output_pixel(2, 2), 0xFF111111);
        assert_eq!(surface.output_pixel(0, 0), 0);
    }

    #[test]
    fn composite_over_blends() {
        let mut surface = SoftwareSurface::new(1, 1);
        let below = surface.allocate_pixmap(1, 1);
        surface.upload_rgba_premultiplied(below, &[0xFF0000FF], 1, 1);
        surface.composite(below, 0, 0, 0, 0, 1, 1, CompositeOp::Src);

        // 50% premultiplied red over opaque blue.
        let above = surface.allocate_pixmap(1, 1);
        surface.upload_rgba_premultiplied(above, &[0x7F7F0000], 1, 1);
        surface.composite(above, 0, 0, 0, 0, 1, 1, CompositeOp::Over);

        let out = surface.output_pixel(0, 0);
        assert_eq!(out >> 24, 0xFF);
        assert_eq!((out >> 16) & 0xFF, 0x7F);
        assert_eq!(out & 0xFF, 0xFF - 0x7F);
    }

    #[test]
    fn invert_copy_is_bitwise_not() {
        let mut surface = SoftwareSurface::new(1, 1);
        let pixmap = surface.allocate_pixmap(1, 1);
        surface.upload_rgba_premultiplied(pixmap, &[0xFF00FF00], 1, 1);
        let inverted = surface.invert_copy(pixmap, 1, 1);
        assert_eq!(surface.pixmap_pixels(inverted).unwrap()[0], 0x00FF00FF);
    }

    #[test]
    fn free_removes_pixmap() {
        let mut surface = SoftwareSurface::new(1, 1);
        let pixmap = surface.allocate_pixmap(1, 1);
        assert_eq!(surface.live_pixmaps(), 1);
        surface.free_pixmap(pixmap);
        assert_eq!(surface.live_pixmaps(), 0);
    }

    #[test]
    fn out_of_bounds_composite_clipped() {
        let mut surface = SoftwareSurface::new(2, 2);
        let pixmap = surface.allocate_pixmap(2, 2);
        surface.upload_rgba_premultiplied(pixmap, &[0xFFFFFFFF; 4], 2, 2);
        surface.composite(pixmap, 0, 0, 1, 1, 2, 2, CompositeOp::Src);
        assert_eq!(surface.output_pixel(1, 1), 0xFFFFFFFF);
        assert_eq!(surface.output_pixel(0, 0), 0);
    }
}
