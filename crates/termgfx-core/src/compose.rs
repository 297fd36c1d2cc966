//! Frame decoding, composition, and pixmap building.
//!
//! A frame's cache file holds only the transmitted data. Before display it
//! is decoded and composed onto the image's canonical canvas (background
//! color or background frame, paste offset, blend/replace), producing the
//! frame's resident ARGB32 bitmap. At draw time that bitmap is scaled into
//! the placement's cell box, premultiplied, and uploaded to the surface as
//! a pixmap.

use crate::context::GraphicsContext;
use crate::image::{FrameStatus, ScaleMode};
use crate::raw::{self, RawFormat};
use crate::surface::{PixmapId, Surface};

impl GraphicsContext {
    /// Load and compose a frame's bitmap into RAM. Idempotent when already
    /// loaded. Returns whether the bitmap is resident afterwards.
    ///
    /// Fails fast when the frame was never fully uploaded or its cache
    /// file has been evicted. Background-frame references are resolved
    /// recursively; a cycle is detected via the in-progress status and
    /// fails the load instead of recursing forever.
    pub(crate) fn ensure_decoded(&mut self, image_id: u32, frame_index: usize) -> bool {
        struct FrameMeta {
            format: i32,
            zlib: bool,
            data_pix_width: i32,
            data_pix_height: i32,
            offset_x: i32,
            offset_y: i32,
            background_color: u32,
            background_frame_index: i32,
            blend: bool,
        }

        let meta = {
            let Some(img) = self.images.get(&image_id) else { return false };
            let Some(frame) = img.frame(frame_index) else { return false };
            if frame.decoded.is_some() {
                return true;
            }
            if frame.status < FrameStatus::UploadSuccess {
                return false;
            }
            if frame.disk_size == 0 {
                if frame.status != FrameStatus::RamLoadingError {
                    log::error!(
                        "cached image file was deleted: image {} frame {}",
                        image_id,
                        frame_index
                    );
                }
                self.set_frame_status(image_id, frame_index, FrameStatus::RamLoadingError);
                return false;
            }
            if frame.status == FrameStatus::RamLoadingInProgress {
                log::error!("recursive loading of image {} frame {}", image_id, frame_index);
                self.set_frame_status(image_id, frame_index, FrameStatus::RamLoadingError);
                return false;
            }
            FrameMeta {
                format: frame.format,
                zlib: frame.compression != 0,
                data_pix_width: frame.data_pix_width,
                data_pix_height: frame.data_pix_height,
                offset_x: frame.offset_x,
                offset_y: frame.offset_y,
                background_color: frame.background_color,
                background_frame_index: frame.background_frame_index,
                blend: frame.blend,
            }
        };
        self.set_frame_status(image_id, frame_index, FrameStatus::RamLoadingInProgress);

        // Resolve the background frame first.
        let bg_index = meta.background_frame_index.max(0) as usize;
        if bg_index != 0 {
            let exists = self
                .images
                .get(&image_id)
                .and_then(|img| img.frame(bg_index))
                .is_some();
            if !exists || !self.ensure_decoded(image_id, bg_index) {
                log::error!(
                    "could not load background frame {} for image {} frame {}",
                    bg_index,
                    image_id,
                    frame_index
                );
                self.set_frame_status(image_id, frame_index, FrameStatus::RamLoadingError);
                return false;
            }
        }

        // Load the frame data itself.
        let Some(path) = self.frame_path(image_id, frame_index) else {
            self.set_frame_status(image_id, frame_index, FrameStatus::RamLoadingError);
            return false;
        };
        let max_bytes = self.config.max_image_ram_size;
        let mut data: Option<(u32, u32, Vec<u32>)> = None;
        if meta.format == 100 || meta.format == 0 {
            match self.decoder.decode_file(&path) {
                Ok(bitmap) => data = Some((bitmap.width, bitmap.height, bitmap.pixels)),
                Err(e) if meta.format == 100 => {
                    log::error!("could not decode image {} frame {}: {}", image_id, frame_index, e)
                }
                Err(_) => {} // f=0 falls back to raw below.
            }
        }
        if data.is_none() && matches!(meta.format, 0 | 24 | 32) {
            let width = meta.data_pix_width.max(0) as u32;
            let height = meta.data_pix_height.max(0) as u32;
            match raw::load_file(
                &path,
                RawFormat::from_protocol(meta.format),
                width,
                height,
                meta.zlib,
                max_bytes,
            ) {
                Ok(pixels) => data = Some((width, height, pixels)),
                Err(e) => {
                    log::error!("could not load image {} frame {}: {}", image_id, frame_index, e)
                }
            }
        }
        self.cycle_loaded_files += 1;

        let Some((data_width, data_height, pixels)) = data else {
            self.set_frame_status(image_id, frame_index, FrameStatus::RamLoadingError);
            return false;
        };

        // The first decoded frame establishes the canonical image size.
        let (canvas_width, canvas_height) = {
            let img = self.images.get_mut(&image_id).expect("image looked up above");
            if frame_index == 1 && img.pix_width == 0 && img.pix_height == 0 {
                img.pix_width = data_width;
                img.pix_height = data_height;
            }
            (img.pix_width, img.pix_height)
        };

        let needs_composition = meta.background_color != 0
            || bg_index != 0
            || canvas_width != data_width
            || canvas_height != data_height;
        let composed = if needs_composition {
            log::debug!(
                "composing image {} frame {} (bg 0x{:08X}, bg frame {})",
                image_id,
                frame_index,
                meta.background_color,
                bg_index
            );
            let size = canvas_width as usize * canvas_height as usize;
            let mut canvas = vec![argb_from_rrggbbaa(meta.background_color); size];
            if bg_index != 0 {
                if let Some(bg_pixels) = self
                    .images
                    .get(&image_id)
                    .and_then(|img| img.frame(bg_index))
                    .and_then(|f| f.decoded.as_deref())
                {
                    if bg_pixels.len() == canvas.len() {
                        canvas.copy_from_slice(bg_pixels);
                    }
                }
            }
            blit(
                &pixels,
                data_width,
                data_height,
                &mut canvas,
                canvas_width,
                canvas_height,
                meta.offset_x,
                meta.offset_y,
                meta.blend,
            );
            canvas
        } else {
            pixels
        };

        let frame_ram = {
            let img = self.images.get_mut(&image_id).expect("image looked up above");
            let ram = img.frame_ram_size();
            let frame = img.frame_mut(frame_index).expect("frame looked up above");
            frame.decoded = Some(composed);
            frame.status = FrameStatus::RamLoadingSuccess;
            ram
        };
        self.ram_bytes += frame_ram;
        log::debug!(
            "loaded image {} frame {}, ram now {} KiB (+{} KiB)",
            image_id,
            frame_index,
            self.ram_bytes / 1024,
            frame_ram / 1024
        );
        true
    }

    fn set_frame_status(&mut self, image_id: u32, frame_index: usize, status: FrameStatus) {
        if let Some(frame) =
            self.images.get_mut(&image_id).and_then(|img| img.frame_mut(frame_index))
        {
            frame.status = status;
        }
    }

    /// Clamp the source rectangle to the image and derive missing rows and
    /// columns from the current cell size.
    ///
    /// With no cell size yet (the host never started a draw cycle) the
    /// rows/cols stay unset; inference re-runs before each pixmap build.
    pub(crate) fn infer_placement_size(&mut self, image_id: u32, placement_id: u32) {
        let (current_cw, current_ch) = (self.current_cw, self.current_ch);
        let Some(img) = self.images.get_mut(&image_id) else { return };
        let (image_width, image_height) = (img.pix_width as i64, img.pix_height as i64);
        let Some(placement) = img.placement_mut(placement_id) else { return };

        // Negative values are quietly clamped.
        placement.src_pix_x = placement.src_pix_x.max(0);
        placement.src_pix_y = placement.src_pix_y.max(0);
        placement.src_pix_width = placement.src_pix_width.max(0);
        placement.src_pix_height = placement.src_pix_height.max(0);
        // Truncate the source rectangle to the image; zero size means the
        // remainder of the image.
        placement.src_pix_x = placement.src_pix_x.min(image_width as i32);
        placement.src_pix_y = placement.src_pix_y.min(image_height as i32);
        if placement.src_pix_width == 0
            || i64::from(placement.src_pix_x) + i64::from(placement.src_pix_width) > image_width
        {
            placement.src_pix_width = (image_width - i64::from(placement.src_pix_x)) as i32;
        }
        if placement.src_pix_height == 0
            || i64::from(placement.src_pix_y) + i64::from(placement.src_pix_height) > image_height
        {
            placement.src_pix_height = (image_height - i64::from(placement.src_pix_y)) as i32;
        }

        if placement.cols != 0 && placement.rows != 0 {
            return;
        }
        if placement.src_pix_width == 0 || placement.src_pix_height == 0 {
            return;
        }
        if current_cw == 0 || current_ch == 0 {
            return;
        }
        let src_w = i64::from(placement.src_pix_width);
        let src_h = i64::from(placement.src_pix_height);
        let cw = i64::from(current_cw);
        let ch = i64::from(current_ch);

        if placement.cols == 0 && placement.rows == 0 {
            placement.cols = clamp_cells(ceil_div(src_w, cw));
            placement.rows = clamp_cells(ceil_div(src_h, ch));
            return;
        }

        if placement.scale_mode == ScaleMode::Contain {
            // Preserve the aspect ratio: the derived dimension is the
            // smallest that lets the whole source fit the specified one.
            if placement.cols == 0 {
                placement.cols =
                    clamp_cells(ceil_div(src_w * i64::from(placement.rows) * ch, src_h * cw));
            } else {
                placement.rows =
                    clamp_cells(ceil_div(src_h * i64::from(placement.cols) * cw, src_w * ch));
            }
        } else {
            // Otherwise both dimensions derive from the pixel size alone.
            if placement.cols == 0 {
                placement.cols = clamp_cells(ceil_div(src_w, cw));
            }
            if placement.rows == 0 {
                placement.rows = clamp_cells(ceil_div(src_h, ch));
            }
        }
    }

    /// Build (or fetch) the scaled pixmap for one frame of a placement.
    ///
    /// A cell-size change invalidates the placement's whole pixmap set
    /// first, so the surviving set is always coherent. The freshly built
    /// pixmap is protected while the budget check runs.
    pub(crate) fn build_pixmap(
        &mut self,
        surface: &mut dyn Surface,
        image_id: u32,
        placement_id: u32,
        frame_index: usize,
        cw: u16,
        ch: u16,
    ) -> Option<PixmapId> {
        self.touch_placement(image_id, placement_id);
        self.touch_frame(image_id, frame_index);

        // A cell size mismatch invalidates every pixmap of the placement.
        let mismatch = {
            let placement = self.images.get(&image_id)?.placement(placement_id)?;
            placement.scaled_cw != cw || placement.scaled_ch != ch
        };
        if mismatch {
            self.unload_placement(image_id, placement_id);
            let placement =
                self.images.get_mut(&image_id)?.placement_mut(placement_id)?;
            placement.scaled_cw = cw;
            placement.scaled_ch = ch;
        }

        if let Some(pixmap) =
            self.images.get(&image_id)?.placement(placement_id)?.pixmap(frame_index)
        {
            return Some(pixmap);
        }

        log::debug!("loading pixmap {}/{} frame {}", image_id, placement_id, frame_index);
        if self.images.get(&image_id)?.frame(frame_index).is_none() {
            log::error!("could not find frame {} for image {}", frame_index, image_id);
            return None;
        }
        if !self.ensure_decoded(image_id, frame_index) {
            return None;
        }
        self.infer_placement_size(image_id, placement_id);

        let (scaled_w, scaled_h, src_x, src_y, src_w, src_h, mode) = {
            let placement = self.images.get(&image_id)?.placement(placement_id)?;
            (
                u32::from(placement.cols) * u32::from(cw),
                u32::from(placement.rows) * u32::from(ch),
                placement.src_pix_x,
                placement.src_pix_y,
                placement.src_pix_width,
                placement.src_pix_height,
                placement.scale_mode,
            )
        };
        if scaled_w == 0 || scaled_h == 0 {
            return None;
        }
        if u64::from(scaled_w) * u64::from(scaled_h) * 4 > self.config.max_image_ram_size {
            log::error!(
                "placement {}/{} would be too big to load: {} x {} x 4 > {}",
                image_id,
                placement_id,
                scaled_w,
                scaled_h,
                self.config.max_image_ram_size
            );
            return None;
        }

        // Scale the source rectangle into a transparent canvas.
        let mut canvas = vec![0u32; scaled_w as usize * scaled_h as usize];
        {
            let img = self.images.get(&image_id)?;
            let bitmap = img.frame(frame_index)?.decoded.as_deref()?;
            let stride = img.pix_width;
            if src_w <= 0 || src_h <= 0 {
                log::warn!("image {} placement {} has a zero-size source", image_id, placement_id);
            } else {
                let box_too_small = scaled_w < src_w as u32 || scaled_h < src_h as u32;
                match mode {
                    ScaleMode::Fill => scale_into(
                        bitmap, stride, src_x, src_y, src_w, src_h, &mut canvas, scaled_w,
                        scaled_h, 0, 0, scaled_w, scaled_h,
                    ),
                    ScaleMode::None => scale_into(
                        bitmap, stride, src_x, src_y, src_w, src_h, &mut canvas, scaled_w,
                        scaled_h, 0, 0, src_w as u32, src_h as u32,
                    ),
                    ScaleMode::NoneOrContain if !box_too_small => scale_into(
                        bitmap, stride, src_x, src_y, src_w, src_h, &mut canvas, scaled_w,
                        scaled_h, 0, 0, src_w as u32, src_h as u32,
                    ),
                    _ => {
                        // Contain: letter/pillar-box preserving aspect ratio.
                        let (dest_x, dest_y, dest_w, dest_h) =
                            if scaled_w as i64 * src_h as i64 > src_w as i64 * scaled_h as i64 {
                                // The box is wider than the image: fit to height.
                                let dest_w =
                                    (src_w as i64 * scaled_h as i64 / src_h as i64) as u32;
                                ((scaled_w - dest_w) as i32 / 2, 0, dest_w, scaled_h)
                            } else {
                                let dest_h =
                                    (src_h as i64 * scaled_w as i64 / src_w as i64) as u32;
                                (0, (scaled_h - dest_h) as i32 / 2, scaled_w, dest_h)
                            };
                        scale_into(
                            bitmap, stride, src_x, src_y, src_w, src_h, &mut canvas, scaled_w,
                            scaled_h, dest_x, dest_y, dest_w, dest_h,
                        );
                    }
                }
            }
        }

        // The surface compositor expects premultiplied alpha.
        premultiply_alpha(&mut canvas);
        let pixmap = surface.allocate_pixmap(scaled_w, scaled_h);
        surface.upload_rgba_premultiplied(pixmap, &canvas, scaled_w, scaled_h);

        let single_ram = {
            let placement =
                self.images.get_mut(&image_id)?.placement_mut(placement_id)?;
            placement.set_pixmap(frame_index, Some(pixmap));
            placement.single_frame_ram_size()
        };
        self.ram_bytes += single_ram;
        self.cycle_loaded_pixmaps += 1;
        log::debug!(
            "loaded pixmap {}/{} frame {}, ram now {} KiB (+{} KiB)",
            image_id,
            placement_id,
            frame_index,
            self.ram_bytes / 1024,
            single_ram / 1024
        );

        // Free resources if needed, but never the pixmap just built.
        if let Some(placement) = self.images.get_mut(&image_id).and_then(|i| i.placement_mut(placement_id)) {
            placement.protected_frame = frame_index;
        }
        self.check_limits();
        if let Some(placement) = self.images.get_mut(&image_id).and_then(|i| i.placement_mut(placement_id)) {
            placement.protected_frame = 0;
        }

        Some(pixmap)
    }
}

fn ceil_div(a: i64, b: i64) -> i64 {
    (a + b - 1) / b
}

fn clamp_cells(value: i64) -> u16 {
    value.clamp(0, i64::from(u16::MAX)) as u16
}

/// 0xRRGGBBAA (protocol order) to 0xAARRGGBB (buffer order).
fn argb_from_rrggbbaa(color: u32) -> u32 {
    color.rotate_right(8)
}

/// Paste `src` onto `dst` at `(offset_x, offset_y)`, alpha blending when
/// `blend` is set, replacing pixels otherwise. Out-of-canvas parts clip.
#[allow(clippy::too_many_arguments)]
fn blit(
    src: &[u32],
    src_width: u32,
    src_height: u32,
    dst: &mut [u32],
    dst_width: u32,
    dst_height: u32,
    offset_x: i32,
    offset_y: i32,
    blend: bool,
) {
    for src_y in 0..src_height {
        let dst_y = i64::from(offset_y) + i64::from(src_y);
        if dst_y < 0 || dst_y >= i64::from(dst_height) {
            continue;
        }
        for src_x in 0..src_width {
            let dst_x = i64::from(offset_x) + i64::from(src_x);
            if dst_x < 0 || dst_x >= i64::from(dst_width) {
                continue;
            }
            let src_px = src[(src_y * src_width + src_x) as usize];
            let dst_idx = (dst_y * i64::from(dst_width) + dst_x) as usize;
            dst[dst_idx] = if blend { blend_over(src_px, dst[dst_idx]) } else { src_px };
        }
    }
}

/// Straight-alpha source-over blend of ARGB32 pixels.
fn blend_over(src: u32, dst: u32) -> u32 {
    let src_a = src >> 24;
    if src_a == 255 {
        return src;
    }
    if src_a == 0 {
        return dst;
    }
    let inv = 255 - src_a;
    let dst_a = dst >> 24;
    let channel = |shift: u32| {
        let s = (src >> shift) & 0xFF;
        let d = (dst >> shift) & 0xFF;
        (s * src_a + d * inv) / 255
    };
    let out_a = (src_a + dst_a * inv / 255).min(255);
    out_a << 24 | channel(16) << 16 | channel(8) << 8 | channel(0)
}

/// Nearest-neighbour copy of a source rectangle into a destination
/// rectangle (straight alpha; the canvas starts fully transparent).
#[allow(clippy::too_many_arguments)]
fn scale_into(
    src: &[u32],
    src_stride: u32,
    src_x: i32,
    src_y: i32,
    src_w: i32,
    src_h: i32,
    dst: &mut [u32],
    dst_width: u32,
    dst_height: u32,
    dest_x: i32,
    dest_y: i32,
    dest_w: u32,
    dest_h: u32,
) {
    if dest_w == 0 || dest_h == 0 || src_w <= 0 || src_h <= 0 {
        return;
    }
    let src_rows = if src_stride == 0 { 0 } else { src.len() as i64 / i64::from(src_stride) };
    for out_y in 0..dest_h {
        let dst_y = i64::from(dest_y) + i64::from(out_y);
        if dst_y < 0 || dst_y >= i64::from(dst_height) {
            continue;
        }
        let sample_y = i64::from(src_y) + i64::from(out_y) * i64::from(src_h) / i64::from(dest_h);
        if sample_y < 0 || sample_y >= src_rows {
            continue;
        }
        for out_x in 0..dest_w {
            let dst_x = i64::from(dest_x) + i64::from(out_x);
            if dst_x < 0 || dst_x >= i64::from(dst_width) {
                continue;
            }
            let sample_x =
                i64::from(src_x) + i64::from(out_x) * i64::from(src_w) / i64::from(dest_w);
            if sample_x < 0 || sample_x >= i64::from(src_stride) {
                continue;
            }
            let src_px = src[(sample_y * i64::from(src_stride) + sample_x) as usize];
            dst[(dst_y * i64::from(dst_width) + dst_x) as usize] = src_px;
        }
    }
}

/// Premultiply the alpha channel in place (`0xAARRGGBB` words).
fn premultiply_alpha(pixels: &mut [u32]) {
    for pixel in pixels.iter_mut() {
        let a = *pixel >> 24;
        if a == 0 {
            *pixel = 0;
        } else if a != 255 {
            let r = ((*pixel >> 16) & 0xFF) * a / 255;
            let g = ((*pixel >> 8) & 0xFF) * a / 255;
            let b = (*pixel & 0xFF) * a / 255;
            *pixel = a << 24 | r << 16 | g << 8 | b;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_conversion_rotates_alpha() {
        // 0xRRGGBBAA -> 0xAARRGGBB
        assert_eq!(argb_from_rrggbbaa(0x11223344), 0x44112233);
        assert_eq!(argb_from_rrggbbaa(0xFF0000FF), 0xFFFF0000);
    }

    #[test]
    fn premultiply_zeroes_transparent() {
        let mut pixels = vec![0x00FFFFFF, 0xFF808080, 0x80FF0000];
        premultiply_alpha(&mut pixels);
        assert_eq!(pixels[0], 0);
        assert_eq!(pixels[1], 0xFF808080);
        assert_eq!(pixels[2], 0x80800000);
    }

    #[test]
    fn blend_opaque_replaces() {
        assert_eq!(blend_over(0xFF123456, 0xFFFFFFFF), 0xFF123456);
        assert_eq!(blend_over(0x00123456, 0xFFABCDEF), 0xFFABCDEF);
    }

    #[test]
    fn blit_replace_vs_blend() {
        let src = vec![0x80FF0000];
        let mut dst = vec![0xFF0000FF];
        blit(&src, 1, 1, &mut dst, 1, 1, 0, 0, false);
        assert_eq!(dst[0], 0x80FF0000);

        let mut dst = vec![0xFF0000FF];
        blit(&src, 1, 1, &mut dst, 1, 1, 0, 0, true);
        assert_eq!(dst[0] >> 24, 0xFF);
        assert!(dst[0] & 0xFF < 0xFF); // blue darkened by the red overlay
    }

    #[test]
    fn blit_clips_offsets() {
        let src = vec![0xFF111111; 4]; // 2x2
        let mut dst = vec![0u32; 4]; // 2x2
        blit(&src, 2, 2, &mut dst, 2, 2, 1, 1, false);
        assert_eq!(dst, vec![0, 0, 0, 0xFF111111]);

        let mut dst = vec![0u32; 4];
        blit(&src, 2, 2, &mut dst, 2, 2, -1, -1, false);
        assert_eq!(dst, vec![0xFF111111, 0, 0, 0]);
    }

    #[test]
    fn scale_into_stretches() {
        // 1x1 red scaled to 2x2.
        let src = vec![0xFFFF0000];
        let mut dst = vec![0u32; 4];
        scale_into(&src, 1, 0, 0, 1, 1, &mut dst, 2, 2, 0, 0, 2, 2);
        assert!(dst.iter().all(|&p| p == 0xFFFF0000));
    }

    #[test]
    fn scale_into_downsamples() {
        // 2x2 checkerboard scaled to 1x1 picks the top-left sample.
        let src = vec![0xFF111111, 0xFF222222, 0xFF333333, 0xFF444444];
        let mut dst = vec![0u32; 1];
        scale_into(&src, 2, 0, 0, 2, 2, &mut dst, 1, 1, 0, 0, 1, 1);
        assert_eq!(dst[0], 0xFF111111);
    }

    #[test]
    fn scale_into_respects_source_rect() {
        let src = vec![0xFF111111, 0xFF222222, 0xFF333333, 0xFF444444]; // 2x2
        let mut dst = vec![0u32; 1];
        scale_into(&src, 2, 1, 1, 1, 1, &mut dst, 1, 1, 0, 0, 1, 1);
        assert_eq!(dst[0], 0xFF444444);
    }

    #[test]
    fn ceil_div_rounds_up() {
        assert_eq!(ceil_div(10, 5), 2);
        assert_eq!(ceil_div(11, 5), 3);
        assert_eq!(ceil_div(1, 5), 1);
    }
}
