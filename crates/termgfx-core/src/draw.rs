//! The draw cycle: rect coalescing, animation-driven redraw scheduling,
//! and compositing onto the surface.
//!
//! The host calls [`GraphicsContext::start_drawing`], then
//! [`GraphicsContext::mark_dirty_animations`], then appends one rectangle
//! per visible image stripe, and finally calls
//! [`GraphicsContext::finish_drawing`]. Appended stripes that extend a
//! pending rectangle downward merge into it, so a full-screen image
//! becomes a single composite call rather than one per row.

use crate::animation;
use crate::context::GraphicsContext;
use crate::surface::{CompositeOp, Surface};
use crate::Milliseconds;

/// Maximum number of pending image rectangles per draw cycle.
pub const MAX_IMAGE_RECTS: usize = 20;

/// A rectangular part of an image placement waiting to be drawn.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ImageRect {
    pub image_id: u32,
    pub placement_id: u32,
    /// Position of the rectangle on the output, in pixels.
    pub screen_x_pix: i32,
    pub screen_y_pix: i32,
    /// The starting screen row, for per-row redraw bookkeeping.
    pub screen_y_row: i32,
    /// The part of the image to draw, in cells. Ends are exclusive.
    pub start_col: i32,
    pub end_col: i32,
    pub start_row: i32,
    pub end_row: i32,
    /// Cell size the rect was appended with.
    pub cw: u16,
    pub ch: u16,
    /// Invert colors (selection).
    pub reverse: bool,
}

impl ImageRect {
    fn bottom(&self) -> i32 {
        self.screen_y_pix + (self.end_row - self.start_row) * i32::from(self.ch)
    }
}

impl GraphicsContext {
    /// Begin a draw cycle. `cw`/`ch` are the current cell dimensions in
    /// pixels. The cycle is anchored at the current time.
    pub fn start_drawing(&mut self, cw: u16, ch: u16) {
        let now = self.now_ms();
        self.start_drawing_at(cw, ch, now);
    }

    /// Begin a draw cycle anchored at an explicit time. All animations
    /// advanced during this cycle use `now`, so every placement of an
    /// image shows the same frame.
    pub fn start_drawing_at(&mut self, cw: u16, ch: u16, now: Milliseconds) {
        self.current_cw = cw;
        self.current_ch = ch;
        self.cycle_loaded_files = 0;
        self.cycle_loaded_pixmaps = 0;
        self.drawing_start_time = now;
    }

    /// Mark rows whose animations are due as dirty. Call right after
    /// [`Self::start_drawing`]; `dirty` has one flag per screen row.
    pub fn mark_dirty_animations(&mut self, dirty: &mut [bool]) {
        if dirty.len() < self.next_redraw_times.len() {
            self.next_redraw_times.truncate(dirty.len());
        }
        for (row, flag) in dirty.iter_mut().enumerate() {
            if row >= self.next_redraw_times.len() {
                break;
            }
            if *flag {
                self.next_redraw_times[row] = 0;
                continue;
            }
            let next = self.next_redraw_times[row];
            if next > 0 && next <= self.drawing_start_time {
                *flag = true;
                self.next_redraw_times[row] = 0;
            }
        }
    }

    /// Queue a rectangular part of a placement for drawing. May draw a
    /// previously queued rectangle to make room. Cell ranges are
    /// zero-based with exclusive ends; `y_row` is the starting screen row
    /// and `x_pix`/`y_pix` the pixel origin on the output.
    #[allow(clippy::too_many_arguments)]
    pub fn append_image_rect(
        &mut self,
        surface: &mut dyn Surface,
        image_id: u32,
        placement_id: u32,
        start_col: i32,
        end_col: i32,
        start_row: i32,
        end_row: i32,
        y_row: i32,
        x_pix: i32,
        y_pix: i32,
        cw: u16,
        ch: u16,
        reverse: bool,
    ) {
        self.current_cw = cw;
        self.current_ch = ch;
        if image_id == 0 || end_col - start_col <= 0 || end_row - start_row <= 0 {
            return;
        }

        let new_rect = ImageRect {
            image_id,
            placement_id,
            screen_x_pix: x_pix,
            screen_y_pix: y_pix,
            screen_y_row: y_row,
            start_col,
            end_col,
            start_row,
            end_row,
            cw,
            ch,
            reverse,
        };

        // Try to merge with a pending rect; remember a free slot.
        let mut free_slot = None;
        for slot in 0..MAX_IMAGE_RECTS {
            let Some(rect) = &mut self.pending_rects[slot] else {
                if free_slot.is_none() {
                    free_slot = Some(slot);
                }
                continue;
            };
            if rect.image_id != image_id
                || rect.placement_id != placement_id
                || rect.cw != cw
                || rect.ch != ch
                || rect.reverse != reverse
            {
                continue;
            }
            // Only a perfectly aligned stripe appended at the bottom of an
            // existing rect merges.
            if rect.end_row == start_row
                && rect.bottom() == y_pix
                && rect.start_col == start_col
                && rect.end_col == end_col
                && rect.screen_x_pix == x_pix
            {
                rect.end_row = end_row;
                return;
            }
        }

        let slot = match free_slot {
            Some(slot) => slot,
            None => {
                // All slots taken: draw the rect that ends highest on the
                // screen and reuse its slot.
                let mut lowest = 0;
                for slot in 1..MAX_IMAGE_RECTS {
                    let bottom = self.pending_rects[slot].map(|r| r.bottom());
                    let lowest_bottom = self.pending_rects[lowest].map(|r| r.bottom());
                    if bottom < lowest_bottom {
                        lowest = slot;
                    }
                }
                if let Some(rect) = self.pending_rects[lowest].take() {
                    self.draw_image_rect(surface, &rect);
                }
                lowest
            }
        };
        self.pending_rects[slot] = Some(new_rect);
    }

    /// Draw all pending rectangles, compute the delay until the next
    /// animation redraw, and enforce the cache budgets. Returns the delay
    /// (`None` when no redraw is scheduled).
    pub fn finish_drawing(&mut self, surface: &mut dyn Surface) -> Option<Milliseconds> {
        for slot in 0..MAX_IMAGE_RECTS {
            if let Some(rect) = self.pending_rects[slot].take() {
                self.draw_image_rect(surface, &rect);
            }
        }

        let end_time = self.now_ms();
        let min_delay = self.config.animation_min_delay.as_millis() as Milliseconds;
        let mut delay: Option<Milliseconds> = None;
        for &row_redraw in &self.next_redraw_times {
            if row_redraw > 0 {
                let row_delay = (row_redraw - end_time).max(min_delay);
                delay = Some(delay.map_or(row_delay, |d| d.min(row_delay)));
            }
        }
        self.next_redraw_delay = delay;
        log::debug!(
            "drawing cycle took {} ms, loaded {} files and {} pixmaps, next delay {:?}",
            end_time - self.drawing_start_time,
            self.cycle_loaded_files,
            self.cycle_loaded_pixmaps,
            delay
        );

        self.check_limits();
        for pixmap in self.take_retired_pixmaps() {
            surface.free_pixmap(pixmap);
        }
        delay
    }

    /// The delay computed by the last [`Self::finish_drawing`].
    pub fn next_redraw_delay(&self) -> Option<Milliseconds> {
        self.next_redraw_delay
    }

    /// Register a row's next animation redraw, keeping the earliest.
    fn update_next_redraw_time(&mut self, row: i32, next_redraw: Milliseconds) {
        if next_redraw == 0 || row < 0 {
            return;
        }
        let row = row as usize;
        if row >= self.next_redraw_times.len() {
            self.next_redraw_times.resize(row + 1, 0);
        }
        let old = self.next_redraw_times[row];
        if old == 0 || old > next_redraw {
            self.next_redraw_times[row] = next_redraw;
        }
    }

    fn draw_image_rect(&mut self, surface: &mut dyn Surface, rect: &ImageRect) {
        let drawing_start = self.drawing_start_time;
        let (placement_id, current_frame, next_redraw) = {
            let Some(img) = self.image_mut(rect.image_id) else {
                log::trace!("image {} is gone, skipping rect", rect.image_id);
                return;
            };
            let Some(placement_id) = img.resolve_placement(rect.placement_id) else {
                log::trace!(
                    "placement {}/{} is gone, skipping rect",
                    rect.image_id,
                    rect.placement_id
                );
                return;
            };
            // First touch of this image in this cycle advances the
            // animation; placements drawn later reuse the same frame.
            if img.last_redraw < drawing_start || img.current_frame == 0 {
                animation::advance(img, drawing_start);
                img.last_redraw = drawing_start;
            }
            (placement_id, img.current_frame, img.next_redraw)
        };

        if next_redraw != 0 {
            for row in rect.screen_y_row..rect.screen_y_row + (rect.end_row - rect.start_row) {
                self.update_next_redraw_time(row, next_redraw);
            }
        }

        let Some(pixmap) = self.build_pixmap(
            surface,
            rect.image_id,
            placement_id,
            current_frame,
            rect.cw,
            rect.ch,
        ) else {
            return;
        };

        let src_x = rect.start_col * i32::from(rect.cw);
        let src_y = rect.start_row * i32::from(rect.ch);
        let width = ((rect.end_col - rect.start_col) * i32::from(rect.cw)).max(0) as u32;
        let height = ((rect.end_row - rect.start_row) * i32::from(rect.ch)).max(0) as u32;

        if rect.reverse {
            // An inverted copy composited with SRC; the naive inversion
            // also inverts alpha, so OVER would produce garbage.
            let (pixmap_w, pixmap_h) = {
                let placement = self
                    .image(rect.image_id)
                    .and_then(|img| img.placement(placement_id));
                match placement {
                    Some(p) => (
                        u32::from(p.cols) * u32::from(p.scaled_cw),
                        u32::from(p.rows) * u32::from(p.scaled_ch),
                    ),
                    None => return,
                }
            };
            let inverted = surface.invert_copy(pixmap, pixmap_w, pixmap_h);
            surface.composite(
                inverted,
                src_x,
                src_y,
                rect.screen_x_pix,
                rect.screen_y_pix,
                width,
                height,
                CompositeOp::Src,
            );
            surface.free_pixmap(inverted);
        } else {
            surface.composite(
                pixmap,
                src_x,
                src_y,
                rect.screen_x_pix,
                rect.screen_y_pix,
                width,
                height,
                CompositeOp::Over,
            );
        }

        // Pixmaps retired by the in-build budget check can be freed now
        // that a surface is at hand.
        for retired in self.take_retired_pixmaps() {
            surface.free_pixmap(retired);
        }
    }
}
