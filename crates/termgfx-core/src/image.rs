//! Image, frame, and placement records.
//!
//! An [`Image`] is created by a transmit command and owns its frames and
//! placements. An [`ImageFrame`] is one uploaded frame: a cache file on
//! disk, plus (once loaded) the fully composed ARGB32 bitmap at the image's
//! canonical size. An [`ImagePlacement`] is a declaration that the image
//! occupies some cell extent, and owns one scaled pixmap per frame.
//!
//! Frames are indexed from 1 in insertion order. The owning collections are
//! the single source of truth; records carry no back-pointers.

use std::collections::HashMap;
use std::fs::File;

use smallvec::SmallVec;

use crate::surface::PixmapId;
use crate::Milliseconds;

/// How a placement maps image pixels onto its cell box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleMode {
    /// Stretch or shrink to fill the box, ignoring aspect ratio.
    Fill,
    /// Preserve aspect ratio; letter/pillar-box so the whole image fits.
    Contain,
    /// No scaling; the image may be cropped if the box is too small.
    None,
    /// No scaling unless the box is too small, then behave like `Contain`.
    NoneOrContain,
}

/// Animation playback state of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnimationState {
    /// Never set; treated like `Stopped`.
    #[default]
    Unset,
    /// Display the current frame, do not advance.
    Stopped,
    /// Run to the last uploaded frame, then wait for more.
    Loading,
    /// Run in a loop.
    Looping,
}

/// Upload/decode lifecycle of a frame.
///
/// The ordering is meaningful: `>= UploadSuccess` means the cache file is
/// complete, `== RamLoadingSuccess` means the composed bitmap is resident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum FrameStatus {
    /// Freshly created, nothing received.
    #[default]
    Uninitialized,
    /// Direct upload in progress.
    Uploading,
    /// Upload failed; see the frame's failure reason.
    UploadError,
    /// The cache file is complete.
    UploadSuccess,
    /// Decoding or composing failed (retryable while the file exists).
    RamLoadingError,
    /// Decode in progress; used as a re-entry guard for background frames.
    RamLoadingInProgress,
    /// The composed bitmap is resident.
    RamLoadingSuccess,
}

/// Why an upload failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadFailure {
    /// The upload exceeded the per-file size limit.
    OverSizeLimit,
    /// The cache file could not be created.
    CannotOpenCacheFile,
    /// The uploaded size does not match the announced `S=` size.
    UnexpectedSize,
    /// A file transmission source could not be read or copied.
    CannotCopyFile,
}

/// A single frame of an image.
#[derive(Debug, Default)]
pub struct ImageFrame {
    /// 1-based index within the owning image. Zero if uninitialized.
    pub index: usize,
    /// Last time the frame was displayed or otherwise touched.
    pub atime: Milliseconds,
    /// Background color in 0xRRGGBBAA, used when there is no background frame.
    pub background_color: u32,
    /// 1-based index of the background frame; 0 to use the color.
    pub background_frame_index: i32,
    /// Frame duration in ms. 0 = default, negative = gapless (skipped).
    pub gap: i32,
    /// Expected cache file size (`S=`), used to verify uploads. 0 = unchecked.
    pub expected_size: u32,
    /// Format specification (`f=`): 0, 24, 32 or 100.
    pub format: i32,
    /// Compression (`o=`): 0 or `z`.
    pub compression: u8,
    /// Pixel size of the on-disk (non-composed) frame data.
    pub data_pix_width: i32,
    /// See [`Self::data_pix_width`].
    pub data_pix_height: i32,
    /// Offset of this frame's data on the canonical canvas.
    pub offset_x: i32,
    /// See [`Self::offset_x`].
    pub offset_y: i32,
    /// Upload/decode lifecycle.
    pub status: FrameStatus,
    /// Set when `status` is an upload error.
    pub uploading_failure: Option<UploadFailure>,
    /// Quietness captured from the creation command, for chunked uploads.
    pub quiet: u8,
    /// Blend the data onto the background (true) or replace pixels (false).
    pub blend: bool,
    /// Open cache file; present only while status is `Uploading`.
    pub open_file: Option<File>,
    /// Size of the cache file on disk. 0 once the file is deleted.
    pub disk_size: u64,
    /// The composed ARGB32 bitmap at canonical image size.
    /// Present iff status is `RamLoadingSuccess`.
    pub decoded: Option<Vec<u32>>,
}

/// A stored image with its frames and placements.
#[derive(Debug)]
pub struct Image {
    /// The client id (`i=`). Non-zero.
    pub image_id: u32,
    /// The id supplied in a query command; responses use it, and the image
    /// is discarded after reporting. Zero for ordinary images.
    pub query_id: u32,
    /// The client number (`I=`), or 0.
    pub image_number: u32,
    /// Last time the image or any descendant was touched.
    pub atime: Milliseconds,
    /// Sum of `max(0, gap)` over all frames, maintained incrementally.
    pub total_duration: i64,
    /// Sum of frame disk sizes, maintained incrementally.
    pub total_disk_size: u64,
    /// Global index of the creation command; newest-wins tie-break for
    /// image numbers and eviction ordering.
    pub global_command_index: u64,
    /// 1-based index of the displayed frame. 0 = uninitialized.
    pub current_frame: usize,
    /// Animation playback state.
    pub animation_state: AnimationState,
    /// Time assumed to be the start of the current frame.
    pub current_frame_time: Milliseconds,
    /// Time of the last redraw; detects the first draw of a cycle.
    pub last_redraw: Milliseconds,
    /// Time of the next scheduled redraw. 0 = none.
    pub next_redraw: Milliseconds,
    /// Canonical pixel size, established by the first decoded frame.
    pub pix_width: u32,
    /// See [`Self::pix_width`].
    pub pix_height: u32,
    /// Frames in insertion order; `frames[0]` is frame 1.
    frames: SmallVec<[ImageFrame; 1]>,
    /// Placements by id.
    pub(crate) placements: HashMap<u32, ImagePlacement>,
    /// The default placement id, or 0.
    pub default_placement: u32,
    /// Placement id from the transmit-and-display command, mentioned in
    /// the upload response.
    pub initial_placement_id: u32,
}

impl Image {
    /// Create an empty image record.
    pub(crate) fn new(image_id: u32, now: Milliseconds, command_index: u64) -> Self {
        Self {
            image_id,
            query_id: 0,
            image_number: 0,
            atime: now,
            total_duration: 0,
            total_disk_size: 0,
            global_command_index: command_index,
            current_frame: 0,
            animation_state: AnimationState::Unset,
            current_frame_time: 0,
            last_redraw: 0,
            next_redraw: 0,
            pix_width: 0,
            pix_height: 0,
            frames: SmallVec::new(),
            placements: HashMap::new(),
            default_placement: 0,
            initial_placement_id: 0,
        }
    }

    /// 1-based index of the last frame. Note that the last frame may still
    /// be uploading; see [`Self::last_uploaded_frame_index`].
    pub fn last_frame_index(&self) -> usize {
        self.frames.len()
    }

    /// 1-based index of the last fully uploaded frame (the second-to-last
    /// frame if the trailing one is still incomplete).
    pub fn last_uploaded_frame_index(&self) -> usize {
        let last = self.frames.len();
        if last > 1 && self.frames[last - 1].status < FrameStatus::UploadSuccess {
            last - 1
        } else {
            last
        }
    }

    /// The frame with the given 1-based index.
    pub fn frame(&self, index: usize) -> Option<&ImageFrame> {
        if index == 0 {
            return None;
        }
        self.frames.get(index - 1)
    }

    /// Mutable access to the frame with the given 1-based index.
    pub fn frame_mut(&mut self, index: usize) -> Option<&mut ImageFrame> {
        if index == 0 {
            return None;
        }
        self.frames.get_mut(index - 1)
    }

    /// Append a new frame and return its 1-based index.
    pub(crate) fn append_frame(&mut self, now: Milliseconds) -> usize {
        let index = self.frames.len() + 1;
        self.frames.push(ImageFrame {
            index,
            atime: now,
            blend: true,
            ..ImageFrame::default()
        });
        self.atime = now;
        index
    }

    /// Iterate over all frames in index order.
    pub fn frames(&self) -> impl Iterator<Item = &ImageFrame> {
        self.frames.iter()
    }

    /// Mutable iteration over all frames in index order.
    pub(crate) fn frames_mut(&mut self) -> impl Iterator<Item = &mut ImageFrame> {
        self.frames.iter_mut()
    }

    /// RAM used by one decoded bitmap of this image (canonical size, 4
    /// bytes per pixel).
    pub fn frame_ram_size(&self) -> u64 {
        u64::from(self.pix_width) * u64::from(self.pix_height) * 4
    }

    /// The placement with the given id.
    pub fn placement(&self, placement_id: u32) -> Option<&ImagePlacement> {
        self.placements.get(&placement_id)
    }

    /// Mutable access to the placement with the given id.
    pub(crate) fn placement_mut(&mut self, placement_id: u32) -> Option<&mut ImagePlacement> {
        self.placements.get_mut(&placement_id)
    }

    /// Resolve a placement id, falling back to the default placement when
    /// `placement_id` is 0 (electing the first placement as the default if
    /// none is set).
    pub(crate) fn resolve_placement(&mut self, placement_id: u32) -> Option<u32> {
        if placement_id != 0 {
            return self.placements.contains_key(&placement_id).then_some(placement_id);
        }
        if self.default_placement != 0 && self.placements.contains_key(&self.default_placement) {
            return Some(self.default_placement);
        }
        let first = self.placements.keys().next().copied()?;
        self.default_placement = first;
        Some(first)
    }

    /// Iterate over all placements.
    pub fn placements(&self) -> impl Iterator<Item = &ImagePlacement> {
        self.placements.values()
    }

    /// Number of placements.
    pub fn placement_count(&self) -> usize {
        self.placements.len()
    }
}

/// A placement of an image on the grid.
#[derive(Debug)]
pub struct ImagePlacement {
    /// The placement id (`p=`). Non-zero.
    pub placement_id: u32,
    /// Last time the placement was displayed or otherwise touched.
    pub atime: Milliseconds,
    /// 1-based index of a pixmap protected from eviction while it is being
    /// built. 0 = none.
    pub protected_frame: usize,
    /// Used only for Unicode placeholders; skipped by direct composition.
    pub virtual_placement: bool,
    /// Scaling mode, fixed at creation.
    pub scale_mode: ScaleMode,
    /// Display size in cells. 0 until specified or inferred.
    pub rows: u16,
    /// See [`Self::rows`].
    pub cols: u16,
    /// Source rectangle in image pixels; zero width/height = full image.
    pub src_pix_x: i32,
    /// See [`Self::src_pix_x`].
    pub src_pix_y: i32,
    /// See [`Self::src_pix_x`].
    pub src_pix_width: i32,
    /// See [`Self::src_pix_x`].
    pub src_pix_height: i32,
    /// Do not move the cursor when displaying (non-virtual only).
    pub do_not_move_cursor: bool,
    /// Cell size the pixmaps were scaled for; a mismatch with the current
    /// cell size invalidates the whole set.
    pub scaled_cw: u16,
    /// See [`Self::scaled_cw`].
    pub scaled_ch: u16,
    /// Per-frame pixmaps; `pixmaps[0]` belongs to frame 1.
    pixmaps: SmallVec<[Option<PixmapId>; 2]>,
}

impl ImagePlacement {
    pub(crate) fn new(placement_id: u32, now: Milliseconds) -> Self {
        Self {
            placement_id,
            atime: now,
            protected_frame: 0,
            virtual_placement: false,
            scale_mode: ScaleMode::None,
            rows: 0,
            cols: 0,
            src_pix_x: 0,
            src_pix_y: 0,
            src_pix_width: 0,
            src_pix_height: 0,
            do_not_move_cursor: false,
            scaled_cw: 0,
            scaled_ch: 0,
            pixmaps: SmallVec::new(),
        }
    }

    /// The pixmap for the frame with the given 1-based index.
    pub fn pixmap(&self, frame_index: usize) -> Option<PixmapId> {
        if frame_index == 0 {
            return None;
        }
        self.pixmaps.get(frame_index - 1).copied().flatten()
    }

    /// Store (or clear) the pixmap for the given 1-based frame index,
    /// returning the previous handle.
    pub(crate) fn set_pixmap(
        &mut self,
        frame_index: usize,
        pixmap: Option<PixmapId>,
    ) -> Option<PixmapId> {
        debug_assert!(frame_index > 0);
        if self.pixmaps.len() < frame_index {
            self.pixmaps.resize(frame_index, None);
        }
        std::mem::replace(&mut self.pixmaps[frame_index - 1], pixmap)
    }

    /// Remove and return every pixmap handle, resetting the scaled cell size.
    pub(crate) fn take_all_pixmaps(&mut self) -> Vec<PixmapId> {
        let taken = self.pixmaps.iter_mut().filter_map(|slot| slot.take()).collect();
        self.pixmaps.clear();
        self.scaled_cw = 0;
        self.scaled_ch = 0;
        taken
    }

    /// Number of pixmaps currently held.
    pub fn pixmap_count(&self) -> usize {
        self.pixmaps.iter().filter(|slot| slot.is_some()).count()
    }

    /// RAM used by a single pixmap of this placement.
    pub fn single_frame_ram_size(&self) -> u64 {
        u64::from(self.rows)
            * u64::from(self.cols)
            * u64::from(self.scaled_ch)
            * u64::from(self.scaled_cw)
            * 4
    }

    /// RAM used by all pixmaps of this placement.
    pub fn current_ram_size(&self) -> u64 {
        self.single_frame_ram_size() * self.pixmap_count() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_indexing_is_one_based() {
        let mut img = Image::new(1, 0, 0);
        assert_eq!(img.last_frame_index(), 0);
        assert!(img.frame(0).is_none());
        assert!(img.frame(1).is_none());

        let idx = img.append_frame(10);
        assert_eq!(idx, 1);
        assert_eq!(img.last_frame_index(), 1);
        assert_eq!(img.frame(1).unwrap().index, 1);
        assert!(img.frame(2).is_none());
    }

    #[test]
    fn last_uploaded_excludes_trailing_incomplete() {
        let mut img = Image::new(1, 0, 0);
        img.append_frame(0);
        img.frame_mut(1).unwrap().status = FrameStatus::RamLoadingSuccess;
        img.append_frame(0);
        img.frame_mut(2).unwrap().status = FrameStatus::Uploading;
        assert_eq!(img.last_frame_index(), 2);
        assert_eq!(img.last_uploaded_frame_index(), 1);

        img.frame_mut(2).unwrap().status = FrameStatus::UploadSuccess;
        assert_eq!(img.last_uploaded_frame_index(), 2);
    }

    #[test]
    fn single_incomplete_first_frame_still_counts() {
        // A lone first frame is reported even while uploading, matching the
        // "trailing frame" rule applying only beyond the first.
        let mut img = Image::new(1, 0, 0);
        img.append_frame(0);
        img.frame_mut(1).unwrap().status = FrameStatus::Uploading;
        assert_eq!(img.last_uploaded_frame_index(), 1);
    }

    #[test]
    fn pixmap_slots_grow_sparsely() {
        let mut placement = ImagePlacement::new(7, 0);
        assert!(placement.pixmap(1).is_none());
        placement.set_pixmap(3, Some(PixmapId(11)));
        assert!(placement.pixmap(1).is_none());
        assert!(placement.pixmap(2).is_none());
        assert_eq!(placement.pixmap(3), Some(PixmapId(11)));
        assert_eq!(placement.pixmap_count(), 1);

        let taken = placement.take_all_pixmaps();
        assert_eq!(taken, vec![PixmapId(11)]);
        assert_eq!(placement.pixmap_count(), 0);
        assert_eq!(placement.scaled_cw, 0);
    }

    #[test]
    fn placement_ram_accounting() {
        let mut placement = ImagePlacement::new(1, 0);
        placement.rows = 2;
        placement.cols = 3;
        placement.scaled_cw = 10;
        placement.scaled_ch = 20;
        assert_eq!(placement.single_frame_ram_size(), 2 * 3 * 10 * 20 * 4);
        placement.set_pixmap(1, Some(PixmapId(1)));
        placement.set_pixmap(2, Some(PixmapId(2)));
        assert_eq!(placement.current_ram_size(), 2 * placement.single_frame_ram_size());
    }

    #[test]
    fn resolve_placement_elects_default() {
        let mut img = Image::new(1, 0, 0);
        img.placements.insert(9, ImagePlacement::new(9, 0));
        assert_eq!(img.resolve_placement(0), Some(9));
        assert_eq!(img.default_placement, 9);
        assert_eq!(img.resolve_placement(9), Some(9));
        assert_eq!(img.resolve_placement(4), None);
    }

    #[test]
    fn status_ordering_matches_lifecycle() {
        assert!(FrameStatus::Uploading < FrameStatus::UploadSuccess);
        assert!(FrameStatus::UploadError < FrameStatus::UploadSuccess);
        assert!(FrameStatus::RamLoadingError > FrameStatus::UploadSuccess);
        assert!(FrameStatus::RamLoadingSuccess > FrameStatus::RamLoadingInProgress);
    }
}
