//! The graphics context: image store, counters, and the disk cache.
//!
//! Everything the protocol core mutates lives in one [`GraphicsContext`]
//! passed to every entry point, so hosts (and tests) can run independent
//! instances. The four global counters (disk bytes, RAM bytes, image
//! count, placement count) are only ever adjusted by the helpers in this
//! module; every path that creates or destroys a cache file, decoded
//! bitmap, or pixmap goes through them.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use crate::config::GraphicsConfig;
use crate::decoder::{ImageDecoder, NoDecoder};
use crate::draw::{ImageRect, MAX_IMAGE_RECTS};
use crate::image::{FrameStatus, Image, ImagePlacement};
use crate::surface::PixmapId;
use crate::Milliseconds;

/// The process-wide graphics state, encapsulated.
pub struct GraphicsContext {
    pub(crate) config: GraphicsConfig,
    pub(crate) decoder: Box<dyn ImageDecoder>,
    epoch: Instant,
    pub(crate) images: HashMap<u32, Image>,
    /// Total placements across all images.
    pub(crate) placement_count: usize,
    /// Total size of all cache files on disk.
    pub(crate) disk_bytes: u64,
    /// Total size of decoded bitmaps and pixmaps.
    pub(crate) ram_bytes: u64,
    /// The most recently created image, targeted by id-less put commands.
    pub(crate) last_image_id: u32,
    /// The (image, frame) a direct upload is currently appending to.
    pub(crate) current_upload: Option<(u32, usize)>,
    /// Global index of the current command.
    pub(crate) global_command_counter: u64,
    cache_dir: Option<TempDir>,
    pub(crate) rng: SmallRng,
    /// Pixmaps unloaded while no surface was at hand; freed on the next
    /// draw cycle.
    pub(crate) retired_pixmaps: Vec<PixmapId>,

    // Draw-cycle state.
    pub(crate) current_cw: u16,
    pub(crate) current_ch: u16,
    pub(crate) drawing_start_time: Milliseconds,
    pub(crate) pending_rects: [Option<ImageRect>; MAX_IMAGE_RECTS],
    /// Next redraw time per screen row; 0 = none scheduled.
    pub(crate) next_redraw_times: Vec<Milliseconds>,
    pub(crate) next_redraw_delay: Option<Milliseconds>,
    pub(crate) cycle_loaded_files: u32,
    pub(crate) cycle_loaded_pixmaps: u32,
}

impl GraphicsContext {
    /// Create a context with the default (declining) container decoder.
    pub fn new(config: GraphicsConfig) -> Self {
        Self::with_decoder(config, Box::new(NoDecoder))
    }

    /// Create a context with a host-supplied container decoder.
    pub fn with_decoder(config: GraphicsConfig, decoder: Box<dyn ImageDecoder>) -> Self {
        Self {
            config,
            decoder,
            epoch: Instant::now(),
            images: HashMap::new(),
            placement_count: 0,
            disk_bytes: 0,
            ram_bytes: 0,
            last_image_id: 0,
            current_upload: None,
            global_command_counter: 0,
            cache_dir: None,
            rng: SmallRng::from_entropy(),
            retired_pixmaps: Vec::new(),
            current_cw: 0,
            current_ch: 0,
            drawing_start_time: 0,
            pending_rects: [None; MAX_IMAGE_RECTS],
            next_redraw_times: Vec::new(),
            next_redraw_delay: None,
            cycle_loaded_files: 0,
            cycle_loaded_pixmaps: 0,
        }
    }

    /// The configuration this context was built with.
    pub fn config(&self) -> &GraphicsConfig {
        &self.config
    }

    /// Milliseconds since this context was created (the time base for all
    /// atimes and animation scheduling).
    pub fn now_ms(&self) -> Milliseconds {
        self.epoch.elapsed().as_millis() as Milliseconds
    }

    /// Number of stored images.
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Number of placements across all images.
    pub fn placement_count(&self) -> usize {
        self.placement_count
    }

    /// Total size of the on-disk frame cache.
    pub fn disk_bytes(&self) -> u64 {
        self.disk_bytes
    }

    /// Total RAM held by decoded bitmaps and pixmaps.
    pub fn ram_bytes(&self) -> u64 {
        self.ram_bytes
    }

    /// The image with the given id.
    pub fn image(&self, image_id: u32) -> Option<&Image> {
        self.images.get(&image_id)
    }

    pub(crate) fn image_mut(&mut self, image_id: u32) -> Option<&mut Image> {
        self.images.get_mut(&image_id)
    }

    /// Iterate over all stored images.
    pub fn images(&self) -> impl Iterator<Item = &Image> {
        self.images.values()
    }

    /// The newest image with the given number, by creation order.
    pub fn find_image_by_number(&self, image_number: u32) -> Option<u32> {
        if image_number == 0 {
            return None;
        }
        self.images
            .values()
            .filter(|img| img.image_number == image_number)
            .max_by_key(|img| img.global_command_index)
            .map(|img| img.image_id)
    }

    /// Pixmap handles retired since the last drain; the host must free
    /// them on its surface. The draw loop does this automatically.
    pub fn take_retired_pixmaps(&mut self) -> Vec<PixmapId> {
        std::mem::take(&mut self.retired_pixmaps)
    }

    /// Advance an image's animation to `now`. The draw loop does this
    /// automatically on the first touch of each cycle; hosts (and tests)
    /// may also drive it directly.
    pub fn advance_animation(&mut self, image_id: u32, now: Milliseconds) {
        if let Some(img) = self.images.get_mut(&image_id) {
            crate::animation::advance(img, now);
        }
    }

    // === Cache directory ===

    /// Path of the cache file for a frame, if the cache directory exists.
    pub(crate) fn frame_path(&self, image_id: u32, frame_index: usize) -> Option<PathBuf> {
        self.cache_dir
            .as_ref()
            .map(|dir| dir.path().join(format!("img-{:03}-{:03}", image_id, frame_index)))
    }

    /// Make sure the cache directory exists, recreating it if it vanished.
    /// Returns its path, or `None` if creation failed.
    pub(crate) fn ensure_cache_dir(&mut self) -> Option<PathBuf> {
        if let Some(dir) = &self.cache_dir {
            if dir.path().is_dir() {
                return Some(dir.path().to_path_buf());
            }
            log::error!(
                "graphics cache directory {} vanished, creating a new one",
                dir.path().display()
            );
            self.cache_dir = None;
        }
        match tempfile::Builder::new().prefix(self.config.cache_dir_prefix.as_str()).tempdir() {
            Ok(dir) => {
                log::debug!("graphics cache directory: {}", dir.path().display());
                self.cache_dir = Some(dir);
                self.cache_dir.as_ref().map(|d| d.path().to_path_buf())
            }
            Err(e) => {
                log::error!("could not create the graphics cache directory: {}", e);
                None
            }
        }
    }

    // === Creation ===

    /// Create a new image with the given id, deleting any image that
    /// already uses it. Id 0 generates a random 32-bit id whose high byte
    /// and middle two bytes are non-zero (ids that fit narrower encodings
    /// are reserved for clients).
    pub(crate) fn new_image(&mut self, mut image_id: u32) -> u32 {
        if image_id == 0 {
            loop {
                image_id = self.rng.gen();
                if image_id & 0xFF00_0000 != 0
                    && image_id & 0x00FF_FF00 != 0
                    && !self.images.contains_key(&image_id)
                {
                    break;
                }
            }
            log::debug!("generated random image id {}", image_id);
        }
        self.delete_image(image_id);
        log::debug!("creating image {}", image_id);
        let now = self.now_ms();
        let image = Image::new(image_id, now, self.global_command_counter);
        self.images.insert(image_id, image);
        image_id
    }

    /// Create a new placement on an image, deleting any placement that
    /// already uses the id. Id 0 generates a random 24-bit id with
    /// non-zero middle bytes. Returns 0 if the image does not exist.
    pub(crate) fn new_placement(&mut self, image_id: u32, mut placement_id: u32) -> u32 {
        if !self.images.contains_key(&image_id) {
            return 0;
        }
        if placement_id == 0 {
            loop {
                placement_id = self.rng.gen::<u32>() & 0x00FF_FFFF;
                if placement_id & 0x00FF_FF00 != 0 {
                    let img = &self.images[&image_id];
                    if !img.placements.contains_key(&placement_id) {
                        break;
                    }
                }
            }
        }
        self.delete_placement(image_id, placement_id);
        log::debug!("creating placement {}/{}", image_id, placement_id);
        let now = self.now_ms();
        let img = self.images.get_mut(&image_id).expect("image checked above");
        img.placements.insert(placement_id, ImagePlacement::new(placement_id, now));
        if img.default_placement == 0 {
            img.default_placement = placement_id;
        }
        img.atime = now;
        self.placement_count += 1;
        placement_id
    }

    // === Touching ===

    pub(crate) fn touch_frame(&mut self, image_id: u32, frame_index: usize) {
        let now = self.now_ms();
        if let Some(img) = self.images.get_mut(&image_id) {
            img.atime = now;
            if let Some(frame) = img.frame_mut(frame_index) {
                frame.atime = now;
            }
        }
    }

    pub(crate) fn touch_placement(&mut self, image_id: u32, placement_id: u32) {
        let now = self.now_ms();
        if let Some(img) = self.images.get_mut(&image_id) {
            img.atime = now;
            if let Some(placement) = img.placement_mut(placement_id) {
                placement.atime = now;
            }
        }
    }

    // === Unloading (RAM) ===

    /// Drop a frame's decoded bitmap; the disk file stays, so it can be
    /// reloaded later.
    pub(crate) fn unload_frame(&mut self, image_id: u32, frame_index: usize) {
        let Some(img) = self.images.get_mut(&image_id) else { return };
        let frame_ram = img.frame_ram_size();
        let Some(frame) = img.frame_mut(frame_index) else { return };
        if frame.decoded.take().is_none() {
            return;
        }
        if frame.status == FrameStatus::RamLoadingSuccess {
            frame.status = FrameStatus::UploadSuccess;
        }
        self.ram_bytes = self.ram_bytes.saturating_sub(frame_ram);
        log::debug!(
            "unloaded image {} frame {}, ram now {} KiB (-{} KiB)",
            image_id,
            frame_index,
            self.ram_bytes / 1024,
            frame_ram / 1024
        );
    }

    /// Free all of a placement's pixmaps and reset its scaled cell size.
    pub(crate) fn unload_placement(&mut self, image_id: u32, placement_id: u32) {
        let Some(img) = self.images.get_mut(&image_id) else { return };
        let Some(placement) = img.placement_mut(placement_id) else { return };
        let ram = placement.current_ram_size();
        let taken = placement.take_all_pixmaps();
        if taken.is_empty() {
            return;
        }
        self.retired_pixmaps.extend(taken);
        self.ram_bytes = self.ram_bytes.saturating_sub(ram);
        log::debug!(
            "unloaded placement {}/{}, ram now {} KiB (-{} KiB)",
            image_id,
            placement_id,
            self.ram_bytes / 1024,
            ram / 1024
        );
    }

    /// Free a single pixmap of a placement.
    pub(crate) fn unload_pixmap(&mut self, image_id: u32, placement_id: u32, frame_index: usize) {
        let Some(img) = self.images.get_mut(&image_id) else { return };
        let Some(placement) = img.placement_mut(placement_id) else { return };
        let Some(pixmap) = placement.set_pixmap(frame_index, None) else { return };
        let ram = placement.single_frame_ram_size();
        self.retired_pixmaps.push(pixmap);
        self.ram_bytes = self.ram_bytes.saturating_sub(ram);
    }

    /// Unload every decoded bitmap and pixmap (host request). Protected
    /// frames are skipped.
    pub fn unload_all_to_reduce_ram(&mut self) {
        let image_ids: Vec<u32> = self.images.keys().copied().collect();
        for image_id in image_ids {
            let placement_ids: Vec<u32> = self.images[&image_id]
                .placements
                .values()
                .filter(|p| p.protected_frame == 0)
                .map(|p| p.placement_id)
                .collect();
            for placement_id in placement_ids {
                self.unload_placement(image_id, placement_id);
            }
            let frame_count = self.images[&image_id].last_frame_index();
            for index in 1..=frame_count {
                self.unload_frame(image_id, index);
            }
        }
    }

    // === Disk files ===

    /// Delete the cache file of a frame. The decoded bitmap (if any) stays
    /// resident; placements are not touched.
    pub(crate) fn delete_image_file(&mut self, image_id: u32, frame_index: usize) {
        let path = self.frame_path(image_id, frame_index);
        let Some(img) = self.images.get_mut(&image_id) else { return };
        let Some(frame) = img.frame_mut(frame_index) else { return };
        // It may still be uploading; drop the handle first.
        frame.open_file = None;
        if frame.disk_size == 0 {
            return;
        }
        let disk_size = frame.disk_size;
        frame.disk_size = 0;
        img.total_disk_size = img.total_disk_size.saturating_sub(disk_size);
        self.disk_bytes = self.disk_bytes.saturating_sub(disk_size);
        if let Some(path) = path {
            let _ = fs::remove_file(path);
        }
        log::debug!(
            "deleted cache file of image {} frame {}, disk now {} KiB (-{} KiB)",
            image_id,
            frame_index,
            self.disk_bytes / 1024,
            disk_size / 1024
        );
    }

    // === Deletion ===

    /// Delete a placement: free pixmaps, fix counters, remove the entry.
    pub(crate) fn delete_placement(&mut self, image_id: u32, placement_id: u32) {
        let Some(img) = self.images.get_mut(&image_id) else { return };
        let Some(mut placement) = img.placements.remove(&placement_id) else { return };
        log::debug!("deleting placement {}/{}", image_id, placement_id);
        let ram = placement.current_ram_size();
        self.retired_pixmaps.extend(placement.take_all_pixmaps());
        self.ram_bytes = self.ram_bytes.saturating_sub(ram);
        self.placement_count -= 1;
    }

    /// Delete all placements of an image.
    pub(crate) fn delete_all_placements(&mut self, image_id: u32) {
        let ids: Vec<u32> = match self.images.get(&image_id) {
            Some(img) => img.placements.keys().copied().collect(),
            None => return,
        };
        for placement_id in ids {
            self.delete_placement(image_id, placement_id);
        }
    }

    /// Delete an image: files, bitmaps, placements, and the map entry.
    pub(crate) fn delete_image(&mut self, image_id: u32) {
        // Remove the owning entry first so nothing can observe the image
        // while its resources are torn down.
        let Some(mut img) = self.images.remove(&image_id) else { return };
        log::debug!("deleting image {}", image_id);
        let frame_ram = img.frame_ram_size();
        for frame in img.frames_mut() {
            frame.open_file = None;
            if frame.disk_size > 0 {
                if let Some(path) = self
                    .cache_dir
                    .as_ref()
                    .map(|dir| dir.path().join(format!("img-{:03}-{:03}", image_id, frame.index)))
                {
                    let _ = fs::remove_file(path);
                }
                self.disk_bytes = self.disk_bytes.saturating_sub(frame.disk_size);
                frame.disk_size = 0;
            }
            if frame.decoded.take().is_some() {
                self.ram_bytes = self.ram_bytes.saturating_sub(frame_ram);
            }
        }
        for (_, mut placement) in img.placements.drain() {
            let ram = placement.current_ram_size();
            self.retired_pixmaps.extend(placement.take_all_pixmaps());
            self.ram_bytes = self.ram_bytes.saturating_sub(ram);
            self.placement_count -= 1;
        }
        if self.current_upload.map(|(id, _)| id) == Some(image_id) {
            self.current_upload = None;
        }
    }

    /// Delete every image.
    pub fn delete_all_images(&mut self) {
        let ids: Vec<u32> = self.images.keys().copied().collect();
        for image_id in ids {
            self.delete_image(image_id);
        }
    }

    // === Introspection ===

    /// Dump images, frames, and placements in a human-readable form, and
    /// cross-check the global counters against recomputed sums.
    pub fn dump_state(&self, out: &mut dyn Write) -> std::io::Result<()> {
        writeln!(out, "======= Graphics state dump =======")?;
        writeln!(out, "Image count: {}", self.images.len())?;
        writeln!(out, "Placement count: {}", self.placement_count)?;
        writeln!(out, "Estimated RAM usage: {} KiB", self.ram_bytes / 1024)?;
        writeln!(out, "Estimated disk usage: {} KiB", self.disk_bytes / 1024)?;

        let mut ram_computed = 0u64;
        let mut disk_computed = 0u64;
        let mut ids: Vec<u32> = self.images.keys().copied().collect();
        ids.sort_unstable();
        for image_id in ids {
            let img = &self.images[&image_id];
            writeln!(out, "----------------")?;
            writeln!(out, "Image {}", image_id)?;
            writeln!(out, "    number: {}", img.image_number)?;
            writeln!(out, "    global command index: {}", img.global_command_index)?;
            writeln!(out, "    pix size: {}x{}", img.pix_width, img.pix_height)?;
            writeln!(out, "    total disk size: {} KiB", img.total_disk_size / 1024)?;
            writeln!(out, "    total duration: {}", img.total_duration)?;
            writeln!(out, "    frames: {}", img.last_frame_index())?;
            writeln!(out, "    current frame: {}", img.current_frame)?;
            writeln!(out, "    animation state: {:?}", img.animation_state)?;
            writeln!(out, "    default placement: {}", img.default_placement)?;

            let mut image_disk = 0u64;
            let mut image_duration = 0i64;
            for frame in img.frames() {
                writeln!(out, "    Frame {}", frame.index)?;
                writeln!(out, "        status: {:?}", frame.status)?;
                if let Some(failure) = frame.uploading_failure {
                    writeln!(out, "        uploading failure: {:?}", failure)?;
                }
                writeln!(out, "        gap: {}", frame.gap)?;
                writeln!(
                    out,
                    "        data pix size: {}x{}",
                    frame.data_pix_width, frame.data_pix_height
                )?;
                writeln!(out, "        disk size: {} KiB", frame.disk_size / 1024)?;
                if frame.decoded.is_some() {
                    writeln!(out, "        loaded into ram: {} KiB", img.frame_ram_size() / 1024)?;
                    ram_computed += img.frame_ram_size();
                } else {
                    writeln!(out, "        not loaded into ram")?;
                }
                image_disk += frame.disk_size;
                image_duration += i64::from(frame.gap.max(0));
            }
            disk_computed += image_disk;
            if image_disk != img.total_disk_size {
                writeln!(
                    out,
                    "    ERROR: total_disk_size is {}, but computed value is {}",
                    img.total_disk_size, image_disk
                )?;
            }
            if image_duration != img.total_duration {
                writeln!(
                    out,
                    "    ERROR: total_duration is {}, but computed value is {}",
                    img.total_duration, image_duration
                )?;
            }
            for placement in img.placements() {
                writeln!(out, "    Placement {}", placement.placement_id)?;
                writeln!(out, "        scale mode: {:?}", placement.scale_mode)?;
                writeln!(out, "        size: {} cols x {} rows", placement.cols, placement.rows)?;
                writeln!(
                    out,
                    "        cell size: {}x{}",
                    placement.scaled_cw, placement.scaled_ch
                )?;
                writeln!(out, "        pixmaps: {}", placement.pixmap_count())?;
                writeln!(out, "        ram size: {} KiB", placement.current_ram_size() / 1024)?;
                ram_computed += placement.current_ram_size();
            }
        }
        if ram_computed != self.ram_bytes {
            writeln!(
                out,
                "ERROR: ram_bytes is {}, but computed value is {}",
                self.ram_bytes, ram_computed
            )?;
        }
        if disk_computed != self.disk_bytes {
            writeln!(
                out,
                "ERROR: disk_bytes is {}, but computed value is {}",
                self.disk_bytes, disk_computed
            )?;
        }
        writeln!(out, "===================================")?;
        Ok(())
    }

    /// True when the recomputed sums match the incremental counters
    /// (invariants I1-I4). Tests call this after every mutation batch.
    pub fn counters_consistent(&self) -> bool {
        let mut ram = 0u64;
        let mut disk = 0u64;
        let mut placements = 0usize;
        for img in self.images.values() {
            let mut image_disk = 0u64;
            let mut duration = 0i64;
            for frame in img.frames() {
                image_disk += frame.disk_size;
                duration += i64::from(frame.gap.max(0));
                if frame.decoded.is_some() {
                    ram += img.frame_ram_size();
                }
            }
            if image_disk != img.total_disk_size || duration != img.total_duration {
                return false;
            }
            disk += image_disk;
            for placement in img.placements.values() {
                ram += placement.current_ram_size();
                placements += 1;
            }
        }
        ram == self.ram_bytes && disk == self.disk_bytes && placements == self.placement_count
    }
}
