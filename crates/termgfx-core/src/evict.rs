//! Budget enforcement.
//!
//! Four independent budgets: image count, placement count, disk bytes, and
//! RAM bytes. Count and disk pressure evict whole objects oldest-first
//! (access time, then creation order); RAM pressure scores every
//! unloadable object (a decoded bitmap or a single placement pixmap) and
//! unloads from the lowest score up. Objects touched within the recency
//! window of an active animation score above `now`, so cold objects always
//! go first.
//!
//! The check runs after successful uploads, after pixmap builds, and at
//! the end of every draw cycle.

use rand::Rng;

use crate::context::GraphicsContext;
use crate::Milliseconds;

/// One RAM object that can be unloaded independently.
struct Unloadable {
    score: i64,
    key: UnloadKey,
}

enum UnloadKey {
    /// A frame's decoded bitmap.
    Frame { image_id: u32, frame_index: usize },
    /// A single pixmap of a placement.
    Pixmap { image_id: u32, placement_id: u32, frame_index: usize },
}

impl GraphicsContext {
    /// Enforce all four budgets, unloading or deleting the oldest objects
    /// until each budget is satisfied again.
    pub(crate) fn check_limits(&mut self) {
        let now = self.now_ms();
        let mut changed = false;

        // Too many images: delete the oldest outright.
        let max_images = self.config.max_images as u64;
        if self.images.len() as u64 > self.config.with_tolerance(max_images) {
            log::debug!("too many images: {}", self.images.len());
            changed = true;
            let mut images: Vec<(Milliseconds, u64, u32)> = self
                .images
                .values()
                .map(|img| (img.atime, img.global_command_index, img.image_id))
                .collect();
            images.sort_unstable();
            let to_delete = images.len().saturating_sub(self.config.max_images);
            for &(_, _, image_id) in images.iter().take(to_delete) {
                self.delete_image(image_id);
            }
        }

        // Too many placements: delete the oldest, but never one whose
        // pixmap is being protected right now.
        let max_placements = self.config.max_placements as u64;
        if self.placement_count as u64 > self.config.with_tolerance(max_placements) {
            log::debug!("too many placements: {}", self.placement_count);
            changed = true;
            let mut placements: Vec<(Milliseconds, u64, u32, u32, bool)> = self
                .images
                .values()
                .flat_map(|img| {
                    img.placements().map(move |p| {
                        (
                            p.atime,
                            img.global_command_index,
                            img.image_id,
                            p.placement_id,
                            p.protected_frame != 0,
                        )
                    })
                })
                .collect();
            placements.sort_unstable_by_key(|&(atime, index, ..)| (atime, index));
            let to_delete = placements.len().saturating_sub(self.config.max_placements);
            for &(_, _, image_id, placement_id, protected) in placements.iter().take(to_delete) {
                if protected {
                    break;
                }
                self.delete_placement(image_id, placement_id);
            }
        }

        // Disk cache too big: delete the oldest frame files (frames can be
        // re-uploaded; their bitmaps stay resident while they last).
        if self.disk_bytes > self.config.with_tolerance(self.config.total_disk_budget) {
            log::debug!("disk cache too big: {} KiB", self.disk_bytes / 1024);
            changed = true;
            let mut frames: Vec<(Milliseconds, u64, u32, usize)> = self
                .images
                .values()
                .flat_map(|img| {
                    img.frames()
                        .filter(|f| f.disk_size > 0)
                        .map(move |f| (f.atime, img.global_command_index, img.image_id, f.index))
                })
                .collect();
            frames.sort_unstable();
            for &(_, _, image_id, frame_index) in &frames {
                if self.disk_bytes <= self.config.total_disk_budget {
                    break;
                }
                self.delete_image_file(image_id, frame_index);
            }
        }

        // RAM too big: unload scored objects from the coldest up.
        if self.ram_bytes > self.config.with_tolerance(self.config.total_ram_budget) {
            log::debug!("ram too big: {} KiB", self.ram_bytes / 1024);
            changed = true;
            let objects = self.unloadable_objects_by_score(now);
            for object in objects {
                if self.ram_bytes <= self.config.total_ram_budget {
                    break;
                }
                match object.key {
                    UnloadKey::Frame { image_id, frame_index } => {
                        self.unload_frame(image_id, frame_index);
                    }
                    UnloadKey::Pixmap { image_id, placement_id, frame_index } => {
                        let protected = self
                            .images
                            .get(&image_id)
                            .and_then(|img| img.placement(placement_id))
                            .is_some_and(|p| p.protected_frame == frame_index);
                        if !protected {
                            self.unload_pixmap(image_id, placement_id, frame_index);
                        }
                    }
                }
            }
        }

        if changed {
            log::debug!(
                "after cleaning: ram {} KiB, disk {} KiB, {} images, {} placements",
                self.ram_bytes / 1024,
                self.disk_bytes / 1024,
                self.images.len(),
                self.placement_count
            );
        }
    }

    /// All unloadable RAM objects, sorted by ascending score.
    fn unloadable_objects_by_score(&mut self, now: Milliseconds) -> Vec<Unloadable> {
        let mut objects = Vec::new();
        for img in self.images.values() {
            // Objects within the recency window belong to an animation the
            // user is probably still watching.
            let recency = img.total_duration * 2 + 1000;
            let num_frames = img.last_frame_index() as i64;
            for frame in img.frames() {
                if frame.decoded.is_none() {
                    continue;
                }
                let mut score = frame.atime;
                if frame.atime >= now - recency {
                    // Active animation frame. Randomize the order: which
                    // frame is cheapest to reload depends on background
                    // chains we do not model here.
                    score = now + 1000 + self.rng.gen_range(0..1000);
                }
                objects.push(Unloadable {
                    score,
                    key: UnloadKey::Frame { image_id: img.image_id, frame_index: frame.index },
                });

                for placement in img.placements() {
                    if placement.pixmap(frame.index).is_none() {
                        continue;
                    }
                    let atime = placement.atime.min(frame.atime);
                    let mut score = atime;
                    if atime >= now - recency {
                        // Prefer keeping pixmaps close to the current
                        // frame; they are needed soonest.
                        let mut dist = frame.index as i64 - img.current_frame as i64;
                        if dist < 0 {
                            dist += num_frames;
                        }
                        score = now + 1000 + (num_frames - dist) * 1000 / num_frames.max(1);
                        // Shift by the bitmap-vs-pixmap size ratio so the
                        // dominating representation is unloaded first.
                        let bitmap_size = img.frame_ram_size() as f64;
                        let pixmap_size = placement.single_frame_ram_size() as f64;
                        if bitmap_size + pixmap_size > 0.0 {
                            score += (2000.0 * (bitmap_size / (bitmap_size + pixmap_size) - 0.5))
                                as i64;
                        }
                    }
                    objects.push(Unloadable {
                        score,
                        key: UnloadKey::Pixmap {
                            image_id: img.image_id,
                            placement_id: placement.placement_id,
                            frame_index: frame.index,
                        },
                    });
                }
            }
        }
        objects.sort_by_key(|object| object.score);
        objects
    }
}

#[cfg(test)]
mod tests {
    use crate::config::GraphicsConfig;
    use crate::context::GraphicsContext;
    use crate::image::FrameStatus;

    /// A context with an image whose single frame has a fake decoded
    /// bitmap of the given canonical size.
    fn loaded_image(ctx: &mut GraphicsContext, image_id: u32, w: u32, h: u32) {
        ctx.new_image(image_id);
        let img = ctx.image_mut(image_id).unwrap();
        img.pix_width = w;
        img.pix_height = h;
        let index = img.append_frame(0);
        let frame = img.frame_mut(index).unwrap();
        frame.status = FrameStatus::RamLoadingSuccess;
        frame.decoded = Some(vec![0u32; (w * h) as usize]);
        ctx.ram_bytes += u64::from(w) * u64::from(h) * 4;
    }

    #[test]
    fn image_count_budget_deletes_oldest() {
        let config = GraphicsConfig::new().with_max_images(2);
        let mut ctx = GraphicsContext::new(config);
        ctx.new_image(1);
        ctx.new_image(2);
        ctx.new_image(3);
        ctx.new_image(4);
        // Ages are equal; creation order breaks the tie, so 1 and 2 go.
        ctx.image_mut(1).unwrap().atime = 0;
        ctx.image_mut(2).unwrap().atime = 0;
        ctx.image_mut(3).unwrap().atime = 1;
        ctx.image_mut(4).unwrap().atime = 1;
        ctx.check_limits();
        assert_eq!(ctx.image_count(), 2);
        assert!(ctx.image(3).is_some());
        assert!(ctx.image(4).is_some());
        assert!(ctx.counters_consistent());
    }

    #[test]
    fn within_tolerance_no_eviction() {
        let config = GraphicsConfig::new().with_max_images(100);
        let mut ctx = GraphicsContext::new(config);
        for id in 1..=104 {
            ctx.new_image(id);
        }
        // 104 <= 100 * 1.05, still tolerated.
        ctx.check_limits();
        assert_eq!(ctx.image_count(), 104);
    }

    #[test]
    fn ram_budget_unloads_cold_bitmaps_first() {
        let config = GraphicsConfig::new().with_total_ram_budget(4 * 4 * 4);
        let mut ctx = GraphicsContext::new(config);
        loaded_image(&mut ctx, 1, 4, 4); // 64 bytes
        loaded_image(&mut ctx, 2, 4, 4); // 64 bytes -> 128 total, budget 64
        // Image 1 is far outside the recency window, image 2 was touched
        // just now.
        ctx.image_mut(1).unwrap().frame_mut(1).unwrap().atime = -10_000;
        ctx.image_mut(1).unwrap().atime = -10_000;
        let now = ctx.now_ms();
        ctx.image_mut(2).unwrap().frame_mut(1).unwrap().atime = now;
        ctx.check_limits();
        assert!(ctx.ram_bytes() <= 64);
        assert!(ctx.image(1).unwrap().frame(1).unwrap().decoded.is_none());
        assert!(ctx.image(2).unwrap().frame(1).unwrap().decoded.is_some());
        assert!(ctx.counters_consistent());
    }

    #[test]
    fn disk_budget_deletes_files_not_frames() {
        let config = GraphicsConfig::new().with_total_disk_budget(10);
        let mut ctx = GraphicsContext::new(config);
        ctx.new_image(1);
        {
            let img = ctx.image_mut(1).unwrap();
            let index = img.append_frame(0);
            let frame = img.frame_mut(index).unwrap();
            frame.status = FrameStatus::UploadSuccess;
            frame.disk_size = 100;
            img.total_disk_size = 100;
        }
        ctx.disk_bytes += 100;
        ctx.check_limits();
        assert_eq!(ctx.disk_bytes(), 0);
        // The frame record survives; only its file is gone.
        let frame = ctx.image(1).unwrap().frame(1).unwrap();
        assert_eq!(frame.disk_size, 0);
        assert!(ctx.counters_consistent());
    }

    #[test]
    fn placement_budget_respects_protection() {
        let config = GraphicsConfig::new().with_max_placements(1);
        let mut ctx = GraphicsContext::new(config);
        ctx.new_image(1);
        ctx.new_placement(1, 10);
        ctx.new_placement(1, 20);
        ctx.new_placement(1, 30);
        // The oldest placement is protected; the pass stops there.
        ctx.image_mut(1).unwrap().placement_mut(10).unwrap().atime = 0;
        ctx.image_mut(1).unwrap().placement_mut(10).unwrap().protected_frame = 1;
        ctx.check_limits();
        assert!(ctx.image(1).unwrap().placement(10).is_some());
        assert_eq!(ctx.placement_count(), 3);
    }
}
