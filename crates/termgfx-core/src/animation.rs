//! Frame animation scheduling.
//!
//! [`advance`] moves an image's `current_frame` forward by wall time and
//! computes when the image next needs to be redrawn. It is driven by the
//! draw loop, anchored at the drawing start time so that every placement
//! of an image drawn in one cycle agrees on the frame. Calling it twice
//! with the same `now` is a no-op the second time.

use crate::image::{AnimationState, Image};
use crate::Milliseconds;

/// Advance `img.current_frame` given the current time and update
/// `current_frame_time` and `next_redraw` (0 = no redraw scheduled).
///
/// Gapless frames (negative gap) are always skipped. When every frame is
/// gapless and the walk revisits its starting frame, the scheduler forces
/// a single step and derives `next_redraw` from the post-advance frame's
/// gap.
pub fn advance(img: &mut Image, now: Milliseconds) {
    if img.current_frame == 0 {
        img.current_frame_time = now;
        img.current_frame = 1;
        let gap = img.frame(1).map_or(0, |f| f.gap);
        img.next_redraw = now + Milliseconds::from(gap.max(1));
        return;
    }

    // A stopped animation keeps showing the current frame.
    if matches!(img.animation_state, AnimationState::Unset | AnimationState::Stopped) {
        img.next_redraw = 0;
        return;
    }

    let last_uploaded = img.last_uploaded_frame_index();
    // Loading and already at the newest complete frame: wait for more
    // frames or a state change.
    if img.animation_state == AnimationState::Loading && img.current_frame == last_uploaded {
        img.next_redraw = 0;
        return;
    }

    let mut passed = now - img.current_frame_time;
    // A looping animation far behind schedule jumps straight into phase.
    if img.animation_state == AnimationState::Looping
        && img.total_duration > 0
        && passed >= img.total_duration
    {
        passed %= img.total_duration;
        img.current_frame_time = now - passed;
    }

    let original_frame = img.current_frame;
    loop {
        let Some(frame) = img.frame(img.current_frame) else {
            // The frame disappeared; restart from the beginning.
            img.current_frame = 1;
            img.current_frame_time = now;
            let gap = img.frame(1).map_or(0, |f| f.gap);
            img.next_redraw = now + Milliseconds::from(gap.max(1));
            return;
        };
        let gap = frame.gap;

        if gap >= 0 && passed < Milliseconds::from(gap) {
            // Still inside the current frame.
            img.next_redraw = img.current_frame_time + Milliseconds::from(gap.max(1));
            return;
        }

        passed -= Milliseconds::from(gap.max(0));
        if img.current_frame >= last_uploaded {
            if img.animation_state == AnimationState::Loading {
                img.next_redraw = 0;
                return;
            }
            img.current_frame = 1;
        } else {
            img.current_frame += 1;
        }

        if img.current_frame == original_frame {
            // Every reachable frame was consumed without settling; all of
            // them are gapless or too much time has passed. Force one step.
            img.current_frame += 1;
            if img.current_frame > last_uploaded {
                img.current_frame = 1;
            }
            img.current_frame_time = now;
            let gap = img.frame(img.current_frame).map_or(0, |f| f.gap);
            img.next_redraw = now + Milliseconds::from(gap.max(1));
            return;
        }

        img.current_frame_time += Milliseconds::from(gap.max(0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::FrameStatus;

    /// An image with the given frame gaps, all frames fully loaded.
    fn animated_image(gaps: &[i32]) -> Image {
        let mut img = Image::new(2, 0, 0);
        for &gap in gaps {
            let index = img.append_frame(0);
            let frame = img.frame_mut(index).unwrap();
            frame.status = FrameStatus::RamLoadingSuccess;
            frame.gap = gap;
            img.total_duration += i64::from(gap.max(0));
        }
        img
    }

    #[test]
    fn looping_steps_through_frames() {
        let mut img = animated_image(&[100, 200, 50]);
        img.animation_state = AnimationState::Looping;
        assert_eq!(img.total_duration, 350);

        advance(&mut img, 0);
        assert_eq!(img.current_frame, 1);
        assert_eq!(img.next_redraw, 100);

        advance(&mut img, 150);
        assert_eq!(img.current_frame, 2);
        assert_eq!(img.next_redraw, 300);

        advance(&mut img, 360);
        assert_eq!(img.current_frame, 1);
        assert_eq!(img.current_frame_time, 350);
        assert_eq!(img.next_redraw, 450);
    }

    #[test]
    fn advance_is_idempotent_for_equal_now() {
        let mut img = animated_image(&[100, 200, 50]);
        img.animation_state = AnimationState::Looping;
        advance(&mut img, 0);
        for &t in &[150, 360, 1234, 5000] {
            advance(&mut img, t);
            let frame = img.current_frame;
            let frame_time = img.current_frame_time;
            let next = img.next_redraw;
            advance(&mut img, t);
            assert_eq!(img.current_frame, frame, "at t={}", t);
            assert_eq!(img.current_frame_time, frame_time, "at t={}", t);
            assert_eq!(img.next_redraw, next, "at t={}", t);
        }
    }

    #[test]
    fn stopped_never_schedules_redraw() {
        let mut img = animated_image(&[100, 100]);
        img.animation_state = AnimationState::Stopped;
        advance(&mut img, 0); // initializes to frame 1
        advance(&mut img, 500);
        assert_eq!(img.current_frame, 1);
        assert_eq!(img.next_redraw, 0);
    }

    #[test]
    fn loading_stops_on_last_uploaded_frame() {
        let mut img = animated_image(&[50, 50]);
        img.animation_state = AnimationState::Loading;
        advance(&mut img, 0);
        advance(&mut img, 60);
        assert_eq!(img.current_frame, 2);
        advance(&mut img, 200);
        assert_eq!(img.current_frame, 2);
        assert_eq!(img.next_redraw, 0);
    }

    #[test]
    fn loading_ignores_trailing_incomplete_frame() {
        let mut img = animated_image(&[50, 50]);
        let index = img.append_frame(0);
        img.frame_mut(index).unwrap().status = FrameStatus::Uploading;
        img.animation_state = AnimationState::Loading;
        advance(&mut img, 0);
        advance(&mut img, 500);
        // Frame 3 is still uploading; the animation waits on frame 2.
        assert_eq!(img.current_frame, 2);
        assert_eq!(img.next_redraw, 0);
    }

    #[test]
    fn gapless_frame_skipped() {
        let mut img = animated_image(&[100, -1, 100]);
        img.animation_state = AnimationState::Looping;
        advance(&mut img, 0);
        assert_eq!(img.current_frame, 1);
        advance(&mut img, 110);
        // Frame 2 is gapless and consumed no time.
        assert_eq!(img.current_frame, 3);
    }

    #[test]
    fn all_gapless_forces_single_step() {
        let mut img = animated_image(&[-1, -1, -1]);
        img.animation_state = AnimationState::Looping;
        advance(&mut img, 0);
        assert_eq!(img.current_frame, 1);
        advance(&mut img, 10);
        // The walk revisits frame 1 and forces one step.
        assert_eq!(img.current_frame, 2);
        assert_eq!(img.current_frame_time, 10);
        assert_eq!(img.next_redraw, 11);
    }

    #[test]
    fn looping_far_behind_reduces_modulo() {
        let mut img = animated_image(&[100, 100]);
        img.animation_state = AnimationState::Looping;
        advance(&mut img, 0);
        advance(&mut img, 100_000 + 150);
        assert_eq!(img.current_frame, 2);
        // Phase is preserved: frame time is now - (passed % 200) + 100.
        assert_eq!(img.current_frame_time, 100_000 + 100);
    }
}
