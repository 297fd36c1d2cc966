//! Command execution and protocol responses.
//!
//! [`GraphicsContext::parse_and_execute`] is the single entry point for
//! inbound commands. It parses the control data, runs the action, and
//! returns a [`CommandResult`] carrying the response string (if one should
//! be sent), the error flag, and any placeholder the host must create.
//!
//! The grid itself belongs to the host: deletion of visible placements and
//! redraw scheduling go through the [`GridHost`] trait.

use std::fmt::Write as _;
use std::fs;
use std::io::Write as _;

use crate::base64;
use crate::command::GraphicsCommand;
use crate::context::GraphicsContext;
use crate::error::GraphicsError;
use crate::image::{AnimationState, FrameStatus, ScaleMode, UploadFailure};

/// A placeholder the host terminal must create on its grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceholderRequest {
    /// Image to display.
    pub image_id: u32,
    /// Placement to display.
    pub placement_id: u32,
    /// Width in cells.
    pub columns: u16,
    /// Height in cells.
    pub rows: u16,
    /// Leave the cursor in place after creating the placeholder.
    pub do_not_move_cursor: bool,
}

/// The outcome of one graphics command.
#[derive(Debug, Default)]
pub struct CommandResult {
    /// The terminal should redraw.
    pub redraw: bool,
    /// Response to send back to the client, already quietness-filtered.
    /// The host wraps it in its escape envelope.
    pub response: Option<String>,
    /// Whether the command failed (the response must be sent either way).
    pub error: bool,
    /// A placeholder for a non-virtual placement the host must create.
    pub create_placeholder: Option<PlaceholderRequest>,
}

/// One grid cell occupied by an image placement.
#[derive(Debug, Clone, Copy)]
pub struct CellImage {
    /// Image id stored in the cell.
    pub image_id: u32,
    /// Placement id stored in the cell, possibly 0.
    pub placement_id: u32,
    /// Grid column.
    pub col: u32,
    /// Grid row.
    pub row: u32,
    /// Classic placement (true) or Unicode placeholder (false).
    pub classic: bool,
}

/// What the host should do with a visited cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellDisposition {
    /// Leave the cell as it is.
    Keep,
    /// Erase the image reference from the cell.
    Erase,
}

/// Host-side grid operations the core depends on.
pub trait GridHost {
    /// Visit every cell that references an image and apply the returned
    /// disposition.
    fn for_each_image_cell(&mut self, visit: &mut dyn FnMut(CellImage) -> CellDisposition);

    /// Mark all rows containing the image as dirty.
    fn schedule_image_redraw(&mut self, image_id: u32);
}

/// A [`GridHost`] with no cells; for hosts that track placements
/// elsewhere, and for tests.
#[derive(Debug, Default)]
pub struct NullGrid;

impl GridHost for NullGrid {
    fn for_each_image_cell(&mut self, _visit: &mut dyn FnMut(CellImage) -> CellDisposition) {}
    fn schedule_image_redraw(&mut self, _image_id: u32) {}
}

impl GraphicsContext {
    /// Parse and execute one graphics command. `buf` is the raw command
    /// starting with `G` (escape envelope already stripped by the host).
    pub fn parse_and_execute(&mut self, buf: &[u8], host: &mut dyn GridHost) -> CommandResult {
        let mut result = CommandResult::default();
        if buf.first() != Some(&b'G') {
            log::error!("graphics command does not start with 'G'");
            result.error = true;
            return result;
        }
        self.global_command_counter += 1;
        log::debug!(
            "command {}: {}",
            self.global_command_counter,
            sanitize(&String::from_utf8_lossy(&buf[..buf.len().min(80)]))
        );

        let (mut cmd, parse_errors) = GraphicsCommand::parse(&buf[1..]);
        for error in &parse_errors {
            report_error_cmd(&mut result, &cmd, error);
        }
        if !result.error {
            self.handle_command(&mut cmd, &mut result, host);
        }
        result
    }

    fn handle_command(
        &mut self,
        cmd: &mut GraphicsCommand,
        result: &mut CommandResult,
        host: &mut dyn GridHost,
    ) {
        match cmd.action {
            0 => {
                // Without an action this can only be the continuation of a
                // data transmission.
                if cmd.is_data_transmission {
                    self.handle_transmit(cmd, result, host);
                } else {
                    report_error_cmd(result, cmd, &GraphicsError::NoAction);
                }
            }
            // Query is transmission with a discarded image and a fake id;
            // frame transmission appends to an existing image.
            b't' | b'q' | b'f' => {
                self.handle_transmit(cmd, result, host);
            }
            b'p' => self.handle_put(cmd, result),
            b'T' => {
                if let Some((image_id, _)) = self.handle_transmit(cmd, result, host) {
                    if !cmd.is_direct_transmission_continuation {
                        self.handle_put(cmd, result);
                        if cmd.placement_id != 0 {
                            if let Some(img) = self.image_mut(image_id) {
                                img.initial_placement_id = cmd.placement_id;
                            }
                        }
                    }
                }
            }
            b'd' => self.handle_delete(cmd, result, host),
            b'a' => self.handle_animation_control(cmd, result, host),
            other => report_error_cmd(result, cmd, &GraphicsError::UnsupportedAction(other)),
        }
    }

    // === Transmission ===

    fn handle_transmit(
        &mut self,
        cmd: &mut GraphicsCommand,
        result: &mut CommandResult,
        host: &mut dyn GridHost,
    ) -> Option<(u32, usize)> {
        if cmd.transmission_medium == 0 {
            cmd.transmission_medium = b'd';
        }

        // An id-less direct chunk continues the upload in progress.
        if let Some((upload_id, _)) = self.current_upload {
            if cmd.image_id == 0 && cmd.image_number == 0 && cmd.transmission_medium == b'd' {
                cmd.image_id = upload_id;
                log::debug!("no image id specified, continuing upload of {}", upload_id);
            }
        }

        match cmd.transmission_medium {
            b'f' | b't' => self.handle_file_transmission(cmd, result, host),
            b'd' => {
                let found = self.find_image_for_command(cmd);
                let last = found.and_then(|image_id| {
                    let index = self.image(image_id)?.last_frame_index();
                    (index > 0).then_some((image_id, index))
                });
                if let Some((image_id, frame_index)) = last {
                    let uploading = self
                        .image(image_id)
                        .and_then(|img| img.frame(frame_index))
                        .is_some_and(|f| f.status == FrameStatus::Uploading);
                    if uploading {
                        cmd.is_direct_transmission_continuation = true;
                        self.append_data(image_id, frame_index, cmd.payload, cmd.more, result, host);
                        return Some((image_id, frame_index));
                    }
                }
                if cmd.action == 0 && !cmd.more {
                    // A stray finalizer with nothing to continue; drop it.
                    return None;
                }
                // An action-less first chunk takes the protocol's default
                // action and starts a fresh transmit.
                let (image_id, frame_index) = self.new_image_or_frame_from_command(cmd, result)?;
                self.last_image_id = image_id;
                if let Some(frame) =
                    self.image_mut(image_id).and_then(|img| img.frame_mut(frame_index))
                {
                    frame.status = FrameStatus::Uploading;
                }
                self.append_data(image_id, frame_index, cmd.payload, cmd.more, result, host);
                // A query image may already be gone at this point.
                self.image(image_id).is_some().then_some((image_id, frame_index))
            }
            other => {
                report_error_cmd(result, cmd, &GraphicsError::UnsupportedMedium(other));
                None
            }
        }
    }

    fn handle_file_transmission(
        &mut self,
        cmd: &mut GraphicsCommand,
        result: &mut CommandResult,
        host: &mut dyn GridHost,
    ) -> Option<(u32, usize)> {
        let (image_id, frame_index) = self.new_image_or_frame_from_command(cmd, result)?;
        self.last_image_id = image_id;

        let original_path = String::from_utf8_lossy(&base64::decode(cmd.payload)).into_owned();
        log::debug!("copying image file {}", sanitize(&original_path));

        let metadata = fs::metadata(&original_path);
        let stat_error: Option<String> = match &metadata {
            Err(e) => Some(e.to_string()),
            Ok(md) if !md.is_file() => Some("not a regular file".to_string()),
            Ok(md) if md.len() == 0 => Some("the size of the file is zero".to_string()),
            Ok(md) if md.len() > self.config.max_image_file_size => {
                Some("the file is too large".to_string())
            }
            Ok(_) => None,
        };

        let mut kept = true;
        if let Some(reason) = stat_error {
            report_error_cmd(result, cmd, &GraphicsError::StatFailed(reason));
            log::error!("could not load the file {}", sanitize(&original_path));
            self.fail_upload(image_id, frame_index, UploadFailure::CannotCopyFile);
        } else {
            self.ensure_cache_dir();
            let copied = self
                .frame_path(image_id, frame_index)
                .and_then(|cache_path| fs::copy(&original_path, cache_path).ok());
            match copied {
                None => {
                    report_error_cmd(result, cmd, &GraphicsError::CopyFailed);
                    log::error!(
                        "could not copy the image {} to the cache dir",
                        sanitize(&original_path)
                    );
                    self.fail_upload(image_id, frame_index, UploadFailure::CannotCopyFile);
                }
                Some(copied_len) => {
                    let expected = {
                        let img = self.image_mut(image_id)?;
                        img.total_disk_size += copied_len;
                        let frame = img.frame_mut(frame_index)?;
                        frame.status = FrameStatus::UploadSuccess;
                        frame.disk_size = copied_len;
                        u64::from(frame.expected_size)
                    };
                    self.disk_bytes += copied_len;
                    if expected != 0 && expected != copied_len {
                        self.fail_upload(image_id, frame_index, UploadFailure::UnexpectedSize);
                        self.report_upload_error(result, image_id, frame_index);
                    } else {
                        host.schedule_image_redraw(image_id);
                        result.redraw = true;
                        kept = self.load_and_report(result, image_id, frame_index);
                    }
                }
            }
            // The client marked its own file as disposable.
            if cmd.transmission_medium == b't' {
                delete_tmp_file(&original_path);
            }
        }
        self.check_limits();
        kept.then_some((image_id, frame_index))
    }

    /// Create a new image (or a new frame of an existing image for `a=f`)
    /// and initialize the frame from the command.
    fn new_image_or_frame_from_command(
        &mut self,
        cmd: &mut GraphicsCommand,
        result: &mut CommandResult,
    ) -> Option<(u32, usize)> {
        if cmd.format != 0 && cmd.format != 32 && cmd.format != 24 && cmd.compression != 0 {
            // Report, but still create the image, so that the upload can
            // proceed and fail in a well-defined state.
            report_error_cmd(result, cmd, &GraphicsError::CompressionRequiresRawFormat);
        }

        let image_id = if cmd.action == b'f' {
            match self.find_image_for_command(cmd) {
                Some(image_id) => image_id,
                None => {
                    report_error_cmd(result, cmd, &GraphicsError::ImageNotFound);
                    return None;
                }
            }
        } else {
            // Queries get a random id; the client-supplied one is only
            // used for the response and must never leak a real image.
            let requested = if cmd.action == b'q' { 0 } else { cmd.image_id };
            let image_id = self.new_image(requested);
            let img = self.image_mut(image_id)?;
            if cmd.action == b'q' {
                img.query_id = cmd.image_id;
            } else if cmd.image_id == 0 {
                cmd.image_id = image_id;
            }
            img.image_number = cmd.image_number;
            image_id
        };

        let now = self.now_ms();
        let img = self.image_mut(image_id)?;
        let frame_index = img.append_frame(now);
        log::debug!("appending frame {} to image {}", frame_index, image_id);
        let frame = img.frame_mut(frame_index)?;
        frame.expected_size = cmd.size;
        frame.format = cmd.format;
        frame.compression = cmd.compression;
        frame.background_color = cmd.background_color;
        frame.background_frame_index = cmd.background_frame;
        frame.gap = cmd.gap;
        frame.blend = !cmd.replace_instead_of_blending;
        frame.data_pix_width = cmd.frame_pix_width;
        frame.data_pix_height = cmd.frame_pix_height;
        if cmd.action == b'f' {
            frame.offset_x = cmd.frame_dst_pix_x;
            frame.offset_y = cmd.frame_dst_pix_y;
        }
        // Chunked uploads keep the quietness of the creating command.
        frame.quiet = cmd.quiet;
        img.total_duration += i64::from(cmd.gap.max(0));
        Some((image_id, frame_index))
    }

    /// Append one decoded payload chunk to a frame's cache file. Errors
    /// are reported only on the final chunk to avoid spamming the client.
    fn append_data(
        &mut self,
        image_id: u32,
        frame_index: usize,
        payload: &[u8],
        more: bool,
        result: &mut CommandResult,
        host: &mut dyn GridHost,
    ) {
        if !more {
            self.current_upload = None;
        }
        let Some(status) =
            self.image(image_id).and_then(|img| img.frame(frame_index)).map(|f| f.status)
        else {
            if !more {
                result.error = true;
                let error = GraphicsError::AppendTargetMissing;
                let _ = create_response(0, 0, 0, &error.to_string());
            }
            return;
        };
        if status != FrameStatus::Uploading {
            if !more {
                self.report_upload_error(result, image_id, frame_index);
            }
            return;
        }

        let data = base64::decode(payload);
        let (disk_size, expected_size) = {
            let frame = self.image(image_id).and_then(|img| img.frame(frame_index)).unwrap();
            (frame.disk_size, u64::from(frame.expected_size))
        };
        log::trace!(
            "appending {} + {} = {} bytes to image {} frame {}",
            disk_size,
            data.len(),
            disk_size + data.len() as u64,
            image_id,
            frame_index
        );

        // Drop the whole upload once it exceeds the per-file limit.
        let limit = self.config.max_image_file_size;
        if disk_size + data.len() as u64 > limit || expected_size > limit {
            self.delete_image_file(image_id, frame_index);
            self.fail_upload(image_id, frame_index, UploadFailure::OverSizeLimit);
            if !more {
                self.report_upload_error(result, image_id, frame_index);
            }
            return;
        }

        // Open the cache file on first use (and reopen after eviction).
        let has_open_file = self
            .image(image_id)
            .and_then(|img| img.frame(frame_index))
            .is_some_and(|f| f.open_file.is_some());
        if !has_open_file {
            self.ensure_cache_dir();
            let opened = self.frame_path(image_id, frame_index).and_then(|path| {
                if disk_size > 0 {
                    fs::OpenOptions::new().append(true).open(path).ok()
                } else {
                    fs::File::create(path).ok()
                }
            });
            match opened {
                Some(file) => {
                    if let Some(frame) =
                        self.image_mut(image_id).and_then(|img| img.frame_mut(frame_index))
                    {
                        frame.open_file = Some(file);
                    }
                }
                None => {
                    self.fail_upload(image_id, frame_index, UploadFailure::CannotOpenCacheFile);
                    if !more {
                        self.report_upload_error(result, image_id, frame_index);
                    }
                    return;
                }
            }
        }

        // Write the chunk and keep the counters in sync.
        let now = self.now_ms();
        let written = {
            let img = self.image_mut(image_id).expect("frame checked above");
            img.atime = now;
            let frame = img.frame_mut(frame_index).expect("frame checked above");
            frame.atime = now;
            let write_result =
                frame.open_file.as_mut().expect("opened above").write_all(&data);
            match write_result {
                Ok(()) => {
                    let n = data.len() as u64;
                    frame.disk_size += n;
                    img.total_disk_size += n;
                    true
                }
                Err(e) => {
                    log::error!(
                        "could not write to the cache file of image {} frame {}: {}",
                        image_id,
                        frame_index,
                        e
                    );
                    frame.open_file = None;
                    false
                }
            }
        };
        if !written {
            self.fail_upload(image_id, frame_index, UploadFailure::CannotOpenCacheFile);
            if !more {
                self.report_upload_error(result, image_id, frame_index);
            }
            return;
        }
        self.disk_bytes += data.len() as u64;

        if more {
            self.current_upload = Some((image_id, frame_index));
        } else {
            let (disk, expected) = {
                let img = self.image_mut(image_id).expect("frame checked above");
                let frame = img.frame_mut(frame_index).expect("frame checked above");
                frame.open_file = None;
                frame.status = FrameStatus::UploadSuccess;
                (frame.disk_size, u64::from(frame.expected_size))
            };
            if expected != 0 && expected != disk {
                self.fail_upload(image_id, frame_index, UploadFailure::UnexpectedSize);
                self.report_upload_error(result, image_id, frame_index);
            } else {
                // Redraw existing instances of the image everywhere.
                host.schedule_image_redraw(image_id);
                result.redraw = true;
                let kept = self.load_and_report(result, image_id, frame_index);
                // The first frame may have placements registered by put
                // commands before the upload finished.
                if kept && frame_index == 1 {
                    let placement_ids: Vec<u32> = self
                        .image(image_id)
                        .map(|img| img.placements().map(|p| p.placement_id).collect())
                        .unwrap_or_default();
                    for placement_id in placement_ids {
                        self.display_nonvirtual_placement(result, image_id, placement_id);
                    }
                }
            }
        }
        self.check_limits();
    }

    fn fail_upload(&mut self, image_id: u32, frame_index: usize, failure: UploadFailure) {
        if let Some(frame) = self.image_mut(image_id).and_then(|img| img.frame_mut(frame_index)) {
            frame.status = FrameStatus::UploadError;
            frame.uploading_failure = Some(failure);
        }
    }

    /// Decode+compose a freshly uploaded frame and report the outcome.
    /// Returns false when the image was a query and has been discarded.
    fn load_and_report(
        &mut self,
        result: &mut CommandResult,
        image_id: u32,
        frame_index: usize,
    ) -> bool {
        self.ensure_decoded(image_id, frame_index);
        let loaded = self
            .image(image_id)
            .and_then(|img| img.frame(frame_index))
            .is_some_and(|f| f.decoded.is_some());
        if loaded {
            self.report_frame_success(result, image_id, frame_index);
        } else {
            self.report_frame_error(result, image_id, frame_index, &GraphicsError::LoadFailed);
        }
        if self.image(image_id).is_some_and(|img| img.query_id != 0) {
            self.delete_image(image_id);
            return false;
        }
        true
    }

    /// Ask the host to create a placeholder for a loaded, non-virtual
    /// placement.
    fn display_nonvirtual_placement(
        &mut self,
        result: &mut CommandResult,
        image_id: u32,
        placement_id: u32,
    ) {
        {
            let Some(img) = self.image(image_id) else { return };
            let Some(placement) = img.placement(placement_id) else { return };
            if placement.virtual_placement {
                return;
            }
            if img.frame(1).map_or(true, |f| f.status < FrameStatus::RamLoadingSuccess) {
                return;
            }
        }
        self.infer_placement_size(image_id, placement_id);
        let Some(img) = self.image(image_id) else { return };
        let Some(placement) = img.placement(placement_id) else { return };
        log::debug!(
            "creating a placeholder for {}/{}  {} x {}",
            image_id,
            placement_id,
            placement.cols,
            placement.rows
        );
        result.create_placeholder = Some(PlaceholderRequest {
            image_id,
            placement_id,
            columns: placement.cols,
            rows: placement.rows,
            do_not_move_cursor: placement.do_not_move_cursor,
        });
        result.redraw = true;
    }

    // === Put ===

    fn handle_put(&mut self, cmd: &mut GraphicsCommand, result: &mut CommandResult) {
        if cmd.image_id == 0 && cmd.image_number == 0 {
            report_error_cmd(result, cmd, &GraphicsError::NoImageIdentity);
            return;
        }
        let Some(image_id) = self.find_image_for_command(cmd) else {
            report_error_cmd(result, cmd, &GraphicsError::ImageNotFound);
            return;
        };

        let placement_id = self.new_placement(image_id, cmd.placement_id);
        if placement_id == 0 {
            return;
        }
        {
            let img = self.image_mut(image_id).expect("image found above");
            let placement = img.placement_mut(placement_id).expect("placement created above");
            placement.virtual_placement = cmd.virtual_placement;
            placement.src_pix_x = cmd.src_pix_x;
            placement.src_pix_y = cmd.src_pix_y;
            placement.src_pix_width = cmd.src_pix_width;
            placement.src_pix_height = cmd.src_pix_height;
            placement.cols = cmd.columns.clamp(0, i32::from(u16::MAX)) as u16;
            placement.rows = cmd.rows.clamp(0, i32::from(u16::MAX)) as u16;
            placement.do_not_move_cursor = cmd.do_not_move_cursor;
            // The scale mode is fixed now so later pixmap builds are
            // deterministic.
            placement.scale_mode = if placement.virtual_placement {
                ScaleMode::Contain
            } else if placement.cols != 0 && placement.rows != 0 {
                ScaleMode::Fill
            } else if placement.cols != 0 || placement.rows != 0 {
                ScaleMode::Contain
            } else {
                ScaleMode::None
            };
        }

        self.display_nonvirtual_placement(result, image_id, placement_id);
        report_success_cmd(result, cmd);
    }

    // === Delete ===

    fn handle_delete(
        &mut self,
        cmd: &GraphicsCommand,
        result: &mut CommandResult,
        host: &mut dyn GridHost,
    ) {
        let delete_image_if_no_ref = cmd.delete_specifier.is_ascii_uppercase();
        let mut specifier = cmd.delete_specifier.to_ascii_lowercase();
        let mut target_image = 0u32;

        if specifier == b'n' {
            specifier = b'i';
            match self.find_image_by_number(cmd.image_number) {
                Some(image_id) => target_image = image_id,
                None => return,
            }
        }

        if specifier == 0 || specifier == b'a' {
            self.delete_visible_placements(host, 0, 0, delete_image_if_no_ref);
        } else if specifier == b'i' {
            if target_image == 0 {
                target_image = cmd.image_id;
            }
            if target_image == 0 {
                log::error!("image id is not specified in the delete command");
                return;
            }
            // Without a placement id, an uppercase delete removes the
            // image outright; otherwise an image with only virtual
            // placements could never be deleted in one command.
            if cmd.placement_id == 0 && delete_image_if_no_ref {
                self.delete_image(target_image);
            }
            self.delete_visible_placements(
                host,
                target_image,
                cmd.placement_id,
                delete_image_if_no_ref,
            );
        } else {
            log::warn!(
                "unsupported delete specifier '{}', the command is ignored",
                char::from(cmd.delete_specifier)
            );
            return;
        }
        result.redraw = true;
    }

    /// Sweep the host grid, erasing matching classic placements and
    /// deleting their records (and images, for uppercase specifiers).
    fn delete_visible_placements(
        &mut self,
        host: &mut dyn GridHost,
        filter_image: u32,
        filter_placement: u32,
        delete_image_if_no_ref: bool,
    ) {
        host.for_each_image_cell(&mut |cell| {
            // Unicode placeholders are left alone.
            if !cell.classic {
                return CellDisposition::Keep;
            }
            if filter_image != 0 && filter_image != cell.image_id {
                return CellDisposition::Keep;
            }
            if filter_placement != 0 && filter_placement != cell.placement_id {
                return CellDisposition::Keep;
            }
            // An already-deleted image just leaves a stale cell.
            if self.images.get(&cell.image_id).is_none() {
                return CellDisposition::Erase;
            }
            if cell.placement_id != 0 {
                self.delete_placement(cell.image_id, cell.placement_id);
            }
            if delete_image_if_no_ref
                && self.images.get(&cell.image_id).is_some_and(|img| img.placement_count() == 0)
            {
                self.delete_image(cell.image_id);
            }
            CellDisposition::Erase
        });
    }

    // === Animation control ===

    fn handle_animation_control(
        &mut self,
        cmd: &mut GraphicsCommand,
        result: &mut CommandResult,
        host: &mut dyn GridHost,
    ) {
        if cmd.image_id == 0 && cmd.image_number == 0 {
            report_error_cmd(result, cmd, &GraphicsError::NoImageIdentity);
            return;
        }
        let Some(image_id) = self.find_image_for_command(cmd) else {
            report_error_cmd(result, cmd, &GraphicsError::ImageNotFound);
            return;
        };

        // Edit a single frame's gap if requested.
        if cmd.edit_frame != 0 || cmd.gap != 0 {
            let edit_index = cmd.edit_frame.max(0) as usize;
            let exists =
                self.image(image_id).and_then(|img| img.frame(edit_index)).is_some();
            if !exists {
                report_error_cmd(result, cmd, &GraphicsError::FrameNotFound(cmd.edit_frame));
                return;
            }
            if cmd.gap != 0 {
                let img = self.image_mut(image_id).expect("image found above");
                let frame = img.frame_mut(edit_index).expect("frame checked above");
                let old_gap = i64::from(frame.gap.max(0));
                frame.gap = cmd.gap;
                img.total_duration = img.total_duration - old_gap + i64::from(cmd.gap.max(0));
            }
        }

        let img = self.image_mut(image_id).expect("image found above");
        if cmd.current_frame != 0 {
            img.current_frame = cmd.current_frame.max(0) as usize;
        }
        match cmd.animation_state {
            0 => {}
            1 => img.animation_state = AnimationState::Stopped,
            2 => img.animation_state = AnimationState::Loading,
            3 => img.animation_state = AnimationState::Looping,
            state => {
                report_error_cmd(result, cmd, &GraphicsError::InvalidAnimationState(state.into()))
            }
        }
        // Note: `v=` (finite loop count) is parsed but reserved; the
        // animation loops until stopped.

        host.schedule_image_redraw(image_id);
        result.redraw = true;
    }

    // === Lookup and reporting helpers ===

    /// Find the image by id or number; a put command with neither targets
    /// the most recently created image. Fills in `cmd.image_id` on
    /// success for response addressing.
    fn find_image_for_command(&mut self, cmd: &mut GraphicsCommand) -> Option<u32> {
        if cmd.image_id != 0 {
            return self.images.contains_key(&cmd.image_id).then_some(cmd.image_id);
        }
        let found = if cmd.image_number == 0 && cmd.action == b'p' {
            (self.last_image_id != 0 && self.images.contains_key(&self.last_image_id))
                .then_some(self.last_image_id)
        } else {
            self.find_image_by_number(cmd.image_number)
        };
        if let Some(image_id) = found {
            cmd.image_id = image_id;
        }
        found
    }

    fn report_frame_success(&self, result: &mut CommandResult, image_id: u32, frame_index: usize) {
        let Some(img) = self.image(image_id) else { return };
        let quiet = img.frame(frame_index).map_or(0, |f| f.quiet);
        let id = if img.query_id != 0 { img.query_id } else { img.image_id };
        if quiet < 1 {
            if let Some(response) =
                create_response(id, img.image_number, img.initial_placement_id, "OK")
            {
                result.response = Some(response);
            }
        }
    }

    fn report_frame_error(
        &self,
        result: &mut CommandResult,
        image_id: u32,
        frame_index: usize,
        error: &GraphicsError,
    ) {
        result.error = true;
        let Some(img) = self.image(image_id) else {
            let _ = create_response(0, 0, 0, &error.to_string());
            return;
        };
        let id = if img.query_id != 0 { img.query_id } else { img.image_id };
        log::error!("{}  id={}", error, id);
        let quiet = img.frame(frame_index).map_or(0, |f| f.quiet);
        if quiet < 2 {
            if let Some(response) =
                create_response(id, img.image_number, img.initial_placement_id, &error.to_string())
            {
                result.response = Some(response);
            }
        }
    }

    /// Report the recorded uploading failure of a frame, if any.
    fn report_upload_error(&self, result: &mut CommandResult, image_id: u32, frame_index: usize) {
        let Some(frame) = self.image(image_id).and_then(|img| img.frame(frame_index)) else {
            return;
        };
        let error = match frame.uploading_failure {
            // Copy failures are reported at the transmission site.
            None | Some(UploadFailure::CannotCopyFile) => return,
            Some(UploadFailure::CannotOpenCacheFile) => GraphicsError::CacheFileCreation,
            Some(UploadFailure::OverSizeLimit) => {
                GraphicsError::OverSizeLimit(self.config.max_image_file_size)
            }
            Some(UploadFailure::UnexpectedSize) => GraphicsError::UnexpectedSize {
                actual: frame.disk_size,
                expected: u64::from(frame.expected_size),
            },
        };
        self.report_frame_error(result, image_id, frame_index, &error);
    }
}

/// Record a command-addressed error on the result.
fn report_error_cmd(result: &mut CommandResult, cmd: &GraphicsCommand, error: &GraphicsError) {
    result.error = true;
    log::error!("{}", error);
    if cmd.quiet < 2 {
        if let Some(response) =
            create_response(cmd.image_id, cmd.image_number, cmd.placement_id, &error.to_string())
        {
            result.response = Some(response);
        }
    }
}

/// Record the `OK` response unless suppressed or mid-upload.
fn report_success_cmd(result: &mut CommandResult, cmd: &GraphicsCommand) {
    if cmd.quiet < 1 && !cmd.more {
        if let Some(response) =
            create_response(cmd.image_id, cmd.image_number, cmd.placement_id, "OK")
        {
            result.response = Some(response);
        }
    }
}

/// Build a response naming whichever of {id, number, placement} the client
/// supplied. With no identity at all the message is only logged; nobody
/// could route the response.
fn create_response(
    image_id: u32,
    image_number: u32,
    placement_id: u32,
    message: &str,
) -> Option<String> {
    if image_id == 0 && image_number == 0 && placement_id == 0 {
        log::error!("response has no image id, image number or placement id: {}", message);
        return None;
    }
    let mut response = String::from("G");
    if image_id != 0 {
        let _ = write!(response, "i={},", image_id);
    }
    if image_number != 0 {
        let _ = write!(response, "I={},", image_number);
    }
    if placement_id != 0 {
        let _ = write!(response, "p={},", placement_id);
    }
    response.pop();
    response.push(';');
    response.push_str(message);
    Some(response)
}

/// Remove a client file after a `t=t` transmission, but only when it is
/// clearly a protocol temp file.
fn delete_tmp_file(path: &str) {
    if !path.contains("tty-graphics-protocol") {
        return;
    }
    if !path.starts_with("/tmp/") {
        let tmpdir = std::env::var("TMPDIR").unwrap_or_default();
        if tmpdir.is_empty() || !path.starts_with(&tmpdir) {
            return;
        }
    }
    let _ = fs::remove_file(path);
}

/// Printable rendition of untrusted text for logs.
fn sanitize(text: &str) -> String {
    text.chars()
        .take(256)
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '?' })
        .collect()
}
