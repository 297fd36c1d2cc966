//! Graphics command parsing.
//!
//! A command is the control-data portion of the escape sequence:
//! `key=value,key=value,...;payload` (the leading `G` already stripped by
//! the caller). Keys `a`, `t`, `d` and `o` take single-character values;
//! every other key takes a decimal integer. Several keys change meaning
//! with the action (`c=` is columns for a put but the background frame for
//! a frame transmission), so `a=`, `i=` and `I=` are extracted in a first
//! pass before the full key sweep.
//!
//! Parsing is maximally tolerant: each offending key produces an error, but
//! the sweep continues so a single response can carry as much information
//! as possible. A command that produced any parse error is not executed.

use crate::error::GraphicsError;

/// Maximum number of key/value pairs accepted per command.
pub const MAX_KEY_VALUE_PAIRS: usize = 32;

/// A parsed graphics command.
///
/// Fields mirror the protocol keys; keys whose meaning depends on the
/// action are stored once per meaning (e.g. `columns` vs `background_frame`
/// for `c=`), with the parser writing only the field selected by the
/// action.
#[derive(Debug, Default)]
pub struct GraphicsCommand<'a> {
    /// The payload after `;` (base64 data or a base64-encoded file path).
    pub payload: &'a [u8],
    /// `a=`: `t`, `q`, `f`, `T`, `p`, `d` or `a`. Zero if absent.
    pub action: u8,
    /// `q=`: 1 suppresses the OK response, 2 suppresses errors too.
    pub quiet: u8,
    /// `f=`: 24/32 for raw pixel data, 100 for decoder-detected formats,
    /// 0 to try the decoder and fall back to raw 32-bit data.
    pub format: i32,
    /// `o=`: `z` for RFC 1950 zlib. Zero if absent.
    pub compression: u8,
    /// `t=`: `d`, `f` or `t`. Zero if absent (defaults to direct).
    pub transmission_medium: u8,
    /// `d=`: the delete specifier character.
    pub delete_specifier: u8,
    /// `s=`/`v=`: pixel size of the transmitted frame data (raw formats).
    pub frame_pix_width: i32,
    /// See [`Self::frame_pix_width`].
    pub frame_pix_height: i32,
    /// `x=`/`y=`: top-left corner of the source rectangle (put).
    pub src_pix_x: i32,
    /// See [`Self::src_pix_x`].
    pub src_pix_y: i32,
    /// `w=`/`h=`: size of the source rectangle (put).
    pub src_pix_width: i32,
    /// See [`Self::src_pix_width`].
    pub src_pix_height: i32,
    /// `r=`/`c=`: display size in cells (put).
    pub rows: i32,
    /// See [`Self::rows`].
    pub columns: i32,
    /// `i=`: the client-chosen image id.
    pub image_id: u32,
    /// `I=`: the client-chosen image number.
    pub image_number: u32,
    /// `p=`: the placement id.
    pub placement_id: u32,
    /// `m=1` when more chunks follow.
    pub more: bool,
    /// True if `m=` was present at all.
    pub is_data_transmission: bool,
    /// Set by the dispatcher when the command turned out to continue an
    /// upload already in progress.
    pub is_direct_transmission_continuation: bool,
    /// `S=`: expected size of the uploaded data, for verification.
    pub size: u32,
    /// `U=`: non-zero for a virtual (Unicode placeholder) placement.
    pub virtual_placement: bool,
    /// `C=`: non-zero to keep the cursor in place after display.
    pub do_not_move_cursor: bool,
    /// `x=`/`y=` on `a=f`: where the frame data lands on the canvas.
    pub frame_dst_pix_x: i32,
    /// See [`Self::frame_dst_pix_x`].
    pub frame_dst_pix_y: i32,
    /// `X=` on `a=f`: replace pixels instead of blending onto the background.
    pub replace_instead_of_blending: bool,
    /// `Y=` on `a=f`: background color, 0xRRGGBBAA (sent as a decimal).
    pub background_color: u32,
    /// `c=` on `a=f`: 1-based index of the background frame.
    pub background_frame: i32,
    /// `c=` on `a=a`: sets the current frame.
    pub current_frame: i32,
    /// `r=` on `a=f`/`a=a`: 1-based index of the frame to edit.
    pub edit_frame: i32,
    /// `z=` on `a=f`/`a=a`: frame gap in ms; negative means gapless.
    pub gap: i32,
    /// `s=` on `a=a`: 1 stop, 2 loading, 3 looping.
    pub animation_state: i32,
    /// `v=` on `a=a`: loop count. Reserved; not enforced.
    pub loops: i32,
}

impl<'a> GraphicsCommand<'a> {
    /// Parse the control data and payload of a command (without the leading
    /// `G`). Returns the command together with any per-key errors; callers
    /// should not execute a command that produced errors.
    pub fn parse(data: &'a [u8]) -> (Self, Vec<GraphicsError>) {
        let mut cmd = Self::default();
        let mut errors = Vec::new();

        let (control, payload) = match data.iter().position(|&b| b == b';') {
            Some(pos) => (&data[..pos], &data[pos + 1..]),
            None => (data, &data[data.len()..]),
        };
        cmd.payload = payload;

        // Split into raw pairs first; the two-pass sweep below needs them
        // all before any polysemous key is interpreted.
        let mut pairs: Vec<(&[u8], &[u8])> = Vec::new();
        for part in control.split(|&b| b == b',') {
            match part.iter().position(|&b| b == b'=') {
                Some(eq) => {
                    if pairs.len() >= MAX_KEY_VALUE_PAIRS {
                        errors.push(GraphicsError::TooManyKeyValuePairs);
                        continue;
                    }
                    pairs.push((&part[..eq], &part[eq + 1..]));
                }
                None => {
                    errors.push(GraphicsError::KeyWithoutValue(printable(part)));
                }
            }
        }

        // First pass: the action and the ids, needed to disambiguate the
        // remaining keys and to address error responses.
        for &(key, value) in &pairs {
            if key == b"a" || key == b"i" || key == b"I" {
                cmd.assign(key, value, &mut errors);
            }
        }
        // Second pass: everything, in command order.
        for &(key, value) in &pairs {
            if key == b"a" || key == b"i" || key == b"I" {
                continue;
            }
            cmd.assign(key, value, &mut errors);
        }

        (cmd, errors)
    }

    fn assign(&mut self, key: &[u8], value: &[u8], errors: &mut Vec<GraphicsError>) {
        if key.len() != 1 {
            errors.push(GraphicsError::UnknownKey(printable(key)));
            return;
        }
        let key = key[0];

        // 'a', 't', 'd' and 'o' take single-character values; the rest take
        // decimal integers.
        let mut char_value = 0u8;
        let mut num = 0i64;
        if matches!(key, b'a' | b't' | b'd' | b'o') {
            if value.len() != 1 {
                errors.push(GraphicsError::SingleCharValueExpected(printable(&[key])));
                return;
            }
            char_value = value[0];
        } else {
            match parse_i64(value) {
                Some(n) => num = n,
                None => {
                    errors.push(GraphicsError::NonNumericValue(printable(&[key])));
                    return;
                }
            }
        }

        match key {
            b'a' => self.action = char_value,
            b't' => self.transmission_medium = char_value,
            b'd' => self.delete_specifier = char_value,
            b'o' => {
                self.compression = char_value;
                if char_value != b'z' {
                    errors.push(GraphicsError::UnsupportedCompression(char_value));
                }
            }
            b'q' => self.quiet = num.clamp(0, 2) as u8,
            b'f' => {
                self.format = clamp_i32(num);
                if !matches!(num, 0 | 24 | 32 | 100) {
                    errors.push(GraphicsError::UnsupportedFormat(num));
                }
            }
            b's' => {
                if self.action == b'a' {
                    self.animation_state = clamp_i32(num);
                } else {
                    self.frame_pix_width = clamp_i32(num);
                }
            }
            b'v' => {
                if self.action == b'a' {
                    self.loops = clamp_i32(num);
                } else {
                    self.frame_pix_height = clamp_i32(num);
                }
            }
            b'i' => self.image_id = clamp_u32(num),
            b'I' => self.image_number = clamp_u32(num),
            b'p' => self.placement_id = clamp_u32(num),
            b'x' => {
                self.src_pix_x = clamp_i32(num);
                self.frame_dst_pix_x = clamp_i32(num);
            }
            b'y' => {
                if self.action == b'f' {
                    self.frame_dst_pix_y = clamp_i32(num);
                } else {
                    self.src_pix_y = clamp_i32(num);
                }
            }
            b'w' => self.src_pix_width = clamp_i32(num),
            b'h' => self.src_pix_height = clamp_i32(num),
            b'c' => {
                if self.action == b'f' {
                    self.background_frame = clamp_i32(num);
                } else if self.action == b'a' {
                    self.current_frame = clamp_i32(num);
                } else {
                    self.columns = clamp_i32(num);
                }
            }
            b'r' => {
                if self.action == b'f' || self.action == b'a' {
                    self.edit_frame = clamp_i32(num);
                } else {
                    self.rows = clamp_i32(num);
                }
            }
            b'm' => {
                self.is_data_transmission = true;
                self.more = num != 0;
            }
            b'S' => self.size = clamp_u32(num),
            b'U' => self.virtual_placement = num != 0,
            b'X' => {
                if self.action == b'f' {
                    self.replace_instead_of_blending = num != 0;
                }
                // Ignored for other actions.
            }
            b'Y' => {
                if self.action == b'f' {
                    self.background_color = clamp_u32(num);
                }
            }
            b'z' => {
                if self.action == b'f' || self.action == b'a' {
                    self.gap = clamp_i32(num);
                }
            }
            b'C' => self.do_not_move_cursor = num != 0,
            _ => errors.push(GraphicsError::UnknownKey(printable(&[key]))),
        }
    }
}

/// Parse a decimal integer with an optional leading minus, saturating on
/// overflow. The whole value must be consumed.
fn parse_i64(value: &[u8]) -> Option<i64> {
    let (negative, digits) = match value.first() {
        Some(b'-') => (true, &value[1..]),
        _ => (false, value),
    };
    if !digits.iter().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let mut magnitude = 0i64;
    for &b in digits {
        magnitude = magnitude.saturating_mul(10).saturating_add(i64::from(b - b'0'));
    }
    Some(if negative { -magnitude } else { magnitude })
}

fn clamp_i32(num: i64) -> i32 {
    num.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}

fn clamp_u32(num: i64) -> u32 {
    num.clamp(0, i64::from(u32::MAX)) as u32
}

/// A printable rendition of raw command bytes for error messages.
fn printable(bytes: &[u8]) -> String {
    bytes
        .iter()
        .take(32)
        .map(|&b| if (0x20..0x7f).contains(&b) { char::from(b) } else { '?' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(data: &[u8]) -> GraphicsCommand<'_> {
        let (cmd, errors) = GraphicsCommand::parse(data);
        assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
        cmd
    }

    #[test]
    fn parse_simple_transmit() {
        let cmd = parse_ok(b"a=T,i=123,s=100,v=50,f=32");
        assert_eq!(cmd.action, b'T');
        assert_eq!(cmd.image_id, 123);
        assert_eq!(cmd.frame_pix_width, 100);
        assert_eq!(cmd.frame_pix_height, 50);
        assert_eq!(cmd.format, 32);
    }

    #[test]
    fn parse_put() {
        let cmd = parse_ok(b"a=p,i=42,p=1,c=10,r=5,x=3,y=4,w=50,h=30");
        assert_eq!(cmd.action, b'p');
        assert_eq!(cmd.placement_id, 1);
        assert_eq!(cmd.columns, 10);
        assert_eq!(cmd.rows, 5);
        assert_eq!(cmd.src_pix_x, 3);
        assert_eq!(cmd.src_pix_y, 4);
        assert_eq!(cmd.src_pix_width, 50);
        assert_eq!(cmd.src_pix_height, 30);
    }

    #[test]
    fn payload_split() {
        let cmd = parse_ok(b"a=t,i=1,m=0;AAAA");
        assert_eq!(cmd.payload, b"AAAA");
        let cmd = parse_ok(b"a=t,i=1,m=1");
        assert_eq!(cmd.payload, b"");
    }

    #[test]
    fn polysemous_keys_frame_transmit() {
        // For a=f: s/v are data size, c is the background frame, r the
        // edit frame, z the gap, x/y the paste offset, Y the background
        // color, X the replace flag.
        let cmd = parse_ok(b"a=f,i=1,s=4,v=2,c=1,r=3,z=-1,x=7,y=8,Y=4278190335,X=1");
        assert_eq!(cmd.frame_pix_width, 4);
        assert_eq!(cmd.frame_pix_height, 2);
        assert_eq!(cmd.background_frame, 1);
        assert_eq!(cmd.edit_frame, 3);
        assert_eq!(cmd.gap, -1);
        assert_eq!(cmd.frame_dst_pix_x, 7);
        assert_eq!(cmd.frame_dst_pix_y, 8);
        assert_eq!(cmd.background_color, 4278190335);
        assert!(cmd.replace_instead_of_blending);
    }

    #[test]
    fn polysemous_keys_animation_control() {
        let cmd = parse_ok(b"a=a,i=1,s=3,v=1,c=2,r=4,z=150");
        assert_eq!(cmd.animation_state, 3);
        assert_eq!(cmd.loops, 1);
        assert_eq!(cmd.current_frame, 2);
        assert_eq!(cmd.edit_frame, 4);
        assert_eq!(cmd.gap, 150);
        // The put-only fields stay untouched.
        assert_eq!(cmd.columns, 0);
        assert_eq!(cmd.rows, 0);
    }

    #[test]
    fn action_after_polysemous_key_still_wins() {
        // `a=` is extracted in the first pass even when it appears last.
        let cmd = parse_ok(b"s=3,c=2,a=a,i=1");
        assert_eq!(cmd.animation_state, 3);
        assert_eq!(cmd.current_frame, 2);
        assert_eq!(cmd.frame_pix_width, 0);
    }

    #[test]
    fn ignored_keys_by_action() {
        // z/X/Y are display-only noise outside of a=f / a=a.
        let cmd = parse_ok(b"a=p,i=1,z=5,X=3,Y=9");
        assert_eq!(cmd.gap, 0);
        assert!(!cmd.replace_instead_of_blending);
        assert_eq!(cmd.background_color, 0);
    }

    #[test]
    fn unknown_key_is_error_but_parse_continues() {
        let (cmd, errors) = GraphicsCommand::parse(b"a=t,i=5,k=1,s=2");
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], GraphicsError::UnknownKey(_)));
        assert_eq!(cmd.image_id, 5);
        assert_eq!(cmd.frame_pix_width, 2);
    }

    #[test]
    fn key_without_value_is_error() {
        let (_, errors) = GraphicsCommand::parse(b"a=t,i");
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], GraphicsError::KeyWithoutValue(_)));
    }

    #[test]
    fn bad_number_is_error() {
        let (_, errors) = GraphicsCommand::parse(b"i=12x4");
        assert!(matches!(errors[0], GraphicsError::NonNumericValue(_)));
    }

    #[test]
    fn single_char_value_enforced() {
        let (_, errors) = GraphicsCommand::parse(b"a=tt");
        assert!(matches!(errors[0], GraphicsError::SingleCharValueExpected(_)));
    }

    #[test]
    fn bad_format_and_compression_reported() {
        let (cmd, errors) = GraphicsCommand::parse(b"a=t,i=1,f=16,o=g");
        assert_eq!(errors.len(), 2);
        assert_eq!(cmd.format, 16);
        assert!(matches!(errors[0], GraphicsError::UnsupportedFormat(16)));
        assert!(matches!(errors[1], GraphicsError::UnsupportedCompression(b'g')));
    }

    #[test]
    fn too_many_pairs_rejected() {
        let mut data = b"a=t".to_vec();
        for i in 0..40 {
            data.extend_from_slice(format!(",i={}", i).as_bytes());
        }
        let (_, errors) = GraphicsCommand::parse(&data);
        assert!(errors.iter().any(|e| matches!(e, GraphicsError::TooManyKeyValuePairs)));
    }

    #[test]
    fn numeric_overflow_saturates() {
        let cmd = parse_ok(b"i=99999999999999999999");
        assert_eq!(cmd.image_id, u32::MAX);
        let cmd = parse_ok(b"a=f,i=1,z=-99999999999999999999");
        assert_eq!(cmd.gap, i32::MIN);
    }

    #[test]
    fn empty_numeric_value_is_zero() {
        let cmd = parse_ok(b"i=1,p=");
        assert_eq!(cmd.placement_id, 0);
    }

    #[test]
    fn chunked_flags() {
        let cmd = parse_ok(b"a=t,i=1,m=1");
        assert!(cmd.is_data_transmission);
        assert!(cmd.more);
        let cmd = parse_ok(b"i=1,m=0");
        assert!(cmd.is_data_transmission);
        assert!(!cmd.more);
        let cmd = parse_ok(b"a=p,i=1");
        assert!(!cmd.is_data_transmission);
    }

    #[test]
    fn quiet_clamped() {
        assert_eq!(parse_ok(b"i=1,q=7").quiet, 2);
    }
}
