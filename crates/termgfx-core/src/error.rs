//! Error types for graphics protocol operations.
//!
//! Every error renders as the protocol's `E<kind>: <text>` response string,
//! so `Display` output can be embedded in a response verbatim.

use std::fmt;

/// Coarse error families, matching the `E<kind>` prefixes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// `ENOENT` - image, frame, or placement not found.
    NotFound,
    /// `EINVAL` - bad key, bad value, unknown action, inconsistent parameters.
    InvalidParameters,
    /// `EBADF` - file read, copy, or decode failed.
    FileAccess,
    /// `EIO` - cannot create a cache file.
    CacheIo,
    /// `EFBIG` - upload exceeds the per-file limit.
    FileTooBig,
}

/// Error type for graphics protocol operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphicsError {
    /// The targeted image does not exist.
    ImageNotFound,
    /// The targeted frame does not exist (1-based index).
    FrameNotFound(i32),
    /// Neither an image id nor an image number was supplied.
    NoImageIdentity,
    /// The command carried no action and was not an upload continuation.
    NoAction,
    /// Unsupported `a=` action.
    UnsupportedAction(u8),
    /// Unsupported `t=` transmission medium.
    UnsupportedMedium(u8),
    /// A key the protocol does not define (or of the wrong length).
    UnknownKey(String),
    /// A `key` with no `=value` part.
    KeyWithoutValue(String),
    /// A value that should have been a decimal integer but was not.
    NonNumericValue(String),
    /// A value for `a`, `t`, `d`, or `o` that was not a single character.
    SingleCharValueExpected(String),
    /// More key/value pairs than the parser accepts.
    TooManyKeyValuePairs,
    /// `f=` value outside {0, 24, 32, 100}.
    UnsupportedFormat(i64),
    /// `o=` value other than `z`.
    UnsupportedCompression(u8),
    /// Compression requested for a non-raw format.
    CompressionRequiresRawFormat,
    /// `s=` value on `a=a` outside {1, 2, 3}.
    InvalidAnimationState(i64),
    /// Decoding or composing the frame failed.
    LoadFailed,
    /// The source file of a file transmission could not be used.
    StatFailed(String),
    /// The source file could not be copied into the cache directory.
    CopyFailed,
    /// The cache file could not be created.
    CacheFileCreation,
    /// The upload exceeded the per-file size limit (the limit is attached).
    OverSizeLimit(u64),
    /// The uploaded size does not match the declared `S=` size.
    UnexpectedSize {
        /// Bytes actually received.
        actual: u64,
        /// Bytes announced by the client.
        expected: u64,
    },
    /// A terminating chunk arrived but no upload was in progress.
    AppendTargetMissing,
}

impl GraphicsError {
    /// The error family this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ImageNotFound | Self::FrameNotFound(_) | Self::AppendTargetMissing => {
                ErrorKind::NotFound
            }
            Self::NoImageIdentity
            | Self::NoAction
            | Self::UnsupportedAction(_)
            | Self::UnsupportedMedium(_)
            | Self::UnknownKey(_)
            | Self::KeyWithoutValue(_)
            | Self::NonNumericValue(_)
            | Self::SingleCharValueExpected(_)
            | Self::TooManyKeyValuePairs
            | Self::UnsupportedFormat(_)
            | Self::UnsupportedCompression(_)
            | Self::CompressionRequiresRawFormat
            | Self::InvalidAnimationState(_)
            | Self::UnexpectedSize { .. } => ErrorKind::InvalidParameters,
            Self::LoadFailed | Self::StatFailed(_) | Self::CopyFailed => ErrorKind::FileAccess,
            Self::CacheFileCreation => ErrorKind::CacheIo,
            Self::OverSizeLimit(_) => ErrorKind::FileTooBig,
        }
    }
}

impl fmt::Display for GraphicsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ImageNotFound => write!(f, "ENOENT: image not found"),
            Self::FrameNotFound(idx) => write!(f, "ENOENT: frame {} not found", idx),
            Self::NoImageIdentity => write!(
                f,
                "EINVAL: neither image id nor image number are specified or both are zero"
            ),
            Self::NoAction => write!(f, "EINVAL: no action specified"),
            Self::UnsupportedAction(a) => {
                write!(f, "EINVAL: unsupported action: {}", char::from(*a))
            }
            Self::UnsupportedMedium(t) => write!(
                f,
                "EINVAL: transmission medium '{}' is not supported",
                char::from(*t)
            ),
            Self::UnknownKey(key) => write!(f, "EINVAL: unsupported key: {}", key),
            Self::KeyWithoutValue(key) => write!(f, "EINVAL: key without value: {}", key),
            Self::NonNumericValue(key) => {
                write!(f, "EINVAL: could not parse number value: {}", key)
            }
            Self::SingleCharValueExpected(key) => write!(
                f,
                "EINVAL: value of 'a', 't', 'd' or 'o' must be a single char: {}",
                key
            ),
            Self::TooManyKeyValuePairs => write!(f, "EINVAL: too many key-value pairs"),
            Self::UnsupportedFormat(v) => {
                write!(f, "EINVAL: unsupported format specification: {}", v)
            }
            Self::UnsupportedCompression(c) => write!(
                f,
                "EINVAL: unsupported compression specification: {}",
                char::from(*c)
            ),
            Self::CompressionRequiresRawFormat => write!(
                f,
                "EINVAL: compression is supported only for raw pixel data (f=32 or f=24)"
            ),
            Self::InvalidAnimationState(v) => {
                write!(f, "EINVAL: invalid animation state: {}", v)
            }
            Self::LoadFailed => write!(f, "EBADF: could not load image"),
            Self::StatFailed(reason) => write!(f, "EBADF: {}", reason),
            Self::CopyFailed => {
                write!(f, "EBADF: could not copy the image to the cache dir")
            }
            Self::CacheFileCreation => write!(f, "EIO: could not create a file for image"),
            Self::OverSizeLimit(limit) => write!(
                f,
                "EFBIG: the size of the uploaded image exceeded the image size limit {}",
                limit
            ),
            Self::UnexpectedSize { actual, expected } => write!(
                f,
                "EINVAL: the size of the uploaded image {} doesn't match the expected size {}",
                actual, expected
            ),
            Self::AppendTargetMissing => {
                write!(f, "ENOENT: could not find the image to append data to")
            }
        }
    }
}

impl std::error::Error for GraphicsError {}
