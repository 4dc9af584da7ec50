#![forbid(unsafe_code)]
//! Error types for OublieFS.
//!
//! # Error Taxonomy
//!
//! OublieFS uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `ofs-types` | On-disk format violations detected during byte parsing |
//! | Runtime | `OfsError` | `ofs-error` (this crate) | User-facing errors for CLI and API consumers |
//!
//! `ofs-error` is intentionally independent of `ofs-types` and `ofs-ondisk` to
//! avoid cyclic dependencies. The conversion from `ParseError` to `OfsError`
//! happens in the crates that touch the device: a parse failure during volume
//! open becomes `Format` (wrong or damaged image, known before the volume is
//! live); a parse failure while reading live metadata becomes `Corruption`
//! with the block number for triage.
//!
//! # errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`OfsError::to_errno`].
//! The mapping is exhaustive (no wildcard arms) so adding a new variant is a
//! compile error until its errno is assigned.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | `EIO` (or the wrapped raw OS errno) |
//! | `Corruption` | `EIO` |
//! | `Format` | `EINVAL` |
//! | `InvalidArgument` | `EINVAL` |
//! | `NoSpace` | `ENOSPC` |
//! | `NotFound` | `ENOENT` |
//! | `AlreadyExists` | `EEXIST` |
//! | `NotEmpty` | `ENOTEMPTY` |
//! | `NameTooLong` | `ENAMETOOLONG` |
//! | `TooManyEntries` | `EMLINK` |
//! | `ReadOnly` | `EROFS` |
//!
//! `TooManyEntries` is the "directory is full and nothing could be evicted"
//! outcome. It keeps `EMLINK` so callers can tell a full fixed-capacity
//! directory apart from a device with no free blocks (`ENOSPC`).

use thiserror::Error;

/// Unified error type for all OublieFS operations.
#[derive(Debug, Error)]
pub enum OfsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk metadata corruption detected at a known block.
    ///
    /// Used when live metadata reads produce invalid data (truncated
    /// structures, out-of-range field values, a bitmap freeing an
    /// already-free resource).
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// Invalid on-disk format (wrong filesystem type, impossible geometry).
    ///
    /// Used during volume open and mkfs when the image is structurally
    /// unusable before any operation runs.
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Unsupported mode, flag, or malformed name (only regular files and
    /// directories exist; rename exchange/whiteout variants are rejected;
    /// names cannot be empty, `.`, `..`, or contain `/` or NUL).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No free blocks or inodes available.
    #[error("no space left on device")]
    NoSpace,

    /// File, directory, or other named object not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Target name already present (create or rename collision).
    #[error("file exists")]
    AlreadyExists,

    /// rmdir on a non-empty directory.
    #[error("directory not empty")]
    NotEmpty,

    /// Filename exceeds the fixed on-disk name slot.
    #[error("name too long")]
    NameTooLong,

    /// Directory entry table is full and eviction freed nothing usable.
    #[error("too many entries in directory")]
    TooManyEntries,

    /// Write attempted through a read-only device or volume.
    #[error("read-only filesystem")]
    ReadOnly,
}

impl OfsError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive, every variant has an explicit arm. Adding
    /// a new variant without updating this function is a compile error.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } => libc::EIO,
            Self::Format(_) | Self::InvalidArgument(_) => libc::EINVAL,
            Self::NoSpace => libc::ENOSPC,
            Self::NotFound(_) => libc::ENOENT,
            Self::AlreadyExists => libc::EEXIST,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::TooManyEntries => libc::EMLINK,
            Self::ReadOnly => libc::EROFS,
        }
    }
}

/// Result alias using `OfsError`.
pub type Result<T> = std::result::Result<T, OfsError>;
