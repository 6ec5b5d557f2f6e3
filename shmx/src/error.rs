//! Error types for shmx operations

use thiserror::Error;

/// Errors surfaced by shmx.
///
/// Transient conditions (a frame observation losing a race with the
/// writer, a full control ring, an unknown stream id on append) are
/// reported through `bool`/`Option` returns on the hot paths instead;
/// this enum covers the failures a caller cannot recover locally.
#[derive(Error, Debug)]
pub enum ShmxError {
    /// The shared-memory backing failed to create, open, or destroy a region.
    #[error("shm backing failed for '{name}' during {op}: {source}")]
    ShmBackingFailed {
        /// Region name handed to the backing.
        name: String,
        /// Operation that failed (create, open, destroy).
        op: &'static str,
        /// Underlying errno.
        source: nix::errno::Errno,
    },

    /// Configuration rejected by layout computation.
    #[error("invalid config: {reason}")]
    InvalidConfig {
        /// Human-readable reason.
        reason: String,
    },

    /// Region magic missing or major version differs from ours.
    #[error("version mismatch on '{name}': magic {magic_ok}, major {theirs} vs {ours}")]
    VersionMismatch {
        /// Region name.
        name: String,
        /// Whether the magic bytes matched.
        magic_ok: bool,
        /// Major version read from the region header.
        theirs: u16,
        /// Major version compiled into this crate.
        ours: u16,
    },

    /// Encoded stream directory exceeds the static area capacity.
    #[error("static directory needs {needed} bytes, capacity is {cap}")]
    StaticOverflow {
        /// Bytes the encoded directory requires.
        needed: usize,
        /// Configured static capacity.
        cap: u32,
    },

    /// Stream directory bytes in the region fail bounds validation.
    #[error("static directory corrupt at byte {offset}")]
    StaticCorrupt {
        /// Byte offset where validation failed.
        offset: usize,
    },

    /// Every reader slot is claimed.
    #[error("no reader slot available ({reader_slots} slots all in use)")]
    NoSlotAvailable {
        /// Total reader slots in the region.
        reader_slots: u32,
    },

    /// Region header's layout echo fails internal consistency checks.
    #[error("region '{name}' header disagrees with its own geometry")]
    HeaderCorrupt {
        /// Region name.
        name: String,
    },

    /// Mapped region is smaller than the layout recorded in its header.
    #[error("region '{name}' is {actual} bytes, layout requires {required}")]
    RegionTruncated {
        /// Region name.
        name: String,
        /// Mapped size in bytes.
        actual: usize,
        /// Size the layout echo requires.
        required: u64,
    },
}

/// Result type for shmx operations.
pub type ShmxResult<T> = Result<T, ShmxError>;
