//! Shared region header structures.
//!
//! Three `repr(C)` structs live directly in the mapped region and form
//! the cross-process contract: `GlobalHeader` at offset 0, one
//! `ReaderSlot` per registration slot, and one `FrameHeader` at the
//! start of every frame slot. Their sizes and field offsets are pinned
//! by const assertions; changing any of them is a wire format break and
//! requires a `VER_MAJOR` bump.
//!
//! ## Atomic fields
//!
//! Fields that synchronize across processes are declared as atomics in
//! place:
//!
//! - `GlobalHeader::write_index` and `FrameHeader::frame_id` carry the
//!   publish protocol (release store by the server, acquire load by
//!   readers).
//! - `ReaderSlot` fields are written by the owning reader with release
//!   ordering and read by the server with acquire ordering, except
//!   `control_tail` which the server owns.
//!
//! Everything else is plain data written before the release store that
//! publishes it.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use static_assertions::const_assert_eq;

/// Magic bytes identifying a valid shmx region: `"SHMX"`.
pub const SHMX_MAGIC: [u8; 4] = *b"SHMX";

/// Wire format major version. Readers require an exact match.
pub const VER_MAJOR: u16 = 1;

/// Wire format minor version. Accepted in either direction.
pub const VER_MINOR: u16 = 0;

// ─── Global Header ──────────────────────────────────────────────────

/// Region header at offset 0: 192 bytes, cache-line aligned.
///
/// Written once by the server at create time (magic, versions, session
/// id, layout echo, static directory bookkeeping), then mutated only
/// through the atomic fields. Clients and inspectors validate magic and
/// major version before trusting anything else, and cross-check the
/// layout echo against the mapped size.
#[repr(C, align(64))]
pub struct GlobalHeader {
    /// Magic bytes, must equal [`SHMX_MAGIC`].
    pub magic: [u8; 4],
    /// Wire format major version.
    pub ver_major: u16,
    /// Wire format minor version.
    pub ver_minor: u16,
    /// Feature flags, all zero in this version.
    pub flags: u32,
    _pad0: u32,
    /// Nonzero id assigned at create time; all frames of one server
    /// lifetime carry it.
    pub session_id: u64,

    // Layout echo. Clients recompute nothing: the server's geometry is
    // authoritative for the lifetime of the region.
    /// Offset of the static stream directory.
    pub static_offset: u32,
    /// Aligned capacity of the static area.
    pub static_cap: u32,
    /// Offset of the reader slot table.
    pub readers_offset: u32,
    /// Stride between reader slots.
    pub reader_stride: u32,
    /// Number of reader slots.
    pub reader_slots: u32,
    /// Offset of the control ring area (meaningful iff `control_per_reader > 0`).
    pub control_offset: u32,
    /// Control ring capacity per reader, 0 disables control.
    pub control_per_reader: u32,
    /// Stride between per-reader control rings.
    pub control_stride: u32,
    /// Offset of the frame slot area.
    pub slots_offset: u32,
    /// Stride between frame slots.
    pub slot_stride: u32,
    /// Payload capacity of one frame.
    pub frame_bytes_cap: u32,
    /// Number of frame slots.
    pub slots: u32,

    /// Generation counter for the static directory, bumped after any rewrite.
    pub static_gen: AtomicU32,
    /// Encoded byte length of the static directory.
    pub static_used: u32,
    /// Informational count of registered readers.
    pub readers_connected: AtomicU32,
    _pad1: u32,
    /// Total frames ever published. The release store of this field is
    /// the publish point.
    pub write_index: AtomicU64,

    _reserved: [u8; 96],
}

const_assert_eq!(core::mem::size_of::<GlobalHeader>(), 192);
const_assert_eq!(core::mem::align_of::<GlobalHeader>(), 64);

impl GlobalHeader {
    /// Validate magic bytes and major version.
    ///
    /// `ver_minor` is deliberately not checked: minor bumps are wire
    /// compatible in both directions.
    pub fn version_ok(&self) -> bool {
        self.magic == SHMX_MAGIC && self.ver_major == VER_MAJOR
    }

    /// Total region size implied by the layout echo.
    pub fn total_size(&self) -> u64 {
        self.slots_offset as u64 + self.slot_stride as u64 * self.slots as u64
    }
}

// ─── Reader Slot ────────────────────────────────────────────────────

/// One entry of the reader table: 64 bytes, cache-line aligned.
///
/// Ownership is split: the claiming reader writes `in_use` (via CAS),
/// `reader_id`, `last_frame_seen`, `heartbeat_ticks`, and
/// `control_head`; the server writes `control_tail` and may reclaim the
/// slot (CAS `in_use` 1 to 0) once the heartbeat goes stale.
///
/// Invariant: `in_use` is 0 or 1, and while 1, `reader_id` is nonzero
/// and unique across live slots.
#[repr(C, align(64))]
pub struct ReaderSlot {
    /// 1 while a reader owns this slot.
    pub in_use: AtomicU32,
    _pad0: u32,
    /// Nonzero id chosen by the claiming reader.
    pub reader_id: AtomicU64,
    /// Highest frame id this reader has successfully observed.
    pub last_frame_seen: AtomicU64,
    /// Tick stamp of the reader's most recent sign of life.
    pub heartbeat_ticks: AtomicU64,
    /// Control ring write cursor (reader-owned), free-running.
    pub control_head: AtomicU32,
    /// Control ring read cursor (server-owned), free-running.
    pub control_tail: AtomicU32,
    _reserved: [u8; 24],
}

const_assert_eq!(core::mem::size_of::<ReaderSlot>(), 64);
const_assert_eq!(core::mem::align_of::<ReaderSlot>(), 64);

impl ReaderSlot {
    /// Whether a reader currently owns this slot.
    #[inline]
    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire) == 1
    }
}

// ─── Frame Header ───────────────────────────────────────────────────

/// Header at the start of every frame slot: 40 bytes.
///
/// `frame_id == 0` marks a slot that has never been written. The server
/// fills the plain fields first, issues a release fence, then stores
/// `frame_id` with release ordering; a reader that acquire-loads a
/// nonzero `frame_id` therefore sees a fully written header and
/// payload.
#[repr(C, align(8))]
pub struct FrameHeader {
    /// Publisher's post-increment write index at publish time (1-based),
    /// 0 for a never-written slot.
    pub frame_id: AtomicU64,
    /// Session the frame belongs to.
    pub session_id: u64,
    /// Caller-supplied simulation clock at publish time.
    pub sim_time: f64,
    /// Number of TLV records in the payload.
    pub tlv_count: u32,
    /// Encoded payload length in bytes.
    pub payload_bytes: u32,
    /// CRC32C over the payload bytes.
    pub crc32c: u32,
    _pad: u32,
}

const_assert_eq!(core::mem::size_of::<FrameHeader>(), 40);
const_assert_eq!(core::mem::align_of::<FrameHeader>(), 8);
