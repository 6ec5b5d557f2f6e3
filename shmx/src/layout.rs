//! Region geometry: pure layout computation from a [`Config`].
//!
//! Both sides of the transport interpret the mapped bytes through the
//! same [`Layout`], so the computation is deterministic and platform
//! independent: segment starts are 64-byte aligned, record headers are
//! 8-byte aligned, and no `size_of` of a non-`repr(C)` type enters the
//! arithmetic.

use serde::Serialize;

use crate::error::{ShmxError, ShmxResult};
use crate::frame::TLV_HEADER_BYTES;
use crate::header::{FrameHeader, GlobalHeader, ReaderSlot};

/// Cache line size; every segment start is aligned to it.
pub const CACHE_LINE_SIZE: u32 = 64;

/// Alignment of record headers inside the static area and frame payloads.
pub const RECORD_ALIGN: u32 = 8;

/// Hard cap on total region size (1 GiB).
pub const MAX_REGION_SIZE: u64 = 1 << 30;

/// Round `v` up to the next multiple of `align`. `align` must be a
/// power of two.
#[inline]
pub const fn align_up(v: u32, align: u32) -> u32 {
    (v + align - 1) & !(align - 1)
}

/// Inputs to region creation.
#[derive(Debug, Clone)]
pub struct Config {
    /// Opaque region identifier handed to the shm backing.
    pub name: String,
    /// Frame ring depth, at least 1.
    pub slots: u32,
    /// Reader table size, at least 1.
    pub reader_slots: u32,
    /// Capacity reserved for the encoded stream directory.
    pub static_bytes_cap: u32,
    /// Payload capacity of one frame.
    pub frame_bytes_cap: u32,
    /// Control ring bytes per reader; 0 disables control rings.
    pub control_per_reader: u32,
}

/// Derived region geometry; a pure function of [`Config`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Layout {
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
    /// Offset of the control ring area.
    pub control_offset: u32,
    /// Control ring capacity per reader.
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
}

impl Layout {
    /// Total region size in bytes.
    #[inline]
    pub fn total_size(&self) -> u64 {
        self.slots_offset as u64 + self.slot_stride as u64 * self.slots as u64
    }

    /// Byte offset of reader slot `i`.
    #[inline]
    pub fn reader_slot_offset(&self, i: u32) -> usize {
        self.readers_offset as usize + i as usize * self.reader_stride as usize
    }

    /// Byte offset of the control ring belonging to reader slot `i`.
    #[inline]
    pub fn control_ring_offset(&self, i: u32) -> usize {
        self.control_offset as usize + i as usize * self.control_stride as usize
    }

    /// Byte offset of frame slot `i`.
    #[inline]
    pub fn frame_slot_offset(&self, i: u32) -> usize {
        self.slots_offset as usize + i as usize * self.slot_stride as usize
    }

    /// Whether this layout is one `compute_layout` could have produced.
    ///
    /// Attaching sides run this against the header echo before trusting
    /// any offset: a header whose geometry disagrees with its own
    /// counts and capacities is rejected rather than dereferenced.
    pub fn is_self_consistent(&self) -> bool {
        let cfg = Config {
            name: String::new(),
            slots: self.slots,
            reader_slots: self.reader_slots,
            static_bytes_cap: self.static_cap,
            frame_bytes_cap: self.frame_bytes_cap,
            control_per_reader: self.control_per_reader,
        };
        matches!(compute_layout(&cfg), Ok(recomputed) if recomputed == *self)
    }

    /// Reconstruct the layout from the echo a server wrote into the
    /// region header.
    pub fn from_header(h: &GlobalHeader) -> Self {
        Self {
            static_offset: h.static_offset,
            static_cap: h.static_cap,
            readers_offset: h.readers_offset,
            reader_stride: h.reader_stride,
            reader_slots: h.reader_slots,
            control_offset: h.control_offset,
            control_per_reader: h.control_per_reader,
            control_stride: h.control_stride,
            slots_offset: h.slots_offset,
            slot_stride: h.slot_stride,
            frame_bytes_cap: h.frame_bytes_cap,
            slots: h.slots,
        }
    }
}

/// Compute the region geometry for `cfg`.
///
/// Fails with `InvalidConfig` when a count is zero, the frame capacity
/// cannot hold a single record header, or the total size overflows
/// [`MAX_REGION_SIZE`].
pub fn compute_layout(cfg: &Config) -> ShmxResult<Layout> {
    if cfg.slots == 0 {
        return Err(invalid("slots must be at least 1"));
    }
    if cfg.reader_slots == 0 {
        return Err(invalid("reader_slots must be at least 1"));
    }
    if cfg.frame_bytes_cap < TLV_HEADER_BYTES {
        return Err(invalid("frame_bytes_cap cannot hold a single record"));
    }
    if cfg.static_bytes_cap < 4 {
        return Err(invalid("static_bytes_cap cannot hold the entry count"));
    }

    let header_size = core::mem::size_of::<GlobalHeader>() as u32;
    let reader_size = core::mem::size_of::<ReaderSlot>() as u32;
    let frame_header_size = core::mem::size_of::<FrameHeader>() as u32;

    let static_offset = align_up(header_size, CACHE_LINE_SIZE);
    let static_cap = align_up(cfg.static_bytes_cap, CACHE_LINE_SIZE);

    let readers_offset = checked_add(static_offset, static_cap)?;
    let reader_stride = align_up(reader_size, CACHE_LINE_SIZE);
    let readers_total = checked_mul(reader_stride, cfg.reader_slots)?;

    let control_offset = checked_add(readers_offset, readers_total)?;
    let control_stride = if cfg.control_per_reader > 0 {
        align_up(cfg.control_per_reader, CACHE_LINE_SIZE)
    } else {
        0
    };
    let control_total = checked_mul(control_stride, cfg.reader_slots)?;

    let slots_offset = checked_add(control_offset, control_total)?;
    let slot_body = checked_add(frame_header_size, cfg.frame_bytes_cap)?;
    let slot_stride = align_up(slot_body, CACHE_LINE_SIZE);

    let layout = Layout {
        static_offset,
        static_cap,
        readers_offset,
        reader_stride,
        reader_slots: cfg.reader_slots,
        control_offset,
        control_per_reader: cfg.control_per_reader,
        control_stride,
        slots_offset,
        slot_stride,
        frame_bytes_cap: cfg.frame_bytes_cap,
        slots: cfg.slots,
    };

    if layout.total_size() > MAX_REGION_SIZE {
        return Err(invalid("total region size exceeds the 1 GiB cap"));
    }

    Ok(layout)
}

fn invalid(reason: &str) -> ShmxError {
    ShmxError::InvalidConfig {
        reason: reason.to_string(),
    }
}

fn checked_add(a: u32, b: u32) -> ShmxResult<u32> {
    a.checked_add(b)
        .ok_or_else(|| invalid("segment offset overflows u32"))
}

fn checked_mul(a: u32, b: u32) -> ShmxResult<u32> {
    a.checked_mul(b)
        .ok_or_else(|| invalid("segment size overflows u32"))
}
