//! Frame payload codec: TLV records and CRC32C validation.
//!
//! A frame's payload is a sequence of TLV records, one per appended
//! stream: `{ stream_id: u32, elem_count: u32, bytes: u32, pad: u32 }`
//! followed by `bytes` of element data, padded to 8 bytes. Integers are
//! little-endian. The CRC32C (Castagnoli) of the whole payload is
//! stored in the frame header and re-checked by every observer, so a
//! torn or corrupted slot is never handed to application code.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{fence, Ordering};

use crate::header::{FrameHeader, GlobalHeader};
use crate::layout::{align_up, Layout};

/// Bytes of one TLV record header.
pub const TLV_HEADER_BYTES: u32 = 16;

/// CRC32C (Castagnoli) over payload bytes.
#[inline]
pub fn payload_crc(payload: &[u8]) -> u32 {
    crc32c::crc32c(payload)
}

// ─── Frame assembly (server side) ───────────────────────────────────

/// In-progress frame handed out by `Server::begin_frame`.
///
/// Appends accumulate TLV records in the slot's payload area; nothing
/// is observable to readers until [`FrameMut::publish`] runs the
/// release protocol. Dropping the handle without publishing abandons
/// the frame; the slot is reused by the next `begin_frame`.
pub struct FrameMut<'a> {
    pub(crate) global: *const GlobalHeader,
    pub(crate) header: *mut FrameHeader,
    pub(crate) payload: *mut u8,
    pub(crate) cap: u32,
    pub(crate) frame_id: u64,
    pub(crate) session_id: u64,
    pub(crate) dir: &'a HashMap<u32, u32>,
    pub(crate) used: u32,
    pub(crate) tlv_count: u32,
    pub(crate) _borrow: PhantomData<&'a mut ()>,
}

impl<'a> FrameMut<'a> {
    /// Append one stream as a TLV record.
    ///
    /// Returns `false` without touching the frame when `stream_id` is
    /// not in the directory, `bytes_per_elem` disagrees with the
    /// directory, `data` is not exactly `elem_count * bytes_per_elem`
    /// bytes, or the record would exceed the frame capacity.
    pub fn append_stream(
        &mut self,
        stream_id: u32,
        data: &[u8],
        elem_count: u32,
        bytes_per_elem: u32,
    ) -> bool {
        match self.dir.get(&stream_id) {
            Some(&dir_bytes) if dir_bytes == bytes_per_elem => {}
            _ => return false,
        }
        let bytes = match elem_count.checked_mul(bytes_per_elem) {
            Some(b) if b as usize == data.len() => b,
            _ => return false,
        };
        let record = TLV_HEADER_BYTES + align_up(bytes, 8);
        if record > self.cap - self.used {
            return false;
        }

        // Exclusive writer: the payload area is only ever touched
        // through this handle until publish.
        let dst = unsafe {
            std::slice::from_raw_parts_mut(self.payload.add(self.used as usize), record as usize)
        };
        dst[0..4].copy_from_slice(&stream_id.to_le_bytes());
        dst[4..8].copy_from_slice(&elem_count.to_le_bytes());
        dst[8..12].copy_from_slice(&bytes.to_le_bytes());
        dst[12..16].copy_from_slice(&0u32.to_le_bytes());
        dst[16..16 + data.len()].copy_from_slice(data);
        dst[16 + data.len()..].fill(0);

        self.used += record;
        self.tlv_count += 1;
        true
    }

    /// Bytes of payload already appended.
    #[inline]
    pub fn payload_bytes(&self) -> u32 {
        self.used
    }

    /// TLV records already appended.
    #[inline]
    pub fn tlv_count(&self) -> u32 {
        self.tlv_count
    }

    /// Publish the frame and return its frame id.
    ///
    /// Release protocol, in order: plain stores of the header body,
    /// release fence, release store of the slot's `frame_id`, release
    /// store of the global `write_index`. The last store is the publish
    /// point; a reader that observes it acquires everything before it.
    pub fn publish(self, sim_time: f64) -> u64 {
        let payload = unsafe { std::slice::from_raw_parts(self.payload, self.used as usize) };
        let crc = payload_crc(payload);

        unsafe {
            (*self.header).session_id = self.session_id;
            (*self.header).sim_time = sim_time;
            (*self.header).tlv_count = self.tlv_count;
            (*self.header).payload_bytes = self.used;
            (*self.header).crc32c = crc;
        }
        fence(Ordering::Release);
        unsafe {
            (*self.header)
                .frame_id
                .store(self.frame_id, Ordering::Release);
            (*self.global)
                .write_index
                .store(self.frame_id, Ordering::Release);
        }
        self.frame_id
    }
}

// ─── Frame observation (reader side) ────────────────────────────────

/// A validated view of one published frame.
///
/// The payload slice borrows the shared region: it stays valid only
/// until the observing handle's next `latest` call, and only while the
/// server has not lapped the slot. Copy out anything that must outlive
/// the observation.
#[derive(Debug)]
pub struct FrameView<'a> {
    /// Frame id, always nonzero.
    pub frame_id: u64,
    /// Session id stamped into the frame.
    pub session_id: u64,
    /// Simulation clock at publish time.
    pub sim_time: f64,
    /// Number of TLV records.
    pub tlv_count: u32,
    /// Raw payload bytes.
    pub payload: &'a [u8],
    /// True when the frame's session differs from the one recorded at open.
    pub session_mismatch: bool,
}

/// Borrowed element data of one stream inside a frame.
#[derive(Debug, Clone, Copy)]
pub struct StreamSlice<'a> {
    /// Element count declared by the record.
    pub elem_count: u32,
    /// Element bytes.
    pub bytes: &'a [u8],
}

/// All TLV records of one frame, decoded.
#[derive(Debug, Default)]
pub struct DecodedFrame<'a> {
    /// `(stream_id, data)` pairs in append order.
    pub streams: Vec<(u32, StreamSlice<'a>)>,
}

impl<'a> DecodedFrame<'a> {
    /// Data of the stream with `stream_id`, if present.
    pub fn stream(&self, stream_id: u32) -> Option<StreamSlice<'a>> {
        self.streams
            .iter()
            .find(|(id, _)| *id == stream_id)
            .map(|(_, s)| *s)
    }
}

/// Walk the TLV records of a frame view.
///
/// Record headers and lengths are bounds-checked against the payload;
/// the walk stops at the first malformed record, returning what
/// decoded cleanly. With a passing CRC this only triggers on a
/// publisher bug, not on torn reads.
pub fn decode_frame<'a>(view: &FrameView<'a>) -> DecodedFrame<'a> {
    let mut out = DecodedFrame::default();
    let payload = view.payload;
    let mut off = 0usize;

    for _ in 0..view.tlv_count {
        let Some(remaining) = payload.len().checked_sub(off) else {
            break;
        };
        if remaining < TLV_HEADER_BYTES as usize {
            break;
        }
        let stream_id = read_u32(payload, off);
        let elem_count = read_u32(payload, off + 4);
        let bytes = read_u32(payload, off + 8) as usize;
        let data_start = off + TLV_HEADER_BYTES as usize;

        let Some(data_end) = data_start.checked_add(bytes) else {
            break;
        };
        if data_end > payload.len() {
            break;
        }

        out.streams.push((
            stream_id,
            StreamSlice {
                elem_count,
                bytes: &payload[data_start..data_end],
            },
        ));
        off = data_start + align_up(bytes as u32, 8) as usize;
    }
    out
}

/// Observe the latest published frame in a mapped region.
///
/// Implements the acquire side of the publish protocol: acquire-load
/// `write_index`, locate the newest slot, acquire-load its `frame_id`,
/// read the header body and payload, then re-load `write_index` and
/// discard the read if the writer has lapped the slot in the meantime.
/// Retries are bounded at twice the ring depth; a region under
/// pathological write pressure yields `None` rather than spinning.
///
/// The CRC check runs on every attempt, so a torn read that slips past
/// the lap check is still rejected.
///
/// # Safety
/// `base` must be the base of a live mapping whose geometry matches
/// `layout`. The returned view borrows that mapping; the caller
/// chooses the lifetime and must not outlive the mapping.
pub(crate) unsafe fn observe_latest<'a>(base: *const u8, layout: &Layout) -> Option<FrameView<'a>> {
    let global = &*(base as *const GlobalHeader);
    let slots = layout.slots as u64;
    let retries = (2 * layout.slots).max(4);

    for _ in 0..retries {
        let w = global.write_index.load(Ordering::Acquire);
        if w == 0 {
            return None;
        }
        let idx = ((w - 1) % slots) as u32;
        let slot_off = layout.frame_slot_offset(idx);
        let fh = &*(base.add(slot_off) as *const FrameHeader);

        let frame_id = fh.frame_id.load(Ordering::Acquire);
        if frame_id == 0 {
            return None;
        }

        let payload_bytes = fh.payload_bytes;
        let header_ok = payload_bytes <= layout.frame_bytes_cap;
        let payload_len = payload_bytes.min(layout.frame_bytes_cap) as usize;
        let payload = std::slice::from_raw_parts(
            base.add(slot_off + core::mem::size_of::<FrameHeader>()),
            payload_len,
        );
        let crc_ok = header_ok && payload_crc(payload) == fh.crc32c;
        let session_id = fh.session_id;
        let sim_time = fh.sim_time;
        let tlv_count = fh.tlv_count;

        // The slot may have been recycled while we were reading it; a
        // lap shows up as write_index moving a full ring past frame_id.
        let w_after = global.write_index.load(Ordering::Acquire);
        if w_after.wrapping_sub(frame_id) >= slots {
            continue;
        }
        if !crc_ok || !header_ok {
            if w_after != w {
                // Racing a publish into this slot; try again.
                continue;
            }
            return None;
        }

        return Some(FrameView {
            frame_id,
            session_id,
            sim_time,
            tlv_count,
            payload,
            session_mismatch: false,
        });
    }
    None
}

#[inline]
fn read_u32(bytes: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
}
