//! Read-only diagnostics facade.
//!
//! The inspector maps a region without claiming a reader slot or
//! touching any counter, so attaching one is invisible to both sides
//! of the transport. It exposes the layout echo, the reader table, the
//! stream directory, and per-slot frame views with CRC verdicts.

use std::sync::atomic::Ordering;

use serde::Serialize;

use crate::backing::{MapMode, MappedRegion, PosixShm, ShmBacking};
use crate::error::{ShmxError, ShmxResult};
use crate::frame::{decode_frame, observe_latest, payload_crc, DecodedFrame, FrameView};
use crate::header::{FrameHeader, GlobalHeader, VER_MAJOR};
use crate::layout::Layout;
use crate::server::{snapshot_reader_table, ReaderInfo};
use crate::static_dir::{decode_dir, DirEntry};

/// Point-in-time view of one frame slot, published or not.
///
/// Unlike `latest`, a slot view deliberately skips the lap recheck:
/// the inspector wants to show in-flight and corrupted slots, and the
/// `checksum_ok` verdict tells the two apart.
#[derive(Debug, Clone, Serialize)]
pub struct SlotInfo {
    /// Slot index.
    pub slot: u32,
    /// Frame id stored in the slot, 0 if never written.
    pub frame_id: u64,
    /// Session id stamped into the slot.
    pub session_id: u64,
    /// Simulation clock at publish time.
    pub sim_time: f64,
    /// TLV record count.
    pub tlv_count: u32,
    /// Payload length claimed by the slot header, clamped to capacity.
    pub payload_bytes: u32,
    /// Whether the payload CRC matches the header.
    pub checksum_ok: bool,
}

/// Read-only handle to a shmx region.
pub struct Inspector {
    region: MappedRegion,
    layout: Layout,
}

impl Inspector {
    /// Open a region read-only under the default POSIX backing.
    pub fn open(name: &str) -> ShmxResult<Self> {
        Self::open_with(&PosixShm, name)
    }

    /// Open a region read-only under a caller-supplied backing.
    pub fn open_with(backing: &dyn ShmBacking, name: &str) -> ShmxResult<Self> {
        let region = backing.open(name, MapMode::ReadOnly)?;
        if region.len() < core::mem::size_of::<GlobalHeader>() {
            return Err(ShmxError::RegionTruncated {
                name: name.to_string(),
                actual: region.len(),
                required: core::mem::size_of::<GlobalHeader>() as u64,
            });
        }
        let header = unsafe { &*(region.base() as *const GlobalHeader) };
        if !header.version_ok() {
            return Err(ShmxError::VersionMismatch {
                name: name.to_string(),
                magic_ok: header.magic == crate::header::SHMX_MAGIC,
                theirs: header.ver_major,
                ours: VER_MAJOR,
            });
        }
        let layout = Layout::from_header(header);
        if !layout.is_self_consistent() {
            return Err(ShmxError::HeaderCorrupt {
                name: name.to_string(),
            });
        }
        if layout.total_size() > region.len() as u64 {
            return Err(ShmxError::RegionTruncated {
                name: name.to_string(),
                actual: region.len(),
                required: layout.total_size(),
            });
        }
        Ok(Self { region, layout })
    }

    /// The region's global header.
    pub fn header(&self) -> &GlobalHeader {
        unsafe { &*(self.region.base() as *const GlobalHeader) }
    }

    /// The region geometry as echoed by the server.
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Decode the stream directory. Returns an empty vector when the
    /// directory fails validation; diagnostics must not error out on a
    /// half-written region.
    pub fn decode_static_dir(&self) -> Vec<DirEntry> {
        let header = self.header();
        let used = header.static_used as usize;
        if used > self.layout.static_cap as usize {
            return Vec::new();
        }
        let bytes = unsafe {
            std::slice::from_raw_parts(
                self.region.base().add(self.layout.static_offset as usize) as *const u8,
                used,
            )
        };
        decode_dir(bytes).unwrap_or_default()
    }

    /// Snapshot the reader table.
    pub fn snapshot_readers(&self) -> Vec<ReaderInfo> {
        snapshot_reader_table(self.region.base() as *const u8, &self.layout)
    }

    /// Inspect frame slot `i`, whatever state it is in.
    pub fn slot_view(&self, i: u32) -> Option<SlotInfo> {
        if i >= self.layout.slots {
            return None;
        }
        let base = self.region.base() as *const u8;
        let slot_off = self.layout.frame_slot_offset(i);
        let fh = unsafe { &*(base.add(slot_off) as *const FrameHeader) };

        let frame_id = fh.frame_id.load(Ordering::Acquire);
        let claimed = fh.payload_bytes;
        let payload_bytes = claimed.min(self.layout.frame_bytes_cap);
        let payload = unsafe {
            std::slice::from_raw_parts(
                base.add(slot_off + core::mem::size_of::<FrameHeader>()),
                payload_bytes as usize,
            )
        };
        let checksum_ok = claimed <= self.layout.frame_bytes_cap
            && (frame_id == 0 || payload_crc(payload) == fh.crc32c);

        Some(SlotInfo {
            slot: i,
            frame_id,
            session_id: fh.session_id,
            sim_time: fh.sim_time,
            tlv_count: fh.tlv_count,
            payload_bytes,
            checksum_ok,
        })
    }

    /// Observe the latest published frame without registering as a
    /// reader. Same validation protocol as the client, no side effects.
    pub fn latest(&self) -> Option<FrameView<'_>> {
        unsafe { observe_latest(self.region.base() as *const u8, &self.layout) }
    }

    /// Decode the TLV records of an observed frame.
    pub fn decode<'a>(view: &FrameView<'a>) -> DecodedFrame<'a> {
        decode_frame(view)
    }
}
