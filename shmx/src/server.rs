//! Region owner: creates the shared region and publishes frames.
//!
//! The server is the single writer. It owns the region for its whole
//! lifetime, encodes the stream directory once at create time, hands
//! out [`FrameMut`] handles for the slot the write cursor points at,
//! drains every reader's control ring, and reclaims reader slots whose
//! heartbeat has gone stale. The region is unlinked when the server is
//! destroyed or dropped.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::{info, warn};

use crate::backing::{MappedRegion, PosixShm, ShmBacking};
use crate::control::{ring_drain, ControlMsg};
use crate::error::ShmxResult;
use crate::frame::FrameMut;
use crate::header::{FrameHeader, GlobalHeader, ReaderSlot, SHMX_MAGIC, VER_MAJOR, VER_MINOR};
use crate::layout::{compute_layout, Config, Layout};
use crate::static_dir::{encode_dir, StaticStream};

/// Diagnostic snapshot of one reader slot.
///
/// Fields are loaded one by one without any cross-field consistency
/// guarantee; this is a monitoring view, not a protocol input.
#[derive(Debug, Clone, Serialize)]
pub struct ReaderInfo {
    /// Slot index.
    pub index: u32,
    /// Whether the slot is claimed.
    pub in_use: bool,
    /// Reader id, 0 when unclaimed.
    pub reader_id: u64,
    /// Highest frame id the reader reported observing.
    pub last_frame_seen: u64,
    /// Tick stamp of the reader's last sign of life.
    pub heartbeat_ticks: u64,
}

/// Owner of a shmx region and single frame publisher.
pub struct Server {
    region: MappedRegion,
    backing: Box<dyn ShmBacking>,
    layout: Layout,
    name: String,
    session_id: u64,
    dir: HashMap<u32, u32>,
    destroyed: bool,
}

impl Server {
    /// Create a region under the default POSIX backing.
    pub fn create(cfg: Config, streams: &[StaticStream]) -> ShmxResult<Self> {
        Self::create_with(Box::new(PosixShm), cfg, streams)
    }

    /// Create a region under a caller-supplied backing.
    ///
    /// Computes the layout, asks the backing for a zeroed region of the
    /// total size, writes the global header with a fresh nonzero
    /// session id, and encodes the stream directory into the static
    /// area.
    pub fn create_with(
        backing: Box<dyn ShmBacking>,
        cfg: Config,
        streams: &[StaticStream],
    ) -> ShmxResult<Self> {
        let layout = compute_layout(&cfg)?;
        let encoded = encode_dir(streams, layout.static_cap)?;

        let region = backing.create(&cfg.name, layout.total_size() as usize)?;
        let session_id = fresh_session_id();

        // Exclusive access: the region was just created and nobody else
        // can have opened it before the header below is complete.
        let header = unsafe { &mut *(region.base() as *mut GlobalHeader) };
        header.magic = SHMX_MAGIC;
        header.ver_major = VER_MAJOR;
        header.ver_minor = VER_MINOR;
        header.flags = 0;
        header.session_id = session_id;
        header.static_offset = layout.static_offset;
        header.static_cap = layout.static_cap;
        header.readers_offset = layout.readers_offset;
        header.reader_stride = layout.reader_stride;
        header.reader_slots = layout.reader_slots;
        header.control_offset = layout.control_offset;
        header.control_per_reader = layout.control_per_reader;
        header.control_stride = layout.control_stride;
        header.slots_offset = layout.slots_offset;
        header.slot_stride = layout.slot_stride;
        header.frame_bytes_cap = layout.frame_bytes_cap;
        header.slots = layout.slots;
        header.static_used = encoded.len() as u32;

        unsafe {
            std::ptr::copy_nonoverlapping(
                encoded.as_ptr(),
                region.base().add(layout.static_offset as usize),
                encoded.len(),
            );
        }
        header
            .static_gen
            .store(1, std::sync::atomic::Ordering::Release);

        let dir = streams
            .iter()
            .map(|s| (s.stream_id, s.bytes_per_elem))
            .collect();

        info!(
            name = %cfg.name,
            session_id,
            slots = layout.slots,
            reader_slots = layout.reader_slots,
            total_bytes = layout.total_size(),
            "shmx region created"
        );

        Ok(Self {
            region,
            backing,
            layout,
            name: cfg.name,
            session_id,
            dir,
            destroyed: false,
        })
    }

    /// The region's global header.
    pub fn header(&self) -> &GlobalHeader {
        unsafe { &*(self.region.base() as *const GlobalHeader) }
    }

    /// The region geometry.
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Session id assigned at create time.
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Start assembling the next frame.
    ///
    /// The returned handle points at slot `write_index mod slots` with
    /// an empty payload. Publish it or drop it; a dropped handle's
    /// partial writes are invisible to readers and the slot is reused
    /// by the next call.
    pub fn begin_frame(&mut self) -> FrameMut<'_> {
        let w = self
            .header()
            .write_index
            .load(std::sync::atomic::Ordering::Relaxed);
        let idx = (w % self.layout.slots as u64) as u32;
        let slot_off = self.layout.frame_slot_offset(idx);

        FrameMut {
            global: self.region.base() as *const GlobalHeader,
            header: unsafe { self.region.base().add(slot_off) } as *mut FrameHeader,
            payload: unsafe {
                self.region
                    .base()
                    .add(slot_off + core::mem::size_of::<FrameHeader>())
            },
            cap: self.layout.frame_bytes_cap,
            frame_id: w + 1,
            session_id: self.session_id,
            dir: &self.dir,
            used: 0,
            tlv_count: 0,
            _borrow: std::marker::PhantomData,
        }
    }

    /// Drain pending control messages from every reader ring.
    ///
    /// Rings are visited in slot order; the per-ring quota is
    /// `max_msgs` split evenly across rings with pending data, so one
    /// chatty reader cannot starve the rest. A ring with a malformed
    /// record is reset to empty and logged.
    pub fn poll_control(&mut self, max_msgs: usize) -> Vec<ControlMsg> {
        let mut out = Vec::new();
        if self.layout.control_per_reader == 0 || max_msgs == 0 {
            return out;
        }

        let pending: Vec<u32> = (0..self.layout.reader_slots)
            .filter(|&i| {
                let slot = self.reader_slot(i);
                slot.is_in_use()
                    || slot
                        .control_head
                        .load(std::sync::atomic::Ordering::Acquire)
                        != slot
                            .control_tail
                            .load(std::sync::atomic::Ordering::Relaxed)
            })
            .collect();
        if pending.is_empty() {
            return out;
        }

        let quota = (max_msgs / pending.len()).max(1);
        for i in pending {
            let slot = self.reader_slot(i);
            let reader_id = slot.reader_id.load(std::sync::atomic::Ordering::Acquire);
            let budget = quota.min(max_msgs - out.len());
            let ring = unsafe {
                self.region
                    .base()
                    .add(self.layout.control_ring_offset(i)) as *const u8
            };
            let poisoned = unsafe {
                ring_drain(
                    ring,
                    self.layout.control_per_reader,
                    slot,
                    reader_id,
                    budget,
                    &mut out,
                )
            };
            if poisoned {
                warn!(slot = i, reader_id, "control ring poisoned, reset to empty");
            }
            if out.len() >= max_msgs {
                break;
            }
        }
        out
    }

    /// Reclaim reader slots whose heartbeat is older than
    /// `timeout_ticks`. Returns the number of slots reclaimed.
    ///
    /// Reaping races benignly with a reader's own `close`: whichever
    /// side wins the `in_use` CAS performs the cleanup, the other sees
    /// a free slot.
    pub fn reap_stale_readers(&mut self, now_ticks: u64, timeout_ticks: u64) -> u32 {
        use std::sync::atomic::Ordering;

        let mut reaped = 0;
        for i in 0..self.layout.reader_slots {
            let slot = self.reader_slot(i);
            if slot.in_use.load(Ordering::Acquire) != 1 {
                continue;
            }
            let hb = slot.heartbeat_ticks.load(Ordering::Acquire);
            if now_ticks.saturating_sub(hb) <= timeout_ticks {
                continue;
            }
            if slot
                .in_use
                .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }
            let reader_id = slot.reader_id.swap(0, Ordering::AcqRel);
            slot.last_frame_seen.store(0, Ordering::Relaxed);
            slot.control_head.store(0, Ordering::Relaxed);
            slot.control_tail.store(0, Ordering::Release);
            self.header()
                .readers_connected
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                    v.checked_sub(1)
                })
                .ok();
            info!(slot = i, reader_id, "reaped stale reader");
            reaped += 1;
        }
        reaped
    }

    /// Diagnostic snapshot of the reader table.
    pub fn snapshot_readers(&self) -> Vec<ReaderInfo> {
        snapshot_reader_table(self.region.base(), &self.layout)
    }

    /// Informational count of registered readers.
    pub fn readers_connected(&self) -> u32 {
        self.header()
            .readers_connected
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Unlink the region. Attached clients keep their stale mappings
    /// and must tolerate the region disappearing.
    pub fn destroy(mut self) {
        self.destroy_inner();
    }

    fn destroy_inner(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        match self.backing.destroy(&self.name) {
            Ok(()) => info!(name = %self.name, "shmx region destroyed"),
            Err(e) => warn!(name = %self.name, error = %e, "region destroy failed"),
        }
    }

    fn reader_slot(&self, i: u32) -> &ReaderSlot {
        unsafe {
            &*(self.region.base().add(self.layout.reader_slot_offset(i)) as *const ReaderSlot)
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.destroy_inner();
    }
}

/// Load every reader slot field-by-field for diagnostics.
pub(crate) fn snapshot_reader_table(base: *const u8, layout: &Layout) -> Vec<ReaderInfo> {
    use std::sync::atomic::Ordering;

    (0..layout.reader_slots)
        .map(|i| {
            let slot =
                unsafe { &*(base.add(layout.reader_slot_offset(i)) as *const ReaderSlot) };
            ReaderInfo {
                index: i,
                in_use: slot.in_use.load(Ordering::Acquire) == 1,
                reader_id: slot.reader_id.load(Ordering::Acquire),
                last_frame_seen: slot.last_frame_seen.load(Ordering::Acquire),
                heartbeat_ticks: slot.heartbeat_ticks.load(Ordering::Acquire),
            }
        })
        .collect()
}

/// Nonzero session id from the wall clock, in nanoseconds.
fn fresh_session_id() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(1);
    nanos.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::static_dir::ElemType;

    fn demo_config(name: &str) -> Config {
        Config {
            name: format!("{name}_{}", std::process::id()),
            slots: 4,
            reader_slots: 4,
            static_bytes_cap: 1024,
            frame_bytes_cap: 4096,
            control_per_reader: 256,
        }
    }

    fn demo_streams() -> Vec<StaticStream> {
        vec![
            StaticStream::scalar(42, ElemType::U64, 8, "tick_seq"),
            StaticStream::scalar(43, ElemType::F64, 8, "tick_sim"),
        ]
    }

    #[test]
    fn create_writes_header_and_directory() {
        let server = Server::create(demo_config("srv_create"), &demo_streams()).unwrap();
        let h = server.header();
        assert!(h.version_ok());
        assert!(h.session_id > 0);
        assert_eq!(h.slots, 4);
        assert!(h.static_used > 0);
        assert_eq!(
            h.static_gen.load(std::sync::atomic::Ordering::Acquire),
            1
        );
        assert_eq!(
            h.write_index.load(std::sync::atomic::Ordering::Acquire),
            0
        );
    }

    #[test]
    fn static_overflow_fails_create() {
        let mut cfg = demo_config("srv_overflow");
        cfg.static_bytes_cap = 8;
        // Layout rounds the cap up to a cache line; ask for more than
        // even the rounded capacity can hold.
        let wide: Vec<StaticStream> = (0..16)
            .map(|i| StaticStream::scalar(i, ElemType::U32, 4, "padding_stream_name"))
            .collect();
        assert!(matches!(
            Server::create(cfg, &wide),
            Err(crate::ShmxError::StaticOverflow { .. })
        ));
    }

    #[test]
    fn publish_bumps_write_index_and_frame_id() {
        let mut server = Server::create(demo_config("srv_publish"), &demo_streams()).unwrap();

        let mut fm = server.begin_frame();
        assert!(fm.append_stream(42, &1u64.to_le_bytes(), 1, 8));
        let fid = fm.publish(0.5);
        assert_eq!(fid, 1);
        assert_eq!(
            server
                .header()
                .write_index
                .load(std::sync::atomic::Ordering::Acquire),
            1
        );

        let fm = server.begin_frame();
        let fid = fm.publish(1.0);
        assert_eq!(fid, 2);
    }

    #[test]
    fn append_rejects_unknown_stream_and_bad_elem_size() {
        let mut server = Server::create(demo_config("srv_append"), &demo_streams()).unwrap();
        let mut fm = server.begin_frame();

        assert!(!fm.append_stream(99, &[0u8; 8], 1, 8));
        assert!(!fm.append_stream(42, &[0u8; 8], 1, 4));
        assert!(!fm.append_stream(42, &[0u8; 4], 1, 8));
        assert_eq!(fm.tlv_count(), 0);
        assert_eq!(fm.payload_bytes(), 0);
    }

    #[test]
    fn append_rejects_payload_past_capacity() {
        let mut cfg = demo_config("srv_cap");
        cfg.frame_bytes_cap = 64;
        let streams = vec![StaticStream::scalar(1, ElemType::U8, 1, "blob")];
        let mut server = Server::create(cfg, &streams).unwrap();

        let mut fm = server.begin_frame();
        assert!(fm.append_stream(1, &[0u8; 32], 32, 1));
        assert!(!fm.append_stream(1, &[0u8; 32], 32, 1));
        assert_eq!(fm.tlv_count(), 1);
    }

    #[test]
    fn abandoned_frame_is_not_published() {
        let mut server = Server::create(demo_config("srv_abandon"), &demo_streams()).unwrap();
        {
            let mut fm = server.begin_frame();
            fm.append_stream(42, &7u64.to_le_bytes(), 1, 8);
            // dropped without publish
        }
        assert_eq!(
            server
                .header()
                .write_index
                .load(std::sync::atomic::Ordering::Acquire),
            0
        );
    }

    #[test]
    fn snapshot_covers_every_slot() {
        let server = Server::create(demo_config("srv_snapshot"), &demo_streams()).unwrap();
        let snap = server.snapshot_readers();
        assert_eq!(snap.len(), 4);
        assert!(snap.iter().all(|r| !r.in_use && r.reader_id == 0));
    }
}
