//! Consumer facade: observes the latest frame and talks back.
//!
//! A client maps an existing region, validates magic and major
//! version, and then observes frames with bounded staleness. On first
//! use it claims one reader slot (its registration and heartbeat
//! record) and keeps it until `close` or drop; the server may reclaim
//! the slot if the client stops showing signs of life.
//!
//! Frame views borrow the shared mapping. They are valid until the
//! next `latest` call and only while the server has not lapped the
//! slot; anything longer-lived must be copied out.

use std::sync::atomic::Ordering;

use tracing::{debug, warn};

use crate::backing::{MapMode, MappedRegion, PosixShm, ShmBacking};
use crate::control::ring_send;
use crate::error::{ShmxError, ShmxResult};
use crate::frame::{decode_frame, observe_latest, DecodedFrame, FrameView};
use crate::header::{GlobalHeader, ReaderSlot, VER_MAJOR};
use crate::layout::Layout;
use crate::now_ticks;
use crate::static_dir::{decode_dir, DirEntry};

/// Locally cached copy of the stream directory.
#[derive(Debug, Default)]
pub struct StaticState {
    /// Directory generation this cache was decoded from.
    pub gen: u32,
    /// Decoded entries.
    pub dir: Vec<DirEntry>,
}

/// Read-side handle to a shmx region.
pub struct Client {
    region: MappedRegion,
    layout: Layout,
    name: String,
    session_id: u64,
    reader_index: Option<u32>,
    reader_id: u64,
    last_frame_seen: u64,
    session_mismatch: bool,
}

impl Client {
    /// Open an existing region under the default POSIX backing.
    pub fn open(name: &str) -> ShmxResult<Self> {
        Self::open_with(&PosixShm, name)
    }

    /// Open an existing region under a caller-supplied backing.
    ///
    /// Verifies magic and exact major version (minor differences are
    /// accepted in either direction), cross-checks the header's layout
    /// echo against the mapped size, and records the session id.
    pub fn open_with(backing: &dyn ShmBacking, name: &str) -> ShmxResult<Self> {
        let region = backing.open(name, MapMode::ReadWrite)?;
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

        let session_id = header.session_id;
        debug!(name, session_id, "client attached");

        Ok(Self {
            region,
            layout,
            name: name.to_string(),
            session_id,
            reader_index: None,
            reader_id: 0,
            last_frame_seen: 0,
            session_mismatch: false,
        })
    }

    /// The region's global header.
    pub fn header(&self) -> &GlobalHeader {
        unsafe { &*(self.region.base() as *const GlobalHeader) }
    }

    /// The region geometry as echoed by the server.
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Session id recorded when this handle attached.
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// True once a frame or the header carried a different session id
    /// than the one recorded at open. The right response is to close
    /// and reopen.
    pub fn session_mismatch(&self) -> bool {
        self.session_mismatch
    }

    /// Reader id of the claimed slot, 0 before the first claim.
    pub fn reader_id(&self) -> u64 {
        self.reader_id
    }

    /// Re-read the stream directory if its generation changed.
    ///
    /// Returns `true` when `state` was refreshed. A directory that
    /// fails validation leaves `state` untouched and returns `false`.
    pub fn refresh_static(&self, state: &mut StaticState) -> bool {
        let header = self.header();
        let gen = header.static_gen.load(Ordering::Acquire);
        if gen == state.gen {
            return false;
        }
        let used = header.static_used as usize;
        if used > self.layout.static_cap as usize {
            return false;
        }
        let bytes = unsafe {
            std::slice::from_raw_parts(
                self.region.base().add(self.layout.static_offset as usize),
                used,
            )
        };
        match decode_dir(bytes) {
            Ok(dir) => {
                state.dir = dir;
                state.gen = gen;
                true
            }
            Err(e) => {
                warn!(name = %self.name, error = %e, "stream directory rejected");
                false
            }
        }
    }

    /// Observe the newest published frame.
    ///
    /// Claims a reader slot on first use. Returns `Ok(None)` when no
    /// frame is published yet, the newest slot was lapped faster than
    /// the bounded retry could catch it, or the CRC check failed. On
    /// success the claimed slot's `last_frame_seen` and heartbeat are
    /// updated.
    ///
    /// A frame carrying a foreign session id is not delivered; the
    /// [`Client::session_mismatch`] flag is raised instead.
    pub fn latest(&mut self) -> ShmxResult<Option<FrameView<'_>>> {
        let slot_index = self.claim_reader_slot()?;
        let base = self.region.base() as *const u8;

        let Some(view) = (unsafe { observe_latest(base, &self.layout) }) else {
            return Ok(None);
        };

        let header = unsafe { &*(base as *const GlobalHeader) };
        if view.session_id != self.session_id || header.session_id != self.session_id {
            self.session_mismatch = true;
            return Ok(None);
        }
        if view.frame_id < self.last_frame_seen {
            // A frame id moving backwards within one session can only
            // be a stale mapping; never hand it out.
            return Ok(None);
        }

        let slot = self.reader_slot(slot_index);
        slot.last_frame_seen.store(view.frame_id, Ordering::Release);
        slot.heartbeat_ticks.store(now_ticks(), Ordering::Release);
        self.last_frame_seen = view.frame_id;

        Ok(Some(view))
    }

    /// Decode the TLV records of an observed frame.
    pub fn decode<'a>(view: &FrameView<'a>) -> DecodedFrame<'a> {
        decode_frame(view)
    }

    /// Enqueue a control message for the server.
    ///
    /// Claims a reader slot on first use. Returns `false` when control
    /// rings are disabled, no reader slot could be claimed, or the ring
    /// lacks space. Never blocks.
    pub fn control_send(&mut self, msg_type: u32, data: &[u8]) -> bool {
        if self.layout.control_per_reader == 0 {
            return false;
        }
        let slot_index = match self.claim_reader_slot() {
            Ok(i) => i,
            Err(e) => {
                warn!(name = %self.name, error = %e, "control send without reader slot");
                return false;
            }
        };
        let slot = self.reader_slot(slot_index);
        let ring = unsafe {
            self.region
                .base()
                .add(self.layout.control_ring_offset(slot_index))
        };
        unsafe { ring_send(ring, self.layout.control_per_reader, slot, msg_type, data) }
    }

    /// Release the claimed reader slot and unmap.
    pub fn close(mut self) {
        self.release_reader_slot();
    }

    /// Claim the first free reader slot, remembering it for the
    /// lifetime of this handle.
    fn claim_reader_slot(&mut self) -> ShmxResult<u32> {
        if let Some(i) = self.reader_index {
            return Ok(i);
        }
        for i in 0..self.layout.reader_slots {
            let slot = self.reader_slot(i);
            if slot
                .in_use
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            // The CAS made us the owner; reset the slot before the id
            // becomes visible to the server.
            slot.last_frame_seen.store(0, Ordering::Relaxed);
            slot.control_head.store(0, Ordering::Relaxed);
            slot.control_tail.store(0, Ordering::Relaxed);
            slot.heartbeat_ticks.store(now_ticks(), Ordering::Relaxed);

            let reader_id = fresh_reader_id();
            slot.reader_id.store(reader_id, Ordering::Release);
            self.header()
                .readers_connected
                .fetch_add(1, Ordering::Relaxed);

            self.reader_index = Some(i);
            self.reader_id = reader_id;
            self.last_frame_seen = 0;
            debug!(name = %self.name, slot = i, reader_id, "reader slot claimed");
            return Ok(i);
        }
        Err(ShmxError::NoSlotAvailable {
            reader_slots: self.layout.reader_slots,
        })
    }

    /// Give the claimed slot back, unless the server reaped it first.
    fn release_reader_slot(&mut self) {
        let Some(i) = self.reader_index.take() else {
            return;
        };
        let slot = self.reader_slot(i);
        // Only release a slot that is still ours; after a reap the
        // same index may already belong to another reader.
        if slot.reader_id.load(Ordering::Acquire) != self.reader_id {
            return;
        }
        if slot
            .in_use
            .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            slot.reader_id.store(0, Ordering::Release);
            self.header()
                .readers_connected
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1))
                .ok();
            debug!(name = %self.name, slot = i, "reader slot released");
        }
    }

    fn reader_slot(&self, i: u32) -> &ReaderSlot {
        unsafe {
            &*(self.region.base().add(self.layout.reader_slot_offset(i)) as *const ReaderSlot)
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.release_reader_slot();
    }
}

/// Nonzero random reader id.
fn fresh_reader_id() -> u64 {
    loop {
        let id: u64 = rand::random();
        if id != 0 {
            return id;
        }
    }
}
