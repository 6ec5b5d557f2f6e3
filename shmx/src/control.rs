//! Per-reader control rings: small reader-to-server messages.
//!
//! Each reader slot owns one SPSC byte ring of `control_per_reader`
//! bytes. Records are `{ type: u32, length: u32 }` followed by
//! `length` payload bytes padded to 4; integers are little-endian.
//! The cursors live in the reader slot: `control_head` is written only
//! by the owning reader (release on publish), `control_tail` only by
//! the server (release after consume). Both are free-running and
//! interpreted modulo the capacity, so `head - tail` is the number of
//! bytes in flight.
//!
//! A record whose declared length cannot fit the ring marks the ring
//! poisoned: the server resets `control_tail = control_head` and keeps
//! going. The reader is not deregistered.

use std::sync::atomic::Ordering;

use crate::header::ReaderSlot;
use crate::layout::align_up;

/// Demo control code: client hello, payload `{ver_major: u32, ver_minor: u32}`.
pub const CTRL_HELLO: u32 = 0x4845_4C4F;
/// Demo control code: liveness ping, payload is a `u64` tick stamp.
pub const CTRL_HEARTBEAT: u32 = 0x4842_5254;
/// Demo control code: orderly goodbye, empty payload.
pub const CTRL_BYE: u32 = 0x4259_455F;

/// Control codes with the high bit set are reserved.
pub const CTRL_RESERVED_MASK: u32 = 0x8000_0000;

/// Bytes of one control record header.
pub const CONTROL_HEADER_BYTES: u32 = 8;

/// One message drained from a reader's control ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMsg {
    /// Id of the reader that sent the message.
    pub reader_id: u64,
    /// Application message code.
    pub msg_type: u32,
    /// Payload bytes.
    pub data: Vec<u8>,
}

/// Enqueue one record into a reader's ring. Reader side of the SPSC pair.
///
/// Returns `false` when the ring lacks space for the whole record.
/// Never blocks.
///
/// # Safety
/// `base` must point at this reader's ring of `cap` bytes inside a
/// live mapping, and the caller must be the single owner of the
/// slot's `control_head`.
pub(crate) unsafe fn ring_send(
    base: *mut u8,
    cap: u32,
    slot: &ReaderSlot,
    msg_type: u32,
    data: &[u8],
) -> bool {
    if data.len() > u32::MAX as usize {
        return false;
    }
    let record = CONTROL_HEADER_BYTES + align_up(data.len() as u32, 4);
    let head = slot.control_head.load(Ordering::Relaxed);
    let tail = slot.control_tail.load(Ordering::Acquire);
    let free = cap - head.wrapping_sub(tail);
    if record > free {
        return false;
    }

    ring_copy_in(base, cap, head, &msg_type.to_le_bytes());
    ring_copy_in(base, cap, head.wrapping_add(4), &(data.len() as u32).to_le_bytes());
    ring_copy_in(base, cap, head.wrapping_add(8), data);

    slot.control_head
        .store(head.wrapping_add(record), Ordering::Release);
    true
}

/// Drain up to `max` records from a reader's ring into `out`. Server
/// side of the SPSC pair.
///
/// Returns `true` when the ring was poisoned (a record declared an
/// impossible length); the ring is then reset to empty.
///
/// # Safety
/// `base` must point at this reader's ring of `cap` bytes inside a
/// live mapping, and the caller must be the single owner of the
/// slot's `control_tail`.
pub(crate) unsafe fn ring_drain(
    base: *const u8,
    cap: u32,
    slot: &ReaderSlot,
    reader_id: u64,
    max: usize,
    out: &mut Vec<ControlMsg>,
) -> bool {
    let head = slot.control_head.load(Ordering::Acquire);
    let mut tail = slot.control_tail.load(Ordering::Relaxed);
    let mut drained = 0usize;

    while drained < max {
        let pending = head.wrapping_sub(tail);
        if pending == 0 {
            break;
        }
        if pending < CONTROL_HEADER_BYTES {
            // The reader publishes whole records; a fractional header
            // means the cursors no longer agree.
            slot.control_tail.store(head, Ordering::Release);
            return true;
        }

        let mut hdr = [0u8; 8];
        ring_copy_out(base, cap, tail, &mut hdr);
        let msg_type = u32::from_le_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]);
        let length = u32::from_le_bytes([hdr[4], hdr[5], hdr[6], hdr[7]]);

        if length > cap {
            slot.control_tail.store(head, Ordering::Release);
            return true;
        }
        let record = CONTROL_HEADER_BYTES + align_up(length, 4);
        if record > pending {
            slot.control_tail.store(head, Ordering::Release);
            return true;
        }

        let mut data = vec![0u8; length as usize];
        ring_copy_out(base, cap, tail.wrapping_add(8), &mut data);

        tail = tail.wrapping_add(record);
        slot.control_tail.store(tail, Ordering::Release);

        out.push(ControlMsg {
            reader_id,
            msg_type,
            data,
        });
        drained += 1;
    }
    false
}

/// Copy `src` into the ring at free-running position `pos`, wrapping
/// at the capacity boundary.
unsafe fn ring_copy_in(base: *mut u8, cap: u32, pos: u32, src: &[u8]) {
    let at = (pos % cap) as usize;
    let first = src.len().min(cap as usize - at);
    std::ptr::copy_nonoverlapping(src.as_ptr(), base.add(at), first);
    if first < src.len() {
        std::ptr::copy_nonoverlapping(src.as_ptr().add(first), base, src.len() - first);
    }
}

/// Copy ring bytes at free-running position `pos` into `dst`, wrapping
/// at the capacity boundary.
unsafe fn ring_copy_out(base: *const u8, cap: u32, pos: u32, dst: &mut [u8]) {
    let at = (pos % cap) as usize;
    let first = dst.len().min(cap as usize - at);
    std::ptr::copy_nonoverlapping(base.add(at), dst.as_mut_ptr(), first);
    if first < dst.len() {
        std::ptr::copy_nonoverlapping(base, dst.as_mut_ptr().add(first), dst.len() - first);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_slot() -> ReaderSlot {
        unsafe { core::mem::zeroed() }
    }

    #[test]
    fn send_then_drain_roundtrip() {
        let mut ring = vec![0u8; 64];
        let slot = fresh_slot();
        let payload = [1u8, 0, 0, 0, 0, 0, 0, 0];

        assert!(unsafe { ring_send(ring.as_mut_ptr(), 64, &slot, CTRL_HELLO, &payload) });

        let mut out = Vec::new();
        let poisoned =
            unsafe { ring_drain(ring.as_ptr(), 64, &slot, 9, 16, &mut out) };
        assert!(!poisoned);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].reader_id, 9);
        assert_eq!(out[0].msg_type, CTRL_HELLO);
        assert_eq!(out[0].data, payload);
    }

    #[test]
    fn messages_stay_fifo_across_wrap() {
        let mut ring = vec![0u8; 32];
        let slot = fresh_slot();
        let mut expect = Vec::new();

        // Keep the ring churning well past several wraparounds.
        let mut next = 0u8;
        for _ in 0..40 {
            while unsafe { ring_send(ring.as_mut_ptr(), 32, &slot, CTRL_HEARTBEAT, &[next]) } {
                expect.push(next);
                next = next.wrapping_add(1);
            }
            let mut out = Vec::new();
            assert!(!unsafe { ring_drain(ring.as_ptr(), 32, &slot, 1, 2, &mut out) });
            for msg in out {
                assert_eq!(msg.data, vec![expect.remove(0)]);
            }
        }
    }

    #[test]
    fn full_ring_rejects_then_accepts_after_drain() {
        let mut ring = vec![0u8; 32];
        let slot = fresh_slot();

        // Each empty-payload record is exactly 8 bytes; four fill the ring.
        for _ in 0..4 {
            assert!(unsafe { ring_send(ring.as_mut_ptr(), 32, &slot, CTRL_BYE, &[]) });
        }
        assert!(!unsafe { ring_send(ring.as_mut_ptr(), 32, &slot, CTRL_BYE, &[]) });

        let mut out = Vec::new();
        assert!(!unsafe { ring_drain(ring.as_ptr(), 32, &slot, 1, 1, &mut out) });
        assert_eq!(out.len(), 1);
        assert!(unsafe { ring_send(ring.as_mut_ptr(), 32, &slot, CTRL_BYE, &[]) });
    }

    #[test]
    fn oversized_record_rejected_on_send() {
        let mut ring = vec![0u8; 32];
        let slot = fresh_slot();
        assert!(!unsafe { ring_send(ring.as_mut_ptr(), 32, &slot, CTRL_HELLO, &[0u8; 64]) });
    }

    #[test]
    fn bogus_length_poisons_the_ring() {
        let mut ring = vec![0u8; 64];
        let slot = fresh_slot();

        // Forge a record claiming more bytes than the ring holds.
        ring[0..4].copy_from_slice(&CTRL_HELLO.to_le_bytes());
        ring[4..8].copy_from_slice(&1024u32.to_le_bytes());
        slot.control_head.store(8, Ordering::Release);

        let mut out = Vec::new();
        let poisoned =
            unsafe { ring_drain(ring.as_ptr(), 64, &slot, 1, 16, &mut out) };
        assert!(poisoned);
        assert!(out.is_empty());
        // Reset to empty: tail caught up with head.
        assert_eq!(
            slot.control_tail.load(Ordering::Relaxed),
            slot.control_head.load(Ordering::Relaxed)
        );
    }
}
