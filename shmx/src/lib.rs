//! # shmx: single-producer / many-reader shared-memory frame transport
//!
//! shmx publishes structured, fixed-schema frames (collections of named
//! typed streams) between co-located processes at high rates. One
//! [`Server`] creates and owns a named shared region; any number of
//! [`Client`]s attach and consume the latest published frame with
//! bounded staleness; an [`Inspector`] attaches read-only for
//! diagnostics without disturbing either side.
//!
//! ## Region anatomy
//!
//! ```text
//! ┌──────────────┬─────────────┬──────────────┬───────────────┬─────────────────┐
//! │ GlobalHeader │ StaticArea  │ ReaderTable  │ ControlRings  │ FrameRing       │
//! │ magic, ids,  │ stream      │ one slot per │ one SPSC ring │ `slots` fixed   │
//! │ write_index  │ directory   │ reader       │ per reader    │ frame buffers   │
//! └──────────────┴─────────────┴──────────────┴───────────────┴─────────────────┘
//! ```
//!
//! All segment starts are 64-byte aligned and every on-wire integer is
//! little-endian, so producers and consumers built by different
//! compilers (or languages) interpret the region identically.
//!
//! ## Publish/observe protocol
//!
//! The server assembles a frame in slot `write_index mod slots`, then
//! publishes with a release pair: header body, release fence, release
//! store of the slot's `frame_id`, release store of the global
//! `write_index`. A reader that acquire-loads `write_index >= k` and
//! matches slot `(k-1) mod slots`'s `frame_id` is guaranteed a fully
//! written frame; a post-read recheck of `write_index` catches the
//! writer lapping the slot mid-read, and a CRC32C over the payload
//! catches everything else. Readers may miss frames under pressure but
//! never observe a torn one.
//!
//! No operation blocks on the other side: publishing, observing, and
//! control messaging are wait-free with bounded retries.
//!
//! ## Example
//!
//! ```no_run
//! use shmx::{Client, Config, ElemType, Server, StaticStream};
//!
//! # fn main() -> Result<(), shmx::ShmxError> {
//! let cfg = Config {
//!     name: "demo".to_string(),
//!     slots: 4,
//!     reader_slots: 16,
//!     static_bytes_cap: 4096,
//!     frame_bytes_cap: 65536,
//!     control_per_reader: 4096,
//! };
//! let streams = vec![
//!     StaticStream::scalar(42, ElemType::U64, 8, "tick_seq"),
//!     StaticStream::scalar(43, ElemType::F64, 8, "tick_sim"),
//! ];
//! let mut server = Server::create(cfg, &streams)?;
//!
//! let mut frame = server.begin_frame();
//! frame.append_stream(42, &0u64.to_le_bytes(), 1, 8);
//! frame.publish(0.0);
//!
//! let mut client = Client::open("demo")?;
//! if let Some(view) = client.latest()? {
//!     let decoded = Client::decode(&view);
//!     let seq = decoded.stream(42).unwrap();
//!     assert_eq!(seq.bytes, 0u64.to_le_bytes());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Lifecycle and failure
//!
//! The server is the unique owner: dropping it unlinks the region.
//! Clients hold independent mappings and must tolerate the region
//! disappearing underneath them; a session id mismatch (server
//! restarted) raises [`Client::session_mismatch`] and the client
//! reopens. The server reclaims reader slots whose heartbeat exceeds a
//! caller-chosen timeout, so crashed readers cannot pin resources.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod backing;
pub mod client;
pub mod control;
pub mod error;
pub mod frame;
pub mod header;
pub mod inspector;
pub mod layout;
pub mod server;
pub mod static_dir;

pub use backing::{MapMode, MappedRegion, PosixShm, ShmBacking};
pub use client::{Client, StaticState};
pub use control::{ControlMsg, CTRL_BYE, CTRL_HEARTBEAT, CTRL_HELLO};
pub use error::{ShmxError, ShmxResult};
pub use frame::{DecodedFrame, FrameMut, FrameView, StreamSlice};
pub use header::{FrameHeader, GlobalHeader, ReaderSlot, VER_MAJOR, VER_MINOR};
pub use inspector::{Inspector, SlotInfo};
pub use layout::{align_up, compute_layout, Config, Layout};
pub use server::{ReaderInfo, Server};
pub use static_dir::{DirEntry, ElemType, StaticStream, StreamLayout};

use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock tick source used for heartbeats, in nanoseconds.
///
/// Reap timeouts compare stamps from this clock, so servers and
/// clients on the same host agree on staleness without negotiating a
/// time base.
pub fn now_ticks() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Initialize compact tracing output for tools and demos.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
