//! # shmx probe
//!
//! Read-only diagnostic view of a live shmx region: header summary,
//! region map, reader table, per-slot checksum verdicts, and the
//! latest frame's streams. Attaching the probe is invisible to the
//! server and its clients; it claims no reader slot and touches no
//! counter.
//!
//! ```bash
//! # One-shot table dump
//! shmx_probe shmx_demo
//!
//! # Machine-readable snapshot
//! shmx_probe shmx_demo --json
//!
//! # Refresh twice a second until interrupted
//! shmx_probe shmx_demo --watch 500
//! ```

use std::sync::atomic::Ordering;
use std::time::Duration;

use clap::Parser;
use serde::Serialize;
use shmx::{DirEntry, Inspector, Layout, ReaderInfo, SlotInfo};

/// Read-only diagnostic probe for shmx regions.
#[derive(Parser, Debug)]
#[command(name = "shmx_probe")]
#[command(version)]
#[command(about = "Inspect a live shmx shared-memory region")]
struct Args {
    /// Region name as given to the server.
    #[arg(default_value = "shmx_demo")]
    name: String,

    /// Emit one JSON snapshot instead of tables.
    #[arg(long)]
    json: bool,

    /// Refresh every N milliseconds until interrupted.
    #[arg(long, value_name = "MILLIS")]
    watch: Option<u64>,
}

/// Everything the probe reads in one pass.
#[derive(Debug, Serialize)]
struct Snapshot {
    name: String,
    session_id: u64,
    ver_major: u16,
    ver_minor: u16,
    write_index: u64,
    readers_connected: u32,
    static_gen: u32,
    static_used: u32,
    layout: Layout,
    streams: Vec<DirEntry>,
    readers: Vec<ReaderInfo>,
    slots: Vec<SlotInfo>,
    latest: Option<LatestSummary>,
}

#[derive(Debug, Serialize)]
struct LatestSummary {
    frame_id: u64,
    sim_time: f64,
    tlv_count: u32,
    payload_bytes: usize,
    streams: Vec<StreamSummary>,
}

#[derive(Debug, Serialize)]
struct StreamSummary {
    stream_id: u32,
    name: String,
    elem_count: u32,
    bytes: usize,
}

fn main() {
    let args = Args::parse();

    match args.watch {
        None => run_once(&args),
        Some(millis) => loop {
            run_once(&args);
            std::thread::sleep(Duration::from_millis(millis.max(50)));
        },
    }
}

fn run_once(args: &Args) {
    let inspector = match Inspector::open(&args.name) {
        Ok(ins) => ins,
        Err(e) => {
            eprintln!("shmx_probe: cannot open '{}': {e}", args.name);
            if args.watch.is_none() {
                std::process::exit(1);
            }
            return;
        }
    };
    let snapshot = take_snapshot(&args.name, &inspector);

    if args.json {
        match serde_json::to_string_pretty(&snapshot) {
            Ok(text) => println!("{text}"),
            Err(e) => eprintln!("shmx_probe: snapshot serialization failed: {e}"),
        }
    } else {
        print_tables(&snapshot);
    }
}

fn take_snapshot(name: &str, inspector: &Inspector) -> Snapshot {
    let header = inspector.header();
    let layout = *inspector.layout();
    let dir = inspector.decode_static_dir();

    let latest = inspector.latest().map(|view| {
        let decoded = Inspector::decode(&view);
        let streams = decoded
            .streams
            .iter()
            .map(|(id, slice)| StreamSummary {
                stream_id: *id,
                name: stream_name(&dir, *id),
                elem_count: slice.elem_count,
                bytes: slice.bytes.len(),
            })
            .collect();
        LatestSummary {
            frame_id: view.frame_id,
            sim_time: view.sim_time,
            tlv_count: view.tlv_count,
            payload_bytes: view.payload.len(),
            streams,
        }
    });

    Snapshot {
        name: name.to_string(),
        session_id: header.session_id,
        ver_major: header.ver_major,
        ver_minor: header.ver_minor,
        write_index: header.write_index.load(Ordering::Acquire),
        readers_connected: header.readers_connected.load(Ordering::Relaxed),
        static_gen: header.static_gen.load(Ordering::Acquire),
        static_used: header.static_used,
        layout,
        streams: dir,
        readers: inspector.snapshot_readers(),
        slots: (0..layout.slots)
            .filter_map(|i| inspector.slot_view(i))
            .collect(),
        latest,
    }
}

fn stream_name(dir: &[DirEntry], stream_id: u32) -> String {
    dir.iter()
        .find(|e| e.stream_id == stream_id)
        .map(|e| e.name.clone())
        .unwrap_or_else(|| "?".to_string())
}

fn print_tables(s: &Snapshot) {
    println!("shmx region '{}'", s.name);
    println!(
        "  session {}  ver {}.{}  write_index {}  readers {}",
        s.session_id, s.ver_major, s.ver_minor, s.write_index, s.readers_connected
    );

    let l = &s.layout;
    let total = l.total_size();
    println!("  region map ({} bytes total):", total);
    println!(
        "    static   off {:>8}  used {:>8}  cap {:>8}",
        l.static_offset, s.static_used, l.static_cap
    );
    println!(
        "    readers  off {:>8}  stride {:>6}  slots {:>4}",
        l.readers_offset, l.reader_stride, l.reader_slots
    );
    println!(
        "    control  off {:>8}  stride {:>6}  per-reader {}",
        l.control_offset, l.control_stride, l.control_per_reader
    );
    println!(
        "    frames   off {:>8}  stride {:>6}  slots {:>4}  cap {}",
        l.slots_offset, l.slot_stride, l.slots, l.frame_bytes_cap
    );

    println!("  streams ({}):", s.streams.len());
    for e in &s.streams {
        println!(
            "    {:>6}  {:<24} type {:>2}  comps {}  bytes/elem {}",
            e.stream_id, e.name, e.elem_type, e.components, e.bytes_per_elem
        );
    }

    let live: Vec<&ReaderInfo> = s.readers.iter().filter(|r| r.in_use).collect();
    println!("  readers in use ({} of {}):", live.len(), s.readers.len());
    for r in live {
        println!(
            "    slot {:>3}  id {:>20}  last_frame {:>8}  heartbeat {}",
            r.index, r.reader_id, r.last_frame_seen, r.heartbeat_ticks
        );
    }

    println!("  frame slots:");
    for slot in &s.slots {
        let verdict = if slot.frame_id == 0 {
            "empty"
        } else if slot.checksum_ok {
            "ok"
        } else {
            "BAD"
        };
        println!(
            "    slot {:>3}  frame {:>8}  tlv {:>3}  bytes {:>8}  crc {}",
            slot.slot, slot.frame_id, slot.tlv_count, slot.payload_bytes, verdict
        );
    }

    match &s.latest {
        Some(latest) => {
            println!(
                "  latest frame {}  sim {:.6}  tlv {}  bytes {}",
                latest.frame_id, latest.sim_time, latest.tlv_count, latest.payload_bytes
            );
            for st in &latest.streams {
                println!(
                    "    {:>6}  {:<24} elems {:>6}  bytes {}",
                    st.stream_id, st.name, st.elem_count, st.bytes
                );
            }
        }
        None => println!("  latest frame: none"),
    }
    println!();
}
