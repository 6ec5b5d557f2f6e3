//! Ticking publisher demo: creates a region and publishes
//! `tick_seq`/`tick_sim` frames until interrupted, draining control
//! messages and reaping stale readers as it goes.
//!
//! Run the reader demo (`shm_reader`) or the probe
//! (`shmx_probe`) against the same region name in other terminals.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use shmx::{
    now_ticks, Config, ElemType, Server, ShmxResult, StaticStream, CTRL_BYE, CTRL_HEARTBEAT,
    CTRL_HELLO,
};

const READER_TIMEOUT: Duration = Duration::from_secs(3);

fn main() -> ShmxResult<()> {
    shmx::init_tracing();

    let name = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "shmx_demo".to_string());

    let cfg = Config {
        name: name.clone(),
        slots: 4,
        reader_slots: 16,
        static_bytes_cap: 4096,
        frame_bytes_cap: 65536,
        control_per_reader: 4096,
    };
    let streams = vec![
        StaticStream::scalar(42, ElemType::U64, 8, "tick_seq"),
        StaticStream::scalar(43, ElemType::F64, 8, "tick_sim"),
    ];
    let mut server = Server::create(cfg, &streams)?;
    println!(
        "[writer] up name {name} session {}",
        server.session_id()
    );

    let run = Arc::new(AtomicBool::new(true));
    {
        let run = run.clone();
        ctrlc::set_handler(move || run.store(false, Ordering::SeqCst))
            .expect("install signal handler");
    }

    let t0 = Instant::now();
    let mut seq = 0u64;
    let mut frames_in_sec = 0u64;
    let mut last_print = 0u64;
    let mut greeted: HashMap<u64, Instant> = HashMap::new();

    while run.load(Ordering::SeqCst) {
        let sim = t0.elapsed().as_secs_f64();

        let mut fm = server.begin_frame();
        let ok = fm.append_stream(42, &seq.to_le_bytes(), 1, 8)
            && fm.append_stream(43, &sim.to_le_bytes(), 1, 8);
        if ok {
            fm.publish(sim);
            seq += 1;
            frames_in_sec += 1;
        }

        for msg in server.poll_control(256) {
            match msg.msg_type {
                CTRL_HELLO => {
                    if greeted.insert(msg.reader_id, Instant::now()).is_none() {
                        println!("[writer] reader {} hello", msg.reader_id);
                    }
                }
                CTRL_HEARTBEAT => {
                    greeted.insert(msg.reader_id, Instant::now());
                }
                CTRL_BYE => {
                    if greeted.remove(&msg.reader_id).is_some() {
                        println!("[writer] reader {} bye", msg.reader_id);
                    }
                }
                other => println!(
                    "[writer] reader {} sent unknown control {other:#x}",
                    msg.reader_id
                ),
            }
        }
        greeted.retain(|id, last| {
            if last.elapsed() > READER_TIMEOUT {
                println!("[writer] reader {id} lost");
                false
            } else {
                true
            }
        });
        server.reap_stale_readers(now_ticks(), READER_TIMEOUT.as_nanos() as u64);

        let sec = t0.elapsed().as_secs();
        if sec != last_print {
            last_print = sec;
            println!(
                "[writer] sec {sec} frames {frames_in_sec} readers {}",
                server.readers_connected()
            );
            frames_in_sec = 0;
        }

        std::thread::sleep(Duration::from_millis(15));
    }

    println!("[writer] exiting");
    Ok(())
}
