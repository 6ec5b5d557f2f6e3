//! Subscriber demo: attaches to a region, observes the latest frame,
//! and speaks the HELLO/HEARTBEAT/BYE control protocol. Reconnects on
//! session change or when frames stop arriving.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use shmx::{
    now_ticks, Client, StaticState, CTRL_BYE, CTRL_HEARTBEAT, CTRL_HELLO, VER_MAJOR, VER_MINOR,
};

const RECONNECT_AFTER: Duration = Duration::from_secs(2);

enum Step {
    Observed(u64),
    Idle,
    Reconnect(&'static str),
}

fn hello_payload() -> [u8; 8] {
    let mut payload = [0u8; 8];
    payload[..4].copy_from_slice(&(VER_MAJOR as u32).to_le_bytes());
    payload[4..].copy_from_slice(&(VER_MINOR as u32).to_le_bytes());
    payload
}

fn connect(name: &str) -> Option<Client> {
    let mut client = match Client::open(name) {
        Ok(c) => c,
        Err(e) => {
            println!("[reader] open failed: {e}");
            return None;
        }
    };
    println!(
        "[reader] connected name {name} session {}",
        client.session_id()
    );
    if client.control_send(CTRL_HELLO, &hello_payload()) {
        println!("[reader] sent HELLO");
    }
    let mut state = StaticState::default();
    if client.refresh_static(&mut state) {
        println!("[reader] static {} entries", state.dir.len());
        for entry in &state.dir {
            println!(
                "         stream {} name {} elem_type {} bytes_per_elem {}",
                entry.stream_id, entry.name, entry.elem_type, entry.bytes_per_elem
            );
        }
    }
    Some(client)
}

fn disconnect(client: &mut Option<Client>) {
    if let Some(mut c) = client.take() {
        c.control_send(CTRL_BYE, &[]);
        c.close();
    }
}

/// One observation attempt; prints any new frame it sees.
fn observe(client: &mut Client, last_frame: u64, last_progress: Instant) -> Step {
    if client.session_mismatch() {
        return Step::Reconnect("session changed");
    }
    match client.latest() {
        Ok(Some(view)) if view.frame_id != last_frame => {
            let decoded = Client::decode(&view);
            let seq = decoded
                .stream(42)
                .and_then(|s| s.bytes.try_into().ok().map(u64::from_le_bytes))
                .unwrap_or(0);
            println!(
                "[reader] frame {} sim {:.3} seq {seq} tlv {} bytes {}",
                view.frame_id,
                view.sim_time,
                view.tlv_count,
                view.payload.len()
            );
            Step::Observed(view.frame_id)
        }
        Ok(_) if last_progress.elapsed() > RECONNECT_AFTER => Step::Reconnect("no frames"),
        Ok(_) => Step::Idle,
        Err(e) => {
            println!("[reader] observe failed: {e}");
            Step::Reconnect("error")
        }
    }
}

fn main() {
    shmx::init_tracing();

    let name = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "shmx_demo".to_string());

    let run = Arc::new(AtomicBool::new(true));
    {
        let run = run.clone();
        ctrlc::set_handler(move || run.store(false, Ordering::SeqCst))
            .expect("install signal handler");
    }

    let mut client: Option<Client> = None;
    let mut last_frame = 0u64;
    let mut last_progress = Instant::now();
    let mut last_heartbeat = Instant::now();

    while run.load(Ordering::SeqCst) {
        let Some(c) = client.as_mut() else {
            client = connect(&name);
            last_frame = 0;
            last_progress = Instant::now();
            if client.is_none() {
                std::thread::sleep(Duration::from_millis(250));
            }
            continue;
        };

        match observe(c, last_frame, last_progress) {
            Step::Observed(frame_id) => {
                last_frame = frame_id;
                last_progress = Instant::now();
            }
            Step::Idle => {}
            Step::Reconnect(why) => {
                println!("[reader] reconnecting: {why}");
                disconnect(&mut client);
                continue;
            }
        }

        if last_heartbeat.elapsed() > Duration::from_secs(1) {
            last_heartbeat = Instant::now();
            if let Some(c) = client.as_mut() {
                c.control_send(CTRL_HEARTBEAT, &now_ticks().to_le_bytes());
            }
        }

        std::thread::sleep(Duration::from_millis(15));
    }

    println!("[reader] exiting");
    disconnect(&mut client);
}
