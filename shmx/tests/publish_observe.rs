//! End-to-end publish/observe tests across real shared-memory mappings.

use shmx::{
    backing::{MapMode, PosixShm, ShmBacking},
    Client, Config, ElemType, Inspector, Server, StaticStream,
};

fn unique(name: &str) -> String {
    format!("{name}_{}", std::process::id())
}

fn demo_config(name: &str, slots: u32) -> Config {
    Config {
        name: unique(name),
        slots,
        reader_slots: 16,
        static_bytes_cap: 4096,
        frame_bytes_cap: 65536,
        control_per_reader: 4096,
    }
}

fn demo_streams() -> Vec<StaticStream> {
    vec![
        StaticStream::scalar(42, ElemType::U64, 8, "tick_seq"),
        StaticStream::scalar(43, ElemType::F64, 8, "tick_sim"),
    ]
}

fn publish_tick(server: &mut Server, seq: u64, sim: f64) -> u64 {
    let mut fm = server.begin_frame();
    assert!(fm.append_stream(42, &seq.to_le_bytes(), 1, 8));
    assert!(fm.append_stream(43, &sim.to_le_bytes(), 1, 8));
    fm.publish(sim)
}

#[test]
fn basic_publish_observe() {
    let cfg = demo_config("e2e_basic", 4);
    let name = cfg.name.clone();
    let mut server = Server::create(cfg, &demo_streams()).unwrap();
    let mut client = Client::open(&name).unwrap();

    assert!(client.latest().unwrap().is_none(), "nothing published yet");

    publish_tick(&mut server, 0, 0.0);
    {
        let view = client.latest().unwrap().expect("first frame");
        assert_eq!(view.frame_id, 1);
        assert_eq!(view.session_id, server.session_id());
        let decoded = Client::decode(&view);
        assert_eq!(decoded.stream(42).unwrap().bytes, 0u64.to_le_bytes());
        assert_eq!(decoded.stream(43).unwrap().bytes, 0.0f64.to_le_bytes());
    }

    publish_tick(&mut server, 1, 0.033);
    {
        let view = client.latest().unwrap().expect("second frame");
        assert_eq!(view.frame_id, 2);
        assert_eq!(view.tlv_count, 2);
        let decoded = Client::decode(&view);
        assert_eq!(decoded.stream(42).unwrap().bytes, 1u64.to_le_bytes());
        assert_eq!(decoded.stream(43).unwrap().bytes, 0.033f64.to_le_bytes());
    }
}

#[test]
fn frames_arrive_in_increasing_order() {
    let cfg = demo_config("e2e_order", 4);
    let name = cfg.name.clone();
    let mut server = Server::create(cfg, &demo_streams()).unwrap();
    let mut client = Client::open(&name).unwrap();

    let mut last = 0u64;
    for seq in 0..50u64 {
        publish_tick(&mut server, seq, seq as f64 * 0.01);
        if let Some(view) = client.latest().unwrap() {
            assert!(view.frame_id > 0);
            assert!(view.frame_id >= last);
            last = view.frame_id;
        }
    }
    assert_eq!(last, 50);
}

#[test]
fn ring_wraparound_yields_newest_frame() {
    let cfg = demo_config("e2e_wrap", 4);
    let name = cfg.name.clone();
    let mut server = Server::create(cfg, &demo_streams()).unwrap();
    let mut client = Client::open(&name).unwrap();

    for seq in 0..17u64 {
        publish_tick(&mut server, seq, seq as f64);
    }

    let view = client.latest().unwrap().expect("latest after wrap");
    assert_eq!(view.frame_id, 17);
    let decoded = Client::decode(&view);
    assert_eq!(decoded.stream(42).unwrap().bytes, 16u64.to_le_bytes());
}

#[test]
fn single_slot_ring_still_observes_freshest() {
    let cfg = demo_config("e2e_one_slot", 1);
    let name = cfg.name.clone();
    let mut server = Server::create(cfg, &demo_streams()).unwrap();
    let mut client = Client::open(&name).unwrap();

    for seq in 0..5u64 {
        let fid = publish_tick(&mut server, seq, seq as f64);
        let view = client.latest().unwrap().expect("freshest frame");
        assert_eq!(view.frame_id, fid);
        let decoded = Client::decode(&view);
        assert_eq!(decoded.stream(42).unwrap().bytes, seq.to_le_bytes());
    }
}

#[test]
fn static_directory_refreshes_once() {
    let cfg = demo_config("e2e_static", 4);
    let name = cfg.name.clone();
    let _server = Server::create(cfg, &demo_streams()).unwrap();
    let client = Client::open(&name).unwrap();

    let mut state = shmx::StaticState::default();
    assert!(client.refresh_static(&mut state));
    assert_eq!(state.gen, 1);
    assert_eq!(state.dir.len(), 2);
    assert_eq!(state.dir[0].name, "tick_seq");
    assert_eq!(state.dir[1].name, "tick_sim");

    // Generation unchanged: no refresh.
    assert!(!client.refresh_static(&mut state));
}

#[test]
fn open_is_idempotent_while_server_lives() {
    let cfg = demo_config("e2e_idem", 4);
    let name = cfg.name.clone();
    let server = Server::create(cfg, &demo_streams()).unwrap();

    let a = Client::open(&name).unwrap();
    let b = Client::open(&name).unwrap();
    assert_eq!(a.layout(), b.layout());
    assert_eq!(a.layout(), server.layout());
    assert_eq!(a.session_id(), b.session_id());
}

#[test]
fn corrupted_payload_is_rejected_by_client_and_flagged_by_inspector() {
    let cfg = demo_config("e2e_crc", 4);
    let name = cfg.name.clone();
    let layout = shmx::compute_layout(&cfg).unwrap();
    let mut server = Server::create(cfg, &demo_streams()).unwrap();
    let mut client = Client::open(&name).unwrap();

    let fid = publish_tick(&mut server, 7, 0.7);
    assert_eq!(client.latest().unwrap().unwrap().frame_id, fid);

    // Flip one payload byte behind the server's back.
    let slot = ((fid - 1) % layout.slots as u64) as u32;
    let raw = PosixShm.open(&name, MapMode::ReadWrite).unwrap();
    let payload_off =
        layout.frame_slot_offset(slot) + core::mem::size_of::<shmx::FrameHeader>();
    unsafe {
        let p = raw.base().add(payload_off + 20);
        p.write(p.read() ^ 0xFF);
    }

    assert!(client.latest().unwrap().is_none(), "CRC failure rejects frame");

    let inspector = Inspector::open(&name).unwrap();
    let info = inspector.slot_view(slot).unwrap();
    assert_eq!(info.frame_id, fid);
    assert!(!info.checksum_ok);
}

#[test]
fn inspector_sees_frames_without_registering() {
    let cfg = demo_config("e2e_inspect", 4);
    let name = cfg.name.clone();
    let mut server = Server::create(cfg, &demo_streams()).unwrap();

    let inspector = Inspector::open(&name).unwrap();
    assert!(inspector.latest().is_none());

    publish_tick(&mut server, 3, 0.3);
    let view = inspector.latest().expect("published frame");
    assert_eq!(view.frame_id, 1);
    let decoded = Inspector::decode(&view);
    assert_eq!(decoded.stream(42).unwrap().bytes, 3u64.to_le_bytes());

    // No reader slot claimed, no counter touched.
    assert_eq!(server.readers_connected(), 0);
    assert!(inspector.snapshot_readers().iter().all(|r| !r.in_use));

    let dir = inspector.decode_static_dir();
    assert_eq!(dir.len(), 2);
    assert_eq!(dir[0].stream_id, 42);
}

#[test]
fn rapid_publishing_never_yields_torn_frames() {
    // Two slots and a writer that never sleeps: the reader is lapped
    // constantly and must either skip frames or observe intact ones.
    let cfg = demo_config("e2e_stress", 2);
    let name = cfg.name.clone();
    let mut server = Server::create(cfg, &demo_streams()).unwrap();
    let mut client = Client::open(&name).unwrap();

    let writer = std::thread::spawn(move || {
        for seq in 0..20_000u64 {
            // Stream 43 mirrors stream 42; a torn payload would let
            // the two disagree.
            let mut fm = server.begin_frame();
            assert!(fm.append_stream(42, &seq.to_le_bytes(), 1, 8));
            assert!(fm.append_stream(43, &(seq as f64).to_le_bytes(), 1, 8));
            fm.publish(seq as f64);
        }
        server
    });

    let mut last = 0u64;
    let mut observed = 0u64;
    loop {
        let done = writer.is_finished();
        if let Some(view) = client.latest().unwrap() {
            assert!(view.frame_id >= last, "frame ids never move backwards");
            last = view.frame_id;
            observed += 1;

            let decoded = Client::decode(&view);
            let seq = u64::from_le_bytes(decoded.stream(42).unwrap().bytes.try_into().unwrap());
            let echo = f64::from_le_bytes(decoded.stream(43).unwrap().bytes.try_into().unwrap());
            assert_eq!(seq, echo as u64, "streams of one frame stay consistent");
            assert_eq!(seq + 1, view.frame_id);
        }
        if done {
            break;
        }
    }
    let _server = writer.join().unwrap();
    assert!(observed > 0);
    assert_eq!(client.latest().unwrap().unwrap().frame_id, 20_000);
}

#[test]
fn empty_and_out_of_range_slots() {
    let cfg = demo_config("e2e_slots", 4);
    let name = cfg.name.clone();
    let _server = Server::create(cfg, &demo_streams()).unwrap();
    let inspector = Inspector::open(&name).unwrap();

    let info = inspector.slot_view(0).unwrap();
    assert_eq!(info.frame_id, 0);
    assert!(info.checksum_ok);
    assert!(inspector.slot_view(4).is_none());
}
