//! Reader registration, reaping, and session lifecycle tests.

use shmx::{
    backing::{MapMode, PosixShm, ShmBacking},
    now_ticks, Client, Config, ElemType, Server, ShmxError, StaticStream,
};

fn unique(name: &str) -> String {
    format!("{name}_{}", std::process::id())
}

fn demo_config(name: &str, reader_slots: u32) -> Config {
    Config {
        name: unique(name),
        slots: 4,
        reader_slots,
        static_bytes_cap: 1024,
        frame_bytes_cap: 4096,
        control_per_reader: 1024,
    }
}

fn demo_streams() -> Vec<StaticStream> {
    vec![StaticStream::scalar(42, ElemType::U64, 8, "tick_seq")]
}

fn publish_tick(server: &mut Server, seq: u64) -> u64 {
    let mut fm = server.begin_frame();
    assert!(fm.append_stream(42, &seq.to_le_bytes(), 1, 8));
    fm.publish(seq as f64)
}

#[test]
fn claim_is_lazy_and_registers_once() {
    let cfg = demo_config("life_claim", 4);
    let name = cfg.name.clone();
    let mut server = Server::create(cfg, &demo_streams()).unwrap();
    let mut client = Client::open(&name).unwrap();

    assert_eq!(server.readers_connected(), 0);
    assert_eq!(client.reader_id(), 0);

    publish_tick(&mut server, 0);
    client.latest().unwrap().unwrap();

    assert_eq!(server.readers_connected(), 1);
    assert_ne!(client.reader_id(), 0);

    client.latest().unwrap().unwrap();
    assert_eq!(server.readers_connected(), 1, "claim happens once");

    let snap = server.snapshot_readers();
    let mine: Vec<_> = snap.iter().filter(|r| r.in_use).collect();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].reader_id, client.reader_id());
    assert_eq!(mine[0].last_frame_seen, 1);
    assert!(mine[0].heartbeat_ticks > 0);
}

#[test]
fn stale_reader_is_reaped() {
    let cfg = demo_config("life_reap", 4);
    let name = cfg.name.clone();
    let mut server = Server::create(cfg, &demo_streams()).unwrap();
    let mut client = Client::open(&name).unwrap();

    publish_tick(&mut server, 0);
    client.latest().unwrap().unwrap();
    assert_eq!(server.readers_connected(), 1);

    // Not stale yet: generous timeout keeps the reader.
    assert_eq!(server.reap_stale_readers(now_ticks(), u64::MAX), 0);
    assert_eq!(server.readers_connected(), 1);

    // The client stops heartbeating; pretend its last beat is ancient.
    let reaped = server.reap_stale_readers(now_ticks().wrapping_add(1_000_000_000_000), 1);
    assert_eq!(reaped, 1);
    assert_eq!(server.readers_connected(), 0);

    let snap = server.snapshot_readers();
    assert!(snap.iter().all(|r| !r.in_use && r.reader_id == 0));

    // Reaping is idempotent.
    assert_eq!(server.reap_stale_readers(now_ticks(), 1), 0);
}

#[test]
fn reaped_slot_can_be_reclaimed() {
    let cfg = demo_config("life_reclaim", 1);
    let name = cfg.name.clone();
    let mut server = Server::create(cfg, &demo_streams()).unwrap();
    publish_tick(&mut server, 0);

    let mut first = Client::open(&name).unwrap();
    first.latest().unwrap().unwrap();
    server.reap_stale_readers(now_ticks().wrapping_add(1_000_000_000_000), 1);

    let mut second = Client::open(&name).unwrap();
    second.latest().unwrap().unwrap();
    assert_eq!(server.readers_connected(), 1);
    assert_ne!(second.reader_id(), 0);
}

#[test]
fn all_slots_claimed_surfaces_no_slot_available() {
    let cfg = demo_config("life_full", 1);
    let name = cfg.name.clone();
    let mut server = Server::create(cfg, &demo_streams()).unwrap();
    publish_tick(&mut server, 0);

    let mut a = Client::open(&name).unwrap();
    a.latest().unwrap().unwrap();

    let mut b = Client::open(&name).unwrap();
    assert!(matches!(
        b.latest(),
        Err(ShmxError::NoSlotAvailable { reader_slots: 1 })
    ));
}

#[test]
fn close_releases_the_slot() {
    let cfg = demo_config("life_close", 2);
    let name = cfg.name.clone();
    let mut server = Server::create(cfg, &demo_streams()).unwrap();
    publish_tick(&mut server, 0);

    let mut client = Client::open(&name).unwrap();
    client.latest().unwrap().unwrap();
    assert_eq!(server.readers_connected(), 1);

    client.close();
    assert_eq!(server.readers_connected(), 0);
    assert!(server.snapshot_readers().iter().all(|r| !r.in_use));
}

#[test]
fn drop_releases_the_slot_too() {
    let cfg = demo_config("life_drop", 2);
    let name = cfg.name.clone();
    let mut server = Server::create(cfg, &demo_streams()).unwrap();
    publish_tick(&mut server, 0);

    {
        let mut client = Client::open(&name).unwrap();
        client.latest().unwrap().unwrap();
        assert_eq!(server.readers_connected(), 1);
    }
    assert_eq!(server.readers_connected(), 0);
}

#[test]
fn open_rejects_regions_that_are_not_shmx() {
    let name = unique("life_garbage");
    let backing = PosixShm;
    let _region = backing.create(&name, 4096).unwrap();

    // A zeroed region has no magic.
    assert!(matches!(
        Client::open(&name),
        Err(ShmxError::VersionMismatch { magic_ok: false, .. })
    ));

    backing.destroy(&name).unwrap();
}

#[test]
fn foreign_session_raises_mismatch_and_withholds_frames() {
    let cfg = demo_config("life_session", 4);
    let name = cfg.name.clone();
    let mut server = Server::create(cfg, &demo_streams()).unwrap();
    let mut client = Client::open(&name).unwrap();

    publish_tick(&mut server, 0);
    client.latest().unwrap().unwrap();
    assert!(!client.session_mismatch());

    // Simulate a server restart the mapping actually observes: rewrite
    // the header's session id behind the client's back.
    let raw = PosixShm.open(&name, MapMode::ReadWrite).unwrap();
    unsafe {
        let session_ptr = raw.base().add(16) as *mut u64;
        session_ptr.write(client.session_id().wrapping_add(1));
    }

    assert!(client.latest().unwrap().is_none());
    assert!(client.session_mismatch());
}

#[test]
fn reopen_after_restart_records_new_session() {
    let cfg = demo_config("life_restart", 4);
    let name = cfg.name.clone();

    let mut server = Server::create(cfg.clone(), &demo_streams()).unwrap();
    let old_session = server.session_id();
    publish_tick(&mut server, 0);

    let mut stale = Client::open(&name).unwrap();
    stale.latest().unwrap().unwrap();

    server.destroy();

    let mut server = Server::create(cfg, &demo_streams()).unwrap();
    assert_ne!(server.session_id(), old_session);
    publish_tick(&mut server, 100);

    // The stale client's mapping is frozen; it never sees the new
    // session's frames.
    if let Some(view) = stale.latest().unwrap() {
        assert_eq!(view.session_id, old_session);
    }

    let mut fresh = Client::open(&name).unwrap();
    assert_eq!(fresh.session_id(), server.session_id());
    let view = fresh.latest().unwrap().expect("new session frame");
    assert_eq!(view.frame_id, 1);
    assert_eq!(view.session_id, server.session_id());
}
