//! Scheduler tests: maintenance cron, adaptive client cron, sleep hooks and
//! the reactor loop.

mod common;

use common::{argv, client, harness, harness_with_config};
use bytes::Bytes;
use ember::client::Client;
use ember::command::Reply;
use ember::config::{Config, SavePoint};
use ember::sched::CronOutcome;
use ember::server::interfaces::JobKind;
use ember::{Admission, Reactor, ReactorEvent};
use std::time::Duration;
use tokio::sync::mpsc;

#[test]
fn client_cron_quota_and_effective_delay() {
    let mut h = harness();
    // 10,000 clients at a target rate of 10/sec: the raw quota of 1,000 is
    // capped at 200, so the effective rate becomes 10,000/200 = 50 cycles
    // per second.
    for id in 0..10_000u64 {
        h.server.clients.insert(Client::new(id, ember::time::unix_ms()));
    }
    let delay = h.server.clients_tick();
    assert_eq!(delay, Duration::from_millis(20));
}

#[test]
fn client_cron_default_delay_for_small_populations() {
    let mut h = harness();
    for id in 0..50u64 {
        h.server.clients.insert(Client::new(id, ember::time::unix_ms()));
    }
    // Quota floor is 5, no cap hit: the delay stays at the target rate.
    let delay = h.server.clients_tick();
    assert_eq!(delay, Duration::from_millis(100));
}

#[test]
fn client_cron_shrinks_idle_input_buffers() {
    let mut h = harness();
    let mut c = Client::new(1, ember::time::unix_ms());
    c.input_buf_capacity = 256 * 1024;
    c.input_buf_len = 100;
    h.server.clients.insert(c);

    h.server.clients_tick();
    let c = h.server.clients.get(1).unwrap();
    assert!(c.input_buf_capacity < 256 * 1024);
}

#[test]
fn client_cron_disconnects_idle_clients() {
    let mut config = Config::default();
    config.clients.timeout_secs = 1;
    let mut h = harness_with_config(config);
    // Stale for a minute.
    h.server
        .clients
        .insert(Client::new(1, ember::time::unix_ms() - 60_000));
    // A fresh client stays.
    h.server.clients.insert(Client::new(2, ember::time::unix_ms()));

    h.server.clients_tick();
    assert!(h.server.clients.get(1).is_none());
    assert!(h.server.clients.get(2).is_some());
    let out = h.server.take_outbox();
    assert!(matches!(&out[..], [(1, Admission::Disconnected)]));
}

#[test]
fn client_cron_grows_output_buffer_to_peak() {
    let mut h = harness();
    let mut c = Client::new(1, ember::time::unix_ms());
    c.output_buf_peak = 100 * 1024;
    h.server.clients.insert(c);
    let before = h.server.clients.bucket_of(1).unwrap();

    h.server.clients_tick();
    let c = h.server.clients.get(1).unwrap();
    assert!(c.output_buf_capacity >= 100 * 1024);
    // Reclassified into a heavier bucket.
    assert!(h.server.clients.bucket_of(1).unwrap() > before);
}

#[test]
fn cron_advances_clocks_and_metrics() {
    let mut h = harness();
    assert_eq!(h.server.cron.cronloops, 0);
    assert_eq!(h.server.cron_tick(), CronOutcome::Continue);
    assert_eq!(h.server.cron_tick(), CronOutcome::Continue);
    assert_eq!(h.server.cron.cronloops, 2);
    assert_eq!(h.server.cron.aging_clock, 2);
}

#[test]
fn cron_spawns_snapshot_at_save_point() {
    let mut config = Config::default();
    config.snapshot.save_points = vec![SavePoint { secs: 0, changes: 1 }];
    let mut h = harness_with_config(config);

    // No changes yet: no snapshot.
    h.server.cron_tick();
    assert!(h.jobs.spawned().is_empty());

    let mut c = client(1);
    h.server.admit(&mut c, Some(argv(&["SET", "k", "v"])));
    h.server.cron_tick();
    assert_eq!(h.jobs.spawned(), vec![JobKind::Snapshot]);

    // The completion handler resets the change counter: no re-spawn.
    h.server.cron_tick();
    assert_eq!(h.jobs.spawned(), vec![JobKind::Snapshot]);
}

#[test]
fn cron_expiry_sweep_propagates_deletions() {
    let mut h = harness();
    let now = ember::time::unix_ms();
    h.server
        .dataset
        .set(0, Bytes::from("gone"), Bytes::from("v"), Some(now - 10));
    h.server
        .dataset
        .set(0, Bytes::from("kept"), Bytes::from("v"), Some(now + 60_000));

    h.server.cron_tick();
    assert_eq!(h.server.stats.expired_keys, 1);
    assert_eq!(h.server.dataset.key_count(0), 1);

    let records = h.log.records();
    assert_eq!(records.len(), 1);
    assert_eq!(&records[0].args[0][..], b"DEL");
    assert_eq!(&records[0].args[1][..], b"gone");
}

#[test]
fn shutdown_machine_waits_for_replica_drain() {
    let mut h = harness();
    let mut c = client(1);
    h.server.admit(&mut c, Some(argv(&["SET", "k", "v"])));

    h.server.shutdown.handle().request();
    // Replicas lag: keep waiting.
    assert_eq!(h.server.cron_tick(), CronOutcome::Continue);
    assert!(h.server.shutdown.deadline_ms.is_some());

    h.replicas.ack_all();
    assert_eq!(h.server.cron_tick(), CronOutcome::Exit);
}

#[test]
fn shutdown_machine_exits_on_deadline() {
    let mut config = Config::default();
    config.shutdown.replica_drain_timeout_ms = 20;
    let mut h = harness_with_config(config);
    let mut c = client(1);
    h.server.admit(&mut c, Some(argv(&["SET", "k", "v"])));

    h.server.shutdown.handle().request();
    assert_eq!(h.server.cron_tick(), CronOutcome::Continue);
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(h.server.cron_tick(), CronOutcome::Exit);
}

#[test]
fn before_sleep_reports_pending_output() {
    let mut h = harness();
    let decision = h.server.before_sleep();
    // Replica acks lag only once something was written.
    assert!(decision.should_block);

    let mut c = Client::new(1, ember::time::unix_ms());
    c.output_pending = 4096;
    h.server.clients.insert(c);
    let decision = h.server.before_sleep();
    assert!(!decision.should_block);
}

#[tokio::test(start_paused = true)]
async fn reactor_processes_commands_and_stops() {
    let (event_tx, event_rx) = mpsc::channel(64);
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();

    let server = ember::Server::new(Config::default());
    let shutdown = server.shutdown.handle();
    let reactor = Reactor::new(server, event_rx, reply_tx);
    let task = tokio::spawn(reactor.run());

    event_tx
        .send(ReactorEvent::Connected {
            id: 1,
            from_primary: false,
            replica_link: false,
        })
        .await
        .unwrap();
    event_tx
        .send(ReactorEvent::Input {
            id: 1,
            argv: argv(&["PING"]),
        })
        .await
        .unwrap();

    let (id, admission) = reply_rx.recv().await.unwrap();
    assert_eq!(id, 1);
    assert!(matches!(
        admission,
        Admission::Dispatched(Reply::Simple(s)) if s == "PONG"
    ));

    // A shutdown request drains through the maintenance cron.
    shutdown.request();
    let server = task.await.unwrap();
    assert!(server.cron.cronloops > 0);
}

#[tokio::test(start_paused = true)]
async fn reactor_stops_when_the_bridge_closes() {
    let (event_tx, event_rx) = mpsc::channel(8);
    let (reply_tx, _reply_rx) = mpsc::unbounded_channel();
    let reactor = Reactor::new(ember::Server::new(Config::default()), event_rx, reply_tx);
    let task = tokio::spawn(reactor.run());

    drop(event_tx);
    let _server = task.await.unwrap();
}
