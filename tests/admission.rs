//! Admission pipeline tests: every gate, in order, against the in-memory
//! collaborators.

mod common;

use common::{argv, client, harness, harness_with_config};
use ember::client::Client;
use ember::config::{Config, HandoverPolicy};
use ember::error::{PostponeReason, RejectReason};
use ember::server::interfaces::{slot_for_key, LogError, StaticAcl, StaticCluster};
use ember::server::{BusyState, Loading, PauseScope, Role};
use ember::Admission;
use ember::command::Reply;
use bytes::Bytes;

#[test]
fn unknown_command_rejected() {
    let mut h = harness();
    let mut c = client(1);
    let adm = h.server.admit(&mut c, Some(argv(&["NOSUCH", "x"])));
    assert!(matches!(
        adm,
        Admission::Rejected(RejectReason::UnknownCommand { name }) if name == "nosuch"
    ));
}

#[test]
fn unknown_subcommand_rejected() {
    let mut h = harness();
    let mut c = client(1);
    let adm = h.server.admit(&mut c, Some(argv(&["CONFIG", "SMASH"])));
    assert!(matches!(
        adm,
        Admission::Rejected(RejectReason::UnknownSubcommand { .. })
    ));
}

#[test]
fn arity_validation() {
    let mut h = harness();
    let mut c = client(1);
    // GET has exact arity 2.
    let adm = h.server.admit(&mut c, Some(argv(&["GET"])));
    assert!(matches!(
        adm,
        Admission::Rejected(RejectReason::WrongArity { name }) if name == "get"
    ));
    let adm = h.server.admit(&mut c, Some(argv(&["GET", "k", "extra"])));
    assert!(matches!(
        adm,
        Admission::Rejected(RejectReason::WrongArity { .. })
    ));
    // SET has minimum arity 3.
    let adm = h.server.admit(&mut c, Some(argv(&["SET", "k"])));
    assert!(matches!(
        adm,
        Admission::Rejected(RejectReason::WrongArity { .. })
    ));
    let adm = h.server.admit(&mut c, Some(argv(&["SET", "k", "v", "NX"])));
    assert!(matches!(adm, Admission::Dispatched(Reply::Ok)));
}

#[test]
fn rejections_count_per_command() {
    let mut h = harness();
    let mut c = client(1);
    h.server.admit(&mut c, Some(argv(&["GET"])));
    h.server.admit(&mut c, Some(argv(&["GET"])));
    let stats = h.server.registry.lookup("get").unwrap().stats.snapshot();
    assert_eq!(stats.rejected_calls, 2);
    assert_eq!(stats.calls, 0);
}

#[test]
fn protected_commands_disabled_by_default() {
    let mut h = harness();
    let mut c = client(1);
    let adm = h.server.admit(&mut c, Some(argv(&["SHUTDOWN"])));
    assert!(matches!(
        adm,
        Admission::Rejected(RejectReason::ProtectedCommand { .. })
    ));
    assert!(!h.server.shutdown.requested());
}

#[test]
fn protected_commands_enabled_by_config() {
    let mut config = Config::default();
    config.server.enable_protected_commands = true;
    let mut h = harness_with_config(config);
    let mut c = client(1);
    let adm = h.server.admit(&mut c, Some(argv(&["SHUTDOWN"])));
    assert!(matches!(adm, Admission::Dispatched(Reply::Ok)));
    assert!(h.server.shutdown.requested());
}

#[test]
fn auth_gate_and_exemptions() {
    let mut config = Config::default();
    config.server.require_auth = true;
    config.server.password = Some("sesame".into());
    let mut h = harness_with_config(config);
    let mut c = Client::new(1, 0);

    let adm = h.server.admit(&mut c, Some(argv(&["GET", "k"])));
    assert!(matches!(adm, Admission::Rejected(RejectReason::AuthRequired)));

    // AUTH itself is exempt; a wrong password is a command error, not a
    // gate rejection.
    let adm = h.server.admit(&mut c, Some(argv(&["AUTH", "wrong"])));
    assert!(matches!(adm, Admission::Dispatched(Reply::Error(e)) if e.code == "WRONGPASS"));

    let adm = h.server.admit(&mut c, Some(argv(&["AUTH", "sesame"])));
    assert!(matches!(adm, Admission::Dispatched(Reply::Ok)));
    let adm = h.server.admit(&mut c, Some(argv(&["GET", "k"])));
    assert!(matches!(adm, Admission::Dispatched(Reply::Null)));
}

#[test]
fn acl_denial_names_the_offending_argument() {
    let mut srv = ember::Server::new(Config::default())
        .with_acl(StaticAcl::default().deny_key_prefix("secret"));
    let mut c = client(1);
    let adm = srv.admit(&mut c, Some(argv(&["SET", "secret:a", "v"])));
    match adm {
        Admission::Rejected(RejectReason::NoPermission { arg_index, .. }) => {
            assert_eq!(arg_index, Some(1));
        }
        other => panic!("expected permission rejection, got {other:?}"),
    }
}

#[test]
fn acl_denied_command() {
    let mut srv = ember::Server::new(Config::default())
        .with_acl(StaticAcl::default().deny_command("flushall"));
    let mut c = client(1);
    let adm = srv.admit(&mut c, Some(argv(&["FLUSHALL"])));
    assert!(matches!(
        adm,
        Admission::Rejected(RejectReason::NoPermission { .. })
    ));
}

#[test]
fn cluster_redirects_foreign_slots() {
    let slot = slot_for_key(b"k");
    let mut srv = ember::Server::new(Config::default())
        .with_cluster(StaticCluster::new().remote(slot, "10.0.0.9:7000"));
    let mut c = client(1);
    let adm = srv.admit(&mut c, Some(argv(&["GET", "k"])));
    match adm {
        Admission::Rejected(RejectReason::ClusterRedirect { slot: s, target }) => {
            assert_eq!(s, slot);
            assert_eq!(target, "10.0.0.9:7000");
        }
        other => panic!("expected redirect, got {other:?}"),
    }
}

#[test]
fn cluster_cross_slot_rejected() {
    // Hash tags force both keys into one slot; keys without a shared tag
    // almost surely land apart, so find a genuinely split pair.
    let mut split = None;
    for i in 0..64 {
        let a = format!("a{i}");
        if slot_for_key(a.as_bytes()) != slot_for_key(b"b") {
            split = Some(a);
            break;
        }
    }
    let a = split.expect("no split pair found");

    let mut srv = ember::Server::new(Config::default()).with_cluster(StaticCluster::new());
    let mut c = client(1);
    let adm = srv.admit(&mut c, Some(argv(&["DEL", &a, "b"])));
    assert!(matches!(adm, Admission::Rejected(RejectReason::CrossSlot)));

    let adm = srv.admit(&mut c, Some(argv(&["DEL", "{t}:a", "{t}:b"])));
    assert!(matches!(adm, Admission::Dispatched(_)));
}

#[test]
fn handover_policy_decides_postpone_vs_redirect() {
    let slot = slot_for_key(b"k");
    let mut srv = ember::Server::new(Config::default())
        .with_cluster(StaticCluster::new().remote(slot, "n2").handover(true));

    srv.config.replication.handover_policy = HandoverPolicy::Postpone;
    let mut c = client(1);
    let adm = srv.admit(&mut c, Some(argv(&["GET", "k"])));
    assert!(matches!(
        adm,
        Admission::Postponed(PostponeReason::RoleHandover)
    ));
    assert!(c.postponed.is_some());

    srv.config.replication.handover_policy = HandoverPolicy::Redirect;
    let mut c = client(2);
    let adm = srv.admit(&mut c, Some(argv(&["GET", "k"])));
    assert!(matches!(
        adm,
        Admission::Rejected(RejectReason::ClusterRedirect { .. })
    ));
}

#[test]
fn oom_rejects_memory_denying_commands_only() {
    let mut config = Config::default();
    config.memory.max_bytes = 8;
    let mut h = harness_with_config(config);
    // Put the dataset over the ceiling.
    h.server
        .dataset
        .set(0, Bytes::from("big"), Bytes::from(vec![0u8; 64]), None);

    let mut c = client(1);
    let adm = h.server.admit(&mut c, Some(argv(&["SET", "k", "v"])));
    assert!(matches!(adm, Admission::Rejected(RejectReason::OutOfMemory)));
    // Nothing was staged or flushed.
    assert_eq!(h.server.propagation_pending(), 0);
    assert!(h.log.records().is_empty());

    // Reads are not memory-denying.
    let adm = h.server.admit(&mut c, Some(argv(&["GET", "k"])));
    assert!(matches!(adm, Admission::Dispatched(Reply::Null)));
}

#[test]
fn replication_source_is_never_memory_rejected() {
    let mut config = Config::default();
    config.memory.max_bytes = 8;
    let mut h = harness_with_config(config);
    h.server
        .dataset
        .set(0, Bytes::from("big"), Bytes::from(vec![0u8; 64]), None);

    let mut primary = client(1);
    primary.from_primary = true;
    let adm = h.server.admit(&mut primary, Some(argv(&["SET", "k", "v"])));
    assert!(matches!(adm, Admission::Dispatched(Reply::Ok)));

    // The identical command from an ordinary client is refused.
    let mut c = client(2);
    let adm = h.server.admit(&mut c, Some(argv(&["SET", "k2", "v"])));
    assert!(matches!(adm, Admission::Rejected(RejectReason::OutOfMemory)));
}

#[test]
fn durability_error_denies_ordinary_writes() {
    let mut h = harness();
    h.log.set_error(Some(LogError::Fsync));

    let mut c = client(1);
    let adm = h.server.admit(&mut c, Some(argv(&["SET", "k", "v"])));
    assert!(matches!(
        adm,
        Admission::Rejected(RejectReason::DurabilityError)
    ));
    // Reads pass.
    let adm = h.server.admit(&mut c, Some(argv(&["GET", "k"])));
    assert!(matches!(adm, Admission::Dispatched(_)));
    // The replication source passes with a rate-limited warning.
    let mut primary = client(2);
    primary.from_primary = true;
    let adm = h.server.admit(&mut primary, Some(argv(&["SET", "k", "v"])));
    assert!(matches!(adm, Admission::Dispatched(Reply::Ok)));
}

#[test]
fn insufficient_replicas_denies_writes() {
    let mut config = Config::default();
    config.replication.min_replicas_to_write = 3;
    let mut h = harness_with_config(config); // 2 good replicas
    let mut c = client(1);
    let adm = h.server.admit(&mut c, Some(argv(&["SET", "k", "v"])));
    match adm {
        Admission::Rejected(RejectReason::InsufficientReplicas { required, healthy }) => {
            assert_eq!((required, healthy), (3, 2));
        }
        other => panic!("expected replica rejection, got {other:?}"),
    }
}

#[test]
fn read_only_replica_denies_ordinary_writes() {
    let mut h = harness();
    h.server.role = Role::Replica { link_up: true };
    let mut c = client(1);
    let adm = h.server.admit(&mut c, Some(argv(&["SET", "k", "v"])));
    assert!(matches!(
        adm,
        Admission::Rejected(RejectReason::ReadOnlyReplica)
    ));
    // The replication source applies writes.
    let mut primary = client(2);
    primary.from_primary = true;
    let adm = h.server.admit(&mut primary, Some(argv(&["SET", "k", "v"])));
    assert!(matches!(adm, Admission::Dispatched(Reply::Ok)));
    // Reads are fine.
    let adm = h.server.admit(&mut c, Some(argv(&["GET", "k"])));
    assert!(matches!(adm, Admission::Dispatched(_)));
}

#[test]
fn subscribe_mode_restricts_legacy_connections() {
    let mut h = harness();
    let mut c = client(1);
    let adm = h.server.admit(&mut c, Some(argv(&["SUBSCRIBE", "news"])));
    assert!(matches!(adm, Admission::Dispatched(_)));

    let adm = h.server.admit(&mut c, Some(argv(&["GET", "k"])));
    assert!(matches!(
        adm,
        Admission::Rejected(RejectReason::SubscriberRestricted)
    ));
    // PING stays allowed.
    let adm = h.server.admit(&mut c, Some(argv(&["PING"])));
    assert!(matches!(adm, Admission::Dispatched(_)));

    // A modern-protocol connection is not restricted.
    let mut modern = client(2);
    modern.resp3 = true;
    h.server.admit(&mut modern, Some(argv(&["SUBSCRIBE", "news"])));
    let adm = h.server.admit(&mut modern, Some(argv(&["GET", "k"])));
    assert!(matches!(adm, Admission::Dispatched(_)));
}

#[test]
fn stale_replica_link_denies_unflagged_commands() {
    let mut config = Config::default();
    config.replication.serve_stale_data = false;
    let mut h = harness_with_config(config);
    h.server.role = Role::Replica { link_up: false };
    let mut c = client(1);

    let adm = h.server.admit(&mut c, Some(argv(&["GET", "k"])));
    assert!(matches!(
        adm,
        Admission::Rejected(RejectReason::UpstreamLinkDown)
    ));
    let adm = h.server.admit(&mut c, Some(argv(&["PING"])));
    assert!(matches!(adm, Admission::Dispatched(_)));
}

#[test]
fn loading_gates() {
    let mut h = harness();
    h.server.loading = Loading::Sync;
    let mut c = client(1);
    let adm = h.server.admit(&mut c, Some(argv(&["GET", "k"])));
    assert!(matches!(
        adm,
        Admission::Rejected(RejectReason::LoadingInProgress)
    ));
    let adm = h.server.admit(&mut c, Some(argv(&["PING"])));
    assert!(matches!(adm, Admission::Dispatched(_)));

    // The async deny-list is narrower: plain reads pass, flagged
    // role-change commands do not.
    h.server.loading = Loading::Async;
    h.server.config.server.enable_protected_commands = true;
    let adm = h.server.admit(&mut c, Some(argv(&["GET", "k"])));
    assert!(matches!(adm, Admission::Dispatched(_)));
    let adm = h
        .server
        .admit(&mut c, Some(argv(&["REPLICAOF", "NO", "ONE"])));
    assert!(matches!(
        adm,
        Admission::Rejected(RejectReason::LoadingInProgress)
    ));
}

#[test]
fn busy_upstream_rejects_and_yield_postpones() {
    let mut h = harness();
    h.server.busy = BusyState {
        active: true,
        yielding: false,
    };
    let mut c = client(1);
    let adm = h.server.admit(&mut c, Some(argv(&["GET", "k"])));
    assert!(matches!(adm, Admission::Rejected(RejectReason::BusyUpstream)));
    let adm = h.server.admit(&mut c, Some(argv(&["PING"])));
    assert!(matches!(adm, Admission::Dispatched(_)));

    // While yielding, deferral comes before any rejection, even for
    // commands that do not resolve.
    h.server.busy.yielding = true;
    let adm = h.server.admit(&mut c, Some(argv(&["GET", "k"])));
    assert!(matches!(adm, Admission::Postponed(PostponeReason::BusyYield)));
    let adm = h.server.admit(&mut c, Some(argv(&["NOSUCH"])));
    assert!(matches!(adm, Admission::Postponed(PostponeReason::BusyYield)));
    let adm = h.server.admit(&mut c, Some(argv(&["PING"])));
    assert!(matches!(adm, Admission::Dispatched(_)));
}

#[test]
fn replica_links_may_not_touch_the_keyspace() {
    let mut h = harness();
    let mut link = client(1);
    link.replica_link = true;
    let adm = h.server.admit(&mut link, Some(argv(&["GET", "k"])));
    assert!(matches!(
        adm,
        Admission::Rejected(RejectReason::ReplicaKeyspaceViolation)
    ));
    let adm = h.server.admit(&mut link, Some(argv(&["PING"])));
    assert!(matches!(adm, Admission::Dispatched(_)));
}

#[test]
fn pause_postpones_with_no_side_effects() {
    let mut h = harness();
    let now = ember::time::unix_ms();
    h.server.pause_clients(PauseScope::Writes, now + 60_000);

    let mut c = client(1);
    let dirty_before = h.server.dataset.dirty();
    let adm = h.server.admit(&mut c, Some(argv(&["SET", "k", "v"])));
    assert!(matches!(adm, Admission::Postponed(PostponeReason::Paused)));
    assert_eq!(h.server.dataset.dirty(), dirty_before);
    assert!(h.log.records().is_empty());
    assert!(c.postponed.is_some());

    // Reads pass a writes-only pause.
    let adm = h.server.admit(&mut c, Some(argv(&["GET", "k"])));
    assert!(matches!(adm, Admission::Dispatched(Reply::Null)));
}

#[test]
fn postponed_command_retries_verbatim() {
    let mut h = harness();
    h.server.busy.yielding = true;
    h.server.clients.insert(client(7));

    h.server.handle_input(7, argv(&["SET", "k", "v"]));
    assert!(h.server.take_outbox().is_empty());

    // Still yielding: the retry postpones again, silently.
    h.server.before_sleep();
    assert!(h.server.take_outbox().is_empty());

    h.server.busy.yielding = false;
    h.server.before_sleep();
    let out = h.server.take_outbox();
    assert_eq!(out.len(), 1);
    assert!(matches!(&out[0], (7, Admission::Dispatched(Reply::Ok))));
    assert_eq!(
        h.server.dataset.get(0, b"k", ember::time::unix_ms()),
        Some(Bytes::from("v"))
    );
}

#[test]
fn multi_queues_and_exec_runs() {
    let mut h = harness();
    let mut c = client(1);
    let adm = h.server.admit(&mut c, Some(argv(&["MULTI"])));
    assert!(matches!(adm, Admission::Dispatched(Reply::Ok)));

    let adm = h.server.admit(&mut c, Some(argv(&["SET", "a", "1"])));
    assert!(matches!(adm, Admission::Queued));
    let adm = h.server.admit(&mut c, Some(argv(&["SET", "b", "2"])));
    assert!(matches!(adm, Admission::Queued));
    // Nothing ran yet.
    assert_eq!(h.server.dataset.dirty(), 0);

    let adm = h.server.admit(&mut c, Some(argv(&["EXEC"])));
    match adm {
        Admission::Dispatched(Reply::Array(replies)) => assert_eq!(replies.len(), 2),
        other => panic!("expected exec array, got {other:?}"),
    }
    assert_eq!(h.server.dataset.dirty(), 2);
    assert!(!c.in_multi());
}

#[test]
fn rejection_inside_multi_poisons_exec() {
    let mut h = harness();
    let mut c = client(1);
    h.server.admit(&mut c, Some(argv(&["MULTI"])));
    let adm = h.server.admit(&mut c, Some(argv(&["NOSUCH"])));
    assert!(matches!(adm, Admission::Rejected(_)));
    let adm = h.server.admit(&mut c, Some(argv(&["SET", "a", "1"])));
    assert!(matches!(adm, Admission::Queued));

    let adm = h.server.admit(&mut c, Some(argv(&["EXEC"])));
    assert!(matches!(
        adm,
        Admission::Dispatched(Reply::Error(e)) if e.code == "EXECABORT"
    ));
    assert_eq!(h.server.dataset.dirty(), 0);
}

#[test]
fn forbidden_in_transaction() {
    let mut h = harness();
    let mut c = client(1);
    h.server.admit(&mut c, Some(argv(&["MULTI"])));
    let adm = h.server.admit(&mut c, Some(argv(&["SUBSCRIBE", "news"])));
    assert!(matches!(
        adm,
        Admission::Rejected(RejectReason::ForbiddenInTransaction { .. })
    ));
    // The rejection poisoned the transaction.
    let adm = h.server.admit(&mut c, Some(argv(&["EXEC"])));
    assert!(matches!(
        adm,
        Admission::Dispatched(Reply::Error(e)) if e.code == "EXECABORT"
    ));
}

#[test]
fn discard_clears_transaction() {
    let mut h = harness();
    let mut c = client(1);
    h.server.admit(&mut c, Some(argv(&["MULTI"])));
    h.server.admit(&mut c, Some(argv(&["SET", "a", "1"])));
    let adm = h.server.admit(&mut c, Some(argv(&["DISCARD"])));
    assert!(matches!(adm, Admission::Dispatched(Reply::Ok)));
    assert!(!c.in_multi());
    let adm = h.server.admit(&mut c, Some(argv(&["EXEC"])));
    assert!(matches!(adm, Admission::Dispatched(Reply::Error(_))));
}

#[test]
fn client_eviction_can_free_the_issuer() {
    let mut config = Config::default();
    config.memory.client_eviction_bytes = 1024;
    let mut h = harness_with_config(config);

    let mut c = client(1);
    c.output_buf_capacity = 1 << 20;
    let adm = h.server.admit(&mut c, Some(argv(&["GET", "k"])));
    assert!(matches!(adm, Admission::Disconnected));
    assert!(c.closing);
}
