//! Shared test harness: a server over the in-memory collaborators, with
//! handle-based wrappers so tests keep a view into the log, the replica
//! stream and the background jobs after the server takes ownership.

#![allow(dead_code)]

use bytes::Bytes;
use ember::client::Client;
use ember::config::Config;
use ember::server::interfaces::{
    BackgroundJobs, CompletedJob, DurableLog, Frame, InlineJobs, JobKind, LogError, LogState,
    MemoryLog, ReplicaStream, StaticReplicas,
};
use ember::Server;
use std::sync::{Arc, Mutex};

pub fn argv(tokens: &[&str]) -> Vec<Bytes> {
    tokens
        .iter()
        .map(|t| Bytes::copy_from_slice(t.as_bytes()))
        .collect()
}

pub fn client(id: u64) -> Client {
    let mut client = Client::new(id, 0);
    client.authenticated = true;
    client
}

/// Durable log handle shared between the test and the server.
#[derive(Clone)]
pub struct SharedLog(pub Arc<Mutex<MemoryLog>>);

impl SharedLog {
    pub fn active() -> Self {
        Self(Arc::new(Mutex::new(MemoryLog::active())))
    }

    pub fn records(&self) -> Vec<Frame> {
        self.0.lock().unwrap().records().to_vec()
    }

    pub fn set_error(&self, error: Option<LogError>) {
        self.0.lock().unwrap().set_error(error);
    }
}

impl DurableLog for SharedLog {
    fn state(&self) -> LogState {
        self.0.lock().unwrap().state()
    }

    fn feed(&mut self, db: i32, args: &[Bytes]) {
        self.0.lock().unwrap().feed(db, args);
    }

    fn schedule_rewrite(&mut self) {
        self.0.lock().unwrap().schedule_rewrite();
    }

    fn rewrite_done(&mut self, ok: bool) {
        self.0.lock().unwrap().rewrite_done(ok);
    }

    fn last_error(&self) -> Option<LogError> {
        self.0.lock().unwrap().last_error()
    }

    fn clear_error(&mut self) {
        self.0.lock().unwrap().clear_error();
    }

    fn flush_if_due(&mut self, now_ms: u64) {
        self.0.lock().unwrap().flush_if_due(now_ms);
    }

    fn current_size(&self) -> u64 {
        self.0.lock().unwrap().current_size()
    }

    fn size_at_last_rewrite(&self) -> u64 {
        self.0.lock().unwrap().size_at_last_rewrite()
    }
}

/// Replica-stream handle shared between the test and the server.
#[derive(Clone)]
pub struct SharedReplicas(pub Arc<Mutex<StaticReplicas>>);

impl SharedReplicas {
    pub fn new(count: usize, good: usize) -> Self {
        Self(Arc::new(Mutex::new(StaticReplicas::new(count, good))))
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.0.lock().unwrap().frames().to_vec()
    }

    pub fn ack_all(&self) {
        self.0.lock().unwrap().ack_all();
    }
}

impl ReplicaStream for SharedReplicas {
    fn replica_count(&self) -> usize {
        self.0.lock().unwrap().replica_count()
    }

    fn good_replica_count(&self) -> usize {
        self.0.lock().unwrap().good_replica_count()
    }

    fn has_backlog(&self) -> bool {
        self.0.lock().unwrap().has_backlog()
    }

    fn feed(&mut self, db: i32, args: &[Bytes]) {
        self.0.lock().unwrap().feed(db, args);
    }

    fn stream_offset(&self) -> u64 {
        self.0.lock().unwrap().stream_offset()
    }

    fn acked_count(&self, offset: u64) -> usize {
        self.0.lock().unwrap().acked_count(offset)
    }

    fn pending_acks(&self) -> bool {
        self.0.lock().unwrap().pending_acks()
    }

    fn trim_backlog(&mut self, budget_bytes: usize) -> usize {
        self.0.lock().unwrap().trim_backlog(budget_bytes)
    }
}

/// Background-jobs handle shared between the test and the server.
#[derive(Clone)]
pub struct SharedJobs(pub Arc<Mutex<InlineJobs>>);

impl SharedJobs {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(InlineJobs::new())))
    }

    pub fn spawned(&self) -> Vec<JobKind> {
        self.0.lock().unwrap().spawned.clone()
    }
}

impl BackgroundJobs for SharedJobs {
    fn active(&self) -> Option<JobKind> {
        self.0.lock().unwrap().active()
    }

    fn spawn(&mut self, kind: JobKind) -> bool {
        self.0.lock().unwrap().spawn(kind)
    }

    fn poll_completed(&mut self) -> Option<CompletedJob> {
        self.0.lock().unwrap().poll_completed()
    }
}

/// A server wired to shared-handle collaborators.
pub struct Harness {
    pub server: Server,
    pub log: SharedLog,
    pub replicas: SharedReplicas,
    pub jobs: SharedJobs,
}

pub fn harness() -> Harness {
    harness_with_config(Config::default())
}

pub fn harness_with_config(config: Config) -> Harness {
    let log = SharedLog::active();
    let replicas = SharedReplicas::new(2, 2);
    let jobs = SharedJobs::new();
    let server = Server::new(config)
        .with_log(log.clone())
        .with_replicas(replicas.clone())
        .with_jobs(jobs.clone());
    Harness {
        server,
        log,
        replicas,
        jobs,
    }
}
