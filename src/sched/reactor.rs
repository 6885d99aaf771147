//! The reactor loop.
//!
//! One current-thread task owns the server context and multiplexes the two
//! scheduler timers with the I/O bridge queue. The pre-sleep hook runs
//! before every await point and its decision controls whether the loop may
//! park at all; the post-sleep hook runs right after. I/O worker threads
//! never touch the context — they hand parsed commands over the channel and
//! receive structured outcomes back.

use crate::admission::Admission;
use crate::client::{Client, ClientId};
use crate::core::config::{HZ_MAX, HZ_MIN};
use crate::core::time::unix_ms;
use crate::sched::CronOutcome;
use crate::server::Server;
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

/// Events handed to the reactor by the I/O workers.
#[derive(Debug)]
pub enum ReactorEvent {
    Connected {
        id: ClientId,
        from_primary: bool,
        replica_link: bool,
    },
    /// One parsed command for a connected client.
    Input { id: ClientId, argv: Vec<Bytes> },
    Disconnected { id: ClientId },
}

/// The single-threaded reactor driving admission, invocation and the
/// scheduler.
pub struct Reactor {
    server: Server,
    events: mpsc::Receiver<ReactorEvent>,
    replies: mpsc::UnboundedSender<(ClientId, Admission)>,
}

impl Reactor {
    pub fn new(
        server: Server,
        events: mpsc::Receiver<ReactorEvent>,
        replies: mpsc::UnboundedSender<(ClientId, Admission)>,
    ) -> Self {
        Self {
            server,
            events,
            replies,
        }
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    pub fn server_mut(&mut self) -> &mut Server {
        &mut self.server
    }

    /// Run until shutdown sequencing completes or the event channel closes.
    /// Returns the server context for inspection.
    pub async fn run(mut self) -> Server {
        let hz = self.server.config.server.hz.clamp(HZ_MIN, HZ_MAX) as u64;
        let mut cron = tokio::time::interval(Duration::from_millis(1000 / hz));
        cron.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let target_rate = self.server.config.clients.target_visit_rate.max(1) as u64;
        let clients_sleep = tokio::time::sleep(Duration::from_millis(1000 / target_rate));
        tokio::pin!(clients_sleep);

        tracing::info!(hz, "reactor started");
        loop {
            let decision = self.server.before_sleep();
            // Completed I/O work is drained in a bounded batch before the
            // loop may park, so a full bridge never waits on a timer.
            self.drain_ready_events();
            self.drain_outbox();

            if decision.should_block {
                tokio::select! {
                    _ = cron.tick() => {
                        if self.server.cron_tick() == CronOutcome::Exit {
                            break;
                        }
                    }
                    () = &mut clients_sleep => {
                        let delay = self.server.clients_tick();
                        clients_sleep.as_mut().reset(tokio::time::Instant::now() + delay);
                    }
                    event = self.events.recv() => match event {
                        Some(event) => self.handle_event(event),
                        None => {
                            tracing::info!("event channel closed, stopping reactor");
                            break;
                        }
                    }
                }
            } else {
                // Buffered output or pending acks downstream: service due
                // work without parking.
                tokio::select! {
                    biased;
                    _ = cron.tick() => {
                        if self.server.cron_tick() == CronOutcome::Exit {
                            break;
                        }
                    }
                    () = &mut clients_sleep => {
                        let delay = self.server.clients_tick();
                        clients_sleep.as_mut().reset(tokio::time::Instant::now() + delay);
                    }
                    event = self.events.recv() => match event {
                        Some(event) => self.handle_event(event),
                        None => {
                            tracing::info!("event channel closed, stopping reactor");
                            break;
                        }
                    },
                    _ = std::future::ready(()) => {
                        tokio::task::yield_now().await;
                    }
                }
            }

            self.server.after_sleep();
        }

        self.drain_outbox();
        tracing::info!("reactor stopped");
        self.server
    }

    fn handle_event(&mut self, event: ReactorEvent) {
        match event {
            ReactorEvent::Connected {
                id,
                from_primary,
                replica_link,
            } => {
                let mut client = Client::new(id, unix_ms());
                client.from_primary = from_primary;
                client.replica_link = replica_link;
                self.server.clients.insert(client);
            }
            ReactorEvent::Input { id, argv } => {
                self.server.handle_input(id, argv);
                self.drain_outbox();
            }
            ReactorEvent::Disconnected { id } => {
                self.server.unregister_monitor(id);
                self.server.clients.remove(id);
            }
        }
    }

    fn drain_ready_events(&mut self) {
        const DRAIN_BATCH: usize = 64;
        for _ in 0..DRAIN_BATCH {
            match self.events.try_recv() {
                Ok(event) => self.handle_event(event),
                Err(_) => break,
            }
        }
    }

    fn drain_outbox(&mut self) {
        for (id, admission) in self.server.take_outbox() {
            // A closed reply channel only matters to the protocol layer.
            let _ = self.replies.send((id, admission));
        }
    }
}
