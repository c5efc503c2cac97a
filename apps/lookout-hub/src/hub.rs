//! Fan-out of one upstream session to every attached dashboard.
//!
//! All hub state lives in a single task. Connections, the feed session and the restart timer
//! only talk to it through [`HubCommand`]s, so the subscriber set and the session bookkeeping
//! need no locks.

use std::{collections::HashMap, ops::ControlFlow, time::Duration};

use lookout_core::{BlockEvent, StreamMessage};
use metrics::{counter, gauge};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        oneshot,
    },
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    feed::{BlockFeed, FeedSink, SessionEnd, SessionId},
    settings::SettingsSource,
};

pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum HubCommand {
    Attach {
        id: Uuid,
        outbound: mpsc::Sender<String>,
    },
    Detach {
        id: Uuid,
    },
    Block {
        session: SessionId,
        block: BlockEvent,
    },
    SessionEnded {
        session: SessionId,
        end: SessionEnd,
    },
    RestartDue,
    Stats(oneshot::Sender<HubStats>),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HubPhase {
    Idle,
    Streaming,
    RestartPending,
}

#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    pub phase: HubPhase,
    pub subscribers: usize,
    pub upstream_active: bool,
    pub last_level: Option<u64>,
    pub sessions_started: u64,
    pub blocks_broadcast: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
    pub closed: usize,
}

pub struct FanoutHub<F, S> {
    feed: F,
    settings: S,
    subscribers: HashMap<Uuid, mpsc::Sender<String>>,
    phase: HubPhase,
    current_session: Option<SessionId>,
    next_session: SessionId,
    restart_delay: Duration,
    restart_timer: Option<JoinHandle<()>>,
    commands: mpsc::UnboundedSender<HubCommand>,
    last_level: Option<u64>,
    sessions_started: u64,
    blocks_broadcast: u64,
}

impl<F: BlockFeed, S: SettingsSource> FanoutHub<F, S> {
    pub fn new(
        feed: F,
        settings: S,
        restart_delay: Duration,
        commands: mpsc::UnboundedSender<HubCommand>,
    ) -> Self {
        Self {
            feed,
            settings,
            subscribers: HashMap::new(),
            phase: HubPhase::Idle,
            current_session: None,
            next_session: 1,
            restart_delay,
            restart_timer: None,
            commands,
            last_level: None,
            sessions_started: 0,
            blocks_broadcast: 0,
        }
    }

    /// Builds the hub and runs it on its own task.
    pub fn spawn(feed: F, settings: S, restart_delay: Duration) -> (HubHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let hub = Self::new(feed, settings, restart_delay, tx.clone());
        let task = tokio::spawn(hub.run(rx));
        (HubHandle { commands: tx }, task)
    }

    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<HubCommand>) {
        while let Some(command) = commands.recv().await {
            if self.handle(command).is_break() {
                break;
            }
        }
        self.shutdown();
        debug!("hub task finished");
    }

    pub fn handle(&mut self, command: HubCommand) -> ControlFlow<()> {
        match command {
            HubCommand::Attach { id, outbound } => self.attach(id, outbound),
            HubCommand::Detach { id } => self.detach(id),
            HubCommand::Block { session, block } => self.on_block(session, block),
            HubCommand::SessionEnded { session, end } => self.on_session_ended(session, end),
            HubCommand::RestartDue => self.on_restart_due(),
            HubCommand::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
            HubCommand::Shutdown => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    pub fn attach(&mut self, id: Uuid, outbound: mpsc::Sender<String>) {
        if self.subscribers.insert(id, outbound).is_some() {
            debug!(subscriber_id = %id, "subscriber re-attached");
            return;
        }
        gauge!("lookout_subscribers", self.subscribers.len() as f64);
        info!(
            subscriber_id = %id,
            subscribers = self.subscribers.len(),
            "subscriber attached"
        );

        if self.phase == HubPhase::Idle {
            self.phase = HubPhase::Streaming;
            self.start_session();
        }
    }

    pub fn detach(&mut self, id: Uuid) {
        if self.subscribers.remove(&id).is_none() {
            return;
        }
        gauge!("lookout_subscribers", self.subscribers.len() as f64);
        info!(
            subscriber_id = %id,
            subscribers = self.subscribers.len(),
            "subscriber detached"
        );

        if self.subscribers.is_empty() {
            self.cancel_restart();
            self.feed.stop();
            self.current_session = None;
            self.phase = HubPhase::Idle;
        }
    }

    pub fn on_block(&mut self, session: SessionId, block: BlockEvent) {
        if self.current_session != Some(session) {
            debug!(session_id = session, level = block.level, "dropping block from stale session");
            return;
        }
        self.broadcast(block);
    }

    /// Sends one block to every subscriber without waiting on any of them.
    pub fn broadcast(&mut self, block: BlockEvent) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let level = block.level;
        let payload = match StreamMessage::block(block, OffsetDateTime::now_utc()).to_json() {
            Ok(payload) => payload,
            Err(err) => {
                error!(level, error = %err, "failed to encode block message");
                return report;
            }
        };

        for (id, outbound) in &self.subscribers {
            match outbound.try_send(payload.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    report.dropped += 1;
                    counter!("lookout_subscriber_drops_total", 1);
                    warn!(subscriber_id = %id, level, "subscriber queue full; dropping block");
                }
                Err(TrySendError::Closed(_)) => {
                    report.closed += 1;
                    warn!(subscriber_id = %id, level, "failed to deliver block to subscriber");
                }
            }
        }

        self.last_level = Some(level);
        self.blocks_broadcast += 1;
        counter!("lookout_blocks_broadcast_total", 1);
        debug!(
            level,
            delivered = report.delivered,
            dropped = report.dropped,
            closed = report.closed,
            "broadcast block"
        );
        report
    }

    pub fn on_session_ended(&mut self, session: SessionId, end: SessionEnd) {
        if self.current_session != Some(session) {
            debug!(session_id = session, ?end, "ignoring end of stale session");
            return;
        }
        self.current_session = None;
        self.feed.reap(session);

        if self.subscribers.is_empty() {
            self.phase = HubPhase::Idle;
            return;
        }

        info!(
            session_id = session,
            ?end,
            delay_ms = self.restart_delay.as_millis() as u64,
            "upstream session ended; scheduling restart"
        );
        self.schedule_restart();
        self.phase = HubPhase::RestartPending;
    }

    pub fn on_restart_due(&mut self) {
        if self.phase != HubPhase::RestartPending {
            return;
        }
        self.restart_timer = None;
        if self.subscribers.is_empty() {
            self.phase = HubPhase::Idle;
            return;
        }
        self.phase = HubPhase::Streaming;
        self.start_session();
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            phase: self.phase,
            subscribers: self.subscribers.len(),
            upstream_active: self.feed.is_active(),
            last_level: self.last_level,
            sessions_started: self.sessions_started,
            blocks_broadcast: self.blocks_broadcast,
        }
    }

    pub fn phase(&self) -> HubPhase {
        self.phase
    }

    pub fn shutdown(&mut self) {
        self.cancel_restart();
        self.feed.stop();
        self.current_session = None;
        self.subscribers.clear();
        self.phase = HubPhase::Idle;
    }

    fn start_session(&mut self) {
        // Read per attempt so a settings change applies on the next restart.
        let node_url = self.settings.node_url();
        let session = self.next_session;
        self.next_session += 1;

        let sink = FeedSink::new(session, self.commands.clone());
        if self.feed.start(&node_url, sink) {
            self.current_session = Some(session);
            self.sessions_started += 1;
        }
    }

    fn schedule_restart(&mut self) {
        self.cancel_restart();
        let commands = self.commands.clone();
        let delay = self.restart_delay;
        self.restart_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = commands.send(HubCommand::RestartDue);
        }));
    }

    fn cancel_restart(&mut self) {
        if let Some(timer) = self.restart_timer.take() {
            timer.abort();
        }
    }
}

/// Cloneable front door to a running hub.
#[derive(Debug, Clone)]
pub struct HubHandle {
    commands: mpsc::UnboundedSender<HubCommand>,
}

impl HubHandle {
    pub fn attach(&self, id: Uuid, outbound: mpsc::Sender<String>) {
        if self.commands.send(HubCommand::Attach { id, outbound }).is_err() {
            warn!(subscriber_id = %id, "hub is not running; attach ignored");
        }
    }

    pub fn detach(&self, id: Uuid) {
        let _ = self.commands.send(HubCommand::Detach { id });
    }

    pub async fn stats(&self) -> Option<HubStats> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(HubCommand::Stats(tx)).ok()?;
        rx.await.ok()
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(HubCommand::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{HubSettings, SharedSettings};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use time::macros::datetime;

    #[derive(Default)]
    struct FeedLog {
        starts: Vec<String>,
        stops: usize,
        sink: Option<FeedSink>,
    }

    #[derive(Clone, Default)]
    struct RecordingFeed {
        log: Arc<Mutex<FeedLog>>,
    }

    impl RecordingFeed {
        fn starts(&self) -> usize {
            self.log.lock().starts.len()
        }

        fn stops(&self) -> usize {
            self.log.lock().stops
        }

        fn session(&self) -> SessionId {
            self.log
                .lock()
                .sink
                .as_ref()
                .map(FeedSink::session)
                .expect("session running")
        }

        fn end_session(&self, end: SessionEnd) {
            let sink = self.log.lock().sink.take().expect("session running");
            sink.finish(end);
        }
    }

    impl BlockFeed for RecordingFeed {
        fn start(&mut self, node_url: &str, sink: FeedSink) -> bool {
            let mut log = self.log.lock();
            log.starts.push(node_url.to_string());
            if log.sink.is_some() || node_url.is_empty() {
                return false;
            }
            log.sink = Some(sink);
            true
        }

        fn stop(&mut self) {
            let mut log = self.log.lock();
            log.stops += 1;
            log.sink = None;
        }

        fn reap(&mut self, session: SessionId) {
            let mut log = self.log.lock();
            if log.sink.as_ref().map(FeedSink::session) == Some(session) {
                log.sink = None;
            }
        }

        fn is_active(&self) -> bool {
            self.log.lock().sink.is_some()
        }
    }

    type TestHub = FanoutHub<RecordingFeed, SharedSettings>;

    fn test_hub(node_url: &str) -> (TestHub, RecordingFeed, mpsc::UnboundedReceiver<HubCommand>) {
        let feed = RecordingFeed::default();
        let (tx, rx) = mpsc::unbounded_channel();
        let settings = SharedSettings::new(HubSettings::new(node_url));
        let hub = FanoutHub::new(feed.clone(), settings, DEFAULT_RESTART_DELAY, tx);
        (hub, feed, rx)
    }

    fn pump(hub: &mut TestHub, rx: &mut mpsc::UnboundedReceiver<HubCommand>) {
        while let Ok(command) = rx.try_recv() {
            let _ = hub.handle(command);
        }
    }

    fn subscriber(buffer: usize) -> (Uuid, mpsc::Sender<String>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Uuid::new_v4(), tx, rx)
    }

    fn block(level: u64) -> BlockEvent {
        BlockEvent::new(level, format!("BL{level}"), datetime!(2024-05-01 12:00:00 UTC))
    }

    #[tokio::test]
    async fn session_follows_first_attach_and_last_detach() {
        let (mut hub, feed, mut rx) = test_hub("http://node:8732");
        let (a, a_tx, _a_rx) = subscriber(4);
        let (b, b_tx, _b_rx) = subscriber(4);

        hub.attach(a, a_tx);
        assert_eq!(hub.phase(), HubPhase::Streaming);
        hub.attach(b, b_tx);
        hub.detach(a);
        assert!(feed.is_active());
        assert_eq!(hub.phase(), HubPhase::Streaming);
        hub.detach(b);
        pump(&mut hub, &mut rx);

        assert_eq!(feed.starts(), 1);
        assert_eq!(feed.stops(), 1);
        assert_eq!(hub.phase(), HubPhase::Idle);
        assert!(!feed.is_active());
    }

    #[tokio::test]
    async fn detaching_unknown_subscriber_is_a_no_op() {
        let (mut hub, feed, _rx) = test_hub("http://node:8732");
        let (a, a_tx, _a_rx) = subscriber(4);

        hub.detach(Uuid::new_v4());
        assert_eq!(feed.stops(), 0);

        hub.attach(a, a_tx);
        hub.detach(a);
        hub.detach(a);
        assert_eq!(feed.stops(), 1);
    }

    #[tokio::test]
    async fn broadcast_survives_a_dead_subscriber() {
        let (mut hub, _feed, _rx) = test_hub("http://node:8732");
        let (healthy, healthy_tx, mut healthy_rx) = subscriber(4);
        let (dead, dead_tx, dead_rx) = subscriber(4);
        drop(dead_rx);

        hub.attach(healthy, healthy_tx);
        hub.attach(dead, dead_tx);
        let report = hub.broadcast(block(42));

        assert_eq!(report.delivered, 1);
        assert_eq!(report.closed, 1);
        let payload = healthy_rx.try_recv().expect("healthy subscriber got the block");
        let StreamMessage::Block(message) = StreamMessage::from_json(&payload).unwrap();
        assert_eq!(message.block.level, 42);
        assert_eq!(hub.stats().subscribers, 2);
    }

    #[tokio::test]
    async fn full_subscriber_queue_drops_instead_of_blocking() {
        let (mut hub, _feed, _rx) = test_hub("http://node:8732");
        let (slow, slow_tx, mut slow_rx) = subscriber(1);
        hub.attach(slow, slow_tx);

        assert_eq!(hub.broadcast(block(1)).delivered, 1);
        assert_eq!(hub.broadcast(block(2)).dropped, 1);
        assert!(slow_rx.try_recv().unwrap().contains("\"level\":1"));
        assert!(slow_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn blocks_from_stale_sessions_are_ignored() {
        let (mut hub, feed, mut rx) = test_hub("http://node:8732");
        let (a, a_tx, mut a_rx) = subscriber(4);
        hub.attach(a, a_tx);
        let session = feed.session();

        hub.on_block(session + 100, block(9));
        assert!(a_rx.try_recv().is_err());

        hub.on_block(session, block(10));
        pump(&mut hub, &mut rx);
        assert!(a_rx.try_recv().unwrap().contains("\"level\":10"));
        assert_eq!(hub.stats().last_level, Some(10));
    }

    #[tokio::test(start_paused = true)]
    async fn spontaneous_end_restarts_after_delay_while_subscribed() {
        let (mut hub, feed, mut rx) = test_hub("http://node:8732");
        let (a, a_tx, _a_rx) = subscriber(4);
        hub.attach(a, a_tx);

        feed.end_session(SessionEnd::Failed("connection reset".into()));
        pump(&mut hub, &mut rx);
        assert_eq!(hub.phase(), HubPhase::RestartPending);
        assert!(!feed.is_active());

        tokio::time::sleep(DEFAULT_RESTART_DELAY - Duration::from_millis(10)).await;
        pump(&mut hub, &mut rx);
        assert_eq!(feed.starts(), 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        pump(&mut hub, &mut rx);
        assert_eq!(feed.starts(), 2);
        assert_eq!(hub.phase(), HubPhase::Streaming);
        assert!(feed.is_active());
        assert_eq!(hub.stats().sessions_started, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn last_detach_cancels_pending_restart() {
        let (mut hub, feed, mut rx) = test_hub("http://node:8732");
        let (a, a_tx, _a_rx) = subscriber(4);
        hub.attach(a, a_tx);

        feed.end_session(SessionEnd::Completed);
        pump(&mut hub, &mut rx);
        hub.detach(a);

        tokio::time::sleep(DEFAULT_RESTART_DELAY * 2).await;
        pump(&mut hub, &mut rx);
        assert_eq!(feed.starts(), 1);
        assert_eq!(hub.phase(), HubPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_reads_the_current_node_url() {
        let feed = RecordingFeed::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let settings = SharedSettings::new(HubSettings::new("http://old:8732"));
        let mut hub = FanoutHub::new(feed.clone(), settings.clone(), DEFAULT_RESTART_DELAY, tx);
        let (a, a_tx, _a_rx) = subscriber(4);
        hub.attach(a, a_tx);

        settings.set_node_url("http://new:8732");
        feed.end_session(SessionEnd::Completed);
        pump(&mut hub, &mut rx);
        tokio::time::sleep(DEFAULT_RESTART_DELAY + Duration::from_millis(10)).await;
        pump(&mut hub, &mut rx);

        assert_eq!(
            feed.log.lock().starts,
            vec!["http://old:8732".to_string(), "http://new:8732".to_string()]
        );
    }

    #[tokio::test]
    async fn unconfigured_node_url_keeps_accepting_subscribers() {
        let (mut hub, feed, mut rx) = test_hub("");
        let (a, a_tx, _a_rx) = subscriber(4);
        let (b, b_tx, _b_rx) = subscriber(4);

        hub.attach(a, a_tx);
        hub.attach(b, b_tx);
        pump(&mut hub, &mut rx);

        let stats = hub.stats();
        assert_eq!(stats.subscribers, 2);
        assert!(!stats.upstream_active);
        assert_eq!(stats.phase, HubPhase::Streaming);
        assert_eq!(feed.starts(), 1);
    }

    #[tokio::test]
    async fn handle_round_trips_stats_and_shutdown() {
        let feed = RecordingFeed::default();
        let settings = SharedSettings::new(HubSettings::new("http://node:8732"));
        let (handle, task) = FanoutHub::spawn(feed.clone(), settings, DEFAULT_RESTART_DELAY);
        let (a, a_tx, _a_rx) = subscriber(4);

        handle.attach(a, a_tx);
        let stats = handle.stats().await.expect("hub running");
        assert_eq!(stats.subscribers, 1);
        assert!(stats.upstream_active);

        handle.shutdown();
        task.await.unwrap();
        assert_eq!(feed.stops(), 1);
        assert!(handle.stats().await.is_none());
    }
}
