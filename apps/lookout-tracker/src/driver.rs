use std::{future::Future, pin::Pin, time::Duration};

use futures_util::StreamExt;
use lookout_core::{unix_millis, StreamMessage};
use time::OffsetDateTime;
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{interval, sleep, sleep_until, Instant, Interval, MissedTickBehavior, Sleep},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    backoff::ReconnectBackoff,
    state::{CloseInitiator, TrackerSnapshot, TrackerState, NEW_BLOCK_PULSE},
};

const AGE_TICK: Duration = Duration::from_secs(1);

type HubSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingOpen = Pin<Box<dyn Future<Output = Result<HubSocket, WsError>> + Send>>;

/// Where the channel to the hub currently stands. At most one socket exists at a time.
enum Link {
    Idle,
    Connecting(PendingOpen),
    Open(Box<HubSocket>),
    Waiting(Pin<Box<Sleep>>),
}

enum LinkEvent {
    Opened(HubSocket),
    OpenFailed(WsError),
    Frame(Message),
    Closed(Option<WsError>),
    RetryDue,
}

impl Link {
    fn is_live(&self) -> bool {
        matches!(self, Link::Connecting(_) | Link::Open(_))
    }

    async fn next_event(&mut self) -> LinkEvent {
        match self {
            Link::Idle => std::future::pending().await,
            Link::Connecting(pending) => match pending.as_mut().await {
                Ok(socket) => LinkEvent::Opened(socket),
                Err(err) => LinkEvent::OpenFailed(err),
            },
            Link::Open(socket) => match socket.next().await {
                Some(Ok(frame)) => LinkEvent::Frame(frame),
                Some(Err(err)) => LinkEvent::Closed(Some(err)),
                None => LinkEvent::Closed(None),
            },
            Link::Waiting(retry) => {
                retry.as_mut().await;
                LinkEvent::RetryDue
            }
        }
    }
}

#[derive(Debug)]
enum TrackerCommand {
    Connect,
}

/// Keeps one reconnecting websocket to the hub and derives the dashboard view from it.
///
/// Building a tracker only records where to connect; [`spawn`](Self::spawn) starts a single
/// task that owns link events, the 1 s age ticker, the new-block pulse and teardown.
/// Observers read [`TrackerSnapshot`]s from a watch channel.
#[derive(Debug, Clone)]
pub struct BlockStreamTracker {
    endpoint: Url,
    backoff: ReconnectBackoff,
}

impl BlockStreamTracker {
    pub fn new(endpoint: Url) -> Self {
        Self::with_backoff(endpoint, ReconnectBackoff::default())
    }

    pub fn with_backoff(endpoint: Url, backoff: ReconnectBackoff) -> Self {
        Self { endpoint, backoff }
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Starts the tracker task and opens the first connection. Must be called from within a
    /// tokio runtime.
    pub fn spawn(self) -> TrackerHandle {
        let state = TrackerState::new(self.backoff);
        let (snapshot_tx, snapshots) = watch::channel(state.snapshot());
        let mut ticker = interval(AGE_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let task = TrackerTask {
            endpoint: self.endpoint,
            state,
            link: Link::Idle,
            snapshots: snapshot_tx,
            clock: TrackerClock::start(),
            ticker,
            pulse: None,
        };

        let cancel = CancellationToken::new();
        let (commands, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(task.run(rx, cancel.clone()));
        TrackerHandle {
            snapshots,
            commands,
            cancel,
            task: Some(task),
        }
    }
}

/// Wall-clock milliseconds advanced by the runtime's monotonic clock, so age ticks and the
/// age they compute agree to the millisecond.
#[derive(Debug, Clone, Copy)]
struct TrackerClock {
    wall_origin_ms: i64,
    origin: Instant,
}

impl TrackerClock {
    fn start() -> Self {
        Self {
            wall_origin_ms: unix_millis(OffsetDateTime::now_utc()),
            origin: Instant::now(),
        }
    }

    fn now_ms(&self) -> i64 {
        self.wall_origin_ms + self.origin.elapsed().as_millis() as i64
    }
}

/// Delay until the block age next crosses a whole second.
fn until_next_whole_second(age_ms: i64) -> Duration {
    Duration::from_millis((1_000 - age_ms.rem_euclid(1_000)) as u64)
}

struct TrackerTask {
    endpoint: Url,
    state: TrackerState,
    link: Link,
    snapshots: watch::Sender<TrackerSnapshot>,
    clock: TrackerClock,
    ticker: Interval,
    pulse: Option<Pin<Box<Sleep>>>,
}

async fn pulse_elapsed(pulse: &mut Option<Pin<Box<Sleep>>>) {
    match pulse {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

impl TrackerTask {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<TrackerCommand>,
        cancel: CancellationToken,
    ) {
        self.connect();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.ticker.tick() => {
                    self.state.tick(self.clock.now_ms());
                    self.publish();
                }
                () = pulse_elapsed(&mut self.pulse), if self.pulse.is_some() => {
                    self.pulse = None;
                    self.state.clear_pulse();
                    self.publish();
                }
                Some(TrackerCommand::Connect) = commands.recv() => self.connect(),
                event = self.link.next_event() => self.on_link_event(event),
            }
        }

        self.teardown().await;
    }

    /// Opens a channel unless one is already open or opening. A pending reconnect wait is
    /// skipped.
    fn connect(&mut self) {
        if self.link.is_live() {
            return;
        }
        debug!(endpoint = %self.endpoint, "opening block stream");
        let request = self.endpoint.as_str().to_owned();
        self.link = Link::Connecting(Box::pin(async move {
            connect_async(request).await.map(|(socket, _response)| socket)
        }));
    }

    fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Opened(socket) => {
                info!(endpoint = %self.endpoint, "block stream connected");
                self.link = Link::Open(Box::new(socket));
                self.state.on_open();
                self.publish();
            }
            LinkEvent::OpenFailed(err) => {
                warn!(endpoint = %self.endpoint, error = %err, "block stream connect failed");
                self.on_remote_close();
            }
            LinkEvent::Frame(Message::Text(text)) => self.on_text(text.as_str()),
            LinkEvent::Frame(Message::Close(frame)) => {
                debug!(?frame, "hub closed block stream");
            }
            LinkEvent::Frame(other) => {
                debug!(kind = frame_kind(&other), "ignoring non-text frame");
            }
            LinkEvent::Closed(err) => {
                match err {
                    Some(err) => warn!(error = %err, "block stream errored"),
                    None => info!("block stream closed"),
                }
                self.on_remote_close();
            }
            LinkEvent::RetryDue => {
                self.link = Link::Idle;
                self.connect();
            }
        }
    }

    fn on_text(&mut self, text: &str) {
        match StreamMessage::from_json(text) {
            Ok(StreamMessage::Block(message)) => {
                debug!(level = message.block.level, hash = %message.block.hash, "block received");
                let now_ms = self.clock.now_ms();
                self.state.on_message(&message, now_ms);
                if let Some(age_ms) = self.state.block_age_ms(now_ms) {
                    self.ticker.reset_at(Instant::now() + until_next_whole_second(age_ms));
                }
                let pulse_deadline = Instant::now() + NEW_BLOCK_PULSE;
                match self.pulse.as_mut() {
                    Some(pulse) => pulse.as_mut().reset(pulse_deadline),
                    None => self.pulse = Some(Box::pin(sleep_until(pulse_deadline))),
                }
                self.publish();
            }
            Err(err) => warn!(error = %err, "ignoring undecodable block stream frame"),
        }
    }

    fn on_remote_close(&mut self) {
        self.link = Link::Idle;
        if let Some(delay) = self.state.on_close(CloseInitiator::Remote) {
            debug!(delay_ms = delay.as_millis() as u64, "scheduling reconnect");
            self.link = Link::Waiting(Box::pin(sleep(delay)));
        }
        self.publish();
    }

    async fn teardown(&mut self) {
        if let Link::Open(mut socket) = std::mem::replace(&mut self.link, Link::Idle) {
            if let Err(err) = socket.close(None).await {
                debug!(error = %err, "block stream close handshake failed");
            }
        }
        self.pulse = None;
        self.state.clear_pulse();
        self.state.on_close(CloseInitiator::Caller);
        self.publish();
        debug!(endpoint = %self.endpoint, "block stream tracker stopped");
    }

    fn publish(&self) {
        let next = self.state.snapshot();
        self.snapshots.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

fn frame_kind(frame: &Message) -> &'static str {
    match frame {
        Message::Text(_) => "text",
        Message::Binary(_) => "binary",
        Message::Ping(_) => "ping",
        Message::Pong(_) => "pong",
        Message::Close(_) => "close",
        Message::Frame(_) => "raw",
    }
}

/// Owner's side of a running tracker. Dropping it tears the tracker down without waiting.
pub struct TrackerHandle {
    snapshots: watch::Receiver<TrackerSnapshot>,
    commands: mpsc::UnboundedSender<TrackerCommand>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl TrackerHandle {
    pub fn subscribe(&self) -> watch::Receiver<TrackerSnapshot> {
        self.snapshots.clone()
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Asks for a connection now. No-op while one is open or opening.
    pub fn connect(&self) {
        let _ = self.commands.send(TrackerCommand::Connect);
    }

    /// Cancels pending timers, closes the channel and waits for the final snapshot.
    pub async fn shutdown(mut self) -> TrackerSnapshot {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!(error = %err, "block stream tracker task failed");
            }
        }
        self.snapshots.borrow().clone()
    }
}

impl Drop for TrackerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
