//! Upstream block-head feed.
//!
//! One session holds a single streaming `GET /monitor/heads/main` against the chain node,
//! splits the newline-delimited JSON body into head records and forwards every new level to
//! the hub. The feed never restarts on its own; the hub decides whether a session should
//! exist.

use futures_util::StreamExt;
use lookout_core::BlockEvent;
use metrics::counter;
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::hub::HubCommand;

pub const HEADS_PATH: &str = "/monitor/heads/main";

pub type SessionId = u64;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("upstream returned status {0}")]
    Status(reqwest::StatusCode),
}

#[derive(Debug, Error)]
pub enum HeadParseError {
    #[error("head line is not valid utf-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("invalid block header: {0}")]
    Json(#[from] serde_json::Error),
}

/// How an upstream session finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    Completed,
    Cancelled,
    Failed(String),
}

/// A source of block events the hub can switch on and off.
///
/// Implementations own their transport exclusively. `start` must be idempotent and must not
/// spawn a second session while one is running.
pub trait BlockFeed: Send + 'static {
    /// Opens a session against `node_url`. Returns `true` when a new session was started.
    fn start(&mut self, node_url: &str, sink: FeedSink) -> bool;

    /// Cancels the running session, if any.
    fn stop(&mut self);

    /// Forgets a session that ended on its own.
    fn reap(&mut self, session: SessionId);

    fn is_active(&self) -> bool;
}

/// Path from one upstream session back into the hub.
///
/// Dropping the sink reports the end of the session, so the hub hears about every exit path,
/// including a panicking session task.
#[derive(Debug)]
pub struct FeedSink {
    session: SessionId,
    commands: mpsc::UnboundedSender<HubCommand>,
    end: Option<SessionEnd>,
}

impl FeedSink {
    pub(crate) fn new(session: SessionId, commands: mpsc::UnboundedSender<HubCommand>) -> Self {
        Self {
            session,
            commands,
            end: None,
        }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn emit(&self, block: BlockEvent) {
        let _ = self.commands.send(HubCommand::Block {
            session: self.session,
            block,
        });
    }

    pub fn finish(mut self, end: SessionEnd) {
        self.end = Some(end);
    }
}

impl Drop for FeedSink {
    fn drop(&mut self) {
        let end = self
            .end
            .take()
            .unwrap_or_else(|| SessionEnd::Failed("session task aborted".into()));
        let _ = self.commands.send(HubCommand::SessionEnded {
            session: self.session,
            end,
        });
    }
}

/// Splits a chunked byte stream into `\n`-terminated lines.
///
/// Bytes are buffered until a newline arrives, so a record or a multi-byte character split
/// across chunks is reassembled before decoding.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        // Buffered bytes never hold a newline, so only the new chunk needs scanning.
        let mut scan = self.pending.len();
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.pending[scan..].iter().position(|byte| *byte == b'\n') {
            let end = scan + offset;
            lines.push(self.pending[start..end].to_vec());
            start = end + 1;
            scan = start;
        }
        self.pending.drain(..start);
        lines
    }

    pub fn remainder(&self) -> &[u8] {
        &self.pending
    }
}

#[derive(Debug)]
pub enum LineOutcome {
    Emit(BlockEvent),
    Duplicate(u64),
    Blank,
    Malformed(HeadParseError),
}

/// Per-session head state. `last_emitted_level` starts empty for every session.
#[derive(Debug, Default)]
pub struct HeadSession {
    last_emitted_level: Option<u64>,
}

impl HeadSession {
    pub fn ingest(&mut self, line: &[u8]) -> LineOutcome {
        let text = match std::str::from_utf8(line) {
            Ok(text) => text.trim(),
            Err(err) => return LineOutcome::Malformed(err.into()),
        };
        if text.is_empty() {
            return LineOutcome::Blank;
        }

        let block: BlockEvent = match serde_json::from_str(text) {
            Ok(block) => block,
            Err(err) => return LineOutcome::Malformed(err.into()),
        };

        // The node re-announces the current head on some transitions; only the immediately
        // preceding level is compared, so a reorg to a lower level still goes through.
        if self.last_emitted_level == Some(block.level) {
            return LineOutcome::Duplicate(block.level);
        }
        self.last_emitted_level = Some(block.level);
        LineOutcome::Emit(block)
    }

    pub fn last_emitted_level(&self) -> Option<u64> {
        self.last_emitted_level
    }
}

struct ActiveSession {
    session: SessionId,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Streams block heads from an Octez node over HTTP.
pub struct HttpBlockFeed {
    client: reqwest::Client,
    active: Option<ActiveSession>,
}

impl HttpBlockFeed {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            active: None,
        }
    }
}

impl BlockFeed for HttpBlockFeed {
    fn start(&mut self, node_url: &str, sink: FeedSink) -> bool {
        if self.is_active() {
            debug!("upstream head stream already running");
            return false;
        }

        let base = node_url.trim().trim_end_matches('/');
        if base.is_empty() {
            error!("no node URL configured; upstream head stream not started");
            return false;
        }

        let url = format!("{base}{HEADS_PATH}");
        let session = sink.session();
        let cancel = CancellationToken::new();
        info!(session_id = session, url = %url, "connecting to upstream head stream");
        counter!("lookout_upstream_sessions_total", 1);

        let task = tokio::spawn(run_session(self.client.clone(), url, cancel.clone(), sink));
        self.active = Some(ActiveSession {
            session,
            cancel,
            task,
        });
        true
    }

    fn stop(&mut self) {
        if let Some(active) = self.active.take() {
            if !active.task.is_finished() {
                info!(
                    session_id = active.session,
                    "disconnecting from upstream head stream"
                );
            }
            active.cancel.cancel();
        }
    }

    fn reap(&mut self, session: SessionId) {
        if self
            .active
            .as_ref()
            .is_some_and(|active| active.session == session)
        {
            self.active = None;
        }
    }

    fn is_active(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| !active.task.is_finished())
    }
}

async fn run_session(
    client: reqwest::Client,
    url: String,
    cancel: CancellationToken,
    sink: FeedSink,
) {
    let session = sink.session();
    let end = tokio::select! {
        _ = cancel.cancelled() => {
            info!(session_id = session, "upstream head stream aborted");
            SessionEnd::Cancelled
        }
        result = stream_heads(&client, &url, &sink) => match result {
            Ok(()) => {
                info!(session_id = session, "upstream head stream ended");
                SessionEnd::Completed
            }
            Err(err) => {
                warn!(session_id = session, error = %err, "upstream head stream failed");
                SessionEnd::Failed(err.to_string())
            }
        },
    };
    sink.finish(end);
}

async fn stream_heads(
    client: &reqwest::Client,
    url: &str,
    sink: &FeedSink,
) -> Result<(), FeedError> {
    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(FeedError::Status(status));
    }

    let session_id = sink.session();
    let mut body = response.bytes_stream();
    let mut lines = LineBuffer::default();
    let mut session = HeadSession::default();

    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        for line in lines.push(&chunk) {
            match session.ingest(&line) {
                LineOutcome::Emit(block) => {
                    debug!(session_id, level = block.level, "new block head");
                    sink.emit(block);
                }
                LineOutcome::Duplicate(level) => {
                    trace!(session_id, level, "skipping repeated head");
                }
                LineOutcome::Blank => {}
                LineOutcome::Malformed(err) => {
                    counter!("lookout_upstream_parse_failures_total", 1);
                    warn!(
                        session_id,
                        error = %err,
                        line = %String::from_utf8_lossy(&line),
                        "failed to parse block head"
                    );
                }
            }
        }
    }

    if !lines.remainder().is_empty() {
        debug!(
            session_id,
            bytes = lines.remainder().len(),
            "discarding unterminated trailing line"
        );
    }
    Ok(())
}
