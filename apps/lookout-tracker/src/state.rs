use std::{fmt, time::Duration};

use lookout_core::{seconds_between, unix_millis, BlockEvent, NormalizedBlockMessage};

use crate::backoff::ReconnectBackoff;

pub const NEW_BLOCK_PULSE: Duration = Duration::from_millis(500);

/// Who closed the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseInitiator {
    /// The tracker was torn down; no reconnect.
    Caller,
    /// The hub, the network or a failed open; reconnect with backoff.
    Remote,
}

/// What a dashboard renders from the block stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackerSnapshot {
    pub latest_block: Option<BlockEvent>,
    /// Hub clock minus block time; positive when the hub is ahead of the chain.
    pub server_drift_ms: Option<i64>,
    /// Local clock minus block time at receipt.
    pub browser_drift_ms: Option<i64>,
    pub seconds_since_block: u64,
    pub is_connected: bool,
    pub is_new_block: bool,
    pub reconnect_delay_ms: u64,
}

impl fmt::Display for TrackerSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let link = if self.is_connected {
            "connected"
        } else {
            "disconnected"
        };
        let Some(block) = &self.latest_block else {
            return write!(f, "[{link}] waiting for first block");
        };
        write!(
            f,
            "[{link}] level {} {} age {}s",
            block.level, block.hash, self.seconds_since_block
        )?;
        if let (Some(server), Some(local)) = (self.server_drift_ms, self.browser_drift_ms) {
            write!(f, " drift hub {server:+}ms local {local:+}ms")?;
        }
        if self.is_new_block {
            write!(f, " *")?;
        }
        Ok(())
    }
}

/// Display state of one tracker. Only the tracker's own event handlers and timer touch it;
/// every method takes the current time so the math stays deterministic under test.
#[derive(Debug, Clone, Default)]
pub struct TrackerState {
    latest_block: Option<BlockEvent>,
    block_time_ms: Option<i64>,
    server_drift_ms: Option<i64>,
    browser_drift_ms: Option<i64>,
    seconds_since_block: u64,
    is_connected: bool,
    is_new_block: bool,
    backoff: ReconnectBackoff,
}

impl TrackerState {
    pub fn new(backoff: ReconnectBackoff) -> Self {
        Self {
            backoff,
            ..Self::default()
        }
    }

    pub fn on_open(&mut self) {
        self.is_connected = true;
        self.backoff.reset();
    }

    pub fn on_message(&mut self, message: &NormalizedBlockMessage, now_ms: i64) {
        let block_time_ms = unix_millis(message.block.timestamp);
        let server_time_ms = unix_millis(message.server_time);

        self.server_drift_ms = Some(server_time_ms - block_time_ms);
        self.browser_drift_ms = Some(now_ms - block_time_ms);
        self.block_time_ms = Some(block_time_ms);
        self.latest_block = Some(message.block.clone());
        self.seconds_since_block = seconds_between(block_time_ms, now_ms);
        self.is_new_block = true;
    }

    /// Marks the channel closed. Returns the reconnect delay unless the caller closed it.
    pub fn on_close(&mut self, initiator: CloseInitiator) -> Option<Duration> {
        self.is_connected = false;
        match initiator {
            CloseInitiator::Caller => None,
            CloseInitiator::Remote => Some(self.backoff.next_delay()),
        }
    }

    pub fn tick(&mut self, now_ms: i64) {
        if let Some(block_time_ms) = self.block_time_ms {
            self.seconds_since_block = seconds_between(block_time_ms, now_ms);
        }
    }

    /// Milliseconds since the latest block's timestamp; negative while the block is ahead
    /// of the local clock.
    pub fn block_age_ms(&self, now_ms: i64) -> Option<i64> {
        self.block_time_ms.map(|block_time_ms| now_ms - block_time_ms)
    }

    pub fn clear_pulse(&mut self) {
        self.is_new_block = false;
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected
    }

    pub fn reconnect_delay(&self) -> Duration {
        self.backoff.current()
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        TrackerSnapshot {
            latest_block: self.latest_block.clone(),
            server_drift_ms: self.server_drift_ms,
            browser_drift_ms: self.browser_drift_ms,
            seconds_since_block: self.seconds_since_block,
            is_connected: self.is_connected,
            is_new_block: self.is_new_block,
            reconnect_delay_ms: self.backoff.current().as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::{RECONNECT_CEILING, RECONNECT_FLOOR};
    use time::{macros::datetime, Duration as TimeDuration, OffsetDateTime};

    const BLOCK_TIME: OffsetDateTime = datetime!(2024-05-01 12:00:00.000 UTC);

    fn message(server_offset_ms: i64) -> NormalizedBlockMessage {
        NormalizedBlockMessage {
            block: BlockEvent::new(5_000_000, "BLhead", BLOCK_TIME),
            server_time: BLOCK_TIME + TimeDuration::milliseconds(server_offset_ms),
        }
    }

    fn block_ms() -> i64 {
        unix_millis(BLOCK_TIME)
    }

    #[test]
    fn drift_is_exact_to_the_millisecond() {
        let mut state = TrackerState::default();
        state.on_message(&message(1_234), block_ms() + 2_345);

        let snapshot = state.snapshot();
        assert_eq!(snapshot.server_drift_ms, Some(1_234));
        assert_eq!(snapshot.browser_drift_ms, Some(2_345));
        assert_eq!(snapshot.seconds_since_block, 2);
        assert!(snapshot.is_new_block);
    }

    #[test]
    fn clocks_behind_the_chain_give_negative_drift_and_zero_age() {
        let mut state = TrackerState::default();
        state.on_message(&message(-250), block_ms() - 1_500);

        let snapshot = state.snapshot();
        assert_eq!(snapshot.server_drift_ms, Some(-250));
        assert_eq!(snapshot.browser_drift_ms, Some(-1_500));
        assert_eq!(snapshot.seconds_since_block, 0);
    }

    #[test]
    fn timer_advances_age_without_new_messages() {
        let t0 = block_ms();
        let mut state = TrackerState::default();
        state.on_message(&message(0), t0);

        state.tick(t0 + 3_500);
        assert_eq!(state.snapshot().seconds_since_block, 3);
        state.tick(t0 + 4_000);
        assert_eq!(state.snapshot().seconds_since_block, 4);
    }

    #[test]
    fn block_age_is_signed_and_absent_before_first_block() {
        let mut state = TrackerState::default();
        assert_eq!(state.block_age_ms(block_ms()), None);

        state.on_message(&message(0), block_ms() + 2_300);
        assert_eq!(state.block_age_ms(block_ms() + 2_300), Some(2_300));
        assert_eq!(state.block_age_ms(block_ms() - 40), Some(-40));
    }

    #[test]
    fn tick_before_first_block_keeps_zero_age() {
        let mut state = TrackerState::default();
        state.tick(block_ms() + 60_000);
        assert_eq!(state.snapshot().seconds_since_block, 0);
        assert!(state.snapshot().latest_block.is_none());
    }

    #[test]
    fn remote_closes_back_off_and_open_resets() {
        let mut state = TrackerState::default();
        state.on_open();
        assert!(state.is_connected());

        let delays: Vec<_> = (0..7)
            .map(|_| state.on_close(CloseInitiator::Remote).unwrap())
            .collect();
        assert_eq!(delays[0], RECONNECT_FLOOR);
        assert_eq!(delays[1], RECONNECT_FLOOR * 2);
        assert!(delays.iter().all(|d| *d <= RECONNECT_CEILING));
        assert_eq!(state.reconnect_delay(), RECONNECT_CEILING);
        assert!(!state.is_connected());

        state.on_open();
        assert_eq!(state.reconnect_delay(), RECONNECT_FLOOR);
    }

    #[test]
    fn caller_close_does_not_schedule_reconnect() {
        let mut state = TrackerState::default();
        state.on_open();
        assert_eq!(state.on_close(CloseInitiator::Caller), None);
        assert!(!state.snapshot().is_connected);
        assert_eq!(state.reconnect_delay(), RECONNECT_FLOOR);
    }

    #[test]
    fn pulse_clears_independently_of_block_state() {
        let mut state = TrackerState::default();
        state.on_message(&message(0), block_ms());
        state.clear_pulse();

        let snapshot = state.snapshot();
        assert!(!snapshot.is_new_block);
        assert_eq!(snapshot.latest_block.unwrap().level, 5_000_000);
    }

    #[test]
    fn status_line_shows_level_age_and_drift() {
        let mut state = TrackerState::default();
        assert_eq!(
            state.snapshot().to_string(),
            "[disconnected] waiting for first block"
        );

        state.on_open();
        state.on_message(&message(120), block_ms() + 3_300);
        assert_eq!(
            state.snapshot().to_string(),
            "[connected] level 5000000 BLhead age 3s drift hub +120ms local +3300ms *"
        );
    }
}
