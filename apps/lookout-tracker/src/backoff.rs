use std::time::Duration;

pub const RECONNECT_FLOOR: Duration = Duration::from_millis(1_000);
pub const RECONNECT_CEILING: Duration = Duration::from_millis(30_000);

/// Doubling reconnect delay, clamped to `[floor, ceiling]`, no jitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectBackoff {
    current: Duration,
    floor: Duration,
    ceiling: Duration,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(RECONNECT_FLOOR, RECONNECT_CEILING)
    }
}

impl ReconnectBackoff {
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        let ceiling = ceiling.max(floor);
        Self {
            current: floor,
            floor,
            ceiling,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.floor;
    }

    /// Returns the delay to wait now and doubles the stored delay for the attempt after.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = delay.saturating_mul(2).clamp(self.floor, self.ceiling);
        delay
    }
}
