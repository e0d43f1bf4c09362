//! Liveness timing: the read deadline and the ping cadence derived from it.

use std::time::Duration;

use tokio::time::Instant;

/// Ping interval for a read deadline: 90 % of the window, so a pong can
/// arrive before the deadline passes.
pub fn ping_interval(pong_wait: Duration) -> Duration {
    (pong_wait * 9 / 10).max(Duration::from_millis(1))
}

/// Read deadline refreshed by every pong.
#[derive(Debug, Clone, Copy)]
pub struct ReadDeadline {
    window: Duration,
    at: Instant,
}

impl ReadDeadline {
    /// A deadline `window` from now.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            at: Instant::now() + window,
        }
    }

    /// Push the deadline to `window` from now.
    pub fn refresh(&mut self) {
        self.at = Instant::now() + self.window;
    }

    /// Current deadline.
    pub fn instant(&self) -> Instant {
        self.at
    }

    /// Whether the deadline has passed.
    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_is_ninety_percent_of_window() {
        assert_eq!(ping_interval(Duration::from_secs(10)), Duration::from_secs(9));
        assert_eq!(ping_interval(Duration::from_millis(100)), Duration::from_millis(90));
        assert_eq!(ping_interval(Duration::ZERO), Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expires_without_refresh() {
        let deadline = ReadDeadline::new(Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(!deadline.expired());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(deadline.expired());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_extends_deadline() {
        let mut deadline = ReadDeadline::new(Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(8)).await;
        deadline.refresh();
        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(!deadline.expired());
        assert_eq!(deadline.instant() - Instant::now(), Duration::from_secs(2));
    }
}
