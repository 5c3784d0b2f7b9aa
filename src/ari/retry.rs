//! Reconnect policy for the ARI event socket.

use crate::constants::ARI_RECONNECT_DELAY;
use std::time::Duration;

/// How the event socket redials after a drop.
///
/// Reconnection is deliberately plain: a fixed pause between attempts,
/// forever by default. The event socket is the process's lifeline and
/// Asterisk restarts are routine, so giving up is opt-in.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Retry {
    /// Pause between reconnection attempts.
    pub(crate) delay: Duration,
    /// Consecutive failed attempts tolerated before giving up, or
    /// `None` to keep dialling.
    pub(crate) retry_limit: Option<usize>,
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            delay: ARI_RECONNECT_DELAY,
            retry_limit: None,
        }
    }
}

impl Retry {
    /// How long to wait before attempt `attempts + 1`, or `None` once
    /// the limit is spent.
    pub(crate) fn retry_in(&self, attempts: usize) -> Option<Duration> {
        match self.retry_limit {
            Some(limit) if attempts >= limit => None,
            _ => Some(self.delay),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_redials_forever_at_fixed_delay() {
        let retry = Retry::default();

        assert_eq!(retry.retry_in(0), Some(ARI_RECONNECT_DELAY));
        assert_eq!(retry.retry_in(1_000_000), Some(ARI_RECONNECT_DELAY));
    }

    #[test]
    fn limit_exhausts_retries() {
        let retry = Retry {
            delay: Duration::from_secs(1),
            retry_limit: Some(3),
        };

        assert_eq!(retry.retry_in(2), Some(Duration::from_secs(1)));
        assert_eq!(retry.retry_in(3), None);
        assert_eq!(retry.retry_in(10), None);
    }
}
