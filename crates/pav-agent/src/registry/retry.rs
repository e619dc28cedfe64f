//! Retry pacing for the registry's reconcile loops.
//!
//! Transient orchestrator failures are retried after an exponentially
//! growing delay: 100 ms after the first failure, doubling up to a 30 s
//! ceiling. A success resets the cadence, so a healthy loop always
//! reacts at full speed.

use std::cmp;
use std::time::Duration;

const FIRST_DELAY: Duration = Duration::from_millis(100);
const MAX_DELAY: Duration = Duration::from_secs(30);
// 2^9 * 100 ms already clears MAX_DELAY; larger exponents add nothing.
const DOUBLING_LIMIT: u32 = 9;

/// Counts consecutive failures of one reconcile loop and sleeps out the
/// corresponding delay before the next attempt.
#[derive(Default)]
pub(crate) struct Retry {
    consecutive_failures: u32,
}

impl Retry {
    /// Forgets the failure streak; the next delay starts over at the
    /// base.
    pub(crate) fn succeeded(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Records a failure and waits until the loop may try again.
    pub(crate) async fn failed(&mut self) {
        tokio::time::sleep(self.next_delay()).await;
    }

    fn next_delay(&mut self) -> Duration {
        let exponent = cmp::min(self.consecutive_failures, DOUBLING_LIMIT);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        cmp::min(FIRST_DELAY * 2u32.pow(exponent), MAX_DELAY)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn delays_double_from_the_base() {
        let mut retry = Retry::default();
        assert_eq!(retry.next_delay(), Duration::from_millis(100));
        assert_eq!(retry.next_delay(), Duration::from_millis(200));
        assert_eq!(retry.next_delay(), Duration::from_millis(400));
    }

    #[test]
    fn delays_never_exceed_the_ceiling() {
        let mut retry = Retry::default();
        let longest = (0..40).map(|_| retry.next_delay()).max().unwrap();
        assert_eq!(longest, Duration::from_secs(30));
    }

    #[test]
    fn a_success_restarts_the_cadence() {
        let mut retry = Retry::default();
        retry.next_delay();
        retry.next_delay();
        retry.next_delay();
        retry.succeeded();
        assert_eq!(retry.next_delay(), Duration::from_millis(100));
    }
}
