//! Bounded poll-wait, turning asynchronous platform state transitions
//! (radio enabled, device bonded, discovery finished) into a synchronous
//! success/timeout result.

use std::time::Duration;

use log::trace;

use crate::{Error, Result};

/// Interval between two evaluations of a poll predicate
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Radio on/off toggles
pub const TOGGLE_TIMEOUT: Duration = Duration::from_secs(30);
pub const PAIRING_TIMEOUT: Duration = Duration::from_secs(120);
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(120);
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(120);
pub const SCAN_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Re-evaluates `predicate` every [`POLL_INTERVAL`] until it returns `true`
/// or `timeout` has elapsed.
///
/// The predicate is always evaluated at least once, so a zero timeout is a
/// single check. Returns `Ok(false)` on timeout. If the predicate itself
/// fails the wait is aborted with [`Error::Predicate`] wrapping the cause.
///
/// Only the calling task is suspended; there is no way to cancel a wait
/// other than dropping the future.
pub async fn wait_until<F>(mut predicate: F, timeout: Duration) -> Result<bool>
    where F: FnMut() -> Result<bool>
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate().map_err(|err| Error::Predicate(Box::new(err)))? {
            return Ok(true);
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            trace!("poll wait gave up after {:?}", timeout);
            return Ok(false);
        }
        tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
    }
}

/// Same contract as [`wait_until`] but blocks the calling thread.
///
/// Meant for callers that live outside of a tokio runtime, such as a
/// platform callback thread that needs to wait on some other state.
pub fn wait_until_blocking<F>(mut predicate: F, timeout: Duration) -> Result<bool>
    where F: FnMut() -> Result<bool>
{
    let deadline = std::time::Instant::now() + timeout;
    loop {
        if predicate().map_err(|err| Error::Predicate(Box::new(err)))? {
            return Ok(true);
        }
        let now = std::time::Instant::now();
        if now >= deadline {
            return Ok(false);
        }
        std::thread::sleep(POLL_INTERVAL.min(deadline - now));
    }
}

/// Like [`wait_until`] but reports a timeout as [`Error::Timeout`] so that
/// callers can tell "the platform never finished" apart from "the platform
/// said no".
pub async fn wait_for<F>(what: &str, predicate: F, timeout: Duration) -> Result<()>
    where F: FnMut() -> Result<bool>
{
    if wait_until(predicate, timeout).await? {
        Ok(())
    } else {
        Err(Error::Timeout { what: what.to_string(), timeout })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use anyhow::anyhow;
    use tokio::time::Instant;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn already_true_returns_without_sleeping() {
        let start = Instant::now();
        let mut calls = 0;
        let done = wait_until(|| {
                                  calls += 1;
                                  Ok(true)
                              },
                              Duration::from_secs(10)).await
                                                      .unwrap();
        assert!(done);
        assert_eq!(calls, 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_timeout_evaluates_exactly_once() {
        let mut calls = 0;
        let done = wait_until(|| {
                                  calls += 1;
                                  Ok(false)
                              },
                              Duration::ZERO).await
                                             .unwrap();
        assert!(!done);
        assert_eq!(calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn never_true_gives_up_within_one_interval_of_timeout() {
        for secs in [1u64, 3, 7] {
            let timeout = Duration::from_secs(secs);
            let start = Instant::now();
            assert!(!wait_until(|| Ok(false), timeout).await.unwrap());
            let elapsed = start.elapsed();
            assert!(elapsed >= timeout);
            assert!(elapsed <= timeout + POLL_INTERVAL);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn predicate_flipping_mid_wait_succeeds_early() {
        let start = Instant::now();
        let done = wait_until(|| Ok(start.elapsed() >= Duration::from_secs(2)),
                              Duration::from_secs(5)).await
                                                     .unwrap();
        assert!(done);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed <= Duration::from_secs(2) + POLL_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn predicate_failure_is_wrapped_not_swallowed() {
        let calls = AtomicU32::new(0);
        let result = wait_until(|| {
                                    if calls.fetch_add(1, Ordering::SeqCst) == 2 {
                                        Err(Error::Other(anyhow!("radio crashed")))
                                    } else {
                                        Ok(false)
                                    }
                                },
                                Duration::from_secs(5)).await;
        match result {
            Err(Error::Predicate(cause)) => assert_eq!(cause.to_string(), "radio crashed"),
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_reports_a_distinct_timeout() {
        let err = wait_for("the radio", || Ok(false), Duration::from_secs(1)).await
                                                                           .unwrap_err();
        assert!(matches!(err, Error::Timeout { ref what, .. } if what == "the radio"));
    }

    #[test]
    fn blocking_variant_honours_the_same_contract() {
        let mut calls = 0;
        assert!(!wait_until_blocking(|| {
                                         calls += 1;
                                         Ok(false)
                                     },
                                     Duration::ZERO).unwrap());
        assert_eq!(calls, 1);

        let start = std::time::Instant::now();
        assert!(wait_until_blocking(|| Ok(start.elapsed() >= Duration::from_millis(250)),
                                    Duration::from_secs(5)).unwrap());
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
