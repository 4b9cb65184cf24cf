//! Proactive renewal scheduling.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Default lead time between a proactive renewal and the real expiry.
pub const DEFAULT_SAFETY_MARGIN: Duration = Duration::from_secs(30);

/// Default lower bound on the renewal delay.
pub const DEFAULT_MIN_DELAY: Duration = Duration::from_secs(1);

/// Upper bound on any scheduled delay. Credential lifetimes come from the
/// backend and are not trusted to fit in an [`Instant`].
pub const MAX_DELAY: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `delay` from now, capped at [`MAX_DELAY`].
pub(crate) fn deadline_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay.min(MAX_DELAY))
        .or_else(|| now.checked_add(Duration::from_secs(86_400)))
        .unwrap_or(now)
}

/// The single outstanding proactive renewal.
#[derive(Debug)]
struct ScheduledRenewal {
    fire_at: Instant,
    cancel: CancellationToken,
}

/// Schedules a renewal ahead of the credential's known or assumed expiry.
///
/// The clock does not renew by itself: when the timer fires it runs the
/// action supplied to [`CredentialClock::arm`].
#[derive(Debug)]
pub struct CredentialClock {
    safety_margin: Duration,
    min_delay: Duration,
    slot: Mutex<Option<ScheduledRenewal>>,
}

impl CredentialClock {
    pub fn new(safety_margin: Duration, min_delay: Duration) -> Self {
        Self {
            safety_margin,
            min_delay,
            slot: Mutex::new(None),
        }
    }

    /// Delay before renewing a credential that expires in `expires_in`.
    pub fn renewal_delay(&self, expires_in: Duration) -> Duration {
        expires_in
            .saturating_sub(self.safety_margin)
            .max(self.min_delay)
            .min(MAX_DELAY)
    }

    /// Replace any scheduled renewal with one that runs `on_fire` after
    /// [`renewal_delay`](Self::renewal_delay). Returns the fire time.
    ///
    /// Must be called within a tokio runtime.
    pub fn arm<F, Fut>(&self, expires_in: Duration, on_fire: F) -> Instant
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let delay = self.renewal_delay(expires_in);
        let fire_at = deadline_after(delay);
        let cancel = CancellationToken::new();

        let previous = self.slot.lock().replace(ScheduledRenewal {
            fire_at,
            cancel: cancel.clone(),
        });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }

        debug!(?expires_in, ?delay, "Proactive renewal scheduled");

        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    trace!("Scheduled renewal cancelled");
                }
                _ = tokio::time::sleep_until(fire_at) => {
                    debug!("Proactive renewal timer fired");
                    on_fire().await;
                }
            }
        });

        fire_at
    }

    /// Cancel the scheduled renewal. Returns whether one was pending.
    pub fn disarm(&self) -> bool {
        match self.slot.lock().take() {
            Some(scheduled) => {
                scheduled.cancel.cancel();
                debug!("Proactive renewal disarmed");
                true
            }
            None => false,
        }
    }

    /// When the scheduled renewal fires, if one is armed.
    pub fn scheduled_at(&self) -> Option<Instant> {
        self.slot.lock().as_ref().map(|s| s.fire_at)
    }

    #[inline]
    pub fn is_armed(&self) -> bool {
        self.slot.lock().is_some()
    }

    #[inline]
    pub fn safety_margin(&self) -> Duration {
        self.safety_margin
    }

    #[inline]
    pub fn min_delay(&self) -> Duration {
        self.min_delay
    }
}

impl Default for CredentialClock {
    fn default() -> Self {
        Self::new(DEFAULT_SAFETY_MARGIN, DEFAULT_MIN_DELAY)
    }
}

impl Drop for CredentialClock {
    fn drop(&mut self) {
        if let Some(scheduled) = self.slot.get_mut().take() {
            scheduled.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_renewal_delay_bounds() {
        let clock = CredentialClock::default();
        assert_eq!(
            clock.renewal_delay(Duration::from_secs(600)),
            Duration::from_secs(570)
        );
        // Shorter than the safety margin: clamp to the minimum delay.
        assert_eq!(clock.renewal_delay(Duration::from_secs(10)), DEFAULT_MIN_DELAY);
        assert_eq!(clock.renewal_delay(Duration::ZERO), DEFAULT_MIN_DELAY);
        assert_eq!(
            clock.renewal_delay(Duration::from_millis(31_500)),
            Duration::from_millis(1_500)
        );
        assert_eq!(clock.renewal_delay(Duration::MAX), MAX_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_arm_with_unbounded_expiry() {
        let clock = CredentialClock::default();
        let start = Instant::now();
        let fire_at = clock.arm(Duration::MAX, || async {});
        assert_eq!(fire_at - start, MAX_DELAY);
        assert!(clock.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_delay() {
        let clock = CredentialClock::default();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);

        let start = Instant::now();
        let fire_at = clock.arm(Duration::from_secs(90), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fire_at - start, Duration::from_secs(60));
        assert_eq!(clock.scheduled_at(), Some(fire_at));

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_cancels_previous_timer() {
        let clock = CredentialClock::default();
        let fired = Arc::new(AtomicUsize::new(0));

        let first = Arc::clone(&fired);
        clock.arm(Duration::from_secs(40), move || async move {
            first.fetch_add(1, Ordering::SeqCst);
        });
        let second = Arc::clone(&fired);
        clock.arm(Duration::from_secs(120), move || async move {
            second.fetch_add(100, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarm_prevents_fire() {
        let clock = CredentialClock::default();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);

        clock.arm(Duration::from_secs(35), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(clock.is_armed());
        assert!(clock.disarm());
        assert!(!clock.is_armed());
        assert!(!clock.disarm());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
