use std::pin::Pin;
use std::time::Duration;

use tokio::time::{Instant, Sleep};

/// Number of fast consecutive updates required before hang detection arms.
const INIT_TARGET: u32 = 10;

/// Classification of the watchdog's state at the moment its timer fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogCondition {
    /// Updates are arriving as expected (or the init window is still open).
    Healthy,
    /// The init window closed before enough fast updates arrived. Hang
    /// detection never armed; advisory, not fatal.
    Uninitialized {
        ticks: u32,
        target: u32,
        since_last: Duration,
    },
    /// Hang detection was armed and an update failed to arrive in time.
    /// Fatal: the server is wedged even though the process still exists.
    Timeout { since_last: Duration },
}

/// Liveness monitor for a server that signals health by updating its console
/// title every game tick. Engine errors suspend the game thread, so once
/// updates have been arriving quickly, their absence means a hang that no
/// process-level check can see.
///
/// Owned by the run loop alone; all state is plain `&mut`.
#[derive(Debug)]
pub struct Watchdog {
    init_count: u32,
    initialized: bool,
    last: Instant,
    init_deadline: Instant,
    interval: Duration,
    timer: Pin<Box<Sleep>>,
    armed: bool,
}

impl Watchdog {
    /// Create the watchdog with its init window open. `interval` is both
    /// the maximum spacing of "fast" updates during init and the steady
    /// timeout afterwards.
    pub fn new(init_timeout: Duration, interval: Duration) -> Watchdog {
        let now = Instant::now();
        Watchdog {
            init_count: 0,
            initialized: false,
            last: now,
            init_deadline: now + init_timeout,
            interval,
            timer: Box::pin(tokio::time::sleep(init_timeout)),
            armed: true,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Record one valid update. During init, an update arriving `interval`
    /// or more after the previous one restarts the consecutive count (but
    /// not the init window). Reaching the target arms steady-state hang
    /// detection; from then on every update pushes the timer out.
    pub fn record_update(&mut self) {
        let now = Instant::now();
        let previous = std::mem::replace(&mut self.last, now);

        if self.initialized {
            self.timer.as_mut().reset(now + self.interval);
            self.armed = true;
        } else if now.duration_since(previous) >= self.interval {
            self.init_count = 0;
        } else {
            self.init_count += 1;
            if self.init_count >= INIT_TARGET {
                self.initialized = true;
                self.timer.as_mut().reset(now + self.interval);
                self.armed = true;
            }
        }
    }

    /// Resolves when the timer fires: at the end of the init window, or
    /// `interval` after the last update once initialized. Pending forever
    /// while disarmed, so it is safe to poll in a `select!` arm.
    pub async fn triggered(&mut self) {
        if !self.armed {
            return std::future::pending().await;
        }
        self.timer.as_mut().await;
        self.armed = false;
    }

    /// Classify the current state. Call after `triggered` resolves to
    /// decide between the advisory and the fatal condition.
    pub fn condition(&self) -> WatchdogCondition {
        let since_last = self.last.elapsed();
        if self.initialized {
            if since_last >= self.interval {
                WatchdogCondition::Timeout { since_last }
            } else {
                WatchdogCondition::Healthy
            }
        } else if Instant::now() >= self.init_deadline {
            WatchdogCondition::Uninitialized {
                ticks: self.init_count,
                target: INIT_TARGET,
                since_last,
            }
        } else {
            WatchdogCondition::Healthy
        }
    }

    /// Disarm the timer. The watchdog reports nothing further.
    pub fn stop(&mut self) {
        self.armed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    const INIT_TIMEOUT: Duration = Duration::from_secs(240);
    const INTERVAL: Duration = Duration::from_secs(1);

    #[tokio::test(start_paused = true)]
    async fn ten_fast_updates_initialize() {
        let mut wd = Watchdog::new(INIT_TIMEOUT, INTERVAL);
        for _ in 0..10 {
            advance(Duration::from_millis(50)).await;
            wd.record_update();
        }
        assert!(wd.is_initialized());
        assert_eq!(wd.condition(), WatchdogCondition::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn a_slow_update_resets_the_consecutive_count() {
        let mut wd = Watchdog::new(INIT_TIMEOUT, INTERVAL);
        for _ in 0..5 {
            advance(Duration::from_millis(50)).await;
            wd.record_update();
        }
        advance(Duration::from_millis(1500)).await;
        wd.record_update();
        for _ in 0..5 {
            advance(Duration::from_millis(50)).await;
            wd.record_update();
        }
        assert!(!wd.is_initialized());
    }

    #[tokio::test(start_paused = true)]
    async fn withheld_updates_after_init_trigger_a_timeout() {
        let mut wd = Watchdog::new(INIT_TIMEOUT, INTERVAL);
        for _ in 0..10 {
            advance(Duration::from_millis(50)).await;
            wd.record_update();
        }
        assert!(wd.is_initialized());

        // No further updates; the steady timer fires.
        wd.triggered().await;
        assert!(matches!(
            wd.condition(),
            WatchdogCondition::Timeout { since_last } if since_last >= INTERVAL
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn updates_keep_pushing_the_steady_timer_out() {
        let mut wd = Watchdog::new(INIT_TIMEOUT, INTERVAL);
        for _ in 0..10 {
            advance(Duration::from_millis(50)).await;
            wd.record_update();
        }

        for _ in 0..20 {
            advance(Duration::from_millis(500)).await;
            wd.record_update();
        }
        assert_eq!(wd.condition(), WatchdogCondition::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn init_window_expiry_is_reported_as_uninitialized() {
        let mut wd = Watchdog::new(INIT_TIMEOUT, INTERVAL);
        for _ in 0..3 {
            advance(Duration::from_millis(50)).await;
            wd.record_update();
        }

        wd.triggered().await;
        assert!(matches!(
            wd.condition(),
            WatchdogCondition::Uninitialized { ticks: 3, target: 10, .. }
        ));

        // The trigger is one-shot; the watchdog stays quiet afterwards.
        let fired = tokio::time::timeout(Duration::from_secs(600), wd.triggered()).await;
        assert!(fired.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn late_initialization_after_window_expiry_still_arms() {
        let mut wd = Watchdog::new(INIT_TIMEOUT, INTERVAL);
        wd.triggered().await;
        assert!(!wd.is_initialized());

        // The first update after the long silence only restarts the count.
        for _ in 0..11 {
            advance(Duration::from_millis(50)).await;
            wd.record_update();
        }
        assert!(wd.is_initialized());

        wd.triggered().await;
        assert!(matches!(wd.condition(), WatchdogCondition::Timeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_disarms_the_timer() {
        let mut wd = Watchdog::new(INIT_TIMEOUT, INTERVAL);
        wd.stop();
        let fired = tokio::time::timeout(Duration::from_secs(600), wd.triggered()).await;
        assert!(fired.is_err());
    }
}
