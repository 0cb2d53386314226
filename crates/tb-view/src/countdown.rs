use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tb_core::ApprovalRequest;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Countdown {
    pub seconds_remaining: u64,
    /// 100 right after the request, 0 at the deadline.
    pub percent_remaining: u8,
    pub total_seconds: u64,
}

impl Countdown {
    pub fn is_expired(&self) -> bool {
        self.seconds_remaining == 0
    }
}

pub fn compute_countdown(
    requested_at: DateTime<Utc>,
    timeout_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Countdown {
    let remaining = (timeout_at - now).num_milliseconds().div_euclid(1000).max(0);
    let total = (timeout_at - requested_at)
        .num_milliseconds()
        .div_euclid(1000)
        .max(1);
    let percent = ((remaining as f64 / total as f64) * 100.0).round() as i64;
    Countdown {
        seconds_remaining: remaining as u64,
        percent_remaining: percent.clamp(0, 100) as u8,
        total_seconds: total as u64,
    }
}

/// A countdown that stops changing once it hits zero or is paused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountdownTimer {
    requested_at: DateTime<Utc>,
    timeout_at: DateTime<Utc>,
    current: Countdown,
    paused: bool,
}

impl CountdownTimer {
    pub fn new(requested_at: DateTime<Utc>, timeout_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            requested_at,
            timeout_at,
            current: compute_countdown(requested_at, timeout_at, now),
            paused: false,
        }
    }

    pub fn current(&self) -> Countdown {
        self.current
    }

    pub fn is_frozen(&self) -> bool {
        self.paused || self.current.is_expired()
    }

    pub fn tick(&mut self, now: DateTime<Utc>) -> Countdown {
        if !self.is_frozen() {
            self.current = compute_countdown(self.requested_at, self.timeout_at, now);
        }
        self.current
    }

    /// Keeps the last value; it is never reset.
    pub fn pause(&mut self) {
        self.paused = true;
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Ticks once a second until the countdown expires, `pause` turns true or
/// every receiver is dropped.
pub fn spawn_countdown(
    requested_at: DateTime<Utc>,
    timeout_at: DateTime<Utc>,
    clock: Arc<dyn Clock>,
    mut pause: watch::Receiver<bool>,
) -> (watch::Receiver<Countdown>, JoinHandle<()>) {
    let mut timer = CountdownTimer::new(requested_at, timeout_at, clock.now());
    if *pause.borrow_and_update() {
        timer.pause();
    }
    let (tx, rx) = watch::channel(timer.current());

    let handle = tokio::spawn(async move {
        let start = tokio::time::Instant::now() + TICK_INTERVAL;
        let mut interval = tokio::time::interval_at(start, TICK_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pause_open = true;
        while !timer.is_frozen() && !tx.is_closed() {
            tokio::select! {
                _ = interval.tick() => {
                    let value = timer.tick(clock.now());
                    tx.send_if_modified(|current| {
                        if *current == value {
                            return false;
                        }
                        *current = value;
                        true
                    });
                }
                changed = pause.changed(), if pause_open => {
                    match changed {
                        Ok(()) => {
                            if *pause.borrow_and_update() {
                                timer.pause();
                            }
                        }
                        Err(_) => pause_open = false,
                    }
                }
            }
        }
        debug!(
            seconds_remaining = timer.current().seconds_remaining,
            "countdown_stopped"
        );
    });
    (rx, handle)
}

pub trait ApprovalCountdown {
    /// `None` when the request never times out.
    fn countdown(&self, now: DateTime<Utc>) -> Option<Countdown>;
}

impl ApprovalCountdown for ApprovalRequest {
    fn countdown(&self, now: DateTime<Utc>) -> Option<Countdown> {
        self.timeout_at
            .map(|timeout_at| compute_countdown(self.created_at, timeout_at, now))
    }
}

/// A rolling usage-limit window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageWindow {
    pub started_at: DateTime<Utc>,
    pub resets_at: DateTime<Utc>,
}

impl UsageWindow {
    pub fn percent_elapsed(&self, now: DateTime<Utc>) -> u8 {
        let total = (self.resets_at - self.started_at).num_seconds().max(1);
        let elapsed = (now - self.started_at).num_seconds().clamp(0, total);
        ((elapsed as f64 / total as f64) * 100.0).round().clamp(0.0, 100.0) as u8
    }

    pub fn time_until_reset(&self, now: DateTime<Utc>) -> Duration {
        (self.resets_at - now).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.resets_at
    }
}

pub fn format_remaining(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{hours}h {minutes:02}m")
    } else if minutes > 0 {
        format!("{minutes}m {secs:02}s")
    } else {
        format!("{secs}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0)
            .single()
            .expect("timestamp")
    }

    struct PausedClock {
        origin: DateTime<Utc>,
        start: tokio::time::Instant,
    }

    impl Clock for PausedClock {
        fn now(&self) -> DateTime<Utc> {
            let elapsed = chrono::Duration::from_std(self.start.elapsed()).expect("elapsed");
            self.origin + elapsed
        }
    }

    fn paused_clock() -> Arc<dyn Clock> {
        Arc::new(PausedClock {
            origin: at(0),
            start: tokio::time::Instant::now(),
        })
    }

    #[test]
    fn three_quarters_through_a_minute() {
        let countdown = compute_countdown(at(0), at(60), at(45));
        assert_eq!(countdown.seconds_remaining, 15);
        assert_eq!(countdown.percent_remaining, 25);
        assert_eq!(countdown.total_seconds, 60);
    }

    #[test]
    fn stays_in_bounds_across_the_window() {
        for now in 0..=90 {
            let countdown = compute_countdown(at(0), at(90), at(now));
            assert!(countdown.seconds_remaining <= countdown.total_seconds);
            assert!(countdown.percent_remaining <= 100);
        }
        assert_eq!(compute_countdown(at(0), at(90), at(90)).seconds_remaining, 0);
        assert_eq!(compute_countdown(at(0), at(90), at(0)).percent_remaining, 100);
        assert_eq!(
            compute_countdown(at(0), at(90), at(500)),
            Countdown {
                seconds_remaining: 0,
                percent_remaining: 0,
                total_seconds: 90,
            }
        );
    }

    #[test]
    fn degenerate_window_has_a_one_second_total() {
        let countdown = compute_countdown(at(10), at(10), at(10));
        assert_eq!(countdown.total_seconds, 1);
        assert_eq!(countdown.seconds_remaining, 0);
        assert_eq!(countdown.percent_remaining, 0);
    }

    #[test]
    fn partial_seconds_floor() {
        let now = at(0) + chrono::Duration::milliseconds(59_500);
        assert_eq!(compute_countdown(at(0), at(60), now).seconds_remaining, 0);
        let now = at(0) + chrono::Duration::milliseconds(500);
        assert_eq!(compute_countdown(at(0), at(60), now).seconds_remaining, 59);
    }

    #[test]
    fn timer_freezes_on_pause_and_at_zero() {
        let mut timer = CountdownTimer::new(at(0), at(30), at(0));
        timer.tick(at(10));
        timer.pause();
        let frozen = timer.current();
        assert_eq!(frozen.seconds_remaining, 20);
        assert_eq!(timer.tick(at(25)), frozen);
        assert!(timer.is_frozen());

        let mut expiring = CountdownTimer::new(at(0), at(5), at(0));
        assert_eq!(expiring.tick(at(6)).seconds_remaining, 0);
        assert!(expiring.is_frozen());
        assert_eq!(expiring.tick(at(1)).seconds_remaining, 0);
    }

    #[test]
    fn approval_without_timeout_has_no_countdown() {
        let mut request = ApprovalRequest {
            id: "a1".into(),
            tool_call_id: "call-1".into(),
            execution_process_id: "proc-1".into(),
            created_at: at(0),
            timeout_at: None,
        };
        assert_eq!(request.countdown(at(5)), None);
        request.timeout_at = Some(at(20));
        assert_eq!(request.countdown(at(5)).map(|c| c.seconds_remaining), Some(15));
    }

    #[test]
    fn usage_window_progress() {
        let window = UsageWindow {
            started_at: at(0),
            resets_at: at(3600),
        };
        assert_eq!(window.percent_elapsed(at(900)), 25);
        assert_eq!(window.percent_elapsed(at(-10)), 0);
        assert_eq!(window.percent_elapsed(at(7200)), 100);
        assert_eq!(window.time_until_reset(at(3000)), Duration::from_secs(600));
        assert_eq!(window.time_until_reset(at(4000)), Duration::ZERO);
        assert!(window.is_expired(at(3600)));
    }

    #[test]
    fn formats_remaining_time() {
        assert_eq!(format_remaining(3900), "1h 05m");
        assert_eq!(format_remaining(249), "4m 09s");
        assert_eq!(format_remaining(12), "12s");
        assert_eq!(format_remaining(0), "0s");
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_countdown_runs_to_zero_and_stops() {
        let (_pause_tx, pause_rx) = watch::channel(false);
        let (rx, handle) = spawn_countdown(at(0), at(3), paused_clock(), pause_rx);
        assert_eq!(rx.borrow().seconds_remaining, 3);
        handle.await.expect("countdown task");
        assert_eq!(
            *rx.borrow(),
            Countdown {
                seconds_remaining: 0,
                percent_remaining: 0,
                total_seconds: 3,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn pausing_freezes_the_published_value() {
        let (pause_tx, pause_rx) = watch::channel(false);
        let (rx, handle) = spawn_countdown(at(0), at(60), paused_clock(), pause_rx);
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(rx.borrow().seconds_remaining, 58);

        pause_tx.send(true).expect("pause");
        handle.await.expect("countdown task");
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(rx.borrow().seconds_remaining, 58);
        assert_eq!(rx.borrow().percent_remaining, 97);
    }
}
