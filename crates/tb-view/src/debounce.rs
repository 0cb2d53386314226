use std::time::{Duration, Instant};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

/// Coalesces edits made within `delay` of each other into one applied value.
/// Time is passed in by the caller.
#[derive(Debug, Clone)]
pub struct Debounced<T> {
    applied: T,
    pending: Option<(T, Instant)>,
    delay: Duration,
}

impl<T: Clone + PartialEq> Debounced<T> {
    pub fn new(initial: T, delay: Duration) -> Self {
        Self {
            applied: initial,
            pending: None,
            delay,
        }
    }

    pub fn applied(&self) -> &T {
        &self.applied
    }

    pub fn pending(&self) -> Option<&T> {
        self.pending.as_ref().map(|(value, _)| value)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|(_, deadline)| *deadline)
    }

    /// Each edit restarts the window.
    pub fn set(&mut self, value: T, now: Instant) {
        if value == self.applied {
            self.pending = None;
            return;
        }
        self.pending = Some((value, now + self.delay));
    }

    /// Applies the pending value once its window has elapsed. Returns true
    /// when the applied value changed.
    pub fn poll(&mut self, now: Instant) -> bool {
        match &self.pending {
            Some((_, deadline)) if *deadline <= now => self.force(),
            _ => false,
        }
    }

    pub fn force(&mut self) -> bool {
        match self.pending.take() {
            Some((value, _)) if value != self.applied => {
                self.applied = value;
                true
            }
            _ => false,
        }
    }

    pub fn cancel(&mut self) {
        self.pending = None;
    }

    /// Replaces the applied value and drops any pending edit.
    pub fn reset(&mut self, value: T) {
        self.applied = value;
        self.pending = None;
    }
}
