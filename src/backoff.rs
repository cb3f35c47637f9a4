/// Exponential backoff calculator for crash-triggered container recreation.
///
/// Tracks the current delay and attempt count. The delay is multiplied
/// after each crash, capped at `max_delay`. Calling `reset()` returns the
/// delay to `initial_delay` (used once a container has run stably).
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: u32,
    current_delay: Duration,
    /// Number of consecutive attempts (resets on `reset()`).
    pub attempt: u32,
}

impl Backoff {
    pub fn new(initial_delay: Duration, max_delay: Duration, multiplier: u32) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier,
            current_delay: initial_delay,
            attempt: 0,
        }
    }

    /// Returns the current delay and advances the state.
    /// The delay is multiplied (up to `max_delay`) for the next call.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_delay.min(self.max_delay);
        self.attempt += 1;
        self.current_delay = (self.current_delay * self.multiplier).min(self.max_delay);
        delay
    }

    /// The delay the next `next_delay()` call would return.
    pub fn peek(&self) -> Duration {
        self.current_delay.min(self.max_delay)
    }

    pub fn reset(&mut self) {
        self.current_delay = self.initial_delay;
        self.attempt = 0;
    }
}
