//! Crash tracking and cool-down before recreation.
//!
//! Each container key keeps a rolling window of recent crashes (OOM kills
//! and non-zero container exits). Every crash inside the window advances an
//! exponential backoff, so repeated crashes wait progressively longer before
//! the next recreate. A key that has run stably for `stability_secs` after
//! its last recreate forgets its history. All state is in memory.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::backoff::Backoff;
use crate::config::HealthConfig;
use crate::container::spec::ContainerKey;

struct CrashHistory {
    crashes: VecDeque<Instant>,
    backoff: Backoff,
    cooldown_until: Option<Instant>,
    started_at: Option<Instant>,
}

/// Health view of one key, for the admin surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStatus {
    pub key: ContainerKey,
    pub recent_crashes: usize,
    pub cooldown_remaining_secs: Option<u64>,
    pub next_delay_secs: u64,
    pub escalated: bool,
}

pub struct HealthMonitor {
    initial_delay: Duration,
    max_delay: Duration,
    window: Duration,
    escalation_threshold: usize,
    stability: Duration,
    histories: Mutex<HashMap<ContainerKey, CrashHistory>>,
}

impl HealthMonitor {
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            initial_delay: Duration::from_secs(config.initial_delay_secs),
            max_delay: Duration::from_secs(config.max_delay_secs),
            window: Duration::from_secs(config.window_secs),
            escalation_threshold: config.escalation_threshold,
            stability: Duration::from_secs(config.stability_secs),
            histories: Mutex::new(HashMap::new()),
        }
    }

    fn new_history(&self) -> CrashHistory {
        CrashHistory {
            crashes: VecDeque::new(),
            backoff: Backoff::new(self.initial_delay, self.max_delay, 2),
            cooldown_until: None,
            started_at: None,
        }
    }

    /// Records a crash at `now` and returns the cool-down to wait before
    /// recreating.
    pub fn record_crash(&self, key: &ContainerKey, now: Instant) -> Duration {
        let mut histories = self.histories.lock();
        let history = histories
            .entry(key.clone())
            .or_insert_with(|| self.new_history());

        while let Some(&oldest) = history.crashes.front() {
            if now.saturating_duration_since(oldest) > self.window {
                history.crashes.pop_front();
            } else {
                break;
            }
        }
        if history.crashes.is_empty() {
            history.backoff.reset();
        }
        history.crashes.push_back(now);

        let delay = history.backoff.next_delay();
        history.cooldown_until = Some(now + delay);
        history.started_at = None;

        let crashes = history.crashes.len();
        if crashes >= self.escalation_threshold {
            warn!(
                key = %key,
                crashes,
                window_secs = self.window.as_secs(),
                "Crash loop detected, cooling down for {}s",
                delay.as_secs()
            );
        } else {
            info!(key = %key, crashes, "Container crashed, cooling down for {}s", delay.as_secs());
        }
        delay
    }

    /// Called when a container for `key` has been (re)created.
    pub fn record_started(&self, key: &ContainerKey, now: Instant) {
        if let Some(history) = self.histories.lock().get_mut(key) {
            history.started_at = Some(now);
            history.cooldown_until = None;
        }
    }

    /// Called after a successful exec. Clears the crash history once the
    /// container has been up for the stability period.
    pub fn record_success(&self, key: &ContainerKey, now: Instant) {
        let mut histories = self.histories.lock();
        let stable = histories.get(key).is_some_and(|h| {
            h.started_at
                .is_some_and(|started| now.saturating_duration_since(started) >= self.stability)
        });
        if stable {
            info!(key = %key, "Container stable, resetting crash backoff");
            histories.remove(key);
        }
    }

    pub fn forget(&self, key: &ContainerKey) {
        self.histories.lock().remove(key);
    }

    pub fn snapshot(&self, now: Instant) -> Vec<HealthStatus> {
        let histories = self.histories.lock();
        let mut statuses: Vec<HealthStatus> = histories
            .iter()
            .map(|(key, h)| {
                let recent = h
                    .crashes
                    .iter()
                    .filter(|&&t| now.saturating_duration_since(t) <= self.window)
                    .count();
                HealthStatus {
                    key: key.clone(),
                    recent_crashes: recent,
                    cooldown_remaining_secs: h
                        .cooldown_until
                        .map(|u| u.saturating_duration_since(now).as_secs())
                        .filter(|s| *s > 0),
                    next_delay_secs: h.backoff.peek().as_secs(),
                    escalated: recent >= self.escalation_threshold,
                }
            })
            .collect();
        statuses.sort_by(|a, b| a.key.cmp(&b.key));
        statuses
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> HealthMonitor {
        HealthMonitor::new(&HealthConfig::default())
    }

    #[test]
    fn test_three_crashes_in_window_strictly_increase() {
        let health = monitor();
        let key = ContainerKey::default_shared();
        let t0 = Instant::now();

        let d1 = health.record_crash(&key, t0);
        let d2 = health.record_crash(&key, t0 + Duration::from_secs(60));
        let d3 = health.record_crash(&key, t0 + Duration::from_secs(120));
        assert!(d1 < d2 && d2 < d3, "{d1:?} {d2:?} {d3:?}");
        assert_eq!(d1, Duration::from_secs(2));

        let status = &health.snapshot(t0 + Duration::from_secs(120))[0];
        assert_eq!(status.recent_crashes, 3);
        assert!(status.escalated);
    }

    #[test]
    fn test_crash_outside_window_restarts_backoff() {
        let health = monitor();
        let key = ContainerKey::named("proj-x");
        let t0 = Instant::now();

        health.record_crash(&key, t0);
        health.record_crash(&key, t0 + Duration::from_secs(10));
        let later = health.record_crash(&key, t0 + Duration::from_secs(10 + 301));
        assert_eq!(later, Duration::from_secs(2));
    }

    #[test]
    fn test_stable_run_resets_history() {
        let health = monitor();
        let key = ContainerKey::default_shared();
        let t0 = Instant::now();

        health.record_crash(&key, t0);
        health.record_crash(&key, t0 + Duration::from_secs(5));
        health.record_started(&key, t0 + Duration::from_secs(10));

        // Not yet stable
        health.record_success(&key, t0 + Duration::from_secs(30));
        assert_eq!(health.snapshot(t0 + Duration::from_secs(30)).len(), 1);

        health.record_success(&key, t0 + Duration::from_secs(70));
        assert!(health.snapshot(t0 + Duration::from_secs(70)).is_empty());
        assert_eq!(
            health.record_crash(&key, t0 + Duration::from_secs(80)),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn test_keys_are_independent() {
        let health = monitor();
        let t0 = Instant::now();
        health.record_crash(&ContainerKey::named("a"), t0);
        health.record_crash(&ContainerKey::named("a"), t0);
        assert_eq!(
            health.record_crash(&ContainerKey::named("b"), t0),
            Duration::from_secs(2)
        );
    }
}
