//! Per-group request throttling over a sliding one-second window.
//!
//! Rejected requests are not recorded, so a throttled caller does not push
//! its own window further out.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bolt_contracts::SecurityGroup;

const WINDOW: Duration = Duration::from_millis(1000);

#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Mutex<HashMap<String, VecDeque<Instant>>>>,
}

impl RateLimiter {
    /// Seeds a window per configured group.
    pub fn new(groups: &[SecurityGroup]) -> Self {
        let mut windows = HashMap::with_capacity(groups.len());
        for group in groups {
            windows.insert(group.name.clone(), VecDeque::new());
        }
        Self {
            inner: Arc::new(Mutex::new(windows)),
        }
    }

    /// The configured requests-per-second for a group; 0 means unthrottled.
    pub fn limit_for(group: &str, groups: &[SecurityGroup]) -> i64 {
        groups
            .iter()
            .find(|g| g.name == group)
            .map(|g| g.requests_per_second)
            .unwrap_or(0)
    }

    /// Returns false when the group already used its per-second budget. An
    /// admitted request records its timestamp; a rejected one does not.
    pub fn allow(&self, group: &str, limit: i64) -> bool {
        if limit <= 0 {
            return true;
        }

        let now = Instant::now();
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let window = inner.entry(group.to_string()).or_default();
        prune_window(window, now);
        if window.len() >= limit as usize {
            return false;
        }
        window.push_back(now);
        true
    }
}

fn prune_window(window: &mut VecDeque<Instant>, now: Instant) {
    while let Some(front) = window.front() {
        if now.duration_since(*front) > WINDOW {
            window.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn one_group(name: &str, rps: i64) -> Vec<SecurityGroup> {
        vec![SecurityGroup {
            name: name.to_string(),
            hmackey: "key".to_string(),
            requests_per_second: rps,
        }]
    }

    #[test]
    fn limiter_rejects_request_over_budget() {
        let groups = one_group("partner", 2);
        let limiter = RateLimiter::new(&groups);
        let limit = RateLimiter::limit_for("partner", &groups);

        assert!(limiter.allow("partner", limit));
        assert!(limiter.allow("partner", limit));
        assert!(!limiter.allow("partner", limit));
    }

    #[test]
    fn limiter_allows_after_window_elapses() {
        let limiter = RateLimiter::new(&one_group("partner", 0));
        assert!(limiter.allow("partner", 1));
        assert!(!limiter.allow("partner", 1));
        thread::sleep(Duration::from_millis(1100));
        assert!(limiter.allow("partner", 1));
    }

    #[test]
    fn rejected_requests_do_not_extend_the_window() {
        let limiter = RateLimiter::new(&one_group("partner", 1));
        assert!(limiter.allow("partner", 1));
        // A burst of rejected calls must not push the window out.
        for _ in 0..5 {
            assert!(!limiter.allow("partner", 1));
        }
        thread::sleep(Duration::from_millis(1100));
        assert!(limiter.allow("partner", 1));
    }

    #[test]
    fn zero_limit_means_unthrottled() {
        let groups = one_group("internal", 0);
        let limiter = RateLimiter::new(&groups);
        let limit = RateLimiter::limit_for("internal", &groups);
        for _ in 0..100 {
            assert!(limiter.allow("internal", limit));
        }
    }

    #[test]
    fn unknown_group_defaults_to_unthrottled() {
        let groups = one_group("partner", 3);
        assert_eq!(RateLimiter::limit_for("stranger", &groups), 0);
    }
}
