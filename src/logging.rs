use std::{
    collections::HashMap,
    sync::{Mutex, OnceLock},
    time::{Duration, Instant},
};
use tracing_subscriber::EnvFilter;

/// Install a compact tracing subscriber. `RUST_LOG` wins over `default_filter`.
/// Embedding applications that install their own subscriber skip this.
pub fn init_tracing(default_filter: &str) {
    let env_filter = std::env::var("RUST_LOG")
        .ok()
        .unwrap_or_else(|| default_filter.to_string());

    let filter = EnvFilter::try_new(env_filter).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .compact()
        .init();
}

#[derive(Debug, Clone, Copy)]
struct WarnThrottleState {
    last: Instant,
    suppressed: u64,
}

/// Rate limiter for warnings the stream can emit at line rate (checksum
/// mismatches, resync storms). Returns true when the caller should log now;
/// a suppressed-count summary is emitted alongside.
pub fn warn_throttled(key: &'static str, interval: Duration) -> bool {
    let Some(suppressed) = warn_throttled_with_count(key, interval) else {
        return false;
    };
    if suppressed > 0 {
        tracing::warn!(
            event = "throttled_warning_summary",
            key,
            suppressed,
            "throttled warnings were suppressed"
        );
    }
    true
}

pub fn warn_throttled_with_count(key: &'static str, interval: Duration) -> Option<u64> {
    static LAST_WARN: OnceLock<Mutex<HashMap<&'static str, WarnThrottleState>>> = OnceLock::new();
    let map = LAST_WARN.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = match map.lock() {
        Ok(g) => g,
        Err(poisoned) => {
            tracing::warn!("warn throttle lock poisoned; continuing with recovered state");
            poisoned.into_inner()
        }
    };
    let now = Instant::now();
    if let Some(state) = guard.get_mut(key) {
        if now.saturating_duration_since(state.last) < interval {
            state.suppressed = state.suppressed.saturating_add(1);
            return None;
        }
        let suppressed = state.suppressed;
        state.last = now;
        state.suppressed = 0;
        return Some(suppressed);
    }
    guard.insert(
        key,
        WarnThrottleState {
            last: now,
            suppressed: 0,
        },
    );
    Some(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_warning_passes_then_throttles() {
        let key = "logging_test_first_warning";
        assert_eq!(
            warn_throttled_with_count(key, Duration::from_secs(3600)),
            Some(0)
        );
        assert_eq!(warn_throttled_with_count(key, Duration::from_secs(3600)), None);
        assert_eq!(warn_throttled_with_count(key, Duration::from_secs(3600)), None);
    }

    #[test]
    fn zero_interval_reports_suppressed_count() {
        let key = "logging_test_zero_interval";
        assert_eq!(warn_throttled_with_count(key, Duration::ZERO), Some(0));
        assert_eq!(warn_throttled_with_count(key, Duration::ZERO), Some(0));
    }
}
