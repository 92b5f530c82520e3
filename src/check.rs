//! Assertion and test-support helpers. The retry/eventually/port utilities
//! follow the TiKV test_util ports the project has carried in its test
//! infrastructure (Apache-2.0).

use rand::Rng;
use std::{
    env,
    sync::atomic::{AtomicU16, Ordering},
    time::Duration,
};

static INITIAL_PORT: AtomicU16 = AtomicU16::new(0);
/// Linux by default uses [32768, 61000] for local ports.
const MIN_LOCAL_PORT: u16 = 32767;

/// Allocates a unique port for testing purposes, avoiding conflicts between
/// concurrently provisioned nodes.
pub fn alloc_port() -> u16 {
    let p = INITIAL_PORT.load(Ordering::Relaxed);
    if p == 0 {
        let _ = INITIAL_PORT.compare_exchange(
            0,
            rand::thread_rng().gen_range(10240..MIN_LOCAL_PORT),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
    let mut p = INITIAL_PORT.load(Ordering::SeqCst);
    loop {
        let next = if p >= MIN_LOCAL_PORT { 10240 } else { p + 1 };
        match INITIAL_PORT.compare_exchange_weak(p, next, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return next,
            Err(e) => p = e,
        }
    }
}

static MEM_DISK: &str = "CUTTLE_TEST_MEMORY_DISK_MOUNT_POINT";

/// Gets a temporary directory, removed when dropped. Points at a memory
/// disk when one is mounted and preferred.
pub fn temp_dir(prefix: impl Into<Option<&'static str>>, prefer_mem: bool) -> tempfile::TempDir {
    let mut builder = tempfile::Builder::new();
    if let Some(prefix) = prefix.into() {
        builder.prefix(prefix);
    }
    match env::var(MEM_DISK) {
        Ok(dir) if prefer_mem => builder.tempdir_in(dir).unwrap(),
        _ => builder.tempdir().unwrap(),
    }
}

/// Asserts that every value is within `error` relative tolerance of the
/// largest one: `min >= (1 - error) * max`. Panics with the identifying
/// message otherwise.
#[track_caller]
pub fn assert_almost_equal(values: &[u64], error: f64, message: &str) {
    if values.len() < 2 {
        return;
    }
    let vmax = *values.iter().max().unwrap();
    let vmin = *values.iter().min().unwrap();
    if (vmin as f64) < (1.0 - error) * (vmax as f64) {
        panic!(
            "values not within {:.0}% of the max: {:?} ({})",
            error * 100.0,
            values,
            message
        );
    }
}

/// Polls `check` every `tick` until it returns true or `total` time
/// elapses, panicking on timeout.
#[track_caller]
pub fn eventually(tick: Duration, total: Duration, mut check: impl FnMut() -> bool) {
    let start = std::time::Instant::now();
    loop {
        if check() {
            return;
        }
        if start.elapsed() < total {
            std::thread::sleep(tick);
            continue;
        }
        panic!(
            "failed to pass the check after {:?} elapsed",
            start.elapsed()
        );
    }
}

/// Retry an expression multiple times with delays between attempts.
///
/// The expression should return a Result. Returns Ok on the first success,
/// or the last Err if all attempts fail.
///
/// ```ignore
/// retry!(node.admin("flush", &[]));
/// retry!(node.admin("flush", &[]), 20);
/// retry!(node.admin("flush", &[]), 20, 50);
/// ```
#[macro_export]
macro_rules! retry {
    ($expr:expr) => {
        retry!($expr, 10)
    };
    ($expr:expr, $count:expr) => {
        retry!($expr, $count, 100)
    };
    ($expr:expr, $count:expr, $interval:expr) => {{
        use std::thread;
        use std::time::Duration;
        let mut res = $expr;
        if !res.is_ok() {
            for _ in 0..$count {
                thread::sleep(Duration::from_millis($interval));
                res = $expr;
                if res.is_ok() {
                    break;
                }
            }
        }
        res
    }};
}

/// Annotation for a scenario that is expected to fail against a tracked,
/// unresolved defect. Failures are suppressed and logged, never retried.
#[derive(Debug, Clone, Copy)]
pub struct KnownFailure {
    /// Where the defect lives, e.g. `"systemic"` or `"harness"`.
    pub failure_source: &'static str,
    /// URL of the tracking issue.
    pub tracker_url: &'static str,
    /// A flaky annotation passes quietly when the scenario happens to
    /// succeed; a non-flaky one logs loudly so the annotation gets removed.
    pub flaky: bool,
}

/// Applies a known-failure annotation to a scenario outcome. An `Err` is
/// downgraded to a logged pass; an unexpected `Ok` on a non-flaky
/// annotation is reported so the annotation can be retired.
pub fn known_failure<T>(
    annotation: KnownFailure,
    outcome: crate::error::Result<T>,
) -> crate::error::Result<Option<T>> {
    match outcome {
        Err(e) => {
            tracing::warn!(
                source = annotation.failure_source,
                tracker = annotation.tracker_url,
                "suppressing known failure: {e}"
            );
            Ok(None)
        }
        Ok(value) => {
            if !annotation.flaky {
                tracing::warn!(
                    tracker = annotation.tracker_url,
                    "scenario marked as a known failure passed; the annotation can likely be removed"
                );
            }
            Ok(Some(value))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CuttleError;

    #[test]
    fn test_alloc_port_unique() {
        let port1 = alloc_port();
        let port2 = alloc_port();
        assert_ne!(port1, port2);
        assert!(port1 >= 10240 && port1 < MIN_LOCAL_PORT);
    }

    #[test]
    fn test_almost_equal_within_tolerance() {
        assert_almost_equal(&[100, 85, 92], 0.2, "node1");
        assert_almost_equal(&[0, 0, 0], 0.2, "all empty");
        assert_almost_equal(&[7], 0.2, "single value");
    }

    #[test]
    #[should_panic(expected = "node1")]
    fn test_almost_equal_violation_names_node() {
        assert_almost_equal(&[100, 50, 92], 0.2, "node1");
    }

    #[test]
    fn test_eventually_success() {
        let mut counter = 0;
        eventually(Duration::from_millis(10), Duration::from_secs(1), || {
            counter += 1;
            counter >= 5
        });
        assert!(counter >= 5);
    }

    #[test]
    #[should_panic(expected = "failed to pass the check")]
    fn test_eventually_timeout() {
        eventually(Duration::from_millis(10), Duration::from_millis(50), || {
            false
        });
    }

    #[test]
    fn test_retry_success_after_retries() {
        let mut count = 0;
        let result = retry!(
            {
                count += 1;
                if count >= 3 {
                    Ok::<_, String>(42)
                } else {
                    Err("not yet".to_string())
                }
            },
            10,
            10
        );
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn test_known_failure_suppresses_error() {
        let annotation = KnownFailure {
            failure_source: "systemic",
            tracker_url: "https://tracker.invalid/ISSUE-1",
            flaky: false,
        };
        let outcome: crate::error::Result<()> =
            Err(CuttleError::Admin("balance off".to_string()));
        assert!(known_failure(annotation, outcome).unwrap().is_none());
    }

    #[test]
    fn test_known_failure_passes_through_success() {
        let annotation = KnownFailure {
            failure_source: "systemic",
            tracker_url: "https://tracker.invalid/ISSUE-1",
            flaky: true,
        };
        assert_eq!(known_failure(annotation, Ok(5)).unwrap(), Some(5));
    }

    #[test]
    fn test_temp_dir_cleanup() {
        let dir = temp_dir(Some("cuttle_check"), false);
        let path = dir.path().to_path_buf();
        assert!(path.exists());
        drop(dir);
        assert!(!path.exists());
    }
}
