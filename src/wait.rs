use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

/// Polling schedule: starts at `initial`, doubles up to `max` between checks.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff {
    pub const fn fixed(interval: Duration) -> Self {
        Self { initial: interval, max: interval }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(2),
        }
    }
}

/// Outcome of a wait that ran out of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elapsed {
    pub waited: Duration,
    pub attempts: u32,
}

/// Calls `check` until it yields a value or `timeout` passes. The check always
/// runs at least once, and once more right at the deadline.
pub fn poll_until<T>(
    what: &str,
    timeout: Duration,
    backoff: Backoff,
    mut check: impl FnMut() -> Option<T>,
) -> Result<T, Elapsed> {
    let start = Instant::now();
    let deadline = start + timeout;
    let mut delay = backoff.initial;
    let mut attempts = 0;

    loop {
        attempts += 1;
        if let Some(v) = check() {
            debug!(what, waited_ms = start.elapsed().as_millis() as u64, budget_ms = timeout.as_millis() as u64, attempts, "wait satisfied");
            return Ok(v);
        }
        let now = Instant::now();
        if now >= deadline {
            let waited = start.elapsed();
            debug!(what, waited_ms = waited.as_millis() as u64, attempts, "wait timed out");
            return Err(Elapsed { waited, attempts });
        }
        thread::sleep(delay.min(deadline - now));
        delay = (delay * 2).min(backoff.max);
    }
}
