//! Transfer throttle and progress probe
//!
//! The throttle keeps a probe window: bytes moved and time elapsed since the
//! window opened. After every block the transfer asks it for a [`Step`]. Once
//! the window is older than [`PROBE_INTERVAL`] the counters are reported to the
//! master and the window reopens. With a rate limit the step also says how long
//! to sleep so the bytes in the window took at least `bytes / rate`.

use std::time::Duration;

use tokio::time::Instant;

use crate::sync::XferInfo;

/// Age after which a probe window is reported and reset.
pub const PROBE_INTERVAL: Duration = Duration::from_millis(500);

/// What the transfer loop does after a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    /// Counters to publish, taken before the window reset
    pub report: Option<XferInfo>,
    /// Time to sleep before the next block
    pub pause: Duration,
}

/// Per-transfer throttle state.
#[derive(Debug, Clone)]
pub struct Throttle {
    max_bytes_per_sec: Option<u64>,
    probe_start: Instant,
}

impl Throttle {
    /// Opens the first probe window at `now`. `None` disables rate limiting.
    pub fn new(max_bytes_per_sec: Option<u64>, now: Instant) -> Self {
        Self {
            max_bytes_per_sec: max_bytes_per_sec.filter(|r| *r > 0),
            probe_start: now,
        }
    }

    /// Accounts the window in `info` and decides the next action.
    ///
    /// `info.probe_len` is zeroed when the window resets. The new window opens
    /// when the returned pause ends, so sleeping never counts twice.
    pub fn step(&mut self, info: &mut XferInfo, now: Instant) -> Step {
        let elapsed = now.saturating_duration_since(self.probe_start);
        let probed = info.probe_len;

        let pause = match self.max_bytes_per_sec {
            Some(rate) => ideal_duration(probed, rate).saturating_sub(elapsed),
            None => Duration::ZERO,
        };

        let report = if elapsed > PROBE_INTERVAL {
            let snapshot = *info;
            info.probe_len = 0;
            self.probe_start = now + pause;
            Some(snapshot)
        } else {
            None
        };

        Step { report, pause }
    }
}

/// Minimum time `bytes` may take at `rate` bytes per second.
pub fn ideal_duration(bytes: u64, rate: u64) -> Duration {
    let micros = u128::from(bytes) * 1_000_000 / u128::from(rate.max(1));
    Duration::from_micros(u64::try_from(micros).unwrap_or(u64::MAX))
}
