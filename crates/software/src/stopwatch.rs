//! A lazily started timer that tolerates its clock source wrapping around.

use embassy_time::{Duration, Instant};

/// Measures time since some event of interest.
///
/// The stopwatch is started on first use rather than on construction, which lets callers express "wait N ms from
/// now" with a single repeated call. A recorded start that lies in the future means the clock wrapped; the watch is
/// then restarted instead of producing a bogus elapsed time.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Stopwatch {
    started: Option<Instant>,
}

impl Stopwatch {
    /// Constructs a stopped [`Stopwatch`].
    pub const fn new() -> Self {
        Self { started: None }
    }

    /// Starts (or restarts) timing from `now`.
    pub fn restart(&mut self, now: Instant) {
        self.started = Some(now);
    }

    /// Stops the stopwatch; the next call to [`elapsed`][Self::elapsed] starts it again.
    pub fn stop(&mut self) {
        self.started = None;
    }

    /// Returns `true` if the stopwatch is running.
    pub fn is_running(&self) -> bool {
        self.started.is_some()
    }

    /// Returns the time elapsed since the stopwatch was started, starting it if it wasn't running.
    pub fn elapsed(&mut self, now: Instant) -> Duration {
        match self.started {
            Some(start) => match now.checked_duration_since(start) {
                Some(elapsed) => elapsed,
                None => {
                    self.started = Some(now);
                    Duration::from_ticks(0)
                }
            },
            None => {
                self.started = Some(now);
                Duration::from_ticks(0)
            }
        }
    }

    /// Returns `true` once at least `period` has passed since the stopwatch was started, starting it if it wasn't
    /// running.
    pub fn has_elapsed(&mut self, now: Instant, period: Duration) -> bool {
        let was_running = self.is_running();
        let elapsed = self.elapsed(now);
        was_running && elapsed >= period
    }
}
