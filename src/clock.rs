//! Scaled integer clock used for the timestamp section of generated IDs.
//!
//! A [`ScaledClock`] counts ticks of `1/10^scale` seconds since a caller
//! chosen epoch. Readings are clamped so they never decrease, even if the
//! wall clock regresses; uniqueness of generated IDs depends on that.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::{Error, Result};

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Largest supported scale (microsecond resolution).
pub const MAX_SCALE: u32 = 6;

/// Named decimal scales for the timestamp section.
///
/// The raw scale is the number of decimal places: a clock with scale `n`
/// ticks `10^n` times per second. Arbitrary scales in `0..=6` are accepted
/// by [`ScaledClock::new`]; this enum just names the common ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeScale {
    /// One tick per second.
    Second,
    /// One tick per millisecond.
    Milli,
    /// One tick per microsecond.
    Micro,
}

impl TimeScale {
    /// Number of decimal places of this scale.
    #[must_use]
    pub const fn digits(self) -> u32 {
        match self {
            Self::Second => 0,
            Self::Milli => 3,
            Self::Micro => 6,
        }
    }
}

impl From<TimeScale> for u32 {
    fn from(scale: TimeScale) -> Self {
        scale.digits()
    }
}

/// Source of wall-clock readings.
///
/// The default implementation is [`SystemTimeSource`]; tests substitute a
/// manually driven source so time-dependent behaviour is deterministic.
pub trait TimeSource: Send + Sync + 'static {
    /// Time elapsed since the Unix epoch.
    fn unix_time(&self) -> Duration;

    /// Block the calling thread for approximately `duration`.
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// [`TimeSource`] backed by [`SystemTime`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn unix_time(&self) -> Duration {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
    }
}

/// A clock that counts up with a certain scale factor.
pub struct ScaledClock {
    factor: i64,
    epoch_scaled: i64,
    floor: AtomicI64,
    source: Arc<dyn TimeSource>,
}

impl ScaledClock {
    /// Create a clock with `10^scale` ticks per second, relative to
    /// `epoch` (fractional seconds since the Unix epoch).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `scale` exceeds [`MAX_SCALE`].
    pub fn new(scale: u32, epoch: f64) -> Result<Self> {
        Self::with_source(scale, epoch, Arc::new(SystemTimeSource))
    }

    /// Create a clock reading time from a custom [`TimeSource`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `scale` exceeds [`MAX_SCALE`].
    pub fn with_source(scale: u32, epoch: f64, source: Arc<dyn TimeSource>) -> Result<Self> {
        if scale > MAX_SCALE {
            return Err(Error::InvalidConfig(format!(
                "time scale must be between 0 and {MAX_SCALE}, but {scale} is given"
            )));
        }
        let factor = 10_i64.pow(scale);
        #[allow(clippy::cast_possible_truncation)]
        let epoch_scaled = (epoch * factor as f64).floor() as i64;
        Ok(Self {
            factor,
            epoch_scaled,
            floor: AtomicI64::new(i64::MIN),
            source,
        })
    }

    /// Ticks per second of this clock.
    #[must_use]
    pub const fn factor(&self) -> i64 {
        self.factor
    }

    /// Scaled ticks elapsed since the epoch.
    ///
    /// Readings are clamped to be non-decreasing: a wall-clock regression
    /// yields the highest value observed so far.
    pub fn current(&self) -> i64 {
        let raw = self.ticks(self.source.unix_time()) - self.epoch_scaled;
        let seen = self.floor.fetch_max(raw, Ordering::AcqRel);
        seen.max(raw)
    }

    /// The reading this clock will show once `delta` has elapsed.
    pub fn future(&self, delta: Duration) -> i64 {
        self.current() + self.ticks(delta)
    }

    /// Block until roughly the tick `future`, given the reading `current`.
    pub fn sleep(&self, current: i64, future: i64) {
        if future <= current {
            return;
        }
        #[allow(clippy::cast_precision_loss)]
        let seconds = (future - current) as f64 / self.factor as f64;
        self.source.sleep(Duration::from_secs_f64(seconds));
    }

    fn ticks(&self, elapsed: Duration) -> i64 {
        #[allow(clippy::cast_possible_wrap)]
        let secs = elapsed.as_secs() as i64;
        secs * self.factor + i64::from(elapsed.subsec_nanos()) * self.factor / NANOS_PER_SEC
    }
}

impl fmt::Debug for ScaledClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScaledClock")
            .field("factor", &self.factor)
            .field("epoch_scaled", &self.epoch_scaled)
            .finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ManualTimeSource;
    use super::*;

    fn clock_at(scale: u32, epoch: f64, now: f64) -> (ScaledClock, Arc<ManualTimeSource>) {
        let source = Arc::new(ManualTimeSource::at_secs_f64(now));
        let clock = ScaledClock::with_source(scale, epoch, source.clone()).unwrap();
        (clock, source)
    }

    #[test]
    fn rejects_out_of_range_scale() {
        assert!(matches!(
            ScaledClock::new(7, 0.0),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn current_counts_scaled_ticks_since_epoch() {
        let (clock, _) = clock_at(2, 1_000.0, 1_012.345);
        assert_eq!(clock.current(), 1234);
    }

    #[test]
    fn current_truncates_sub_tick_fractions() {
        let (clock, source) = clock_at(0, 1_000.0, 1_001.999);
        assert_eq!(clock.current(), 1);
        source.set_secs_f64(1_002.0);
        assert_eq!(clock.current(), 2);
    }

    #[test]
    fn current_never_decreases() {
        let (clock, source) = clock_at(3, 0.0, 100.0);
        let before = clock.current();
        source.set_secs_f64(50.0);
        assert_eq!(clock.current(), before);
        source.set_secs_f64(100.001);
        assert_eq!(clock.current(), before + 1);
    }

    #[test]
    fn future_adds_scaled_delta() {
        let (clock, _) = clock_at(2, 1_000.0, 1_001.231);
        assert_eq!(clock.future(Duration::from_secs(9)), 1023);
    }

    #[test]
    fn sleep_advances_by_tick_distance() {
        let (clock, source) = clock_at(2, 1_000.0, 1_000.0);
        clock.sleep(0, 5);
        assert_eq!(source.unix_time(), Duration::from_secs_f64(1_000.05));
        clock.sleep(5, 5);
        assert_eq!(source.unix_time(), Duration::from_secs_f64(1_000.05));
    }

    #[test]
    fn scale_enum_maps_to_digits() {
        assert_eq!(u32::from(TimeScale::Second), 0);
        assert_eq!(u32::from(TimeScale::Milli), 3);
        assert_eq!(u32::from(TimeScale::Micro), 6);
    }
}
