//! Time-ordered sequence generation and reusable sequence pools.
//!
//! [`TimeSequenceProvider`] couples a [`ScaledClock`](crate::ScaledClock)
//! reading with a per-tick counter, waiting for the clock to advance when
//! the counter saturates. [`SequencePool`] tracks which values of a
//! bit-bounded range are free; the lease server and the file backend both
//! allocate node IDs from one.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::clock::{ScaledClock, TimeSource};
use crate::{Error, Result};

/// A sequence value paired with the clock tick it was issued at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeSequence {
    /// Scaled ticks since the provider epoch.
    pub timestamp: i64,
    /// Counter value within that tick, `< 2^sequence_bits`.
    pub value: u64,
}

/// Generates [`TimeSequence`] values under concurrent access.
///
/// The provider keeps one 64-bit word packing the last issued tick and the
/// next counter value; the counter section carries one extra bit so
/// saturation is visible without a separate flag. When all `2^bits` values
/// of a tick are spent, [`next`](Self::next) sleeps until the clock moves.
///
/// The word is guarded by a thread-scope lock: a single provider may be
/// shared freely between threads, but not mapped across processes.
/// Processes achieve global uniqueness through distinct node IDs instead.
#[derive(Debug)]
pub struct TimeSequenceProvider {
    seq_bits: u32,
    max: u64,
    mask: u64,
    clock: ScaledClock,
    shared: Mutex<u64>,
}

impl TimeSequenceProvider {
    /// Create a provider issuing `bits`-wide sequence values at the given
    /// time scale, relative to `epoch` (fractional Unix seconds).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for a zero or oversized `bits`, or
    /// an out-of-range `time_scale`.
    pub fn new(bits: u32, epoch: f64, time_scale: u32) -> Result<Self> {
        let clock = ScaledClock::new(time_scale, epoch)?;
        Self::with_clock(bits, clock)
    }

    /// Create a provider reading time from a custom [`TimeSource`].
    ///
    /// # Errors
    ///
    /// Same conditions as [`new`](Self::new).
    pub fn with_time_source(
        bits: u32,
        epoch: f64,
        time_scale: u32,
        source: Arc<dyn TimeSource>,
    ) -> Result<Self> {
        let clock = ScaledClock::with_source(time_scale, epoch, source)?;
        Self::with_clock(bits, clock)
    }

    fn with_clock(bits: u32, clock: ScaledClock) -> Result<Self> {
        if !(1..=62).contains(&bits) {
            return Err(Error::InvalidConfig(format!(
                "sequence bits must be between 1 and 62, but {bits} is given"
            )));
        }
        let seq_bits = bits + 1;
        let shared = Self::pack_word(clock.current(), 0, seq_bits);
        Ok(Self {
            seq_bits,
            max: (1 << bits) - 1,
            mask: (1 << seq_bits) - 1,
            clock,
            shared: Mutex::new(shared),
        })
    }

    /// Issue the next sequence value.
    ///
    /// Timestamps are non-decreasing across calls; within one tick the
    /// values strictly increase and are never reused. On saturation the
    /// call sleeps in tick-sized steps until the clock advances.
    pub fn next(&self) -> TimeSequence {
        loop {
            let mut shared = self.shared.lock();
            let now = self.clock.current();
            let last = self.unpack_timestamp(*shared);

            if now > last {
                *shared = Self::pack_word(now, 1, self.seq_bits);
                return TimeSequence {
                    timestamp: now,
                    value: 0,
                };
            }

            let seq = *shared & self.mask;
            if seq <= self.max {
                *shared = Self::pack_word(now, seq + 1, self.seq_bits);
                return TimeSequence {
                    timestamp: now,
                    value: seq,
                };
            }

            drop(shared);
            self.clock.sleep(now, last + 1);
        }
    }

    /// Number of bits a timestamp issued `delta` from now will occupy.
    #[must_use]
    pub fn get_required_bits(&self, delta: Duration) -> u32 {
        let ticks = self.clock.future(delta);
        if ticks <= 0 {
            return 0;
        }
        #[allow(clippy::cast_sign_loss)]
        let ticks = ticks as u64;
        64 - ticks.leading_zeros()
    }

    #[allow(clippy::cast_sign_loss)]
    fn pack_word(timestamp: i64, next_seq: u64, seq_bits: u32) -> u64 {
        ((timestamp as u64) << seq_bits) | next_seq
    }

    #[allow(clippy::cast_possible_wrap)]
    const fn unpack_timestamp(&self, word: u64) -> i64 {
        (word >> self.seq_bits) as i64
    }
}

/// Reusable set of sequence values per bit-width.
///
/// Each width `b` owns the range `[0, 2^b)`; values are handed out lowest
/// first, so allocation order is deterministic. The range is realised
/// lazily: a released-set plus a high-water mark, never the full range.
#[derive(Debug, Default)]
pub struct SequencePool {
    spaces: HashMap<u32, SequenceSpace>,
}

#[derive(Debug)]
struct SequenceSpace {
    capacity: u64,
    released: BTreeSet<u64>,
    fresh: u64,
}

impl SequenceSpace {
    fn new(bits: u32) -> Self {
        Self {
            capacity: 1 << bits,
            released: BTreeSet::new(),
            fresh: 0,
        }
    }

    /// Move every untouched value up to and including `value` into the
    /// released set, so `value` can be addressed individually.
    fn materialize_through(&mut self, value: u64) {
        if value >= self.fresh {
            self.released.extend(self.fresh..=value);
            self.fresh = value + 1;
        }
    }
}

impl SequencePool {
    /// Create an empty pool; ranges appear on first use of each width.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lowest free value of the `bits`-wide range.
    ///
    /// # Errors
    ///
    /// [`Error::SequenceOverflow`] when every value is in use, or
    /// [`Error::InvalidConfig`] for an unsupported width.
    pub fn pop(&mut self, bits: u32) -> Result<u64> {
        let space = self.space_mut(bits)?;
        if let Some(value) = space.released.pop_first() {
            return Ok(value);
        }
        if space.fresh < space.capacity {
            let value = space.fresh;
            space.fresh += 1;
            return Ok(value);
        }
        Err(Error::sequence_overflow(bits))
    }

    /// Return a previously popped value to the `bits`-wide range.
    ///
    /// # Errors
    ///
    /// [`Error::ValueOutOfRange`] if `value` does not fit the width, or
    /// [`Error::InvalidConfig`] for an unsupported width.
    pub fn push(&mut self, bits: u32, value: u64) -> Result<()> {
        let space = self.space_mut(bits)?;
        if value >= space.capacity {
            return Err(Error::ValueOutOfRange {
                value,
                max: space.capacity - 1,
            });
        }
        space.materialize_through(value);
        space.released.insert(value);
        Ok(())
    }

    /// Mark `value` as used in the `bits`-wide range.
    ///
    /// Idempotent; values outside the range are ignored.
    pub fn remove(&mut self, bits: u32, value: u64) {
        let Ok(space) = self.space_mut(bits) else {
            return;
        };
        if value >= space.capacity {
            return;
        }
        space.materialize_through(value);
        space.released.remove(&value);
    }

    fn space_mut(&mut self, bits: u32) -> Result<&mut SequenceSpace> {
        if bits >= 64 {
            return Err(Error::InvalidConfig(format!(
                "sequence width must be below 64 bits, but {bits} is given"
            )));
        }
        Ok(self
            .spaces
            .entry(bits)
            .or_insert_with(|| SequenceSpace::new(bits)))
    }
}
