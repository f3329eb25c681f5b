//! File-based node-ID coordination between processes on one host.
//!
//! Cooperating processes share a text file of lease records, one per line
//! in the form `bits:sequence:expire`. Every worker iteration takes an
//! advisory exclusive lock on the file, drops malformed and expired lines,
//! claims or renews its own lease, and rewrites the file in full. A
//! crashed holder needs no cleanup: its line simply runs out.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use fs4::FileExt;

use crate::clock::{SystemTimeSource, TimeSource};
use crate::sequence::SequencePool;
use crate::Result;

use super::{LeaseEvent, LeaseListener, LeaseSource};

/// How long a lease record stays valid without renewal.
///
/// Workers iterate at most every half of this, so a live holder always
/// renews in time.
pub const LIFESPAN: Duration = Duration::from_secs(10);

const SEP: char = ':';

/// One lease record of the coordination file.
#[derive(Debug, Clone, PartialEq)]
struct LeaseLine {
    bits: u32,
    sequence: u64,
    expire: f64,
}

impl LeaseLine {
    fn new(bits: u32, sequence: u64, now: f64) -> Self {
        Self {
            bits,
            sequence,
            expire: now + LIFESPAN.as_secs_f64(),
        }
    }

    /// Parse `bits:sequence:expire`; anything that does not match
    /// `^\d+:\d+:\d+(\.\d+)?$` is rejected.
    fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.trim().split(SEP);
        let bits = parts.next()?;
        let sequence = parts.next()?;
        let expire = parts.next()?;
        if parts.next().is_some() {
            return None;
        }

        if !is_digits(bits) || !is_digits(sequence) || !is_fractional(expire) {
            return None;
        }

        Some(Self {
            bits: bits.parse().ok()?,
            sequence: sequence.parse().ok()?,
            expire: expire.parse().ok()?,
        })
    }

    fn renew(&mut self, now: f64) {
        self.expire = now + LIFESPAN.as_secs_f64();
    }

    fn expired(&self, now: f64) -> bool {
        now > self.expire
    }
}

impl fmt::Display for LeaseLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{SEP}{}{SEP}{}", self.bits, self.sequence, self.expire)
    }
}

fn is_digits(part: &str) -> bool {
    !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit())
}

fn is_fractional(part: &str) -> bool {
    match part.split_once('.') {
        Some((int, frac)) => is_digits(int) && is_digits(frac),
        None => is_digits(part),
    }
}

/// Backend coordinating node IDs through a lock-protected file.
pub(super) struct FileLeaseSource {
    path: PathBuf,
    bits: u32,
}

impl FileLeaseSource {
    pub(super) fn new(path: PathBuf, bits: u32) -> Self {
        Self { path, bits }
    }
}

impl LeaseSource for FileLeaseSource {
    fn listener(&self) -> Result<Box<dyn LeaseListener>> {
        Ok(Box::new(FileLeaseListener::new(
            self.path.clone(),
            self.bits,
            Arc::new(SystemTimeSource),
        )))
    }
}

struct FileLeaseListener {
    path: PathBuf,
    bits: u32,
    held: Option<u64>,
    time: Arc<dyn TimeSource>,
}

impl FileLeaseListener {
    fn new(path: PathBuf, bits: u32, time: Arc<dyn TimeSource>) -> Self {
        Self {
            path,
            bits,
            held: None,
            time,
        }
    }

    fn iterate(&mut self, file: &mut File) -> Result<LeaseEvent> {
        let now = self.time.unix_time().as_secs_f64();

        let mut contents = String::new();
        file.read_to_string(&mut contents)?;

        // Survivors of this iteration; a fresh pool learns which values
        // of our width they occupy.
        let mut pool = SequencePool::new();
        let mut lines = Vec::new();
        let mut renewed = false;
        for raw in contents.lines() {
            let Some(mut line) = LeaseLine::parse(raw) else {
                continue;
            };
            if line.expired(now) {
                continue;
            }
            if line.bits == self.bits {
                pool.remove(line.bits, line.sequence);
                if self.held == Some(line.sequence) {
                    line.renew(now);
                    renewed = true;
                }
            }
            lines.push(line);
        }

        match self.held {
            None => match pool.pop(self.bits) {
                Ok(sequence) => {
                    self.held = Some(sequence);
                    lines.push(LeaseLine::new(self.bits, sequence, now));
                }
                // Exhausted for now; report no lease and let the worker
                // retry after its refresh delay.
                Err(err) if err.is_transient() => {}
                Err(err) => return Err(err),
            },
            Some(sequence) if !renewed => {
                // Our record vanished, which the renewal cadence rules
                // out short of a clock jump; re-assert the lease.
                lines.push(LeaseLine::new(self.bits, sequence, now));
            }
            Some(_) => {}
        }

        file.seek(SeekFrom::Start(0))?;
        file.set_len(0)?;
        let mut output = String::new();
        for line in &lines {
            output.push_str(&line.to_string());
            output.push('\n');
        }
        file.write_all(output.as_bytes())?;
        file.flush()?;

        Ok(self
            .held
            .map_or(LeaseEvent::Pending, LeaseEvent::Assigned))
    }
}

impl LeaseListener for FileLeaseListener {
    fn next_lease(&mut self) -> Result<LeaseEvent> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.path)?;
        file.lock_exclusive()?;
        let result = self.iterate(&mut file);
        let _ = file.unlock();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::ManualTimeSource;
    use crate::Error;

    const T0: f64 = 1_677_000_000.0;

    fn listener_at(path: &std::path::Path, bits: u32, now: f64) -> (FileLeaseListener, Arc<ManualTimeSource>) {
        let time = Arc::new(ManualTimeSource::at_secs_f64(now));
        let listener = FileLeaseListener::new(path.to_path_buf(), bits, time.clone());
        (listener, time)
    }

    fn read_lines(path: &std::path::Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_owned)
            .collect()
    }

    #[test]
    fn line_round_trips_through_its_text_form() {
        let line = LeaseLine {
            bits: 10,
            sequence: 4,
            expire: 1_677_000_000.25,
        };
        assert_eq!(LeaseLine::parse(&line.to_string()), Some(line));

        let whole = LeaseLine {
            bits: 2,
            sequence: 0,
            expire: 5.0,
        };
        assert_eq!(LeaseLine::parse(&whole.to_string()), Some(whole));
    }

    #[test]
    fn malformed_lines_are_rejected() {
        for raw in [
            "",
            "10:4",
            "10:4:1.0:extra",
            "-1:4:1.0",
            "10:+4:1.0",
            "10:4:1.",
            "10:4:.5",
            "10:4:1e9",
            "ten:4:1.0",
        ] {
            assert_eq!(LeaseLine::parse(raw), None, "accepted {raw:?}");
        }
    }

    #[test]
    fn acquires_the_lowest_free_value_and_appends_its_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leases");
        std::fs::write(
            &path,
            format!("10:0:{}\n10:1:{T0}\n10:2:{T0}\n10:3:{T0}\n", T0 + 1.0),
        )
        .unwrap();

        let (mut listener, _) = listener_at(&path, 10, T0);
        assert_eq!(listener.next_lease().unwrap(), LeaseEvent::Assigned(4));

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[4], format!("10:4:{}", T0 + 10.0));
    }

    #[test]
    fn renews_the_held_record_and_drops_expired_ones() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leases");
        std::fs::write(
            &path,
            format!("10:0:{}\n10:1:{T0}\n10:2:{T0}\n10:3:{T0}\n", T0 + 1.0),
        )
        .unwrap();

        let (mut listener, time) = listener_at(&path, 10, T0);
        assert_eq!(listener.next_lease().unwrap(), LeaseEvent::Assigned(4));

        // One second later the t0 records are stale; the record with a
        // second of life left survives, ours is renewed.
        time.set_secs_f64(T0 + 1.0);
        assert_eq!(listener.next_lease().unwrap(), LeaseEvent::Assigned(4));

        let lines = read_lines(&path);
        assert_eq!(
            lines,
            vec![
                format!("10:0:{}", T0 + 1.0),
                format!("10:4:{}", T0 + 11.0),
            ]
        );
    }

    #[test]
    fn exhausted_range_yields_pending_until_a_lease_expires() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leases");
        std::fs::write(
            &path,
            format!("2:0:{T0}\n2:1:{T0}\n2:2:{T0}\n2:3:{T0}\n"),
        )
        .unwrap();

        let (mut listener, time) = listener_at(&path, 2, T0);
        assert_eq!(listener.next_lease().unwrap(), LeaseEvent::Pending);

        time.set_secs_f64(T0 + 1.0);
        assert_eq!(listener.next_lease().unwrap(), LeaseEvent::Assigned(0));
    }

    #[test]
    fn records_of_other_widths_are_kept_but_not_consumed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leases");
        std::fs::write(&path, format!("8:0:{}\ngarbage\n", T0 + 5.0)).unwrap();

        let (mut listener, _) = listener_at(&path, 2, T0);
        assert_eq!(listener.next_lease().unwrap(), LeaseEvent::Assigned(0));

        let lines = read_lines(&path);
        assert_eq!(lines[0], format!("8:0:{}", T0 + 5.0));
        assert_eq!(lines.len(), 2);
    }

    #[test]
    fn starts_with_an_absent_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leases");

        let (mut listener, _) = listener_at(&path, 4, T0);
        assert_eq!(listener.next_lease().unwrap(), LeaseEvent::Assigned(0));
        assert_eq!(read_lines(&path), vec![format!("4:0:{}", T0 + 10.0)]);
    }

    #[test]
    fn pool_get_through_the_file_backend() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leases");

        let pool = crate::NodeIdPool::file(&path, 6);
        let first = pool.get().unwrap();
        assert_eq!(first, 0);

        let again = crate::NodeIdPool::file(&path, 6);
        assert_eq!(again.get().unwrap(), first);
        pool.stop();
    }

    #[test]
    fn unreadable_file_errors_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        // The path is a directory, so opening it as a file fails.
        let (mut listener, _) = listener_at(dir.path(), 4, T0);
        assert!(matches!(listener.next_lease(), Err(Error::Io(_))));
    }
}
