//! ARCHIVIST - Timestamp Oracle
//! Hybrid logical clock issuing strictly increasing timestamps.
//!
//! ## Algorithm
//! - `now()`: if the physical clock moved past the last issued wall time,
//!   adopt it with logical 0; otherwise keep the last wall time and bump
//!   the logical counter. A regressing physical clock therefore degrades
//!   to logical-counter advancement instead of reissuing old timestamps.
//! - `update(remote)`: fold a timestamp observed from a cooperating
//!   instance into the clock so every later `now()` is strictly greater.
//! - If the physical clock trails the oracle by more than `max_offset`,
//!   the clock refuses to advance (fatal, never retried).

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{ArchivistError, Result};
use crate::types::Timestamp;

/// Source of physical wall time in nanoseconds since the Unix epoch.
pub type PhysicalClock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Read the system wall clock in nanoseconds.
pub fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

/// Thread-safe hybrid logical clock.
pub struct Clock {
    physical: PhysicalClock,
    max_offset: i64,
    last: Mutex<Timestamp>,
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clock")
            .field("max_offset", &self.max_offset)
            .field("last", &self.last)
            .finish()
    }
}

impl Clock {
    /// A clock backed by the system wall clock.
    pub fn new(max_offset: Duration) -> Self {
        Self::with_physical_clock(Arc::new(unix_nanos), max_offset)
    }

    /// A clock backed by a custom physical time source.
    pub fn with_physical_clock(physical: PhysicalClock, max_offset: Duration) -> Self {
        Self {
            physical,
            max_offset: max_offset.as_nanos().min(i64::MAX as u128) as i64,
            last: Mutex::new(Timestamp::ZERO),
        }
    }

    /// Issue a timestamp strictly greater than every timestamp previously
    /// issued or observed by this clock.
    pub fn now(&self) -> Result<Timestamp> {
        let physical = (self.physical)();
        let mut last = self
            .last
            .lock()
            .map_err(|_| ArchivistError::Poisoned("clock"))?;

        self.check_offset(last.wall_time, physical)?;

        let next = if physical > last.wall_time {
            Timestamp::new(physical, 0)
        } else {
            last.next()
        };
        *last = next;
        Ok(next)
    }

    /// Advance the clock past a timestamp observed elsewhere.
    ///
    /// Rejects `remote` if it is further ahead of local physical time
    /// than `max_offset` allows; the clock is left untouched in that case.
    pub fn update(&self, remote: Timestamp) -> Result<()> {
        let physical = (self.physical)();
        self.check_offset(remote.wall_time, physical)?;

        let mut last = self
            .last
            .lock()
            .map_err(|_| ArchivistError::Poisoned("clock"))?;
        if remote > *last {
            log::debug!("clock advanced to remote timestamp {}", remote);
            *last = remote;
        }
        Ok(())
    }

    /// The last timestamp issued or observed, without advancing.
    pub fn peek(&self) -> Timestamp {
        self.last.lock().map(|t| *t).unwrap_or(Timestamp::ZERO)
    }

    fn check_offset(&self, ahead: i64, physical: i64) -> Result<()> {
        if self.max_offset == 0 {
            return Ok(());
        }
        let offset = ahead.saturating_sub(physical);
        if offset > self.max_offset {
            log::error!(
                "clock skew {}ns exceeds max offset {}ns",
                offset,
                self.max_offset
            );
            return Err(ArchivistError::ClockSkew {
                offset_nanos: offset,
                max_offset_nanos: self.max_offset,
            });
        }
        Ok(())
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::thread;

    fn manual_clock(max_offset: Duration) -> (Arc<AtomicI64>, Clock) {
        let time = Arc::new(AtomicI64::new(1_000));
        let source = Arc::clone(&time);
        let clock =
            Clock::with_physical_clock(Arc::new(move || source.load(Ordering::SeqCst)), max_offset);
        (time, clock)
    }

    #[test]
    fn test_monotonic_with_frozen_clock() {
        let (_time, clock) = manual_clock(Duration::ZERO);
        let a = clock.now().unwrap();
        let b = clock.now().unwrap();
        let c = clock.now().unwrap();
        assert_eq!(a, Timestamp::new(1_000, 0));
        assert_eq!(b, Timestamp::new(1_000, 1));
        assert_eq!(c, Timestamp::new(1_000, 2));
    }

    #[test]
    fn test_physical_advance_resets_logical() {
        let (time, clock) = manual_clock(Duration::ZERO);
        clock.now().unwrap();
        clock.now().unwrap();
        time.store(2_000, Ordering::SeqCst);
        assert_eq!(clock.now().unwrap(), Timestamp::new(2_000, 0));
    }

    #[test]
    fn test_regression_falls_back_to_logical() {
        let (time, clock) = manual_clock(Duration::from_nanos(10_000));
        let before = clock.now().unwrap();
        time.store(500, Ordering::SeqCst); // clock jumps backwards
        let after = clock.now().unwrap();
        assert!(after > before);
        assert_eq!(after, Timestamp::new(1_000, 1));
    }

    #[test]
    fn test_catastrophic_skew_is_fatal() {
        let (time, clock) = manual_clock(Duration::from_nanos(100));
        clock.now().unwrap();
        time.store(0, Ordering::SeqCst); // 1000ns behind
        assert!(matches!(
            clock.now(),
            Err(ArchivistError::ClockSkew { offset_nanos: 1_000, .. })
        ));
    }

    #[test]
    fn test_update_from_remote() {
        let (_time, clock) = manual_clock(Duration::from_nanos(1_000_000));
        clock.update(Timestamp::new(5_000, 7)).unwrap();
        assert_eq!(clock.now().unwrap(), Timestamp::new(5_000, 8));

        // An older remote timestamp never moves the clock backwards.
        clock.update(Timestamp::new(10, 0)).unwrap();
        assert_eq!(clock.now().unwrap(), Timestamp::new(5_000, 9));
    }

    #[test]
    fn test_update_rejects_far_future() {
        let (_time, clock) = manual_clock(Duration::from_nanos(100));
        let err = clock.update(Timestamp::new(1_000_000, 0)).unwrap_err();
        assert!(matches!(err, ArchivistError::ClockSkew { .. }));
        assert_eq!(clock.peek(), Timestamp::ZERO);
    }

    #[test]
    fn test_concurrent_callers_never_collide() {
        let clock = Arc::new(Clock::new(Duration::from_millis(500)));
        let mut handles = vec![];
        for _ in 0..8 {
            let clock = Arc::clone(&clock);
            handles.push(thread::spawn(move || {
                let mut issued = Vec::with_capacity(1000);
                let mut last = Timestamp::ZERO;
                for _ in 0..1000 {
                    let ts = clock.now().unwrap();
                    assert!(ts > last);
                    last = ts;
                    issued.push(ts);
                }
                issued
            }));
        }

        let mut all: Vec<Timestamp> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), total);
    }
}
