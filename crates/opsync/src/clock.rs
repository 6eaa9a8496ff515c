use crate::uuid::{Stamp, Uuid, Word};
use chrono::{DateTime, Datelike, Timelike, Utc};
use thiserror::Error;

/// The clock ran out of 60-bit timestamp space. Unrecoverable for this
/// clock instance; the replica must surface it to the operator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("timestamp space exhausted for origin {origin}")]
pub struct TimestampExhausted {
    pub origin: Word,
}

/// Issues monotonically increasing event stamps scoped to one origin.
///
/// `see` must be fed every stamp observed on the wire so that locally
/// issued stamps exceed everything the replica has witnessed (the Lamport
/// property), including across restarts when the persisted tip is replayed.
pub trait Clock: Send {
    fn origin(&self) -> Word;

    /// Rebase onto the origin granted by the upstream session handshake.
    fn set_origin(&mut self, origin: Word);

    /// Issue a stamp strictly greater than every stamp issued or seen.
    fn issue(&mut self) -> Result<Stamp, TimestampExhausted>;

    /// Adopt an observed stamp if it is ahead of the local tip.
    fn see(&mut self, stamp: &Stamp);

    /// The highest stamp issued or seen so far.
    fn last(&self) -> Stamp;
}

/// Plain Lamport clock: each issue is the numeric successor of the tip.
#[derive(Debug, Clone)]
pub struct LogicalClock {
    origin: Word,
    last: Stamp,
}

impl LogicalClock {
    pub fn new(origin: Word) -> Self {
        Self {
            origin,
            last: Uuid::event(Word::ZERO, origin),
        }
    }

    /// Resume from a persisted tip after restart.
    pub fn with_last(origin: Word, last: Stamp) -> Self {
        Self { origin, last }
    }
}

impl Clock for LogicalClock {
    fn origin(&self) -> Word {
        self.origin
    }

    fn set_origin(&mut self, origin: Word) {
        self.origin = origin;
    }

    fn issue(&mut self) -> Result<Stamp, TimestampExhausted> {
        let next = self
            .last
            .value
            .next()
            .ok_or(TimestampExhausted { origin: self.origin })?;
        self.last = Uuid::event(next, self.origin);
        Ok(self.last)
    }

    fn see(&mut self, stamp: &Stamp) {
        if stamp.is_event() && *stamp >= self.last {
            self.last = *stamp;
        }
    }

    fn last(&self) -> Stamp {
        self.last
    }
}

/// Calendar clock: wall-clock date/time in the high digits, a sequence
/// counter in the low ones.
///
/// Issuing faster than the millisecond resolution bumps the counter; if the
/// wall clock lags a stamp already seen, the clock stays stuck ahead (still
/// monotone) until real time catches up.
#[derive(Debug, Clone)]
pub struct CalendarClock {
    origin: Word,
    last: Stamp,
}

/// Digit layout: months-since-2010 (2), day (1), hour (1), minute (1),
/// second (1), millisecond (2), sequence (2).
fn calendar_word(now: DateTime<Utc>) -> Word {
    let months = (((now.year() - 2010).max(0) as u64) * 12 + now.month0() as u64).min(4095);
    let millis = now.timestamp_subsec_millis().min(999) as u64;
    Word::new(
        (months << 48)
            | ((now.day() as u64) << 42)
            | ((now.hour() as u64) << 36)
            | ((now.minute() as u64) << 30)
            | ((now.second() as u64) << 24)
            | (millis << 12),
    )
}

impl CalendarClock {
    pub fn new(origin: Word) -> Self {
        Self {
            origin,
            last: Uuid::event(Word::ZERO, origin),
        }
    }

    pub fn with_last(origin: Word, last: Stamp) -> Self {
        Self { origin, last }
    }
}

impl Clock for CalendarClock {
    fn origin(&self) -> Word {
        self.origin
    }

    fn set_origin(&mut self, origin: Word) {
        self.origin = origin;
    }

    fn issue(&mut self) -> Result<Stamp, TimestampExhausted> {
        let candidate = calendar_word(Utc::now());
        let value = if candidate > self.last.value {
            candidate
        } else {
            // same millisecond, or stuck ahead of a lagging wall clock
            self.last
                .value
                .next()
                .ok_or(TimestampExhausted { origin: self.origin })?
        };
        self.last = Uuid::event(value, self.origin);
        Ok(self.last)
    }

    fn see(&mut self, stamp: &Stamp) {
        if stamp.is_event() && *stamp >= self.last {
            self.last = *stamp;
        }
    }

    fn last(&self) -> Stamp {
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin(token: &str) -> Word {
        token.parse().unwrap()
    }

    #[test]
    fn test_logical_clock_strictly_increases() {
        let mut clock = LogicalClock::new(origin("X"));
        let mut prev = Uuid::ZERO;
        for _ in 0..1000 {
            let stamp = clock.issue().unwrap();
            assert!(stamp > prev);
            assert_eq!(stamp.origin, origin("X"));
            prev = stamp;
        }
    }

    #[test]
    fn test_logical_clock_adopts_seen_stamps() {
        let mut clock = LogicalClock::new(origin("X"));
        let remote: Stamp = "1CQAn5-Y".parse().unwrap();
        clock.see(&remote);
        let stamp = clock.issue().unwrap();
        assert!(stamp > remote);
        assert_eq!(stamp.origin, origin("X"));
    }

    #[test]
    fn test_logical_clock_ignores_stale_stamps() {
        let mut clock = LogicalClock::new(origin("X"));
        let tip = clock.issue().unwrap();
        clock.see(&Uuid::event(Word::ZERO, origin("Y")));
        assert_eq!(clock.last(), tip);
    }

    #[test]
    fn test_logical_clock_ignores_names() {
        let mut clock = LogicalClock::new(origin("X"));
        clock.see(&Uuid::NEVER);
        assert!(clock.issue().unwrap().value < Word::NEVER);
    }

    #[test]
    fn test_logical_clock_exhaustion() {
        let mut clock = LogicalClock::with_last(origin("X"), Uuid::event(Word::NEVER, origin("X")));
        assert_eq!(
            clock.issue(),
            Err(TimestampExhausted { origin: origin("X") })
        );
    }

    #[test]
    fn test_calendar_clock_strictly_increases() {
        let mut clock = CalendarClock::new(origin("X"));
        let mut prev = Uuid::ZERO;
        // far more issues than milliseconds elapse; exercises the counter
        for _ in 0..10_000 {
            let stamp = clock.issue().unwrap();
            assert!(stamp > prev);
            prev = stamp;
        }
    }

    #[test]
    fn test_calendar_clock_stuck_ahead() {
        let mut clock = CalendarClock::new(origin("X"));
        // a stamp from a replica whose wall clock is far in the future
        let future = Uuid::event(Word::new(crate::base64::MAX_VALUE >> 6), origin("Y"));
        clock.see(&future);
        let stamp = clock.issue().unwrap();
        assert!(stamp > future);
        let stamp2 = clock.issue().unwrap();
        assert!(stamp2 > stamp);
    }

    #[test]
    fn test_calendar_word_orders_by_time() {
        use chrono::TimeZone;
        let a = calendar_word(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        let b = calendar_word(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 1).unwrap());
        let c = calendar_word(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        assert!(a < b);
        assert!(b < c);
    }
}
