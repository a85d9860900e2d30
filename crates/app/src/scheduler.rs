use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TickSkip {
    InFlight,
    DeadlinePassed,
    Empty,
    NothingReady,
}

impl TickSkip {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::InFlight => "in_flight",
            Self::DeadlinePassed => "deadline_passed",
            Self::Empty => "empty",
            Self::NothingReady => "nothing_ready",
        }
    }
}

/// Gate for the batch tick: one batch at a time, none after the deadline.
#[derive(Debug, Clone)]
pub(crate) struct BatchScheduler {
    deadline: Instant,
    batch_size: usize,
    skipped_in_flight: u64,
}

impl BatchScheduler {
    pub(crate) fn new(started_at: Instant, run_for: Duration, batch_size: usize) -> Self {
        Self {
            deadline: started_at + run_for,
            batch_size: batch_size.max(1),
            skipped_in_flight: 0,
        }
    }

    pub(crate) fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub(crate) fn deadline_passed(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    pub(crate) fn skipped_in_flight(&self) -> u64 {
        self.skipped_in_flight
    }

    /// Checks that hold before looking at readiness. A tick that lands while
    /// a batch is in flight is dropped, never queued.
    pub(crate) fn gate(
        &mut self,
        now: Instant,
        batch_in_flight: bool,
        pending_len: usize,
    ) -> Result<(), TickSkip> {
        if batch_in_flight {
            self.skipped_in_flight = self.skipped_in_flight.saturating_add(1);
            return Err(TickSkip::InFlight);
        }
        if self.deadline_passed(now) {
            return Err(TickSkip::DeadlinePassed);
        }
        if pending_len == 0 {
            return Err(TickSkip::Empty);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_flight_batch_latches_ticks() {
        let start = Instant::now();
        let mut scheduler = BatchScheduler::new(start, Duration::from_secs(60), 100);
        assert_eq!(scheduler.gate(start, true, 10), Err(TickSkip::InFlight));
        assert_eq!(scheduler.gate(start, true, 10), Err(TickSkip::InFlight));
        assert_eq!(scheduler.skipped_in_flight(), 2);
        assert_eq!(scheduler.gate(start, false, 10), Ok(()));
    }

    #[test]
    fn deadline_stops_new_batches() {
        let start = Instant::now();
        let mut scheduler = BatchScheduler::new(start, Duration::from_secs(5), 100);
        assert_eq!(scheduler.gate(start + Duration::from_secs(4), false, 1), Ok(()));
        assert_eq!(
            scheduler.gate(start + Duration::from_secs(5), false, 1),
            Err(TickSkip::DeadlinePassed)
        );
        assert!(scheduler.deadline_passed(start + Duration::from_secs(6)));
    }

    #[test]
    fn empty_buffer_skips_and_batch_size_is_at_least_one() {
        let start = Instant::now();
        let mut scheduler = BatchScheduler::new(start, Duration::from_secs(5), 0);
        assert_eq!(scheduler.batch_size(), 1);
        assert_eq!(scheduler.gate(start, false, 0), Err(TickSkip::Empty));
    }
}
