use std::time::Duration;
use tokio::time::Instant;

/// Periodic heartbeat while a copy relationship is active.
///
/// The count it produces is an estimate of copied trades, not a report from the
/// back-end.
#[derive(Debug)]
pub struct CopyTicker {
    period: Duration,
    next_due: Option<Instant>,
    count: u64,
}

impl CopyTicker {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            next_due: None,
            count: 0,
        }
    }

    /// Start ticking. No-op if already running.
    pub fn start(&mut self, now: Instant) {
        if self.next_due.is_none() {
            self.next_due = Some(now + self.period);
        }
    }

    pub fn cancel(&mut self) {
        self.next_due = None;
    }

    pub fn is_running(&self) -> bool {
        self.next_due.is_some()
    }

    /// Count every tick due by `now`; returns how many fired.
    pub fn poll(&mut self, now: Instant) -> u64 {
        let mut fired = 0;
        while let Some(due) = self.next_due {
            if due > now || self.period.is_zero() {
                break;
            }
            fired += 1;
            self.next_due = Some(due + self.period);
        }
        self.count += fired;
        fired
    }

    pub fn estimate(&self) -> u64 {
        self.count
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.next_due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticks_accumulate_until_cancelled() {
        let mut ticker = CopyTicker::new(Duration::from_secs(10));
        let start = Instant::now();
        assert_eq!(ticker.poll(start + Duration::from_secs(60)), 0);

        ticker.start(start);
        assert_eq!(ticker.poll(start + Duration::from_secs(9)), 0);
        assert_eq!(ticker.poll(start + Duration::from_secs(25)), 2);
        assert_eq!(ticker.deadline(), Some(start + Duration::from_secs(30)));

        ticker.cancel();
        assert_eq!(ticker.poll(start + Duration::from_secs(100)), 0);
        assert_eq!(ticker.estimate(), 2);
    }

    #[test]
    fn test_start_twice_keeps_schedule() {
        let mut ticker = CopyTicker::new(Duration::from_secs(10));
        let start = Instant::now();
        ticker.start(start);
        ticker.start(start + Duration::from_secs(5));
        assert_eq!(ticker.deadline(), Some(start + Duration::from_secs(10)));
    }
}
