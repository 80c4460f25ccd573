/// Throttles job progress reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Progress {
    interval: u8,
    last_reported: u8,
}

impl Progress {
    pub const fn new(interval: u8) -> Self {
        Self {
            interval,
            last_reported: 0,
        }
    }

    pub fn reset(&mut self) {
        self.last_reported = 0;
    }

    pub fn last_reported(&self) -> u8 {
        self.last_reported
    }

    /// Percent to report after `completed` of `total` bytes, if any.
    ///
    /// A value is returned when the percentage moved by at least the
    /// interval since the last report, or reached 100.
    pub fn update(&mut self, completed: usize, total: usize) -> Option<u8> {
        if total == 0 {
            return None;
        }
        let percent = ((completed.min(total) as u64 * 100) / total as u64) as u8;
        if percent == self.last_reported {
            return None;
        }
        if percent == 100 || percent >= self.last_reported.saturating_add(self.interval) {
            self.last_reported = percent;
            return Some(percent);
        }
        None
    }
}
