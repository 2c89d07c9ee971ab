// SPDX-License-Identifier: MPL-2.0

use std::time::Duration;

/// Swaps remembered for lateness figures.
const LATENESS_WINDOW: usize = 10;

/// Statistics about a player's presentation.
#[derive(Debug, Clone, Default)]
pub struct PlaybackStats {
    /// Frames swapped to the front.
    pub frames_presented: u64,
    /// Frames skipped to catch up.
    pub frames_dropped: u64,
    /// Decodes that ended in an error.
    pub decode_failures: u64,
    /// Completed passes through the sequence.
    pub loops: u64,
    lateness: [Duration; LATENESS_WINDOW],
    recorded: usize,
}

impl PlaybackStats {
    pub(super) fn record_swap(&mut self, lateness: Duration, skipped: usize) {
        self.frames_presented += 1;
        self.frames_dropped += skipped as u64;
        self.lateness[self.recorded % LATENESS_WINDOW] = lateness;
        self.recorded += 1;
    }

    fn window(&self) -> &[Duration] {
        &self.lateness[..self.recorded.min(LATENESS_WINDOW)]
    }

    /// How far past its due time the latest frame was swapped in.
    #[must_use]
    pub fn last_lateness(&self) -> Option<Duration> {
        let index = self.recorded.checked_sub(1)?;
        Some(self.lateness[index % LATENESS_WINDOW])
    }

    /// Worst lateness over the last few swaps.
    #[must_use]
    pub fn max_lateness(&self) -> Option<Duration> {
        self.window().iter().max().copied()
    }

    /// Mean lateness over the last few swaps.
    #[must_use]
    pub fn average_lateness(&self) -> Option<Duration> {
        let window = self.window();
        let count = u32::try_from(window.len()).ok().filter(|count| *count > 0)?;
        Some(window.iter().sum::<Duration>() / count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn empty_has_no_lateness() {
        let stats = PlaybackStats::default();
        assert_eq!(stats.last_lateness(), None);
        assert_eq!(stats.max_lateness(), None);
        assert_eq!(stats.average_lateness(), None);
    }

    #[test]
    fn tracks_counts_and_lateness() {
        let mut stats = PlaybackStats::default();
        stats.record_swap(ms(0), 0);
        stats.record_swap(ms(30), 4);
        stats.record_swap(ms(6), 0);

        assert_eq!(stats.frames_presented, 3);
        assert_eq!(stats.frames_dropped, 4);
        assert_eq!(stats.last_lateness(), Some(ms(6)));
        assert_eq!(stats.max_lateness(), Some(ms(30)));
        assert_eq!(stats.average_lateness(), Some(ms(12)));
    }

    #[test]
    fn window_forgets_old_swaps() {
        let mut stats = PlaybackStats::default();
        stats.record_swap(ms(500), 0);
        for _ in 0..LATENESS_WINDOW {
            stats.record_swap(ms(2), 0);
        }

        assert_eq!(stats.max_lateness(), Some(ms(2)));
        assert_eq!(stats.average_lateness(), Some(ms(2)));
        assert_eq!(stats.frames_presented, LATENESS_WINDOW as u64 + 1);
    }
}
