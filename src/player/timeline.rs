// SPDX-License-Identifier: MPL-2.0

use std::{sync::Arc, time::Duration};

/// Frame durations of one sequence, with every hold clamped to the minimum
/// time a frame stays on screen.
#[derive(Debug, Clone)]
pub(super) struct Timeline {
    durations: Arc<[Duration]>,
    min_hold: Duration,
}

impl Timeline {
    pub fn new(durations: impl Into<Arc<[Duration]>>, min_hold: Duration) -> Self {
        Self {
            durations: durations.into(),
            min_hold,
        }
    }

    pub fn len(&self) -> usize {
        self.durations.len()
    }

    pub fn hold(&self, frame: usize) -> Duration {
        self.durations
            .get(frame)
            .copied()
            .unwrap_or_default()
            .max(self.min_hold)
    }

    pub fn successor(&self, frame: usize) -> usize {
        (frame + 1) % self.len().max(1)
    }

    /// Frames stepped over going forward from `from` to `to`.
    pub fn distance(&self, from: usize, to: usize) -> usize {
        let len = self.len().max(1);
        (to + len - from % len) % len
    }

    /// The frame that should be on screen at `now`, given `front` was swapped
    /// in at `last_swap`.
    ///
    /// Never looks past the end of the loop, so catch-up restarts at the first
    /// frame at most.
    pub fn desired_frame(&self, front: usize, last_swap: Duration, now: Duration) -> usize {
        let mut candidate = self.successor(front);
        let mut end = last_swap + self.hold(front) + self.hold(candidate);
        while candidate != 0 && end < now + self.min_hold {
            candidate = self.successor(candidate);
            end += self.hold(candidate);
        }
        candidate
    }

    /// Nominal presentation time of `target` when counting forward from `front`.
    pub fn due(&self, front: usize, last_swap: Duration, target: usize) -> Duration {
        let mut due = last_swap + self.hold(front);
        let mut frame = self.successor(front);
        for _ in 0..self.len() {
            if frame == target {
                break;
            }
            due += self.hold(frame);
            frame = self.successor(frame);
        }
        due
    }
}
