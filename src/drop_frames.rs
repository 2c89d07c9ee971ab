// SPDX-License-Identifier: MPL-2.0

//! Policies for catching up when playback falls behind.

/// What a player may skip when the next frame can no longer be shown on time.
///
/// Both dropping policies consult [`FrameSequence::last_key_frame_in_range`]
/// first: [`DropAllowed`](Self::DropAllowed) is key-frame-or-drop-allowed and
/// [`KeyFrameOnly`](Self::KeyFrameOnly) is key-frame-or-drop-not-allowed.
/// There is no policy that jumps to the due frame without that lookup, since
/// the decoders replay from the last key frame anyway.
///
/// [`FrameSequence::last_key_frame_in_range`]: crate::FrameSequence::last_key_frame_in_range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DropFramesStrategy {
    /// Every frame is shown; late playback slows down instead of skipping.
    #[default]
    DropNotAllowed,
    /// Skip to the latest key frame that is due, or straight to the due frame
    /// when the skipped range has no key frame.
    DropAllowed,
    /// Skip only when a key frame is due, otherwise show the next frame.
    KeyFrameOnly,
}

impl DropFramesStrategy {
    /// Choose the frame to decode after `next - 1` given the frame that
    /// should be on screen (`desired`).
    ///
    /// `last_key_frame` answers the latest key frame in an inclusive range.
    /// A `desired` frame before `next` means catch-up reached the loop
    /// boundary; playback restarts from the first frame.
    pub fn resolve(
        self,
        next: usize,
        desired: usize,
        last_key_frame: impl FnOnce(usize, usize) -> Option<usize>,
    ) -> usize {
        if desired == next {
            return next;
        }

        match self {
            DropFramesStrategy::DropNotAllowed => next,
            _ if desired < next => desired,
            DropFramesStrategy::DropAllowed => last_key_frame(next, desired).unwrap_or(desired),
            DropFramesStrategy::KeyFrameOnly => last_key_frame(next, desired).unwrap_or(next),
        }
    }

    #[must_use]
    pub fn allows_drops(self) -> bool {
        self != DropFramesStrategy::DropNotAllowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(frames: &'static [usize]) -> impl Fn(usize, usize) -> Option<usize> {
        move |start, end| frames.iter().rev().copied().find(|&k| k >= start && k <= end)
    }

    #[test]
    fn on_time_is_next_for_all() {
        for strategy in [
            DropFramesStrategy::DropNotAllowed,
            DropFramesStrategy::DropAllowed,
            DropFramesStrategy::KeyFrameOnly,
        ] {
            assert_eq!(strategy.resolve(3, 3, keys(&[])), 3);
        }
    }

    #[test]
    fn drop_not_allowed_never_skips() {
        let strategy = DropFramesStrategy::DropNotAllowed;
        assert_eq!(strategy.resolve(1, 10, keys(&[5])), 1);
        assert_eq!(strategy.resolve(8, 0, keys(&[0])), 8);
        assert!(!strategy.allows_drops());
    }

    #[test]
    fn drop_allowed_prefers_key_frames() {
        let strategy = DropFramesStrategy::DropAllowed;
        assert_eq!(strategy.resolve(1, 10, keys(&[0, 5, 15])), 5);
        assert_eq!(strategy.resolve(1, 10, keys(&[0, 15])), 10);
        assert_eq!(strategy.resolve(1, 10, keys(&[10])), 10);
    }

    #[test]
    fn key_frame_only_falls_back_to_next() {
        let strategy = DropFramesStrategy::KeyFrameOnly;
        assert_eq!(strategy.resolve(1, 10, keys(&[0, 5, 15])), 5);
        assert_eq!(strategy.resolve(1, 10, keys(&[0, 15])), 1);
    }

    #[test]
    fn wraps_to_first_frame() {
        assert_eq!(DropFramesStrategy::DropAllowed.resolve(7, 0, keys(&[])), 0);
        assert_eq!(DropFramesStrategy::KeyFrameOnly.resolve(7, 0, keys(&[])), 0);
    }
}
