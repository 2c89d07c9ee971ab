// SPDX-License-Identifier: MPL-2.0

//! Frame sequences: decoded animated sources that can draw any frame on demand.
//!
//! # Supported Formats
//!
//! | Format | Blending | Key frames | Notes |
//! |--------|----------|------------|-------|
//! | GIF    | yes      | full opaque frames, frames after a full clear | indexed frames kept, composited on demand |
//! | WebP   | yes      | per libwebp rules | bitstreams kept, composited on demand |
//!
//! Both decoders keep one RGBA canvas and replay forward from the last key
//! frame, so memory grows with the encoded size rather than the frame count.

mod detection;
#[cfg(feature = "gif")]
pub mod gif;
#[cfg(feature = "webp")]
pub mod webp;

use std::{path::Path, sync::Arc, time::Duration};

use image::RgbaImage;

use crate::{drop_frames::DropFramesStrategy, memory::MemoryUsage};

pub use detection::{is_animated_file, is_gif_file, is_webp_file};

/// Display time used when a source does not author a usable one.
pub const DEFAULT_FRAME_DURATION: Duration = Duration::from_millis(100);

/// Authored delays at or below this are replaced by [`DEFAULT_FRAME_DURATION`],
/// as browsers do. A zero delay is undefined in the GIF standard.
pub const MIN_AUTHORED_FRAME_DURATION: Duration = Duration::from_millis(10);

/// Largest RGBA canvas a source may declare, 8192x8192 pixels.
pub const MAX_CANVAS_BYTES: u64 = 256 * 1024 * 1024;

/// Reject empty canvases and canvases over [`MAX_CANVAS_BYTES`] before
/// anything is allocated for them.
pub(crate) fn check_dimensions(width: u32, height: u32) -> Result<(), DecodeError> {
    let bytes = u64::from(width) * u64::from(height) * 4;
    if bytes == 0 || bytes > MAX_CANVAS_BYTES {
        return Err(DecodeError::InvalidDimensions { width, height });
    }
    Ok(())
}

pub(crate) fn normalize_duration(duration: Duration) -> Duration {
    if duration <= MIN_AUTHORED_FRAME_DURATION {
        DEFAULT_FRAME_DURATION
    } else {
        duration
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[cfg(feature = "gif")]
    #[error("malformed GIF data")]
    Gif(#[from] ::gif::DecodingError),
    #[cfg(feature = "webp")]
    #[error("malformed WebP data")]
    WebP(#[from] image_webp::DecodingError),
    #[error("malformed {format} container: {reason}")]
    Container { format: &'static str, reason: String },
    #[error("unsupported format: {0}")]
    Unsupported(&'static str),
    #[error("source contains no frames")]
    NoFrames,
    #[error("invalid dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },
    #[error("frame {frame} out of range, sequence has {count} frames")]
    FrameOutOfRange { frame: usize, count: usize },
    #[error("target buffer is {actual:?}, expected {expected:?}")]
    BufferSize {
        expected: (u32, u32),
        actual: (u32, u32),
    },
    #[error("frame sequence already released")]
    Released,
}

/// A decoded animated source.
///
/// Metadata accessors are cheap and stay valid after [`release`](Self::release);
/// drawing does not.
pub trait FrameSequence: Send {
    fn width(&self) -> u32;

    fn height(&self) -> u32;

    fn frame_count(&self) -> usize;

    /// How long `frame` should stay on screen. Always positive.
    fn frame_duration(&self, frame: usize) -> Duration;

    /// Whether a frame may depend on the pixels of the frames before it.
    fn may_have_blending(&self) -> bool;

    fn is_opaque(&self) -> bool;

    /// Render the fully composited `frame` into `target`, which must be
    /// `width() x height()`.
    ///
    /// # Errors
    ///
    /// Fails on corrupt frame data, a mis-sized target, an out of range
    /// frame, or after release.
    fn draw_frame(&mut self, frame: usize, target: &mut RgbaImage) -> Result<(), DecodeError>;

    /// Latest key frame in `start..=end`, if any.
    ///
    /// A key frame can be drawn without any frame before it, so skipping to it
    /// from `start` never requires decoding frames before `start`.
    fn last_key_frame_in_range(&self, start: usize, end: usize) -> Option<usize> {
        (start <= end).then_some(end)
    }

    /// Bytes held by this sequence, as reported to [`MemoryUsage`].
    fn byte_size(&self) -> usize;

    /// Free decoder resources. Only the first call has an effect.
    fn release(&mut self);

    fn is_released(&self) -> bool;
}

pub(crate) fn check_target(
    sequence: &dyn FrameSequence,
    frame: usize,
    target: &RgbaImage,
) -> Result<(), DecodeError> {
    if sequence.is_released() {
        return Err(DecodeError::Released);
    }

    let count = sequence.frame_count();
    if frame >= count {
        return Err(DecodeError::FrameOutOfRange { frame, count });
    }

    let expected = (sequence.width(), sequence.height());
    if target.dimensions() != expected {
        return Err(DecodeError::BufferSize {
            expected,
            actual: target.dimensions(),
        });
    }

    Ok(())
}

/// Source formats with a [`FrameSequence`] implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameSequenceKind {
    Gif,
    WebP,
}

impl FrameSequenceKind {
    /// Identify the format from the leading magic bytes.
    #[must_use]
    pub fn detect(bytes: &[u8]) -> Option<Self> {
        detection::sniff(bytes)
    }

    /// Identify the format from the file extension.
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        if is_gif_file(path) {
            Some(FrameSequenceKind::Gif)
        } else if is_webp_file(path) {
            Some(FrameSequenceKind::WebP)
        } else {
            None
        }
    }

    /// Drop policy suited to the format.
    ///
    /// GIF frames are small index planes that replay quickly from a key
    /// frame, so skipping stays cheap. Transparent WebP frames blend over
    /// their predecessors and are played without drops.
    #[must_use]
    pub fn drop_frames_strategy(self, has_transparency: bool) -> DropFramesStrategy {
        match self {
            FrameSequenceKind::Gif => DropFramesStrategy::DropAllowed,
            FrameSequenceKind::WebP if has_transparency => DropFramesStrategy::DropNotAllowed,
            FrameSequenceKind::WebP => DropFramesStrategy::DropAllowed,
        }
    }

    /// Decode `data` into a frame sequence accounted against `memory`.
    ///
    /// # Errors
    ///
    /// Fails if the data is malformed or the format support is compiled out.
    pub fn decode(
        self,
        data: impl Into<Arc<[u8]>>,
        memory: &MemoryUsage,
    ) -> Result<Box<dyn FrameSequence>, DecodeError> {
        let data = data.into();
        match self {
            #[cfg(feature = "gif")]
            FrameSequenceKind::Gif => Ok(Box::new(gif::GifFrameSequence::decode(&data, memory)?)),
            #[cfg(feature = "webp")]
            FrameSequenceKind::WebP => Ok(Box::new(webp::WebpFrameSequence::decode(data, memory)?)),
            #[allow(unreachable_patterns)]
            _ => {
                let _ = (data, memory);
                Err(DecodeError::Unsupported(self.name()))
            }
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            FrameSequenceKind::Gif => "GIF",
            FrameSequenceKind::WebP => "WebP",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiny_delays_become_default() {
        assert_eq!(normalize_duration(Duration::ZERO), DEFAULT_FRAME_DURATION);
        assert_eq!(
            normalize_duration(Duration::from_millis(10)),
            DEFAULT_FRAME_DURATION
        );
        assert_eq!(
            normalize_duration(Duration::from_millis(20)),
            Duration::from_millis(20)
        );
    }

    #[test]
    fn canvas_size_is_bounded() {
        assert!(check_dimensions(1, 1).is_ok());
        assert!(check_dimensions(8192, 8192).is_ok());
        assert!(matches!(
            check_dimensions(8193, 8192),
            Err(DecodeError::InvalidDimensions { width: 8193, height: 8192 })
        ));
        assert!(check_dimensions(0, 10).is_err());
        assert!(check_dimensions(1 << 24, 1 << 24).is_err());
        assert!(check_dimensions(u32::MAX, u32::MAX).is_err());
    }

    #[test]
    fn strategy_per_format() {
        assert_eq!(
            FrameSequenceKind::Gif.drop_frames_strategy(true),
            DropFramesStrategy::DropAllowed
        );
        assert_eq!(
            FrameSequenceKind::WebP.drop_frames_strategy(true),
            DropFramesStrategy::DropNotAllowed
        );
        assert_eq!(
            FrameSequenceKind::WebP.drop_frames_strategy(false),
            DropFramesStrategy::DropAllowed
        );
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let memory = MemoryUsage::new();
        for kind in [FrameSequenceKind::Gif, FrameSequenceKind::WebP] {
            let result = kind.decode(vec![0u8, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12], &memory);
            assert!(result.is_err(), "{kind:?} accepted garbage");
        }
        assert_eq!(memory.total_bytes(), 0);
    }
}
