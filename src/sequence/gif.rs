// SPDX-License-Identifier: MPL-2.0

//! GIF frame sequence.
//!
//! Frames are kept as the palette indices of their own rectangle. Drawing
//! composites them onto a single canvas and replays forward from whichever
//! is later: the frame after the last one drawn, or the last key frame at or
//! before the target.

use std::{num::NonZeroU64, ops::Range, time::Duration};

use ::gif::{ColorOutput, DecodeOptions, DisposalMethod, MemoryLimit};
use image::{Rgba, RgbaImage};
use tracing::{debug, trace};

use super::{
    DEFAULT_FRAME_DURATION, DecodeError, FrameSequence, MAX_CANVAS_BYTES, check_dimensions,
    check_target, normalize_duration,
};
use crate::memory::{MemoryUsage, Reservation};

const CLEAR: Rgba<u8> = Rgba([0, 0, 0, 0]);

/// One image block, still in palette indices.
struct GifFrame {
    left: u32,
    top: u32,
    width: u32,
    height: u32,
    indices: Box<[u8]>,
    /// Local colour table. The global one applies when absent.
    palette: Option<Box<[u8]>>,
    transparent: Option<u8>,
    dispose: DisposalMethod,
    duration: Duration,
}

impl GifFrame {
    fn covers(&self, width: u32, height: u32) -> bool {
        self.left == 0 && self.top == 0 && self.width >= width && self.height >= height
    }

    /// Whether every pixel of the rectangle paints an opaque colour.
    fn is_solid(&self, global_palette: &[u8]) -> bool {
        let colors = self.palette.as_deref().unwrap_or(global_palette).len() / 3;
        self.indices
            .iter()
            .all(|&index| Some(index) != self.transparent && usize::from(index) < colors)
    }

    /// Column and row ranges of the rectangle clipped to the canvas.
    fn clipped(&self, width: u32, height: u32) -> (Range<u32>, Range<u32>) {
        let right = self.left.saturating_add(self.width).min(width);
        let bottom = self.top.saturating_add(self.height).min(height);
        (self.left.min(right)..right, self.top.min(bottom)..bottom)
    }

    fn byte_size(&self) -> usize {
        self.indices.len() + self.palette.as_ref().map_or(0, |palette| palette.len())
    }
}

pub struct GifFrameSequence {
    width: u32,
    height: u32,
    frames: Vec<GifFrame>,
    global_palette: Box<[u8]>,
    key_frames: Vec<bool>,
    opaque: bool,
    canvas: RgbaImage,
    /// Canvas pixels under the last composited frame, kept while that frame
    /// still has to be disposed to previous.
    saved: Option<(usize, Vec<Rgba<u8>>)>,
    last_drawn: Option<usize>,
    composited_frames: u64,
    reservation: Reservation,
}

impl GifFrameSequence {
    /// Read every image block of `data` into indexed frame records.
    ///
    /// # Errors
    ///
    /// Fails on malformed data, a logical screen that is empty or larger than
    /// [`MAX_CANVAS_BYTES`](super::MAX_CANVAS_BYTES), or a file without image
    /// blocks.
    pub fn decode(data: &[u8], memory: &MemoryUsage) -> Result<Self, DecodeError> {
        let mut options = DecodeOptions::new();
        options.set_color_output(ColorOutput::Indexed);
        if let Some(limit) = NonZeroU64::new(MAX_CANVAS_BYTES) {
            options.set_memory_limit(MemoryLimit::Bytes(limit));
        }
        let mut reader = options.read_info(data)?;

        let width = u32::from(reader.width());
        let height = u32::from(reader.height());
        check_dimensions(width, height)?;
        let global_palette: Box<[u8]> = reader.global_palette().unwrap_or_default().into();

        let mut frames = Vec::new();
        while let Some(frame) = reader.read_next_frame()? {
            frames.push(GifFrame {
                left: u32::from(frame.left),
                top: u32::from(frame.top),
                width: u32::from(frame.width),
                height: u32::from(frame.height),
                indices: Box::from(&*frame.buffer),
                palette: frame.palette.as_deref().map(Into::into),
                transparent: frame.transparent,
                dispose: frame.dispose,
                // Delay is in hundredths of a second.
                duration: normalize_duration(Duration::from_millis(u64::from(frame.delay) * 10)),
            });
        }

        let Some(first) = frames.first() else {
            return Err(DecodeError::NoFrames);
        };

        // Clearing after the last frame is invisible, frame 0 starts from a
        // clear canvas anyway.
        let opaque = first.covers(width, height)
            && first.is_solid(&global_palette)
            && frames[..frames.len() - 1]
                .iter()
                .enumerate()
                .all(|(index, frame)| match frame.dispose {
                    DisposalMethod::Background => false,
                    DisposalMethod::Previous => index > 0,
                    DisposalMethod::Any | DisposalMethod::Keep => true,
                });
        let key_frames = key_frames(&frames, &global_palette, width, height);
        let canvas = RgbaImage::new(width, height);
        let bytes = canvas.as_raw().len()
            + global_palette.len()
            + frames.iter().map(GifFrame::byte_size).sum::<usize>();

        debug!(
            width,
            height,
            frames = frames.len(),
            key_frames = key_frames.iter().filter(|key| **key).count(),
            opaque,
            bytes,
            "indexed GIF"
        );

        Ok(Self {
            width,
            height,
            frames,
            global_palette,
            key_frames,
            opaque,
            canvas,
            saved: None,
            last_drawn: None,
            composited_frames: 0,
            reservation: memory.reserve(bytes),
        })
    }

    fn is_key_frame(&self, frame: usize) -> bool {
        self.key_frames.get(frame).copied().unwrap_or(false)
    }

    fn clear_canvas(&mut self) {
        for pixel in self.canvas.pixels_mut() {
            *pixel = CLEAR;
        }
        self.saved = None;
    }

    fn dispose(&mut self, index: usize) {
        let Some(frame) = self.frames.get(index) else {
            return;
        };
        let (columns, rows) = frame.clipped(self.width, self.height);

        match frame.dispose {
            DisposalMethod::Background => {
                for y in rows {
                    for x in columns.clone() {
                        self.canvas.put_pixel(x, y, CLEAR);
                    }
                }
            }
            DisposalMethod::Previous => {
                let Some((saved, under)) = self.saved.take() else {
                    return;
                };
                if saved != index {
                    return;
                }
                let mut under = under.into_iter();
                for y in rows {
                    for x in columns.clone() {
                        if let Some(pixel) = under.next() {
                            self.canvas.put_pixel(x, y, pixel);
                        }
                    }
                }
            }
            DisposalMethod::Any | DisposalMethod::Keep => {}
        }
    }

    /// Bring the canvas to the composited state of `frame`.
    fn render_to(&mut self, frame: usize) {
        let key = (0..=frame)
            .rev()
            .find(|&index| self.is_key_frame(index))
            .unwrap_or(0);

        let start = match self.last_drawn {
            Some(last) if key <= last && last < frame => {
                self.dispose(last);
                last + 1
            }
            _ => {
                self.clear_canvas();
                key
            }
        };

        trace!(frame, start, key, last_drawn = ?self.last_drawn, "replaying GIF frames");

        for index in start..=frame {
            if index > start {
                self.dispose(index - 1);
            }
            self.composite(index);
            self.last_drawn = Some(index);
        }
    }

    fn composite(&mut self, index: usize) {
        let Self {
            frames,
            global_palette,
            canvas,
            saved,
            composited_frames,
            ..
        } = self;
        let Some(frame) = frames.get(index) else {
            return;
        };
        let (columns, rows) = frame.clipped(canvas.width(), canvas.height());

        *saved = None;
        if frame.dispose == DisposalMethod::Previous {
            let mut under = Vec::with_capacity(columns.len() * rows.len());
            for y in rows.clone() {
                for x in columns.clone() {
                    under.push(*canvas.get_pixel(x, y));
                }
            }
            *saved = Some((index, under));
        }

        let palette = frame.palette.as_deref().unwrap_or(&global_palette[..]);
        let stride = frame.width as usize;
        for y in rows {
            for x in columns.clone() {
                let offset = (y - frame.top) as usize * stride + (x - frame.left) as usize;
                let Some(&color) = frame.indices.get(offset) else {
                    continue;
                };
                // Transparent pixels leave what is underneath.
                if Some(color) == frame.transparent {
                    continue;
                }
                let base = usize::from(color) * 3;
                if let Some(rgb) = palette.get(base..base + 3) {
                    canvas.put_pixel(x, y, Rgba([rgb[0], rgb[1], rgb[2], u8::MAX]));
                }
            }
        }
        *composited_frames += 1;
    }
}

/// Frames that can be drawn onto a cleared canvas.
///
/// The first frame is one. So is a frame painting every pixel of the canvas,
/// unless it later restores what it covered, and a frame following one that
/// was cleared to background after covering the canvas or being a key frame
/// itself.
fn key_frames(frames: &[GifFrame], global_palette: &[u8], width: u32, height: u32) -> Vec<bool> {
    let mut keys: Vec<bool> = Vec::with_capacity(frames.len());
    for (index, frame) in frames.iter().enumerate() {
        let key = match index.checked_sub(1) {
            None => true,
            Some(_)
                if frame.covers(width, height)
                    && frame.dispose != DisposalMethod::Previous
                    && frame.is_solid(global_palette) =>
            {
                true
            }
            Some(previous) => {
                let prev = &frames[previous];
                prev.dispose == DisposalMethod::Background
                    && (prev.covers(width, height) || keys[previous])
            }
        };
        keys.push(key);
    }
    keys
}

impl FrameSequence for GifFrameSequence {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn frame_count(&self) -> usize {
        self.frames.len()
    }

    fn frame_duration(&self, frame: usize) -> Duration {
        self.frames
            .get(frame)
            .map_or(DEFAULT_FRAME_DURATION, |info| info.duration)
    }

    fn may_have_blending(&self) -> bool {
        self.key_frames.iter().any(|key| !key)
    }

    fn is_opaque(&self) -> bool {
        self.opaque
    }

    fn draw_frame(&mut self, frame: usize, target: &mut RgbaImage) -> Result<(), DecodeError> {
        check_target(&*self, frame, target)?;

        if self.last_drawn != Some(frame) {
            self.render_to(frame);
        }

        target.copy_from_slice(self.canvas.as_raw());
        Ok(())
    }

    fn last_key_frame_in_range(&self, start: usize, end: usize) -> Option<usize> {
        if start > end {
            return None;
        }
        (start..=end).rev().find(|&frame| self.is_key_frame(frame))
    }

    fn byte_size(&self) -> usize {
        self.reservation.bytes()
    }

    fn release(&mut self) {
        if self.reservation.is_released() {
            return;
        }
        for frame in &mut self.frames {
            frame.indices = Box::default();
            frame.palette = None;
        }
        self.global_palette = Box::default();
        self.canvas = RgbaImage::new(0, 0);
        self.saved = None;
        self.last_drawn = None;
        self.reservation.release();
        debug!(
            width = self.width,
            height = self.height,
            composited_frames = self.composited_frames,
            "released GIF"
        );
    }

    fn is_released(&self) -> bool {
        self.reservation.is_released()
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::borrow::Cow;

    use ::gif::{DisposalMethod, Encoder, Frame, Repeat};

    /// Palette index 0 is transparent black, then red, green, blue, white.
    pub const PALETTE: [u8; 15] = [0, 0, 0, 255, 0, 0, 0, 255, 0, 0, 0, 255, 255, 255, 255];
    pub const TRANSPARENT: u8 = 0;
    pub const RED: u8 = 1;
    pub const GREEN: u8 = 2;
    pub const BLUE: u8 = 3;

    pub struct FixtureFrame {
        pub left: u16,
        pub top: u16,
        pub width: u16,
        pub height: u16,
        pub fill: u8,
        pub delay: u16,
        pub dispose: DisposalMethod,
    }

    impl FixtureFrame {
        pub fn full(width: u16, height: u16, fill: u8, delay: u16) -> Self {
            Self {
                left: 0,
                top: 0,
                width,
                height,
                fill,
                delay,
                dispose: DisposalMethod::Keep,
            }
        }
    }

    pub fn encode(width: u16, height: u16, frames: &[FixtureFrame]) -> Vec<u8> {
        let mut data = Vec::new();
        {
            let mut encoder = Encoder::new(&mut data, width, height, &PALETTE).unwrap();
            encoder.set_repeat(Repeat::Infinite).unwrap();
            for fixture in frames {
                let indices = vec![fixture.fill; usize::from(fixture.width) * usize::from(fixture.height)];
                let frame = Frame {
                    left: fixture.left,
                    top: fixture.top,
                    width: fixture.width,
                    height: fixture.height,
                    delay: fixture.delay,
                    dispose: fixture.dispose,
                    transparent: Some(TRANSPARENT),
                    buffer: Cow::Owned(indices),
                    ..Frame::default()
                };
                encoder.write_frame(&frame).unwrap();
            }
        }
        data
    }

    /// Fully opaque animation of `count` frames cycling red, green, blue.
    pub fn solid_animation(width: u16, height: u16, count: usize, delay: u16) -> Vec<u8> {
        let frames: Vec<_> = (0..count)
            .map(|i| FixtureFrame::full(width, height, [RED, GREEN, BLUE][i % 3], delay))
            .collect();
        encode(width, height, &frames)
    }
}
