// SPDX-License-Identifier: MPL-2.0

//! WebP frame sequence.
//!
//! Animated WebP frames are sub-rectangles that may alpha-blend over the
//! canvas left by earlier frames. The sequence keeps one composited canvas
//! and, to draw a frame, replays forward from whichever is later: the frame
//! after the last one drawn, or the last key frame at or before the target.

mod container;

use std::{
    io::{BufRead, Cursor, Seek},
    sync::Arc,
    time::Duration,
};

use image::{Rgba, RgbaImage};
use image_webp::WebPDecoder;
use tracing::{debug, trace};

use self::container::{FrameInfo, malformed};
use super::{DEFAULT_FRAME_DURATION, DecodeError, FrameSequence, check_dimensions, check_target};
use crate::memory::{MemoryUsage, Reservation};

pub struct WebpFrameSequence {
    data: Arc<[u8]>,
    width: u32,
    height: u32,
    frames: Vec<FrameInfo>,
    key_frames: Vec<bool>,
    opaque: bool,
    canvas: RgbaImage,
    last_drawn: Option<usize>,
    decoded_frames: u64,
    reservation: Reservation,
}

impl WebpFrameSequence {
    /// Parse the container of `data` and index its frames.
    ///
    /// Pixel data is decoded lazily by [`FrameSequence::draw_frame`], except
    /// for still images whose header is read here to learn the dimensions.
    ///
    /// # Errors
    ///
    /// Fails on a malformed container, an animation without frames, or
    /// frames that extend past the canvas.
    pub fn decode(data: Arc<[u8]>, memory: &MemoryUsage) -> Result<Self, DecodeError> {
        let container = container::parse(&data)?;

        let (width, height, frames) = if container.animated || !container.frames.is_empty() {
            let (width, height) = container
                .canvas
                .ok_or_else(|| malformed("animation without a VP8X header"))?;
            if container.frames.is_empty() {
                return Err(DecodeError::NoFrames);
            }
            (width, height, container.frames)
        } else {
            let decoder = WebPDecoder::new(Cursor::new(&data[..]))?;
            let (width, height) = decoder.dimensions();
            (width, height, vec![FrameInfo::still(width, height, decoder.has_alpha())])
        };

        check_dimensions(width, height)?;

        let key_frames = key_frames(&frames, width, height);
        let opaque = !container.has_alpha
            && frames.first().is_some_and(|first| first.covers(width, height))
            && frames
                .iter()
                .all(|frame| !frame.has_alpha && !frame.dispose_to_background);
        let canvas = RgbaImage::new(width, height);
        let bytes = data.len() + canvas.as_raw().len();

        debug!(
            width,
            height,
            frames = frames.len(),
            key_frames = key_frames.iter().filter(|key| **key).count(),
            loop_count = container.loop_count,
            opaque,
            "indexed WebP"
        );

        Ok(Self {
            data,
            width,
            height,
            frames,
            key_frames,
            opaque,
            canvas,
            last_drawn: None,
            decoded_frames: 0,
            reservation: memory.reserve(bytes),
        })
    }

    fn is_key_frame(&self, frame: usize) -> bool {
        self.key_frames.get(frame).copied().unwrap_or(false)
    }

    fn clear_canvas(&mut self) {
        for pixel in self.canvas.pixels_mut() {
            *pixel = Rgba([0, 0, 0, 0]);
        }
    }

    fn dispose(&mut self, frame: usize) {
        let Some(info) = self.frames.get(frame) else {
            return;
        };
        if !info.dispose_to_background {
            return;
        }
        for y in info.y..info.y + info.height {
            for x in info.x..info.x + info.width {
                self.canvas.put_pixel(x, y, Rgba([0, 0, 0, 0]));
            }
        }
    }

    /// Bring the canvas to the composited state of `frame`.
    fn render_to(&mut self, frame: usize) -> Result<(), DecodeError> {
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

        trace!(frame, start, key, last_drawn = ?self.last_drawn, "replaying WebP frames");

        for index in start..=frame {
            if index > start {
                self.dispose(index - 1);
            }
            self.composite(index)?;
            self.last_drawn = Some(index);
        }

        Ok(())
    }

    fn composite(&mut self, index: usize) -> Result<(), DecodeError> {
        let Self {
            data,
            frames,
            canvas,
            decoded_frames,
            ..
        } = self;
        let info = frames.get(index).ok_or(DecodeError::FrameOutOfRange {
            frame: index,
            count: frames.len(),
        })?;

        let pixels = read_rgba(
            Cursor::new(container::standalone(data, info)?),
            index,
            (info.width, info.height),
        )?;
        *decoded_frames += 1;
        let width = info.width;

        for (i, src) in pixels.chunks_exact(4).enumerate() {
            let x = info.x + i as u32 % width;
            let y = info.y + i as u32 / width;
            let dst = canvas.get_pixel_mut(x, y);
            let src = Rgba([src[0], src[1], src[2], src[3]]);
            if info.blend {
                blend_over(dst, src);
            } else {
                *dst = src;
            }
        }

        Ok(())
    }
}

/// Decode the still WebP of frame `index` to RGBA8, expanding opaque RGB
/// output. The bitstream must have the size its `ANMF` header announced.
fn read_rgba<R: BufRead + Seek>(
    reader: R,
    index: usize,
    expected: (u32, u32),
) -> Result<Vec<u8>, DecodeError> {
    let mut decoder = WebPDecoder::new(reader)?;
    let (width, height) = decoder.dimensions();
    if (width, height) != expected {
        return Err(malformed(format!(
            "frame {index} is {width}x{height}, header says {}x{}",
            expected.0, expected.1
        )));
    }
    let size = decoder
        .output_buffer_size()
        .ok_or(DecodeError::InvalidDimensions { width, height })?;
    let mut buffer = vec![0; size];
    decoder.read_image(&mut buffer)?;

    if decoder.has_alpha() {
        return Ok(buffer);
    }

    let mut rgba = Vec::with_capacity(buffer.len() / 3 * 4);
    for rgb in buffer.chunks_exact(3) {
        rgba.extend_from_slice(&[rgb[0], rgb[1], rgb[2], u8::MAX]);
    }
    Ok(rgba)
}

/// Non-premultiplied source-over.
fn blend_over(dst: &mut Rgba<u8>, src: Rgba<u8>) {
    let src_alpha = u32::from(src[3]);
    if src_alpha == 0 {
        return;
    }
    if src_alpha == 255 {
        *dst = src;
        return;
    }

    let dst_weight = u32::from(dst[3]) * (255 - src_alpha) / 255;
    let alpha = src_alpha + dst_weight;
    for channel in 0..3 {
        let value = u32::from(src[channel]) * src_alpha + u32::from(dst[channel]) * dst_weight;
        dst[channel] = (value / alpha) as u8;
    }
    dst[3] = alpha as u8;
}

/// Frames that can be drawn onto a cleared canvas.
///
/// A frame is a key frame when it is the first one, when it fully covers the
/// canvas without blending into it, or when the frame before it was cleared
/// to background and itself covered the canvas or was a key frame.
fn key_frames(frames: &[FrameInfo], width: u32, height: u32) -> Vec<bool> {
    let mut keys: Vec<bool> = Vec::with_capacity(frames.len());
    for (index, frame) in frames.iter().enumerate() {
        let key = match index.checked_sub(1) {
            None => true,
            Some(_) if frame.covers(width, height) && (!frame.has_alpha || !frame.blend) => true,
            Some(previous) => {
                let prev = &frames[previous];
                prev.dispose_to_background && (prev.covers(width, height) || keys[previous])
            }
        };
        keys.push(key);
    }
    keys
}

impl FrameSequence for WebpFrameSequence {
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
        self.frames.len() > 1
    }

    fn is_opaque(&self) -> bool {
        self.opaque
    }

    fn draw_frame(&mut self, frame: usize, target: &mut RgbaImage) -> Result<(), DecodeError> {
        check_target(&*self, frame, target)?;

        if self.last_drawn != Some(frame) {
            if let Err(error) = self.render_to(frame) {
                // The canvas holds a partial replay.
                self.last_drawn = None;
                return Err(error);
            }
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
        self.data = Arc::from(Vec::new());
        self.canvas = RgbaImage::new(0, 0);
        self.last_drawn = None;
        self.reservation.release();
        debug!(
            width = self.width,
            height = self.height,
            decoded_frames = self.decoded_frames,
            "released WebP"
        );
    }

    fn is_released(&self) -> bool {
        self.reservation.is_released()
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use image_webp::{ColorType, WebPEncoder};

    use super::container::{ALPHA_FLAG, ANIMATION_FLAG, chunks, push_chunk, push_u24, riff};

    /// A still lossless WebP file.
    pub fn still(width: u32, height: u32, rgba: &[u8]) -> Vec<u8> {
        let mut file = Vec::new();
        WebPEncoder::new(&mut file)
            .encode(rgba, width, height, ColorType::Rgba8)
            .unwrap();
        file
    }

    fn lossless_bitstream(width: u32, height: u32, color: [u8; 4]) -> Vec<u8> {
        let pixels: Vec<u8> = (0..width * height).flat_map(|_| color).collect();
        let file = still(width, height, &pixels);
        let chunk = chunks(&file, 12..file.len())
            .map(Result::unwrap)
            .find(|chunk| &chunk.fourcc == b"VP8L")
            .unwrap();
        file[chunk.payload].to_vec()
    }

    pub struct AnimationFrame {
        pub x: u32,
        pub y: u32,
        pub width: u32,
        pub height: u32,
        pub color: [u8; 4],
        pub duration_ms: u32,
        pub blend: bool,
        pub dispose_to_background: bool,
    }

    impl AnimationFrame {
        pub fn full(width: u32, height: u32, color: [u8; 4]) -> Self {
            Self {
                x: 0,
                y: 0,
                width,
                height,
                color,
                duration_ms: 100,
                blend: true,
                dispose_to_background: false,
            }
        }

        pub fn patch(x: u32, y: u32, width: u32, height: u32, color: [u8; 4]) -> Self {
            Self {
                x,
                y,
                ..Self::full(width, height, color)
            }
        }
    }

    /// An animated WebP with one solid-colour lossless rectangle per frame.
    pub fn animation(width: u32, height: u32, frames: &[AnimationFrame]) -> Vec<u8> {
        let mut body = Vec::new();

        let mut vp8x = vec![ANIMATION_FLAG | ALPHA_FLAG, 0, 0, 0];
        push_u24(&mut vp8x, width - 1);
        push_u24(&mut vp8x, height - 1);
        push_chunk(&mut body, b"VP8X", &vp8x);

        // Transparent background, loop forever.
        push_chunk(&mut body, b"ANIM", &[0, 0, 0, 0, 0, 0]);

        for frame in frames {
            let mut anmf = Vec::new();
            push_u24(&mut anmf, frame.x / 2);
            push_u24(&mut anmf, frame.y / 2);
            push_u24(&mut anmf, frame.width - 1);
            push_u24(&mut anmf, frame.height - 1);
            push_u24(&mut anmf, frame.duration_ms);
            let mut flags = 0;
            if !frame.blend {
                flags |= 0x02;
            }
            if frame.dispose_to_background {
                flags |= 0x01;
            }
            anmf.push(flags);
            push_chunk(
                &mut anmf,
                b"VP8L",
                &lossless_bitstream(frame.width, frame.height, frame.color),
            );
            push_chunk(&mut body, b"ANMF", &anmf);
        }

        riff(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    const RED: [u8; 4] = [255, 0, 0, 255];
    const GREEN: [u8; 4] = [0, 255, 0, 255];
    const BLUE: [u8; 4] = [0, 0, 255, 255];
    const CLEAR: [u8; 4] = [0, 0, 0, 0];

    fn decode(data: Vec<u8>, memory: &MemoryUsage) -> WebpFrameSequence {
        WebpFrameSequence::decode(Arc::from(data), memory).unwrap()
    }

    fn draw(sequence: &mut WebpFrameSequence, frame: usize) -> RgbaImage {
        let mut target = RgbaImage::new(sequence.width(), sequence.height());
        sequence.draw_frame(frame, &mut target).unwrap();
        target
    }

    /// key frames: 0 (first), 3 (full, no blend), 4 (after a full frame
    /// disposed to background).
    fn layered() -> Vec<u8> {
        animation(
            4,
            4,
            &[
                AnimationFrame::full(4, 4, RED),
                AnimationFrame::patch(0, 0, 2, 2, GREEN),
                AnimationFrame {
                    dispose_to_background: true,
                    ..AnimationFrame::patch(2, 2, 2, 2, BLUE)
                },
                AnimationFrame {
                    blend: false,
                    dispose_to_background: true,
                    ..AnimationFrame::full(4, 4, RED)
                },
                AnimationFrame::patch(0, 0, 2, 2, GREEN),
            ],
        )
    }

    #[test]
    fn indexes_animation() {
        let memory = MemoryUsage::new();
        let sequence = decode(layered(), &memory);

        assert_eq!((sequence.width(), sequence.height()), (4, 4));
        assert_eq!(sequence.frame_count(), 5);
        assert_eq!(sequence.frame_duration(2), Duration::from_millis(100));
        assert!(sequence.may_have_blending());
        assert!(!sequence.is_opaque());
        assert_eq!(sequence.key_frames, vec![true, false, false, true, true]);
        assert!(memory.total_bytes() > 0);
    }

    #[test]
    fn finds_last_key_frame_in_range() {
        let memory = MemoryUsage::new();
        let sequence = decode(layered(), &memory);

        assert_eq!(sequence.last_key_frame_in_range(1, 2), None);
        assert_eq!(sequence.last_key_frame_in_range(1, 3), Some(3));
        assert_eq!(sequence.last_key_frame_in_range(0, 4), Some(4));
        assert_eq!(sequence.last_key_frame_in_range(0, 2), Some(0));
        assert_eq!(sequence.last_key_frame_in_range(3, 1), None);
    }

    #[test]
    fn composites_partial_frames() {
        let memory = MemoryUsage::new();
        let mut sequence = decode(layered(), &memory);

        let third = draw(&mut sequence, 2);
        assert_eq!(third.get_pixel(0, 0).0, GREEN);
        assert_eq!(third.get_pixel(3, 3).0, BLUE);
        assert_eq!(third.get_pixel(3, 0).0, RED);

        // Frame 3 was disposed to background, frame 4 starts from clear.
        let fifth = draw(&mut sequence, 4);
        assert_eq!(fifth.get_pixel(1, 1).0, GREEN);
        assert_eq!(fifth.get_pixel(3, 3).0, CLEAR);
    }

    #[test]
    fn replays_from_key_frame_or_last_drawn() {
        let memory = MemoryUsage::new();
        let mut sequence = decode(layered(), &memory);

        draw(&mut sequence, 2);
        assert_eq!(sequence.decoded_frames, 3);

        // Key frame 4 is past the last drawn frame.
        draw(&mut sequence, 4);
        assert_eq!(sequence.decoded_frames, 4);

        // Same frame again is served from the canvas.
        draw(&mut sequence, 4);
        assert_eq!(sequence.decoded_frames, 4);

        // Going backwards replays from frame 0.
        let second = draw(&mut sequence, 1);
        assert_eq!(sequence.decoded_frames, 6);
        assert_eq!(second.get_pixel(0, 0).0, GREEN);
        assert_eq!(second.get_pixel(3, 3).0, RED);
    }

    #[test]
    fn blends_translucent_pixels() {
        let memory = MemoryUsage::new();
        let data = animation(
            2,
            2,
            &[
                AnimationFrame::full(2, 2, RED),
                AnimationFrame::full(2, 2, [0, 0, 255, 128]),
                AnimationFrame {
                    blend: false,
                    ..AnimationFrame::full(2, 2, [0, 0, 255, 128])
                },
            ],
        );
        let mut sequence = decode(data, &memory);

        assert_eq!(draw(&mut sequence, 1).get_pixel(0, 0).0, [127, 0, 128, 255]);
        assert_eq!(draw(&mut sequence, 2).get_pixel(0, 0).0, [0, 0, 255, 128]);
    }

    #[test]
    fn blend_over_math() {
        let mut dst = Rgba([255, 0, 0, 255]);
        blend_over(&mut dst, Rgba([0, 0, 255, 0]));
        assert_eq!(dst.0, RED);

        blend_over(&mut dst, Rgba([0, 0, 255, 128]));
        assert_eq!(dst.0, [127, 0, 128, 255]);

        let mut empty = Rgba(CLEAR);
        blend_over(&mut empty, Rgba([10, 20, 30, 40]));
        assert_eq!(empty.0, [10, 20, 30, 40]);
    }

    #[test]
    fn decodes_still_image() {
        let memory = MemoryUsage::new();
        let pixels: Vec<u8> = [RED, GREEN, BLUE, CLEAR, RED, GREEN]
            .into_iter()
            .flatten()
            .collect();
        let mut sequence = decode(still(3, 2, &pixels), &memory);

        assert_eq!(sequence.frame_count(), 1);
        assert_eq!(sequence.frame_duration(0), DEFAULT_FRAME_DURATION);
        assert!(!sequence.may_have_blending());
        assert_eq!(sequence.last_key_frame_in_range(0, 0), Some(0));

        let frame = draw(&mut sequence, 0);
        assert_eq!(frame.as_raw(), &pixels);
    }

    #[test]
    fn rejects_frames_outside_canvas() {
        let memory = MemoryUsage::new();
        let data = animation(2, 2, &[AnimationFrame::patch(2, 0, 2, 2, RED)]);
        assert!(WebpFrameSequence::decode(Arc::from(data), &memory).is_err());
        assert_eq!(memory.total_bytes(), 0);
    }

    #[test]
    fn rejects_oversized_canvas() {
        let memory = MemoryUsage::new();
        // 16777216x16777216 canvas around a single 1x1 frame.
        let data = animation(1 << 24, 1 << 24, &[AnimationFrame::patch(0, 0, 1, 1, RED)]);
        assert!(data.len() < 128);

        assert!(matches!(
            WebpFrameSequence::decode(Arc::from(data), &memory),
            Err(DecodeError::InvalidDimensions {
                width: 16_777_216,
                height: 16_777_216
            })
        ));
        assert_eq!(memory.total_bytes(), 0);
    }

    #[test]
    fn truncated_animation_fails() {
        let memory = MemoryUsage::new();
        let mut data = layered();
        let riff_size = (data.len() - 8) as u32;
        data.truncate(data.len() - 20);
        // Keep the declared size so the last chunk overruns.
        data[4..8].copy_from_slice(&riff_size.to_le_bytes());
        assert!(WebpFrameSequence::decode(Arc::from(data), &memory).is_err());
    }

    #[test]
    fn release_frees_memory_once() {
        let memory = MemoryUsage::new();
        let mut sequence = decode(layered(), &memory);
        draw(&mut sequence, 1);

        sequence.release();
        sequence.release();

        assert!(sequence.is_released());
        assert_eq!(memory.snapshot().sequences, 0);
        assert_eq!(memory.total_bytes(), 0);
        assert_eq!(sequence.frame_count(), 5);

        let mut target = RgbaImage::new(4, 4);
        assert!(matches!(
            sequence.draw_frame(0, &mut target),
            Err(DecodeError::Released)
        ));
    }
}
