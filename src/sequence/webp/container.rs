// SPDX-License-Identifier: MPL-2.0

//! RIFF layout of WebP files: chunk walking, `VP8X`/`ANIM`/`ANMF` headers,
//! and re-wrapping a single frame bitstream as a standalone still image.

use std::{ops::Range, time::Duration};

use crate::sequence::{DEFAULT_FRAME_DURATION, DecodeError, normalize_duration};

pub(super) const ALPHA_FLAG: u8 = 0x10;
pub(super) const ANIMATION_FLAG: u8 = 0x02;

const ANMF_HEADER_LEN: usize = 16;
const VP8L_SIGNATURE: u8 = 0x2f;

pub(super) fn malformed(reason: impl Into<String>) -> DecodeError {
    DecodeError::Container {
        format: "WebP",
        reason: reason.into(),
    }
}

fn le_u24(bytes: &[u8]) -> u32 {
    u32::from(bytes[0]) | u32::from(bytes[1]) << 8 | u32::from(bytes[2]) << 16
}

pub(super) fn push_u24(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes()[..3]);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct Chunk {
    pub fourcc: [u8; 4],
    pub payload: Range<usize>,
}

/// Chunks laid out back to back in a byte range, each padded to even length.
pub(super) struct Chunks<'a> {
    data: &'a [u8],
    pos: usize,
    end: usize,
}

pub(super) fn chunks(data: &[u8], range: Range<usize>) -> Chunks<'_> {
    Chunks {
        data,
        pos: range.start,
        end: range.end.min(data.len()),
    }
}

impl Iterator for Chunks<'_> {
    type Item = Result<Chunk, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.end {
            return None;
        }

        let data = self.data;
        let Some(header) = data.get(self.pos..self.pos + 8).filter(|_| self.pos + 8 <= self.end) else {
            self.pos = self.end;
            return Some(Err(malformed("truncated chunk header")));
        };

        let fourcc = [header[0], header[1], header[2], header[3]];
        let size = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let start = self.pos + 8;
        let end = start.saturating_add(size);
        if end > self.end {
            self.pos = self.end;
            return Some(Err(malformed(format!(
                "chunk {} overruns its container",
                String::from_utf8_lossy(&fourcc)
            ))));
        }

        self.pos = end + (size & 1);
        Some(Ok(Chunk {
            fourcc,
            payload: start..end,
        }))
    }
}

/// Where a frame's compressed pixels live inside the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum Bitstream {
    /// The whole file is one still image.
    File,
    Lossless(Range<usize>),
    Lossy {
        image: Range<usize>,
        alpha: Option<Range<usize>>,
    },
}

#[derive(Debug, Clone)]
pub(super) struct FrameInfo {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub duration: Duration,
    pub blend: bool,
    pub dispose_to_background: bool,
    pub has_alpha: bool,
    pub bitstream: Bitstream,
}

impl FrameInfo {
    pub fn still(width: u32, height: u32, has_alpha: bool) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
            duration: DEFAULT_FRAME_DURATION,
            blend: false,
            dispose_to_background: false,
            has_alpha,
            bitstream: Bitstream::File,
        }
    }

    pub fn covers(&self, width: u32, height: u32) -> bool {
        self.x == 0 && self.y == 0 && self.width == width && self.height == height
    }
}

#[derive(Debug, Default)]
pub(super) struct Container {
    pub canvas: Option<(u32, u32)>,
    pub has_alpha: bool,
    pub animated: bool,
    pub loop_count: u16,
    pub frames: Vec<FrameInfo>,
}

pub(super) fn parse(data: &[u8]) -> Result<Container, DecodeError> {
    if data.len() < 12 || !data.starts_with(b"RIFF") || data[8..12] != *b"WEBP" {
        return Err(malformed("missing RIFF/WEBP header"));
    }

    let riff_size = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;
    let end = riff_size.saturating_add(8).min(data.len());
    let mut container = Container::default();

    for chunk in chunks(data, 12..end) {
        let chunk = chunk?;
        let payload = &data[chunk.payload.clone()];
        match &chunk.fourcc {
            b"VP8X" => {
                if payload.len() < 10 {
                    return Err(malformed("VP8X chunk too short"));
                }
                container.has_alpha = payload[0] & ALPHA_FLAG != 0;
                container.animated = payload[0] & ANIMATION_FLAG != 0;
                container.canvas = Some((le_u24(&payload[4..7]) + 1, le_u24(&payload[7..10]) + 1));
            }
            b"ANIM" => {
                if payload.len() >= 6 {
                    container.loop_count = u16::from_le_bytes([payload[4], payload[5]]);
                }
            }
            b"ANMF" => container.frames.push(parse_frame(data, chunk.payload)?),
            _ => {}
        }
    }

    if let Some((width, height)) = container.canvas {
        for (index, frame) in container.frames.iter().enumerate() {
            if frame.x + frame.width > width || frame.y + frame.height > height {
                return Err(malformed(format!("frame {index} extends past the canvas")));
            }
        }
    }

    Ok(container)
}

fn parse_frame(data: &[u8], payload: Range<usize>) -> Result<FrameInfo, DecodeError> {
    if payload.len() < ANMF_HEADER_LEN {
        return Err(malformed("ANMF chunk too short"));
    }
    let header = &data[payload.start..payload.start + ANMF_HEADER_LEN];
    let flags = header[15];

    let mut alpha = None;
    let mut image = None;
    for chunk in chunks(data, payload.start + ANMF_HEADER_LEN..payload.end) {
        let chunk = chunk?;
        match &chunk.fourcc {
            b"ALPH" => alpha = Some(chunk.payload),
            b"VP8 " => {
                image = Some(Bitstream::Lossy {
                    image: chunk.payload,
                    alpha: alpha.take(),
                });
                break;
            }
            b"VP8L" => {
                image = Some(Bitstream::Lossless(chunk.payload));
                break;
            }
            _ => {}
        }
    }

    let bitstream = image.ok_or_else(|| malformed("ANMF frame without image data"))?;
    let has_alpha = match &bitstream {
        Bitstream::Lossless(range) => vp8l_has_alpha(&data[range.clone()]),
        Bitstream::Lossy { alpha, .. } => alpha.is_some(),
        Bitstream::File => false,
    };

    Ok(FrameInfo {
        x: le_u24(&header[0..3]) * 2,
        y: le_u24(&header[3..6]) * 2,
        width: le_u24(&header[6..9]) + 1,
        height: le_u24(&header[9..12]) + 1,
        duration: normalize_duration(Duration::from_millis(u64::from(le_u24(&header[12..15])))),
        blend: flags & 0x02 == 0,
        dispose_to_background: flags & 0x01 != 0,
        has_alpha,
        bitstream,
    })
}

/// The `alpha_is_used` hint from a VP8L header.
fn vp8l_has_alpha(bitstream: &[u8]) -> bool {
    match bitstream {
        [VP8L_SIGNATURE, b0, b1, b2, b3, ..] => {
            let bits = u32::from_le_bytes([*b0, *b1, *b2, *b3]);
            (bits >> 28) & 1 == 1
        }
        _ => false,
    }
}

pub(super) fn push_chunk(out: &mut Vec<u8>, fourcc: &[u8; 4], payload: &[u8]) {
    out.extend_from_slice(fourcc);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    if payload.len() % 2 == 1 {
        out.push(0);
    }
}

pub(super) fn riff(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 12);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&((body.len() + 4) as u32).to_le_bytes());
    out.extend_from_slice(b"WEBP");
    out.extend_from_slice(body);
    out
}

/// A still WebP file holding only `frame`'s bitstream.
pub(super) fn standalone(data: &[u8], frame: &FrameInfo) -> Result<Vec<u8>, DecodeError> {
    let slice = |range: &Range<usize>| {
        data.get(range.clone())
            .ok_or_else(|| malformed("frame bitstream out of bounds"))
    };

    let mut body = Vec::new();
    match &frame.bitstream {
        Bitstream::File => return Ok(data.to_vec()),
        Bitstream::Lossless(image) => push_chunk(&mut body, b"VP8L", slice(image)?),
        Bitstream::Lossy { image, alpha: None } => push_chunk(&mut body, b"VP8 ", slice(image)?),
        Bitstream::Lossy {
            image,
            alpha: Some(alpha),
        } => {
            let mut vp8x = vec![ALPHA_FLAG, 0, 0, 0];
            push_u24(&mut vp8x, frame.width - 1);
            push_u24(&mut vp8x, frame.height - 1);
            push_chunk(&mut body, b"VP8X", &vp8x);
            push_chunk(&mut body, b"ALPH", slice(alpha)?);
            push_chunk(&mut body, b"VP8 ", slice(image)?);
        }
    }
    Ok(riff(&body))
}
