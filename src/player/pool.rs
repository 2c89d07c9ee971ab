// SPDX-License-Identifier: MPL-2.0

use image::RgbaImage;

/// Spare frame buffers of one player.
///
/// Holds every buffer not currently on screen or being decoded into. Buffers
/// of the wrong size are never taken back.
#[derive(Debug)]
pub(super) struct BufferPool {
    width: u32,
    height: u32,
    capacity: usize,
    spare: Vec<RgbaImage>,
}

impl BufferPool {
    pub fn new(width: u32, height: u32, capacity: usize) -> Self {
        let spare = (0..capacity)
            .map(|_| RgbaImage::new(width, height))
            .collect();
        Self {
            width,
            height,
            capacity,
            spare,
        }
    }

    pub fn take(&mut self) -> Option<RgbaImage> {
        self.spare.pop()
    }

    pub fn recycle(&mut self, buffer: RgbaImage) {
        if buffer.dimensions() == (self.width, self.height) && self.spare.len() < self.capacity {
            self.spare.push(buffer);
        }
    }

    pub fn clear(&mut self) {
        self.spare = Vec::new();
        self.capacity = 0;
    }

    pub fn spare(&self) -> usize {
        self.spare.len()
    }
}
