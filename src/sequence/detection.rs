// SPDX-License-Identifier: MPL-2.0

//! File type detection for animated sources.
//!
//! Detection works on:
//! 1. Magic bytes, when the data is at hand
//! 2. File extension, as a quick filter when walking directories

use std::path::Path;

use super::FrameSequenceKind;

/// Extensions checked case-insensitively.
const GIF_EXTENSIONS: &[&str] = &["gif"];
const WEBP_EXTENSIONS: &[&str] = &["webp"];

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            extensions
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
}

/// Check if a path looks like a GIF by extension.
#[must_use]
pub fn is_gif_file(path: &Path) -> bool {
    has_extension(path, GIF_EXTENSIONS)
}

/// Check if a path looks like a WebP by extension.
#[must_use]
pub fn is_webp_file(path: &Path) -> bool {
    has_extension(path, WEBP_EXTENSIONS)
}

/// Check if a path points to a format the player can decode.
#[must_use]
pub fn is_animated_file(path: &Path) -> bool {
    is_gif_file(path) || is_webp_file(path)
}

pub(super) fn sniff(bytes: &[u8]) -> Option<FrameSequenceKind> {
    if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        return Some(FrameSequenceKind::Gif);
    }

    if bytes.len() >= 12 && bytes.starts_with(b"RIFF") && bytes[8..12] == *b"WEBP" {
        return Some(FrameSequenceKind::WebP);
    }

    None
}
