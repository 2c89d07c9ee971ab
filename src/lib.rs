// SPDX-License-Identifier: MPL-2.0

//! Animated GIF and WebP playback engine.
//!
//! A [`Player`] owns one decoded [`FrameSequence`] and a small pool of frame
//! buffers. Decoding happens on a shared, bounded [`DecodingExecutor`] so many
//! players can be visible at once without each spawning its own thread, while
//! presentation stays on the caller's rendering thread and never waits on a
//! decode:
//!
//! ```text
//! bytes ─► FrameSequence ─► decode task (worker) ─► ready slot ─► tick() ─► FrameSink
//!                                 ▲                                  │
//!                                 └──────── spare buffer ◄───────────┘
//! ```
//!
//! # Module Structure
//!
//! - [`sequence`]: decoder contract plus the GIF and WebP implementations
//! - [`player`]: buffer pool, scheduler and catch-up logic
//! - [`executor`]: the shared low-priority decoding pool
//! - [`configuration`]: process-wide playback context
//! - [`memory`]: bytes held by live decoded sources
//! - [`drop_frames`]: late-frame policies
//! - [`clock`]: time source used for frame timing

pub mod clock;
pub mod configuration;
pub mod drop_frames;
pub mod executor;
pub mod memory;
pub mod player;
pub mod sequence;

pub use clock::{Clock, ManualClock, SystemClock};
pub use configuration::{Configuration, ConfigurationBuilder, ConfigurationError};
pub use drop_frames::DropFramesStrategy;
pub use executor::{DecodingExecutor, TaskExecutor};
pub use frameseq_config::{LogLevel, Settings};
pub use memory::{MemoryUsage, MemorySnapshot};
pub use player::{FrameSink, PlaybackState, PlaybackStats, Player, PlayerBuilder, Tick};
pub use sequence::{DecodeError, FrameSequence, FrameSequenceKind};
