// SPDX-License-Identifier: MPL-2.0

//! Timed playback of a [`FrameSequence`].
//!
//! A [`Player`] lives on the rendering thread and is driven by [`Player::tick`].
//! Decoding happens on the configured [`TaskExecutor`], one frame at a time,
//! into a buffer taken from the player's pool:
//!
//! ```text
//! ┌──────────────┐  spare buffer   ┌──────────────┐
//! │ tick()       │ ──────────────► │ decode task  │
//! │ render thread│                 │ (executor)   │
//! │              │ ◄────────────── │              │
//! └──────────────┘   ready slot    └──────────────┘
//! ```
//!
//! `tick()` never waits for a decode. A decoded frame is swapped to the front
//! once its due time is reached; until then the previous frame stays on screen.
//! When the render thread falls behind, the [`DropFramesStrategy`] decides
//! which frames the next decode may skip.
//!
//! # Release
//!
//! [`Player::release`] may run while a decode is in flight. The worker notices
//! on completion, frees the sequence itself if the render thread could not,
//! and discards its buffer.

mod pool;
mod stats;
mod timeline;

use std::{
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, TryLockError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use image::RgbaImage;
use tracing::{debug, info, trace, warn};

pub use stats::PlaybackStats;

use self::{pool::BufferPool, timeline::Timeline};
use crate::{
    clock::Clock,
    configuration::Configuration,
    drop_frames::DropFramesStrategy,
    executor::TaskExecutor,
    sequence::{DecodeError, FrameSequence},
};

/// Receives what the player shows, on the thread calling [`Player::tick`].
pub trait FrameSink {
    /// `pixels` is the new front buffer and stays valid until the next swap.
    fn present(&mut self, frame: usize, pixels: &RgbaImage);

    /// The first frame is on screen.
    fn playback_started(&mut self) {}

    /// Playback went back to the first frame for the `count`-th time.
    fn looped(&mut self, _count: u64) {}

    /// Decoding failed; playback stays on the last good frame.
    fn failed(&mut self, _error: &DecodeError) {}
}

struct NoopSink;

impl FrameSink for NoopSink {
    fn present(&mut self, _frame: usize, _pixels: &RgbaImage) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    /// Nothing scheduled.
    Idle,
    /// A frame is being decoded.
    Decoding,
    /// A decoded frame waits for its due time.
    Ready,
    /// A frame was just swapped to the front and nothing is scheduled yet.
    /// Single-frame sources stay here.
    Presenting,
    /// Halted on a decode error.
    Failed,
    Released,
}

/// Outcome of one [`Player::tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// This frame was swapped to the front.
    Presented(usize),
    /// The front frame stays on screen.
    Holding,
    Stopped,
    Failed,
    Released,
}

enum Decoded {
    Frame {
        buffer: RgbaImage,
        frame: usize,
        due: Duration,
        skipped: usize,
    },
    Failed {
        frame: usize,
        error: DecodeError,
    },
}

struct Scheduler {
    state: PlaybackState,
    pool: BufferPool,
    ready: Option<Decoded>,
    in_flight: bool,
    /// Bumped to invalidate decodes that are in flight.
    generation: u64,
}

type Waker = Arc<dyn Fn() + Send + Sync>;

/// State reachable from decode tasks.
struct Shared {
    label: String,
    sequence: Mutex<Box<dyn FrameSequence>>,
    scheduler: Mutex<Scheduler>,
    released: AtomicBool,
    timeline: Timeline,
    strategy: DropFramesStrategy,
    drop_frames_threshold: usize,
    verbose: bool,
    clock: Arc<dyn Clock>,
    waker: Mutex<Option<Waker>>,
}

/// What a decode task needs to know about the screen when it was scheduled.
#[derive(Debug, Clone, Copy)]
struct Plan {
    generation: u64,
    next: usize,
    /// Frame on screen and when it was swapped in.
    front: Option<(usize, Duration)>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    fn release_sequence(&self) {
        lock(&self.sequence).release();
    }

    fn waker(&self) -> Option<Waker> {
        lock(&self.waker).clone()
    }

    /// Frame to decode after `plan.front`, honouring the drop strategy.
    fn choose_frame(
        &self,
        sequence: &dyn FrameSequence,
        front: usize,
        last_swap: Duration,
        now: Duration,
        next: usize,
    ) -> usize {
        if !self.strategy.allows_drops() {
            return next;
        }

        let desired = self.timeline.desired_frame(front, last_swap, now);
        if self.timeline.distance(next, desired) < self.drop_frames_threshold {
            return next;
        }

        let target = self.strategy.resolve(next, desired, |start, end| {
            sequence.last_key_frame_in_range(start, end)
        });
        if self.verbose && target != next {
            debug!(
                label = %self.label,
                next,
                desired,
                target,
                strategy = ?self.strategy,
                "dropping frames to catch up"
            );
        }
        target
    }

    /// Draw the planned frame, or nothing if the player was released.
    fn decode(&self, plan: Plan, mut buffer: RgbaImage) -> Option<Decoded> {
        let mut sequence = lock(&self.sequence);
        if self.is_released() || sequence.is_released() {
            return None;
        }

        let now = self.clock.now();
        let (frame, skipped, due) = match plan.front {
            None => (plan.next, 0, now),
            Some((front, last_swap)) => {
                let target = self.choose_frame(&**sequence, front, last_swap, now, plan.next);
                (
                    target,
                    self.timeline.distance(plan.next, target),
                    self.timeline.due(front, last_swap, target),
                )
            }
        };

        if self.verbose {
            trace!(label = %self.label, frame, ?due, ?now, "decoding frame");
        }

        Some(match sequence.draw_frame(frame, &mut buffer) {
            Ok(()) => Decoded::Frame {
                buffer,
                frame,
                due,
                skipped,
            },
            Err(error) => Decoded::Failed { frame, error },
        })
    }
}

/// Runs on an executor thread.
fn decode_task(shared: &Shared, plan: Plan, buffer: RgbaImage) {
    let decoded = shared.decode(plan, buffer);

    // The render thread only frees the sequence if no decode holds it.
    if shared.is_released() {
        shared.release_sequence();
    }

    let waker = {
        let mut scheduler = lock(&shared.scheduler);
        scheduler.in_flight = false;
        let Some(decoded) = decoded else {
            return;
        };
        if shared.is_released() || scheduler.generation != plan.generation {
            return;
        }
        scheduler.state = PlaybackState::Ready;
        scheduler.ready = Some(decoded);
        shared.waker()
    };

    if let Some(waker) = waker {
        waker();
    }
}

/// Builder for [`Player`].
#[must_use]
pub struct PlayerBuilder {
    sequence: Box<dyn FrameSequence>,
    strategy: Option<DropFramesStrategy>,
    label: String,
    sink: Box<dyn FrameSink>,
}

impl PlayerBuilder {
    pub fn strategy(mut self, strategy: DropFramesStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Name used in log output.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn sink(mut self, sink: Box<dyn FrameSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Allocate the buffer pool and create an idle player.
    ///
    /// Without an explicit strategy, sources that blend transparent frames
    /// play without drops and all others may drop.
    ///
    /// # Errors
    ///
    /// Fails if the sequence is released, empty, or has a zero dimension.
    pub fn build(self, configuration: &Configuration) -> Result<Player, DecodeError> {
        let sequence = self.sequence;
        if sequence.is_released() {
            return Err(DecodeError::Released);
        }
        let frame_count = sequence.frame_count();
        if frame_count == 0 {
            return Err(DecodeError::NoFrames);
        }
        let (width, height) = (sequence.width(), sequence.height());
        let opaque = sequence.is_opaque();
        if width == 0 || height == 0 {
            return Err(DecodeError::InvalidDimensions { width, height });
        }

        let strategy = self.strategy.unwrap_or_else(|| {
            if sequence.may_have_blending() && !opaque {
                DropFramesStrategy::DropNotAllowed
            } else {
                DropFramesStrategy::DropAllowed
            }
        });
        let durations: Vec<Duration> = (0..frame_count)
            .map(|frame| sequence.frame_duration(frame))
            .collect();
        let timeline = Timeline::new(durations, configuration.min_time_to_render_next_frame());
        let pool = BufferPool::new(width, height, configuration.buffer_count());

        info!(
            label = %self.label,
            width,
            height,
            frames = frame_count,
            ?strategy,
            buffers = configuration.buffer_count(),
            "created frame sequence player"
        );

        let shared = Arc::new(Shared {
            label: self.label,
            sequence: Mutex::new(sequence),
            scheduler: Mutex::new(Scheduler {
                state: PlaybackState::Idle,
                pool,
                ready: None,
                in_flight: false,
                generation: 0,
            }),
            released: AtomicBool::new(false),
            timeline,
            strategy,
            drop_frames_threshold: configuration.drop_frames_threshold(),
            verbose: configuration.is_verbose(),
            clock: Arc::clone(configuration.clock()),
            waker: Mutex::new(None),
        });

        Ok(Player {
            shared,
            executor: Arc::clone(configuration.executor()),
            sink: self.sink,
            width,
            height,
            frame_count,
            opaque,
            front: None,
            front_frame: None,
            last_swap: None,
            running: false,
            failed: false,
            stats: PlaybackStats::default(),
        })
    }
}

/// Plays one frame sequence, swapping decoded frames in on time.
pub struct Player {
    shared: Arc<Shared>,
    executor: Arc<dyn TaskExecutor>,
    sink: Box<dyn FrameSink>,
    width: u32,
    height: u32,
    frame_count: usize,
    opaque: bool,
    front: Option<RgbaImage>,
    front_frame: Option<usize>,
    last_swap: Option<Duration>,
    running: bool,
    failed: bool,
    stats: PlaybackStats,
}

impl Player {
    pub fn builder(sequence: Box<dyn FrameSequence>) -> PlayerBuilder {
        PlayerBuilder {
            sequence,
            strategy: None,
            label: String::from("frame sequence"),
            sink: Box::new(NoopSink),
        }
    }

    /// Start or resume playback.
    ///
    /// A frame decoded before [`stop`](Self::stop) is discarded, since its due
    /// time was computed for the old schedule.
    pub fn play(&mut self) {
        if self.running || self.failed || self.shared.is_released() {
            return;
        }
        self.running = true;

        {
            let mut scheduler = lock(&self.shared.scheduler);
            if let Some(Decoded::Frame { buffer, .. }) = scheduler.ready.take_if(|ready| {
                matches!(ready, Decoded::Frame { .. })
            }) {
                scheduler.pool.recycle(buffer);
                scheduler.state = if self.front.is_some() {
                    PlaybackState::Presenting
                } else {
                    PlaybackState::Idle
                };
            }
        }

        debug!(label = %self.shared.label, "playback resumed");
        self.schedule();
    }

    /// Stop scheduling new frames. The front frame stays available.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        debug!(label = %self.shared.label, "playback stopped");
    }

    /// Swap in the next frame if it is due, then keep one decode scheduled.
    ///
    /// Call whenever the host is about to draw, and when the waker fires.
    pub fn tick(&mut self) -> Tick {
        if self.shared.is_released() {
            return Tick::Released;
        }
        if self.failed {
            return Tick::Failed;
        }
        if !self.running {
            return Tick::Stopped;
        }

        let now = self.shared.clock.now();
        let ready = {
            let mut scheduler = lock(&self.shared.scheduler);
            match &scheduler.ready {
                Some(Decoded::Frame { due, .. }) if *due > now => None,
                Some(_) => scheduler.ready.take(),
                None => None,
            }
        };

        match ready {
            Some(Decoded::Frame {
                buffer,
                frame,
                due,
                skipped,
            }) => {
                self.swap(buffer, frame, now, now.saturating_sub(due), skipped);
                self.schedule();
                Tick::Presented(frame)
            }
            Some(Decoded::Failed { frame, error }) => {
                self.fail(frame, &error);
                Tick::Failed
            }
            None => {
                self.schedule();
                Tick::Holding
            }
        }
    }

    fn swap(
        &mut self,
        buffer: RgbaImage,
        frame: usize,
        now: Duration,
        lateness: Duration,
        skipped: usize,
    ) {
        let previous = self.front.replace(buffer);
        {
            let mut scheduler = lock(&self.shared.scheduler);
            if let Some(previous) = previous {
                scheduler.pool.recycle(previous);
            }
            scheduler.state = PlaybackState::Presenting;
        }

        let previous_frame = self.front_frame.replace(frame);
        self.last_swap = Some(now);
        self.stats.record_swap(lateness, skipped);

        if self.shared.verbose {
            debug!(
                label = %self.shared.label,
                frame,
                ?lateness,
                skipped,
                "presented frame"
            );
        }

        if let Some(pixels) = &self.front {
            self.sink.present(frame, pixels);
        }

        match previous_frame {
            None => {
                info!(label = %self.shared.label, "playback started");
                self.sink.playback_started();
            }
            Some(previous) if frame <= previous => {
                self.stats.loops += 1;
                trace!(label = %self.shared.label, loops = self.stats.loops, "looped");
                self.sink.looped(self.stats.loops);
            }
            Some(_) => {}
        }
    }

    fn fail(&mut self, frame: usize, error: &DecodeError) {
        self.failed = true;
        self.running = false;
        self.stats.decode_failures += 1;
        lock(&self.shared.scheduler).state = PlaybackState::Failed;

        warn!(
            label = %self.shared.label,
            frame,
            %error,
            "frame decode failed, playback halted"
        );
        self.sink.failed(error);
    }

    /// Keep one decode in flight, if a spare buffer allows it.
    fn schedule(&mut self) {
        if !self.running || self.failed || self.shared.is_released() {
            return;
        }
        // A single frame never changes once shown.
        if self.front_frame.is_some() && self.frame_count < 2 {
            return;
        }

        let next = self
            .front_frame
            .map_or(0, |front| self.shared.timeline.successor(front));

        let (buffer, plan) = {
            let mut scheduler = lock(&self.shared.scheduler);
            if scheduler.in_flight || scheduler.ready.is_some() {
                return;
            }
            let Some(buffer) = scheduler.pool.take() else {
                return;
            };
            scheduler.in_flight = true;
            scheduler.state = PlaybackState::Decoding;
            let plan = Plan {
                generation: scheduler.generation,
                next,
                front: self.front_frame.zip(self.last_swap),
            };
            (buffer, plan)
        };

        if self.shared.verbose {
            trace!(label = %self.shared.label, next, "scheduled decode");
        }

        // The scheduler lock is released: inline executors run the task here.
        let shared = Arc::clone(&self.shared);
        self.executor
            .execute(Box::new(move || decode_task(&shared, plan, buffer)));
    }

    /// Stop playback and free every buffer and the decoder. Idempotent.
    pub fn release(&mut self) {
        if self.shared.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.running = false;
        self.front = None;

        {
            let mut scheduler = lock(&self.shared.scheduler);
            scheduler.generation += 1;
            scheduler.state = PlaybackState::Released;
            scheduler.ready = None;
            scheduler.pool.clear();
        }

        match self.shared.sequence.try_lock() {
            Ok(mut sequence) => sequence.release(),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().release(),
            Err(TryLockError::WouldBlock) => {
                debug!(label = %self.shared.label, "decode in flight, worker frees the sequence");
            }
        }

        info!(
            label = %self.shared.label,
            presented = self.stats.frames_presented,
            dropped = self.stats.frames_dropped,
            "released frame sequence player"
        );
    }

    /// Called from a decode thread whenever a frame becomes ready, typically
    /// to wake the host's event loop so it calls [`tick`](Self::tick).
    pub fn set_waker(&self, waker: impl Fn() + Send + Sync + 'static) {
        *lock(&self.shared.waker) = Some(Arc::new(waker));
    }

    #[must_use]
    pub fn state(&self) -> PlaybackState {
        lock(&self.shared.scheduler).state
    }

    /// The frame on screen.
    #[must_use]
    pub fn frame(&self) -> Option<&RgbaImage> {
        self.front.as_ref()
    }

    #[must_use]
    pub fn current_frame(&self) -> Option<usize> {
        self.front_frame
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.shared.is_released()
    }

    #[must_use]
    pub fn stats(&self) -> &PlaybackStats {
        &self.stats
    }

    #[must_use]
    pub fn strategy(&self) -> DropFramesStrategy {
        self.shared.strategy
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.shared.label
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Whether every pixel of every frame is fully opaque.
    #[must_use]
    pub fn is_opaque(&self) -> bool {
        self.opaque
    }

    /// Completed passes through the sequence.
    #[must_use]
    pub fn loop_count(&self) -> u64 {
        self.stats.loops
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.release();
    }
}
