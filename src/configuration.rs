// SPDX-License-Identifier: MPL-2.0

//! Process-wide playback context.
//!
//! A [`Configuration`] bundles everything players share: logging verbosity,
//! timing limits, the decoding executor, the memory counter and the clock.
//! It is installed once with [`Configuration::init`] or created with defaults
//! on the first [`Configuration::global`] call; players can also be given an
//! explicit instance, which is how tests isolate themselves.

use std::{
    fmt,
    sync::{Arc, OnceLock},
    time::Duration,
};

use frameseq_config::{
    DEFAULT_BUFFER_COUNT, DEFAULT_DROP_FRAMES_THRESHOLD, DEFAULT_MIN_TIME_TO_RENDER_NEXT_FRAME_MS,
    LogLevel, MIN_BUFFER_COUNT, Settings,
};
use tracing::{error, info};

use crate::{
    clock::{Clock, SystemClock},
    executor::{DecodingExecutor, TaskExecutor},
    memory::MemoryUsage,
};

static GLOBAL: OnceLock<Arc<Configuration>> = OnceLock::new();

#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("{what} is already initialized")]
    AlreadyInitialized { what: &'static str },
    #[error("invalid settings")]
    Settings(#[from] frameseq_config::Error),
    #[error("failed to start the decoding executor")]
    Executor(#[from] rayon::ThreadPoolBuildError),
}

pub struct Configuration {
    log_level: LogLevel,
    min_time_to_render_next_frame: Duration,
    drop_frames_threshold: usize,
    buffer_count: usize,
    executor: Arc<dyn TaskExecutor>,
    memory_usage: MemoryUsage,
    clock: Arc<dyn Clock>,
}

impl Configuration {
    #[must_use]
    pub fn builder() -> ConfigurationBuilder {
        ConfigurationBuilder::default()
    }

    /// Install `configuration` as the process-wide one.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::AlreadyInitialized`] on any call after
    /// the first, or after [`global`](Self::global) created the default. The
    /// configuration already in place stays active.
    pub fn init(configuration: Configuration) -> Result<Arc<Configuration>, ConfigurationError> {
        let configuration = Arc::new(configuration);
        if GLOBAL.set(Arc::clone(&configuration)).is_err() {
            error!("frame sequence configuration initialized more than once");
            return Err(ConfigurationError::AlreadyInitialized {
                what: "configuration",
            });
        }

        info!(
            log_level = ?configuration.log_level,
            min_time_to_render_next_frame = ?configuration.min_time_to_render_next_frame,
            drop_frames_threshold = configuration.drop_frames_threshold,
            buffer_count = configuration.buffer_count,
            "frame sequence configuration initialized"
        );
        Ok(configuration)
    }

    /// The process-wide configuration, defaulted on first use.
    ///
    /// # Errors
    ///
    /// Fails only if a default has to be built and its executor cannot start.
    pub fn global() -> Result<Arc<Configuration>, ConfigurationError> {
        if let Some(configuration) = GLOBAL.get() {
            return Ok(Arc::clone(configuration));
        }
        let configuration = Arc::new(Self::builder().build()?);
        Ok(Arc::clone(GLOBAL.get_or_init(|| configuration)))
    }

    #[must_use]
    pub fn is_initialized() -> bool {
        GLOBAL.get().is_some()
    }

    #[must_use]
    pub fn log_level(&self) -> LogLevel {
        self.log_level
    }

    #[must_use]
    pub fn is_verbose(&self) -> bool {
        self.log_level.is_verbose()
    }

    /// Shortest time any frame stays on screen.
    #[must_use]
    pub fn min_time_to_render_next_frame(&self) -> Duration {
        self.min_time_to_render_next_frame
    }

    /// Fewest frames a player must be behind before it drops any.
    #[must_use]
    pub fn drop_frames_threshold(&self) -> usize {
        self.drop_frames_threshold
    }

    /// Frame buffers allocated per player.
    #[must_use]
    pub fn buffer_count(&self) -> usize {
        self.buffer_count
    }

    #[must_use]
    pub fn executor(&self) -> &Arc<dyn TaskExecutor> {
        &self.executor
    }

    #[must_use]
    pub fn memory_usage(&self) -> &MemoryUsage {
        &self.memory_usage
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

impl fmt::Debug for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Configuration")
            .field("log_level", &self.log_level)
            .field(
                "min_time_to_render_next_frame",
                &self.min_time_to_render_next_frame,
            )
            .field("drop_frames_threshold", &self.drop_frames_threshold)
            .field("buffer_count", &self.buffer_count)
            .field("memory_usage", &self.memory_usage)
            .finish_non_exhaustive()
    }
}

/// Unset fields fall back to the defaults of [`Settings`], the shared
/// [`DecodingExecutor`], the global [`MemoryUsage`] and a [`SystemClock`].
#[derive(Default)]
#[must_use]
pub struct ConfigurationBuilder {
    log_level: Option<LogLevel>,
    min_time_to_render_next_frame: Option<Duration>,
    drop_frames_threshold: Option<usize>,
    buffer_count: Option<usize>,
    executor: Option<Arc<dyn TaskExecutor>>,
    memory_usage: Option<MemoryUsage>,
    clock: Option<Arc<dyn Clock>>,
}

impl ConfigurationBuilder {
    /// Start from user settings. A thread count in the settings gets a
    /// dedicated executor instead of the shared one.
    ///
    /// # Errors
    ///
    /// Fails if the settings are invalid or the dedicated executor cannot start.
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigurationError> {
        settings.validate()?;

        let mut builder = Self::default()
            .log_level(settings.log_level)
            .min_time_to_render_next_frame(Duration::from_millis(
                settings.min_time_to_render_next_frame_ms,
            ))
            .drop_frames_threshold(settings.drop_frames_threshold)
            .buffer_count(settings.buffer_count);

        if let Some(threads) = settings.decoding_threads {
            builder = builder.executor(Arc::new(DecodingExecutor::new(threads)?));
        }

        Ok(builder)
    }

    pub fn log_level(mut self, log_level: LogLevel) -> Self {
        self.log_level = Some(log_level);
        self
    }

    pub fn min_time_to_render_next_frame(mut self, min: Duration) -> Self {
        self.min_time_to_render_next_frame = Some(min);
        self
    }

    pub fn drop_frames_threshold(mut self, threshold: usize) -> Self {
        self.drop_frames_threshold = Some(threshold);
        self
    }

    pub fn buffer_count(mut self, count: usize) -> Self {
        self.buffer_count = Some(count);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn memory_usage(mut self, memory_usage: MemoryUsage) -> Self {
        self.memory_usage = Some(memory_usage);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// # Errors
    ///
    /// Fails if the buffer count or drop threshold is out of range, or the
    /// shared executor has to be started and cannot be.
    pub fn build(self) -> Result<Configuration, ConfigurationError> {
        let buffer_count = self.buffer_count.unwrap_or(DEFAULT_BUFFER_COUNT);
        if buffer_count < MIN_BUFFER_COUNT {
            return Err(frameseq_config::Error::Invalid {
                field: "buffer_count",
                reason: format!("must be at least {MIN_BUFFER_COUNT}"),
            }
            .into());
        }

        let drop_frames_threshold = self
            .drop_frames_threshold
            .unwrap_or(DEFAULT_DROP_FRAMES_THRESHOLD);
        if drop_frames_threshold == 0 {
            return Err(frameseq_config::Error::Invalid {
                field: "drop_frames_threshold",
                reason: "must be at least 1".to_owned(),
            }
            .into());
        }

        let executor: Arc<dyn TaskExecutor> = match self.executor {
            Some(executor) => executor,
            None => DecodingExecutor::shared()?,
        };

        Ok(Configuration {
            log_level: self.log_level.unwrap_or_default(),
            min_time_to_render_next_frame: self.min_time_to_render_next_frame.unwrap_or(
                Duration::from_millis(DEFAULT_MIN_TIME_TO_RENDER_NEXT_FRAME_MS),
            ),
            drop_frames_threshold,
            buffer_count,
            executor,
            memory_usage: self
                .memory_usage
                .unwrap_or_else(|| MemoryUsage::global().clone()),
            clock: self
                .clock
                .unwrap_or_else(|| Arc::new(SystemClock::new())),
        })
    }
}
