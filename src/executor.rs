// SPDX-License-Identifier: MPL-2.0

//! Bounded, low-priority pool shared by every player for frame decoding.

use std::{
    num::NonZeroUsize,
    sync::{Arc, OnceLock},
};

use tracing::{debug, error, info};

use crate::configuration::ConfigurationError;

/// A unit of decoding work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs decode tasks off the rendering thread.
pub trait TaskExecutor: Send + Sync {
    fn execute(&self, task: Task);
}

/// Nice value applied to decoding threads.
pub const BACKGROUND_NICE: i32 = 10;

static SHARED: OnceLock<Arc<DecodingExecutor>> = OnceLock::new();

/// Worker count for a machine with `cores` logical CPUs.
///
/// Grows slowly so decoding never competes with rendering for most cores.
#[must_use]
pub fn worker_count(cores: usize) -> usize {
    match cores {
        0..=1 => 1,
        2..=4 => 2,
        5..=6 => 3,
        7..=8 => 4,
        _ => 5,
    }
}

/// Rayon pool of background-priority decoding threads. Tasks run in
/// submission order.
#[derive(Debug)]
pub struct DecodingExecutor {
    pool: rayon::ThreadPool,
}

impl DecodingExecutor {
    /// Build a pool of exactly `threads` workers.
    ///
    /// # Errors
    ///
    /// Fails if the operating system refuses to spawn the threads.
    pub fn new(threads: usize) -> Result<Self, ConfigurationError> {
        let threads = threads.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|index| format!("frameseq-decode-{index}"))
            .start_handler(|_| lower_current_thread_priority())
            .panic_handler(|_| error!("decode task panicked"))
            .build()?;

        info!(threads, "decoding executor started");
        Ok(Self { pool })
    }

    /// Build a pool sized by [`worker_count`] for this machine.
    ///
    /// # Errors
    ///
    /// Fails if the operating system refuses to spawn the threads.
    pub fn with_available_parallelism() -> Result<Self, ConfigurationError> {
        let cores = std::thread::available_parallelism().map_or(1, NonZeroUsize::get);
        Self::new(worker_count(cores))
    }

    /// The process-wide executor, created on first use.
    ///
    /// # Errors
    ///
    /// Fails if the pool has to be created and cannot be.
    pub fn shared() -> Result<Arc<Self>, ConfigurationError> {
        if let Some(executor) = SHARED.get() {
            return Ok(Arc::clone(executor));
        }
        let executor = Arc::new(Self::with_available_parallelism()?);
        Ok(Arc::clone(SHARED.get_or_init(|| executor)))
    }

    /// Make `executor` the process-wide one.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::AlreadyInitialized`] if a shared
    /// executor exists already; it stays in place.
    pub fn install_shared(executor: Self) -> Result<Arc<Self>, ConfigurationError> {
        let executor = Arc::new(executor);
        SHARED
            .set(Arc::clone(&executor))
            .map_err(|_| ConfigurationError::AlreadyInitialized {
                what: "decoding executor",
            })?;
        Ok(executor)
    }

    #[must_use]
    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}

impl TaskExecutor for DecodingExecutor {
    fn execute(&self, task: Task) {
        self.pool.spawn_fifo(task);
    }
}

#[cfg(target_os = "linux")]
fn lower_current_thread_priority() {
    // With PRIO_PROCESS and who = 0, Linux applies the nice value to the
    // calling thread only.
    let result = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, BACKGROUND_NICE) };
    if result != 0 {
        debug!(
            error = %std::io::Error::last_os_error(),
            "could not lower decoding thread priority"
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn lower_current_thread_priority() {
    debug!("decoding thread priority left unchanged on this platform");
}
