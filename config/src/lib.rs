// SPDX-License-Identifier: MPL-2.0-only

//! Persistent playback settings for the frame sequence player.
//!
//! Settings are stored as RON at `$XDG_CONFIG_HOME/frameseq/settings.ron`.
//! Every field is optional in the file; missing fields take their defaults.

use derive_setters::Setters;
use serde::{Deserialize, Serialize};
use std::{
    io,
    path::{Path, PathBuf},
};

pub const NAME: &str = "frameseq";
pub const SETTINGS_FILE: &str = "settings.ron";

/// Minimum time a frame stays on screen, in milliseconds.
pub const DEFAULT_MIN_TIME_TO_RENDER_NEXT_FRAME_MS: u64 = 40;
/// Frames a player must fall behind before its drop strategy is consulted.
pub const DEFAULT_DROP_FRAMES_THRESHOLD: usize = 1;
/// Front buffer plus one buffer for background decoding.
pub const DEFAULT_BUFFER_COUNT: usize = 2;
pub const MIN_BUFFER_COUNT: usize = 2;

/// Verbosity of per-frame scheduling diagnostics.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum LogLevel {
    // lifecycle events only
    #[default]
    None,
    // every schedule, swap and drop decision
    Verbose,
}

impl LogLevel {
    #[must_use]
    pub fn is_verbose(self) -> bool {
        self == LogLevel::Verbose
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read settings from {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse settings from {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: ron::error::SpannedError,
    },
    #[error("invalid setting `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq, Setters)]
#[serde(default, deny_unknown_fields)]
#[must_use]
pub struct Settings {
    /// verbosity of scheduling diagnostics
    pub log_level: LogLevel,
    /// lower bound on how long any frame stays on screen
    pub min_time_to_render_next_frame_ms: u64,
    /// overrides the worker count derived from the available cores
    #[setters(strip_option)]
    pub decoding_threads: Option<usize>,
    /// frames behind schedule before frames may be skipped
    pub drop_frames_threshold: usize,
    /// decoded frame buffers allocated per player
    pub buffer_count: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            min_time_to_render_next_frame_ms: DEFAULT_MIN_TIME_TO_RENDER_NEXT_FRAME_MS,
            decoding_threads: None,
            drop_frames_threshold: DEFAULT_DROP_FRAMES_THRESHOLD,
            buffer_count: DEFAULT_BUFFER_COUNT,
        }
    }
}

impl Settings {
    /// Location of the settings file for the current user, if a config dir exists.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(NAME).join(SETTINGS_FILE))
    }

    /// Load settings from the user's config directory.
    ///
    /// # Errors
    ///
    /// Fails if the file exists but cannot be read, parsed, or validated.
    pub fn load_default() -> Result<Self, Error> {
        match Self::default_path() {
            Some(path) => Self::load(&path),
            None => {
                tracing::debug!("no config directory, using default settings");
                Ok(Self::default())
            }
        }
    }

    /// Load settings from `path`. A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Fails if the file exists but cannot be read, parsed, or validated.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(why) if why.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "settings file not found, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(Error::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let settings: Self = ron::from_str(&contents).map_err(|source| Error::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        settings.validate()?;
        Ok(settings)
    }

    /// Check value ranges that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns the first offending field.
    pub fn validate(&self) -> Result<(), Error> {
        if self.buffer_count < MIN_BUFFER_COUNT {
            return Err(Error::Invalid {
                field: "buffer_count",
                reason: format!("must be at least {MIN_BUFFER_COUNT}, got {}", self.buffer_count),
            });
        }

        if self.decoding_threads == Some(0) {
            return Err(Error::Invalid {
                field: "decoding_threads",
                reason: "must be greater than zero".into(),
            });
        }

        if self.drop_frames_threshold == 0 {
            return Err(Error::Invalid {
                field: "drop_frames_threshold",
                reason: "must be greater than zero".into(),
            });
        }

        Ok(())
    }
}
