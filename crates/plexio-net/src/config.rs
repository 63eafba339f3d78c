//! Reactor sizing
//!
//! Library defaults with runtime environment overrides. The primitives in
//! this crate take their limits as arguments; `ReactorConfig` is where a
//! reactor owner collects them.
//!
//! ```rust,ignore
//! use plexio_net::ReactorConfig;
//!
//! let config = ReactorConfig::from_env().backlog(1024);
//! config.validate()?;
//! let mut events = Events::with_capacity(config.max_events);
//! ```

use plexio_core::env::{env_get, env_get_bool};

pub mod defaults {
    pub const MAX_EVENTS: usize = 256;
    pub const WAIT_TIMEOUT_MS: i64 = 1000;
    pub const BACKLOG: i32 = 128;
    pub const READ_CHUNK: usize = 4096;
    pub const TRACK_FDS: bool = false;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactorConfig {
    /// Capacity of the `Events` buffer, i.e. records per `wait`
    pub max_events: usize,
    /// `wait` timeout; negative blocks indefinitely
    pub wait_timeout_ms: i64,
    /// `listen(2)` backlog
    pub backlog: i32,
    /// Per-connection receive buffer size
    pub read_chunk: usize,
    /// Attach an `FdCounter` to every handle and report leaks at shutdown
    pub track_fds: bool,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl ReactorConfig {
    /// Defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `PLEXIO_MAX_EVENTS`
    /// - `PLEXIO_WAIT_TIMEOUT_MS`
    /// - `PLEXIO_BACKLOG`
    /// - `PLEXIO_READ_CHUNK`
    /// - `PLEXIO_TRACK_FDS` (0/1)
    pub fn from_env() -> Self {
        Self {
            max_events: env_get("PLEXIO_MAX_EVENTS", defaults::MAX_EVENTS),
            wait_timeout_ms: env_get("PLEXIO_WAIT_TIMEOUT_MS", defaults::WAIT_TIMEOUT_MS),
            backlog: env_get("PLEXIO_BACKLOG", defaults::BACKLOG),
            read_chunk: env_get("PLEXIO_READ_CHUNK", defaults::READ_CHUNK),
            track_fds: env_get_bool("PLEXIO_TRACK_FDS", defaults::TRACK_FDS),
        }
    }

    /// Library defaults, ignoring the environment.
    pub fn new() -> Self {
        Self {
            max_events: defaults::MAX_EVENTS,
            wait_timeout_ms: defaults::WAIT_TIMEOUT_MS,
            backlog: defaults::BACKLOG,
            read_chunk: defaults::READ_CHUNK,
            track_fds: defaults::TRACK_FDS,
        }
    }

    // Builder methods

    pub fn max_events(mut self, n: usize) -> Self {
        self.max_events = n;
        self
    }

    pub fn wait_timeout_ms(mut self, ms: i64) -> Self {
        self.wait_timeout_ms = ms;
        self
    }

    pub fn backlog(mut self, n: i32) -> Self {
        self.backlog = n;
        self
    }

    pub fn read_chunk(mut self, bytes: usize) -> Self {
        self.read_chunk = bytes;
        self
    }

    pub fn track_fds(mut self, enable: bool) -> Self {
        self.track_fds = enable;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_events == 0 {
            return Err(ConfigError::InvalidValue("max_events must be > 0"));
        }
        if self.max_events > libc::c_int::MAX as usize {
            return Err(ConfigError::InvalidValue("max_events must fit in a C int"));
        }
        if self.backlog <= 0 {
            return Err(ConfigError::InvalidValue("backlog must be > 0"));
        }
        if self.read_chunk == 0 {
            return Err(ConfigError::InvalidValue("read_chunk must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    InvalidValue(&'static str),
}
