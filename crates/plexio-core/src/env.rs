//! Environment variable overrides for reactor owners.
//!
//! The socket and multiplex primitives never read the environment. These
//! helpers exist for the code that sizes a reactor (`ReactorConfig::from_env`)
//! and for binaries under `cmd/`.
//!
//! ```ignore
//! use plexio_core::env::{env_get, env_get_bool, env_get_opt};
//!
//! let max_events: usize = env_get("PLEXIO_MAX_EVENTS", 256);
//! let port: Option<u16> = env_get_opt("PLEXIO_ECHO_PORT");
//! let track: bool = env_get_bool("PLEXIO_TRACK_FDS", false);
//! ```

use std::str::FromStr;

/// Parse `key` as `T`, falling back to `default` when unset or unparsable.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// `true` for "1", "true", "yes" or "on" (any case); `default` when unset.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Parse `key` as `T`; `None` when unset or unparsable.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
