//! # plexio-core
//!
//! Platform-agnostic pieces of the plexio substrate.
//!
//! All OS-specific socket and readiness code lives in `plexio-net`.
//!
//! ## Modules
//!
//! - `channel` - Blocking MPMC work queue (mutex + condvar, intrusive nodes)
//! - `error` - Recoverable `NetError` and fatal `Unrecoverable`
//! - `fdcount` - Per-test descriptor accounting
//! - `notifier` - Cross-thread reactor wake-up trait
//! - `env` - Environment variable utilities

pub mod channel;
pub mod error;
pub mod fdcount;
pub mod notifier;
pub mod env;

// Re-exports for convenience
pub use channel::{channel, Channel, Message, Receiver, Sender};
pub use error::{NetError, Result, Unrecoverable};
pub use fdcount::FdCounter;
pub use notifier::Notifier;
pub use env::{env_get, env_get_bool, env_get_opt};

pub use nix::errno::Errno;
