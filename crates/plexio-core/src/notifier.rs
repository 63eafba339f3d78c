//! Cross-thread wake-up abstraction.
//!
//! A `Notifier` pokes a reactor thread that is blocked in a readiness wait.
//! The default implementor is the non-blocking wake pipe in `plexio-net`,
//! whose read end sits in the reactor's multiplex set.

use crate::error::Result;

/// Wakes a reactor blocked in `wait`.
///
/// **Contract:**
/// - `notify()` must NEVER block.
/// - Several calls before the reactor drains are coalesced into one wakeup.
pub trait Notifier: Send + Sync {
    /// Signal that the reactor has work queued for it.
    fn notify(&self) -> Result<()>;
}
