//! Error types for plexio
//!
//! Two tiers, kept in separate types on purpose:
//!
//! - [`NetError`]: recoverable. Every fallible socket/multiplex call returns
//!   one, tagged with the syscall stage that failed. `WouldBlock` lives here
//!   too, as its own payload-free variant.
//! - [`Unrecoverable`]: fatal. Produced when a channel lock or condition
//!   variable is found in a state nothing can reason about (poisoned).
//!   It has no conversion into `NetError`; the only thing to do with it is
//!   [`Unrecoverable::terminate`].

use nix::errno::Errno;
use thiserror::Error;

/// Result type for socket and multiplex operations
pub type Result<T> = std::result::Result<T, NetError>;

/// Stage-identified failures of socket, pipe and multiplex operations
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetError {
    /// Non-blocking call has nothing to do right now; wait for readiness.
    #[error("operation would block")]
    WouldBlock,

    #[error("socket creation failed: {0}")]
    SocketCreateFailed(Errno),

    #[error("connect failed: {0}")]
    ConnectFailed(Errno),

    #[error("switching to non-blocking mode failed: {0}")]
    SetNonBlockingFailed(Errno),

    #[error("setsockopt failed: {0}")]
    SetSockOptFailed(Errno),

    #[error("bind failed: {0}")]
    BindFailed(Errno),

    #[error("listen failed: {0}")]
    ListenFailed(Errno),

    #[error("resolving bound address failed: {0}")]
    ResolveBoundAddressFailed(Errno),

    #[error("accept failed: {0}")]
    AcceptFailed(Errno),

    #[error("send failed: {0}")]
    SendFailed(Errno),

    #[error("recv failed: {0}")]
    RecvFailed(Errno),

    #[error("shutdown failed: {0}")]
    ShutdownFailed(Errno),

    #[error("close failed: {0}")]
    CloseFailed(Errno),

    #[error("pipe creation failed: {0}")]
    PipeFailed(Errno),

    #[error("multiplex init failed: {0}")]
    MultiplexInitFailed(Errno),

    #[error("multiplex register failed: {0}")]
    RegisterFailed(Errno),

    #[error("multiplex wait failed: {0}")]
    WaitFailed(Errno),
}

impl NetError {
    /// `true` for the expected "try again after the next readiness event" outcome.
    #[inline]
    pub fn is_would_block(&self) -> bool {
        matches!(self, NetError::WouldBlock)
    }

    /// The OS error behind a stage failure. `None` for `WouldBlock`.
    pub fn errno(&self) -> Option<Errno> {
        match *self {
            NetError::WouldBlock => None,
            NetError::SocketCreateFailed(e)
            | NetError::ConnectFailed(e)
            | NetError::SetNonBlockingFailed(e)
            | NetError::SetSockOptFailed(e)
            | NetError::BindFailed(e)
            | NetError::ListenFailed(e)
            | NetError::ResolveBoundAddressFailed(e)
            | NetError::AcceptFailed(e)
            | NetError::SendFailed(e)
            | NetError::RecvFailed(e)
            | NetError::ShutdownFailed(e)
            | NetError::CloseFailed(e)
            | NetError::PipeFailed(e)
            | NetError::MultiplexInitFailed(e)
            | NetError::RegisterFailed(e)
            | NetError::WaitFailed(e) => Some(e),
        }
    }
}

/// A failure of a core synchronization primitive.
///
/// Never returned through `Result`; callers hand it to [`terminate`](Self::terminate).
#[derive(Error, Debug)]
#[error("unrecoverable failure in {what}: {detail}")]
pub struct Unrecoverable {
    what: &'static str,
    detail: String,
}

impl Unrecoverable {
    pub fn new(what: &'static str, detail: impl Into<String>) -> Self {
        Self { what, detail: detail.into() }
    }

    /// Build from a poisoned lock result.
    pub fn poisoned<G>(what: &'static str, err: std::sync::PoisonError<G>) -> Self {
        Self::new(what, err.to_string())
    }

    /// Which primitive failed.
    pub fn what(&self) -> &'static str {
        self.what
    }

    /// Report and abort the process. Does not unwind.
    #[cold]
    pub fn terminate(self) -> ! {
        tracing::error!(what = self.what, detail = %self.detail, "fatal: terminating process");
        eprintln!("plexio: {}", self);
        std::process::abort()
    }
}
