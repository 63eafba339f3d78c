//! # plexio - readiness plumbing for reactor-style servers
//!
//! Thin, explicit building blocks for a server that owns one reactor thread:
//!
//! - **Sockets**: non-blocking IPv4 TCP `connect`/`listen`/`accept`/`send`/`recv`
//! - **Multiplexing**: edge-triggered epoll (Linux) or kqueue (macOS/BSD)
//!   behind one `Multiplex` API
//! - **Events**: uniform tag/read/write/socket accessors over the kernel's
//!   own records
//! - **Channel**: blocking MPMC hand-off between the reactor and workers
//! - **Wake pipe**: lets any thread interrupt a blocked `wait`
//!
//! Nothing here owns a thread, a connection table, or a buffer pool. Those
//! belong to the caller; a `Token` is how the caller maps an event back to
//! its own state.
//!
//! ## Quick Start
//!
//! ```ignore
//! use plexio::{Events, Interest, Multiplex, NetError, SocketHandle, Token, EventRecord};
//!
//! let mplex = Multiplex::new()?;
//! let (listener, port) = SocketHandle::listen([0, 0, 0, 0], 8080, 128)?;
//! mplex.register(&listener, Interest::Read, Token(0))?;
//!
//! let mut events = Events::with_capacity(256);
//! loop {
//!     mplex.wait(&mut events, -1)?;
//!     for ev in &events {
//!         if ev.tag() == Token(0) {
//!             loop {
//!                 match listener.accept() {
//!                     Ok(conn) => { /* store conn, register with its slot token */ }
//!                     Err(NetError::WouldBlock) => break,
//!                     Err(e) => return Err(e),
//!                 }
//!             }
//!         }
//!     }
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Code                              │
//! │        connection table, tokens, buffers, worker pool       │
//! └─────────────────────────────────────────────────────────────┘
//!                │                                 │
//!                ▼                                 ▼
//! ┌──────────────────────────────┐   ┌──────────────────────────┐
//! │         plexio-net           │   │       plexio-core        │
//! │  SocketHandle  Pipe  Events  │   │  Channel  NetError       │
//! │  Multiplex (epoll | kqueue)  │   │  FdCounter  Notifier     │
//! └──────────────────────────────┘   └──────────────────────────┘
//!                │
//!                ▼
//!    ┌─────────────────────────────────────────────────────────┐
//!    │                  Kernel (libc)                          │
//!    │     socket/accept/send/recv, epoll_* or kevent          │
//!    └─────────────────────────────────────────────────────────┘
//! ```

// Re-export core types
pub use plexio_core::{
    channel,
    Channel,
    Message,
    Receiver,
    Sender,
    NetError,
    Result,
    Unrecoverable,
    FdCounter,
    Notifier,
    Errno,
};

// Re-export env utilities
pub use plexio_core::{env_get, env_get_bool, env_get_opt};

// Re-export net types
pub use plexio_net::{
    SocketHandle,
    Pipe,
    Multiplex,
    Event,
    EventRecord,
    Events,
    Interest,
    Token,
    event_tag,
    event_is_read,
    event_is_write,
    event_socket,
    ReactorConfig,
    ConfigError,
};

/// Everything a reactor loop usually needs, in one import.
pub mod prelude {
    pub use crate::{
        EventRecord, Events, Interest, Multiplex, NetError, Pipe, SocketHandle, Token,
    };
}
