//! # plexio-net
//!
//! Platform-specific half of plexio: non-blocking IPv4 stream sockets, a
//! wake pipe, and an edge-triggered readiness multiplexer.
//!
//! ## Modules
//!
//! - `socket` - `SocketHandle`: connect, listen, accept, send, recv
//! - `pipe` - Non-blocking wake pipe, the default `Notifier`
//! - `event` - `Token`, `Interest`, `Event` records and their accessors
//! - `multiplex` - epoll (Linux) or kqueue (BSD/macOS) behind one `Multiplex`
//! - `config` - `ReactorConfig` sizing with env overrides

mod sys;

pub mod config;
pub mod event;
pub mod multiplex;
pub mod pipe;
pub mod socket;

pub use config::{ConfigError, ReactorConfig};
pub use event::{event_is_read, event_is_write, event_socket, event_tag};
pub use event::{Event, EventRecord, Events, Interest, Token};
pub use multiplex::Multiplex;
pub use pipe::Pipe;
pub use socket::SocketHandle;
