//! Anonymous pipes, descriptor flags, and child-process I/O built on
//! named pipes and event semaphores.
//!
//! [`pipe()`] (or [`Namespace::create_channel()`]) creates a simplex
//! byte channel: a uniquely named pipe whose name is removed once both
//! [`Endpoint`]s are open, plus a named [`EventSemaphore`] that lives as
//! long as either endpoint does. The [`flags`] module reads and writes
//! descriptor flags, keeping a channel's pipe state in step with its
//! `O_NONBLOCK` bit. [`create_child()`] runs a command line with its
//! stdin and stdout wired to two channels, and [`await_readiness()`]
//! blocks until one of up to two endpoints changes state.
//!
//! Names follow `<pipe-base>/<pid-hex>/<id-hex>` and
//! `<sem-base>/<pid-hex>/<id-hex>`; see [`NamespaceConfig`] for the bases
//! and the environment variables that override them.

mod channel;
mod child;
/// Namespace settings and their environment overrides.
pub mod config;
mod error;
/// Descriptor flag requests that understand channel endpoints. Plain
/// descriptors get exactly what `fcntl` gives them.
pub mod flags;
mod ioconfig;
mod naming;
mod readiness;
mod registry;
mod semaphore;

// re-exports
pub use channel::{pipe, Endpoint, Namespace};
pub use child::{create_child, ChildProcess};
pub use config::NamespaceConfig;
pub use error::{Error, Result};
pub use naming::ChannelIdentity;
pub use readiness::{await_readiness, Member};
pub use registry::{PipeState, ReadMode, Role};
pub use semaphore::EventSemaphore;
