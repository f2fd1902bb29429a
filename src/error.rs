//! Crate error type.
//!
//! Only fatal-at-construction failures (socket creation, BPF attach,
//! interface lookup, shared-memory/barrier init) are represented here.
//! Recoverable-per-call and silent-drop paths use `Option`/`bool`/signed
//! integer returns instead, per the propagation policy in the design doc.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Fatal errors raised while constructing a transport, protocol stack, or
/// RSU/sync engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Raw socket creation failed.
    #[error("failed to create raw socket: {0}")]
    SocketCreate(#[source] std::io::Error),

    /// Interface lookup (index or hardware address) failed.
    #[error("interface {iface:?} lookup failed: {source}")]
    InterfaceLookup {
        /// Interface name that was looked up.
        iface: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Attaching the BPF classifier to the socket failed.
    #[error("failed to attach BPF filter: {0}")]
    BpfAttach(std::io::Error),

    /// Binding the socket to the link-layer address failed.
    #[error("failed to bind socket: {0}")]
    SocketBind(std::io::Error),

    /// Enabling non-blocking/async I/O on the socket failed.
    #[error("failed to configure non-blocking/async I/O: {0}")]
    SocketConfig(std::io::Error),

    /// Installing the SIGIO handler failed.
    #[error("failed to install signal handler: {0}")]
    SignalHandler(std::io::Error),

    /// POSIX shared memory / mutex / barrier initialization failed.
    #[error("shared memory initialization failed: {0}")]
    SharedMemInit(String),

    /// A runtime I/O error that is not `EAGAIN`/`EWOULDBLOCK`.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
