//! Port-bound blocking channel over a `Protocol`.
//!
//! Grounded on `original_source/include/protocols/protocol_commom.hh`'s
//! `Communicator` nested class: a thin per-port handle that a component
//! constructs once and then calls `send`/`receive` on, without touching
//! `Protocol` plumbing directly.

use std::sync::Arc;

use crate::address::{Address, Port};
use crate::control::ControlType;
use crate::observer::ConcurrentObserver;
use crate::protocol::{Protocol, RecvMessage};

/// A bound port on one `Protocol`: owns the port's inbound queue for as
/// long as it lives, and unregisters on drop.
pub struct Communicator {
    protocol: Arc<Protocol>,
    port: Port,
    inbox: Arc<ConcurrentObserver<RecvMessage>>,
}

impl Communicator {
    /// Bind `port` on `protocol`. Rebinding an already-bound port replaces
    /// the previous registration (and its queued messages).
    #[must_use]
    pub fn new(protocol: Arc<Protocol>, port: Port) -> Self {
        let inbox = protocol.attach_port(port);
        Self { protocol, port, inbox }
    }

    /// This communicator's bound port.
    #[must_use]
    pub fn port(&self) -> Port {
        self.port
    }

    /// Send `payload` to `to`, tagged with `ctrl_type`, from this
    /// communicator's port.
    pub fn send(&self, to: Address, ctrl_type: ControlType, payload: &[u8]) -> i64 {
        self.protocol.send(self.port, to, ctrl_type, payload)
    }

    /// Block until a message addressed to this port arrives.
    #[must_use]
    pub fn receive(&self) -> RecvMessage {
        self.inbox.updated()
    }

    /// Non-blocking poll for a queued message.
    #[must_use]
    pub fn try_receive(&self) -> Option<RecvMessage> {
        self.inbox.try_updated()
    }
}

impl Drop for Communicator {
    fn drop(&mut self) {
        self.protocol.detach_port(self.port);
    }
}
