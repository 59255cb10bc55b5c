//! # Connection
//!
//! A Connection is the sole shared mutable object between one isle and the
//! manager: a pair of unbounded, single-producer/single-consumer FIFO
//! queues, one in each direction. `Connection::pair` returns the two
//! already-split halves — `IsleConnection` (owned by the isle) and
//! `ManagerConnection` (owned by the manager) — since nothing in this
//! crate ever needs a single type serving both roles.

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::packet::Packet;

/// The isle-owned half of a Connection.
pub struct IsleConnection {
    to_manager: UnboundedSender<Packet>,
    to_owner: UnboundedReceiver<Packet>,
}

/// The manager-owned half of a Connection.
pub struct ManagerConnection {
    to_owner: UnboundedSender<Packet>,
    to_manager: UnboundedReceiver<Packet>,
}

impl IsleConnection {
    /// Enqueue a packet toward the manager. Never blocks.
    pub fn owner_send(&self, packet: Packet) {
        // The receiving half lives on the manager for as long as this isle
        // is registered; a send error here means the manager has already
        // dropped its half, which only happens after this isle's task has
        // been told to stop.
        let _ = self.to_manager.send(packet);
    }

    /// Poll the inbound queue. Returns `None` when empty (the "absent"
    /// sentinel) rather than blocking.
    pub fn owner_receive(&mut self) -> Option<Packet> {
        self.to_owner.try_recv().ok()
    }
}

impl ManagerConnection {
    /// Enqueue a packet toward the isle. Never blocks.
    pub fn router_send(&self, packet: Packet) {
        let _ = self.to_owner.send(packet);
    }

    /// Poll the outbound-from-isle queue. Returns `None` when empty.
    pub fn router_receive(&mut self) -> Option<Packet> {
        self.to_manager.try_recv().ok()
    }
}

/// A split pair of FIFO queues connecting one isle to the manager.
pub struct Connection;

impl Connection {
    /// Build a fresh pair: the isle's half and the manager's half.
    pub fn pair() -> (IsleConnection, ManagerConnection) {
        let (to_manager_tx, to_manager_rx) = unbounded_channel();
        let (to_owner_tx, to_owner_rx) = unbounded_channel();
        (
            IsleConnection {
                to_manager: to_manager_tx,
                to_owner: to_owner_rx,
            },
            ManagerConnection {
                to_owner: to_owner_tx,
                to_manager: to_manager_rx,
            },
        )
    }
}
