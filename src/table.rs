//! Connection Table: maps remote address to connection, and handles
//! connection birth via init-packet dispatch.
//!
//! Lookups are meant to be wait-free on the receive hot path; a `RwLock` over a
//! `HashMap` gives that in practice (reads vastly outnumber the inserts/removes
//! that only happen at connection birth/death).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use crate::connection::Connection;

/// Registered connection-init handler: given `(client_type, remote, listen)`,
/// attempts to establish a connection, returning `true` if it handled the
/// init packet. The first handler that returns `true` wins.
pub type InitHandler = Box<dyn Fn(u8, SocketAddr, usize) -> bool + Send + Sync>;

/// Maps remote addresses to their live [`Connection`], for both inbound
/// (player) connections and outbound client connections made via
/// `MakeClientConnection` — a separate table holds outbound client
/// connections, keyed the same way.
#[derive(Default)]
pub struct ConnectionTable {
    inbound: RwLock<HashMap<SocketAddr, Arc<Connection>>>,
    outbound: RwLock<HashMap<SocketAddr, Arc<Connection>>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up an inbound (player) connection by remote address.
    pub fn lookup(&self, remote: &SocketAddr) -> Option<Arc<Connection>> {
        self.inbound.read().unwrap().get(remote).cloned()
    }

    /// Looks up an outbound client connection by remote address.
    pub fn lookup_outbound(&self, remote: &SocketAddr) -> Option<Arc<Connection>> {
        self.outbound.read().unwrap().get(remote).cloned()
    }

    /// Publishes a newly-established inbound connection, returning the existing
    /// one instead if the address is already present and still `Connected`.
    /// Makes init-packet retries idempotent.
    pub fn insert_or_get(&self, remote: SocketAddr, make: impl FnOnce() -> Arc<Connection>) -> Arc<Connection> {
        {
            let existing = self.inbound.read().unwrap();
            if let Some(conn) = existing.get(&remote) {
                if conn.state() == crate::connection::ConnectionState::Connected {
                    return conn.clone();
                }
            }
        }
        let mut table = self.inbound.write().unwrap();
        if let Some(conn) = table.get(&remote) {
            if conn.state() == crate::connection::ConnectionState::Connected {
                return conn.clone();
            }
        }
        let conn = make();
        table.insert(remote, conn.clone());
        conn
    }

    /// Registers an outbound client connection (`MakeClientConnection`).
    pub fn insert_outbound(&self, remote: SocketAddr, conn: Arc<Connection>) {
        self.outbound.write().unwrap().insert(remote, conn);
    }

    /// Removes a connection from both tables on teardown.
    pub fn remove(&self, remote: &SocketAddr) {
        self.inbound.write().unwrap().remove(remote);
        self.outbound.write().unwrap().remove(remote);
    }

    /// Snapshot of every live inbound connection, for the send/lifecycle worker
    /// passes that must visit all connections each tick.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.inbound.read().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inbound.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An ordered list of registered [`InitHandler`]s.
#[derive(Default)]
pub struct InitHandlerChain {
    handlers: RwLock<Vec<InitHandler>>,
}

impl InitHandlerChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, handler: InitHandler) {
        self.handlers.write().unwrap().push(handler);
    }

    /// Runs handlers in registration order; stops at the first that returns
    /// `true`.
    pub fn dispatch(&self, client_type: u8, remote: SocketAddr, listen: usize) -> bool {
        for handler in self.handlers.read().unwrap().iter() {
            if handler(client_type, remote, listen) {
                return true;
            }
        }
        false
    }
}
