//! Handle registry for engine connections owned by one execution context.

use crate::error::{Error, Result};
use crate::sqlite::{ConnectionState, EngineConnection};
use std::collections::HashMap;
use tracing::debug;

/// Maps handle ids to connections. Closed connections keep their slot so a
/// reused id reports "Database closed" rather than "Database not found".
#[derive(Default)]
pub struct Registry {
    connections: HashMap<u64, EngineConnection>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn state(&self, id: u64) -> Option<ConnectionState> {
        self.connections.get(&id).map(EngineConnection::state)
    }

    /// Registers a freshly opened connection; ids are never reused.
    pub fn insert(&mut self, id: u64, connection: EngineConnection) -> Result<()> {
        match self.state(id) {
            Some(ConnectionState::Closed) => Err(Error::Closed),
            Some(_) => Err(Error::Protocol(format!("Handle {id} is already in use"))),
            None => {
                self.connections.insert(id, connection);
                debug!(id, live = self.live(), "connection registered");
                Ok(())
            }
        }
    }

    pub fn get(&self, id: Option<u64>) -> Result<&EngineConnection> {
        id.and_then(|id| self.connections.get(&id))
            .ok_or(Error::NotFound)
    }

    pub fn get_mut(&mut self, id: Option<u64>) -> Result<&mut EngineConnection> {
        id.and_then(|id| self.connections.get_mut(&id))
            .ok_or(Error::NotFound)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Connections still open.
    pub fn live(&self) -> usize {
        self.connections
            .values()
            .filter(|connection| connection.is_open())
            .count()
    }

    /// Closes every open connection; used when the context shuts down.
    pub fn close_all(&mut self) {
        for (id, connection) in &mut self.connections {
            if connection.is_open() {
                if let Err(err) = connection.close() {
                    debug!(id, error = %err, "close failed during shutdown");
                }
            }
        }
    }
}
