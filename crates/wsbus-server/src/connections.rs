//! Registry of live connections.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use wsbus_core::Connection;

/// Open connections keyed by id. Cloning shares the same map.
pub struct ConnectionRegistry<U = ()> {
    connections: Arc<DashMap<Uuid, Arc<Connection<U>>>>,
}

impl<U> Clone for ConnectionRegistry<U> {
    fn clone(&self) -> Self {
        Self {
            connections: Arc::clone(&self.connections),
        }
    }
}

impl<U> Default for ConnectionRegistry<U> {
    fn default() -> Self {
        Self {
            connections: Arc::new(DashMap::new()),
        }
    }
}

impl<U> ConnectionRegistry<U> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, conn: Arc<Connection<U>>) {
        self.connections.insert(conn.id(), conn);
    }

    pub fn remove(&self, id: &Uuid) -> Option<Arc<Connection<U>>> {
        self.connections.remove(id).map(|(_, conn)| conn)
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<Connection<U>>> {
        self.connections.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Returns the current connections. No shard lock is held afterwards.
    pub fn snapshot(&self) -> Vec<Arc<Connection<U>>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Sends an event to every open connection whose id is not in `exclude`.
    /// Returns the number of connections the event was queued for.
    pub fn broadcast(&self, event: &str, payload: Option<Value>, exclude: &[Uuid]) -> usize {
        let mut delivered = 0;
        for conn in self.snapshot() {
            if exclude.contains(&conn.id()) || !conn.is_open() {
                continue;
            }
            match conn.send(event, payload.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => debug!(conn_id = %conn.id(), event, error = %e, "broadcast skipped"),
            }
        }
        delivered
    }
}
