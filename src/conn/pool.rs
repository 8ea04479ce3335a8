//! # Connection Pool Module
//!
//! Keeps one shared [`Connection`] per endpoint and owns its health flag.
//!
//! ## Rust Concepts Used
//!
//! - `DashMap` for concurrent get-or-create without a global lock
//! - `Arc<dyn Connection>` so snapshots and calls share handles with the pool
//! - Trait objects (`dyn Dialer`) to plug in the transport

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use metrics::{counter, gauge};
use tracing::{debug, info, warn};

use crate::conn::connection::{ConnState, Connection, PooledConnection, Transport};
use crate::conn::grpc::GrpcDialer;
use crate::core::context::Context;
use crate::core::endpoint::Endpoint;
use crate::core::error::{BalancerError, BalancerResult};
use crate::observability::metrics::{
    POOL_ALLOWS_TOTAL, POOL_BANNED_CONNECTIONS, POOL_BANS_TOTAL, POOL_CONNECTIONS, POOL_CREATED, POOL_REUSED,
};

/// Creates the transport for a newly pooled endpoint
pub trait Dialer: Send + Sync + fmt::Debug {
    fn dial(&self, endpoint: &Endpoint) -> BalancerResult<Arc<dyn Transport>>;
}

/// Source of truth for connections and their health
pub trait Pool: Send + Sync {
    /// Return the pooled connection for `endpoint`, creating it on first use
    fn get(&self, endpoint: &Endpoint) -> BalancerResult<Arc<dyn Connection>>;

    /// Mark `conn` as failing so selection skips it
    fn ban(&self, ctx: &Context, conn: &Arc<dyn Connection>, cause: &BalancerError);

    /// Make `conn` selectable again
    fn allow(&self, ctx: &Context, conn: &Arc<dyn Connection>);
}

/// Connection pool statistics
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PoolStats {
    pub total_connections: usize,
    pub banned_connections: usize,
}

/// Default [`Pool`] keyed by endpoint identity
pub struct ConnectionPool {
    connections: DashMap<String, Arc<dyn Connection>>,
    dialer: Arc<dyn Dialer>,
}

impl ConnectionPool {
    pub fn new(dialer: Arc<dyn Dialer>) -> Self {
        Self {
            connections: DashMap::new(),
            dialer,
        }
    }

    /// Pool that dials endpoints over gRPC
    pub fn grpc(dialer: GrpcDialer) -> Self {
        Self::new(Arc::new(dialer))
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn stats(&self) -> PoolStats {
        let banned_connections = self
            .connections
            .iter()
            .filter(|entry| entry.value().state() == ConnState::Banned)
            .count();

        PoolStats {
            total_connections: self.connections.len(),
            banned_connections,
        }
    }

    fn record_banned_gauge(&self) {
        gauge!(POOL_BANNED_CONNECTIONS).set(self.stats().banned_connections as f64);
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("connections", &self.connections.len())
            .field("dialer", &self.dialer)
            .finish()
    }
}

impl Pool for ConnectionPool {
    fn get(&self, endpoint: &Endpoint) -> BalancerResult<Arc<dyn Connection>> {
        let key = endpoint.key();
        if let Some(existing) = self.connections.get(&key) {
            counter!(POOL_REUSED).increment(1);
            return Ok(existing.value().clone());
        }

        let entry = match self.connections.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(entry) => entry.get().clone(),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let transport = self.dialer.dial(endpoint)?;
                let connection = PooledConnection::new(endpoint.clone(), transport);

                info!(
                    address = %endpoint.address(),
                    node_id = endpoint.node_id(),
                    location = %endpoint.location(),
                    connection_id = %connection.connection_id(),
                    "Created pooled connection"
                );
                counter!(POOL_CREATED).increment(1);

                let connection: Arc<dyn Connection> = Arc::new(connection);
                entry.insert(connection.clone());
                connection
            }
        };

        gauge!(POOL_CONNECTIONS).set(self.connections.len() as f64);
        Ok(entry)
    }

    fn ban(&self, _ctx: &Context, conn: &Arc<dyn Connection>, cause: &BalancerError) {
        let previous = conn.set_state(ConnState::Banned);
        if previous == ConnState::Banned {
            return;
        }

        warn!(
            address = %conn.endpoint().address(),
            node_id = conn.endpoint().node_id(),
            previous_state = %previous,
            cause = %cause,
            "Banned connection"
        );
        counter!(POOL_BANS_TOTAL).increment(1);
        self.record_banned_gauge();
    }

    fn allow(&self, _ctx: &Context, conn: &Arc<dyn Connection>) {
        let previous = conn.set_state(ConnState::Allowed);
        if previous != ConnState::Banned {
            return;
        }

        debug!(
            address = %conn.endpoint().address(),
            node_id = conn.endpoint().node_id(),
            "Allowed previously banned connection"
        );
        counter!(POOL_ALLOWS_TOTAL).increment(1);
        self.record_banned_gauge();
    }
}
