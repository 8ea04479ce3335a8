//! Cluster node descriptors produced by discovery.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// A discovered cluster node.
///
/// Everything except the last-updated timestamp is fixed for the lifetime of the
/// value. Clones share the timestamp, so [`Endpoint::touch`] through any clone
/// (for example the one held by a pooled connection) is visible through all of them.
#[derive(Debug, Clone)]
pub struct Endpoint {
    address: String,
    node_id: u32,
    location: String,
    load_factor: f32,
    last_updated: Arc<RwLock<DateTime<Utc>>>,
}

impl Endpoint {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            node_id: 0,
            location: String::new(),
            load_factor: 0.0,
            last_updated: Arc::new(RwLock::new(Utc::now())),
        }
    }

    pub fn with_node_id(mut self, node_id: u32) -> Self {
        self.node_id = node_id;
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = location.into();
        self
    }

    pub fn with_load_factor(mut self, load_factor: f32) -> Self {
        self.load_factor = load_factor;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    /// Location tag (datacenter); empty when unknown
    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn load_factor(&self) -> f32 {
        self.load_factor
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        *self.last_updated.read()
    }

    /// Mark the endpoint as seen by the latest discovery round
    pub fn touch(&self) {
        *self.last_updated.write() = Utc::now();
    }

    /// Identity used by the connection pool.
    ///
    /// A node that moves to another location gets a fresh connection so that
    /// tiering always reflects the latest discovery result.
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.address, self.node_id, self.location)
    }

    /// Read-only projection handed to update subscribers
    pub fn info(&self) -> EndpointInfo {
        EndpointInfo {
            address: self.address.clone(),
            node_id: self.node_id,
            location: self.location.clone(),
            load_factor: self.load_factor,
            last_updated: self.last_updated(),
        }
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
            && self.node_id == other.node_id
            && self.location == other.location
            && self.load_factor == other.load_factor
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.location.is_empty() {
            write!(f, "{}#{}", self.address, self.node_id)
        } else {
            write!(f, "{}#{}@{}", self.address, self.node_id, self.location)
        }
    }
}

/// Serializable snapshot of an [`Endpoint`] without any connection or health details
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointInfo {
    pub address: String,
    pub node_id: u32,
    pub location: String,
    pub load_factor: f32,
    pub last_updated: DateTime<Utc>,
}

impl From<EndpointInfo> for Endpoint {
    fn from(info: EndpointInfo) -> Self {
        Self {
            address: info.address,
            node_id: info.node_id,
            location: info.location,
            load_factor: info.load_factor,
            last_updated: Arc::new(RwLock::new(info.last_updated)),
        }
    }
}
