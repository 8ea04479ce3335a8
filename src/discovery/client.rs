//! # Discovery Clients
//!
//! Interfaces used by the balancer to enumerate cluster nodes, plus an in-memory
//! implementation for static deployments and tests.
//!
//! ## Rust Concepts Used
//!
//! - `async_trait` for async methods on trait objects
//! - `Arc` around shared state so one [`StaticDiscovery`] serves many clients
//! - `parking_lot::RwLock` for a cheap, ordered endpoint list

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::core::context::Context;
use crate::core::endpoint::Endpoint;
use crate::core::error::{BalancerError, BalancerResult};

/// A connected discovery session
#[async_trait]
pub trait DiscoveryClient: Send + Sync {
    /// Return the current node list
    async fn discover(&self, ctx: &Context) -> BalancerResult<Vec<Endpoint>>;

    /// Release the session; called once per attempt whatever the outcome
    async fn close(&self, ctx: &Context) -> BalancerResult<()>;
}

/// Opens a discovery session for one attempt
#[async_trait]
pub trait DiscoveryClientFactory: Send + Sync {
    async fn connect(&self, ctx: &Context) -> BalancerResult<Box<dyn DiscoveryClient>>;
}

#[derive(Debug, Default)]
struct StaticState {
    endpoints: RwLock<Vec<Endpoint>>,
    connects: AtomicUsize,
    discovers: AtomicUsize,
    closes: AtomicUsize,
}

/// Static discovery for testing and simple deployments
///
/// Clones share the same endpoint list, so a test can keep one handle and
/// reshape the cluster while the balancer holds another.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    state: Arc<StaticState>,
}

impl StaticDiscovery {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        let discovery = Self::default();
        discovery.set_endpoints(endpoints);
        discovery
    }

    /// Replace the whole node list
    pub fn set_endpoints(&self, endpoints: Vec<Endpoint>) {
        *self.state.endpoints.write() = endpoints;
    }

    /// Add a node, replacing any entry with the same identity
    pub fn add_endpoint(&self, endpoint: Endpoint) {
        let mut endpoints = self.state.endpoints.write();
        let key = endpoint.key();
        endpoints.retain(|existing| existing.key() != key);
        endpoints.push(endpoint);
    }

    /// Remove every node with the given address, returning how many were removed
    pub fn remove_endpoint(&self, address: &str) -> usize {
        let mut endpoints = self.state.endpoints.write();
        let before = endpoints.len();
        endpoints.retain(|existing| existing.address() != address);
        before - endpoints.len()
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.state.endpoints.read().clone()
    }

    /// Number of sessions opened so far
    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Number of `discover` calls so far
    pub fn discover_count(&self) -> usize {
        self.state.discovers.load(Ordering::SeqCst)
    }

    /// Number of sessions closed so far
    pub fn close_count(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DiscoveryClient for StaticDiscovery {
    async fn discover(&self, ctx: &Context) -> BalancerResult<Vec<Endpoint>> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        self.state.discovers.fetch_add(1, Ordering::SeqCst);

        let endpoints = self.endpoints();
        debug!(endpoints = endpoints.len(), "Static discovery returned endpoints");
        Ok(endpoints)
    }

    async fn close(&self, _ctx: &Context) -> BalancerResult<()> {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl DiscoveryClientFactory for StaticDiscovery {
    async fn connect(&self, ctx: &Context) -> BalancerResult<Box<dyn DiscoveryClient>> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(self.clone()))
    }
}

/// Factory whose sessions always fail to connect
#[derive(Debug, Clone)]
pub struct UnreachableDiscovery {
    address: String,
}

impl UnreachableDiscovery {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[async_trait]
impl DiscoveryClientFactory for UnreachableDiscovery {
    async fn connect(&self, _ctx: &Context) -> BalancerResult<Box<dyn DiscoveryClient>> {
        Err(BalancerError::dial(&self.address, "discovery endpoint is unreachable"))
    }
}
