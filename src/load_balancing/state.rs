//! # Connections State
//!
//! An immutable, tiered view of the cluster built once per discovery round.
//!
//! Connections are split into a *preferred* tier (the caller's location, or the
//! configured locations) and a *fallback* tier holding everything else. Selection
//! walks the preferred tier first and only touches the fallback tier when it is
//! allowed to. The only mutable part of a snapshot is the strategy cursor, which
//! never changes which connections the snapshot contains.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::conn::Connection;
use crate::core::context::Context;
use crate::core::endpoint::Endpoint;
use crate::load_balancing::strategies::{BalancingStrategy, SelectionStrategy};

/// How connections are assigned to the preferred tier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Preference {
    /// Every connection is preferred
    All,
    /// Connections in the detected self location; all of them when it is unknown
    SelfLocation,
    /// Connections in one of the listed locations
    Locations(Vec<String>),
}

impl Preference {
    fn is_preferred(&self, self_location: &str, endpoint: &Endpoint) -> bool {
        match self {
            Preference::All => true,
            Preference::SelfLocation => {
                self_location.is_empty() || endpoint.location() == self_location
            }
            Preference::Locations(locations) => {
                locations.iter().any(|location| location == endpoint.location())
            }
        }
    }
}

pub struct ConnectionsState {
    all: Vec<Arc<dyn Connection>>,
    preferred: Vec<Arc<dyn Connection>>,
    fallback: Vec<Arc<dyn Connection>>,
    by_node: HashMap<u32, Arc<dyn Connection>>,
    self_location: String,
    allow_fallback: bool,
    single_conn: bool,
    strategy: Box<dyn BalancingStrategy>,
}

impl ConnectionsState {
    pub fn new(
        connections: Vec<Arc<dyn Connection>>,
        preference: &Preference,
        self_location: impl Into<String>,
        allow_fallback: bool,
        strategy: SelectionStrategy,
    ) -> Self {
        let self_location = self_location.into();
        let (preferred, fallback): (Vec<_>, Vec<_>) = connections
            .iter()
            .cloned()
            .partition(|conn| preference.is_preferred(&self_location, conn.endpoint()));

        let by_node = connections
            .iter()
            .filter(|conn| conn.endpoint().node_id() != 0)
            .map(|conn| (conn.endpoint().node_id(), conn.clone()))
            .collect();

        Self {
            all: connections,
            preferred,
            fallback,
            by_node,
            self_location,
            allow_fallback,
            single_conn: false,
            strategy: strategy.build(),
        }
    }

    /// Snapshot that routes everything to one connection, whatever its health
    pub fn single(connection: Arc<dyn Connection>) -> Self {
        Self {
            all: vec![connection.clone()],
            preferred: vec![connection],
            fallback: Vec::new(),
            by_node: HashMap::new(),
            self_location: String::new(),
            allow_fallback: false,
            single_conn: true,
            strategy: SelectionStrategy::RoundRobin.build(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), &Preference::All, "", false, SelectionStrategy::RoundRobin)
    }

    /// Pick a connection and report how many banned connections were skipped
    pub fn get_connection(&self, ctx: &Context) -> (Option<Arc<dyn Connection>>, usize) {
        if self.single_conn {
            return (self.all.first().cloned(), 0);
        }

        if let Some(conn) = ctx
            .node_id()
            .and_then(|node_id| self.by_node.get(&node_id))
            .filter(|conn| conn.state().is_selectable())
        {
            return (Some(conn.clone()), 0);
        }

        let mut failed = 0;
        if let Some(conn) = self.select_from(&self.preferred, &mut failed) {
            return (Some(conn), failed);
        }
        if self.allow_fallback {
            if let Some(conn) = self.select_from(&self.fallback, &mut failed) {
                return (Some(conn), failed);
            }
        }
        (None, failed)
    }

    fn select_from(
        &self,
        tier: &[Arc<dyn Connection>],
        failed: &mut usize,
    ) -> Option<Arc<dyn Connection>> {
        if tier.is_empty() {
            return None;
        }

        let start = self.strategy.start_index(tier.len());
        for offset in 0..tier.len() {
            let conn = &tier[(start + offset) % tier.len()];
            if conn.state().is_selectable() {
                return Some(conn.clone());
            }
            *failed += 1;
        }
        None
    }

    /// Whether `failed` skips during selection warrant an immediate rediscovery
    pub fn needs_rediscovery(&self, failed: usize) -> bool {
        failed * 2 > self.preferred_count()
    }

    pub fn preferred_count(&self) -> usize {
        self.preferred.len()
    }

    pub fn fallback_count(&self) -> usize {
        self.fallback.len()
    }

    pub fn self_location(&self) -> &str {
        &self.self_location
    }

    pub fn allow_fallback(&self) -> bool {
        self.allow_fallback
    }

    pub fn is_single_conn(&self) -> bool {
        self.single_conn
    }

    pub fn connections(&self) -> &[Arc<dyn Connection>] {
        &self.all
    }

    pub fn len(&self) -> usize {
        self.all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }
}

impl fmt::Debug for ConnectionsState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionsState")
            .field("connections", &self.all.len())
            .field("preferred", &self.preferred.len())
            .field("fallback", &self.fallback.len())
            .field("self_location", &self.self_location)
            .field("allow_fallback", &self.allow_fallback)
            .field("single_conn", &self.single_conn)
            .field("strategy", &self.strategy.name())
            .finish()
    }
}
