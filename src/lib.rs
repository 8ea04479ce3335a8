//! # Cluster Balancer - Client-Side Balancing for a Distributed Database Driver
//!
//! Discovers the nodes of a cluster, keeps a locality-aware view of them, and routes
//! every outgoing call to a healthy connection. Nodes that start failing are banned
//! and recover on the next discovery round.
//!
//! ## Module Layout
//!
//! - [`core`]: context, configuration, errors, endpoints, retry policy and the repeater
//! - [`conn`]: pooled connections and the gRPC transport behind them
//! - [`discovery`]: discovery clients and locality detection
//! - [`load_balancing`]: the connections snapshot, selection strategies and the [`Balancer`]
//! - [`observability`]: logging bootstrap and metric descriptions
//!
//! ## Usage Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use cluster_balancer::{Balancer, CallOptions, Context, DriverConfig, Endpoint, StaticDiscovery};
//!
//! # async fn run() -> cluster_balancer::BalancerResult<()> {
//! let discovery = StaticDiscovery::new(vec![
//!     Endpoint::new("10.0.0.1:2135").with_node_id(1).with_location("vla"),
//!     Endpoint::new("10.0.0.2:2135").with_node_id(2).with_location("sas"),
//! ]);
//!
//! let ctx = Context::background();
//! let balancer = Balancer::builder(DriverConfig::new("10.0.0.1:2135", "/local"))
//!     .with_discovery(Arc::new(discovery))
//!     .build(&ctx)
//!     .await?;
//!
//! let reply = balancer
//!     .invoke(&ctx, "/Service/Method", bytes::Bytes::new(), &CallOptions::default())
//!     .await?;
//! # let _ = reply;
//! balancer.close(&ctx).await?;
//! # Ok(())
//! # }
//! ```

pub mod conn;
pub mod core;
pub mod discovery;
pub mod load_balancing;
pub mod observability;

pub use crate::conn::{ClientStream, ConnState, Connection, ConnectionPool, Dialer, GrpcDialer, Pool, StreamDesc, Transport};
pub use crate::core::config::{BalancerConfig, DiscoveryConfig, DriverConfig, LoggingConfig, RetryPolicyConfig};
pub use crate::core::context::Context;
pub use crate::core::endpoint::{Endpoint, EndpointInfo};
pub use crate::core::error::{BalancerError, BalancerResult};
pub use crate::core::repeater::{Repeater, RepeaterOptions};
pub use crate::core::retry::{retry, RetryOptions};
pub use crate::discovery::{DiscoveryClient, DiscoveryClientFactory, LocalityDetector, StaticDiscovery, TcpLocalityDetector};
pub use crate::load_balancing::{Balancer, BalancerBuilder, CallOptions, ConnectionsState, DiscoveryUpdate, Lifecycle, SelectionStrategy};
