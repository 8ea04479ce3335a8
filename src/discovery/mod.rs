pub mod client;
pub mod locality;

pub use client::{DiscoveryClient, DiscoveryClientFactory, StaticDiscovery, UnreachableDiscovery};
pub use locality::{FixedLocality, LocalityDetector, TcpLocalityDetector};
