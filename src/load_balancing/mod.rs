pub mod balancer;
pub mod state;
pub mod strategies;

pub use balancer::{Balancer, BalancerBuilder, CallOptions, DiscoveryUpdate, Lifecycle, UpdateCallback};
pub use state::{ConnectionsState, Preference};
pub use strategies::{BalancingStrategy, RandomStart, RoundRobin, SelectionStrategy};
