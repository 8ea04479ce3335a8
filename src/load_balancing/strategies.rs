use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Configured tie-break between allowed connections of one tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    #[default]
    RoundRobin,
    Random,
}

impl SelectionStrategy {
    pub fn build(self) -> Box<dyn BalancingStrategy> {
        match self {
            SelectionStrategy::RoundRobin => Box::new(RoundRobin::new()),
            SelectionStrategy::Random => Box::new(RandomStart),
        }
    }
}

/// Picks where probing of a tier begins. Probing then walks the tier cyclically.
pub trait BalancingStrategy: Send + Sync + fmt::Debug {
    /// Start position in `0..len`; `len` is never zero
    fn start_index(&self, len: usize) -> usize;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl BalancingStrategy for RoundRobin {
    fn start_index(&self, len: usize) -> usize {
        self.counter.fetch_add(1, Ordering::Relaxed) % len
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

#[derive(Debug, Default)]
pub struct RandomStart;

impl BalancingStrategy for RandomStart {
    fn start_index(&self, len: usize) -> usize {
        rand::thread_rng().gen_range(0..len)
    }

    fn name(&self) -> &'static str {
        "random"
    }
}
