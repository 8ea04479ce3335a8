//! # Call Context
//!
//! A [`Context`] travels with every operation in the balancer: discovery attempts,
//! retries, connection selection and remote calls. It bundles three things:
//!
//! - a [`CancellationToken`] that callers (or a parent context) can trigger at any time
//! - an optional deadline, measured on the tokio clock so paused-time tests work
//! - call metadata (request headers) and an optional preferred node id
//!
//! Children are derived with [`Context::with_cancel`] or [`Context::with_timeout`].
//! Cancelling a parent cancels every child; a child expiring or being cancelled
//! leaves the parent untouched. The balancer relies on that asymmetry to tell a
//! per-attempt timeout apart from the caller giving up.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tonic::metadata::MetadataMap;

use crate::core::error::{BalancerError, BalancerResult};

#[derive(Debug, Clone, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
    metadata: MetadataMap,
    node_id: Option<u32>,
}

impl Context {
    /// A root context that is never cancelled and has no deadline
    pub fn background() -> Self {
        Self::default()
    }

    /// A root context that is cancelled together with `token`
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            ..Self::default()
        }
    }

    /// Derive a child that can be cancelled independently of this context
    pub fn with_cancel(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
            metadata: self.metadata.clone(),
            node_id: self.node_id,
        }
    }

    /// Derive a child that expires after `timeout`, or earlier if this context does
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a child that expires at `deadline`, or earlier if this context does
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let mut child = self.with_cancel();
        child.deadline = Some(match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        });
        child
    }

    /// Ask the balancer to prefer the connection to a specific node
    pub fn with_node_id(mut self, node_id: u32) -> Self {
        self.node_id = Some(node_id);
        self
    }

    pub fn node_id(&self) -> Option<u32> {
        self.node_id
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline, `None` when there is no deadline
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut MetadataMap {
        &mut self.metadata
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Cancel this context and every context derived from it
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// The reason this context is done, or `None` while it is still live
    pub fn err(&self) -> Option<BalancerError> {
        if self.token.is_cancelled() {
            return Some(BalancerError::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(BalancerError::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Resolves once the context is cancelled or its deadline passes
    pub async fn done(&self) -> BalancerError {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => BalancerError::Canceled,
                    _ = tokio::time::sleep_until(deadline) => BalancerError::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                BalancerError::Canceled
            }
        }
    }

    /// Drive `fut` to completion unless the context finishes first
    pub async fn run<F>(&self, fut: F) -> BalancerResult<F::Output>
    where
        F: Future,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            output = fut => Ok(output),
        }
    }
}
