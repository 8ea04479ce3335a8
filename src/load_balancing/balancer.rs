//! # Balancer
//!
//! Routes every outgoing call to a healthy connection and keeps the cluster view fresh.
//!
//! ## How It Works
//!
//! 1. Construction runs one discovery round under the retry policy and publishes
//!    the first [`ConnectionsState`]. When a discovery interval is configured a
//!    [`Repeater`] then reruns discovery in the background.
//! 2. Every call clones the current snapshot `Arc` under a read lock, releases the
//!    lock, and selects a connection from that snapshot only.
//! 3. Call failures with a configured status code ban the connection in the pool.
//!    When selection had to skip more than half of the preferred tier the repeater
//!    is forced to rediscover immediately.
//! 4. Rediscovery allows every discovered connection again, which is how banned
//!    nodes recover.
//!
//! ## Rust Concepts Used
//!
//! - `parking_lot::RwLock<Arc<T>>` for copy-on-write publishing of snapshots
//! - `Weak` so the background task does not keep the balancer alive
//! - `tokio::sync::broadcast` for asynchronous update notifications
//! - Generic closures returning futures for the shared call wrapper

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tonic::{Code, Status};
use tracing::{debug, field, info, instrument, warn, Span};

use crate::conn::{ClientStream, ConnState, Connection, ConnectionPool, GrpcDialer, Pool, StreamDesc};
use crate::core::config::DriverConfig;
use crate::core::context::Context;
use crate::core::endpoint::{Endpoint, EndpointInfo};
use crate::core::error::{BalancerError, BalancerResult};
use crate::core::meta::Meta;
use crate::core::repeater::{Repeater, RepeaterOptions};
use crate::core::retry::{retry, RetryOptions};
use crate::discovery::{DiscoveryClient, DiscoveryClientFactory, LocalityDetector, StaticDiscovery, TcpLocalityDetector};
use crate::load_balancing::state::{ConnectionsState, Preference};
use crate::observability::metrics::{
    CALL_DURATION, CONNECTIONS, DISCOVERY_DURATION, DISCOVERY_TOTAL, FORCED_REDISCOVERIES_TOTAL,
    NO_ENDPOINTS_TOTAL, PESSIMIZATIONS_TOTAL, PREFERRED_CONNECTIONS,
};

const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// Callback invoked after every successful discovery round.
///
/// Runs while the balancer holds its state lock, so it must not call back
/// into the balancer.
pub type UpdateCallback = Box<dyn Fn(&Context, &[EndpointInfo]) + Send + Sync>;

/// Published on the update channel after every successful discovery round
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryUpdate {
    pub endpoints: Vec<EndpointInfo>,
    pub self_location: String,
    pub preferred_count: usize,
    pub discovered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Uninitialized,
    Ready,
    Closed,
}

/// Per-call options
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Upper bound for this call, on top of the context deadline
    pub timeout: Option<Duration>,
    /// Route to this node when it is healthy
    pub node_id: Option<u32>,
}

impl CallOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_node_id(mut self, node_id: u32) -> Self {
        self.node_id = Some(node_id);
        self
    }

    fn apply(&self, ctx: &Context) -> Context {
        let ctx = match self.timeout {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx.clone(),
        };
        match self.node_id {
            Some(node_id) => ctx.with_node_id(node_id),
            None => ctx,
        }
    }
}

struct Shared {
    connections: Arc<ConnectionsState>,
    subscribers: Vec<UpdateCallback>,
}

struct Inner {
    config: DriverConfig,
    pessimization_codes: Vec<Code>,
    preference: Preference,
    meta: Meta,
    pool: Arc<dyn Pool>,
    discovery: Arc<dyn DiscoveryClientFactory>,
    locality: Arc<dyn LocalityDetector>,
    shared: RwLock<Shared>,
    updates: broadcast::Sender<DiscoveryUpdate>,
    lifecycle: Mutex<Lifecycle>,
}

impl Inner {
    fn connections(&self) -> Arc<ConnectionsState> {
        self.shared.read().connections.clone()
    }

    async fn run_discovery(&self, ctx: &Context) -> BalancerResult<()> {
        retry(ctx, &self.config.retry, RetryOptions::idempotent(true), |ctx| async move {
            self.discovery_attempt(&ctx).await
        })
        .await
    }

    #[instrument(
        name = "balancer.update",
        skip_all,
        fields(
            detect_local_dc = self.config.balancer.detect_local_dc,
            endpoints = field::Empty,
            local_dc = field::Empty,
            error = field::Empty,
        )
    )]
    async fn discovery_attempt(&self, ctx: &Context) -> BalancerResult<()> {
        let started = Instant::now();

        let result = match self.discover_and_apply(ctx).await {
            // the attempt's own timeout fired, the caller still has budget
            Err(err) if err.is_context_error() && ctx.err().is_none() => {
                Err(BalancerError::retryable(err))
            }
            other => other,
        };

        let span = Span::current();
        histogram!(DISCOVERY_DURATION).record(started.elapsed().as_secs_f64());
        match result {
            Ok((endpoints, local_dc)) => {
                span.record("endpoints", endpoints);
                span.record("local_dc", local_dc.as_str());
                counter!(DISCOVERY_TOTAL, "outcome" => "ok").increment(1);
                Ok(())
            }
            Err(err) => {
                span.record("error", field::display(&err));
                counter!(DISCOVERY_TOTAL, "outcome" => "error", "error_type" => err.error_type())
                    .increment(1);
                warn!(error = %err, "Discovery attempt failed");
                Err(err)
            }
        }
    }

    async fn discover_and_apply(&self, ctx: &Context) -> BalancerResult<(usize, String)> {
        let child = match self.config.dial_timeout {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx.with_cancel(),
        };

        let client = child.run(self.discovery.connect(&child)).await??;
        let discovered = self.discover_with(&child, client.as_ref()).await;
        if let Err(err) = client.close(ctx).await {
            debug!(error = %err, "Failed to close discovery client");
        }
        let (endpoints, local_dc) = discovered?;

        let count = endpoints.len();
        self.apply_discovered_endpoints(&child, endpoints, &local_dc)?;
        child.cancel();
        Ok((count, local_dc))
    }

    async fn discover_with(
        &self,
        ctx: &Context,
        client: &dyn DiscoveryClient,
    ) -> BalancerResult<(Vec<Endpoint>, String)> {
        let endpoints = ctx.run(client.discover(ctx)).await??;

        let local_dc = if self.config.balancer.detect_local_dc {
            ctx.run(self.locality.detect(ctx, &endpoints)).await??
        } else {
            String::new()
        };

        Ok((endpoints, local_dc))
    }

    fn apply_discovered_endpoints(
        &self,
        ctx: &Context,
        endpoints: Vec<Endpoint>,
        local_dc: &str,
    ) -> BalancerResult<()> {
        let mut connections = Vec::with_capacity(endpoints.len());
        for endpoint in &endpoints {
            let conn = self.pool.get(endpoint)?;
            self.pool.allow(ctx, &conn);
            conn.endpoint().touch();
            connections.push(conn);
        }

        let state = Arc::new(ConnectionsState::new(
            connections,
            &self.preference,
            local_dc,
            self.config.balancer.allow_fallback,
            self.config.balancer.strategy,
        ));
        let infos: Vec<EndpointInfo> = endpoints.iter().map(Endpoint::info).collect();
        let update = DiscoveryUpdate {
            endpoints: infos.clone(),
            self_location: local_dc.to_string(),
            preferred_count: state.preferred_count(),
            discovered_at: Utc::now(),
        };

        gauge!(CONNECTIONS).set(state.len() as f64);
        gauge!(PREFERRED_CONNECTIONS).set(state.preferred_count() as f64);
        info!(
            endpoints = state.len(),
            preferred = state.preferred_count(),
            fallback = state.fallback_count(),
            local_dc = %local_dc,
            "Published connections state"
        );

        {
            let mut shared = self.shared.write();
            shared.connections = state;
            for subscriber in &shared.subscribers {
                subscriber(ctx, &infos);
            }
        }

        // no receivers is fine
        let _ = self.updates.send(update);
        Ok(())
    }

    fn must_pessimize(&self, ctx: &Context, err: &BalancerError) -> bool {
        if ctx.is_done() {
            return false;
        }
        err.code()
            .map_or(false, |code| self.pessimization_codes.contains(&code))
    }
}

/// Client-side balancer over a discovered cluster
pub struct Balancer {
    inner: Arc<Inner>,
    repeater: Option<Repeater>,
}

impl Balancer {
    pub fn builder(config: DriverConfig) -> BalancerBuilder {
        BalancerBuilder::new(config)
    }

    /// Register a callback for every future successful discovery round
    pub fn on_update<F>(&self, callback: F)
    where
        F: Fn(&Context, &[EndpointInfo]) + Send + Sync + 'static,
    {
        self.inner.shared.write().subscribers.push(Box::new(callback));
    }

    /// Receive discovery updates asynchronously
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryUpdate> {
        self.inner.updates.subscribe()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.inner.lifecycle.lock()
    }

    /// The snapshot calls are currently served from
    pub fn connections_state(&self) -> Arc<ConnectionsState> {
        self.inner.connections()
    }

    pub fn has_repeater(&self) -> bool {
        self.repeater.is_some()
    }

    /// Run one discovery round now, on the calling task
    pub async fn rediscover(&self, ctx: &Context) -> BalancerResult<()> {
        self.ensure_ready()?;
        if self.inner.config.balancer.single_conn {
            return Ok(());
        }
        self.inner.discovery_attempt(ctx).await
    }

    /// Ask the background task for an immediate rediscovery
    pub fn force_rediscovery(&self) -> bool {
        match &self.repeater {
            Some(repeater) => {
                counter!(FORCED_REDISCOVERIES_TOTAL).increment(1);
                repeater.force();
                true
            }
            None => false,
        }
    }

    fn ensure_ready(&self) -> BalancerResult<()> {
        match self.lifecycle() {
            Lifecycle::Ready => Ok(()),
            Lifecycle::Closed => Err(BalancerError::Closed),
            Lifecycle::Uninitialized => Err(BalancerError::internal("balancer is not initialized")),
        }
    }

    /// Pick a connection for one call
    pub fn get_conn(&self, ctx: &Context) -> BalancerResult<Arc<dyn Connection>> {
        self.ensure_ready()?;
        if let Some(err) = ctx.err() {
            return Err(err);
        }

        let state = self.inner.connections();
        let (conn, failed) = state.get_connection(ctx);

        if state.needs_rediscovery(failed) && self.force_rediscovery() {
            debug!(
                failed = failed,
                preferred = state.preferred_count(),
                "Too many banned connections, forcing rediscovery"
            );
        }

        match conn {
            Some(conn) => {
                debug!(
                    address = %conn.endpoint().address(),
                    node_id = conn.endpoint().node_id(),
                    failed = failed,
                    "Selected connection"
                );
                Ok(conn)
            }
            None => {
                counter!(NO_ENDPOINTS_TOTAL).increment(1);
                Err(BalancerError::NoEndpoints { attempts: failed })
            }
        }
    }

    async fn wrap_call<T, F, Fut>(&self, ctx: &Context, options: &CallOptions, op: F) -> BalancerResult<T>
    where
        F: FnOnce(Context, Arc<dyn Connection>) -> Fut,
        Fut: Future<Output = Result<T, Status>>,
    {
        let ctx = options.apply(ctx);
        let conn = self.get_conn(&ctx)?;
        let call_ctx = self.inner.meta.context(&ctx)?;

        let started = Instant::now();
        let result = match call_ctx.run(op(call_ctx.clone(), conn.clone())).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(status)) => Err(BalancerError::call(status)),
            Err(err) => Err(err),
        };

        match &result {
            Ok(_) => {
                if conn.state() == ConnState::Banned {
                    self.inner.pool.allow(&ctx, &conn);
                }
            }
            Err(err) => {
                if self.inner.must_pessimize(&ctx, err) {
                    counter!(PESSIMIZATIONS_TOTAL).increment(1);
                    self.inner.pool.ban(&ctx, &conn, err);
                }
            }
        }

        histogram!(
            CALL_DURATION,
            "outcome" => if result.is_ok() { "ok" } else { "error" }
        )
        .record(started.elapsed().as_secs_f64());

        result.map_err(|err| {
            if self.inner.config.wrap_errors {
                err.with_stack_trace()
            } else {
                err
            }
        })
    }

    /// Unary call with an encoded request
    pub async fn invoke(
        &self,
        ctx: &Context,
        method: &str,
        request: Bytes,
        options: &CallOptions,
    ) -> BalancerResult<Bytes> {
        self.wrap_call(ctx, options, |ctx, conn| async move {
            conn.invoke(&ctx, method, request).await
        })
        .await
    }

    /// Unary call with protobuf messages
    pub async fn invoke_message<Req, Resp>(
        &self,
        ctx: &Context,
        method: &str,
        request: &Req,
        options: &CallOptions,
    ) -> BalancerResult<Resp>
    where
        Req: prost::Message,
        Resp: prost::Message + Default,
    {
        let payload = Bytes::from(request.encode_to_vec());
        let reply = self.invoke(ctx, method, payload, options).await?;
        Ok(Resp::decode(reply)?)
    }

    /// Open a stream on a selected connection
    pub async fn new_stream(
        &self,
        ctx: &Context,
        desc: &StreamDesc,
        method: &str,
        options: &CallOptions,
    ) -> BalancerResult<ClientStream> {
        self.wrap_call(ctx, options, |ctx, conn| async move {
            conn.new_stream(&ctx, desc, method).await
        })
        .await
    }

    /// Stop background discovery. Pooled connections stay open and calls
    /// already in flight finish normally.
    #[instrument(name = "balancer.close", skip_all)]
    pub async fn close(&self, _ctx: &Context) -> BalancerResult<()> {
        {
            let mut lifecycle = self.inner.lifecycle.lock();
            if *lifecycle == Lifecycle::Closed {
                return Ok(());
            }
            *lifecycle = Lifecycle::Closed;
        }

        if let Some(repeater) = &self.repeater {
            repeater.stop();
            repeater.join().await;
        }

        info!("Balancer closed");
        Ok(())
    }
}

impl std::fmt::Debug for Balancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Balancer")
            .field("lifecycle", &self.lifecycle())
            .field("connections", &self.inner.connections())
            .field("repeater", &self.repeater.as_ref().map(Repeater::name))
            .finish()
    }
}

/// Assembles a [`Balancer`] and runs its first discovery round
pub struct BalancerBuilder {
    config: DriverConfig,
    pool: Option<Arc<dyn Pool>>,
    discovery: Option<Arc<dyn DiscoveryClientFactory>>,
    locality: Option<Arc<dyn LocalityDetector>>,
    subscribers: Vec<UpdateCallback>,
}

impl BalancerBuilder {
    pub fn new(config: DriverConfig) -> Self {
        Self {
            config,
            pool: None,
            discovery: None,
            locality: None,
            subscribers: Vec::new(),
        }
    }

    pub fn with_pool(mut self, pool: Arc<dyn Pool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_discovery(mut self, discovery: Arc<dyn DiscoveryClientFactory>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn with_locality_detector(mut self, locality: Arc<dyn LocalityDetector>) -> Self {
        self.locality = Some(locality);
        self
    }

    /// Register a callback that also sees the initial discovery round
    pub fn on_update<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Context, &[EndpointInfo]) + Send + Sync + 'static,
    {
        self.subscribers.push(Box::new(callback));
        self
    }

    #[instrument(name = "balancer.init", skip_all, fields(endpoint = %self.config.endpoint))]
    pub async fn build(self, ctx: &Context) -> BalancerResult<Balancer> {
        self.config.validate()?;

        let config = self.config;
        let pool = self
            .pool
            .unwrap_or_else(|| Arc::new(ConnectionPool::grpc(GrpcDialer::new(config.dial_timeout))));
        let discovery = self
            .discovery
            .unwrap_or_else(|| Arc::new(StaticDiscovery::new(vec![Endpoint::new(&config.endpoint)])));
        let locality = self
            .locality
            .unwrap_or_else(|| Arc::new(TcpLocalityDetector::default()));

        let preference = if !config.balancer.prefer_locations.is_empty() {
            Preference::Locations(config.balancer.prefer_locations.clone())
        } else if config.balancer.detect_local_dc {
            Preference::SelfLocation
        } else {
            Preference::All
        };

        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        let inner = Arc::new(Inner {
            pessimization_codes: config.pessimization_codes(),
            meta: Meta::new(&config),
            preference,
            pool,
            discovery,
            locality,
            shared: RwLock::new(Shared {
                connections: Arc::new(ConnectionsState::empty()),
                subscribers: self.subscribers,
            }),
            updates,
            lifecycle: Mutex::new(Lifecycle::Uninitialized),
            config,
        });

        let repeater = if inner.config.balancer.single_conn {
            let conn = inner.pool.get(&Endpoint::new(&inner.config.endpoint))?;
            inner.shared.write().connections = Arc::new(ConnectionsState::single(conn));
            info!("Single connection mode, discovery disabled");
            None
        } else {
            inner.run_discovery(ctx).await?;
            inner.config.discovery_interval().map(|interval| {
                let weak: Weak<Inner> = Arc::downgrade(&inner);
                Repeater::new(
                    interval,
                    move |ctx: Context| {
                        let inner = weak.upgrade();
                        async move {
                            match inner {
                                Some(inner) => inner.discovery_attempt(&ctx).await,
                                None => Ok(()),
                            }
                        }
                    },
                    RepeaterOptions::named("discovery"),
                )
            })
        };

        *inner.lifecycle.lock() = Lifecycle::Ready;
        info!(
            connections = inner.connections().len(),
            background_discovery = repeater.is_some(),
            "Balancer initialized"
        );

        Ok(Balancer { inner, repeater })
    }
}
