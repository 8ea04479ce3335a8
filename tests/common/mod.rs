//! Shared fakes for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Code, Status};

use cluster_balancer::conn::{ClientStream, Dialer, StreamDesc, Transport};
use cluster_balancer::core::meta::HEADER_DATABASE;
use cluster_balancer::discovery::{DiscoveryClient, DiscoveryClientFactory};
use cluster_balancer::{BalancerError, BalancerResult, Context, DriverConfig, Endpoint, StaticDiscovery};

/// Behaviour shared by every transport a [`ScriptedDialer`] creates
#[derive(Debug, Default)]
pub struct Script {
    failures: DashMap<String, Code>,
    delays: DashMap<String, Duration>,
    calls: DashMap<String, usize>,
}

impl Script {
    pub fn fail(&self, address: &str, code: Code) {
        self.failures.insert(address.to_string(), code);
    }

    pub fn heal(&self, address: &str) {
        self.failures.remove(address);
    }

    pub fn delay(&self, address: &str, delay: Duration) {
        self.delays.insert(address.to_string(), delay);
    }

    pub fn calls(&self, address: &str) -> usize {
        self.calls.get(address).map(|c| *c).unwrap_or(0)
    }
}

/// Transport whose unary reply is the node address, or the database header for `/meta`
#[derive(Debug)]
pub struct ScriptedTransport {
    address: String,
    script: Arc<Script>,
}

impl ScriptedTransport {
    async fn play(&self) -> Result<(), Status> {
        *self.script.calls.entry(self.address.clone()).or_insert(0) += 1;
        let delay = self.script.delays.get(&self.address).map(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let code = self.script.failures.get(&self.address).map(|c| *c);
        match code {
            Some(code) => Err(Status::new(code, format!("{} failed", self.address))),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn unary(&self, ctx: &Context, method: &str, request: Bytes) -> Result<Bytes, Status> {
        self.play().await?;
        match method {
            "/test.Echo/Echo" => Ok(request),
            "/test.Echo/Meta" => Ok(ctx
                .metadata()
                .get(HEADER_DATABASE)
                .map(|value| Bytes::copy_from_slice(value.as_bytes()))
                .unwrap_or_default()),
            _ => Ok(Bytes::from(self.address.clone())),
        }
    }

    async fn stream(
        &self,
        _ctx: &Context,
        _desc: &StreamDesc,
        _method: &str,
    ) -> Result<ClientStream, Status> {
        self.play().await?;
        let (requests, inbound) = mpsc::channel(8);
        let responses = ReceiverStream::new(inbound).map(Ok);
        Ok(ClientStream::new(requests, responses))
    }
}

#[derive(Debug, Default)]
pub struct ScriptedDialer {
    pub script: Arc<Script>,
}

impl Dialer for ScriptedDialer {
    fn dial(&self, endpoint: &Endpoint) -> BalancerResult<Arc<dyn Transport>> {
        Ok(Arc::new(ScriptedTransport {
            address: endpoint.address().to_string(),
            script: self.script.clone(),
        }))
    }
}

/// Discovery whose first `hangs` sessions never finish connecting
pub struct HangingDiscovery {
    pub inner: StaticDiscovery,
    pub hangs: usize,
    pub attempts: AtomicUsize,
}

impl HangingDiscovery {
    pub fn new(inner: StaticDiscovery, hangs: usize) -> Self {
        Self {
            inner,
            hangs,
            attempts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl DiscoveryClientFactory for HangingDiscovery {
    async fn connect(&self, ctx: &Context) -> BalancerResult<Box<dyn DiscoveryClient>> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.hangs {
            futures::future::pending::<()>().await;
        }
        self.inner.connect(ctx).await
    }
}

/// Discovery that can be switched to failing between rounds
pub struct FlakyDiscovery {
    pub inner: StaticDiscovery,
    failing: AtomicBool,
    attempts: AtomicUsize,
}

impl FlakyDiscovery {
    pub fn new(inner: StaticDiscovery) -> Self {
        Self {
            inner,
            failing: AtomicBool::new(false),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DiscoveryClientFactory for FlakyDiscovery {
    async fn connect(&self, ctx: &Context) -> BalancerResult<Box<dyn DiscoveryClient>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(BalancerError::dial("discovery:2135", "connection refused"));
        }
        self.inner.connect(ctx).await
    }
}

pub fn node(address: &str, node_id: u32, location: &str) -> Endpoint {
    Endpoint::new(address)
        .with_node_id(node_id)
        .with_location(location)
}

/// Config with background discovery disabled and a fast retry policy
pub fn test_config() -> DriverConfig {
    let mut config = DriverConfig::new("seed:2135", "/local/test");
    config.discovery.interval = Duration::ZERO;
    config.retry.base_delay = Duration::from_millis(1);
    config.retry.max_delay = Duration::from_millis(5);
    config.retry.jitter = 0.0;
    config
}

/// Poll `check` until it holds or a second passes
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
