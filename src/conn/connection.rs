//! # Connections
//!
//! A [`Connection`] is a shared handle bound to one [`Endpoint`]. The pool owns it;
//! snapshots and in-flight calls hold `Arc` clones.
//!
//! ## Rust Concepts Used
//!
//! - `async_trait` for the async call surface of `dyn Connection`
//! - `AtomicU8` for a lock-free health flag readable from any task
//! - `futures::stream::BoxStream` to erase the concrete response stream type

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, Stream, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tonic::Status;

use crate::core::context::Context;
use crate::core::endpoint::Endpoint;

/// Health of a pooled connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnState {
    /// Dialed but never reported on
    Created,
    Allowed,
    Banned,
}

impl ConnState {
    /// Whether selection may hand out a connection in this state
    pub fn is_selectable(self) -> bool {
        !matches!(self, ConnState::Banned)
    }

    fn as_u8(self) -> u8 {
        match self {
            ConnState::Created => 0,
            ConnState::Allowed => 1,
            ConnState::Banned => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnState::Allowed,
            2 => ConnState::Banned,
            _ => ConnState::Created,
        }
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnState::Created => write!(f, "created"),
            ConnState::Allowed => write!(f, "allowed"),
            ConnState::Banned => write!(f, "banned"),
        }
    }
}

/// Shape of a streaming method
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDesc {
    pub name: String,
    pub client_streaming: bool,
    pub server_streaming: bool,
}

impl StreamDesc {
    pub fn bidi(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            client_streaming: true,
            server_streaming: true,
        }
    }

    pub fn server_streaming(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            client_streaming: false,
            server_streaming: true,
        }
    }
}

/// Client side of an open stream: a request sink and a response stream
pub struct ClientStream {
    requests: Option<mpsc::Sender<Bytes>>,
    responses: BoxStream<'static, Result<Bytes, Status>>,
}

impl ClientStream {
    pub fn new<S>(requests: mpsc::Sender<Bytes>, responses: S) -> Self
    where
        S: Stream<Item = Result<Bytes, Status>> + Send + 'static,
    {
        Self {
            requests: Some(requests),
            responses: responses.boxed(),
        }
    }

    /// Queue a request message
    pub async fn send(&self, message: Bytes) -> Result<(), Status> {
        let requests = self
            .requests
            .as_ref()
            .ok_or_else(|| Status::failed_precondition("send side of the stream is closed"))?;
        requests
            .send(message)
            .await
            .map_err(|_| Status::cancelled("stream is no longer accepting requests"))
    }

    /// Signal that no more requests will be sent
    pub fn close_send(&mut self) {
        self.requests.take();
    }

    /// Next response message, `None` once the server finished the stream
    pub async fn message(&mut self) -> Option<Result<Bytes, Status>> {
        self.responses.next().await
    }
}

impl fmt::Debug for ClientStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientStream")
            .field("send_open", &self.requests.is_some())
            .finish_non_exhaustive()
    }
}

/// A pooled handle to one endpoint
#[async_trait]
pub trait Connection: Send + Sync + fmt::Debug {
    fn endpoint(&self) -> &Endpoint;

    fn state(&self) -> ConnState;

    /// Replace the health flag, returning the previous value
    fn set_state(&self, state: ConnState) -> ConnState;

    /// Unary call with an encoded request
    async fn invoke(&self, ctx: &Context, method: &str, request: Bytes) -> Result<Bytes, Status>;

    /// Open a stream for `method`
    async fn new_stream(
        &self,
        ctx: &Context,
        desc: &StreamDesc,
        method: &str,
    ) -> Result<ClientStream, Status>;
}

/// Byte-level RPC transport to one address
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    async fn unary(&self, ctx: &Context, method: &str, request: Bytes) -> Result<Bytes, Status>;

    async fn stream(
        &self,
        ctx: &Context,
        desc: &StreamDesc,
        method: &str,
    ) -> Result<ClientStream, Status>;
}

/// The connection type handed out by [`ConnectionPool`](crate::conn::ConnectionPool)
#[derive(Debug)]
pub struct PooledConnection {
    endpoint: Endpoint,
    state: AtomicU8,
    transport: Arc<dyn Transport>,
    connection_id: String,
    created_at: DateTime<Utc>,
}

impl PooledConnection {
    pub fn new(endpoint: Endpoint, transport: Arc<dyn Transport>) -> Self {
        Self {
            endpoint,
            state: AtomicU8::new(ConnState::Created.as_u8()),
            transport,
            connection_id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

#[async_trait]
impl Connection for PooledConnection {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnState) -> ConnState {
        ConnState::from_u8(self.state.swap(state.as_u8(), Ordering::AcqRel))
    }

    async fn invoke(&self, ctx: &Context, method: &str, request: Bytes) -> Result<Bytes, Status> {
        self.transport.unary(ctx, method, request).await
    }

    async fn new_stream(
        &self,
        ctx: &Context,
        desc: &StreamDesc,
        method: &str,
    ) -> Result<ClientStream, Status> {
        self.transport.stream(ctx, desc, method).await
    }
}
