//! gRPC transport over a lazily connected tonic `Channel`.
//!
//! Payloads stay opaque: [`BytesCodec`] passes encoded messages through unchanged,
//! so message types are chosen by the caller.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint as TonicEndpoint};
use tonic::{Request, Status};
use tracing::debug;

use crate::conn::connection::{ClientStream, StreamDesc, Transport};
use crate::conn::pool::Dialer;
use crate::core::context::Context;
use crate::core::endpoint::Endpoint;
use crate::core::error::{BalancerError, BalancerResult};

const STREAM_BUFFER: usize = 16;

/// Identity codec for pre-encoded messages
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl Codec for BytesCodec {
    type Encode = Bytes;
    type Decode = Bytes;
    type Encoder = BytesCodec;
    type Decoder = BytesCodec;

    fn encoder(&mut self) -> Self::Encoder {
        BytesCodec
    }

    fn decoder(&mut self) -> Self::Decoder {
        BytesCodec
    }
}

impl Encoder for BytesCodec {
    type Item = Bytes;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        dst.put(item);
        Ok(())
    }
}

impl Decoder for BytesCodec {
    type Item = Bytes;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        let remaining = src.remaining();
        Ok(Some(src.copy_to_bytes(remaining)))
    }
}

/// Dials endpoints as plaintext HTTP/2 channels
#[derive(Debug, Clone)]
pub struct GrpcDialer {
    connect_timeout: Option<Duration>,
}

impl GrpcDialer {
    pub fn new(connect_timeout: Option<Duration>) -> Self {
        Self { connect_timeout }
    }
}

impl Default for GrpcDialer {
    fn default() -> Self {
        Self::new(Some(Duration::from_secs(5)))
    }
}

impl Dialer for GrpcDialer {
    fn dial(&self, endpoint: &Endpoint) -> BalancerResult<Arc<dyn Transport>> {
        let uri = format!("http://{}", endpoint.address());
        let mut target = TonicEndpoint::from_shared(uri)
            .map_err(|e| BalancerError::dial(endpoint.address(), e.to_string()))?;
        if let Some(timeout) = self.connect_timeout {
            target = target.connect_timeout(timeout);
        }

        debug!(address = %endpoint.address(), "Creating lazy gRPC channel");
        Ok(Arc::new(GrpcTransport {
            channel: target.connect_lazy(),
        }))
    }
}

/// Transport backed by a tonic channel
#[derive(Debug, Clone)]
pub struct GrpcTransport {
    channel: Channel,
}

impl GrpcTransport {
    fn request<T>(ctx: &Context, message: T) -> Request<T> {
        let mut request = Request::new(message);
        *request.metadata_mut() = ctx.metadata().clone();
        if let Some(remaining) = ctx.remaining() {
            request.set_timeout(remaining);
        }
        request
    }

    fn path(method: &str) -> Result<PathAndQuery, Status> {
        PathAndQuery::try_from(method)
            .map_err(|e| Status::invalid_argument(format!("invalid method path {:?}: {}", method, e)))
    }

    async fn ready(&self) -> Result<tonic::client::Grpc<Channel>, Status> {
        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| Status::unavailable(format!("channel is not ready: {}", e)))?;
        Ok(grpc)
    }
}

#[async_trait]
impl Transport for GrpcTransport {
    async fn unary(&self, ctx: &Context, method: &str, request: Bytes) -> Result<Bytes, Status> {
        let path = Self::path(method)?;
        let mut grpc = self.ready().await?;
        let response = grpc
            .unary(Self::request(ctx, request), path, BytesCodec)
            .await?;
        Ok(response.into_inner())
    }

    async fn stream(
        &self,
        ctx: &Context,
        desc: &StreamDesc,
        method: &str,
    ) -> Result<ClientStream, Status> {
        let path = Self::path(method)?;
        let mut grpc = self.ready().await?;
        let (requests, outbound) = mpsc::channel(STREAM_BUFFER);

        debug!(
            method = %method,
            stream = %desc.name,
            client_streaming = desc.client_streaming,
            server_streaming = desc.server_streaming,
            "Opening gRPC stream"
        );

        let response = grpc
            .streaming(Self::request(ctx, ReceiverStream::new(outbound)), path, BytesCodec)
            .await?;
        Ok(ClientStream::new(requests, response.into_inner()))
    }
}
