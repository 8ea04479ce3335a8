pub mod connection;
pub mod grpc;
pub mod pool;

pub use connection::{ClientStream, ConnState, Connection, PooledConnection, StreamDesc, Transport};
pub use grpc::{BytesCodec, GrpcDialer, GrpcTransport};
pub use pool::{ConnectionPool, Dialer, Pool, PoolStats};
