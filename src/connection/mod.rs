//! Connection stack: handshake, wire socket, session connection, pool.

pub mod connection;
pub mod handshake;
pub mod pool;
pub mod socket;

pub use connection::Connection;
pub use pool::{PoolEvent, ServerPool};
pub use socket::{ReqlSocket, SocketEvent, SocketStatus};
