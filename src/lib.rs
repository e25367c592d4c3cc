//! Async client driver for a JSON document database speaking a framed
//! binary-plus-JSON wire protocol.
//!
//! The stack has four layers. A [`ReqlSocket`] owns one transport
//! connection, runs the SCRAM-SHA-256 handshake, and multiplexes
//! concurrent queries over it by token. A [`Cursor`] presents one
//! query's results as a pull sequence, fetching further batches on
//! demand. A [`Connection`] binds a socket to a session with a default
//! database and optional keepalive. A [`ServerPool`] maintains a set of
//! connections to one server with load-balanced dispatch, health
//! tracking, and backoff recovery.
//!
//! ```no_run
//! use reql_driver::{Connection, ServerOptions, SessionOptions};
//! use serde_json::json;
//!
//! # async fn run() -> reql_driver::Result<()> {
//! let conn = Connection::new(ServerOptions::default(), SessionOptions::default());
//! conn.connect().await?;
//! let cursor = conn.query(json!([15, ["users"]]), None).await?;
//! if let Some(mut cursor) = cursor {
//!     while let Some(row) = cursor.next().await? {
//!         println!("{row}");
//!     }
//! }
//! conn.close(false).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod cursor;
pub mod error;
pub mod proto;
pub mod types;

pub use config::{PoolOptions, RunOptions, ServerOptions, SessionOptions, TlsOptions};
pub use connection::{Connection, PoolEvent, ReqlSocket, ServerPool, SocketEvent, SocketStatus};
pub use cursor::Cursor;
pub use error::{DriverError, Result};
pub use types::Format;
