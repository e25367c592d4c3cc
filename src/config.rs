//! Driver configuration: server address, session, pool sizing, and
//! per-query run options.

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::types::Format;

/// Address and transport options for one server.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub host: String,
    pub port: u16,
    pub tls: Option<TlsOptions>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            host: "localhost".to_string(),
            port: 28015,
            tls: None,
        }
    }
}

impl ServerOptions {
    pub fn new(host: &str, port: u16) -> Self {
        ServerOptions {
            host: host.to_string(),
            port,
            tls: None,
        }
    }

    pub fn with_tls(mut self, tls: TlsOptions) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// TLS settings applied when a connection is opened with TLS enabled.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// Server name for certificate validation; defaults to the host.
    pub domain: Option<String>,
    /// Accept self-signed certificates. Test environments only.
    pub accept_invalid_certs: bool,
}

/// Per-session options: credentials, default database, timeouts.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub db: String,
    pub user: String,
    pub password: String,
    /// Connect timeout, also the default per-query timeout.
    pub timeout: Duration,
    /// Keepalive interval; `None` disables pinging.
    pub ping_interval: Option<Duration>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            db: "test".to_string(),
            user: "admin".to_string(),
            password: String::new(),
            timeout: Duration::from_secs(20),
            ping_interval: None,
        }
    }
}

impl SessionOptions {
    pub fn with_db(mut self, db: &str) -> Self {
        self.db = db.to_string();
        self
    }

    pub fn with_credentials(mut self, user: &str, password: &str) -> Self {
        self.user = user.to_string();
        self.password = password.to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = Some(interval);
        self
    }
}

/// Pool sizing and recovery options.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Low-water mark: the pool keeps this many connections open.
    pub buffer: usize,
    /// Hard cap on concurrently open connections.
    pub max: usize,
    /// Base delay for exponential-backoff reconnection.
    pub backoff_base: Duration,
    /// Reconnect delay doubles per attempt up to `backoff_base * 2^max_exponent`.
    pub max_exponent: u32,
    /// Connections beyond `buffer` idle for this long are closed.
    pub idle_timeout: Duration,
    /// Give-up bound for `wait_for_healthy`.
    pub health_check_timeout: Duration,
    /// When false, `queue` fails with `PoolExhausted` instead of waiting
    /// for capacity.
    pub queue_at_capacity: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        PoolOptions {
            buffer: 1,
            max: 1,
            backoff_base: Duration::from_secs(1),
            max_exponent: 6,
            idle_timeout: Duration::from_secs(60 * 60),
            health_check_timeout: Duration::from_secs(30),
            queue_at_capacity: true,
        }
    }
}

impl PoolOptions {
    pub fn with_buffer_max(mut self, buffer: usize, max: usize) -> Self {
        self.buffer = buffer.min(max).max(1);
        self.max = max.max(1);
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max_exponent: u32) -> Self {
        self.backoff_base = base;
        self.max_exponent = max_exponent;
        self
    }
}

/// Options attached to a single query run.
///
/// `db` and `timeout` are driver-side concerns and never serialized; the
/// remaining fields pass through to the query's global options object.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunOptions {
    #[serde(skip)]
    pub db: Option<String>,
    #[serde(skip)]
    pub timeout: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub noreply: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub durability: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_format: Option<Format>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_format: Option<Format>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binary_format: Option<Format>,
}

impl RunOptions {
    pub fn noreply() -> Self {
        RunOptions {
            noreply: Some(true),
            ..Default::default()
        }
    }

    pub fn profiled() -> Self {
        RunOptions {
            profile: Some(true),
            ..Default::default()
        }
    }

    pub fn with_db(mut self, db: &str) -> Self {
        self.db = Some(db.to_string());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn is_noreply(&self) -> bool {
        self.noreply.unwrap_or(false)
    }

    /// The wire-visible portion of these options, or `None` when empty.
    pub fn to_wire(&self) -> Option<Value> {
        let value = serde_json::to_value(self).unwrap_or(Value::Null);
        match &value {
            Value::Object(map) if map.is_empty() => None,
            Value::Object(_) => Some(value),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn server_defaults() {
        let server = ServerOptions::default();
        assert_eq!(server.addr(), "localhost:28015");
        assert!(server.tls.is_none());
    }

    #[test]
    fn run_options_skip_driver_side_fields() {
        let opts = RunOptions::profiled()
            .with_db("marketing")
            .with_timeout(Duration::from_secs(5));
        assert_eq!(opts.to_wire(), Some(json!({"profile": true})));
    }

    #[test]
    fn empty_run_options_serialize_to_nothing() {
        assert_eq!(RunOptions::default().to_wire(), None);
    }

    #[test]
    fn buffer_never_exceeds_max() {
        let opts = PoolOptions::default().with_buffer_max(10, 4);
        assert_eq!(opts.buffer, 4);
        assert_eq!(opts.max, 4);
    }
}
