//! Connection: binds a wire socket to a logical session with a default
//! database, run-option merging, and periodic keepalive.

use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::{RunOptions, ServerOptions, SessionOptions};
use crate::connection::socket::{ReqlSocket, SocketEvent, SocketStatus};
use crate::cursor::Cursor;
use crate::error::{DriverError, Result};
use crate::proto::{self, Query, Response, ResponseType};
use crate::types::FormatOptions;

pub struct Connection {
    socket: Arc<ReqlSocket>,
    session: SessionOptions,
    db: Mutex<String>,
    ping_task: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    pub fn new(server: ServerOptions, session: SessionOptions) -> Self {
        let socket = Arc::new(ReqlSocket::new(
            server,
            &session.user,
            &session.password,
        ));
        let db = session.db.clone();
        Connection {
            socket,
            session,
            db: Mutex::new(db),
            ping_task: Mutex::new(None),
        }
    }

    /// Opens the socket, bounded by the session connect timeout, and
    /// starts keepalive pinging if configured.
    pub async fn connect(&self) -> Result<()> {
        match timeout(self.session.timeout, self.socket.connect()).await {
            Ok(result) => result?,
            Err(_) => {
                self.socket.close().await;
                return Err(DriverError::Timeout);
            }
        }
        self.start_pinging();
        Ok(())
    }

    /// Close then connect; used for the initial open and for pool-driven
    /// recovery.
    pub async fn reconnect(&self) -> Result<()> {
        self.close(false).await?;
        self.connect().await
    }

    pub fn is_open(&self) -> bool {
        self.socket.is_open()
    }

    pub fn status(&self) -> SocketStatus {
        self.socket.status()
    }

    pub fn num_queries(&self) -> usize {
        self.socket.pending_count()
    }

    pub fn idle_for(&self) -> Option<std::time::Duration> {
        self.socket.idle_for()
    }

    pub fn last_error(&self) -> Option<DriverError> {
        self.socket.last_error()
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SocketEvent> {
        self.socket.subscribe()
    }

    /// Switches the session's default database.
    pub fn use_db(&self, db: &str) {
        *self.db.lock().unwrap() = db.to_string();
    }

    /// Wraps a term in a START envelope, injects the default database
    /// into table references lacking one, and sends it. Returns a cursor
    /// unless no-reply was requested.
    pub async fn query(&self, term: Value, opts: Option<RunOptions>) -> Result<Option<Cursor>> {
        let opts = opts.unwrap_or_default();
        let db_name = opts
            .db
            .clone()
            .unwrap_or_else(|| self.db.lock().unwrap().clone());
        let mut term = term;
        if !db_name.is_empty() {
            let db_term = json!([proto::term::DB, [db_name]]);
            inject_db(&mut term, &db_term);
        }

        let query = Query::start(term.clone(), opts.to_wire());
        let noreply = opts.is_noreply();
        let token = self.socket.send_query(query, None).await?;
        if noreply {
            return Ok(None);
        }
        Ok(Some(Cursor::new(
            Arc::clone(&self.socket),
            token,
            FormatOptions::from_run_options(&opts),
            opts.timeout,
            Some(term),
        )))
    }

    /// Barrier: resolves once every previously sent no-reply query has
    /// been applied by the server.
    pub async fn noreply_wait(&self) -> Result<()> {
        let token = self.socket.send_query(Query::noreply_wait(), None).await?;
        let raw = self.socket.read_next(token).await?;
        let response: Response = serde_json::from_value(raw)?;
        match response.response_type()? {
            ResponseType::WaitComplete => Ok(()),
            other => Err(DriverError::protocol(format!(
                "expected WAIT_COMPLETE, got {:?}",
                other
            ))),
        }
    }

    /// Fetches server identification.
    pub async fn server_info(&self) -> Result<Value> {
        let token = self.socket.send_query(Query::server_info(), None).await?;
        let raw = self.socket.read_next(token).await?;
        let response: Response = serde_json::from_value(raw)?;
        match response.response_type()? {
            ResponseType::ServerInfo | ResponseType::SuccessAtom => {
                Ok(response.r.into_iter().next().unwrap_or(Value::Null))
            }
            other => Err(DriverError::protocol(format!(
                "expected SERVER_INFO, got {:?}",
                other
            ))),
        }
    }

    /// Graceful close. With `noreply_wait` a barrier query runs first so
    /// prior no-reply queries are guaranteed applied before teardown.
    pub async fn close(&self, noreply_wait: bool) -> Result<()> {
        self.stop_pinging();
        if noreply_wait && self.socket.is_open() {
            if let Err(err) = self.noreply_wait().await {
                tracing::debug!(error = %err, "noreply_wait barrier failed during close");
            }
        }
        self.socket.close().await;
        Ok(())
    }

    fn start_pinging(&self) {
        let Some(interval) = self.session.ping_interval else {
            return;
        };
        let socket = Arc::clone(&self.socket);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !socket.is_open() {
                    break;
                }
                // best effort: a failed ping is recorded, never fatal
                if let Err(err) = ping(&socket).await {
                    tracing::warn!(error = %err, "keepalive ping failed");
                }
            }
        });
        if let Some(previous) = self.ping_task.lock().unwrap().replace(handle) {
            previous.abort();
        }
    }

    fn stop_pinging(&self) {
        if let Some(task) = self.ping_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.stop_pinging();
    }
}

async fn ping(socket: &ReqlSocket) -> Result<()> {
    let token = socket.send_query(Query::server_info(), None).await?;
    socket.read_next(token).await?;
    Ok(())
}

/// Recursively adds a DB argument to every TABLE term that lacks one.
/// Terms are otherwise treated as opaque.
fn inject_db(term: &mut Value, db_term: &Value) {
    match term {
        Value::Array(parts) => {
            let is_table =
                parts.first().and_then(Value::as_u64) == Some(proto::term::TABLE);
            if is_table {
                if let Some(Value::Array(args)) = parts.get_mut(1) {
                    let has_db = args
                        .first()
                        .map(|arg| {
                            matches!(arg, Value::Array(inner)
                                if inner.first().and_then(Value::as_u64) == Some(proto::term::DB))
                        })
                        .unwrap_or(false);
                    if !has_db {
                        args.insert(0, db_term.clone());
                    }
                }
            }
            for part in parts.iter_mut().skip(1) {
                inject_db(part, db_term);
            }
        }
        Value::Object(map) => {
            for value in map.values_mut() {
                inject_db(value, db_term);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::term::{DB, TABLE};

    #[test]
    fn table_without_db_gets_the_default() {
        let mut term = json!([TABLE, ["users"]]);
        inject_db(&mut term, &json!([DB, ["marketing"]]));
        assert_eq!(term, json!([TABLE, [[DB, ["marketing"]], "users"]]));
    }

    #[test]
    fn table_with_explicit_db_is_untouched() {
        let mut term = json!([TABLE, [[DB, ["analytics"]], "users"]]);
        let before = term.clone();
        inject_db(&mut term, &json!([DB, ["marketing"]]));
        assert_eq!(term, before);
    }

    #[test]
    fn nested_table_terms_are_found() {
        // filter(table("users"), {..}) shaped term
        let mut term = json!([39, [[TABLE, ["users"]], {"admin": true}]]);
        inject_db(&mut term, &json!([DB, ["marketing"]]));
        assert_eq!(
            term,
            json!([39, [[TABLE, [[DB, ["marketing"]], "users"]], {"admin": true}]])
        );
    }

    #[test]
    fn scalar_terms_are_left_alone() {
        let mut term = json!(1);
        inject_db(&mut term, &json!([DB, ["marketing"]]));
        assert_eq!(term, json!(1));
    }
}
