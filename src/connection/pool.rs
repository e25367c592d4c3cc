//! Per-server connection pool: dispatch and load balancing, health
//! aggregation, idle reaping, bounded capacity, and backoff reconnection.
//!
//! Connections are added to and removed from pool bookkeeping only by
//! pool methods; a connection never removes itself, so a socket error
//! and a concurrent drain cannot double-remove a slot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::{PoolOptions, RunOptions, ServerOptions, SessionOptions};
use crate::connection::connection::Connection;
use crate::connection::socket::SocketEvent;
use crate::cursor::Cursor;
use crate::error::{DriverError, Result};

const EVENT_CAPACITY: usize = 64;

/// Notifications published by the pool.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    Healthy(bool),
    Size(usize),
    AvailableSize(usize),
    Queueing,
    Draining,
}

struct PoolInner {
    connections: Vec<Arc<Connection>>,
    buffer: usize,
    max: usize,
}

pub struct ServerPool {
    server: ServerOptions,
    session: SessionOptions,
    options: PoolOptions,
    inner: Mutex<PoolInner>,
    healthy: watch::Sender<bool>,
    draining: AtomicBool,
    events: broadcast::Sender<PoolEvent>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

enum Dispatch {
    Use(Arc<Connection>),
    Grow {
        fresh: Arc<Connection>,
        fallback: Arc<Connection>,
    },
    Exhausted,
    Wait,
}

impl ServerPool {
    pub fn new(server: ServerOptions, session: SessionOptions, options: PoolOptions) -> Arc<Self> {
        let buffer = options.buffer.min(options.max).max(1);
        let max = options.max.max(1);
        Arc::new(ServerPool {
            server,
            session,
            options,
            inner: Mutex::new(PoolInner {
                connections: Vec::new(),
                buffer,
                max,
            }),
            healthy: watch::channel(false).0,
            draining: AtomicBool::new(false),
            events: broadcast::channel(EVENT_CAPACITY).0,
            reaper: Mutex::new(None),
        })
    }

    /// Opens up to `buffer` connections concurrently. Individual failures
    /// are non-fatal: those connections go straight to backoff recovery.
    pub async fn init_connections(self: &Arc<Self>) {
        let buffer = self.inner.lock().unwrap().buffer;
        let conns: Vec<Arc<Connection>> = (0..buffer)
            .map(|_| Arc::new(Connection::new(self.server.clone(), self.session.clone())))
            .collect();
        let results =
            futures::future::join_all(conns.iter().map(|conn| conn.connect())).await;

        for (conn, result) in conns.into_iter().zip(results) {
            self.inner.lock().unwrap().connections.push(Arc::clone(&conn));
            match result {
                Ok(()) => self.subscribe_to_connection(conn),
                Err(err) => {
                    tracing::warn!(addr = %self.server.addr(), error = %err,
                        "initial connection failed, scheduling recovery");
                    self.persist_connection(conn);
                }
            }
        }
        self.refresh_health();
        self.emit(PoolEvent::Size(self.len()));
        self.spawn_reaper();
    }

    pub fn is_healthy(&self) -> bool {
        *self.healthy.borrow()
    }

    /// Resolves once at least one connection is open. Gives up with a
    /// connection error after the configured health-check timeout.
    pub async fn wait_for_healthy(&self) -> Result<()> {
        let mut rx = self.healthy.subscribe();
        if *rx.borrow() {
            return Ok(());
        }
        timeout(self.options.health_check_timeout, async {
            loop {
                rx.changed()
                    .await
                    .map_err(|_| DriverError::connection("connection pool was dropped"))?;
                if *rx.borrow() {
                    return Ok(());
                }
            }
        })
        .await
        .map_err(|_| {
            DriverError::connection("pool did not become healthy within the health-check timeout")
        })?
    }

    /// Dispatches a query to the open connection with the fewest running
    /// queries. Opens a new connection when the best candidate is busy
    /// and the pool is below `max`; at `max` with all connections busy
    /// the query multiplexes onto the least-loaded connection instead of
    /// exceeding the cap.
    pub async fn queue(
        self: &Arc<Self>,
        term: Value,
        opts: Option<RunOptions>,
    ) -> Result<Option<Cursor>> {
        loop {
            if self.draining.load(Ordering::SeqCst) {
                return Err(DriverError::connection("connection pool is draining"));
            }
            let decision = {
                let mut inner = self.inner.lock().unwrap();
                let best = inner
                    .connections
                    .iter()
                    .filter(|conn| conn.is_open())
                    .min_by_key(|conn| conn.num_queries())
                    .cloned();
                match best {
                    None => Dispatch::Wait,
                    Some(best) if best.num_queries() == 0 => Dispatch::Use(best),
                    Some(best) if inner.connections.len() < inner.max => {
                        // reserve the slot under the lock so concurrent
                        // queue calls can never exceed max
                        let fresh = Arc::new(Connection::new(
                            self.server.clone(),
                            self.session.clone(),
                        ));
                        inner.connections.push(Arc::clone(&fresh));
                        Dispatch::Grow {
                            fresh,
                            fallback: best,
                        }
                    }
                    Some(_) if !self.options.queue_at_capacity => Dispatch::Exhausted,
                    Some(best) => Dispatch::Use(best),
                }
            };
            match decision {
                Dispatch::Use(conn) => return conn.query(term, opts).await,
                Dispatch::Grow { fresh, fallback } => {
                    self.emit(PoolEvent::Size(self.len()));
                    match fresh.connect().await {
                        Ok(()) => {
                            self.subscribe_to_connection(Arc::clone(&fresh));
                            self.refresh_health();
                            return fresh.query(term, opts).await;
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "failed to grow pool, using busy connection");
                            self.remove_connection(&fresh);
                            return fallback.query(term, opts).await;
                        }
                    }
                }
                Dispatch::Exhausted => return Err(DriverError::PoolExhausted),
                Dispatch::Wait => {
                    self.emit(PoolEvent::Queueing);
                    // the watch flag may lag a connection that just died;
                    // re-derive it here so the wait below cannot spin on a
                    // stale healthy reading
                    self.refresh_health();
                    self.wait_for_healthy().await?;
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    /// Closes every held connection and clears bookkeeping.
    pub async fn drain(&self, noreply_wait: bool) {
        self.draining.store(true, Ordering::SeqCst);
        self.emit(PoolEvent::Draining);
        if let Some(task) = self.reaper.lock().unwrap().take() {
            task.abort();
        }
        let conns: Vec<Arc<Connection>> = {
            let mut inner = self.inner.lock().unwrap();
            inner.connections.drain(..).collect()
        };
        futures::future::join_all(conns.iter().map(|conn| conn.close(noreply_wait))).await;
        let _ = self.healthy.send_replace(false);
    }

    /// Reconciles live capacity against new low/high water marks
    /// immediately: opens connections up to the new buffer and closes
    /// idle connections beyond the new max. Busy connections above the
    /// cap are shed by the idle reaper once they quiesce.
    pub async fn update_buffer_max(self: &Arc<Self>, buffer: usize, max: usize) {
        let max = max.max(1);
        let buffer = buffer.min(max).max(1);
        let (to_open, to_close) = {
            let mut inner = self.inner.lock().unwrap();
            inner.buffer = buffer;
            inner.max = max;
            let to_open = buffer.saturating_sub(inner.connections.len());
            let mut to_close = Vec::new();
            while inner.connections.len() > max {
                if let Some(pos) = inner
                    .connections
                    .iter()
                    .position(|conn| conn.num_queries() == 0)
                {
                    to_close.push(inner.connections.remove(pos));
                } else {
                    break;
                }
            }
            (to_open, to_close)
        };
        for conn in &to_close {
            let _ = conn.close(false).await;
        }
        for _ in 0..to_open {
            let fresh = Arc::new(Connection::new(self.server.clone(), self.session.clone()));
            self.inner
                .lock()
                .unwrap()
                .connections
                .push(Arc::clone(&fresh));
            match fresh.connect().await {
                Ok(()) => self.subscribe_to_connection(fresh),
                Err(err) => {
                    tracing::warn!(error = %err, "failed to open connection after resize");
                    self.persist_connection(fresh);
                }
            }
        }
        self.refresh_health();
        self.emit(PoolEvent::Size(self.len()));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    pub fn get_connections(&self) -> Vec<Arc<Connection>> {
        self.inner.lock().unwrap().connections.clone()
    }

    /// Number of open connections.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .connections
            .iter()
            .filter(|conn| conn.is_open())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Open connections with no running queries.
    pub fn available_len(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .connections
            .iter()
            .filter(|conn| conn.is_open() && conn.num_queries() == 0)
            .count()
    }

    pub fn num_running_queries(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .connections
            .iter()
            .map(|conn| conn.num_queries())
            .sum()
    }

    fn emit(&self, event: PoolEvent) {
        let _ = self.events.send(event);
    }

    fn refresh_health(&self) {
        let healthy = self
            .inner
            .lock()
            .unwrap()
            .connections
            .iter()
            .any(|conn| conn.is_open());
        let previous = self.healthy.send_replace(healthy);
        if previous != healthy {
            tracing::debug!(healthy, "pool health changed");
            self.emit(PoolEvent::Healthy(healthy));
        }
    }

    fn still_tracks(&self, conn: &Arc<Connection>) -> bool {
        self.inner
            .lock()
            .unwrap()
            .connections
            .iter()
            .any(|held| Arc::ptr_eq(held, conn))
    }

    fn remove_connection(&self, conn: &Arc<Connection>) {
        let mut inner = self.inner.lock().unwrap();
        inner.connections.retain(|held| !Arc::ptr_eq(held, conn));
    }

    /// Watches one connection's socket events, tracking load changes and
    /// kicking off recovery when the socket dies.
    fn subscribe_to_connection(self: &Arc<Self>, conn: Arc<Connection>) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut events = conn.subscribe();
            loop {
                match events.recv().await {
                    Ok(SocketEvent::QuerySent { .. }) | Ok(SocketEvent::Release { .. }) => {
                        pool.emit(PoolEvent::AvailableSize(pool.available_len()));
                    }
                    Ok(SocketEvent::Error { .. }) | Err(broadcast::error::RecvError::Closed) => {
                        pool.refresh_health();
                        if !pool.draining.load(Ordering::SeqCst) && pool.still_tracks(&conn) {
                            pool.persist_connection(conn);
                        }
                        return;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }
        });
    }

    /// Reconnects a held connection with exponential backoff. The delay
    /// doubles per failed attempt, capped at `backoff_base * 2^max_exponent`;
    /// retries continue until the connection reopens, the pool drains, or
    /// the connection is removed from bookkeeping.
    fn persist_connection(self: &Arc<Self>, conn: Arc<Connection>) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut exponent: u32 = 0;
            loop {
                if pool.draining.load(Ordering::SeqCst) || !pool.still_tracks(&conn) {
                    return;
                }
                let capped = exponent.min(pool.options.max_exponent);
                let delay = pool.options.backoff_base * 2u32.saturating_pow(capped);
                tokio::time::sleep(delay).await;
                match conn.reconnect().await {
                    Ok(()) => {
                        tracing::debug!(addr = %pool.server.addr(), "connection reestablished");
                        pool.subscribe_to_connection(conn);
                        pool.refresh_health();
                        pool.emit(PoolEvent::AvailableSize(pool.available_len()));
                        return;
                    }
                    Err(err) => {
                        tracing::warn!(addr = %pool.server.addr(), error = %err,
                            attempt = exponent, "reconnect failed, backing off");
                        exponent = exponent.saturating_add(1);
                    }
                }
            }
        });
    }

    fn spawn_reaper(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        let period = sweep_period(self.options.idle_timeout);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if pool.draining.load(Ordering::SeqCst) {
                    return;
                }
                pool.reap_idle().await;
            }
        });
        if let Some(previous) = self.reaper.lock().unwrap().replace(handle) {
            previous.abort();
        }
    }

    /// Sheds connections beyond `buffer` that have been idle for longer
    /// than the idle timeout, back toward the low-water mark.
    async fn reap_idle(&self) {
        let victims: Vec<Arc<Connection>> = {
            let mut inner = self.inner.lock().unwrap();
            let excess = inner.connections.len().saturating_sub(inner.buffer);
            if excess == 0 {
                return;
            }
            let mut victims = Vec::new();
            let mut index = 0;
            while index < inner.connections.len() && victims.len() < excess {
                let conn = &inner.connections[index];
                let expired = conn.num_queries() == 0
                    && conn
                        .idle_for()
                        .map(|idle| idle >= self.options.idle_timeout)
                        .unwrap_or(false);
                if expired {
                    victims.push(inner.connections.remove(index));
                } else {
                    index += 1;
                }
            }
            victims
        };
        if victims.is_empty() {
            return;
        }
        tracing::debug!(count = victims.len(), "reaping idle connections");
        for conn in &victims {
            let _ = conn.close(false).await;
        }
        self.refresh_health();
        self.emit(PoolEvent::Size(self.len()));
    }
}

fn sweep_period(idle_timeout: Duration) -> Duration {
    (idle_timeout / 2).max(Duration::from_millis(250))
}
