//! Cursor: presents one query's (possibly multi-batch) results as a
//! pull sequence with demand-driven continuation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::timeout;

use crate::connection::socket::{ReqlSocket, SocketEvent};
use crate::error::{DriverError, Result};
use crate::proto::{Response, ResponseType};
use crate::types::{self, FormatOptions};

/// Bound on how long `close` waits for the server to acknowledge a STOP.
const STOP_ACK_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Cursor {
    socket: Arc<ReqlSocket>,
    token: u64,
    format: FormatOptions,
    /// Per-fetch timeout; a fetch that exceeds it abandons only this token.
    timeout: Option<Duration>,
    /// Originating term, attached to server-reported query errors.
    term: Option<Value>,
    results: Option<Vec<Value>>,
    position: usize,
    has_next: bool,
    profile: Option<Value>,
    response_type: Option<ResponseType>,
}

impl Cursor {
    pub(crate) fn new(
        socket: Arc<ReqlSocket>,
        token: u64,
        format: FormatOptions,
        fetch_timeout: Option<Duration>,
        term: Option<Value>,
    ) -> Self {
        Cursor {
            socket,
            token,
            format,
            timeout: fetch_timeout,
            term,
            results: None,
            position: 0,
            has_next: false,
            profile: None,
            response_type: None,
        }
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    /// Returns the next item, or `None` at end of sequence. Fetches the
    /// first batch lazily; once the current batch is exhausted and the
    /// last response was partial, pulls the next batch before yielding.
    pub async fn next(&mut self) -> Result<Option<Value>> {
        if self.results.is_none() {
            self.resolve().await?;
        } else if self.has_next && self.position >= self.batch_len() {
            self.resolve().await?;
        }

        // Profile data is attached only to the terminal response, so a
        // profiled run yields one combined value and then ends.
        if let Some(profile) = self.profile.take() {
            let results = self.results.replace(Vec::new()).unwrap_or_default();
            self.position = 0;
            self.has_next = false;
            let result = if self.response_type == Some(ResponseType::SuccessAtom) {
                results.into_iter().next().unwrap_or(Value::Null)
            } else {
                Value::Array(results)
            };
            return Ok(Some(json!({ "profile": profile, "result": result })));
        }

        match &self.results {
            Some(batch) if self.position < batch.len() => {
                let item = batch[self.position].clone();
                self.position += 1;
                Ok(Some(item))
            }
            _ => Ok(None),
        }
    }

    /// Exhaustively pulls all batches into one ordered sequence,
    /// consuming the cursor.
    pub async fn to_array(mut self) -> Result<Vec<Value>> {
        let mut all = Vec::new();
        while let Some(item) = self.next().await? {
            all.push(item);
        }
        Ok(all)
    }

    /// Pulls items and invokes the handler sequentially in arrival
    /// order. A handler error aborts the loop and propagates.
    pub async fn each_async<F, Fut>(mut self, mut handler: F) -> Result<()>
    where
        F: FnMut(Value) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        while let Some(item) = self.next().await? {
            handler(item).await?;
        }
        Ok(())
    }

    /// Issues STOP for the cursor's token and awaits the server's
    /// acknowledgement frame when a batch is still outstanding.
    ///
    /// Dropping a cursor instead only abandons its client-side
    /// bookkeeping; the server is not told to stop producing.
    pub async fn close(&mut self) -> Result<()> {
        if !self.socket.is_open() {
            return Ok(());
        }
        let awaiting_ack = self.has_next;
        let mut events = self.socket.subscribe();
        self.socket.stop_query(self.token).await?;
        self.has_next = false;
        if !awaiting_ack {
            return Ok(());
        }
        let token = self.token;
        // best effort: a dead socket or slow server must not wedge close
        let _ = timeout(STOP_ACK_TIMEOUT, async {
            loop {
                match events.recv().await {
                    Ok(SocketEvent::Data { token: t, .. }) if t == token => break,
                    Ok(_) => continue,
                    Err(_) => break,
                }
            }
        })
        .await;
        Ok(())
    }

    /// Performs exactly one fetch round-trip and classifies the response.
    pub async fn resolve(&mut self) -> Result<ResponseType> {
        let raw = self.fetch().await?;
        let response: Response = serde_json::from_value(raw)?;
        let response_type = response.response_type()?;
        match response_type {
            ResponseType::ClientError
            | ResponseType::CompileError
            | ResponseType::RuntimeError => {
                let message = response
                    .r
                    .first()
                    .and_then(Value::as_str)
                    .unwrap_or("query failed")
                    .to_string();
                return Err(DriverError::Query {
                    message,
                    term: self.term.clone(),
                    backtrace: response.b,
                });
            }
            ResponseType::SuccessAtom
            | ResponseType::SuccessPartial
            | ResponseType::SuccessSequence => {
                self.has_next = response_type == ResponseType::SuccessPartial;
                self.profile = response.p;
                self.results = Some(types::native_types(response.r, &self.format)?);
                self.position = 0;
            }
            other => {
                return Err(DriverError::protocol(format!(
                    "unexpected response type for a cursor: {:?}",
                    other
                )))
            }
        }
        self.response_type = Some(response_type);
        Ok(response_type)
    }

    async fn fetch(&self) -> Result<Value> {
        match self.timeout {
            Some(limit) => match timeout(limit, self.socket.read_next(self.token)).await {
                Ok(result) => result,
                Err(_) => {
                    self.socket.abandon(self.token);
                    Err(DriverError::Timeout)
                }
            },
            None => self.socket.read_next(self.token).await,
        }
    }

    fn batch_len(&self) -> usize {
        self.results.as_ref().map(Vec::len).unwrap_or(0)
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        // a stream that was never read to completion still holds a
        // token registration; clear it so the map cannot grow unbounded
        if self.has_next || self.results.is_none() {
            self.socket.abandon(self.token);
        }
    }
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("token", &self.token)
            .field("position", &self.position)
            .field("has_next", &self.has_next)
            .field("response_type", &self.response_type)
            .finish()
    }
}
