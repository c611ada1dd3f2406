//! Connection pool.
//!
//! This module provides `Client`, a pool of protocol connections bounded by
//! a semaphore. The bound starts at the configured pool size and is replaced
//! on first use by the concurrency the server suggests during startup.
//! `Transaction` pins one pooled connection for the length of a transaction.

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{OnceCell, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::binary::codec::Arguments;
use crate::binary::connection::{Connection, QueryResult};
use crate::binary::protocol::{Capabilities, Cardinality, IoFormat, TransactionState};
use crate::binary::registry::CodecRegistry;
use crate::binary::value::Value;
use crate::config::ClientConfig;
use crate::error::{Error, Result};

// ============================================================================
// Connector
// ============================================================================

/// Opens new connections for the pool.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        config: &ClientConfig,
        registry: Arc<CodecRegistry>,
    ) -> Result<Connection>;
}

/// TCP + TLS connector used by default.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpTlsConnector;

#[async_trait]
impl Connector for TcpTlsConnector {
    async fn connect(
        &self,
        config: &ClientConfig,
        registry: Arc<CodecRegistry>,
    ) -> Result<Connection> {
        Connection::connect(config.clone(), registry).await
    }
}

// ============================================================================
// Claimed connection
// ============================================================================

/// A connection held by one caller; released back to the pool on drop.
struct ClaimedConnection(Arc<Connection>);

impl Deref for ClaimedConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.0
    }
}

impl Drop for ClaimedConnection {
    fn drop(&mut self) {
        self.0.release();
    }
}

// ============================================================================
// Client Inner
// ============================================================================

struct ClientInner {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    registry: Arc<CodecRegistry>,
    /// Live connections by id. Guards only the lookup/create decision.
    connections: Mutex<HashMap<u64, Arc<Connection>>>,
    /// Replaced once during initialization.
    semaphore: RwLock<Arc<Semaphore>>,
    concurrency: AtomicUsize,
    initialized: OnceCell<()>,
    closed: AtomicBool,
}

// ============================================================================
// Client
// ============================================================================

/// A pool of connections to one server.
///
/// Cloning is cheap; clones share the pool.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Pool that connects over TCP + TLS and shares the process-wide codec
    /// registry. No I/O happens until the first query.
    pub fn new(config: ClientConfig) -> Self {
        Self::with_connector(config, Arc::new(TcpTlsConnector), CodecRegistry::global())
    }

    pub fn with_connector(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        registry: Arc<CodecRegistry>,
    ) -> Self {
        let size = config.max_concurrency.unwrap_or(config.pool_size).max(1);
        Self {
            inner: Arc::new(ClientInner {
                config,
                connector,
                registry,
                connections: Mutex::new(HashMap::new()),
                semaphore: RwLock::new(Arc::new(Semaphore::new(size))),
                concurrency: AtomicUsize::new(size),
                initialized: OnceCell::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Connect once and size the pool. Later calls return immediately; a
    /// failed attempt is retried on the next call.
    pub async fn initialize(&self) -> Result<()> {
        self.ensure_open()?;
        self.inner
            .initialized
            .get_or_try_init(|| async {
                let conn = self.create_connection().await?;
                let config = &self.inner.config;
                let size = config
                    .max_concurrency
                    .or_else(|| conn.suggested_pool_concurrency())
                    .unwrap_or(config.pool_size)
                    .max(1);

                let semaphore = Arc::new(Semaphore::new(size));
                if self.is_closed() {
                    semaphore.close();
                }
                *self.inner.semaphore.write() = semaphore;
                self.inner.concurrency.store(size, Ordering::SeqCst);
                info!(
                    concurrency = size,
                    suggested = ?conn.suggested_pool_concurrency(),
                    "Client pool sized"
                );

                self.register(conn);
                Ok::<(), Error>(())
            })
            .await?;
        Ok(())
    }

    /// Run `query` on a pooled connection.
    ///
    /// Waits for a pool slot when every slot is busy.
    pub async fn query(
        &self,
        query: &str,
        args: &Arguments,
        cardinality: Cardinality,
    ) -> Result<QueryResult> {
        self.query_with(query, args, cardinality, IoFormat::Binary)
            .await
    }

    /// Run `query` with an explicit output format.
    pub async fn query_with(
        &self,
        query: &str,
        args: &Arguments,
        cardinality: Cardinality,
        io_format: IoFormat,
    ) -> Result<QueryResult> {
        let (_permit, conn) = self
            .checkout()
            .await
            .map_err(|e| e.into_execution(query))?;

        let started = Instant::now();
        let result = conn
            .execute_with(
                query,
                args,
                cardinality,
                io_format,
                self.inner.config.allowed_capabilities,
            )
            .await;
        debug!(
            connection_id = conn.id(),
            query,
            ok = result.is_ok(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Execution finished"
        );
        result
    }

    /// All rows of `query`.
    pub async fn query_many(&self, query: &str, args: &Arguments) -> Result<Vec<Value>> {
        Ok(self.query(query, args, Cardinality::Many).await?.into_vec())
    }

    /// At most one row of `query`.
    pub async fn query_single(&self, query: &str, args: &Arguments) -> Result<Option<Value>> {
        Ok(self
            .query(query, args, Cardinality::AtMostOne)
            .await?
            .into_single())
    }

    /// Exactly one row of `query`; no rows is an error.
    pub async fn query_required_single(&self, query: &str, args: &Arguments) -> Result<Value> {
        required(self.query(query, args, Cardinality::One).await?, query)
    }

    /// Run a command whose result is discarded.
    pub async fn execute(&self, query: &str, args: &Arguments) -> Result<()> {
        self.query(query, args, Cardinality::NoResult).await?;
        Ok(())
    }

    /// The whole result as one JSON array.
    pub async fn query_json(&self, query: &str, args: &Arguments) -> Result<String> {
        let result = self
            .query_with(query, args, Cardinality::Many, IoFormat::Json)
            .await?;
        json_document(result).map_err(|e| e.into_execution(query))
    }

    /// Each result element as its own JSON document.
    pub async fn query_json_elements(&self, query: &str, args: &Arguments) -> Result<Vec<String>> {
        let result = self
            .query_with(query, args, Cardinality::Many, IoFormat::JsonElements)
            .await?;
        json_elements(result).map_err(|e| e.into_execution(query))
    }

    /// Start a transaction on a dedicated connection.
    ///
    /// The connection and its pool slot stay with the returned
    /// [`Transaction`] until it is committed, rolled back or dropped. A
    /// dropped transaction is rolled back before the connection is reused.
    pub async fn transaction(&self, settings: TransactionSettings) -> Result<Transaction> {
        let statement = settings.start_statement();
        let (permit, conn) = self
            .checkout()
            .await
            .map_err(|e| e.into_execution(&statement))?;

        conn.execute_with(
            &statement,
            &Arguments::new(),
            Cardinality::NoResult,
            IoFormat::Binary,
            self.inner.config.allowed_capabilities | Capabilities::TRANSACTION,
        )
        .await?;
        debug!(connection_id = conn.id(), ?settings, "Transaction started");

        Ok(Transaction {
            conn: Some(conn),
            capabilities: self.inner.config.allowed_capabilities,
            _permit: permit,
        })
    }

    /// Stop handing out slots and disconnect every pooled connection.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.semaphore.read().close();
        let connections: Vec<_> = {
            let mut connections = self.inner.connections.lock();
            connections.drain().map(|(_, conn)| conn).collect()
        };
        for conn in connections {
            conn.disconnect().await;
        }
        info!("Client closed");
    }

    /// Current concurrency bound.
    pub fn concurrency(&self) -> usize {
        self.inner.concurrency.load(Ordering::SeqCst)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().len()
    }

    pub fn registry(&self) -> &Arc<CodecRegistry> {
        &self.inner.registry
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Connection("client is closed".into()));
        }
        Ok(())
    }

    /// Initialize, then take a pool slot and a connection for it.
    async fn checkout(&self) -> Result<(OwnedSemaphorePermit, ClaimedConnection)> {
        self.initialize().await?;

        let semaphore = Arc::clone(&*self.inner.semaphore.read());
        let permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| Error::Connection("client is closed".into()))?;

        let conn = self.acquire().await?;
        Ok((permit, conn))
    }

    /// First idle connection, or a new one when all are busy.
    async fn acquire(&self) -> Result<ClaimedConnection> {
        let idle = {
            let connections = self.inner.connections.lock();
            connections
                .values()
                .find(|c| c.try_claim())
                .map(|conn| ClaimedConnection(Arc::clone(conn)))
        };
        if let Some(conn) = idle {
            self.reset(&conn).await?;
            return Ok(conn);
        }

        // Connect I/O happens outside the lock
        let conn = self.create_connection().await?;
        if !conn.try_claim() {
            return Err(Error::Connection("new connection closed before use".into()));
        }
        let claimed = ClaimedConnection(Arc::clone(&conn));
        self.register(conn);
        Ok(claimed)
    }

    /// Roll back a transaction left open by a dropped [`Transaction`].
    /// A connection that cannot be reset is closed.
    async fn reset(&self, conn: &Connection) -> Result<()> {
        if conn.transaction_state() == TransactionState::NotInTransaction {
            return Ok(());
        }

        warn!(connection_id = conn.id(), "Rolling back abandoned transaction");
        let rollback = conn
            .execute_with(
                "rollback",
                &Arguments::new(),
                Cardinality::NoResult,
                IoFormat::Binary,
                self.inner.config.allowed_capabilities | Capabilities::TRANSACTION,
            )
            .await;
        if let Err(e) = rollback {
            conn.disconnect().await;
            return Err(e);
        }
        Ok(())
    }

    /// Open a connection, retrying transient failures with a linear backoff.
    async fn create_connection(&self) -> Result<Arc<Connection>> {
        let config = &self.inner.config;
        let mut attempt = 0u32;
        loop {
            match self
                .inner
                .connector
                .connect(config, Arc::clone(&self.inner.registry))
                .await
            {
                Ok(conn) => {
                    debug!(connection_id = conn.id(), attempt, "Opened pool connection");
                    return Ok(Arc::new(conn));
                }
                Err(e) if e.should_reconnect() && attempt < config.max_connection_retries => {
                    attempt += 1;
                    warn!(
                        attempt,
                        max_retries = config.max_connection_retries,
                        error = %e,
                        "Connection attempt failed, retrying"
                    );
                    tokio::time::sleep(config.retry_delay * attempt).await;
                }
                Err(e) => {
                    if attempt > 0 {
                        warn!(attempts = attempt + 1, error = %e, "Giving up on connection");
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Index `conn` and drop it from the index when it disconnects.
    fn register(&self, conn: Arc<Connection>) {
        self.inner
            .connections
            .lock()
            .insert(conn.id(), Arc::clone(&conn));

        let pool = Arc::downgrade(&self.inner);
        conn.on_disconnect(move |id| {
            if let Some(inner) = pool.upgrade() {
                inner.connections.lock().remove(&id);
                debug!(connection_id = id, "Removed connection from pool");
            }
        });
    }
}

// ============================================================================
// Result shaping
// ============================================================================

fn json_text(value: Value) -> Result<String> {
    match value {
        Value::Str(text) => Ok(text),
        other => Err(Error::Type(format!(
            "expected JSON text, got {}",
            other.kind_name()
        ))),
    }
}

/// A JSON-format result is one document; no rows is an empty array.
fn json_document(result: QueryResult) -> Result<String> {
    let mut rows = result.into_vec();
    match rows.len() {
        0 => Ok("[]".to_string()),
        1 => json_text(rows.remove(0)),
        n => Err(Error::Protocol(format!("JSON query returned {} documents", n))),
    }
}

fn json_elements(result: QueryResult) -> Result<Vec<String>> {
    result.into_vec().into_iter().map(json_text).collect()
}

fn required(result: QueryResult, query: &str) -> Result<Value> {
    result
        .into_single()
        .ok_or_else(|| Error::Protocol("query returned no rows".into()).into_execution(query))
}

// ============================================================================
// Transaction
// ============================================================================

/// Isolation level of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Isolation {
    #[default]
    Serializable,
    RepeatableRead,
}

/// How a transaction is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransactionSettings {
    pub isolation: Isolation,
    /// Data and schema modifications are rejected.
    pub read_only: bool,
    /// Only meaningful for serializable read-only transactions.
    pub deferrable: bool,
}

impl TransactionSettings {
    pub fn isolation(mut self, isolation: Isolation) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn deferrable(mut self, deferrable: bool) -> Self {
        self.deferrable = deferrable;
        self
    }

    fn start_statement(&self) -> String {
        let isolation = match self.isolation {
            Isolation::Serializable => "serializable",
            Isolation::RepeatableRead => "repeatable read",
        };
        let access = if self.read_only { "read only" } else { "read write" };
        let deferrable = if self.deferrable { "deferrable" } else { "not deferrable" };
        format!(
            "start transaction isolation {}, {}, {};",
            isolation, access, deferrable
        )
    }
}

/// An open transaction on one pooled connection.
///
/// Queries run on the transaction's connection only. After a server error
/// the transaction is failed and only [`Transaction::rollback`] is useful.
pub struct Transaction {
    conn: Option<ClaimedConnection>,
    capabilities: Capabilities,
    _permit: OwnedSemaphorePermit,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("connection_id", &self.conn.as_ref().map(|c| c.id()))
            .field("state", &self.state())
            .finish()
    }
}

impl Transaction {
    /// Server-reported state; `NotInTransaction` once finished.
    pub fn state(&self) -> TransactionState {
        self.conn
            .as_ref()
            .map(|c| c.transaction_state())
            .unwrap_or(TransactionState::NotInTransaction)
    }

    fn connection(&self) -> Result<&Connection> {
        let conn = self
            .conn
            .as_ref()
            .ok_or_else(|| Error::Transaction("this transaction no longer exists".into()))?;
        match conn.transaction_state() {
            TransactionState::InTransaction => Ok(conn),
            TransactionState::InFailedTransaction => {
                Err(Error::Transaction("this transaction has failed".into()))
            }
            TransactionState::NotInTransaction => {
                Err(Error::Transaction("this transaction no longer exists".into()))
            }
        }
    }

    pub async fn query(
        &self,
        query: &str,
        args: &Arguments,
        cardinality: Cardinality,
    ) -> Result<QueryResult> {
        self.query_with(query, args, cardinality, IoFormat::Binary)
            .await
    }

    pub async fn query_with(
        &self,
        query: &str,
        args: &Arguments,
        cardinality: Cardinality,
        io_format: IoFormat,
    ) -> Result<QueryResult> {
        let conn = self.connection().map_err(|e| e.into_execution(query))?;
        conn.execute_with(query, args, cardinality, io_format, self.capabilities)
            .await
    }

    pub async fn query_many(&self, query: &str, args: &Arguments) -> Result<Vec<Value>> {
        Ok(self.query(query, args, Cardinality::Many).await?.into_vec())
    }

    pub async fn query_single(&self, query: &str, args: &Arguments) -> Result<Option<Value>> {
        Ok(self
            .query(query, args, Cardinality::AtMostOne)
            .await?
            .into_single())
    }

    pub async fn query_required_single(&self, query: &str, args: &Arguments) -> Result<Value> {
        required(self.query(query, args, Cardinality::One).await?, query)
    }

    pub async fn execute(&self, query: &str, args: &Arguments) -> Result<()> {
        self.query(query, args, Cardinality::NoResult).await?;
        Ok(())
    }

    pub async fn query_json(&self, query: &str, args: &Arguments) -> Result<String> {
        let result = self
            .query_with(query, args, Cardinality::Many, IoFormat::Json)
            .await?;
        json_document(result).map_err(|e| e.into_execution(query))
    }

    pub async fn query_json_elements(&self, query: &str, args: &Arguments) -> Result<Vec<String>> {
        let result = self
            .query_with(query, args, Cardinality::Many, IoFormat::JsonElements)
            .await?;
        json_elements(result).map_err(|e| e.into_execution(query))
    }

    /// Commit and give the connection back to the pool.
    pub async fn commit(mut self) -> Result<()> {
        self.finish("commit").await
    }

    /// Roll back and give the connection back to the pool. Also valid for a
    /// failed transaction.
    pub async fn rollback(mut self) -> Result<()> {
        self.finish("rollback").await
    }

    async fn finish(&mut self, statement: &str) -> Result<()> {
        let conn = self
            .conn
            .take()
            .ok_or_else(|| Error::Transaction("this transaction no longer exists".into()))?;
        let result = conn
            .execute_with(
                statement,
                &Arguments::new(),
                Cardinality::NoResult,
                IoFormat::Binary,
                self.capabilities | Capabilities::TRANSACTION,
            )
            .await;
        debug!(connection_id = conn.id(), statement, ok = result.is_ok(), "Transaction finished");
        result.map(|_| ())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if let Some(conn) = &self.conn {
            if conn.transaction_state() != TransactionState::NotInTransaction {
                debug!(connection_id = conn.id(), "Transaction dropped while open");
            }
        }
    }
}
