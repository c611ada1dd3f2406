//! A single protocol connection.
//!
//! A background task owns the read half of the socket, decodes every frame,
//! applies connection-level state (server key, server config, concurrency
//! hint) and broadcasts the message to subscribers. Request paths own the
//! write half and correlate replies through subscriptions.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::codec::Arguments;
use super::dispatch::{Dispatcher, Subscription};
use super::packet::PacketReader;
use super::protocol::{
    Authentication, Capabilities, Cardinality, ClientHandshake, ClientMessage, DescribeStatement,
    ErrorResponse, Execute, IoFormat, MessageKind, MessageSeverity, Prepare, SaslInitialResponse,
    SaslResponse, ServerMessage, Sync, Terminate, TransactionState, PROTOCOL_MAJOR,
};
use super::registry::{query_hash, CodecRegistry};
use super::scram::{ScramClient, ScramFinal, SCRAM_SHA_256};
use super::tls;
use super::value::Value;
use crate::config::ClientConfig;
use crate::error::{Error, Result};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

type BoxedWriter = BufWriter<Box<dyn AsyncWrite + Send + Unpin>>;
type DisconnectCallback = Box<dyn FnOnce(u64) + Send>;

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Authenticating,
    Ready,
    Busy,
}

// ============================================================================
// Query Result
// ============================================================================

/// Rows of one execution, shaped by the requested cardinality.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    /// No rows.
    None,
    /// Exactly one row under `AtMostOne` or `One`.
    Single(Value),
    /// Rows in receive order.
    Many(Vec<Value>),
}

impl QueryResult {
    fn from_rows(mut rows: Vec<Value>, cardinality: Cardinality) -> Result<Self> {
        match rows.len() {
            0 => Ok(QueryResult::None),
            1 if cardinality.is_single() => Ok(QueryResult::Single(rows.remove(0))),
            n if cardinality.is_single() => Err(Error::Protocol(format!(
                "{:?} query returned {} rows",
                cardinality, n
            ))),
            _ => Ok(QueryResult::Many(rows)),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, QueryResult::None)
    }

    /// All rows as a vector; a single value becomes a one-element vector.
    pub fn into_vec(self) -> Vec<Value> {
        match self {
            QueryResult::None => Vec::new(),
            QueryResult::Single(v) => vec![v],
            QueryResult::Many(rows) => rows,
        }
    }

    /// The single value, if any. Multiple rows yield `None`.
    pub fn into_single(self) -> Option<Value> {
        match self {
            QueryResult::Single(v) => Some(v),
            _ => None,
        }
    }
}

// ============================================================================
// Shared state
// ============================================================================

/// State touched by both the receive loop and request paths.
struct Shared {
    id: u64,
    state: Mutex<ConnectionState>,
    server_key: Mutex<Option<[u8; 32]>>,
    /// 0 until the server sends a hint.
    suggested_pool_concurrency: AtomicUsize,
    server_config: RwLock<HashMap<String, Value>>,
    transaction_state: Mutex<TransactionState>,
    /// Syncs sent whose `ReadyForCommand` has not arrived yet.
    pending_syncs: AtomicUsize,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
    closed: AtomicBool,
    on_disconnect: Mutex<Vec<DisconnectCallback>>,
    registry: Arc<CodecRegistry>,
}

impl Shared {
    fn new(id: u64, registry: Arc<CodecRegistry>) -> Self {
        Self {
            id,
            state: Mutex::new(ConnectionState::Connecting),
            server_key: Mutex::new(None),
            suggested_pool_concurrency: AtomicUsize::new(0),
            server_config: RwLock::new(HashMap::new()),
            transaction_state: Mutex::new(TransactionState::NotInTransaction),
            pending_syncs: AtomicUsize::new(0),
            dispatcher: Dispatcher::new(),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            on_disconnect: Mutex::new(Vec::new()),
            registry,
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.lock();
        if *current != ConnectionState::Disconnected {
            *current = state;
        }
    }

    /// Tear down once: cancel waiters, drop subscribers, fire callbacks.
    fn mark_disconnected(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.state.lock() = ConnectionState::Disconnected;
        self.cancel.cancel();
        self.dispatcher.close();

        let callbacks = std::mem::take(&mut *self.on_disconnect.lock());
        for callback in callbacks {
            callback(self.id);
        }
        info!(connection_id = self.id, "Connection closed");
    }

    /// Update connection state from a message before it is broadcast.
    fn apply(&self, message: &ServerMessage) {
        match message {
            ServerMessage::ServerKeyData { data } => {
                *self.server_key.lock() = Some(*data);
            }
            ServerMessage::ParameterStatus { name, value } => match name.as_str() {
                "suggested_pool_concurrency" => {
                    match std::str::from_utf8(value)
                        .ok()
                        .and_then(|s| s.trim().parse::<usize>().ok())
                    {
                        Some(n) if n > 0 => {
                            debug!(connection_id = self.id, concurrency = n, "Server suggested pool concurrency");
                            self.suggested_pool_concurrency.store(n, Ordering::SeqCst);
                        }
                        _ => warn!(connection_id = self.id, "Invalid suggested_pool_concurrency"),
                    }
                }
                "system_config" => match parse_system_config(&self.registry, value.clone()) {
                    Ok(config) => self.server_config.write().extend(config),
                    Err(e) => warn!(connection_id = self.id, error = %e, "Failed to decode system_config"),
                },
                other => debug!(connection_id = self.id, name = other, "Ignoring parameter status"),
            },
            ServerMessage::ReadyForCommand {
                transaction_state, ..
            } => {
                *self.transaction_state.lock() = *transaction_state;
                let _ = self.pending_syncs.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    n.checked_sub(1)
                });
            }
            ServerMessage::LogMessage(log) => match log.severity {
                MessageSeverity::Debug => debug!(code = log.code, "server: {}", log.text),
                MessageSeverity::Warning => warn!(code = log.code, "server: {}", log.text),
                _ => info!(code = log.code, "server: {}", log.text),
            },
            ServerMessage::ErrorResponse(e) => {
                warn!(
                    connection_id = self.id,
                    severity = %e.severity,
                    code = e.code,
                    message = %e.message,
                    "Server error"
                );
            }
            ServerMessage::Unknown { tag, body } => {
                warn!(
                    connection_id = self.id,
                    tag = %(*tag as char),
                    len = body.len(),
                    "Skipping unknown message"
                );
            }
            _ => {}
        }
    }
}

/// Decode a `system_config` parameter: a typed descriptor followed by data.
fn parse_system_config(registry: &CodecRegistry, value: Bytes) -> Result<HashMap<String, Value>> {
    let mut r = PacketReader::new(value);
    let typedesc_len = r.read_u32()? as usize;
    let typedesc_len = typedesc_len
        .checked_sub(16)
        .ok_or_else(|| Error::Protocol("system_config descriptor too short".into()))?;
    let id = r.read_uuid()?;
    let descriptor = r.read_exact(typedesc_len)?;
    let data = r.read_bytes()?;

    let codec = registry.build_codec(id, descriptor)?;
    match codec.decode(&mut PacketReader::new(data))? {
        Value::Object(fields) | Value::NamedTuple(fields) => Ok(fields.into_iter().collect()),
        other => Err(Error::Protocol(format!(
            "system_config decoded to {}",
            other.kind_name()
        ))),
    }
}

// ============================================================================
// Frame reader
// ============================================================================

struct FrameReader<R> {
    reader: R,
    read_buffer: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            read_buffer: BytesMut::with_capacity(32768),
        }
    }

    /// Next `(tag, body)`; `None` on a clean end of stream.
    async fn next_frame(&mut self) -> Result<Option<(u8, Bytes)>> {
        loop {
            if self.read_buffer.len() >= 5 {
                let tag = self.read_buffer[0];
                let length = u32::from_be_bytes([
                    self.read_buffer[1],
                    self.read_buffer[2],
                    self.read_buffer[3],
                    self.read_buffer[4],
                ]) as usize;
                if length < 4 {
                    return Err(Error::Protocol(format!(
                        "Invalid length {} for message '{}'",
                        length, tag as char
                    )));
                }

                // Length counts itself but not the tag byte
                let total_len = 1 + length;
                if self.read_buffer.len() >= total_len {
                    let mut frame = self.read_buffer.split_to(total_len);
                    frame.advance(5);
                    return Ok(Some((tag, frame.freeze())));
                }
                self.read_buffer.reserve(total_len - self.read_buffer.len());
            }

            let n = self.reader.read_buf(&mut self.read_buffer).await?;
            if n == 0 {
                if self.read_buffer.is_empty() {
                    return Ok(None);
                }
                return Err(Error::Connection(
                    "server closed the connection mid-message".into(),
                ));
            }
        }
    }
}

async fn receive_loop<R>(reader: R, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin,
{
    let mut frames = FrameReader::new(reader);
    loop {
        let frame = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            frame = frames.next_frame() => frame,
        };

        match frame {
            Ok(Some((tag, body))) => match ServerMessage::decode(tag, body) {
                Ok(message) => {
                    shared.apply(&message);
                    shared.dispatcher.broadcast(&message);
                }
                Err(e) => {
                    error!(connection_id = shared.id, tag = %(tag as char), error = %e, "Malformed server message");
                    break;
                }
            },
            Ok(None) => {
                debug!(connection_id = shared.id, "Server closed the connection");
                break;
            }
            Err(e) => {
                warn!(connection_id = shared.id, error = %e, "Receive failed");
                break;
            }
        }
    }
    shared.mark_disconnected();
}

// ============================================================================
// Connection
// ============================================================================

/// One authenticated protocol connection.
pub struct Connection {
    shared: Arc<Shared>,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    /// Serializes prepare/execute cycles.
    exec_lock: tokio::sync::Mutex<()>,
    /// Set while a pool caller holds this connection.
    claimed: AtomicBool,
    config: ClientConfig,
    receive_task: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    /// Open a TCP connection, wrap it in TLS and run the startup handshake.
    pub async fn connect(config: ClientConfig, registry: Arc<CodecRegistry>) -> Result<Self> {
        let addr = config.params.address();
        let host = config.params.host.clone();
        let connect_timeout = config.connect_timeout;
        debug!(%addr, "Connecting");

        let tcp = tokio::time::timeout(connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::Timeout(format!("TCP connect to {} after {:?}", addr, connect_timeout)))?
            .map_err(|e| Error::Connection(format!("Failed to connect to {}: {}", addr, e)))?;
        tcp.set_nodelay(true)?;

        let tls_config =
            tls::client_config(config.params.tls_ca.as_deref(), config.params.tls_security)?;
        let stream = tokio::time::timeout(connect_timeout, tls::connect(tcp, &host, tls_config))
            .await
            .map_err(|_| Error::Timeout(format!("TLS handshake with {} after {:?}", addr, connect_timeout)))??;

        Self::connect_stream(stream, config, registry).await
    }

    /// Run the startup handshake over an already established stream.
    pub async fn connect_stream<S>(
        stream: S,
        config: ClientConfig,
        registry: Arc<CodecRegistry>,
    ) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let (read_half, write_half) = tokio::io::split(stream);
        let shared = Arc::new(Shared::new(id, registry));
        let writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(write_half);

        let conn = Self {
            shared: Arc::clone(&shared),
            writer: tokio::sync::Mutex::new(Some(BufWriter::new(writer))),
            exec_lock: tokio::sync::Mutex::new(()),
            claimed: AtomicBool::new(false),
            config,
            receive_task: Mutex::new(None),
        };

        // Subscribe before the loop starts so nothing is missed
        let mut startup = shared.dispatcher.subscribe(&[
            MessageKind::ServerHandshake,
            MessageKind::Authentication,
            MessageKind::ErrorResponse,
            MessageKind::ReadyForCommand,
        ]);
        let handle = tokio::spawn(receive_loop(read_half, Arc::clone(&shared)));
        *conn.receive_task.lock() = Some(handle);

        shared.set_state(ConnectionState::Handshaking);
        match conn.startup(&mut startup).await {
            Ok(()) => {
                shared.set_state(ConnectionState::Ready);
                info!(connection_id = id, "Connection ready");
                Ok(conn)
            }
            Err(e) => {
                debug!(connection_id = id, error = %e, "Startup failed");
                conn.disconnect().await;
                Err(e)
            }
        }
    }

    async fn startup(&self, sub: &mut Subscription) -> Result<()> {
        let params = &self.config.params;
        let timeout = self.config.message_timeout;
        self.send(&[&ClientHandshake::new(&params.user, &params.database)])
            .await?;

        let mut scram: Option<ScramClient> = None;
        let mut scram_final: Option<ScramFinal> = None;
        let mut verified = false;

        loop {
            let message = sub
                .next(timeout, &self.shared.cancel, "ReadyForCommand")
                .await?;

            match message {
                ServerMessage::ServerHandshake {
                    major_ver,
                    minor_ver,
                    ..
                } => {
                    if major_ver != PROTOCOL_MAJOR {
                        return Err(Error::Protocol(format!(
                            "Server proposed unsupported protocol version {}.{}",
                            major_ver, minor_ver
                        )));
                    }
                    debug!(major_ver, minor_ver, "Server negotiated protocol version");
                }
                ServerMessage::Authentication(Authentication::Sasl { methods }) => {
                    self.shared.set_state(ConnectionState::Authenticating);
                    let mechanism = methods
                        .iter()
                        .find(|m| m.as_str() == SCRAM_SHA_256)
                        .or_else(|| methods.first())
                        .map(String::as_str)
                        .unwrap_or_default();

                    let client = ScramClient::new(&params.user);
                    let first = client.initial_message(mechanism)?;
                    self.send(&[&SaslInitialResponse {
                        mechanism: mechanism.to_string(),
                        data: Bytes::from(first),
                    }])
                    .await?;
                    scram = Some(client);
                }
                ServerMessage::Authentication(Authentication::SaslContinue { data }) => {
                    let client = scram.as_ref().ok_or_else(|| {
                        Error::Protocol("SASL continue without SASL start".into())
                    })?;
                    let password = params.password.as_deref().ok_or_else(|| {
                        Error::Authentication("Password required".into())
                    })?;
                    let fin = client.final_message(&data, password)?;
                    self.send(&[&SaslResponse {
                        data: Bytes::from(fin.message.clone()),
                    }])
                    .await?;
                    scram_final = Some(fin);
                }
                ServerMessage::Authentication(Authentication::SaslFinal { data }) => {
                    let fin = scram_final.as_ref().ok_or_else(|| {
                        Error::Protocol("SASL final before client final message".into())
                    })?;
                    if let Err(e) = fin.verify(&data) {
                        error!(connection_id = self.shared.id, "Server signature mismatch");
                        return Err(e.into());
                    }
                    verified = true;
                }
                ServerMessage::Authentication(Authentication::Ok) => {
                    if scram.is_some() && !verified {
                        return Err(Error::Authentication(
                            "Server skipped SASL final verification".into(),
                        ));
                    }
                    debug!(connection_id = self.shared.id, "Authenticated");
                }
                ServerMessage::ErrorResponse(e) => return Err(e.into()),
                ServerMessage::ReadyForCommand { .. } => return Ok(()),
                _ => {}
            }
        }
    }

    /// Run one prepare/describe/execute cycle with binary output and the
    /// configured capabilities.
    ///
    /// Cycles on one connection never interleave. Server errors come back as
    /// [`Error::Database`], expired waits as [`Error::Timeout`], an input
    /// type that cannot take arguments as [`Error::MissingCodec`]; anything
    /// else is wrapped in [`Error::Execution`].
    pub async fn execute(
        &self,
        query: &str,
        args: &Arguments,
        cardinality: Cardinality,
    ) -> Result<QueryResult> {
        self.execute_with(
            query,
            args,
            cardinality,
            IoFormat::Binary,
            self.config.allowed_capabilities,
        )
        .await
    }

    /// Like [`Connection::execute`] with an explicit output format and
    /// capability set. JSON formats yield `str` rows.
    pub async fn execute_with(
        &self,
        query: &str,
        args: &Arguments,
        cardinality: Cardinality,
        io_format: IoFormat,
        capabilities: Capabilities,
    ) -> Result<QueryResult> {
        let _guard = self.exec_lock.lock().await;
        if self.is_closed() {
            return Err(Error::Connection("connection is closed".into()).into_execution(query));
        }

        self.shared.set_state(ConnectionState::Busy);
        let started = Instant::now();
        let result = match self.resync().await {
            Ok(()) => {
                self.execute_cycle(query, args, cardinality, io_format, capabilities)
                    .await
            }
            Err(e) => Err(e),
        };
        self.shared.set_state(ConnectionState::Ready);

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => debug!(connection_id = self.shared.id, query, elapsed_ms, "Query executed"),
            Err(e) => debug!(connection_id = self.shared.id, query, elapsed_ms, error = %e, "Query failed"),
        }
        result.map_err(|e| e.into_execution(query))
    }

    /// Consume the replies of exchanges abandoned by a timeout, so they are
    /// never mistaken for replies to the next cycle.
    async fn resync(&self) -> Result<()> {
        let mut sub = self
            .shared
            .dispatcher
            .subscribe(&[MessageKind::ReadyForCommand]);
        let outstanding = self.shared.pending_syncs.load(Ordering::SeqCst);
        if outstanding == 0 {
            return Ok(());
        }

        debug!(connection_id = self.shared.id, outstanding, "Draining abandoned exchange");
        while self.shared.pending_syncs.load(Ordering::SeqCst) > 0 {
            sub.next(self.config.message_timeout, &self.shared.cancel, "ReadyForCommand")
                .await?;
        }
        Ok(())
    }

    async fn execute_cycle(
        &self,
        query: &str,
        args: &Arguments,
        cardinality: Cardinality,
        io_format: IoFormat,
        capabilities: Capabilities,
    ) -> Result<QueryResult> {
        let timeout = self.config.message_timeout;
        let cancel = &self.shared.cancel;
        let registry = &self.shared.registry;
        let mut sub = self.shared.dispatcher.subscribe(&[
            MessageKind::PrepareComplete,
            MessageKind::CommandDataDescription,
            MessageKind::Data,
            MessageKind::CommandComplete,
            MessageKind::ErrorResponse,
            MessageKind::ReadyForCommand,
        ]);

        // Prepare
        let mut prepare =
            Prepare::new(query, io_format, cardinality).allow_capabilities(capabilities);
        if let Some(limit) = self.config.implicit_limit {
            prepare = prepare.implicit_limit(limit);
        }
        self.send(&[&prepare, &Sync]).await?;

        let prepared = loop {
            match sub.next(timeout, cancel, "PrepareComplete").await? {
                ServerMessage::PrepareComplete(p) => break p,
                ServerMessage::ErrorResponse(e) => return Err(self.fail(&mut sub, e).await),
                _ => {}
            }
        };
        self.wait_ready(&mut sub).await?;

        // Codecs: query cache, then codec cache, then describe
        let key = query_hash(query, cardinality, io_format);
        let cached = registry
            .query_codecs(key)
            .filter(|(input, output)| {
                input.id == prepared.input_typedesc_id && output.id == prepared.output_typedesc_id
            })
            .or_else(|| {
                Some((
                    registry.get_codec(&prepared.input_typedesc_id)?,
                    registry.get_codec(&prepared.output_typedesc_id)?,
                ))
            });

        let (input, output) = match cached {
            Some(codecs) => codecs,
            None => {
                debug!(connection_id = self.shared.id, query, "Describing statement");
                self.send(&[&DescribeStatement::default(), &Sync]).await?;
                let described = loop {
                    match sub.next(timeout, cancel, "CommandDataDescription").await? {
                        ServerMessage::CommandDataDescription(d) => break d,
                        ServerMessage::ErrorResponse(e) => {
                            return Err(self.fail(&mut sub, e).await)
                        }
                        _ => {}
                    }
                };
                self.wait_ready(&mut sub).await?;
                (
                    registry.build_codec(described.input_typedesc_id, described.input_typedesc)?,
                    registry
                        .build_codec(described.output_typedesc_id, described.output_typedesc)?,
                )
            }
        };
        registry.cache_query(key, input.id, output.id);

        if !input.is_argument_codec() {
            return Err(Error::MissingCodec(format!(
                "input type {} cannot encode query arguments",
                input.id
            )));
        }
        let arguments = input.encode_arguments(args)?;

        // Execute
        let execute = Execute::new(arguments).allow_capabilities(capabilities);
        self.send(&[&execute, &Sync]).await?;

        let mut raw_rows: Vec<Bytes> = Vec::new();
        loop {
            match sub.next(timeout, cancel, "CommandComplete").await? {
                ServerMessage::Data { elements } => raw_rows.extend(elements),
                ServerMessage::CommandComplete { .. } => break,
                // Rows received so far are dropped
                ServerMessage::ErrorResponse(e) => return Err(self.fail(&mut sub, e).await),
                _ => {}
            }
        }
        self.wait_ready(&mut sub).await?;

        let rows = raw_rows
            .into_iter()
            .map(|row| output.decode(&mut PacketReader::new(row)))
            .collect::<Result<Vec<_>>>()?;
        QueryResult::from_rows(rows, cardinality)
    }

    /// Wait for the `ReadyForCommand` closing a Sync'd exchange.
    async fn wait_ready(&self, sub: &mut Subscription) -> Result<()> {
        let mut pending_error: Option<ErrorResponse> = None;
        loop {
            match sub
                .next(self.config.message_timeout, &self.shared.cancel, "ReadyForCommand")
                .await?
            {
                ServerMessage::ReadyForCommand { .. } => break,
                ServerMessage::ErrorResponse(e) => {
                    pending_error.get_or_insert(e);
                }
                _ => {}
            }
        }
        match pending_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Drain to `ReadyForCommand` after a server error and return it.
    /// A connection that cannot be resynchronized is closed; a drain that
    /// times out is finished by the next cycle.
    async fn fail(&self, sub: &mut Subscription, err: ErrorResponse) -> Error {
        if let Err(drain) = self.wait_ready(sub).await {
            if !drain.is_database() && !drain.is_timeout() {
                warn!(connection_id = self.shared.id, error = %drain, "Could not resync after server error");
                self.shared.mark_disconnected();
            }
        }
        err.into()
    }

    /// Write and flush messages in one go.
    async fn send(&self, messages: &[&dyn ClientMessage]) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| Error::Connection("connection is closed".into()))?;

        let syncs = messages.iter().filter(|m| m.tag() == Sync.tag()).count();
        self.shared.pending_syncs.fetch_add(syncs, Ordering::SeqCst);

        let result = async {
            for message in messages {
                writer.write_all(&message.encode()).await?;
            }
            writer.flush().await
        }
        .await;

        if let Err(e) = result {
            self.shared.mark_disconnected();
            return Err(Error::Connection(format!("Failed to send: {}", e)));
        }
        Ok(())
    }

    /// Send Terminate, close the socket and tear down waiters. Idempotent.
    pub async fn disconnect(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            if !self.is_closed() {
                let _ = writer.write_all(&Terminate.encode()).await;
                let _ = writer.flush().await;
            }
            let _ = writer.shutdown().await;
        }
        self.shared.mark_disconnected();
        if let Some(handle) = self.receive_task.lock().take() {
            handle.abort();
        }
    }

    /// Register a callback fired once with the connection id on disconnect.
    /// Fires immediately if the connection is already closed.
    pub fn on_disconnect<F>(&self, callback: F)
    where
        F: FnOnce(u64) + Send + 'static,
    {
        let mut callbacks = self.shared.on_disconnect.lock();
        if self.is_closed() {
            drop(callbacks);
            callback(self.shared.id);
            return;
        }
        callbacks.push(Box::new(callback));
    }

    /// Claim this connection for one caller; fails if already claimed or closed.
    pub fn try_claim(&self) -> bool {
        !self.is_closed()
            && self
                .claimed
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    pub fn release(&self) {
        self.claimed.store(false, Ordering::Release);
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn server_key(&self) -> Option<[u8; 32]> {
        *self.shared.server_key.lock()
    }

    /// Concurrency the server suggested for the pool, if it sent one.
    pub fn suggested_pool_concurrency(&self) -> Option<usize> {
        match self.shared.suggested_pool_concurrency.load(Ordering::SeqCst) {
            0 => None,
            n => Some(n),
        }
    }

    pub fn server_config(&self) -> HashMap<String, Value> {
        self.shared.server_config.read().clone()
    }

    pub fn server_config_value(&self, name: &str) -> Option<Value> {
        self.shared.server_config.read().get(name).cloned()
    }

    pub fn transaction_state(&self) -> TransactionState {
        *self.shared.transaction_state.lock()
    }

    pub fn registry(&self) -> &Arc<CodecRegistry> {
        &self.shared.registry
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Stops the receive loop, which then runs the disconnect path
        self.shared.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::codec::{Codec, ScalarKind};
    use crate::binary::packet::PacketWriter;
    use crate::binary::protocol::frame;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    const CONFIG_SHAPE_ID: Uuid = Uuid::from_u128(0x5C);

    fn system_config_value(timeout_micros: i64) -> Bytes {
        let mut desc = PacketWriter::new();
        desc.write_u8(2);
        desc.write_uuid(&ScalarKind::Int64.id());
        desc.write_u8(1);
        desc.write_uuid(&CONFIG_SHAPE_ID);
        desc.write_u16(1);
        desc.write_u32(0);
        desc.write_u8(Cardinality::One as u8);
        desc.write_string("session_idle_timeout");
        desc.write_u16(0);
        let desc = desc.freeze();

        let registry = CodecRegistry::new();
        let codec = registry
            .build_codec(CONFIG_SHAPE_ID, desc.clone())
            .unwrap();
        let mut data = PacketWriter::new();
        codec
            .encode(
                &mut data,
                &Value::Object(vec![(
                    "session_idle_timeout".into(),
                    Value::Int64(timeout_micros),
                )]),
            )
            .unwrap();

        let mut w = PacketWriter::new();
        w.write_u32(16 + desc.len() as u32);
        w.write_uuid(&CONFIG_SHAPE_ID);
        w.write_raw(&desc);
        w.write_bytes(data.as_slice());
        w.freeze()
    }

    fn parameter(name: &str, value: impl Into<Bytes>) -> ServerMessage {
        ServerMessage::ParameterStatus {
            name: name.to_string(),
            value: value.into(),
        }
    }

    #[test]
    fn test_result_shaping() {
        assert_eq!(
            QueryResult::from_rows(vec![], Cardinality::One).unwrap(),
            QueryResult::None
        );
        assert_eq!(
            QueryResult::from_rows(vec![Value::Int64(1)], Cardinality::AtMostOne).unwrap(),
            QueryResult::Single(Value::Int64(1))
        );
        assert_eq!(
            QueryResult::from_rows(vec![Value::Int64(1)], Cardinality::Many).unwrap(),
            QueryResult::Many(vec![Value::Int64(1)])
        );
        assert!(matches!(
            QueryResult::from_rows(vec![Value::Int64(1), Value::Int64(2)], Cardinality::One),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_query_result_accessors() {
        assert_eq!(QueryResult::None.into_vec(), Vec::<Value>::new());
        assert!(QueryResult::None.is_none());
        assert_eq!(
            QueryResult::Single(Value::Bool(true)).into_single(),
            Some(Value::Bool(true))
        );
        assert_eq!(QueryResult::Many(vec![Value::Bool(true)]).into_single(), None);
    }

    #[test]
    fn test_system_config_is_decoded() {
        let registry = CodecRegistry::new();
        let config = parse_system_config(&registry, system_config_value(60_000_000)).unwrap();
        assert_eq!(
            config.get("session_idle_timeout"),
            Some(&Value::Int64(60_000_000))
        );
    }

    #[test]
    fn test_parameter_status_updates_shared_state() {
        let shared = Shared::new(1, Arc::new(CodecRegistry::new()));

        shared.apply(&parameter("suggested_pool_concurrency", "8"));
        shared.apply(&parameter("system_config", system_config_value(5)));
        shared.apply(&ServerMessage::ServerKeyData { data: [7u8; 32] });

        assert_eq!(shared.suggested_pool_concurrency.load(Ordering::SeqCst), 8);
        assert_eq!(
            shared.server_config.read().get("session_idle_timeout"),
            Some(&Value::Int64(5))
        );
        assert_eq!(*shared.server_key.lock(), Some([7u8; 32]));

        // Garbage is logged and ignored
        shared.apply(&parameter("suggested_pool_concurrency", "lots"));
        shared.apply(&parameter("system_config", Bytes::from_static(b"\x00\x00")));
        assert_eq!(shared.suggested_pool_concurrency.load(Ordering::SeqCst), 8);
        assert_eq!(shared.server_config.read().len(), 1);
    }

    #[test]
    fn test_ready_for_command_settles_pending_syncs() {
        let shared = Shared::new(1, Arc::new(CodecRegistry::new()));
        let ready = |state| ServerMessage::ReadyForCommand {
            headers: Default::default(),
            transaction_state: state,
        };

        // The startup ready has no Sync of ours behind it
        shared.apply(&ready(TransactionState::NotInTransaction));
        assert_eq!(shared.pending_syncs.load(Ordering::SeqCst), 0);

        shared.pending_syncs.store(2, Ordering::SeqCst);
        shared.apply(&ready(TransactionState::InTransaction));
        assert_eq!(shared.pending_syncs.load(Ordering::SeqCst), 1);
        assert_eq!(*shared.transaction_state.lock(), TransactionState::InTransaction);
        shared.apply(&ready(TransactionState::InFailedTransaction));
        assert_eq!(shared.pending_syncs.load(Ordering::SeqCst), 0);
        assert_eq!(
            *shared.transaction_state.lock(),
            TransactionState::InFailedTransaction
        );
    }

    #[test]
    fn test_mark_disconnected_runs_callbacks_once() {
        let shared = Shared::new(42, Arc::new(CodecRegistry::new()));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        shared
            .on_disconnect
            .lock()
            .push(Box::new(move |id| {
                assert_eq!(id, 42);
                counter.fetch_add(1, Ordering::SeqCst);
            }));

        shared.mark_disconnected();
        shared.mark_disconnected();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(*shared.state.lock(), ConnectionState::Disconnected);
        assert!(shared.cancel.is_cancelled());

        // State never leaves Disconnected
        shared.set_state(ConnectionState::Ready);
        assert_eq!(*shared.state.lock(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_frame_reader_splits_frames() {
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&frame(b'Z', &[0, 0, b'I']));
        wire.extend_from_slice(&frame(b'C', &[0, 0, 0, 0, 0, 6]));
        let wire = wire.freeze();

        let mut reader = FrameReader::new(&wire[..]);
        let (tag, body) = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(tag, b'Z');
        assert_eq!(&body[..], &[0, 0, b'I']);
        let (tag, body) = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(tag, b'C');
        assert_eq!(body.len(), 6);
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_frame_reader_rejects_truncation() {
        let wire = frame(b'Z', &[0, 0, b'I']);
        let mut reader = FrameReader::new(&wire[..wire.len() - 1]);
        assert!(matches!(
            reader.next_frame().await,
            Err(Error::Connection(_))
        ));

        let bogus = [b'Z', 0, 0, 0, 2];
        let mut reader = FrameReader::new(&bogus[..]);
        assert!(matches!(reader.next_frame().await, Err(Error::Protocol(_))));
    }

    #[test]
    fn test_null_codec_builds_no_argument_block() {
        let block = Codec::null().encode_arguments(&Arguments::new()).unwrap();
        assert_eq!(&block[..], &[0, 0, 0, 0]);
    }
}
