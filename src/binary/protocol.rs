//! EdgeDB binary protocol message encoding and decoding.
//!
//! Every message is framed as a one-byte type tag followed by a `u32`
//! length that counts itself but not the tag, then the body.
//! Reference: https://www.edgedb.com/docs/reference/protocol/messages

use std::fmt;

use bytes::{Bytes, BytesMut};
use uuid::Uuid;

use super::packet::{Headers, PacketReader, PacketWriter};
use crate::error::{Error, Result};

// ============================================================================
// Protocol Constants
// ============================================================================

pub const PROTOCOL_MAJOR: u16 = 1;
pub const PROTOCOL_MINOR: u16 = 0;

/// Header codes used on client and server messages.
pub mod header {
    pub const IMPLICIT_LIMIT: u16 = 0xFF01;
    pub const IMPLICIT_TYPENAMES: u16 = 0xFF02;
    pub const IMPLICIT_TYPEIDS: u16 = 0xFF03;
    pub const ALLOW_CAPABILITIES: u16 = 0xFF04;
    pub const EXPLICIT_OBJECTIDS: u16 = 0xFF05;
    /// Sent by the server on `PrepareComplete`.
    pub const CAPABILITIES: u16 = 0x1001;
}

/// Declared row-count class of a query result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Cardinality {
    NoResult = 0x6e,
    AtMostOne = 0x6f,
    One = 0x41,
    Many = 0x6d,
    AtLeastOne = 0x4d,
}

impl Cardinality {
    pub fn from_u8(b: u8) -> Result<Self> {
        match b {
            0x6e => Ok(Cardinality::NoResult),
            0x6f => Ok(Cardinality::AtMostOne),
            0x41 => Ok(Cardinality::One),
            0x6d => Ok(Cardinality::Many),
            0x4d => Ok(Cardinality::AtLeastOne),
            other => Err(Error::Protocol(format!("Unknown cardinality: 0x{:02x}", other))),
        }
    }

    /// True when at most one row may come back.
    pub fn is_single(self) -> bool {
        matches!(self, Cardinality::AtMostOne | Cardinality::One)
    }
}

/// Result serialization format requested in `Prepare`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IoFormat {
    Binary = 0x62,
    Json = 0x6a,
    JsonElements = 0x4a,
}

/// Bitmask of query capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Capabilities(pub u64);

impl Capabilities {
    pub const READ_ONLY: Capabilities = Capabilities(0);
    pub const MODIFICATIONS: Capabilities = Capabilities(1 << 0);
    pub const SESSION_CONFIG: Capabilities = Capabilities(1 << 1);
    pub const TRANSACTION: Capabilities = Capabilities(1 << 2);
    pub const DDL: Capabilities = Capabilities(1 << 3);
    pub const PERSISTENT_CONFIG: Capabilities = Capabilities(1 << 4);
    pub const ALL: Capabilities = Capabilities(u64::MAX);

    pub fn contains(self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Capabilities {
    type Output = Capabilities;

    fn bitor(self, rhs: Self) -> Self {
        Capabilities(self.0 | rhs.0)
    }
}

/// Transaction state reported by `ReadyForCommand`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    NotInTransaction,
    InTransaction,
    InFailedTransaction,
}

impl From<u8> for TransactionState {
    fn from(b: u8) -> Self {
        match b {
            0x54 => TransactionState::InTransaction,
            0x45 => TransactionState::InFailedTransaction,
            _ => TransactionState::NotInTransaction,
        }
    }
}

/// Severity of an `ErrorResponse`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Error,
    Fatal,
    Panic,
    Other(u8),
}

impl From<u8> for ErrorSeverity {
    fn from(b: u8) -> Self {
        match b {
            0x78 => ErrorSeverity::Error,
            0xC8 => ErrorSeverity::Fatal,
            0xFF => ErrorSeverity::Panic,
            other => ErrorSeverity::Other(other),
        }
    }
}

impl ErrorSeverity {
    pub fn as_u8(self) -> u8 {
        match self {
            ErrorSeverity::Error => 0x78,
            ErrorSeverity::Fatal => 0xC8,
            ErrorSeverity::Panic => 0xFF,
            ErrorSeverity::Other(b) => b,
        }
    }
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Fatal => write!(f, "FATAL"),
            ErrorSeverity::Panic => write!(f, "PANIC"),
            ErrorSeverity::Other(b) => write!(f, "SEVERITY(0x{:02x})", b),
        }
    }
}

/// Severity of a server `LogMessage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Debug,
    Info,
    Notice,
    Warning,
    Other(u8),
}

impl From<u8> for MessageSeverity {
    fn from(b: u8) -> Self {
        match b {
            0x14 => MessageSeverity::Debug,
            0x28 => MessageSeverity::Info,
            0x3C => MessageSeverity::Notice,
            0x50 => MessageSeverity::Warning,
            other => MessageSeverity::Other(other),
        }
    }
}

/// Aspect requested by `DescribeStatement`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DescribeAspect {
    DataDescription = 0x54,
}

// ============================================================================
// Client -> Server Messages
// ============================================================================

/// Trait for encoding client messages.
pub trait ClientMessage: Send + std::marker::Sync {
    fn tag(&self) -> u8;

    fn write_body(&self, w: &mut PacketWriter);

    /// Full frame: tag, length, body.
    fn encode(&self) -> BytesMut {
        let mut body = PacketWriter::new();
        self.write_body(&mut body);
        frame(self.tag(), body.as_slice())
    }
}

/// Frame a message body with its tag and length.
pub fn frame(tag: u8, body: &[u8]) -> BytesMut {
    let mut w = PacketWriter::with_capacity(body.len() + 5);
    w.write_u8(tag);
    w.write_u32(body.len() as u32 + 4);
    w.write_raw(body);
    w.into_inner()
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolExtension {
    pub name: String,
    pub headers: Headers,
}

/// First message on a new connection ('V').
#[derive(Debug, Clone)]
pub struct ClientHandshake {
    pub major_ver: u16,
    pub minor_ver: u16,
    pub params: Vec<(String, String)>,
    pub extensions: Vec<ProtocolExtension>,
}

impl ClientHandshake {
    pub fn new(user: &str, database: &str) -> Self {
        Self {
            major_ver: PROTOCOL_MAJOR,
            minor_ver: PROTOCOL_MINOR,
            params: vec![
                ("user".to_string(), user.to_string()),
                ("database".to_string(), database.to_string()),
            ],
            extensions: Vec::new(),
        }
    }
}

impl ClientMessage for ClientHandshake {
    fn tag(&self) -> u8 {
        b'V'
    }

    fn write_body(&self, w: &mut PacketWriter) {
        w.write_u16(self.major_ver);
        w.write_u16(self.minor_ver);
        w.write_u16(self.params.len() as u16);
        for (name, value) in &self.params {
            w.write_string(name);
            w.write_string(value);
        }
        w.write_u16(self.extensions.len() as u16);
        for ext in &self.extensions {
            w.write_string(&ext.name);
            w.write_headers(&ext.headers);
        }
    }
}

/// SASL client-first message ('p').
#[derive(Debug, Clone)]
pub struct SaslInitialResponse {
    pub mechanism: String,
    pub data: Bytes,
}

impl ClientMessage for SaslInitialResponse {
    fn tag(&self) -> u8 {
        b'p'
    }

    fn write_body(&self, w: &mut PacketWriter) {
        w.write_string(&self.mechanism);
        w.write_bytes(&self.data);
    }
}

/// SASL client-final message ('r').
#[derive(Debug, Clone)]
pub struct SaslResponse {
    pub data: Bytes,
}

impl ClientMessage for SaslResponse {
    fn tag(&self) -> u8 {
        b'r'
    }

    fn write_body(&self, w: &mut PacketWriter) {
        w.write_bytes(&self.data);
    }
}

/// Prepare message ('P') - compiles a statement
#[derive(Debug, Clone)]
pub struct Prepare {
    pub headers: Headers,
    pub io_format: IoFormat,
    pub expected_cardinality: Cardinality,
    pub statement_name: Bytes,
    pub command: String,
}

impl Prepare {
    pub fn new(command: &str, io_format: IoFormat, expected_cardinality: Cardinality) -> Self {
        Self {
            headers: Headers::new(),
            io_format,
            expected_cardinality,
            statement_name: Bytes::new(),
            command: command.to_string(),
        }
    }

    /// Implicit LIMIT applied to the result set; sent as decimal text.
    pub fn implicit_limit(mut self, limit: u64) -> Self {
        self.headers
            .insert(header::IMPLICIT_LIMIT, Bytes::from(limit.to_string()));
        self
    }

    pub fn implicit_typenames(mut self, enabled: bool) -> Self {
        self.headers
            .insert(header::IMPLICIT_TYPENAMES, Bytes::from(vec![enabled as u8]));
        self
    }

    pub fn implicit_typeids(mut self, enabled: bool) -> Self {
        self.headers
            .insert(header::IMPLICIT_TYPEIDS, Bytes::from(vec![enabled as u8]));
        self
    }

    pub fn allow_capabilities(mut self, caps: Capabilities) -> Self {
        self.headers.insert(
            header::ALLOW_CAPABILITIES,
            Bytes::copy_from_slice(&caps.0.to_be_bytes()),
        );
        self
    }

    pub fn explicit_objectids(mut self, enabled: bool) -> Self {
        self.headers
            .insert(header::EXPLICIT_OBJECTIDS, Bytes::from(vec![enabled as u8]));
        self
    }
}

impl ClientMessage for Prepare {
    fn tag(&self) -> u8 {
        b'P'
    }

    fn write_body(&self, w: &mut PacketWriter) {
        w.write_headers(&self.headers);
        w.write_u8(self.io_format as u8);
        w.write_u8(self.expected_cardinality as u8);
        w.write_bytes(&self.statement_name);
        w.write_string(&self.command);
    }
}

/// DescribeStatement message ('D') - asks for type descriptors
#[derive(Debug, Clone)]
pub struct DescribeStatement {
    pub headers: Headers,
    pub aspect: DescribeAspect,
    pub statement_name: Bytes,
}

impl Default for DescribeStatement {
    fn default() -> Self {
        Self {
            headers: Headers::new(),
            aspect: DescribeAspect::DataDescription,
            statement_name: Bytes::new(),
        }
    }
}

impl ClientMessage for DescribeStatement {
    fn tag(&self) -> u8 {
        b'D'
    }

    fn write_body(&self, w: &mut PacketWriter) {
        w.write_headers(&self.headers);
        w.write_u8(self.aspect as u8);
        w.write_bytes(&self.statement_name);
    }
}

/// Execute message ('E') - runs the prepared statement
///
/// `arguments` is the argument block exactly as produced by the input codec,
/// including its own length prefix. An empty block is `[0, 0, 0, 0]`.
#[derive(Debug, Clone)]
pub struct Execute {
    pub headers: Headers,
    pub statement_name: Bytes,
    pub arguments: Bytes,
}

impl Execute {
    pub fn new(arguments: Bytes) -> Self {
        Self {
            headers: Headers::new(),
            statement_name: Bytes::new(),
            arguments,
        }
    }

    pub fn allow_capabilities(mut self, caps: Capabilities) -> Self {
        self.headers.insert(
            header::ALLOW_CAPABILITIES,
            Bytes::copy_from_slice(&caps.0.to_be_bytes()),
        );
        self
    }
}

impl ClientMessage for Execute {
    fn tag(&self) -> u8 {
        b'E'
    }

    fn write_body(&self, w: &mut PacketWriter) {
        w.write_headers(&self.headers);
        w.write_bytes(&self.statement_name);
        if self.arguments.is_empty() {
            w.write_raw(&[0, 0, 0, 0]);
        } else {
            w.write_raw(&self.arguments);
        }
    }
}

/// Sync message ('S')
#[derive(Debug, Clone, Copy)]
pub struct Sync;

impl ClientMessage for Sync {
    fn tag(&self) -> u8 {
        b'S'
    }

    fn write_body(&self, _w: &mut PacketWriter) {}
}

/// Flush message ('H')
#[derive(Debug, Clone, Copy)]
pub struct Flush;

impl ClientMessage for Flush {
    fn tag(&self) -> u8 {
        b'H'
    }

    fn write_body(&self, _w: &mut PacketWriter) {}
}

/// Terminate message ('X')
#[derive(Debug, Clone, Copy)]
pub struct Terminate;

impl ClientMessage for Terminate {
    fn tag(&self) -> u8 {
        b'X'
    }

    fn write_body(&self, _w: &mut PacketWriter) {}
}

// ============================================================================
// Server -> Client Messages
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Authentication {
    Ok,
    Sasl { methods: Vec<String> },
    SaslContinue { data: Bytes },
    SaslFinal { data: Bytes },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrepareComplete {
    pub headers: Headers,
    pub cardinality: Cardinality,
    pub input_typedesc_id: Uuid,
    pub output_typedesc_id: Uuid,
}

impl PrepareComplete {
    /// Capabilities the compiled statement requires, if reported.
    pub fn capabilities(&self) -> Option<Capabilities> {
        let raw = self.headers.get(header::CAPABILITIES)?;
        let bytes: [u8; 8] = raw.as_ref().try_into().ok()?;
        Some(Capabilities(u64::from_be_bytes(bytes)))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandDataDescription {
    pub headers: Headers,
    pub result_cardinality: Cardinality,
    pub input_typedesc_id: Uuid,
    pub input_typedesc: Bytes,
    pub output_typedesc_id: Uuid,
    pub output_typedesc: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorResponse {
    pub severity: ErrorSeverity,
    pub code: u32,
    pub message: String,
    pub headers: Headers,
}

impl From<ErrorResponse> for Error {
    fn from(e: ErrorResponse) -> Self {
        Error::Database {
            severity: e.severity,
            code: e.code,
            message: e.message,
            headers: e.headers,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogMessage {
    pub severity: MessageSeverity,
    pub code: u32,
    pub text: String,
    pub headers: Headers,
}

/// Server message types
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    ServerHandshake {
        major_ver: u16,
        minor_ver: u16,
        extensions: Vec<ProtocolExtension>,
    },
    Authentication(Authentication),
    ServerKeyData {
        data: [u8; 32],
    },
    ParameterStatus {
        name: String,
        value: Bytes,
    },
    PrepareComplete(PrepareComplete),
    CommandDataDescription(CommandDataDescription),
    Data {
        elements: Vec<Bytes>,
    },
    CommandComplete {
        headers: Headers,
        status: String,
    },
    ErrorResponse(ErrorResponse),
    ReadyForCommand {
        headers: Headers,
        transaction_state: TransactionState,
    },
    LogMessage(LogMessage),
    DumpHeader {
        headers: Headers,
        major_ver: u16,
        minor_ver: u16,
        payload: Bytes,
    },
    DumpBlock {
        headers: Headers,
    },
    RestoreReady {
        headers: Headers,
        jobs: u16,
    },
    /// Message type this client does not model; skipped by the receive loop.
    Unknown {
        tag: u8,
        body: Bytes,
    },
}

/// Discriminant used to filter the per-connection broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    ServerHandshake,
    Authentication,
    ServerKeyData,
    ParameterStatus,
    PrepareComplete,
    CommandDataDescription,
    Data,
    CommandComplete,
    ErrorResponse,
    ReadyForCommand,
    LogMessage,
    DumpHeader,
    DumpBlock,
    RestoreReady,
    Unknown,
}

impl ServerMessage {
    /// Decode one message body given its tag.
    pub fn decode(tag: u8, body: Bytes) -> Result<Self> {
        let mut r = PacketReader::new(body);

        let msg = match tag {
            b'v' => Self::decode_server_handshake(&mut r)?,
            b'R' => Self::decode_authentication(&mut r)?,
            b'K' => {
                let raw = r.read_exact(32)?;
                let mut data = [0u8; 32];
                data.copy_from_slice(&raw);
                ServerMessage::ServerKeyData { data }
            }
            b'S' => {
                let name = r.read_bytes()?;
                let value = r.read_bytes()?;
                ServerMessage::ParameterStatus {
                    name: String::from_utf8_lossy(&name).into_owned(),
                    value,
                }
            }
            b'1' => ServerMessage::PrepareComplete(PrepareComplete {
                headers: r.read_headers()?,
                cardinality: Cardinality::from_u8(r.read_u8()?)?,
                input_typedesc_id: r.read_uuid()?,
                output_typedesc_id: r.read_uuid()?,
            }),
            b'T' => ServerMessage::CommandDataDescription(CommandDataDescription {
                headers: r.read_headers()?,
                result_cardinality: Cardinality::from_u8(r.read_u8()?)?,
                input_typedesc_id: r.read_uuid()?,
                input_typedesc: r.read_bytes()?,
                output_typedesc_id: r.read_uuid()?,
                output_typedesc: r.read_bytes()?,
            }),
            b'D' => {
                let count = r.read_u16()? as usize;
                let mut elements = Vec::with_capacity(count);
                for _ in 0..count {
                    elements.push(r.read_bytes()?);
                }
                ServerMessage::Data { elements }
            }
            b'C' => ServerMessage::CommandComplete {
                headers: r.read_headers()?,
                status: r.read_string()?,
            },
            b'E' => ServerMessage::ErrorResponse(ErrorResponse {
                severity: ErrorSeverity::from(r.read_u8()?),
                code: r.read_u32()?,
                message: r.read_string()?,
                headers: r.read_headers()?,
            }),
            b'Z' => ServerMessage::ReadyForCommand {
                headers: r.read_headers()?,
                transaction_state: TransactionState::from(r.read_u8()?),
            },
            b'L' => ServerMessage::LogMessage(LogMessage {
                severity: MessageSeverity::from(r.read_u8()?),
                code: r.read_u32()?,
                text: r.read_string()?,
                headers: r.read_headers()?,
            }),
            b'@' => ServerMessage::DumpHeader {
                headers: r.read_headers()?,
                major_ver: r.read_u16()?,
                minor_ver: r.read_u16()?,
                payload: r.read_rest(),
            },
            b'=' => ServerMessage::DumpBlock {
                headers: r.read_headers()?,
            },
            b'+' => ServerMessage::RestoreReady {
                headers: r.read_headers()?,
                jobs: r.read_u16()?,
            },
            _ => ServerMessage::Unknown {
                tag,
                body: r.read_rest(),
            },
        };

        Ok(msg)
    }

    fn decode_server_handshake(r: &mut PacketReader) -> Result<Self> {
        let major_ver = r.read_u16()?;
        let minor_ver = r.read_u16()?;
        let count = r.read_u16()?;
        let mut extensions = Vec::with_capacity(count as usize);
        for _ in 0..count {
            extensions.push(ProtocolExtension {
                name: r.read_string()?,
                headers: r.read_headers()?,
            });
        }
        Ok(ServerMessage::ServerHandshake {
            major_ver,
            minor_ver,
            extensions,
        })
    }

    fn decode_authentication(r: &mut PacketReader) -> Result<Self> {
        let status = r.read_u32()?;
        let auth = match status {
            0 => Authentication::Ok,
            10 => {
                let count = r.read_u32()?;
                let mut methods = Vec::with_capacity(r.capacity_for(count as usize, 4));
                for _ in 0..count {
                    methods.push(r.read_string()?);
                }
                Authentication::Sasl { methods }
            }
            11 => Authentication::SaslContinue {
                data: r.read_bytes()?,
            },
            12 => Authentication::SaslFinal {
                data: r.read_bytes()?,
            },
            other => {
                return Err(Error::Protocol(format!(
                    "Unknown authentication status: {}",
                    other
                )))
            }
        };
        Ok(ServerMessage::Authentication(auth))
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            ServerMessage::ServerHandshake { .. } => MessageKind::ServerHandshake,
            ServerMessage::Authentication(_) => MessageKind::Authentication,
            ServerMessage::ServerKeyData { .. } => MessageKind::ServerKeyData,
            ServerMessage::ParameterStatus { .. } => MessageKind::ParameterStatus,
            ServerMessage::PrepareComplete(_) => MessageKind::PrepareComplete,
            ServerMessage::CommandDataDescription(_) => MessageKind::CommandDataDescription,
            ServerMessage::Data { .. } => MessageKind::Data,
            ServerMessage::CommandComplete { .. } => MessageKind::CommandComplete,
            ServerMessage::ErrorResponse(_) => MessageKind::ErrorResponse,
            ServerMessage::ReadyForCommand { .. } => MessageKind::ReadyForCommand,
            ServerMessage::LogMessage(_) => MessageKind::LogMessage,
            ServerMessage::DumpHeader { .. } => MessageKind::DumpHeader,
            ServerMessage::DumpBlock { .. } => MessageKind::DumpBlock,
            ServerMessage::RestoreReady { .. } => MessageKind::RestoreReady,
            ServerMessage::Unknown { .. } => MessageKind::Unknown,
        }
    }
}
