//! EdgeDB binary protocol client.
//!
//! Architecture:
//! - `packet`: big-endian reader/writer over message bodies
//! - `protocol`: message types, framing and header constants
//! - `descriptors` / `codec` / `registry`: type descriptors and the codec
//!   trees built from them
//! - `value`: in-memory representation of wire values
//! - `scram` / `tls`: authentication and transport security
//! - `dispatch` / `connection`: receive loop, reply correlation and the
//!   prepare/describe/execute cycle

pub mod codec;
pub mod connection;
pub mod descriptors;
pub mod dispatch;
pub mod packet;
pub mod protocol;
pub mod registry;
pub mod scram;
pub mod tls;
pub mod value;


pub use codec::{Arguments, Codec, CodecKind, ScalarKind};
pub use connection::{Connection, ConnectionState, QueryResult};
pub use protocol::{Capabilities, Cardinality, IoFormat, TransactionState};
pub use registry::{query_hash, CodecRegistry};
pub use value::Value;
