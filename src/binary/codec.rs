//! Codec tree: one tagged variant per wire shape, one interpreter.
//!
//! Composite codecs hold their children behind `Arc` so trees built from
//! different descriptor blocks share common subtrees through the registry.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, NaiveDate, NaiveTime, Timelike, Utc};
use uuid::Uuid;

use super::packet::{PacketReader, PacketWriter};
use super::value::{BigInt, DateDuration, Decimal, Duration, Range, RelativeDuration, Value};
use crate::error::{Error, Result};

/// Named query arguments handed to an argument codec.
pub type Arguments = HashMap<String, Value>;

/// Descriptor id of the no-op codec.
pub const NULL_CODEC_ID: Uuid = Uuid::nil();

/// Descriptor id of the empty tuple, used for queries without arguments.
pub const EMPTY_TUPLE_ID: Uuid = Uuid::from_u128(0xFF);

/// Microseconds between the Unix epoch and 2000-01-01T00:00:00Z.
const EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;

const DECIMAL_POSITIVE: u16 = 0x0000;
const DECIMAL_NEGATIVE: u16 = 0x4000;

mod range_flags {
    pub const EMPTY: u8 = 0x01;
    pub const INC_LOWER: u8 = 0x02;
    pub const INC_UPPER: u8 = 0x04;
    pub const INF_LOWER: u8 = 0x08;
    pub const INF_UPPER: u8 = 0x10;
}

// ============================================================================
// Scalars
// ============================================================================

/// Built-in scalar types with reserved descriptor ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    Uuid,
    Str,
    Bytes,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Decimal,
    Bool,
    Datetime,
    LocalDatetime,
    LocalDate,
    LocalTime,
    Duration,
    Json,
    BigInt,
    RelativeDuration,
    DateDuration,
}

impl ScalarKind {
    pub const ALL: [ScalarKind; 19] = [
        ScalarKind::Uuid,
        ScalarKind::Str,
        ScalarKind::Bytes,
        ScalarKind::Int16,
        ScalarKind::Int32,
        ScalarKind::Int64,
        ScalarKind::Float32,
        ScalarKind::Float64,
        ScalarKind::Decimal,
        ScalarKind::Bool,
        ScalarKind::Datetime,
        ScalarKind::LocalDatetime,
        ScalarKind::LocalDate,
        ScalarKind::LocalTime,
        ScalarKind::Duration,
        ScalarKind::Json,
        ScalarKind::BigInt,
        ScalarKind::RelativeDuration,
        ScalarKind::DateDuration,
    ];

    /// Reserved descriptor id (`00000000-0000-0000-0000-0000000001xx`).
    pub const fn id(self) -> Uuid {
        let low = match self {
            ScalarKind::Uuid => 0x100,
            ScalarKind::Str => 0x101,
            ScalarKind::Bytes => 0x102,
            ScalarKind::Int16 => 0x103,
            ScalarKind::Int32 => 0x104,
            ScalarKind::Int64 => 0x105,
            ScalarKind::Float32 => 0x106,
            ScalarKind::Float64 => 0x107,
            ScalarKind::Decimal => 0x108,
            ScalarKind::Bool => 0x109,
            ScalarKind::Datetime => 0x10A,
            ScalarKind::LocalDatetime => 0x10B,
            ScalarKind::LocalDate => 0x10C,
            ScalarKind::LocalTime => 0x10D,
            ScalarKind::Duration => 0x10E,
            ScalarKind::Json => 0x10F,
            ScalarKind::BigInt => 0x110,
            ScalarKind::RelativeDuration => 0x111,
            ScalarKind::DateDuration => 0x112,
        };
        Uuid::from_u128(low)
    }

    pub fn from_id(id: &Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.id() == *id)
    }

    pub fn name(self) -> &'static str {
        match self {
            ScalarKind::Uuid => "std::uuid",
            ScalarKind::Str => "std::str",
            ScalarKind::Bytes => "std::bytes",
            ScalarKind::Int16 => "std::int16",
            ScalarKind::Int32 => "std::int32",
            ScalarKind::Int64 => "std::int64",
            ScalarKind::Float32 => "std::float32",
            ScalarKind::Float64 => "std::float64",
            ScalarKind::Decimal => "std::decimal",
            ScalarKind::Bool => "std::bool",
            ScalarKind::Datetime => "std::datetime",
            ScalarKind::LocalDatetime => "cal::local_datetime",
            ScalarKind::LocalDate => "cal::local_date",
            ScalarKind::LocalTime => "cal::local_time",
            ScalarKind::Duration => "std::duration",
            ScalarKind::Json => "std::json",
            ScalarKind::BigInt => "std::bigint",
            ScalarKind::RelativeDuration => "cal::relative_duration",
            ScalarKind::DateDuration => "cal::date_duration",
        }
    }

    pub fn decode(self, r: &mut PacketReader) -> Result<Value> {
        let value = match self {
            ScalarKind::Uuid => Value::Uuid(r.read_uuid()?),
            ScalarKind::Str => {
                let raw = r.read_rest();
                Value::Str(
                    String::from_utf8(raw.to_vec())
                        .map_err(|e| Error::Protocol(format!("Invalid UTF-8 in str: {}", e)))?,
                )
            }
            ScalarKind::Bytes => Value::Bytes(r.read_rest()),
            ScalarKind::Int16 => Value::Int16(r.read_i16()?),
            ScalarKind::Int32 => Value::Int32(r.read_i32()?),
            ScalarKind::Int64 => Value::Int64(r.read_i64()?),
            ScalarKind::Float32 => Value::Float32(r.read_f32()?),
            ScalarKind::Float64 => Value::Float64(r.read_f64()?),
            ScalarKind::Decimal => {
                let (negative, weight, scale, digits) = read_numeric(r)?;
                Value::Decimal(Decimal {
                    negative,
                    weight,
                    scale,
                    digits,
                })
            }
            ScalarKind::BigInt => {
                let (negative, weight, scale, digits) = read_numeric(r)?;
                if scale != 0 {
                    return Err(Error::Protocol(format!("bigint with scale {}", scale)));
                }
                Value::BigInt(BigInt {
                    negative,
                    weight,
                    digits,
                })
            }
            ScalarKind::Bool => Value::Bool(r.read_bool()?),
            ScalarKind::Datetime => {
                let micros = r.read_i64()?;
                Value::Datetime(datetime_from_micros(micros)?)
            }
            ScalarKind::LocalDatetime => {
                let micros = r.read_i64()?;
                Value::LocalDatetime(datetime_from_micros(micros)?.naive_utc())
            }
            ScalarKind::LocalDate => {
                let days = r.read_i32()?;
                let date = epoch_date()?
                    .checked_add_signed(chrono::Duration::days(days as i64))
                    .ok_or_else(|| Error::Type(format!("local_date out of range: {}", days)))?;
                Value::LocalDate(date)
            }
            ScalarKind::LocalTime => {
                let micros = r.read_i64()?;
                if !(0..86_400_000_000).contains(&micros) {
                    return Err(Error::Type(format!("local_time out of range: {}", micros)));
                }
                let secs = (micros / 1_000_000) as u32;
                let nanos = (micros % 1_000_000) as u32 * 1_000;
                let time = NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos)
                    .ok_or_else(|| Error::Type(format!("local_time out of range: {}", micros)))?;
                Value::LocalTime(time)
            }
            ScalarKind::Duration => {
                let micros = r.read_i64()?;
                let days = r.read_i32()?;
                let months = r.read_i32()?;
                if days != 0 || months != 0 {
                    return Err(Error::Protocol(
                        "duration with non-zero days or months".to_string(),
                    ));
                }
                Value::Duration(Duration { micros })
            }
            ScalarKind::RelativeDuration => {
                let micros = r.read_i64()?;
                let days = r.read_i32()?;
                let months = r.read_i32()?;
                Value::RelativeDuration(RelativeDuration {
                    months,
                    days,
                    micros,
                })
            }
            ScalarKind::DateDuration => {
                r.skip(8)?;
                let days = r.read_i32()?;
                let months = r.read_i32()?;
                Value::DateDuration(DateDuration { months, days })
            }
            ScalarKind::Json => {
                let format = r.read_u8()?;
                if format != 1 {
                    return Err(Error::Protocol(format!("Unsupported json format {}", format)));
                }
                let raw = r.read_rest();
                Value::Json(
                    serde_json::from_slice(&raw)
                        .map_err(|e| Error::Type(format!("Invalid json payload: {}", e)))?,
                )
            }
        };
        Ok(value)
    }

    pub fn encode(self, w: &mut PacketWriter, value: &Value) -> Result<()> {
        match (self, value) {
            (ScalarKind::Uuid, Value::Uuid(id)) => w.write_uuid(id),
            (ScalarKind::Str, Value::Str(s)) => w.write_raw(s.as_bytes()),
            (ScalarKind::Bytes, Value::Bytes(b)) => w.write_raw(b),
            (ScalarKind::Int16, Value::Int16(v)) => w.write_i16(*v),
            (ScalarKind::Int32, Value::Int16(v)) => w.write_i32(*v as i32),
            (ScalarKind::Int32, Value::Int32(v)) => w.write_i32(*v),
            (ScalarKind::Int64, Value::Int16(v)) => w.write_i64(*v as i64),
            (ScalarKind::Int64, Value::Int32(v)) => w.write_i64(*v as i64),
            (ScalarKind::Int64, Value::Int64(v)) => w.write_i64(*v),
            (ScalarKind::Float32, Value::Float32(v)) => w.write_f32(*v),
            (ScalarKind::Float64, Value::Float32(v)) => w.write_f64(*v as f64),
            (ScalarKind::Float64, Value::Float64(v)) => w.write_f64(*v),
            (ScalarKind::Decimal, Value::Decimal(d)) => {
                write_numeric(w, d.negative, d.weight, d.scale, &d.digits)
            }
            (ScalarKind::BigInt, Value::BigInt(b)) => {
                write_numeric(w, b.negative, b.weight, 0, &b.digits)
            }
            (ScalarKind::Bool, Value::Bool(b)) => w.write_bool(*b),
            (ScalarKind::Datetime, Value::Datetime(dt)) => {
                w.write_i64(micros_since_epoch(dt.timestamp_micros())?)
            }
            (ScalarKind::LocalDatetime, Value::LocalDatetime(dt)) => {
                w.write_i64(micros_since_epoch(dt.and_utc().timestamp_micros())?)
            }
            (ScalarKind::LocalDate, Value::LocalDate(d)) => {
                let days = d.signed_duration_since(epoch_date()?).num_days();
                let days = i32::try_from(days)
                    .map_err(|_| Error::Type(format!("local_date out of range: {}", d)))?;
                w.write_i32(days);
            }
            (ScalarKind::LocalTime, Value::LocalTime(t)) => {
                let micros = t.num_seconds_from_midnight() as i64 * 1_000_000
                    + (t.nanosecond() / 1_000) as i64;
                w.write_i64(micros);
            }
            (ScalarKind::Duration, Value::Duration(d)) => {
                w.write_i64(d.micros);
                w.write_i32(0);
                w.write_i32(0);
            }
            (ScalarKind::RelativeDuration, Value::RelativeDuration(d)) => {
                w.write_i64(d.micros);
                w.write_i32(d.days);
                w.write_i32(d.months);
            }
            (ScalarKind::DateDuration, Value::DateDuration(d)) => {
                w.write_i64(0);
                w.write_i32(d.days);
                w.write_i32(d.months);
            }
            (ScalarKind::Json, Value::Json(json)) => {
                w.write_u8(1);
                let text = serde_json::to_vec(json)
                    .map_err(|e| Error::Type(format!("Cannot serialize json: {}", e)))?;
                w.write_raw(&text);
            }
            (ScalarKind::Json, Value::Str(text)) => {
                w.write_u8(1);
                w.write_raw(text.as_bytes());
            }
            (kind, other) => {
                return Err(Error::Type(format!(
                    "Cannot encode {} as {}",
                    other.kind_name(),
                    kind.name()
                )))
            }
        }
        Ok(())
    }
}

fn read_numeric(r: &mut PacketReader) -> Result<(bool, i16, u16, Vec<u16>)> {
    let ndigits = r.read_u16()?;
    let weight = r.read_i16()?;
    let sign = r.read_u16()?;
    let scale = r.read_u16()?;
    let negative = match sign {
        DECIMAL_POSITIVE => false,
        DECIMAL_NEGATIVE => true,
        other => return Err(Error::Protocol(format!("Invalid numeric sign 0x{:04x}", other))),
    };
    let mut digits = Vec::with_capacity(ndigits as usize);
    for _ in 0..ndigits {
        digits.push(r.read_u16()?);
    }
    Ok((negative, weight, scale, digits))
}

fn write_numeric(w: &mut PacketWriter, negative: bool, weight: i16, scale: u16, digits: &[u16]) {
    w.write_u16(digits.len() as u16);
    w.write_i16(weight);
    w.write_u16(if negative {
        DECIMAL_NEGATIVE
    } else {
        DECIMAL_POSITIVE
    });
    w.write_u16(scale);
    for d in digits {
        w.write_u16(*d);
    }
}

fn datetime_from_micros(micros: i64) -> Result<DateTime<Utc>> {
    micros
        .checked_add(EPOCH_OFFSET_MICROS)
        .and_then(DateTime::<Utc>::from_timestamp_micros)
        .ok_or_else(|| Error::Type(format!("datetime out of range: {}", micros)))
}

fn micros_since_epoch(unix_micros: i64) -> Result<i64> {
    unix_micros
        .checked_sub(EPOCH_OFFSET_MICROS)
        .ok_or_else(|| Error::Type("datetime out of range".to_string()))
}

fn epoch_date() -> Result<NaiveDate> {
    NaiveDate::from_ymd_opt(2000, 1, 1)
        .ok_or_else(|| Error::Type("invalid epoch date".to_string()))
}

// ============================================================================
// Codec tree
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct NamedCodec {
    pub name: String,
    pub codec: Arc<Codec>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectField {
    pub name: String,
    pub flags: u32,
    pub cardinality: u8,
    pub codec: Arc<Codec>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CodecKind {
    Null,
    Scalar(ScalarKind),
    Array(Arc<Codec>),
    Set(Arc<Codec>),
    Tuple(Vec<Arc<Codec>>),
    NamedTuple(Vec<NamedCodec>),
    Object(Vec<ObjectField>),
    SparseObject(Vec<NamedCodec>),
    Range(Arc<Codec>),
}

/// A node of the codec tree, keyed by the descriptor id it was built from.
#[derive(Debug, Clone, PartialEq)]
pub struct Codec {
    pub id: Uuid,
    pub kind: CodecKind,
}

impl Codec {
    pub fn new(id: Uuid, kind: CodecKind) -> Self {
        Self { id, kind }
    }

    pub fn null() -> Self {
        Self::new(NULL_CODEC_ID, CodecKind::Null)
    }

    pub fn scalar(kind: ScalarKind) -> Self {
        Self::new(kind.id(), CodecKind::Scalar(kind))
    }

    /// Whether this codec can serialize a named argument map.
    pub fn is_argument_codec(&self) -> bool {
        matches!(
            self.kind,
            CodecKind::Null | CodecKind::Tuple(_) | CodecKind::Object(_) | CodecKind::SparseObject(_)
        )
    }

    /// Decode one value from a bounded reader.
    pub fn decode(&self, r: &mut PacketReader) -> Result<Value> {
        match &self.kind {
            CodecKind::Null => Ok(Value::Nothing),
            CodecKind::Scalar(kind) => kind.decode(r),
            CodecKind::Array(inner) => Ok(Value::Array(decode_array(inner, r)?)),
            CodecKind::Set(inner) => Ok(Value::Set(decode_array(inner, r)?)),
            CodecKind::Tuple(children) => {
                read_element_count(r, children.len())?;
                let mut items = Vec::with_capacity(children.len());
                for child in children {
                    r.skip(4)?;
                    items.push(decode_element(child, r)?);
                }
                Ok(Value::Tuple(items))
            }
            CodecKind::NamedTuple(children) => {
                read_element_count(r, children.len())?;
                let mut fields = Vec::with_capacity(children.len());
                for child in children {
                    r.skip(4)?;
                    fields.push((child.name.clone(), decode_element(&child.codec, r)?));
                }
                Ok(Value::NamedTuple(fields))
            }
            CodecKind::Object(children) => {
                read_element_count(r, children.len())?;
                let mut fields = Vec::with_capacity(children.len());
                for child in children {
                    r.skip(4)?;
                    fields.push((child.name.clone(), decode_element(&child.codec, r)?));
                }
                Ok(Value::Object(fields))
            }
            CodecKind::SparseObject(children) => {
                let count = r.read_i32()?;
                let mut fields = Vec::with_capacity(r.capacity_for(count.max(0) as usize, 8));
                for _ in 0..count {
                    let index = r.read_i32()?;
                    let child = usize::try_from(index)
                        .ok()
                        .and_then(|i| children.get(i))
                        .ok_or_else(|| {
                            Error::Protocol(format!("Sparse object index {} out of range", index))
                        })?;
                    fields.push((child.name.clone(), decode_element(&child.codec, r)?));
                }
                Ok(Value::Object(fields))
            }
            CodecKind::Range(inner) => Ok(Value::Range(decode_range(inner, r)?)),
        }
    }

    /// Encode one value into the writer.
    pub fn encode(&self, w: &mut PacketWriter, value: &Value) -> Result<()> {
        match (&self.kind, value) {
            (CodecKind::Null, _) => Ok(()),
            (CodecKind::Scalar(kind), value) => kind.encode(w, value),
            (CodecKind::Array(inner), Value::Array(items) | Value::Set(items))
            | (CodecKind::Set(inner), Value::Set(items) | Value::Array(items)) => {
                encode_array(inner, w, items)
            }
            (CodecKind::Tuple(children), Value::Tuple(items)) => {
                if children.len() != items.len() {
                    return Err(Error::Type(format!(
                        "Tuple expects {} elements, got {}",
                        children.len(),
                        items.len()
                    )));
                }
                w.write_i32(children.len() as i32);
                for (child, item) in children.iter().zip(items) {
                    w.write_i32(0);
                    encode_element(child, w, item)?;
                }
                Ok(())
            }
            (CodecKind::NamedTuple(children), Value::NamedTuple(fields))
            | (CodecKind::NamedTuple(children), Value::Object(fields)) => {
                encode_named(children.iter().map(|c| (&c.name, &c.codec)), w, fields)
            }
            (CodecKind::Object(children), Value::Object(fields))
            | (CodecKind::Object(children), Value::NamedTuple(fields)) => {
                encode_named(children.iter().map(|c| (&c.name, &c.codec)), w, fields)
            }
            (CodecKind::SparseObject(children), Value::Object(fields)) => {
                w.write_i32(fields.len() as i32);
                for (name, item) in fields {
                    let index = children
                        .iter()
                        .position(|c| &c.name == name)
                        .ok_or_else(|| Error::MissingCodec(format!("no shape field {:?}", name)))?;
                    w.write_i32(index as i32);
                    encode_element(&children[index].codec, w, item)?;
                }
                Ok(())
            }
            (CodecKind::Range(inner), Value::Range(range)) => encode_range(inner, w, range),
            (_, other) => Err(Error::Type(format!(
                "Cannot encode {} with codec {}",
                other.kind_name(),
                self.id
            ))),
        }
    }

    /// Serialize a named argument map into an `Execute` argument block,
    /// including the block's own length prefix.
    pub fn encode_arguments(&self, args: &Arguments) -> Result<Bytes> {
        let mut w = PacketWriter::new();
        match &self.kind {
            CodecKind::Null => {
                if !args.is_empty() {
                    return Err(Error::InvalidArgument(format!(
                        "query takes no arguments but {} were supplied",
                        args.len()
                    )));
                }
                w.write_i32(0);
            }
            CodecKind::Tuple(children) => {
                reject_unknown(args, |name| {
                    name.parse::<usize>().map(|i| i < children.len()).unwrap_or(false)
                })?;
                w.write_length_prefixed(|w| {
                    w.write_i32(children.len() as i32);
                    for (i, child) in children.iter().enumerate() {
                        let item = args.get(&i.to_string()).ok_or_else(|| {
                            Error::InvalidArgument(format!("missing positional argument ${}", i))
                        })?;
                        w.write_i32(0);
                        encode_element(child, w, item)?;
                    }
                    Ok(())
                })?;
            }
            CodecKind::Object(children) => {
                reject_unknown(args, |name| children.iter().any(|c| c.name == name))?;
                w.write_length_prefixed(|w| {
                    w.write_i32(children.len() as i32);
                    for child in children {
                        let item = args.get(&child.name).ok_or_else(|| {
                            Error::InvalidArgument(format!("missing argument ${}", child.name))
                        })?;
                        w.write_i32(0);
                        encode_element(&child.codec, w, item)?;
                    }
                    Ok(())
                })?;
            }
            CodecKind::SparseObject(children) => {
                if let Some(name) = args.keys().find(|k| !children.iter().any(|c| &c.name == *k)) {
                    return Err(Error::MissingCodec(format!(
                        "no input shape field for argument ${}",
                        name
                    )));
                }
                w.write_length_prefixed(|w| {
                    w.write_i32(args.len() as i32);
                    for (index, child) in children.iter().enumerate() {
                        if let Some(item) = args.get(&child.name) {
                            w.write_i32(index as i32);
                            encode_element(&child.codec, w, item)?;
                        }
                    }
                    Ok(())
                })?;
            }
            _ => {
                return Err(Error::MissingCodec(format!(
                    "codec {} cannot encode arguments",
                    self.id
                )))
            }
        }
        Ok(w.freeze())
    }
}

fn reject_unknown(args: &Arguments, known: impl Fn(&str) -> bool) -> Result<()> {
    match args.keys().find(|k| !known(k)) {
        Some(name) => Err(Error::InvalidArgument(format!("unknown argument ${}", name))),
        None => Ok(()),
    }
}

fn read_element_count(r: &mut PacketReader, expected: usize) -> Result<()> {
    let count = r.read_i32()?;
    if count < 0 || count as usize != expected {
        return Err(Error::Protocol(format!(
            "Codec mismatch: expected {} elements, got {}",
            expected, count
        )));
    }
    Ok(())
}

/// `i32` length (`-1` for an absent value) followed by the element bytes.
fn decode_element(codec: &Codec, r: &mut PacketReader) -> Result<Value> {
    let len = r.read_i32()?;
    if len < 0 {
        return Ok(Value::Nothing);
    }
    let mut inner = r.sub_reader(len as usize)?;
    codec.decode(&mut inner)
}

fn encode_element(codec: &Codec, w: &mut PacketWriter, value: &Value) -> Result<()> {
    if value.is_nothing() {
        w.write_i32(-1);
        return Ok(());
    }
    w.write_length_prefixed(|w| codec.encode(w, value))
}

fn encode_named<'a>(
    children: impl Iterator<Item = (&'a String, &'a Arc<Codec>)>,
    w: &mut PacketWriter,
    fields: &[(String, Value)],
) -> Result<()> {
    let children: Vec<_> = children.collect();
    w.write_i32(children.len() as i32);
    for (name, codec) in children {
        let item = fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
            .unwrap_or(&Value::Nothing);
        w.write_i32(0);
        encode_element(codec, w, item)?;
    }
    Ok(())
}

fn decode_array(inner: &Codec, r: &mut PacketReader) -> Result<Vec<Value>> {
    let ndims = r.read_i32()?;
    // flags, reserved
    r.skip(8)?;

    if ndims == 0 {
        return Ok(Vec::new());
    }
    if ndims != 1 {
        return Err(Error::Protocol(format!(
            "Only one-dimensional arrays are supported, got {}",
            ndims
        )));
    }

    let upper = r.read_i32()?;
    let lower = r.read_i32()?;
    let count = upper
        .checked_sub(lower)
        .and_then(|n| n.checked_add(1))
        .filter(|n| *n >= 0)
        .ok_or_else(|| Error::Protocol(format!("Invalid array bounds [{}, {}]", lower, upper)))?;

    let mut items = Vec::with_capacity(r.capacity_for(count as usize, 4));
    for _ in 0..count {
        items.push(decode_element(inner, r)?);
    }
    Ok(items)
}

fn encode_array(inner: &Codec, w: &mut PacketWriter, items: &[Value]) -> Result<()> {
    if items.is_empty() {
        w.write_i32(0);
        w.write_i32(0);
        w.write_i32(0);
        return Ok(());
    }
    w.write_i32(1);
    w.write_i32(0);
    w.write_i32(0);
    w.write_i32(items.len() as i32);
    w.write_i32(1);
    for item in items {
        encode_element(inner, w, item)?;
    }
    Ok(())
}

fn decode_range(inner: &Codec, r: &mut PacketReader) -> Result<Range> {
    let flags = r.read_u8()?;
    if flags & range_flags::EMPTY != 0 {
        return Ok(Range::empty());
    }
    let lower = if flags & range_flags::INF_LOWER == 0 {
        Some(Box::new(decode_element(inner, r)?))
    } else {
        None
    };
    let upper = if flags & range_flags::INF_UPPER == 0 {
        Some(Box::new(decode_element(inner, r)?))
    } else {
        None
    };
    Ok(Range {
        lower,
        upper,
        inc_lower: flags & range_flags::INC_LOWER != 0,
        inc_upper: flags & range_flags::INC_UPPER != 0,
        empty: false,
    })
}

fn encode_range(inner: &Codec, w: &mut PacketWriter, range: &Range) -> Result<()> {
    if range.empty {
        w.write_u8(range_flags::EMPTY);
        return Ok(());
    }
    let mut flags = 0u8;
    if range.inc_lower {
        flags |= range_flags::INC_LOWER;
    }
    if range.inc_upper {
        flags |= range_flags::INC_UPPER;
    }
    if range.lower.is_none() {
        flags |= range_flags::INF_LOWER;
    }
    if range.upper.is_none() {
        flags |= range_flags::INF_UPPER;
    }
    w.write_u8(flags);
    if let Some(lower) = &range.lower {
        w.write_length_prefixed(|w| inner.encode(w, lower))?;
    }
    if let Some(upper) = &range.upper {
        w.write_length_prefixed(|w| inner.encode(w, upper))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;
    use pretty_assertions::assert_eq;

    fn roundtrip(kind: ScalarKind, value: Value) {
        let codec = Codec::scalar(kind);
        let mut w = PacketWriter::new();
        codec.encode(&mut w, &value).unwrap();
        let mut r = PacketReader::new(w.freeze());
        assert_eq!(codec.decode(&mut r).unwrap(), value, "{}", kind.name());
        assert!(r.is_empty());
    }

    #[test]
    fn test_integer_boundaries() {
        for v in [i16::MIN, -1, 0, i16::MAX] {
            roundtrip(ScalarKind::Int16, Value::Int16(v));
        }
        for v in [i32::MIN, -1, 0, 1, i32::MAX] {
            roundtrip(ScalarKind::Int32, Value::Int32(v));
        }
        for v in [i64::MIN, 0, i64::MAX] {
            roundtrip(ScalarKind::Int64, Value::Int64(v));
        }
    }

    #[test]
    fn test_text_and_bytes_boundaries() {
        roundtrip(ScalarKind::Str, Value::Str(String::new()));
        roundtrip(ScalarKind::Str, Value::Str("héllo ✓".into()));
        roundtrip(ScalarKind::Bytes, Value::Bytes(Bytes::new()));
        roundtrip(ScalarKind::Bytes, Value::Bytes(Bytes::from_static(&[0, 255, 7])));
    }

    #[test]
    fn test_misc_scalars() {
        roundtrip(
            ScalarKind::Uuid,
            Value::Uuid(Uuid::from_u128(0x0123_4567_89ab_cdef_0123_4567_89ab_cdef)),
        );
        roundtrip(ScalarKind::Bool, Value::Bool(true));
        roundtrip(ScalarKind::Bool, Value::Bool(false));
        roundtrip(ScalarKind::Float32, Value::Float32(f32::MIN_POSITIVE));
        roundtrip(ScalarKind::Float64, Value::Float64(-1.5e300));
        roundtrip(
            ScalarKind::Json,
            Value::Json(serde_json::json!({"a": [1, 2, null], "b": "x"})),
        );
    }

    #[test]
    fn test_numeric_scalars() {
        for text in ["0", "-1.5", "123456789.123456789012345", "0.00000001"] {
            roundtrip(ScalarKind::Decimal, Value::Decimal(text.parse().unwrap()));
        }
        for v in [0i64, -10000, i64::MAX] {
            roundtrip(ScalarKind::BigInt, Value::BigInt(BigInt::from(v)));
        }
    }

    #[test]
    fn test_decimal_wire_layout() {
        let codec = Codec::scalar(ScalarKind::Decimal);
        let mut w = PacketWriter::new();
        codec
            .encode(&mut w, &Value::Decimal("-1.5".parse().unwrap()))
            .unwrap();
        // ndigits=2, weight=0, sign=neg, dscale=1, digits [1, 5000]
        assert_eq!(
            w.as_slice(),
            &[0, 2, 0, 0, 0x40, 0, 0, 1, 0, 1, 0x13, 0x88]
        );
    }

    #[test]
    fn test_temporal_scalars() {
        let dt = DateTime::<Utc>::from_timestamp_micros(1_700_000_000_123_456).unwrap();
        roundtrip(ScalarKind::Datetime, Value::Datetime(dt));
        roundtrip(ScalarKind::LocalDatetime, Value::LocalDatetime(dt.naive_utc()));
        roundtrip(
            ScalarKind::LocalDate,
            Value::LocalDate(NaiveDate::from_ymd_opt(1999, 12, 31).unwrap()),
        );
        roundtrip(
            ScalarKind::LocalTime,
            Value::LocalTime(NaiveTime::from_hms_micro_opt(23, 59, 59, 999_999).unwrap()),
        );
        roundtrip(ScalarKind::Duration, Value::Duration(Duration::from_micros(-5)));
        roundtrip(
            ScalarKind::RelativeDuration,
            Value::RelativeDuration(RelativeDuration {
                months: 13,
                days: -2,
                micros: 1,
            }),
        );
        roundtrip(
            ScalarKind::DateDuration,
            Value::DateDuration(DateDuration { months: 1, days: 3 }),
        );
    }

    #[test]
    fn test_datetime_epoch_is_2000() {
        let codec = Codec::scalar(ScalarKind::LocalDatetime);
        let mut r = PacketReader::new(Bytes::from_static(&[0; 8]));
        let expected = NaiveDateTime::parse_from_str("2000-01-01 00:00:00", "%Y-%m-%d %H:%M:%S")
            .unwrap();
        assert_eq!(codec.decode(&mut r).unwrap(), Value::LocalDatetime(expected));
    }

    #[test]
    fn test_scalar_type_mismatch() {
        let codec = Codec::scalar(ScalarKind::Int16);
        let mut w = PacketWriter::new();
        assert!(matches!(
            codec.encode(&mut w, &Value::Str("x".into())),
            Err(Error::Type(_))
        ));
    }

    #[test]
    fn test_array_roundtrip_with_null_element() {
        let codec = Codec::new(
            Uuid::from_u128(1),
            CodecKind::Array(Arc::new(Codec::scalar(ScalarKind::Int32))),
        );
        for items in [
            vec![],
            vec![Value::Int32(1), Value::Nothing, Value::Int32(i32::MIN)],
        ] {
            let value = Value::Array(items);
            let mut w = PacketWriter::new();
            codec.encode(&mut w, &value).unwrap();
            let mut r = PacketReader::new(w.freeze());
            assert_eq!(codec.decode(&mut r).unwrap(), value);
        }
    }

    #[test]
    fn test_object_decode() {
        let codec = Codec::new(
            Uuid::from_u128(2),
            CodecKind::Object(vec![
                ObjectField {
                    name: "id".into(),
                    flags: 1,
                    cardinality: 0x41,
                    codec: Arc::new(Codec::scalar(ScalarKind::Int64)),
                },
                ObjectField {
                    name: "name".into(),
                    flags: 0,
                    cardinality: 0x6f,
                    codec: Arc::new(Codec::scalar(ScalarKind::Str)),
                },
            ]),
        );

        let mut w = PacketWriter::new();
        w.write_i32(2);
        w.write_i32(0);
        w.write_i32(8);
        w.write_i64(42);
        w.write_i32(0);
        w.write_i32(-1);

        let value = codec.decode(&mut PacketReader::new(w.freeze())).unwrap();
        assert_eq!(
            value,
            Value::Object(vec![
                ("id".into(), Value::Int64(42)),
                ("name".into(), Value::Nothing),
            ])
        );
    }

    #[test]
    fn test_object_element_count_mismatch() {
        let codec = Codec::new(Uuid::from_u128(3), CodecKind::Object(vec![]));
        let mut w = PacketWriter::new();
        w.write_i32(1);
        assert!(matches!(
            codec.decode(&mut PacketReader::new(w.freeze())),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_oversized_counts_hit_end_of_stream() {
        let array = Codec::new(
            Uuid::from_u128(7),
            CodecKind::Array(Arc::new(Codec::scalar(ScalarKind::Int64))),
        );
        let mut w = PacketWriter::new();
        w.write_i32(1);
        w.write_i32(0);
        w.write_i32(0);
        w.write_i32(i32::MAX);
        w.write_i32(1);
        assert!(matches!(
            array.decode(&mut PacketReader::new(w.freeze())),
            Err(Error::EndOfStream { .. })
        ));

        let sparse = Codec::new(
            Uuid::from_u128(8),
            CodecKind::SparseObject(vec![NamedCodec {
                name: "a".into(),
                codec: Arc::new(Codec::scalar(ScalarKind::Int16)),
            }]),
        );
        let mut w = PacketWriter::new();
        w.write_i32(i32::MAX);
        assert!(matches!(
            sparse.decode(&mut PacketReader::new(w.freeze())),
            Err(Error::EndOfStream { .. })
        ));
    }

    #[test]
    fn test_range_roundtrip() {
        let codec = Codec::new(
            Uuid::from_u128(4),
            CodecKind::Range(Arc::new(Codec::scalar(ScalarKind::Int64))),
        );
        let bounded = Range {
            lower: Some(Box::new(Value::Int64(1))),
            upper: Some(Box::new(Value::Int64(10))),
            inc_lower: true,
            inc_upper: true,
            empty: false,
        };
        let lower_only = Range {
            lower: Some(Box::new(Value::Int64(-3))),
            upper: None,
            inc_lower: true,
            inc_upper: false,
            empty: false,
        };
        for range in [bounded, lower_only, Range::empty()] {
            let value = Value::Range(range);
            let mut w = PacketWriter::new();
            codec.encode(&mut w, &value).unwrap();
            let mut r = PacketReader::new(w.freeze());
            assert_eq!(codec.decode(&mut r).unwrap(), value);
            assert!(r.is_empty());
        }
    }

    #[test]
    fn test_null_codec_arguments() {
        let codec = Codec::null();
        assert!(codec.is_argument_codec());
        assert_eq!(
            codec.encode_arguments(&Arguments::new()).unwrap().as_ref(),
            &[0, 0, 0, 0]
        );
        let mut args = Arguments::new();
        args.insert("x".into(), Value::Int64(1));
        assert!(matches!(
            codec.encode_arguments(&args),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_object_arguments_layout() {
        let codec = Codec::new(
            Uuid::from_u128(5),
            CodecKind::Object(vec![ObjectField {
                name: "x".into(),
                flags: 0,
                cardinality: 0x41,
                codec: Arc::new(Codec::scalar(ScalarKind::Int16)),
            }]),
        );
        let mut args = Arguments::new();
        args.insert("x".into(), Value::Int16(7));

        let encoded = codec.encode_arguments(&args).unwrap();
        assert_eq!(
            encoded.as_ref(),
            &[0, 0, 0, 14, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 2, 0, 7]
        );

        args.insert("y".into(), Value::Int16(1));
        assert!(matches!(
            codec.encode_arguments(&args),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_sparse_object_sends_only_supplied() {
        let codec = Codec::new(
            Uuid::from_u128(6),
            CodecKind::SparseObject(vec![
                NamedCodec {
                    name: "a".into(),
                    codec: Arc::new(Codec::scalar(ScalarKind::Int16)),
                },
                NamedCodec {
                    name: "b".into(),
                    codec: Arc::new(Codec::scalar(ScalarKind::Int16)),
                },
            ]),
        );
        let mut args = Arguments::new();
        args.insert("b".into(), Value::Int16(9));

        let encoded = codec.encode_arguments(&args).unwrap();
        // len, count=1, index=1, elem len=2, value
        assert_eq!(
            encoded.as_ref(),
            &[0, 0, 0, 14, 0, 0, 0, 1, 0, 0, 0, 1, 0, 0, 0, 2, 0, 9]
        );

        args.insert("zzz".into(), Value::Int16(1));
        assert!(matches!(
            codec.encode_arguments(&args),
            Err(Error::MissingCodec(_))
        ));
    }

    #[test]
    fn test_scalar_cannot_encode_arguments() {
        let codec = Codec::scalar(ScalarKind::Str);
        assert!(!codec.is_argument_codec());
        assert!(matches!(
            codec.encode_arguments(&Arguments::new()),
            Err(Error::MissingCodec(_))
        ));
    }
}
