//! In-memory representation of values moving through the codec tree.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use uuid::Uuid;

use crate::error::{Error, Result};

/// A decoded query result value, or an argument to be encoded.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Absent value (empty set element, null field, no result).
    Nothing,
    Uuid(Uuid),
    Str(String),
    Bytes(Bytes),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Decimal(Decimal),
    BigInt(BigInt),
    Bool(bool),
    Datetime(DateTime<Utc>),
    LocalDatetime(NaiveDateTime),
    LocalDate(NaiveDate),
    LocalTime(NaiveTime),
    Duration(Duration),
    RelativeDuration(RelativeDuration),
    DateDuration(DateDuration),
    Json(serde_json::Value),
    Set(Vec<Value>),
    Array(Vec<Value>),
    Tuple(Vec<Value>),
    NamedTuple(Vec<(String, Value)>),
    Object(Vec<(String, Value)>),
    Range(Range),
}

impl Value {
    pub fn is_nothing(&self) -> bool {
        matches!(self, Value::Nothing)
    }

    /// Field lookup on objects and named tuples.
    pub fn get(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Object(fields) | Value::NamedTuple(fields) => {
                fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
            }
            _ => None,
        }
    }

    /// Short type label used in conversion errors.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Nothing => "nothing",
            Value::Uuid(_) => "uuid",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::Int16(_) => "int16",
            Value::Int32(_) => "int32",
            Value::Int64(_) => "int64",
            Value::Float32(_) => "float32",
            Value::Float64(_) => "float64",
            Value::Decimal(_) => "decimal",
            Value::BigInt(_) => "bigint",
            Value::Bool(_) => "bool",
            Value::Datetime(_) => "datetime",
            Value::LocalDatetime(_) => "local_datetime",
            Value::LocalDate(_) => "local_date",
            Value::LocalTime(_) => "local_time",
            Value::Duration(_) => "duration",
            Value::RelativeDuration(_) => "relative_duration",
            Value::DateDuration(_) => "date_duration",
            Value::Json(_) => "json",
            Value::Set(_) => "set",
            Value::Array(_) => "array",
            Value::Tuple(_) => "tuple",
            Value::NamedTuple(_) => "named tuple",
            Value::Object(_) => "object",
            Value::Range(_) => "range",
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::Int16(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Value::Uuid(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Nothing)
    }
}

// ============================================================================
// Arbitrary precision numbers
// ============================================================================

const NBASE: u32 = 10_000;

/// Arbitrary precision decimal in base-10000 digit form.
///
/// `weight` is the power of 10000 of the first digit, `scale` the number of
/// decimal digits after the point. Digits carry no leading or trailing zero
/// groups once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decimal {
    pub negative: bool,
    pub weight: i16,
    pub scale: u16,
    pub digits: Vec<u16>,
}

/// Arbitrary precision integer, stored like [`Decimal`] with no scale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BigInt {
    pub negative: bool,
    pub weight: i16,
    pub digits: Vec<u16>,
}

/// Split `[-]int[.frac]` text into base-10000 digit groups.
fn parse_numeric(s: &str) -> Result<(bool, i16, u16, Vec<u16>)> {
    let s = s.trim();
    let (negative, body) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let (int_part, frac_part) = match body.split_once('.') {
        Some((i, f)) => (i, f),
        None => (body, ""),
    };
    if int_part.is_empty() && frac_part.is_empty()
        || !int_part.bytes().all(|b| b.is_ascii_digit())
        || !frac_part.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(Error::Type(format!("Invalid numeric literal: {:?}", s)));
    }

    let scale = u16::try_from(frac_part.len())
        .map_err(|_| Error::Type("Numeric scale out of range".to_string()))?;

    let int_part = int_part.trim_start_matches('0');
    let int_pad = (4 - int_part.len() % 4) % 4;
    let frac_pad = (4 - frac_part.len() % 4) % 4;

    let mut text = String::with_capacity(int_pad + int_part.len() + frac_part.len() + frac_pad);
    text.extend(std::iter::repeat('0').take(int_pad));
    text.push_str(int_part);
    let int_groups = text.len() / 4;
    text.push_str(frac_part);
    text.extend(std::iter::repeat('0').take(frac_pad));

    let mut digits: Vec<u16> = text
        .as_bytes()
        .chunks(4)
        .map(|chunk| {
            chunk
                .iter()
                .fold(0u16, |acc, b| acc * 10 + u16::from(b - b'0'))
        })
        .collect();

    let mut weight = int_groups as i32 - 1;
    let leading = digits.iter().take_while(|d| **d == 0).count();
    digits.drain(..leading);
    weight -= leading as i32;
    while digits.last() == Some(&0) {
        digits.pop();
    }

    if digits.is_empty() {
        return Ok((false, 0, scale, digits));
    }

    let weight =
        i16::try_from(weight).map_err(|_| Error::Type("Numeric weight out of range".to_string()))?;
    Ok((negative, weight, scale, digits))
}

fn digit_at(digits: &[u16], index: i32) -> u16 {
    if index < 0 {
        return 0;
    }
    digits.get(index as usize).copied().unwrap_or(0)
}

fn format_integer_part(f: &mut fmt::Formatter<'_>, weight: i16, digits: &[u16]) -> fmt::Result {
    if weight < 0 || digits.is_empty() {
        return write!(f, "0");
    }
    write!(f, "{}", digit_at(digits, 0))?;
    for i in 1..=weight as i32 {
        write!(f, "{:04}", digit_at(digits, i))?;
    }
    Ok(())
}

impl FromStr for Decimal {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (negative, weight, scale, digits) = parse_numeric(s)?;
        Ok(Decimal {
            negative,
            weight,
            scale,
            digits,
        })
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negative && !self.digits.is_empty() {
            write!(f, "-")?;
        }
        format_integer_part(f, self.weight, &self.digits)?;
        if self.scale > 0 {
            let mut frac = String::with_capacity(self.scale as usize + 4);
            let mut index = self.weight as i32 + 1;
            while frac.len() < self.scale as usize {
                frac.push_str(&format!("{:04}", digit_at(&self.digits, index)));
                index += 1;
            }
            frac.truncate(self.scale as usize);
            write!(f, ".{}", frac)?;
        }
        Ok(())
    }
}

impl FromStr for BigInt {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.contains('.') {
            return Err(Error::Type(format!("Invalid bigint literal: {:?}", s)));
        }
        let (negative, weight, _, digits) = parse_numeric(s)?;
        Ok(BigInt {
            negative,
            weight,
            digits,
        })
    }
}

impl fmt::Display for BigInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negative && !self.digits.is_empty() {
            write!(f, "-")?;
        }
        format_integer_part(f, self.weight, &self.digits)
    }
}

impl From<i64> for BigInt {
    fn from(v: i64) -> Self {
        let negative = v < 0;
        let mut rest = v.unsigned_abs();
        let mut digits = Vec::new();
        while rest > 0 {
            digits.push((rest % NBASE as u64) as u16);
            rest /= NBASE as u64;
        }
        digits.reverse();
        let weight = digits.len() as i16 - 1;
        while digits.last() == Some(&0) {
            digits.pop();
        }
        if digits.is_empty() {
            return BigInt {
                negative: false,
                weight: 0,
                digits,
            };
        }
        BigInt {
            negative,
            weight,
            digits,
        }
    }
}

// ============================================================================
// Durations
// ============================================================================

/// Exact time span in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Duration {
    pub micros: i64,
}

impl Duration {
    pub fn from_micros(micros: i64) -> Self {
        Self { micros }
    }
}

/// Calendar-relative span: months and days stay symbolic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RelativeDuration {
    pub months: i32,
    pub days: i32,
    pub micros: i64,
}

/// Calendar span without a time component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DateDuration {
    pub months: i32,
    pub days: i32,
}

// ============================================================================
// Range
// ============================================================================

/// Range over a scalar element type. `None` bounds are infinite.
#[derive(Debug, Clone, PartialEq)]
pub struct Range {
    pub lower: Option<Box<Value>>,
    pub upper: Option<Box<Value>>,
    pub inc_lower: bool,
    pub inc_upper: bool,
    pub empty: bool,
}

impl Range {
    pub fn new(lower: Option<Value>, upper: Option<Value>) -> Self {
        Self {
            lower: lower.map(Box::new),
            upper: upper.map(Box::new),
            inc_lower: true,
            inc_upper: false,
            empty: false,
        }
    }

    pub fn empty() -> Self {
        Self {
            lower: None,
            upper: None,
            inc_lower: false,
            inc_upper: false,
            empty: true,
        }
    }
}
