//! A small BSON value model: enough of the binary format to build index
//! terms, read them back and order them the way the query layer does.

use std::cmp::Ordering;

use crate::error::{RumError, RumResult};

/// Element type codes of the binary format.
pub mod type_code {
    pub const DOUBLE: u8 = 0x01;
    pub const UTF8: u8 = 0x02;
    pub const DOCUMENT: u8 = 0x03;
    pub const ARRAY: u8 = 0x04;
    pub const BINARY: u8 = 0x05;
    pub const UNDEFINED: u8 = 0x06;
    pub const OID: u8 = 0x07;
    pub const BOOL: u8 = 0x08;
    pub const DATE_TIME: u8 = 0x09;
    pub const NULL: u8 = 0x0A;
    pub const REGEX: u8 = 0x0B;
    pub const DBPOINTER: u8 = 0x0C;
    pub const CODE: u8 = 0x0D;
    pub const SYMBOL: u8 = 0x0E;
    pub const CODEWSCOPE: u8 = 0x0F;
    pub const INT32: u8 = 0x10;
    pub const TIMESTAMP: u8 = 0x11;
    pub const INT64: u8 = 0x12;
    pub const DECIMAL128: u8 = 0x13;
    pub const MAXKEY: u8 = 0x7F;
    pub const MINKEY: u8 = 0xFF;
}

#[derive(Debug, Clone, PartialEq)]
pub enum BsonValue {
    Double(f64),
    /// String payloads are raw bytes so truncation may cut anywhere.
    Utf8(Vec<u8>),
    Document(BsonDocument),
    Array(Vec<BsonValue>),
    Binary { subtype: u8, bytes: Vec<u8> },
    Undefined,
    ObjectId([u8; 12]),
    Bool(bool),
    DateTime(i64),
    Null,
    Regex { pattern: Vec<u8>, options: Vec<u8> },
    DbPointer { collection: Vec<u8>, id: [u8; 12] },
    Code(Vec<u8>),
    Symbol(Vec<u8>),
    CodeWScope { code: Vec<u8>, scope: BsonDocument },
    Int32(i32),
    Timestamp(u64),
    Int64(i64),
    /// IEEE 754-2008 decimal128, binary integer decimal encoding.
    Decimal128([u8; 16]),
    MaxKey,
    MinKey,
}

/// An ordered list of fields. Keys are raw bytes without the terminator.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BsonDocument {
    pub fields: Vec<(Vec<u8>, BsonValue)>,
}

impl BsonDocument {
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    pub fn with(mut self, key: &str, value: BsonValue) -> Self {
        self.fields.push((key.as_bytes().to_vec(), value));
        self
    }

    pub fn get(&self, key: &str) -> Option<&BsonValue> {
        self.fields
            .iter()
            .find(|(k, _)| k == key.as_bytes())
            .map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_document(&mut out, self.fields.iter().map(|(k, v)| (k.as_slice(), v)));
        out
    }

    pub fn from_bytes(data: &[u8]) -> RumResult<BsonDocument> {
        let (doc, _) = read_document(data)?;
        Ok(doc)
    }
}

/// Decoded form of a decimal128 value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decimal {
    NaN,
    Infinity { negative: bool },
    Finite { negative: bool, coefficient: u128, exponent: i32 },
}

const DECIMAL_EXPONENT_BIAS: i32 = 6176;
const DECIMAL_MAX_COEFFICIENT: u128 = 9_999_999_999_999_999_999_999_999_999_999_999;

pub fn decimal128(negative: bool, coefficient: u128, exponent: i32) -> [u8; 16] {
    let biased = (exponent + DECIMAL_EXPONENT_BIAS) as u64 & 0x3fff;
    let low = coefficient as u64;
    let mut high = ((coefficient >> 64) as u64) & 0x1_ffff_ffff_ffff;
    high |= biased << 49;
    if negative {
        high |= 1 << 63;
    }
    let mut out = [0u8; 16];
    out[..8].copy_from_slice(&low.to_le_bytes());
    out[8..].copy_from_slice(&high.to_le_bytes());
    out
}

pub fn decode_decimal128(raw: &[u8; 16]) -> Decimal {
    let mut low = [0u8; 8];
    let mut high = [0u8; 8];
    low.copy_from_slice(&raw[..8]);
    high.copy_from_slice(&raw[8..]);
    let (low, high) = (u64::from_le_bytes(low), u64::from_le_bytes(high));
    let negative = high >> 63 == 1;
    let (exponent, coefficient) = if (high >> 61) & 3 == 3 {
        if (high >> 59) & 3 == 3 {
            return if (high >> 58) & 1 == 1 {
                Decimal::NaN
            } else {
                Decimal::Infinity { negative }
            };
        }
        // non-canonical large coefficients are zero
        (((high >> 47) & 0x3fff) as i32, 0u128)
    } else {
        let coefficient = (((high & 0x1_ffff_ffff_ffff) as u128) << 64) | low as u128;
        let coefficient = if coefficient > DECIMAL_MAX_COEFFICIENT {
            0
        } else {
            coefficient
        };
        (((high >> 49) & 0x3fff) as i32, coefficient)
    };
    Decimal::Finite {
        negative,
        coefficient,
        exponent: exponent - DECIMAL_EXPONENT_BIAS,
    }
}

fn decimal_to_f64(raw: &[u8; 16]) -> f64 {
    match decode_decimal128(raw) {
        Decimal::NaN => f64::NAN,
        Decimal::Infinity { negative } => {
            if negative {
                f64::NEG_INFINITY
            } else {
                f64::INFINITY
            }
        }
        Decimal::Finite {
            negative,
            coefficient,
            exponent,
        } => {
            let magnitude = coefficient as f64 * 10f64.powi(exponent);
            if negative {
                -magnitude
            } else {
                magnitude
            }
        }
    }
}

/// Sort classes. Values of different classes order by class alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SortClass {
    MinKey,
    Undefined,
    Null,
    Number,
    String,
    Document,
    Array,
    Binary,
    ObjectId,
    Bool,
    DateTime,
    Timestamp,
    Regex,
    DbPointer,
    Code,
    CodeWScope,
    MaxKey,
}

impl BsonValue {
    pub fn string(s: &str) -> Self {
        BsonValue::Utf8(s.as_bytes().to_vec())
    }

    pub fn type_code(&self) -> u8 {
        use type_code::*;
        match self {
            BsonValue::Double(_) => DOUBLE,
            BsonValue::Utf8(_) => UTF8,
            BsonValue::Document(_) => DOCUMENT,
            BsonValue::Array(_) => ARRAY,
            BsonValue::Binary { .. } => BINARY,
            BsonValue::Undefined => UNDEFINED,
            BsonValue::ObjectId(_) => OID,
            BsonValue::Bool(_) => BOOL,
            BsonValue::DateTime(_) => DATE_TIME,
            BsonValue::Null => NULL,
            BsonValue::Regex { .. } => REGEX,
            BsonValue::DbPointer { .. } => DBPOINTER,
            BsonValue::Code(_) => CODE,
            BsonValue::Symbol(_) => SYMBOL,
            BsonValue::CodeWScope { .. } => CODEWSCOPE,
            BsonValue::Int32(_) => INT32,
            BsonValue::Timestamp(_) => TIMESTAMP,
            BsonValue::Int64(_) => INT64,
            BsonValue::Decimal128(_) => DECIMAL128,
            BsonValue::MaxKey => MAXKEY,
            BsonValue::MinKey => MINKEY,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            BsonValue::Double(_) => "double",
            BsonValue::Utf8(_) => "string",
            BsonValue::Document(_) => "object",
            BsonValue::Array(_) => "array",
            BsonValue::Binary { .. } => "binData",
            BsonValue::Undefined => "undefined",
            BsonValue::ObjectId(_) => "objectId",
            BsonValue::Bool(_) => "bool",
            BsonValue::DateTime(_) => "date",
            BsonValue::Null => "null",
            BsonValue::Regex { .. } => "regex",
            BsonValue::DbPointer { .. } => "dbPointer",
            BsonValue::Code(_) => "javascript",
            BsonValue::Symbol(_) => "symbol",
            BsonValue::CodeWScope { .. } => "javascriptWithScope",
            BsonValue::Int32(_) => "int",
            BsonValue::Timestamp(_) => "timestamp",
            BsonValue::Int64(_) => "long",
            BsonValue::Decimal128(_) => "decimal",
            BsonValue::MaxKey => "maxKey",
            BsonValue::MinKey => "minKey",
        }
    }

    pub fn sort_class(&self) -> SortClass {
        match self {
            BsonValue::MinKey => SortClass::MinKey,
            BsonValue::Undefined => SortClass::Undefined,
            BsonValue::Null => SortClass::Null,
            BsonValue::Double(_)
            | BsonValue::Int32(_)
            | BsonValue::Int64(_)
            | BsonValue::Decimal128(_) => SortClass::Number,
            BsonValue::Utf8(_) | BsonValue::Symbol(_) => SortClass::String,
            BsonValue::Document(_) => SortClass::Document,
            BsonValue::Array(_) => SortClass::Array,
            BsonValue::Binary { .. } => SortClass::Binary,
            BsonValue::ObjectId(_) => SortClass::ObjectId,
            BsonValue::Bool(_) => SortClass::Bool,
            BsonValue::DateTime(_) => SortClass::DateTime,
            BsonValue::Timestamp(_) => SortClass::Timestamp,
            BsonValue::Regex { .. } => SortClass::Regex,
            BsonValue::DbPointer { .. } => SortClass::DbPointer,
            BsonValue::Code(_) => SortClass::Code,
            BsonValue::CodeWScope { .. } => SortClass::CodeWScope,
            BsonValue::MaxKey => SortClass::MaxKey,
        }
    }

    pub fn is_number(&self) -> bool {
        self.sort_class() == SortClass::Number
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            BsonValue::Double(v) => Some(*v),
            BsonValue::Int32(v) => Some(*v as f64),
            BsonValue::Int64(v) => Some(*v as f64),
            BsonValue::Decimal128(raw) => Some(decimal_to_f64(raw)),
            _ => None,
        }
    }

    /// The exact integer value of a numeric, if it has one.
    pub fn as_exact_i64(&self) -> Option<i64> {
        match self {
            BsonValue::Int32(v) => Some(*v as i64),
            BsonValue::Int64(v) => Some(*v),
            BsonValue::Double(_) | BsonValue::Decimal128(_) => {
                let v = self.as_f64()?;
                if v.is_finite() && v.fract() == 0.0 && v >= -(2f64.powi(63)) && v < 2f64.powi(63) {
                    Some(v as i64)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Rewrites a numeric to the smallest type that keeps its value, so
    /// numerically equal values of different types serialize alike.
    pub fn canonical_number(&self) -> BsonValue {
        if let Some(v) = self.as_exact_i64() {
            return match i32::try_from(v) {
                Ok(v) => BsonValue::Int32(v),
                Err(_) => BsonValue::Int64(v),
            };
        }
        match self {
            BsonValue::Double(v) => BsonValue::Double(*v),
            BsonValue::Decimal128(raw) => {
                let v = decimal_to_f64(raw);
                let zero = matches!(
                    decode_decimal128(raw),
                    Decimal::Finite { coefficient: 0, .. }
                );
                if v.is_nan() || (v.is_finite() && (v != 0.0 || zero)) {
                    BsonValue::Double(v)
                } else {
                    BsonValue::Decimal128(*raw)
                }
            }
            other => other.clone(),
        }
    }
}

fn compare_numbers(a: &BsonValue, b: &BsonValue) -> Ordering {
    let ints = |v: &BsonValue| match v {
        BsonValue::Int32(v) => Some(*v as i64),
        BsonValue::Int64(v) => Some(*v),
        _ => None,
    };
    if let (Some(a), Some(b)) = (ints(a), ints(b)) {
        return a.cmp(&b);
    }
    let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

fn compare_fields<'a>(
    a: impl Iterator<Item = (&'a [u8], &'a BsonValue)>,
    b: impl Iterator<Item = (&'a [u8], &'a BsonValue)>,
    valid: &mut bool,
) -> Ordering {
    let mut a = a.peekable();
    let mut b = b.peekable();
    loop {
        match (a.next(), b.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some((ka, va)), Some((kb, vb))) => {
                let ord = va
                    .sort_class()
                    .cmp(&vb.sort_class())
                    .then_with(|| ka.cmp(kb))
                    .then_with(|| compare_values(va, vb, valid));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

/// Orders two values by sort class, then by value. `valid` is cleared when
/// the values belong to different classes.
pub fn compare_values(a: &BsonValue, b: &BsonValue, valid: &mut bool) -> Ordering {
    let (ca, cb) = (a.sort_class(), b.sort_class());
    if ca != cb {
        *valid = false;
        return ca.cmp(&cb);
    }
    match (a, b) {
        (a, b) if ca == SortClass::Number => compare_numbers(a, b),
        (BsonValue::Utf8(x) | BsonValue::Symbol(x), BsonValue::Utf8(y) | BsonValue::Symbol(y)) => {
            x.cmp(y)
        }
        (BsonValue::Document(x), BsonValue::Document(y)) => compare_fields(
            x.fields.iter().map(|(k, v)| (k.as_slice(), v)),
            y.fields.iter().map(|(k, v)| (k.as_slice(), v)),
            valid,
        ),
        (BsonValue::Array(x), BsonValue::Array(y)) => compare_fields(
            x.iter().map(|v| (&[][..], v)),
            y.iter().map(|v| (&[][..], v)),
            valid,
        ),
        (
            BsonValue::Binary {
                subtype: sa,
                bytes: ba,
            },
            BsonValue::Binary {
                subtype: sb,
                bytes: bb,
            },
        ) => ba.len().cmp(&bb.len()).then(sa.cmp(sb)).then_with(|| ba.cmp(bb)),
        (BsonValue::ObjectId(x), BsonValue::ObjectId(y)) => x.cmp(y),
        (BsonValue::Bool(x), BsonValue::Bool(y)) => x.cmp(y),
        (BsonValue::DateTime(x), BsonValue::DateTime(y)) => x.cmp(y),
        (BsonValue::Timestamp(x), BsonValue::Timestamp(y)) => x.cmp(y),
        (
            BsonValue::Regex {
                pattern: pa,
                options: oa,
            },
            BsonValue::Regex {
                pattern: pb,
                options: ob,
            },
        ) => pa.cmp(pb).then_with(|| oa.cmp(ob)),
        (
            BsonValue::DbPointer {
                collection: ca,
                id: ia,
            },
            BsonValue::DbPointer {
                collection: cb,
                id: ib,
            },
        ) => ca.len().cmp(&cb.len()).then_with(|| ca.cmp(cb)).then(ia.cmp(ib)),
        (BsonValue::Code(x), BsonValue::Code(y)) => x.cmp(y),
        (
            BsonValue::CodeWScope {
                code: xa,
                scope: sa,
            },
            BsonValue::CodeWScope {
                code: xb,
                scope: sb,
            },
        ) => xa.cmp(xb).then_with(|| {
            compare_fields(
                sa.fields.iter().map(|(k, v)| (k.as_slice(), v)),
                sb.fields.iter().map(|(k, v)| (k.as_slice(), v)),
                valid,
            )
        }),
        _ => Ordering::Equal,
    }
}

fn write_cstring(out: &mut Vec<u8>, s: &[u8]) {
    out.extend_from_slice(s);
    out.push(0);
}

fn write_string(out: &mut Vec<u8>, s: &[u8]) {
    out.extend_from_slice(&(s.len() as i32 + 1).to_le_bytes());
    write_cstring(out, s);
}

/// Writes a document from its fields, with length prefix and terminator.
pub fn write_document<'a>(out: &mut Vec<u8>, fields: impl Iterator<Item = (&'a [u8], &'a BsonValue)>) {
    let start = out.len();
    out.extend_from_slice(&[0; 4]);
    for (key, value) in fields {
        append_element(out, key, value);
    }
    out.push(0);
    let len = (out.len() - start) as i32;
    out[start..start + 4].copy_from_slice(&len.to_le_bytes());
}

fn array_keys(values: &[BsonValue]) -> impl Iterator<Item = (Vec<u8>, &BsonValue)> {
    values
        .iter()
        .enumerate()
        .map(|(i, v)| (i.to_string().into_bytes(), v))
}

/// Writes the value part of an element.
pub fn write_value(out: &mut Vec<u8>, value: &BsonValue) {
    match value {
        BsonValue::Double(v) => out.extend_from_slice(&v.to_le_bytes()),
        BsonValue::Utf8(s) | BsonValue::Code(s) | BsonValue::Symbol(s) => write_string(out, s),
        BsonValue::Document(doc) => {
            write_document(out, doc.fields.iter().map(|(k, v)| (k.as_slice(), v)))
        }
        BsonValue::Array(values) => {
            let keyed: Vec<_> = array_keys(values).collect();
            write_document(out, keyed.iter().map(|(k, v)| (k.as_slice(), *v)));
        }
        BsonValue::Binary { subtype, bytes } => {
            out.extend_from_slice(&(bytes.len() as i32).to_le_bytes());
            out.push(*subtype);
            out.extend_from_slice(bytes);
        }
        BsonValue::Undefined | BsonValue::Null | BsonValue::MaxKey | BsonValue::MinKey => {}
        BsonValue::ObjectId(id) => out.extend_from_slice(id),
        BsonValue::Bool(v) => out.push(*v as u8),
        BsonValue::DateTime(v) => out.extend_from_slice(&v.to_le_bytes()),
        BsonValue::Regex { pattern, options } => {
            write_cstring(out, pattern);
            write_cstring(out, options);
        }
        BsonValue::DbPointer { collection, id } => {
            write_string(out, collection);
            out.extend_from_slice(id);
        }
        BsonValue::CodeWScope { code, scope } => {
            let start = out.len();
            out.extend_from_slice(&[0; 4]);
            write_string(out, code);
            write_document(out, scope.fields.iter().map(|(k, v)| (k.as_slice(), v)));
            let len = (out.len() - start) as i32;
            out[start..start + 4].copy_from_slice(&len.to_le_bytes());
        }
        BsonValue::Int32(v) => out.extend_from_slice(&v.to_le_bytes()),
        BsonValue::Timestamp(v) => out.extend_from_slice(&v.to_le_bytes()),
        BsonValue::Int64(v) => out.extend_from_slice(&v.to_le_bytes()),
        BsonValue::Decimal128(raw) => out.extend_from_slice(raw),
    }
}

/// Appends `key: value` to an open document body.
pub fn append_element(out: &mut Vec<u8>, key: &[u8], value: &BsonValue) {
    out.push(value.type_code());
    write_cstring(out, key);
    write_value(out, value);
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

fn corrupt(what: &str) -> RumError {
    RumError::internal(format!("invalid bson: {}", what))
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> RumResult<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|&end| end <= self.data.len());
        let end = end.ok_or_else(|| corrupt("unexpected end of data"))?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn fixed<const N: usize>(&mut self) -> RumResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> RumResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn i32(&mut self) -> RumResult<i32> {
        Ok(i32::from_le_bytes(self.fixed()?))
    }

    fn cstring(&mut self) -> RumResult<Vec<u8>> {
        let rest = &self.data[self.pos..];
        let len = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| corrupt("unterminated string"))?;
        let s = rest[..len].to_vec();
        self.pos += len + 1;
        Ok(s)
    }

    fn string(&mut self) -> RumResult<Vec<u8>> {
        let len = self.i32()?;
        if len < 1 {
            return Err(corrupt("negative string length"));
        }
        let bytes = self.take(len as usize)?;
        Ok(bytes[..bytes.len() - 1].to_vec())
    }

    fn document(&mut self) -> RumResult<BsonDocument> {
        let (doc, used) = read_document(&self.data[self.pos..])?;
        self.pos += used;
        Ok(doc)
    }

    fn value(&mut self, code: u8) -> RumResult<BsonValue> {
        use type_code::*;
        Ok(match code {
            DOUBLE => BsonValue::Double(f64::from_le_bytes(self.fixed()?)),
            UTF8 => BsonValue::Utf8(self.string()?),
            DOCUMENT => BsonValue::Document(self.document()?),
            ARRAY => BsonValue::Array(self.document()?.fields.into_iter().map(|(_, v)| v).collect()),
            BINARY => {
                let len = self.i32()?;
                let subtype = self.u8()?;
                let bytes = self.take(len.max(0) as usize)?.to_vec();
                BsonValue::Binary { subtype, bytes }
            }
            UNDEFINED => BsonValue::Undefined,
            OID => BsonValue::ObjectId(self.fixed()?),
            BOOL => BsonValue::Bool(self.u8()? != 0),
            DATE_TIME => BsonValue::DateTime(i64::from_le_bytes(self.fixed()?)),
            NULL => BsonValue::Null,
            REGEX => BsonValue::Regex {
                pattern: self.cstring()?,
                options: self.cstring()?,
            },
            DBPOINTER => BsonValue::DbPointer {
                collection: self.string()?,
                id: self.fixed()?,
            },
            CODE => BsonValue::Code(self.string()?),
            SYMBOL => BsonValue::Symbol(self.string()?),
            CODEWSCOPE => {
                self.i32()?;
                BsonValue::CodeWScope {
                    code: self.string()?,
                    scope: self.document()?,
                }
            }
            INT32 => BsonValue::Int32(self.i32()?),
            TIMESTAMP => BsonValue::Timestamp(u64::from_le_bytes(self.fixed()?)),
            INT64 => BsonValue::Int64(i64::from_le_bytes(self.fixed()?)),
            DECIMAL128 => BsonValue::Decimal128(self.fixed()?),
            MAXKEY => BsonValue::MaxKey,
            MINKEY => BsonValue::MinKey,
            other => return Err(corrupt(&format!("unknown type code 0x{:02x}", other))),
        })
    }
}

/// Reads a document and returns it with the number of bytes it spans.
pub fn read_document(data: &[u8]) -> RumResult<(BsonDocument, usize)> {
    let mut reader = Reader { data, pos: 0 };
    let len = reader.i32()?;
    if len < 5 || len as usize > data.len() {
        return Err(corrupt("bad document length"));
    }
    let mut body = Reader {
        data: &data[..len as usize],
        pos: 4,
    };
    let mut doc = BsonDocument::new();
    loop {
        let code = body.u8()?;
        if code == 0 {
            break;
        }
        let key = body.cstring()?;
        let value = body.value(code)?;
        doc.fields.push((key, value));
    }
    if body.pos != len as usize {
        return Err(corrupt("trailing bytes in document"));
    }
    Ok((doc, len as usize))
}

/// Encoded size of an element with a key of `key_len` bytes.
pub fn element_size(key_len: usize, value: &BsonValue) -> usize {
    let mut out = Vec::new();
    write_value(&mut out, value);
    2 + key_len + out.len()
}
