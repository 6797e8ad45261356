use std::cmp::Ordering;

use crate::error::{RumError, RumResult};

/// A column value or entry key as handed to and from operator classes.
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Int(i64),
    Float(f64),
    Bytes(Vec<u8>),
}

impl Datum {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Datum::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Datum::Float(v) => Some(*v),
            Datum::Int(v) => Some(*v as f64),
            Datum::Bytes(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Datum::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn text(s: &str) -> Self {
        Datum::Bytes(s.as_bytes().to_vec())
    }
}

/// Storage class of a key or AddInfo type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeInfo {
    /// Signed integer passed by value, with its length in bytes (1, 2, 4, 8).
    Int(u8),
    Float4,
    Float8,
    /// Variable length, passed by reference.
    Varlena,
}

impl TypeInfo {
    pub fn name(self) -> &'static str {
        match self {
            TypeInfo::Int(1) => "char",
            TypeInfo::Int(2) => "smallint",
            TypeInfo::Int(4) => "integer",
            TypeInfo::Int(_) => "bigint",
            TypeInfo::Float4 => "real",
            TypeInfo::Float8 => "double precision",
            TypeInfo::Varlena => "bytea",
        }
    }

    pub fn by_val(self) -> bool {
        !matches!(self, TypeInfo::Varlena)
    }

    /// Fixed length in bytes, -1 for variable length types.
    pub fn len(self) -> i16 {
        match self {
            TypeInfo::Int(len) => len as i16,
            TypeInfo::Float4 => 4,
            TypeInfo::Float8 => 8,
            TypeInfo::Varlena => -1,
        }
    }

    fn mismatch(self, datum: &Datum) -> RumError {
        RumError::internal(format!(
            "datum {:?} does not match type {}",
            datum,
            self.name()
        ))
    }

    /// Packs a by-value datum into the raw word stored in postings.
    pub fn to_raw(self, datum: &Datum) -> RumResult<u64> {
        match (self, datum) {
            (TypeInfo::Int(_), Datum::Int(v)) => Ok(*v as u64),
            (TypeInfo::Float4, Datum::Float(v)) => Ok((*v as f32).to_bits() as u64),
            (TypeInfo::Float8, Datum::Float(v)) => Ok(v.to_bits()),
            (TypeInfo::Varlena, _) => Err(RumError::not_supported(format!(
                "{} is not supported as additional info type",
                self.name()
            ))),
            _ => Err(self.mismatch(datum)),
        }
    }

    pub fn from_raw(self, raw: u64) -> Datum {
        match self {
            TypeInfo::Int(1) => Datum::Int(raw as u8 as i8 as i64),
            TypeInfo::Int(2) => Datum::Int(raw as u16 as i16 as i64),
            TypeInfo::Int(4) => Datum::Int(raw as u32 as i32 as i64),
            TypeInfo::Int(_) => Datum::Int(raw as i64),
            TypeInfo::Float4 => Datum::Float(f32::from_bits(raw as u32) as f64),
            TypeInfo::Float8 => Datum::Float(f64::from_bits(raw)),
            TypeInfo::Varlena => Datum::Int(raw as i64),
        }
    }

    /// Appends the stored form of a key datum.
    pub fn write(self, datum: &Datum, out: &mut Vec<u8>) -> RumResult<()> {
        match (self, datum) {
            (TypeInfo::Varlena, Datum::Bytes(bytes)) => {
                out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                out.extend_from_slice(bytes);
            }
            (TypeInfo::Varlena, _) => return Err(self.mismatch(datum)),
            _ => {
                let raw = self.to_raw(datum)?;
                out.extend_from_slice(&raw.to_le_bytes()[..self.len() as usize]);
            }
        }
        Ok(())
    }

    pub fn stored_size(self, datum: &Datum) -> usize {
        match datum {
            Datum::Bytes(bytes) if self == TypeInfo::Varlena => 4 + bytes.len(),
            _ => self.len().max(0) as usize,
        }
    }

    /// Reads a stored key datum, returning it with the number of bytes used.
    pub fn read(self, data: &[u8]) -> RumResult<(Datum, usize)> {
        let truncated = || RumError::internal("entry tuple is truncated");
        match self {
            TypeInfo::Varlena => {
                let mut word = [0u8; 4];
                word.copy_from_slice(data.get(..4).ok_or_else(truncated)?);
                let len = u32::from_le_bytes(word) as usize;
                let bytes = data.get(4..4 + len).ok_or_else(truncated)?;
                Ok((Datum::Bytes(bytes.to_vec()), 4 + len))
            }
            _ => {
                let len = self.len() as usize;
                let mut raw = [0u8; 8];
                raw[..len].copy_from_slice(data.get(..len).ok_or_else(truncated)?);
                Ok((self.from_raw(u64::from_le_bytes(raw)), len))
            }
        }
    }
}

/// Default btree comparison for the datum model.
pub fn datum_cmp(a: &Datum, b: &Datum) -> Ordering {
    match (a, b) {
        (Datum::Int(a), Datum::Int(b)) => a.cmp(b),
        (Datum::Bytes(a), Datum::Bytes(b)) => a.cmp(b),
        (Datum::Bytes(_), _) => Ordering::Greater,
        (_, Datum::Bytes(_)) => Ordering::Less,
        (a, b) => {
            let (a, b) = (a.as_float().unwrap_or(0.0), b.as_float().unwrap_or(0.0));
            a.total_cmp(&b)
        }
    }
}
