//! Index terms: a metadata byte followed by a one field document
//! `{ path: value }`, bounded in size by truncating the value.
//!
//! Terms order by metadata class, then path, then value, with the
//! undefined, maybe-undefined and truncated markers breaking ties.
//! Composite terms concatenate length prefixed sub-terms after a
//! [`COMPOSITE`] byte and order pairwise.

use std::cmp::Ordering;

use arrayvec::ArrayVec;

use super::bson::{self, BsonDocument, BsonValue};
use crate::error::{RumError, RumResult};

pub const INDEX_MAX_KEYS: usize = 32;

pub const NO_METADATA: u8 = 0x00;
pub const TRUNCATED: u8 = 0x01;
pub const IS_METADATA: u8 = 0x02;
pub const COMPOSITE: u8 = 0x04;
pub const UNDEFINED_VALUE: u8 = 0x08;
pub const PARTIAL_UNDEFINED: u8 = 0x0C;
pub const COMPRESSED: u8 = 0x10;
pub const DESCENDING: u8 = 0x80;

/// The metadata byte of a term, without the compression bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermMetadata(pub u8);

impl TermMetadata {
    fn base(self) -> u8 {
        self.0 & !DESCENDING
    }

    pub fn is_descending(self) -> bool {
        self.0 >= DESCENDING
    }

    pub fn is_metadata(self) -> bool {
        self.0 == IS_METADATA
    }

    pub fn is_composite(self) -> bool {
        self.0 == COMPOSITE
    }

    pub fn is_truncated(self) -> bool {
        self.base() == TRUNCATED
    }

    pub fn is_value_undefined(self) -> bool {
        self.base() == UNDEFINED_VALUE
    }

    pub fn is_maybe_undefined(self) -> bool {
        self.base() == PARTIAL_UNDEFINED
    }
}

/// How terms of one index column are built.
#[derive(Debug, Clone)]
pub struct TermCreateMetadata {
    /// Size bound of a serialized term, 0 or less for unbounded.
    pub size_limit: i32,
    pub path_prefix: Vec<u8>,
    pub is_wildcard: bool,
    pub is_wildcard_projection: bool,
    pub wildcard_path_limit: i32,
    pub is_descending: bool,
    /// Terms larger than this are stored compressed.
    pub compression_threshold: i32,
}

impl Default for TermCreateMetadata {
    fn default() -> Self {
        Self {
            size_limit: 0,
            path_prefix: Vec::new(),
            is_wildcard: false,
            is_wildcard_projection: false,
            wildcard_path_limit: i32::MAX,
            is_descending: false,
            compression_threshold: i32::MAX,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SerializedTerm {
    pub bytes: Vec<u8>,
    pub truncated: bool,
    pub is_root_metadata: bool,
}

/// A decoded non-composite term.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexTerm {
    pub metadata: TermMetadata,
    pub path: Vec<u8>,
    pub value: BsonValue,
}

impl IndexTerm {
    pub fn parse(raw: &[u8]) -> RumResult<IndexTerm> {
        let (&first, body) = raw
            .split_first()
            .ok_or_else(|| RumError::internal("empty index term"))?;
        let decompressed;
        let body = if first & COMPRESSED != 0 {
            decompressed = decompress(body)?;
            &decompressed[..]
        } else {
            body
        };
        let metadata = TermMetadata(first & !COMPRESSED);
        if metadata.is_composite() {
            return Err(RumError::internal(
                "Cannot read composite index term as a single term",
            ));
        }
        let doc = BsonDocument::from_bytes(body)?;
        let (path, value) = doc
            .fields
            .into_iter()
            .next()
            .ok_or_else(|| RumError::internal("index term has no value"))?;
        Ok(IndexTerm {
            metadata,
            path,
            value,
        })
    }

    pub fn is_truncated(&self) -> bool {
        self.metadata.is_truncated()
    }
}

/// A document writer that tracks its encoded size as it grows.
struct DocWriter {
    buf: Vec<u8>,
    next_index: usize,
}

impl DocWriter {
    fn new() -> Self {
        Self {
            buf: vec![0; 4],
            next_index: 0,
        }
    }

    /// Encoded size including the terminator.
    fn size(&self) -> i32 {
        self.buf.len() as i32 + 1
    }

    fn append(&mut self, key: &[u8], value: &BsonValue) {
        bson::append_element(&mut self.buf, key, value);
    }

    fn append_raw(&mut self, key: &[u8], code: u8, body: Vec<u8>) {
        self.buf.push(code);
        self.buf.extend_from_slice(key);
        self.buf.push(0);
        self.buf.extend_from_slice(&body);
    }

    fn next_array_key(&mut self) -> Vec<u8> {
        let key = self.next_index.to_string().into_bytes();
        self.next_index += 1;
        key
    }

    fn finish(mut self) -> Vec<u8> {
        self.buf.push(0);
        let len = self.buf.len() as i32;
        self.buf[..4].copy_from_slice(&len.to_le_bytes());
        self.buf
    }
}

/// Shortens a string-like payload so that `data_size` plus the encoded
/// payload fits `limit`. Returns the new length when it had to cut.
fn truncate_string_like(
    data_size: i32,
    limit: i32,
    value: &BsonValue,
    len: usize,
) -> RumResult<Option<usize>> {
    let string_len = len as i32;
    let required = data_size + 4 + string_len + 1;
    if required <= limit {
        return Ok(None);
    }
    let excess = required - limit;
    if excess >= string_len {
        let message = format!(
            "Cannot create index key required length {} for type {} exceeds max size {}.",
            string_len,
            value.type_name(),
            limit
        );
        return Err(RumError::limit_exceeded(message.clone()).with_detail(message));
    }
    Ok(Some((string_len - excess) as usize))
}

fn cut_string_like(value: &BsonValue, len: usize) -> BsonValue {
    match value {
        BsonValue::Utf8(s) => BsonValue::Utf8(s[..len].to_vec()),
        BsonValue::Code(s) => BsonValue::Code(s[..len].to_vec()),
        BsonValue::Symbol(s) => BsonValue::Symbol(s[..len].to_vec()),
        BsonValue::Binary { subtype, bytes } => BsonValue::Binary {
            subtype: *subtype,
            bytes: bytes[..len].to_vec(),
        },
        other => other.clone(),
    }
}

fn string_like_len(value: &BsonValue) -> Option<usize> {
    match value {
        BsonValue::Utf8(s) | BsonValue::Code(s) | BsonValue::Symbol(s) => Some(s.len()),
        BsonValue::Binary { bytes, .. } => Some(bytes.len()),
        _ => None,
    }
}

/// Writes one nested value under `key` within `budget` bytes, truncating
/// it when the type allows. Types that cannot be truncated are written as
/// they are and set `force_not_truncated`. A string-like document field
/// that does not fit becomes `MAX_KEY` so the term sorts after every
/// string stored under that field.
fn truncate_value(
    writer: &mut DocWriter,
    key: &[u8],
    value: &BsonValue,
    force_not_truncated: &mut bool,
    budget: i32,
    current_len: i32,
    in_document: bool,
) -> RumResult<bool> {
    match value {
        BsonValue::MaxKey
        | BsonValue::MinKey
        | BsonValue::Bool(_)
        | BsonValue::DateTime(_)
        | BsonValue::Null
        | BsonValue::ObjectId(_)
        | BsonValue::Timestamp(_)
        | BsonValue::Undefined => {
            writer.append(key, value);
            Ok(false)
        }
        BsonValue::Decimal128(_) | BsonValue::Double(_) | BsonValue::Int32(_) | BsonValue::Int64(_) => {
            writer.append(key, &value.canonical_number());
            Ok(false)
        }
        BsonValue::Document(doc) => {
            let soft = budget - DOCUMENT_FIXED_TERM_SIZE;
            let mut nested = DocWriter::new();
            let truncated = truncate_document(current_len, soft, budget, doc, &mut nested)?;
            writer.append_raw(key, bson::type_code::DOCUMENT, nested.finish());
            Ok(truncated)
        }
        BsonValue::Array(values) => {
            let soft = budget - ARRAY_FIXED_TERM_SIZE;
            let mut nested = DocWriter::new();
            let truncated = truncate_array(current_len, soft, budget, values, &mut nested)?;
            writer.append_raw(key, bson::type_code::ARRAY, nested.finish());
            Ok(truncated)
        }
        BsonValue::Code(_) | BsonValue::Binary { .. } | BsonValue::Symbol(_) | BsonValue::Utf8(_) => {
            let len = string_like_len(value).unwrap_or(0);
            // one byte of type code; the caller accounts for the key
            match truncate_string_like(1, budget - current_len, value, len) {
                Ok(None) => {
                    writer.append(key, value);
                    Ok(false)
                }
                _ if in_document => {
                    writer.append(key, &BsonValue::MaxKey);
                    Ok(true)
                }
                Ok(Some(new_len)) => {
                    writer.append(key, &cut_string_like(value, new_len));
                    Ok(true)
                }
                Err(err) => Err(err),
            }
        }
        // regex, code with scope and db pointers fit or fail
        BsonValue::CodeWScope { .. } | BsonValue::DbPointer { .. } | BsonValue::Regex { .. } => {
            *force_not_truncated = true;
            writer.append(key, value);
            Ok(false)
        }
    }
}

/// Largest fixed size array element: a 4 byte index key, type code and a
/// 16 byte value.
const ARRAY_FIXED_TERM_SIZE: i32 = 21;
const DOCUMENT_FIXED_TERM_SIZE: i32 = 17;

fn truncate_array(
    data_size: i32,
    soft_limit: i32,
    hard_limit: i32,
    values: &[BsonValue],
    writer: &mut DocWriter,
) -> RumResult<bool> {
    let mut force_not_truncated = false;
    let mut last_type = "minKey";
    for value in values {
        let current_len = writer.size();
        if current_len + data_size > soft_limit {
            if force_not_truncated {
                log::info!(
                    "truncation limit reached with {} requested as not truncated",
                    last_type
                );
            }
            return Ok(!force_not_truncated);
        }
        force_not_truncated = false;

        let value_len_left = hard_limit - data_size - 4;
        last_type = value.type_name();
        let key = writer.next_array_key();
        if truncate_value(
            writer,
            &key,
            value,
            &mut force_not_truncated,
            value_len_left,
            current_len,
            false,
        )? {
            return Ok(true);
        }
    }
    Ok(writer.size() + data_size > soft_limit && !force_not_truncated)
}

fn truncate_document(
    existing_size: i32,
    soft_limit: i32,
    hard_limit: i32,
    doc: &BsonDocument,
    writer: &mut DocWriter,
) -> RumResult<bool> {
    let mut force_not_truncated = false;
    let mut last_type = "minKey";
    for (path, value) in &doc.fields {
        let current_len = writer.size();
        if current_len + existing_size > soft_limit {
            if force_not_truncated {
                log::info!(
                    "truncation limit reached with {} requested as not truncated",
                    last_type
                );
            }
            return Ok(!force_not_truncated);
        }
        force_not_truncated = false;
        last_type = value.type_name();

        let path_len = path.len() as i32;
        let required = current_len + existing_size + path_len + 2;
        let truncated = if required < soft_limit {
            let value_len_left = hard_limit - existing_size - path_len - 2;
            truncate_value(
                writer,
                path,
                value,
                &mut force_not_truncated,
                value_len_left,
                current_len,
                true,
            )?
        } else if required < hard_limit {
            writer.append(path, &BsonValue::MaxKey);
            true
        } else {
            let keep = (path_len - (required - hard_limit)).max(0) as usize;
            writer.append(&path[..keep], &BsonValue::MaxKey);
            true
        };
        if truncated {
            return Ok(true);
        }
    }
    Ok(writer.size() + existing_size > soft_limit && !force_not_truncated)
}

fn rewrite_path(path: &[u8], meta: &TermCreateMetadata) -> RumResult<Vec<u8>> {
    if !meta.path_prefix.is_empty() && !path.is_empty() && !meta.is_wildcard {
        if path != meta.path_prefix.as_slice() {
            return Err(RumError::internal(format!(
                "Wildcard Prefix path encountered with non-wildcard index - path {}, prefix {}",
                String::from_utf8_lossy(path),
                String::from_utf8_lossy(&meta.path_prefix)
            )));
        }
        return Ok(b"$".to_vec());
    }
    if meta.size_limit > 0 && meta.is_wildcard {
        let mut path = path.to_vec();
        if !meta.is_wildcard_projection && !meta.path_prefix.is_empty() && !path.is_empty() {
            let prefix_len = meta.path_prefix.len();
            if path.len() == prefix_len {
                path = b"$".to_vec();
            } else if path.len() > prefix_len {
                let mut rewritten = b"$".to_vec();
                rewritten.extend_from_slice(&path[prefix_len..]);
                path = rewritten;
            }
        }
        if path.len() as i32 > meta.wildcard_path_limit {
            return Err(RumError::limit_exceeded(format!(
                "Wildcard index key exceeded the maximum allowed size of {}.",
                meta.wildcard_path_limit
            )));
        }
        return Ok(path);
    }
    Ok(path.to_vec())
}

/// Writes `{ path: value }` honoring the size limit. Returns whether the
/// value was truncated.
fn serialize_to_writer(
    writer: &mut DocWriter,
    path: &[u8],
    value: &BsonValue,
    meta: &TermCreateMetadata,
) -> RumResult<bool> {
    let path = rewrite_path(path, meta)?;
    let limit = meta.size_limit;
    if limit <= 0 {
        writer.append(&path, value);
        return Ok(false);
    }

    // document header and terminator, path and its terminator, type code
    let data_size = 5 + path.len() as i32 + 2;
    if data_size >= limit {
        let message = format!(
            "Cannot create index key because the path length {} exceeds truncation limit {}.",
            data_size, limit
        );
        return Err(RumError::limit_exceeded(message.clone()).with_detail(message));
    }

    match value {
        BsonValue::Array(values) => {
            let soft = limit - ARRAY_FIXED_TERM_SIZE;
            let mut nested = DocWriter::new();
            let truncated = truncate_array(data_size, soft, limit, values, &mut nested)?;
            writer.append_raw(&path, bson::type_code::ARRAY, nested.finish());
            Ok(truncated)
        }
        BsonValue::Document(doc) => {
            // two bytes stay free for a trailing MaxKey
            let soft = limit - DOCUMENT_FIXED_TERM_SIZE;
            let hard = limit - 2;
            let mut nested = DocWriter::new();
            let truncated = truncate_document(data_size, soft, hard, doc, &mut nested)?;
            writer.append_raw(&path, bson::type_code::DOCUMENT, nested.finish());
            Ok(truncated)
        }
        BsonValue::Binary { .. } | BsonValue::Code(_) | BsonValue::Symbol(_) | BsonValue::Utf8(_) => {
            let len = string_like_len(value).unwrap_or(0);
            match truncate_string_like(data_size, limit, value, len)? {
                Some(new_len) => {
                    writer.append(&path, &cut_string_like(value, new_len));
                    Ok(true)
                }
                None => {
                    writer.append(&path, value);
                    Ok(false)
                }
            }
        }
        _ => {
            writer.append(&path, value);
            Ok(false)
        }
    }
}

fn build_term(
    path: &[u8],
    value: &BsonValue,
    meta: &TermCreateMetadata,
    mut term_metadata: u8,
) -> RumResult<SerializedTerm> {
    let mut writer = DocWriter::new();
    let truncated = serialize_to_writer(&mut writer, path, value, meta)?;
    if truncated && term_metadata == NO_METADATA {
        term_metadata = TRUNCATED;
    }
    let is_root_metadata = term_metadata == IS_METADATA;

    if meta.is_descending {
        match term_metadata {
            NO_METADATA | TRUNCATED | PARTIAL_UNDEFINED | UNDEFINED_VALUE => {
                term_metadata |= DESCENDING
            }
            IS_METADATA => {}
            other => {
                let message = format!("Unexpected term metadata {} for descending index", other);
                return Err(RumError::internal(message.clone()).with_detail(message));
            }
        }
    }

    let body = writer.finish();
    if meta.size_limit > 0 && body.len() as i32 > meta.size_limit {
        let message = format!(
            "Truncation size limit specified {}, but index term with type {} was larger {} - isTruncated {}",
            meta.size_limit,
            value.type_name(),
            body.len(),
            TermMetadata(term_metadata).is_truncated() as i32
        );
        return Err(RumError::internal(message.clone()).with_detail(message));
    }

    let mut bytes = Vec::with_capacity(body.len() + 1);
    bytes.push(term_metadata);
    bytes.extend_from_slice(&body);
    Ok(SerializedTerm {
        truncated: TermMetadata(term_metadata).is_truncated(),
        is_root_metadata,
        bytes,
    })
}

pub fn serialize_term(
    path: &[u8],
    value: &BsonValue,
    meta: &TermCreateMetadata,
) -> RumResult<SerializedTerm> {
    build_term(path, value, meta, NO_METADATA)
}

/// Like [`serialize_term`], compressing the result when it is larger than
/// the configured threshold.
pub fn serialize_term_with_compression(
    path: &[u8],
    value: &BsonValue,
    meta: &TermCreateMetadata,
) -> RumResult<SerializedTerm> {
    let mut term = build_term(path, value, meta, NO_METADATA)?;
    term.bytes = compress_if_needed(term.bytes, meta.compression_threshold);
    Ok(term)
}

/// Concatenates per-column terms. A single term is returned unchanged.
pub fn serialize_composite(terms: &[Vec<u8>]) -> RumResult<SerializedTerm> {
    if terms.len() == 1 {
        return Ok(SerializedTerm {
            bytes: terms[0].clone(),
            truncated: false,
            is_root_metadata: false,
        });
    }
    if terms.len() > INDEX_MAX_KEYS {
        return Err(RumError::limit_exceeded(format!(
            "Index term exceeds maximum number of keys {}",
            INDEX_MAX_KEYS
        )));
    }
    let total = 1 + terms.iter().map(|t| t.len() + 4).sum::<usize>();
    let mut bytes = Vec::with_capacity(total);
    bytes.push(COMPOSITE);
    for term in terms {
        if term.first() == Some(&COMPOSITE) {
            return Err(RumError::internal("composite index terms cannot be nested"));
        }
        bytes.extend_from_slice(&((term.len() + 4) as u32).to_le_bytes());
        bytes.extend_from_slice(term);
    }
    Ok(SerializedTerm {
        bytes,
        truncated: false,
        is_root_metadata: false,
    })
}

/// Composite form with each sub-term compressed past `threshold`.
pub fn serialize_composite_with_compression(
    terms: Vec<Vec<u8>>,
    threshold: i32,
) -> RumResult<SerializedTerm> {
    let terms: Vec<Vec<u8>> = terms
        .into_iter()
        .map(|t| compress_if_needed(t, threshold))
        .collect();
    serialize_composite(&terms)
}

pub fn is_composite(raw: &[u8]) -> bool {
    raw.first() == Some(&COMPOSITE)
}

pub fn is_truncated(raw: &[u8]) -> bool {
    raw.first()
        .is_some_and(|&m| TermMetadata(m & !COMPRESSED).is_truncated())
}

/// Splits a composite term into its sub-terms; a plain term is its own
/// only sub-term.
pub fn composite_terms(raw: &[u8]) -> RumResult<ArrayVec<&[u8], INDEX_MAX_KEYS>> {
    let mut out = ArrayVec::new();
    if !is_composite(raw) {
        out.push(raw);
        return Ok(out);
    }
    let mut rest = &raw[1..];
    while !rest.is_empty() {
        if out.is_full() {
            return Err(RumError::internal(format!(
                "Index term exceeds maximum number of keys {}",
                INDEX_MAX_KEYS
            )));
        }
        if rest.len() < 4 {
            return Err(RumError::internal("composite index term is truncated"));
        }
        let len = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        if len < 4 || len > rest.len() {
            return Err(RumError::internal("composite index term is truncated"));
        }
        out.push(&rest[4..len]);
        rest = &rest[len..];
    }
    Ok(out)
}

/// Orders two decoded terms; `valid` is cleared when their values are of
/// different sort classes.
pub fn compare_index_terms(a: &IndexTerm, b: &IndexTerm, valid: &mut bool) -> RumResult<Ordering> {
    if a.metadata.is_metadata() != b.metadata.is_metadata() {
        return Ok(if a.metadata.is_metadata() {
            Ordering::Less
        } else {
            Ordering::Greater
        });
    }
    let descending = a.metadata.is_descending();
    if descending != b.metadata.is_descending() {
        return Err(RumError::internal(
            "Cannot compare ascending and descending index terms",
        ));
    }
    let path = a.path.cmp(&b.path);
    if path != Ordering::Equal {
        return Ok(path);
    }
    let value = bson::compare_values(&a.value, &b.value, valid)
        .then_with(|| {
            let (ua, ub) = (a.metadata.is_value_undefined(), b.metadata.is_value_undefined());
            ub.cmp(&ua)
        })
        .then_with(|| {
            let (ma, mb) = (a.metadata.is_maybe_undefined(), b.metadata.is_maybe_undefined());
            mb.cmp(&ma)
        })
        .then_with(|| a.is_truncated().cmp(&b.is_truncated()));
    Ok(if descending { value.reverse() } else { value })
}

/// Orders two serialized terms, composite ones sub-term by sub-term.
pub fn compare_terms(a: &[u8], b: &[u8]) -> RumResult<Ordering> {
    match (is_composite(a), is_composite(b)) {
        (true, true) => {
            let (left, right) = (composite_terms(a)?, composite_terms(b)?);
            for (l, r) in left.iter().zip(right.iter()) {
                let ord = compare_index_terms(&IndexTerm::parse(l)?, &IndexTerm::parse(r)?, &mut true)?;
                if ord != Ordering::Equal {
                    return Ok(ord);
                }
            }
            let remaining = |terms: &ArrayVec<&[u8], INDEX_MAX_KEYS>, skip: usize| {
                terms.iter().skip(skip).map(|t| t.len() + 4).sum::<usize>()
            };
            let common = left.len().min(right.len());
            Ok(remaining(&left, common).cmp(&remaining(&right, common)))
        }
        (true, false) => Ok(Ordering::Greater),
        (false, true) => Ok(Ordering::Less),
        (false, false) => {
            compare_index_terms(&IndexTerm::parse(a)?, &IndexTerm::parse(b)?, &mut true)
        }
    }
}

fn root_term(value: BsonValue, meta: &TermCreateMetadata, term_metadata: u8) -> RumResult<Vec<u8>> {
    Ok(build_term(b"", &value, meta, term_metadata)?.bytes)
}

/// Term every document gets when the indexed path exists.
pub fn root_term_for(meta: &TermCreateMetadata) -> RumResult<Vec<u8>> {
    root_term(BsonValue::MinKey, meta, NO_METADATA)
}

pub fn value_undefined_term(meta: &TermCreateMetadata) -> RumResult<Vec<u8>> {
    Ok(build_term(&meta.path_prefix, &BsonValue::Undefined, meta, UNDEFINED_VALUE)?.bytes)
}

pub fn value_maybe_undefined_term(meta: &TermCreateMetadata) -> RumResult<Vec<u8>> {
    Ok(build_term(&meta.path_prefix, &BsonValue::Undefined, meta, PARTIAL_UNDEFINED)?.bytes)
}

pub fn root_exists_term(meta: &TermCreateMetadata) -> RumResult<Vec<u8>> {
    root_term(BsonValue::Bool(true), meta, IS_METADATA)
}

pub fn root_non_exists_term(meta: &TermCreateMetadata) -> RumResult<Vec<u8>> {
    root_term(BsonValue::Undefined, meta, IS_METADATA)
}

/// Term for documents where the path crosses an array.
pub fn root_multi_key_term(meta: &TermCreateMetadata) -> RumResult<Vec<u8>> {
    root_term(BsonValue::Array(Vec::new()), meta, IS_METADATA)
}

/// Marker for documents with at least one truncated term.
pub fn root_truncated_term(meta: &TermCreateMetadata) -> RumResult<Vec<u8>> {
    root_term(BsonValue::MaxKey, meta, TRUNCATED)
}

fn compress_if_needed(term: Vec<u8>, threshold: i32) -> Vec<u8> {
    if threshold < 0 || term.len() <= threshold as usize || is_composite(&term) {
        return term;
    }
    let body = &term[1..];
    let packed = pack_bits(body);
    if packed.len() + 4 >= body.len() {
        return term;
    }
    let mut out = Vec::with_capacity(packed.len() + 5);
    out.push(term[0] | COMPRESSED);
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&packed);
    out
}

/// Run length coding: a control byte `n < 128` is followed by `n + 1`
/// literal bytes, `n > 128` repeats the next byte `257 - n` times.
fn pack_bits(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        let mut run = 1;
        while i + run < data.len() && data[i + run] == data[i] && run < 128 {
            run += 1;
        }
        if run >= 3 {
            out.push((257 - run) as u8);
            out.push(data[i]);
            i += run;
            continue;
        }
        let start = i;
        while i < data.len() && i - start < 128 {
            if i + 2 < data.len() && data[i] == data[i + 1] && data[i] == data[i + 2] {
                break;
            }
            i += 1;
        }
        out.push((i - start - 1) as u8);
        out.extend_from_slice(&data[start..i]);
    }
    out
}

fn decompress(body: &[u8]) -> RumResult<Vec<u8>> {
    let bad = || RumError::internal("corrupt compressed index term");
    if body.len() < 4 {
        return Err(bad());
    }
    let raw_len = u32::from_le_bytes([body[0], body[1], body[2], body[3]]) as usize;
    let mut out = Vec::with_capacity(raw_len);
    let mut data = &body[4..];
    while let Some((&control, rest)) = data.split_first() {
        if control < 128 {
            let n = control as usize + 1;
            let literal = rest.get(..n).ok_or_else(bad)?;
            out.extend_from_slice(literal);
            data = &rest[n..];
        } else if control > 128 {
            let byte = *rest.first().ok_or_else(bad)?;
            out.extend(std::iter::repeat(byte).take(257 - control as usize));
            data = &rest[1..];
        } else {
            data = rest;
        }
    }
    if out.len() != raw_len {
        return Err(bad());
    }
    Ok(out)
}
