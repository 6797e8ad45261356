use std::cmp::Ordering;
use std::sync::Arc;

use super::{ConsistentArgs, ExtractedQuery, ExtractedValue, OrderingFn, QueryEntry, RumOpClass};
use crate::datatype::bson::compare_values;
use crate::datatype::term::{
    root_truncated_term, serialize_term_with_compression, value_undefined_term, IndexTerm,
    TermCreateMetadata,
};
use crate::datatype::{BsonDocument, BsonValue, Datum, TypeInfo};
use crate::error::{RumError, RumResult};

pub const BSON_EQUAL: u16 = 1;
pub const BSON_GREATER: u16 = 2;
pub const BSON_GREATER_EQUAL: u16 = 3;
pub const BSON_LESS: u16 = 4;
pub const BSON_LESS_EQUAL: u16 = 5;
pub const BSON_EXISTS: u16 = 6;
/// Order by the indexed value of the path.
pub const BSON_ORDER_BY: u16 = 7;

fn document(datum: &Datum) -> RumResult<BsonDocument> {
    let bytes = datum
        .as_bytes()
        .ok_or_else(|| RumError::bad_value(format!("expected a document, got {:?}", datum)))?;
    BsonDocument::from_bytes(bytes)
}

/// Values reached by a dotted path. Arrays on the way fan out.
fn lookup<'a>(value: &'a BsonValue, path: &[&[u8]], out: &mut Vec<&'a BsonValue>) {
    let Some((first, rest)) = path.split_first() else {
        out.push(value);
        return;
    };
    match value {
        BsonValue::Document(doc) => {
            if let Some((_, child)) = doc.fields.iter().find(|(key, _)| key.as_slice() == *first) {
                lookup(child, rest, out);
            }
        }
        BsonValue::Array(items) => {
            for item in items {
                if matches!(item, BsonValue::Document(_)) {
                    lookup(item, path, out);
                }
            }
        }
        _ => {}
    }
}

struct BsonTermOps {
    meta: TermCreateMetadata,
}

impl BsonTermOps {
    fn term(&self, value: &BsonValue) -> RumResult<(Vec<u8>, bool)> {
        let term = serialize_term_with_compression(&self.meta.path_prefix, value, &self.meta)?;
        Ok((term.bytes, term.truncated))
    }

    fn extract_value(&self, value: &Datum) -> RumResult<Vec<ExtractedValue>> {
        let root = BsonValue::Document(document(value)?);
        let segments: Vec<&[u8]> = self.meta.path_prefix.split(|&b| b == b'.').collect();
        let mut found = Vec::new();
        lookup(&root, &segments, &mut found);
        if found.is_empty() {
            return Ok(vec![ExtractedValue::key(Datum::Bytes(value_undefined_term(
                &self.meta,
            )?))]);
        }
        let mut keys = Vec::new();
        let mut truncated = false;
        for value in found {
            let mut push = |value: &BsonValue| -> RumResult<()> {
                let (bytes, was_truncated) = self.term(value)?;
                truncated |= was_truncated;
                keys.push(ExtractedValue::key(Datum::Bytes(bytes)));
                Ok(())
            };
            if let BsonValue::Array(items) = value {
                for item in items {
                    push(item)?;
                }
            }
            push(value)?;
        }
        if truncated {
            keys.push(ExtractedValue::key(Datum::Bytes(root_truncated_term(
                &self.meta,
            )?)));
        }
        Ok(keys)
    }

    /// First value of the path in tree order.
    fn path_start(&self) -> BsonValue {
        if self.meta.is_descending {
            BsonValue::MaxKey
        } else {
            BsonValue::MinKey
        }
    }

    fn extract_query(&self, query: &Datum, strategy: u16) -> RumResult<ExtractedQuery> {
        let doc = document(query)?;
        let value = doc
            .fields
            .into_iter()
            .next()
            .map(|(_, value)| value)
            .unwrap_or(BsonValue::MinKey);
        let (term, _) = self.term(&value)?;
        let (start, _) = self.term(&self.path_start())?;
        let entry = match strategy {
            BSON_EQUAL => QueryEntry::exact(Datum::Bytes(term)),
            BSON_GREATER | BSON_GREATER_EQUAL if !self.meta.is_descending => {
                QueryEntry::partial(Datum::Bytes(term), None)
            }
            BSON_GREATER | BSON_GREATER_EQUAL | BSON_LESS | BSON_LESS_EQUAL | BSON_EXISTS => {
                QueryEntry::partial(Datum::Bytes(start), Some(Datum::Bytes(term)))
            }
            BSON_ORDER_BY => QueryEntry::partial(Datum::Bytes(start), None),
            _ => {
                return Err(RumError::bad_value(format!(
                    "unrecognized strategy number: {}",
                    strategy
                )))
            }
        };
        Ok(ExtractedQuery {
            entries: vec![entry],
            search_mode: 0,
        })
    }

    /// Whether `cmp` (key against query value, in value order) satisfies
    /// the operator, ignoring the sort class.
    fn satisfies(strategy: u16, cmp: Ordering) -> bool {
        match strategy {
            BSON_GREATER => cmp == Ordering::Greater,
            BSON_GREATER_EQUAL => cmp != Ordering::Less,
            BSON_LESS => cmp == Ordering::Less,
            BSON_LESS_EQUAL => cmp != Ordering::Greater,
            _ => cmp == Ordering::Equal,
        }
    }

    fn compare_partial(
        &self,
        partial: &Datum,
        key: &Datum,
        strategy: u16,
        extra: Option<&Datum>,
    ) -> RumResult<i32> {
        let key = IndexTerm::parse(key.as_bytes().unwrap_or_default())?;
        if strategy == 0 {
            return Ok(if key.is_truncated() { -1 } else { 0 });
        }
        let query_raw = extra.unwrap_or(partial);
        let query = IndexTerm::parse(query_raw.as_bytes().unwrap_or_default())?;
        match key.path.cmp(&query.path) {
            Ordering::Less => return Ok(-1),
            Ordering::Greater => return Ok(1),
            Ordering::Equal => {}
        }
        if key.metadata.is_metadata() {
            return Ok(-1);
        }
        match strategy {
            BSON_ORDER_BY => return Ok(0),
            BSON_EXISTS => {
                return Ok(if key.metadata.is_value_undefined() {
                    -1
                } else {
                    0
                })
            }
            _ => {}
        }
        let mut valid = true;
        let cmp = compare_values(&key.value, &query.value, &mut valid);
        if valid && Self::satisfies(strategy, cmp) {
            return Ok(0);
        }
        if self.meta.is_descending {
            return Ok(-1);
        }
        // ascending walk: stop once the key can no longer satisfy the operator
        let past = match strategy {
            BSON_GREATER | BSON_GREATER_EQUAL => !valid,
            BSON_LESS | BSON_LESS_EQUAL => {
                (!valid && key.value.sort_class() > query.value.sort_class())
                    || (valid && cmp != Ordering::Less)
            }
            _ => true,
        };
        Ok(if past { 1 } else { -1 })
    }
}

fn consistent(args: &ConsistentArgs<'_>, recheck: &mut bool) -> RumResult<bool> {
    *recheck = matches!(args.strategy, BSON_EQUAL)
        && args.query_keys.iter().flatten().any(|key| {
            key.as_bytes()
                .and_then(|raw| raw.first())
                .is_some_and(|meta| meta & crate::datatype::term::TRUNCATED != 0)
        });
    Ok(args.check.iter().take(args.nentries.max(1)).any(|&c| c))
}

/// Single path index over serialized documents, keyed by index terms.
/// `meta.path_prefix` is the dotted path. Ordering by the path projects
/// the raw term, so an order by scan walks the entry tree directly.
pub fn bson_term_ops(meta: TermCreateMetadata) -> RumOpClass {
    let ops = Arc::new(BsonTermOps { meta });
    let (value_ops, query_ops, partial_ops) = (ops.clone(), ops.clone(), ops);
    RumOpClass {
        name: "bson_term_ops",
        key_type: TypeInfo::Varlena,
        compare: Some(Arc::new(|a: &Datum, b: &Datum| {
            crate::datatype::term::compare_terms(
                a.as_bytes().unwrap_or_default(),
                b.as_bytes().unwrap_or_default(),
            )
        })),
        extract_value: Arc::new(move |value| value_ops.extract_value(value)),
        extract_query: Arc::new(move |query, strategy, _| query_ops.extract_query(query, strategy)),
        consistent: Arc::new(consistent),
        compare_partial: Some(Arc::new(move |partial, key, strategy, extra| {
            partial_ops.compare_partial(partial, key, strategy, extra)
        })),
        pre_consistent: None,
        ordering: Some(OrderingFn::RawKey(Arc::new(|key: &Datum, _: &Datum, _| {
            key.clone()
        }))),
        outer_ordering: None,
        join_add_info: None,
        config: None,
    }
}
