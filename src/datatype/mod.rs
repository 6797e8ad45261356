pub mod bson;
mod datum;
pub mod term;

pub use bson::{BsonDocument, BsonValue};
pub use datum::{datum_cmp, Datum, TypeInfo};
