//! Small accessors for values the server may encode in more than one way.
use bson::document::{ValueAccessError, ValueAccessResult};
use bson::spec::BinarySubtype;
use bson::Binary;
use bson::Bson;
use bson::Document;
use uuid::Uuid;

/// Create a new bson::Binary from given `uuid`.
pub fn new_binary(uuid: Uuid) -> Binary {
    Binary {
        subtype: BinarySubtype::Uuid,
        bytes: uuid.as_bytes().to_vec(),
    }
}

/// Get a numeric value for this `key`, whatever numeric type the server used to encode it.
pub fn get_number(doc: &Document, key: &str) -> ValueAccessResult<f64> {
    match doc.get(key) {
        Some(Bson::Int32(n)) => Ok(*n as f64),
        Some(Bson::Int64(n)) => Ok(*n as f64),
        Some(Bson::Double(n)) => Ok(*n),
        Some(_) => Err(ValueAccessError::UnexpectedType),
        None => Err(ValueAccessError::NotPresent),
    }
}
