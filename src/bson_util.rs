//! Small helpers for building and merging BSON documents.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

use crate::bson::{doc, Bson, Document};

/// Serializes a `Duration` as the number of whole milliseconds, the wire representation MongoDB
/// expects for fields like `wtimeout` and `maxTimeMS`.
pub(crate) fn serialize_duration_as_i64_millis<S: Serializer>(
    val: &Option<Duration>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match val {
        Some(val) => serializer.serialize_i64(val.as_millis() as i64),
        None => serializer.serialize_none(),
    }
}

/// Deserializes a millisecond count into a `Duration`.
pub(crate) fn deserialize_duration_from_u64_millis<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<Duration>, D::Error> {
    let millis: Option<u64> = Option::deserialize(deserializer)?;
    Ok(millis.map(Duration::from_millis))
}

/// Builds a `{id: <uuid>}` document using the BSON binary UUID subtype, the wire shape MongoDB
/// uses for `lsid`.
pub(crate) fn uuid_lsid(id: uuid::Uuid) -> Document {
    use bson::{spec::BinarySubtype, Binary};

    doc! {
        "id": Bson::Binary(Binary {
            subtype: BinarySubtype::Uuid,
            bytes: id.as_bytes().to_vec(),
        })
    }
}
