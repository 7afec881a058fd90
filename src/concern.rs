//! Read and write concerns. Only the pieces the session/transaction core actually touches are
//! kept: write concern (used to build the `commitTransaction`/`abortTransaction` envelope) and
//! read concern (used to carry the caller's level plus the `afterClusterTime` the
//! causal-consistency decorator injects).

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_with::skip_serializing_none;
use typed_builder::TypedBuilder;

use crate::{
    bson::Timestamp,
    bson_util,
    error::{ErrorKind, Result},
};

/// Specifies the consistency and isolation properties of read operations.
///
/// See the documentation [here](https://docs.mongodb.com/manual/reference/read-concern/) for more
/// information about read concerns.
#[derive(Clone, Debug, PartialEq)]
pub enum ReadConcernLevel {
    Local,
    Majority,
    Linearizable,
    Available,
    Snapshot,
    /// Forwards-compatible with read concern levels not yet known to this crate.
    Custom(String),
}

impl ReadConcernLevel {
    /// The string representation of this read concern level.
    pub fn as_str(&self) -> &str {
        match self {
            ReadConcernLevel::Local => "local",
            ReadConcernLevel::Majority => "majority",
            ReadConcernLevel::Linearizable => "linearizable",
            ReadConcernLevel::Available => "available",
            ReadConcernLevel::Snapshot => "snapshot",
            ReadConcernLevel::Custom(s) => s,
        }
    }
}

/// A read concern to use for a transaction or an individual read operation.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadConcern {
    /// The consistency level requested.
    #[serde(
        rename = "level",
        serialize_with = "serialize_level",
        deserialize_with = "deserialize_level",
        skip_serializing_if = "Option::is_none"
    )]
    pub level: Option<ReadConcernLevel>,

    /// The cluster time after which the server must have applied all writes this session has
    /// observed. Populated by the causal-consistency decorator; never set directly by a caller
    /// constructing a `ReadConcern` from scratch.
    #[serde(rename = "afterClusterTime")]
    pub after_cluster_time: Option<Timestamp>,
}

impl ReadConcern {
    /// A read concern requesting the `majority` level.
    pub fn majority() -> Self {
        Self {
            level: Some(ReadConcernLevel::Majority),
            after_cluster_time: None,
        }
    }
}

fn serialize_level<S: Serializer>(
    level: &Option<ReadConcernLevel>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match level {
        Some(level) => serializer.serialize_str(level.as_str()),
        None => serializer.serialize_none(),
    }
}

fn deserialize_level<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<ReadConcernLevel>, D::Error> {
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.map(|s| match s.as_str() {
        "local" => ReadConcernLevel::Local,
        "majority" => ReadConcernLevel::Majority,
        "linearizable" => ReadConcernLevel::Linearizable,
        "available" => ReadConcernLevel::Available,
        "snapshot" => ReadConcernLevel::Snapshot,
        _ => ReadConcernLevel::Custom(s),
    }))
}

/// Specifies the level of acknowledgement requested from the server for write operations.
///
/// See the documentation [here](https://docs.mongodb.com/manual/reference/write-concern/) for
/// more information about write concerns.
#[derive(Clone, Debug, PartialEq)]
pub enum Acknowledgment {
    /// Requires acknowledgement that the write has reached the specified number of nodes.
    Nodes(i32),
    /// Requires acknowledgement that the write has reached the majority of nodes.
    Majority,
    /// Requires acknowledgement according to the given write tag.
    Tag(String),
}

impl Serialize for Acknowledgment {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Acknowledgment::Majority => serializer.serialize_str("majority"),
            Acknowledgment::Nodes(n) => serializer.serialize_i32(*n),
            Acknowledgment::Tag(tag) => serializer.serialize_str(tag),
        }
    }
}

impl<'de> Deserialize<'de> for Acknowledgment {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum IntOrString {
            Int(i32),
            String(String),
        }
        Ok(match IntOrString::deserialize(deserializer)? {
            IntOrString::String(s) if s == "majority" => Acknowledgment::Majority,
            IntOrString::String(s) => Acknowledgment::Tag(s),
            IntOrString::Int(i) => Acknowledgment::Nodes(i),
        })
    }
}

/// The write concern to use when committing or aborting a transaction (or for any other write).
#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, TypedBuilder, Serialize, Deserialize)]
pub struct WriteConcern {
    /// Requests acknowledgement that the operation has propagated to a specific number or
    /// variety of servers.
    #[builder(default)]
    pub w: Option<Acknowledgment>,

    /// A time limit for the write concern. An operation that has not propagated to the
    /// requested level within the limit returns an error; it is not rolled back.
    #[builder(default)]
    #[serde(
        rename = "wtimeout",
        serialize_with = "bson_util::serialize_duration_as_i64_millis",
        deserialize_with = "bson_util::deserialize_duration_from_u64_millis",
        default
    )]
    pub w_timeout: Option<Duration>,

    /// Requests acknowledgement that the operation has propagated to the on-disk journal.
    #[builder(default)]
    #[serde(rename = "j")]
    pub journal: Option<bool>,
}

impl WriteConcern {
    /// Whether this write concern requests any acknowledgement at all.
    pub fn is_acknowledged(&self) -> bool {
        self.w != Some(Acknowledgment::Nodes(0)) || self.journal == Some(true)
    }

    /// Validates this write concern. A write concern is invalid if `w` is 0 and `j` is true, or
    /// if `w` is a negative node count.
    pub fn validate(&self) -> Result<()> {
        if let Some(Acknowledgment::Nodes(n)) = self.w {
            if n < 0 {
                return Err(ErrorKind::InvalidArgument {
                    message: "write concern `w` field cannot be a negative integer".to_string(),
                }
                .into());
            }
        }
        if self.w == Some(Acknowledgment::Nodes(0)) && self.journal == Some(true) {
            return Err(ErrorKind::InvalidArgument {
                message: "write concern cannot have w=0 and j=true".to_string(),
            }
            .into());
        }
        Ok(())
    }
}
