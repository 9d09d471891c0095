//! Errors raised while decoding protocol notations and server events.

use std::sync::Arc;

use thiserror::Error;

/// A low level deserialization error.
///
/// Raised by the readers of the `[short]`, `[string]`, `[inet]` and similar
/// notations defined by the protocol.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum LowLevelDeserializationError {
    /// Generic I/O error, usually an unexpected end of buffer.
    #[error(transparent)]
    IoError(Arc<std::io::Error>),

    /// A length field could not be represented as `usize`.
    #[error(transparent)]
    TryFromIntError(#[from] std::num::TryFromIntError),

    /// The buffer ended before the announced number of bytes.
    #[error("Too few bytes received: expected {expected}, received {received}")]
    TooFewBytesReceived { expected: usize, received: usize },

    /// `[inet]` address length byte other than 4 or 16.
    #[error("Invalid inet bytes length: {0}. Accepted lengths are 4 and 16 bytes.")]
    InvalidInetLength(u8),

    /// A `[string]` was not valid UTF-8.
    #[error("UTF8 deserialization failed: {0}")]
    UTF8DeserializationError(#[from] std::str::Utf8Error),
}

impl From<std::io::Error> for LowLevelDeserializationError {
    fn from(value: std::io::Error) -> Self {
        Self::IoError(Arc::new(value))
    }
}

/// An error type returned when deserialization of `EVENT` response fails.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum CqlEventParseError {
    /// Failed to deserialize event type.
    #[error("Malformed event type string: {0}")]
    EventTypeParseError(LowLevelDeserializationError),

    /// Received an unknown event type.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    /// Failed to deserialize schema change event.
    #[error("Failed to deserialize schema change event: {0}")]
    SchemaChangeEventParseError(#[from] SchemaChangeEventParseError),

    /// Failed to deserialize topology change event.
    #[error("Failed to deserialize topology change event: {0}")]
    TopologyChangeEventParseError(ClusterChangeEventParseError),

    /// Failed to deserialize status change event.
    #[error("Failed to deserialize status change event: {0}")]
    StatusChangeEventParseError(ClusterChangeEventParseError),
}

/// An error type returned when deserialization of SCHEMA_CHANGE event fails.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum SchemaChangeEventParseError {
    #[error("Malformed schema change type string: {0}")]
    TypeOfChangeParseError(LowLevelDeserializationError),

    #[error("Malformed schema change target string: {0}")]
    TargetTypeParseError(LowLevelDeserializationError),

    #[error("Malformed name of keyspace affected by schema change: {0}")]
    AffectedKeyspaceParseError(LowLevelDeserializationError),

    #[error("Malformed name of the table affected by schema change: {0}")]
    AffectedTargetNameParseError(LowLevelDeserializationError),

    #[error("Malformed number of arguments of the function/aggregate: {0}")]
    ArgumentCountParseError(LowLevelDeserializationError),

    #[error("Malformed argument of the function/aggregate: {0}")]
    FunctionArgumentParseError(LowLevelDeserializationError),

    #[error("Unknown target of schema change: {0}")]
    UnknownTargetOfSchemaChange(String),
}

/// An error type returned when deserialization of [Status/Topology]_CHANGE event fails.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum ClusterChangeEventParseError {
    #[error("Malformed type of change: {0}")]
    TypeOfChangeParseError(LowLevelDeserializationError),

    #[error("Malformed node address: {0}")]
    NodeAddressParseError(LowLevelDeserializationError),

    #[error("Unknown type of change: {0}")]
    UnknownTypeOfChange(String),
}
