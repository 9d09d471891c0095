//! CQL protocol-level representation of an `EVENT` response.

use crate::frame::frame_errors::{
    ClusterChangeEventParseError, CqlEventParseError, SchemaChangeEventParseError,
};
use crate::frame::server_event_type::EventType;
use crate::frame::types;
use std::net::SocketAddr;

/// Event that the server notified the client about.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::enum_variant_names)]
pub enum Event {
    /// Topology changed.
    TopologyChange(TopologyChangeEvent),
    /// Status of a node changed.
    StatusChange(StatusChangeEvent),
    /// Schema changed.
    SchemaChange(SchemaChangeEvent),
}

/// Event that notifies about changes in the cluster topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyChangeEvent {
    /// A new node was added to the cluster.
    NewNode(SocketAddr),
    /// A node was removed from the cluster.
    RemovedNode(SocketAddr),
}

/// Event that notifies about changes in the nodes' status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusChangeEvent {
    /// A node went up.
    Up(SocketAddr),
    /// A node went down.
    Down(SocketAddr),
}

/// Event that notifies about changes in the schema.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::enum_variant_names)]
pub enum SchemaChangeEvent {
    /// Keyspace was altered.
    KeyspaceChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
    },
    /// Table was altered.
    TableChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
        object_name: String,
    },
    /// User defined type was altered.
    TypeChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
        type_name: String,
    },
    /// Function was altered.
    FunctionChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
        function_name: String,
        /// Argument types, which together with the name identify an overload.
        arguments: Vec<String>,
    },
    /// Aggregate was altered.
    AggregateChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
        aggregate_name: String,
        arguments: Vec<String>,
    },
}

/// Type of change that was made to the schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaChangeType {
    Created,
    Updated,
    Dropped,
    /// A placeholder for an unrecognized schema change type.
    Invalid,
}

impl Event {
    /// Deserialize an event from the provided buffer.
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, CqlEventParseError> {
        let event_type: EventType = types::read_string(buf)
            .map_err(CqlEventParseError::EventTypeParseError)?
            .parse()?;
        match event_type {
            EventType::TopologyChange => Ok(Self::TopologyChange(
                TopologyChangeEvent::deserialize(buf)
                    .map_err(CqlEventParseError::TopologyChangeEventParseError)?,
            )),
            EventType::StatusChange => Ok(Self::StatusChange(
                StatusChangeEvent::deserialize(buf)
                    .map_err(CqlEventParseError::StatusChangeEventParseError)?,
            )),
            EventType::SchemaChange => Ok(Self::SchemaChange(SchemaChangeEvent::deserialize(buf)?)),
        }
    }

    pub fn event_type(&self) -> EventType {
        match self {
            Self::TopologyChange(_) => EventType::TopologyChange,
            Self::StatusChange(_) => EventType::StatusChange,
            Self::SchemaChange(_) => EventType::SchemaChange,
        }
    }
}

impl SchemaChangeEvent {
    pub fn keyspace_name(&self) -> &str {
        match self {
            Self::KeyspaceChange { keyspace_name, .. }
            | Self::TableChange { keyspace_name, .. }
            | Self::TypeChange { keyspace_name, .. }
            | Self::FunctionChange { keyspace_name, .. }
            | Self::AggregateChange { keyspace_name, .. } => keyspace_name,
        }
    }

    pub fn change_type(&self) -> SchemaChangeType {
        match self {
            Self::KeyspaceChange { change_type, .. }
            | Self::TableChange { change_type, .. }
            | Self::TypeChange { change_type, .. }
            | Self::FunctionChange { change_type, .. }
            | Self::AggregateChange { change_type, .. } => *change_type,
        }
    }

    /// Deserialize a schema change event from the provided buffer.
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, SchemaChangeEventParseError> {
        let type_of_change_string =
            types::read_string(buf).map_err(SchemaChangeEventParseError::TypeOfChangeParseError)?;
        let type_of_change = match type_of_change_string {
            "CREATED" => SchemaChangeType::Created,
            "UPDATED" => SchemaChangeType::Updated,
            "DROPPED" => SchemaChangeType::Dropped,
            _ => SchemaChangeType::Invalid,
        };

        let target =
            types::read_string(buf).map_err(SchemaChangeEventParseError::TargetTypeParseError)?;
        let keyspace_affected = types::read_string(buf)
            .map_err(SchemaChangeEventParseError::AffectedKeyspaceParseError)?
            .to_string();

        match target {
            "KEYSPACE" => Ok(Self::KeyspaceChange {
                change_type: type_of_change,
                keyspace_name: keyspace_affected,
            }),
            "TABLE" => Ok(Self::TableChange {
                change_type: type_of_change,
                keyspace_name: keyspace_affected,
                object_name: read_target_name(buf)?,
            }),
            "TYPE" => Ok(Self::TypeChange {
                change_type: type_of_change,
                keyspace_name: keyspace_affected,
                type_name: read_target_name(buf)?,
            }),
            "FUNCTION" => {
                let function_name = read_target_name(buf)?;
                let arguments = read_arguments(buf)?;
                Ok(Self::FunctionChange {
                    change_type: type_of_change,
                    keyspace_name: keyspace_affected,
                    function_name,
                    arguments,
                })
            }
            "AGGREGATE" => {
                let aggregate_name = read_target_name(buf)?;
                let arguments = read_arguments(buf)?;
                Ok(Self::AggregateChange {
                    change_type: type_of_change,
                    keyspace_name: keyspace_affected,
                    aggregate_name,
                    arguments,
                })
            }

            _ => Err(SchemaChangeEventParseError::UnknownTargetOfSchemaChange(
                target.to_string(),
            )),
        }
    }
}

fn read_target_name(buf: &mut &[u8]) -> Result<String, SchemaChangeEventParseError> {
    Ok(types::read_string(buf)
        .map_err(SchemaChangeEventParseError::AffectedTargetNameParseError)?
        .to_string())
}

fn read_arguments(buf: &mut &[u8]) -> Result<Vec<String>, SchemaChangeEventParseError> {
    let number_of_arguments = types::read_short(buf)
        .map_err(|err| SchemaChangeEventParseError::ArgumentCountParseError(err.into()))?;

    let mut argument_vector = Vec::with_capacity(number_of_arguments as usize);
    for _ in 0..number_of_arguments {
        argument_vector.push(
            types::read_string(buf)
                .map_err(SchemaChangeEventParseError::FunctionArgumentParseError)?
                .to_string(),
        );
    }
    Ok(argument_vector)
}

impl TopologyChangeEvent {
    /// Deserialize a topology change event from the provided buffer.
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ClusterChangeEventParseError> {
        let type_of_change = types::read_string(buf)
            .map_err(ClusterChangeEventParseError::TypeOfChangeParseError)?;
        let addr =
            types::read_inet(buf).map_err(ClusterChangeEventParseError::NodeAddressParseError)?;

        match type_of_change {
            "NEW_NODE" => Ok(Self::NewNode(addr)),
            "REMOVED_NODE" => Ok(Self::RemovedNode(addr)),
            _ => Err(ClusterChangeEventParseError::UnknownTypeOfChange(
                type_of_change.to_string(),
            )),
        }
    }
}

impl StatusChangeEvent {
    /// Deserialize a status change event from the provided buffer.
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ClusterChangeEventParseError> {
        let type_of_change = types::read_string(buf)
            .map_err(ClusterChangeEventParseError::TypeOfChangeParseError)?;
        let addr =
            types::read_inet(buf).map_err(ClusterChangeEventParseError::NodeAddressParseError)?;

        match type_of_change {
            "UP" => Ok(Self::Up(addr)),
            "DOWN" => Ok(Self::Down(addr)),
            _ => Err(ClusterChangeEventParseError::UnknownTypeOfChange(
                type_of_change.to_string(),
            )),
        }
    }
}
