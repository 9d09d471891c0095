//! Defines the CQL protocol-level types used by the ringkeeper control connection.
//!
//! Only the part of the protocol that the control plane touches lives here:
//! the server-pushed `EVENT` bodies, the low-level notations they are made of,
//! protocol versions and a small typed model of metadata query results.

pub mod frame;

pub mod value;

pub use crate::frame::protocol_version::ProtocolVersion;
