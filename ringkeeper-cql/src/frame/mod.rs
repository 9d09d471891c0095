//! Pieces of the CQL binary protocol frames that the control connection decodes.

pub mod frame_errors;
pub mod protocol_version;
pub mod response;
pub mod server_event_type;
pub mod types;
