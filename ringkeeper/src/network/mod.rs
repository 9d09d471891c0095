//! Seams between the control connection and the transport layer.
//!
//! The wire codec and socket handling live outside this crate. They are
//! plugged in through [`Connector`], which opens [`Connection`]s, and
//! [`EndpointResolver`], which turns configured contact points into addresses.

mod connection;
mod endpoint;

pub(crate) use connection::query_with_timeout;
pub use connection::{Connection, Connector, OpenedConnection};
pub use endpoint::{
    DnsEndpointResolver, Endpoint, EndpointResolver, KnownNode, ResolvedContactPoint,
    DEFAULT_PORT,
};
