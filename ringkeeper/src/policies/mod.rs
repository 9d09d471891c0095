//! Pluggable behavior of the control connection: which hosts it reconnects
//! to, how long it waits between attempts, and who hears about changes.

pub mod host_listener;
pub mod load_balancing;
pub mod reconnection;
pub mod schema_listener;
