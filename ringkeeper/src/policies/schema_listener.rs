//! Notifications for schema objects which the control connection does not
//! track itself.
//!
//! Keyspace replication options are refreshed by the control connection.
//! Tables, user types, functions and aggregates only invalidate whatever a
//! higher-level schema cache holds, so they are forwarded to a listener.

use ringkeeper_cql::frame::response::event::{SchemaChangeEvent, SchemaChangeType};

/// Receives schema changes after they have been debounced.
pub trait SchemaChangeListener: Send + Sync {
    /// A table, type, function or aggregate changed.
    fn on_object_changed(&self, event: &SchemaChangeEvent);

    /// A keyspace was dropped. Its replicas are already gone from the token map.
    fn on_keyspace_dropped(&self, keyspace: &str) {
        let _ = keyspace;
    }
}

/// Whether `event` concerns a whole keyspace rather than an object inside it.
pub(crate) fn is_keyspace_scoped(event: &SchemaChangeEvent) -> bool {
    matches!(event, SchemaChangeEvent::KeyspaceChange { .. })
}

/// Whether the keyspace named by a keyspace-scoped event no longer exists.
pub(crate) fn is_drop(event: &SchemaChangeEvent) -> bool {
    event.change_type() == SchemaChangeType::Dropped
}
