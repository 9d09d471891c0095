//! Server responses understood by the control connection.

pub mod event;

pub use event::Event;
