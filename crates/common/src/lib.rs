//! Shared infrastructure for the swarm coordination workspace.
//!
//! Provides the topic-based [`EventBus`] used for cross-component event
//! emission and the `tracing` initialization helpers.

pub mod event_bus;
pub mod logging;

pub use event_bus::{EventBus, EventEnvelope};
pub use logging::{init_logging, LoggingConfig};
