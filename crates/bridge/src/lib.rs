//! Slot orchestration for z2m pin-code locks.
//!
//! Provides lock name resolution, the per-device command dispatcher, the
//! answer correlator, the [`SlotManager`](manager::SlotManager) that drives
//! slot changes out to locks, the inbound message processing loop and
//! platform event types.

pub mod config;
pub mod correlator;
pub mod dispatcher;
pub mod events;
pub mod manager;
pub mod messages;
pub mod processor;
pub mod publisher;
pub mod resolver;

pub use config::{ConfigError, LocklyConfig};
pub use events::LocklyEvent;
pub use manager::{ApplyOptions, SlotManager};
pub use messages::InboundMessage;
pub use publisher::{CommandPublisher, PublishError};
pub use resolver::{LockDirectory, LockResolver, StaticDirectory};
