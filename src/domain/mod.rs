//! Domain layer: persisted records, entities and operational events.
//!
//! This module contains the storage-level record shape shared by every
//! backend, the entities the repositories read and write, and the event bus
//! used to broadcast maintenance and cache-pressure notifications.

pub mod entity;
pub mod event_bus;
pub mod infra_event;
pub mod record;

pub use entity::{Entity, UserProfile, VerificationRecord, VerificationStatus};
pub use event_bus::EventBus;
pub use infra_event::InfraEvent;
pub use record::{PersistedRecord, RecordKey};
