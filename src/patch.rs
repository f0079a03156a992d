//! Patch state: the connection registry and how it is persisted

pub mod export;
pub mod persistence_actor;
pub mod registry;
pub mod snapshot;

pub use persistence_actor::{PersistenceActor, PersistenceHandle};
pub use registry::{PatchConnection, PatchRegistry};
pub use snapshot::{KnobRecord, PatchSnapshot};
