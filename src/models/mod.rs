//! # Data Models
//!
//! SeaORM entities backing the sync engine's persisted state. Repositories own the
//! conversion between these rows and the typed domain values.

pub mod authorization;
pub mod id_mapping;
pub mod pipe;
pub mod queued_pipe;
pub mod run_status;

pub use authorization::Entity as Authorization;
pub use id_mapping::Entity as IdMapping;
pub use pipe::Entity as Pipe;
pub use queued_pipe::Entity as QueuedPipe;
pub use run_status::Entity as RunStatus;
