//! # Repository Layer
//!
//! Typed stores over the SeaORM entities. Rows are decoded into domain values at
//! this boundary; nothing above it sees JSON or raw blobs except adapter params.

pub mod authorization;
pub mod id_mapping;
pub mod pipe;
pub mod run_status;

pub use authorization::{Authorization, CredentialError, CredentialStore};
pub use id_mapping::{IdMapping, IdMappingRepository, ReversedIdMapping};
pub use pipe::{Pipe, PipeRepository};
pub use run_status::RunStatusRepository;
