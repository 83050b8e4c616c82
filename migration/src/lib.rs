//! Database migrations for the pipes sync engine.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2025_01_10_000001_create_pipes;
mod m2025_01_10_000002_create_authorizations;
mod m2025_01_10_000003_create_id_mappings;
mod m2025_01_10_000004_create_run_statuses;
mod m2025_01_10_000005_create_queued_pipes;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2025_01_10_000001_create_pipes::Migration),
            Box::new(m2025_01_10_000002_create_authorizations::Migration),
            Box::new(m2025_01_10_000003_create_id_mappings::Migration),
            Box::new(m2025_01_10_000004_create_run_statuses::Migration),
            Box::new(m2025_01_10_000005_create_queued_pipes::Migration),
        ]
    }
}
