//! Database migrations for the branch sync warehouse.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2025_01_10_000001_create_sync_batches;
mod m2025_01_10_000002_create_sync_progress;
mod m2025_01_10_000003_create_warehouse_tables;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2025_01_10_000001_create_sync_batches::Migration),
            Box::new(m2025_01_10_000002_create_sync_progress::Migration),
            Box::new(m2025_01_10_000003_create_warehouse_tables::Migration),
        ]
    }
}
