//! Migration to create the sync_batches table.
//!
//! One row per orchestrator run. The identifier is externally referenceable so
//! an operator can resume or inspect a batch from the command line.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SyncBatches::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SyncBatches::Id)
                            .string_len(64)
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(SyncBatches::Status)
                            .text()
                            .not_null()
                            .default("running"),
                    )
                    .col(
                        ColumnDef::new(SyncBatches::TotalTables)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncBatches::CompletedTables)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncBatches::FailedTables)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncBatches::DegradedTables)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(SyncBatches::Options).json_binary().null())
                    .col(
                        ColumnDef::new(SyncBatches::StartedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(SyncBatches::CompletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(SyncBatches::DurationMs).big_integer().null())
                    .col(
                        ColumnDef::new(SyncBatches::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(SyncBatches::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sync_batches_started_at")
                    .table(SyncBatches::Table)
                    .col(SyncBatches::StartedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_sync_batches_started_at").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(SyncBatches::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SyncBatches {
    Table,
    Id,
    Status,
    TotalTables,
    CompletedTables,
    FailedTables,
    DegradedTables,
    Options,
    StartedAt,
    CompletedAt,
    DurationMs,
    CreatedAt,
    UpdatedAt,
}
