//! Migration to create the sync_progress table.
//!
//! Each row is the resume ledger entry for one (batch, connection, entity) unit.
//! The unique index enforces at most one row per unit.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SyncProgress::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SyncProgress::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(SyncProgress::BatchId).string_len(64).not_null())
                    .col(ColumnDef::new(SyncProgress::ConnectionName).text().not_null())
                    .col(ColumnDef::new(SyncProgress::Entity).text().not_null())
                    .col(
                        ColumnDef::new(SyncProgress::Status)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(SyncProgress::RecordsProcessed)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncProgress::RecordsSkipped)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncProgress::WriteDegraded)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(SyncProgress::ErrorMessage).text().null())
                    .col(
                        ColumnDef::new(SyncProgress::StartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SyncProgress::CompletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(SyncProgress::DurationMs).big_integer().null())
                    .col(
                        ColumnDef::new(SyncProgress::RetryCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncProgress::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(SyncProgress::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_sync_progress_batch_id")
                            .from(SyncProgress::Table, SyncProgress::BatchId)
                            .to(SyncBatches::Table, SyncBatches::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sync_progress_unit")
                    .table(SyncProgress::Table)
                    .col(SyncProgress::BatchId)
                    .col(SyncProgress::ConnectionName)
                    .col(SyncProgress::Entity)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sync_progress_batch_status")
                    .table(SyncProgress::Table)
                    .col(SyncProgress::BatchId)
                    .col(SyncProgress::Status)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_sync_progress_batch_status").to_owned())
            .await?;

        manager
            .drop_index(Index::drop().name("idx_sync_progress_unit").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(SyncProgress::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SyncProgress {
    Table,
    Id,
    BatchId,
    ConnectionName,
    Entity,
    Status,
    RecordsProcessed,
    RecordsSkipped,
    WriteDegraded,
    ErrorMessage,
    StartedAt,
    CompletedAt,
    DurationMs,
    RetryCount,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum SyncBatches {
    Table,
    Id,
}
