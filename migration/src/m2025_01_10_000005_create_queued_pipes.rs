//! Migration to create the queued_pipes table.
//!
//! Queue entries move from pending (`claimed_at IS NULL`) to in flight (`claimed_at` set,
//! `completed_at IS NULL`) to inert (`completed_at` set). Two partial unique indexes keep
//! at most one pending entry per pipe and at most one in-flight entry per workspace.

use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::Statement;

#[derive(DeriveMigrationName)]
pub struct Migration;

const PENDING_INDEX: &str = "CREATE UNIQUE INDEX IF NOT EXISTS idx_queued_pipes_pending \
     ON queued_pipes (workspace_id, pipe_key) WHERE claimed_at IS NULL";

const IN_FLIGHT_INDEX: &str = "CREATE UNIQUE INDEX IF NOT EXISTS idx_queued_pipes_in_flight \
     ON queued_pipes (workspace_id) WHERE claimed_at IS NOT NULL AND completed_at IS NULL";

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(QueuedPipes::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(QueuedPipes::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(QueuedPipes::WorkspaceId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(QueuedPipes::PipeKey).text().not_null())
                    .col(
                        ColumnDef::new(QueuedPipes::Priority)
                            .small_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(QueuedPipes::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(QueuedPipes::ClaimedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(QueuedPipes::ClaimedBy).text().null())
                    .col(
                        ColumnDef::new(QueuedPipes::CompletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        let connection = manager.get_connection();
        let backend = manager.get_database_backend();
        for sql in [PENDING_INDEX, IN_FLIGHT_INDEX] {
            connection
                .execute(Statement::from_string(backend, sql.to_string()))
                .await?;
        }

        // Claim ordering scan
        connection
            .execute(Statement::from_string(
                backend,
                "CREATE INDEX IF NOT EXISTS idx_queued_pipes_claim_order \
                 ON queued_pipes (priority DESC, created_at)"
                    .to_string(),
            ))
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let connection = manager.get_connection();
        let backend = manager.get_database_backend();
        for name in [
            "idx_queued_pipes_claim_order",
            "idx_queued_pipes_in_flight",
            "idx_queued_pipes_pending",
        ] {
            connection
                .execute(Statement::from_string(
                    backend,
                    format!("DROP INDEX IF EXISTS {name}"),
                ))
                .await?;
        }

        manager
            .drop_table(Table::drop().table(QueuedPipes::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum QueuedPipes {
    Table,
    Id,
    WorkspaceId,
    PipeKey,
    Priority,
    CreatedAt,
    ClaimedAt,
    ClaimedBy,
    CompletedAt,
}
