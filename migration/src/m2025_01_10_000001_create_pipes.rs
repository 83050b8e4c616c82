//! Migration to create the pipes table.
//!
//! A pipe is one configured sync channel for a (workspace, service, entity type) triple,
//! keyed by `(workspace_id, key)` where `key` is `"<service>:<entity>"`.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Pipes::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Pipes::WorkspaceId).big_integer().not_null())
                    .col(ColumnDef::new(Pipes::Key).text().not_null())
                    .col(ColumnDef::new(Pipes::ServiceId).text().not_null())
                    .col(ColumnDef::new(Pipes::EntityType).text().not_null())
                    .col(
                        ColumnDef::new(Pipes::Automatic)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(Pipes::ServiceParams).binary().null())
                    .col(
                        ColumnDef::new(Pipes::LastSync)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Pipes::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Pipes::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .primary_key(Index::create().col(Pipes::WorkspaceId).col(Pipes::Key))
                    .to_owned(),
            )
            .await?;

        // Automatic sweeps scan every automatic pipe across all workspaces
        manager
            .create_index(
                Index::create()
                    .name("idx_pipes_automatic")
                    .table(Pipes::Table)
                    .col(Pipes::Automatic)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_pipes_automatic").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(Pipes::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Pipes {
    Table,
    WorkspaceId,
    Key,
    ServiceId,
    EntityType,
    Automatic,
    ServiceParams,
    LastSync,
    CreatedAt,
    UpdatedAt,
}
