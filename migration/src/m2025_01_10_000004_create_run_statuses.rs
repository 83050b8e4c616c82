//! Migration to create the run_statuses table.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(RunStatuses::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(RunStatuses::WorkspaceId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(RunStatuses::Key).text().not_null())
                    .col(ColumnDef::new(RunStatuses::Data).json_binary().not_null())
                    .col(
                        ColumnDef::new(RunStatuses::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .primary_key(
                        Index::create()
                            .col(RunStatuses::WorkspaceId)
                            .col(RunStatuses::Key),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(RunStatuses::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum RunStatuses {
    Table,
    WorkspaceId,
    Key,
    Data,
    UpdatedAt,
}
