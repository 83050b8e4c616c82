//! Migration to create the authorizations table.
//!
//! One row per (workspace, service) holding the workspace token and the opaque
//! OAuth credential blob. Rows are overwritten wholesale on refresh or re-exchange.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Authorizations::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Authorizations::WorkspaceId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Authorizations::ServiceId).text().not_null())
                    .col(
                        ColumnDef::new(Authorizations::WorkspaceToken)
                            .text()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Authorizations::Data).binary().not_null())
                    .col(
                        ColumnDef::new(Authorizations::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Authorizations::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .primary_key(
                        Index::create()
                            .col(Authorizations::WorkspaceId)
                            .col(Authorizations::ServiceId),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Authorizations::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Authorizations {
    Table,
    WorkspaceId,
    ServiceId,
    WorkspaceToken,
    Data,
    CreatedAt,
    UpdatedAt,
}
