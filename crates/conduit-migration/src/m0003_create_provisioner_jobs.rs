use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ProvisionerDaemons::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ProvisionerDaemons::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ProvisionerDaemons::Name).string().not_null())
                    .col(
                        ColumnDef::new(ProvisionerDaemons::Provisioners)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ProvisionerDaemons::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(ProvisionerJobs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ProvisionerJobs::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(ProvisionerJobs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(ProvisionerJobs::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(ProvisionerJobs::StartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ProvisionerJobs::CanceledAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ProvisionerJobs::CompletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(ProvisionerJobs::Error).text().null())
                    .col(
                        ColumnDef::new(ProvisionerJobs::OrganizationId)
                            .uuid()
                            .not_null(),
                    )
                    .col(ColumnDef::new(ProvisionerJobs::InitiatorId).uuid().not_null())
                    .col(ColumnDef::new(ProvisionerJobs::Provisioner).string().not_null())
                    .col(
                        ColumnDef::new(ProvisionerJobs::StorageMethod)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ProvisionerJobs::StorageSource)
                            .binary()
                            .not_null(),
                    )
                    .col(ColumnDef::new(ProvisionerJobs::Type).string().not_null())
                    .col(ColumnDef::new(ProvisionerJobs::Input).binary().not_null())
                    .col(ColumnDef::new(ProvisionerJobs::WorkerId).uuid().null())
                    .to_owned(),
            )
            .await?;

        // Acquisition scans pending jobs oldest first.
        manager
            .create_index(
                Index::create()
                    .name("idx_provisioner_jobs_pending")
                    .table(ProvisionerJobs::Table)
                    .col(ProvisionerJobs::StartedAt)
                    .col(ProvisionerJobs::CreatedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(ProvisionerJobLogs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ProvisionerJobLogs::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ProvisionerJobLogs::JobId).uuid().not_null())
                    .col(
                        ColumnDef::new(ProvisionerJobLogs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(ColumnDef::new(ProvisionerJobLogs::Source).string().not_null())
                    .col(ColumnDef::new(ProvisionerJobLogs::Level).string().not_null())
                    .col(ColumnDef::new(ProvisionerJobLogs::Stage).string().not_null())
                    .col(ColumnDef::new(ProvisionerJobLogs::Output).text().not_null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_provisioner_job_logs_job")
                            .from(ProvisionerJobLogs::Table, ProvisionerJobLogs::JobId)
                            .to(ProvisionerJobs::Table, ProvisionerJobs::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(ParameterSchemas::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ParameterSchemas::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ParameterSchemas::JobId).uuid().not_null())
                    .col(ColumnDef::new(ParameterSchemas::Name).string().not_null())
                    .col(
                        ColumnDef::new(ParameterSchemas::Description)
                            .text()
                            .not_null()
                            .default(""),
                    )
                    .col(
                        ColumnDef::new(ParameterSchemas::DefaultSourceValue)
                            .text()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ParameterSchemas::AllowOverrideSource)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(ParameterSchemas::Destination)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ParameterSchemas::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .index(
                        Index::create()
                            .name("idx_parameter_schemas_job_name_unique")
                            .table(ParameterSchemas::Table)
                            .col(ParameterSchemas::JobId)
                            .col(ParameterSchemas::Name)
                            .unique(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(ParameterValues::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ParameterValues::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ParameterValues::Scope).string().not_null())
                    .col(ColumnDef::new(ParameterValues::ScopeId).uuid().not_null())
                    .col(ColumnDef::new(ParameterValues::Name).string().not_null())
                    .col(
                        ColumnDef::new(ParameterValues::SourceValue)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ParameterValues::Destination)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ParameterValues::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(ParameterValues::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .index(
                        Index::create()
                            .name("idx_parameter_values_scope_name_unique")
                            .table(ParameterValues::Table)
                            .col(ParameterValues::Scope)
                            .col(ParameterValues::ScopeId)
                            .col(ParameterValues::Name)
                            .unique(),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ParameterValues::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(ParameterSchemas::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(ProvisionerJobLogs::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(ProvisionerJobs::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(ProvisionerDaemons::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ProvisionerDaemons {
    Table,
    Id,
    Name,
    Provisioners,
    CreatedAt,
}

#[derive(DeriveIden)]
enum ProvisionerJobs {
    Table,
    Id,
    CreatedAt,
    UpdatedAt,
    StartedAt,
    CanceledAt,
    CompletedAt,
    Error,
    OrganizationId,
    InitiatorId,
    Provisioner,
    StorageMethod,
    StorageSource,
    Type,
    Input,
    WorkerId,
}

#[derive(DeriveIden)]
enum ProvisionerJobLogs {
    Table,
    Id,
    JobId,
    CreatedAt,
    Source,
    Level,
    Stage,
    Output,
}

#[derive(DeriveIden)]
enum ParameterSchemas {
    Table,
    Id,
    JobId,
    Name,
    Description,
    DefaultSourceValue,
    AllowOverrideSource,
    Destination,
    CreatedAt,
}

#[derive(DeriveIden)]
enum ParameterValues {
    Table,
    Id,
    Scope,
    ScopeId,
    Name,
    SourceValue,
    Destination,
    CreatedAt,
    UpdatedAt,
}
