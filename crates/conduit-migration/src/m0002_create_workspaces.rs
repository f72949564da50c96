use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

fn created_at<T: IntoIden>(col: T) -> ColumnDef {
    ColumnDef::new(col)
        .timestamp_with_time_zone()
        .not_null()
        .default(Expr::current_timestamp())
        .to_owned()
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Templates::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Templates::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Templates::OrganizationId).uuid().not_null())
                    .col(ColumnDef::new(Templates::Name).string().not_null())
                    .col(ColumnDef::new(Templates::Provisioner).string().not_null())
                    .col(created_at(Templates::CreatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(TemplateVersions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(TemplateVersions::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(TemplateVersions::TemplateId).uuid().null())
                    .col(
                        ColumnDef::new(TemplateVersions::OrganizationId)
                            .uuid()
                            .not_null(),
                    )
                    .col(ColumnDef::new(TemplateVersions::Name).string().not_null())
                    .col(ColumnDef::new(TemplateVersions::JobId).uuid().not_null())
                    .col(created_at(TemplateVersions::CreatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Workspaces::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Workspaces::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Workspaces::OwnerId).uuid().not_null())
                    .col(ColumnDef::new(Workspaces::OrganizationId).uuid().not_null())
                    .col(ColumnDef::new(Workspaces::TemplateId).uuid().not_null())
                    .col(ColumnDef::new(Workspaces::Name).string().not_null())
                    .col(
                        ColumnDef::new(Workspaces::Deleted)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(created_at(Workspaces::CreatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(WorkspaceBuilds::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(WorkspaceBuilds::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(WorkspaceBuilds::WorkspaceId).uuid().not_null())
                    .col(
                        ColumnDef::new(WorkspaceBuilds::TemplateVersionId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(WorkspaceBuilds::BuildNumber)
                            .integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(WorkspaceBuilds::Transition).string().not_null())
                    .col(ColumnDef::new(WorkspaceBuilds::InitiatorId).uuid().not_null())
                    .col(ColumnDef::new(WorkspaceBuilds::JobId).uuid().not_null())
                    .col(
                        ColumnDef::new(WorkspaceBuilds::ProvisionerState)
                            .binary()
                            .not_null()
                            .default(Expr::cust("''::bytea")),
                    )
                    .col(created_at(WorkspaceBuilds::CreatedAt))
                    .col(created_at(WorkspaceBuilds::UpdatedAt))
                    .index(
                        Index::create()
                            .name("idx_workspace_builds_number_unique")
                            .table(WorkspaceBuilds::Table)
                            .col(WorkspaceBuilds::WorkspaceId)
                            .col(WorkspaceBuilds::BuildNumber)
                            .unique(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_workspace_builds_workspace")
                            .from(WorkspaceBuilds::Table, WorkspaceBuilds::WorkspaceId)
                            .to(Workspaces::Table, Workspaces::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(WorkspaceResources::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(WorkspaceResources::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(WorkspaceResources::JobId).uuid().not_null())
                    .col(
                        ColumnDef::new(WorkspaceResources::Transition)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(WorkspaceResources::Type).string().not_null())
                    .col(ColumnDef::new(WorkspaceResources::Name).string().not_null())
                    .col(created_at(WorkspaceResources::CreatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(WorkspaceAgents::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(WorkspaceAgents::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(WorkspaceAgents::Name).string().not_null())
                    .col(ColumnDef::new(WorkspaceAgents::ResourceId).uuid().not_null())
                    .col(ColumnDef::new(WorkspaceAgents::AuthToken).uuid().not_null())
                    .col(
                        ColumnDef::new(WorkspaceAgents::Directory)
                            .string()
                            .not_null()
                            .default(""),
                    )
                    .col(
                        ColumnDef::new(WorkspaceAgents::Env)
                            .json_binary()
                            .not_null()
                            .default(Expr::cust("'{}'::jsonb")),
                    )
                    .col(
                        ColumnDef::new(WorkspaceAgents::OperatingSystem)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(WorkspaceAgents::Architecture)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(WorkspaceAgents::FirstConnectedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(WorkspaceAgents::LastConnectedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(WorkspaceAgents::DisconnectedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(WorkspaceAgents::LastConnectedReplicaId)
                            .uuid()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(WorkspaceAgents::ConnectionTimeoutSeconds)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(WorkspaceAgents::LogsLength)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(WorkspaceAgents::LogsOverflowed)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(created_at(WorkspaceAgents::CreatedAt))
                    .col(created_at(WorkspaceAgents::UpdatedAt))
                    .index(
                        Index::create()
                            .name("idx_workspace_agents_auth_token_unique")
                            .table(WorkspaceAgents::Table)
                            .col(WorkspaceAgents::AuthToken)
                            .unique(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_workspace_agents_resource")
                            .from(WorkspaceAgents::Table, WorkspaceAgents::ResourceId)
                            .to(WorkspaceResources::Table, WorkspaceResources::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(WorkspaceAgentScripts::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(WorkspaceAgentScripts::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(WorkspaceAgentScripts::AgentId).uuid().not_null())
                    .col(
                        ColumnDef::new(WorkspaceAgentScripts::DisplayName)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(WorkspaceAgentScripts::Script).text().not_null())
                    .col(
                        ColumnDef::new(WorkspaceAgentScripts::RunOnStart)
                            .boolean()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(WorkspaceAgentScripts::RunOnStop)
                            .boolean()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(WorkspaceAgentScripts::TimeoutSeconds)
                            .integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(WorkspaceAgentScripts::LogPath).string().not_null())
                    .col(created_at(WorkspaceAgentScripts::CreatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(WorkspaceAgentStats::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(WorkspaceAgentStats::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(WorkspaceAgentStats::AgentId).uuid().not_null())
                    .col(ColumnDef::new(WorkspaceAgentStats::WorkspaceId).uuid().not_null())
                    .col(ColumnDef::new(WorkspaceAgentStats::UserId).uuid().not_null())
                    .col(ColumnDef::new(WorkspaceAgentStats::TemplateId).uuid().not_null())
                    .col(created_at(WorkspaceAgentStats::CreatedAt))
                    .col(
                        ColumnDef::new(WorkspaceAgentStats::ConnectionsByProto)
                            .json_binary()
                            .not_null(),
                    )
                    .col(ColumnDef::new(WorkspaceAgentStats::ConnectionCount).big_integer().not_null())
                    .col(ColumnDef::new(WorkspaceAgentStats::RxPackets).big_integer().not_null())
                    .col(ColumnDef::new(WorkspaceAgentStats::RxBytes).big_integer().not_null())
                    .col(ColumnDef::new(WorkspaceAgentStats::TxPackets).big_integer().not_null())
                    .col(ColumnDef::new(WorkspaceAgentStats::TxBytes).big_integer().not_null())
                    .col(
                        ColumnDef::new(WorkspaceAgentStats::SessionCountSsh)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(WorkspaceAgentStats::SessionCountVscode)
                            .big_integer()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(WorkspaceAgentLogs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(WorkspaceAgentLogs::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(WorkspaceAgentLogs::AgentId).uuid().not_null())
                    .col(created_at(WorkspaceAgentLogs::CreatedAt))
                    .col(ColumnDef::new(WorkspaceAgentLogs::Level).string().not_null())
                    .col(ColumnDef::new(WorkspaceAgentLogs::Output).text().not_null())
                    .index(
                        Index::create()
                            .name("idx_workspace_agent_logs_agent")
                            .table(WorkspaceAgentLogs::Table)
                            .col(WorkspaceAgentLogs::AgentId)
                            .col(WorkspaceAgentLogs::Id),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(ExternalAuthLinks::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(ExternalAuthLinks::ProviderId).string().not_null())
                    .col(ColumnDef::new(ExternalAuthLinks::UserId).uuid().not_null())
                    .col(ColumnDef::new(ExternalAuthLinks::AccessToken).text().not_null())
                    .col(
                        ColumnDef::new(ExternalAuthLinks::Expiry)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(created_at(ExternalAuthLinks::CreatedAt))
                    .primary_key(
                        Index::create()
                            .col(ExternalAuthLinks::ProviderId)
                            .col(ExternalAuthLinks::UserId),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ExternalAuthLinks::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(WorkspaceAgentLogs::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(WorkspaceAgentStats::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(WorkspaceAgentScripts::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(WorkspaceAgents::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(WorkspaceResources::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(WorkspaceBuilds::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Workspaces::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(TemplateVersions::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Templates::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Templates {
    Table,
    Id,
    OrganizationId,
    Name,
    Provisioner,
    CreatedAt,
}

#[derive(DeriveIden)]
enum TemplateVersions {
    Table,
    Id,
    TemplateId,
    OrganizationId,
    Name,
    JobId,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Workspaces {
    Table,
    Id,
    OwnerId,
    OrganizationId,
    TemplateId,
    Name,
    Deleted,
    CreatedAt,
}

#[derive(DeriveIden)]
enum WorkspaceBuilds {
    Table,
    Id,
    WorkspaceId,
    TemplateVersionId,
    BuildNumber,
    Transition,
    InitiatorId,
    JobId,
    ProvisionerState,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum WorkspaceResources {
    Table,
    Id,
    JobId,
    Transition,
    Type,
    Name,
    CreatedAt,
}

#[derive(DeriveIden)]
enum WorkspaceAgents {
    Table,
    Id,
    Name,
    ResourceId,
    AuthToken,
    Directory,
    Env,
    OperatingSystem,
    Architecture,
    FirstConnectedAt,
    LastConnectedAt,
    DisconnectedAt,
    LastConnectedReplicaId,
    ConnectionTimeoutSeconds,
    LogsLength,
    LogsOverflowed,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum WorkspaceAgentScripts {
    Table,
    Id,
    AgentId,
    DisplayName,
    Script,
    RunOnStart,
    RunOnStop,
    TimeoutSeconds,
    LogPath,
    CreatedAt,
}

#[derive(DeriveIden)]
enum WorkspaceAgentStats {
    Table,
    Id,
    AgentId,
    WorkspaceId,
    UserId,
    TemplateId,
    CreatedAt,
    ConnectionsByProto,
    ConnectionCount,
    RxPackets,
    RxBytes,
    TxPackets,
    TxBytes,
    SessionCountSsh,
    SessionCountVscode,
}

#[derive(DeriveIden)]
enum WorkspaceAgentLogs {
    Table,
    Id,
    AgentId,
    CreatedAt,
    Level,
    Output,
}

#[derive(DeriveIden)]
enum ExternalAuthLinks {
    Table,
    ProviderId,
    UserId,
    AccessToken,
    Expiry,
    CreatedAt,
}
