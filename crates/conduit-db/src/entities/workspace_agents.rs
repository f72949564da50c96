use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "workspace_agents")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: Uuid,
    pub name: String,
    pub resource_id: Uuid,
    #[sea_orm(unique)]
    pub auth_token: Uuid,
    pub directory: String,
    pub env: Json,
    pub operating_system: String,
    pub architecture: String,
    pub first_connected_at: Option<DateTimeWithTimeZone>,
    pub last_connected_at: Option<DateTimeWithTimeZone>,
    pub disconnected_at: Option<DateTimeWithTimeZone>,
    pub last_connected_replica_id: Option<Uuid>,
    pub connection_timeout_seconds: i32,
    pub logs_length: i64,
    pub logs_overflowed: bool,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::workspace_resources::Entity",
        from = "Column::ResourceId",
        to = "super::workspace_resources::Column::Id"
    )]
    WorkspaceResources,
}

impl Related<super::workspace_resources::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::WorkspaceResources.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
