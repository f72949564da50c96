use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "workspace_agent_stats")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: Uuid,
    pub agent_id: Uuid,
    pub workspace_id: Uuid,
    pub user_id: Uuid,
    pub template_id: Uuid,
    pub created_at: DateTimeWithTimeZone,
    pub connections_by_proto: Json,
    pub connection_count: i64,
    pub rx_packets: i64,
    pub rx_bytes: i64,
    pub tx_packets: i64,
    pub tx_bytes: i64,
    pub session_count_ssh: i64,
    pub session_count_vscode: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
