use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "workspace_agent_scripts")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: Uuid,
    pub agent_id: Uuid,
    pub display_name: String,
    pub script: String,
    pub run_on_start: bool,
    pub run_on_stop: bool,
    pub timeout_seconds: i32,
    pub log_path: String,
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
