use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "workspace_resources")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: Uuid,
    pub job_id: Uuid,
    pub transition: String,
    #[sea_orm(column_name = "type")]
    pub resource_type: String,
    pub name: String,
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
