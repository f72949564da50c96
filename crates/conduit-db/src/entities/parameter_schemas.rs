use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "parameter_schemas")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: Uuid,
    pub job_id: Uuid,
    pub name: String,
    pub description: String,
    pub default_source_value: Option<String>,
    pub allow_override_source: bool,
    pub destination: String,
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
