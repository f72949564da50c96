use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "parameter_values")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: Uuid,
    pub scope: String,
    pub scope_id: Uuid,
    pub name: String,
    pub source_value: String,
    pub destination: String,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
