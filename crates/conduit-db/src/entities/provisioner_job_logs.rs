use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "provisioner_job_logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub job_id: Uuid,
    pub created_at: DateTimeWithTimeZone,
    pub source: String,
    pub level: String,
    pub stage: String,
    pub output: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::provisioner_jobs::Entity",
        from = "Column::JobId",
        to = "super::provisioner_jobs::Column::Id"
    )]
    ProvisionerJobs,
}

impl Related<super::provisioner_jobs::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ProvisionerJobs.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
