use sea_orm_migration::prelude::*;

mod m0001_create_identity;
mod m0002_create_workspaces;
mod m0003_create_provisioner_jobs;
mod m0004_create_runtime_config;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m0001_create_identity::Migration),
            Box::new(m0002_create_workspaces::Migration),
            Box::new(m0003_create_provisioner_jobs::Migration),
            Box::new(m0004_create_runtime_config::Migration),
        ]
    }
}
