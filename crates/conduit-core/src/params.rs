use std::collections::BTreeMap;

use uuid::Uuid;

use crate::models::{ParameterDestination, ParameterScope, ParameterValue};
use crate::store::{Store, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputedParameter {
    pub name: String,
    pub value: String,
    pub destination: ParameterDestination,
    /// Scope the value came from; `None` when the schema default was used.
    pub scope: Option<ParameterScope>,
    pub scope_id: Option<Uuid>,
}

#[derive(Debug, thiserror::Error)]
pub enum ParameterError {
    #[error("parameter {0:?} has no value and no default")]
    Missing(String),
    #[error("get parameter schemas: {0}")]
    Schemas(StoreError),
    #[error("get {scope:?} parameter values: {source}")]
    Values {
        scope: ParameterScope,
        source: StoreError,
    },
}

/// Scope ids consulted for one build, lowest precedence first.
#[derive(Debug, Clone, Copy)]
pub struct ParameterScopes {
    pub template_import_job_id: Uuid,
    pub organization_id: Uuid,
    pub template_id: Option<Uuid>,
    pub workspace_id: Option<Uuid>,
}

/// Computes the parameter set for a build.
///
/// Schemas come from the template version's import job. Each schema starts at its default, then
/// organization, template and workspace values apply in that order. A value from a narrower
/// scope only replaces an existing one when the schema allows overriding; it always fills a gap.
pub async fn compute(
    store: &dyn Store,
    scopes: ParameterScopes,
) -> Result<Vec<ComputedParameter>, ParameterError> {
    let schemas = store
        .parameter_schemas_by_job_id(scopes.template_import_job_id)
        .await
        .map_err(ParameterError::Schemas)?;

    let mut values: BTreeMap<String, ComputedParameter> = BTreeMap::new();
    for schema in &schemas {
        if let Some(default) = &schema.default_source_value {
            values.insert(
                schema.name.clone(),
                ComputedParameter {
                    name: schema.name.clone(),
                    value: default.clone(),
                    destination: schema.destination,
                    scope: None,
                    scope_id: None,
                },
            );
        }
    }

    let layers = [
        (ParameterScope::Organization, Some(scopes.organization_id)),
        (ParameterScope::Template, scopes.template_id),
        (ParameterScope::Workspace, scopes.workspace_id),
    ];
    for (scope, scope_id) in layers {
        let Some(scope_id) = scope_id else { continue };
        let scoped: Vec<ParameterValue> = store
            .parameter_values(scope, scope_id)
            .await
            .map_err(|source| ParameterError::Values { scope, source })?;
        for value in scoped {
            let Some(schema) = schemas.iter().find(|s| s.name == value.name) else {
                continue;
            };
            let overridable = match values.get(&value.name) {
                None => true,
                Some(existing) => existing.scope.is_none() || schema.allow_override_source,
            };
            if overridable {
                values.insert(
                    value.name.clone(),
                    ComputedParameter {
                        name: value.name,
                        value: value.source_value,
                        destination: value.destination,
                        scope: Some(scope),
                        scope_id: Some(scope_id),
                    },
                );
            }
        }
    }

    for schema in &schemas {
        if !values.contains_key(&schema.name) {
            return Err(ParameterError::Missing(schema.name.clone()));
        }
    }
    Ok(values.into_values().collect())
}
