//! Load entity descriptors from JSON and resolve them into a model.

use crate::config::resolved::{Association, ColumnInfo, EntityDescriptor, ResolvedModel};
use crate::config::types::EntityConfig;
use crate::config::validate;
use crate::error::ConfigError;
use std::collections::HashMap;
use std::path::Path;

/// Build resolved model from descriptor configs (validates first).
pub fn resolve(configs: &[EntityConfig]) -> Result<ResolvedModel, ConfigError> {
    validate(configs)?;

    let mut entities = Vec::with_capacity(configs.len());
    let mut entity_by_name = HashMap::new();
    for cfg in configs {
        let entity = EntityDescriptor {
            name: cfg.name.clone(),
            schema_name: cfg.schema.clone(),
            table_name: cfg.table.clone().unwrap_or_else(|| cfg.name.clone()),
            pk: cfg.primary_key.clone(),
            columns: cfg
                .columns
                .iter()
                .map(|c| ColumnInfo {
                    name: c.name.clone(),
                    pg_type: c.pg_type.clone(),
                })
                .collect(),
            search_fields: cfg.search_fields.clone(),
            history: cfg.history,
            trash: cfg.trash,
            associations: cfg
                .associations
                .iter()
                .map(|a| Association {
                    name: a.name.clone(),
                    target: a.target.clone(),
                    direction: a.direction,
                    local_key: a.local_key.clone(),
                    foreign_key: a.foreign_key.clone(),
                })
                .collect(),
        };
        entity_by_name.insert(entity.name.clone(), entity.clone());
        entities.push(entity);
    }
    Ok(ResolvedModel {
        entities,
        entity_by_name,
    })
}

/// Read a JSON array of entity descriptors from disk.
pub async fn load_from_path(path: impl AsRef<Path>) -> Result<Vec<EntityConfig>, ConfigError> {
    let path = path.as_ref();
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ConfigError::Load(format!("{}: {}", path.display(), e)))?;
    serde_json::from_str(&raw).map_err(|e| ConfigError::Load(format!("{}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AssociationDirection;
    use serde_json::json;

    #[test]
    fn resolves_defaults_and_associations() {
        let configs: Vec<EntityConfig> = serde_json::from_value(json!([
            { "name": "users", "search_fields": ["name", "email"], "history": true },
            {
                "name": "orders",
                "table": "shop_orders",
                "schema": "shop",
                "columns": [{ "name": "total", "type": "numeric" }],
                "associations": [{
                    "name": "user", "target": "users", "direction": "to_one",
                    "local_key": "user_id", "foreign_key": "id"
                }]
            }
        ]))
        .unwrap();
        let model = resolve(&configs).unwrap();
        let users = model.entity("users").unwrap();
        assert_eq!(users.table_name, "users");
        assert!(users.history);
        assert_eq!(users.pk_or("id"), "id");

        let orders = model.entity("orders").unwrap();
        assert_eq!(orders.table_name, "shop_orders");
        assert_eq!(orders.schema_name.as_deref(), Some("shop"));
        assert_eq!(orders.column("total").unwrap().pg_type.as_deref(), Some("numeric"));
        let user = orders.association("user").unwrap();
        assert_eq!(user.direction, AssociationDirection::ToOne);
        assert_eq!(user.local_key, "user_id");
    }

    #[tokio::test]
    async fn load_reports_missing_file() {
        let err = load_from_path("/nonexistent/entities.json").await.unwrap_err();
        assert!(matches!(err, ConfigError::Load(_)));
    }
}
