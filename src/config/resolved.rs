//! Resolved entity model: descriptors validated and flattened for runtime use.

pub use crate::config::types::AssociationDirection;
use std::collections::HashMap;

#[derive(Clone, Debug, PartialEq)]
pub struct ColumnInfo {
    pub name: String,
    pub pg_type: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Association {
    pub name: String,
    pub target: String,
    pub direction: AssociationDirection,
    pub local_key: String,
    pub foreign_key: String,
}

impl Association {
    pub fn to_one(name: &str, target: &str, local_key: &str, foreign_key: &str) -> Self {
        Association {
            name: name.to_string(),
            target: target.to_string(),
            direction: AssociationDirection::ToOne,
            local_key: local_key.to_string(),
            foreign_key: foreign_key.to_string(),
        }
    }

    pub fn to_many(name: &str, target: &str, local_key: &str, foreign_key: &str) -> Self {
        Association {
            name: name.to_string(),
            target: target.to_string(),
            direction: AssociationDirection::ToMany,
            local_key: local_key.to_string(),
            foreign_key: foreign_key.to_string(),
        }
    }
}

/// Static descriptor for one persisted entity. Every entity conforms to the record
/// shape (`active`, `deleted`, `created_*`, `updated_*`, `deleted_*`).
#[derive(Clone, Debug, PartialEq)]
pub struct EntityDescriptor {
    pub name: String,
    pub schema_name: Option<String>,
    pub table_name: String,
    /// None means the backend default pk.
    pub pk: Option<String>,
    /// Known columns. Empty means "accept any sanitized field from the body".
    pub columns: Vec<ColumnInfo>,
    pub search_fields: Vec<String>,
    pub history: bool,
    pub trash: bool,
    pub associations: Vec<Association>,
}

impl EntityDescriptor {
    pub fn new(name: &str) -> Self {
        EntityDescriptor {
            name: name.to_string(),
            schema_name: None,
            table_name: name.to_string(),
            pk: None,
            columns: Vec::new(),
            search_fields: Vec::new(),
            history: false,
            trash: false,
            associations: Vec::new(),
        }
    }

    pub fn with_table(mut self, table: &str) -> Self {
        self.table_name = table.to_string();
        self
    }

    pub fn with_schema(mut self, schema: &str) -> Self {
        self.schema_name = Some(schema.to_string());
        self
    }

    pub fn with_pk(mut self, pk: &str) -> Self {
        self.pk = Some(pk.to_string());
        self
    }

    pub fn with_column(mut self, name: &str, pg_type: Option<&str>) -> Self {
        self.columns.push(ColumnInfo {
            name: name.to_string(),
            pg_type: pg_type.map(String::from),
        });
        self
    }

    pub fn with_search_fields(mut self, fields: &[&str]) -> Self {
        self.search_fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn with_history(mut self, on: bool) -> Self {
        self.history = on;
        self
    }

    pub fn with_trash(mut self, on: bool) -> Self {
        self.trash = on;
        self
    }

    pub fn with_association(mut self, association: Association) -> Self {
        self.associations.push(association);
        self
    }

    pub fn association(&self, name: &str) -> Option<&Association> {
        self.associations.iter().find(|a| a.name == name)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn pk_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.pk.as_deref().unwrap_or(default)
    }
}

#[derive(Clone, Debug, Default)]
pub struct ResolvedModel {
    pub entities: Vec<EntityDescriptor>,
    pub entity_by_name: HashMap<String, EntityDescriptor>,
}

impl ResolvedModel {
    /// Build from descriptors declared in code. Later duplicates replace earlier ones.
    pub fn from_entities(entities: Vec<EntityDescriptor>) -> Self {
        let entity_by_name = entities
            .iter()
            .map(|e| (e.name.clone(), e.clone()))
            .collect();
        ResolvedModel {
            entities,
            entity_by_name,
        }
    }

    pub fn entity(&self, name: &str) -> Option<&EntityDescriptor> {
        self.entity_by_name.get(name)
    }
}
