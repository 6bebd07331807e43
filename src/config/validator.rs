//! Validates entity descriptors before resolution.

use crate::config::types::EntityConfig;
use crate::error::ConfigError;
use regex::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

fn identifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static identifier regex"))
}

/// Dotted paths are allowed for search fields (virtual columns across associations).
fn field_path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)*$").expect("static path regex")
    })
}

fn check_ident(value: &str) -> Result<(), ConfigError> {
    if identifier_re().is_match(value) {
        Ok(())
    } else {
        Err(ConfigError::InvalidIdentifier(value.to_string()))
    }
}

/// Check names are unique identifiers and every association points at a declared entity.
pub fn validate(configs: &[EntityConfig]) -> Result<(), ConfigError> {
    let mut names = HashSet::new();
    for entity in configs {
        check_ident(&entity.name)?;
        if !names.insert(entity.name.as_str()) {
            return Err(ConfigError::DuplicateEntity(entity.name.clone()));
        }
        if let Some(table) = &entity.table {
            check_ident(table)?;
        }
        if let Some(schema) = &entity.schema {
            check_ident(schema)?;
        }
        if let Some(pk) = &entity.primary_key {
            check_ident(pk)?;
        }
        for col in &entity.columns {
            check_ident(&col.name)?;
        }
        for field in &entity.search_fields {
            if !field_path_re().is_match(field) {
                return Err(ConfigError::InvalidIdentifier(field.clone()));
            }
        }
    }
    for entity in configs {
        let mut assoc_names = HashSet::new();
        for assoc in &entity.associations {
            check_ident(&assoc.name)?;
            check_ident(&assoc.local_key)?;
            check_ident(&assoc.foreign_key)?;
            if !assoc_names.insert(assoc.name.as_str()) {
                return Err(ConfigError::DuplicateEntity(format!(
                    "{}.{}",
                    entity.name, assoc.name
                )));
            }
            if !names.contains(assoc.target.as_str()) {
                return Err(ConfigError::MissingReference {
                    kind: "entity",
                    id: assoc.target.clone(),
                });
            }
        }
    }
    Ok(())
}
