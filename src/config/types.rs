//! Raw entity descriptor types as they appear in JSON.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ColumnConfig {
    pub name: String,
    /// PostgreSQL type used for placeholder casts (e.g. "timestamptz", "uuid").
    #[serde(default, rename = "type")]
    pub pg_type: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssociationDirection {
    /// We hold the key that points at one related record.
    ToOne,
    /// Related records hold a key that points back at us.
    ToMany,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AssociationConfig {
    /// Name used in populate paths (e.g. "author" in "author.profile").
    pub name: String,
    /// Entity name of the related records.
    pub target: String,
    pub direction: AssociationDirection,
    /// Our field used in the match (our FK for to_one, usually our pk for to_many).
    pub local_key: String,
    /// Their field used in the match (their pk for to_one, their FK for to_many).
    pub foreign_key: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntityConfig {
    pub name: String,
    /// Table or collection name; defaults to `name`.
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub schema: Option<String>,
    /// Primary key field; defaults to the backend's (`id` or `_id`).
    #[serde(default)]
    pub primary_key: Option<String>,
    #[serde(default)]
    pub columns: Vec<ColumnConfig>,
    #[serde(default)]
    pub search_fields: Vec<String>,
    /// Write a History snapshot after every successful create/update.
    #[serde(default)]
    pub history: bool,
    /// Archive a Trash snapshot on hard delete.
    #[serde(default)]
    pub trash: bool,
    #[serde(default)]
    pub associations: Vec<AssociationConfig>,
}
