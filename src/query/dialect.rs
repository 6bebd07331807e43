//! Per-backend translation seam for the query compiler.

use crate::populate::PopulateNode;
use crate::query::sort::SortKey;
use serde_json::{Map, Value};
use std::fmt::Debug;

/// What a storage backend supplies to the compiler: its predicate, sort and include shapes,
/// how symbolic `where` trees and search terms become native predicates, and its default pk.
///
/// Implemented by zero-sized marker types ([`crate::relational::Relational`],
/// [`crate::document::Document`]).
pub trait Dialect: Clone + Debug + Default + PartialEq + Send + Sync + 'static {
    type Filter: Clone + Debug + PartialEq + Send + Sync;
    type Sort: Clone + Debug + PartialEq + Send + Sync;
    type Include: Clone + Debug + PartialEq + Send + Sync;
    /// Caller-owned transaction handle threaded through `options.transaction`.
    type Transaction: Clone + Debug + PartialEq + Send + Sync;

    const DEFAULT_PK: &'static str;

    /// Translate a client `where` tree. Never fails: malformed input becomes an empty predicate.
    fn translate_where(tree: &Value) -> Self::Filter;

    /// Case-insensitive substring match of `term` on any of `fields`.
    fn search(fields: &[String], term: &str) -> Self::Filter;

    fn conjoin(left: Self::Filter, right: Self::Filter) -> Self::Filter;

    /// True for the empty predicate (what malformed input degrades to).
    fn matches_all(filter: &Self::Filter) -> bool;

    fn fold_sort(keys: Vec<SortKey>) -> Self::Sort;

    fn serialize_populate(tree: Vec<PopulateNode>) -> Self::Include;

    /// Plain `field = value` pairs at the top of a predicate; used as defaults by find-or-create.
    fn equalities(filter: &Self::Filter) -> Map<String, Value>;
}
