//! Compiled, backend-native query options.

use crate::query::Dialect;
use serde_json::Value;

#[derive(Clone, Debug, PartialEq)]
pub struct QueryOptions<D: Dialect> {
    pub filter: Option<D::Filter>,
    pub attributes: Option<Vec<String>>,
    pub include: Option<D::Include>,
    pub sort: Option<D::Sort>,
    pub offset: Option<u64>,
    pub limit: Option<u64>,
    /// Counted/paginated fetch (true) or plain fetch.
    pub pagination: Option<bool>,
    pub with_deleted: Option<bool>,
    pub only_deleted: Option<bool>,
    /// Not-found lookups succeed with `data: null`.
    pub allow_empty: Option<bool>,
    pub hard_delete: Option<bool>,
    pub aggregate: Option<Value>,
    pub transaction: Option<D::Transaction>,
}

impl<D: Dialect> Default for QueryOptions<D> {
    fn default() -> Self {
        QueryOptions {
            filter: None,
            attributes: None,
            include: None,
            sort: None,
            offset: None,
            limit: None,
            pagination: None,
            with_deleted: None,
            only_deleted: None,
            allow_empty: None,
            hard_delete: None,
            aggregate: None,
            transaction: None,
        }
    }
}

impl<D: Dialect> QueryOptions<D> {
    /// Field-by-field merge: anything already set on `self` wins over `compiled`.
    pub fn overlay(self, compiled: QueryOptions<D>) -> QueryOptions<D> {
        QueryOptions {
            filter: self.filter.or(compiled.filter),
            attributes: self.attributes.or(compiled.attributes),
            include: self.include.or(compiled.include),
            sort: self.sort.or(compiled.sort),
            offset: self.offset.or(compiled.offset),
            limit: self.limit.or(compiled.limit),
            pagination: self.pagination.or(compiled.pagination),
            with_deleted: self.with_deleted.or(compiled.with_deleted),
            only_deleted: self.only_deleted.or(compiled.only_deleted),
            allow_empty: self.allow_empty.or(compiled.allow_empty),
            hard_delete: self.hard_delete.or(compiled.hard_delete),
            aggregate: self.aggregate.or(compiled.aggregate),
            transaction: self.transaction.or(compiled.transaction),
        }
    }

    /// Only the transaction survives; used for internal lookups that must not be
    /// paginated, projected or populated.
    pub fn plain(&self) -> QueryOptions<D> {
        QueryOptions {
            transaction: self.transaction.clone(),
            ..Default::default()
        }
    }

    pub fn allows_empty(&self) -> bool {
        self.allow_empty.unwrap_or(false)
    }

    pub fn is_hard_delete(&self) -> bool {
        self.hard_delete.unwrap_or(false)
    }
}

/// Which records a read sees with respect to the soft-delete marker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeletedScope {
    Live,
    All,
    OnlyDeleted,
}

impl DeletedScope {
    pub fn from_options<D: Dialect>(options: &QueryOptions<D>) -> Self {
        if options.only_deleted.unwrap_or(false) {
            DeletedScope::OnlyDeleted
        } else if options.with_deleted.unwrap_or(false) {
            DeletedScope::All
        } else {
            DeletedScope::Live
        }
    }
}
