//! Query compiler: loosely-typed client payload into backend-native options.

mod compiler;
mod dialect;
mod options;
pub mod projection;
pub mod sort;

pub use compiler::*;
pub use dialect::Dialect;
pub use options::{DeletedScope, QueryOptions};
pub use projection::{sanitize_field, split_select, Projection};
pub use sort::{parse_sort, SortDirection, SortKey};
