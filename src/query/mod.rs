//! Query-string driven filtering, sorting, projection and pagination.

pub mod document;
pub mod shape;

pub use document::{DocumentQuery, PgDocumentQuery};
pub use shape::{Op, Predicate, QueryShape};
