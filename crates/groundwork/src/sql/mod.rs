//! SQL support: bindable values, dialects, identifier rules and the query
//! templating used by relational handles.

pub mod dialect;
pub mod security;
pub mod template;
pub mod value;

pub use dialect::SqlDialect;
pub use security::validate_identifier;
pub use template::{Ident, SqlArg, SqlQuery};
pub use value::SqlValue;
