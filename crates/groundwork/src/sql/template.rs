//! Query Templating - injection-safe query descriptions
//!
//! A template is a sequence of literal text fragments interleaved with
//! arguments. Every value argument becomes a positional parameter; the query
//! text only ever receives placeholders, validated identifiers, or the
//! segments of another already-validated query.
//!
//! ```
//! use groundwork::sql;
//!
//! let email = "alice@example.com";
//! let query = sql!("SELECT * FROM users WHERE email = {}", email).unwrap();
//! assert_eq!(query.text(), "SELECT * FROM users WHERE email = $1");
//! assert_eq!(query.params().len(), 1);
//! ```

use serde_json::Value as JsonValue;

use super::dialect::SqlDialect;
use super::security::validate_identifier;
use super::value::SqlValue;
use crate::error::{TemplatingError, TemplatingResult};

/// One piece of a rendered query
#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Text(String),
    /// Zero-based index into `params`
    Param(usize),
    Identifier(String),
}

/// A validated, parameter-bound query description
#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    segments: Vec<Segment>,
    params: Vec<SqlValue>,
    text: String,
    validated: bool,
}

/// A table or column name interpolated into query text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ident(pub String);

impl Ident {
    pub fn new(name: impl Into<String>) -> Self {
        Ident(name.into())
    }
}

/// An interpolated template argument
#[derive(Debug, Clone, PartialEq)]
pub enum SqlArg {
    /// Bound as a positional parameter
    Value(SqlValue),
    /// Flattened into the outer query with its parameters renumbered
    Query(SqlQuery),
    /// Validated against the identifier rules and quoted for the dialect
    Identifier(String),
}

impl SqlQuery {
    /// Build a query from literal fragments and arguments.
    ///
    /// `fragments.len()` must be exactly `args.len() + 1`.
    pub fn template<S: AsRef<str>>(fragments: &[S], args: Vec<SqlArg>) -> TemplatingResult<Self> {
        if fragments.len() != args.len() + 1 {
            return Err(TemplatingError::ArityMismatch {
                fragments: fragments.len(),
                values: args.len(),
                expected: args.len() + 1,
            });
        }

        let mut builder = Builder::default();
        let mut args = args.into_iter();

        for fragment in fragments {
            builder.push_text(fragment.as_ref());
            if let Some(arg) = args.next() {
                builder.push_arg(arg)?;
            }
        }

        Ok(builder.finish())
    }

    /// Build a query from a `{}`-delimited template (`{{` and `}}` escape braces).
    /// Used by the [`sql!`](crate::sql!) macro.
    pub fn parse_template(template: &'static str, args: Vec<SqlArg>) -> TemplatingResult<Self> {
        let fragments = split_template(template);
        Self::template(&fragments, args)
    }

    /// A query with no interpolation at all
    pub fn literal(text: &'static str) -> Self {
        let mut builder = Builder::default();
        builder.push_text(text);
        builder.finish()
    }

    /// Wrap text and parameters produced outside the templating functions.
    /// The result is not validated and handles refuse to execute it.
    pub fn from_raw_parts(text: impl Into<String>, params: Vec<SqlValue>) -> Self {
        let text = text.into();
        Self {
            segments: vec![Segment::Text(text.clone())],
            params,
            text,
            validated: false,
        }
    }

    /// Canonical query text (PostgreSQL placeholders and quoting)
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Bound parameters in placeholder order
    pub fn params(&self) -> &[SqlValue] {
        &self.params
    }

    /// True when every interpolation point became a placeholder
    pub fn is_validated(&self) -> bool {
        self.validated
    }

    /// Render the query text for a specific dialect
    pub fn render(&self, dialect: SqlDialect) -> String {
        render_segments(&self.segments, dialect)
    }

    /// Concatenate two validated queries, separated by a single space
    pub fn append(self, other: SqlQuery) -> TemplatingResult<Self> {
        Self::template(&["", " ", ""], vec![SqlArg::Query(self), SqlArg::Query(other)])
    }
}

impl std::fmt::Display for SqlQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text)
    }
}

#[derive(Default)]
struct Builder {
    segments: Vec<Segment>,
    params: Vec<SqlValue>,
}

impl Builder {
    fn push_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        match self.segments.last_mut() {
            Some(Segment::Text(existing)) => existing.push_str(text),
            _ => self.segments.push(Segment::Text(text.to_string())),
        }
    }

    fn push_arg(&mut self, arg: SqlArg) -> TemplatingResult<()> {
        match arg {
            SqlArg::Value(value) => {
                check_bindable(&value)?;
                self.segments.push(Segment::Param(self.params.len()));
                self.params.push(value);
            }
            SqlArg::Query(query) => {
                if !query.validated {
                    return Err(TemplatingError::UnsafeValue(
                        "nested query was not built from a template".to_string(),
                    ));
                }
                let offset = self.params.len();
                for segment in query.segments {
                    match segment {
                        Segment::Text(text) => self.push_text(&text),
                        Segment::Param(index) => self.segments.push(Segment::Param(index + offset)),
                        ident @ Segment::Identifier(_) => self.segments.push(ident),
                    }
                }
                self.params.extend(query.params);
            }
            SqlArg::Identifier(name) => {
                validate_identifier(&name)?;
                self.segments.push(Segment::Identifier(name));
            }
        }
        Ok(())
    }

    fn finish(self) -> SqlQuery {
        let text = render_segments(&self.segments, SqlDialect::PostgreSQL);
        SqlQuery {
            segments: self.segments,
            params: self.params,
            text,
            validated: true,
        }
    }
}

fn check_bindable(value: &SqlValue) -> TemplatingResult<()> {
    match value {
        SqlValue::Float(f) if !f.is_finite() => Err(TemplatingError::UnsafeValue(format!(
            "non-finite float {} cannot be bound",
            f
        ))),
        _ => Ok(()),
    }
}

fn render_segments(segments: &[Segment], dialect: SqlDialect) -> String {
    let mut out = String::new();
    for segment in segments {
        match segment {
            Segment::Text(text) => out.push_str(text),
            Segment::Param(index) => out.push_str(&dialect.parameter_placeholder(*index)),
            Segment::Identifier(name) => out.push_str(&dialect.quote_identifier(name)),
        }
    }
    out
}

fn split_template(template: &str) -> Vec<String> {
    let mut fragments = Vec::new();
    let mut current = String::new();
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match (c, chars.peek()) {
            ('{', Some('{')) | ('}', Some('}')) => {
                current.push(c);
                chars.next();
            }
            ('{', Some('}')) => {
                chars.next();
                fragments.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    fragments.push(current);
    fragments
}

macro_rules! impl_value_arg {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for SqlArg {
                fn from(value: $ty) -> Self {
                    SqlArg::Value(SqlValue::from(value))
                }
            }
        )*
    };
}

impl_value_arg!(
    bool,
    i32,
    i64,
    u32,
    f32,
    f64,
    String,
    &str,
    &String,
    Vec<u8>,
    uuid::Uuid,
    chrono::DateTime<chrono::Utc>,
    JsonValue,
);

impl<T: Into<SqlValue>> From<Option<T>> for SqlArg {
    fn from(value: Option<T>) -> Self {
        SqlArg::Value(value.into())
    }
}

impl From<SqlValue> for SqlArg {
    fn from(value: SqlValue) -> Self {
        SqlArg::Value(value)
    }
}

impl From<SqlQuery> for SqlArg {
    fn from(query: SqlQuery) -> Self {
        SqlArg::Query(query)
    }
}

impl From<&SqlQuery> for SqlArg {
    fn from(query: &SqlQuery) -> Self {
        SqlArg::Query(query.clone())
    }
}

impl From<Ident> for SqlArg {
    fn from(ident: Ident) -> Self {
        SqlArg::Identifier(ident.0)
    }
}

impl From<&Ident> for SqlArg {
    fn from(ident: &Ident) -> Self {
        SqlArg::Identifier(ident.0.clone())
    }
}

/// Build a [`SqlQuery`] from a literal template and arguments.
///
/// Each `{}` in the template is an interpolation point. Values become
/// positional parameters, [`Ident`]s become quoted identifiers and nested
/// [`SqlQuery`]s are flattened. Returns `Result<SqlQuery, TemplatingError>`.
#[macro_export]
macro_rules! sql {
    ($template:literal $(, $arg:expr)* $(,)?) => {
        $crate::sql::SqlQuery::parse_template(
            $template,
            ::std::vec![$($crate::sql::SqlArg::from($arg)),*],
        )
    };
}
