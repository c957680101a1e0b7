//! SQL dialects
//!
//! The engine only needs to know how each backend spells placeholders,
//! quotes identifiers and ignores duplicate inserts.

/// SQL dialect enumeration for generating database-specific SQL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlDialect {
    PostgreSQL,
    MySQL,
    SQLite,
}

impl SqlDialect {
    /// Detect the dialect from a connection URL scheme
    pub fn from_url(url: &str) -> Option<Self> {
        if url.starts_with("postgresql://") || url.starts_with("postgres://") {
            Some(SqlDialect::PostgreSQL)
        } else if url.starts_with("mysql://") {
            Some(SqlDialect::MySQL)
        } else if url.starts_with("sqlite:") {
            Some(SqlDialect::SQLite)
        } else {
            None
        }
    }

    /// Get the parameter placeholder style for this dialect (zero-based index)
    pub fn parameter_placeholder(&self, index: usize) -> String {
        match self {
            SqlDialect::PostgreSQL => format!("${}", index + 1),
            SqlDialect::MySQL | SqlDialect::SQLite => "?".to_string(),
        }
    }

    /// Get the quote character for identifiers in this dialect
    pub fn identifier_quote(&self) -> char {
        match self {
            SqlDialect::PostgreSQL => '"',
            SqlDialect::MySQL => '`',
            SqlDialect::SQLite => '"',
        }
    }

    /// Quote an identifier, doubling any embedded quote character
    pub fn quote_identifier(&self, identifier: &str) -> String {
        let quote = self.identifier_quote();
        let escaped = identifier.replace(quote, &format!("{}{}", quote, quote));
        format!("{}{}{}", quote, escaped, quote)
    }

    /// Whether schema changes take part in transactions. MySQL commits
    /// implicitly around DDL.
    pub fn transactional_ddl(&self) -> bool {
        match self {
            SqlDialect::PostgreSQL | SqlDialect::SQLite => true,
            SqlDialect::MySQL => false,
        }
    }

    /// Wrap an INSERT so that a primary key conflict is silently ignored.
    /// `table` must already be quoted; `rest` is the column list and VALUES clause.
    pub fn insert_ignore(&self, table: &str, rest: &str) -> String {
        match self {
            SqlDialect::PostgreSQL | SqlDialect::SQLite => {
                format!("INSERT INTO {} {} ON CONFLICT DO NOTHING", table, rest)
            }
            SqlDialect::MySQL => format!("INSERT IGNORE INTO {} {}", table, rest),
        }
    }
}

impl std::fmt::Display for SqlDialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlDialect::PostgreSQL => write!(f, "postgresql"),
            SqlDialect::MySQL => write!(f, "mysql"),
            SqlDialect::SQLite => write!(f, "sqlite"),
        }
    }
}
