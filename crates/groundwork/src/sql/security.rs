//! Identifier validation
//!
//! Identifiers (table and column names) cannot travel as bind parameters, so
//! the only identifiers allowed into query text are ones that pass these
//! rules. They are quoted on top of that when rendered.

use crate::error::TemplatingError;

/// Longest identifier accepted (PostgreSQL limit)
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// SQL keywords that are rejected as bare identifiers
static SQL_KEYWORDS: &[&str] = &[
    "SELECT", "INSERT", "UPDATE", "DELETE", "FROM", "WHERE", "JOIN", "UNION", "DROP", "CREATE",
    "ALTER", "GRANT", "REVOKE", "TRUNCATE", "EXEC", "EXECUTE", "DECLARE", "TABLE", "INTO",
    "VALUES", "AND", "OR", "NOT", "NULL",
];

/// Validate that an identifier is safe for use in SQL
pub fn validate_identifier(identifier: &str) -> Result<(), TemplatingError> {
    let first = identifier
        .chars()
        .next()
        .ok_or_else(|| TemplatingError::UnsafeValue("identifier cannot be empty".to_string()))?;

    if identifier.len() > MAX_IDENTIFIER_LEN {
        return Err(TemplatingError::UnsafeValue(format!(
            "identifier '{}' is too long (max {} characters)",
            identifier, MAX_IDENTIFIER_LEN
        )));
    }

    if let Some(c) = identifier
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '$'))
    {
        return Err(TemplatingError::UnsafeValue(format!(
            "identifier '{}' contains invalid character '{}'",
            identifier, c
        )));
    }

    if first.is_ascii_digit() {
        return Err(TemplatingError::UnsafeValue(format!(
            "identifier '{}' cannot start with a number",
            identifier
        )));
    }

    if SQL_KEYWORDS.contains(&identifier.to_uppercase().as_str()) {
        return Err(TemplatingError::UnsafeValue(format!(
            "identifier '{}' is a reserved SQL keyword",
            identifier
        )));
    }

    Ok(())
}
