//! SQL rendering helpers shared by sampling and splitting.

use serde::{Deserialize, Serialize};

use crate::batch::IdentifierValue;

/// SQL flavour a selectable is rendered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlDialect {
    /// DataFusion and Ballista sessions.
    DataFusion,
    Postgres,
}

impl SqlDialect {
    pub fn text_type(&self) -> &'static str {
        match self {
            SqlDialect::DataFusion => "VARCHAR",
            SqlDialect::Postgres => "TEXT",
        }
    }

    pub fn float_type(&self) -> &'static str {
        match self {
            SqlDialect::DataFusion => "DOUBLE",
            SqlDialect::Postgres => "DOUBLE PRECISION",
        }
    }
}

/// Double-quote an identifier, escaping embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Single-quote a string literal, escaping embedded quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Render an identifier value as a SQL literal.
pub fn literal(value: &IdentifierValue) -> String {
    match value {
        IdentifierValue::Null => "NULL".to_string(),
        IdentifierValue::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        IdentifierValue::Int(i) => i.to_string(),
        IdentifierValue::Str(s) => quote_literal(s),
    }
}

/// Wrap a selectable so it can be filtered: `SELECT * FROM (<base>) AS <alias>`.
pub(crate) fn subquery(base: &str, alias: &str) -> String {
    format!("SELECT * FROM ({}) AS {}", base, alias)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident_escapes() {
        assert_eq!(quote_ident("amount"), "\"amount\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_quote_literal_escapes() {
        assert_eq!(quote_literal("O'Brien"), "'O''Brien'");
    }

    #[test]
    fn test_literals() {
        assert_eq!(literal(&IdentifierValue::Int(7)), "7");
        assert_eq!(literal(&IdentifierValue::Bool(true)), "TRUE");
        assert_eq!(literal(&IdentifierValue::Null), "NULL");
        assert_eq!(literal(&IdentifierValue::Str("2020-01".into())), "'2020-01'");
    }
}
