//! Partitioning policies that split one asset into disjoint batches.
//!
//! A splitter maps each row to a tuple of partition keys. `distinct_query`
//! enumerates the tuples present in an asset and `predicate` selects the rows
//! of one tuple; NULL keys form their own partition through `IS NULL`, so the
//! partitions are disjoint and cover every row.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::batch::BatchIdentifiers;
use crate::error::{BatchError, Result};
use crate::sampling::tagged;
use crate::sql::{literal, quote_ident, quote_literal, subquery, SqlDialect};

const SPLIT_ALIAS: &str = "split_src";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum SplitterMethod {
    WholeTable,
    ColumnValue {
        #[serde(alias = "column_name")]
        column: String,
    },
    MultiColumnValues {
        #[serde(alias = "column_names")]
        columns: Vec<String>,
    },
    DividedInteger {
        #[serde(alias = "column_name")]
        column: String,
        divisor: i64,
    },
    ModInteger {
        #[serde(alias = "column_name")]
        column: String,
        #[serde(alias = "mod")]
        modulus: i64,
    },
    Year {
        #[serde(alias = "column_name")]
        column: String,
    },
    YearAndMonth {
        #[serde(alias = "column_name")]
        column: String,
    },
    YearAndMonthAndDay {
        #[serde(alias = "column_name")]
        column: String,
    },
    /// `date_format` uses strftime codes.
    ConvertedDatetime {
        #[serde(alias = "column_name")]
        column: String,
        #[serde(alias = "date_format_string")]
        date_format: String,
    },
    HashedColumn {
        #[serde(alias = "column_name")]
        column: String,
        hash_digits: u32,
    },
}

impl SplitterMethod {
    /// Build from a method name plus keyword map, e.g. `"split_on_column_value"`
    /// with `{"column_name": "region"}`.
    pub fn from_name(name: &str, kwargs: Option<&Value>) -> Result<Self> {
        let method = name.trim_start_matches('_').trim_start_matches("split_on_");
        let splitter: SplitterMethod = serde_json::from_value(tagged(method, kwargs)?)
            .map_err(|e| {
                BatchError::InvalidBatchKwargs(format!("invalid splitter method '{}': {}", name, e))
            })?;
        splitter.validate()?;
        Ok(splitter)
    }

    pub fn method_name(&self) -> &'static str {
        match self {
            SplitterMethod::WholeTable => "whole_table",
            SplitterMethod::ColumnValue { .. } => "column_value",
            SplitterMethod::MultiColumnValues { .. } => "multi_column_values",
            SplitterMethod::DividedInteger { .. } => "divided_integer",
            SplitterMethod::ModInteger { .. } => "mod_integer",
            SplitterMethod::Year { .. } => "year",
            SplitterMethod::YearAndMonth { .. } => "year_and_month",
            SplitterMethod::YearAndMonthAndDay { .. } => "year_and_month_and_day",
            SplitterMethod::ConvertedDatetime { .. } => "converted_datetime",
            SplitterMethod::HashedColumn { .. } => "hashed_column",
        }
    }

    pub fn validate(&self) -> Result<()> {
        let name = self.method_name();
        match self {
            SplitterMethod::WholeTable => {}
            SplitterMethod::MultiColumnValues { columns } => {
                if columns.is_empty() {
                    return Err(invalid(format!("{} splitter requires columns", name)));
                }
                for column in columns {
                    require_column(name, column)?;
                }
                let mut unique = columns.clone();
                unique.sort();
                unique.dedup();
                if unique.len() != columns.len() {
                    return Err(invalid(format!("{} splitter repeats a column", name)));
                }
            }
            SplitterMethod::DividedInteger { column, divisor } => {
                require_column(name, column)?;
                if *divisor <= 0 {
                    return Err(invalid(format!("{} splitter requires a positive divisor", name)));
                }
            }
            SplitterMethod::ModInteger { column, modulus } => {
                require_column(name, column)?;
                if *modulus <= 0 {
                    return Err(invalid(format!("{} splitter requires a positive modulus", name)));
                }
            }
            SplitterMethod::ConvertedDatetime {
                column,
                date_format,
            } => {
                require_column(name, column)?;
                if date_format.is_empty() {
                    return Err(invalid(format!("{} splitter requires a date_format", name)));
                }
            }
            SplitterMethod::HashedColumn {
                column,
                hash_digits,
            } => {
                require_column(name, column)?;
                if *hash_digits == 0 || *hash_digits > 32 {
                    return Err(invalid(format!(
                        "{} splitter hash_digits must be within 1..=32",
                        name
                    )));
                }
            }
            SplitterMethod::ColumnValue { column }
            | SplitterMethod::Year { column }
            | SplitterMethod::YearAndMonth { column }
            | SplitterMethod::YearAndMonthAndDay { column } => require_column(name, column)?,
        }
        Ok(())
    }

    /// Identifier keys carried by every partition this splitter produces.
    pub fn identifier_keys(&self) -> Vec<String> {
        match self {
            SplitterMethod::WholeTable => Vec::new(),
            SplitterMethod::MultiColumnValues { columns } => columns.clone(),
            SplitterMethod::ColumnValue { column }
            | SplitterMethod::Year { column }
            | SplitterMethod::YearAndMonth { column }
            | SplitterMethod::YearAndMonthAndDay { column }
            | SplitterMethod::DividedInteger { column, .. }
            | SplitterMethod::ModInteger { column, .. }
            | SplitterMethod::ConvertedDatetime { column, .. }
            | SplitterMethod::HashedColumn { column, .. } => vec![column.clone()],
        }
    }

    /// `(key, expression)` pairs computing each partition key from a row.
    pub fn partition_expressions(&self, dialect: SqlDialect) -> Result<Vec<(String, String)>> {
        self.validate()?;
        let exprs = match self {
            SplitterMethod::WholeTable => Vec::new(),
            SplitterMethod::ColumnValue { column } => vec![(column.clone(), quote_ident(column))],
            SplitterMethod::MultiColumnValues { columns } => columns
                .iter()
                .map(|c| (c.clone(), quote_ident(c)))
                .collect(),
            SplitterMethod::DividedInteger { column, divisor } => vec![(
                column.clone(),
                format!(
                    "CAST(floor(CAST({} AS {}) / {}) AS BIGINT)",
                    quote_ident(column),
                    dialect.float_type(),
                    divisor
                ),
            )],
            SplitterMethod::ModInteger { column, modulus } => vec![(
                column.clone(),
                format!("CAST({} % {} AS BIGINT)", quote_ident(column), modulus),
            )],
            SplitterMethod::Year { column } => vec![(
                column.clone(),
                format!(
                    "CAST(date_part('year', CAST({} AS TIMESTAMP)) AS BIGINT)",
                    quote_ident(column)
                ),
            )],
            SplitterMethod::YearAndMonth { column } => {
                vec![(column.clone(), date_text(column, "%Y-%m", dialect)?)]
            }
            SplitterMethod::YearAndMonthAndDay { column } => {
                vec![(column.clone(), date_text(column, "%Y-%m-%d", dialect)?)]
            }
            SplitterMethod::ConvertedDatetime {
                column,
                date_format,
            } => vec![(column.clone(), date_text(column, date_format, dialect)?)],
            SplitterMethod::HashedColumn {
                column,
                hash_digits,
            } => vec![(
                column.clone(),
                format!(
                    "right(md5(CAST({} AS {})), {})",
                    quote_ident(column),
                    dialect.text_type(),
                    hash_digits
                ),
            )],
        };
        Ok(exprs)
    }

    /// Query returning one row per partition, one column per identifier key.
    pub fn distinct_query(&self, base: &str, dialect: SqlDialect) -> Result<String> {
        let exprs = self.partition_expressions(dialect)?;
        if exprs.is_empty() {
            return Err(invalid("whole_table splitter has no partition keys to enumerate"));
        }
        let select = exprs
            .iter()
            .map(|(key, expr)| format!("{} AS {}", expr, quote_ident(key)))
            .collect::<Vec<_>>()
            .join(", ");
        let order = (1..=exprs.len())
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        Ok(format!(
            "SELECT DISTINCT {} FROM ({}) AS {} ORDER BY {}",
            select, base, SPLIT_ALIAS, order
        ))
    }

    /// WHERE clause selecting the partition named by `identifiers`.
    pub fn predicate(
        &self,
        identifiers: &BatchIdentifiers,
        dialect: SqlDialect,
    ) -> Result<Option<String>> {
        let exprs = self.partition_expressions(dialect)?;
        if exprs.is_empty() {
            return Ok(None);
        }
        let mut clauses = Vec::with_capacity(exprs.len());
        for (key, expr) in exprs {
            let value = identifiers.get(&key).ok_or_else(|| {
                invalid(format!(
                    "{} splitter requires batch identifier '{}'",
                    self.method_name(),
                    key
                ))
            })?;
            if value.is_null() {
                clauses.push(format!("{} IS NULL", expr));
            } else {
                clauses.push(format!("{} = {}", expr, literal(value)));
            }
        }
        Ok(Some(clauses.join(" AND ")))
    }

    /// Restrict `base` to one partition.
    pub fn apply(
        &self,
        base: &str,
        identifiers: &BatchIdentifiers,
        dialect: SqlDialect,
    ) -> Result<String> {
        let sql = subquery(base, SPLIT_ALIAS);
        Ok(match self.predicate(identifiers, dialect)? {
            Some(clause) => format!("{} WHERE {}", sql, clause),
            None => sql,
        })
    }
}

/// Translate strftime codes to a Postgres `to_char` template. Literal text
/// containing letters is double-quoted so it is not read as a template field.
pub fn strftime_to_postgres(format: &str) -> Result<String> {
    let mut out = String::new();
    let mut literal_run = String::new();
    let flush = |out: &mut String, run: &mut String| {
        if run.is_empty() {
            return;
        }
        if run.chars().any(|c| c.is_ascii_alphabetic()) {
            out.push('"');
            out.push_str(run);
            out.push('"');
        } else {
            out.push_str(run);
        }
        run.clear();
    };
    let mut chars = format.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            literal_run.push(c);
            continue;
        }
        let code = chars
            .next()
            .ok_or_else(|| invalid(format!("date format '{}' ends with '%'", format)))?;
        let field = match code {
            'Y' => "YYYY",
            'y' => "YY",
            'm' => "MM",
            'd' => "DD",
            'H' => "HH24",
            'M' => "MI",
            'S' => "SS",
            'j' => "DDD",
            '%' => {
                literal_run.push('%');
                continue;
            }
            other => {
                return Err(invalid(format!(
                    "date format code '%{}' is not supported for postgres",
                    other
                )))
            }
        };
        flush(&mut out, &mut literal_run);
        out.push_str(field);
    }
    flush(&mut out, &mut literal_run);
    Ok(out)
}

/// `column` rendered as text with a strftime format.
fn date_text(column: &str, format: &str, dialect: SqlDialect) -> Result<String> {
    let format = match dialect {
        SqlDialect::DataFusion => format.to_string(),
        SqlDialect::Postgres => strftime_to_postgres(format)?,
    };
    Ok(format!(
        "to_char(CAST({} AS TIMESTAMP), {})",
        quote_ident(column),
        quote_literal(&format)
    ))
}

fn require_column(method: &str, column: &str) -> Result<()> {
    if column.trim().is_empty() {
        return Err(invalid(format!("{} splitter requires a column", method)));
    }
    Ok(())
}

fn invalid(message: impl Into<String>) -> BatchError {
    BatchError::InvalidBatchSpec(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::IdentifierValue;

    fn ids(pairs: &[(&str, IdentifierValue)]) -> BatchIdentifiers {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_deserialize() {
        let s: SplitterMethod =
            serde_json::from_str(r#"{"method":"column_value","column":"region"}"#).unwrap();
        assert_eq!(s, SplitterMethod::ColumnValue { column: "region".into() });
        let s: SplitterMethod = serde_json::from_str(r#"{"method":"whole_table"}"#).unwrap();
        assert_eq!(s, SplitterMethod::WholeTable);
    }

    #[test]
    fn test_from_name_accepts_legacy_names() {
        let s = SplitterMethod::from_name(
            "_split_on_converted_datetime",
            Some(&serde_json::json!({"column_name": "ts", "date_format_string": "%Y"})),
        )
        .unwrap();
        assert_eq!(
            s,
            SplitterMethod::ConvertedDatetime {
                column: "ts".into(),
                date_format: "%Y".into()
            }
        );
        assert_eq!(
            SplitterMethod::from_name("split_on_whole_table", None).unwrap(),
            SplitterMethod::WholeTable
        );
        assert!(SplitterMethod::from_name("split_on_mod_integer", Some(&serde_json::json!({"column_name": "id", "mod": 0}))).is_err());
    }

    #[test]
    fn test_identifier_keys() {
        assert!(SplitterMethod::WholeTable.identifier_keys().is_empty());
        assert_eq!(
            SplitterMethod::YearAndMonth { column: "ts".into() }.identifier_keys(),
            vec!["ts"]
        );
        assert_eq!(
            SplitterMethod::Year { column: "pickup".into() }.identifier_keys(),
            vec!["pickup"]
        );
        assert_eq!(
            SplitterMethod::ModInteger {
                column: "id".into(),
                modulus: 4
            }
            .identifier_keys(),
            vec!["id"]
        );
    }

    #[test]
    fn test_distinct_query_column_value() {
        let s = SplitterMethod::ColumnValue { column: "region".into() };
        assert_eq!(
            s.distinct_query("SELECT * FROM t", SqlDialect::DataFusion).unwrap(),
            "SELECT DISTINCT \"region\" AS \"region\" FROM (SELECT * FROM t) AS split_src ORDER BY 1"
        );
    }

    #[test]
    fn test_distinct_query_date_parts() {
        let s = SplitterMethod::Year { column: "ts".into() };
        let q = s.distinct_query("SELECT * FROM t", SqlDialect::Postgres).unwrap();
        assert!(q.contains("CAST(date_part('year', CAST(\"ts\" AS TIMESTAMP)) AS BIGINT) AS \"ts\""));
        assert!(q.ends_with("ORDER BY 1"));

        let s = SplitterMethod::YearAndMonthAndDay { column: "ts".into() };
        let q = s.distinct_query("SELECT * FROM t", SqlDialect::Postgres).unwrap();
        assert!(q.contains("to_char(CAST(\"ts\" AS TIMESTAMP), 'YYYY-MM-DD') AS \"ts\""));
        let clause = s
            .predicate(&ids(&[("ts", IdentifierValue::from("2020-01-15"))]), SqlDialect::DataFusion)
            .unwrap()
            .unwrap();
        assert_eq!(clause, "to_char(CAST(\"ts\" AS TIMESTAMP), '%Y-%m-%d') = '2020-01-15'");
    }

    #[test]
    fn test_whole_table_has_no_predicate() {
        let s = SplitterMethod::WholeTable;
        assert_eq!(s.predicate(&BatchIdentifiers::new(), SqlDialect::DataFusion).unwrap(), None);
        assert!(s.distinct_query("q", SqlDialect::DataFusion).is_err());
        assert_eq!(
            s.apply("q", &BatchIdentifiers::new(), SqlDialect::DataFusion).unwrap(),
            "SELECT * FROM (q) AS split_src"
        );
    }

    #[test]
    fn test_predicate_values_and_null() {
        let s = SplitterMethod::MultiColumnValues {
            columns: vec!["a".into(), "b".into()],
        };
        let clause = s
            .predicate(
                &ids(&[("a", IdentifierValue::Int(1)), ("b", IdentifierValue::Null)]),
                SqlDialect::DataFusion,
            )
            .unwrap()
            .unwrap();
        assert_eq!(clause, "\"a\" = 1 AND \"b\" IS NULL");
    }

    #[test]
    fn test_predicate_missing_key() {
        let s = SplitterMethod::ColumnValue { column: "region".into() };
        let err = s
            .predicate(&BatchIdentifiers::new(), SqlDialect::DataFusion)
            .unwrap_err();
        assert!(matches!(err, BatchError::InvalidBatchSpec(_)));
    }

    #[test]
    fn test_divided_and_hashed_expressions() {
        let s = SplitterMethod::DividedInteger {
            column: "id".into(),
            divisor: 100,
        };
        let exprs = s.partition_expressions(SqlDialect::Postgres).unwrap();
        assert_eq!(
            exprs[0].1,
            "CAST(floor(CAST(\"id\" AS DOUBLE PRECISION) / 100) AS BIGINT)"
        );
        let s = SplitterMethod::HashedColumn {
            column: "id".into(),
            hash_digits: 2,
        };
        let exprs = s.partition_expressions(SqlDialect::DataFusion).unwrap();
        assert_eq!(exprs[0].1, "right(md5(CAST(\"id\" AS VARCHAR)), 2)");
    }

    #[test]
    fn test_converted_datetime_formats() {
        let s = SplitterMethod::ConvertedDatetime {
            column: "ts".into(),
            date_format: "%Y-%m".into(),
        };
        let df = s.partition_expressions(SqlDialect::DataFusion).unwrap();
        assert_eq!(df[0].1, "to_char(CAST(\"ts\" AS TIMESTAMP), '%Y-%m')");
        let pg = s.partition_expressions(SqlDialect::Postgres).unwrap();
        assert_eq!(pg[0].1, "to_char(CAST(\"ts\" AS TIMESTAMP), 'YYYY-MM')");
    }

    #[test]
    fn test_strftime_translation() {
        assert_eq!(strftime_to_postgres("%Y%m%d").unwrap(), "YYYYMMDD");
        assert_eq!(strftime_to_postgres("%H:%M:%S").unwrap(), "HH24:MI:SS");
        assert_eq!(strftime_to_postgres("week %j").unwrap(), "\"week \"DDD");
        assert!(strftime_to_postgres("%A").is_err());
        assert!(strftime_to_postgres("%").is_err());
    }

    #[test]
    fn test_validation() {
        assert!(SplitterMethod::DividedInteger {
            column: "id".into(),
            divisor: 0
        }
        .validate()
        .is_err());
        assert!(SplitterMethod::MultiColumnValues { columns: vec![] }
            .validate()
            .is_err());
        assert!(SplitterMethod::MultiColumnValues {
            columns: vec!["a".into(), "a".into()]
        }
        .validate()
        .is_err());
        assert!(SplitterMethod::ColumnValue { column: " ".into() }
            .validate()
            .is_err());
    }
}
