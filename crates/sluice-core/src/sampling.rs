//! Row sampling policies.
//!
//! Every method renders a pure SQL transformation of a base selectable, so
//! the same policy runs unchanged on DataFusion, Ballista and Postgres.
//!
//! `random` sampling is deterministic: a row is kept when the first eight hex
//! digits of `md5(seed | row text)` fall below `floor(p * 16^8)`. The row
//! text is produced by the engine's own casts, so the selected rows are
//! reproducible across runs of one engine family but not across families.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::batch::IdentifierValue;
use crate::error::{BatchError, Result};
use crate::sql::{literal, quote_ident, quote_literal, subquery, SqlDialect};

const SAMPLE_ALIAS: &str = "sampled";
const NULL_TOKEN: &str = "<null>";
/// 16^8: the range of an eight hex digit prefix.
const HASH_SPACE: f64 = 4_294_967_296.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum SamplingMethod {
    /// First `n` rows ordered by `order_by`, or by every column when it is
    /// empty, so repeated fetches return the same rows.
    Limit {
        n: u64,
        #[serde(default)]
        order_by: Vec<String>,
    },
    /// Seeded hash sample keeping roughly a fraction `p` of rows.
    Random {
        p: f64,
        #[serde(default)]
        seed: u64,
    },
    Mod {
        #[serde(alias = "column_name")]
        column: String,
        #[serde(alias = "mod")]
        modulus: i64,
        value: i64,
    },
    AList {
        #[serde(alias = "column_name")]
        column: String,
        #[serde(alias = "value_list")]
        values: Vec<IdentifierValue>,
    },
    Md5 {
        #[serde(alias = "column_name")]
        column: String,
        hash_digits: u32,
        hash_value: String,
    },
}

impl SamplingMethod {
    /// Build from a method name plus keyword map, e.g. `"sample_using_random"`
    /// with `{"p": 0.1}`.
    pub fn from_name(name: &str, kwargs: Option<&Value>) -> Result<Self> {
        let method = name
            .trim_start_matches('_')
            .trim_start_matches("sample_using_");
        let sampling: SamplingMethod = serde_json::from_value(tagged(method, kwargs)?)
            .map_err(|e| {
                BatchError::InvalidBatchKwargs(format!(
                    "invalid sampling method '{}': {}",
                    name, e
                ))
            })?;
        sampling.validate()?;
        Ok(sampling)
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            SamplingMethod::Limit { order_by, .. } => {
                if order_by.iter().any(|c| c.trim().is_empty()) {
                    return Err(invalid("limit sampling has an empty order_by column"));
                }
            }
            SamplingMethod::Random { p, .. } => {
                if !p.is_finite() || *p < 0.0 || *p > 1.0 {
                    return Err(invalid(format!(
                        "random sampling fraction must be within [0, 1], got {}",
                        p
                    )));
                }
            }
            SamplingMethod::Mod {
                column,
                modulus,
                value,
            } => {
                require_column("mod", column)?;
                if *modulus <= 0 {
                    return Err(invalid(format!(
                        "mod sampling requires a positive modulus, got {}",
                        modulus
                    )));
                }
                if *value < 0 || value >= modulus {
                    return Err(invalid(format!(
                        "mod sampling value {} is outside [0, {})",
                        value, modulus
                    )));
                }
            }
            SamplingMethod::AList { column, .. } => require_column("a_list", column)?,
            SamplingMethod::Md5 {
                column,
                hash_digits,
                hash_value,
            } => {
                require_column("md5", column)?;
                if *hash_digits == 0 || *hash_digits > 32 {
                    return Err(invalid(format!(
                        "md5 sampling hash_digits must be within 1..=32, got {}",
                        hash_digits
                    )));
                }
                if hash_value.len() != *hash_digits as usize
                    || !hash_value.chars().all(|c| c.is_ascii_hexdigit())
                {
                    return Err(invalid(format!(
                        "md5 sampling hash_value '{}' is not {} hex digits",
                        hash_value, hash_digits
                    )));
                }
            }
        }
        Ok(())
    }

    /// Random sampling hashes whole rows, and an unordered limit sorts on
    /// them; both need the column list.
    pub fn needs_columns(&self) -> bool {
        match self {
            SamplingMethod::Random { .. } => true,
            SamplingMethod::Limit { order_by, .. } => order_by.is_empty(),
            _ => false,
        }
    }

    /// Row filter for the filtering methods; `None` for `limit` and for
    /// `random` with `p >= 1`.
    pub fn predicate(&self, columns: &[String], dialect: SqlDialect) -> Result<Option<String>> {
        self.validate()?;
        let clause = match self {
            SamplingMethod::Limit { .. } => return Ok(None),
            SamplingMethod::Random { p, seed } => {
                if *p >= 1.0 {
                    return Ok(None);
                }
                if *p <= 0.0 {
                    return Ok(Some("FALSE".to_string()));
                }
                if columns.is_empty() {
                    return Err(invalid(
                        "random sampling needs the column list of the sampled reference",
                    ));
                }
                random_predicate(*p, *seed, columns, dialect)
            }
            SamplingMethod::Mod {
                column,
                modulus,
                value,
            } => format!("{} % {} = {}", quote_ident(column), modulus, value),
            SamplingMethod::AList { column, values } => {
                if values.is_empty() {
                    "FALSE".to_string()
                } else {
                    let list = values.iter().map(literal).collect::<Vec<_>>().join(", ");
                    format!("{} IN ({})", quote_ident(column), list)
                }
            }
            SamplingMethod::Md5 {
                column,
                hash_digits,
                hash_value,
            } => format!(
                "right(md5(CAST({} AS {})), {}) = {}",
                quote_ident(column),
                dialect.text_type(),
                hash_digits,
                quote_literal(&hash_value.to_ascii_lowercase())
            ),
        };
        Ok(Some(clause))
    }

    /// Reduce `base` to the sampled rows.
    pub fn apply(&self, base: &str, columns: &[String], dialect: SqlDialect) -> Result<String> {
        if let SamplingMethod::Limit { n, order_by } = self {
            self.validate()?;
            let keys = if order_by.is_empty() { columns } else { order_by.as_slice() };
            if keys.is_empty() {
                return Err(invalid(
                    "limit sampling without order_by needs the column list of the sampled reference",
                ));
            }
            let keys = keys.iter().map(|c| quote_ident(c)).collect::<Vec<_>>();
            return Ok(format!(
                "{} ORDER BY {} LIMIT {}",
                subquery(base, SAMPLE_ALIAS),
                keys.join(", "),
                n
            ));
        }
        let sql = subquery(base, SAMPLE_ALIAS);
        Ok(match self.predicate(columns, dialect)? {
            Some(clause) => format!("{} WHERE {}", sql, clause),
            None => sql,
        })
    }
}

/// Eight lowercase hex digits below which a row hash is kept.
pub fn random_threshold(p: f64) -> String {
    let threshold = (p.clamp(0.0, 1.0) * HASH_SPACE).floor() as u64;
    format!("{:08x}", threshold.min(0xffff_ffff))
}

fn random_predicate(p: f64, seed: u64, columns: &[String], dialect: SqlDialect) -> String {
    let mut parts = vec![quote_literal(&seed.to_string())];
    parts.extend(columns.iter().map(|c| {
        format!(
            "coalesce(CAST({} AS {}), {})",
            quote_ident(c),
            dialect.text_type(),
            quote_literal(NULL_TOKEN)
        )
    }));
    let hash_prefix = format!("substr(md5(concat_ws('|', {})), 1, 8)", parts.join(", "));
    let collation = match dialect {
        SqlDialect::DataFusion => "",
        SqlDialect::Postgres => " COLLATE \"C\"",
    };
    format!(
        "{}{} < {}",
        hash_prefix,
        collation,
        quote_literal(&random_threshold(p))
    )
}

/// Merge a method name into its keyword map as the serde `method` tag.
pub(crate) fn tagged(method: &str, kwargs: Option<&Value>) -> Result<Value> {
    let mut map = match kwargs {
        None | Some(Value::Null) => serde_json::Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(other) => {
            return Err(BatchError::InvalidBatchKwargs(format!(
                "method kwargs for '{}' must be an object, got {}",
                method, other
            )))
        }
    };
    map.insert("method".to_string(), Value::String(method.to_string()));
    Ok(Value::Object(map))
}

fn require_column(method: &str, column: &str) -> Result<()> {
    if column.trim().is_empty() {
        return Err(invalid(format!("{} sampling requires a column", method)));
    }
    Ok(())
}

fn invalid(message: impl Into<String>) -> BatchError {
    BatchError::InvalidBatchSpec(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_deserialize_tagged_methods() {
        let m: SamplingMethod =
            serde_json::from_str(r#"{"method":"random","p":0.1,"seed":12345}"#).unwrap();
        assert_eq!(m, SamplingMethod::Random { p: 0.1, seed: 12345 });

        let m: SamplingMethod =
            serde_json::from_str(r#"{"method":"a_list","column":"k","values":[1,"x"]}"#).unwrap();
        assert_eq!(
            m,
            SamplingMethod::AList {
                column: "k".into(),
                values: vec![IdentifierValue::Int(1), IdentifierValue::Str("x".into())],
            }
        );

        let m: SamplingMethod = serde_json::from_str(r#"{"method":"limit","n":5}"#).unwrap();
        assert_eq!(m, SamplingMethod::Limit { n: 5, order_by: vec![] });
    }

    #[test]
    fn test_from_name_accepts_legacy_names() {
        let m = SamplingMethod::from_name(
            "_sample_using_mod",
            Some(&serde_json::json!({"column_name": "id", "mod": 5, "value": 2})),
        )
        .unwrap();
        assert_eq!(
            m,
            SamplingMethod::Mod {
                column: "id".into(),
                modulus: 5,
                value: 2
            }
        );
        let m = SamplingMethod::from_name("random", Some(&serde_json::json!({"p": 0.2}))).unwrap();
        assert_eq!(m, SamplingMethod::Random { p: 0.2, seed: 0 });
        assert!(matches!(
            SamplingMethod::from_name("sample_using_magic", None),
            Err(BatchError::InvalidBatchKwargs(_))
        ));
        assert!(SamplingMethod::from_name("limit", Some(&serde_json::json!([1]))).is_err());
    }

    #[test]
    fn test_random_threshold() {
        assert_eq!(random_threshold(0.1), "19999999");
        assert_eq!(random_threshold(0.5), "80000000");
        assert_eq!(random_threshold(0.0), "00000000");
        assert_eq!(random_threshold(1.0), "ffffffff");
    }

    #[test]
    fn test_limit_renders_order_and_limit() {
        let m = SamplingMethod::Limit {
            n: 10,
            order_by: vec!["id".into()],
        };
        assert_eq!(
            m.apply("SELECT * FROM t", &[], SqlDialect::DataFusion).unwrap(),
            "SELECT * FROM (SELECT * FROM t) AS sampled ORDER BY \"id\" LIMIT 10"
        );
        assert!(!m.needs_columns());
    }

    #[test]
    fn test_unordered_limit_sorts_on_every_column() {
        let m = SamplingMethod::Limit {
            n: 3,
            order_by: vec![],
        };
        assert!(m.needs_columns());
        assert_eq!(
            m.apply("SELECT * FROM t", &cols(&["b", "a"]), SqlDialect::Postgres).unwrap(),
            "SELECT * FROM (SELECT * FROM t) AS sampled ORDER BY \"b\", \"a\" LIMIT 3"
        );
        assert!(m.apply("SELECT * FROM t", &[], SqlDialect::DataFusion).is_err());
    }

    #[test]
    fn test_random_renders_per_dialect() {
        let m = SamplingMethod::Random { p: 0.5, seed: 7 };
        let df = m.apply("SELECT * FROM t", &cols(&["a", "b"]), SqlDialect::DataFusion).unwrap();
        assert_eq!(
            df,
            "SELECT * FROM (SELECT * FROM t) AS sampled WHERE substr(md5(concat_ws('|', '7', \
             coalesce(CAST(\"a\" AS VARCHAR), '<null>'), coalesce(CAST(\"b\" AS VARCHAR), '<null>'))), 1, 8) \
             < '80000000'"
        );
        let pg = m.apply("SELECT * FROM t", &cols(&["a"]), SqlDialect::Postgres).unwrap();
        assert!(pg.contains("CAST(\"a\" AS TEXT)"));
        assert!(pg.contains("COLLATE \"C\" < '80000000'"));
    }

    #[test]
    fn test_random_edges() {
        let all = SamplingMethod::Random { p: 1.0, seed: 1 };
        assert_eq!(
            all.apply("q", &[], SqlDialect::DataFusion).unwrap(),
            "SELECT * FROM (q) AS sampled"
        );
        let none = SamplingMethod::Random { p: 0.0, seed: 1 };
        assert!(none
            .apply("q", &[], SqlDialect::DataFusion)
            .unwrap()
            .ends_with("WHERE FALSE"));
        let needs = SamplingMethod::Random { p: 0.3, seed: 1 };
        assert!(needs.needs_columns());
        assert!(needs.apply("q", &[], SqlDialect::DataFusion).is_err());
    }

    #[test]
    fn test_filtering_methods() {
        let m = SamplingMethod::Mod {
            column: "id".into(),
            modulus: 10,
            value: 3,
        };
        assert_eq!(
            m.predicate(&[], SqlDialect::Postgres).unwrap().unwrap(),
            "\"id\" % 10 = 3"
        );

        let m = SamplingMethod::AList {
            column: "region".into(),
            values: vec!["eu".into(), "us".into()],
        };
        assert_eq!(
            m.predicate(&[], SqlDialect::DataFusion).unwrap().unwrap(),
            "\"region\" IN ('eu', 'us')"
        );

        let m = SamplingMethod::AList {
            column: "region".into(),
            values: vec![],
        };
        assert_eq!(m.predicate(&[], SqlDialect::DataFusion).unwrap().unwrap(), "FALSE");

        let m = SamplingMethod::Md5 {
            column: "id".into(),
            hash_digits: 1,
            hash_value: "F".into(),
        };
        assert_eq!(
            m.predicate(&[], SqlDialect::DataFusion).unwrap().unwrap(),
            "right(md5(CAST(\"id\" AS VARCHAR)), 1) = 'f'"
        );
    }

    #[test]
    fn test_validation() {
        assert!(SamplingMethod::Random { p: 1.5, seed: 0 }.validate().is_err());
        assert!(SamplingMethod::Random { p: f64::NAN, seed: 0 }.validate().is_err());
        assert!(SamplingMethod::Mod {
            column: "id".into(),
            modulus: 0,
            value: 0
        }
        .validate()
        .is_err());
        assert!(SamplingMethod::Mod {
            column: "id".into(),
            modulus: 3,
            value: 3
        }
        .validate()
        .is_err());
        assert!(SamplingMethod::Md5 {
            column: "id".into(),
            hash_digits: 2,
            hash_value: "a".into()
        }
        .validate()
        .is_err());
        assert!(SamplingMethod::Md5 {
            column: "id".into(),
            hash_digits: 2,
            hash_value: "zz".into()
        }
        .validate()
        .is_err());
    }
}
