//! Partition naming patterns.
//!
//! A pattern such as `{data_asset_name}_{year}-{month}.csv` is a sequence of
//! literal runs and named placeholders. Matching a relative object path
//! against it yields the asset name (when the pattern names one) and the
//! partition identifiers. Placeholders never span a `/` and match greedily,
//! so `yellow_tripdata_2020-01.csv` yields asset `yellow_tripdata`.

use std::collections::BTreeMap;
use std::fmt;

use sluice_core::{BatchError, BatchIdentifiers, IdentifierValue, Result};

/// Placeholder naming the data asset.
pub const ASSET_PLACEHOLDER: &str = "data_asset_name";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPattern {
    source: String,
    segments: Vec<Segment>,
}

/// Result of matching one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternMatch {
    pub data_asset_name: Option<String>,
    pub batch_identifiers: BatchIdentifiers,
}

impl PartitionPattern {
    pub fn parse(pattern: &str) -> Result<Self> {
        let invalid =
            |reason: &str| BatchError::InvalidConfig(format!("pattern '{}': {}", pattern, reason));

        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = pattern.chars();
        while let Some(c) = chars.next() {
            match c {
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for c in chars.by_ref() {
                        if c == '}' {
                            closed = true;
                            break;
                        }
                        name.push(c);
                    }
                    if !closed {
                        return Err(invalid("unclosed placeholder"));
                    }
                    if !is_identifier(&name) {
                        return Err(invalid(&format!("invalid placeholder name '{}'", name)));
                    }
                    if literal.is_empty() && matches!(segments.last(), Some(Segment::Placeholder(_)))
                    {
                        return Err(invalid("adjacent placeholders need a separator"));
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Placeholder(name));
                }
                '}' => return Err(invalid("unmatched '}'")),
                other => literal.push(other),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        if segments.is_empty() {
            return Err(invalid("pattern is empty"));
        }
        Ok(Self {
            source: pattern.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Distinct placeholder names in order of first appearance.
    pub fn placeholders(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for segment in &self.segments {
            if let Segment::Placeholder(name) = segment {
                if !names.contains(&name.as_str()) {
                    names.push(name);
                }
            }
        }
        names
    }

    pub fn names_asset(&self) -> bool {
        self.placeholders().contains(&ASSET_PLACEHOLDER)
    }

    /// Identifier keys this pattern produces (placeholders minus the asset).
    pub fn identifier_keys(&self) -> Vec<String> {
        self.placeholders()
            .into_iter()
            .filter(|name| *name != ASSET_PLACEHOLDER)
            .map(String::from)
            .collect()
    }

    pub fn match_path(&self, path: &str) -> Option<PatternMatch> {
        let mut captures = Vec::new();
        if !match_segments(&self.segments, path, &mut captures) {
            return None;
        }
        let mut data_asset_name = None;
        let mut batch_identifiers = BTreeMap::new();
        for (name, value) in captures {
            if name == ASSET_PLACEHOLDER {
                data_asset_name = Some(value.to_string());
            } else {
                batch_identifiers.insert(name.to_string(), IdentifierValue::Str(value.to_string()));
            }
        }
        Some(PatternMatch {
            data_asset_name,
            batch_identifiers,
        })
    }

    /// The relative path `match_path` would have read `identifiers` from.
    ///
    /// Only placeholder keys are used. Fails when a placeholder has no value
    /// or when the rendered path does not match back to the same values.
    pub fn render(&self, asset: &str, identifiers: &BatchIdentifiers) -> Result<String> {
        let mut path = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(lit) => path.push_str(lit),
                Segment::Placeholder(name) if name == ASSET_PLACEHOLDER => path.push_str(asset),
                Segment::Placeholder(name) => match identifiers.get(name) {
                    Some(value) if !value.is_null() => path.push_str(&value.to_string()),
                    _ => {
                        return Err(BatchError::InvalidBatchSpec(format!(
                            "pattern '{}' needs a value for '{}'",
                            self.source, name
                        )))
                    }
                },
            }
        }

        let round_trips = self.match_path(&path).is_some_and(|m| {
            m.data_asset_name.as_deref().map_or(true, |a| a == asset)
                && m.batch_identifiers.iter().all(|(key, value)| {
                    identifiers
                        .get(key)
                        .is_some_and(|given| given.loosely_equals(value))
                })
        });
        if !round_trips {
            return Err(BatchError::InvalidBatchSpec(format!(
                "identifiers do not name a path of pattern '{}' (rendered '{}')",
                self.source, path
            )));
        }
        Ok(path)
    }
}

impl fmt::Display for PartitionPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn match_segments<'a>(
    segments: &'a [Segment],
    input: &'a str,
    captures: &mut Vec<(&'a str, &'a str)>,
) -> bool {
    let Some((first, rest)) = segments.split_first() else {
        return input.is_empty();
    };
    match first {
        Segment::Literal(lit) => input
            .strip_prefix(lit.as_str())
            .is_some_and(|remaining| match_segments(rest, remaining, captures)),
        Segment::Placeholder(name) => {
            let limit = input.find('/').unwrap_or(input.len());
            let previous = captures
                .iter()
                .find(|(n, _)| *n == name.as_str())
                .map(|(_, v)| *v);
            if let Some(previous) = previous {
                return input[..limit].starts_with(previous)
                    && !previous.is_empty()
                    && match_segments(rest, &input[previous.len()..], captures);
            }
            let ends: Vec<usize> = input[..limit]
                .char_indices()
                .map(|(i, c)| i + c.len_utf8())
                .collect();
            for end in ends.into_iter().rev() {
                captures.push((name.as_str(), &input[..end]));
                if match_segments(rest, &input[end..], captures) {
                    return true;
                }
                captures.pop();
            }
            false
        }
    }
}
