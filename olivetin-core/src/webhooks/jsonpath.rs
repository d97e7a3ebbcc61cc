//! A small JSONPath subset for webhook matching and extraction
//!
//! Supported: `$`, `.name`, `['name']` / `["name"]`, `[index]` (negative
//! indexes count from the end). That covers the paths used by GitHub-style
//! payloads.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JsonPathError {
    #[error("JSONPath must start with '$': {0}")]
    MissingRoot(String),

    #[error("Invalid JSONPath syntax at position {position} in {path}")]
    Syntax { path: String, position: usize },

    #[error("Unknown key {0}")]
    UnknownKey(String),

    #[error("Index out of range: {0}")]
    IndexOutOfRange(i64),

    #[error("Cannot index into a scalar with {0}")]
    NotAContainer(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(i64),
}

fn parse(path: &str) -> Result<Vec<Segment>, JsonPathError> {
    let path = path.trim();
    let Some(rest) = path.strip_prefix('$') else {
        return Err(JsonPathError::MissingRoot(path.to_string()));
    };

    let syntax = |position: usize| JsonPathError::Syntax {
        path: path.to_string(),
        position,
    };

    let chars: Vec<char> = rest.chars().collect();
    let mut segments = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '.' => {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && chars[end] != '.' && chars[end] != '[' {
                    end += 1;
                }
                if end == start {
                    return Err(syntax(i + 1));
                }
                segments.push(Segment::Key(chars[start..end].iter().collect()));
                i = end;
            }
            '[' => {
                let close = chars[i..]
                    .iter()
                    .position(|c| *c == ']')
                    .map(|p| p + i)
                    .ok_or_else(|| syntax(i + 1))?;
                let inner: String = chars[i + 1..close].iter().collect();
                let inner = inner.trim();

                let quoted = inner.len() >= 2
                    && ((inner.starts_with('\'') && inner.ends_with('\''))
                        || (inner.starts_with('"') && inner.ends_with('"')));

                if quoted {
                    segments.push(Segment::Key(inner[1..inner.len() - 1].to_string()));
                } else {
                    let index: i64 = inner.parse().map_err(|_| syntax(i + 2))?;
                    segments.push(Segment::Index(index));
                }
                i = close + 1;
            }
            _ => return Err(syntax(i + 1)),
        }
    }

    Ok(segments)
}

/// Resolves `path` against `root`.
pub fn select<'a>(root: &'a Value, path: &str) -> Result<&'a Value, JsonPathError> {
    let mut current = root;

    for segment in parse(path)? {
        current = match (&segment, current) {
            (Segment::Key(key), Value::Object(map)) => {
                map.get(key).ok_or_else(|| JsonPathError::UnknownKey(key.clone()))?
            }
            (Segment::Index(index), Value::Array(items)) => {
                let resolved = if *index < 0 { items.len() as i64 + index } else { *index };
                usize::try_from(resolved)
                    .ok()
                    .and_then(|i| items.get(i))
                    .ok_or(JsonPathError::IndexOutOfRange(*index))?
            }
            (Segment::Key(key), _) => return Err(JsonPathError::NotAContainer(key.clone())),
            (Segment::Index(index), _) => return Err(JsonPathError::NotAContainer(index.to_string())),
        };
    }

    Ok(current)
}

/// Strings as-is, everything else as compact JSON.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
