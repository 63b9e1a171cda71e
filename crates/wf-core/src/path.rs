//! Dotted-path lookup on untyped JSON value trees
//!
//! Paths use dot-separated keys with optional `[index]` array access,
//! e.g. `message.recipients[0].address`.

use serde_json::Value;

/// One parsed path segment: an object key plus zero or more array indexes
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Segment {
    pub key: String,
    pub indexes: Vec<usize>,
}

/// Parse a path into segments, or None if the syntax is malformed
pub(crate) fn parse_segments(path: &str) -> Option<Vec<Segment>> {
    let mut segments = Vec::new();

    for raw in path.split('.') {
        if raw.is_empty() {
            return None;
        }

        let (key, rest) = match raw.find('[') {
            Some(pos) => raw.split_at(pos),
            None => (raw, ""),
        };

        let mut indexes = Vec::new();
        let mut remainder = rest;
        while !remainder.is_empty() {
            let close = remainder.find(']')?;
            if !remainder.starts_with('[') {
                return None;
            }
            let idx: usize = remainder[1..close].parse().ok()?;
            indexes.push(idx);
            remainder = &remainder[close + 1..];
        }

        segments.push(Segment {
            key: key.to_string(),
            indexes,
        });
    }

    Some(segments)
}

/// Apply the index list of a segment to a value
pub(crate) fn apply_indexes<'a>(mut value: &'a Value, indexes: &[usize]) -> Option<&'a Value> {
    for idx in indexes {
        value = value.as_array()?.get(*idx)?;
    }
    Some(value)
}

/// Look up a nested value by dotted path with `[index]` array access
///
/// Returns None when any segment is missing or the path syntax is invalid.
pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let segments = parse_segments(path)?;
    let mut current = value;

    for segment in &segments {
        current = current.as_object()?.get(&segment.key)?;
        current = apply_indexes(current, &segment.indexes)?;
    }

    Some(current)
}
