use crate::Value;

/// Extracts an instance id from method call arguments.
///
/// A path is a dot-separated list of segments walked from the argument root. Object keys select
/// properties; numeric segments, or a `[n]` suffix, index arrays. String and number leaves are
/// accepted as ids; anything else yields `None`.
#[derive(Debug, Clone, Copy, Default)]
pub struct InstanceIdParser;

impl InstanceIdParser {
    pub fn parse(&self, path: &str, args: &Value) -> Option<String> {
        let path = path.trim();
        if path.is_empty() {
            return None;
        }
        let mut current = args;
        for segment in path.split('.') {
            let (key, indexes) = split_indexes(segment)?;
            if !key.is_empty() {
                current = match current {
                    Value::Object(map) => map.get(key)?,
                    Value::Array(items) => items.get(key.parse::<usize>().ok()?)?,
                    _ => return None,
                };
            }
            for idx in indexes {
                current = current.as_array()?.get(idx)?;
            }
        }
        match current {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// `items[1][0]` -> ("items", [1, 0])
fn split_indexes(segment: &str) -> Option<(&str, Vec<usize>)> {
    let (key, mut rest) = match segment.find('[') {
        Some(pos) => (&segment[..pos], &segment[pos..]),
        None => return Some((segment, Vec::new())),
    };
    let mut indexes = Vec::new();
    while !rest.is_empty() {
        let close = rest.find(']')?;
        if !rest.starts_with('[') {
            return None;
        }
        indexes.push(rest[1..close].trim().parse().ok()?);
        rest = &rest[close + 1..];
    }
    Some((key, indexes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn walks_objects_and_arrays() {
        let p = InstanceIdParser;
        let args = json!({ "order": { "id": "o-1", "lines": [{ "sku": 7 }] }, "ids": ["a", "b"] });
        assert_eq!(p.parse("order.id", &args).as_deref(), Some("o-1"));
        assert_eq!(p.parse("order.lines[0].sku", &args).as_deref(), Some("7"));
        assert_eq!(p.parse("ids.1", &args).as_deref(), Some("b"));
        assert_eq!(p.parse("ids[0]", &args).as_deref(), Some("a"));
        assert_eq!(p.parse("[0]", &json!(["first"])).as_deref(), Some("first"));
    }

    #[test]
    fn missing_or_non_scalar_leaves_yield_none() {
        let p = InstanceIdParser;
        let args = json!({ "order": { "id": null, "tags": [] } });
        assert_eq!(p.parse("order.id", &args), None);
        assert_eq!(p.parse("order.tags", &args), None);
        assert_eq!(p.parse("order.missing", &args), None);
        assert_eq!(p.parse("order.tags[3]", &args), None);
        assert_eq!(p.parse("order[x]", &args), None);
        assert_eq!(p.parse("", &args), None);
    }
}
