//! Values handling with deep merge support

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

use crate::error::{CoreError, Result};

/// Largest list index accepted in a `--set` path
const MAX_INDEX: usize = 65536;

/// Values container with deep merge capability
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Values(pub JsonValue);

impl Values {
    /// Create empty values
    pub fn new() -> Self {
        Self(JsonValue::Object(serde_json::Map::new()))
    }

    /// Parse values from a YAML document
    ///
    /// An empty document yields empty values; any other non-mapping document
    /// is rejected.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let value: JsonValue = serde_yaml::from_str(yaml)?;
        match value {
            JsonValue::Null => Ok(Self::new()),
            JsonValue::Object(_) => Ok(Self(value)),
            _ => Err(CoreError::InvalidValue {
                expression: yaml.chars().take(40).collect(),
                reason: "values document must be a mapping".to_string(),
            }),
        }
    }

    /// Build values from an inline document and flat `--set` overrides
    ///
    /// The overrides are applied on top of the document.
    pub fn from_inputs(
        value_yaml: Option<&str>,
        overrides: Option<&BTreeMap<String, String>>,
    ) -> Result<Self> {
        let mut base = match value_yaml {
            Some(doc) => Self::from_yaml(doc)?,
            None => Self::new(),
        };

        if let Some(overrides) = overrides {
            let mut sets = Self::new();
            for (key, value) in overrides {
                parse_set_value(&format!("{}={}", key, value), &mut sets)?;
            }
            base.merge(&sets);
        }

        Ok(base)
    }

    /// Overlay `overlay` onto these values
    ///
    /// Maps merge key by key. Lists and scalars from the overlay win.
    pub fn merge(&mut self, overlay: &Values) {
        deep_merge(&mut self.0, &overlay.0);
    }

    /// Get the inner JSON value
    pub fn inner(&self) -> &JsonValue {
        &self.0
    }

    /// Check if values are empty
    pub fn is_empty(&self) -> bool {
        match &self.0 {
            JsonValue::Object(map) => map.is_empty(),
            JsonValue::Null => true,
            _ => false,
        }
    }
}

/// Deep merge two JSON values
fn deep_merge(base: &mut JsonValue, overlay: &JsonValue) {
    match (base, overlay) {
        (JsonValue::Object(base_map), JsonValue::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => {
                        base_map.insert(key.clone(), overlay_value.clone());
                    }
                }
            }
        }
        (base, overlay) => {
            *base = overlay.clone();
        }
    }
}


/// Parse a Helm `--set` expression into `values`
///
/// Supports comma-separated assignments, dotted keys, `name[0]` list
/// indexes, `{a,b}` lists and `\,` / `\.` escapes. Scalars are typed the
/// way Helm types them: booleans, `null` and integers without a leading
/// zero; everything else stays a string.
pub fn parse_set_value(expression: &str, values: &mut Values) -> Result<()> {
    for assignment in split_top_level(expression) {
        if assignment.is_empty() {
            continue;
        }

        let (key, raw) = split_key(&assignment).ok_or_else(|| CoreError::InvalidValue {
            expression: expression.to_string(),
            reason: format!("key \"{}\" has no value", unescape(&assignment)),
        })?;

        let path = parse_path(key).map_err(|reason| CoreError::InvalidValue {
            expression: expression.to_string(),
            reason,
        })?;

        let value = if raw.len() >= 2 && raw.starts_with('{') && raw.ends_with('}') {
            JsonValue::Array(
                split_top_level(&raw[1..raw.len() - 1])
                    .iter()
                    .map(|item| typed_value(&unescape(item)))
                    .collect(),
            )
        } else {
            typed_value(&unescape(raw))
        };

        set_path(&mut values.0, &path, value);
    }

    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
}

/// Split on commas that are neither escaped nor inside `{...}`
fn split_top_level(input: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '{' => {
                depth += 1;
                current.push(c);
            }
            '}' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ',' if depth == 0 => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);
    parts
}

/// Split `key=value` on the first unescaped `=`
fn split_key(assignment: &str) -> Option<(&str, &str)> {
    let mut escaped = false;
    for (i, c) in assignment.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '=' => return Some((&assignment[..i], &assignment[i + 1..])),
            _ => {}
        }
    }
    None
}

fn parse_path(key: &str) -> std::result::Result<Vec<Segment>, String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = key.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '.' => {
                if !current.is_empty() {
                    segments.push(Segment::Key(std::mem::take(&mut current)));
                }
            }
            '[' => {
                if !current.is_empty() {
                    segments.push(Segment::Key(std::mem::take(&mut current)));
                }
                let mut digits = String::new();
                for d in chars.by_ref() {
                    if d == ']' {
                        break;
                    }
                    digits.push(d);
                }
                let index: usize = digits
                    .parse()
                    .map_err(|_| format!("invalid list index \"{}\"", digits))?;
                if index > MAX_INDEX {
                    return Err(format!("list index {} exceeds {}", index, MAX_INDEX));
                }
                segments.push(Segment::Index(index));
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        segments.push(Segment::Key(current));
    }

    if segments.is_empty() {
        return Err("empty key".to_string());
    }
    Ok(segments)
}

fn set_path(target: &mut JsonValue, path: &[Segment], value: JsonValue) {
    let Some((head, rest)) = path.split_first() else {
        *target = value;
        return;
    };

    match head {
        Segment::Key(key) => {
            if !target.is_object() {
                *target = JsonValue::Object(serde_json::Map::new());
            }
            if let JsonValue::Object(map) = target {
                let slot = map.entry(key.clone()).or_insert(JsonValue::Null);
                set_path(slot, rest, value);
            }
        }
        Segment::Index(index) => {
            if !target.is_array() {
                *target = JsonValue::Array(Vec::new());
            }
            if let JsonValue::Array(list) = target {
                if list.len() <= *index {
                    list.resize(index + 1, JsonValue::Null);
                }
                set_path(&mut list[*index], rest, value);
            }
        }
    }
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn typed_value(raw: &str) -> JsonValue {
    if raw.eq_ignore_ascii_case("true") {
        return JsonValue::Bool(true);
    }
    if raw.eq_ignore_ascii_case("false") {
        return JsonValue::Bool(false);
    }
    if raw.eq_ignore_ascii_case("null") {
        return JsonValue::Null;
    }
    if raw == "0" {
        return JsonValue::Number(0.into());
    }
    if !raw.starts_with('0') {
        if let Ok(num) = raw.parse::<i64>() {
            return JsonValue::Number(num.into());
        }
    }
    JsonValue::String(raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(expr: &str) -> Values {
        let mut values = Values::new();
        parse_set_value(expr, &mut values).unwrap();
        values
    }

    #[test]
    fn test_deep_merge() {
        let mut base = Values::from_yaml(
            r#"
image:
  repository: nginx
  tag: "1.0"
replicas: 1
"#,
        )
        .unwrap();

        let overlay = Values::from_yaml(
            r#"
image:
  tag: "2.0"
  pullPolicy: Always
replicas: 3
"#,
        )
        .unwrap();

        base.merge(&overlay);

        assert_eq!(base.inner().pointer("/image/repository").unwrap(), "nginx");
        assert_eq!(base.inner().pointer("/image/tag").unwrap(), "2.0");
        assert_eq!(base.inner().pointer("/image/pullPolicy").unwrap(), "Always");
        assert_eq!(base.inner().pointer("/replicas").unwrap(), 3);
    }

    #[test]
    fn test_merge_replaces_lists() {
        let mut base = Values(json!({"hosts": ["a", "b"]}));
        base.merge(&Values(json!({"hosts": ["c"]})));
        assert_eq!(base.0, json!({"hosts": ["c"]}));
    }

    #[test]
    fn test_set_typing() {
        let values = parse("replicas=5,debug=true,tag=007,zero=0,none=null,ratio=1.5");
        assert_eq!(
            values.0,
            json!({
                "replicas": 5,
                "debug": true,
                "tag": "007",
                "zero": 0,
                "none": null,
                "ratio": "1.5"
            })
        );
    }

    #[test]
    fn test_set_nested_and_lists() {
        let values = parse("image.tag=v2,servers[1].port=80,hosts={a,b}");
        assert_eq!(
            values.0,
            json!({
                "image": {"tag": "v2"},
                "servers": [null, {"port": 80}],
                "hosts": ["a", "b"]
            })
        );
    }

    #[test]
    fn test_set_escapes() {
        let values = parse(r"annotations.kubernetes\.io/role=a\,b");
        assert_eq!(values.0, json!({"annotations": {"kubernetes.io/role": "a,b"}}));
    }

    #[test]
    fn test_set_without_value() {
        let mut values = Values::new();
        let err = parse_set_value("a=1,b", &mut values).unwrap_err();
        assert!(err.to_string().contains("has no value"));
    }

    #[test]
    fn test_from_inputs_overrides_document() {
        let mut overrides = BTreeMap::new();
        overrides.insert("image.tag".to_string(), "v3".to_string());

        let values = Values::from_inputs(
            Some("image:\n  repository: nginx\n  tag: v1\n"),
            Some(&overrides),
        )
        .unwrap();

        assert_eq!(values.inner().pointer("/image/repository").unwrap(), "nginx");
        assert_eq!(values.inner().pointer("/image/tag").unwrap(), "v3");
    }

    #[test]
    fn test_from_yaml_rejects_scalars() {
        assert!(Values::from_yaml("just a string").is_err());
        assert!(Values::from_yaml("").unwrap().is_empty());
    }
}
