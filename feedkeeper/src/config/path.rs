//! Dotted configuration paths and JSON tree helpers.

use std::fmt;
use std::str::FromStr;

use serde_json::{Map, Value};

use crate::{Error, Result};

/// A validated dotted path into the configuration tree, e.g.
/// `apis.coingecko.apiKey`. The empty path addresses the root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ConfigPath {
    segments: Vec<String>,
}

impl ConfigPath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn parse(path: &str) -> Result<Self> {
        let trimmed = path.trim();
        if trimmed.is_empty() {
            return Ok(Self::root());
        }
        let segments: Vec<String> = trimmed.split('.').map(str::to_string).collect();
        if let Some(bad) = segments
            .iter()
            .find(|s| s.is_empty() || !s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'))
        {
            return Err(Error::validation(format!(
                "invalid configuration path {path:?}: bad segment {bad:?}"
            )));
        }
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn child(&self, segment: &str) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.to_string());
        Self { segments }
    }

    /// True when `self` equals `other` or is one of its ancestors.
    pub fn is_prefix_of(&self, other: &ConfigPath) -> bool {
        other.segments.len() >= self.segments.len()
            && self.segments.iter().zip(&other.segments).all(|(a, b)| a == b)
    }

    /// Resolve this path in a JSON tree.
    pub fn lookup<'a>(&self, tree: &'a Value) -> Option<&'a Value> {
        self.segments
            .iter()
            .try_fold(tree, |node, segment| node.as_object()?.get(segment))
    }

    /// Write `value` at this path, creating intermediate objects. Fails when
    /// a non-object sits in the way.
    pub fn assign(&self, tree: &mut Value, value: Value) -> Result<()> {
        let Some((last, parents)) = self.segments.split_last() else {
            *tree = value;
            return Ok(());
        };

        let mut node = tree;
        for segment in parents {
            let map = node.as_object_mut().ok_or_else(|| self.not_an_object(segment))?;
            node = map
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        let map = node.as_object_mut().ok_or_else(|| self.not_an_object(last))?;
        map.insert(last.clone(), value);
        Ok(())
    }

    fn not_an_object(&self, segment: &str) -> Error {
        Error::validation(format!(
            "cannot assign {self}: parent of {segment:?} is not an object"
        ))
    }
}

impl fmt::Display for ConfigPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}

impl FromStr for ConfigPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<&str> for ConfigPath {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Recursively merge `overlay` into `base`. Objects merge key by key; any
/// other value in `overlay` replaces the one in `base`.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// A leaf that differs between two trees.
#[derive(Debug, Clone, PartialEq)]
pub struct LeafChange {
    pub path: ConfigPath,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

/// Collect every leaf that differs between `old` and `new`. Arrays and
/// scalars are leaves; objects are descended into.
pub fn diff_leaves(old: &Value, new: &Value) -> Vec<LeafChange> {
    let mut changes = Vec::new();
    diff_into(&ConfigPath::root(), Some(old), Some(new), &mut changes);
    changes
}

fn diff_into(path: &ConfigPath, old: Option<&Value>, new: Option<&Value>, out: &mut Vec<LeafChange>) {
    match (old, new) {
        (Some(Value::Object(a)), Some(Value::Object(b))) => {
            let mut keys: Vec<&String> = a.keys().chain(b.keys()).collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                diff_into(&path.child(key), a.get(key), b.get(key), out);
            }
        }
        (Some(Value::Object(a)), None) => {
            for (key, value) in a {
                diff_into(&path.child(key), Some(value), None, out);
            }
        }
        (None, Some(Value::Object(b))) => {
            for (key, value) in b {
                diff_into(&path.child(key), None, Some(value), out);
            }
        }
        (a, b) if a == b => {}
        (a, b) => out.push(LeafChange {
            path: path.clone(),
            old_value: a.cloned(),
            new_value: b.cloned(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_and_display() {
        let path = ConfigPath::parse("apis.coingecko.apiKey").unwrap();
        assert_eq!(path.segments().len(), 3);
        assert_eq!(path.to_string(), "apis.coingecko.apiKey");
        assert!(ConfigPath::parse("").unwrap().is_root());
        assert!(ConfigPath::parse("apis..key").is_err());
        assert!(ConfigPath::parse("apis.co gecko").is_err());
    }

    #[test]
    fn test_prefix() {
        let apis = ConfigPath::parse("apis").unwrap();
        let key = ConfigPath::parse("apis.coingecko.apiKey").unwrap();
        let other = ConfigPath::parse("apisx").unwrap();
        assert!(apis.is_prefix_of(&key));
        assert!(key.is_prefix_of(&key));
        assert!(!key.is_prefix_of(&apis));
        assert!(!other.is_prefix_of(&key));
        assert!(ConfigPath::root().is_prefix_of(&key));
    }

    #[test]
    fn test_lookup_and_assign() {
        let mut tree = json!({"a": {"b": 1}});
        let path = ConfigPath::parse("a.c.d").unwrap();
        path.assign(&mut tree, json!("x")).unwrap();
        assert_eq!(path.lookup(&tree), Some(&json!("x")));
        assert_eq!(ConfigPath::parse("a.b").unwrap().lookup(&tree), Some(&json!(1)));
        assert!(ConfigPath::parse("a.b.z").unwrap().lookup(&tree).is_none());
        assert!(ConfigPath::parse("a.b.z").unwrap().assign(&mut tree, json!(2)).is_err());
    }

    #[test]
    fn test_deep_merge_overlay_wins() {
        let mut base = json!({"a": {"x": 1, "y": 2}, "b": [1, 2]});
        deep_merge(&mut base, json!({"a": {"y": 3, "z": 4}, "b": [9]}));
        assert_eq!(base, json!({"a": {"x": 1, "y": 3, "z": 4}, "b": [9]}));
    }

    #[test]
    fn test_diff_leaves() {
        let old = json!({"a": {"x": 1, "y": 2}, "list": [1]});
        let new = json!({"a": {"x": 1, "y": 5, "z": true}, "list": [1]});
        let changes = diff_leaves(&old, &new);
        let paths: Vec<String> = changes.iter().map(|c| c.path.to_string()).collect();
        assert_eq!(paths, vec!["a.y", "a.z"]);
        assert_eq!(changes[0].old_value, Some(json!(2)));
        assert_eq!(changes[1].old_value, None);
    }
}
