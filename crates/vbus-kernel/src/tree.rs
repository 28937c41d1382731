//! In-memory object tree.
//!
//! Content is plain JSON. A node is an object carrying a `schema` marker
//! (`{"schema":{"type":"object"}}`); an attribute is a scalar leaf whose
//! parent declares `schema.properties.<key>.type`; a method is a node with a
//! `return` placeholder. Object keys are kept sorted, so serialization is
//! deterministic.

use serde_json::{Map, Value};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use vbus_types::path;
use vbus_types::{AttributeType, AttributeValue, VbusError, VbusResult};

const SCHEMA: &str = "schema";
const PROPERTIES: &str = "properties";
const TYPE: &str = "type";
const RETURN: &str = "return";
const OBJECT: &str = "object";

/// What a path resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Node,
    Attribute(AttributeType),
    Method,
    /// A leaf without a declared type.
    Value,
}

/// A JSON object tree with path-based access.
#[derive(Debug, Clone, PartialEq)]
pub struct Tree {
    content: Value,
}

impl Default for Tree {
    fn default() -> Self {
        Self::empty()
    }
}

impl Tree {
    /// `{}`: the placeholder for content not known yet.
    pub fn empty() -> Self {
        Self {
            content: Value::Object(Map::new()),
        }
    }

    /// A fresh node: `{"schema":{"type":"object"}}`.
    pub fn node() -> Self {
        Self {
            content: node_marker(),
        }
    }

    /// Wrap a JSON object.
    pub fn from_value(content: Value) -> VbusResult<Self> {
        if !content.is_object() {
            return Err(VbusError::NotANode(format!(
                "expected a JSON object, got {content}"
            )));
        }
        Ok(Self { content })
    }

    /// Parse a JSON object payload.
    pub fn parse(payload: &[u8]) -> VbusResult<Self> {
        let value: Value =
            serde_json::from_slice(payload).map_err(|e| VbusError::InvalidJson(e.to_string()))?;
        Self::from_value(value)
    }

    pub fn content(&self) -> &Value {
        &self.content
    }

    pub fn into_value(self) -> Value {
        self.content
    }

    /// True for the root and for any path present in the content.
    pub fn exists(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// The value at `path`. The empty path is the whole content.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut current = &self.content;
        for segment in path::segments(path) {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    fn get_mut_or_create(&mut self, path: &str) -> &mut Value {
        let mut current = &mut self.content;
        for segment in path::segments(path) {
            if !current.is_object() {
                *current = Value::Object(Map::new());
            }
            current = match current {
                Value::Object(map) => map
                    .entry(segment.to_string())
                    .or_insert_with(|| Value::Object(Map::new())),
                other => other,
            };
        }
        current
    }

    /// True when `path` resolves to an object.
    pub fn is_node(&self, path: &str) -> bool {
        self.get(path).is_some_and(Value::is_object)
    }

    /// Classify what `path` resolves to.
    pub fn kind(&self, path: &str) -> Option<ElementKind> {
        let value = self.get(path)?;
        if value.is_object() {
            if is_method(value) {
                return Some(ElementKind::Method);
            }
            return Some(ElementKind::Node);
        }
        Some(match self.attribute_type(path) {
            Some(ty) => ElementKind::Attribute(ty),
            None => ElementKind::Value,
        })
    }

    /// A copy of the subtree at `path`, or an empty placeholder.
    pub fn subtree(&self, path: &str) -> Tree {
        match self.get(path) {
            Some(value @ Value::Object(_)) => Tree {
                content: value.clone(),
            },
            _ => Tree::empty(),
        }
    }

    /// Declared type of the attribute at `path`.
    pub fn attribute_type(&self, path: &str) -> Option<AttributeType> {
        let (parent, key) = path::split_last(path);
        if key.is_empty() {
            return None;
        }
        self.get(parent)?
            .get(SCHEMA)?
            .get(PROPERTIES)?
            .get(key)?
            .get(TYPE)?
            .as_str()?
            .parse()
            .ok()
    }

    /// The typed value of the attribute at `path`.
    pub fn attribute(&self, path: &str) -> VbusResult<AttributeValue> {
        let ty = self
            .attribute_type(path)
            .ok_or_else(|| VbusError::NotAnAttribute(path.to_string()))?;
        self.get(path)
            .and_then(|v| AttributeValue::from_json_typed(ty, v))
            .ok_or_else(|| VbusError::NotAnAttribute(path.to_string()))
    }

    /// Deep-merge `incoming` into the content.
    pub fn merge(&mut self, incoming: &Value) {
        merge_values(&mut self.content, incoming);
    }

    /// Deep-merge `incoming` into the subtree at `path`.
    pub fn merge_at(&mut self, path: &str, incoming: &Value) {
        merge_values(self.get_mut_or_create(path), incoming);
    }

    /// Replace the value at `path`, creating missing parents.
    pub fn set(&mut self, path: &str, value: Value) {
        *self.get_mut_or_create(path) = value;
    }

    /// Compact JSON rendering.
    pub fn serialize(&self) -> String {
        self.content.to_string()
    }

    pub fn to_pretty(&self) -> String {
        serde_json::to_string_pretty(&self.content).unwrap_or_else(|_| self.serialize())
    }

    /// Direct children of the root, classified.
    pub fn elements(&self) -> Vec<(String, ElementKind)> {
        let Some(map) = self.content.as_object() else {
            return Vec::new();
        };
        map.keys()
            .filter(|k| k.as_str() != SCHEMA)
            .filter_map(|k| self.kind(k).map(|kind| (k.clone(), kind)))
            .collect()
    }

    /// Indented listing: `name:` for nodes, `name = value` for attributes,
    /// bare `name` for methods.
    pub fn outline(&self) -> String {
        let mut out = String::new();
        outline_into(self, 0, &mut out);
        out
    }

    /// Dot-style `(key, leaf)` pairs.
    pub fn flatten(&self) -> Vec<(String, Value)> {
        let mut out = Vec::new();
        flatten_into("", &self.content, &mut out);
        out
    }

    /// Content without schema markers and methods.
    pub fn plain(&self) -> Value {
        strip_schema(&self.content)
    }
}

fn node_marker() -> Value {
    let mut schema = Map::new();
    schema.insert(TYPE.to_string(), Value::String(OBJECT.to_string()));
    let mut root = Map::new();
    root.insert(SCHEMA.to_string(), Value::Object(schema));
    Value::Object(root)
}

fn is_method(value: &Value) -> bool {
    value.get(RETURN).is_some()
        && value
            .get(SCHEMA)
            .and_then(|s| s.get(PROPERTIES))
            .and_then(|p| p.get(RETURN))
            .is_some()
}

fn outline_into(tree: &Tree, level: usize, out: &mut String) {
    let indent = " ".repeat(level * 2);
    for (name, kind) in tree.elements() {
        match kind {
            ElementKind::Node => {
                out.push_str(&format!("{indent}{name}:\n"));
                outline_into(&tree.subtree(&name), level + 1, out);
            }
            ElementKind::Attribute(_) | ElementKind::Value => {
                let value = tree.get(&name).map(render_leaf).unwrap_or_default();
                out.push_str(&format!("{indent}{name} = {value}\n"));
            }
            ElementKind::Method => out.push_str(&format!("{indent}{name}\n")),
        }
    }
}

fn render_leaf(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn flatten_into(prefix: &str, value: &Value, out: &mut Vec<(String, Value)>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (k, v) in map {
                flatten_into(&path::join(prefix, k), v, out);
            }
        }
        Value::Array(items) if !items.is_empty() => {
            for (i, v) in items.iter().enumerate() {
                flatten_into(&path::join(prefix, &i.to_string()), v, out);
            }
        }
        leaf => out.push((prefix.to_string(), leaf.clone())),
    }
}

fn strip_schema(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, v)| k.as_str() != SCHEMA && !is_method(v))
                .map(|(k, v)| (k.clone(), strip_schema(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Deep merge: objects merge key by key, everything else overwrites.
pub fn merge_values(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

/// Wrap `content` under the segments of `path`.
pub fn nest(path: &str, content: Value) -> Value {
    let segments: Vec<&str> = path::segments(path).collect();
    segments.into_iter().rev().fold(content, |inner, segment| {
        let mut map = Map::new();
        map.insert(segment.to_string(), inner);
        Value::Object(map)
    })
}

/// Patch declaring a node at `path` with the given content.
pub fn node_patch(path: &str, content: Value) -> Value {
    let mut node = node_marker();
    merge_values(&mut node, &content);
    nest(path, node)
}

/// Patch declaring a typed attribute at `path`.
pub fn attribute_patch(path: &str, value: &AttributeValue) -> Value {
    let (parent, key) = path::split_last(path);
    let mut patch = Tree::empty();
    patch.set(path, value.to_json());
    patch.set(
        &path::join(parent, &format!("{SCHEMA}.{PROPERTIES}.{key}.{TYPE}")),
        Value::String(value.attr_type().as_str().to_string()),
    );
    patch.into_value()
}

/// Patch declaring a method at `path`.
pub fn method_patch(path: &str) -> Value {
    let mut method = Tree::node();
    method.set(RETURN, Value::Null);
    method.set(
        &format!("{SCHEMA}.{PROPERTIES}.{RETURN}.{TYPE}"),
        Value::String(OBJECT.to_string()),
    );
    nest(path, method.into_value())
}

/// Turn a plain JSON object into a node definition: nested objects become
/// nodes, scalars become typed attributes.
pub fn annotate(value: &Value) -> VbusResult<Value> {
    let Value::Object(map) = value else {
        return Err(VbusError::NotANode(format!("not a JSON object: {value}")));
    };
    let mut node = Tree::node();
    for (key, child) in map {
        if key == SCHEMA {
            continue;
        }
        if child.is_object() {
            node.set(key, annotate(child)?);
        } else {
            let attr = AttributeValue::from_json(child)?;
            node.merge(&attribute_patch(key, &attr));
        }
    }
    Ok(node.into_value())
}

/// Tree shared between a node owner, its router and its handles.
///
/// Every mutation goes through the write lock, so concurrent merges never
/// interleave.
#[derive(Debug, Clone, Default)]
pub struct SharedTree(Arc<RwLock<Tree>>);

impl SharedTree {
    pub fn new(tree: Tree) -> Self {
        Self(Arc::new(RwLock::new(tree)))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Tree> {
        self.0.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Tree> {
        self.0.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> Tree {
        self.read().clone()
    }
}
