//! Capability-typed access to dynamically-shaped data.
//!
//! A `DynamicValue` is one of a closed set of physically different sources
//! (a node of a parsed JSON document, a homogeneous sequence, a raw decimal
//! or floating literal) that all answer the same read interface. Each
//! variant only supports the accessors that match its nature; asking a
//! floating scalar for a string is a caller bug and reported as
//! `UnsupportedOperation`, never coerced.

use std::str::FromStr;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde_json::Value as Json;
use tally_ast::ty::FormulaType;

/// A contract violation by the caller of a `DynamicValue` accessor.
///
/// These indicate a binder or builtin bug, not bad input data, so they are
/// not converted into error values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnsupportedOperation {
    #[error("{operation} is not supported on a dynamic {found} value")]
    Accessor {
        operation: &'static str,
        found: FormulaType,
    },
    #[error("index {index} is out of range for a dynamic array of length {len}")]
    IndexOutOfRange { index: usize, len: usize },
}

fn unsupported(operation: &'static str, found: FormulaType) -> UnsupportedOperation {
    UnsupportedOperation::Accessor { operation, found }
}

static JSON_NULL: Json = Json::Null;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    Index(usize),
    Key(String),
}

/// One node of a parsed JSON document.
///
/// The document is fully owned and shared behind an `Arc`; a node is the
/// document plus the path from the root to it, so indexing into a large
/// document never copies subtrees.
#[derive(Clone)]
pub struct JsonNode {
    doc: Arc<Json>,
    path: Vec<Step>,
}

impl JsonNode {
    /// Wrap a whole document. The document must already be owned; nothing
    /// here borrows from the text it was parsed from.
    pub fn root(doc: Json) -> Self {
        Self {
            doc: Arc::new(doc),
            path: Vec::new(),
        }
    }

    /// The JSON value this node refers to.
    pub fn node(&self) -> &Json {
        let mut cur = self.doc.as_ref();
        for step in &self.path {
            let next = match (step, cur) {
                (Step::Index(i), Json::Array(items)) => items.get(*i),
                (Step::Key(k), Json::Object(map)) => map.get(k),
                _ => None,
            };
            // Paths are only built by walking existing nodes.
            cur = next.unwrap_or(&JSON_NULL);
        }
        cur
    }

    fn child(&self, step: Step) -> Self {
        let mut path = self.path.clone();
        path.push(step);
        Self {
            doc: Arc::clone(&self.doc),
            path,
        }
    }

    fn declared_type(&self) -> FormulaType {
        match self.node() {
            Json::Object(_) => FormulaType::Object,
            Json::Array(_) => FormulaType::Array,
            Json::String(_) => FormulaType::String,
            Json::Number(_) => FormulaType::Number,
            Json::Bool(_) => FormulaType::Boolean,
            Json::Null => FormulaType::Blank,
        }
    }
}

impl std::fmt::Debug for JsonNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonNode")
            .field("node", self.node())
            .field("depth", &self.path.len())
            .finish()
    }
}

impl PartialEq for JsonNode {
    fn eq(&self, other: &Self) -> bool {
        self.node() == other.node()
    }
}

/// Capability-typed value over dynamic data.
#[derive(Debug, Clone)]
pub enum DynamicValue {
    Json(JsonNode),
    Sequence(Arc<[DynamicValue]>),
    Decimal(Decimal),
    Number(f64),
}

impl DynamicValue {
    /// Build a sequence value, e.g. while assembling an array literal.
    pub fn sequence(items: impl IntoIterator<Item = DynamicValue>) -> Self {
        DynamicValue::Sequence(items.into_iter().collect())
    }

    /// Wrap an owned JSON value as the root of its own document.
    pub fn from_json(doc: Json) -> Self {
        DynamicValue::Json(JsonNode::root(doc))
    }

    pub fn declared_type(&self) -> FormulaType {
        match self {
            DynamicValue::Json(node) => node.declared_type(),
            DynamicValue::Sequence(_) => FormulaType::Array,
            DynamicValue::Decimal(_) => FormulaType::Decimal,
            DynamicValue::Number(_) => FormulaType::Number,
        }
    }

    /// Number of elements of an array-shaped value.
    pub fn len(&self) -> Result<usize, UnsupportedOperation> {
        match self {
            DynamicValue::Sequence(items) => Ok(items.len()),
            DynamicValue::Json(node) => match node.node() {
                Json::Array(items) => Ok(items.len()),
                _ => Err(unsupported("len", self.declared_type())),
            },
            _ => Err(unsupported("len", self.declared_type())),
        }
    }

    /// Element `index` (0-based) of an array-shaped value. Callers check
    /// `len()` first; an out-of-range index is a contract violation.
    pub fn index(&self, index: usize) -> Result<DynamicValue, UnsupportedOperation> {
        match self {
            DynamicValue::Sequence(items) => items.get(index).cloned().ok_or(
                UnsupportedOperation::IndexOutOfRange {
                    index,
                    len: items.len(),
                },
            ),
            DynamicValue::Json(node) => match node.node() {
                Json::Array(items) if index < items.len() => {
                    Ok(DynamicValue::Json(node.child(Step::Index(index))))
                }
                Json::Array(items) => Err(UnsupportedOperation::IndexOutOfRange {
                    index,
                    len: items.len(),
                }),
                _ => Err(unsupported("index", self.declared_type())),
            },
            _ => Err(unsupported("index", self.declared_type())),
        }
    }

    pub fn as_f64(&self) -> Result<f64, UnsupportedOperation> {
        match self {
            DynamicValue::Number(n) => Ok(*n),
            DynamicValue::Json(node) => match node.node() {
                Json::Number(n) => Ok(n
                    .as_f64()
                    .unwrap_or_else(|| n.to_string().parse().unwrap_or(f64::NAN))),
                _ => Err(unsupported("as_f64", self.declared_type())),
            },
            _ => Err(unsupported("as_f64", self.declared_type())),
        }
    }

    /// Exact decimal reading. JSON numbers are read from their literal
    /// text; `Ok(None)` means the literal does not fit a `Decimal`.
    pub fn as_decimal(&self) -> Result<Option<Decimal>, UnsupportedOperation> {
        match self {
            DynamicValue::Decimal(d) => Ok(Some(*d)),
            DynamicValue::Json(node) => match node.node() {
                Json::Number(n) => {
                    let text = n.to_string();
                    Ok(Decimal::from_str(&text)
                        .or_else(|_| Decimal::from_scientific(&text))
                        .ok())
                }
                _ => Err(unsupported("as_decimal", self.declared_type())),
            },
            _ => Err(unsupported("as_decimal", self.declared_type())),
        }
    }

    pub fn as_str(&self) -> Result<&str, UnsupportedOperation> {
        match self {
            DynamicValue::Json(node) => match node.node() {
                Json::String(s) => Ok(s.as_str()),
                _ => Err(unsupported("as_str", self.declared_type())),
            },
            _ => Err(unsupported("as_str", self.declared_type())),
        }
    }

    pub fn as_bool(&self) -> Result<bool, UnsupportedOperation> {
        match self {
            DynamicValue::Json(node) => match node.node() {
                Json::Bool(b) => Ok(*b),
                _ => Err(unsupported("as_bool", self.declared_type())),
            },
            _ => Err(unsupported("as_bool", self.declared_type())),
        }
    }

    /// Named property of an object-shaped JSON node. Every other shape
    /// reports `None` instead of failing.
    pub fn try_get_property(&self, name: &str) -> Option<DynamicValue> {
        match self {
            DynamicValue::Json(node) => match node.node() {
                Json::Object(map) if map.contains_key(name) => {
                    Some(DynamicValue::Json(node.child(Step::Key(name.to_string()))))
                }
                _ => None,
            },
            _ => None,
        }
    }

    /// Property names in document order, or `None` where enumeration is
    /// unsupported (everything but object-shaped JSON nodes).
    pub fn try_get_property_names(&self) -> Option<Vec<String>> {
        match self {
            DynamicValue::Json(node) => match node.node() {
                Json::Object(map) => Some(map.keys().cloned().collect()),
                _ => None,
            },
            _ => None,
        }
    }
}

impl PartialEq for DynamicValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (DynamicValue::Json(a), DynamicValue::Json(b)) => a == b,
            (DynamicValue::Sequence(a), DynamicValue::Sequence(b)) => a == b,
            (DynamicValue::Decimal(a), DynamicValue::Decimal(b)) => a == b,
            (DynamicValue::Number(a), DynamicValue::Number(b)) => a == b,
            _ => false,
        }
    }
}

impl std::fmt::Display for DynamicValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DynamicValue::Json(node) => write!(f, "{}", node.node()),
            DynamicValue::Sequence(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            DynamicValue::Decimal(d) => write!(f, "{d}"),
            DynamicValue::Number(n) => write!(f, "{n}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_declared_types_follow_node_kind() {
        let doc = DynamicValue::from_json(json!({
            "o": {}, "a": [], "s": "x", "n": 1, "b": true, "z": null
        }));
        let ty = |k: &str| doc.try_get_property(k).map(|v| v.declared_type());
        assert_eq!(doc.declared_type(), FormulaType::Object);
        assert_eq!(ty("o"), Some(FormulaType::Object));
        assert_eq!(ty("a"), Some(FormulaType::Array));
        assert_eq!(ty("s"), Some(FormulaType::String));
        assert_eq!(ty("n"), Some(FormulaType::Number));
        assert_eq!(ty("b"), Some(FormulaType::Boolean));
        assert_eq!(ty("z"), Some(FormulaType::Blank));
    }

    #[test]
    fn nested_index_shares_document() {
        let doc = DynamicValue::from_json(json!([[1, 2], [3, [4, 5]]]));
        let inner = doc.index(1).unwrap().index(1).unwrap();
        assert_eq!(inner.len().unwrap(), 2);
        assert_eq!(inner.index(0).unwrap().as_f64().unwrap(), 4.0);
        if let (DynamicValue::Json(outer), DynamicValue::Json(inner)) = (&doc, &inner) {
            assert!(Arc::ptr_eq(&outer.doc, &inner.doc));
        } else {
            panic!("expected json nodes");
        }
    }

    #[test]
    fn json_index_past_end_is_out_of_range() {
        let doc = DynamicValue::from_json(json!([true]));
        assert_eq!(
            doc.index(1).unwrap_err(),
            UnsupportedOperation::IndexOutOfRange { index: 1, len: 1 }
        );
    }

    #[test]
    fn scalars_reject_indexing_and_length() {
        let n = DynamicValue::Number(1.5);
        assert!(matches!(
            n.len(),
            Err(UnsupportedOperation::Accessor { operation: "len", .. })
        ));
        assert!(n.index(0).is_err());
        let d = DynamicValue::Decimal(Decimal::ONE);
        assert!(d.as_f64().is_err());
        assert!(d.as_str().is_err());
    }

    #[test]
    fn property_names_supported_only_on_objects() {
        let doc = DynamicValue::from_json(json!({"b": 1, "a": 2}));
        assert_eq!(
            doc.try_get_property_names(),
            Some(vec!["b".to_string(), "a".to_string()])
        );
        assert_eq!(DynamicValue::from_json(json!([1])).try_get_property_names(), None);
        assert_eq!(DynamicValue::Number(1.0).try_get_property_names(), None);
        assert_eq!(DynamicValue::sequence([]).try_get_property_names(), None);
    }

    #[test]
    fn decimal_reads_literal_text_exactly() {
        let doc = DynamicValue::from_json(
            serde_json::from_str("0.1000000000000000000000000001").unwrap(),
        );
        assert_eq!(
            doc.as_decimal().unwrap(),
            Some(Decimal::from_str("0.1000000000000000000000000001").unwrap())
        );
    }
}
