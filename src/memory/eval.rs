//! Filter, projection and expression evaluation over stored documents.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::query::value::compare_values;

/// Resolves a query expression such as `r.address.city` against a document.
///
/// The leading segment names the collection alias and is skipped when the
/// expression has more than one segment.
pub fn evaluate<'a>(document: &'a Value, expression: &str) -> Option<&'a Value> {
    let mut segments = expression.split('.');
    let first = segments.next()?;
    let mut rest = segments.peekable();
    if rest.peek().is_none() {
        return document.get(first);
    }
    rest.try_fold(document, |current, segment| current.get(segment))
}

/// Comparison operator of a filter condition.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    /// `=`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

/// One conjunct of a range-side filter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Expression to evaluate.
    pub path: String,
    /// Comparison.
    pub op: Operator,
    /// Right-hand constant.
    pub value: Value,
}

impl Condition {
    /// Builds a condition.
    pub fn new(path: impl Into<String>, op: Operator, value: impl Into<Value>) -> Self {
        Self {
            path: path.into(),
            op,
            value: value.into(),
        }
    }

    /// Undefined operands and operands of different types never match.
    pub fn matches(&self, document: &Value) -> bool {
        let Some(left) = evaluate(document, &self.path) else {
            return false;
        };
        if std::mem::discriminant(left) != std::mem::discriminant(&self.value) {
            return false;
        }
        let ord = compare_values(left, &self.value);
        match self.op {
            Operator::Eq => ord.is_eq(),
            Operator::Ne => ord.is_ne(),
            Operator::Lt => ord.is_lt(),
            Operator::Le => ord.is_le(),
            Operator::Gt => ord.is_gt(),
            Operator::Ge => ord.is_ge(),
        }
    }
}

/// Shape of the payload returned for each matching document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Projection {
    /// The whole document.
    #[default]
    Document,
    /// `SELECT VALUE <path>`.
    Value {
        /// Expression to return.
        path: String,
    },
    /// `SELECT <path>, ...`, keyed by each path's last segment.
    Fields {
        /// Expressions to return.
        paths: Vec<String>,
    },
}

impl Projection {
    /// Payload for `document`.
    pub fn apply(&self, document: &Value) -> Value {
        match self {
            Projection::Document => document.clone(),
            Projection::Value { path } => evaluate(document, path).cloned().unwrap_or(Value::Null),
            Projection::Fields { paths } => {
                let mut row = Map::new();
                for path in paths {
                    if let Some(value) = evaluate(document, path) {
                        let name = path.rsplit('.').next().unwrap_or(path);
                        row.insert(name.to_owned(), value.clone());
                    }
                }
                Value::Object(row)
            }
        }
    }
}

/// Range-side part of a query: what each partition evaluates locally.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalQuery {
    /// Conjunctive filter.
    #[serde(default)]
    pub filter: Vec<Condition>,
    /// Payload shape.
    #[serde(default)]
    pub projection: Projection,
}

impl LocalQuery {
    /// Whole documents, no filter.
    pub fn all() -> Self {
        Self::default()
    }

    /// Adds a filter conjunct.
    pub fn filter(mut self, condition: Condition) -> Self {
        self.filter.push(condition);
        self
    }

    /// Sets the payload shape.
    pub fn project(mut self, projection: Projection) -> Self {
        self.projection = projection;
        self
    }

    /// True when every conjunct holds.
    pub fn matches(&self, document: &Value) -> bool {
        self.filter.iter().all(|condition| condition.matches(document))
    }
}
