//! Feature filter predicates.
//!
//! Filters use a small subset of CQL2-JSON:
//!
//! ```json
//! { "op": "=", "args": [{ "property": "name" }, "US"] }
//! ```
//!
//! Supported operators are `=`, `!=` (or `<>`), `<`, `<=`, `>`, `>=`, `in`,
//! `isNull`, `and`, `or` and `not`. Anything else is rejected when the filter
//! is deserialized, so a stored filter is always evaluable.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::cmp::Ordering;

/// Binary comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn parse(op: &str) -> Option<Self> {
        match op {
            "=" => Some(CompareOp::Eq),
            "!=" | "<>" => Some(CompareOp::Ne),
            "<" => Some(CompareOp::Lt),
            "<=" => Some(CompareOp::Le),
            ">" => Some(CompareOp::Gt),
            ">=" => Some(CompareOp::Ge),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }
}

/// Parsed filter expression over feature properties
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawFilter", into = "RawFilter")]
pub enum FilterExpr {
    Compare { op: CompareOp, property: String, value: Value },
    In { property: String, values: Vec<Value> },
    IsNull { property: String },
    And(Vec<FilterExpr>),
    Or(Vec<FilterExpr>),
    Not(Box<FilterExpr>),
}

/// Wire shape of a CQL2-JSON expression
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawFilter {
    op: String,
    #[serde(default)]
    args: Vec<Value>,
}

impl FilterExpr {
    pub fn eq(property: impl Into<String>, value: impl Into<Value>) -> Self {
        FilterExpr::Compare { op: CompareOp::Eq, property: property.into(), value: value.into() }
    }

    pub fn compare(op: CompareOp, property: impl Into<String>, value: impl Into<Value>) -> Self {
        FilterExpr::Compare { op, property: property.into(), value: value.into() }
    }

    /// Evaluate against a feature's properties.
    ///
    /// A missing or null property never satisfies a comparison or `in`.
    pub fn evaluate(&self, properties: &Map<String, Value>) -> bool {
        match self {
            FilterExpr::Compare { op, property, value } => match properties.get(property) {
                None | Some(Value::Null) => false,
                Some(actual) => compare(actual, *op, value),
            },
            FilterExpr::In { property, values } => match properties.get(property) {
                None | Some(Value::Null) => false,
                Some(actual) => values.iter().any(|v| compare(actual, CompareOp::Eq, v)),
            },
            FilterExpr::IsNull { property } => {
                matches!(properties.get(property), None | Some(Value::Null))
            }
            FilterExpr::And(exprs) => exprs.iter().all(|e| e.evaluate(properties)),
            FilterExpr::Or(exprs) => exprs.iter().any(|e| e.evaluate(properties)),
            FilterExpr::Not(expr) => !expr.evaluate(properties),
        }
    }
}

fn compare(actual: &Value, op: CompareOp, expected: &Value) -> bool {
    let ordering = match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => None,
        },
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    };

    match (op, ordering) {
        (CompareOp::Eq, Some(o)) => o == Ordering::Equal,
        (CompareOp::Ne, Some(o)) => o != Ordering::Equal,
        (CompareOp::Ne, None) => true,
        (CompareOp::Lt, Some(o)) => o == Ordering::Less,
        (CompareOp::Le, Some(o)) => o != Ordering::Greater,
        (CompareOp::Gt, Some(o)) => o == Ordering::Greater,
        (CompareOp::Ge, Some(o)) => o != Ordering::Less,
        (_, None) => false,
    }
}

fn property_name(arg: &Value) -> Result<String, String> {
    arg.get("property")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| format!("expected {{\"property\": ...}}, got {}", arg))
}

fn nested(args: Vec<Value>) -> Result<Vec<FilterExpr>, String> {
    args.into_iter()
        .map(|arg| {
            let raw: RawFilter = serde_json::from_value(arg).map_err(|e| e.to_string())?;
            FilterExpr::try_from(raw)
        })
        .collect()
}

impl TryFrom<RawFilter> for FilterExpr {
    type Error = String;

    fn try_from(raw: RawFilter) -> Result<Self, Self::Error> {
        let RawFilter { op, args } = raw;

        if let Some(cmp) = CompareOp::parse(&op) {
            let [lhs, rhs]: [Value; 2] = args
                .try_into()
                .map_err(|_| format!("operator '{}' takes exactly two arguments", op))?;
            return Ok(FilterExpr::Compare { op: cmp, property: property_name(&lhs)?, value: rhs });
        }

        match op.as_str() {
            "in" => {
                let [lhs, rhs]: [Value; 2] =
                    args.try_into().map_err(|_| "operator 'in' takes two arguments".to_string())?;
                let values = match rhs {
                    Value::Array(values) => values,
                    other => return Err(format!("'in' expects a list, got {}", other)),
                };
                Ok(FilterExpr::In { property: property_name(&lhs)?, values })
            }
            "isNull" => {
                let [arg]: [Value; 1] = args
                    .try_into()
                    .map_err(|_| "operator 'isNull' takes one argument".to_string())?;
                Ok(FilterExpr::IsNull { property: property_name(&arg)? })
            }
            "and" | "or" => {
                if args.is_empty() {
                    return Err(format!("operator '{}' needs at least one argument", op));
                }
                let exprs = nested(args)?;
                Ok(if op == "and" { FilterExpr::And(exprs) } else { FilterExpr::Or(exprs) })
            }
            "not" => {
                let mut exprs = nested(args)?;
                if exprs.len() != 1 {
                    return Err("operator 'not' takes one argument".to_string());
                }
                Ok(FilterExpr::Not(Box::new(exprs.remove(0))))
            }
            other => Err(format!("unsupported filter operator '{}'", other)),
        }
    }
}

impl From<FilterExpr> for RawFilter {
    fn from(expr: FilterExpr) -> Self {
        let prop = |p: String| json!({ "property": p });
        let sub = |e: FilterExpr| serde_json::to_value(RawFilter::from(e)).unwrap_or(Value::Null);

        match expr {
            FilterExpr::Compare { op, property, value } => {
                RawFilter { op: op.as_str().to_string(), args: vec![prop(property), value] }
            }
            FilterExpr::In { property, values } => {
                RawFilter { op: "in".to_string(), args: vec![prop(property), Value::Array(values)] }
            }
            FilterExpr::IsNull { property } => {
                RawFilter { op: "isNull".to_string(), args: vec![prop(property)] }
            }
            FilterExpr::And(exprs) => {
                RawFilter { op: "and".to_string(), args: exprs.into_iter().map(sub).collect() }
            }
            FilterExpr::Or(exprs) => {
                RawFilter { op: "or".to_string(), args: exprs.into_iter().map(sub).collect() }
            }
            FilterExpr::Not(expr) => RawFilter { op: "not".to_string(), args: vec![sub(*expr)] },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn parse(value: Value) -> FilterExpr {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_equality() {
        let filter = parse(json!({ "op": "=", "args": [{ "property": "name" }, "US"] }));
        assert!(filter.evaluate(&props(json!({ "name": "US" }))));
        assert!(!filter.evaluate(&props(json!({ "name": "CA" }))));
        assert!(!filter.evaluate(&props(json!({}))));
    }

    #[test]
    fn test_not_equal_variants() {
        let a = parse(json!({ "op": "!=", "args": [{ "property": "kind" }, "reef"] }));
        let b = parse(json!({ "op": "<>", "args": [{ "property": "kind" }, "reef"] }));
        let p = props(json!({ "kind": "kelp" }));
        assert!(a.evaluate(&p));
        assert_eq!(a, b);
    }

    #[test]
    fn test_numeric_comparison() {
        let filter = parse(json!({ "op": ">=", "args": [{ "property": "depth" }, 30] }));
        assert!(filter.evaluate(&props(json!({ "depth": 30.0 }))));
        assert!(filter.evaluate(&props(json!({ "depth": 45 }))));
        assert!(!filter.evaluate(&props(json!({ "depth": 12 }))));
        assert!(!filter.evaluate(&props(json!({ "depth": "deep" }))));
    }

    #[test]
    fn test_in_and_or() {
        let filter = parse(json!({
            "op": "or",
            "args": [
                { "op": "in", "args": [{ "property": "iso" }, ["USA", "CAN"]] },
                { "op": "and", "args": [
                    { "op": "=", "args": [{ "property": "iso" }, "MEX"] },
                    { "op": "<", "args": [{ "property": "rank" }, 3] }
                ]}
            ]
        }));
        assert!(filter.evaluate(&props(json!({ "iso": "CAN" }))));
        assert!(filter.evaluate(&props(json!({ "iso": "MEX", "rank": 1 }))));
        assert!(!filter.evaluate(&props(json!({ "iso": "MEX", "rank": 5 }))));
        assert!(!filter.evaluate(&props(json!({ "iso": "BRA" }))));
    }

    #[test]
    fn test_is_null_and_not() {
        let filter = parse(json!({
            "op": "not",
            "args": [{ "op": "isNull", "args": [{ "property": "owner" }] }]
        }));
        assert!(filter.evaluate(&props(json!({ "owner": "state" }))));
        assert!(!filter.evaluate(&props(json!({ "owner": null }))));
        assert!(!filter.evaluate(&props(json!({}))));
    }

    #[test]
    fn test_unknown_operator_rejected() {
        let result: Result<FilterExpr, _> =
            serde_json::from_value(json!({ "op": "like", "args": [{ "property": "a" }, "x%"] }));
        assert!(result.is_err());
    }

    #[test]
    fn test_wrong_arity_rejected() {
        let result: Result<FilterExpr, _> =
            serde_json::from_value(json!({ "op": "=", "args": [{ "property": "a" }] }));
        assert!(result.is_err());
    }

    #[test]
    fn test_serializes_back_to_cql2() {
        let filter = FilterExpr::And(vec![
            FilterExpr::eq("name", "US"),
            FilterExpr::Not(Box::new(FilterExpr::IsNull { property: "id".to_string() })),
        ]);
        let value = serde_json::to_value(&filter).unwrap();
        assert_eq!(value["op"], "and");
        assert_eq!(value["args"][0]["args"][0]["property"], "name");
        let back: FilterExpr = serde_json::from_value(value).unwrap();
        assert_eq!(back, filter);
    }
}
