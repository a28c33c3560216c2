//! Query canonicalization
//!
//! Turns a query description into a deterministic cache key of the form
//! `{cache_version}:{entity}:{canonical_body}`. Object keys are sorted at every
//! depth, operators are rendered as `$name` keys, and numbers are printed in a
//! single canonical form, so two structurally equal queries always produce the
//! same key regardless of field insertion order.

use std::fmt::Write as _;

use serde_json::{Number, Value};

/// Comparison / logical operator inside a filter
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Eq(Box<Clause>),
    Ne(Box<Clause>),
    Gt(Box<Clause>),
    Gte(Box<Clause>),
    Lt(Box<Clause>),
    Lte(Box<Clause>),
    In(Vec<Clause>),
    NotIn(Vec<Clause>),
    Like(String),
    NotLike(String),
    Between(Box<Clause>, Box<Clause>),
    Is(Box<Clause>),
    And(Vec<Clause>),
    Or(Vec<Clause>),
    Not(Box<Clause>),
}

impl Op {
    /// Fixed string form used when hashing
    pub fn name(&self) -> &'static str {
        match self {
            Op::Eq(_) => "eq",
            Op::Ne(_) => "ne",
            Op::Gt(_) => "gt",
            Op::Gte(_) => "gte",
            Op::Lt(_) => "lt",
            Op::Lte(_) => "lte",
            Op::In(_) => "in",
            Op::NotIn(_) => "notIn",
            Op::Like(_) => "like",
            Op::NotLike(_) => "notLike",
            Op::Between(..) => "between",
            Op::Is(_) => "is",
            Op::And(_) => "and",
            Op::Or(_) => "or",
            Op::Not(_) => "not",
        }
    }

    pub fn equals(v: impl Into<Clause>) -> Self {
        Op::Eq(Box::new(v.into()))
    }

    pub fn not_equals(v: impl Into<Clause>) -> Self {
        Op::Ne(Box::new(v.into()))
    }

    pub fn gt(v: impl Into<Clause>) -> Self {
        Op::Gt(Box::new(v.into()))
    }

    pub fn gte(v: impl Into<Clause>) -> Self {
        Op::Gte(Box::new(v.into()))
    }

    pub fn lt(v: impl Into<Clause>) -> Self {
        Op::Lt(Box::new(v.into()))
    }

    pub fn lte(v: impl Into<Clause>) -> Self {
        Op::Lte(Box::new(v.into()))
    }

    pub fn is_in<I, C>(values: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Clause>,
    {
        Op::In(values.into_iter().map(Into::into).collect())
    }

    pub fn between(low: impl Into<Clause>, high: impl Into<Clause>) -> Self {
        Op::Between(Box::new(low.into()), Box::new(high.into()))
    }

    fn operand(&self) -> Clause {
        match self {
            Op::Eq(c) | Op::Ne(c) | Op::Gt(c) | Op::Gte(c) | Op::Lt(c) | Op::Lte(c) => {
                (**c).clone()
            }
            Op::Is(c) | Op::Not(c) => (**c).clone(),
            Op::In(cs) | Op::NotIn(cs) | Op::And(cs) | Op::Or(cs) => Clause::List(cs.clone()),
            Op::Like(s) | Op::NotLike(s) => Clause::Value(Value::String(s.clone())),
            Op::Between(lo, hi) => Clause::List(vec![(**lo).clone(), (**hi).clone()]),
        }
    }
}

/// A filter/where clause, or any nested part of a query description
#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    Value(Value),
    /// Integer wider than JSON numbers can carry exactly
    BigInt(i128),
    /// Object in insertion order; order is irrelevant to the key
    Fields(Vec<(String, Clause)>),
    List(Vec<Clause>),
    Op(Op),
}

impl Clause {
    pub fn fields<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, Clause)>,
        K: Into<String>,
    {
        Clause::Fields(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Lower into a JSON value with operators rendered as `$name` keys.
    fn to_json(&self) -> Value {
        match self {
            Clause::Value(v) => v.clone(),
            Clause::BigInt(n) => {
                let mut map = serde_json::Map::new();
                map.insert("$bigint".to_owned(), Value::String(n.to_string()));
                Value::Object(map)
            }
            Clause::Fields(fields) => {
                let mut map = serde_json::Map::new();
                for (k, v) in fields {
                    map.insert(k.clone(), v.to_json());
                }
                Value::Object(map)
            }
            Clause::List(items) => Value::Array(items.iter().map(Clause::to_json).collect()),
            Clause::Op(op) => {
                let mut map = serde_json::Map::new();
                map.insert(format!("${}", op.name()), op.operand().to_json());
                Value::Object(map)
            }
        }
    }
}

impl From<Value> for Clause {
    fn from(v: Value) -> Self {
        Clause::Value(v)
    }
}

impl From<Op> for Clause {
    fn from(op: Op) -> Self {
        Clause::Op(op)
    }
}

impl From<&str> for Clause {
    fn from(s: &str) -> Self {
        Clause::Value(Value::String(s.to_owned()))
    }
}

impl From<String> for Clause {
    fn from(s: String) -> Self {
        Clause::Value(Value::String(s))
    }
}

impl From<i64> for Clause {
    fn from(n: i64) -> Self {
        Clause::Value(Value::from(n))
    }
}

impl From<i32> for Clause {
    fn from(n: i32) -> Self {
        Clause::Value(Value::from(n))
    }
}

impl From<u64> for Clause {
    fn from(n: u64) -> Self {
        Clause::Value(Value::from(n))
    }
}

impl From<f64> for Clause {
    fn from(n: f64) -> Self {
        Clause::Value(Value::from(n))
    }
}

impl From<bool> for Clause {
    fn from(b: bool) -> Self {
        Clause::Value(Value::Bool(b))
    }
}

impl From<i128> for Clause {
    fn from(n: i128) -> Self {
        Clause::BigInt(n)
    }
}

/// Structured query: a filter plus optional ordering/include/paging metadata
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryDescription {
    pub filter: Option<Clause>,
    pub order: Option<Clause>,
    pub include: Option<Clause>,
    pub attributes: Option<Vec<String>>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl QueryDescription {
    pub fn filter(filter: impl Into<Clause>) -> Self {
        Self {
            filter: Some(filter.into()),
            ..Default::default()
        }
    }

    pub fn order(mut self, order: impl Into<Clause>) -> Self {
        self.order = Some(order.into());
        self
    }

    pub fn include(mut self, include: impl Into<Clause>) -> Self {
        self.include = Some(include.into());
        self
    }

    pub fn attributes<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes = Some(attributes.into_iter().map(Into::into).collect());
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    fn to_json(&self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert(
            "where".to_owned(),
            self.filter
                .as_ref()
                .map(Clause::to_json)
                .unwrap_or_else(|| Value::Object(serde_json::Map::new())),
        );
        if let Some(order) = &self.order {
            map.insert("order".to_owned(), order.to_json());
        }
        if let Some(include) = &self.include {
            map.insert("include".to_owned(), include.to_json());
        }
        if let Some(attributes) = &self.attributes {
            map.insert(
                "attributes".to_owned(),
                Value::Array(attributes.iter().cloned().map(Value::String).collect()),
            );
        }
        if let Some(limit) = self.limit {
            map.insert("limit".to_owned(), Value::from(limit));
        }
        if let Some(offset) = self.offset {
            map.insert("offset".to_owned(), Value::from(offset));
        }
        Value::Object(map)
    }
}

/// Anything a cache lookup can be keyed by
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    /// Used verbatim as the key body
    Raw(String),
    Structured(QueryDescription),
    /// Free-form JSON; bare filters are wrapped as `{"where": ...}`
    Json(Value),
}

impl From<&str> for Query {
    fn from(s: &str) -> Self {
        Query::Raw(s.to_owned())
    }
}

impl From<String> for Query {
    fn from(s: String) -> Self {
        Query::Raw(s)
    }
}

impl From<QueryDescription> for Query {
    fn from(q: QueryDescription) -> Self {
        Query::Structured(q)
    }
}

impl From<Value> for Query {
    fn from(v: Value) -> Self {
        Query::Json(v)
    }
}

impl From<Clause> for Query {
    fn from(c: Clause) -> Self {
        Query::Structured(QueryDescription::filter(c))
    }
}

impl Query {
    /// Canonical body of the key, without version/entity prefix
    pub fn canonical_body(&self) -> String {
        match self {
            Query::Raw(s) => s.clone(),
            Query::Structured(q) => stable_stringify(&q.to_json()),
            Query::Json(v) => stable_stringify(&wrap_where(v)),
        }
    }
}

fn wrap_where(v: &Value) -> Value {
    match v {
        Value::Object(map) if map.contains_key("where") => v.clone(),
        _ => {
            let mut map = serde_json::Map::new();
            map.insert("where".to_owned(), v.clone());
            Value::Object(map)
        }
    }
}

/// Build the full cache key for `query` under `entity`.
pub fn cache_key(cache_version: &str, entity: &str, query: &Query) -> String {
    format!("{}:{}:{}", cache_version, entity, query.canonical_body())
}

/// Prefix shared by every key of `entity`
pub fn entity_prefix(cache_version: &str, entity: &str) -> String {
    format!("{}:{}:", cache_version, entity)
}

/// JSON serialization with object keys sorted at every depth.
pub fn stable_stringify(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => write_number(out, n),
        Value::String(s) => write_string(out, s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (k, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(out, k);
                out.push(':');
                write_value(out, v);
            }
            out.push('}');
        }
    }
}

// Integral floats print as integers so 1 and 1.0 hash alike.
fn write_number(out: &mut String, n: &Number) {
    if let Some(i) = n.as_i64() {
        let _ = write!(out, "{}", i);
    } else if let Some(u) = n.as_u64() {
        let _ = write!(out, "{}", u);
    } else if let Some(f) = n.as_f64() {
        if f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 {
            let _ = write!(out, "{}", f as i64);
        } else {
            let _ = write!(out, "{}", f);
        }
    }
}

fn write_string(out: &mut String, s: &str) {
    // serde_json escaping of a plain string never fails
    match serde_json::to_string(s) {
        Ok(quoted) => out.push_str(&quoted),
        Err(_) => {
            out.push('"');
            out.push_str(s);
            out.push('"');
        }
    }
}
