//! Dynamic group predicates.
//!
//! A stored query is a JSON document compiled into a [`Predicate`] before it
//! is evaluated against machine snapshots. The `version` key selects the
//! dialect, so new grammars can be registered next to the old ones without
//! breaking persisted groups:
//!
//! - version 0 (no `version` key): `{"status": "online", "os.family": ["linux", "bsd"]}`,
//!   a conjunction of equalities, arrays meaning "any of".
//! - version 1: `{"version": 1, "where": {"all": [{"field": "hostname", "op": "glob", "value": "web-*"}]}}`
//!   with `all`, `any`, `not` and `eq`, `ne`, `in`, `glob`, `gt`, `gte`, `lt`, `lte`.

use regex::Regex;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::models::{Machine, Severity};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum QueryError {
    #[error("unknown field '{0}'")]
    UnknownField(String),
    #[error("operator '{op}' is not supported on field '{field}'")]
    UnsupportedOperator { field: String, op: String },
    #[error("invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
    #[error("query dialect version {0} is not supported")]
    UnsupportedVersion(u64),
    #[error("malformed query: {0}")]
    Shape(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Id,
    Status,
    Hostname,
    Ip,
    OsFamily,
    OsVersion,
    OsArch,
    SecurityOpenCount,
    SecurityHighest,
    MetricsCpu,
    MetricsRam,
    MetricsDisk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    Text,
    Number,
    Severity,
}

impl Field {
    pub fn parse(name: &str) -> Option<Field> {
        let field = match name {
            "id" => Field::Id,
            "status" => Field::Status,
            "hostname" => Field::Hostname,
            "ip" => Field::Ip,
            "os.family" => Field::OsFamily,
            "os.version" => Field::OsVersion,
            "os.arch" => Field::OsArch,
            "security.open_count" => Field::SecurityOpenCount,
            "security.highest" => Field::SecurityHighest,
            "metrics.cpu" => Field::MetricsCpu,
            "metrics.ram" => Field::MetricsRam,
            "metrics.disk" => Field::MetricsDisk,
            _ => return None,
        };
        Some(field)
    }

    fn kind(&self) -> FieldKind {
        match self {
            Field::SecurityOpenCount | Field::MetricsCpu | Field::MetricsRam | Field::MetricsDisk => {
                FieldKind::Number
            }
            Field::SecurityHighest => FieldKind::Severity,
            _ => FieldKind::Text,
        }
    }

    fn value(&self, machine: &Machine) -> Option<Scalar> {
        match self {
            Field::Id => Some(Scalar::Text(machine.id.clone())),
            Field::Status => Some(Scalar::Text(machine.status.as_str().to_string())),
            Field::Hostname => Some(Scalar::Text(machine.hostname.clone())),
            Field::Ip => machine.ip.clone().map(Scalar::Text),
            Field::OsFamily => Some(Scalar::Text(machine.os.family.clone())),
            Field::OsVersion => machine.os.version.clone().map(Scalar::Text),
            Field::OsArch => machine.os.arch.clone().map(Scalar::Text),
            Field::SecurityOpenCount => Some(Scalar::Number(f64::from(machine.security.open_count))),
            Field::SecurityHighest => machine.security.highest.map(Scalar::Severity),
            Field::MetricsCpu => machine.metrics.as_ref().map(|m| Scalar::Number(m.cpu_percent)),
            Field::MetricsRam => machine.metrics.as_ref().map(|m| Scalar::Number(m.ram_percent)),
            Field::MetricsDisk => machine.metrics.as_ref().map(|m| Scalar::Number(m.disk_percent)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Scalar {
    Text(String),
    Number(f64),
    Severity(Severity),
}

impl Scalar {
    fn compare(&self, other: &Scalar) -> Option<Ordering> {
        match (self, other) {
            (Scalar::Text(a), Scalar::Text(b)) => Some(a.cmp(b)),
            (Scalar::Number(a), Scalar::Number(b)) => a.partial_cmp(b),
            (Scalar::Severity(a), Scalar::Severity(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
enum Test {
    Eq(Scalar),
    Ne(Scalar),
    In(Vec<Scalar>),
    Glob(Regex),
    Order(Ordering, bool, Scalar),
}

/// Compiled, side-effect free predicate over a machine snapshot.
#[derive(Debug, Clone)]
pub enum Predicate {
    MatchAll,
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
    Not(Box<Predicate>),
    Compare { field: Field, test: TestBox },
}

/// Opaque wrapper so the comparison internals stay private.
#[derive(Debug, Clone)]
pub struct TestBox(Test);

impl Predicate {
    pub fn matches(&self, machine: &Machine) -> bool {
        match self {
            Predicate::MatchAll => true,
            Predicate::All(items) => items.iter().all(|p| p.matches(machine)),
            Predicate::Any(items) => items.iter().any(|p| p.matches(machine)),
            Predicate::Not(inner) => !inner.matches(machine),
            Predicate::Compare { field, test } => {
                let value = field.value(machine);
                match (&test.0, value) {
                    (Test::Ne(expected), Some(actual)) => actual != *expected,
                    (Test::Ne(_), None) => true,
                    (_, None) => false,
                    (Test::Eq(expected), Some(actual)) => actual == *expected,
                    (Test::In(options), Some(actual)) => options.contains(&actual),
                    (Test::Glob(pattern), Some(Scalar::Text(actual))) => pattern.is_match(&actual),
                    (Test::Glob(_), Some(_)) => false,
                    (Test::Order(wanted, or_equal, bound), Some(actual)) => {
                        match actual.compare(bound) {
                            Some(Ordering::Equal) => *or_equal,
                            Some(ordering) => ordering == *wanted,
                            None => false,
                        }
                    }
                }
            }
        }
    }
}

/// One versioned query grammar.
pub trait QueryDialect: Send + Sync {
    fn version(&self) -> u64;
    fn compile(&self, doc: &Map<String, Value>) -> Result<Predicate, QueryError>;
}

/// Registry of dialects keyed by version.
pub struct QueryCompiler {
    dialects: HashMap<u64, Box<dyn QueryDialect>>,
}

impl Default for QueryCompiler {
    fn default() -> Self {
        let mut compiler = Self { dialects: HashMap::new() };
        compiler.register(Box::new(ShorthandDialect));
        compiler.register(Box::new(ExpressionDialect));
        compiler
    }
}

impl QueryCompiler {
    pub fn register(&mut self, dialect: Box<dyn QueryDialect>) {
        self.dialects.insert(dialect.version(), dialect);
    }

    /// `None`, `null` and `{}` compile to [`Predicate::MatchAll`].
    pub fn compile(&self, doc: Option<&Value>) -> Result<Predicate, QueryError> {
        let object = match doc {
            None | Some(Value::Null) => return Ok(Predicate::MatchAll),
            Some(Value::Object(object)) => object,
            Some(other) => {
                return Err(QueryError::Shape(format!("expected an object, got {other}")));
            }
        };
        if object.is_empty() {
            return Ok(Predicate::MatchAll);
        }
        let version = match object.get("version") {
            None => 0,
            Some(raw) => raw
                .as_u64()
                .ok_or_else(|| QueryError::Shape("version must be a positive integer".into()))?,
        };
        let dialect = self
            .dialects
            .get(&version)
            .ok_or(QueryError::UnsupportedVersion(version))?;
        dialect.compile(object)
    }
}

/// Version 0: field/value equality map.
struct ShorthandDialect;

impl QueryDialect for ShorthandDialect {
    fn version(&self) -> u64 {
        0
    }

    fn compile(&self, doc: &Map<String, Value>) -> Result<Predicate, QueryError> {
        let mut clauses = Vec::with_capacity(doc.len());
        for (name, value) in doc {
            if name == "version" {
                continue;
            }
            let field = Field::parse(name).ok_or_else(|| QueryError::UnknownField(name.clone()))?;
            let op = if value.is_array() { "in" } else { "eq" };
            clauses.push(compare(field, name, op, value)?);
        }
        Ok(match clauses.len() {
            0 => Predicate::MatchAll,
            1 => clauses.remove(0),
            _ => Predicate::All(clauses),
        })
    }
}

/// Version 1: boolean expression tree.
struct ExpressionDialect;

impl QueryDialect for ExpressionDialect {
    fn version(&self) -> u64 {
        1
    }

    fn compile(&self, doc: &Map<String, Value>) -> Result<Predicate, QueryError> {
        match doc.get("where") {
            None | Some(Value::Null) => Ok(Predicate::MatchAll),
            Some(expr) => compile_expr(expr),
        }
    }
}

fn compile_expr(expr: &Value) -> Result<Predicate, QueryError> {
    let object = expr
        .as_object()
        .ok_or_else(|| QueryError::Shape(format!("expected an expression object, got {expr}")))?;

    if let Some(items) = object.get("all") {
        return Ok(Predicate::All(compile_list("all", items)?));
    }
    if let Some(items) = object.get("any") {
        return Ok(Predicate::Any(compile_list("any", items)?));
    }
    if let Some(inner) = object.get("not") {
        return Ok(Predicate::Not(Box::new(compile_expr(inner)?)));
    }

    let name = object
        .get("field")
        .and_then(Value::as_str)
        .ok_or_else(|| QueryError::Shape("comparison requires a 'field' string".into()))?;
    let op = object.get("op").and_then(Value::as_str).unwrap_or("eq");
    let value = object
        .get("value")
        .ok_or_else(|| QueryError::Shape(format!("comparison on '{name}' requires a 'value'")))?;
    let field = Field::parse(name).ok_or_else(|| QueryError::UnknownField(name.to_string()))?;
    compare(field, name, op, value)
}

fn compile_list(key: &str, items: &Value) -> Result<Vec<Predicate>, QueryError> {
    items
        .as_array()
        .ok_or_else(|| QueryError::Shape(format!("'{key}' expects an array")))?
        .iter()
        .map(compile_expr)
        .collect()
}

fn compare(field: Field, name: &str, op: &str, value: &Value) -> Result<Predicate, QueryError> {
    let kind = field.kind();
    let unsupported = || QueryError::UnsupportedOperator {
        field: name.to_string(),
        op: op.to_string(),
    };
    let test = match op {
        "eq" => Test::Eq(scalar(kind, name, value)?),
        "ne" => Test::Ne(scalar(kind, name, value)?),
        "in" => {
            let options = value.as_array().ok_or_else(|| QueryError::InvalidValue {
                field: name.to_string(),
                reason: "'in' expects an array".into(),
            })?;
            Test::In(
                options
                    .iter()
                    .map(|v| scalar(kind, name, v))
                    .collect::<Result<_, _>>()?,
            )
        }
        "glob" => {
            if kind != FieldKind::Text {
                return Err(unsupported());
            }
            let pattern = value.as_str().ok_or_else(|| QueryError::InvalidValue {
                field: name.to_string(),
                reason: "glob pattern must be a string".into(),
            })?;
            Test::Glob(glob_to_regex(pattern).map_err(|e| QueryError::InvalidValue {
                field: name.to_string(),
                reason: e.to_string(),
            })?)
        }
        "gt" | "gte" | "lt" | "lte" => {
            if kind == FieldKind::Text {
                return Err(unsupported());
            }
            let wanted = if op.starts_with('g') { Ordering::Greater } else { Ordering::Less };
            Test::Order(wanted, op.ends_with('e'), scalar(kind, name, value)?)
        }
        _ => return Err(unsupported()),
    };
    Ok(Predicate::Compare { field, test: TestBox(test) })
}

fn scalar(kind: FieldKind, name: &str, value: &Value) -> Result<Scalar, QueryError> {
    let invalid = |reason: &str| QueryError::InvalidValue {
        field: name.to_string(),
        reason: reason.to_string(),
    };
    match kind {
        FieldKind::Text => match value {
            Value::String(s) => Ok(Scalar::Text(s.clone())),
            Value::Number(n) => Ok(Scalar::Text(n.to_string())),
            Value::Bool(b) => Ok(Scalar::Text(b.to_string())),
            _ => Err(invalid("expected a string")),
        },
        FieldKind::Number => value
            .as_f64()
            .map(Scalar::Number)
            .ok_or_else(|| invalid("expected a number")),
        FieldKind::Severity => value
            .as_str()
            .and_then(Severity::parse)
            .map(Scalar::Severity)
            .ok_or_else(|| invalid("expected a severity name")),
    }
}

/// `*` and `?` wildcards, anchored, case-insensitive.
pub fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut source = String::with_capacity(pattern.len() + 8);
    source.push_str("(?i)^");
    let mut literal = String::new();
    for ch in pattern.chars() {
        match ch {
            '*' | '?' => {
                source.push_str(&regex::escape(&literal));
                literal.clear();
                source.push_str(if ch == '*' { ".*" } else { "." });
            }
            other => literal.push(other),
        }
    }
    source.push_str(&regex::escape(&literal));
    source.push('$');
    Regex::new(&source)
}
