use serde_json::Value;

use super::document::DocumentQuery;

const CONTROL_KEYS: [&str; 4] = ["page", "sort", "limit", "fields"];
pub const DEFAULT_SORT: &str = "-createdAt";
pub const DEFAULT_LIMIT: u64 = 100;
const MAX_BOUND: u64 = i64::MAX as u64;
/// Bookkeeping field hidden unless a projection asks for it.
pub const VERSION_FIELD: &str = "__v";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    Gte,
    Gt,
    Lte,
    Lt,
    /// Value is an array; the field must equal one of its elements.
    In,
}

impl Op {
    fn from_suffix(s: &str) -> Option<Self> {
        match s {
            "gte" => Some(Op::Gte),
            "gt" => Some(Op::Gt),
            "lte" => Some(Op::Lte),
            "lt" => Some(Op::Lt),
            _ => None,
        }
    }

    pub fn sql(self) -> &'static str {
        match self {
            Op::Eq => "=",
            Op::Ne => "IS DISTINCT FROM",
            Op::Gte => ">=",
            Op::Gt => ">",
            Op::Lte => "<=",
            Op::Lt => "<",
            Op::In => "IN",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub field: String,
    pub op: Op,
    pub value: Value,
}

impl Predicate {
    pub fn new(field: impl Into<String>, op: Op, value: Value) -> Self {
        Self {
            field: field.into(),
            op,
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub field: String,
    pub desc: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Projection {
    Include(Vec<String>),
    Exclude(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub skip: u64,
    pub limit: u64,
}

/// Filter, sort, projection and pagination derived from query parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryShape {
    pub predicates: Vec<Predicate>,
    pub sort: Vec<SortKey>,
    pub projection: Projection,
    pub page: Page,
}

impl QueryShape {
    /// Never fails: anything unusable falls back to the defaults.
    pub fn from_params(params: &[(String, String)]) -> Self {
        Self {
            predicates: filter(params),
            sort: sort(param(params, "sort")),
            projection: select_fields(param(params, "fields")),
            page: paginate(param(params, "page"), param(params, "limit")),
        }
    }

    pub fn apply<Q: DocumentQuery>(&self, query: Q) -> Q {
        query
            .find(self.predicates.clone())
            .sort(self.sort.clone())
            .select(self.projection.clone())
            .skip(self.page.skip)
            .limit(self.page.limit)
    }
}

/// Last value wins, like a query-string map.
fn param<'a>(params: &'a [(String, String)], key: &str) -> Option<&'a str> {
    params
        .iter()
        .rev()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

/// A repeated equality key matches any of its values.
pub fn filter(params: &[(String, String)]) -> Vec<Predicate> {
    let mut predicates: Vec<Predicate> = Vec::new();
    for (key, raw) in params {
        if CONTROL_KEYS.contains(&key.as_str()) {
            continue;
        }
        let value = typed_value(raw);
        if let Some((field, op)) = split_operator(key) {
            predicates.push(Predicate::new(field, op, value));
            continue;
        }

        let same_key = predicates
            .iter_mut()
            .find(|p| p.field == *key && matches!(p.op, Op::Eq | Op::In));
        match same_key {
            Some(p) if p.op == Op::In => {
                if let Value::Array(values) = &mut p.value {
                    values.push(value);
                }
            }
            Some(p) => {
                let first = std::mem::take(&mut p.value);
                p.op = Op::In;
                p.value = Value::Array(vec![first, value]);
            }
            None => predicates.push(Predicate::new(key.as_str(), Op::Eq, value)),
        }
    }
    predicates
}

/// `price[gte]` -> (`price`, Gte). Unknown brackets stay part of the key.
fn split_operator(key: &str) -> Option<(&str, Op)> {
    let (field, rest) = key.split_once('[')?;
    let op = Op::from_suffix(rest.strip_suffix(']')?)?;
    if field.is_empty() {
        return None;
    }
    Some((field, op))
}

fn typed_value(raw: &str) -> Value {
    if let Ok(i) = raw.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        if f.is_finite() {
            return Value::from(f);
        }
    }
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(raw.to_string()),
    }
}

pub fn sort(raw: Option<&str>) -> Vec<SortKey> {
    let keys = parse_sort(raw.unwrap_or(DEFAULT_SORT));
    if keys.is_empty() {
        return parse_sort(DEFAULT_SORT);
    }
    keys
}

fn parse_sort(raw: &str) -> Vec<SortKey> {
    split_list(raw)
        .filter_map(|entry| match entry.strip_prefix('-') {
            Some("") => None,
            Some(field) => Some(SortKey {
                field: field.to_string(),
                desc: true,
            }),
            None => Some(SortKey {
                field: entry.to_string(),
                desc: false,
            }),
        })
        .collect()
}

pub fn select_fields(raw: Option<&str>) -> Projection {
    let entries: Vec<&str> = raw.map(|r| split_list(r).collect()).unwrap_or_default();
    if entries.is_empty() {
        return Projection::Exclude(vec![VERSION_FIELD.to_string()]);
    }

    if entries.iter().all(|e| e.starts_with('-')) {
        let excluded = entries
            .iter()
            .map(|e| e.trim_start_matches('-'))
            .filter(|e| !e.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>();
        if excluded.is_empty() {
            return Projection::Exclude(vec![VERSION_FIELD.to_string()]);
        }
        return Projection::Exclude(excluded);
    }

    Projection::Include(
        entries
            .iter()
            .filter(|e| !e.starts_with('-'))
            .map(|e| e.to_string())
            .collect(),
    )
}

/// Both values stay within `i64`, the range of a SQL `OFFSET`/`LIMIT`.
pub fn paginate(page: Option<&str>, limit: Option<&str>) -> Page {
    let page = positive(page).unwrap_or(1);
    let limit = positive(limit).unwrap_or(DEFAULT_LIMIT);
    Page {
        skip: (page - 1).saturating_mul(limit).min(MAX_BOUND),
        limit,
    }
}

fn positive(raw: Option<&str>) -> Option<u64> {
    raw.and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|n| *n > 0)
        .map(|n| n.min(MAX_BOUND))
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}
