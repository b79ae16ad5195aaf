//! Equality queries with ordering, limits and start-after cursors

use serde_json::Value;
use std::cmp::Ordering;

use super::Document;

/// Sort direction of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Ascending,
    Descending,
}

/// Position to resume a query after: the order-by value and document id of
/// the last document already seen.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryCursor {
    pub value: Value,
    pub id: String,
}

/// Field-equality query.
///
/// Results are sorted by the order-by field and then by document id in the
/// same direction, so cursors are unambiguous even when values tie.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filters: Vec<(String, Value)>,
    pub order_by: Option<(String, Direction)>,
    pub limit: Option<usize>,
    pub start_after: Option<QueryCursor>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn where_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push((field.into(), value.into()));
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by = Some((field.into(), direction));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn start_after(mut self, cursor: QueryCursor) -> Self {
        self.start_after = Some(cursor);
        self
    }

    /// Whether a document satisfies every equality filter.
    pub fn matches(&self, data: &Value) -> bool {
        self.filters.iter().all(|(field, expected)| data.get(field) == Some(expected))
    }

    /// The order-by value of a document, `Null` when absent.
    fn sort_key<'a>(&self, data: &'a Value) -> &'a Value {
        match &self.order_by {
            Some((field, _)) => data.get(field).unwrap_or(&Value::Null),
            None => &Value::Null,
        }
    }

    fn direction(&self) -> Direction {
        self.order_by.as_ref().map(|(_, d)| *d).unwrap_or_default()
    }

    fn compare(&self, a: (&Value, &str), b: (&Value, &str)) -> Ordering {
        let ordering = compare_values(a.0, b.0).then_with(|| a.1.cmp(b.1));
        match self.direction() {
            Direction::Ascending => ordering,
            Direction::Descending => ordering.reverse(),
        }
    }

    /// Evaluate the query over an unordered set of documents.
    pub fn apply(&self, documents: impl IntoIterator<Item = Document>) -> Vec<Document> {
        let mut selected: Vec<Document> = documents.into_iter().filter(|doc| self.matches(&doc.data)).collect();
        selected.sort_by(|a, b| {
            self.compare((self.sort_key(&a.data), a.id.as_str()), (self.sort_key(&b.data), b.id.as_str()))
        });

        if let Some(cursor) = &self.start_after {
            selected.retain(|doc| {
                self.compare((self.sort_key(&doc.data), doc.id.as_str()), (&cursor.value, cursor.id.as_str()))
                    == Ordering::Greater
            });
        }
        if let Some(limit) = self.limit {
            selected.truncate(limit);
        }
        selected
    }
}

/// Total order over JSON scalars: null < bool < number < string < other.
pub(crate) fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.total_cmp(&y)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}
