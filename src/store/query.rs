//! Backend-agnostic query predicates.

use std::cmp::Ordering;

use super::value::{Document, FieldValue};

/// Comparison applied by a [`Filter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Gt,
    Lt,
    GtEq,
    LtEq,
    /// The field is an array containing the value.
    Contains,
}

/// A single `field <op> value` predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub op: Operator,
    pub value: FieldValue,
}

impl Filter {
    pub fn new(field: impl Into<String>, op: Operator, value: impl Into<FieldValue>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Self::new(field, Operator::Eq, value)
    }

    /// Evaluate against a document. A missing field only matches `Eq Null`.
    pub fn matches(&self, document: &Document) -> bool {
        let actual = document.get(&self.field).unwrap_or(&FieldValue::Null);
        match self.op {
            Operator::Eq => actual.compare(&self.value) == Some(Ordering::Equal),
            Operator::Gt => actual.compare(&self.value) == Some(Ordering::Greater),
            Operator::Lt => actual.compare(&self.value) == Some(Ordering::Less),
            Operator::GtEq => matches!(
                actual.compare(&self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Operator::LtEq => matches!(
                actual.compare(&self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Operator::Contains => match actual {
                FieldValue::Array(values) => values
                    .iter()
                    .any(|v| v.compare(&self.value) == Some(Ordering::Equal)),
                _ => false,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

/// A selection over one collection: filters are AND-ed together.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<Filter>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
}

impl Query {
    /// Select every document in a collection.
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn filters(mut self, filters: impl IntoIterator<Item = Filter>) -> Self {
        self.filters.extend(filters);
        self
    }

    pub fn where_eq(self, field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.filter(Filter::eq(field, value))
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, document: &Document) -> bool {
        self.filters.iter().all(|f| f.matches(document))
    }

    /// Apply ordering and limit to an already-filtered result set.
    pub fn finish(&self, mut documents: Vec<Document>) -> Vec<Document> {
        if let Some(order) = &self.order_by {
            documents.sort_by(|a, b| {
                let left = a.get(&order.field).unwrap_or(&FieldValue::Null);
                let right = b.get(&order.field).unwrap_or(&FieldValue::Null);
                let ordering = left.compare(right).unwrap_or(Ordering::Equal);
                match order.direction {
                    Direction::Ascending => ordering,
                    Direction::Descending => ordering.reverse(),
                }
            });
        }
        if let Some(limit) = self.limit {
            documents.truncate(limit);
        }
        documents
    }
}

/// Field names are interpolated into backend query paths, so only plain
/// identifiers are accepted.
pub fn is_valid_field_name(field: &str) -> bool {
    !field.is_empty()
        && field
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::value::Fields;

    fn doc(id: &str, n: i64, tags: &[&str]) -> Document {
        let mut fields = Fields::new();
        fields.insert("n".into(), FieldValue::Integer(n));
        fields.insert(
            "tags".into(),
            FieldValue::Array(tags.iter().map(|t| FieldValue::from(*t)).collect()),
        );
        Document::new(id, fields)
    }

    #[test]
    fn filters_order_and_limit() {
        let docs = vec![doc("a", 1, &["x"]), doc("b", 3, &["y"]), doc("c", 2, &["x", "y"])];
        let query = Query::collection("t")
            .filter(Filter::new("n", Operator::GtEq, 2i64))
            .order_by("n", Direction::Descending)
            .limit(1);
        let matched: Vec<_> = docs.into_iter().filter(|d| query.matches(d)).collect();
        let result = query.finish(matched);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].id, "b");
    }

    #[test]
    fn contains_and_missing_fields() {
        let d = doc("c", 2, &["x", "y"]);
        assert!(Filter::new("tags", Operator::Contains, "y").matches(&d));
        assert!(!Filter::new("tags", Operator::Contains, "z").matches(&d));
        assert!(Filter::eq("absent", FieldValue::Null).matches(&d));
        assert!(!Filter::eq("absent", "x").matches(&d));
    }

    #[test]
    fn field_names_are_plain_identifiers() {
        assert!(is_valid_field_name("video_uri"));
        assert!(!is_valid_field_name("a.b"));
        assert!(!is_valid_field_name("x'); DROP"));
    }
}
