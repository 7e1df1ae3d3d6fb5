use std::cmp::Ordering;

use serde_json::{Map, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterOperator {
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    ArrayContains,
    In,
}

impl FilterOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::Equal => "==",
            FilterOperator::NotEqual => "!=",
            FilterOperator::LessThan => "<",
            FilterOperator::LessThanOrEqual => "<=",
            FilterOperator::GreaterThan => ">",
            FilterOperator::GreaterThanOrEqual => ">=",
            FilterOperator::ArrayContains => "array-contains",
            FilterOperator::In => "in",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SearchFilter {
    pub field: String,
    pub operator: FilterOperator,
    pub value: Value,
}

impl SearchFilter {
    pub fn new(field: impl Into<String>, operator: FilterOperator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }

    /// Evaluates the filter against a document body. Missing fields only satisfy `!=`.
    pub fn matches(&self, data: &Map<String, Value>) -> bool {
        let Some(value) = field_value(data, &self.field) else {
            return self.operator == FilterOperator::NotEqual && !self.value.is_null();
        };

        match self.operator {
            FilterOperator::Equal => value == &self.value,
            FilterOperator::NotEqual => value != &self.value,
            FilterOperator::LessThan => compare_values(value, &self.value) == Some(Ordering::Less),
            FilterOperator::LessThanOrEqual => matches!(
                compare_values(value, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOperator::GreaterThan => {
                compare_values(value, &self.value) == Some(Ordering::Greater)
            }
            FilterOperator::GreaterThanOrEqual => matches!(
                compare_values(value, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOperator::ArrayContains => value
                .as_array()
                .is_some_and(|items| items.iter().any(|item| item == &self.value)),
            FilterOperator::In => self
                .value
                .as_array()
                .is_some_and(|needles| needles.iter().any(|needle| needle == value)),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OrderDirection {
    #[default]
    Ascending,
    Descending,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OrderBy {
    pub field: String,
    pub direction: OrderDirection,
}

/// Filter / order / limit / cursor options accepted by list and subscribe calls.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryOptions {
    pub filters: Vec<SearchFilter>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
    /// Cursor value compared against the `order_by` field, or the document id when the
    /// query is unordered.
    pub start_after: Option<Value>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, filter: SearchFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: OrderDirection) -> Self {
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

    pub fn start_after(mut self, cursor: impl Into<Value>) -> Self {
        self.start_after = Some(cursor.into());
        self
    }
}

/// Resolves a dotted field path (`address.city`) inside a document body.
pub(crate) fn field_value<'a>(data: &'a Map<String, Value>, field: &str) -> Option<&'a Value> {
    let mut segments = field.split('.');
    let first = segments.next()?;
    let mut current = data.get(first)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

pub(crate) fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
        },
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn range_filters_compare_strings_and_numbers() {
        let data = body(json!({ "name": "山田", "careLevel": 3 }));
        assert!(SearchFilter::new("careLevel", FilterOperator::GreaterThanOrEqual, 3).matches(&data));
        assert!(!SearchFilter::new("careLevel", FilterOperator::LessThan, 3).matches(&data));
        assert!(SearchFilter::new("name", FilterOperator::GreaterThanOrEqual, "山田").matches(&data));
        assert!(SearchFilter::new("name", FilterOperator::LessThanOrEqual, "山田\u{f8ff}").matches(&data));
    }

    #[test]
    fn nested_paths_and_collections() {
        let data = body(json!({
            "address": { "city": "札幌" },
            "permissions": ["user.read"],
        }));
        assert!(SearchFilter::new("address.city", FilterOperator::Equal, "札幌").matches(&data));
        assert!(SearchFilter::new("permissions", FilterOperator::ArrayContains, "user.read").matches(&data));
        assert!(SearchFilter::new("address.city", FilterOperator::In, json!(["東京", "札幌"])).matches(&data));
    }

    #[test]
    fn missing_fields_only_match_not_equal() {
        let data = body(json!({}));
        assert!(!SearchFilter::new("isActive", FilterOperator::Equal, true).matches(&data));
        assert!(SearchFilter::new("isActive", FilterOperator::NotEqual, true).matches(&data));
    }
}
