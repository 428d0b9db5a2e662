//! Query model: filters, orderings, paging and the canonical subscription
//! hash used to deduplicate equivalent server registrations.

use serde_json::{json, Map as JsonMap, Value as JsonValue};

use crate::error::{invalid_data, InvalidDataReason, NimbusResult};
use crate::util::validate::{validate_key_path, validate_paging_take};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterRelation {
    Equal,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    Contains,
    StartsWith,
    EndsWith,
    ArrayContains,
}

impl FilterRelation {
    /// Wire token for the non-equality relations; equality uses the bare
    /// `{keyPath: value}` form and never appears as a token.
    pub(crate) fn wire_str(&self) -> &'static str {
        match self {
            FilterRelation::Equal => "eq",
            FilterRelation::GreaterThan => "gt",
            FilterRelation::GreaterThanOrEqual => "gte",
            FilterRelation::LessThan => "lt",
            FilterRelation::LessThanOrEqual => "lte",
            FilterRelation::Contains => "cnt",
            FilterRelation::StartsWith => "pref",
            FilterRelation::EndsWith => "suf",
            FilterRelation::ArrayContains => "arr-cnt",
        }
    }

    fn from_wire(token: &str) -> Option<Self> {
        match token {
            "gt" => Some(FilterRelation::GreaterThan),
            "gte" => Some(FilterRelation::GreaterThanOrEqual),
            "lt" => Some(FilterRelation::LessThan),
            "lte" => Some(FilterRelation::LessThanOrEqual),
            "cnt" => Some(FilterRelation::Contains),
            "pref" => Some(FilterRelation::StartsWith),
            "suf" => Some(FilterRelation::EndsWith),
            "arr-cnt" => Some(FilterRelation::ArrayContains),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    Simple {
        key_path: String,
        relation: FilterRelation,
        value: Option<JsonValue>,
    },
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn eq(key_path: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self::simple(key_path, FilterRelation::Equal, Some(value.into()))
    }

    pub fn gt(key_path: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self::simple(key_path, FilterRelation::GreaterThan, Some(value.into()))
    }

    pub fn gte(key_path: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self::simple(
            key_path,
            FilterRelation::GreaterThanOrEqual,
            Some(value.into()),
        )
    }

    pub fn lt(key_path: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self::simple(key_path, FilterRelation::LessThan, Some(value.into()))
    }

    pub fn lte(key_path: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self::simple(key_path, FilterRelation::LessThanOrEqual, Some(value.into()))
    }

    pub fn contains(key_path: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self::simple(key_path, FilterRelation::Contains, Some(value.into()))
    }

    pub fn starts_with(key_path: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self::simple(key_path, FilterRelation::StartsWith, Some(value.into()))
    }

    pub fn ends_with(key_path: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self::simple(key_path, FilterRelation::EndsWith, Some(value.into()))
    }

    pub fn array_contains(key_path: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self::simple(key_path, FilterRelation::ArrayContains, Some(value.into()))
    }

    pub fn and(operands: Vec<Filter>) -> Self {
        Filter::And(operands)
    }

    pub fn or(operands: Vec<Filter>) -> Self {
        Filter::Or(operands)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(operand: Filter) -> Self {
        Filter::Not(Box::new(operand))
    }

    fn simple(
        key_path: impl Into<String>,
        relation: FilterRelation,
        value: Option<JsonValue>,
    ) -> Self {
        Filter::Simple {
            key_path: key_path.into(),
            relation,
            value,
        }
    }

    /// Validates every key path and compound shape before serialization.
    pub fn validate(&self) -> NimbusResult<()> {
        match self {
            Filter::Simple { key_path, .. } => validate_key_path(key_path),
            Filter::And(operands) | Filter::Or(operands) => {
                if operands.is_empty() {
                    return Err(invalid_data(
                        InvalidDataReason::InvalidFilter,
                        "compound filter requires at least one operand",
                    ));
                }
                for operand in operands {
                    operand.validate()?;
                }
                Ok(())
            }
            Filter::Not(operand) => operand.validate(),
        }
    }

    pub fn to_wire(&self) -> JsonValue {
        match self {
            Filter::Simple {
                key_path,
                relation: FilterRelation::Equal,
                value,
            } => json!({ key_path.clone(): value.clone().unwrap_or(JsonValue::Null) }),
            Filter::Simple {
                key_path,
                relation,
                value,
            } => json!({
                key_path.clone(): {
                    relation.wire_str(): value.clone().unwrap_or(JsonValue::Null)
                }
            }),
            Filter::And(operands) => {
                json!({ "and": operands.iter().map(Filter::to_wire).collect::<Vec<_>>() })
            }
            Filter::Or(operands) => {
                json!({ "or": operands.iter().map(Filter::to_wire).collect::<Vec<_>>() })
            }
            Filter::Not(operand) => json!({ "not": operand.to_wire() }),
        }
    }

    pub fn from_wire(raw: &JsonValue) -> NimbusResult<Self> {
        let object = raw.as_object().ok_or_else(|| {
            invalid_data(
                InvalidDataReason::InvalidFilter,
                "filter frame is not a JSON object",
            )
        })?;
        let (key, value) = object.iter().next().ok_or_else(|| {
            invalid_data(InvalidDataReason::InvalidFilter, "filter frame is empty")
        })?;
        if object.len() != 1 {
            return Err(invalid_data(
                InvalidDataReason::InvalidFilter,
                "filter frame must have exactly one key",
            ));
        }

        match key.as_str() {
            "and" | "or" => {
                let operands = value
                    .as_array()
                    .ok_or_else(|| {
                        invalid_data(
                            InvalidDataReason::InvalidFilter,
                            "compound filter operands must be an array",
                        )
                    })?
                    .iter()
                    .map(Filter::from_wire)
                    .collect::<NimbusResult<Vec<_>>>()?;
                if key == "and" {
                    Ok(Filter::And(operands))
                } else {
                    Ok(Filter::Or(operands))
                }
            }
            "not" => Ok(Filter::Not(Box::new(Filter::from_wire(value)?))),
            key_path => {
                // `{keyPath: {op: v}}` with a known op token is a relation;
                // anything else is the bare equality form.
                if let JsonValue::Object(inner) = value {
                    if inner.len() == 1 {
                        if let Some((op, operand)) = inner.iter().next() {
                            if let Some(relation) = FilterRelation::from_wire(op) {
                                return Ok(Filter::Simple {
                                    key_path: key_path.to_owned(),
                                    relation,
                                    value: Some(operand.clone()),
                                });
                            }
                        }
                    }
                }
                Ok(Filter::Simple {
                    key_path: key_path.to_owned(),
                    relation: FilterRelation::Equal,
                    value: Some(value.clone()),
                })
            }
        }
    }

    /// Canonical hash fragment. Commutative operators sort their operand
    /// hashes so `and(a, b)` and `and(b, a)` collapse to one registration.
    pub(crate) fn canonical_hash(&self) -> String {
        match self {
            Filter::Simple {
                key_path,
                relation,
                value,
            } => format!(
                "{key_path}:{}:{}",
                relation.wire_str(),
                value.clone().unwrap_or(JsonValue::Null)
            ),
            Filter::And(operands) => {
                let mut hashes: Vec<String> =
                    operands.iter().map(Filter::canonical_hash).collect();
                hashes.sort();
                format!("and({})", hashes.join(","))
            }
            Filter::Or(operands) => {
                let mut hashes: Vec<String> =
                    operands.iter().map(Filter::canonical_hash).collect();
                hashes.sort();
                format!("or({})", hashes.join(","))
            }
            Filter::Not(operand) => format!("not({})", operand.canonical_hash()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    pub(crate) fn wire_str(&self) -> &'static str {
        match self {
            Direction::Ascending => "asc",
            Direction::Descending => "desc",
        }
    }

    fn from_wire(token: &str) -> Option<Self> {
        match token {
            "asc" => Some(Direction::Ascending),
            "desc" => Some(Direction::Descending),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ordering {
    pub key_path: String,
    pub direction: Direction,
}

impl Ordering {
    pub fn asc(key_path: impl Into<String>) -> Self {
        Self {
            key_path: key_path.into(),
            direction: Direction::Ascending,
        }
    }

    pub fn desc(key_path: impl Into<String>) -> Self {
        Self {
            key_path: key_path.into(),
            direction: Direction::Descending,
        }
    }

    pub fn validate(&self) -> NimbusResult<()> {
        validate_key_path(&self.key_path)
    }

    fn to_wire(&self) -> JsonValue {
        json!({ self.key_path.clone(): self.direction.wire_str() })
    }

    fn from_wire(raw: &JsonValue) -> NimbusResult<Self> {
        let object = raw.as_object().filter(|object| object.len() == 1);
        let entry = object.and_then(|object| object.iter().next());
        if let Some((key_path, JsonValue::String(token))) = entry {
            if let Some(direction) = Direction::from_wire(token) {
                return Ok(Self {
                    key_path: key_path.clone(),
                    direction,
                });
            }
        }
        Err(invalid_data(
            InvalidDataReason::InvalidFilter,
            "ordering descriptor must be a single {keyPath: \"asc\"|\"desc\"} object",
        ))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Paging {
    pub skip: Option<u64>,
    pub take: Option<u32>,
}

impl Paging {
    pub fn validate(&self) -> NimbusResult<()> {
        if let Some(take) = self.take {
            validate_paging_take(take)?;
        }
        Ok(())
    }
}

/// One standing query: collection plus optional filter, ordering, paging.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Query {
    pub collection_id: String,
    pub filter: Option<Filter>,
    pub ordering: Vec<Ordering>,
    pub paging: Option<Paging>,
}

impl Query {
    pub fn new(collection_id: impl Into<String>) -> Self {
        Self {
            collection_id: collection_id.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> NimbusResult<()> {
        if let Some(filter) = &self.filter {
            filter.validate()?;
        }
        for ordering in &self.ordering {
            ordering.validate()?;
        }
        if let Some(paging) = &self.paging {
            paging.validate()?;
        }
        Ok(())
    }

    /// Canonical key shared by every logical subscription against the same
    /// (collection, filter, ordering, paging) tuple.
    pub fn subscription_hash(&self) -> String {
        let filter = self
            .filter
            .as_ref()
            .map(Filter::canonical_hash)
            .unwrap_or_default();
        let ordering = self
            .ordering
            .iter()
            .map(|ordering| format!("{}:{}", ordering.key_path, ordering.direction.wire_str()))
            .collect::<Vec<_>>()
            .join(",");
        let paging = self
            .paging
            .map(|paging| {
                format!(
                    "{},{}",
                    paging
                        .skip
                        .map(|skip| skip.to_string())
                        .unwrap_or_default(),
                    paging
                        .take
                        .map(|take| take.to_string())
                        .unwrap_or_default()
                )
            })
            .unwrap_or_default();
        format!(
            "col#{}|f#{filter}|o#{ordering}|p#{paging}",
            self.collection_id
        )
    }

    /// Writes the `filter` / `order` / `limit` / `skip` payload fields shared
    /// by the subscribe and fetch requests.
    pub(crate) fn write_wire_fields(&self, payload: &mut JsonMap<String, JsonValue>) {
        if let Some(filter) = &self.filter {
            payload.insert("filter".into(), filter.to_wire());
        }
        if !self.ordering.is_empty() {
            payload.insert(
                "order".into(),
                JsonValue::Array(self.ordering.iter().map(Ordering::to_wire).collect()),
            );
        }
        if let Some(paging) = &self.paging {
            if let Some(take) = paging.take {
                payload.insert("limit".into(), json!(take));
            }
            if let Some(skip) = paging.skip {
                payload.insert("skip".into(), json!(skip));
            }
        }
    }

    pub fn from_wire_fields(
        collection_id: &str,
        payload: &JsonMap<String, JsonValue>,
    ) -> NimbusResult<Self> {
        let filter = payload.get("filter").map(Filter::from_wire).transpose()?;
        let ordering = payload
            .get("order")
            .and_then(JsonValue::as_array)
            .map(|orderings| {
                orderings
                    .iter()
                    .map(Ordering::from_wire)
                    .collect::<NimbusResult<Vec<_>>>()
            })
            .transpose()?
            .unwrap_or_default();
        let take = payload
            .get("limit")
            .and_then(JsonValue::as_u64)
            .map(|take| take as u32);
        let skip = payload.get("skip").and_then(JsonValue::as_u64);
        let paging = if take.is_some() || skip.is_some() {
            Some(Paging { skip, take })
        } else {
            None
        };
        Ok(Self {
            collection_id: collection_id.to_owned(),
            filter,
            ordering,
            paging,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_queries_share_a_hash() {
        let mut a = Query::new("messages");
        a.filter = Some(Filter::eq("sender", "john"));
        a.ordering = vec![Ordering::desc("$modified")];
        a.paging = Some(Paging {
            skip: None,
            take: Some(50),
        });
        let b = a.clone();
        assert_eq!(a.subscription_hash(), b.subscription_hash());
    }

    #[test]
    fn commutative_operands_hash_identically() {
        let left = Filter::and(vec![
            Filter::eq("sender", "john"),
            Filter::gt("stars", 3),
        ]);
        let right = Filter::and(vec![
            Filter::gt("stars", 3),
            Filter::eq("sender", "john"),
        ]);
        assert_eq!(left.canonical_hash(), right.canonical_hash());

        let not_left = Filter::not(left);
        let not_right = Filter::not(right);
        assert_eq!(not_left.canonical_hash(), not_right.canonical_hash());
    }

    #[test]
    fn differing_paging_changes_the_hash() {
        let mut a = Query::new("messages");
        a.paging = Some(Paging {
            skip: Some(10),
            take: Some(50),
        });
        let mut b = Query::new("messages");
        b.paging = Some(Paging {
            skip: None,
            take: Some(50),
        });
        assert_ne!(a.subscription_hash(), b.subscription_hash());
    }

    #[test]
    fn filters_round_trip_through_the_wire_shape() {
        let filters = vec![
            Filter::eq("sender", "john"),
            Filter::gt("stars", 3),
            Filter::starts_with("text", "he"),
            Filter::array_contains("tags", "urgent"),
            Filter::not(Filter::eq("archived", true)),
            Filter::or(vec![
                Filter::eq("sender", "john"),
                Filter::and(vec![Filter::lte("stars", 2), Filter::ends_with("text", "!")]),
            ]),
        ];
        for filter in filters {
            let decoded = Filter::from_wire(&filter.to_wire()).unwrap();
            assert_eq!(filter, decoded);
        }
    }

    #[test]
    fn bare_object_value_parses_as_equality() {
        let raw = serde_json::json!({"meta": {"stars": 3}});
        let filter = Filter::from_wire(&raw).unwrap();
        assert!(matches!(
            filter,
            Filter::Simple {
                relation: FilterRelation::Equal,
                ..
            }
        ));
    }

    #[test]
    fn orderings_round_trip() {
        let ordering = Ordering::desc("$modified");
        let decoded = Ordering::from_wire(&ordering.to_wire()).unwrap();
        assert_eq!(ordering, decoded);
        assert!(Ordering::from_wire(&serde_json::json!({"a": "sideways"})).is_err());
    }

    #[test]
    fn validation_rejects_bad_shapes() {
        assert!(Filter::eq("no spaces", 1).validate().is_err());
        assert!(Filter::and(vec![]).validate().is_err());
        assert!(Ordering::asc("bad..path").validate().is_err());
        let paging = Paging {
            skip: None,
            take: Some(501),
        };
        assert!(paging.validate().is_err());
    }

    #[test]
    fn wire_fields_round_trip_through_a_payload() {
        let mut query = Query::new("messages");
        query.filter = Some(Filter::and(vec![
            Filter::eq("sender", "john"),
            Filter::gte("stars", 2),
        ]));
        query.ordering = vec![Ordering::desc("$modified"), Ordering::asc("sender")];
        query.paging = Some(Paging {
            skip: Some(5),
            take: Some(100),
        });

        let mut payload = JsonMap::new();
        query.write_wire_fields(&mut payload);
        let decoded = Query::from_wire_fields("messages", &payload).unwrap();
        assert_eq!(query, decoded);
    }
}
