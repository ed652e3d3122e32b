//! Document, metadata projection, and list query models

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A synced document as both stores exchange it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Document identifier, unique within its source
    pub id: String,
    /// Watermark (Unix ms)
    pub updated_at: i64,
    /// Document fields (always a JSON object)
    pub payload: serde_json::Value,
}

impl Document {
    pub fn new(id: impl Into<String>, updated_at: i64, payload: serde_json::Value) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(Error::InvalidInput("document id must not be empty".into()));
        }
        if !payload.is_object() {
            return Err(Error::InvalidInput(format!(
                "document '{id}' payload must be a JSON object"
            )));
        }
        Ok(Self {
            id,
            updated_at,
            payload,
        })
    }

    /// Lightweight projection used for diffing
    #[must_use]
    pub fn metadata(&self) -> MetadataModel {
        MetadataModel {
            document_id: self.id.clone(),
            updated_at: self.updated_at,
        }
    }

    /// Flatten into the remote shape `{ "id", "updated_at", ...fields }`
    #[must_use]
    pub fn to_wire(&self) -> serde_json::Value {
        let mut fields = self.payload.as_object().cloned().unwrap_or_default();
        fields.insert("id".into(), self.id.clone().into());
        fields.insert("updated_at".into(), self.updated_at.into());
        serde_json::Value::Object(fields)
    }

    /// Parse the remote shape produced by `to_wire`
    pub fn from_wire(value: serde_json::Value) -> Result<Self> {
        let serde_json::Value::Object(mut fields) = value else {
            return Err(Error::InvalidInput("remote document must be a JSON object".into()));
        };
        let id = match fields.remove("id") {
            Some(serde_json::Value::String(id)) => id,
            Some(other) => other.to_string(),
            None => return Err(Error::InvalidInput("remote document is missing 'id'".into())),
        };
        let updated_at = fields
            .remove("updated_at")
            .as_ref()
            .and_then(serde_json::Value::as_i64)
            .ok_or_else(|| {
                Error::InvalidInput(format!("remote document '{id}' is missing 'updated_at'"))
            })?;
        Self::new(id, updated_at, serde_json::Value::Object(fields))
    }
}

/// `(document_id, updated_at)` projection fetched without the payload
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetadataModel {
    pub document_id: String,
    pub updated_at: i64,
}

/// Single field-equality filter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldFilter {
    pub field: String,
    pub value: serde_json::Value,
}

/// List query supported by both stores: field equality filters plus paging.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentQuery {
    pub filters: Vec<FieldFilter>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl DocumentQuery {
    /// Query matching every document
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Add a `field == value` filter
    #[must_use]
    pub fn where_eq(mut self, field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.filters.push(FieldFilter {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub const fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Reject field names that cannot be used as a JSON path or query parameter
    pub fn validate(&self) -> Result<()> {
        for filter in &self.filters {
            validate_field_name(&filter.field)?;
            if filter.value.is_object() || filter.value.is_array() {
                return Err(Error::InvalidInput(format!(
                    "filter on '{}' must compare against a scalar value",
                    filter.field
                )));
            }
        }
        Ok(())
    }

    /// Whether a payload satisfies every filter
    pub fn matches(&self, payload: &serde_json::Value) -> bool {
        self.filters
            .iter()
            .all(|filter| payload.get(&filter.field) == Some(&filter.value))
    }

    /// Apply offset/limit to an already filtered, ordered list
    pub fn page<T>(&self, items: Vec<T>) -> Vec<T> {
        let iter = items.into_iter().skip(self.offset);
        match self.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        }
    }
}

/// Parse a `field=value` CLI/query-string filter. Values that parse as JSON
/// scalars (numbers, booleans) keep their type; everything else is a string.
pub fn parse_filter(raw: &str) -> Result<FieldFilter> {
    let (field, value) = raw
        .split_once('=')
        .ok_or_else(|| Error::InvalidInput(format!("filter '{raw}' must look like field=value")))?;
    let field = field.trim();
    validate_field_name(field)?;
    let value = value.trim();
    let value = match serde_json::from_str::<serde_json::Value>(value) {
        Ok(parsed) if parsed.is_number() || parsed.is_boolean() || parsed.is_string() => parsed,
        _ => serde_json::Value::String(value.to_string()),
    };
    Ok(FieldFilter {
        field: field.to_string(),
        value,
    })
}

fn validate_field_name(field: &str) -> Result<()> {
    let valid = !field.is_empty()
        && field
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !field.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("invalid filter field '{field}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn document_requires_object_payload() {
        assert!(Document::new("a", 1, json!({"x": 1})).is_ok());
        assert!(Document::new("a", 1, json!([1, 2])).is_err());
        assert!(Document::new(" ", 1, json!({})).is_err());
    }

    #[test]
    fn wire_shape_flattens_fields() {
        let doc = Document::new("org-1", 42, json!({"name": "Lyceum"})).unwrap();
        let wire = doc.to_wire();
        assert_eq!(wire, json!({"id": "org-1", "updated_at": 42, "name": "Lyceum"}));
        assert_eq!(Document::from_wire(wire).unwrap(), doc);

        assert!(Document::from_wire(json!({"id": "x"})).is_err());
        assert!(Document::from_wire(json!({"updated_at": 1})).is_err());
        assert!(Document::from_wire(json!([1])).is_err());
    }

    #[test]
    fn query_matches_all_filters() {
        let query = DocumentQuery::all()
            .where_eq("organization_id", "org-1")
            .where_eq("done", false);
        assert!(query.matches(&json!({"organization_id": "org-1", "done": false, "x": 2})));
        assert!(!query.matches(&json!({"organization_id": "org-1", "done": true})));
        assert!(!query.matches(&json!({"done": false})));
    }

    #[test]
    fn query_rejects_unsafe_fields() {
        assert!(DocumentQuery::all().where_eq("a.b", 1).validate().is_err());
        assert!(DocumentQuery::all().where_eq("x') OR 1=1 --", 1).validate().is_err());
        assert!(DocumentQuery::all().where_eq("title", json!({})).validate().is_err());
        assert!(DocumentQuery::all().where_eq("subject_id", 3).validate().is_ok());
    }

    #[test]
    fn page_applies_offset_and_limit() {
        let query = DocumentQuery::all().offset(1).limit(2);
        assert_eq!(query.page(vec![1, 2, 3, 4]), vec![2, 3]);
        assert_eq!(DocumentQuery::all().offset(3).page(vec![1, 2, 3, 4]), vec![4]);
    }

    #[test]
    fn parse_filter_keeps_scalar_types() {
        let filter = parse_filter("week=3").unwrap();
        assert_eq!(filter.value, json!(3));
        let filter = parse_filter("done=true").unwrap();
        assert_eq!(filter.value, json!(true));
        let filter = parse_filter("title=Algebra II").unwrap();
        assert_eq!(filter.value, json!("Algebra II"));
        assert!(parse_filter("no-equals").is_err());
    }
}
