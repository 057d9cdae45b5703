//! Core record model, normalization and run-scoped schema for leadsync.

use std::collections::HashSet;
use std::fmt;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{json, Value as JsonValue};

pub const CRATE_NAME: &str = "leadsync-core";

pub const ID_COLUMN: &str = "id";
pub const CREATED_TIME_COLUMN: &str = "created_time";

/// Opaque continuation token handed out by the source. For the lead listing
/// endpoint this is the absolute URL of the next page.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Cursor text without its query string. Listing cursors embed the access
    /// token, so this is the form that goes into logs.
    pub fn redacted(&self) -> &str {
        redact_query(&self.0)
    }

    /// Cursor text with only the access token removed. Continuation
    /// parameters such as `after` survive, so a later run can resume from it
    /// once the token is attached again.
    pub fn resumable(&self) -> String {
        strip_query_param(&self.0, ACCESS_TOKEN_PARAM)
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.redacted())
    }
}

pub fn redact_query(url: &str) -> &str {
    url.split_once('?').map(|(head, _)| head).unwrap_or(url)
}

pub const ACCESS_TOKEN_PARAM: &str = "access_token";

/// `url` without any `name=...` pair in its query string.
pub fn strip_query_param(url: &str, name: &str) -> String {
    let Some((head, query)) = url.split_once('?') else {
        return url.to_string();
    };
    let kept = query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter(|pair| pair.split('=').next() != Some(name))
        .collect::<Vec<_>>();
    if kept.is_empty() {
        head.to_string()
    } else {
        format!("{head}?{}", kept.join("&"))
    }
}

/// One record exactly as the source returned it.
///
/// The payload is kept as raw JSON so that a page always deserializes, whatever
/// shape individual records take; the accessors below read it leniently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRecord(JsonValue);

impl RawRecord {
    pub fn from_json(value: JsonValue) -> Self {
        Self(value)
    }

    pub fn new<I, N, V>(id: impl Into<String>, created_time: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = (N, Vec<V>)>,
        N: Into<String>,
        V: Into<String>,
    {
        let field_data = fields
            .into_iter()
            .map(|(name, values)| {
                let values = values.into_iter().map(Into::into).collect::<Vec<String>>();
                json!({ "name": name.into(), "values": values })
            })
            .collect::<Vec<_>>();
        Self(json!({
            "id": id.into(),
            "created_time": created_time.into(),
            "field_data": field_data,
        }))
    }

    pub fn as_json(&self) -> &JsonValue {
        &self.0
    }

    pub fn id(&self) -> String {
        self.0.get(ID_COLUMN).map(scalar_text).unwrap_or_default()
    }

    pub fn created_time(&self) -> String {
        self.0
            .get(CREATED_TIME_COLUMN)
            .map(scalar_text)
            .unwrap_or_default()
    }

    /// Field entries in source order. Entries that are not objects are skipped.
    pub fn fields(&self) -> impl Iterator<Item = FieldEntry<'_>> {
        self.0
            .get("field_data")
            .and_then(JsonValue::as_array)
            .into_iter()
            .flatten()
            .filter(|entry| entry.is_object())
            .map(|entry| FieldEntry {
                name: entry.get("name").and_then(JsonValue::as_str),
                values: entry
                    .get("values")
                    .and_then(JsonValue::as_array)
                    .map(Vec::as_slice)
                    .unwrap_or(&[]),
            })
    }
}

/// Borrowed view of one `{name, values[]}` entry of a raw record.
#[derive(Debug, Clone, Copy)]
pub struct FieldEntry<'a> {
    pub name: Option<&'a str>,
    pub values: &'a [JsonValue],
}

impl FieldEntry<'_> {
    pub fn first_value(&self) -> String {
        self.values.first().map(scalar_text).unwrap_or_default()
    }
}

fn scalar_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Null | JsonValue::Array(_) | JsonValue::Object(_) => String::new(),
    }
}

/// Canonical column name for a source field name.
pub fn column_name(field_name: &str) -> String {
    field_name.to_lowercase().replace(' ', "_")
}

/// Flat column -> value mapping for one record. Keeps insertion order; setting
/// an existing column replaces its value in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedRow {
    cells: Vec<(String, String)>,
}

impl NormalizedRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, column: impl Into<String>, value: impl Into<String>) {
        let column = column.into();
        let value = value.into();
        match self.cells.iter_mut().find(|(name, _)| *name == column) {
            Some(cell) => cell.1 = value,
            None => self.cells.push((column, value)),
        }
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.cells
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value.as_str())
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.cells.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.cells
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

impl Serialize for NormalizedRow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.cells.len()))?;
        for (name, value) in &self.cells {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Flatten a raw record into one row. Never fails: missing or malformed parts
/// come out as empty strings, and nameless field entries are skipped.
pub fn normalize(raw: &RawRecord) -> NormalizedRow {
    let mut row = NormalizedRow::new();
    row.set(CREATED_TIME_COLUMN, raw.created_time());
    row.set(ID_COLUMN, raw.id());
    for field in raw.fields() {
        let Some(name) = field.name else {
            continue;
        };
        row.set(column_name(name), field.first_value());
    }
    row
}

/// Append-only ordered column set, grown from every row observed in a run.
#[derive(Debug, Clone, Default)]
pub struct SchemaAccumulator {
    columns: Vec<String>,
    seen: HashSet<String>,
}

impl SchemaAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, row: &NormalizedRow) {
        for column in row.columns() {
            if self.seen.insert(column.to_string()) {
                self.columns.push(column.to_string());
            }
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn contains(&self, column: &str) -> bool {
        self.seen.contains(column)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Row values aligned to the current columns, empty where the row has no value.
    pub fn pad(&self, row: &NormalizedRow) -> Vec<String> {
        self.columns
            .iter()
            .map(|column| row.get(column).unwrap_or_default().to_string())
            .collect()
    }
}
