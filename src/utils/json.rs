use chrono::{DateTime, Utc};
use serde_json::Value;

/// Field names recognised as an explicit version/revision marker
const VERSION_FIELDS: [&str; 3] = ["version", "revision", "_version"];

/// Field names recognised as a last-modified timestamp
const TIMESTAMP_FIELDS: [&str; 5] = [
	"updatedAt",
	"updated_at",
	"lastModified",
	"last_modified",
	"timestamp",
];

/// Coarse JSON type of a value, used to detect structural disagreement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonShape {
	Null,
	Bool,
	Number,
	String,
	Array,
	Object,
}

impl JsonShape {
	pub fn of(value: &Value) -> Self {
		match value {
			Value::Null => JsonShape::Null,
			Value::Bool(_) => JsonShape::Bool,
			Value::Number(_) => JsonShape::Number,
			Value::String(_) => JsonShape::String,
			Value::Array(_) => JsonShape::Array,
			Value::Object(_) => JsonShape::Object,
		}
	}
}

/// Extract an explicit version number from a JSON object.
///
/// Accepts unsigned integers and numeric strings.
pub fn extract_version(value: &Value) -> Option<u64> {
	let object = value.as_object()?;
	VERSION_FIELDS.iter().find_map(|field| {
		object.get(*field).and_then(|v| match v {
			Value::Number(n) => n.as_u64(),
			Value::String(s) => s.parse::<u64>().ok(),
			_ => None,
		})
	})
}

/// Name of the version field carried by a JSON object, if any
pub fn version_field(value: &Value) -> Option<&'static str> {
	let object = value.as_object()?;
	VERSION_FIELDS
		.iter()
		.copied()
		.find(|field| object.contains_key(*field))
}

/// Extract a last-modified timestamp from a JSON object.
///
/// Accepts RFC 3339 strings and epoch milliseconds.
pub fn extract_timestamp(value: &Value) -> Option<DateTime<Utc>> {
	let object = value.as_object()?;
	TIMESTAMP_FIELDS.iter().find_map(|field| {
		object.get(*field).and_then(|v| match v {
			Value::String(s) => DateTime::parse_from_rfc3339(s)
				.ok()
				.map(|dt| dt.with_timezone(&Utc)),
			Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
			_ => None,
		})
	})
}
