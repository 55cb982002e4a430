//! Merge strategies
//!
//! Type-specific logic for combining two conflicting values. Strategies are tried in order and
//! the first whose `can_merge` accepts the pair performs the merge; a permissive deep merge is
//! the fallback.

use chrono::Utc;
use serde_json::{Map, Number, Value};

pub trait MergeStrategy: Send + Sync {
	fn name(&self) -> &'static str;

	fn can_merge(&self, local: &Value, remote: &Value) -> bool;

	fn merge(&self, local: &Value, remote: &Value) -> Value;
}

/// Recursive key-wise merge of two objects.
///
/// Remote wins per leaf; keys only present locally are added.
pub fn deep_merge(local: &Value, remote: &Value) -> Value {
	match (local, remote) {
		(Value::Object(local_map), Value::Object(remote_map)) => {
			let mut merged: Map<String, Value> = remote_map.clone();
			for (key, local_value) in local_map {
				let value = match remote_map.get(key) {
					Some(remote_value) => deep_merge(local_value, remote_value),
					None => local_value.clone(),
				};
				merged.insert(key.clone(), value);
			}
			Value::Object(merged)
		}
		(local, Value::Null) => local.clone(),
		(_, remote) => remote.clone(),
	}
}

pub struct DeepMergeStrategy;

impl MergeStrategy for DeepMergeStrategy {
	fn name(&self) -> &'static str {
		"deep_merge"
	}

	fn can_merge(&self, local: &Value, remote: &Value) -> bool {
		local.is_object() && remote.is_object()
	}

	fn merge(&self, local: &Value, remote: &Value) -> Value {
		deep_merge(local, remote)
	}
}

/// Union of two arrays: remote order preserved, local items not already present appended
pub struct UnionStrategy;

impl MergeStrategy for UnionStrategy {
	fn name(&self) -> &'static str {
		"array_union"
	}

	fn can_merge(&self, local: &Value, remote: &Value) -> bool {
		local.is_array() && remote.is_array()
	}

	fn merge(&self, local: &Value, remote: &Value) -> Value {
		let mut merged = remote.as_array().cloned().unwrap_or_default();
		for item in local.as_array().into_iter().flatten() {
			if !merged.contains(item) {
				merged.push(item.clone());
			}
		}
		Value::Array(merged)
	}
}

/// Adds two JSON numbers, keeping integers integral when both sides are integers.
fn add_numbers(a: &Number, b: &Number) -> Value {
	if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
		if let Some(sum) = x.checked_add(y) {
			return Value::from(sum);
		}
	}
	let sum = a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0);
	Number::from_f64(sum).map(Value::Number).unwrap_or(Value::Null)
}

pub struct SumStrategy;

impl MergeStrategy for SumStrategy {
	fn name(&self) -> &'static str {
		"numeric_sum"
	}

	fn can_merge(&self, local: &Value, remote: &Value) -> bool {
		local.is_number() && remote.is_number()
	}

	fn merge(&self, local: &Value, remote: &Value) -> Value {
		match (local, remote) {
			(Value::Number(a), Value::Number(b)) => add_numbers(a, b),
			_ => remote.clone(),
		}
	}
}

/// Concatenates two strings, remote first
pub struct ConcatStrategy;

impl MergeStrategy for ConcatStrategy {
	fn name(&self) -> &'static str {
		"string_concat"
	}

	fn can_merge(&self, local: &Value, remote: &Value) -> bool {
		local.is_string() && remote.is_string()
	}

	fn merge(&self, local: &Value, remote: &Value) -> Value {
		let remote = remote.as_str().unwrap_or_default();
		let local = local.as_str().unwrap_or_default();
		Value::String(format!("{}{}", remote, local))
	}
}

/// Merge for money movements: objects carrying a numeric `amount` are combined additively.
///
/// Two money movements queued concurrently against the same record are treated as both having
/// happened. The result is a deep merge with the summed amount and a `_merged` marker.
pub struct FinancialMergeStrategy;

impl MergeStrategy for FinancialMergeStrategy {
	fn name(&self) -> &'static str {
		"financial_merge"
	}

	fn can_merge(&self, local: &Value, remote: &Value) -> bool {
		local.get("amount").is_some_and(Value::is_number)
			&& remote.get("amount").is_some_and(Value::is_number)
	}

	fn merge(&self, local: &Value, remote: &Value) -> Value {
		let mut merged = deep_merge(local, remote);
		if let (Some(Value::Number(a)), Some(Value::Number(b)), Some(object)) =
			(local.get("amount"), remote.get("amount"), merged.as_object_mut())
		{
			object.insert("amount".to_string(), add_numbers(a, b));
			object.insert("_merged".to_string(), Value::Bool(true));
			object.insert("_mergedAt".to_string(), Value::String(Utc::now().to_rfc3339()));
		}
		merged
	}
}

/// Ordered list of merge strategies with a permissive deep-merge fallback
pub struct MergeEngine {
	strategies: Vec<Box<dyn MergeStrategy>>,
}

impl MergeEngine {
	/// Build the shipped strategy list.
	///
	/// `financial_merge` controls whether objects carrying an `amount` are summed or merged like
	/// any other object.
	pub fn new(financial_merge: bool) -> Self {
		let mut strategies: Vec<Box<dyn MergeStrategy>> = Vec::new();
		if financial_merge {
			strategies.push(Box::new(FinancialMergeStrategy));
		}
		strategies.push(Box::new(DeepMergeStrategy));
		strategies.push(Box::new(UnionStrategy));
		strategies.push(Box::new(SumStrategy));
		strategies.push(Box::new(ConcatStrategy));
		Self { strategies }
	}

	/// Merge two values, returning the strategy name used and the merged value
	pub fn merge(&self, local: &Value, remote: &Value) -> (&'static str, Value) {
		match self.strategies.iter().find(|s| s.can_merge(local, remote)) {
			Some(strategy) => (strategy.name(), strategy.merge(local, remote)),
			None => ("permissive_deep_merge", deep_merge(local, remote)),
		}
	}
}

impl Default for MergeEngine {
	fn default() -> Self {
		Self::new(true)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn test_deep_merge_remote_wins_per_leaf() {
		let local = json!({"name": "Local", "prefs": {"theme": "dark", "lang": "en"}, "extra": 1});
		let remote = json!({"name": "Remote", "prefs": {"theme": "light"}});

		let merged = deep_merge(&local, &remote);
		assert_eq!(merged["name"], "Remote");
		assert_eq!(merged["prefs"]["theme"], "light");
		assert_eq!(merged["prefs"]["lang"], "en");
		assert_eq!(merged["extra"], 1);
	}

	#[test]
	fn test_union_preserves_remote_order() {
		let engine = MergeEngine::default();
		let (name, merged) = engine.merge(&json!(["c", "a", "d"]), &json!(["a", "b"]));
		assert_eq!(name, "array_union");
		assert_eq!(merged, json!(["a", "b", "c", "d"]));
	}

	#[test]
	fn test_sum_and_concat() {
		let engine = MergeEngine::default();
		assert_eq!(engine.merge(&json!(2), &json!(3)), ("numeric_sum", json!(5)));
		assert_eq!(engine.merge(&json!(1.5), &json!(2)), ("numeric_sum", json!(3.5)));
		assert_eq!(engine.merge(&json!("b"), &json!("a")), ("string_concat", json!("ab")));
	}

	#[test]
	fn test_financial_merge_sums_amounts() {
		let engine = MergeEngine::default();
		let (name, merged) = engine.merge(
			&json!({"amount": 50, "note": "coffee"}),
			&json!({"amount": 30, "category": "food"}),
		);

		assert_eq!(name, "financial_merge");
		assert_eq!(merged["amount"], 80);
		assert_eq!(merged["note"], "coffee");
		assert_eq!(merged["category"], "food");
		assert_eq!(merged["_merged"], true);
		assert!(merged["_mergedAt"].is_string());
	}

	#[test]
	fn test_financial_merge_can_be_disabled() {
		let engine = MergeEngine::new(false);
		let (name, merged) = engine.merge(&json!({"amount": 50}), &json!({"amount": 30}));
		assert_eq!(name, "deep_merge");
		assert_eq!(merged["amount"], 30);
	}

	#[test]
	fn test_fallback_for_mismatched_types() {
		let engine = MergeEngine::default();
		let (name, merged) = engine.merge(&json!({"a": 1}), &json!([1]));
		assert_eq!(name, "permissive_deep_merge");
		assert_eq!(merged, json!([1]));

		let (_, merged) = engine.merge(&json!({"a": 1}), &Value::Null);
		assert_eq!(merged, json!({"a": 1}));
	}
}
