use rand::Rng;

/// Generate a unique, roughly time-ordered identifier such as `op_1718000000000_1f2e3d4c5b6a7988`.
pub fn generate_id(prefix: &str) -> String {
	let mut suffix = [0u8; 8];
	rand::rng().fill(&mut suffix);
	format!(
		"{}_{}_{}",
		prefix,
		chrono::Utc::now().timestamp_millis(),
		hex::encode(suffix)
	)
}
