//! Parsing of raw provider output into decisions.
//!
//! Providers return prose around the JSON more often than not, and some emit
//! numbers with thousands separators that are not JSON at all. The parser
//! extracts the array, runs a lexical guard over it, and only then hands it to
//! serde.

use super::Decision;
use crate::errors::AiError;

pub fn parse_decisions(raw: &str) -> Result<Vec<Decision>, AiError> {
	let body = extract_array(raw)?;
	check_thousands_separators(body)?;
	serde_json::from_str::<Vec<Decision>>(body).map_err(|e| AiError::Malformed(e.to_string()))
}

/// Locate the decision array in the raw response, stripping markdown fences
/// and surrounding prose. The array must open with `[` and its first element,
/// if any, must be an object.
fn extract_array(raw: &str) -> Result<&str, AiError> {
	let mut text = raw.trim();

	// ```json ... ``` fences
	if let Some(start) = text.find("```") {
		let after = &text[start + 3..];
		let after = after.strip_prefix("json").unwrap_or(after);
		if let Some(end) = after.find("```") {
			text = after[..end].trim();
		}
	}

	let start = text.find('[').ok_or_else(|| {
		AiError::Malformed("response contains no decision array".to_string())
	})?;
	let end = text.rfind(']').filter(|end| *end > start).ok_or_else(|| {
		AiError::Malformed("decision array is not closed".to_string())
	})?;
	let body = &text[start..=end];

	match body[1..].trim_start().chars().next() {
		Some('{') | Some(']') => Ok(body),
		_ => Err(AiError::Malformed(
			"decision array must contain objects".to_string(),
		)),
	}
}

/// Reject thousands-separator commas outside string literals: a digit, a
/// comma, exactly three digits, then no further digit (`102,707`). Inside
/// string literals any comma is fine. Structural commas between JSON values
/// never match because object members resume with a quote and the forbidden
/// array-of-numbers shape is rejected before this pass.
fn check_thousands_separators(body: &str) -> Result<(), AiError> {
	let bytes = body.as_bytes();
	let mut in_string = false;
	let mut escaped = false;

	for i in 0..bytes.len() {
		let b = bytes[i];
		if in_string {
			if escaped {
				escaped = false;
			} else if b == b'\\' {
				escaped = true;
			} else if b == b'"' {
				in_string = false;
			}
			continue;
		}
		match b {
			b'"' => in_string = true,
			b',' => {
				let digit_before = i > 0 && bytes[i - 1].is_ascii_digit();
				let next = &bytes[i + 1..];
				let digits_after = next.iter().take_while(|b| b.is_ascii_digit()).count();
				if digit_before && digits_after == 3 {
					return Err(AiError::Malformed(format!(
						"thousands separator in number near byte {i}; \
						 numbers must not contain commas"
					)));
				}
			},
			_ => {},
		}
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::decision::DecisionAction;

	#[test]
	fn parses_plain_array() {
		let decisions = parse_decisions(
			r#"[{"symbol":"BTCUSDT","action":"open_long","leverage":10,
			    "position_size_usd":100,"stop_loss":49000,"take_profit":55000,
			    "reasoning":"breakout"}]"#,
		)
		.unwrap();
		assert_eq!(decisions.len(), 1);
		assert_eq!(decisions[0].action, DecisionAction::OpenLong);
		assert_eq!(decisions[0].leverage, 10.0);
	}

	#[test]
	fn parses_fenced_response_with_prose() {
		let raw = "Here is my analysis.\n```json\n[{\"symbol\":\"ETHUSDT\",\"action\":\"wait\",\"reasoning\":\"chop\"}]\n```\nGood luck!";
		let decisions = parse_decisions(raw).unwrap();
		assert_eq!(decisions[0].action, DecisionAction::Wait);
	}

	#[test]
	fn accepts_separators_inside_strings() {
		// The guard must not trip on the comma inside the reasoning string
		let raw = r#"[{"symbol":"BTCUSDT","action":"wait","reasoning":"价格不在精确入场范围(做多需≤102,707),期望值不足"}]"#;
		let decisions = parse_decisions(raw).unwrap();
		assert!(decisions[0].reasoning.contains("102,707"));
	}

	#[test]
	fn rejects_separators_in_numbers() {
		assert!(matches!(
			parse_decisions(r#"[{"symbol":"BTCUSDT","action":"wait","price":102,707}]"#),
			Err(AiError::Malformed(_))
		));
	}

	#[test]
	fn rejects_number_arrays() {
		assert!(parse_decisions("[1, 2, 3]").is_err());
	}

	#[test]
	fn rejects_leading_object() {
		assert!(parse_decisions(r#"{"symbol":"BTCUSDT","action":"wait"}"#).is_err());
	}

	#[test]
	fn rejects_range_operators() {
		assert!(parse_decisions(r#"[{"symbol":"BTCUSDT","action":"wait","price":100~200}]"#)
			.is_err());
	}

	#[test]
	fn rejects_unknown_actions() {
		assert!(parse_decisions(r#"[{"symbol":"BTCUSDT","action":"moon"}]"#).is_err());
	}

	#[test]
	fn unknown_fields_are_ignored() {
		let decisions = parse_decisions(
			r#"[{"symbol":"BTCUSDT","action":"wait","confidence":0.9,"extra":{"a":1}}]"#,
		)
		.unwrap();
		assert_eq!(decisions[0].action, DecisionAction::Wait);
	}

	#[test]
	fn empty_array_is_no_decisions() {
		assert!(parse_decisions("[]").unwrap().is_empty());
	}

	#[test]
	fn structural_commas_are_not_separators() {
		// Object members resume with quotes, never digits
		let decisions = parse_decisions(
			r#"[{"symbol":"BTCUSDT","action":"open_long","leverage":5,"position_size_usd":100,
			    "stop_loss":50,"take_profit":200},
			    {"symbol":"ETHUSDT","action":"wait"}]"#,
		)
		.unwrap();
		assert_eq!(decisions.len(), 2);
	}

	#[test]
	fn no_array_at_all() {
		assert!(parse_decisions("I would wait for a better entry.").is_err());
	}
}
