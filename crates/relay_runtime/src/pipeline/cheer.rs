#![forbid(unsafe_code)]

use std::collections::HashSet;

/// Shown instead of a message made only of cheer tokens.
pub const EMPTY_PLACEHOLDER: &str = "`Empty message`";

/// `Cheer100` -> `Some(("cheer", 100))`.
fn split_cheer_token(token: &str) -> Option<(String, u64)> {
	let digits_at = token.find(|c: char| c.is_ascii_digit())?;
	let (prefix, amount) = token.split_at(digits_at);
	if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_alphabetic()) {
		return None;
	}
	let amount = amount.parse::<u64>().ok()?;
	Some((prefix.to_ascii_lowercase(), amount))
}

/// Remove cheer tokens whose prefix is a known cheermote.
///
/// `prefixes` must be lowercase. The surviving words are re-joined with
/// single spaces; a message with nothing left becomes [`EMPTY_PLACEHOLDER`].
pub fn strip_cheer_tokens(text: &str, prefixes: &HashSet<String>) -> String {
	let kept: Vec<&str> = text
		.split_whitespace()
		.filter(|tok| !split_cheer_token(tok).is_some_and(|(prefix, _)| prefixes.contains(&prefix)))
		.collect();

	if kept.is_empty() {
		EMPTY_PLACEHOLDER.to_string()
	} else {
		kept.join(" ")
	}
}
