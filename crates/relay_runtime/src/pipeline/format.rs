#![forbid(unsafe_code)]

//! Text helpers shared by the message pipeline and moderation notices.

/// Longest embed description accepted by the delivery target.
pub const MAX_DESCRIPTION_CHARS: usize = 4_096;

fn plural(n: u64) -> &'static str {
	if n == 1 { "" } else { "s" }
}

/// Render a timeout length as English, e.g. `8 hours, 30 minutes and 12 seconds`.
pub fn format_duration(total_secs: u64) -> String {
	let hours = total_secs / 3_600;
	let minutes = (total_secs / 60) % 60;
	let seconds = total_secs % 60;

	let parts: Vec<String> = [(hours, "hour"), (minutes, "minute"), (seconds, "second")]
		.into_iter()
		.filter(|(n, _)| *n != 0)
		.map(|(n, unit)| format!("{n} {unit}{}", plural(n)))
		.collect();

	match parts.as_slice() {
		[] => "0 seconds".to_string(),
		[one] => one.clone(),
		[head @ .., last] => format!("{} and {last}", head.join(", ")),
	}
}

/// `chris` -> `chris'`, `alice` -> `alice's`.
pub fn possessive(name: &str) -> String {
	if name.is_empty() {
		String::new()
	} else if name.ends_with('s') {
		format!("{name}'")
	} else {
		format!("{name}'s")
	}
}

/// Display names outside printable ASCII get the login appended.
pub fn normalize_display(display: &str, login: &str) -> String {
	if display.chars().all(|c| ('\u{20}'..='\u{7f}').contains(&c)) {
		display.to_string()
	} else {
		format!("{display} ({login})")
	}
}

/// Drop the `@` of broadcast mentions so they render as plain words.
pub fn strip_broad_mentions(text: &str) -> String {
	text.replace("@everyone", "everyone").replace("@here", "here")
}

/// Apply `lookup` to every space-separated token, leaving spacing intact.
pub fn substitute_tokens(text: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
	text.split(' ')
		.map(|tok| lookup(tok).unwrap_or_else(|| tok.to_string()))
		.collect::<Vec<_>>()
		.join(" ")
}

/// Split newline-joined lines into descriptions of at most `limit` chars.
///
/// A single line longer than the limit is cut at a char boundary.
pub fn chunk_lines(lines: &[String], limit: usize) -> Vec<String> {
	let limit = limit.max(1);
	let mut chunks = Vec::new();
	let mut current = String::new();
	let mut current_len = 0usize;

	for line in lines {
		let mut rest: &str = line;
		loop {
			let line_len = rest.chars().count();
			let sep = usize::from(current_len > 0);
			if current_len + sep + line_len <= limit {
				if sep == 1 {
					current.push('\n');
				}
				current.push_str(rest);
				current_len += sep + line_len;
				break;
			}
			if current_len > 0 {
				chunks.push(std::mem::take(&mut current));
				current_len = 0;
				continue;
			}
			let cut = rest.char_indices().nth(limit).map(|(i, _)| i).unwrap_or(rest.len());
			chunks.push(rest[..cut].to_string());
			rest = &rest[cut..];
			if rest.is_empty() {
				break;
			}
		}
	}

	if current_len > 0 {
		chunks.push(current);
	}
	chunks
}
