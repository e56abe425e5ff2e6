#![forbid(unsafe_code)]

//! IRC line parsing with IRCv3 message tags.
//!
//! Format: `[@tags SPACE] [:prefix SPACE] command [SPACE params] [SPACE :trailing]`.
//! Lines are parsed without the trailing CR-LF.

use std::collections::HashMap;

use crate::error::IrcParseError;

/// A parsed IRC line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrcMessage {
	/// Unescaped tag values; a tag without `=` maps to an empty string.
	pub tags: HashMap<String, String>,
	/// `nick!user@host` or a server name.
	pub prefix: Option<String>,
	pub command: String,
	/// The last entry may have been a trailing param (with spaces).
	pub params: Vec<String>,
}

impl IrcMessage {
	pub fn parse(input: &str) -> Result<Self, IrcParseError> {
		let input = input.trim_end_matches(['\r', '\n']);
		if input.is_empty() {
			return Err(IrcParseError::Empty);
		}

		let (tags, rest) = match input.strip_prefix('@') {
			Some(tagged) => {
				let Some((raw_tags, rest)) = tagged.split_once(' ') else {
					return Err(IrcParseError::UnterminatedTags);
				};
				(parse_tags(raw_tags), rest.trim_start_matches(' '))
			}
			None => (HashMap::new(), input),
		};

		let (prefix, rest) = match rest.strip_prefix(':') {
			Some(prefixed) => match prefixed.split_once(' ') {
				Some((prefix, rest)) => (Some(prefix.to_owned()), rest.trim_start_matches(' ')),
				None => return Err(IrcParseError::MissingCommand),
			},
			None => (None, rest),
		};

		let (command, param_str) = match rest.split_once(' ') {
			Some((command, params)) => (command, Some(params)),
			None => (rest, None),
		};
		if command.is_empty() {
			return Err(IrcParseError::MissingCommand);
		}

		let mut params = Vec::new();
		if let Some(mut remaining) = param_str {
			while !remaining.is_empty() {
				if let Some(trailing) = remaining.strip_prefix(':') {
					params.push(trailing.to_owned());
					break;
				}
				match remaining.split_once(' ') {
					Some((param, tail)) => {
						if !param.is_empty() {
							params.push(param.to_owned());
						}
						remaining = tail;
					}
					None => {
						params.push(remaining.to_owned());
						break;
					}
				}
			}
		}

		Ok(IrcMessage {
			tags,
			prefix,
			command: command.to_ascii_uppercase(),
			params,
		})
	}

	/// Tag value, treating an empty value as absent.
	pub fn tag(&self, key: &str) -> Option<&str> {
		self.tags.get(key).map(String::as_str).filter(|v| !v.is_empty())
	}

	/// Nick part of a `nick!user@host` prefix.
	pub fn nick(&self) -> Option<&str> {
		let prefix = self.prefix.as_deref()?;
		let nick = prefix.split(['!', '@']).next().unwrap_or(prefix);
		if nick.is_empty() { None } else { Some(nick) }
	}

	pub fn param(&self, idx: usize) -> Option<&str> {
		self.params.get(idx).map(String::as_str)
	}
}

fn parse_tags(raw: &str) -> HashMap<String, String> {
	raw.split(';')
		.filter(|kv| !kv.is_empty())
		.map(|kv| match kv.split_once('=') {
			Some((k, v)) => (k.to_owned(), unescape_tag_value(v)),
			None => (kv.to_owned(), String::new()),
		})
		.collect()
}

/// Undo IRCv3 tag escaping (`\:` `\s` `\\` `\r` `\n`).
pub fn unescape_tag_value(raw: &str) -> String {
	let mut out = String::with_capacity(raw.len());
	let mut chars = raw.chars();
	while let Some(c) = chars.next() {
		if c != '\\' {
			out.push(c);
			continue;
		}
		match chars.next() {
			Some(':') => out.push(';'),
			Some('s') => out.push(' '),
			Some('\\') => out.push('\\'),
			Some('r') => out.push('\r'),
			Some('n') => out.push('\n'),
			Some(other) => out.push(other),
			None => {}
		}
	}
	out
}
