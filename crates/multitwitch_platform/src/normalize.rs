#![forbid(unsafe_code)]

//! Raw PRIVMSG → `ChatMessage`. Pure: no I/O, no clock reads.

use multitwitch_domain::{Badge, ChannelName, CharRange, ChatMessage, EmoteOccurrence, MessageFlags};

use crate::error::MalformedMessage;
use crate::irc::IrcMessage;

/// Colors handed out to users who never picked one.
pub const FALLBACK_PALETTE: [&str; 12] = [
	"#FF6B6B", "#4ECDC4", "#45B7D1", "#96CEB4", "#FECA57", "#FF9FF3", "#54A0FF", "#5F27CD", "#00D2D3", "#FF9F43",
	"#10AC84", "#EE5A24",
];

const ACTION_PREFIX: &str = "\u{1}ACTION ";

/// Build a `ChatMessage` from a tagged PRIVMSG. `now_ms` is used when the line
/// carries no `tmi-sent-ts`.
pub fn normalize_privmsg(msg: &IrcMessage, now_ms: i64) -> Result<ChatMessage, MalformedMessage> {
	if msg.command != "PRIVMSG" {
		return Err(MalformedMessage::UnexpectedCommand(msg.command.clone()));
	}

	let channel = ChannelName::new(msg.param(0).ok_or(MalformedMessage::MissingChannel)?)?;
	let raw_text = msg.param(1).ok_or(MalformedMessage::MissingText)?;
	let text = strip_action(raw_text);
	if text.trim().is_empty() {
		return Err(MalformedMessage::MissingText);
	}

	let login = msg
		.nick()
		.or_else(|| msg.tag("login"))
		.ok_or(MalformedMessage::MissingSender)?
		.to_ascii_lowercase();

	let username = msg
		.tag("display-name")
		.map(str::trim)
		.filter(|s| !s.is_empty())
		.unwrap_or(login.as_str())
		.to_string();

	let color = msg
		.tag("color")
		.map(str::to_string)
		.unwrap_or_else(|| derive_color(&login).to_string());

	let badges = parse_badges(msg.tag("badges").unwrap_or_default());
	let emotes = parse_emotes(msg.tag("emotes").unwrap_or_default());

	let sent_at_ms = msg
		.tag("tmi-sent-ts")
		.and_then(|ts| ts.parse::<i64>().ok())
		.unwrap_or(now_ms);

	let flags = MessageFlags {
		is_subscriber: msg.tag("subscriber") == Some("1"),
		is_moderator: msg.tag("mod") == Some("1"),
		is_vip: msg.tag("vip") == Some("1") || badges.iter().any(|b| b.name == "vip"),
	};

	let user_type = msg.tag("user-type").unwrap_or("viewer").to_string();

	let id = msg
		.tag("id")
		.map(str::to_string)
		.unwrap_or_else(|| fallback_id(&channel, &login, sent_at_ms, text));

	Ok(ChatMessage {
		id,
		channel,
		username,
		login,
		text: text.to_string(),
		color,
		badges,
		emotes,
		sent_at_ms,
		flags,
		user_type,
	})
}

fn strip_action(text: &str) -> &str {
	match text.strip_prefix(ACTION_PREFIX) {
		Some(rest) => rest.strip_suffix('\u{1}').unwrap_or(rest),
		None => text,
	}
}

/// Stable palette color for a login. Case-insensitive.
pub fn derive_color(login: &str) -> &'static str {
	let hash = fnv1a_64(login.to_ascii_lowercase().as_bytes());
	FALLBACK_PALETTE[(hash % FALLBACK_PALETTE.len() as u64) as usize]
}

/// `subscriber/12,premium/1` → `[{subscriber,12}, {premium,1}]`.
pub fn parse_badges(raw: &str) -> Vec<Badge> {
	raw.split(',')
		.filter(|entry| !entry.is_empty())
		.map(|entry| {
			let (name, version) = entry.split_once('/').unwrap_or((entry, ""));
			Badge {
				name: name.to_string(),
				version: version.to_string(),
			}
		})
		.filter(|b| !b.name.is_empty())
		.collect()
}

/// `25:0-4,12-16/1902:6-10` → one entry per emote id, ranges kept in tag order.
///
/// Repeated ids are merged into the first entry. Unparseable ranges are skipped.
pub fn parse_emotes(raw: &str) -> Vec<EmoteOccurrence> {
	let mut out: Vec<EmoteOccurrence> = Vec::new();

	for group in raw.split('/').filter(|g| !g.is_empty()) {
		let Some((id, ranges)) = group.split_once(':') else {
			continue;
		};
		if id.is_empty() {
			continue;
		}

		let parsed = ranges.split(',').filter_map(parse_range);
		match out.iter_mut().find(|e| e.id == id) {
			Some(existing) => existing.ranges.extend(parsed),
			None => {
				let ranges: Vec<CharRange> = parsed.collect();
				if !ranges.is_empty() {
					out.push(EmoteOccurrence {
						id: id.to_string(),
						ranges,
					});
				}
			}
		}
	}

	out
}

fn parse_range(raw: &str) -> Option<CharRange> {
	let (start, end) = raw.split_once('-')?;
	let start = start.trim().parse::<u32>().ok()?;
	let end = end.trim().parse::<u32>().ok()?;
	(start <= end).then_some(CharRange { start, end })
}

fn fallback_id(channel: &ChannelName, login: &str, sent_at_ms: i64, text: &str) -> String {
	let mut bytes = Vec::with_capacity(channel.as_str().len() + login.len() + text.len() + 24);
	bytes.extend_from_slice(channel.as_str().as_bytes());
	bytes.push(0);
	bytes.extend_from_slice(login.as_bytes());
	bytes.push(0);
	bytes.extend_from_slice(&sent_at_ms.to_be_bytes());
	bytes.extend_from_slice(text.as_bytes());
	format!("local-{:016x}", fnv1a_64(&bytes))
}

fn fnv1a_64(bytes: &[u8]) -> u64 {
	const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
	const PRIME: u64 = 0x0000_0100_0000_01b3;
	bytes.iter().fold(OFFSET, |hash, b| (hash ^ u64::from(*b)).wrapping_mul(PRIME))
}

#[cfg(test)]
mod tests {
	use proptest::prelude::*;

	use super::*;

	const NOW: i64 = 1_700_000_000_000;

	fn privmsg(tags: &str, nick: &str, channel: &str, text: &str) -> IrcMessage {
		let line = format!("@{tags} :{nick}!{nick}@{nick}.tmi.twitch.tv PRIVMSG #{channel} :{text}");
		IrcMessage::parse(&line).unwrap()
	}

	#[test]
	fn full_tag_set() {
		let msg = privmsg(
			"badge-info=subscriber/14;badges=moderator/1,subscriber/12;color=#0D4200;display-name=Ronni;emotes=25:0-4,12-16/1902:6-10;id=abc-123;mod=1;subscriber=1;tmi-sent-ts=1507246572675;user-type=mod",
			"ronni",
			"Dallas",
			"Kappa Keepo Kappa",
		);
		let out = normalize_privmsg(&msg, NOW).unwrap();

		assert_eq!(out.id, "abc-123");
		assert_eq!(out.channel.as_str(), "dallas");
		assert_eq!(out.username, "Ronni");
		assert_eq!(out.login, "ronni");
		assert_eq!(out.text, "Kappa Keepo Kappa");
		assert_eq!(out.color, "#0D4200");
		assert_eq!(out.sent_at_ms, 1_507_246_572_675);
		assert_eq!(out.user_type, "mod");
		assert!(out.flags.is_moderator && out.flags.is_subscriber && !out.flags.is_vip);
		assert_eq!(
			out.badges,
			vec![
				Badge {
					name: "moderator".into(),
					version: "1".into()
				},
				Badge {
					name: "subscriber".into(),
					version: "12".into()
				},
			]
		);
		assert_eq!(out.emotes.len(), 2);
		assert_eq!(out.emotes[0].id, "25");
		assert_eq!(out.emotes[1].ranges, vec![CharRange { start: 6, end: 10 }]);
	}

	#[test]
	fn emote_ranges_for_one_id_stay_together() {
		let emotes = parse_emotes("25:0-4,10-14");
		assert_eq!(emotes.len(), 1);
		assert_eq!(emotes[0].id, "25");
		assert_eq!(
			emotes[0].ranges,
			vec![CharRange { start: 0, end: 4 }, CharRange { start: 10, end: 14 }]
		);
	}

	#[test]
	fn repeated_emote_groups_merge() {
		let emotes = parse_emotes("25:0-4/1902:6-10/25:12-16");
		assert_eq!(emotes.len(), 2);
		assert_eq!(emotes[0].ranges.len(), 2);
		assert_eq!(emotes[0].ranges[1], CharRange { start: 12, end: 16 });
	}

	#[test]
	fn bad_emote_ranges_are_skipped() {
		assert!(parse_emotes("").is_empty());
		assert!(parse_emotes("25").is_empty());
		assert!(parse_emotes(":0-4").is_empty());
		let emotes = parse_emotes("25:4-0,x-y,0-4");
		assert_eq!(emotes[0].ranges, vec![CharRange { start: 0, end: 4 }]);
	}

	#[test]
	fn badges_edge_cases() {
		assert!(parse_badges("").is_empty());
		assert_eq!(parse_badges("premium").len(), 1);
		assert_eq!(parse_badges("premium")[0].version, "");
		assert_eq!(parse_badges("vip/1,,bits/100").len(), 2);
	}

	#[test]
	fn same_login_same_color() {
		let a = normalize_privmsg(&privmsg("id=1", "someone", "foo", "hi"), NOW).unwrap();
		let b = normalize_privmsg(&privmsg("id=2", "someone", "bar", "other text"), NOW + 5).unwrap();
		assert_eq!(a.color, b.color);
		assert!(FALLBACK_PALETTE.contains(&a.color.as_str()));
		assert_eq!(derive_color("SomeOne"), derive_color("someone"));
	}

	#[test]
	fn display_name_falls_back_to_login() {
		let out = normalize_privmsg(&privmsg("display-name=;id=1", "lurker", "foo", "hello"), NOW).unwrap();
		assert_eq!(out.username, "lurker");
		assert_eq!(out.user_type, "viewer");
	}

	#[test]
	fn missing_timestamp_uses_now() {
		let out = normalize_privmsg(&privmsg("id=1;tmi-sent-ts=garbage", "a", "foo", "hello"), NOW).unwrap();
		assert_eq!(out.sent_at_ms, NOW);
	}

	#[test]
	fn missing_id_is_deterministic() {
		let m = privmsg("tmi-sent-ts=5", "a", "foo", "hello");
		let first = normalize_privmsg(&m, NOW).unwrap();
		let second = normalize_privmsg(&m, NOW + 1000).unwrap();
		assert!(first.id.starts_with("local-"));
		assert_eq!(first.id, second.id);

		let other = normalize_privmsg(&privmsg("tmi-sent-ts=5", "a", "foo", "hello!"), NOW).unwrap();
		assert_ne!(first.id, other.id);
	}

	#[test]
	fn action_wrapper_is_stripped() {
		let out = normalize_privmsg(&privmsg("id=1", "a", "foo", "\u{1}ACTION waves\u{1}"), NOW).unwrap();
		assert_eq!(out.text, "waves");
	}

	#[test]
	fn vip_from_badge() {
		let out = normalize_privmsg(&privmsg("id=1;badges=vip/1", "a", "foo", "hi"), NOW).unwrap();
		assert!(out.flags.is_vip);
	}

	#[test]
	fn malformed_inputs() {
		let not_privmsg = IrcMessage::parse(":a!a@a JOIN #foo").unwrap();
		assert_eq!(
			normalize_privmsg(&not_privmsg, NOW),
			Err(MalformedMessage::UnexpectedCommand("JOIN".into()))
		);

		let no_text = IrcMessage::parse(":a!a@a PRIVMSG #foo").unwrap();
		assert_eq!(normalize_privmsg(&no_text, NOW), Err(MalformedMessage::MissingText));

		let no_channel = IrcMessage::parse(":a!a@a PRIVMSG").unwrap();
		assert_eq!(normalize_privmsg(&no_channel, NOW), Err(MalformedMessage::MissingChannel));

		let no_sender = IrcMessage::parse("PRIVMSG #foo :hi").unwrap();
		assert_eq!(normalize_privmsg(&no_sender, NOW), Err(MalformedMessage::MissingSender));

		let bad_channel = IrcMessage::parse(":a!a@a PRIVMSG #fo.o :hi").unwrap();
		assert!(matches!(
			normalize_privmsg(&bad_channel, NOW),
			Err(MalformedMessage::InvalidChannel(_))
		));
	}

	proptest! {
		#[test]
		fn emote_parser_keeps_every_valid_range(ranges in proptest::collection::vec((0u32..500, 0u32..20), 1..8)) {
			let tag = ranges
				.iter()
				.map(|(start, len)| format!("{}-{}", start, start + len))
				.collect::<Vec<_>>()
				.join(",");
			let parsed = parse_emotes(&format!("88:{tag}"));
			prop_assert_eq!(parsed.len(), 1);
			prop_assert_eq!(parsed[0].ranges.len(), ranges.len());
		}

		#[test]
		fn derived_color_is_pure(login in "[a-z0-9_]{1,25}") {
			prop_assert_eq!(derive_color(&login), derive_color(&login));
		}
	}
}
