#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use multitwitch_platform::{DEFAULT_IRC_WS_URL, PoolConfig, SecretString};
use multitwitch_protocol::DEFAULT_MAX_EVENT_SIZE;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::server::history::HistoryConfig;
use crate::server::room_hub::ChannelHubConfig;

/// Default client-facing bind endpoint.
pub const DEFAULT_BIND: &str = "ws://127.0.0.1:5001";

/// Default config path: `~/.multitwitch/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".multitwitch").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub chat: ChatSettings,
	pub fanout: FanoutSettings,
}

/// Client-facing listener settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// `ws://host:port` endpoint for browser sessions.
	pub bind: String,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// Accepted `Origin` header values. Empty accepts any origin.
	pub allowed_origins: Vec<String>,
	/// Largest accepted or emitted socket frame, in bytes.
	pub max_event_bytes: usize,
}

/// Chat network settings.
#[derive(Debug, Clone)]
pub struct ChatSettings {
	pub irc_ws_url: String,
	/// Login nick. Anonymous `justinfanNNNNN` when absent.
	pub nick: Option<String>,
	pub oauth_token: Option<SecretString>,
	pub ack_timeout: Duration,
	pub handshake_timeout: Duration,
	pub reconnect_min_delay: Duration,
	pub reconnect_max_delay: Duration,
	pub ping_interval: Duration,
	/// Dev-only: serve synthetic chat from the in-process loopback transport.
	pub demo_chat: bool,
}

#[derive(Debug, Clone)]
pub struct FanoutSettings {
	pub subscriber_queue_capacity: usize,
	pub history_capacity: usize,
	pub history_retention_secs: Option<u64>,
	pub reconcile_interval: Duration,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self::from_file(FileConfig::default())
	}
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let pool_defaults = PoolConfig::default();

		let server = ServerSettings {
			bind: file
				.server
				.bind
				.filter(|s| !s.trim().is_empty())
				.unwrap_or_else(|| DEFAULT_BIND.to_string()),
			metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
			health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
			allowed_origins: file
				.server
				.allowed_origins
				.into_iter()
				.map(|o| o.trim().to_string())
				.filter(|o| !o.is_empty())
				.collect(),
			max_event_bytes: file
				.server
				.max_event_bytes
				.filter(|v| *v > 0)
				.unwrap_or(DEFAULT_MAX_EVENT_SIZE),
		};

		let chat = ChatSettings {
			irc_ws_url: file
				.chat
				.irc_ws_url
				.filter(|s| !s.trim().is_empty())
				.unwrap_or_else(|| DEFAULT_IRC_WS_URL.to_string()),
			nick: file.chat.nick.filter(|s| !s.trim().is_empty()),
			oauth_token: file.chat.oauth_token.filter(|s| !s.trim().is_empty()).map(SecretString::new),
			ack_timeout: file
				.chat
				.ack_timeout_ms
				.map(Duration::from_millis)
				.unwrap_or(pool_defaults.ack_timeout),
			handshake_timeout: file
				.chat
				.handshake_timeout_ms
				.map(Duration::from_millis)
				.unwrap_or(pool_defaults.handshake_timeout),
			reconnect_min_delay: file
				.chat
				.reconnect_min_delay_ms
				.map(Duration::from_millis)
				.unwrap_or(pool_defaults.reconnect_min_delay),
			reconnect_max_delay: file
				.chat
				.reconnect_max_delay_ms
				.map(Duration::from_millis)
				.unwrap_or(pool_defaults.reconnect_max_delay),
			ping_interval: file
				.chat
				.ping_interval_secs
				.filter(|v| *v > 0)
				.map(Duration::from_secs)
				.unwrap_or(pool_defaults.ping_interval),
			demo_chat: false,
		};

		let hub_defaults = ChannelHubConfig::default();
		let history_defaults = HistoryConfig::default();
		let fanout = FanoutSettings {
			subscriber_queue_capacity: file
				.fanout
				.subscriber_queue_capacity
				.filter(|v| *v > 0)
				.unwrap_or(hub_defaults.subscriber_queue_capacity),
			history_capacity: file
				.fanout
				.history_capacity
				.unwrap_or(history_defaults.per_channel_capacity),
			history_retention_secs: file.fanout.history_retention_secs.filter(|v| *v > 0),
			reconcile_interval: Duration::from_secs(file.fanout.reconcile_interval_secs.filter(|v| *v > 0).unwrap_or(30)),
		};

		Self { server, chat, fanout }
	}

	/// Pool settings derived from `[chat]`.
	pub fn pool_config(&self) -> PoolConfig {
		PoolConfig {
			nick: self.chat.nick.clone(),
			oauth_token: self.chat.oauth_token.clone(),
			ack_timeout: self.chat.ack_timeout,
			handshake_timeout: self.chat.handshake_timeout,
			reconnect_min_delay: self.chat.reconnect_min_delay,
			reconnect_max_delay: self.chat.reconnect_max_delay,
			ping_interval: self.chat.ping_interval,
			..PoolConfig::default()
		}
	}

	pub fn hub_config(&self) -> ChannelHubConfig {
		ChannelHubConfig {
			subscriber_queue_capacity: self.fanout.subscriber_queue_capacity,
			..ChannelHubConfig::default()
		}
	}

	pub fn history_config(&self) -> HistoryConfig {
		HistoryConfig {
			per_channel_capacity: self.fanout.history_capacity,
			retention_secs: self.fanout.history_retention_secs,
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	chat: FileChatSettings,

	#[serde(default)]
	fanout: FileFanoutSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	bind: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	#[serde(default)]
	allowed_origins: Vec<String>,
	max_event_bytes: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileChatSettings {
	irc_ws_url: Option<String>,
	nick: Option<String>,
	oauth_token: Option<String>,
	ack_timeout_ms: Option<u64>,
	handshake_timeout_ms: Option<u64>,
	reconnect_min_delay_ms: Option<u64>,
	reconnect_max_delay_ms: Option<u64>,
	ping_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileFanoutSettings {
	subscriber_queue_capacity: Option<usize>,
	history_capacity: Option<usize>,
	history_retention_secs: Option<u64>,
	reconcile_interval_secs: Option<u64>,
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => parse_toml(&s).map(Some),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn parse_toml(s: &str) -> anyhow::Result<FileConfig> {
	toml::from_str(s).context("parse TOML")
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("MULTITWITCH_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.bind = v;
			info!("server config: bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("MULTITWITCH_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("MULTITWITCH_HEALTH_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.health_bind = Some(v);
			info!("server config: health_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("MULTITWITCH_ALLOWED_ORIGINS") {
		cfg.server.allowed_origins = v
			.split(',')
			.map(|o| o.trim().to_string())
			.filter(|o| !o.is_empty())
			.collect();
		info!(
			origins = cfg.server.allowed_origins.len(),
			"server config: allowed_origins overridden by env"
		);
	}

	if let Ok(v) = std::env::var("MULTITWITCH_IRC_WS_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.chat.irc_ws_url = v;
			info!("chat config: irc_ws_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("MULTITWITCH_NICK") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.chat.nick = Some(v);
			info!("chat config: nick overridden by env");
		}
	}

	if let Ok(v) = std::env::var("MULTITWITCH_OAUTH_TOKEN") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.chat.oauth_token = Some(SecretString::new(v));
			info!("chat config: oauth_token overridden by env");
		}
	}

	if let Ok(v) = std::env::var("MULTITWITCH_ACK_TIMEOUT_MS")
		&& let Ok(ms) = v.trim().parse::<u64>()
	{
		cfg.chat.ack_timeout = Duration::from_millis(ms);
		info!(ms, "chat config: ack_timeout overridden by env");
	}

	if let Ok(v) = std::env::var("MULTITWITCH_RECONNECT_MIN_DELAY_MS")
		&& let Ok(ms) = v.trim().parse::<u64>()
	{
		cfg.chat.reconnect_min_delay = Duration::from_millis(ms);
		debug!("chat config: reconnect_min_delay overridden by env");
	}

	if let Ok(v) = std::env::var("MULTITWITCH_RECONNECT_MAX_DELAY_MS")
		&& let Ok(ms) = v.trim().parse::<u64>()
	{
		cfg.chat.reconnect_max_delay = Duration::from_millis(ms);
		debug!("chat config: reconnect_max_delay overridden by env");
	}

	if let Ok(v) = std::env::var("MULTITWITCH_HISTORY_CAPACITY")
		&& let Ok(capacity) = v.trim().parse::<usize>()
	{
		cfg.fanout.history_capacity = capacity;
		info!(capacity, "fanout config: history_capacity overridden by env");
	}

	if let Ok(v) = std::env::var("MULTITWITCH_ENABLE_DEMO_CHAT")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		if cfg!(debug_assertions) {
			cfg.chat.demo_chat = enabled;
			info!(enabled, "chat config: demo_chat overridden by env");
		} else {
			warn!("chat config: MULTITWITCH_ENABLE_DEMO_CHAT ignored in release builds");
		}
	}

	if cfg.chat.nick.is_some() && cfg.chat.oauth_token.is_none() {
		warn!("chat config: nick set without oauth_token; the chat network will refuse the login");
	}

	normalize_reconnect_bounds(&mut cfg.chat);
}

fn normalize_reconnect_bounds(chat: &mut ChatSettings) {
	if chat.reconnect_min_delay > chat.reconnect_max_delay {
		warn!(
			min_ms = chat.reconnect_min_delay.as_millis(),
			max_ms = chat.reconnect_max_delay.as_millis(),
			"chat config: reconnect_min_delay > reconnect_max_delay; swapping"
		);
		std::mem::swap(&mut chat.reconnect_min_delay, &mut chat.reconnect_max_delay);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_file_yields_defaults() {
		let cfg = ServerConfig::from_file(parse_toml("").unwrap());
		assert_eq!(cfg.server.bind, DEFAULT_BIND);
		assert_eq!(cfg.server.max_event_bytes, DEFAULT_MAX_EVENT_SIZE);
		assert!(cfg.server.allowed_origins.is_empty());
		assert_eq!(cfg.chat.irc_ws_url, DEFAULT_IRC_WS_URL);
		assert!(cfg.chat.nick.is_none());
		assert_eq!(cfg.chat.ack_timeout, Duration::from_secs(10));
		assert_eq!(cfg.chat.reconnect_min_delay, Duration::from_millis(500));
		assert_eq!(cfg.chat.reconnect_max_delay, Duration::from_secs(30));
		assert_eq!(cfg.fanout.subscriber_queue_capacity, 1024);
		assert_eq!(cfg.fanout.history_capacity, 100);
		assert_eq!(cfg.fanout.reconcile_interval, Duration::from_secs(30));
		assert!(!cfg.chat.demo_chat);
	}

	#[test]
	fn file_values_are_applied() {
		let cfg = ServerConfig::from_file(
			parse_toml(
				r#"
[server]
bind = "ws://0.0.0.0:6000"
health_bind = "127.0.0.1:9100"
allowed_origins = ["http://localhost:3000", "  "]

[chat]
nick = "watcher"
oauth_token = "abc"
ack_timeout_ms = 2500
ping_interval_secs = 0

[fanout]
history_capacity = 0
history_retention_secs = 600
"#,
			)
			.unwrap(),
		);

		assert_eq!(cfg.server.bind, "ws://0.0.0.0:6000");
		assert_eq!(cfg.server.health_bind.as_deref(), Some("127.0.0.1:9100"));
		assert_eq!(cfg.server.allowed_origins, vec!["http://localhost:3000".to_string()]);
		assert_eq!(cfg.chat.nick.as_deref(), Some("watcher"));
		assert_eq!(cfg.chat.oauth_token.as_ref().map(|t| t.expose()), Some("abc"));
		assert_eq!(cfg.chat.ack_timeout, Duration::from_millis(2500));
		assert_eq!(cfg.chat.ping_interval, Duration::from_secs(60));
		assert_eq!(cfg.fanout.history_capacity, 0);
		assert_eq!(cfg.fanout.history_retention_secs, Some(600));

		let pool = cfg.pool_config();
		assert_eq!(pool.nick.as_deref(), Some("watcher"));
		assert_eq!(pool.ack_timeout, Duration::from_millis(2500));
	}

	#[test]
	fn unknown_toml_shape_is_an_error() {
		assert!(parse_toml("[chat]\nack_timeout_ms = \"soon\"").is_err());
	}

	#[test]
	fn inverted_reconnect_bounds_are_swapped() {
		let mut cfg = ServerConfig::default();
		cfg.chat.reconnect_min_delay = Duration::from_secs(60);
		cfg.chat.reconnect_max_delay = Duration::from_secs(1);
		normalize_reconnect_bounds(&mut cfg.chat);
		assert_eq!(cfg.chat.reconnect_min_delay, Duration::from_secs(1));
		assert_eq!(cfg.chat.reconnect_max_delay, Duration::from_secs(60));
	}

	#[test]
	fn env_bool_accepts_common_spellings() {
		assert_eq!(parse_env_bool(" Yes "), Some(true));
		assert_eq!(parse_env_bool("off"), Some(false));
		assert_eq!(parse_env_bool("maybe"), None);
	}

	#[test]
	fn missing_file_is_not_an_error() {
		let path = std::env::temp_dir().join(format!("multitwitch-missing-{}.toml", std::process::id()));
		assert!(read_toml_if_exists(&path).unwrap().is_none());
	}
}
