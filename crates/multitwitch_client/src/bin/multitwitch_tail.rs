#![forbid(unsafe_code)]

use multitwitch_client::{ChatClient, ClientConfig, DEFAULT_SERVER_ENDPOINT};
use multitwitch_domain::ChatStatusKind;
use multitwitch_protocol::ServerEvent;
use tracing::{info, warn};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: multitwitch_tail [--connect ws://host:port] --channel name [--channel name]...\n\
\n\
Options:\n\
	--connect   Server endpoint (alias: --endpoint) (default: ws://127.0.0.1:5001)\n\
	            Format: ws://host:port or wss://host:port\n\
	--endpoint  Alias for --connect\n\
	--channel   Channel to follow (repeatable)\n\
	--help      Show this help\n\
\n\
Examples:\n\
	multitwitch_tail --channel shroud\n\
	multitwitch_tail --connect ws://10.0.0.5:5001 --channel a --channel b\n"
	);
	std::process::exit(2)
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,multitwitch_client=debug".to_string());
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_target(false)
		.with_writer(std::io::stderr)
		.init();
}

fn parse_args() -> (String, Vec<String>) {
	let mut endpoint = DEFAULT_SERVER_ENDPOINT.to_string();
	let mut channels: Vec<String> = Vec::new();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--connect" | "--endpoint" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--connect must be non-empty (expected ws://host:port)");
					usage_and_exit();
				}
				endpoint = v;
			}
			"--channel" => {
				let c = it.next().unwrap_or_else(|| usage_and_exit());
				if c.trim().is_empty() {
					eprintln!("--channel must be non-empty");
					usage_and_exit();
				}
				channels.push(c);
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	if channels.is_empty() {
		eprintln!("at least one --channel is required");
		usage_and_exit();
	}

	(endpoint, channels)
}

fn print_event(event: &ServerEvent) {
	match event {
		ServerEvent::ChatMessage(m) => println!("[{}] {}: {}", m.channel, m.username, m.text),
		ServerEvent::ChatHistory { channel, messages } => {
			for m in messages {
				println!("[{channel}] {}: {}", m.username, m.text);
			}
		}
		ServerEvent::ChatStatus {
			channel,
			status,
			message,
		} => match status {
			ChatStatusKind::Connected | ChatStatusKind::Disconnected => println!("* [{channel}] {message}"),
			ChatStatusKind::Failed | ChatStatusKind::Error => println!("! [{channel}] {status}: {message}"),
		},
		ServerEvent::ChatLagged { dropped } => warn!(dropped, "server dropped messages for this session"),
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();
	let (endpoint, channels) = parse_args();

	info!(server = %endpoint, channels = ?channels, "connecting");
	let mut client = ChatClient::connect_with(ClientConfig::from_endpoint(endpoint)).await?;
	for channel in &channels {
		client.join(channel).await?;
	}

	loop {
		tokio::select! {
			next = client.next_event() => match next? {
				Some(event) => print_event(&event),
				None => {
					info!("server closed the session");
					return Ok(());
				}
			},
			_ = tokio::signal::ctrl_c() => {
				info!("interrupted; leaving channels");
				break;
			}
		}
	}

	for channel in &channels {
		client.leave(channel).await?;
	}
	client.close().await?;
	Ok(())
}
