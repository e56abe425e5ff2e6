#![forbid(unsafe_code)]

mod config;
mod server;
mod util;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use multitwitch_platform::{ConnectionPool, IrcConnector, LoopbackConnector, WsIrcConnector};
use multitwitch_protocol::version::{PROTOCOL_MAJOR, PROTOCOL_MINOR};
use multitwitch_util::endpoint::parse_bind_endpoint;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::server::connection::{ConnectionSettings, run_accept_loop};
use crate::server::health::{HealthState, bind_health_server};
use crate::server::history::RecentHistory;
use crate::server::lifecycle::SubscriptionManager;
use crate::server::room_hub::ChannelHub;
use crate::server::router::{RouterConfig, spawn_ingest_router};

/// Demo chat cadence per joined channel.
const DEMO_MESSAGE_INTERVAL: Duration = Duration::from_millis(1500);

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: multitwitch_server [--bind ws://host:port] [--config path]\n\
\n\
Options:\n\
\t--bind    Bind endpoint (default: ws://127.0.0.1:5001)\n\
\t         Format: ws://host:port\n\
\t--config  Config file (default: ~/.multitwitch/config.toml)\n\
\t--help   Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	bind: Option<String>,
	config: Option<PathBuf>,
}

fn parse_args() -> Args {
	let mut args = Args {
		bind: None,
		config: None,
	};

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected ws://host:port)");
					usage_and_exit();
				}
				args.bind = Some(v);
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				args.config = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,multitwitch_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("multitwitch_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

fn build_connector(chat: &config::ChatSettings) -> anyhow::Result<Arc<dyn IrcConnector>> {
	if chat.demo_chat {
		info!("starting dev-only demo chat (enabled by env)");
		return Ok(Arc::new(LoopbackConnector::new().with_demo_messages(DEMO_MESSAGE_INTERVAL)));
	}
	let connector = WsIrcConnector::parse(&chat.irc_ws_url)?;
	info!(endpoint = %connector.describe(), "chat network endpoint");
	Ok(Arc::new(connector))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let args = parse_args();

	let config_path = match args.config {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let mut server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");
	if let Some(bind) = args.bind {
		server_cfg.server.bind = bind;
	}

	let bind_addr = parse_bind_endpoint(&server_cfg.server.bind).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let health_state = HealthState::new();
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => match bind_health_server(addr, health_state.clone()).await {
				Ok(local) => info!(addr = %local, "health server listening"),
				Err(e) => warn!(error = %e, %addr, "failed to start health server"),
			},
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let connector = build_connector(&server_cfg.chat)?;
	let pool = ConnectionPool::start(server_cfg.pool_config(), connector);
	let hub = ChannelHub::new(server_cfg.hub_config());
	let history = RecentHistory::new(server_cfg.history_config());
	let _router = spawn_ingest_router(&pool, hub.clone(), history.clone(), RouterConfig::default());

	let manager = SubscriptionManager::new(pool.clone(), hub, history);
	let _pool_watcher = manager.spawn_pool_watcher();
	let _reconciler = manager.spawn_reconciler(server_cfg.fanout.reconcile_interval);

	let listener = TcpListener::bind(bind_addr)
		.await
		.with_context(|| format!("bind {bind_addr}"))?;
	let protocol = format!("{PROTOCOL_MAJOR}.{PROTOCOL_MINOR}");
	info!(
		bind = %bind_addr,
		protocol = %protocol,
		"multitwitch_server: websocket endpoint ready"
	);

	let settings = Arc::new(ConnectionSettings {
		allowed_origins: server_cfg.server.allowed_origins.clone(),
		max_event_bytes: server_cfg.server.max_event_bytes,
	});

	health_state.mark_ready();

	let result = tokio::select! {
		res = run_accept_loop(listener, manager, settings) => res,
		_ = tokio::signal::ctrl_c() => {
			info!("shutdown requested");
			Ok(())
		}
	};

	health_state.mark_not_ready();
	pool.shutdown().await;

	result
}
