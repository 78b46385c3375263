#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use murmur_server::blob::LocalBlobStore;
use murmur_server::config::{self, parse_bind};
use murmur_server::credentials::Argon2Credentials;
use murmur_server::server::connection::serve;
use murmur_server::server::health::{HealthState, spawn_health_server};
use murmur_server::server::registry::ConnectionRegistry;
use murmur_server::server::{RelaySettings, ServerContext};
use murmur_server::store;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: murmur_server [--bind ws://host:port] [--config PATH]\n\
\n\
Options:\n\
\t--bind     Bind endpoint (default: from config, else {})\n\
\t          Format: ws://host:port\n\
\t--config   Config file (default: ~/.murmur/config.toml)\n\
\t--help     Show this help\n\
",
		config::DEFAULT_BIND
	);
	std::process::exit(2)
}

struct Args {
	bind: Option<SocketAddr>,
	config: Option<PathBuf>,
}

fn parse_args() -> Args {
	let mut args = Args { bind: None, config: None };

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				let addr = parse_bind(&v).unwrap_or_else(|e| {
					eprintln!("{e:#}");
					usage_and_exit();
				});
				args.bind = Some(addr);
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

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,murmur_server=debug".to_string());

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
				let tracer = tracer_provider.tracer("murmur_server");
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

	match bind.parse::<SocketAddr>() {
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

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();

	let config_path = match args.config {
		Some(path) => path,
		None => config::default_config_path()?,
	};
	let mut server_cfg = config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");
	if let Some(bind) = args.bind {
		server_cfg.server.bind = bind;
	}

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let registry = Arc::new(ConnectionRegistry::new());
	let health_state = HealthState::new(Arc::clone(&registry));
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let store = store::connect(server_cfg.store.database_url.as_deref())
		.await
		.context("connect account store")?;

	let blob = &server_cfg.blob;
	let blobs = LocalBlobStore::new(
		blob.root.clone(),
		&blob.bucket,
		&blob.public_base_url,
		blob.signing_secret.clone(),
	)
	.context("configure blob store")?;
	info!(root = %blob.root.display(), bucket = %blob.bucket, "blob store ready");

	let ctx = ServerContext::new(
		registry,
		store,
		Arc::new(blobs),
		Arc::new(Argon2Credentials),
		RelaySettings::from(&server_cfg),
	);

	let bind = server_cfg.server.bind;
	let listener = TcpListener::bind(bind)
		.await
		.with_context(|| format!("bind websocket listener on {bind}"))?;
	info!(%bind, "murmur_server: websocket endpoint ready");

	health_state.mark_ready();

	tokio::select! {
		res = serve(listener, ctx) => res,
		_ = tokio::signal::ctrl_c() => {
			info!("shutdown requested");
			Ok(())
		}
	}
}
