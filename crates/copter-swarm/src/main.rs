use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use copter_swarm::maintenance::{self, Maintainer};
use copter_swarm::transport::{ServerConfig, serve};
use copter_swarm::{HttpBroker, Remote, SWARM_VERSION, SwarmConfig, SwarmService, VersionInfo};

/// How long in-flight charges get to report once the server has stopped.
const CHARGE_DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Initialize tracing with SWARM_LOG and LOG_FORMAT support.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("SWARM_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("copter_swarm={level},copter_swarm::broker=warn"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

/// `copter-swarm [port] [ip]`
fn parse_args(args: &[String]) -> Result<ServerConfig, String> {
    let mut config = ServerConfig::default();
    let mut positional = args.iter().skip(1);

    if let Some(port) = positional.next() {
        if port == "--help" || port == "-h" {
            return Err(String::new());
        }
        config.port = port
            .parse()
            .map_err(|_| format!("invalid port: {port}"))?;
    }
    if let Some(ip) = positional.next() {
        config.host = ip.clone();
    }
    if let Some(extra) = positional.next() {
        return Err(format!("unexpected argument: {extra}"));
    }

    config.await_explicit_shutdown =
        std::env::var("SWARM_AWAIT_EXPLICIT_SHUTDOWN").as_deref() == Ok("true");
    Ok(config)
}

async fn run(server_config: ServerConfig, config: SwarmConfig) -> anyhow::Result<()> {
    let broker = Arc::new(HttpBroker::new(&config.broker_url).context("invalid broker url")?);
    let remote = Remote::new(broker.clone(), broker, config.remote_timeout);

    let service = Arc::new(
        SwarmService::new(remote.clone(), config.kinds.clone())
            .with_version(VersionInfo::new().with_broker(config.broker_url.clone())),
    );

    if let Some(size) = config.initial_swarm_size {
        info!(size, "Bootstrapping swarm");
        service
            .bootstrap(size)
            .await
            .context("initial bootstrap failed")?;
    }

    let (maintainer, handler) = Maintainer::new(
        Arc::clone(service.registry()),
        remote,
        config.battery_threshold,
    );
    let tasks = maintenance::spawn(
        maintainer,
        handler,
        config.maintenance_interval,
        service.shutdown_token(),
    );

    let result = serve(server_config, Arc::clone(&service)).await;

    service.trigger_shutdown();
    tasks.join(CHARGE_DRAIN_GRACE).await;
    result
}

#[tokio::main]
async fn main() {
    init_tracing();

    let args: Vec<String> = std::env::args().collect();
    let server_config = match parse_args(&args) {
        Ok(config) => config,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: copter-swarm [port] [ip]");
            eprintln!();
            eprintln!("Swarm settings are read from SWARM_* environment variables.");
            process::exit(2);
        }
    };

    let config = SwarmConfig::from_env();
    info!(
        version = SWARM_VERSION,
        broker = %config.broker_url,
        threshold = config.battery_threshold,
        interval = ?config.maintenance_interval,
        "copter-swarm starting"
    );

    if let Err(e) = run(server_config, config).await {
        error!(error = %format!("{e:#}"), "copter-swarm failed");
        process::exit(1);
    }
}
