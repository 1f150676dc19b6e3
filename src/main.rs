//! `gelf-broker` — local log-shipping daemon entry point.
//!
//! Startup order: parse args, load config, acquire the pidfile, bind the
//! listener, connect upstream, restore the spool, register signals, enter
//! the loop.

use std::io::Write as _;
use std::path::PathBuf;

use clap::Parser;
use gelf_broker::{config::Config, control::Broker, lifecycle::Pidfile, lifecycle::SignalListener};

/// Local log-shipping broker: Unix datagram intake to a persistent
/// GELF/TCP upstream.
#[derive(Parser, Debug)]
#[command(name = "gelf-broker", version)]
struct Cli {
    /// Minimum log level emitted on stderr (error, warn, info, debug, trace).
    #[arg(long = "log")]
    log_level: Option<String>,

    /// Print received records to stdout instead of forwarding them upstream.
    #[arg(long)]
    fake: bool,

    /// Override the configured intake socket path.
    #[arg(long)]
    listen: Option<PathBuf>,

    /// Override the configured upstream `host[:port]`.
    #[arg(long)]
    graylog: Option<String>,

    /// Path to the YAML configuration file. Falls back to the
    /// `GELF_BROKER_CONFIG` environment variable, then
    /// `/etc/gelf-broker/config.yml`, when not given explicitly.
    #[arg(long)]
    config: Option<PathBuf>,
}

const CONFIG_ENV_VAR: &str = "GELF_BROKER_CONFIG";

fn default_config_path() -> PathBuf {
    PathBuf::from("/etc/gelf-broker/config.yml")
}

/// CLI flag → `GELF_BROKER_CONFIG` env var → compiled-in default, in that
/// order.
fn resolve_config_path(explicit: Option<PathBuf>) -> PathBuf {
    explicit
        .or_else(|| std::env::var_os(CONFIG_ENV_VAR).map(PathBuf::from))
        .unwrap_or_else(default_config_path)
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());

    match run(cli).await {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            log::error!("fatal startup error: {e}");
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<(), gelf_broker::BrokerError> {
    let config_path = resolve_config_path(cli.config.clone());
    let mut config = Config::load(&config_path)?;
    if let Some(listen) = cli.listen {
        config.socket = listen;
    }
    if let Some(graylog) = cli.graylog {
        config.graylog = graylog;
    }

    let pidfile = Pidfile::acquire(&config.pidfile)?;

    let listener = gelf_broker::Listener::bind(&config.socket, config.perms)?;

    let hostport = config.graylog_hostport()?;
    let tls_config = match &config.ssl {
        Some(opts) => Some(opts.build_client_config()?),
        None => None,
    };
    let upstream = gelf_broker::Upstream::new(hostport, tls_config);

    let mut broker = Broker::new(config.clone(), config_path, listener, upstream, cli.fake);
    broker.restore_spool();

    let signals = SignalListener::register()?;

    broker.run(signals).await;
    drop(pidfile);
    Ok(())
}

/// One formatted line per event: `"<UTC ts> [broker:<category>] <LEVEL>:
/// <msg>"`. Silent (no handler installed) unless `--log` is given.
fn init_logging(level: Option<&str>) {
    let Some(level) = level else { return };

    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(parse_level(level))
        .format(|buf, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
            writeln!(
                buf,
                "{ts} [broker:{}] {}: {}",
                record.target(),
                record.level(),
                record.args()
            )
        })
        .init();
}

fn parse_level(level: &str) -> log::LevelFilter {
    match level.to_ascii_lowercase().as_str() {
        "error" => log::LevelFilter::Error,
        "warn" | "warning" => log::LevelFilter::Warn,
        "info" => log::LevelFilter::Info,
        "debug" => log::LevelFilter::Debug,
        "trace" => log::LevelFilter::Trace,
        _ => log::LevelFilter::Info,
    }
}
